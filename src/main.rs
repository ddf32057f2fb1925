// hldsbot - on-demand HLDS deathmatch servers in Docker containers

use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use hldsbot::dispatcher::Dispatcher;
use hldsbot::docker::DockerManager;
use hldsbot::hlds::Pool;
use hldsbot::settings::Settings;

const DEFAULT_SETTINGS_PATH: &str = "hldsbot.json";

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("starting hldsbot");

    let settings_path =
        std::env::var("HLDSBOT_SETTINGS").unwrap_or_else(|_| DEFAULT_SETTINGS_PATH.to_string());
    let settings = Settings::load(Path::new(&settings_path));

    let docker = match DockerManager::new() {
        Ok(docker) => docker,
        Err(err) => {
            tracing::error!(%err, "unable to obtain Docker client");
            std::process::exit(1);
        }
    };

    let pool = match Pool::new(docker, settings.max_servers, settings.min_port) {
        Ok(pool) => Arc::new(pool),
        Err(err) => {
            tracing::error!(%err, "unable to init server pool");
            std::process::exit(1);
        }
    };

    let mut dispatcher = Dispatcher::new();

    let reaper_pool = pool.clone();
    let shutdown = dispatcher.shutdown_signal();
    dispatcher.spawn("pool", async move { reaper_pool.run(shutdown).await });

    dispatcher.run().await;

    tracing::info!("hldsbot shutdown complete");
}
