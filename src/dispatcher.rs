// Dispatcher - runs the background workers and tears everything down as soon
// as one of them stops or the process is signaled

use std::fmt::Display;
use std::future::Future;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Fan-out supervisor for long-running workers. Every worker shares one
/// shutdown signal; the first worker to return (or SIGINT/SIGTERM) flips it
/// and the rest unwind.
pub struct Dispatcher {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<(String, JoinHandle<()>)>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shutdown_tx,
            workers: Vec::new(),
        }
    }

    /// Shutdown signal to hand to a worker before spawning it.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawns a worker. Whenever it returns, for any reason, the shared
    /// shutdown signal fires so the other workers unwind too.
    pub fn spawn<F, E>(&mut self, name: &str, proc: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        let shutdown_tx = self.shutdown_tx.clone();
        let proc_name = name.to_string();

        let handle = tokio::spawn(async move {
            if let Err(err) = proc.await {
                tracing::error!(proc = %proc_name, %err, "proc closed unexpectedly");
            }
            let _ = shutdown_tx.send(true);
        });

        self.workers.push((name.to_string(), handle));
    }

    /// Installs the signal handlers, waits for the shutdown signal, then
    /// waits for every worker to drain.
    pub async fn run(mut self) {
        let signal_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            match (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
            ) {
                (Ok(mut sigint), Ok(mut sigterm)) => {
                    tokio::select! {
                        _ = sigint.recv() => tracing::info!("received SIGINT"),
                        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                    }
                    let _ = signal_tx.send(true);
                }
                (Err(err), _) | (_, Err(err)) => {
                    tracing::error!(%err, "unable to install signal handlers");
                }
            }
        });

        // wait_for also covers a worker that exited before we got here.
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
        tracing::info!("shutting down");

        for (name, handle) in self.workers.drain(..) {
            if let Err(err) = handle.await {
                tracing::error!(proc = %name, %err, "worker task failed");
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn worker_exit_cancels_the_others() {
        let mut dispatcher = Dispatcher::new();

        let mut second_signal = dispatcher.shutdown_signal();
        dispatcher.spawn("first", async { Ok::<(), std::io::Error>(()) });
        dispatcher.spawn("second", async move {
            // Blocks until the first worker's exit flips the signal.
            second_signal.changed().await.expect("signal fired");
            Ok::<(), std::io::Error>(())
        });

        tokio::time::timeout(std::time::Duration::from_secs(5), dispatcher.run())
            .await
            .expect("all workers drained");
    }

    #[tokio::test]
    async fn worker_errors_still_shut_everything_down() {
        let mut dispatcher = Dispatcher::new();

        dispatcher.spawn("failing", async {
            Err::<(), _>(std::io::Error::other("worker broke"))
        });

        tokio::time::timeout(std::time::Duration::from_secs(5), dispatcher.run())
            .await
            .expect("dispatcher returned");
    }
}
