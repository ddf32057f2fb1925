// Server pool - owns the live-server registry, drives the container runtime,
// and reaps expired or dead servers

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

use crate::docker::{DockerError, DockerManager};
use crate::hlds::config::{ConfigError, ServerConfig};
use crate::hlds::ports::{AllPortsAllocated, PortAllocator};
use crate::hlds::server::{CleanupError, Server, ServerId};

const REAP_PERIOD: Duration = Duration::from_secs(5);

// A container the runtime accepted may take a moment to report as running;
// don't reap servers younger than this.
const STARTUP_GRACE_SECS: i64 = 60;

const MAX_PORT: u32 = 65535;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("maxServers out of bounds: {0}")]
    MaxServersOutOfBounds(usize),

    #[error("port overflow, minPort + maxServers > {MAX_PORT}")]
    PortRangeOverflow,

    #[error("unable to detect default interface IP: {0}")]
    HostIpDiscovery(#[from] local_ip_address::Error),

    #[error("unable to allocate port: {0}")]
    PortAlloc(#[from] AllPortsAllocated),

    #[error("unable to create host config: {0}")]
    Config(#[from] ConfigError),

    #[error("duplicate server id: {0}")]
    DuplicateServerId(ServerId),

    #[error("no such server: {0}")]
    UnknownServer(ServerId),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("unable to close server: {0}")]
    Cleanup(#[from] CleanupError),

    #[error("{}", .0.join("; "))]
    Joined(Vec<String>),
}

fn joined(errs: Vec<String>) -> Result<(), PoolError> {
    if errs.is_empty() {
        Ok(())
    } else {
        Err(PoolError::Joined(errs))
    }
}

/// Owns every live server: their registry entries, their host ports, and the
/// container lifecycle behind them.
#[derive(Debug)]
pub struct Pool {
    docker: DockerManager,
    servers: Mutex<HashMap<ServerId, Server>>,
    ports: PortAllocator,
    external_ip: IpAddr,
}

impl Pool {
    pub fn new(
        docker: DockerManager,
        max_servers: usize,
        min_port: u16,
    ) -> Result<Self, PoolError> {
        // Let the OS throw when a bad port is bound, only do basic checks.
        if !(1..MAX_PORT as usize).contains(&max_servers) {
            return Err(PoolError::MaxServersOutOfBounds(max_servers));
        }

        if min_port as u32 + max_servers as u32 > MAX_PORT {
            return Err(PoolError::PortRangeOverflow);
        }

        let external_ip = local_ip_address::local_ip()?;

        Ok(Self {
            docker,
            servers: Mutex::new(HashMap::with_capacity(max_servers)),
            ports: PortAllocator::new(min_port, max_servers),
            external_ip,
        })
    }

    /// Provisions and starts one server: port, engine config files, container.
    /// Everything this attempt created is rolled back on failure, including
    /// the allocated port.
    pub async fn add_server(&self, cfg: ServerConfig) -> Result<Server, PoolError> {
        let port = self.ports.alloc()?;

        let mut temp_files = Vec::new();
        match self.provision(cfg, port, &mut temp_files).await {
            Ok(server) => Ok(server),
            Err(err) => {
                self.ports.free(port);
                for path in &temp_files {
                    if let Err(err) = fs::remove_file(path) {
                        tracing::warn!(
                            path = %path.display(),
                            %err,
                            "unable to reclaim temp file"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn provision(
        &self,
        cfg: ServerConfig,
        port: u16,
        temp_files: &mut Vec<PathBuf>,
    ) -> Result<Server, PoolError> {
        let name = format!("hlds_{port}");

        let container_config = cfg.container_config(port);
        let host_config = cfg.host_config(temp_files)?;

        tracing::info!(%name, "creating container");
        let (id, warnings) = self
            .docker
            .create_container(&name, container_config, host_config)
            .await?;
        let id = ServerId::from(id);

        tracing::info!(%name, id = %id, "starting container");
        if let Err(err) = self.docker.start_container(id.as_str()).await {
            self.docker.force_remove(id.as_str()).await;
            return Err(err.into());
        }

        if !warnings.is_empty() {
            tracing::warn!(?warnings, "container created with warnings");
        }

        let now = Utc::now();
        let lifetime = chrono::Duration::seconds(cfg.lifetime().as_secs() as i64);

        let mut servers = self.servers.lock().await;
        if servers.contains_key(&id) {
            return Err(PoolError::DuplicateServerId(id));
        }

        let server = Server {
            id: id.clone(),
            name,
            port,
            host_ip: self.external_ip,
            started_at: now,
            expires_at: now + lifetime,
            temp_files: temp_files.clone(),
            addons_dir: cfg.valve_addon_dir().map(PathBuf::from),
            cfg,
        };
        servers.insert(id, server.clone());
        drop(servers);

        tracing::info!(
            port,
            map = server.cfg.startup_map(),
            sv_password = server.cvar("sv_password").unwrap_or(""),
            rcon_password = server.cvar("rcon_password").unwrap_or(""),
            lifetime = ?server.cfg.lifetime(),
            "server up and running"
        );

        Ok(server)
    }

    /// Tears a server down: container, registry entry, port, on-disk
    /// artifacts. The registry entry and port are reclaimed even when the
    /// runtime misbehaves.
    pub async fn remove_server(&self, id: &ServerId) -> Result<(), PoolError> {
        let server = self
            .servers
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PoolError::UnknownServer(id.clone()))?;

        tracing::info!(id = %id, name = %server.name, "removing server");

        let running = match self.docker.is_running(id.as_str()).await {
            Ok(running) => running,
            Err(err) if err.is_not_found() => false,
            Err(err) => {
                tracing::error!(id = %id, %err, "unable to fetch server status, forcing remove");
                true
            }
        };

        if running {
            self.docker.force_remove(server.id.as_str()).await;
        }

        self.servers.lock().await.remove(id);
        self.ports.free(server.port);

        server.cleanup()?;

        Ok(())
    }

    /// Reaper loop. Runs until the shutdown signal fires, then removes every
    /// remaining server. A failing reap pass ends the loop with its error:
    /// persistent runtime misbehavior should surface to the supervisor rather
    /// than be absorbed here.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), PoolError> {
        let mut ticker = tokio::time::interval(REAP_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.remove_expired_servers().await?;
                    self.remove_stopped_servers().await?;
                }
                _ = shutdown.changed() => break,
            }
        }

        // The shutdown signal has already fired; the removal RPCs below run
        // on their own so the runtime gets to finish them.
        self.close().await
    }

    async fn remove_expired_servers(&self) -> Result<(), PoolError> {
        let now = Utc::now();
        let expired: Vec<ServerId> = self
            .servers
            .lock()
            .await
            .values()
            .filter(|server| now >= server.expires_at)
            .map(|server| server.id.clone())
            .collect();

        let mut errs = Vec::new();
        for id in expired {
            if let Err(err) = self.remove_server(&id).await {
                errs.push(format!("unable to remove expired server: {err}"));
            }
        }

        joined(errs)
    }

    async fn remove_stopped_servers(&self) -> Result<(), PoolError> {
        let snapshot: Vec<(ServerId, chrono::DateTime<Utc>)> = self
            .servers
            .lock()
            .await
            .values()
            .map(|server| (server.id.clone(), server.started_at))
            .collect();

        let now = Utc::now();
        let mut errs = Vec::new();

        for (id, started_at) in snapshot {
            let running = match self.docker.is_running(id.as_str()).await {
                Err(err) if err.is_not_found() => {
                    tracing::warn!(id = %id, "missing container, removing server from pool");
                    false
                }
                Err(err) => {
                    errs.push(format!("unable to fetch server status: {err}"));
                    continue;
                }
                Ok(running) => running,
            };

            if running {
                continue;
            }

            if now < started_at + chrono::Duration::seconds(STARTUP_GRACE_SECS) {
                tracing::debug!(
                    id = %id,
                    %started_at,
                    "server created but maybe not started yet, skipping removal"
                );
                continue;
            }

            if let Err(err) = self.remove_server(&id).await {
                errs.push(format!("unable to remove stopped server: {err}"));
            }
        }

        joined(errs)
    }

    async fn close(&self) -> Result<(), PoolError> {
        let ids: Vec<ServerId> = self.servers.lock().await.keys().cloned().collect();

        let mut errs = Vec::new();
        for id in ids {
            if let Err(err) = self.remove_server(&id).await {
                errs.push(format!("unable to remove server {id}: {err}"));
            }
        }

        joined(errs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_rejects_bad_bounds() {
        let err = Pool::new(DockerManager::new().expect("docker client"), 0, 27015)
            .expect_err("zero servers");
        assert!(matches!(err, PoolError::MaxServersOutOfBounds(0)));

        let err = Pool::new(DockerManager::new().expect("docker client"), 2, 65534)
            .expect_err("port range overflow");
        assert!(matches!(err, PoolError::PortRangeOverflow));
    }
}
