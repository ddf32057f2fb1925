mod archive;
mod config;
mod pool;
mod ports;
mod server;

pub use archive::{prepare_addon_dir, read_map_archive_from_file, ArchiveError, MapArchive};
pub use config::{CVars, ConfigError, ServerConfig, HLDS_DOCKER_IMAGE, USER_CONTENT_DIR};
pub use pool::{Pool, PoolError};
pub use ports::{AllPortsAllocated, PortAllocator};
pub use server::{CleanupError, Server, ServerId};
