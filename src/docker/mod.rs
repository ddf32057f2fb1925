mod manager;

pub use manager::{DockerError, DockerManager};
