//! On-demand HLDS deathmatch servers in Docker containers.
//!
//! The [`hlds::Pool`] owns port allocation, container lifecycle, expiration
//! and crash reaping; [`hlds::read_map_archive_from_file`] turns untrusted
//! community map archives into mountable content trees. A chat adapter is
//! expected to sit on top and drive [`hlds::Pool::add_server`].

pub mod dispatcher;
pub mod docker;
pub mod hlds;
pub mod settings;
