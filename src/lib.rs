//! `tsidd`: leases a TSID node id from a shared coordination store, keeps the
//! lease alive and reports on it over HTTP.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod logging;
pub mod server;
pub mod store;

pub use cli::{Cli, Commands};
pub use config::DaemonConfig;
pub use daemon::Node;
