pub mod config;
pub mod daemon;
pub mod master;
pub mod signal;

pub use config::{Config, ConfigError, ConfigMap};
pub use master::{RunError, run};
pub use sluice_net as net;
