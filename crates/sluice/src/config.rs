use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Duration};

use sluice_net::ServerConfig;
use thiserror::Error;

/// Raw configuration input. Loading a file into this shape is the
/// caller's concern; see the `sluiced` binary for the line-based loader.
pub type ConfigMap = BTreeMap<String, String>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing configuration key {0}")]
    Missing(String),
    #[error("{key} = {value:?} is not a valid {expected}")]
    Invalid { key: String, value: String, expected: &'static str },
    #[error("{0} must be at least 1")]
    NonPositive(&'static str),
}

/// Validated server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_ports: Vec<u16>,
    pub worker_connections: usize,
    pub recycle_dwell: Duration,
    pub worker_processes: usize,
    pub worker_threads: usize,
    pub pid_file: PathBuf,
    pub daemonize: bool,
    pub log: Option<PathBuf>,
    pub log_level: String,
}

impl Config {
    /// Parses and validates the recognized keys. Ports are fatal when
    /// missing; everything else has the documented default.
    pub fn from_map(map: &ConfigMap) -> Result<Self, ConfigError> {
        let port_count: usize = parse_or(map, "ListenPortCount", 1)?;
        if port_count == 0 {
            return Err(ConfigError::NonPositive("ListenPortCount"));
        }
        let mut listen_ports = Vec::with_capacity(port_count);
        for i in 0..port_count {
            listen_ports.push(require(map, &format!("ListenPort{i}"))?);
        }

        let worker_connections = parse_or(map, "worker_connections", 1024)?;
        if worker_connections == 0 {
            return Err(ConfigError::NonPositive("worker_connections"));
        }
        let dwell_secs: u64 = parse_or(map, "RecyConnSockInfoWaitTime", 60)?;
        if dwell_secs == 0 {
            return Err(ConfigError::NonPositive("RecyConnSockInfoWaitTime"));
        }
        let worker_processes = parse_or(map, "WorkerProcessCount", 1)?;
        if worker_processes == 0 {
            return Err(ConfigError::NonPositive("WorkerProcessCount"));
        }
        let worker_threads = parse_or(map, "WorkerThreadCount", 4)?;
        if worker_threads == 0 {
            return Err(ConfigError::NonPositive("WorkerThreadCount"));
        }

        let daemonize = matches!(map.get("Daemon").map(String::as_str), Some("1" | "on" | "true"));

        Ok(Self {
            listen_ports,
            worker_connections,
            recycle_dwell: Duration::from_secs(dwell_secs),
            worker_processes,
            worker_threads,
            pid_file: map.get("PidFile").map_or_else(|| "sluiced.pid".into(), PathBuf::from),
            daemonize,
            log: map.get("Log").map(PathBuf::from),
            log_level: map.get("LogLevel").cloned().unwrap_or_else(|| "info".into()),
        })
    }

    /// Engine-side view of this configuration.
    pub fn engine(&self) -> ServerConfig {
        ServerConfig {
            worker_connections: self.worker_connections,
            recycle_dwell: self.recycle_dwell,
            worker_threads: self.worker_threads,
            socket_buf_size: None,
        }
    }
}

fn parse_or<T: FromStr>(map: &ConfigMap, key: &str, default: T) -> Result<T, ConfigError> {
    match map.get(key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: value.clone(),
            expected: "integer",
        }),
    }
}

fn require<T: FromStr>(map: &ConfigMap, key: &str) -> Result<T, ConfigError> {
    let value = map.get(key).ok_or_else(|| ConfigError::Missing(key.to_string()))?;
    value.parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: value.clone(),
        expected: "integer",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> ConfigMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults_apply() {
        let cfg = Config::from_map(&map(&[("ListenPort0", "59002")])).unwrap();
        assert_eq!(cfg.listen_ports, vec![59002]);
        assert_eq!(cfg.worker_connections, 1024);
        assert_eq!(cfg.recycle_dwell, Duration::from_secs(60));
        assert_eq!(cfg.worker_processes, 1);
        assert_eq!(cfg.worker_threads, 4);
        assert!(!cfg.daemonize);
        assert_eq!(cfg.pid_file, PathBuf::from("sluiced.pid"));
    }

    #[test]
    fn every_configured_port_is_required() {
        let err = Config::from_map(&map(&[("ListenPortCount", "2"), ("ListenPort0", "8000")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::Missing("ListenPort1".into()));
    }

    #[test]
    fn multiple_ports_parse_in_order() {
        let cfg = Config::from_map(&map(&[
            ("ListenPortCount", "2"),
            ("ListenPort0", "8000"),
            ("ListenPort1", "8001"),
        ]))
        .unwrap();
        assert_eq!(cfg.listen_ports, vec![8000, 8001]);
    }

    #[test]
    fn garbage_values_are_rejected() {
        let err =
            Config::from_map(&map(&[("ListenPort0", "eighty"), ("ListenPortCount", "1")]))
                .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn zero_pool_size_is_fatal() {
        let err = Config::from_map(&map(&[("ListenPort0", "1"), ("worker_connections", "0")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::NonPositive("worker_connections"));
    }

    #[test]
    fn daemon_flag_forms() {
        for v in ["1", "on", "true"] {
            let cfg = Config::from_map(&map(&[("ListenPort0", "1"), ("Daemon", v)])).unwrap();
            assert!(cfg.daemonize);
        }
        let cfg = Config::from_map(&map(&[("ListenPort0", "1"), ("Daemon", "0")])).unwrap();
        assert!(!cfg.daemonize);
    }
}
