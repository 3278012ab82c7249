use std::{fs, path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use sluice::{
    config::{Config, ConfigMap},
    daemon::{self, Daemon},
    master,
    net::{Handler, Reply, Request},
};
use tracing_subscriber::EnvFilter;

/// Demo application: echoes every frame back with the same code and crc.
struct Echo;

impl Handler for Echo {
    fn on_message(&self, req: Request<'_>) -> Option<Reply> {
        Some(Reply {
            msg_code: req.header.msg_code,
            crc32: req.header.crc32,
            body: req.body.to_vec(),
        })
    }
}

#[derive(Parser)]
#[command(name = "sluiced", about = "Prefork TCP frame dispatcher")]
struct Args {
    /// `Key = Value` configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Shorthand for ListenPortCount=1, ListenPort0=<port>.
    #[arg(short, long)]
    port: Option<u16>,
    /// Overrides WorkerProcessCount.
    #[arg(long)]
    workers: Option<usize>,
    /// Stay in the foreground even when the config says Daemon = 1.
    #[arg(long)]
    foreground: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut map = ConfigMap::new();
    if let Some(path) = &args.config {
        match fs::read_to_string(path) {
            Ok(text) => load_config_file(&text, &mut map),
            Err(e) => {
                eprintln!("sluiced: couldn't read {}: {e}", path.display());
                return ExitCode::from(2);
            }
        }
    }
    if let Some(port) = args.port {
        map.insert("ListenPortCount".into(), "1".into());
        map.insert("ListenPort0".into(), port.to_string());
    }
    if let Some(workers) = args.workers {
        map.insert("WorkerProcessCount".into(), workers.to_string());
    }

    let cfg = match Config::from_map(&map) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("sluiced: {e}");
            return ExitCode::from(2);
        }
    };

    init_logging(&cfg);

    if cfg.daemonize && !args.foreground {
        match daemon::daemonize() {
            Ok(Daemon::Parent) => return ExitCode::SUCCESS,
            Ok(Daemon::Child) => {}
            Err(e) => {
                eprintln!("sluiced: daemonize failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    match master::run(&cfg, Arc::new(Echo)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(%e, "startup failed");
            ExitCode::FAILURE
        }
    }
}

/// `Key = Value` lines; `#` comments and blank lines are skipped.
fn load_config_file(text: &str, map: &mut ConfigMap) {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
}

/// Without a `Log` file everything goes to stderr, the one stream
/// daemonization leaves attached.
fn init_logging(cfg: &Config) {
    let filter = EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    match &cfg.log {
        Some(path) => match fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init(),
            Err(e) => {
                eprintln!("sluiced: couldn't open log {}: {e}", path.display());
                tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
            }
        },
        None => tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init(),
    }
}
