use std::path::PathBuf;
use std::process::ExitCode;

use apiconn::config::{self, ControllerConfig, Settings};
use apiconn::tcp::{self, TcpConnection};
use apiconn::{Cache, CacheError, CancellationToken, ConnectionHandle};
use clap::{Parser, Subcommand};

/// Shared, health-checked connections to remote controllers
#[derive(Parser)]
#[command(name = "apiconn")]
#[command(version)]
#[command(about = "Shared, health-checked connections to remote controllers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire concurrent handles to configured controllers through one cache
    Check {
        /// Settings file (default: $XDG_CONFIG_HOME/apiconn/apiconn.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Concurrent acquisitions per controller
        #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
        concurrency: u16,

        /// Controllers to check (default: all configured)
        keys: Vec<String>,
    },
    /// Print the default settings file path
    ConfigPath,
}

type Handle = ConnectionHandle<String, TcpConnection>;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::ConfigPath => match config::default_config_path() {
            Some(path) => {
                println!("{}", path.display());
                ExitCode::SUCCESS
            }
            None => {
                eprintln!("Error: Could not determine config directory.");
                ExitCode::FAILURE
            }
        },
        Commands::Check {
            config,
            concurrency,
            keys,
        } => match check(config, usize::from(concurrency), keys).await {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::FAILURE,
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::FAILURE
            }
        },
    }
}

/// Returns whether every controller could be reached.
async fn check(
    config_path: Option<PathBuf>,
    concurrency: usize,
    keys: Vec<String>,
) -> Result<bool, CacheError> {
    let path = config_path
        .or_else(config::default_config_path)
        .ok_or_else(|| CacheError::config("cannot determine settings path, pass --config"))?;
    let settings = config::load_settings(&path)?;
    let controllers = select_controllers(&settings, &keys)?;
    if controllers.is_empty() {
        eprintln!("No controllers configured in {}", path.display());
        return Ok(true);
    }

    let cache: Cache<String, TcpConnection> = Cache::with_config(&settings.cache_config()?);
    let cancel = CancellationToken::new();
    let mut all_ok = true;

    for controller in controllers {
        let attempts: Vec<_> = (0..concurrency)
            .map(|_| {
                let cache = cache.clone();
                let cancel = cancel.clone();
                let name = controller.name.clone();
                let info = controller.endpoint.clone();
                tokio::spawn(async move {
                    cache
                        .acquire(&cancel, name, move |token| tcp::dial(info, token))
                        .await
                })
            })
            .collect();

        let mut handles: Vec<Handle> = Vec::new();
        let mut failures = Vec::new();
        for attempt in attempts {
            match attempt.await {
                Ok(Ok(handle)) => handles.push(handle),
                Ok(Err(e)) => failures.push(e.to_string()),
                Err(e) => failures.push(format!("check task failed: {e}")),
            }
        }

        report(&controller.name, &handles, &failures);
        all_ok &= failures.is_empty();

        for handle in &mut handles {
            if let Err(e) = handle.release() {
                eprintln!("{}: release failed: {}", controller.name, e);
            }
        }
    }

    cache.shutdown()?;
    Ok(all_ok)
}

fn select_controllers<'a>(
    settings: &'a Settings,
    keys: &[String],
) -> Result<Vec<&'a ControllerConfig>, CacheError> {
    if keys.is_empty() {
        return Ok(settings.controllers.iter().collect());
    }
    keys.iter()
        .map(|key| {
            settings
                .controller(key)
                .ok_or_else(|| CacheError::config(format!("unknown controller {key:?}")))
        })
        .collect()
}

fn report(name: &str, handles: &[Handle], failures: &[String]) {
    if let Some(first) = handles.first() {
        let connections = 1 + handles
            .iter()
            .skip(1)
            .filter(|h| !h.same_connection(first))
            .count();
        println!(
            "{}: {} handle(s) over {} connection(s) to {} (ref_count {})",
            name,
            handles.len(),
            connections,
            first.connection().peer_addr(),
            first.ref_count()
        );
    }
    for failure in failures {
        println!("{}: {}", name, failure);
    }
}
