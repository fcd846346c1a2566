use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use wiresmith_daemon::config::{self, EngineToml};
use wiresmith_daemon::db;
use wiresmith_daemon::engine::Engine;
use wiresmith_daemon::keys::generate_key_pair;
use wiresmith_daemon::registry::{BuiltinDrivers, DriverFactory};
use wiresmith_types::BackendKind;

const ENV_ADMIN_EMAIL: &str = "WIRESMITH_ADMIN_EMAIL";
const ENV_ADMIN_PASSWORD: &str = "WIRESMITH_ADMIN_PASSWORD";

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

#[derive(Debug, Parser)]
#[command(name = "wiresmith")]
#[command(version = env!("GIT_VERSION"))]
#[command(about = "WireGuard orchestration engine for local and remote backends")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/wiresmith/config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the engine until interrupted
    Run,
    /// Print a fresh WireGuard key pair
    Genkey,
    /// List backend kinds and whether this host supports them
    Backends,
    /// Write a default configuration with a new key secret
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    match args.command {
        Command::Run => run(&args.config).await,
        Command::Genkey => {
            let pair = generate_key_pair();
            println!("private_key = {}", pair.private_key);
            println!("public_key  = {}", pair.public_key);
            Ok(())
        }
        Command::Backends => {
            for kind in BackendKind::ALL {
                let supported = BuiltinDrivers.supported(kind);
                println!(
                    "{:<16} {}",
                    kind.scheme(),
                    if supported { "supported" } else { "unsupported" }
                );
            }
            Ok(())
        }
        Command::Init { force } => {
            if args.config.exists() && !force {
                return Err(format!("{} exists, pass --force to replace", args.config.display()).into());
            }
            let config = EngineToml {
                key_secret: Some(config::generate_key_secret()),
                ..EngineToml::default()
            };
            config::save(&args.config, &config).await?;
            Ok(())
        }
    }
}

async fn run(path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = config::load(path).await?;
    config.apply_env();
    config::validate(&config)?;
    let settings = config.settings();

    info!(version = env!("GIT_VERSION"), "starting wiresmith");

    let pool = db::create_pool(&config.database_url).await?;
    db::migrate(&pool).await?;
    info!("database migrations applied");

    let engine = Engine::new(
        pool,
        config.key_secret()?,
        Arc::new(BuiltinDrivers),
        settings.clone(),
    );

    match (std::env::var(ENV_ADMIN_EMAIL), std::env::var(ENV_ADMIN_PASSWORD)) {
        (Ok(email), Ok(password)) => {
            engine.bootstrap_user(&email, &password).await?;
        }
        (Ok(_), Err(_)) | (Err(_), Ok(_)) => {
            warn!("{ENV_ADMIN_EMAIL} and {ENV_ADMIN_PASSWORD} must both be set, skipping bootstrap");
        }
        _ => {}
    }

    engine.recover().await?;

    let mut ticker = tokio::time::interval(settings.stats_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => engine.sweep().await,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "failed to listen for ctrl-c");
                }
                info!("shutting down");
                break;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
