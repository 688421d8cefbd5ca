use clap::{Parser, Subcommand};
use logmill::config::{load_config, DEFAULT_CONFIG};
use logmill::handler::{AtomHandler, JsonLineWriter};
use logmill::pipeline;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "logmill")]
#[command(about = "Log ingestion and atomization pipeline", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logmill=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config);

    match cli.command {
        Some(Commands::Run) | None => run(config_path).await?,
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => init_config(stdout)?,
        },
    }

    Ok(())
}

async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(config_path) = config_path else {
        eprintln!("Error: config not found");
        eprintln!("Searched locations:");
        eprintln!("  ~/.config/logmill/config.yml");
        eprintln!("  /etc/logmill/config.yml");
        eprintln!("\nUse --config <path> to specify a config file, or run 'logmill config init' to generate one.");
        std::process::exit(1);
    };

    info!(config_path = %config_path.display(), "loading configuration");
    let config = load_config(&config_path)?;

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_token.cancel();
        }
    });

    let handlers: Vec<Box<dyn AtomHandler>> =
        vec![Box::new(JsonLineWriter::new(std::io::stdout()))];
    pipeline::run(config, handlers, token).await?;
    Ok(())
}

fn init_config(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    if stdout {
        print!("{DEFAULT_CONFIG}");
        return Ok(());
    }

    let Some(home_dir) = dirs::home_dir() else {
        return Err("cannot determine home directory".into());
    };
    let config_dir = home_dir.join(".config/logmill");
    let config_path = config_dir.join("config.yml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()).into());
    }
    std::fs::create_dir_all(&config_dir)?;
    std::fs::write(&config_path, DEFAULT_CONFIG)?;
    println!("Wrote {}", config_path.display());
    Ok(())
}

fn resolve_config_path(explicit_path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path);
    }

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/logmill/config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/logmill/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}
