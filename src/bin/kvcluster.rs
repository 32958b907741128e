use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use kvcluster::{ClusterConfig, ClusterGateway, Error};

#[derive(Parser)]
#[command(name = "kvcluster")]
#[command(about = "Route and run single-key operations against a weighted memcached cluster")]
struct Cli {
    /// Cluster configuration (JSON).
    #[arg(long, short)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the virtual node and backend each key routes to, without connecting.
    Route {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Print the value stored under a key.
    Get { key: String },
    /// Store a value under a key.
    Set {
        key: String,
        value: String,
        /// Lifetime in seconds; 0 never expires.
        #[arg(long, default_value_t = 0)]
        ttl: u32,
    },
    /// Delete a key.
    Delete { key: String },
    /// Report whether a key holds a value.
    Exists { key: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("kvcluster: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Error> {
    let config = ClusterConfig::from_file(&cli.config)?;
    let mut gateway = ClusterGateway::new(config)?;

    match cli.command {
        Command::Route { keys } => {
            for key in keys {
                let route = gateway.server_for(&key)?;
                println!(
                    "{} -> {} -> {}",
                    key,
                    route.virtual_node,
                    route.server.host_port()
                );
            }
        }
        Command::Get { key } => match gateway.get(&key).await? {
            Some(data) => println!("{}", String::from_utf8_lossy(&data)),
            None => return Ok(ExitCode::from(1)),
        },
        Command::Set { key, value, ttl } => gateway.save(&key, value, ttl).await?,
        Command::Delete { key } => gateway.delete(&key).await?,
        Command::Exists { key } => {
            let exists = gateway.exists(&key).await?;
            println!("{}", exists);
            if !exists {
                return Ok(ExitCode::from(1));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
