use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use leasewire::{ClientConfig, Config, DhcpClient, DhcpServer, Result};

#[derive(Parser)]
#[command(name = "leasewire")]
#[command(author, version, about = "A DHCP-style address leasing server and client", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server until interrupted
    Serve,
    /// Print the server configuration
    ShowConfig,
    /// Acquire a lease from a server and print it
    Acquire {
        #[arg(long)]
        hardware_address: String,

        #[arg(long)]
        server: SocketAddr,

        #[arg(long, default_value = "0.0.0.0:68")]
        bind: SocketAddr,

        #[arg(long, default_value_t = 2000)]
        timeout_millis: u64,

        /// Release the lease right after acquiring it
        #[arg(long)]
        release: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let config = Config::load_or_create(&cli.config)?;
            info!("Starting lease server with config: {:?}", cli.config);
            let server = DhcpServer::new(config)?;
            let sweeper = server.spawn_sweeper();

            let result = tokio::select! {
                result = server.operate() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    Ok(())
                }
            };

            sweeper.abort();
            result
        }
        Commands::ShowConfig => {
            let config = Config::load_or_create(&cli.config)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Acquire {
            hardware_address,
            server,
            bind,
            timeout_millis,
            release,
        } => {
            let config = ClientConfig {
                hardware_address,
                server_address: server,
                bind_address: bind,
                reply_timeout_millis: timeout_millis,
                ..Default::default()
            };
            let mut client = DhcpClient::bind(&config)?;
            let lease = client.acquire().await?;

            println!("{:<16} {:<16} {:<10} {:<24}", "Address", "Server", "Lease", "Renew At");
            println!("{}", "-".repeat(68));
            println!(
                "{:<16} {:<16} {:<10} {:<24}",
                lease.address,
                lease.server,
                format!("{}s", lease.lease_duration_seconds),
                lease.renew_at().format("%Y-%m-%d %H:%M:%S UTC")
            );

            if release {
                client.release().await?;
                println!("Released {}.", lease.address);
            }

            Ok(())
        }
    }
}
