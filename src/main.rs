use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dhcp_engine::transport::RECV_BUFFER_SIZE;
use dhcp_engine::{Config, DhcpServer, Event, Result, UdpTransport};

#[derive(Parser)]
#[command(name = "dhcp-engine")]
#[command(author, version, about = "Event-driven DHCPv4 server", long_about = None)]
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
    Run,
    ShowConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting DHCP server with config: {:?}", cli.config);
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(run(config))
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let transport = Arc::new(UdpTransport::bind(&config)?);
    let server = DhcpServer::new(config)?;
    let event = Event::default_loop();

    let attachment = server.attach_event(Some(event.clone()), 0)?;
    server.set_transport(transport.clone());
    server.start()?;
    let config = server.config();
    info!(
        "DHCP server ready and listening on {}, offering {} addresses from {}",
        transport.local_addr()?,
        config.pool_size,
        config.pool_start
    );

    let result = tokio::select! {
        result = serve(&server, &transport) => result,
        _ = event.run() => Ok(()),
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping server...");
            Ok(())
        }
    };

    server.stop();
    attachment.detach();
    print_leases(&server);
    result
}

async fn serve(server: &DhcpServer, transport: &UdpTransport) -> Result<()> {
    let mut buffer = [0u8; RECV_BUFFER_SIZE];

    loop {
        match transport.recv_from(&mut buffer).await {
            Ok((size, source)) => {
                if let Err(error) = server.receive(&buffer[..size]) {
                    error!("Error handling packet from {}: {}", source, error);
                }
            }
            Err(error) => {
                error!("Error receiving packet: {}", error);
            }
        }
    }
}

fn print_leases(server: &DhcpServer) {
    let leases = server.leases();

    if leases.is_empty() {
        println!("No active leases.");
        return;
    }

    println!(
        "{:<24} {:<16} {:<8} {:<24} {:<10}",
        "Client ID", "IP Address", "State", "Expires At", "Remaining"
    );
    println!("{}", "-".repeat(86));

    for lease in leases {
        let remaining = lease.remaining_seconds();
        let remaining_str = if remaining > 0 {
            format!("{}s", remaining)
        } else {
            "expired".to_string()
        };
        let expires_at = lease
            .expires_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_default();

        println!(
            "{:<24} {:<16} {:<8} {:<24} {:<10}",
            lease.client_id.unwrap_or_default(),
            lease.address,
            lease.state,
            expires_at,
            remaining_str
        );
    }
}
