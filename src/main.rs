use anyhow::Result;
use punchbowl::{RendezvousServer, ServerConfig};
use std::env;
use tracing_subscriber::EnvFilter;

fn print_usage(program_name: &str) {
    eprintln!("punchbowl - rendezvous server for P2P NAT hole punching");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  {} [bind_addr]", program_name);
    eprintln!();
    eprintln!("  bind_addr     Address for both the UDP classification socket");
    eprintln!("                and the TCP control listener.");
    eprintln!("                Defaults to BIND_ADDR or 0.0.0.0:6363.");
    eprintln!();
    eprintln!("  Example:");
    eprintln!("    {} 0.0.0.0:6363", program_name);
    eprintln!();
    eprintln!("  Log verbosity is controlled through RUST_LOG.");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 && (args[1] == "-h" || args[1] == "--help") {
        print_usage(&args[0]);
        std::process::exit(0);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = ServerConfig::default();
    if let Some(addr) = args.get(1) {
        config.bind_addr = addr.clone();
    } else if let Ok(addr) = env::var("BIND_ADDR") {
        config.bind_addr = addr;
    }

    let server = RendezvousServer::bind(config).await?;
    server.run().await
}
