use anyhow::Result;
use seedalchemy_core::Config;
use std::net::SocketAddr;

pub async fn execute(host: Option<&str>, port: Option<u16>) -> Result<()> {
    let config = Config::load()?;
    let host = host.unwrap_or(&config.daemon.host).to_string();
    let port = port.unwrap_or(config.daemon.port);
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    println!("Starting seed-alchemy daemon...");
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  POST /api/v1/sd-generate  - Generate images");
    println!("  GET  /api/v1/models       - List models");
    println!("  GET  /ws                  - Progress and preview frames");
    println!("\nPress Ctrl+C to stop.\n");

    seedalchemy_daemon::run_server(config, addr).await?;

    Ok(())
}
