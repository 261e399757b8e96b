//! Watch the Fritz!Box call monitor.
//!
//! Usage: cargo run --example call_monitor [HOST] [PORT]
//!
//! Default host: fritz.box, default port: 1012. Enable the call monitor once
//! by dialing #96*5* on a connected phone.

use std::sync::Arc;

use async_trait::async_trait;
use fritzlink::config::AppConfig;
use fritzlink::listener::{CallInfo, EventHandler, Listener};
use fritzlink::session::Session;

struct Printer;

#[async_trait]
impl EventHandler for Printer {
    async fn handle_call(&self, call: CallInfo) {
        let kind = if call.outgoing { "CALL" } else { "RING" };
        println!(
            "    {kind:<10} #{} {} -> {} ({})",
            call.conn_id, call.remote_number, call.local_number, call.medium_name
        );
    }

    async fn handle_connect(&self, conn_id: u32) {
        println!("    CONNECT    #{conn_id}");
    }

    async fn handle_disconnect(&self, conn_id: u32, duration: &str) {
        println!("    DISCONNECT #{conn_id} after {duration} s");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let host = std::env::args().nth(1).unwrap_or_else(|| "fritz.box".to_string());

    let port: u16 = std::env::args().nth(2).and_then(|s| s.parse().ok()).unwrap_or(1012);

    println!("Listening to call monitor at {host}:{port}");
    println!("======================================");

    let mut config = AppConfig::default();
    config.device.host = host;
    config.device.listener_port = port;
    config.device.log_personal_info = true;
    config.retry.initial_delay_secs = 5;
    config.retry.max_delay_secs = 60;
    config.validate()?;

    let session = Arc::new(Session::new(&config));
    let mut listener = Listener::start(session, Arc::new(Printer), None, None);

    tokio::signal::ctrl_c().await?;
    listener.stop();

    println!("\n======================================");
    println!("Done!");

    Ok(())
}
