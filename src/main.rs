use clap::Parser;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webshell::api::{self, AppState};
use webshell::config::Settings;

/// webshell: browser shells and file management over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "webshell", version, about, long_about = None)]
struct Args {
    /// Address to bind the HTTP/WebSocket server
    #[arg(long, default_value = "0.0.0.0:1234")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "webshell=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env();
    let app = api::router(AppState::new(settings));

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!("started on {}", args.bind);
    axum::serve(listener, app).await?;

    Ok(())
}
