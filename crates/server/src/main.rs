use clap::Parser;
use tracing_subscriber::EnvFilter;

use advtrain_server::data::Registries;
use advtrain_server::state::ServerState;
use advtrain_server::{reaper, routes};

#[derive(Debug, Parser)]
#[command(name = "advtrain-server", version, about = "Execution server for distributed adversarial training")]
struct Cli {
    /// Port to listen on.
    #[arg(default_value_t = 8080, env = "ADVTRAIN_PORT")]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let state = ServerState::new(Registries::default());
    tokio::spawn(reaper::run(state.clone(), reaper::REAP_TICK));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.port)).await?;
    tracing::info!(port = cli.port, "execution server listening");

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    Ok(())
}
