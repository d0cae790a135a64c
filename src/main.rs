use std::net::SocketAddr;

use llm_debate_gateway::config::{read_u64, ProcessEnv};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,llm_debate_gateway=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = llm_debate_gateway::build_state()?;
    let app = llm_debate_gateway::build_app(state);

    let port = u16::try_from(read_u64(&ProcessEnv, "PORT", 8080)).unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "debate service listening");

    axum::serve(listener, app).await?;
    Ok(())
}
