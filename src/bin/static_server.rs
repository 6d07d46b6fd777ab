use clap::Parser;
use tracing::{error, info};

use voice_room::server::{self, ServerOpt};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let opt = ServerOpt::parse();
    match server::start(opt).await {
        Ok(_) => info!("static server stopped"),
        Err(e) => {
            error!("static server error: {}", e);
            std::process::exit(1);
        }
    }
}
