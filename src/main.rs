//! stockroom - call the delivery-company API through the read cache
//!
//! Each `call` is routed through a `SmartCache`, so repeated reads within the
//! TTL are answered without another HTTP round trip.

use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error};

use stockroom::cache::SmartCache;
use stockroom::cli::{Cli, RunConfig};
use stockroom::delivery::{CachedDeliveryClient, DeliveryClient};
use stockroom::logging;

async fn run(config: RunConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = CachedDeliveryClient::new(
        DeliveryClient::new(config.delivery),
        SmartCache::new(config.cache),
    );

    for attempt in 1..=config.repeat {
        let value = client.fetch(config.request.clone()).await?;
        debug!(attempt, cached = client.cache().len(), "call finished");
        println!("{}", serde_json::to_string_pretty(&value)?);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init() {
        eprintln!("{}", e);
    }

    let config = match RunConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "call failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
