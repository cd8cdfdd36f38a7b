//! Stream live prices to stdout.
//!
//! ```bash
//! TOKENMETRICS_API_KEY=... cargo run --example stream_prices -- btc eth solana
//! ```
//!
//! Arguments are slugs or ticker symbols (comma or space separated);
//! defaults to bitcoin and ethereum. `RUST_LOG` controls log output.

use std::sync::Arc;

use price_stream::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,price_stream=debug")),
        )
        .init();

    let args = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let mut tokens = parse_token_list(&args);
    if tokens.is_empty() {
        tokens = vec![TokenSlug::new("bitcoin"), TokenSlug::new("ethereum")];
    }

    let config = StreamConfig::from_env()?;
    let check = config.plan.validate_token_list(&tokens);
    if !check.is_valid {
        warn!(
            "{} plan allows {} tokens; {} over (try {})",
            config.plan,
            check.max_allowed,
            check.excess,
            Plan::recommended_for(tokens.len())
        );
    }

    let stream = Arc::new(PriceStream::new(config)?);

    stream.on_connection_change({
        let stream = Arc::clone(&stream);
        let tokens = tokens.clone();
        move |state| {
            info!("Connection: {}", state);
            if *state == ConnectionState::Connected && stream.subscribed_tokens().is_empty() {
                if let Err(e) = stream.subscribe_to_tokens(tokens.clone()) {
                    warn!("Subscribe failed: {}", e);
                }
            }
        }
    });
    stream.on_subscription_update(|tokens| {
        let names: Vec<String> = tokens
            .iter()
            .map(|t| match token_info(t.as_str()) {
                Some(info) => info.display_name(),
                None => t.to_string(),
            })
            .collect();
        info!("Subscribed: {}", names.join(", "));
    });
    stream.on_price_update(|record| {
        println!(
            "{:<8} {:>14.4} USD  vol {:>12.4}  {} #{}",
            record.symbol, record.price_in_usd, record.volume, record.exchange, record.sequence
        );
    });
    stream.on_error(|err| {
        if err.is_terminal() {
            warn!("Stream stopped: {}", err);
        } else {
            warn!("Stream error: {}", err);
        }
    });

    stream.connect();
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    stream.disconnect();
    Ok(())
}
