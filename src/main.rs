// =============================================================================
// Position Guard — Main Entry Point
// =============================================================================
//
// Watches one Bitunix futures position and market-closes it once the
// unrealized loss reaches the configured USD amount, or the unrealized gain
// reaches the optional take-profit percentage.
//
// No flags: behaviour is fully determined by the config file
// (`guard_config.json`, or the path in $GUARD_CONFIG).
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod bitunix;
mod exchange;
mod guard;
mod guard_config;
mod pnl;
mod precision;
mod protective;
mod retry;
mod types;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::bitunix::BitunixClient;
use crate::guard::{GuardSettings, PositionGuard};
use crate::guard_config::GuardConfig;

const DEFAULT_CONFIG_PATH: &str = "guard_config.json";
const CONFIG_PATH_ENV: &str = "GUARD_CONFIG";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Position Guard starting up");

    // ── 2. Configuration (fatal on any problem) ──────────────────────────
    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = GuardConfig::load(&config_path).inspect_err(|e| {
        error!(path = %config_path, error = %e, "invalid configuration");
    })?;

    // ── 3. Exchange client ───────────────────────────────────────────────
    let client = BitunixClient::new(
        config.api_key.clone(),
        config.secret_key.clone(),
        config.base_url.clone(),
    )
    .context("failed to initialise Bitunix client")?;

    // ── 4. Guard loop until closed or interrupted ────────────────────────
    let mut guard = PositionGuard::new(client, GuardSettings::from(&config));

    tokio::select! {
        result = guard.run() => {
            let outcome = result.context("position guard stopped")?;
            info!(outcome = %outcome, "Position Guard finished");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl+C")?;
            warn!("Shutdown signal received — stopping without touching the position");
        }
    }

    Ok(())
}
