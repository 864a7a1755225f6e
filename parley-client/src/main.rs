//! Parley client entry point.
//!
//! Loads configuration, installs logging, claims the exclusivity lease and
//! runs until Ctrl-C or until the lease is lost to another process.

use parley_client::{init_tracing, ClientContext, TelemetryConfig};
use parley_core::{LeaseError, ParleyConfig, ParleyError, ParleyResult};
use tokio::time::{interval, MissedTickBehavior};

#[tokio::main]
async fn main() -> ParleyResult<()> {
    let telemetry = TelemetryConfig::from_env()?;
    init_tracing(&telemetry)?;

    let config = ParleyConfig::load()?;
    let check_every = config.lease.heartbeat_interval();

    let context = match ClientContext::start(config).await {
        Ok(context) => context,
        Err(ParleyError::Lease(LeaseError::HeldElsewhere { slot })) => {
            tracing::error!(%slot, "Parley is already open in another window");
            return Err(LeaseError::HeldElsewhere { slot }.into());
        }
        Err(e) => return Err(e),
    };
    tracing::info!(holder_id = %context.holder_id(), "Parley running, press Ctrl-C to exit");

    let mut lease_check = interval(check_every);
    lease_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let outcome = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
                }
                tracing::info!("Shutdown signal received");
                break Ok(());
            }
            _ = lease_check.tick() => {
                if !context.lease_active() {
                    let slot = context.lease().slot().to_string();
                    tracing::error!(%slot, "Exclusivity lease lost, shutting down");
                    break Err(LeaseError::Lost { slot }.into());
                }
            }
        }
    };

    context.shutdown().await;
    outcome
}
