use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info};
use tokio::sync::watch;

use super::money_drops;
use crate::bus::EventBus;
use crate::repositories::LedgerStore;

/// Periodic housekeeping: money drop expiry and subscription period rollover.
pub struct Scheduler {
    ledger: Arc<dyn LedgerStore>,
    bus: Arc<dyn EventBus>,
    interval: Duration,
    period: chrono::Duration,
}

impl Scheduler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        bus: Arc<dyn EventBus>,
        interval: Duration,
        period: chrono::Duration,
    ) -> Self {
        Scheduler {
            ledger,
            bus,
            interval,
            period,
        }
    }

    pub async fn tick(&self) {
        match money_drops::sweep_expired(self.ledger.as_ref(), self.bus.as_ref()).await {
            Ok(refunds) if !refunds.is_empty() => {
                info!("Expired {} money drops", refunds.len())
            }
            Ok(_) => {}
            Err(e) => error!("Money drop sweep failed: {}", e),
        }

        match self.ledger.roll_over_periods(Utc::now(), self.period).await {
            Ok(0) => {}
            Ok(rolled) => info!("Rolled over {} subscription periods", rolled),
            Err(e) => error!("Subscription rollover failed: {}", e),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        info!("Scheduler stopped.");
    }
}
