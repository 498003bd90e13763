use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};
use crate::orders::OrdersService;

/// Periodically releases reservations whose expiry has passed.
///
/// Each tick runs one bounded batch. Failures are logged and the next tick
/// proceeds as usual. The loop ends when the shutdown channel flips to `true`
/// or its sender is dropped.
pub struct ReservationReleaser {
    orders: OrdersService,
    interval: Duration,
    batch_limit: i64,
}

impl ReservationReleaser {
    pub fn new(orders: OrdersService, interval: Duration, batch_limit: i64) -> Self {
        Self { orders, interval, batch_limit }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = self.interval.as_millis() as u64,
            batch_limit = self.batch_limit,
            "Reservation releaser started"
        );

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    self.release_expired().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reservation releaser stopped");
    }

    async fn release_expired(&self) {
        match self.orders.sweep_expired(self.batch_limit).await {
            Ok(0) => {}
            Ok(count) => info!(count, "Released expired reservations"),
            Err(e) => error!("Error releasing expired reservations: {}", e),
        }
    }
}
