use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use super::snapshot::StatsSnapshot;
use super::window::SampleWindow;
use crate::region::{RegionError, SharedRegion};

/// Periodic task that copies the window summary into the shared region.
pub struct SummaryPublisher {
    window: Arc<SampleWindow>,
    region: Arc<SharedRegion>,
    period: Duration,
}

impl SummaryPublisher {
    pub fn new(window: Arc<SampleWindow>, region: Arc<SharedRegion>, period: Duration) -> Self {
        Self {
            window,
            region,
            period,
        }
    }

    /// One publish tick.
    ///
    /// `snapshot()` has released the window lock before the region lock is
    /// taken; the two locks are never held together.
    pub fn tick(&self) -> Result<StatsSnapshot, RegionError> {
        let snapshot = self.window.snapshot();
        self.region.publish(&snapshot)?;
        Ok(snapshot)
    }

    /// Tick every `period` until `shutdown` flips to true.
    /// The first tick fires one full period after start.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = IntervalStream::new(interval);

        loop {
            tokio::select! {
                _ = crate::shutdown_requested(&mut shutdown) => break,
                Some(_) = ticks.next() => match self.tick() {
                    Ok(s) => info!(
                        "periodic stats: count={} avg={:.3} min={:.3} max={:.3}",
                        s.count, s.average, s.minimum, s.maximum
                    ),
                    Err(e) => warn!("publish tick failed: {e}"),
                },
            }
        }

        info!("summary publisher stopped");
    }
}
