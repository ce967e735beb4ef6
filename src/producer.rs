use std::path::Path;
use std::time::Duration;

use log::{error, info};
use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use tokio::net::UnixStream;

use crate::error::ClientError;
use crate::protocol::{self, Reply, Request};

// ─── Reading sources ─────────────────────────────────────────────

/// Where a producer gets its next reading from.
pub trait ReadingSource {
    fn next_reading(&mut self) -> f64;
}

/// Simulated temperature sensor, uniform in `[15.0, 40.0]` °C.
pub struct SimulatedSensor {
    rng: StdRng,
}

impl SimulatedSensor {
    pub const LOW: f64 = 15.0;
    pub const HIGH: f64 = 40.0;

    /// Each producer seeds its own RNG so parallel producers differ.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ReadingSource for SimulatedSensor {
    fn next_reading(&mut self) -> f64 {
        self.rng.gen_range(Self::LOW..=Self::HIGH)
    }
}

/// Replays a fixed list of readings, cycling when exhausted.
pub struct FixedReadings {
    values: Vec<f64>,
    next: usize,
}

impl FixedReadings {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values, next: 0 }
    }
}

impl ReadingSource for FixedReadings {
    fn next_reading(&mut self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        let v = self.values[self.next % self.values.len()];
        self.next += 1;
        v
    }
}

// ─── Client ──────────────────────────────────────────────────────

/// One producer connection. Every `send` waits for its reply before
/// returning, so a producer never has more than one request in flight.
pub struct ProducerClient {
    stream: UnixStream,
    producer_id: i32,
}

impl ProducerClient {
    /// Connect once. An unreachable server is not retried.
    pub async fn connect(path: &Path, producer_id: i32) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| ClientError::Connect {
                path: path.to_owned(),
                source,
            })?;
        Ok(Self {
            stream,
            producer_id,
        })
    }

    pub fn producer_id(&self) -> i32 {
        self.producer_id
    }

    pub async fn send(&mut self, value: f64) -> Result<Reply, ClientError> {
        let request = Request::reading(self.producer_id, value);
        protocol::write_request(&mut self.stream, &request).await?;
        Ok(protocol::read_reply(&mut self.stream).await?)
    }

    /// Send a reading every `interval`, forever or for `limit` sends.
    /// The first failed exchange ends the loop with that error.
    pub async fn run<S: ReadingSource>(
        mut self,
        source: &mut S,
        interval: Duration,
        limit: Option<u64>,
    ) -> Result<(), ClientError> {
        let mut sent = 0u64;

        while limit.map_or(true, |max| sent < max) {
            let value = source.next_reading();
            match self.send(value).await {
                Ok(reply) => {
                    info!("[producer {}] sent {value:.3} -> reply: {reply}", self.producer_id)
                }
                Err(e) => {
                    error!("[producer {}] send failed: {e}", self.producer_id);
                    return Err(e);
                }
            }
            sent += 1;

            tokio::time::sleep(interval).await;
        }

        Ok(())
    }
}
