pub mod publisher;
pub mod snapshot;
pub mod window;

pub use publisher::SummaryPublisher;
pub use snapshot::StatsSnapshot;
pub use window::{SampleWindow, WINDOW_CAPACITY};

/// A single scalar reading as ingested by the server.
/// No identity beyond its value and arrival order.
pub type Sample = f64;
