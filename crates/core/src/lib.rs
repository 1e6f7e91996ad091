//! Shared foundations for the drip sequence engine: configuration, the error
//! taxonomy, the analytics event bus and the injectable clock.

pub mod clock;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use error::{SequencerError, SequencerResult};
