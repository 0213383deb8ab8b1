//! Observation Spooler Library
//!
//! This library provides components for store-and-forward delivery of
//! sensor observations to a SensorThings API:
//!
//! - **config**: Environment-based configuration for the spooler
//! - **observation**: Observation model with single and multi-stream results
//! - **store**: Durable SQLite spool tracking PENDING and ERROR rows
//! - **sampler**: Periodic sensor sampling feeding the spool
//! - **spool**: Writer task appending sampled observations to the store
//! - **batch**: `dataArray` payload assembly with slot mapping
//! - **client**: HTTP client for login and `CreateObservations`
//! - **auth**: TTL-cached bearer-token authentication
//! - **transmit**: Delivery cycles with per-row outcome reconciliation
//!
//! # Example
//!
//! ```no_run
//! use obs_spooler::batch::Batcher;
//! use obs_spooler::observation::{Observation, Scalar};
//! use obs_spooler::store::ObservationStore;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Open the durable spool
//!     let store = ObservationStore::open("observations.sqlite3")?;
//!
//!     // Record a reading; it stays PENDING until the server accepts it
//!     let reading = Observation::single(
//!         "ozone-ppb",
//!         "2024-01-01T00:00:00Z",
//!         Scalar::Number(41.3),
//!     )
//!     .with_parameter("adc_avg", "812");
//!     store.append(&reading)?;
//!
//!     // Build the wire payload for everything still pending
//!     let pending = store.get_pending(360)?;
//!     let batcher = Batcher::new(true, None);
//!     let payload = batcher.build(&pending);
//!     println!("{} elements ready to submit", payload.element_count());
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod auth;
pub mod batch;
pub mod client;
pub mod config;
pub mod observation;
pub mod sampler;
pub mod spool;
pub mod store;
pub mod transmit;

#[cfg(test)]
pub(crate) mod testsupport;

// Re-export commonly used types at crate root for convenience
pub use auth::Authenticator;
pub use batch::{BatchPayload, Batcher};
pub use client::{RowOutcome, StaClient, TransportError};
pub use config::{Config, ConfigError};
pub use observation::{Observation, ObservationResult, ObservationStatus, Scalar, StreamTarget};
pub use sampler::{Sensor, SensorKind};
pub use store::{ObservationStore, StoreError};
pub use transmit::{CycleReport, TransmitError, Transmitter};
