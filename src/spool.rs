//! Spool writer task.
//!
//! Drains the producer channel into the durable store. Sampling stays
//! decoupled from delivery: once a reading is appended here it survives
//! crashes and outages until a delivery cycle disposes of it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::observation::Observation;
use crate::store::ObservationStore;

/// Append every received observation to the store.
///
/// Runs until all senders are dropped and the channel is drained, then
/// returns the number of observations appended. A failed append is logged
/// and the observation dropped; the next sampling tick produces fresh data.
pub async fn spool_task(mut rx: mpsc::Receiver<Observation>, store: Arc<ObservationStore>) -> u64 {
    let mut appended: u64 = 0;

    while let Some(observation) = rx.recv().await {
        match store.append(&observation) {
            Ok(id) => {
                appended += 1;
                debug!(
                    id = id,
                    stream = observation.stream.stream_id(),
                    "Spooled observation"
                );
            }
            Err(e) => {
                error!(error = %e, "Failed to spool observation, dropping");
            }
        }
    }

    info!(appended = appended, "Spool writer stopped");
    appended
}
