//! Delivery cycle orchestration.
//!
//! The transmitter drains pending observations from the spool on a fixed
//! interval, serializes them, authenticates, submits the batch, and applies
//! the per-row outcomes back to the store: accepted rows are deleted,
//! rejected rows are marked ERROR, and any failure before a fully parsed
//! response leaves every row PENDING for the next cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::batch::Batcher;
use crate::client::{RowOutcome, StaClient, TransportError};
use crate::config::Config;
use crate::observation::ObservationStatus;
use crate::store::{ObservationStore, StoreError};

/// Errors surfaced by a delivery cycle.
#[derive(Debug)]
pub enum TransmitError {
    Store(StoreError),
    Transport(TransportError),
}

impl std::fmt::Display for TransmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransmitError::Store(e) => write!(f, "{}", e),
            TransmitError::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for TransmitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransmitError::Store(e) => Some(e),
            TransmitError::Transport(e) => Some(e),
        }
    }
}

impl From<StoreError> for TransmitError {
    fn from(err: StoreError) -> Self {
        TransmitError::Store(err)
    }
}

impl From<TransportError> for TransmitError {
    fn from(err: TransportError) -> Self {
        TransmitError::Transport(err)
    }
}

/// Outcome of one delivery cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Pending rows drained from the store
    pub pending: usize,

    /// `dataArray` elements submitted
    pub submitted: usize,

    /// Rows deleted after acceptance
    pub accepted: usize,

    /// Rows marked ERROR after rejection
    pub rejected: usize,
}

/// Drives delivery cycles against the store and the remote API.
pub struct Transmitter {
    store: Arc<ObservationStore>,
    client: StaClient,
    authenticator: Authenticator,
    batcher: Batcher,
    batch_limit: usize,
    interval: Duration,
}

impl Transmitter {
    pub fn new(
        store: Arc<ObservationStore>,
        client: StaClient,
        authenticator: Authenticator,
        batcher: Batcher,
        config: &Config,
    ) -> Self {
        Self {
            store,
            client,
            authenticator,
            batcher,
            batch_limit: config.batch_limit,
            interval: config.transmit_interval,
        }
    }

    /// Run one delivery cycle.
    ///
    /// An empty spool is an idle cycle: no login, no POST. Store mutations
    /// happen only after a 201 response whose outcome count matches the
    /// submitted element count; every earlier failure leaves the rows
    /// PENDING.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, TransmitError> {
        let pending = self.store.get_pending(self.batch_limit)?;
        if pending.is_empty() {
            debug!("No pending observations");
            return Ok(CycleReport::default());
        }

        let payload = self.batcher.build(&pending);
        let token = self.authenticator.bearer(&self.client).await?;
        let outcomes = self
            .client
            .create_observations(&token, &payload.body)
            .await?;

        if outcomes.len() != payload.slots.len() {
            return Err(TransmitError::Transport(
                TransportError::UnexpectedResponse(format!(
                    "{} outcomes for {} submitted elements",
                    outcomes.len(),
                    payload.slots.len()
                )),
            ));
        }

        let mut accepted_ids = Vec::new();
        let mut rejected_ids = Vec::new();
        for (outcome, ids) in outcomes.iter().zip(&payload.slots) {
            match outcome {
                RowOutcome::Accepted => accepted_ids.extend_from_slice(ids),
                RowOutcome::Rejected { message } => {
                    warn!(ids = ?ids, message = %message, "Server rejected observation");
                    rejected_ids.extend_from_slice(ids);
                }
            }
        }

        self.store.delete(&accepted_ids)?;
        self.store
            .update_status(&rejected_ids, ObservationStatus::Error)?;

        let report = CycleReport {
            pending: pending.len(),
            submitted: payload.slots.len(),
            accepted: accepted_ids.len(),
            rejected: rejected_ids.len(),
        };

        info!(
            pending = report.pending,
            submitted = report.submitted,
            accepted = report.accepted,
            rejected = report.rejected,
            "Delivery cycle complete"
        );

        Ok(report)
    }

    /// Drive delivery cycles until shutdown.
    ///
    /// The shutdown signal is honored only between cycles, so an in-flight
    /// cycle always finishes its store mutations. Cycle errors are logged
    /// and never end the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Swallow the immediate first tick; cycles start one interval in
        ticker.tick().await;

        info!(
            interval_secs = self.interval.as_secs(),
            batch_limit = self.batch_limit,
            "Transmitter started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        log_cycle_error(&e);
                    }
                }
                changed = shutdown.changed() => {
                    match changed {
                        Ok(()) if !*shutdown.borrow() => continue,
                        _ => {
                            info!("Transmitter stopping");
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn log_cycle_error(error: &TransmitError) {
    match error {
        TransmitError::Store(StoreError::Unavailable { attempts }) => {
            warn!(
                attempts = *attempts,
                "Spool database unavailable, skipping cycle"
            );
        }
        TransmitError::Transport(TransportError::Authentication { .. }) => {
            warn!(error = %error, "Authentication failed, will retry next cycle");
        }
        _ => {
            warn!(error = %error, "Delivery cycle failed, observations stay pending");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::{Observation, Scalar};
    use crate::testsupport::MockSta;
    use serde_json::{json, Value};

    fn reading(stream: &str, time: &str, value: f64) -> Observation {
        Observation::single(stream, time, Scalar::Number(value))
    }

    fn transmitter_for(config: &Config, store: Arc<ObservationStore>) -> Transmitter {
        let client = StaClient::new(config).expect("client builds");
        let authenticator = Authenticator::from_config(config);
        let batcher = Batcher::from_config(config);
        Transmitter::new(store, client, authenticator, batcher, config)
    }

    #[tokio::test]
    async fn test_idle_cycle_performs_no_http() {
        let mock = MockSta::start(vec![]).await;
        let store = Arc::new(ObservationStore::open_in_memory().unwrap());
        let mut transmitter = transmitter_for(&mock.config(), Arc::clone(&store));

        let report = transmitter.run_cycle().await.expect("idle cycle");
        assert_eq!(report, CycleReport::default());
        assert_eq!(mock.login_count(), 0);
        assert_eq!(mock.create_count(), 0);
    }

    #[tokio::test]
    async fn test_all_accepted_rows_are_deleted() {
        let mock = MockSta::start(vec![(
            201,
            r#"["http://host/Observations(1)", "http://host/Observations(2)"]"#.to_string(),
        )])
        .await;
        let store = Arc::new(ObservationStore::open_in_memory().unwrap());
        store
            .append(&reading("ds1", "2024-01-01T00:00:00Z", 1.0))
            .unwrap();
        store
            .append(&reading("ds1", "2024-01-01T00:01:00Z", 2.0))
            .unwrap();

        let mut transmitter = transmitter_for(&mock.config(), Arc::clone(&store));
        let report = transmitter.run_cycle().await.expect("cycle");

        assert_eq!(
            report,
            CycleReport {
                pending: 2,
                submitted: 2,
                accepted: 2,
                rejected: 0,
            }
        );
        assert!(store.get_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_all_rejected_rows_are_marked_error() {
        let mock = MockSta::start(vec![(
            201,
            r#"["error: bad time", "error: bad result"]"#.to_string(),
        )])
        .await;
        let store = Arc::new(ObservationStore::open_in_memory().unwrap());
        store
            .append(&reading("ds1", "2024-01-01T00:00:00Z", 1.0))
            .unwrap();
        store
            .append(&reading("ds1", "2024-01-01T00:01:00Z", 2.0))
            .unwrap();

        let mut transmitter = transmitter_for(&mock.config(), Arc::clone(&store));
        let report = transmitter.run_cycle().await.expect("cycle");

        assert_eq!(report.accepted, 0);
        assert_eq!(report.rejected, 2);

        // Rejected rows are retained but leave the pending set
        assert!(store.get_pending(10).unwrap().is_empty());
        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all
            .iter()
            .all(|obs| obs.status == ObservationStatus::Error));
    }

    #[tokio::test]
    async fn test_partial_outcomes_split_rows() {
        let mock = MockSta::start(vec![(
            201,
            r#"["ok-1", "error: rejected", "ok-2", "error: rejected"]"#.to_string(),
        )])
        .await;
        let store = Arc::new(ObservationStore::open_in_memory().unwrap());
        let mut ids = Vec::new();
        for i in 0..4 {
            let time = format!("2024-01-01T00:0{}:00Z", i);
            ids.push(store.append(&reading("ds1", &time, i as f64)).unwrap());
        }

        let mut transmitter = transmitter_for(&mock.config(), Arc::clone(&store));
        let report = transmitter.run_cycle().await.expect("cycle");

        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected, 2);

        let remaining = store.get_all().unwrap();
        let remaining_ids: Vec<i64> = remaining.iter().filter_map(|obs| obs.id).collect();
        assert_eq!(remaining_ids, vec![ids[1], ids[3]]);
        assert!(remaining
            .iter()
            .all(|obs| obs.status == ObservationStatus::Error));
    }

    #[tokio::test]
    async fn test_delivery_of_one_stored_reading() {
        let mock = MockSta::start(vec![(201, r#"[{"@iot.id":"999"}]"#.to_string())]).await;
        let store = Arc::new(ObservationStore::open_in_memory().unwrap());
        store
            .append(
                &reading("ds1", "2024-01-01T00:00:00Z", 42.0).with_parameter("voltage", "812"),
            )
            .unwrap();

        let mut transmitter = transmitter_for(&mock.config(), Arc::clone(&store));
        let report = transmitter.run_cycle().await.expect("cycle");

        assert_eq!(report.accepted, 1);
        assert!(store.get_all().unwrap().is_empty());

        let creates = mock.create_requests();
        assert_eq!(creates.len(), 1);

        let body: Value = serde_json::from_str(&creates[0].body).expect("json body");
        let envelopes = body.as_array().expect("array body");
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0]["Datastream"], json!({"@iot.id": "ds1"}));
        assert_eq!(envelopes[0]["dataArray@iot.count"], json!(1));
        assert_eq!(
            envelopes[0]["dataArray"],
            json!([["2024-01-01T00:00:00Z", 42.0, {"voltage": "812"}]])
        );
    }

    #[tokio::test]
    async fn test_transmission_failure_keeps_rows_pending() {
        let mock = MockSta::start(vec![(500, r#"{"error":"backend down"}"#.to_string())]).await;
        let store = Arc::new(ObservationStore::open_in_memory().unwrap());
        store
            .append(&reading("ds1", "2024-01-01T00:00:00Z", 1.0))
            .unwrap();

        let mut transmitter = transmitter_for(&mock.config(), Arc::clone(&store));
        match transmitter.run_cycle().await {
            Err(TransmitError::Transport(TransportError::Status { code, .. })) => {
                assert_eq!(code.as_u16(), 500);
            }
            other => panic!("expected status error, got {:?}", other),
        }

        assert_eq!(store.get_pending(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_authentication_failure_keeps_rows_pending() {
        let mock = MockSta::start_with(
            vec![(401, r#"{"error":"bad key"}"#.to_string())],
            vec![],
        )
        .await;
        let store = Arc::new(ObservationStore::open_in_memory().unwrap());
        store
            .append(&reading("ds1", "2024-01-01T00:00:00Z", 1.0))
            .unwrap();

        let mut transmitter = transmitter_for(&mock.config(), Arc::clone(&store));
        match transmitter.run_cycle().await {
            Err(TransmitError::Transport(TransportError::Authentication { .. })) => {}
            other => panic!("expected authentication error, got {:?}", other),
        }

        // The batch never went out
        assert_eq!(mock.create_count(), 0);
        assert_eq!(store.get_pending(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_outcome_count_mismatch_leaves_store_untouched() {
        let mock = MockSta::start(vec![(201, r#"["only-one"]"#.to_string())]).await;
        let store = Arc::new(ObservationStore::open_in_memory().unwrap());
        store
            .append(&reading("ds1", "2024-01-01T00:00:00Z", 1.0))
            .unwrap();
        store
            .append(&reading("ds1", "2024-01-01T00:01:00Z", 2.0))
            .unwrap();

        let mut transmitter = transmitter_for(&mock.config(), Arc::clone(&store));
        match transmitter.run_cycle().await {
            Err(TransmitError::Transport(TransportError::UnexpectedResponse(message))) => {
                assert!(message.contains("1 outcomes for 2 submitted elements"));
            }
            other => panic!("expected unexpected-response error, got {:?}", other),
        }

        assert_eq!(store.get_pending(10).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_limit_bounds_each_cycle() {
        let mock = MockSta::start(vec![(201, r#"["ok", "ok"]"#.to_string())]).await;
        let store = Arc::new(ObservationStore::open_in_memory().unwrap());
        for i in 0..3 {
            let time = format!("2024-01-01T00:0{}:00Z", i);
            store.append(&reading("ds1", &time, i as f64)).unwrap();
        }

        let mut config = mock.config();
        config.batch_limit = 2;
        let mut transmitter = transmitter_for(&config, Arc::clone(&store));

        let report = transmitter.run_cycle().await.expect("cycle");
        assert_eq!(report.pending, 2);
        assert_eq!(report.accepted, 2);
        assert_eq!(store.get_pending(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_token_reused_across_cycles() {
        let mock = MockSta::start(vec![
            (201, r#"["ok"]"#.to_string()),
            (201, r#"["ok"]"#.to_string()),
        ])
        .await;
        let store = Arc::new(ObservationStore::open_in_memory().unwrap());
        let mut transmitter = transmitter_for(&mock.config(), Arc::clone(&store));

        store
            .append(&reading("ds1", "2024-01-01T00:00:00Z", 1.0))
            .unwrap();
        transmitter.run_cycle().await.expect("first cycle");

        store
            .append(&reading("ds1", "2024-01-01T00:01:00Z", 2.0))
            .unwrap();
        transmitter.run_cycle().await.expect("second cycle");

        assert_eq!(mock.create_count(), 2);
        assert_eq!(mock.login_count(), 1);
    }

    #[tokio::test]
    async fn test_run_delivers_then_stops_on_shutdown() {
        let mock = MockSta::start(vec![(
            201,
            r#"["http://host/Observations(1)"]"#.to_string(),
        )])
        .await;
        let store = Arc::new(ObservationStore::open_in_memory().unwrap());
        store
            .append(&reading("ds1", "2024-01-01T00:00:00Z", 1.0))
            .unwrap();

        let mut config = mock.config();
        config.transmit_interval = Duration::from_millis(50);
        let transmitter = transmitter_for(&config, Arc::clone(&store));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(transmitter.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(store.get_all().unwrap().is_empty());

        shutdown_tx.send(true).expect("receiver alive");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("transmitter stops on shutdown")
            .expect("transmitter task exits cleanly");

        // Later cycles were idle: one delivery, one login
        assert_eq!(mock.create_count(), 1);
        assert_eq!(mock.login_count(), 1);
    }
}
