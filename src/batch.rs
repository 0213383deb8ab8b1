//! Grouping and wire serialization of observation batches.
//!
//! Pending observations are grouped by destination stream and encoded as
//! SensorThings `CreateObservations` envelopes. Alongside the JSON body the
//! batcher returns a slot map: for every `dataArray` element, in submission
//! order, the spool row ids that element carries. The response reconciler
//! walks that map, so acceptance and rejection land on the right rows even
//! when a transform collapsed several rows into one element.

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::config::Config;
use crate::observation::{Observation, ObservationResult, Scalar, StreamTarget};

/// A serialized batch ready for submission.
#[derive(Debug, Clone)]
pub struct BatchPayload {
    /// JSON array of per-stream envelopes
    pub body: Value,

    /// Spool row ids per `dataArray` element, flattened in submission order
    pub slots: Vec<Vec<i64>>,
}

impl BatchPayload {
    /// Number of `dataArray` elements across all envelopes.
    pub fn element_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// One `dataArray` element in the making.
struct WireRow {
    phenomenon_time: String,
    result: ObservationResult,
    feature_of_interest_id: Option<String>,
    parameters: Map<String, Value>,
    ids: Vec<i64>,
}

impl WireRow {
    fn from_observation(observation: &Observation) -> Self {
        let mut parameters = Map::new();
        for (key, value) in &observation.parameters {
            parameters.insert(key.clone(), Value::String(value.clone()));
        }
        Self {
            phenomenon_time: observation.phenomenon_time.clone(),
            result: observation.result.clone(),
            feature_of_interest_id: observation.feature_of_interest_id.clone(),
            parameters,
            ids: observation.id.map(|id| vec![id]).unwrap_or_default(),
        }
    }
}

/// Builds `CreateObservations` payloads from pending observations.
pub struct Batcher {
    /// Replace non-finite numeric results with JSON null
    sanitize_results: bool,

    /// MultiDatastream whose rows are averaged into one element per batch
    average_stream_id: Option<String>,
}

impl Batcher {
    pub fn new(sanitize_results: bool, average_stream_id: Option<String>) -> Self {
        Self {
            sanitize_results,
            average_stream_id,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.sanitize_results, config.average_stream_id.clone())
    }

    /// Serialize a batch of observations into envelopes plus their slot map.
    ///
    /// Groups keep first-seen order across streams and retrieval order
    /// within a stream, so the flattened slot map matches the order the
    /// server reports outcomes in.
    pub fn build(&self, observations: &[Observation]) -> BatchPayload {
        let mut envelopes = Vec::new();
        let mut slots = Vec::new();

        for (target, members) in group_by_stream(observations) {
            let rows = self.rows_for_group(target, &members);
            let (envelope, mut envelope_slots) = self.build_envelope(target, &rows);
            envelopes.push(envelope);
            slots.append(&mut envelope_slots);
        }

        BatchPayload {
            body: Value::Array(envelopes),
            slots,
        }
    }

    fn rows_for_group(&self, target: &StreamTarget, members: &[&Observation]) -> Vec<WireRow> {
        let rows: Vec<WireRow> = members
            .iter()
            .map(|obs| WireRow::from_observation(obs))
            .collect();

        let averaging = matches!(target, StreamTarget::MultiDatastream(_))
            && self.average_stream_id.as_deref() == Some(target.stream_id());
        if !averaging || rows.len() <= 1 {
            return rows;
        }

        match average_rows(&rows) {
            Some(collapsed) => vec![collapsed],
            None => {
                warn!(
                    stream = target.stream_id(),
                    "rows not eligible for averaging, sending raw"
                );
                rows
            }
        }
    }

    fn build_envelope(
        &self,
        target: &StreamTarget,
        rows: &[WireRow],
    ) -> (Value, Vec<Vec<i64>>) {
        // The FOI component appears only when some row actually has one
        let include_foi = rows.iter().any(|row| row.feature_of_interest_id.is_some());

        let mut components = vec![Value::from("phenomenonTime"), Value::from("result")];
        if include_foi {
            components.push(Value::from("FeatureOfInterest/id"));
        }
        components.push(Value::from("parameters"));

        let mut data_array = Vec::with_capacity(rows.len());
        let mut slots = Vec::with_capacity(rows.len());
        for row in rows {
            let mut element = vec![
                Value::from(row.phenomenon_time.clone()),
                self.wire_result(&row.result),
            ];
            if include_foi {
                element.push(match &row.feature_of_interest_id {
                    Some(id) => Value::from(id.clone()),
                    None => Value::Null,
                });
            }
            element.push(Value::Object(row.parameters.clone()));

            data_array.push(Value::Array(element));
            slots.push(row.ids.clone());
        }

        let mut envelope = Map::new();
        envelope.insert(
            target.envelope_key().to_string(),
            json!({ "@iot.id": target.stream_id() }),
        );
        envelope.insert("components".to_string(), Value::Array(components));
        envelope.insert(
            "dataArray@iot.count".to_string(),
            Value::from(data_array.len()),
        );
        envelope.insert("dataArray".to_string(), Value::Array(data_array));

        (Value::Object(envelope), slots)
    }

    fn wire_result(&self, result: &ObservationResult) -> Value {
        match result {
            ObservationResult::Single(scalar) => self.wire_scalar(scalar),
            ObservationResult::Multi(values) => {
                Value::Array(values.iter().map(|v| self.wire_scalar(v)).collect())
            }
        }
    }

    fn wire_scalar(&self, scalar: &Scalar) -> Value {
        match scalar {
            Scalar::Number(n) if n.is_finite() => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Scalar::Number(n) => {
                if self.sanitize_results {
                    Value::Null
                } else {
                    Value::String(n.to_string())
                }
            }
            Scalar::Text(s) => Value::String(s.clone()),
        }
    }
}

/// Group observations by stream id, keeping first-seen order across groups
/// and input order within each group.
fn group_by_stream(observations: &[Observation]) -> Vec<(&StreamTarget, Vec<&Observation>)> {
    let mut groups: Vec<(&StreamTarget, Vec<&Observation>)> = Vec::new();
    for obs in observations {
        match groups
            .iter_mut()
            .find(|(target, _)| target.stream_id() == obs.stream.stream_id())
        {
            Some((_, members)) => members.push(obs),
            None => groups.push((&obs.stream, vec![obs])),
        }
    }
    groups
}

/// Collapse rows into one slot-wise mean element.
///
/// Eligible only when every row is a finite all-numeric vector of the same
/// arity. The collapsed element takes the newest row's phenomenon time and
/// the first feature of interest present; its slot lists every source id.
fn average_rows(rows: &[WireRow]) -> Option<WireRow> {
    let first = rows.first()?;
    let arity = match &first.result {
        ObservationResult::Multi(values) => values.len(),
        ObservationResult::Single(_) => return None,
    };
    if arity == 0 {
        return None;
    }

    let mut sums = vec![0.0f64; arity];
    let mut ids = Vec::new();
    for row in rows {
        let values = match &row.result {
            ObservationResult::Multi(values) if values.len() == arity => values,
            _ => return None,
        };
        for (slot, value) in values.iter().enumerate() {
            match value {
                Scalar::Number(n) if n.is_finite() => sums[slot] += n,
                _ => return None,
            }
        }
        ids.extend_from_slice(&row.ids);
    }

    let count = rows.len() as f64;
    let means = sums
        .into_iter()
        .map(|sum| Scalar::Number(sum / count))
        .collect();

    let newest = rows.last()?;
    let feature_of_interest_id = rows
        .iter()
        .find_map(|row| row.feature_of_interest_id.clone());

    let mut parameters = Map::new();
    parameters.insert("samples_averaged".to_string(), Value::from(rows.len()));

    Some(WireRow {
        phenomenon_time: newest.phenomenon_time.clone(),
        result: ObservationResult::Multi(means),
        feature_of_interest_id,
        parameters,
        ids,
    })
}
