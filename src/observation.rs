//! Observation data model and storage text codecs.
//!
//! An observation is one sampled value plus its metadata, destined for a
//! specific remote stream. Results and parameter maps are stored as flat
//! text columns; the codecs here round-trip them losslessly, including
//! non-finite numbers, so wire-time sanitization stays a separate decision.

use std::collections::BTreeMap;

/// A single scalar result value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl Scalar {
    /// Encode the scalar into its storage text form.
    ///
    /// Numbers use their plain decimal form (`NaN`, `inf` and `-inf` for
    /// non-finite values); text is JSON-quoted so separators inside it
    /// survive the flat encodings.
    pub fn encode(&self) -> String {
        match self {
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => json_quote(s),
        }
    }

    /// Decode a scalar from its storage text form.
    ///
    /// Unquoted tokens that do not parse as a number are kept as text, so
    /// spool rows written by older tooling still load.
    pub fn decode(text: &str) -> Self {
        let token = text.trim();
        if token.starts_with('"') {
            match serde_json::from_str::<String>(token) {
                Ok(s) => Scalar::Text(s),
                Err(_) => Scalar::Text(token.trim_matches('"').to_string()),
            }
        } else {
            match token.parse::<f64>() {
                Ok(n) => Scalar::Number(n),
                Err(_) => Scalar::Text(token.to_string()),
            }
        }
    }
}

/// The result of one observation: a single scalar for Datastreams, or a
/// fixed-order list of scalars for MultiDatastreams.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservationResult {
    Single(Scalar),
    Multi(Vec<Scalar>),
}

impl ObservationResult {
    /// Number of scalar slots in this result.
    pub fn arity(&self) -> usize {
        match self {
            ObservationResult::Single(_) => 1,
            ObservationResult::Multi(values) => values.len(),
        }
    }

    /// Encode the result into its storage text form.
    pub fn encode(&self) -> String {
        match self {
            ObservationResult::Single(scalar) => scalar.encode(),
            ObservationResult::Multi(values) => {
                let encoded: Vec<String> = values.iter().map(Scalar::encode).collect();
                format!("[{}]", encoded.join(","))
            }
        }
    }

    /// Decode a result from its storage text form.
    pub fn decode(text: &str) -> Self {
        let token = text.trim();
        match token.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            Some(inner) => {
                let values = split_quoted(inner, ',')
                    .into_iter()
                    .filter(|part| !part.trim().is_empty())
                    .map(|part| Scalar::decode(&part))
                    .collect();
                ObservationResult::Multi(values)
            }
            None => ObservationResult::Single(Scalar::decode(token)),
        }
    }
}

/// The destination stream of an observation.
///
/// The spool schema keeps a single `stream_id` column; the variant is
/// recovered from the stored result shape on read (scalar results belong
/// to Datastreams, vector results to MultiDatastreams).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    Datastream(String),
    MultiDatastream(String),
}

impl StreamTarget {
    pub fn stream_id(&self) -> &str {
        match self {
            StreamTarget::Datastream(id) | StreamTarget::MultiDatastream(id) => id,
        }
    }

    /// Key naming this stream in a `CreateObservations` envelope.
    pub fn envelope_key(&self) -> &'static str {
        match self {
            StreamTarget::Datastream(_) => "Datastream",
            StreamTarget::MultiDatastream(_) => "MultiDatastream",
        }
    }
}

/// Local delivery status of a stored observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationStatus {
    Pending,
    Error,
}

impl ObservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationStatus::Pending => "PENDING",
            ObservationStatus::Error => "ERROR",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "PENDING" => Some(ObservationStatus::Pending),
            "ERROR" => Some(ObservationStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One sampled reading plus metadata, as stored in the spool.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Store-assigned row id; `None` until the observation is appended
    pub id: Option<i64>,

    /// Identifier of the sampled location/thing, when configured
    pub feature_of_interest_id: Option<String>,

    /// Destination stream
    pub stream: StreamTarget,

    /// ISO-8601 timestamp assigned by the sampler, never rewritten
    pub phenomenon_time: String,

    /// The sampled result
    pub result: ObservationResult,

    /// Auxiliary metadata (raw voltages, intermediate resistances, ...)
    pub parameters: BTreeMap<String, String>,

    /// Local delivery status
    pub status: ObservationStatus,
}

impl Observation {
    /// Create a new pending single-valued observation for a Datastream.
    pub fn single(
        stream_id: impl Into<String>,
        phenomenon_time: impl Into<String>,
        value: Scalar,
    ) -> Self {
        Self {
            id: None,
            feature_of_interest_id: None,
            stream: StreamTarget::Datastream(stream_id.into()),
            phenomenon_time: phenomenon_time.into(),
            result: ObservationResult::Single(value),
            parameters: BTreeMap::new(),
            status: ObservationStatus::Pending,
        }
    }

    /// Create a new pending multi-valued observation for a MultiDatastream.
    pub fn multi(
        stream_id: impl Into<String>,
        phenomenon_time: impl Into<String>,
        values: Vec<Scalar>,
    ) -> Self {
        Self {
            id: None,
            feature_of_interest_id: None,
            stream: StreamTarget::MultiDatastream(stream_id.into()),
            phenomenon_time: phenomenon_time.into(),
            result: ObservationResult::Multi(values),
            parameters: BTreeMap::new(),
            status: ObservationStatus::Pending,
        }
    }

    /// Attach a feature-of-interest id.
    pub fn with_feature_of_interest(mut self, id: impl Into<String>) -> Self {
        self.feature_of_interest_id = Some(id.into());
        self
    }

    /// Add one auxiliary parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Encode a parameter map into its flat storage form.
///
/// Entries render as `"key":"value"` joined with commas; an empty map is
/// stored as NULL (`None`).
pub fn encode_parameters(parameters: &BTreeMap<String, String>) -> Option<String> {
    if parameters.is_empty() {
        return None;
    }
    let encoded: Vec<String> = parameters
        .iter()
        .map(|(key, value)| format!("{}:{}", json_quote(key), json_quote(value)))
        .collect();
    Some(encoded.join(","))
}

/// Decode a parameter map from its flat storage form.
///
/// Splitting is quote-aware, so keys and values containing `,` or `:`
/// round-trip. Malformed fragments are skipped rather than failing the row.
pub fn decode_parameters(text: Option<&str>) -> BTreeMap<String, String> {
    let mut parameters = BTreeMap::new();
    let Some(text) = text else {
        return parameters;
    };
    if text.trim().is_empty() {
        return parameters;
    }
    for pair in split_quoted(text, ',') {
        let pieces = split_quoted(&pair, ':');
        if pieces.len() < 2 {
            continue;
        }
        let key = unquote(pieces[0].trim());
        let value = unquote(pieces[1..].join(":").trim());
        parameters.insert(key, value);
    }
    parameters
}

fn json_quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| format!("\"{}\"", text))
}

fn unquote(token: &str) -> String {
    if token.starts_with('"') && token.ends_with('"') && token.len() >= 2 {
        match serde_json::from_str::<String>(token) {
            Ok(s) => s,
            Err(_) => token.trim_matches('"').to_string(),
        }
    } else {
        token.to_string()
    }
}

/// Split `text` on `separator`, ignoring separators inside JSON-quoted
/// sections (including escaped quotes).
fn split_quoted(text: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for ch in text.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => {
                current.push(ch);
                escaped = true;
            }
            '"' => {
                current.push(ch);
                in_quotes = !in_quotes;
            }
            c if c == separator && !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}
