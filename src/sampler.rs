//! Simulated sensors feeding the spool.
//!
//! This module provides the producer side of the pipeline: the `Sensor`
//! abstraction, simulated ozone and climate probes for development and
//! soak testing, and the sampling task that ticks on the configured
//! interval and hands every reading to the spool channel.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::observation::{Observation, Scalar};

/// Load resistance of the ozone sensing circuit in ohms
const OZONE_LOAD_RESISTANCE: f64 = 10_000.0;

/// Calibrated baseline resistance (Ro) of the ozone element in clean air
const OZONE_BASELINE_RESISTANCE: f64 = 2_501.2;

/// Full-scale value of the 10-bit ADC
const ADC_MAX: f64 = 1023.0;

/// Sensor kinds selectable via `OBS_SPOOLER_SENSORS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Ozone,
    Climate,
}

impl SensorKind {
    /// Parse a configured sensor kind name.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ozone" => Some(SensorKind::Ozone),
            "climate" => Some(SensorKind::Climate),
            _ => None,
        }
    }
}

/// A source of periodic observations.
///
/// Implementations are constructed once at startup; the sampling task calls
/// `sample` on every tick and forwards whatever it yields.
pub trait Sensor: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Take one reading. An empty Vec means the probe had nothing this tick.
    fn sample(&mut self) -> Vec<Observation>;
}

/// Simulated ozone probe producing a single ppb reading per tick.
///
/// Mirrors an mq131-style analog element: an averaged ADC burst is converted
/// to the sensing resistance Rs against a fixed load, and the Rs/Ro ratio
/// maps linearly onto a ppb concentration. The intermediate values travel
/// with the observation as parameters.
pub struct OzoneSensor {
    stream_id: String,
    feature_of_interest_id: Option<String>,
}

impl OzoneSensor {
    pub fn new(stream_id: String, feature_of_interest_id: Option<String>) -> Self {
        Self {
            stream_id,
            feature_of_interest_id,
        }
    }
}

impl Sensor for OzoneSensor {
    fn name(&self) -> &'static str {
        "ozone"
    }

    fn sample(&mut self) -> Vec<Observation> {
        let mut rng = rand::thread_rng();

        // Averaged 10-bit ADC burst (typical outdoor range)
        let adc_avg = rng.gen_range(80.0..400.0);
        let rs = OZONE_LOAD_RESISTANCE * (ADC_MAX - adc_avg) / adc_avg;
        let ratio = rs / OZONE_BASELINE_RESISTANCE;
        let ppb = round2(2.0 * ratio);

        let mut observation =
            Observation::single(&self.stream_id, now_rfc3339(), Scalar::Number(ppb))
                .with_parameter("adc_avg", format!("{:.0}", adc_avg))
                .with_parameter("Rs", format!("{:.1}", rs))
                .with_parameter("Ro", format!("{:.1}", OZONE_BASELINE_RESISTANCE))
                .with_parameter("Rs_Ro_Ratio", format!("{:.3}", ratio));

        if let Some(foi) = &self.feature_of_interest_id {
            observation = observation.with_feature_of_interest(foi.as_str());
        }

        vec![observation]
    }
}

/// Simulated climate probe producing one fixed-order
/// `[air_temperature, relative_humidity]` reading per tick (dht11-style,
/// whole degrees and whole percent).
pub struct ClimateSensor {
    stream_id: String,
    feature_of_interest_id: Option<String>,
}

impl ClimateSensor {
    pub fn new(stream_id: String, feature_of_interest_id: Option<String>) -> Self {
        Self {
            stream_id,
            feature_of_interest_id,
        }
    }
}

impl Sensor for ClimateSensor {
    fn name(&self) -> &'static str {
        "climate"
    }

    fn sample(&mut self) -> Vec<Observation> {
        let mut rng = rand::thread_rng();

        // Indoor ranges: 18-28C, 35-65% RH
        let temperature = rng.gen_range(18.0_f64..28.0).round();
        let humidity = rng.gen_range(35.0_f64..65.0).round();

        let mut observation = Observation::multi(
            &self.stream_id,
            now_rfc3339(),
            vec![Scalar::Number(temperature), Scalar::Number(humidity)],
        );

        if let Some(foi) = &self.feature_of_interest_id {
            observation = observation.with_feature_of_interest(foi.as_str());
        }

        vec![observation]
    }
}

/// Construct the sensors named in the configuration.
pub fn build_sensors(config: &Config) -> Vec<Box<dyn Sensor>> {
    config
        .sensors
        .iter()
        .map(|kind| match kind {
            SensorKind::Ozone => Box::new(OzoneSensor::new(
                config.ozone_stream_id.clone(),
                config.feature_of_interest_id.clone(),
            )) as Box<dyn Sensor>,
            SensorKind::Climate => Box::new(ClimateSensor::new(
                config.climate_stream_id.clone(),
                config.feature_of_interest_id.clone(),
            )) as Box<dyn Sensor>,
        })
        .collect()
}

/// Periodic sampling task.
///
/// Samples immediately, then on every interval tick. Readings are handed to
/// the spool channel without blocking: a full channel drops the reading with
/// a warning, since the next tick reproduces fresh data. Returns when the
/// receiving side has gone away.
pub async fn sampler_task(
    mut sensors: Vec<Box<dyn Sensor>>,
    interval: Duration,
    tx: mpsc::Sender<Observation>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(
        sensors = sensors.len(),
        interval_secs = interval.as_secs(),
        "Sampler started"
    );

    loop {
        ticker.tick().await;

        for sensor in sensors.iter_mut() {
            for observation in sensor.sample() {
                debug!(
                    sensor = sensor.name(),
                    stream = observation.stream.stream_id(),
                    "Sampled observation"
                );
                match tx.try_send(observation) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(sensor = sensor.name(), "Spool channel full, dropping sample");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        info!("Spool channel closed, stopping sampler");
                        return;
                    }
                }
            }
        }
    }
}

/// Phenomenon time for a reading taken now.
fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
