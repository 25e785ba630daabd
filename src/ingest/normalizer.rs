//! Reading normalizer: raw transport payload → typed `Reading`.
//!
//! - Decodes the message body into a JSON object.
//! - Translates external, unit-suffixed labels (`T (degC)`, `p (mbar)`, ...) to canonical keys.
//! - Validates the four required features: present, numeric, finite; wind speed non-negative.
//! - `timestamp` is optional; when absent or unparseable the receive instant is used
//!   (receipt, not origin). A bad timestamp never rejects a reading whose features are valid.
//!
//! No state. The coordinator decides what to do with a rejection.

use chrono::{DateTime, NaiveDateTime, Utc};
use log::warn;
use serde_json::{Map, Value};

use crate::errors::InvalidReading;
use crate::ingest::reading::{Feature, Reading};

/// Raw payload after decoding: string keys to untyped values.
pub type RawPayload = Map<String, Value>;

const TIMESTAMP_KEY: &str = "timestamp";

/// Offset layouts accepted besides RFC 3339 (ISO-8601 basic offsets such as `+0000`).
const OFFSET_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// Naive layouts; interpreted as UTC.
const NAIVE_TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Decodes a transport message body into a key/value mapping.
pub fn decode_payload(body: &[u8]) -> Result<RawPayload, InvalidReading> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| InvalidReading::Malformed(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(InvalidReading::NotAnObject),
    }
}

/// Maps external sensor labels onto canonical feature keys.
/// A canonical key already present in the payload is never overwritten.
pub fn translate_keys(mut payload: RawPayload) -> RawPayload {
    for feature in [
        Feature::Temperature,
        Feature::Humidity,
        Feature::AirPressure,
        Feature::WindSpeed,
    ] {
        if let Some(value) = payload.remove(feature.external_label()) {
            payload.entry(feature.key()).or_insert(value);
        }
    }
    payload
}

/// Validates a canonical payload and builds a `Reading`.
///
/// `received_at` is substituted when the payload carries no usable timestamp.
pub fn normalize(payload: &RawPayload, received_at: DateTime<Utc>) -> Result<Reading, InvalidReading> {
    let temperature = required_number(payload, Feature::Temperature)?;
    let humidity = required_number(payload, Feature::Humidity)?;
    let air_pressure = required_number(payload, Feature::AirPressure)?;
    let wind_speed = required_number(payload, Feature::WindSpeed)?;

    if wind_speed < 0.0 {
        return Err(InvalidReading::NegativeWindSpeed(wind_speed));
    }

    let timestamp = match payload.get(TIMESTAMP_KEY) {
        None | Some(Value::Null) => received_at,
        Some(Value::String(s)) => parse_timestamp(s).unwrap_or_else(|| {
            warn!("unparseable timestamp {:?}, using receive time", s);
            received_at
        }),
        Some(other) => {
            warn!("non-string timestamp {}, using receive time", other);
            received_at
        }
    };

    Ok(Reading {
        timestamp,
        temperature,
        humidity,
        air_pressure,
        wind_speed,
    })
}

/// Parses RFC 3339, or a naive ISO-8601 / `YYYY-MM-DD HH:MM:SS` stamp taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Some(dt) = OFFSET_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| DateTime::parse_from_str(s, fmt).ok())
    {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn required_number(payload: &RawPayload, feature: Feature) -> Result<f64, InvalidReading> {
    let field = feature.key();
    let value = payload
        .get(field)
        .ok_or(InvalidReading::MissingField(field))?;
    let number = value
        .as_f64()
        .ok_or(InvalidReading::NotNumeric { field })?;
    if !number.is_finite() {
        return Err(InvalidReading::NonFinite { field });
    }
    Ok(number)
}
