//! Sensor frame formatting
//!
//! Turns decoded sensor frames into observations with the topic layout the
//! broker side expects.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::types::Observation;

pub const REMOTE_DEVICE_PREFIX: &str = "remote_device";
pub const GPS_LATITUDE_TOPIC: &str = "gps/latitude";
pub const GPS_LONGITUDE_TOPIC: &str = "gps/longitude";
pub const GPS_ALTITUDE_TOPIC: &str = "gps/altitude";
pub const DATETIME_TOPIC: &str = "datetime";
pub const BATTERY_TOPIC: &str = "gateway/battery_percentage";

/// A position fix with the receiver's UTC clock reading
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl GpsFix {
    /// Clock reading as `YYYY-MM-DDTHH:MM:SS`
    pub fn datetime_string(&self) -> String {
        format!(
            "{}-{:02}-{:02}T{:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

/// One observation per sensor reading of a remote device frame.
///
/// Payloads are `<value>|<unix seconds>`, stamped with `received_at`. Sensors
/// come out sorted by name.
pub fn remote_device(
    readings: &Map<String, Value>,
    received_at: DateTime<Utc>,
) -> Result<Vec<Observation>> {
    let stamp = received_at.timestamp();
    readings
        .iter()
        .map(|(sensor, value)| {
            if sensor.trim().is_empty() {
                return Err(Error::MalformedObservation(
                    "remote device frame has an unnamed sensor".to_string(),
                ));
            }
            Observation::new(
                format!("{}/{}", REMOTE_DEVICE_PREFIX, sensor),
                format!("{}|{}", render_value(value), stamp),
                received_at,
            )
        })
        .collect()
}

/// Latitude, longitude, altitude, then the fix's clock reading
pub fn gps(fix: &GpsFix, received_at: DateTime<Utc>) -> Result<Vec<Observation>> {
    Ok(vec![
        Observation::new(GPS_LATITUDE_TOPIC, fix.latitude.to_string(), received_at)?,
        Observation::new(GPS_LONGITUDE_TOPIC, fix.longitude.to_string(), received_at)?,
        Observation::new(GPS_ALTITUDE_TOPIC, fix.altitude.to_string(), received_at)?,
        Observation::new(DATETIME_TOPIC, fix.datetime_string(), received_at)?,
    ])
}

pub fn battery(percentage: f64, received_at: DateTime<Utc>) -> Result<Observation> {
    Observation::new(BATTERY_TOPIC, render_number(percentage), received_at)
}

// Strings go out bare, everything else as compact JSON.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}
