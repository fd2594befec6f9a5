// src/gps/gpsd.rs
//! GPSD client: connection handshake and TPV-to-fix conversion

use super::fix::Fix;
use crate::error::{Result, TrackError};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::TcpStream,
};

#[derive(Debug, Deserialize)]
struct GpsdMessage {
    class: String,
    #[serde(flatten)]
    data: HashMap<String, serde_json::Value>,
}

/// Connect to a gpsd daemon and enable the JSON watch stream.
pub async fn connect(host: &str, port: u16) -> Result<BufReader<TcpStream>> {
    let mut stream = TcpStream::connect(format!("{}:{}", host, port))
        .await
        .map_err(|e| {
            TrackError::Connection(format!("Failed to connect to gpsd at {}:{}: {}", host, port, e))
        })?;

    let watch_cmd = "?WATCH={\"enable\":true,\"json\":true}\n";
    stream
        .write_all(watch_cmd.as_bytes())
        .await
        .map_err(|e| TrackError::Connection(format!("Failed to send WATCH command: {}", e)))?;

    Ok(BufReader::new(stream))
}

/// Parse one line of gpsd JSON. Returns a fix for TPV messages that carry
/// a position with at least a 2D mode; all other message classes yield None.
pub fn parse_line(line: &str) -> Result<Option<Fix>> {
    let msg: GpsdMessage = serde_json::from_str(line)
        .map_err(|e| TrackError::Parse(format!("Failed to parse gpsd JSON: {}", e)))?;

    match msg.class.as_str() {
        "TPV" => Ok(parse_tpv(&msg.data)),
        "VERSION" => {
            if let Some(version) = msg.data.get("release").and_then(|v| v.as_str()) {
                log::info!("Connected to gpsd version {}", version);
            }
            Ok(None)
        }
        // SKY, DEVICES and friends carry no position
        _ => Ok(None),
    }
}

fn parse_tpv(data: &HashMap<String, serde_json::Value>) -> Option<Fix> {
    let mode = data.get("mode").and_then(|v| v.as_u64()).unwrap_or(0);
    if mode < 2 {
        return None;
    }
    let latitude = data.get("lat").and_then(|v| v.as_f64())?;
    let longitude = data.get("lon").and_then(|v| v.as_f64())?;

    let time = data
        .get("time")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let mut fix = Fix::new(latitude, longitude, time);
    fix.altitude = data.get("alt").and_then(|v| v.as_f64());
    fix.speed = data.get("speed").and_then(|v| v.as_f64());
    fix.bearing = data.get("track").and_then(|v| v.as_f64());
    // Horizontal accuracy: prefer eph, fall back to the larger per-axis error
    fix.accuracy = data.get("eph").and_then(|v| v.as_f64()).or_else(|| {
        let epx = data.get("epx").and_then(|v| v.as_f64());
        let epy = data.get("epy").and_then(|v| v.as_f64());
        match (epx, epy) {
            (Some(x), Some(y)) => Some(x.max(y)),
            (x, y) => x.or(y),
        }
    });
    Some(fix)
}
