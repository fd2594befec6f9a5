// src/error.rs
//! Error types for the track recorder

use std::fmt;

pub type Result<T> = std::result::Result<T, TrackError>;

#[derive(Debug)]
pub enum TrackError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Config(String),
    Connection(String),
    Parse(String),
    /// A recording was requested while one is already active.
    AlreadyRecording,
    /// An operation that requires an active recording was called while idle.
    NotRecording,
    /// Resume was called while the recording is not paused.
    NotPaused,
    /// Pause or waypoint insertion was called while the recording is paused.
    Paused,
    /// Storage rejected a write (busy resource); safe to retry from the caller.
    StorageBusy(String),
    /// An internal invariant did not hold; the operation was aborted.
    InvalidState(String),
    Other(String),
}

impl fmt::Display for TrackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackError::Io(e) => write!(f, "IO error: {}", e),
            TrackError::Json(e) => write!(f, "JSON error: {}", e),
            TrackError::Config(msg) => write!(f, "Config error: {}", msg),
            TrackError::Connection(msg) => write!(f, "Connection error: {}", msg),
            TrackError::Parse(msg) => write!(f, "Parse error: {}", msg),
            TrackError::AlreadyRecording => write!(f, "Already recording a track"),
            TrackError::NotRecording => write!(f, "No track is being recorded"),
            TrackError::NotPaused => write!(f, "Recording is not paused"),
            TrackError::Paused => write!(f, "Recording is paused"),
            TrackError::StorageBusy(msg) => write!(f, "Storage busy: {}", msg),
            TrackError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            TrackError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for TrackError {}

impl From<std::io::Error> for TrackError {
    fn from(error: std::io::Error) -> Self {
        TrackError::Io(error)
    }
}

impl From<serde_json::Error> for TrackError {
    fn from(error: serde_json::Error) -> Self {
        TrackError::Json(error)
    }
}

impl From<anyhow::Error> for TrackError {
    fn from(error: anyhow::Error) -> Self {
        TrackError::Other(error.to_string())
    }
}
