// src/gps/mod.rs
//! GPS fix types and location sources

pub mod fix;
pub mod gpsd;
pub mod source;

pub use fix::{Fix, SensorPayload, SensorState, SensorValue};
pub use source::{GpsdSource, LocationSource, RegistrationId, SimulatedSource, SourceEvent};
