//! syncsrv - bidirectional value sync between a building simulator and REST
//! building controllers
//!
//! The simulation cycle advances the simulator and turns its outputs into
//! pending device writes; the device cycle flushes those writes in one batch
//! per device and reads output objects back as simulator control inputs.

pub mod config;
pub mod device;
pub mod engine;
pub mod equipment;
pub mod point;
pub mod settings;
pub mod simulator;
pub mod units;

pub use engine::{ShutdownReport, SyncEngine};
pub use equipment::{CycleSummary, EquipmentManager};
pub use settings::Settings;

pub const SERVICE_NAME: &str = "syncsrv";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
