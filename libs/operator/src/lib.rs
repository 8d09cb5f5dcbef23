pub mod controller;
pub mod crd;
pub mod error;
pub mod generator;
pub mod metrics;
pub mod status;
pub mod subset;
pub mod telemetry;

pub use error::{Error, Result};
