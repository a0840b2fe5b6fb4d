//! Authorization server endpoints.

mod config;
pub mod discovery;

pub use config::{Endpoints, Region, RegionParseError};
