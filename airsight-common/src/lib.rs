//! # AirSight Common Library
//!
//! Shared code for the AirSight workspace:
//! - Common error type
//! - Configuration file and root folder resolution
//! - Pipeline event types and the EventBus
//! - Hour-bucket time helpers

pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
