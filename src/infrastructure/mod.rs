//! Infrastructure Layer
//!
//! Bluetooth plumbing and logging setup behind the domain types.

pub mod bluetooth;
pub mod logging;
