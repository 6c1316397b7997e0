//! Domain Layer
//!
//! Platform-independent types: connection/session models, persisted
//! profile records, and the store contract they are saved through.

pub mod models;
pub mod profiles;
pub mod store;
