//! Domain types: identities, events, the measurement codec and settings.

pub mod error;
pub mod heart_rate;
pub mod models;
pub mod settings;
