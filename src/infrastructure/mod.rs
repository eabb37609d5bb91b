//! Infrastructure: the radio, timers, persistence and plumbing around the
//! pure domain types.

pub mod bluetooth;
pub mod event_bus;
pub mod logging;
pub mod storage;
pub mod timer;
