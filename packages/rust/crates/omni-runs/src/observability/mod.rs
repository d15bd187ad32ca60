//! Stable structured-log event ids.

mod run_events;

pub use run_events::RunEvent;
