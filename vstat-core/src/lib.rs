pub mod accounting;
pub mod signal;
pub mod telemetry;
