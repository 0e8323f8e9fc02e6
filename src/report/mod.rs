//! Report artifacts: per-device TAP files and the fleet-wide verdict.

pub mod aggregator;
pub mod tap;
