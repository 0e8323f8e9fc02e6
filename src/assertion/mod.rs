//! Scenario assertion engine.

pub mod scenario;
