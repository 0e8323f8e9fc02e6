//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use deploy_validation_harness::prelude::*;
//! ```

// Core
pub use crate::core::config::HarnessConfig;
pub use crate::core::errors::{DvhError, Result};

// Fleet
pub use crate::fleet::device::{Channel, DeviceDescriptor, DeviceEntry, Inclusion, RunScope};
pub use crate::fleet::lock::DeviceLockRegistry;
pub use crate::fleet::orchestrator::{FleetOptions, FleetOrchestrator, FleetOutcome};
pub use crate::fleet::outcome::{FailureKind, Outcome, ReportEntry, RunFailure};

// Runner
pub use crate::runner::cancel::CancelToken;
pub use crate::runner::channel::{DeviceChannel, LocalChannel};

// Assertion
pub use crate::assertion::scenario::{PostCondition, ScenarioCase};

// Report
pub use crate::report::aggregator::{FleetReport, Verdict, aggregate};

// Logger
pub use crate::logger::activity::{ActivityLoggerHandle, spawn_logger};
