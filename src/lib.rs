#![forbid(unsafe_code)]

//! Deploy Validation Harness (dvh): drives update deployments across a matrix
//! of target devices, forces each device back onto its tracking channel
//! afterwards, and gates the whole run on per-device TAP reports.
//!
//! A fleet run has three layers:
//! 1. **Fleet orchestrator**: selects devices, runs one validation run per
//!    device on a bounded worker pool, one lease per physical machine
//! 2. **Scenario runner**: pre-hook, primary deployment, declarative scenario
//!    cases and the unconditional resync to the complement channel
//! 3. **Report aggregator**: scans every report for `not ok` markers and
//!    produces a single pass/fail verdict
//!
//! # Library usage
//!
//! ```rust,no_run
//! use deploy_validation_harness::prelude::*;
//!
//! # fn main() -> deploy_validation_harness::core::errors::Result<()> {
//! let config = HarnessConfig::load(None)?;
//! let orchestrator = FleetOrchestrator::new(
//!     std::sync::Arc::new(config),
//!     CancelToken::new(),
//!     ActivityLoggerHandle::disabled(),
//! );
//! let (_outcome, report) = orchestrator.run_and_aggregate(&FleetOptions::default())?;
//! println!("fleet verdict: {:?}", report.verdict);
//! # Ok(())
//! # }
//! ```

pub mod prelude;

pub mod assertion;
pub mod core;
pub mod fleet;
pub mod logger;
pub mod report;
pub mod runner;
