//! Device matrix, exclusive device leases, run outcomes and the orchestrator.

pub mod device;
pub mod lock;
pub mod orchestrator;
pub mod outcome;
