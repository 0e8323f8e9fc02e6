//! Command execution against devices: process control, transports, command
//! templates, the per-run scenario runner and the divergence resync step.

pub mod cancel;
pub mod channel;
pub mod command;
pub mod resync;
pub mod scenario;
pub mod template;
