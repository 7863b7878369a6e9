//! Fleet Monitor - host assignment and probe loop
//!
//! Binds every external server to exactly one orchestrator node via the
//! shared KV store and runs the scheduled probe batches for the servers
//! this node owns.

pub mod assignment;
pub mod probe;

pub use assignment::{
    MonitorAssignment, MonitorError, MonitorManager, ASSIGNMENT_PREFIX, ORCHESTRATOR_SERVICE,
};
pub use probe::{parse_probe_output, probe_batch, samples_from_batch};
