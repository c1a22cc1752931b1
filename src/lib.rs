//! microgpu-plugin: GPU partitioning device-plugin node agent.
//!
//! Advertises whole GPUs and their hardware partitions to the cluster
//! scheduler, allocates them to workloads and keeps the allocation table
//! consistent with what is physically present and still running:
//!   discovery (cached) → partition reconciliation → watch/allocate → recycling
//!
//! One plugin instance runs per vendor, each on its own Unix socket.

pub mod allocator;
pub mod config;
pub mod device;
pub mod liveness;
pub mod metrics;
pub mod partition;
pub mod plugin;
pub mod recycler;
pub mod workload;
