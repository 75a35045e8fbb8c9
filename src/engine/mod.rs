//! Disk engine: layout planning and provisioning.
//!
//! [`planner`] turns configuration and disk facts into a [`DiskLayoutPlan`]
//! without touching anything; [`provisioner`] executes it and returns the
//! [`ProvisionedDevices`].

pub mod devices;
pub mod planner;
pub mod provisioner;

pub use devices::{partition_path, ProvisionedDevices};
pub use planner::{plan, DiskLayoutPlan, HomeDecision, PartitionRole, PlanRequest};
pub use provisioner::DiskProvisioner;
