pub mod governor;
pub mod procfs;
pub mod provision;
pub mod sandbox;
pub mod sluice;

pub use governor::{BoundedOutput, Breach, Governor, ProcessGovernor, RunLimits, RunSpec};
pub use provision::{HostProvisioner, InstanceLimits, ProvisionError, Provisioner, SandboxInstance};
pub use sandbox::{Identity, Sandbox, SetupError};
pub use sluice::Sluice;
