//! Lifecycle management for role-shaped cloud instances.
//!
//! The crate revolves around [`machine::Machine`]: bind it to an instance by
//! creating or adopting one, then drive it through start/stop/reboot/
//! terminate, snapshot it into images, attach durable volumes and run
//! commands on it. All waiting happens in explicit polling loops against the
//! provider's describe calls; the control plane is treated as eventually
//! consistent and never trusted beyond its last answer.

pub mod config;
pub mod error;
pub mod image;
pub mod machine;
pub mod probe;
pub mod provider;
pub mod remote;
pub mod role;
pub mod volume;
pub mod waiter;

pub use config::{Environment, PollPolicy};
pub use error::{Error, Result};
pub use machine::Machine;
pub use remote::guard::{in_remote_context, with_remote_context, RemoteTask};
pub use role::{ClusterRole, RoleDescriptor};
