//! The control-plane seam.
//!
//! `CloudProvider` is everything the lifecycle manager asks of a cloud: CRUD
//! on instances, volumes and images, plus tagging. Implementations map their
//! own wire formats into the mirrored types here. Describe/list calls must
//! report a missing resource as `Error::NotFound` — image creation relies on
//! telling "not visible yet" apart from real failures.

pub mod fake;
pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ── Mirrored resource state ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeStatus {
    Creating,
    Available,
    InUse,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeStatus::Creating => "creating",
            VolumeStatus::Available => "available",
            VolumeStatus::InUse => "in-use",
        }
    }
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageState {
    Pending,
    Available,
}

impl ImageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageState::Pending => "pending",
            ImageState::Available => "available",
        }
    }
}

impl std::fmt::Display for ImageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Mirrored resources ──────────────────────────────────────────────

/// Local mirror of a provider instance. Refreshed by `describe_instance`;
/// never authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub state: InstanceState,
    /// Public address, empty until the provider assigns one.
    #[serde(default)]
    pub public_host: Option<String>,
    pub launched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub status: VolumeStatus,
    pub zone: String,
    /// Name tag, if one has been applied.
    #[serde(default)]
    pub name: Option<String>,
    /// Instance the volume is attached to, if any.
    #[serde(default)]
    pub attached_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub state: ImageState,
    pub name: String,
}

/// Parameters for launching a new instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub image_id: String,
    pub instance_type: String,
    pub key_name: String,
    pub zone: String,
    #[serde(default)]
    pub user_data: Option<String>,
}

// ── Provider trait ──────────────────────────────────────────────────

/// Asynchronous, eventually-consistent cloud control plane.
///
/// One instance per region lives behind an `Arc` and is shared by every
/// manager. All mutations are fire-and-forget from the provider's point of
/// view; the caller polls describe calls to observe the transition.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance>;
    async fn describe_instance(&self, id: &str) -> Result<Instance>;
    /// All instances carrying the given name tag, in provider order.
    async fn list_instances(&self, tag_name: &str) -> Result<Vec<Instance>>;

    async fn start_instance(&self, id: &str) -> Result<()>;
    async fn stop_instance(&self, id: &str) -> Result<()>;
    async fn terminate_instance(&self, id: &str) -> Result<()>;

    /// Apply a name tag to any resource (instance or volume).
    async fn tag(&self, resource_id: &str, name: &str) -> Result<()>;

    async fn create_volume(&self, size_gb: u32, zone: &str) -> Result<Volume>;
    async fn describe_volume(&self, id: &str) -> Result<Volume>;
    /// All volumes carrying the given name tag.
    async fn find_volumes(&self, tag_name: &str) -> Result<Vec<Volume>>;
    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str)
        -> Result<()>;

    /// Request an image of the instance; returns the image id immediately.
    /// The image may not be visible to `describe_image` for a while.
    async fn create_image(&self, instance_id: &str, name: &str) -> Result<String>;
    async fn describe_image(&self, id: &str) -> Result<Image>;
    /// All images whose name starts with the given prefix.
    async fn list_images(&self, name_prefix: &str) -> Result<Vec<Image>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_state_round_trips_kebab_case() {
        let json = serde_json::to_string(&InstanceState::ShuttingDown).unwrap();
        assert_eq!(json, "\"shutting-down\"");
        let back: InstanceState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, InstanceState::ShuttingDown);
        assert_eq!(InstanceState::ShuttingDown.to_string(), "shutting-down");
    }

    #[test]
    fn volume_status_displays() {
        assert_eq!(VolumeStatus::InUse.to_string(), "in-use");
        assert_eq!(VolumeStatus::Creating.as_str(), "creating");
    }

    #[test]
    fn instance_deserializes_without_host() {
        let json = r#"{
            "id": "i-0abc",
            "state": "pending",
            "launched_at": "2024-05-01T12:00:00Z"
        }"#;
        let inst: Instance = serde_json::from_str(json).unwrap();
        assert_eq!(inst.state, InstanceState::Pending);
        assert!(inst.public_host.is_none());
    }

    #[test]
    fn provider_trait_is_object_safe() {
        fn assert_dyn(_: &dyn CloudProvider) {}
        let _ = assert_dyn;
    }
}
