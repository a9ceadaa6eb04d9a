//! In-memory provider with scripted state transitions.
//!
//! Mutations queue up the transient states a real control plane would move
//! through; each describe call advances the resource one step. Tests (and
//! dry runs) script stalls, listing delays and misattachments on top of
//! that. No I/O, no time — the polling loops above supply the waiting.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use crate::error::{Error, Result};
use crate::provider::{
    CloudProvider, Image, ImageState, Instance, InstanceSpec, InstanceState, Volume, VolumeStatus,
};

#[derive(Debug, Default, Clone)]
pub struct CallCounts {
    pub create_instance: u32,
    pub describe_instance: u32,
    pub create_volume: u32,
    pub create_image: u32,
    pub describe_image: u32,
}

#[derive(Debug)]
struct FakeInstance {
    record: Instance,
    tag: Option<String>,
    /// States still to be stepped through, one per describe.
    schedule: VecDeque<InstanceState>,
    /// Describes left before the public host is assigned once running.
    host_delay: u32,
}

#[derive(Debug)]
struct FakeVolume {
    record: Volume,
    schedule: VecDeque<VolumeStatus>,
    /// Attachment target applied when the volume reaches in-use. Normally
    /// the requested instance; fault injection can point it elsewhere.
    pending_attach: Option<String>,
}

#[derive(Debug)]
struct FakeImage {
    record: Image,
    schedule: VecDeque<ImageState>,
    /// Describes that still report NotFound (propagation delay).
    invisible_for: u32,
}

#[derive(Debug, Default)]
struct State {
    instances: BTreeMap<String, FakeInstance>,
    volumes: BTreeMap<String, FakeVolume>,
    images: BTreeMap<String, FakeImage>,
    counts: CallCounts,
    /// Invisibility applied to the next image created.
    next_image_invisible: u32,
    /// Overrides the generated host for every assignment, so tests can point
    /// the connection probe at a local listener.
    host_override: Option<String>,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct FakeProvider {
    state: Mutex<State>,
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> CallCounts {
        self.state.lock().unwrap().counts.clone()
    }

    /// Replace an instance's pending transitions, e.g. to stall it in an
    /// unplanned state.
    pub fn script_instance_states(&self, id: &str, states: &[InstanceState]) {
        let mut s = self.state.lock().unwrap();
        let inst = s.instances.get_mut(id).expect("unknown instance");
        inst.schedule = states.iter().copied().collect();
    }

    pub fn force_instance_state(&self, id: &str, state: InstanceState) {
        let mut s = self.state.lock().unwrap();
        let inst = s.instances.get_mut(id).expect("unknown instance");
        inst.record.state = state;
        inst.schedule.clear();
    }

    /// Keep the public host unassigned for the next `n` describes after the
    /// instance is running.
    pub fn delay_host_assignment(&self, id: &str, n: u32) {
        let mut s = self.state.lock().unwrap();
        let inst = s.instances.get_mut(id).expect("unknown instance");
        inst.record.public_host = None;
        inst.host_delay = n;
    }

    pub fn set_launched_at(&self, id: &str, launched_at: DateTime<Utc>) {
        let mut s = self.state.lock().unwrap();
        s.instances
            .get_mut(id)
            .expect("unknown instance")
            .record
            .launched_at = launched_at;
    }

    /// Seed a pre-existing tagged instance, as if created by an earlier
    /// invocation.
    pub fn seed_instance(
        &self,
        tag: &str,
        state: InstanceState,
        launched_at: DateTime<Utc>,
    ) -> String {
        let mut s = self.state.lock().unwrap();
        s.seq += 1;
        let id = format!("i-{:04}", s.seq);
        let host = s
            .host_override
            .clone()
            .unwrap_or_else(|| format!("host-{:04}.cloud.example", s.seq));
        s.instances.insert(
            id.clone(),
            FakeInstance {
                record: Instance {
                    id: id.clone(),
                    state,
                    public_host: Some(host),
                    launched_at,
                },
                tag: Some(tag.to_string()),
                schedule: VecDeque::new(),
                host_delay: 0,
            },
        );
        id
    }

    /// Seed a pre-existing tagged volume.
    pub fn seed_volume(&self, tag: &str, status: VolumeStatus, zone: &str) -> String {
        let mut s = self.state.lock().unwrap();
        s.seq += 1;
        let id = format!("vol-{:04}", s.seq);
        s.volumes.insert(
            id.clone(),
            FakeVolume {
                record: Volume {
                    id: id.clone(),
                    status,
                    zone: zone.to_string(),
                    name: Some(tag.to_string()),
                    attached_to: None,
                },
                schedule: VecDeque::new(),
                pending_attach: None,
            },
        );
        id
    }

    /// Make an existing image invisible to describe for `n` calls.
    pub fn delay_image_visibility(&self, id: &str, n: u32) {
        let mut s = self.state.lock().unwrap();
        s.images.get_mut(id).expect("unknown image").invisible_for = n;
    }

    /// Make the image minted by the next `create_image` invisible for `n`
    /// describes, mimicking control-plane propagation delay.
    pub fn delay_next_image_visibility(&self, n: u32) {
        self.state.lock().unwrap().next_image_invisible = n;
    }

    /// Assign `host` instead of the generated hostname whenever an instance
    /// gets a public host.
    pub fn use_host(&self, host: &str) {
        self.state.lock().unwrap().host_override = Some(host.to_string());
    }

    /// Point the next in-use report of this volume at the wrong instance.
    pub fn misattach(&self, volume_id: &str, other_instance: &str) {
        let mut s = self.state.lock().unwrap();
        let vol = s.volumes.get_mut(volume_id).expect("unknown volume");
        vol.pending_attach = Some(other_instance.to_string());
    }
}

#[async_trait::async_trait]
impl CloudProvider for FakeProvider {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<Instance> {
        let mut s = self.state.lock().unwrap();
        s.counts.create_instance += 1;
        s.seq += 1;
        let id = format!("i-{:04}", s.seq);
        let launched_at = base_time() + ChronoDuration::seconds(s.seq as i64);
        let record = Instance {
            id: id.clone(),
            state: InstanceState::Pending,
            public_host: None,
            launched_at,
        };
        let _ = spec;
        s.instances.insert(
            id.clone(),
            FakeInstance {
                record: record.clone(),
                tag: None,
                schedule: VecDeque::from([InstanceState::Running]),
                host_delay: 0,
            },
        );
        Ok(record)
    }

    async fn describe_instance(&self, id: &str) -> Result<Instance> {
        let mut s = self.state.lock().unwrap();
        s.counts.describe_instance += 1;
        let host_override = s.host_override.clone();
        let inst = s
            .instances
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;
        if let Some(next) = inst.schedule.pop_front() {
            inst.record.state = next;
        }
        if inst.record.state == InstanceState::Running && inst.record.public_host.is_none() {
            if inst.host_delay > 0 {
                inst.host_delay -= 1;
            } else {
                let generated = format!("{}.cloud.example", inst.record.id);
                inst.record.public_host = Some(host_override.unwrap_or(generated));
            }
        }
        Ok(inst.record.clone())
    }

    async fn list_instances(&self, tag_name: &str) -> Result<Vec<Instance>> {
        let s = self.state.lock().unwrap();
        Ok(s.instances
            .values()
            .filter(|i| i.tag.as_deref() == Some(tag_name))
            .map(|i| i.record.clone())
            .collect())
    }

    async fn start_instance(&self, id: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        let inst = s
            .instances
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;
        // A short window in the old state before the transition shows up.
        inst.schedule = VecDeque::from([
            InstanceState::Stopped,
            InstanceState::Pending,
            InstanceState::Running,
        ]);
        inst.record.public_host = None;
        Ok(())
    }

    async fn stop_instance(&self, id: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        let inst = s
            .instances
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;
        inst.schedule = VecDeque::from([InstanceState::Stopping, InstanceState::Stopped]);
        Ok(())
    }

    async fn terminate_instance(&self, id: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        let inst = s
            .instances
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))?;
        inst.schedule =
            VecDeque::from([InstanceState::ShuttingDown, InstanceState::Terminated]);
        Ok(())
    }

    async fn tag(&self, resource_id: &str, name: &str) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        if let Some(inst) = s.instances.get_mut(resource_id) {
            inst.tag = Some(name.to_string());
            return Ok(());
        }
        if let Some(vol) = s.volumes.get_mut(resource_id) {
            vol.record.name = Some(name.to_string());
            return Ok(());
        }
        Err(Error::NotFound(format!("resource {resource_id}")))
    }

    async fn create_volume(&self, size_gb: u32, zone: &str) -> Result<Volume> {
        let mut s = self.state.lock().unwrap();
        s.counts.create_volume += 1;
        s.seq += 1;
        let id = format!("vol-{:04}", s.seq);
        let record = Volume {
            id: id.clone(),
            status: VolumeStatus::Creating,
            zone: zone.to_string(),
            name: None,
            attached_to: None,
        };
        let _ = size_gb;
        s.volumes.insert(
            id.clone(),
            FakeVolume {
                record: record.clone(),
                schedule: VecDeque::from([VolumeStatus::Available]),
                pending_attach: None,
            },
        );
        Ok(record)
    }

    async fn describe_volume(&self, id: &str) -> Result<Volume> {
        let mut s = self.state.lock().unwrap();
        let vol = s
            .volumes
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("volume {id}")))?;
        if let Some(next) = vol.schedule.pop_front() {
            vol.record.status = next;
            if vol.record.status == VolumeStatus::InUse {
                vol.record.attached_to = vol.pending_attach.take();
            }
        }
        Ok(vol.record.clone())
    }

    async fn find_volumes(&self, tag_name: &str) -> Result<Vec<Volume>> {
        let s = self.state.lock().unwrap();
        Ok(s.volumes
            .values()
            .filter(|v| v.record.name.as_deref() == Some(tag_name))
            .map(|v| v.record.clone())
            .collect())
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<()> {
        let _ = device;
        let mut s = self.state.lock().unwrap();
        let vol = s
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| Error::NotFound(format!("volume {volume_id}")))?;
        if vol.pending_attach.is_none() {
            vol.pending_attach = Some(instance_id.to_string());
        }
        vol.schedule = VecDeque::from([VolumeStatus::InUse]);
        Ok(())
    }

    async fn create_image(&self, instance_id: &str, name: &str) -> Result<String> {
        let mut s = self.state.lock().unwrap();
        s.counts.create_image += 1;
        if !s.instances.contains_key(instance_id) {
            return Err(Error::NotFound(format!("instance {instance_id}")));
        }
        s.seq += 1;
        let id = format!("img-{:04}", s.seq);
        let invisible_for = std::mem::take(&mut s.next_image_invisible);
        s.images.insert(
            id.clone(),
            FakeImage {
                record: Image {
                    id: id.clone(),
                    state: ImageState::Pending,
                    name: name.to_string(),
                },
                schedule: VecDeque::from([ImageState::Available]),
                invisible_for,
            },
        );
        Ok(id)
    }

    async fn describe_image(&self, id: &str) -> Result<Image> {
        let mut s = self.state.lock().unwrap();
        s.counts.describe_image += 1;
        let img = s
            .images
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("image {id}")))?;
        if img.invisible_for > 0 {
            img.invisible_for -= 1;
            return Err(Error::NotFound(format!("image {id}")));
        }
        if let Some(next) = img.schedule.pop_front() {
            img.record.state = next;
        }
        Ok(img.record.clone())
    }

    async fn list_images(&self, name_prefix: &str) -> Result<Vec<Image>> {
        let s = self.state.lock().unwrap();
        Ok(s.images
            .values()
            .filter(|i| i.record.name.starts_with(name_prefix))
            .map(|i| i.record.clone())
            .collect())
    }
}
