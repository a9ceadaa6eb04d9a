//! The machine: one role-shaped instance and its lifecycle.
//!
//! A `Machine` starts unbound. `create` launches a fresh instance for its
//! role; `adopt` binds to one that already exists, picked by launch-time
//! ordinal. Every lifecycle verb first checks the instance is in the one
//! state the verb accepts, then drives the provider and waits out the
//! transition. Nothing is inferred from local state alone: the provider is
//! re-described before every decision.

use std::path::Path;
use std::sync::Arc;

use crate::config::{Environment, PollPolicy};
use crate::error::{Error, Result};
use crate::image::ImageManager;
use crate::probe::ReadinessProbe;
use crate::provider::{CloudProvider, Instance, InstanceSpec, InstanceState, Volume};
use crate::remote::guard::{self, RemoteTask};
use crate::remote::{CommandOutput, RemoteExecutor};
use crate::role::RoleDescriptor;
use crate::volume::VolumeManager;
use crate::waiter::wait_for_transition;

const DEFAULT_REMOTE_PORT: u16 = 22;

pub struct Machine {
    role: RoleDescriptor,
    env: Environment,
    provider: Arc<dyn CloudProvider>,
    executor: Arc<dyn RemoteExecutor>,
    policy: PollPolicy,
    key_name: String,
    remote_port: u16,
    instance_id: Option<String>,
    host_name: Option<String>,
}

impl Machine {
    pub fn new(
        role: RoleDescriptor,
        env: Environment,
        provider: Arc<dyn CloudProvider>,
        executor: Arc<dyn RemoteExecutor>,
        policy: PollPolicy,
        key_name: &str,
    ) -> Self {
        Self {
            role,
            env,
            provider,
            executor,
            policy,
            key_name: key_name.to_string(),
            remote_port: DEFAULT_REMOTE_PORT,
            instance_id: None,
            host_name: None,
        }
    }

    pub fn with_remote_port(mut self, port: u16) -> Self {
        self.remote_port = port;
        self
    }

    pub fn role(&self) -> &RoleDescriptor {
        &self.role
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    pub fn host_name(&self) -> Option<&str> {
        self.host_name.as_deref()
    }

    /// The namespaced name this machine's resources are tagged with.
    pub fn absolute_role_name(&self) -> String {
        self.env.absolute_name(&self.role.name)
    }

    /// `user@host` for handing off to an interactive ssh.
    pub fn ssh_destination(&self) -> Result<String> {
        let host = self.require_host()?;
        Ok(format!("{}@{host}", self.role.ssh_user))
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Launch a fresh instance for this role, tag it, and wait until it is
    /// fully reachable.
    pub async fn create(&mut self) -> Result<()> {
        if self.instance_id.is_some() {
            return Err(Error::Precondition(
                "machine is already bound to an instance".into(),
            ));
        }
        let absolute = self.absolute_role_name();
        let spec = InstanceSpec {
            image_id: self.role.image_id.clone(),
            instance_type: self.role.instance_type.clone(),
            key_name: self.key_name.clone(),
            zone: self.env.availability_zone.clone(),
            user_data: self.role.user_data.clone(),
        };
        let instance = self.provider.create_instance(&spec).await?;
        tracing::info!(instance_id = %instance.id, role = %absolute, "instance launched");
        self.provider.tag(&instance.id, &absolute).await?;
        self.instance_id = Some(instance.id.clone());
        self.wait_ready(instance, &[InstanceState::Pending]).await
    }

    /// Bind to an existing instance of this role.
    ///
    /// Candidates are every non-terminated instance tagged with the role's
    /// absolute name, ordered by launch time; the ordinal indexes into that
    /// order, oldest first. Without an ordinal exactly one candidate must
    /// exist. With `wait` the full readiness probe runs after binding, so a
    /// still-booting instance can be adopted and waited out in one call.
    pub async fn adopt(&mut self, ordinal: Option<usize>, wait: bool) -> Result<()> {
        if self.instance_id.is_some() {
            return Err(Error::Precondition(
                "machine is already bound to an instance".into(),
            ));
        }
        let absolute = self.absolute_role_name();
        let mut candidates: Vec<Instance> = self
            .provider
            .list_instances(&absolute)
            .await?
            .into_iter()
            .filter(|i| i.state != InstanceState::Terminated)
            .collect();
        candidates.sort_by_key(|i| i.launched_at);

        if candidates.is_empty() {
            return Err(Error::NotFound(format!(
                "no instances for role '{absolute}'"
            )));
        }
        let index = match ordinal {
            Some(i) => i,
            None if candidates.len() == 1 => 0,
            None => {
                return Err(Error::Ambiguity {
                    name: absolute,
                    count: candidates.len(),
                })
            }
        };
        let instance = candidates.get(index).ok_or_else(|| {
            Error::NotFound(format!(
                "role '{absolute}' has {} instance(s), no ordinal {index}",
                candidates.len()
            ))
        })?;
        tracing::info!(instance_id = %instance.id, role = %absolute, ordinal = index, "adopted instance");
        self.instance_id = Some(instance.id.clone());
        self.host_name = instance.public_host.clone();
        if wait {
            let instance = instance.clone();
            self.wait_ready(instance, &[InstanceState::Pending]).await?;
        }
        Ok(())
    }

    /// Re-describe the bound instance.
    pub async fn instance(&self) -> Result<Instance> {
        let id = self.require_bound()?;
        self.provider.describe_instance(id).await
    }

    /// Start a stopped instance and wait until it is fully reachable again.
    pub async fn start(&mut self) -> Result<()> {
        let instance = self.expect_state(InstanceState::Stopped).await?;
        self.provider.start_instance(&instance.id).await?;
        tracing::info!(instance_id = %instance.id, "starting instance");
        // The old state may linger for a few describes after the call.
        self.wait_ready(instance, &[InstanceState::Stopped, InstanceState::Pending])
            .await
    }

    /// Stop a running instance and wait until it has settled.
    pub async fn stop(&mut self) -> Result<()> {
        let instance = self.expect_state(InstanceState::Running).await?;
        self.provider.stop_instance(&instance.id).await?;
        tracing::info!(instance_id = %instance.id, "stopping instance");
        let id = instance.id.clone();
        self.wait_instance(
            instance,
            &[InstanceState::Running, InstanceState::Stopping],
            InstanceState::Stopped,
        )
        .await?;
        // A restart may come up under a different address.
        self.host_name = None;
        tracing::info!(instance_id = %id, "instance stopped");
        Ok(())
    }

    /// Stop, then start. The readiness probe at the end of `start` is what
    /// makes this safe to script against.
    pub async fn reboot(&mut self) -> Result<()> {
        self.stop().await?;
        self.start().await
    }

    /// Terminate the bound instance. Terminating an already-terminated
    /// instance is a no-op, so cleanup scripts can re-run safely.
    pub async fn terminate(&mut self, wait: bool) -> Result<()> {
        let id = self.require_bound()?.to_string();
        let instance = self.provider.describe_instance(&id).await?;
        if instance.state == InstanceState::Terminated {
            tracing::info!(instance_id = %id, "instance already terminated");
            self.host_name = None;
            return Ok(());
        }
        self.provider.terminate_instance(&id).await?;
        self.host_name = None;
        tracing::info!(instance_id = %id, "terminating instance");
        if wait {
            self.wait_instance(
                instance,
                &[
                    InstanceState::Pending,
                    InstanceState::Running,
                    InstanceState::Stopping,
                    InstanceState::Stopped,
                    InstanceState::ShuttingDown,
                ],
                InstanceState::Terminated,
            )
            .await?;
            tracing::info!(instance_id = %id, "instance terminated");
        }
        Ok(())
    }

    /// Every non-terminated instance of this role, oldest first. The index
    /// in the returned list is the adoption ordinal.
    pub async fn list(&self) -> Result<Vec<Instance>> {
        let absolute = self.absolute_role_name();
        let mut instances: Vec<Instance> = self
            .provider
            .list_instances(&absolute)
            .await?
            .into_iter()
            .filter(|i| i.state != InstanceState::Terminated)
            .collect();
        instances.sort_by_key(|i| i.launched_at);
        Ok(instances)
    }

    // ── Images ──────────────────────────────────────────────────────

    /// Snapshot the bound instance into an image named after this role.
    /// The instance must already be stopped; imaging a live filesystem is
    /// refused rather than risking a torn snapshot.
    pub async fn create_image(&self) -> Result<String> {
        let instance = self.expect_state(InstanceState::Stopped).await?;
        ImageManager::new(self.provider.clone(), self.policy.clone())
            .create(&instance.id, &self.absolute_role_name())
            .await
    }

    /// Images previously taken of this role, oldest first.
    pub async fn list_images(&self) -> Result<Vec<crate::provider::Image>> {
        ImageManager::new(self.provider.clone(), self.policy.clone())
            .list(&self.absolute_role_name())
            .await
    }

    // ── Volumes ─────────────────────────────────────────────────────

    /// Ensure the named volume exists in this environment and is attachable.
    pub async fn ensure_volume(&self, name: &str, size_gb: u32) -> Result<Volume> {
        VolumeManager::new(self.provider.clone(), self.env.clone(), self.policy.clone())
            .ensure(name, size_gb)
            .await
    }

    /// Attach a volume to the bound instance and verify it landed there.
    pub async fn attach_volume(&self, volume: &Volume, device: &str) -> Result<()> {
        let id = self.require_bound()?.to_string();
        VolumeManager::new(self.provider.clone(), self.env.clone(), self.policy.clone())
            .attach(volume, &id, device)
            .await
    }

    // ── Remote execution ────────────────────────────────────────────

    /// Resolve and run a remote task on this machine, inside a
    /// remote-execution context. Non-zero exit is an error.
    pub async fn run_remote(&self, task: &RemoteTask<Machine>) -> Result<CommandOutput> {
        let host = self.require_host()?.to_string();
        let command = task.resolve(self);
        guard::with_remote_context(async {
            let mut session = self
                .executor
                .open_session(&host, &self.role.ssh_user)
                .await?;
            let outcome = session.run(&command).await;
            session.close().await;
            let output = outcome?;
            if output.exit_code != Some(0) {
                return Err(Error::Remote(format!(
                    "'{command}' exited with {:?}: {}",
                    output.exit_code,
                    output.stderr.trim()
                )));
            }
            Ok(output)
        })
        .await
    }

    /// Copy a local file onto this machine.
    pub async fn put_file(&self, local: &Path, remote: &str) -> Result<()> {
        let host = self.require_host()?.to_string();
        guard::with_remote_context(async {
            let mut session = self
                .executor
                .open_session(&host, &self.role.ssh_user)
                .await?;
            let outcome = session.put_file(local, remote).await;
            session.close().await;
            outcome
        })
        .await
    }

    // ── Internals ───────────────────────────────────────────────────

    fn require_bound(&self) -> Result<&str> {
        self.instance_id.as_deref().ok_or_else(|| {
            Error::Precondition("machine is not bound; create or adopt an instance first".into())
        })
    }

    fn require_host(&self) -> Result<&str> {
        self.host_name.as_deref().ok_or_else(|| {
            Error::Precondition(
                "machine has no host; create, adopt or start an instance first".into(),
            )
        })
    }

    /// Re-describe the bound instance and demand it be in `expected`.
    async fn expect_state(&self, expected: InstanceState) -> Result<Instance> {
        let id = self.require_bound()?.to_string();
        let instance = self.provider.describe_instance(&id).await?;
        if instance.state != expected {
            return Err(Error::Precondition(format!(
                "instance {id} must be {expected} for this operation but is {}",
                instance.state
            )));
        }
        Ok(instance)
    }

    /// Wait until the instance is running, then probe end-to-end readiness
    /// and record the public host.
    async fn wait_ready(&mut self, instance: Instance, from: &[InstanceState]) -> Result<()> {
        let id = instance.id.clone();
        self.wait_instance(instance, from, InstanceState::Running)
            .await?;
        let probe = ReadinessProbe::new(
            self.provider.clone(),
            self.executor.clone(),
            self.policy.clone(),
            self.remote_port,
        );
        let host = probe.wait_until_ready(&id, &self.role.ssh_user).await?;
        self.host_name = Some(host);
        tracing::info!(instance_id = %id, role = %self.absolute_role_name(), "machine ready");
        Ok(())
    }

    async fn wait_instance(
        &self,
        instance: Instance,
        from: &[InstanceState],
        to: InstanceState,
    ) -> Result<Instance> {
        let id = instance.id.clone();
        let provider = self.provider.clone();
        let refetch_id = id.clone();
        wait_for_transition(
            &self.policy,
            &id,
            instance,
            from,
            to,
            |i: &Instance| i.state,
            move || {
                let provider = provider.clone();
                let id = refetch_id.clone();
                async move { provider.describe_instance(&id).await }
            },
        )
        .await
    }
}
