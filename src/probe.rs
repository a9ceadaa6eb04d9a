//! End-to-end readiness probing.
//!
//! "Running" according to the control plane means very little: the probe
//! only reports ready once the instance has a public host, the remote-shell
//! port accepts TCP connections, and a command round-trip over the remote
//! channel returns the expected bytes. The port can be open well before the
//! command subsystem finishes initializing, which is why the last two stages
//! are separate.

use std::sync::Arc;

use crate::config::PollPolicy;
use crate::error::{Error, Result};
use crate::provider::CloudProvider;
use crate::remote::RemoteExecutor;

/// No-op command whose output proves the channel works.
const LIVENESS_COMMAND: &str = "echo hi";
const LIVENESS_EXPECTED: &str = "hi\n";

pub struct ReadinessProbe {
    provider: Arc<dyn CloudProvider>,
    executor: Arc<dyn RemoteExecutor>,
    policy: PollPolicy,
    port: u16,
}

impl ReadinessProbe {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        executor: Arc<dyn RemoteExecutor>,
        policy: PollPolicy,
        port: u16,
    ) -> Self {
        Self {
            provider,
            executor,
            policy,
            port,
        }
    }

    /// Block until the instance is truly reachable; returns the public host.
    ///
    /// Unbounded unless `remote_attempt_limit` is configured — provisioning
    /// may legitimately take a long time, and the operator cancels
    /// externally if it takes too long.
    pub async fn wait_until_ready(&self, instance_id: &str, user: &str) -> Result<String> {
        let host = self.wait_for_host(instance_id).await?;
        tracing::info!(instance_id = %instance_id, host = %host, "hostname assigned");
        self.wait_port_open(&host).await?;
        tracing::info!(host = %host, port = self.port, "remote port open");
        self.wait_remote_ready(&host, user).await?;
        tracing::info!(host = %host, user = %user, "remote channel verified");
        Ok(host)
    }

    /// Stage 1: poll until the provider assigns a public host.
    async fn wait_for_host(&self, instance_id: &str) -> Result<String> {
        loop {
            let instance = self.provider.describe_instance(instance_id).await?;
            match instance.public_host {
                Some(host) if !host.is_empty() => return Ok(host),
                _ => {
                    tracing::debug!(instance_id = %instance_id, "waiting for hostname");
                    tokio::time::sleep(self.policy.interval).await;
                }
            }
        }
    }

    /// Stage 2: retry TCP connects until one succeeds. The connect timeout
    /// equals the polling interval; the socket is dropped on every path.
    pub(crate) async fn wait_port_open(&self, host: &str) -> Result<()> {
        loop {
            match tokio::time::timeout(
                self.policy.interval,
                tokio::net::TcpStream::connect((host, self.port)),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    drop(stream);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    tracing::debug!(host = %host, port = self.port, error = %e, "port not reachable yet");
                }
                Err(_) => {
                    tracing::debug!(host = %host, port = self.port, "connect timed out");
                }
            }
            tokio::time::sleep(self.policy.interval).await;
        }
    }

    /// Stage 3: verify a command round-trip. Anything non-fatal is logged
    /// and retried; the session is closed on every path.
    pub(crate) async fn wait_remote_ready(&self, host: &str, user: &str) -> Result<()> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.liveness_round_trip(host, user).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(host = %host, attempt = attempts, error = %e, "remote channel not ready");
                    if let Some(limit) = self.policy.remote_attempt_limit {
                        if attempts >= limit {
                            return Err(Error::Remote(format!(
                                "remote channel not ready after {attempts} attempts: {e}"
                            )));
                        }
                    }
                    tokio::time::sleep(self.policy.interval).await;
                }
            }
        }
    }

    async fn liveness_round_trip(&self, host: &str, user: &str) -> Result<()> {
        let mut session = self.executor.open_session(host, user).await?;
        let outcome = session.run(LIVENESS_COMMAND).await;
        session.close().await;
        let output = outcome?;
        if output.stdout == LIVENESS_EXPECTED {
            Ok(())
        } else {
            Err(Error::Remote(format!(
                "liveness command returned {:?}, expected {:?}",
                output.stdout, LIVENESS_EXPECTED
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeProvider;
    use crate::provider::InstanceState;
    use crate::remote::{CommandOutput, RemoteSession};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    // ── Scripted executor ───────────────────────────────────────────

    #[derive(Clone, Copy)]
    enum Step {
        OpenFails,
        WrongOutput,
        Interrupted,
        Ok,
    }

    struct ScriptedExecutor {
        script: Mutex<VecDeque<Step>>,
        opens: AtomicU32,
        closes: Arc<AtomicU32>,
    }

    impl ScriptedExecutor {
        fn new(steps: &[Step]) -> Self {
            Self {
                script: Mutex::new(steps.iter().copied().collect()),
                opens: AtomicU32::new(0),
                closes: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    struct ScriptedSession {
        step: Step,
        closes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl RemoteExecutor for ScriptedExecutor {
        async fn open_session(
            &self,
            _host: &str,
            _user: &str,
        ) -> Result<Box<dyn RemoteSession>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("script exhausted");
            if matches!(step, Step::OpenFails) {
                return Err(Error::Remote("connection reset".into()));
            }
            Ok(Box::new(ScriptedSession {
                step,
                closes: self.closes.clone(),
            }))
        }
    }

    #[async_trait]
    impl RemoteSession for ScriptedSession {
        async fn run(&mut self, _command: &str) -> Result<CommandOutput> {
            match self.step {
                Step::Ok => Ok(CommandOutput {
                    exit_code: Some(0),
                    stdout: "hi\n".into(),
                    stderr: String::new(),
                }),
                Step::WrongOutput => Ok(CommandOutput {
                    exit_code: Some(0),
                    stdout: "bash: warming up\n".into(),
                    stderr: String::new(),
                }),
                Step::Interrupted => Err(Error::Interrupted),
                Step::OpenFails => unreachable!(),
            }
        }

        async fn put_file(&mut self, _local: &std::path::Path, _remote: &str) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn probe_with(executor: ScriptedExecutor, limit: Option<u32>) -> ReadinessProbe {
        let mut policy = PollPolicy::fast();
        policy.remote_attempt_limit = limit;
        ReadinessProbe::new(
            Arc::new(FakeProvider::new()),
            Arc::new(executor),
            policy,
            22,
        )
    }

    // ── Stage 1: hostname ───────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn hostname_stage_polls_until_assigned() {
        let provider = Arc::new(FakeProvider::new());
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let id = provider.seed_instance("dev-worker", InstanceState::Running, t0);
        provider.delay_host_assignment(&id, 2);

        let probe = ReadinessProbe::new(
            provider.clone(),
            Arc::new(ScriptedExecutor::new(&[])),
            PollPolicy::fast(),
            22,
        );
        let host = probe.wait_for_host(&id).await.unwrap();
        assert!(host.ends_with(".cloud.example"));
        // Two delayed describes plus the one that saw the host.
        assert_eq!(provider.counts().describe_instance, 3);
    }

    // ── Stage 2: TCP ────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn port_stage_succeeds_against_live_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let mut probe = probe_with(ScriptedExecutor::new(&[]), None);
        probe.port = port;
        probe.wait_port_open("127.0.0.1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn port_stage_retries_until_listener_appears() {
        // Reserve an address, free it, and bring the listener up later.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let interval = Duration::from_millis(10);
        tokio::spawn(async move {
            tokio::time::sleep(interval * 5).await;
            let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
            loop {
                let _ = listener.accept().await;
            }
        });

        let mut probe = probe_with(ScriptedExecutor::new(&[]), None);
        probe.port = addr.port();
        probe.wait_port_open("127.0.0.1").await.unwrap();
    }

    // ── Stage 3: remote round-trip ──────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn remote_stage_retries_transient_failures_then_succeeds() {
        let executor = ScriptedExecutor::new(&[
            Step::OpenFails,
            Step::WrongOutput,
            Step::WrongOutput,
            Step::Ok,
        ]);
        let closes = executor.closes.clone();
        let probe = probe_with(executor, None);
        probe.wait_remote_ready("h", "admin").await.unwrap();
        // Every opened session was closed: 3 opens succeeded (2 wrong + 1 ok).
        assert_eq!(closes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_stage_propagates_interrupt_immediately() {
        let executor = ScriptedExecutor::new(&[Step::Interrupted, Step::Ok]);
        let closes = executor.closes.clone();
        let probe = probe_with(executor, None);
        let err = probe.wait_remote_ready("h", "admin").await.unwrap_err();
        assert!(matches!(err, Error::Interrupted));
        // The interrupted session was still closed.
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_stage_honors_attempt_limit() {
        let executor = ScriptedExecutor::new(&[
            Step::WrongOutput,
            Step::WrongOutput,
            Step::WrongOutput,
            Step::Ok,
        ]);
        let probe = probe_with(executor, Some(3));
        let err = probe.wait_remote_ready("h", "admin").await.unwrap_err();
        match err {
            Error::Remote(msg) => assert!(msg.contains("3 attempts")),
            other => panic!("expected Remote, got {other}"),
        }
    }
}
