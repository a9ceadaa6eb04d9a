//! Reentrancy guard for remote-execution contexts.
//!
//! Provisioning steps run inside `with_remote_context` so that logic
//! invoked directly and logic invoked through a machine share one execution
//! path. Nesting such contexts is a programming error and fails loudly. The
//! marker is task-local, so concurrent provisioning of several machines on
//! separate tasks never interferes.

use std::future::Future;

use crate::error::{Error, Result};

tokio::task_local! {
    static IN_REMOTE_CONTEXT: ();
}

/// True while the current task is inside a remote-execution context.
pub fn in_remote_context() -> bool {
    IN_REMOTE_CONTEXT.try_with(|_| ()).is_ok()
}

/// Run `f` inside a remote-execution context scoped to this task.
///
/// Returns `Precondition` if the task is already inside one — never
/// deadlocks, never silently re-enters.
pub async fn with_remote_context<F, T>(f: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if in_remote_context() {
        return Err(Error::Precondition(
            "already inside a remote execution context".into(),
        ));
    }
    IN_REMOTE_CONTEXT.scope((), f).await
}

/// A unit of remote work, resolved to a concrete command before execution.
///
/// `Direct` is a command known up front; `BoundTo` produces one from the
/// machine it will run against (e.g. commands that embed the host name or
/// role). The distinction is explicit — no runtime callable-or-not probing.
pub enum RemoteTask<C> {
    Direct(String),
    BoundTo(Box<dyn Fn(&C) -> String + Send + Sync>),
}

impl<C> RemoteTask<C> {
    pub fn direct(command: impl Into<String>) -> Self {
        RemoteTask::Direct(command.into())
    }

    pub fn bound(f: impl Fn(&C) -> String + Send + Sync + 'static) -> Self {
        RemoteTask::BoundTo(Box::new(f))
    }

    /// Produce the command to run against `ctx`.
    pub fn resolve(&self, ctx: &C) -> String {
        match self {
            RemoteTask::Direct(cmd) => cmd.clone(),
            RemoteTask::BoundTo(f) => f(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_context_runs_and_clears() {
        assert!(!in_remote_context());
        let out = with_remote_context(async {
            assert!(in_remote_context());
            Ok(42)
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert!(!in_remote_context());
    }

    #[tokio::test]
    async fn nesting_fails_loudly() {
        let err = with_remote_context(async {
            with_remote_context(async { Ok(()) }).await
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[tokio::test]
    async fn sequential_contexts_are_fine() {
        with_remote_context(async { Ok(()) }).await.unwrap();
        with_remote_context(async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_tasks_do_not_interfere() {
        let a = tokio::spawn(with_remote_context(async {
            tokio::task::yield_now().await;
            assert!(in_remote_context());
            Ok(1)
        }));
        let b = tokio::spawn(with_remote_context(async {
            tokio::task::yield_now().await;
            assert!(in_remote_context());
            Ok(2)
        }));
        assert_eq!(a.await.unwrap().unwrap(), 1);
        assert_eq!(b.await.unwrap().unwrap(), 2);
    }

    #[test]
    fn tasks_resolve_explicitly() {
        struct Ctx {
            host: String,
        }
        let direct: RemoteTask<Ctx> = RemoteTask::direct("echo hi");
        let bound: RemoteTask<Ctx> =
            RemoteTask::bound(|c: &Ctx| format!("ping -c1 {}", c.host));
        let ctx = Ctx {
            host: "host-1".into(),
        };
        assert_eq!(direct.resolve(&ctx), "echo hi");
        assert_eq!(bound.resolve(&ctx), "ping -c1 host-1");
    }
}
