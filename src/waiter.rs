//! The generic state-transition waiter.
//!
//! Every lifecycle wait in the crate goes through `wait_for_transition`:
//! instances to running/stopped/terminated, volumes to available/in-use,
//! images to available. One polling discipline, one failure mode.

use std::fmt::Display;
use std::future::Future;

use crate::config::PollPolicy;
use crate::error::{Error, Result};

/// Block until `resource` leaves every state in `from_states` and lands in
/// `to_state`, re-fetching at the policy interval.
///
/// A resource already in `to_state` returns immediately. A resource observed
/// in any state outside `from_states` that is not `to_state` fails with
/// `UnexpectedState` on that first observation — an unplanned state (say, an
/// instance that failed to launch) must not be waited on indefinitely.
///
/// Refetch errors propagate as-is; transient-fault retry is the provider
/// client's concern, not the waiter's.
pub async fn wait_for_transition<R, S, Fetch, Fut>(
    policy: &PollPolicy,
    label: &str,
    mut resource: R,
    from_states: &[S],
    to_state: S,
    state_of: impl Fn(&R) -> S,
    mut refetch: Fetch,
) -> Result<R>
where
    S: Copy + PartialEq + Display,
    Fetch: FnMut() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let mut state = state_of(&resource);
    while from_states.contains(&state) {
        tracing::debug!(resource = %label, state = %state, "waiting for transition");
        tokio::time::sleep(policy.interval).await;
        resource = refetch().await?;
        state = state_of(&resource);
    }
    if state != to_state {
        return Err(Error::UnexpectedState {
            resource: label.to_string(),
            expected: to_state.to_string(),
            actual: state.to_string(),
        });
    }
    tracing::debug!(resource = %label, state = %state, "transition complete");
    Ok(resource)
}
