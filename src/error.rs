use std::io;

/// Errors from lifecycle operations.
///
/// The taxonomy is deliberately flat: every failure a caller can react to
/// differently gets its own variant. Nothing here is retried internally
/// except where a specific loop documents otherwise (the image-visibility
/// delay swallows `NotFound`, the readiness probe retries anything that is
/// not fatal).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An operation was called in a state it does not accept, e.g. `create`
    /// on a machine that is already bound to an instance.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A resource left its anticipated transient states and landed somewhere
    /// other than the expected target. Fatal, never retried.
    #[error("expected state of {resource} to be '{expected}' but got '{actual}'")]
    UnexpectedState {
        resource: String,
        expected: String,
        actual: String,
    },

    /// More than one candidate matched a lookup that needs exactly one,
    /// e.g. adopt without an ordinal, or a duplicated volume name.
    #[error("ambiguous lookup: {count} matches for '{name}'")]
    Ambiguity { name: String, count: usize },

    /// A required lookup matched nothing. Also the distinct "not visible
    /// yet" signal from describe/list provider calls.
    #[error("not found: {0}")]
    NotFound(String),

    /// A named volume exists but is unusable where it is (wrong zone or not
    /// available). Never silently relocated.
    #[error("placement: {0}")]
    Placement(String),

    /// The provider reported success but a follow-up verification failed.
    #[error("postcondition failed: {0}")]
    Postcondition(String),

    /// Any other control-plane failure.
    #[error("provider error: {0}")]
    Provider(String),

    /// A remote command channel failure (session, command, or transfer).
    #[error("remote execution failed: {0}")]
    Remote(String),

    /// External cancellation. Must propagate through every retry loop.
    #[error("interrupted")]
    Interrupted,

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),
}

impl Error {
    /// True for errors the readiness probe must never swallow.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Interrupted)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unexpected_state_displays_all_parts() {
        let err = Error::UnexpectedState {
            resource: "i-123".into(),
            expected: "running".into(),
            actual: "terminated".into(),
        };
        assert_eq!(
            err.to_string(),
            "expected state of i-123 to be 'running' but got 'terminated'"
        );
    }

    #[test]
    fn ambiguity_displays_name_and_count() {
        let err = Error::Ambiguity {
            name: "dev-cluster-leader".into(),
            count: 3,
        };
        assert!(err.to_string().contains("dev-cluster-leader"));
        assert!(err.to_string().contains("3 matches"));
    }

    #[test]
    fn interrupted_is_fatal_everything_else_is_not() {
        assert!(Error::Interrupted.is_fatal());
        assert!(!Error::Remote("connection reset".into()).is_fatal());
        assert!(!Error::NotFound("vol-1".into()).is_fatal());
        assert!(!Error::Provider("throttled".into()).is_fatal());
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
