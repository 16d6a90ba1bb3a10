#![forbid(unsafe_code)]

//! Integration errors that stop a program.
//!
//! Data errors (a decoder rejecting a payload, an HTTP request failing) are
//! ordinary values delivered to the application. The variants here mean the
//! program itself was wired incorrectly; the runtime records the first one
//! and refuses further work.

use vela_json::DecodeError;
use vela_vdom::{DispatchError, MountError};

/// A fatal runtime error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    /// Two effect managers claimed the same home name.
    #[error("effect manager `{home}` is registered twice")]
    DuplicateManager { home: String },

    /// An effect was addressed to a home no manager owns.
    #[error("no effect manager is registered for `{home}`")]
    UnknownManager { home: String },

    /// The initial view could not be mounted.
    #[error("cannot mount program: {0}")]
    MountTarget(#[from] MountError),

    /// A handler or tagger produced a message of the wrong type.
    #[error("handler for `{event}` produced a message of an unexpected type")]
    HandlerTypeMismatch { event: String },

    /// The configured flags did not decode.
    #[error("program flags are invalid: {0}")]
    InvalidFlags(DecodeError),

    /// A value was sent to a port that does not exist.
    #[error("no incoming port named `{name}`")]
    UnknownPort { name: String },

    /// The program was stopped.
    #[error("program is stopped")]
    Stopped,
}

impl From<DispatchError> for RuntimeError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::HandlerTypeMismatch { event } => Self::HandlerTypeMismatch { event },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_vdom::NodeId;

    #[test]
    fn messages_name_the_culprit() {
        let err = RuntimeError::DuplicateManager { home: "Time".into() };
        assert_eq!(err.to_string(), "effect manager `Time` is registered twice");
        let err = RuntimeError::UnknownPort { name: "alerts".into() };
        assert!(err.to_string().contains("alerts"));
    }

    #[test]
    fn wraps_vdom_errors() {
        let err: RuntimeError = MountError::NotAnElement(NodeId::from_raw(3)).into();
        assert!(matches!(err, RuntimeError::MountTarget(_)));
        let err: RuntimeError = DispatchError::HandlerTypeMismatch {
            event: "click".into(),
        }
        .into();
        assert_eq!(
            err,
            RuntimeError::HandlerTypeMismatch {
                event: "click".into()
            }
        );
    }
}
