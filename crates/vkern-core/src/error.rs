#![forbid(unsafe_code)]

//! Error types for context binding, session lifecycle, and the registry.
//!
//! Misuse errors describe programming bugs (unbalanced scopes, touching a
//! closed session). They are routed through [`report_misuse`], which applies
//! the active [`MisusePolicy`]: panic loudly in development, log and recover
//! in production.

use std::fmt;

use crate::config::{self, MisusePolicy};
use crate::session::SessionId;

/// A programming error in how contexts or session state are used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextMisuseError {
    /// `exit` was called with a token that is not the top of this thread's stack.
    UnbalancedExit {
        /// Stack depth recorded by the token.
        expected_depth: usize,
        /// Stack depth actually observed at exit.
        actual_depth: usize,
    },
    /// Entering would exceed the configured nesting bound.
    DepthExceeded {
        /// Configured maximum depth.
        limit: usize,
        /// Session that was being entered (`None` = process-wide scope).
        session: Option<SessionId>,
    },
    /// A registry, slot, or handle of a closed session was accessed.
    SessionClosed {
        /// The closed session.
        session: SessionId,
        /// Operation that was attempted.
        operation: &'static str,
    },
    /// A named registry was requested with a different key/value type than
    /// the one it was created with.
    RegistryTypeMismatch {
        /// Registry name.
        name: String,
    },
    /// A store was written from inside its own update closure.
    ReentrantWrite {
        /// Label of the store's storage backend.
        store: String,
    },
    /// A value captured in one scope was used from a different scope.
    CapturedAcrossSessions {
        /// Scope the value was captured in.
        origin: Option<SessionId>,
        /// Scope that attempted the access.
        current: Option<SessionId>,
    },
}

fn scope_label(session: &Option<SessionId>) -> String {
    match session {
        Some(id) => format!("session {id}"),
        None => "the process-wide scope".to_string(),
    }
}

impl fmt::Display for ContextMisuseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnbalancedExit {
                expected_depth,
                actual_depth,
            } => write!(
                f,
                "context exit does not match the innermost enter \
                 (token depth {expected_depth}, stack depth {actual_depth})"
            ),
            Self::DepthExceeded { limit, session } => write!(
                f,
                "entering {} would exceed the context nesting limit of {limit}",
                scope_label(session)
            ),
            Self::SessionClosed { session, operation } => {
                write!(f, "{operation} on closed session {session}")
            }
            Self::RegistryTypeMismatch { name } => {
                write!(f, "registry {name:?} was created with a different type")
            }
            Self::ReentrantWrite { store } => write!(
                f,
                "store {store} was written from inside its own update closure"
            ),
            Self::CapturedAcrossSessions { origin, current } => write!(
                f,
                "value captured in {} was accessed from {}",
                scope_label(origin),
                scope_label(current)
            ),
        }
    }
}

impl std::error::Error for ContextMisuseError {}

/// Errors surfaced by [`SessionRegistry`](crate::registry::SessionRegistry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A live (not closed) session with this id already exists.
    Collision(SessionId),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collision(id) => write!(f, "session {id} already exists and is not closed"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Error returned by [`SessionContext::send`](crate::session::SessionContext::send).
#[derive(Debug)]
pub enum SendError {
    /// No I/O handle is attached (disconnected, connecting, or closed).
    NotConnected(SessionId),
    /// The transport rejected the message.
    Io(std::io::Error),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected(id) => write!(f, "session {id} has no attached connection"),
            Self::Io(err) => write!(f, "transport error: {err}"),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::NotConnected(_) => None,
        }
    }
}

impl From<std::io::Error> for SendError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Apply the active misuse policy to `err`.
///
/// Under [`MisusePolicy::Panic`] this never returns. Under
/// [`MisusePolicy::Log`] the error is logged and handed back so the caller
/// can fall back to a no-op or the process-wide scope.
#[track_caller]
pub fn report_misuse(err: ContextMisuseError) -> ContextMisuseError {
    match config::misuse_policy() {
        MisusePolicy::Panic => panic!("context misuse: {err}"),
        MisusePolicy::Log => {
            let location = std::panic::Location::caller();
            tracing::error!(%err, %location, "context misuse (recovered)");
            err
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RunMode, with_mode};
    use tracing_test::traced_test;

    #[test]
    fn display_names_session_and_operation() {
        let err = ContextMisuseError::SessionClosed {
            session: SessionId::from("s1"),
            operation: "registry access",
        };
        assert_eq!(err.to_string(), "registry access on closed session s1");
    }

    #[test]
    fn reentrant_write_names_store() {
        let err = ContextMisuseError::ReentrantWrite {
            store: "session:cart".into(),
        };
        assert_eq!(
            err.to_string(),
            "store session:cart was written from inside its own update closure"
        );
    }

    #[test]
    fn captured_display_names_both_scopes() {
        let err = ContextMisuseError::CapturedAcrossSessions {
            origin: None,
            current: Some(SessionId::from("b")),
        };
        let msg = err.to_string();
        assert!(msg.contains("process-wide scope"));
        assert!(msg.contains("session b"));
    }

    #[test]
    fn production_mode_returns_error() {
        let err = with_mode(RunMode::Production, || {
            report_misuse(ContextMisuseError::RegistryTypeMismatch {
                name: "widgets".into(),
            })
        });
        assert!(matches!(err, ContextMisuseError::RegistryTypeMismatch { .. }));
    }

    #[test]
    #[traced_test]
    fn production_mode_logs_recovered_misuse() {
        let _ = with_mode(RunMode::Production, || {
            report_misuse(ContextMisuseError::SessionClosed {
                session: SessionId::from("s9"),
                operation: "store slot access",
            })
        });
        assert!(logs_contain("context misuse (recovered)"));
        assert!(logs_contain("closed session s9"));
    }

    #[test]
    #[should_panic(expected = "context misuse")]
    fn development_mode_panics() {
        with_mode(RunMode::Development, || {
            report_misuse(ContextMisuseError::UnbalancedExit {
                expected_depth: 2,
                actual_depth: 1,
            })
        });
    }

    #[test]
    fn send_error_exposes_io_source() {
        use std::error::Error;
        let err = SendError::from(std::io::Error::other("pipe closed"));
        assert!(err.source().is_some());
        assert!(err.to_string().contains("pipe closed"));
    }
}
