use std::{error::Error as StdError, fmt};

/// Failures surfaced by the runtime.
///
/// Naming, structural, and lifecycle errors are returned synchronously from
/// the call that caused them. Handler errors are raised out of the director's
/// execution loop, reported to event listeners, and leave the host corrupted
/// until it settles back into `Paused`.
#[derive(Debug)]
pub enum RuntimeError {
    /// Invalid or colliding name at an add site.
    Name { name: String },
    /// Invalid model structure: unknown port or child, double connection,
    /// a port added to a host, and similar.
    Structure(String),
    /// Directed cycle in the pruned port dependency graph.
    CausalityLoop { port: String },
    /// Operation not allowed in the host's current lifecycle state.
    Lifecycle {
        operation: &'static str,
        state: &'static str,
    },
    /// A user input handler, hook, or scheduled callback failed.
    Handler {
        accessor: String,
        source: anyhow::Error,
    },
    /// Output sent before the owning accessor finished initializing.
    NotInitialized { accessor: String },
    /// The wall clock could not be read.
    Clock(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    pub(crate) fn structure(message: impl Into<String>) -> Self {
        RuntimeError::Structure(message.into())
    }

    pub(crate) fn handler(accessor: impl Into<String>, source: anyhow::Error) -> Self {
        RuntimeError::Handler {
            accessor: accessor.into(),
            source,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Name { name } => {
                write!(
                    f,
                    "name '{name}' is invalid or already taken; names cannot be empty or contain periods or whitespace"
                )
            }
            RuntimeError::Structure(message) => write!(f, "{message}"),
            RuntimeError::CausalityLoop { port } => {
                write!(f, "detected causality loop involving port '{port}'")
            }
            RuntimeError::Lifecycle { operation, state } => {
                write!(f, "cannot {operation} while host is in state '{state}'")
            }
            RuntimeError::Handler { accessor, source } => {
                write!(f, "handler on accessor '{accessor}' failed: {source}")
            }
            RuntimeError::NotInitialized { accessor } => {
                write!(
                    f,
                    "accessor '{accessor}' cannot send outputs before it is initialized"
                )
            }
            RuntimeError::Clock(message) => write!(f, "wall clock read failed: {message}"),
        }
    }
}

impl StdError for RuntimeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            RuntimeError::Handler { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}
