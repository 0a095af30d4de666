use serde::{Deserialize, Serialize};

/// Host construction knobs. The lifecycle itself is fixed; the config only
/// carries the model name and the sleep bound for cancellable waits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Host name; must satisfy the model naming rules.
    pub name: String,

    /// Upper bound on a single cancellable sleep in milliseconds
    /// (`None` = 1 hour). Long delays are waited out in chunks of this size
    /// so cancellation stays prompt even for very distant callbacks.
    pub sleep_chunk_ms: Option<u64>,
}

impl HostConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sleep_chunk_ms: None,
        }
    }
}
