pub use crate::accessor::{name_is_valid, AccessorSpec, AtomicAccessor, CompositeAccessor, IntoAccessorSpec};
pub use crate::config::HostConfig;
pub use crate::director::CallbackId;
pub use crate::error::{Result, RuntimeError};
pub use crate::event::Event;
pub use crate::host::{EventListener, Host, HostState, ListenerId};
pub use crate::hypervisor::{HostHypervisor, HostId};
pub use crate::reaction::ReactionContext;
pub use crate::utils::CancelToken;
