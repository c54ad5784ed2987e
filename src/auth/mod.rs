// Authentication module
// Manages the credential lifecycle: refresh, verification and single-flight coordination

mod coordinator;
mod queue;
mod refresh;
mod types;

pub use coordinator::RefreshCoordinator;
pub use queue::{PendingOperation, PendingQueue, RefreshOutcome};
pub use refresh::{HttpRefreshBackend, RefreshBackend, REFRESH_TOKEN_HEADER};
pub use types::{Credential, Grant, Identity, RefreshState};

pub(crate) use refresh::error_message;
pub(crate) use types::redact;

#[cfg(test)]
pub(crate) use coordinator::tests as test_support;
