// Romantic API client - authenticated request pipeline

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod session;

pub use auth::{Credential, Identity, RefreshCoordinator, RefreshState};
pub use error::{ApiError, AuthError, Fault};
pub use http_client::{AuthenticatedClient, RequestAttempt};
pub use session::{MemorySessionStore, SessionStore};
