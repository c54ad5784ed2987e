// Session state shared between the request pipeline and the rest of the app

use std::sync::Arc;
use tokio::sync::watch;

use crate::auth::Credential;

/// The narrow contract the request pipeline needs from the session container.
///
/// Writes replace the credential wholesale; a reader never observes a partially
/// written value.
pub trait SessionStore: Send + Sync {
    /// Current credential, if signed in
    fn read(&self) -> Option<Credential>;

    /// Replace the current credential
    fn write(&self, credential: Credential);

    /// Drop the current credential (signed out)
    fn clear(&self);
}

/// In-memory session store
///
/// Backed by a watch channel so observers can follow sign-in and sign-out
/// transitions through [`MemorySessionStore::subscribe`].
#[derive(Debug, Clone)]
pub struct MemorySessionStore {
    tx: Arc<watch::Sender<Option<Credential>>>,
}

impl MemorySessionStore {
    /// Create an empty (signed out) store
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Create a store that starts signed in
    pub fn with_credential(credential: Credential) -> Self {
        let (tx, _rx) = watch::channel(Some(credential));
        Self { tx: Arc::new(tx) }
    }

    /// Subscribe to credential changes
    pub fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for MemorySessionStore {
    fn read(&self) -> Option<Credential> {
        self.tx.borrow().clone()
    }

    fn write(&self, credential: Credential) {
        tracing::debug!(uid = %credential.identity.uid, "Session credential updated");
        self.tx.send_replace(Some(credential));
    }

    fn clear(&self) {
        tracing::debug!("Session credential cleared");
        self.tx.send_replace(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;

    fn credential(token: &str) -> Credential {
        Credential::new(
            token.to_string(),
            Identity {
                uid: "u-1".to_string(),
                name: "Hana".to_string(),
                role: vec!["core:user".to_string()],
                profile_picture: String::new(),
            },
        )
    }

    #[test]
    fn test_read_write_clear() {
        let store = MemorySessionStore::new();
        assert!(store.read().is_none());

        store.write(credential("T1"));
        assert_eq!(store.read().unwrap().access_token, "T1");

        store.write(credential("T2"));
        assert_eq!(store.read().unwrap().access_token, "T2");

        store.clear();
        assert!(store.read().is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let store = MemorySessionStore::with_credential(credential("T1"));
        let other = store.clone();
        other.clear();
        assert!(store.read().is_none());
    }

    #[tokio::test]
    async fn test_subscribers_observe_changes() {
        let store = MemorySessionStore::new();
        let mut rx = store.subscribe();

        store.write(credential("T2"));
        rx.changed().await.unwrap();
        assert_eq!(
            rx.borrow_and_update().as_ref().map(|c| c.access_token.clone()),
            Some("T2".to_string())
        );

        store.clear();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_none());
    }
}
