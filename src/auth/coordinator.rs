// Single-flight credential refresh

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use super::queue::{PendingOperation, PendingQueue, RefreshOutcome};
use super::refresh::RefreshBackend;
use super::types::{Credential, Grant, RefreshState};
use crate::error::AuthError;
use crate::session::SessionStore;

/// Credential refresh coordinator
///
/// Guarantees that concurrent callers needing a fresh credential trigger at
/// most one refresh, and that every caller observes that refresh's outcome.
///
/// ```text
///   Idle ──(caller needs a refresh; becomes owner)──▶ Refreshing
///   Refreshing ──(owner's refresh settles)──────────▶ Idle
/// ```
///
/// Callers arriving while `Refreshing` are queued and settled with the owner's
/// outcome. The refresh itself runs on its own task, so it always completes
/// even if the caller that started it is dropped.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn RefreshBackend>,
    session: Arc<dyn SessionStore>,

    /// Upper bound for one refresh (token exchange plus verification)
    refresh_timeout: Duration,

    flight: Mutex<Flight>,

    /// Number of refreshes started over the coordinator's lifetime
    refreshes: AtomicU64,
}

/// State guarded by the coordinator's lock.
/// Never held across an `.await`.
struct Flight {
    state: RefreshState,
    queue: PendingQueue,

    /// Bumped on sign-out so a refresh started before it cannot sign back in
    generation: u64,
}

/// What a caller needs from the coordinator
#[derive(Debug, Clone, Copy)]
enum Need<'a> {
    /// Any credential, the cached one is fine
    Present,

    /// Any credential other than this rejected token
    Replacing(&'a str),

    /// A newly issued credential
    Fresh,
}

enum Ticket {
    Ready(Credential),
    Wait(oneshot::Receiver<RefreshOutcome>),
}

impl RefreshCoordinator {
    pub fn new(
        backend: Arc<dyn RefreshBackend>,
        session: Arc<dyn SessionStore>,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                session,
                refresh_timeout,
                flight: Mutex::new(Flight {
                    state: RefreshState::Idle,
                    queue: PendingQueue::new(),
                    generation: 0,
                }),
                refreshes: AtomicU64::new(0),
            }),
        }
    }

    /// Current state of the refresh state machine
    pub fn state(&self) -> RefreshState {
        self.inner.flight.lock().state
    }

    /// Number of callers waiting on the in-flight refresh
    pub fn pending(&self) -> usize {
        self.inner.flight.lock().queue.len()
    }

    /// Number of refreshes started so far
    pub fn refreshes_started(&self) -> u64 {
        self.inner.refreshes.load(Ordering::Relaxed)
    }

    pub fn session(&self) -> &Arc<dyn SessionStore> {
        &self.inner.session
    }

    /// Return the cached credential, or obtain one through the refresh cookie.
    /// Joins the in-flight refresh if there is one.
    pub async fn ensure_fresh_credential(&self) -> Result<Credential, AuthError> {
        self.acquire(Need::Present, Grant::Cookie).await
    }

    /// Obtain a credential to replace one the server just rejected.
    ///
    /// If the session already holds a different credential, another flow has
    /// refreshed in the meantime and that credential is returned as is.
    pub async fn renew_rejected(&self, rejected: &Credential) -> Result<Credential, AuthError> {
        self.acquire(Need::Replacing(&rejected.access_token), Grant::Cookie)
            .await
    }

    /// Refresh through the refresh cookie, ignoring any cached credential
    pub async fn force_refresh(&self) -> Result<Credential, AuthError> {
        self.acquire(Need::Fresh, Grant::Cookie).await
    }

    /// Refresh with an explicitly supplied refresh token
    pub async fn force_refresh_with(
        &self,
        refresh_token: impl Into<String>,
    ) -> Result<Credential, AuthError> {
        self.acquire(Need::Fresh, Grant::RefreshToken(refresh_token.into()))
            .await
    }

    /// Adopt a bearer token produced by a sign-in flow.
    /// The token is verified and its identity written to the session.
    pub async fn sign_in(&self, access_token: impl Into<String>) -> Result<Credential, AuthError> {
        self.acquire(Need::Fresh, Grant::AccessToken(access_token.into()))
            .await
    }

    /// Clear the session and abandon any refresh in flight.
    ///
    /// Its waiters are rejected with [`AuthError::SignedOut`] and the state
    /// returns to `Idle`, so the next caller starts a new refresh. The abandoned
    /// refresh still runs to completion but its outcome is discarded.
    pub fn sign_out(&self) {
        let mut waiters = {
            let mut flight = self.inner.flight.lock();
            flight.generation += 1;
            flight.state = RefreshState::Idle;
            self.inner.session.clear();
            flight.queue.take()
        };

        tracing::info!(abandoned = waiters.len(), "Signed out");
        waiters.drain_reject(&AuthError::SignedOut);
    }

    async fn acquire(&self, need: Need<'_>, grant: Grant) -> Result<Credential, AuthError> {
        match self.begin(need, grant) {
            Ticket::Ready(credential) => Ok(credential),
            Ticket::Wait(rx) => rx.await.unwrap_or(Err(AuthError::Interrupted)),
        }
    }

    /// Decide, in one step under the lock, whether the caller can use the
    /// cached credential, must wait on the in-flight refresh, or owns a new one.
    fn begin(&self, need: Need<'_>, grant: Grant) -> Ticket {
        let mut flight = self.inner.flight.lock();

        if flight.state == RefreshState::Refreshing {
            let (operation, rx) = PendingOperation::new();
            flight.queue.enqueue(operation);
            tracing::debug!(
                waiting = flight.queue.len(),
                "Refresh in flight, waiting for its outcome"
            );
            return Ticket::Wait(rx);
        }

        if let Some(cached) = self.inner.session.read() {
            let usable = match need {
                Need::Present => true,
                Need::Replacing(rejected) => cached.access_token != rejected,
                Need::Fresh => false,
            };
            if usable {
                return Ticket::Ready(cached);
            }
        }

        flight.state = RefreshState::Refreshing;
        let (operation, rx) = PendingOperation::new();
        flight.queue.enqueue(operation);
        let generation = flight.generation;
        drop(flight);

        self.inner.refreshes.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Inner::run_refresh(inner, grant, generation).await;
        });

        Ticket::Wait(rx)
    }
}

impl Inner {
    async fn run_refresh(inner: Arc<Inner>, grant: Grant, generation: u64) {
        let guard = SettleGuard {
            inner: Arc::clone(&inner),
            generation,
            settled: false,
        };

        tracing::info!(grant = grant.kind(), "Refreshing access token...");
        let started = Instant::now();

        let outcome = match tokio::time::timeout(inner.refresh_timeout, inner.obtain(&grant)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(AuthError::Timeout(inner.refresh_timeout)),
        };

        match &outcome {
            Ok(credential) => tracing::info!(
                uid = %credential.identity.uid,
                token = %credential.redacted(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Access token refreshed"
            ),
            Err(e) => tracing::warn!(
                error = %e,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Token refresh failed"
            ),
        }

        guard.settle(outcome);
    }

    /// Obtain a bearer token for the grant and resolve its identity
    async fn obtain(&self, grant: &Grant) -> Result<Credential, AuthError> {
        let access_token = match grant {
            Grant::Cookie => self.backend.refresh(None).await?,
            Grant::RefreshToken(token) => self.backend.refresh(Some(token)).await?,
            Grant::AccessToken(token) => token.clone(),
        };

        let identity = self.backend.verify(&access_token).await?;
        Ok(Credential::new(access_token, identity))
    }

    /// Publish the outcome, return to `Idle` and settle every waiter
    fn settle(&self, generation: u64, outcome: RefreshOutcome) {
        let mut waiters = {
            let mut flight = self.flight.lock();

            // Signed out since this refresh started; state and queue belong
            // to whatever flight came after
            if flight.generation != generation {
                drop(flight);
                tracing::debug!("Discarding outcome of refresh abandoned by sign-out");
                return;
            }

            match &outcome {
                Ok(credential) => self.session.write(credential.clone()),
                Err(_) => self.session.clear(),
            }

            flight.state = RefreshState::Idle;
            flight.queue.take()
        };

        tracing::debug!(waiters = waiters.len(), "Settling refresh waiters");

        match outcome {
            Ok(credential) => waiters.drain_resolve(&credential),
            Err(error) => waiters.drain_reject(&error),
        }
    }
}

/// Settles the queue if the refresh task ends without doing so
struct SettleGuard {
    inner: Arc<Inner>,
    generation: u64,
    settled: bool,
}

impl SettleGuard {
    fn settle(mut self, outcome: RefreshOutcome) {
        self.settled = true;
        self.inner.settle(self.generation, outcome);
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        if !self.settled {
            tracing::error!("Refresh task ended without settling");
            self.inner
                .settle(self.generation, Err(AuthError::Interrupted));
        }
    }
}
