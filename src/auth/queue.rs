// Callers suspended on an in-flight refresh

use tokio::sync::oneshot;

use super::types::Credential;
use crate::error::AuthError;

/// Outcome delivered to every caller waiting on one refresh
pub type RefreshOutcome = Result<Credential, AuthError>;

/// One suspended caller.
///
/// `succeed` and `fail` consume the operation, so it is settled at most once.
#[derive(Debug)]
pub struct PendingOperation {
    tx: oneshot::Sender<RefreshOutcome>,
}

impl PendingOperation {
    /// Create an operation and the receiver its caller waits on
    pub fn new() -> (Self, oneshot::Receiver<RefreshOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn succeed(self, credential: Credential) {
        self.settle(Ok(credential));
    }

    pub fn fail(self, error: AuthError) {
        self.settle(Err(error));
    }

    fn settle(self, outcome: RefreshOutcome) {
        // The caller may have been dropped while waiting
        if self.tx.send(outcome).is_err() {
            tracing::trace!("Waiter gone before refresh settled");
        }
    }
}

/// Ordered holding area for callers waiting on a refresh
#[derive(Debug, Default)]
pub struct PendingQueue {
    operations: Vec<PendingOperation>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, operation: PendingOperation) {
        self.operations.push(operation);
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Move every entry out, leaving this queue empty.
    /// Lets the owner settle waiters after releasing its lock.
    pub fn take(&mut self) -> PendingQueue {
        std::mem::take(self)
    }

    /// Resolve every entry, in enqueue order, with the same credential
    pub fn drain_resolve(&mut self, credential: &Credential) {
        for operation in self.operations.drain(..) {
            operation.succeed(credential.clone());
        }
    }

    /// Reject every entry, in enqueue order, with the same error
    pub fn drain_reject(&mut self, error: &AuthError) {
        for operation in self.operations.drain(..) {
            operation.fail(error.clone());
        }
    }
}
