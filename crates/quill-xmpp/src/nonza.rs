//! Paired-outcome waiter for stream-level negotiation.
//!
//! Protocol negotiation steps (STARTTLS, SASL-adjacent exchanges) are
//! answered by exactly one of two recognized nonzas: a success element or
//! a failure element. The waiter installs a listener for each qualified
//! name, both feeding one single-assignment channel, so at most one
//! outcome ever fires. Listeners are installed before the triggering
//! request is sent, and deregistration happens exactly once on every
//! exit path through an RAII guard — including when sending the request
//! itself fails.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

use crate::connection::ConnectionInner;
use crate::error::Error;
use crate::stanza::{Nonza, QName};

/// Which of the two recognized outcomes a registry entry represents.
#[derive(Debug, Clone, Copy)]
pub(crate) enum NonzaRole {
    Success,
    Failure,
}

/// The resolved outcome of a paired wait.
#[derive(Debug)]
pub(crate) enum NonzaVerdict {
    Success(Nonza),
    Failure(Nonza),
}

pub(crate) type OutcomeCell = Arc<Mutex<Option<oneshot::Sender<NonzaVerdict>>>>;

/// A live-registry entry: one of the waiter's two qualified names.
///
/// Both entries of a waiter share the same outcome cell, so whichever
/// fires first consumes the sender and the other becomes a no-op.
pub(crate) struct NonzaSlot {
    role: NonzaRole,
    cell: OutcomeCell,
}

impl NonzaSlot {
    /// Resolve the wait with `nonza`. Safe to invoke more than once; only
    /// the first call delivers.
    pub(crate) fn fire(&self, nonza: Nonza) {
        let sender = self.take_sender();
        match sender {
            Some(sender) => {
                let verdict = match self.role {
                    NonzaRole::Success => NonzaVerdict::Success(nonza),
                    NonzaRole::Failure => NonzaVerdict::Failure(nonza),
                };
                // The receiver may already have given up (deadline); a
                // failed send is not an error.
                let _ = sender.send(verdict);
            }
            None => trace!(nonza = %nonza.qname(), "nonza outcome already resolved"),
        }
    }

    /// Drop the sender so a pending wait fails with `Error::Cancelled`.
    pub(crate) fn abort(&self) {
        drop(self.take_sender());
    }

    fn take_sender(&self) -> Option<oneshot::Sender<NonzaVerdict>> {
        self.cell
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// RAII registration of a success/failure listener pair.
///
/// Dropping the waiter removes both registry entries; removal is guarded
/// by cell identity so a replacement waiter registered for the same
/// qualified names is never torn down by a stale guard.
pub(crate) struct NonzaWaiter {
    connection: Arc<ConnectionInner>,
    success: QName,
    failure: QName,
    cell: OutcomeCell,
}

impl NonzaWaiter {
    /// Install listeners for both outcomes, before the caller sends the
    /// triggering request.
    ///
    /// Fails with [`Error::NonzaHandlerConflict`] if either qualified
    /// name already has a listener; a half-finished installation is
    /// rolled back.
    pub(crate) fn install(
        connection: &Arc<ConnectionInner>,
        success: QName,
        failure: QName,
    ) -> Result<(Self, oneshot::Receiver<NonzaVerdict>), Error> {
        let (sender, receiver) = oneshot::channel();
        let cell: OutcomeCell = Arc::new(Mutex::new(Some(sender)));

        let installed = connection.install_nonza_slot(
            success.clone(),
            NonzaSlot {
                role: NonzaRole::Success,
                cell: Arc::clone(&cell),
            },
        );
        if !installed {
            return Err(Error::NonzaHandlerConflict(success));
        }

        let installed = connection.install_nonza_slot(
            failure.clone(),
            NonzaSlot {
                role: NonzaRole::Failure,
                cell: Arc::clone(&cell),
            },
        );
        if !installed {
            connection.remove_nonza_slot(&success, &cell);
            return Err(Error::NonzaHandlerConflict(failure));
        }

        let waiter = Self {
            connection: Arc::clone(connection),
            success,
            failure,
            cell,
        };
        Ok((waiter, receiver))
    }

    /// Await one of the two outcomes for at most `timeout`.
    ///
    /// The absolute deadline is computed once when the wait begins; the
    /// single-assignment channel makes spurious-wake bookkeeping
    /// unnecessary.
    pub(crate) async fn wait(
        self,
        receiver: oneshot::Receiver<NonzaVerdict>,
        timeout: Duration,
    ) -> Result<Nonza, Error> {
        let deadline = Instant::now() + timeout;
        match timeout_at(deadline, receiver).await {
            Ok(Ok(NonzaVerdict::Success(nonza))) => Ok(nonza),
            Ok(Ok(NonzaVerdict::Failure(nonza))) => Err(Error::nonza_failure(nonza)),
            // Sender dropped without firing: the registry was torn down.
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::no_response(
                format!("nonza {} or {}", self.success, self.failure),
                timeout,
            )),
        }
    }
}

impl Drop for NonzaWaiter {
    fn drop(&mut self) {
        self.connection.remove_nonza_slot(&self.success, &self.cell);
        self.connection.remove_nonza_slot(&self.failure, &self.cell);
    }
}

pub(crate) fn same_cell(slot: &NonzaSlot, cell: &OutcomeCell) -> bool {
    Arc::ptr_eq(&slot.cell, cell)
}
