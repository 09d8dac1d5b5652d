use std::fmt;
use tokio::sync::watch;

/// Lifecycle of one bridged session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    New,
    Active,
    Closing,
    Error,
    Closed,
}

impl SessionState {
    const fn rank(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Active => 1,
            Self::Closing | Self::Error => 2,
            Self::Closed => 3,
        }
    }

    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Closed, _) => false,
            // a fault while shutting down still ends in Closed, not Error
            (Self::Closing, Self::Error) => false,
            (Self::New, Self::Error) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Active => "ACTIVE",
            Self::Closing => "CLOSING",
            Self::Error => "ERROR",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Shared, observable session state enforcing monotonic transitions.
#[derive(Debug, Clone)]
pub(crate) struct StateCell {
    tx: watch::Sender<SessionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::New);
        Self { tx }
    }

    pub(crate) fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Attempt `current -> next`; returns whether the state changed.
    pub(crate) fn advance(&self, next: SessionState) -> bool {
        self.tx.send_if_modified(|current| {
            if current.can_advance_to(next) {
                tracing::debug!(from = %current, to = %next, "Session state transition");
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

/// Wait until the state leaves `Active`.
pub(crate) async fn inactive(rx: &mut watch::Receiver<SessionState>) {
    // a dropped sender means the session itself is gone
    let _ = rx.wait_for(|state| !state.is_active()).await;
}

/// How stream setup concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The reader ran and has since exited.
    Ended,
    /// Setup or the stream failed with the given reason.
    Failed(String),
}

/// One-shot signal that stream setup has concluded, successfully or not.
///
/// The first `release` wins; later calls are ignored, so waiters never block
/// once any exit path has run.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    tx: watch::Sender<Option<Readiness>>,
}

impl ReadinessGate {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Returns `true` only for the call that actually set the gate.
    pub fn release(&self, outcome: Readiness) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.tx.borrow().is_some()
    }

    #[must_use]
    pub fn outcome(&self) -> Option<Readiness> {
        self.tx.borrow().clone()
    }

    /// Wait for the gate. Resolves immediately if it is already set.
    pub async fn wait(&self) -> Readiness {
        let mut rx = self.tx.subscribe();
        let result = rx.wait_for(Option::is_some).await.map(|slot| slot.clone());
        match result {
            Ok(Some(outcome)) => outcome,
            _ => Readiness::Failed("readiness gate dropped".to_string()),
        }
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_monotonic() {
        let cell = StateCell::new();
        assert!(cell.advance(SessionState::Active));
        assert!(!cell.advance(SessionState::New));
        assert!(cell.advance(SessionState::Closing));
        assert!(!cell.advance(SessionState::Error));
        assert!(cell.advance(SessionState::Closed));
        assert!(!cell.advance(SessionState::Active));
        assert_eq!(cell.get(), SessionState::Closed);
    }

    #[test]
    fn error_is_forced_to_closed() {
        let cell = StateCell::new();
        cell.advance(SessionState::Active);
        assert!(cell.advance(SessionState::Error));
        assert!(!cell.advance(SessionState::Closing));
        assert!(cell.advance(SessionState::Closed));
    }

    #[tokio::test]
    async fn gate_releases_once() {
        let gate = ReadinessGate::new();
        assert!(!gate.is_released());
        assert!(gate.release(Readiness::Ended));
        assert!(!gate.release(Readiness::Failed("late".to_string())));
        assert_eq!(gate.wait().await, Readiness::Ended);
        assert_eq!(gate.outcome(), Some(Readiness::Ended));
    }

    #[tokio::test]
    async fn waiters_unblock_on_release() {
        let gate = ReadinessGate::new();
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait().await })
        };
        tokio::task::yield_now().await;
        gate.release(Readiness::Failed("boom".to_string()));
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Readiness::Failed("boom".to_string()));
    }
}
