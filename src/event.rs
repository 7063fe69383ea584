//! Transition events and the fan-out bus connecting supervisors to
//! observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::service::ServiceState;

/// Why a transition happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum Reason {
    /// Scheduler released the service for startup
    Released,
    /// Every prerequisite reached healthy
    DepsHealthy,
    /// A prerequisite ended in a terminal failure
    DepFailed(String),
    /// Configured startup delay elapsed
    DelayElapsed,
    /// Child spawned
    Spawned,
    /// Spawn attempt failed
    SpawnFailed(String),
    /// First successful probe of this generation
    ProbePassed,
    /// Probe failure counter reached the retries threshold
    ProbeFailed,
    /// Child exited on its own
    ChildExited(String),
    /// Restart backoff elapsed
    BackoffElapsed,
    /// Restart policy exhausted its failure budget
    BudgetExhausted,
    /// Stop requested by the scheduler or control plane
    StopRequested,
    /// Child terminated after a stop request
    StopComplete,
    /// Manual restart requested through the control plane
    RestartRequested,
    /// Root cancellation tripped before the service was running
    Cancelled,
}

/// Structured record published on every state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub service: String,
    pub from: ServiceState,
    pub to: ServiceState,
    pub generation: u64,
    pub reason: Reason,
    pub ts: DateTime<Utc>,
}

impl TransitionEvent {
    pub fn new(
        service: &str,
        from: ServiceState,
        to: ServiceState,
        generation: u64,
        reason: Reason,
    ) -> Self {
        Self {
            service: service.to_string(),
            from,
            to,
            generation,
            reason,
            ts: Utc::now(),
        }
    }
}

impl std::fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} -> {} (gen {})",
            self.service, self.from, self.to, self.generation
        )
    }
}

/// Broadcast fan-out of transition events.
///
/// Slow subscribers may lag and lose old events; the status board always
/// carries the latest state, so lag is an observability gap, not a
/// correctness one.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TransitionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: TransitionEvent) {
        // Nobody listening is fine; events are observability.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(TransitionEvent::new(
            "web",
            ServiceState::Starting,
            ServiceState::Probing,
            1,
            Reason::Spawned,
        ));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.service, "web");
        assert_eq!(ev.to, ServiceState::Probing);
        assert_eq!(ev.generation, 1);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        bus.publish(TransitionEvent::new(
            "db",
            ServiceState::Pending,
            ServiceState::WaitingDeps,
            0,
            Reason::Released,
        ));
    }
}
