//! Lifecycle of a single starter instance.

use std::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,

    Relaunching,

    Negotiating,

    Running,

    ShuttingDown,

    Terminated,
}

impl ServiceState {
    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        match (self, next) {
            (Starting, Relaunching) | (Starting, Negotiating) => true,
            (Relaunching, Running) | (Negotiating, Running) => true,
            // Shutdown may interrupt any phase before termination.
            (Starting | Relaunching | Negotiating | Running, ShuttingDown) => true,
            (ShuttingDown, Terminated) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Relaunching => write!(f, "relaunching"),
            ServiceState::Negotiating => write!(f, "negotiating"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::ShuttingDown => write!(f, "shutting-down"),
            ServiceState::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Debug)]
pub struct StateCell {
    inner: RwLock<ServiceState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            inner: RwLock::new(ServiceState::Starting),
        }
    }
}

impl StateCell {
    pub fn get(&self) -> ServiceState {
        *self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves to `next` if the transition is allowed. Returns whether it moved.
    pub fn advance(&self, next: ServiceState) -> bool {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if !state.can_transition_to(next) {
            return false;
        }
        debug!(from = %*state, to = %next, "State change");
        *state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_start_paths_converge_on_running() {
        for path in [ServiceState::Relaunching, ServiceState::Negotiating] {
            let cell = StateCell::default();
            assert!(cell.advance(path));
            assert!(cell.advance(ServiceState::Running));
            assert!(cell.advance(ServiceState::ShuttingDown));
            assert!(cell.advance(ServiceState::Terminated));
            assert_eq!(cell.get(), ServiceState::Terminated);
        }
    }

    #[test]
    fn shutdown_is_entered_once() {
        let cell = StateCell::default();
        cell.advance(ServiceState::Negotiating);
        assert!(cell.advance(ServiceState::ShuttingDown));
        assert!(!cell.advance(ServiceState::ShuttingDown));
        assert!(!cell.advance(ServiceState::Running));
    }

    #[test]
    fn no_skipping_to_running() {
        let cell = StateCell::default();
        assert!(!cell.advance(ServiceState::Running));
        assert_eq!(cell.get(), ServiceState::Starting);
    }

    #[test]
    fn display() {
        assert_eq!(ServiceState::ShuttingDown.to_string(), "shutting-down");
        assert_eq!(ServiceState::Running.to_string(), "running");
    }
}
