//! `ServerState`: the service's volatile lifecycle state, shared by the
//! server façade, every listener thread, and the maintenance timer so
//! none of them needs a back-pointer to the others. Backed by `AtomicU8`
//! for compare-and-swap transitions with no torn reads, per
//! SPEC_FULL.md §9.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ServerState {
    fn from_u8(v: u8) -> ServerState {
        match v {
            0 => ServerState::Stopped,
            1 => ServerState::Starting,
            2 => ServerState::Running,
            3 => ServerState::Stopping,
            _ => unreachable!("ServerState only ever stores its own discriminants"),
        }
    }
}

pub struct ServerStateCell(AtomicU8);

impl Default for ServerStateCell {
    fn default() -> Self {
        Self::new(ServerState::Stopped)
    }
}

impl ServerStateCell {
    pub fn new(initial: ServerState) -> Self {
        ServerStateCell(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> ServerState {
        ServerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn store(&self, state: ServerState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Transitions `from -> to` only if the current state is `from`.
    pub fn compare_and_swap(&self, from: ServerState, to: ServerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.load() == ServerState::Running
    }

    pub fn is_stopping_or_stopped(&self) -> bool {
        matches!(self.load(), ServerState::Stopping | ServerState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_stopped() {
        let cell = ServerStateCell::default();
        assert_eq!(cell.load(), ServerState::Stopped);
    }

    #[test]
    fn compare_and_swap_only_transitions_from_the_expected_state() {
        let cell = ServerStateCell::new(ServerState::Stopped);
        assert!(cell.compare_and_swap(ServerState::Stopped, ServerState::Starting));
        assert!(!cell.compare_and_swap(ServerState::Stopped, ServerState::Running));
        assert_eq!(cell.load(), ServerState::Starting);
    }
}
