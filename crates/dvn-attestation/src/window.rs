use serde::{Deserialize, Serialize};

use dvn_types::{DvnError, PoaId};

/// Lifecycle of a submission's attestation window.
///
/// `Pending` is the initial closed state; `Closed` is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowState {
    #[default]
    Pending,
    Open,
    Closed,
}

/// Events that drive window state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowEvent {
    Open,
    Close,
}

impl WindowState {
    /// Attempt a state transition for the window of `poa_id`.
    pub fn transition(self, event: WindowEvent, poa_id: PoaId) -> Result<WindowState, DvnError> {
        match (self, event) {
            (WindowState::Pending, WindowEvent::Open) => Ok(WindowState::Open),
            (WindowState::Open, WindowEvent::Close) => Ok(WindowState::Closed),
            (WindowState::Open, WindowEvent::Open) => Err(DvnError::AlreadyOpen(poa_id)),
            (WindowState::Closed, WindowEvent::Open) => Err(DvnError::WindowFinalized(poa_id)),
            (WindowState::Pending | WindowState::Closed, WindowEvent::Close) => {
                Err(DvnError::NotOpen(poa_id))
            }
        }
    }

    pub fn is_open(self) -> bool {
        self == WindowState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_lifecycle() {
        let poa = PoaId::from_label("p");
        let mut state = WindowState::default();
        assert_eq!(state, WindowState::Pending);

        state = state.transition(WindowEvent::Open, poa).unwrap();
        assert!(state.is_open());

        state = state.transition(WindowEvent::Close, poa).unwrap();
        assert_eq!(state, WindowState::Closed);
    }

    #[test]
    fn test_invalid_window_transitions() {
        let poa = PoaId::from_label("p");
        assert!(matches!(
            WindowState::Open.transition(WindowEvent::Open, poa),
            Err(DvnError::AlreadyOpen(_))
        ));
        assert!(matches!(
            WindowState::Pending.transition(WindowEvent::Close, poa),
            Err(DvnError::NotOpen(_))
        ));
        assert!(matches!(
            WindowState::Closed.transition(WindowEvent::Close, poa),
            Err(DvnError::NotOpen(_))
        ));
        assert!(matches!(
            WindowState::Closed.transition(WindowEvent::Open, poa),
            Err(DvnError::WindowFinalized(_))
        ));
    }
}
