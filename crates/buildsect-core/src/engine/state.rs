use crate::error::BisectError;
use serde::{Deserialize, Serialize};

/// Lifecycle of a bisection run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineState {
    /// Session created, bounds not yet established
    Initializing,
    /// Narrowing the range
    Searching,
    /// Interrupted; resumable from the persisted session
    Suspended,
    /// Bounds are adjacent in the usable order
    Converged,
    /// Final report produced
    Reported,
}

/// Validates a state transition.
///
/// # Errors
/// Returns `BisectError::IllegalTransition` when `to` is not reachable from `from`.
pub fn validate_transition(from: EngineState, to: EngineState) -> Result<(), BisectError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(BisectError::IllegalTransition { from, to })
    }
}

/// States reachable in one step
#[must_use]
pub fn allowed_transitions(from: EngineState) -> Vec<EngineState> {
    use EngineState::*;
    match from {
        Initializing => vec![Searching, Suspended, Reported],
        // Reported directly when a resumed session no longer brackets a transition
        Searching => vec![Converged, Suspended, Reported],
        Suspended => vec![Searching],
        Converged => vec![Reported],
        Reported => vec![],
    }
}

fn allowed(from: EngineState, to: EngineState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_state() -> impl Strategy<Value = EngineState> {
        prop_oneof![
            Just(EngineState::Initializing),
            Just(EngineState::Searching),
            Just(EngineState::Suspended),
            Just(EngineState::Converged),
            Just(EngineState::Reported),
        ]
    }

    #[test]
    fn happy_path() {
        use EngineState::*;
        for (from, to) in [
            (Initializing, Searching),
            (Searching, Converged),
            (Converged, Reported),
        ] {
            assert!(validate_transition(from, to).is_ok(), "{from:?} -> {to:?}");
        }
    }

    #[test]
    fn suspend_and_resume() {
        use EngineState::*;
        assert!(validate_transition(Searching, Suspended).is_ok());
        assert!(validate_transition(Suspended, Searching).is_ok());
        assert!(validate_transition(Suspended, Converged).is_err());
    }

    #[test]
    fn reported_is_terminal() {
        assert!(allowed_transitions(EngineState::Reported).is_empty());
    }

    proptest! {
        #[test]
        fn validate_agrees_with_table(from in any_state(), to in any_state()) {
            let listed = allowed_transitions(from).contains(&to);
            prop_assert_eq!(validate_transition(from, to).is_ok(), listed);
        }

        #[test]
        fn no_self_loops(state in any_state()) {
            prop_assert!(validate_transition(state, state).is_err());
        }
    }
}
