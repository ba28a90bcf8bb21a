use crate::CoreError;

/// Where the supervisor's control loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Installing,
    Locked,
    Launching,
    Running,
    Reconciling,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorState::Installing => write!(f, "installing"),
            SupervisorState::Locked => write!(f, "locked"),
            SupervisorState::Launching => write!(f, "launching"),
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Reconciling => write!(f, "reconciling"),
        }
    }
}

pub fn validate_transition(from: SupervisorState, to: SupervisorState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (SupervisorState::Installing, SupervisorState::Locked)
            | (SupervisorState::Locked, SupervisorState::Launching)
            | (SupervisorState::Launching, SupervisorState::Running)
            | (SupervisorState::Running, SupervisorState::Reconciling)
            | (SupervisorState::Reconciling, SupervisorState::Installing)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// What to do after the launched engine exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// A stop was requested: go back to waiting for install and unlock.
    Park,
    /// Something else already started the engine again; wait for that
    /// instance to exit before looping.
    AwaitExternal,
    /// Clean exit nobody asked for: launch again.
    Relaunch,
    /// Unexpected exit: supervision ends with this code.
    Terminate(i32),
}

/// Exactly one disposition per exit. The lock is checked first so that a
/// requested stop is never reported as a crash.
pub fn classify_exit(lock_held: bool, engine_live: bool, exit_code: i32) -> ExitDisposition {
    if lock_held {
        ExitDisposition::Park
    } else if engine_live {
        ExitDisposition::AwaitExternal
    } else if exit_code == 0 {
        ExitDisposition::Relaunch
    } else {
        ExitDisposition::Terminate(exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        use SupervisorState::{Installing, Launching, Locked, Reconciling, Running};
        assert!(validate_transition(Installing, Locked).is_ok());
        assert!(validate_transition(Locked, Launching).is_ok());
        assert!(validate_transition(Launching, Running).is_ok());
        assert!(validate_transition(Running, Reconciling).is_ok());
        assert!(validate_transition(Reconciling, Installing).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        use SupervisorState::{Installing, Launching, Locked, Reconciling, Running};
        assert!(validate_transition(Installing, Launching).is_err());
        assert!(validate_transition(Locked, Running).is_err());
        assert!(validate_transition(Reconciling, Launching).is_err());
        assert!(validate_transition(Running, Installing).is_err());
        assert!(validate_transition(Running, Running).is_err());
    }

    #[test]
    fn lock_takes_precedence() {
        assert_eq!(classify_exit(true, true, 1), ExitDisposition::Park);
        assert_eq!(classify_exit(true, false, 0), ExitDisposition::Park);
    }

    #[test]
    fn live_engine_without_lock_is_awaited() {
        assert_eq!(classify_exit(false, true, 1), ExitDisposition::AwaitExternal);
    }

    #[test]
    fn failing_exit_code_propagates() {
        assert_eq!(classify_exit(false, false, 3), ExitDisposition::Terminate(3));
        assert_eq!(classify_exit(false, false, -1), ExitDisposition::Terminate(-1));
    }

    #[test]
    fn clean_exit_is_relaunched() {
        assert_eq!(classify_exit(false, false, 0), ExitDisposition::Relaunch);
        assert_eq!(classify_exit(false, true, 0), ExitDisposition::AwaitExternal);
    }
}
