use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a per-user trading engine (component J).
///
/// `stopped -> initializing -> running -> halted (kill switch) -> draining -> stopped`.
/// Transitions are driven by user commands (start/stop), the guardian latching
/// or clearing the kill switch, and a graceful-drain signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EngineState {
    Stopped,
    Initializing,
    Running,
    /// Kill switch latched; no new entries, exits still permitted.
    Halted,
    /// Graceful shutdown in progress: no new entries, exits still permitted.
    Draining,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Stopped => "STOPPED",
            EngineState::Initializing => "INITIALIZING",
            EngineState::Running => "RUNNING",
            EngineState::Halted => "HALTED",
            EngineState::Draining => "DRAINING",
        }
    }

    /// Whether `self -> target` is a legal transition.
    pub fn can_transition_to(&self, target: EngineState) -> bool {
        use EngineState::*;

        match (self, target) {
            (Stopped, Initializing) => true,
            (Initializing, Running) => true,
            (Initializing, Stopped) => true, // credential validation failed
            (Running, Halted) => true,       // guardian latched the kill switch
            (Running, Draining) => true,     // user-initiated stop
            (Halted, Running) => true,       // operator cleared the kill switch
            (Halted, Draining) => true,      // user-initiated stop while halted
            (Draining, Stopped) => true,     // all loops cancelled, in-flight orders left
            _ => false,
        }
    }

    pub fn valid_transitions(&self) -> Vec<EngineState> {
        use EngineState::*;
        match self {
            Stopped => vec![Initializing],
            Initializing => vec![Running, Stopped],
            Running => vec![Halted, Draining],
            Halted => vec![Running, Draining],
            Draining => vec![Stopped],
        }
    }

    /// New entries are permitted only while running; exits are permitted in
    /// running, halted, and draining.
    pub fn allows_new_entries(&self) -> bool {
        matches!(self, EngineState::Running)
    }

    pub fn allows_exits(&self) -> bool {
        matches!(
            self,
            EngineState::Running | EngineState::Halted | EngineState::Draining
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Stopped)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for EngineState {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "STOPPED" => Ok(EngineState::Stopped),
            "INITIALIZING" => Ok(EngineState::Initializing),
            "RUNNING" => Ok(EngineState::Running),
            "HALTED" => Ok(EngineState::Halted),
            "DRAINING" => Ok(EngineState::Draining),
            _ => Err(format!("unknown engine state: {s}")),
        }
    }
}

/// State transition event, kept for audit logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: EngineState,
    pub to: EngineState,
    pub reason: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl StateTransition {
    pub fn new(from: EngineState, to: EngineState, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        use EngineState::*;

        assert!(Stopped.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Running));
        assert!(Initializing.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Halted));
        assert!(Running.can_transition_to(Draining));
        assert!(Halted.can_transition_to(Running));
        assert!(Halted.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Stopped));

        assert!(!Stopped.can_transition_to(Running));
        assert!(!Halted.can_transition_to(Stopped));
        assert!(!Draining.can_transition_to(Running));
    }

    #[test]
    fn state_from_str_roundtrip() {
        assert_eq!(EngineState::try_from("RUNNING").unwrap(), EngineState::Running);
        assert_eq!(EngineState::try_from("halted").unwrap(), EngineState::Halted);
        assert!(EngineState::try_from("bogus").is_err());
    }

    #[test]
    fn entries_and_exits_by_state() {
        assert!(EngineState::Running.allows_new_entries());
        assert!(EngineState::Running.allows_exits());

        assert!(!EngineState::Halted.allows_new_entries());
        assert!(EngineState::Halted.allows_exits());

        assert!(!EngineState::Draining.allows_new_entries());
        assert!(EngineState::Draining.allows_exits());

        assert!(!EngineState::Stopped.allows_new_entries());
        assert!(!EngineState::Stopped.allows_exits());
    }
}
