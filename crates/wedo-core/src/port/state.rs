//! Port lifecycle states.

use std::fmt;

use crate::device::DeviceKind;

/// Lifecycle of one hub port.
///
/// The attached kind travels inside the variant, so a port can never be
/// `Empty` with a kind or `Attached` without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortState {
    /// Nothing plugged in.
    #[default]
    Empty,
    /// Attach seen, waiting for the input format handshake.
    Attaching { kind: DeviceKind },
    /// Ready for commands.
    Attached { kind: DeviceKind },
    /// Being torn down.
    Detaching { kind: DeviceKind },
}

impl PortState {
    pub fn kind(&self) -> Option<DeviceKind> {
        match self {
            PortState::Empty => None,
            PortState::Attaching { kind }
            | PortState::Attached { kind }
            | PortState::Detaching { kind } => Some(*kind),
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(self, PortState::Attached { .. })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, PortState::Empty)
    }

    /// Check whether `self -> next` is a legal lifecycle step.
    pub fn can_transition_to(&self, next: &PortState) -> bool {
        match (self, next) {
            (PortState::Empty, PortState::Attaching { .. }) => true,
            (PortState::Attaching { kind: a }, PortState::Attached { kind: b }) => a == b,
            (PortState::Attaching { kind: a }, PortState::Detaching { kind: b })
            | (PortState::Attached { kind: a }, PortState::Detaching { kind: b }) => a == b,
            (PortState::Detaching { .. }, PortState::Empty) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Empty => write!(f, "EMPTY"),
            PortState::Attaching { kind } => write!(f, "ATTACHING({})", kind),
            PortState::Attached { kind } => write!(f, "ATTACHED({})", kind),
            PortState::Detaching { kind } => write!(f, "DETACHING({})", kind),
        }
    }
}

/// Input format the hub confirmed for a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortInfo {
    pub mode: u8,
    pub format: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let kind = DeviceKind::MOTOR;
        let empty = PortState::Empty;
        let attaching = PortState::Attaching { kind };
        let attached = PortState::Attached { kind };
        let detaching = PortState::Detaching { kind };

        assert!(empty.can_transition_to(&attaching));
        assert!(attaching.can_transition_to(&attached));
        assert!(attached.can_transition_to(&detaching));
        assert!(attaching.can_transition_to(&detaching));
        assert!(detaching.can_transition_to(&empty));

        assert!(!empty.can_transition_to(&attached));
        assert!(!attached.can_transition_to(&empty));
        assert!(!attaching.can_transition_to(&PortState::Attached {
            kind: DeviceKind::TILT
        }));
    }

    #[test]
    fn test_kind_follows_state() {
        assert_eq!(PortState::Empty.kind(), None);
        assert_eq!(
            PortState::Attached {
                kind: DeviceKind::TILT
            }
            .kind(),
            Some(DeviceKind::TILT)
        );
        assert_eq!(PortState::default(), PortState::Empty);
    }
}
