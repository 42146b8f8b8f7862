//! Control-session state machine

use crate::error::ConnectError;

/// Control-session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected
    Initial,

    /// Socket open, waiting for the 220 greeting
    AwaitingGreeting,

    /// `AUTH TLS` sent, awaiting 234 and the handshake
    NegotiatingTls,

    /// `USER` sent
    SendingUser,

    /// `PASS` sent
    SendingPassword,

    /// `PBSZ 0` sent
    ProtectionBuffer,

    /// `PROT P` sent
    ProtectionLevel,

    /// Logged in and ready
    Ready,

    /// Closed
    Closed,
}

impl SessionState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (self, next),
            (Initial, AwaitingGreeting)
                | (AwaitingGreeting, NegotiatingTls)
                | (AwaitingGreeting, SendingUser)
                | (NegotiatingTls, SendingUser)
                | (SendingUser, SendingPassword)
                | (SendingUser, ProtectionBuffer)
                | (SendingUser, Ready)
                | (SendingPassword, ProtectionBuffer)
                | (SendingPassword, Ready)
                | (ProtectionBuffer, ProtectionLevel)
                | (ProtectionLevel, Ready)
                | (_, Closed)
        )
    }

    /// Transition to new state
    pub fn transition(&mut self, next: SessionState) -> Result<(), ConnectError> {
        if !self.can_transition_to(next) {
            return Err(ConnectError::InvalidState {
                expected: format!("valid transition from {:?}", self),
                actual: format!("{:?}", next),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::AwaitingGreeting => write!(f, "awaiting_greeting"),
            Self::NegotiatingTls => write!(f, "negotiating_tls"),
            Self::SendingUser => write!(f, "sending_user"),
            Self::SendingPassword => write!(f, "sending_password"),
            Self::ProtectionBuffer => write!(f, "protection_buffer"),
            Self::ProtectionLevel => write!(f, "protection_level"),
            Self::Ready => write!(f, "ready"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_login_transitions() {
        let mut state = SessionState::Initial;
        assert!(state.transition(SessionState::AwaitingGreeting).is_ok());
        assert!(state.transition(SessionState::SendingUser).is_ok());
        assert!(state.transition(SessionState::SendingPassword).is_ok());
        assert!(state.transition(SessionState::Ready).is_ok());
    }

    #[test]
    fn test_explicit_tls_transitions() {
        let mut state = SessionState::Initial;
        assert!(state.transition(SessionState::AwaitingGreeting).is_ok());
        assert!(state.transition(SessionState::NegotiatingTls).is_ok());
        assert!(state.transition(SessionState::SendingUser).is_ok());
        assert!(state.transition(SessionState::SendingPassword).is_ok());
        assert!(state.transition(SessionState::ProtectionBuffer).is_ok());
        assert!(state.transition(SessionState::ProtectionLevel).is_ok());
        assert!(state.transition(SessionState::Ready).is_ok());
    }

    #[test]
    fn test_invalid_transition() {
        let mut state = SessionState::Initial;
        assert!(state.transition(SessionState::Ready).is_err());
        assert_eq!(state, SessionState::Initial);
    }

    #[test]
    fn test_cannot_negotiate_tls_after_login() {
        let mut state = SessionState::Ready;
        assert!(state.transition(SessionState::NegotiatingTls).is_err());
    }

    #[test]
    fn test_close_from_any_state() {
        let mut state = SessionState::ProtectionBuffer;
        assert!(state.transition(SessionState::Closed).is_ok());
    }
}
