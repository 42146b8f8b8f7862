//! Login negotiation
//!
//! Drives the control-session state machine from server replies without doing
//! any I/O, so the async and blocking clients share one implementation of the
//! greeting → `AUTH TLS` → `USER`/`PASS` → `PBSZ`/`PROT` sequence.

use crate::connection::{ConnectionConfig, EncryptionMode, SessionState};
use crate::error::ConnectError;
use crate::protocol::constants::codes;
use crate::protocol::{Command, Reply};

/// What the driver must do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send this command and read the next reply
    Send(Command),
    /// Read another reply without sending anything
    Wait,
    /// Upgrade the transport to TLS, then call [`Negotiation::tls_established`]
    StartTls,
    /// Logged in
    Done,
}

/// Login sequence for one control connection
#[derive(Debug)]
pub struct Negotiation {
    state: SessionState,
    encryption: EncryptionMode,
    user: String,
    password: Option<String>,
    last_command: &'static str,
}

impl Negotiation {
    /// Start a negotiation; the transport is assumed connected
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            state: SessionState::AwaitingGreeting,
            encryption: config.encryption,
            user: config.user.clone(),
            password: config.password.clone(),
            last_command: "greeting",
        }
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Advance on a server reply
    pub fn on_reply(&mut self, reply: &Reply) -> Result<Step, ConnectError> {
        match self.state {
            SessionState::AwaitingGreeting => match reply.code {
                codes::SERVICE_READY_SOON => Ok(Step::Wait),
                codes::SERVICE_READY => {
                    if self.encryption == EncryptionMode::Explicit {
                        self.send(SessionState::NegotiatingTls, Command::AuthTls)
                    } else {
                        self.send_user()
                    }
                }
                _ => Err(self.rejected(reply)),
            },
            SessionState::NegotiatingTls => match reply.code {
                codes::AUTH_OK | codes::AUTH_CONTINUE => Ok(Step::StartTls),
                _ => Err(self.rejected(reply)),
            },
            SessionState::SendingUser => match reply.code {
                codes::LOGGED_IN => self.logged_in(),
                codes::NEED_PASSWORD => {
                    let password = self.password.clone().unwrap_or_default();
                    self.send(SessionState::SendingPassword, Command::Pass(password))
                }
                _ => Err(self.rejected(reply)),
            },
            SessionState::SendingPassword => match reply.code {
                codes::LOGGED_IN | codes::SUPERFLUOUS => self.logged_in(),
                _ => Err(self.rejected(reply)),
            },
            SessionState::ProtectionBuffer => match reply.code {
                codes::COMMAND_OK => self.send(SessionState::ProtectionLevel, Command::Prot('P')),
                _ => Err(self.rejected(reply)),
            },
            SessionState::ProtectionLevel => match reply.code {
                codes::COMMAND_OK => {
                    self.state.transition(SessionState::Ready)?;
                    Ok(Step::Done)
                }
                _ => Err(self.rejected(reply)),
            },
            SessionState::Initial | SessionState::Ready | SessionState::Closed => {
                Err(ConnectError::Protocol(format!(
                    "unexpected reply {} in state {}",
                    reply, self.state
                )))
            }
        }
    }

    /// Called once the explicit TLS upgrade has completed
    pub fn tls_established(&mut self) -> Result<Command, ConnectError> {
        if self.state != SessionState::NegotiatingTls {
            return Err(ConnectError::InvalidState {
                expected: SessionState::NegotiatingTls.to_string(),
                actual: self.state.to_string(),
            });
        }
        match self.send_user()? {
            Step::Send(cmd) => Ok(cmd),
            other => Err(ConnectError::Protocol(format!(
                "unexpected step after TLS upgrade: {:?}",
                other
            ))),
        }
    }

    fn send_user(&mut self) -> Result<Step, ConnectError> {
        let user = self.user.clone();
        self.send(SessionState::SendingUser, Command::User(user))
    }

    fn logged_in(&mut self) -> Result<Step, ConnectError> {
        if self.encryption.is_encrypted() {
            self.send(SessionState::ProtectionBuffer, Command::Pbsz(0))
        } else {
            self.state.transition(SessionState::Ready)?;
            Ok(Step::Done)
        }
    }

    fn send(&mut self, next: SessionState, cmd: Command) -> Result<Step, ConnectError> {
        self.state.transition(next)?;
        self.last_command = cmd.verb();
        Ok(Step::Send(cmd))
    }

    fn rejected(&self, reply: &Reply) -> ConnectError {
        ConnectError::Rejected {
            command: self.last_command.to_string(),
            code: reply.code,
            message: reply.message(),
        }
    }
}
