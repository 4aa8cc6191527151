//! Login state machine.
//!
//! The handshake is driven by the connection before any channel exists:
//! it produces the sentences to send and consumes classified replies until
//! it reaches `Connected` or `Failed`. It performs no I/O itself.

use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use super::digest::{compute_response, decode_challenge};
use crate::error::AuthError;
use crate::protocol::{words, Reply, ReplyKind, Sentence, Trap, TrapEntry};

/// How credentials are presented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoginMethod {
    /// `/login`, then MD5 response to the `ret` challenge.
    #[default]
    Challenge,
    /// `/login =name= =password=` in one sentence.
    Plain,
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    SendingLogin,
    AwaitingChallenge,
    SendingCredentials,
    Connected,
    Failed,
}

/// Outcome of feeding one reply to the handshake.
#[derive(Debug)]
pub enum Step {
    /// Write this sentence, then keep reading.
    Send(Sentence),
    /// Keep reading.
    Pending,
    /// Login succeeded.
    Connected,
    /// Login failed; close the transport.
    Failed(AuthError),
}

/// Login state machine for one connection attempt.
pub struct Handshake {
    state: HandshakeState,
    method: LoginMethod,
    username: String,
    password: Zeroizing<String>,
    traps: Vec<TrapEntry>,
    // The challenge came as a bare row; the `!done` of the first `/login` is still due.
    skip_done: bool,
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("state", &self.state)
            .field("method", &self.method)
            .field("username", &self.username)
            .field("traps", &self.traps.len())
            .finish_non_exhaustive()
    }
}

impl Handshake {
    /// Create a handshake in the `Connecting` state.
    pub fn new(method: LoginMethod, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            state: HandshakeState::Connecting,
            method,
            username: username.into(),
            password: Zeroizing::new(password.into()),
            traps: Vec::new(),
            skip_done: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Check if the handshake reached a final state.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, HandshakeState::Connected | HandshakeState::Failed)
    }

    /// First sentence to send.
    pub fn start(&mut self) -> Sentence {
        self.transition(HandshakeState::SendingLogin);
        match self.method {
            LoginMethod::Challenge => {
                self.transition(HandshakeState::AwaitingChallenge);
                Sentence::from_words([words::LOGIN])
            }
            LoginMethod::Plain => {
                let sentence = Sentence::from_words([
                    words::LOGIN.to_string(),
                    format!("=name={}", self.username),
                    format!("=password={}", self.password.as_str()),
                ]);
                self.transition(HandshakeState::SendingCredentials);
                sentence
            }
        }
    }

    /// Feed one classified reply.
    pub fn on_reply(&mut self, reply: &Reply) -> Step {
        if self.is_finished() {
            return Step::Pending;
        }

        match reply.kind() {
            ReplyKind::Fatal => self.fail(AuthError::Fatal(reply.fatal_message())),
            ReplyKind::Trap => {
                if let Some(entry) = reply.trap_entry() {
                    debug!(message = %entry.message, "Login trap");
                    self.traps.push(entry);
                }
                Step::Pending
            }
            ReplyKind::Empty => Step::Pending,
            ReplyKind::Row => match (self.state, reply.ret()) {
                (HandshakeState::AwaitingChallenge, Some(ret)) if self.traps.is_empty() => {
                    self.skip_done = true;
                    self.answer_challenge(ret)
                }
                _ => Step::Pending,
            },
            ReplyKind::Done => self.on_done(reply),
        }
    }

    /// The transport ended before the handshake finished.
    pub fn interrupted(&mut self) -> AuthError {
        self.transition(HandshakeState::Failed);
        AuthError::Interrupted
    }

    fn on_done(&mut self, reply: &Reply) -> Step {
        if !self.traps.is_empty() {
            let trap = Trap::new(std::mem::take(&mut self.traps));
            return self.fail(AuthError::Rejected(trap));
        }

        if self.skip_done {
            self.skip_done = false;
            return Step::Pending;
        }

        match (self.state, reply.ret()) {
            (HandshakeState::AwaitingChallenge, Some(ret)) => self.answer_challenge(ret),
            _ => {
                self.transition(HandshakeState::Connected);
                Step::Connected
            }
        }
    }

    fn answer_challenge(&mut self, ret: &str) -> Step {
        let challenge = match decode_challenge(ret) {
            Ok(challenge) => challenge,
            Err(e) => return self.fail(e),
        };
        let response = Zeroizing::new(compute_response(&self.password, &challenge));

        self.transition(HandshakeState::SendingCredentials);
        Step::Send(Sentence::from_words([
            words::LOGIN.to_string(),
            format!("=name={}", self.username),
            format!("=response={}", response.as_str()),
        ]))
    }

    fn fail(&mut self, error: AuthError) -> Step {
        self.transition(HandshakeState::Failed);
        Step::Failed(error)
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(from = ?self.state, to = ?next, "Login state");
        self.state = next;
    }
}
