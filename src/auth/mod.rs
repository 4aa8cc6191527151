//! Login: challenge digest and handshake state machine.

mod digest;
mod handshake;

pub use digest::{compute_response, decode_challenge, CHALLENGE_LEN, RESPONSE_PREFIX};
pub use handshake::{Handshake, HandshakeState, LoginMethod, Step};
