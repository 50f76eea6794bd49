//! Signaling
//!
//! Wire types live in [`message`]; [`handler::SignalingHandler`] drives
//! sessions from those messages. Transport of the messages themselves is
//! left to the caller.

pub mod handler;
pub mod message;

pub use handler::{AnswerSession, SignalingHandler};
pub use message::{
    new_session_id, IceCandidate, RtcConfiguration, SdpType, SessionDescription, SessionId,
    SignalingMessage,
};
