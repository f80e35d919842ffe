//! Typed facts extracted from engine output.

use serde::{Deserialize, Serialize};

/// Informational engine lines that confirm a command was picked up
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckKind {
    MakingCall,
    InviteSent,
    ByeSent,
    MediaPending,
}

/// One event produced by the classifier (or, for `ProcessExited`, by the supervisor)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    RegistrationSucceeded,

    AccountInfo {
        username: String,
        server: String,
        raw_uri: String,
    },

    IncomingCall,

    Ringing,

    RemoteAnswered,

    CallEstablished,

    CallDisconnected,

    DialFailed { detail: String },

    CommandAck { kind: AckKind },

    ProcessExited,

    /// Nothing recognised; kept for observability only
    UnclassifiedLine { text: String },
}
