//! Wire messages for the pairbox signaling relay.
//!
//! Every frame is a JSON object discriminated by its `msg` field.
//!
//! ## Requests (client → relay)
//!
//! - `{"msg": "connect"}`
//! - `{"msg": "pair"}`
//! - `{"msg": "stop_pair"}`
//! - `{"msg": "offer", "sdp": ...}`
//! - `{"msg": "answer", "sdp": ...}`
//! - `{"msg": "candidate", ...}`
//!
//! Negotiation payloads (`offer`, `answer`, `candidate`) are opaque to the
//! relay: only the discriminator is read, and the original text is forwarded
//! to the partner untouched.
//!
//! ## Events (relay → client)
//!
//! - `{"msg": "ok"}`
//! - `{"msg": "update", "online_num": 7, "pairing_num": 4}`
//! - `{"msg": "paired", "role": "offer"}`
//! - `{"msg": "error", "error": "..."}`

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while decoding a client frame
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The frame is not a JSON object with a string `msg` field
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The `msg` discriminator names no known request
    #[error("Unknown message kind: {0}")]
    UnknownKind(String),
}

/// A request sent by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientRequest {
    /// Announce presence
    Connect,
    /// Ask to be matched with another waiting client
    Pair,
    /// Leave the current pairing
    StopPair,
    /// Session description from the offering side
    Offer,
    /// Session description from the answering side
    Answer,
    /// ICE candidate from either side
    Candidate,
}

impl ClientRequest {
    /// The wire name of this request
    pub fn kind(self) -> &'static str {
        match self {
            ClientRequest::Connect => "connect",
            ClientRequest::Pair => "pair",
            ClientRequest::StopPair => "stop_pair",
            ClientRequest::Offer => "offer",
            ClientRequest::Answer => "answer",
            ClientRequest::Candidate => "candidate",
        }
    }
}

impl fmt::Display for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Only the discriminator is decoded; the rest of the frame is ignored.
#[derive(Deserialize)]
struct Envelope {
    msg: String,
}

impl FromStr for ClientRequest {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let envelope: Envelope = serde_json::from_str(s)?;
        match envelope.msg.as_str() {
            "connect" => Ok(ClientRequest::Connect),
            "pair" => Ok(ClientRequest::Pair),
            "stop_pair" => Ok(ClientRequest::StopPair),
            "offer" => Ok(ClientRequest::Offer),
            "answer" => Ok(ClientRequest::Answer),
            "candidate" => Ok(ClientRequest::Candidate),
            _ => Err(ProtocolError::UnknownKind(envelope.msg)),
        }
    }
}

/// Negotiation role handed to each side of a pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Creates the session offer
    Offer,
    /// Responds to the offer
    Answer,
}

/// An event sent by the relay to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum ServerEvent {
    /// The request was accepted
    Ok,
    /// Aggregate counters
    Update {
        /// Connected clients
        online_num: usize,
        /// Clients currently matched with a partner
        pairing_num: i64,
    },
    /// A partner was found
    Paired {
        /// Role this client plays in the negotiation
        role: Role,
    },
    /// The request was rejected
    Error {
        /// Human readable reason
        error: String,
    },
}

impl ServerEvent {
    /// Build an error event from anything printable
    pub fn error(reason: impl fmt::Display) -> Self {
        ServerEvent::Error {
            error: reason.to_string(),
        }
    }
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

impl FromStr for ServerEvent {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_request_kind() {
        let cases = [
            (r#"{"msg":"connect"}"#, ClientRequest::Connect),
            (r#"{"msg":"pair"}"#, ClientRequest::Pair),
            (r#"{"msg":"stop_pair"}"#, ClientRequest::StopPair),
            (r#"{"msg":"offer","sdp":"v=0"}"#, ClientRequest::Offer),
            (r#"{"msg":"answer","sdp":{"type":"answer"}}"#, ClientRequest::Answer),
            (
                r#"{"msg":"candidate","candidate":"a=1","sdpMid":"0"}"#,
                ClientRequest::Candidate,
            ),
        ];
        for (text, expected) in cases {
            assert_eq!(text.parse::<ClientRequest>().unwrap(), expected, "{text}");
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = r#"{"msg":"dance"}"#.parse::<ClientRequest>().unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind(kind) if kind == "dance"));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        for text in ["", "not json", "[]", r#"{"kind":"pair"}"#, r#"{"msg":3}"#] {
            assert!(
                matches!(text.parse::<ClientRequest>(), Err(ProtocolError::Json(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn events_serialize_with_msg_tag() {
        assert_eq!(ServerEvent::Ok.to_string(), r#"{"msg":"ok"}"#);
        assert_eq!(
            ServerEvent::Update {
                online_num: 7,
                pairing_num: 4
            }
            .to_string(),
            r#"{"msg":"update","online_num":7,"pairing_num":4}"#
        );
        assert_eq!(
            ServerEvent::Paired { role: Role::Answer }.to_string(),
            r#"{"msg":"paired","role":"answer"}"#
        );
        assert_eq!(
            ServerEvent::error("unnormal status").to_string(),
            r#"{"msg":"error","error":"unnormal status"}"#
        );
    }

    #[test]
    fn events_parse_back() {
        let event: ServerEvent = r#"{"msg":"paired","role":"offer"}"#.parse().unwrap();
        assert_eq!(event, ServerEvent::Paired { role: Role::Offer });
    }
}
