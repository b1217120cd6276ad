//! Version handshake
//!
//! ```text
//! Client                                        Server
//!   |                                             |
//!   |------- Hello { version, name } ----------->|
//!   |                                             |  major versions match?
//!   |<------ HelloAck { version, client_id, -----|  yes: version = min(both)
//!   |                   server_time }             |
//!   |                    or                       |
//!   |<------ Reject { server_version, reason } ---|  no: connection closes
//!   |                                             |
//!   |          [Handshake Complete]               |
//! ```
//!
//! Versions carry the major number in the high byte. Peers with the same
//! major version interoperate at the lower of the two minor versions.

use crate::error::HandshakeError;
use crate::session::ClientId;

use super::constants::{major, PROTOCOL_VERSION};
use super::message::Message;

/// Handshake role (client or server)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    /// Client: need to send Hello. Server: waiting for Hello
    Initial,
    /// Client: Hello sent, waiting for HelloAck or Reject
    WaitingForReply,
    Done,
    Failed,
}

/// Server's answer to a client's first message
#[derive(Debug, Clone, PartialEq)]
pub enum ServerReply {
    /// Send `reply` (a HelloAck); the connection becomes active
    Accepted {
        reply: Message,
        name: String,
        version: u16,
    },
    /// Send `reply` (a Reject) and close
    Rejected {
        reply: Message,
        error: HandshakeError,
    },
}

/// What the client learns from a HelloAck
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub version: u16,
    pub client_id: ClientId,
    pub server_time: i64,
}

/// Handshake state machine
#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    state: HandshakeState,
    local_version: u16,
    negotiated: Option<u16>,
}

impl Handshake {
    pub fn new(role: HandshakeRole) -> Self {
        Self::with_version(role, PROTOCOL_VERSION)
    }

    /// Handshake advertising a specific local version
    pub fn with_version(role: HandshakeRole, local_version: u16) -> Self {
        Self {
            role,
            state: HandshakeState::Initial,
            local_version,
            negotiated: None,
        }
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Negotiated version once complete
    pub fn version(&self) -> Option<u16> {
        self.negotiated
    }

    /// Client: build the Hello message
    pub fn hello(&mut self, name: &str) -> Message {
        self.state = HandshakeState::WaitingForReply;
        Message::Hello {
            version: self.local_version,
            name: name.to_string(),
        }
    }

    /// Server: answer a client's first message
    pub fn accept(&mut self, message: &Message, client_id: ClientId, server_time: i64) -> ServerReply {
        let (version, name) = match message {
            Message::Hello { version, name } => (*version, name),
            other => {
                self.state = HandshakeState::Failed;
                return ServerReply::Rejected {
                    reply: self.reject("expected hello"),
                    error: HandshakeError::UnexpectedMessage(other.kind()),
                };
            }
        };

        if major(version) != major(self.local_version) {
            self.state = HandshakeState::Failed;
            return ServerReply::Rejected {
                reply: self.reject("unsupported protocol version"),
                error: HandshakeError::ProtocolVersionMismatch {
                    local: self.local_version,
                    remote: version,
                },
            };
        }

        let negotiated = version.min(self.local_version);
        self.negotiated = Some(negotiated);
        self.state = HandshakeState::Done;

        ServerReply::Accepted {
            reply: Message::HelloAck {
                version: negotiated,
                client_id,
                server_time,
            },
            name: name.clone(),
            version: negotiated,
        }
    }

    /// Client: process the server's reply to Hello
    pub fn on_reply(&mut self, message: &Message) -> Result<Negotiated, HandshakeError> {
        let result = match message {
            Message::HelloAck {
                version,
                client_id,
                server_time,
            } => {
                if major(*version) != major(self.local_version) {
                    Err(HandshakeError::ProtocolVersionMismatch {
                        local: self.local_version,
                        remote: *version,
                    })
                } else {
                    Ok(Negotiated {
                        version: *version,
                        client_id: *client_id,
                        server_time: *server_time,
                    })
                }
            }
            Message::Reject {
                server_version,
                reason,
            } => Err(HandshakeError::Rejected {
                server_version: *server_version,
                reason: reason.clone(),
            }),
            other => Err(HandshakeError::UnexpectedMessage(other.kind())),
        };

        match &result {
            Ok(negotiated) => {
                self.negotiated = Some(negotiated.version);
                self.state = HandshakeState::Done;
            }
            Err(_) => self.state = HandshakeState::Failed,
        }
        result
    }

    fn reject(&self, reason: &str) -> Message {
        Message::Reject {
            server_version: self.local_version,
            reason: reason.to_string(),
        }
    }
}
