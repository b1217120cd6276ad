//! Registry error types
//!
//! Error types for topic, publisher and subscriber operations.

use crate::session::ClientId;
use crate::value::ValueType;

use super::topic::TopicId;

/// Error type for table operations
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryError {
    /// Topic re-announced (or written) with a type other than its declared one
    TypeMismatch {
        name: String,
        existing: ValueType,
        requested: ValueType,
    },
    /// No topic with this name
    TopicNotFound(String),
    /// No topic with this id
    TopicIdNotFound(TopicId),
    /// Client has no publisher with this uid
    PublisherNotFound { client: ClientId, pubuid: u32 },
    /// Publisher uid is already bound to a different topic
    PublisherConflict {
        client: ClientId,
        pubuid: u32,
        topic: String,
    },
    /// No subscriber with this id (or uid for the client)
    SubscriberNotFound(u64),
    /// Client is not connected
    ClientNotFound(ClientId),
}

impl RegistryError {
    /// Whether this is one of the lookup-miss variants
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::TopicNotFound(_)
                | RegistryError::TopicIdNotFound(_)
                | RegistryError::PublisherNotFound { .. }
                | RegistryError::SubscriberNotFound(_)
                | RegistryError::ClientNotFound(_)
        )
    }
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::TypeMismatch {
                name,
                existing,
                requested,
            } => write!(
                f,
                "Type mismatch for topic {}: declared {}, requested {}",
                name, existing, requested
            ),
            RegistryError::TopicNotFound(name) => write!(f, "Topic not found: {}", name),
            RegistryError::TopicIdNotFound(id) => write!(f, "Topic id not found: {}", id),
            RegistryError::PublisherNotFound { client, pubuid } => {
                write!(f, "Publisher {} not found for client {}", pubuid, client)
            }
            RegistryError::PublisherConflict {
                client,
                pubuid,
                topic,
            } => write!(
                f,
                "Publisher {} of client {} is already bound to {}",
                pubuid, client, topic
            ),
            RegistryError::SubscriberNotFound(id) => write!(f, "Subscriber not found: {}", id),
            RegistryError::ClientNotFound(id) => write!(f, "Client not found: {}", id),
        }
    }
}

impl std::error::Error for RegistryError {}
