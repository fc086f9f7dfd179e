#![forbid(unsafe_code)]

//! Transport handle consumed by the session layer.
//!
//! The session never inspects message contents; it only forwards outbound
//! messages and uses [`IoHandle::is_closed`] when deciding lifecycle
//! transitions. The handle is owned by the transport.

use std::io;

/// An outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

impl Message {
    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

/// Connection handle supplied by the transport layer.
pub trait IoHandle: Send + Sync {
    /// Queue a message for the client.
    fn send(&self, message: Message) -> io::Result<()>;

    /// Whether the underlying connection has gone away.
    fn is_closed(&self) -> bool;
}
