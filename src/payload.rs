//! Message bodies.
//!
//! A body is decoded with a *structured-or-raw* rule: if it parses as a JSON
//! object it becomes a [`Document`], otherwise the bytes are kept untouched
//! as [`Payload::Raw`]. Decoding never fails.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::transport::RawPayload;

/// Decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A JSON object with an optional `command` field.
    Structured(Document),
    /// Bytes that did not decode as a document, kept verbatim.
    Raw(Vec<u8>),
}

impl Payload {
    /// Decode a message body, falling back to [`Payload::Raw`].
    pub fn decode(bytes: &[u8]) -> Self {
        match serde_json::from_slice::<Document>(bytes) {
            Ok(document) => Payload::Structured(document),
            Err(error) => {
                tracing::trace!(%error, "Body is not a document, keeping raw bytes");
                Payload::Raw(bytes.to_vec())
            }
        }
    }

    /// Encode the payload into wire bytes.
    ///
    /// Raw payloads are returned byte-for-byte.
    pub fn encode(&self) -> Result<RawPayload, serde_json::Error> {
        match self {
            Payload::Structured(document) => serde_json::to_vec(document).map(RawPayload::from),
            Payload::Raw(bytes) => Ok(RawPayload::from(bytes.clone())),
        }
    }

    /// The `command` field, if this is a document carrying one.
    pub fn command(&self) -> Option<&Command> {
        match self {
            Payload::Structured(document) => document.command.as_ref(),
            Payload::Raw(_) => None,
        }
    }

    /// Whether this payload is a timeout notification.
    pub fn is_timeout(&self) -> bool {
        self.command() == Some(&Command::Timeout)
    }

    /// Rewrite the payload into a timeout notification.
    ///
    /// Documents keep their data and only have their command replaced. Raw
    /// bodies are wrapped into a document under the `raw` key.
    pub fn into_timeout(self) -> Payload {
        let mut document = match self {
            Payload::Structured(document) => document,
            Payload::Raw(bytes) => Document::default().with(
                "raw",
                Value::String(String::from_utf8_lossy(&bytes).into_owned()),
            ),
        };
        document.command = Some(Command::Timeout);
        Payload::Structured(document)
    }
}

impl From<Document> for Payload {
    fn from(value: Document) -> Self {
        Payload::Structured(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Raw(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Raw(value.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Raw(value.into_bytes())
    }
}

/// Structured message body: a `command` plus arbitrary fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Document {
    pub fn new(command: impl Into<Command>) -> Self {
        Self {
            command: Some(command.into()),
            data: Map::new(),
        }
    }

    /// Add a data field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// Kind of request or notification named by a document's `command` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Command {
    /// Synthetic notification that a request expired unanswered.
    Timeout,
    /// Application-defined command.
    Other(String),
}

impl Command {
    pub const TIMEOUT: &'static str = "timeout";

    pub fn as_str(&self) -> &str {
        match self {
            Command::Timeout => Self::TIMEOUT,
            Command::Other(command) => command,
        }
    }
}

impl From<String> for Command {
    fn from(value: String) -> Self {
        if value == Self::TIMEOUT {
            Command::Timeout
        } else {
            Command::Other(value)
        }
    }
}

impl From<&str> for Command {
    fn from(value: &str) -> Self {
        Command::from(value.to_owned())
    }
}

impl From<Command> for String {
    fn from(value: Command) -> Self {
        match value {
            Command::Timeout => Command::TIMEOUT.to_owned(),
            Command::Other(command) => command,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
