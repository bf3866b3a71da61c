// Message model and wire records for the relay protocol

use crate::relay::error::{RelayError, RelayResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Routing key for a user (an email address)
pub type Identity = String;

/// Literal sent when the handshake succeeds
pub const AUTH_SUCCESS: &str = "AUTH_SUCCESS";
/// Literal sent when the handshake fails
pub const AUTH_FAILED: &str = "AUTH_FAILED";

/// Kind of record a message represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Chat,
    Ack,
    Logout,
    LogoutConfirm,
    Confirmation,
    Error,
}

/// Delivery status of a chat message.
///
/// Ordered so that a status can only move forward:
/// `Pending < Queued < Delivered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Queued,
    Delivered,
}

/// Outcome reported to the sender in a CONFIRMATION record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Delivered,
    Queued,
}

impl DeliveryOutcome {
    pub fn from_delivered(delivered: bool) -> Self {
        if delivered {
            DeliveryOutcome::Delivered
        } else {
            DeliveryOutcome::Queued
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Delivered => write!(f, "delivered"),
            DeliveryOutcome::Queued => write!(f, "queued"),
        }
    }
}

/// A chat message tracked by the broker
#[derive(Debug, Clone)]
pub struct Message {
    id: String,
    pub sender: Identity,
    receiver: Option<Identity>,
    pub content: Option<String>,
    pub kind: MessageKind,
    status: MessageStatus,
    pub created_at: SystemTime,
}

impl Message {
    /// Create a chat message. A fresh UUID is assigned when `id` is absent.
    pub fn chat(
        id: Option<String>,
        sender: Identity,
        receiver: Identity,
        content: Option<String>,
    ) -> Self {
        let id = id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            id,
            sender,
            receiver: Some(receiver),
            content,
            kind: MessageKind::Chat,
            status: MessageStatus::Pending,
            created_at: SystemTime::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn receiver(&self) -> Option<&str> {
        self.receiver.as_deref()
    }

    /// Replace the id with a fresh UUID
    pub(crate) fn reassign_id(&mut self) {
        self.id = Uuid::new_v4().to_string();
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    /// Move the status forward. Returns false (and changes nothing) if
    /// `status` would be a regression.
    pub fn advance(&mut self, status: MessageStatus) -> bool {
        if status < self.status {
            return false;
        }
        self.status = status;
        true
    }

    /// Milliseconds since the Unix epoch at creation
    pub fn timestamp_millis(&self) -> u64 {
        self.created_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_millis() as u64
    }
}

/// Handshake record. Never retained after authentication.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    pub fn parse(line: &str) -> RelayResult<Self> {
        serde_json::from_str(line)
            .map_err(|e| RelayError::protocol(format!("Invalid handshake: {}", e)))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Records a client sends after authenticating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientRecord {
    #[serde(rename_all = "camelCase")]
    Chat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_email: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver_email: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    Acknowledge {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    Logout {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_email: Option<String>,
    },
}

impl ClientRecord {
    /// Parse one line into a record, producing a descriptive protocol error
    /// for anything that is not a known, well-formed record.
    pub fn parse(line: &str) -> RelayResult<Self> {
        let value: Value = serde_json::from_str(line)
            .map_err(|e| RelayError::protocol(format!("Invalid message format: {}", e)))?;

        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None => return Err(RelayError::protocol("Missing message type")),
        };

        match kind.as_str() {
            "CHAT" | "ACKNOWLEDGE" | "LOGOUT" => {}
            other => {
                return Err(RelayError::protocol(format!(
                    "Unknown message type: {}",
                    other
                )))
            }
        }

        serde_json::from_value(value)
            .map_err(|e| RelayError::protocol(format!("Invalid {} record: {}", kind, e)))
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            ClientRecord::Chat { .. } => MessageKind::Chat,
            ClientRecord::Acknowledge { .. } => MessageKind::Ack,
            ClientRecord::Logout { .. } => MessageKind::Logout,
        }
    }

    /// Serialize to JSON bytes with a trailing newline
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Records the server sends after authentication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerRecord {
    #[serde(rename_all = "camelCase")]
    Chat {
        id: String,
        sender_email: String,
        receiver_email: Option<String>,
        content: Option<String>,
        status: MessageStatus,
        timestamp: u64,
    },
    LogoutConfirm,
    Confirmation {
        id: String,
        status: DeliveryOutcome,
    },
    Error {
        content: String,
    },
}

impl ServerRecord {
    pub fn error(content: impl Into<String>) -> Self {
        ServerRecord::Error {
            content: content.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            ServerRecord::Chat { .. } => MessageKind::Chat,
            ServerRecord::LogoutConfirm => MessageKind::LogoutConfirm,
            ServerRecord::Confirmation { .. } => MessageKind::Confirmation,
            ServerRecord::Error { .. } => MessageKind::Error,
        }
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl From<&Message> for ServerRecord {
    fn from(message: &Message) -> Self {
        ServerRecord::Chat {
            id: message.id.clone(),
            sender_email: message.sender.clone(),
            receiver_email: message.receiver.clone(),
            content: message.content.clone(),
            status: message.status,
            timestamp: message.timestamp_millis(),
        }
    }
}

/// Anything written to a connection: the bare handshake reply or a record
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    AuthReply(bool),
    Record(ServerRecord),
}

impl Outbound {
    /// Serialize to a single newline-terminated line
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = match self {
            Outbound::AuthReply(true) => AUTH_SUCCESS.as_bytes().to_vec(),
            Outbound::AuthReply(false) => AUTH_FAILED.as_bytes().to_vec(),
            Outbound::Record(record) => serde_json::to_vec(record)?,
        };
        bytes.push(b'\n');
        Ok(bytes)
    }
}

impl From<ServerRecord> for Outbound {
    fn from(record: ServerRecord) -> Self {
        Outbound::Record(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_never_regresses() {
        let mut msg = Message::chat(
            None,
            "x@example.com".to_string(),
            "y@example.com".to_string(),
            Some("hi".to_string()),
        );
        assert_eq!(msg.status(), MessageStatus::Pending);

        assert!(msg.advance(MessageStatus::Queued));
        assert!(msg.advance(MessageStatus::Delivered));
        assert!(!msg.advance(MessageStatus::Queued));
        assert_eq!(msg.status(), MessageStatus::Delivered);
    }

    #[test]
    fn test_chat_keeps_client_id_or_assigns_one() {
        let kept = Message::chat(
            Some("abc".to_string()),
            "x@example.com".to_string(),
            "y@example.com".to_string(),
            None,
        );
        assert_eq!(kept.id(), "abc");

        let assigned = Message::chat(
            Some(String::new()),
            "x@example.com".to_string(),
            "y@example.com".to_string(),
            None,
        );
        assert!(Uuid::parse_str(assigned.id()).is_ok());
    }

    #[test]
    fn test_parse_chat_record() {
        let line = r#"{"type":"CHAT","id":"m1","senderEmail":"x@example.com","receiverEmail":"y@example.com","content":"hello","status":"pending","timestamp":"2024-01-01T00:00:00"}"#;
        let record = ClientRecord::parse(line).unwrap();

        assert_eq!(
            record,
            ClientRecord::Chat {
                id: Some("m1".to_string()),
                sender_email: Some("x@example.com".to_string()),
                receiver_email: Some("y@example.com".to_string()),
                content: Some("hello".to_string()),
            }
        );
        assert_eq!(record.kind(), MessageKind::Chat);
    }

    #[test]
    fn test_parse_rejects_unknown_type_and_garbage() {
        let err = ClientRecord::parse(r#"{"type":"PING"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Unknown message type: PING");

        let err = ClientRecord::parse("not json").unwrap_err();
        assert!(err.to_string().starts_with("Invalid message format"));

        let err = ClientRecord::parse(r#"{"id":"m1"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Missing message type");

        let err = ClientRecord::parse(r#"{"type":"ACKNOWLEDGE"}"#).unwrap_err();
        assert!(err.to_string().starts_with("Invalid ACKNOWLEDGE record"));
    }

    #[test]
    fn test_server_records_wire_shape() {
        let confirm = Outbound::from(ServerRecord::Confirmation {
            id: "m1".to_string(),
            status: DeliveryOutcome::Queued,
        });
        let line = String::from_utf8(confirm.to_bytes().unwrap()).unwrap();
        assert_eq!(line, "{\"type\":\"CONFIRMATION\",\"id\":\"m1\",\"status\":\"queued\"}\n");

        let logout = Outbound::from(ServerRecord::LogoutConfirm);
        let line = String::from_utf8(logout.to_bytes().unwrap()).unwrap();
        assert_eq!(line, "{\"type\":\"LOGOUT_CONFIRM\"}\n");

        let auth = Outbound::AuthReply(false).to_bytes().unwrap();
        assert_eq!(auth, b"AUTH_FAILED\n");
    }

    #[test]
    fn test_chat_record_from_message_uses_camel_case() {
        let mut msg = Message::chat(
            Some("m2".to_string()),
            "x@example.com".to_string(),
            "y@example.com".to_string(),
            Some("yo".to_string()),
        );
        msg.advance(MessageStatus::Delivered);

        let value = serde_json::to_value(ServerRecord::from(&msg)).unwrap();
        assert_eq!(value["type"], "CHAT");
        assert_eq!(value["senderEmail"], "x@example.com");
        assert_eq!(value["receiverEmail"], "y@example.com");
        assert_eq!(value["status"], "delivered");
        assert_eq!(value["timestamp"], msg.timestamp_millis());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::parse(r#"{"email":"x@example.com","password":"hunter2"}"#).unwrap();
        let debug = format!("{:?}", creds);
        assert!(debug.contains("x@example.com"));
        assert!(!debug.contains("hunter2"));
    }
}
