use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(TenantId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

/// Senders the backend uses for messages written from the dashboard side.
const OUTBOUND_SENDERS: [&str; 2] = ["agent", "me"];

/// Group chats on the messaging network use this id prefix when the address
/// arrives without a domain.
const GROUP_ADDRESS_PREFIX: &str = "12036";
const GROUP_ADDRESS_DOMAIN: &str = "@g.us";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn from_sender(sender: &str) -> Self {
        if OUTBOUND_SENDERS.contains(&sender) {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }
}

pub fn is_group_address(address: &str) -> bool {
    if address.ends_with(GROUP_ADDRESS_DOMAIN) {
        return true;
    }
    !address.contains('@') && address.starts_with(GROUP_ADDRESS_PREFIX)
}

/// A conversation as cached by the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ConversationRecord", into = "ConversationRecord")]
pub struct Conversation {
    pub id: ConversationId,
    pub external_address: String,
    pub display_name: Option<String>,
    pub last_message_preview: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub is_group: bool,
}

impl Conversation {
    pub fn new(
        id: ConversationId,
        external_address: impl Into<String>,
        display_name: Option<String>,
        last_message_at: Option<DateTime<Utc>>,
    ) -> Self {
        let external_address = external_address.into();
        Self {
            id,
            is_group: is_group_address(&external_address),
            external_address,
            display_name,
            last_message_preview: String::new(),
            last_message_at,
        }
    }

    /// Name shown for the conversation, falling back to the address.
    pub fn title(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.external_address)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConversationRecord {
    id: ConversationId,
    contact_number: String,
    #[serde(default)]
    contact_name: Option<String>,
    #[serde(default)]
    last_message_preview: Option<String>,
    #[serde(default)]
    last_message_at: Option<DateTime<Utc>>,
}

impl From<ConversationRecord> for Conversation {
    fn from(record: ConversationRecord) -> Self {
        let mut conversation = Conversation::new(
            record.id,
            record.contact_number,
            record.contact_name,
            record.last_message_at,
        );
        conversation.last_message_preview = record.last_message_preview.unwrap_or_default();
        conversation
    }
}

impl From<Conversation> for ConversationRecord {
    fn from(value: Conversation) -> Self {
        Self {
            id: value.id,
            contact_number: value.external_address,
            contact_name: value.display_name,
            last_message_preview: Some(value.last_message_preview),
            last_message_at: value.last_message_at,
        }
    }
}

/// A single message in a conversation log. Ordered by `(created_at, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "MessageRecord", into = "MessageRecord")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: String,
    pub direction: Direction,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub delivery_metadata: Option<serde_json::Value>,
}

impl Message {
    pub fn new(
        id: MessageId,
        conversation_id: ConversationId,
        sender: impl Into<String>,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let sender = sender.into();
        Self {
            id,
            conversation_id,
            direction: Direction::from_sender(&sender),
            sender,
            content: content.into(),
            created_at,
            delivery_metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.delivery_metadata = Some(metadata);
        self
    }

    pub fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageRecord {
    id: MessageId,
    conversation_id: ConversationId,
    sender: String,
    content: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    metadata_json: Option<String>,
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        let mut message = Message::new(
            record.id,
            record.conversation_id,
            record.sender,
            record.content,
            record.timestamp,
        );
        // Analysis metadata is best-effort; a broken blob is treated as absent.
        message.delivery_metadata = record
            .metadata_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());
        message
    }
}

impl From<Message> for MessageRecord {
    fn from(value: Message) -> Self {
        Self {
            id: value.id,
            conversation_id: value.conversation_id,
            sender: value.sender,
            content: value.content,
            timestamp: value.created_at,
            metadata_json: value.delivery_metadata.map(|meta| meta.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_addresses_are_detected_with_and_without_domain() {
        assert!(is_group_address("120363025246125888@g.us"));
        assert!(is_group_address("120363025246125888"));
        assert!(!is_group_address("15551234567"));
        assert!(!is_group_address("15551234567@s.whatsapp.net"));
    }

    #[test]
    fn message_record_derives_direction_and_parses_metadata() {
        let raw = r#"{
            "id": 9,
            "tenant_id": 1,
            "conversation_id": 4,
            "sender": "agent",
            "content": "on my way",
            "timestamp": "2024-05-01T10:00:00Z",
            "metadata_json": "{\"analysis\":{\"is_important\":true}}",
            "created_at": "2024-05-01T10:00:01Z"
        }"#;
        let message: Message = serde_json::from_str(raw).expect("decode");
        assert_eq!(message.id, MessageId(9));
        assert_eq!(message.direction, Direction::Outbound);
        assert_eq!(
            message.delivery_metadata,
            Some(serde_json::json!({"analysis": {"is_important": true}}))
        );
    }

    #[test]
    fn unparseable_metadata_is_dropped() {
        let raw = r#"{"id":1,"conversation_id":2,"sender":"15551234567",
            "content":"hi","timestamp":"2024-05-01T10:00:00Z","metadata_json":"{not json"}"#;
        let message: Message = serde_json::from_str(raw).expect("decode");
        assert_eq!(message.direction, Direction::Inbound);
        assert!(message.delivery_metadata.is_none());
    }

    #[test]
    fn conversation_title_falls_back_to_address() {
        let raw = r#"{"id":3,"tenant_id":1,"contact_number":"120363000000001",
            "contact_name":null,"last_message_at":null,"created_at":"2024-05-01T10:00:00Z"}"#;
        let conversation: Conversation = serde_json::from_str(raw).expect("decode");
        assert!(conversation.is_group);
        assert_eq!(conversation.title(), "120363000000001");
        assert_eq!(conversation.last_message_preview, "");
    }
}
