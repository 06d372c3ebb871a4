use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, Message, MessageId, TenantId};

/// Status strings reported by the pairing endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RemotePairingStatus {
    Pending,
    Connected,
    Expired,
    Failed,
    Other(String),
}

impl From<String> for RemotePairingStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "pending" | "generating" | "waiting" => RemotePairingStatus::Pending,
            "connected" => RemotePairingStatus::Connected,
            "timeout" | "expired" => RemotePairingStatus::Expired,
            "error" | "failed" => RemotePairingStatus::Failed,
            _ => RemotePairingStatus::Other(value),
        }
    }
}

impl From<RemotePairingStatus> for String {
    fn from(value: RemotePairingStatus) -> Self {
        match value {
            RemotePairingStatus::Pending => "pending".to_string(),
            RemotePairingStatus::Connected => "connected".to_string(),
            RemotePairingStatus::Expired => "timeout".to_string(),
            RemotePairingStatus::Failed => "error".to_string(),
            RemotePairingStatus::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingStartResponse {
    pub session_id: String,
    #[serde(default)]
    pub qr_code: Option<String>,
    pub status: RemotePairingStatus,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Poll response. The backend returns a flat session body while pending and a
/// login body (`token`, `csrf`) once the device is linked; both decode here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairingStatusResponse {
    pub status: Option<RemotePairingStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csrf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
}

impl PairingStatusResponse {
    /// A QR payload, ignoring the empty string the backend sends before the
    /// first code is generated.
    pub fn qr_code(&self) -> Option<&str> {
        non_empty(self.qr_code.as_deref())
    }

    pub fn error(&self) -> Option<&str> {
        non_empty(self.error.as_deref())
    }
}

impl PairingStartResponse {
    pub fn qr_code(&self) -> Option<&str> {
        non_empty(self.qr_code.as_deref())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Envelope used by the list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRequest {
    pub conversation_id: ConversationId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub message_id: MessageId,
    pub target_conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SyncEventKind {
    MessageReceived,
    MessageReply,
    MessageForward,
    MessageAnalysis,
    ActionItem(String),
    PresenceUpdate,
    Typing,
    Unknown(String),
}

impl SyncEventKind {
    /// Events that add a message to some conversation.
    pub fn creates_message(&self) -> bool {
        matches!(
            self,
            SyncEventKind::MessageReceived
                | SyncEventKind::MessageReply
                | SyncEventKind::MessageForward
        )
    }
}

impl From<String> for SyncEventKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "message.received" => SyncEventKind::MessageReceived,
            "message.reply" => SyncEventKind::MessageReply,
            "message.forward" => SyncEventKind::MessageForward,
            "message.analysis" => SyncEventKind::MessageAnalysis,
            "presence.update" => SyncEventKind::PresenceUpdate,
            "typing" => SyncEventKind::Typing,
            _ if value.starts_with("action_item") => SyncEventKind::ActionItem(value),
            _ => SyncEventKind::Unknown(value),
        }
    }
}

impl From<SyncEventKind> for String {
    fn from(value: SyncEventKind) -> Self {
        match value {
            SyncEventKind::MessageReceived => "message.received".to_string(),
            SyncEventKind::MessageReply => "message.reply".to_string(),
            SyncEventKind::MessageForward => "message.forward".to_string(),
            SyncEventKind::MessageAnalysis => "message.analysis".to_string(),
            SyncEventKind::PresenceUpdate => "presence.update".to_string(),
            SyncEventKind::Typing => "typing".to_string(),
            SyncEventKind::ActionItem(raw) | SyncEventKind::Unknown(raw) => raw,
        }
    }
}

/// A push-channel frame. Fields the core does not interpret are kept in
/// `extra` so they can be forwarded to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    #[serde(rename = "type")]
    pub kind: SyncEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SyncEvent {
    pub fn new(kind: SyncEventKind) -> Self {
        Self {
            kind,
            conversation_id: None,
            message_id: None,
            payload: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn message_received(conversation_id: ConversationId, message_id: MessageId) -> Self {
        Self {
            conversation_id: Some(conversation_id),
            message_id: Some(message_id),
            ..Self::new(SyncEventKind::MessageReceived)
        }
    }

    /// The full message carried in `payload`, either directly or under a
    /// `message` key. Anything that does not decode is ignored.
    pub fn embedded_message(&self) -> Option<Message> {
        let payload = self.payload.as_ref()?;
        let candidate = payload.get("message").unwrap_or(payload);
        serde_json::from_value(candidate.clone()).ok()
    }
}
