//! In-memory backend and push channel used by the component tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use shared::{
    domain::{Conversation, ConversationId, Message, MessageId, TenantId},
    protocol::{PairingStartResponse, PairingStatusResponse, RemotePairingStatus},
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    error::TransportError,
    session::{Credential, SessionContext},
    transport::{BackendApi, PushChannel, PushStream},
};

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_714_557_600 + seconds, 0)
        .single()
        .expect("valid timestamp")
}

pub(crate) fn message(id: i64, conversation: i64, seconds: i64) -> Message {
    Message::new(
        MessageId(id),
        ConversationId(conversation),
        "15550001111",
        format!("message {id}"),
        at(seconds),
    )
}

pub(crate) fn conversation(id: i64, address: &str, name: Option<&str>) -> Conversation {
    Conversation::new(
        ConversationId(id),
        address,
        name.map(str::to_string),
        None,
    )
}

pub(crate) fn credential() -> Credential {
    Credential {
        token: "jwt-token".into(),
        csrf: "csrf-token".into(),
        tenant_id: Some(TenantId(1)),
    }
}

pub(crate) fn authenticated() -> SessionContext {
    SessionContext::with_credential(credential())
}

pub(crate) fn ids(messages: &[Message]) -> Vec<i64> {
    messages.iter().map(|message| message.id.0).collect()
}

pub(crate) fn pending_status(qr: Option<&str>) -> PairingStatusResponse {
    PairingStatusResponse {
        status: Some(RemotePairingStatus::Pending),
        qr_code: qr.map(str::to_string),
        ..PairingStatusResponse::default()
    }
}

pub(crate) fn connected_status() -> PairingStatusResponse {
    PairingStatusResponse {
        status: Some(RemotePairingStatus::Connected),
        token: Some("jwt-token".into()),
        csrf: Some("csrf-token".into()),
        tenant_id: Some(TenantId(1)),
        ..PairingStatusResponse::default()
    }
}

/// Re-evaluates a condition (which may `.await`) until it holds, sleeping
/// briefly so spawned tasks can run.
macro_rules! eventually {
    ($condition:expr) => {{
        let mut reached = false;
        for _ in 0..500 {
            if $condition {
                reached = true;
                break;
            }
            ::tokio::time::sleep(::std::time::Duration::from_millis(2)).await;
        }
        assert!(reached, "condition not reached: {}", stringify!($condition));
    }};
}
pub(crate) use eventually;

fn server_error(status: u16) -> TransportError {
    TransportError::status(status, r#"{"error":"scripted failure"}"#)
}

#[derive(Default)]
struct BackendState {
    start_calls: u32,
    start_script: VecDeque<Result<PairingStartResponse, u16>>,
    status_requests: Vec<String>,
    status_script: VecDeque<Result<PairingStatusResponse, u16>>,
    status_gates: VecDeque<oneshot::Receiver<()>>,
    logout_calls: u32,
    sync_contacts_calls: u32,
    conversations: Vec<Conversation>,
    list_calls: u32,
    list_failures: u32,
    list_gates: VecDeque<oneshot::Receiver<()>>,
    pages: HashMap<(ConversationId, u32), Vec<Message>>,
    page_requests: Vec<(ConversationId, u32)>,
    page_gates: HashMap<(ConversationId, u32), VecDeque<oneshot::Receiver<()>>>,
    failing_pages: HashSet<(ConversationId, u32)>,
    next_message_id: i64,
    sent: Vec<(ConversationId, String)>,
}

/// Scripted [`BackendApi`]. Unscripted pairing calls answer `pending`;
/// unscripted pages are empty.
#[derive(Default)]
pub(crate) struct FakeBackend {
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub(crate) fn new() -> Arc<Self> {
        let backend = Self::default();
        backend.lock().next_message_id = 1_000;
        Arc::new(backend)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().expect("fake backend state")
    }

    pub(crate) fn script_start(&self, response: Result<PairingStartResponse, u16>) {
        self.lock().start_script.push_back(response);
    }

    pub(crate) fn script_status(&self, response: Result<PairingStatusResponse, u16>) {
        self.lock().status_script.push_back(response);
    }

    /// Holds the next status poll until the returned sender fires or drops.
    pub(crate) fn gate_status(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.lock().status_gates.push_back(rx);
        tx
    }

    pub(crate) fn start_calls(&self) -> u32 {
        self.lock().start_calls
    }

    pub(crate) fn status_requests(&self) -> Vec<String> {
        self.lock().status_requests.clone()
    }

    pub(crate) fn logout_calls(&self) -> u32 {
        self.lock().logout_calls
    }

    pub(crate) fn sync_contacts_calls(&self) -> u32 {
        self.lock().sync_contacts_calls
    }

    pub(crate) fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.lock().conversations = conversations;
    }

    pub(crate) fn fail_next_lists(&self, count: u32) {
        self.lock().list_failures = count;
    }

    /// Holds the next conversation listing until the returned sender fires
    /// or drops. Whether it fails is decided when the call is made.
    pub(crate) fn gate_list(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.lock().list_gates.push_back(rx);
        tx
    }

    pub(crate) fn list_calls(&self) -> u32 {
        self.lock().list_calls
    }

    /// Scripts a page; a page previously set to fail answers again.
    pub(crate) fn set_page(&self, conversation: i64, page: u32, messages: Vec<Message>) {
        let key = (ConversationId(conversation), page);
        let mut state = self.lock();
        state.failing_pages.remove(&key);
        state.pages.insert(key, messages);
    }

    pub(crate) fn fail_page(&self, conversation: i64, page: u32) {
        self.lock()
            .failing_pages
            .insert((ConversationId(conversation), page));
    }

    /// Holds the next fetch of this page until the returned sender fires or
    /// drops.
    pub(crate) fn gate_page(&self, conversation: i64, page: u32) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.lock()
            .page_gates
            .entry((ConversationId(conversation), page))
            .or_default()
            .push_back(rx);
        tx
    }

    pub(crate) fn page_requests(&self) -> Vec<(i64, u32)> {
        self.lock()
            .page_requests
            .iter()
            .map(|(conversation, page)| (conversation.0, *page))
            .collect()
    }

    pub(crate) fn sent(&self) -> Vec<(ConversationId, String)> {
        self.lock().sent.clone()
    }
}

#[async_trait]
impl BackendApi for FakeBackend {
    async fn start_pairing(&self) -> Result<PairingStartResponse, TransportError> {
        let mut state = self.lock();
        state.start_calls += 1;
        let n = state.start_calls;
        match state.start_script.pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(status)) => Err(server_error(status)),
            None => Ok(PairingStartResponse {
                session_id: format!("session-{n}"),
                qr_code: Some(format!("qr-{n}")),
                status: RemotePairingStatus::Pending,
                timeout_seconds: Some(120),
                poll_interval_ms: None,
                error: None,
            }),
        }
    }

    async fn pairing_status(
        &self,
        session_id: &str,
    ) -> Result<PairingStatusResponse, TransportError> {
        let gate = {
            let mut state = self.lock();
            state.status_requests.push(session_id.to_string());
            state.status_gates.pop_front()
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let scripted = self.lock().status_script.pop_front();
        match scripted {
            Some(Ok(response)) => Ok(response),
            Some(Err(status)) => Err(server_error(status)),
            None => Ok(pending_status(None)),
        }
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.lock().logout_calls += 1;
        Ok(())
    }

    async fn sync_contacts(&self) -> Result<(), TransportError> {
        self.lock().sync_contacts_calls += 1;
        Ok(())
    }

    async fn list_conversations(&self, limit: u32) -> Result<Vec<Conversation>, TransportError> {
        let (gate, fail) = {
            let mut state = self.lock();
            state.list_calls += 1;
            let fail = state.list_failures > 0;
            if fail {
                state.list_failures -= 1;
            }
            (state.list_gates.pop_front(), fail)
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if fail {
            return Err(server_error(503));
        }
        let state = self.lock();
        Ok(state
            .conversations
            .iter()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn fetch_page(
        &self,
        conversation_id: ConversationId,
        page: u32,
        _page_size: u32,
    ) -> Result<Vec<Message>, TransportError> {
        let key = (conversation_id, page);
        let gate = {
            let mut state = self.lock();
            state.page_requests.push(key);
            state
                .page_gates
                .get_mut(&key)
                .and_then(VecDeque::pop_front)
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let state = self.lock();
        if state.failing_pages.contains(&key) {
            return Err(server_error(502));
        }
        Ok(state.pages.get(&key).cloned().unwrap_or_default())
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<Message, TransportError> {
        let mut state = self.lock();
        state.next_message_id += 1;
        state.sent.push((conversation_id, content.to_string()));
        Ok(Message::new(
            MessageId(state.next_message_id),
            conversation_id,
            "agent",
            content,
            at(10_000 + state.next_message_id),
        ))
    }

    async fn forward_message(
        &self,
        message_id: MessageId,
        target_conversation_id: ConversationId,
    ) -> Result<Message, TransportError> {
        let mut state = self.lock();
        state.next_message_id += 1;
        state
            .sent
            .push((target_conversation_id, format!("forward {message_id}")));
        Ok(Message::new(
            MessageId(state.next_message_id),
            target_conversation_id,
            "agent",
            format!("forwarded {message_id}"),
            at(10_000 + state.next_message_id),
        ))
    }
}

type Frames = mpsc::UnboundedReceiver<Result<String, TransportError>>;

/// Push channel whose connections are queued by the test. Subscribing with
/// nothing queued fails like a refused connection.
#[derive(Default)]
pub(crate) struct FakePush {
    connections: Mutex<VecDeque<Frames>>,
    subscribes: Mutex<u32>,
}

impl FakePush {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues one connection; frames sent on the returned sender arrive in
    /// order and dropping it closes the stream.
    pub(crate) fn connection(&self) -> mpsc::UnboundedSender<Result<String, TransportError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections
            .lock()
            .expect("fake push state")
            .push_back(rx);
        tx
    }

    pub(crate) fn subscribe_count(&self) -> u32 {
        *self.subscribes.lock().expect("fake push state")
    }
}

#[async_trait]
impl PushChannel for FakePush {
    async fn subscribe(&self) -> Result<PushStream, TransportError> {
        *self.subscribes.lock().expect("fake push state") += 1;
        let next = self
            .connections
            .lock()
            .expect("fake push state")
            .pop_front();
        match next {
            Some(frames) => Ok(UnboundedReceiverStream::new(frames).boxed()),
            None => Err(TransportError::WebSocket("connection refused".into())),
        }
    }
}
