//! Push-channel subscription and routing of inbound events.
//!
//! One supervisor task per authenticated session owns the subscription: it
//! consumes frames strictly in delivery order and, when the channel fails or
//! closes, waits a fixed delay before subscribing again. The wait is the only
//! pending reconnect. Materialized state is left alone during an outage.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use shared::{
    domain::{ConversationId, Message},
    protocol::{SyncEvent, SyncEventKind},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    directory::ConversationDirectory,
    error::{ClientError, Result, TransportError},
    message_store::MessageStore,
    session::SessionContext,
    transport::{PushChannel, PushStream},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Live,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone)]
pub enum SyncNotice {
    Status(ConnectionStatus),
    /// A decoded event, forwarded after the core reacted to it.
    Event(SyncEvent),
    Dropped { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub connections: u64,
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub reconnects_scheduled: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub reconnect_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for SyncSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            reconnect_delay: settings.reconnect_delay(),
        }
    }
}

struct CoordinatorState {
    status: ConnectionStatus,
    supervisor: Option<JoinHandle<()>>,
    stats: SyncStats,
}

pub struct SyncCoordinator {
    push: Arc<dyn PushChannel>,
    session: SessionContext,
    directory: Arc<ConversationDirectory>,
    store: Arc<MessageStore>,
    settings: SyncSettings,
    inner: Mutex<CoordinatorState>,
    events: broadcast::Sender<SyncNotice>,
}

impl SyncCoordinator {
    pub fn new(
        push: Arc<dyn PushChannel>,
        session: SessionContext,
        directory: Arc<ConversationDirectory>,
        store: Arc<MessageStore>,
        settings: SyncSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            push,
            session,
            directory,
            store,
            settings,
            inner: Mutex::new(CoordinatorState {
                status: ConnectionStatus::Idle,
                supervisor: None,
                stats: SyncStats::default(),
            }),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotice> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.inner.lock().await.status
    }

    pub async fn stats(&self) -> SyncStats {
        self.inner.lock().await.stats
    }

    /// Starts the subscription. Calling it again while running is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.session.is_authenticated().await {
            return Err(ClientError::NotAuthenticated);
        }
        let mut guard = self.inner.lock().await;
        if guard
            .supervisor
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            debug!("sync: already running");
            return Ok(());
        }
        let coordinator = Arc::clone(self);
        guard.supervisor = Some(tokio::spawn(async move { coordinator.run().await }));
        info!("sync: started");
        Ok(())
    }

    /// Drops the subscription and any pending reconnect.
    pub async fn stop(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(task) = guard.supervisor.take() {
            task.abort();
        }
        guard.status = ConnectionStatus::Stopped;
        self.emit(SyncNotice::Status(ConnectionStatus::Stopped));
        info!("sync: stopped");
    }

    /// Supervisor loop. Ends on its own once the session loses its
    /// credential; a reconnect never outlives the session it was made for.
    async fn run(self: Arc<Self>) {
        loop {
            if !self.session.is_authenticated().await {
                self.set_status(ConnectionStatus::Stopped).await;
                info!("sync: session signed out, subscription ended");
                return;
            }
            self.set_status(ConnectionStatus::Connecting).await;
            match self.push.subscribe().await {
                Ok(stream) => {
                    {
                        let mut guard = self.inner.lock().await;
                        guard.stats.connections += 1;
                    }
                    self.set_status(ConnectionStatus::Live).await;
                    self.consume(stream).await;
                }
                Err(TransportError::Unauthenticated) => {
                    self.set_status(ConnectionStatus::Stopped).await;
                    info!("sync: push channel has no credential, subscription ended");
                    return;
                }
                Err(err) => warn!("sync: subscribe failed: {err}"),
            }

            {
                let mut guard = self.inner.lock().await;
                guard.stats.reconnects_scheduled += 1;
            }
            self.set_status(ConnectionStatus::Reconnecting).await;
            info!(
                delay_ms = self.settings.reconnect_delay.as_millis() as u64,
                "sync: reconnect scheduled"
            );
            tokio::time::sleep(self.settings.reconnect_delay).await;
        }
    }

    async fn consume(&self, mut stream: PushStream) {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(text) => self.handle_frame(&text).await,
                Err(err) => {
                    warn!("sync: push channel error: {err}");
                    return;
                }
            }
        }
        warn!("sync: push channel closed by server");
    }

    /// Routes one frame. Malformed frames are dropped; nothing here stops the
    /// consumer loop.
    pub async fn handle_frame(&self, text: &str) {
        let event = match serde_json::from_str::<SyncEvent>(text) {
            Ok(event) => event,
            Err(err) => {
                self.drop_frame(format!("invalid sync event: {err}")).await;
                return;
            }
        };
        if event.kind == SyncEventKind::MessageReceived && event.conversation_id.is_none() {
            self.drop_frame("message.received without conversation_id".to_string())
                .await;
            return;
        }

        self.inner.lock().await.stats.frames_processed += 1;
        let open = self.store.open_conversation().await;

        if event.kind.creates_message() {
            self.spawn_directory_refresh();
            match (open, event.conversation_id) {
                (Some(open), Some(target)) if open == target => {
                    self.update_open_conversation(open, event.embedded_message())
                        .await;
                }
                // Reply/forward broadcasts name only the message.
                (Some(open), None) => self.spawn_latest_refresh(open),
                (_, target) => {
                    debug!(conversation_id = ?target, "sync: event for conversation that is not open");
                }
            }
        } else if event.kind == SyncEventKind::MessageAnalysis {
            if let Some(open) = open {
                self.spawn_latest_refresh(open);
            }
        }

        self.emit(SyncNotice::Event(event));
    }

    async fn update_open_conversation(&self, open: ConversationId, message: Option<Message>) {
        match message {
            Some(message) if message.conversation_id == open => {
                self.store.apply_delivery(message).await;
            }
            _ => self.spawn_latest_refresh(open),
        }
    }

    fn spawn_directory_refresh(&self) {
        let directory = Arc::clone(&self.directory);
        tokio::spawn(async move {
            let _ = directory.refresh().await;
        });
    }

    fn spawn_latest_refresh(&self, conversation_id: ConversationId) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            store.refresh_latest(conversation_id).await;
        });
    }

    async fn drop_frame(&self, reason: String) {
        warn!("sync: dropping frame: {reason}");
        self.inner.lock().await.stats.frames_dropped += 1;
        self.emit(SyncNotice::Dropped { reason });
    }

    async fn set_status(&self, status: ConnectionStatus) {
        let mut guard = self.inner.lock().await;
        if guard.status != status {
            guard.status = status;
            self.emit(SyncNotice::Status(status));
        }
    }

    fn emit(&self, notice: SyncNotice) {
        let _ = self.events.send(notice);
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
