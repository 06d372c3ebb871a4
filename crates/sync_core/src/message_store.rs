//! Per-conversation message logs.
//!
//! Every source (page fetches, pushed deliveries, user sends) goes through
//! [`ConversationLog::merge`], which keeps each log deduplicated by id and
//! sorted by `(created_at, id)` no matter the order responses arrive in.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use shared::domain::{ConversationId, Message, MessageId};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{config::Settings, error::Result, transport::BackendApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSettings {
    pub page_size: u32,
    /// Batches larger than this are appended and re-sorted instead of
    /// merge-inserted one by one.
    pub resort_threshold: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for StoreSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            page_size: settings.page_size,
            resort_threshold: settings.merge_resort_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub duplicates: usize,
    /// Duplicates that filled in metadata the stored copy lacked.
    pub enriched: usize,
    /// Candidates addressed to another conversation.
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied(MergeReport),
    /// Guard hit: nothing more to load, a load already in flight, or the
    /// conversation is not open.
    Skipped,
    /// The response arrived for a conversation or generation that is no
    /// longer current.
    Discarded,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationLogView {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
    pub has_more_older: bool,
    pub loading_older: bool,
    pub fetch_failed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ConversationLog {
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
    has_more_older: bool,
    pages_loaded: u32,
    loading_older: bool,
    generation: u64,
    fetch_failed: bool,
}

impl ConversationLog {
    fn with_generation(generation: u64) -> Self {
        Self {
            generation,
            ..Self::default()
        }
    }

    /// Idempotent, order-restoring insert. Existing entries are never moved
    /// relative to each other.
    pub(crate) fn merge(
        &mut self,
        conversation_id: ConversationId,
        candidates: Vec<Message>,
        resort_threshold: usize,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        let mut fresh = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            if candidate.conversation_id != conversation_id {
                report.rejected += 1;
                continue;
            }
            if !self.ids.insert(candidate.id) {
                report.duplicates += 1;
                if self.enrich(candidate) {
                    report.enriched += 1;
                }
                continue;
            }
            fresh.push(candidate);
        }

        report.inserted = fresh.len();
        if fresh.is_empty() {
            return report;
        }

        if fresh.len() > resort_threshold {
            self.messages.extend(fresh);
            // Stable; keys are unique so the existing order survives.
            self.messages.sort_by_key(Message::sort_key);
        } else {
            for message in fresh {
                let key = message.sort_key();
                let index = self
                    .messages
                    .partition_point(|existing| existing.sort_key() < key);
                self.messages.insert(index, message);
            }
        }
        report
    }

    fn enrich(&mut self, candidate: Message) -> bool {
        let Some(metadata) = candidate.delivery_metadata else {
            return false;
        };
        match self
            .messages
            .iter_mut()
            .find(|existing| existing.id == candidate.id)
        {
            Some(existing) if existing.delivery_metadata.is_none() => {
                existing.delivery_metadata = Some(metadata);
                true
            }
            _ => false,
        }
    }

    fn view(&self, conversation_id: ConversationId) -> ConversationLogView {
        ConversationLogView {
            conversation_id,
            messages: self.messages.clone(),
            has_more_older: self.has_more_older,
            loading_older: self.loading_older,
            fetch_failed: self.fetch_failed,
        }
    }
}

#[derive(Default)]
struct StoreState {
    open: Option<ConversationId>,
    logs: HashMap<ConversationId, ConversationLog>,
    next_generation: u64,
}

pub struct MessageStore {
    api: Arc<dyn BackendApi>,
    settings: StoreSettings,
    inner: Mutex<StoreState>,
}

impl MessageStore {
    pub fn new(api: Arc<dyn BackendApi>, settings: StoreSettings) -> Arc<Self> {
        Arc::new(Self {
            api,
            settings,
            inner: Mutex::new(StoreState::default()),
        })
    }

    pub async fn open_conversation(&self) -> Option<ConversationId> {
        self.inner.lock().await.open
    }

    /// Pointer change only; in-flight loads for the previous conversation
    /// will be discarded when they land.
    pub async fn set_open(&self, conversation_id: ConversationId) {
        self.inner.lock().await.open = Some(conversation_id);
    }

    pub async fn close(&self) {
        self.inner.lock().await.open = None;
    }

    pub async fn view(&self, conversation_id: ConversationId) -> Option<ConversationLogView> {
        self.inner
            .lock()
            .await
            .logs
            .get(&conversation_id)
            .map(|log| log.view(conversation_id))
    }

    pub async fn messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .logs
            .get(&conversation_id)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    /// Merges candidates into a conversation's log, creating it if needed.
    pub async fn merge(
        &self,
        conversation_id: ConversationId,
        candidates: Vec<Message>,
    ) -> MergeReport {
        let mut guard = self.inner.lock().await;
        guard
            .logs
            .entry(conversation_id)
            .or_default()
            .merge(conversation_id, candidates, self.settings.resort_threshold)
    }

    /// Opens the conversation, discards its log and fetches the newest page.
    pub async fn load_initial(&self, conversation_id: ConversationId) -> LoadOutcome {
        let generation = {
            let mut guard = self.inner.lock().await;
            guard.open = Some(conversation_id);
            guard.next_generation += 1;
            let generation = guard.next_generation;
            guard
                .logs
                .insert(conversation_id, ConversationLog::with_generation(generation));
            generation
        };
        debug!(%conversation_id, generation, "store: loading initial page");

        let result = self
            .api
            .fetch_page(conversation_id, 1, self.settings.page_size)
            .await;

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let current = state.logs.get_mut(&conversation_id);
        let log = match current {
            Some(log) if state.open == Some(conversation_id) && log.generation == generation => log,
            _ => {
                debug!(%conversation_id, generation, "store: discarding stale initial page");
                return LoadOutcome::Discarded;
            }
        };

        match result {
            Err(err) => {
                warn!(%conversation_id, "store: initial page fetch failed: {err}");
                log.fetch_failed = true;
                LoadOutcome::Failed
            }
            Ok(page) => {
                let count = page.len();
                let report = log.merge(conversation_id, page, self.settings.resort_threshold);
                log.has_more_older = count == self.settings.page_size as usize;
                log.pages_loaded = 1;
                log.fetch_failed = false;
                info!(
                    %conversation_id,
                    inserted = report.inserted,
                    has_more_older = log.has_more_older,
                    "store: initial page applied"
                );
                LoadOutcome::Applied(report)
            }
        }
    }

    /// Backfills the next older page. Single-flight per conversation.
    pub async fn load_older(&self, conversation_id: ConversationId) -> LoadOutcome {
        let (page, generation) = {
            let mut guard = self.inner.lock().await;
            let state = &mut *guard;
            if state.open != Some(conversation_id) {
                return LoadOutcome::Skipped;
            }
            let Some(log) = state.logs.get_mut(&conversation_id) else {
                return LoadOutcome::Skipped;
            };
            if !log.has_more_older || log.loading_older {
                return LoadOutcome::Skipped;
            }
            log.loading_older = true;
            (log.pages_loaded + 1, log.generation)
        };
        debug!(%conversation_id, page, "store: loading older page");

        let result = self
            .api
            .fetch_page(conversation_id, page, self.settings.page_size)
            .await;

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let still_open = state.open == Some(conversation_id);
        let log = match state.logs.get_mut(&conversation_id) {
            // A newer load_initial replaced the log and its guards.
            Some(log) if log.generation == generation => log,
            _ => {
                debug!(%conversation_id, page, "store: discarding older page for reset log");
                return LoadOutcome::Discarded;
            }
        };
        log.loading_older = false;
        if !still_open {
            debug!(%conversation_id, page, "store: discarding older page for closed conversation");
            return LoadOutcome::Discarded;
        }

        match result {
            Err(err) => {
                warn!(%conversation_id, page, "store: older page fetch failed: {err}");
                log.fetch_failed = true;
                LoadOutcome::Failed
            }
            Ok(messages) => {
                let count = messages.len();
                let report = log.merge(conversation_id, messages, self.settings.resort_threshold);
                log.has_more_older = count == self.settings.page_size as usize;
                log.pages_loaded = page;
                log.fetch_failed = false;
                debug!(
                    %conversation_id,
                    page,
                    inserted = report.inserted,
                    has_more_older = log.has_more_older,
                    "store: older page applied"
                );
                LoadOutcome::Applied(report)
            }
        }
    }

    /// Re-fetches the newest page and merges it without discarding the log.
    pub async fn refresh_latest(&self, conversation_id: ConversationId) -> LoadOutcome {
        if !self.inner.lock().await.logs.contains_key(&conversation_id) {
            return LoadOutcome::Skipped;
        }

        let result = self
            .api
            .fetch_page(conversation_id, 1, self.settings.page_size)
            .await;

        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        let is_open = state.open == Some(conversation_id);
        let Some(log) = state.logs.get_mut(&conversation_id) else {
            return LoadOutcome::Discarded;
        };
        match result {
            Err(err) => {
                warn!(%conversation_id, "store: latest page refresh failed: {err}");
                if is_open {
                    log.fetch_failed = true;
                }
                LoadOutcome::Failed
            }
            Ok(messages) => {
                let count = messages.len();
                let report = log.merge(conversation_id, messages, self.settings.resort_threshold);
                if log.pages_loaded == 0 {
                    log.pages_loaded = 1;
                    log.has_more_older = count == self.settings.page_size as usize;
                }
                log.fetch_failed = false;
                debug!(
                    %conversation_id,
                    inserted = report.inserted,
                    enriched = report.enriched,
                    "store: latest page merged"
                );
                LoadOutcome::Applied(report)
            }
        }
    }

    /// Merges one pushed message. Messages for conversations without a log
    /// are ignored; they arrive with the next load.
    pub async fn apply_delivery(&self, message: Message) -> LoadOutcome {
        let mut guard = self.inner.lock().await;
        let conversation_id = message.conversation_id;
        let Some(log) = guard.logs.get_mut(&conversation_id) else {
            debug!(%conversation_id, message_id = %message.id, "store: delivery for unloaded conversation ignored");
            return LoadOutcome::Skipped;
        };
        let report = log.merge(conversation_id, vec![message], self.settings.resort_threshold);
        LoadOutcome::Applied(report)
    }

    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<Message> {
        let message = self.api.send_message(conversation_id, content).await?;
        info!(%conversation_id, message_id = %message.id, "store: message sent");
        self.apply_delivery(message.clone()).await;
        Ok(message)
    }

    pub async fn forward_message(
        &self,
        message_id: MessageId,
        target_conversation_id: ConversationId,
    ) -> Result<Message> {
        let message = self
            .api
            .forward_message(message_id, target_conversation_id)
            .await?;
        info!(
            source_message_id = %message_id,
            %target_conversation_id,
            message_id = %message.id,
            "store: message forwarded"
        );
        self.apply_delivery(message.clone()).await;
        Ok(message)
    }
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
