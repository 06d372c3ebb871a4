use std::sync::Arc;

use shared::domain::{Conversation, ConversationId};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    error::{ClientError, Result},
    transport::BackendApi,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GroupFilter {
    #[default]
    All,
    Groups,
    Direct,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryFilter {
    pub search: String,
    pub group: GroupFilter,
}

impl DirectoryFilter {
    pub fn search(term: impl Into<String>) -> Self {
        Self {
            search: term.into(),
            group: GroupFilter::All,
        }
    }

    pub fn matches(&self, conversation: &Conversation) -> bool {
        let group_ok = match self.group {
            GroupFilter::All => true,
            GroupFilter::Groups => conversation.is_group,
            GroupFilter::Direct => !conversation.is_group,
        };
        if !group_ok {
            return false;
        }
        let term = self.search.trim().to_lowercase();
        if term.is_empty() {
            return true;
        }
        conversation
            .display_name
            .as_deref()
            .is_some_and(|name| name.to_lowercase().contains(&term))
            || conversation.external_address.to_lowercase().contains(&term)
    }
}

#[derive(Default)]
struct DirectoryState {
    conversations: Vec<Conversation>,
    selected: Option<ConversationId>,
    last_error: Option<String>,
    issued: u64,
    applied: u64,
}

/// Canonical conversation list. Refresh replaces it wholesale; views and
/// selection never touch other components.
pub struct ConversationDirectory {
    api: Arc<dyn BackendApi>,
    limit: u32,
    inner: RwLock<DirectoryState>,
}

impl ConversationDirectory {
    pub fn new(api: Arc<dyn BackendApi>, limit: u32) -> Arc<Self> {
        Arc::new(Self {
            api,
            limit,
            inner: RwLock::new(DirectoryState::default()),
        })
    }

    /// Fetches the list and replaces the cache. On failure the previous list
    /// is kept and the error recorded.
    pub async fn refresh(&self) -> Result<usize> {
        let sequence = {
            let mut guard = self.inner.write().await;
            guard.issued += 1;
            guard.issued
        };

        let result = self.api.list_conversations(self.limit).await;

        let mut guard = self.inner.write().await;
        match result {
            Err(err) => {
                warn!(sequence, "directory: refresh failed: {err}");
                if sequence >= guard.applied {
                    guard.last_error = Some(err.to_string());
                }
                Err(ClientError::Transport(err))
            }
            Ok(conversations) => {
                if sequence < guard.applied {
                    debug!(sequence, applied = guard.applied, "directory: discarding out-of-date refresh");
                    return Ok(guard.conversations.len());
                }
                guard.applied = sequence;
                guard.conversations = conversations;
                guard.last_error = None;
                debug!(count = guard.conversations.len(), "directory: refreshed");
                Ok(guard.conversations.len())
            }
        }
    }

    /// Asks the backend to re-sync contacts from the linked device, then
    /// refreshes.
    pub async fn sync_contacts(&self) -> Result<usize> {
        self.api.sync_contacts().await?;
        info!("directory: contact sync requested");
        self.refresh().await
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.inner.read().await.conversations.clone()
    }

    pub async fn view(&self, filter: &DirectoryFilter) -> Vec<Conversation> {
        filter_conversations(&self.inner.read().await.conversations, filter)
    }

    pub async fn get(&self, conversation_id: ConversationId) -> Option<Conversation> {
        self.inner
            .read()
            .await
            .conversations
            .iter()
            .find(|conversation| conversation.id == conversation_id)
            .cloned()
    }

    pub async fn select(&self, conversation_id: ConversationId) {
        self.inner.write().await.selected = Some(conversation_id);
    }

    pub async fn clear_selection(&self) {
        self.inner.write().await.selected = None;
    }

    pub async fn selected_id(&self) -> Option<ConversationId> {
        self.inner.read().await.selected
    }

    /// The selected conversation, if it is still in the list.
    pub async fn selected(&self) -> Option<Conversation> {
        let guard = self.inner.read().await;
        let selected = guard.selected?;
        guard
            .conversations
            .iter()
            .find(|conversation| conversation.id == selected)
            .cloned()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.read().await.last_error.clone()
    }
}

/// Pure view over a list; order is preserved.
pub fn filter_conversations(
    conversations: &[Conversation],
    filter: &DirectoryFilter,
) -> Vec<Conversation> {
    conversations
        .iter()
        .filter(|conversation| filter.matches(conversation))
        .cloned()
        .collect()
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
