use std::sync::Arc;

use shared::domain::ConversationId;
use tracing::{info, warn};

use crate::{
    config::Settings,
    directory::ConversationDirectory,
    error::{ClientError, Result},
    message_store::{LoadOutcome, MessageStore, StoreSettings},
    pairing::{PairingController, PairingSession, PairingSettings, PairingStatus},
    session::SessionContext,
    sync::{SyncCoordinator, SyncSettings},
    transport::{BackendApi, HttpBackend, PushChannel, WsPushChannel},
};

/// Wires the components of one session around a shared [`SessionContext`].
pub struct SyncClient {
    pairing: Arc<PairingController>,
    directory: Arc<ConversationDirectory>,
    store: Arc<MessageStore>,
    coordinator: Arc<SyncCoordinator>,
    session: SessionContext,
}

impl SyncClient {
    /// Builds the HTTP backend and WebSocket push channel from settings.
    pub fn new(settings: &Settings, session: SessionContext) -> Result<Self> {
        settings.validate()?;
        let api = HttpBackend::new(
            settings.api_base_url.clone(),
            session.clone(),
            settings.request_timeout(),
        )?;
        let push = WsPushChannel::new(
            &settings.api_base_url,
            settings.ws_base_url.as_deref(),
            session.clone(),
        )?;
        info!(
            api_base_url = %settings.api_base_url,
            push_endpoint = %push.endpoint(),
            "client: transports ready"
        );
        Ok(Self::with_transport(
            Arc::new(api),
            Arc::new(push),
            session,
            settings,
        ))
    }

    pub fn with_transport(
        api: Arc<dyn BackendApi>,
        push: Arc<dyn PushChannel>,
        session: SessionContext,
        settings: &Settings,
    ) -> Self {
        let pairing = PairingController::new(
            Arc::clone(&api),
            session.clone(),
            PairingSettings::from(settings),
        );
        let directory = ConversationDirectory::new(Arc::clone(&api), settings.directory_limit);
        let store = MessageStore::new(api, StoreSettings::from(settings));
        let coordinator = SyncCoordinator::new(
            push,
            session.clone(),
            Arc::clone(&directory),
            Arc::clone(&store),
            SyncSettings::from(settings),
        );
        Self {
            pairing,
            directory,
            store,
            coordinator,
            session,
        }
    }

    pub fn pairing(&self) -> &Arc<PairingController> {
        &self.pairing
    }

    pub fn directory(&self) -> &Arc<ConversationDirectory> {
        &self.directory
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Selects the conversation in the directory and loads its newest page.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> LoadOutcome {
        self.directory.select(conversation_id).await;
        self.store.load_initial(conversation_id).await
    }

    pub async fn close_conversation(&self) {
        self.directory.clear_selection().await;
        self.store.close().await;
    }

    /// Loads the directory and subscribes to the push channel.
    pub async fn start_sync(&self) -> Result<()> {
        if !self.session.is_authenticated().await {
            return Err(ClientError::NotAuthenticated);
        }
        if let Err(err) = self.directory.refresh().await {
            // The subscription still starts; the next event retries the list.
            warn!("client: initial directory load failed: {err}");
        }
        self.coordinator.start().await
    }

    /// Begins a fresh pairing. A running subscription belongs to the
    /// credential being replaced, so it is stopped first.
    pub async fn start_pairing(&self) -> PairingSession {
        self.coordinator.stop().await;
        self.pairing.start().await
    }

    /// Stops sync, then unlinks the device and clears the credential.
    pub async fn logout(&self) {
        self.coordinator.stop().await;
        self.pairing.logout().await;
        info!("client: logged out");
    }

    /// Stops the subscription and any pairing poll.
    pub async fn shutdown(&self) {
        self.coordinator.stop().await;
        let status = self.pairing.snapshot().await.status;
        if matches!(status, PairingStatus::Generating | PairingStatus::Pending) {
            self.pairing.cancel().await;
        }
        info!("client: shut down");
    }
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
