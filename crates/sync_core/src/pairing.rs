//! QR pairing handshake: a timed state machine driven by a cancellable poll
//! task.
//!
//! ```text
//! idle -> generating -> pending -> { connected | expired | failed }
//! ```
//!
//! Terminal states only go back to idle through [`PairingController::start`]
//! or [`PairingController::cancel`]. Running out of poll attempts is the
//! `expired` state, not an error.

use std::{sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use shared::protocol::{PairingStatusResponse, RemotePairingStatus};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    error::{ClientError, Result},
    session::{Credential, SessionContext},
    transport::BackendApi,
};

const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingStatus {
    Idle,
    Generating,
    Pending,
    Connected,
    Expired,
    Failed,
}

impl PairingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PairingStatus::Connected | PairingStatus::Expired | PairingStatus::Failed
        )
    }
}

/// What the user scans. The backend usually sends a PNG data URL; anything
/// else is the raw code to be rendered by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrPayload(String);

impl QrPayload {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn png_bytes(&self) -> Option<Vec<u8>> {
        let encoded = self.0.strip_prefix(PNG_DATA_URL_PREFIX)?;
        STANDARD.decode(encoded).ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairingSession {
    pub session_id: Option<String>,
    pub qr_payload: Option<QrPayload>,
    pub status: PairingStatus,
    pub poll_attempt_count: u32,
    pub max_attempts: u32,
    pub poll_interval: Duration,
    pub credential: Option<Credential>,
    pub last_error: Option<String>,
}

impl PairingSession {
    fn idle(settings: &PairingSettings) -> Self {
        Self {
            session_id: None,
            qr_payload: None,
            status: PairingStatus::Idle,
            poll_attempt_count: 0,
            max_attempts: settings.max_attempts,
            poll_interval: settings.poll_interval,
            credential: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PairingEvent {
    StatusChanged(PairingSession),
    QrRefreshed(QrPayload),
    Connected(Credential),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingSettings {
    pub max_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for PairingSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.pairing_max_attempts,
            poll_interval: settings.pairing_poll_interval(),
        }
    }
}

struct PairingState {
    session: PairingSession,
    /// Bumped by every start/cancel so late `start` responses can be told apart.
    epoch: u64,
    poll_task: Option<JoinHandle<()>>,
}

pub struct PairingController {
    api: Arc<dyn BackendApi>,
    session_context: SessionContext,
    settings: PairingSettings,
    inner: Mutex<PairingState>,
    events: broadcast::Sender<PairingEvent>,
}

impl PairingController {
    pub fn new(
        api: Arc<dyn BackendApi>,
        session_context: SessionContext,
        settings: PairingSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            api,
            session_context,
            inner: Mutex::new(PairingState {
                session: PairingSession::idle(&settings),
                epoch: 0,
                poll_task: None,
            }),
            settings,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    pub fn session_context(&self) -> SessionContext {
        self.session_context.clone()
    }

    pub async fn snapshot(&self) -> PairingSession {
        self.inner.lock().await.session.clone()
    }

    pub async fn credential(&self) -> Result<Credential> {
        let guard = self.inner.lock().await;
        match (guard.session.status, &guard.session.credential) {
            (PairingStatus::Connected, Some(credential)) => Ok(credential.clone()),
            (PairingStatus::Expired, _) => Err(ClientError::SessionExpired),
            _ => Err(ClientError::NotPaired),
        }
    }

    /// Replaces any active session with a fresh one and schedules polling.
    pub async fn start(self: &Arc<Self>) -> PairingSession {
        let epoch = {
            let mut guard = self.inner.lock().await;
            if let Some(task) = guard.poll_task.take() {
                task.abort();
            }
            guard.epoch += 1;
            guard.session = PairingSession::idle(&self.settings);
            guard.session.status = PairingStatus::Generating;
            self.emit(PairingEvent::StatusChanged(guard.session.clone()));
            guard.epoch
        };
        self.session_context.clear().await;
        info!(epoch, "pairing: requesting new session");

        let result = self.api.start_pairing().await;

        let mut guard = self.inner.lock().await;
        if guard.epoch != epoch {
            debug!(epoch, "pairing: discarding start response for replaced session");
            return guard.session.clone();
        }

        match result {
            Err(err) => {
                warn!(epoch, "pairing: start request failed: {err}");
                guard.session.status = PairingStatus::Failed;
                guard.session.last_error = Some(err.to_string());
            }
            Ok(response) => {
                let poll_interval = response
                    .poll_interval_ms
                    .filter(|ms| *ms > 0)
                    .map(Duration::from_millis)
                    .unwrap_or(self.settings.poll_interval);
                guard.session.session_id = Some(response.session_id.clone());
                guard.session.qr_payload = response.qr_code().map(QrPayload::new);
                guard.session.poll_interval = poll_interval;

                match response.status {
                    RemotePairingStatus::Failed => {
                        guard.session.status = PairingStatus::Failed;
                        guard.session.last_error = Some(
                            response
                                .error
                                .clone()
                                .unwrap_or_else(|| "pairing failed to start".to_string()),
                        );
                    }
                    RemotePairingStatus::Expired => {
                        guard.session.status = PairingStatus::Expired;
                    }
                    // A linked device is confirmed by the first poll, which
                    // carries the credential.
                    _ => {
                        guard.session.status = PairingStatus::Pending;
                        guard.poll_task = Some(self.spawn_poll_loop(poll_interval));
                    }
                }
                info!(
                    session_id = %response.session_id,
                    status = ?guard.session.status,
                    poll_interval_ms = poll_interval.as_millis() as u64,
                    "pairing: session started"
                );
            }
        }

        self.emit(PairingEvent::StatusChanged(guard.session.clone()));
        guard.session.clone()
    }

    /// One poll tick. Normally called by the scheduled task; safe to call
    /// directly.
    pub async fn poll(&self) -> PairingSession {
        let session_id = {
            let mut guard = self.inner.lock().await;
            if guard.session.status != PairingStatus::Pending {
                return guard.session.clone();
            }
            guard.session.poll_attempt_count += 1;
            if guard.session.poll_attempt_count >= guard.session.max_attempts {
                info!(
                    attempts = guard.session.poll_attempt_count,
                    "pairing: attempts exhausted; session expired"
                );
                guard.session.status = PairingStatus::Expired;
                guard.poll_task.take();
                self.emit(PairingEvent::StatusChanged(guard.session.clone()));
                return guard.session.clone();
            }
            match guard.session.session_id.clone() {
                Some(session_id) => session_id,
                None => return guard.session.clone(),
            }
        };

        let result = self.api.pairing_status(&session_id).await;

        let mut guard = self.inner.lock().await;
        if guard.session.status != PairingStatus::Pending
            || guard.session.session_id.as_deref() != Some(session_id.as_str())
        {
            debug!(%session_id, "pairing: discarding stale poll response");
            return guard.session.clone();
        }

        match result {
            Err(err) => {
                warn!(
                    %session_id,
                    attempt = guard.session.poll_attempt_count,
                    "pairing: status poll failed: {err}"
                );
                guard.session.last_error = Some(err.to_string());
            }
            Ok(response) => self.apply_status(&mut guard, response).await,
        }
        guard.session.clone()
    }

    async fn apply_status(&self, state: &mut PairingState, response: PairingStatusResponse) {
        let attempt = state.session.poll_attempt_count;
        match response.status.clone() {
            Some(RemotePairingStatus::Connected) => {
                let credential = match (response.token, response.csrf) {
                    (Some(token), Some(csrf)) if !token.is_empty() => Credential {
                        token,
                        csrf,
                        tenant_id: response.tenant_id,
                    },
                    _ => {
                        warn!(attempt, "pairing: connected status without credential");
                        state.session.last_error =
                            Some("connected status carried no credential".to_string());
                        return;
                    }
                };
                self.session_context.set(credential.clone()).await;
                state.session.credential = Some(credential.clone());
                state.session.status = PairingStatus::Connected;
                state.session.last_error = None;
                state.poll_task.take();
                info!(
                    attempt,
                    tenant_id = ?credential.tenant_id,
                    "pairing: device linked"
                );
                self.emit(PairingEvent::Connected(credential));
                self.emit(PairingEvent::StatusChanged(state.session.clone()));
            }
            Some(RemotePairingStatus::Expired) => {
                info!(attempt, "pairing: server reported session expired");
                state.session.status = PairingStatus::Expired;
                state.session.last_error = response.error().map(str::to_string);
                state.poll_task.take();
                self.emit(PairingEvent::StatusChanged(state.session.clone()));
            }
            Some(RemotePairingStatus::Failed) => {
                warn!(attempt, error = ?response.error(), "pairing: server reported failure");
                state.session.status = PairingStatus::Failed;
                state.session.last_error = Some(
                    response
                        .error()
                        .unwrap_or("pairing failed")
                        .to_string(),
                );
                state.poll_task.take();
                self.emit(PairingEvent::StatusChanged(state.session.clone()));
            }
            Some(RemotePairingStatus::Pending) => {
                state.session.last_error = None;
                let Some(qr) = response.qr_code() else {
                    return;
                };
                if state.session.qr_payload.as_ref().map(QrPayload::as_str) != Some(qr) {
                    debug!(attempt, "pairing: qr payload refreshed");
                    let payload = QrPayload::new(qr);
                    state.session.qr_payload = Some(payload.clone());
                    self.emit(PairingEvent::QrRefreshed(payload));
                }
            }
            Some(RemotePairingStatus::Other(status)) => {
                warn!(attempt, %status, "pairing: unknown status in poll response");
                state.session.last_error = Some(format!("unknown pairing status '{status}'"));
            }
            None => {
                warn!(attempt, "pairing: poll response without status");
                state.session.last_error = Some("poll response without status".to_string());
            }
        }
    }

    /// Hard reset: stops polling and returns to idle from any state.
    pub async fn cancel(&self) {
        {
            let mut guard = self.inner.lock().await;
            if let Some(task) = guard.poll_task.take() {
                task.abort();
            }
            guard.epoch += 1;
            guard.session = PairingSession::idle(&self.settings);
            self.emit(PairingEvent::StatusChanged(guard.session.clone()));
        }
        self.session_context.clear().await;
        info!("pairing: cancelled");
    }

    /// Unlinks the device on the backend (best effort) and resets locally.
    pub async fn logout(&self) {
        if self.session_context.is_authenticated().await {
            if let Err(err) = self.api.logout().await {
                warn!("pairing: logout request failed: {err}");
            }
        }
        self.cancel().await;
    }

    fn spawn_poll_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let session = controller.poll().await;
                if session.status != PairingStatus::Pending {
                    break;
                }
            }
        })
    }

    fn emit(&self, event: PairingEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/pairing_tests.rs"]
mod tests;
