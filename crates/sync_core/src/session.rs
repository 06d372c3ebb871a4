//! Session context shared between the pairing controller (writer) and the
//! transport (reader).

use std::{fmt, sync::Arc};

use shared::domain::TenantId;
use tokio::sync::RwLock;

/// Credential issued once a device is linked. Stored and forwarded, never
/// inspected.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub csrf: String,
    pub tenant_id: Option<TenantId>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("csrf", &"<redacted>")
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

/// Cloneable handle onto the credential of one authenticated session.
///
/// The composing application creates it and hands it to exactly one
/// [`crate::PairingController`]; transports hold clones to authenticate
/// requests and the push subscription.
#[derive(Clone, Default)]
pub struct SessionContext {
    credential: Arc<RwLock<Option<Credential>>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            credential: Arc::new(RwLock::new(Some(credential))),
        }
    }

    pub async fn credential(&self) -> Option<Credential> {
        self.credential.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.credential.read().await.is_some()
    }

    pub(crate) async fn set(&self, credential: Credential) {
        *self.credential.write().await = Some(credential);
    }

    pub(crate) async fn clear(&self) {
        self.credential.write().await.take();
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext").finish_non_exhaustive()
    }
}
