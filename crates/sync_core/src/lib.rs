//! Client-side session lifecycle and sync engine: QR device pairing, the
//! conversation directory, per-conversation message logs and the push-driven
//! coordinator that keeps them current.

pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod message_store;
pub mod pairing;
pub mod session;
pub mod sync;
pub mod transport;

pub use client::SyncClient;
pub use config::{load_settings, load_settings_from, Settings};
pub use directory::{ConversationDirectory, DirectoryFilter, GroupFilter};
pub use error::{ClientError, TransportError};
pub use message_store::{ConversationLogView, LoadOutcome, MergeReport, MessageStore};
pub use pairing::{PairingController, PairingEvent, PairingSession, PairingStatus, QrPayload};
pub use session::{Credential, SessionContext};
pub use sync::{ConnectionStatus, SyncCoordinator, SyncNotice, SyncStats};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
