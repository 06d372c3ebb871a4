//! Request/response calls and the push channel, behind traits so the
//! components above can be driven by in-memory fakes.

use std::time::Duration;

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Conversation, ConversationId, Message, MessageId},
    protocol::{
        ForwardRequest, ListResponse, PairingStartResponse, PairingStatusResponse, ReplyRequest,
    },
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::info;
use url::Url;

use crate::{error::TransportError, session::SessionContext};

const CSRF_HEADER: &str = "X-CSRF-Token";

/// Raw text frames from the push channel. The stream ends when the server
/// closes the connection.
pub type PushStream = BoxStream<'static, Result<String, TransportError>>;

#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn start_pairing(&self) -> Result<PairingStartResponse, TransportError>;
    async fn pairing_status(&self, session_id: &str)
        -> Result<PairingStatusResponse, TransportError>;
    async fn logout(&self) -> Result<(), TransportError>;
    async fn sync_contacts(&self) -> Result<(), TransportError>;
    async fn list_conversations(&self, limit: u32) -> Result<Vec<Conversation>, TransportError>;
    /// Page 1 is the most recent; higher pages move back in time.
    async fn fetch_page(
        &self,
        conversation_id: ConversationId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>, TransportError>;
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<Message, TransportError>;
    async fn forward_message(
        &self,
        message_id: MessageId,
        target_conversation_id: ConversationId,
    ) -> Result<Message, TransportError>;
}

#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn subscribe(&self) -> Result<PushStream, TransportError>;
}

pub struct HttpBackend {
    http: Client,
    base_url: String,
    session: SessionContext,
}

impl HttpBackend {
    pub fn new(
        base_url: impl Into<String>,
        session: SessionContext,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn authorized(&self, request: RequestBuilder, mutating: bool) -> RequestBuilder {
        let Some(credential) = self.session.credential().await else {
            return request;
        };
        let request = request.bearer_auth(&credential.token);
        if mutating {
            request.header(CSRF_HEADER, &credential.csrf)
        } else {
            request
        }
    }

    async fn require_session(&self) -> Result<(), TransportError> {
        if self.session.is_authenticated().await {
            Ok(())
        } else {
            Err(TransportError::Unauthenticated)
        }
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, TransportError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::status(status.as_u16(), &body));
    }
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn send_empty(request: RequestBuilder) -> Result<(), TransportError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::status(status.as_u16(), &body));
    }
    Ok(())
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn start_pairing(&self) -> Result<PairingStartResponse, TransportError> {
        let request = self.http.get(self.url("/auth/whatsapp/qr"));
        send_json(self.authorized(request, false).await).await
    }

    async fn pairing_status(
        &self,
        session_id: &str,
    ) -> Result<PairingStatusResponse, TransportError> {
        let request = self
            .http
            .get(self.url("/auth/whatsapp/status"))
            .query(&[("session_id", session_id)]);
        send_json(self.authorized(request, false).await).await
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.require_session().await?;
        let request = self.http.post(self.url("/auth/logout"));
        send_empty(self.authorized(request, true).await).await
    }

    async fn sync_contacts(&self) -> Result<(), TransportError> {
        self.require_session().await?;
        let request = self.http.post(self.url("/auth/whatsapp/sync-contacts"));
        send_empty(self.authorized(request, true).await).await
    }

    async fn list_conversations(&self, limit: u32) -> Result<Vec<Conversation>, TransportError> {
        self.require_session().await?;
        let request = self
            .http
            .get(self.url("/conversations"))
            .query(&[("limit", limit)]);
        let body: ListResponse<Conversation> =
            send_json(self.authorized(request, false).await).await?;
        Ok(body.data)
    }

    async fn fetch_page(
        &self,
        conversation_id: ConversationId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Message>, TransportError> {
        self.require_session().await?;
        let request = self
            .http
            .get(self.url(&format!("/conversations/{conversation_id}/messages")))
            .query(&[("page", page), ("limit", page_size)]);
        let body: ListResponse<Message> = send_json(self.authorized(request, false).await).await?;
        Ok(body.data)
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<Message, TransportError> {
        self.require_session().await?;
        let request = self.http.post(self.url("/messages/reply")).json(&ReplyRequest {
            conversation_id,
            content: content.to_string(),
        });
        send_json(self.authorized(request, true).await).await
    }

    async fn forward_message(
        &self,
        message_id: MessageId,
        target_conversation_id: ConversationId,
    ) -> Result<Message, TransportError> {
        self.require_session().await?;
        let request = self
            .http
            .post(self.url("/messages/forward"))
            .json(&ForwardRequest {
                message_id,
                target_conversation_id,
            });
        send_json(self.authorized(request, true).await).await
    }
}

/// WebSocket push channel at `<base>/ws?token=...`.
pub struct WsPushChannel {
    endpoint: Url,
    session: SessionContext,
}

impl WsPushChannel {
    /// `ws_base_url` overrides the endpoint derived from the API base.
    pub fn new(
        api_base_url: &str,
        ws_base_url: Option<&str>,
        session: SessionContext,
    ) -> Result<Self, TransportError> {
        let endpoint = match ws_base_url {
            Some(base) => push_endpoint(base)?,
            None => push_endpoint(api_base_url)?,
        };
        Ok(Self { endpoint, session })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Maps an http(s) or ws(s) base URL onto the push endpoint.
pub fn push_endpoint(base: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(base.trim_end_matches('/'))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme '{other}' in {base}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::InvalidUrl(format!("cannot switch {base} to {scheme}")))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

#[async_trait]
impl PushChannel for WsPushChannel {
    async fn subscribe(&self) -> Result<PushStream, TransportError> {
        let credential = self
            .session
            .credential()
            .await
            .ok_or(TransportError::Unauthenticated)?;
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("token", &credential.token);

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        info!(endpoint = %self.endpoint, "sync: push channel connected");

        let frames = ws_stream.filter_map(|frame| async move {
            match frame {
                Ok(WsMessage::Text(text)) => Some(Ok(text)),
                Ok(WsMessage::Binary(bytes)) => {
                    Some(Ok(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Ok(_) => None,
                Err(err) => Some(Err(err.into())),
            }
        });
        Ok(frames.boxed())
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
