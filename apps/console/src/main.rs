use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use shared::domain::ConversationId;
use sync_core::{
    load_settings, load_settings_from, DirectoryFilter, PairingEvent, PairingStatus, QrPayload,
    SessionContext, SyncClient, SyncNotice,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Link a messaging account by QR code and follow its conversations")]
struct Args {
    /// Settings file; defaults to `MF_CONFIG` or ./messageflow.toml.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long)]
    ws_base: Option<String>,
    /// Write the QR code image here instead of printing the raw payload.
    #[arg(long)]
    qr_png: Option<PathBuf>,
    /// Only list conversations matching this name or number.
    #[arg(long)]
    search: Option<String>,
    /// Conversation to open after the directory loads.
    #[arg(long)]
    conversation: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings()?,
    };
    if let Some(api_base) = args.api_base.clone() {
        settings.api_base_url = api_base;
    }
    if let Some(ws_base) = args.ws_base.clone() {
        settings.ws_base_url = Some(ws_base);
    }

    let client = SyncClient::new(&settings, SessionContext::new())?;
    pair(&client, args.qr_png.as_deref()).await?;

    client.start_sync().await?;
    let filter = DirectoryFilter::search(args.search.clone().unwrap_or_default());
    for conversation in client.directory().view(&filter).await {
        let kind = if conversation.is_group { "group" } else { "direct" };
        println!("{:>6}  {:<6}  {}", conversation.id.0, kind, conversation.title());
    }

    if let Some(id) = args.conversation {
        let conversation_id = ConversationId(id);
        client.open_conversation(conversation_id).await;
        print_log(&client, conversation_id).await;
    }

    follow(&client).await;
    client.shutdown().await;
    Ok(())
}

async fn pair(client: &SyncClient, qr_png: Option<&Path>) -> Result<()> {
    let mut events = client.pairing().subscribe();
    let session = client.start_pairing().await;
    if let Some(qr) = &session.qr_payload {
        show_qr(qr, qr_png)?;
    }

    loop {
        match events.recv().await {
            Ok(PairingEvent::QrRefreshed(qr)) => show_qr(&qr, qr_png)?,
            Ok(PairingEvent::Connected(credential)) => {
                println!("Device linked (tenant {:?}).", credential.tenant_id);
                return Ok(());
            }
            Ok(PairingEvent::StatusChanged(session)) => match session.status {
                PairingStatus::Expired => bail!(
                    "pairing expired after {} attempts; run again for a new code",
                    session.poll_attempt_count
                ),
                PairingStatus::Failed => bail!(
                    "pairing failed: {}",
                    session.last_error.unwrap_or_else(|| "unknown error".into())
                ),
                _ => {}
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "console: pairing events lagged"),
            Err(RecvError::Closed) => bail!("pairing controller went away"),
        }
    }
}

fn show_qr(qr: &QrPayload, qr_png: Option<&Path>) -> Result<()> {
    match (qr_png, qr.png_bytes()) {
        (Some(path), Some(bytes)) => {
            std::fs::write(path, bytes)
                .with_context(|| format!("failed to write QR image to {}", path.display()))?;
            println!("Scan the QR code saved at {}", path.display());
        }
        _ => println!("Scan this QR payload:\n{}", qr.as_str()),
    }
    Ok(())
}

async fn print_log(client: &SyncClient, conversation_id: ConversationId) {
    let Some(view) = client.store().view(conversation_id).await else {
        return;
    };
    if view.fetch_failed {
        println!("(could not load conversation {conversation_id})");
    }
    for message in &view.messages {
        println!(
            "[{}] {}: {}",
            message.created_at.format("%Y-%m-%d %H:%M"),
            message.sender,
            message.content
        );
    }
    if view.has_more_older {
        println!("(older messages available)");
    }
}

async fn follow(client: &SyncClient) {
    let mut notices = client.coordinator().subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = notices.recv() => match notice {
                Ok(SyncNotice::Status(status)) => println!("sync: {status:?}"),
                Ok(SyncNotice::Event(event)) => {
                    println!("event: {}", String::from(event.kind.clone()));
                    if let Some(open) = client.store().open_conversation().await {
                        if event.conversation_id.map_or(true, |id| id == open) {
                            print_log(client, open).await;
                        }
                    }
                }
                Ok(SyncNotice::Dropped { reason }) => println!("dropped frame: {reason}"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "console: sync notices lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}
