#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

mod credentials;
mod utils;

use crate::credentials::{load_session, save_session};
use parley::config::{get_config_dir, set_config_dir_override, ClientConfig};
use parley::sse::HttpTransport;
use parley::{
    AppLifecycle, Conversation, ConversationServices, DebouncedWriter, HttpApi, KeyValueStore,
    LocalStore, Message, MessageApi, MessageStatus, NetworkMonitor, OfflineQueue, Session,
    SqliteStore, SseClient,
};

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Command line arguments for parley
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "parley: a terminal chat client with live updates and offline delivery.",
    long_about = "parley opens one conversation, prints its stored timeline and streams new messages.\n\n\
    Type a line to send it. Commands: /older /retry /flush /read /reconnect /show\n\
    /online /offline /bg /fg /quit"
)]
struct Args {
    /// Conversation to open
    #[arg(long, short = 'c')]
    conversation: String,

    /// Directory for config.json, session.json, the log file and the local database
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Start offline: sends go to the offline queue until /online
    #[arg(long)]
    offline: bool,
}

/// Session from config/env, then the cached session file, then a prompt
fn resolve_session(config: &ClientConfig) -> Result<Session> {
    if let (Some(user_id), Some(token)) = (&config.user_id, &config.token) {
        return Ok(Session::new(user_id, token, &config.api_url));
    }

    if let Some(session) = load_session()?.and_then(|saved| saved.into_session()) {
        info!("Using cached session for {}", session.user_id);
        return Ok(Session::new(&session.user_id, &session.token, &config.api_url));
    }

    eprintln!("Enter your user id:");
    let user_id = utils::read_line()?;
    eprintln!("Enter your access token:");
    let token = utils::read_line()?;
    if user_id.is_empty() || token.is_empty() {
        return Err(anyhow!("A user id and token are required"));
    }
    let session = Session::new(&user_id, &token, &config.api_url);
    if let Err(e) = save_session(&session) {
        warn!("Could not cache session: {}", e);
    }
    Ok(session)
}

fn print_message(message: &Message, user_id: &str) {
    let who = if message.sender_id == user_id { "me" } else { message.sender_id.as_str() };
    let marker = match message.status {
        MessageStatus::Sending => " …",
        MessageStatus::Sent => " ✓",
        MessageStatus::Delivered => " ✓✓",
        MessageStatus::Read => " ✓✓ read",
        MessageStatus::Failed => " ✗ failed",
    };
    let marker = if message.sender_id == user_id { marker } else { "" };
    println!(
        "[{}] {}: {}{}",
        message.created_at.format("%H:%M:%S"),
        who,
        message.text,
        marker
    );
    if let Some(error) = &message.error_message {
        println!("    ({}; /retry to resend)", error);
    }
}

fn print_timeline(messages: &[Message], user_id: &str) {
    // stored newest first, shown oldest first
    for message in messages.iter().rev() {
        print_message(message, user_id);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(dir) = &args.data_dir {
        set_config_dir_override(dir.clone());
    }
    let log_file_path = get_config_dir()?.join("parley.log");
    utils::setup_logging(Some(&log_file_path), LevelFilter::Debug)?;
    info!("Logging to file: {}", log_file_path.display());

    let config = ClientConfig::load()?;
    let session = resolve_session(&config)?;
    info!("Starting as {} against {}", session.user_id, session.base_url);

    let database_path = config.database_path()?;
    let kv: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&database_path)?);
    let store = LocalStore::new(kv.clone(), &session.user_id);
    let writer = DebouncedWriter::new(store.clone(), config.store.write_debounce());

    let http_api = Arc::new(HttpApi::new(session.clone(), config.conversation.request_timeout())?);
    let network = NetworkMonitor::new(!args.offline);
    if args.offline {
        network.hold_offline(true);
    }
    let _probe = network.spawn_probe(
        http_api.client().clone(),
        format!("{}/api/health", session.base_url),
        HEALTH_PROBE_INTERVAL,
    );
    let api: Arc<dyn MessageApi> = http_api;

    let queue = OfflineQueue::load(kv, store, api.clone(), network.clone(), config.queue.clone()).await;
    let _auto_flush = queue.spawn_auto_flush();
    let _background_flush = writer.flush_on_background(network.subscribe_lifecycle());

    let transport = Arc::new(HttpTransport::new(config.conversation.request_timeout())?);
    let sse = SseClient::new(&session.base_url, transport, config.sse.clone())
        .with_lifecycle(network.subscribe_lifecycle());

    let services = ConversationServices {
        session: session.clone(),
        api,
        writer: writer.clone(),
        network: network.clone(),
        queue: Some(queue.clone()),
    };
    let conversation = Conversation::open(&args.conversation, services, config.conversation.clone()).await;

    if network.is_online() {
        if let Err(e) = conversation.refresh().await {
            warn!("Initial refresh failed: {}", e);
            eprintln!("Could not reach the server ({}); showing stored messages.", e.code());
        }
    }
    print_timeline(&conversation.messages().await, &session.user_id);
    conversation.attach(&sse)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/show" => print_timeline(&conversation.messages().await, &session.user_id),
            "/older" => match conversation.load_older().await {
                Ok(added) => {
                    println!("Loaded {} older messages", added);
                    print_timeline(&conversation.messages().await, &session.user_id);
                }
                Err(e) => eprintln!("Could not load older messages: {}", e),
            },
            "/retry" => {
                let failed = conversation.failed_message_ids().await;
                if failed.is_empty() {
                    println!("Nothing to retry");
                }
                for id in failed {
                    match conversation.retry_message(&id).await {
                        Ok(message) => print_message(&message, &session.user_id),
                        Err(failure) => eprintln!("Retry failed: {}", failure),
                    }
                }
            }
            "/flush" => {
                let summary = queue.flush().await;
                println!("Flushed queue: {} sent, {} failed", summary.success, summary.failed);
                for error in summary.errors {
                    println!("    {}", error);
                }
            }
            "/read" => match conversation.mark_read().await {
                Ok(metadata) => println!("Marked read ({} unread)", metadata.unread_count),
                Err(e) => eprintln!("Could not mark read: {}", e),
            },
            "/reconnect" => conversation.reconnect(),
            "/online" => {
                network.hold_offline(false);
                network.set_online(true);
            }
            "/offline" => network.hold_offline(true),
            "/bg" => network.set_lifecycle(AppLifecycle::Background),
            "/fg" => network.set_lifecycle(AppLifecycle::Foreground),
            text => match conversation.send_message(text).await {
                Ok(message) => print_message(&message, &session.user_id),
                Err(failure) => {
                    error!("Send failed: {}", failure);
                    eprintln!("Send failed: {}", failure);
                }
            },
        }
    }

    conversation.close().await;
    let written = writer.flush_all().await;
    info!("Shutting down, flushed {} pending writes", written);
    Ok(())
}
