use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

mod callback_handlers;
mod conversation;
mod credentials;
mod helpers;
mod integrations;
mod message_handlers;
mod metadata;
mod publish;
mod scheduler;
mod server;
mod state_store;

use crate::conversation::Conversation;
use crate::credentials::OAuthTokenMinter;
use crate::helpers::{build_http_client, load_config, TelegramOutbox};
use crate::integrations::{GeminiClient, GoogleDrive, YouTubeUploader};
use crate::metadata::MetadataSynthesizer;
use crate::publish::Publisher;
use crate::scheduler::Scheduler;
use crate::server::{run_dispatcher, run_polling, serve_http, Job, WebState};
use crate::state_store::{JsonStateStore, StateStore};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_TIMEZONE: &str = "Africa/Algiers";
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_UPLOAD_CHUNK_BYTES: usize = 8 * 1024 * 1024;
const MAX_AUTOPOST_COUNT: u32 = 7;
const MAX_CREDENTIAL_DOCUMENT_BYTES: u32 = 64 * 1024;
const QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Config {
    token: String,
    google_api_key: String,
    data_dir: PathBuf,
    scratch_dir: PathBuf,
    timezone: chrono_tz::Tz,
    gemini_model: String,
    allowed_user_ids: Vec<u64>,
    bind_addr: String,
    webhook: Option<WebhookConfig>,
    upload_chunk_bytes: usize,
    request_timeout: Duration,
    metadata_deadline: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct WebhookConfig {
    base_url: String,
    secret: String,
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    config: PathBuf,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
struct CredentialIdentity {
    client_id: String,
    client_secret: String,
    token_uri: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Step {
    AwaitCredential,
    AwaitRefresh,
    AwaitFolder,
    AwaitAutopostCount,
    AwaitAutopostTime { index: u32 },
    Idle,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
struct ChatConfig {
    step: Step,
    #[serde(default)]
    credential_identity: Option<CredentialIdentity>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    folder_id: Option<String>,
    #[serde(default)]
    setup_complete: bool,
    #[serde(default)]
    autopost_enabled: bool,
    #[serde(default)]
    autopost_times: Vec<String>,
    #[serde(default)]
    autopost_count: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            step: Step::AwaitCredential,
            credential_identity: None,
            refresh_token: None,
            folder_id: None,
            setup_complete: false,
            autopost_enabled: false,
            autopost_times: Vec::new(),
            autopost_count: 0,
        }
    }
}

impl ChatConfig {
    fn has_all_setup_fields(&self) -> bool {
        self.credential_identity.is_some() && self.refresh_token.is_some() && self.folder_id.is_some()
    }

    fn clear_autopost(&mut self) {
        self.autopost_enabled = false;
        self.autopost_times.clear();
        self.autopost_count = 0;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ButtonAction {
    PublishNow,
    AutopostSetup,
    ShowSettings,
    ResetSetup,
    AutopostStop,
}

impl ButtonAction {
    fn callback_data(self) -> &'static str {
        match self {
            ButtonAction::PublishNow => "publish_now",
            ButtonAction::AutopostSetup => "autopost_setup",
            ButtonAction::ShowSettings => "show_settings",
            ButtonAction::ResetSetup => "reset_setup",
            ButtonAction::AutopostStop => "autopost_stop",
        }
    }

    fn from_callback_data(data: &str) -> Option<Self> {
        match data {
            "publish_now" => Some(ButtonAction::PublishNow),
            "autopost_setup" => Some(ButtonAction::AutopostSetup),
            "show_settings" => Some(ButtonAction::ShowSettings),
            "reset_setup" => Some(ButtonAction::ResetSetup),
            "autopost_stop" => Some(ButtonAction::AutopostStop),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ChatEvent {
    Command(String),
    Text(String),
    Document { file_name: Option<String>, contents: Vec<u8> },
    Button(ButtonAction),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Keyboard {
    MainMenu,
    AfterPublish,
    AutopostControl,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Reply {
    text: String,
    keyboard: Option<Keyboard>,
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Reply {
            text: text.into(),
            keyboard: None,
        }
    }

    fn with_keyboard(text: impl Into<String>, keyboard: Keyboard) -> Self {
        Reply {
            text: text.into(),
            keyboard: Some(keyboard),
        }
    }
}

#[async_trait]
trait Outbox: Send + Sync {
    async fn send(&self, chat_id: i64, reply: Reply) -> Result<()>;
}

struct AppState {
    config: Config,
    conversation: Arc<Conversation>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = load_config(&args.config)?;
    fs::create_dir_all(&config.data_dir).context("create data_dir")?;
    fs::create_dir_all(&config.scratch_dir).context("create scratch_dir")?;

    let bot = Bot::new(config.token.clone());
    let http = build_http_client(config.request_timeout)?;

    let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::open(config.data_dir.join("chats"))?);
    let (queue_tx, queue_rx) = mpsc::channel::<Job>(QUEUE_CAPACITY);

    let synthesizer = MetadataSynthesizer::new(Arc::new(GeminiClient::new(
        http.clone(),
        config.google_api_key.clone(),
        config.gemini_model.clone(),
    )))
    .with_deadline(config.metadata_deadline);
    let publisher = Arc::new(Publisher {
        store: store.clone(),
        minter: Arc::new(OAuthTokenMinter::new(http.clone())),
        storage: Arc::new(GoogleDrive::new(http.clone())),
        host: Arc::new(YouTubeUploader::new(config.request_timeout, config.upload_chunk_bytes)?),
        synthesizer,
        outbox: Arc::new(TelegramOutbox::new(bot.clone())),
        scratch_dir: config.scratch_dir.clone(),
        timezone: config.timezone,
    });

    let scheduler = Arc::new(Scheduler::new(config.timezone, queue_tx.clone()));
    match scheduler.restore(store.as_ref()).await {
        Ok(count) => info!("restored {} autopost triggers", count),
        Err(err) => error!("restoring autopost triggers failed: {:#}", err),
    }

    let conversation = Arc::new(Conversation::new(store.clone(), publisher, scheduler.clone()));
    let state = Arc::new(AppState {
        config: config.clone(),
        conversation,
    });

    tokio::spawn(run_dispatcher(bot.clone(), state.clone(), queue_rx));

    let web_state = WebState {
        webhook_secret: config.webhook.as_ref().map(|w| w.secret.clone()),
        queue: queue_tx.clone(),
    };
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        if let Err(err) = serve_http(&bind_addr, web_state).await {
            error!("http server stopped: {:#}", err);
        }
    });

    match &config.webhook {
        Some(webhook) => {
            let url = format!("{}/{}", webhook.base_url, webhook.secret);
            let parsed = reqwest::Url::parse(&url).context("parse webhook url")?;
            bot.set_webhook(parsed).await.context("register webhook")?;
            info!("webhook registered at {}/<secret>", webhook.base_url);
        }
        None => {
            warn!("webhook_base not set; falling back to long polling");
            if let Err(err) = bot.delete_webhook().await {
                warn!("removing stale webhook failed: {}", err);
            }
            tokio::spawn(run_polling(bot.clone(), queue_tx.clone()));
        }
    }

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutting down");
    if config.webhook.is_some() {
        if let Err(err) = bot.delete_webhook().await {
            warn!("removing webhook on shutdown failed: {}", err);
        }
    }

    Ok(())
}
