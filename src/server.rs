use super::*;
use crate::callback_handlers::handle_callback;
use crate::message_handlers::handle_message;
use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use teloxide::types::UpdateKind;

const POLL_TIMEOUT_SECS: u32 = 10;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Work item on the shared queue. Updates and trigger firings for one chat
/// are processed in arrival order by that chat's worker.
#[derive(Debug)]
pub(super) enum Job {
    Update(Box<Update>),
    Trigger { chat_id: i64 },
}

impl Job {
    pub(super) fn chat_id(&self) -> Option<i64> {
        match self {
            Job::Update(update) => update.chat().map(|chat| chat.id.0),
            Job::Trigger { chat_id } => Some(*chat_id),
        }
    }
}

const WORKER_IDLE: Duration = Duration::from_secs(300);

/// Per-chat job channels. A worker that has been idle closes its channel;
/// the next job for that chat spawns a fresh one.
#[derive(Default)]
pub(super) struct WorkerPool {
    workers: HashMap<i64, mpsc::UnboundedSender<Job>>,
}

impl WorkerPool {
    pub(super) fn dispatch<F>(&mut self, job: Job, spawn: F)
    where
        F: FnOnce(i64, mpsc::UnboundedReceiver<Job>),
    {
        let Some(chat_id) = job.chat_id() else {
            debug!("dropping update without a chat: {:?}", job);
            return;
        };
        let job = match self.workers.get(&chat_id) {
            Some(worker) => match worker.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => {
                    self.workers.remove(&chat_id);
                    job
                }
            },
            None => job,
        };

        self.workers.retain(|_, worker| !worker.is_closed());
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(job).is_err() {
            return;
        }
        spawn(chat_id, rx);
        self.workers.insert(chat_id, tx);
    }

    pub(super) fn len(&self) -> usize {
        self.workers.len()
    }
}

pub(super) async fn run_dispatcher(bot: Bot, state: Arc<AppState>, mut queue: mpsc::Receiver<Job>) {
    let mut pool = WorkerPool::default();
    while let Some(job) = queue.recv().await {
        pool.dispatch(job, |chat_id, rx| {
            let (bot, state) = (bot.clone(), state.clone());
            tokio::spawn(worker_loop(chat_id, rx, WORKER_IDLE, move |job| {
                process_job(bot.clone(), state.clone(), job)
            }));
        });
    }
    info!("job queue closed, dispatcher stopping");
}

pub(super) async fn worker_loop<F, Fut>(
    chat_id: i64,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    idle: Duration,
    mut handle: F,
) where
    F: FnMut(Job) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    loop {
        let job = match tokio::time::timeout(idle, jobs.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(_) => {
                // Close first so the dispatcher stops sending here, then finish what slipped in.
                jobs.close();
                while let Ok(job) = jobs.try_recv() {
                    if let Err(err) = handle(job).await {
                        error!("chat {}: job failed: {:#}", chat_id, err);
                    }
                }
                debug!("chat {}: worker idle, exiting", chat_id);
                return;
            }
        };
        if let Err(err) = handle(job).await {
            error!("chat {}: job failed: {:#}", chat_id, err);
        }
    }
}

async fn process_job(bot: Bot, state: Arc<AppState>, job: Job) -> Result<()> {
    match job {
        Job::Update(update) => match (*update).kind {
            UpdateKind::Message(msg) => handle_message(bot, msg, state).await,
            UpdateKind::CallbackQuery(q) => handle_callback(bot, q, state).await,
            _ => Ok(()),
        },
        Job::Trigger { chat_id } => state.conversation.run_scheduled(chat_id).await,
    }
}

pub(super) async fn run_polling(bot: Bot, queue: mpsc::Sender<Job>) {
    let mut offset: i32 = 0;
    info!("polling for updates");
    loop {
        let updates = match bot.get_updates().offset(offset).timeout(POLL_TIMEOUT_SECS).await {
            Ok(updates) => updates,
            Err(err) => {
                warn!("get_updates failed: {}", err);
                tokio::time::sleep(POLL_RETRY_DELAY).await;
                continue;
            }
        };
        for update in updates {
            offset = update.id + 1;
            if queue.send(Job::Update(Box::new(update))).await.is_err() {
                warn!("job queue closed, polling stops");
                return;
            }
        }
    }
}

#[derive(Clone)]
pub(super) struct WebState {
    pub(super) webhook_secret: Option<String>,
    pub(super) queue: mpsc::Sender<Job>,
}

pub(super) fn router(state: WebState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/{token}", post(webhook))
        .with_state(state)
}

pub(super) async fn serve_http(bind_addr: &str, state: WebState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("bind {}", bind_addr))?;
    info!("http server listening on {}", bind_addr);
    axum::serve(listener, router(state)).await.context("serve http")
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "Bot is running!" }))
}

async fn webhook(
    State(state): State<WebState>,
    UrlPath(token): UrlPath<String>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if state.webhook_secret.as_deref() != Some(token.as_str()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "error": "invalid token path" })),
        );
    }

    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(err) => {
            warn!("rejecting malformed webhook update: {}", err);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ok": false, "error": "malformed update" })),
            );
        }
    };

    if state.queue.send(Job::Update(Box::new(update))).await.is_err() {
        error!("job queue closed, dropping webhook update");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "error": "shutting down" })),
        );
    }
    (StatusCode::OK, Json(json!({ "ok": true })))
}
