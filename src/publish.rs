use super::*;
use crate::credentials::{session_inputs, ServiceSession, TokenMinter};
use crate::helpers::parse_time_of_day;
use crate::integrations::{CloudStorage, StoredFile, UploadFailure, VideoHost};
use crate::metadata::MetadataSynthesizer;
use crate::state_store::{load_or_default, StateStore};
use chrono::{DateTime, NaiveTime, TimeZone};
use chrono_tz::Tz;

pub(super) fn video_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

/// Earliest configured time strictly after `now` on the same local day as
/// `HH:MM`, otherwise the earliest time of day marked `(tomorrow)`.
pub(super) fn next_scheduled_time_text(times: &[String], now: DateTime<Tz>) -> Option<String> {
    let parsed: Vec<NaiveTime> = times
        .iter()
        .filter_map(|t| parse_time_of_day(t))
        .collect();
    let today = now.date_naive();
    let later_today = parsed
        .iter()
        .filter_map(|t| now.timezone().from_local_datetime(&today.and_time(*t)).earliest())
        .filter(|at| *at > now)
        .min();
    if let Some(at) = later_today {
        return Some(at.format("%H:%M").to_string());
    }
    parsed
        .iter()
        .min()
        .map(|t| format!("{} (tomorrow)", t.format("%H:%M")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum PublishOutcome {
    NotConfigured,
    CredentialsUnavailable(String),
    NoVideos,
    Published {
        file_name: String,
        video_id: String,
        url: String,
        remaining: usize,
        next_slot: Option<String>,
    },
    UploadFailed {
        file_name: String,
        failure: UploadFailure,
        next_slot: Option<String>,
    },
    Failed {
        message: String,
        next_slot: Option<String>,
    },
}

impl PublishOutcome {
    pub(super) fn replies(&self) -> Vec<Reply> {
        let mut replies = Vec::new();
        let next_slot = match self {
            PublishOutcome::NotConfigured => {
                replies.push(Reply::text(
                    "The Drive folder id has not been set yet. Use /reset to run the setup again.",
                ));
                None
            }
            PublishOutcome::CredentialsUnavailable(reason) => {
                replies.push(Reply::with_keyboard(
                    format!("Could not sign in to Google: {}.", reason),
                    Keyboard::AfterPublish,
                ));
                None
            }
            PublishOutcome::NoVideos => {
                replies.push(Reply::text("There are no videos in the folder."));
                None
            }
            PublishOutcome::Published {
                url,
                remaining,
                next_slot,
                ..
            } => {
                replies.push(Reply::with_keyboard(
                    format!(
                        "Published!\nVideos left in the folder: {}\nVideo link: {}",
                        remaining, url
                    ),
                    Keyboard::AfterPublish,
                ));
                next_slot.as_ref()
            }
            PublishOutcome::UploadFailed {
                failure, next_slot, ..
            } => {
                let reason = match failure {
                    UploadFailure::RateLimited => {
                        "YouTube upload limit reached for now, try again later".to_string()
                    }
                    other => other.to_string(),
                };
                replies.push(Reply::with_keyboard(
                    format!("Video upload failed.\nReason: {}.", reason),
                    Keyboard::AfterPublish,
                ));
                next_slot.as_ref()
            }
            PublishOutcome::Failed { message, next_slot } => {
                replies.push(Reply::with_keyboard(
                    format!("Something went wrong while publishing: {}", message),
                    Keyboard::AfterPublish,
                ));
                next_slot.as_ref()
            }
        };
        if let Some(slot) = next_slot {
            replies.push(Reply::with_keyboard(
                format!("Autopost is on. Next scheduled post: {}", slot),
                Keyboard::AutopostControl,
            ));
        }
        replies
    }
}

pub(super) struct Publisher {
    pub(super) store: Arc<dyn StateStore>,
    pub(super) minter: Arc<dyn TokenMinter>,
    pub(super) storage: Arc<dyn CloudStorage>,
    pub(super) host: Arc<dyn VideoHost>,
    pub(super) synthesizer: MetadataSynthesizer,
    pub(super) outbox: Arc<dyn Outbox>,
    pub(super) scratch_dir: PathBuf,
    pub(super) timezone: Tz,
}

impl Publisher {
    pub(super) async fn publish_and_report(&self, chat_id: i64) -> Result<PublishOutcome> {
        let outcome = self.publish(chat_id).await?;
        for reply in outcome.replies() {
            self.outbox.send(chat_id, reply).await?;
        }
        Ok(outcome)
    }

    /// Errors returned here are local (state store, scratch dir); collaborator
    /// failures are folded into the outcome.
    pub(super) async fn publish(&self, chat_id: i64) -> Result<PublishOutcome> {
        let config = load_or_default(self.store.as_ref(), chat_id).await?;
        let folder_id = match config.folder_id.as_deref().filter(|f| !f.is_empty()) {
            Some(folder_id) => folder_id.to_string(),
            None => return Ok(PublishOutcome::NotConfigured),
        };

        let session = match self.session_for(&config).await {
            Ok(session) => session,
            Err(reason) => {
                warn!("publish for chat {}: no session: {}", chat_id, reason);
                return Ok(PublishOutcome::CredentialsUnavailable(reason));
            }
        };

        let next_slot = self.next_slot(&config);
        let videos = match self.storage.list_videos(&session, &folder_id).await {
            Ok(videos) => videos,
            Err(err) => {
                error!("publish for chat {}: listing folder failed: {:#}", chat_id, err);
                return Ok(PublishOutcome::Failed {
                    message: format!("{:#}", err),
                    next_slot,
                });
            }
        };
        let file = match videos.into_iter().next() {
            Some(file) => file,
            None => return Ok(PublishOutcome::NoVideos),
        };
        info!(
            "publish for chat {}: selected {} ({}, created {})",
            chat_id,
            file.name,
            file.id,
            file.created_time.as_deref().unwrap_or("unknown")
        );

        self.notify(chat_id, format!("Analysing and generating metadata for: {}", file.name))
            .await;

        let scratch = tempfile::Builder::new()
            .prefix("dl_")
            .tempdir_in(&self.scratch_dir)
            .with_context(|| format!("create scratch dir in {}", self.scratch_dir.display()))?;
        let local_path = match self.download(&session, &file, scratch.path()).await {
            Ok(path) => path,
            Err(err) => {
                error!("publish for chat {}: download failed: {:#}", chat_id, err);
                return Ok(PublishOutcome::Failed {
                    message: format!("{:#}", err),
                    next_slot,
                });
            }
        };

        let metadata = self.synthesizer.synthesize(&local_path, &file.name).await;
        self.notify(
            chat_id,
            format!("Uploading to YouTube...\nTitle: {}", metadata.title),
        )
        .await;

        let video_id = match self.host.upload(&session, &local_path, &metadata).await {
            Ok(video_id) => video_id,
            Err(failure) => {
                warn!("publish for chat {}: upload of {} failed: {}", chat_id, file.name, failure);
                return Ok(PublishOutcome::UploadFailed {
                    file_name: file.name,
                    failure,
                    next_slot,
                });
            }
        };
        drop(scratch);

        if let Err(err) = self.storage.delete(&session, &file.id).await {
            warn!(
                "publish for chat {}: deleting source {} failed: {:#}",
                chat_id, file.id, err
            );
        }
        let remaining = match self.storage.list_videos(&session, &folder_id).await {
            Ok(videos) => videos.len(),
            Err(err) => {
                warn!("publish for chat {}: recount failed: {:#}", chat_id, err);
                0
            }
        };

        info!("publish for chat {}: uploaded {} as {}", chat_id, file.name, video_id);
        Ok(PublishOutcome::Published {
            file_name: file.name,
            url: video_url(&video_id),
            video_id,
            remaining,
            next_slot,
        })
    }

    pub(super) async fn count_folder_videos(&self, config: &ChatConfig) -> Result<usize> {
        let folder_id = config
            .folder_id
            .as_deref()
            .ok_or_else(|| anyhow!("folder id not set"))?;
        let session = self.session_for(config).await.map_err(|reason| anyhow!(reason))?;
        let videos = self.storage.list_videos(&session, folder_id).await?;
        Ok(videos.len())
    }

    async fn session_for(&self, config: &ChatConfig) -> std::result::Result<ServiceSession, String> {
        let (identity, refresh_token) = session_inputs(config)?;
        self.minter
            .mint(identity, refresh_token)
            .await
            .map_err(|err| format!("{:#}", err))
    }

    async fn download(&self, session: &ServiceSession, file: &StoredFile, dir: &Path) -> Result<PathBuf> {
        let extension = Path::new(&file.name)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("mp4");
        let path = dir.join(format!("video.{}", extension));
        let written = self.storage.download(session, &file.id, &path).await?;
        debug!("downloaded {} bytes to {}", written, path.display());
        Ok(path)
    }

    fn next_slot(&self, config: &ChatConfig) -> Option<String> {
        if !config.autopost_enabled || config.autopost_times.is_empty() {
            return None;
        }
        next_scheduled_time_text(&config.autopost_times, chrono::Utc::now().with_timezone(&self.timezone))
    }

    async fn notify(&self, chat_id: i64, text: String) {
        if let Err(err) = self.outbox.send(chat_id, Reply::text(text)).await {
            warn!("progress message to chat {} failed: {:#}", chat_id, err);
        }
    }
}
