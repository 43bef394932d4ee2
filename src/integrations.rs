use super::*;
use crate::credentials::ServiceSession;
use crate::helpers::truncate_for_error;
use crate::metadata::VideoMetadata;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::io::SeekFrom;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const DRIVE_API_BASE: &str = "https://www.googleapis.com";
const YOUTUBE_UPLOAD_BASE: &str = "https://www.googleapis.com";
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";
const VIDEO_CATEGORY_ID: &str = "22";
const VIDEO_PRIVACY: &str = "public";
const MAX_UPLOAD_POLLS: u32 = 200;
const DRIVE_PAGE_SIZE: &str = "100";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StoredFile {
    pub(super) id: String,
    pub(super) name: String,
    #[serde(default)]
    pub(super) created_time: Option<String>,
}

#[async_trait]
pub(super) trait CloudStorage: Send + Sync {
    /// Video files in `folder_id`, oldest first.
    async fn list_videos(&self, session: &ServiceSession, folder_id: &str) -> Result<Vec<StoredFile>>;
    async fn download(&self, session: &ServiceSession, file_id: &str, dest: &Path) -> Result<u64>;
    async fn delete(&self, session: &ServiceSession, file_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(super) enum UploadFailure {
    #[error("upload quota or rate limit exceeded")]
    RateLimited,
    #[error("video service returned HTTP {code}: {message}")]
    ServiceError { code: u16, message: String },
    #[error("{message}")]
    Unclassified { message: String },
}

#[async_trait]
pub(super) trait VideoHost: Send + Sync {
    async fn upload(
        &self,
        session: &ServiceSession,
        video_path: &Path,
        metadata: &VideoMetadata,
    ) -> std::result::Result<String, UploadFailure>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct RemoteFile {
    pub(super) name: String,
    pub(super) uri: String,
    pub(super) mime_type: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum RemoteFileState {
    Pending,
    Active,
    Failed,
}

#[async_trait]
pub(super) trait GenerativeModel: Send + Sync {
    async fn upload(&self, video_path: &Path) -> Result<RemoteFile>;
    async fn status(&self, file: &RemoteFile) -> Result<RemoteFileState>;
    async fn generate(&self, file: &RemoteFile, prompt: &str) -> Result<String>;
}

pub(super) fn video_mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("avi") => "video/x-msvideo",
        Some("m4v") => "video/x-m4v",
        _ => "video/mp4",
    }
}

pub(super) fn classify_upload_error(status: u16, body: &str) -> UploadFailure {
    let lowered = body.to_ascii_lowercase();
    let rate_limited = status == 429
        || ["uploadlimitexceeded", "quotaexceeded", "ratelimitexceeded"]
            .iter()
            .any(|marker| lowered.contains(marker));
    if rate_limited {
        UploadFailure::RateLimited
    } else {
        UploadFailure::ServiceError {
            code: status,
            message: truncate_for_error(body, 200),
        }
    }
}

async fn send_json<T: DeserializeOwned>(operation: &str, request: reqwest::RequestBuilder) -> Result<T> {
    let response = request
        .send()
        .await
        .with_context(|| format!("{operation} request failed"))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!(
            "{operation} failed with status {}: {}",
            status.as_u16(),
            truncate_for_error(&body, 400)
        ));
    }
    response
        .json::<T>()
        .await
        .with_context(|| format!("failed to decode {operation} response"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    #[serde(default)]
    files: Vec<StoredFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

pub(super) struct GoogleDrive {
    http: reqwest::Client,
    api_base: String,
}

impl GoogleDrive {
    pub(super) fn new(http: reqwest::Client) -> Self {
        GoogleDrive {
            http,
            api_base: DRIVE_API_BASE.to_string(),
        }
    }

    pub(super) fn with_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }
}

#[async_trait]
impl CloudStorage for GoogleDrive {
    async fn list_videos(&self, session: &ServiceSession, folder_id: &str) -> Result<Vec<StoredFile>> {
        let query = format!(
            "'{}' in parents and mimeType contains 'video/'",
            folder_id.replace('\'', "\\'")
        );
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("q", query.clone()),
                ("orderBy", "createdTime".to_string()),
                ("pageSize", DRIVE_PAGE_SIZE.to_string()),
                ("fields", "nextPageToken,files(id,name,createdTime)".to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let page: DriveFileList = send_json(
                "drive files.list",
                self.http
                    .get(format!("{}/drive/v3/files", self.api_base))
                    .bearer_auth(&session.access_token)
                    .query(&params),
            )
            .await?;
            files.extend(page.files);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }

    async fn download(&self, session: &ServiceSession, file_id: &str, dest: &Path) -> Result<u64> {
        let mut response = self
            .http
            .get(format!("{}/drive/v3/files/{}", self.api_base, file_id))
            .bearer_auth(&session.access_token)
            .query(&[("alt", "media")])
            .send()
            .await
            .context("drive download request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "drive download failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 400)
            ));
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("create {}", dest.display()))?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.context("read drive download body")? {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("write {}", dest.display()))?;
            written += chunk.len() as u64;
        }
        file.flush().await.with_context(|| format!("flush {}", dest.display()))?;
        Ok(written)
    }

    async fn delete(&self, session: &ServiceSession, file_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/drive/v3/files/{}", self.api_base, file_id))
            .bearer_auth(&session.access_token)
            .send()
            .await
            .context("drive delete request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "drive delete failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 400)
            ));
        }
        Ok(())
    }
}

pub(super) struct YouTubeUploader {
    http: reqwest::Client,
    upload_base: String,
    chunk_bytes: u64,
    max_polls: u32,
}

impl YouTubeUploader {
    pub(super) fn new(timeout: Duration, chunk_bytes: usize) -> Result<Self> {
        // 308 "Resume Incomplete" must reach us instead of being followed.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .context("create youtube upload client")?;
        Ok(YouTubeUploader {
            http,
            upload_base: YOUTUBE_UPLOAD_BASE.to_string(),
            chunk_bytes: chunk_bytes.max(1) as u64,
            max_polls: MAX_UPLOAD_POLLS,
        })
    }

    pub(super) fn with_base(mut self, upload_base: impl Into<String>) -> Self {
        self.upload_base = upload_base.into();
        self
    }

    async fn start_session(
        &self,
        session: &ServiceSession,
        mime_type: &str,
        total: u64,
        metadata: &VideoMetadata,
    ) -> std::result::Result<String, UploadFailure> {
        let body = json!({
            "snippet": {
                "title": metadata.title,
                "description": metadata.description,
                "categoryId": VIDEO_CATEGORY_ID,
            },
            "status": { "privacyStatus": VIDEO_PRIVACY },
        });
        let response = self
            .http
            .post(format!("{}/upload/youtube/v3/videos", self.upload_base))
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .bearer_auth(&session.access_token)
            .header("X-Upload-Content-Type", mime_type)
            .header("X-Upload-Content-Length", total.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| unclassified(format!("could not start upload session: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_upload_error(status.as_u16(), &text));
        }
        response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| unclassified("upload session response had no Location header"))
    }
}

fn unclassified(message: impl Into<String>) -> UploadFailure {
    UploadFailure::Unclassified {
        message: message.into(),
    }
}

/// Next byte offset from a `Range: bytes=0-N` header, 0 when nothing was stored.
pub(super) fn next_offset_from_range(range: Option<&str>) -> u64 {
    range
        .and_then(|r| r.trim().strip_prefix("bytes="))
        .and_then(|r| r.split('-').nth(1))
        .and_then(|end| end.trim().parse::<u64>().ok())
        .map(|end| end + 1)
        .unwrap_or(0)
}

async fn read_chunk(file: &mut tokio::fs::File, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut chunk = vec![0u8; len];
    file.read_exact(&mut chunk).await?;
    Ok(chunk)
}

#[async_trait]
impl VideoHost for YouTubeUploader {
    async fn upload(
        &self,
        session: &ServiceSession,
        video_path: &Path,
        metadata: &VideoMetadata,
    ) -> std::result::Result<String, UploadFailure> {
        let read_error = |e: std::io::Error| unclassified(format!("could not read {}: {e}", video_path.display()));
        let mut file = tokio::fs::File::open(video_path).await.map_err(read_error)?;
        let total = file.metadata().await.map_err(read_error)?.len();
        if total == 0 {
            return Err(unclassified("video file is empty"));
        }
        let mime_type = video_mime_type(video_path);
        let location = self.start_session(session, mime_type, total, metadata).await?;

        let mut offset = 0u64;
        for _ in 0..self.max_polls {
            let end = (offset + self.chunk_bytes).min(total);
            // Everything acknowledged: an empty `bytes */total` PUT asks for the final status.
            let content_range = if offset >= total {
                format!("bytes */{}", total)
            } else {
                format!("bytes {}-{}/{}", offset, end - 1, total)
            };
            let chunk = if offset >= total {
                Vec::new()
            } else {
                read_chunk(&mut file, offset, (end - offset) as usize)
                    .await
                    .map_err(read_error)?
            };
            let response = self
                .http
                .put(&location)
                .bearer_auth(&session.access_token)
                .header(reqwest::header::CONTENT_TYPE, mime_type)
                .header(reqwest::header::CONTENT_RANGE, content_range)
                .body(chunk)
                .send()
                .await
                .map_err(|e| unclassified(format!("upload chunk failed: {e}")))?;
            let status = response.status();

            if status == reqwest::StatusCode::PERMANENT_REDIRECT {
                let range = response
                    .headers()
                    .get(reqwest::header::RANGE)
                    .and_then(|v| v.to_str().ok());
                offset = next_offset_from_range(range).min(total);
                debug!("youtube acknowledged {} of {} bytes", offset, total);
                continue;
            }
            if status.is_success() {
                let video: Value = response
                    .json()
                    .await
                    .map_err(|e| unclassified(format!("could not decode upload response: {e}")))?;
                return video
                    .get("id")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| unclassified("upload response had no video id"));
            }
            let text = response.text().await.unwrap_or_default();
            return Err(classify_upload_error(status.as_u16(), &text));
        }

        Err(unclassified("upload did not complete"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiFile {
    name: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiUploadResponse {
    file: GeminiFile,
}

pub(super) struct GeminiClient {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub(super) fn new(http: reqwest::Client, api_key: String, model: String) -> Self {
        GeminiClient {
            http,
            api_base: GEMINI_API_BASE.to_string(),
            api_key,
            model,
        }
    }
}

pub(super) fn parse_remote_state(state: Option<&str>) -> RemoteFileState {
    match state {
        Some("ACTIVE") => RemoteFileState::Active,
        Some("FAILED") => RemoteFileState::Failed,
        _ => RemoteFileState::Pending,
    }
}

pub(super) fn extract_candidate_text(response: &Value) -> Option<String> {
    let parts = response
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: Vec<&str> = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text.join(""))
    }
}

#[async_trait]
impl GenerativeModel for GeminiClient {
    async fn upload(&self, video_path: &Path) -> Result<RemoteFile> {
        let data = tokio::fs::read(video_path)
            .await
            .with_context(|| format!("read {}", video_path.display()))?;
        let mime_type = video_mime_type(video_path);

        let start = self
            .http
            .post(format!("{}/upload/v1beta/files", self.api_base))
            .query(&[("key", self.api_key.as_str())])
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", data.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": format!("video-{}", Uuid::new_v4()) } }))
            .send()
            .await
            .context("gemini upload start request failed")?;
        if !start.status().is_success() {
            let status = start.status().as_u16();
            let body = start.text().await.unwrap_or_default();
            return Err(anyhow!(
                "gemini upload start failed with status {}: {}",
                status,
                truncate_for_error(&body, 400)
            ));
        }
        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("gemini upload start returned no upload url"))?;

        let uploaded: GeminiUploadResponse = send_json(
            "gemini file upload",
            self.http
                .post(upload_url)
                .header("X-Goog-Upload-Offset", "0")
                .header("X-Goog-Upload-Command", "upload, finalize")
                .body(data),
        )
        .await?;

        Ok(RemoteFile {
            name: uploaded.file.name,
            uri: uploaded.file.uri,
            mime_type: uploaded
                .file
                .mime_type
                .unwrap_or_else(|| mime_type.to_string()),
        })
    }

    async fn status(&self, file: &RemoteFile) -> Result<RemoteFileState> {
        let info: GeminiFile = send_json(
            "gemini files.get",
            self.http
                .get(format!("{}/v1beta/{}", self.api_base, file.name))
                .query(&[("key", self.api_key.as_str())]),
        )
        .await?;
        Ok(parse_remote_state(info.state.as_deref()))
    }

    async fn generate(&self, file: &RemoteFile, prompt: &str) -> Result<String> {
        let body = json!({
            "contents": [{
                "parts": [
                    { "file_data": { "mime_type": file.mime_type, "file_uri": file.uri } },
                    { "text": prompt },
                ]
            }]
        });
        let response: Value = send_json(
            "gemini generateContent",
            self.http
                .post(format!(
                    "{}/v1beta/models/{}:generateContent",
                    self.api_base, self.model
                ))
                .query(&[("key", self.api_key.as_str())])
                .json(&body),
        )
        .await?;
        extract_candidate_text(&response).ok_or_else(|| anyhow!("gemini response contained no text"))
    }
}
