use super::*;
use chrono::NaiveTime;
use teloxide::net::Download;

const TELEGRAM_TEXT_LIMIT: usize = 4096;
const UPLOAD_CHUNK_GRANULARITY: usize = 256 * 1024;

#[derive(Debug, Deserialize, Default)]
pub(super) struct ConfigFile {
    #[serde(default)]
    pub(super) token: Option<String>,
    #[serde(default)]
    pub(super) google_api_key: Option<String>,
    pub(super) data_dir: PathBuf,
    #[serde(default)]
    pub(super) scratch_dir: Option<PathBuf>,
    #[serde(default)]
    pub(super) timezone: Option<String>,
    #[serde(default)]
    pub(super) gemini_model: Option<String>,
    #[serde(default)]
    pub(super) allowed_user_ids: Vec<u64>,
    #[serde(default)]
    pub(super) host: Option<String>,
    #[serde(default)]
    pub(super) port: Option<u16>,
    #[serde(default)]
    pub(super) webhook_base: Option<String>,
    #[serde(default)]
    pub(super) webhook_secret: Option<String>,
    #[serde(default)]
    pub(super) upload_chunk_bytes: Option<usize>,
    #[serde(default)]
    pub(super) request_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub(super) metadata_deadline_seconds: Option<u64>,
}

pub(super) fn load_config(path: &Path) -> Result<Config> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let config_file: ConfigFile = toml::from_str(&contents).context("parse config")?;
    let config_dir = path.parent().unwrap_or_else(|| Path::new("."));
    build_config(config_file, config_dir, |key| std::env::var(key).ok())
}

pub(super) fn build_config(
    mut file: ConfigFile,
    config_dir: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let non_empty = |value: Option<String>| value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(token) = non_empty(env("TELEGRAM_BOT_TOKEN")) {
        file.token = Some(token);
    }
    if let Some(key) = non_empty(env("GOOGLE_API_KEY")) {
        file.google_api_key = Some(key);
    }
    if let Some(base) = non_empty(env("WEBHOOK_BASE")) {
        file.webhook_base = Some(base);
    }
    if let Some(port) = non_empty(env("PORT")) {
        file.port = Some(port.parse::<u16>().context("parse PORT")?);
    }

    let token = non_empty(file.token).ok_or_else(|| anyhow!("token is required (config or TELEGRAM_BOT_TOKEN)"))?;
    let google_api_key = non_empty(file.google_api_key)
        .ok_or_else(|| anyhow!("google_api_key is required (config or GOOGLE_API_KEY)"))?;

    let timezone_name = file.timezone.unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
    let timezone: chrono_tz::Tz = timezone_name
        .parse()
        .map_err(|e| anyhow!("invalid timezone '{}': {}", timezone_name, e))?;

    let webhook = non_empty(file.webhook_base).map(|base| WebhookConfig {
        base_url: base.trim_end_matches('/').to_string(),
        secret: non_empty(file.webhook_secret.clone()).unwrap_or_else(|| token.clone()),
    });

    let host = file.host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = file.port.unwrap_or(DEFAULT_PORT);

    Ok(Config {
        token,
        google_api_key,
        data_dir: resolve_config_path(&file.data_dir, config_dir),
        scratch_dir: file
            .scratch_dir
            .map(|p| resolve_config_path(&p, config_dir))
            .unwrap_or_else(std::env::temp_dir),
        timezone,
        gemini_model: file
            .gemini_model
            .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
        allowed_user_ids: file.allowed_user_ids,
        bind_addr: format!("{}:{}", host, port),
        webhook,
        upload_chunk_bytes: round_upload_chunk(
            file.upload_chunk_bytes.unwrap_or(DEFAULT_UPLOAD_CHUNK_BYTES),
        ),
        request_timeout: Duration::from_secs(file.request_timeout_seconds.unwrap_or(120).max(1)),
        metadata_deadline: Duration::from_secs(file.metadata_deadline_seconds.unwrap_or(180).max(1)),
    })
}

pub(super) fn resolve_config_path(path: &Path, config_dir: &Path) -> PathBuf {
    if path.is_relative() {
        config_dir.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Resumable uploads require chunks in multiples of 256 KiB.
pub(super) fn round_upload_chunk(bytes: usize) -> usize {
    let chunks = (bytes / UPLOAD_CHUNK_GRANULARITY).max(1);
    chunks * UPLOAD_CHUNK_GRANULARITY
}

pub(super) fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("no parent dir for {}", path.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.write_all(data).context("write temp file")?;
    tmp.flush().context("flush temp file")?;
    tmp.as_file_mut().sync_all().context("sync temp file")?;
    tmp.persist(path)
        .map_err(|e| anyhow!("persist temp file: {}", e))?;
    Ok(())
}

pub(super) fn parse_command(text: &str) -> Option<&str> {
    let first = text.split_whitespace().next()?;
    if !first.starts_with('/') {
        return None;
    }
    let cmd = first.trim_start_matches('/');
    Some(cmd.split('@').next().unwrap_or(cmd))
}

/// Strict `HH:MM`, two digits each, 00:00 through 23:59.
pub(super) fn parse_time_of_day(text: &str) -> Option<NaiveTime> {
    let bytes = text.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return None;
    }
    let digits = [bytes[0], bytes[1], bytes[3], bytes[4]];
    if !digits.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hour = u32::from(bytes[0] - b'0') * 10 + u32::from(bytes[1] - b'0');
    let minute = u32::from(bytes[3] - b'0') * 10 + u32::from(bytes[4] - b'0');
    NaiveTime::from_hms_opt(hour, minute, 0)
}

pub(super) fn is_authorized(user_id: u64, allowed: &[u64]) -> bool {
    allowed.is_empty() || allowed.contains(&user_id)
}

pub(super) fn truncate_for_error(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

pub(super) fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::USER_AGENT,
        reqwest::header::HeaderValue::from_static("drive-tube-bot"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .context("create http client")
}

fn button(label: &str, action: ButtonAction) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(label, action.callback_data())
}

pub(super) fn keyboard_markup(keyboard: Keyboard) -> InlineKeyboardMarkup {
    let rows = match keyboard {
        Keyboard::MainMenu => vec![
            vec![button("Publish now", ButtonAction::PublishNow)],
            vec![button("Configure autopost", ButtonAction::AutopostSetup)],
            vec![button("Show settings", ButtonAction::ShowSettings)],
            vec![button("Reset setup", ButtonAction::ResetSetup)],
        ],
        Keyboard::AfterPublish => vec![
            vec![button("Show settings", ButtonAction::ShowSettings)],
            vec![button("Reset setup", ButtonAction::ResetSetup)],
        ],
        Keyboard::AutopostControl => vec![vec![button("Stop autopost", ButtonAction::AutopostStop)]],
    };
    InlineKeyboardMarkup::new(rows)
}

pub(super) async fn send_reply(bot: &Bot, chat_id: ChatId, reply: &Reply) -> Result<()> {
    let text = truncate_for_error(&reply.text, TELEGRAM_TEXT_LIMIT - 3);
    let mut request = bot.send_message(chat_id, text);
    if let Some(keyboard) = reply.keyboard {
        request = request.reply_markup(keyboard_markup(keyboard));
    }
    request.await?;
    Ok(())
}

pub(super) async fn send_replies(bot: &Bot, chat_id: ChatId, replies: &[Reply]) -> Result<()> {
    for reply in replies {
        send_reply(bot, chat_id, reply).await?;
    }
    Ok(())
}

pub(super) async fn download_telegram_file(bot: &Bot, file_id: &str) -> Result<Vec<u8>> {
    let file = bot.get_file(file_id).await.context("get telegram file")?;
    let mut buf: Vec<u8> = Vec::new();
    bot.download_file(&file.path, &mut buf)
        .await
        .context("download telegram file")?;
    Ok(buf)
}

pub(super) struct TelegramOutbox {
    bot: Bot,
}

impl TelegramOutbox {
    pub(super) fn new(bot: Bot) -> Self {
        TelegramOutbox { bot }
    }
}

#[async_trait]
impl Outbox for TelegramOutbox {
    async fn send(&self, chat_id: i64, reply: Reply) -> Result<()> {
        send_reply(&self.bot, ChatId(chat_id), &reply).await
    }
}
