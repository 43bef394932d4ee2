use super::*;
use crate::integrations::{GenerativeModel, RemoteFile, RemoteFileState};

pub(super) const TRENDING_TAGS: [&str; 10] = [
    "Trending", "Viral", "Shorts", "AI", "Creative", "YouTube", "Funny", "Tech", "Magic", "Surprise",
];

const CONTEXT_GROUPS: &[(&[&str], &[&str])] = &[
    (&["slime", "glitter", "goo"], &["Slime", "Glitter"]),
    (&["cat", "kitten"], &["Kitten", "Cats", "PetLovers"]),
    (&["wave", "ocean", "sea", "surf"], &["Ocean", "Wave", "Nature"]),
    (&["car", "auto", "vehicle"], &["Car", "Automotive"]),
    (&["transform", "morph", "change"], &["Transformation"]),
];

pub(super) const DEFAULT_TITLE: &str = "AI Magic: Surprising Transformation!";
pub(super) const DEFAULT_DESCRIPTION: &str =
    "A stunning AI-powered visual with an unexpected twist that keeps you watching.";
pub(super) const FALLBACK_DESCRIPTION: &str = "Fallback description.";
const MAX_TITLE_CHARS: usize = 70;
const MAX_HASHTAGS: usize = 10;
const READY_POLL_ATTEMPTS: u32 = 60;
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

const METADATA_PROMPT: &str = "Analyze the video and generate:\n\
1) A catchy English YouTube title (max 70 characters).\n\
2) A short English description (3-4 sentences) explaining what the viewer sees and why it's engaging.\n\
Return exactly:\nTitle: <title>\nDescription: <description>";

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct VideoMetadata {
    pub(super) title: String,
    pub(super) description: String,
}

pub(super) fn infer_context_tags(filename: &str) -> Vec<String> {
    let name = filename.to_lowercase();
    let mut tags: Vec<String> = Vec::new();
    for (keywords, group_tags) in CONTEXT_GROUPS {
        if keywords.iter().any(|k| name.contains(k)) {
            for tag in group_tags.iter() {
                if !tags.iter().any(|t| t == tag) {
                    tags.push(tag.to_string());
                }
            }
        }
    }
    tags
}

/// Up to five trending tags, then up to five contextual ones, then the rest of
/// both lists until `max_total` is reached.
pub(super) fn format_hashtags<T: AsRef<str>, C: AsRef<str>>(
    trending: &[T],
    contextual: &[C],
    max_total: usize,
) -> String {
    let trending: Vec<&str> = trending.iter().map(AsRef::as_ref).collect();
    let contextual: Vec<&str> = contextual.iter().map(AsRef::as_ref).collect();
    let (trending_head, trending_tail) = trending.split_at(trending.len().min(5));
    let (contextual_head, contextual_tail) = contextual.split_at(contextual.len().min(5));

    let mut mixed: Vec<&str> = Vec::new();
    for tag in trending_head
        .iter()
        .chain(contextual_head)
        .chain(trending_tail)
        .chain(contextual_tail)
    {
        if mixed.len() >= max_total {
            break;
        }
        if !mixed.contains(tag) {
            mixed.push(*tag);
        }
    }

    mixed
        .iter()
        .map(|tag| format!("#{}", tag.replace(' ', "")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn label_value<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let cleaned = line.trim().trim_start_matches('*').trim_start();
    let head = cleaned.get(..label.len())?;
    if !head.eq_ignore_ascii_case(label) {
        return None;
    }
    let value = cleaned[label.len()..].trim().trim_start_matches('*').trim();
    Some(value)
}

/// Reads the `Title:` and `Description:` lines, substituting defaults for
/// missing or empty labels. The title is cut to 70 characters.
pub(super) fn parse_metadata_response(text: &str) -> (String, String) {
    let mut title: Option<String> = None;
    let mut description: Option<String> = None;
    for line in text.lines() {
        if let Some(value) = label_value(line, "title:") {
            title = Some(value.to_string());
        } else if let Some(value) = label_value(line, "description:") {
            description = Some(value.to_string());
        }
    }
    let title = title
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_TITLE.to_string());
    let description = description
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string());
    let title: String = title.chars().take(MAX_TITLE_CHARS).collect();
    (title.trim().to_string(), description)
}

pub(super) struct MetadataSynthesizer {
    model: Arc<dyn GenerativeModel>,
    poll_attempts: u32,
    poll_interval: Duration,
    deadline: Duration,
}

impl MetadataSynthesizer {
    pub(super) fn new(model: Arc<dyn GenerativeModel>) -> Self {
        MetadataSynthesizer {
            model,
            poll_attempts: READY_POLL_ATTEMPTS,
            poll_interval: READY_POLL_INTERVAL,
            deadline: Duration::from_secs(180),
        }
    }

    pub(super) fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    #[cfg(test)]
    pub(super) fn with_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.poll_attempts = attempts;
        self.poll_interval = interval;
        self
    }

    /// Never fails: any problem with the remote service yields the fallback pair.
    pub(super) async fn synthesize(&self, video_path: &Path, filename_hint: &str) -> VideoMetadata {
        let contextual = infer_context_tags(filename_hint);
        let hashtags = format_hashtags(&TRENDING_TAGS[..], &contextual, MAX_HASHTAGS);

        let remote = tokio::time::timeout(self.deadline, self.generate_remote(video_path)).await;
        let (title, description) = match remote {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                warn!("metadata generation failed, using fallback: {:#}", err);
                (DEFAULT_TITLE.to_string(), FALLBACK_DESCRIPTION.to_string())
            }
            Err(_) => {
                warn!(
                    "metadata generation exceeded {}s, using fallback",
                    self.deadline.as_secs()
                );
                (DEFAULT_TITLE.to_string(), FALLBACK_DESCRIPTION.to_string())
            }
        };

        VideoMetadata {
            title,
            description: format!("{}\n{}", description, hashtags),
        }
    }

    async fn generate_remote(&self, video_path: &Path) -> Result<(String, String)> {
        let file = self.model.upload(video_path).await?;
        self.wait_until_active(&file).await?;
        let text = self.model.generate(&file, METADATA_PROMPT).await?;
        Ok(parse_metadata_response(text.trim()))
    }

    async fn wait_until_active(&self, file: &RemoteFile) -> Result<()> {
        for attempt in 0..self.poll_attempts {
            match self.model.status(file).await? {
                RemoteFileState::Active => return Ok(()),
                RemoteFileState::Failed => {
                    return Err(anyhow!("generative service failed to process {}", file.name))
                }
                RemoteFileState::Pending => {
                    if attempt + 1 < self.poll_attempts {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
            }
        }
        Err(anyhow!(
            "{} did not become active after {} checks",
            file.name,
            self.poll_attempts
        ))
    }
}
