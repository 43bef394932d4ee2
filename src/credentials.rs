use super::*;
use serde_json::Value;

pub(super) const OAUTH_SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/youtube.upload",
    "https://www.googleapis.com/auth/drive",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub(super) enum CredentialDocumentError {
    #[error("the file is not valid JSON ({0})")]
    InvalidJson(String),
    #[error("the JSON file has no \"installed\" or \"web\" section")]
    MissingBlock,
    #[error("the JSON file is missing the field: {0}")]
    MissingField(&'static str),
}

/// Pulls the OAuth client identity out of a Google `client_secret.json`.
///
/// The `installed` block wins over `web` when both are present. `token_uri`
/// falls back to Google's token endpoint.
pub(super) fn extract_identity(contents: &[u8]) -> Result<CredentialIdentity, CredentialDocumentError> {
    let document: Value = serde_json::from_slice(contents)
        .map_err(|e| CredentialDocumentError::InvalidJson(e.to_string()))?;
    let block = ["installed", "web"]
        .iter()
        .find_map(|key| document.get(*key).filter(|v| v.is_object()))
        .ok_or(CredentialDocumentError::MissingBlock)?;

    let field = |name: &'static str| {
        block
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let client_id = field("client_id").ok_or(CredentialDocumentError::MissingField("client_id"))?;
    let client_secret =
        field("client_secret").ok_or(CredentialDocumentError::MissingField("client_secret"))?;
    let token_uri = field("token_uri").unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());

    Ok(CredentialIdentity {
        client_id,
        client_secret,
        token_uri,
    })
}

#[derive(Clone)]
pub(super) struct ServiceSession {
    pub(super) access_token: String,
}

impl std::fmt::Debug for ServiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSession")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
pub(super) trait TokenMinter: Send + Sync {
    async fn mint(&self, identity: &CredentialIdentity, refresh_token: &str) -> Result<ServiceSession>;
}

pub(super) fn session_inputs(config: &ChatConfig) -> std::result::Result<(&CredentialIdentity, &str), String> {
    let identity = config
        .credential_identity
        .as_ref()
        .ok_or_else(|| "the OAuth credential file has not been uploaded".to_string())?;
    let refresh_token = config
        .refresh_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| "the refresh token has not been set".to_string())?;
    Ok((identity, refresh_token))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

pub(super) struct OAuthTokenMinter {
    http: reqwest::Client,
}

impl OAuthTokenMinter {
    pub(super) fn new(http: reqwest::Client) -> Self {
        OAuthTokenMinter { http }
    }
}

#[async_trait]
impl TokenMinter for OAuthTokenMinter {
    async fn mint(&self, identity: &CredentialIdentity, refresh_token: &str) -> Result<ServiceSession> {
        let response = self
            .http
            .post(&identity.token_uri)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", identity.client_id.as_str()),
                ("client_secret", identity.client_secret.as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .context("token exchange request failed")?;
        let status = response.status();
        let body: TokenResponse = response
            .json()
            .await
            .with_context(|| format!("decode token response (status {})", status.as_u16()))?;

        match body.access_token.filter(|t| !t.is_empty()) {
            Some(access_token) if status.is_success() => Ok(ServiceSession { access_token }),
            _ => Err(anyhow!(
                "token exchange failed with status {}: {} {}",
                status.as_u16(),
                body.error.unwrap_or_else(|| "unknown_error".to_string()),
                body.error_description.unwrap_or_default()
            )),
        }
    }
}
