//! HTTP client for `generateContent`-style text generation APIs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::{OracleRequest, ResolutionOracle};
use crate::config::OracleConfig;
use crate::errors::OracleError;

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    text: Option<String>,
}

/// Asynchronous oracle client.
#[derive(Clone)]
pub struct HttpOracle {
    http: reqwest::Client,
    api_url: String,
    model: String,
    api_key: String,
}

impl HttpOracle {
    pub fn new(
        api_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, OracleError> {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        let model = model.into();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mergemend/", env!("CARGO_PKG_VERSION")))
            .build()?;
        info!(api_url = %api_url, model = %model, "created HttpOracle");
        Ok(Self {
            http,
            api_url,
            model,
            api_key: api_key.into(),
        })
    }

    /// Build a client from configuration. The API key must already be
    /// resolved from the environment.
    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| OracleError::MissingApiKey(config.api_key_env.clone()))?;
        Self::new(
            &config.api_url,
            &config.model,
            api_key,
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_url, self.model)
    }
}

#[async_trait]
impl ResolutionOracle for HttpOracle {
    #[instrument(skip(self, request), fields(model = %self.model, branch = %request.branch))]
    async fn resolve(&self, request: &OracleRequest) -> Result<Vec<String>, OracleError> {
        let payload = serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
        });
        let resp = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("oracle rate limited");
            return Err(OracleError::RateLimited);
        }
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(OracleError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let candidates = parse_candidates(&body)?;
        debug!(count = candidates.len(), "oracle candidates received");
        Ok(candidates)
    }
}

/// Extract candidate texts from a response body. Candidates without text are
/// dropped; multi-part candidates are concatenated.
fn parse_candidates(body: &str) -> Result<Vec<String>, OracleError> {
    let parsed: GenerateResponse =
        serde_json::from_str(body).map_err(|e| OracleError::ParseError(e.to_string()))?;

    Ok(parsed
        .candidates
        .into_iter()
        .filter_map(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<String>()
        })
        .filter(|text| !text.is_empty())
        .collect())
}
