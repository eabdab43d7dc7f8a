use crate::config::Config;
use crate::errors::{BibSortError, Result};
use crate::parse::extract_bib_numbers;
use crate::preprocess::ProcessedPayload;
use crate::retry::{RetryFailure, RetryPolicy};
use crate::traits::{BibDetector, CompletionTransport, Sleeper, TokioSleeper};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, trace};

const SITE_URL: &str = "http://localhost";
const SITE_NAME: &str = "RaceNumberRadar";

/// OpenAI-compatible chat completion request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderPreference>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderPreference {
    pub only: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: String,
}

impl ApiErrorBody {
    fn into_error(self) -> BibSortError {
        let status = self
            .code
            .as_ref()
            .and_then(|code| code.as_u64().or_else(|| code.as_str()?.parse().ok()))
            .and_then(|code| u16::try_from(code).ok());
        match status {
            Some(status) => BibSortError::from_status(status, self.message),
            // upstream provider hiccup without a usable code
            None => BibSortError::TransientApi {
                status: None,
                message: self.message,
            },
        }
    }
}

/// Pull the reply text out of a raw completion body.
fn reply_text(body: &str) -> Result<String> {
    let response: CompletionResponse =
        serde_json::from_str(body).map_err(|e| BibSortError::TransientApi {
            status: None,
            message: format!("unreadable completion body: {e}"),
        })?;
    if let Some(error) = response.error {
        return Err(error.into_error());
    }
    response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content.unwrap_or_default())
        .ok_or_else(|| BibSortError::TransientApi {
            status: None,
            message: "completion has no choices".to_string(),
        })
}

pub fn build_prompt(min_len: usize, max_len: usize) -> String {
    let digits = if min_len == max_len {
        format!("{min_len}")
    } else {
        format!("{min_len} to {max_len}")
    };
    format!(
        "Identify all race bib numbers in this image. \
         Respond with only the numbers, separated by commas. \
         For example: 123,431,890. The bib numbers are always {digits} digits. \
         If no numbers are found, respond with 'none'."
    )
}

pub fn data_uri(payload: &ProcessedPayload) -> String {
    format!(
        "data:{};base64,{}",
        payload.mime(),
        general_purpose::STANDARD.encode(payload.bytes())
    )
}

/// Chat completions over HTTPS with a bearer key.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(config: &Config, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| BibSortError::Configuration {
                message: format!("cannot build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.api_base.trim_end_matches('/')),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", SITE_URL)
            .header("X-Title", SITE_NAME)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BibSortError::from_status(status.as_u16(), body));
        }
        reply_text(&body)
    }
}

/// Asks the model for bib numbers, retrying transient failures.
pub struct DetectionClient<T: CompletionTransport, S: Sleeper = TokioSleeper> {
    transport: T,
    sleeper: S,
    policy: RetryPolicy,
    model: String,
    provider: Option<String>,
    max_tokens: u32,
    min_bib_len: usize,
    max_bib_len: usize,
    attempt_timeout: Duration,
}

impl<T: CompletionTransport> DetectionClient<T> {
    pub fn new(transport: T, config: &Config) -> Self {
        Self {
            transport,
            sleeper: TokioSleeper,
            policy: RetryPolicy::new(config.max_attempts, config.retry_base_delay()),
            model: config.model.clone(),
            provider: config.provider.clone(),
            max_tokens: config.max_tokens,
            min_bib_len: config.min_bib_len,
            max_bib_len: config.max_bib_len,
            attempt_timeout: config.request_timeout(),
        }
    }
}

impl<T: CompletionTransport, S: Sleeper> DetectionClient<T, S> {
    pub fn with_sleeper<S2: Sleeper>(self, sleeper: S2) -> DetectionClient<T, S2> {
        DetectionClient {
            transport: self.transport,
            sleeper,
            policy: self.policy,
            model: self.model,
            provider: self.provider,
            max_tokens: self.max_tokens,
            min_bib_len: self.min_bib_len,
            max_bib_len: self.max_bib_len,
            attempt_timeout: self.attempt_timeout,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn request_for(&self, payload: &ProcessedPayload) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: vec![
                    ContentPart::Text {
                        text: build_prompt(self.min_bib_len, self.max_bib_len),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: data_uri(payload),
                        },
                    },
                ],
            }],
            max_tokens: self.max_tokens,
            provider: self.provider.as_ref().map(|p| ProviderPreference {
                only: vec![p.clone()],
            }),
        }
    }

    async fn attempt(&self, request: &CompletionRequest, attempt: u32) -> Result<String> {
        trace!(attempt, model = %request.model, "sending completion request");
        match timeout(self.attempt_timeout, self.transport.complete(request)).await {
            Ok(reply) => reply,
            Err(_) => Err(BibSortError::Timeout {
                after: self.attempt_timeout,
            }),
        }
    }
}

#[async_trait]
impl<T: CompletionTransport, S: Sleeper> BibDetector for DetectionClient<T, S> {
    async fn detect(&self, payload: &ProcessedPayload) -> Result<BTreeSet<String>> {
        let request = self.request_for(payload);
        let request = &request;

        let outcome = self
            .policy
            .retry(&self.sleeper, move |attempt| self.attempt(request, attempt))
            .await;

        match outcome {
            Ok(reply) => {
                let numbers = extract_bib_numbers(&reply, self.min_bib_len, self.max_bib_len);
                debug!(
                    path = %payload.source().display(),
                    reply = %reply.trim(),
                    ?numbers,
                    "model replied"
                );
                Ok(numbers)
            }
            Err(RetryFailure {
                attempts,
                last_error,
            }) if last_error.is_transient() => Err(BibSortError::DetectionFailed {
                path: payload.source().to_path_buf(),
                attempts,
                source: Box::new(last_error),
            }),
            Err(RetryFailure { last_error, .. }) => Err(last_error),
        }
    }
}
