//! OpenAI-compatible HTTP clients for extraction and embeddings.
//!
//! Both clients map HTTP failures onto the same classes so the retry state
//! machine treats chat and embedding endpoints alike.

use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{EmbeddingSection, LlmSection};
use crate::embeddings::{validate_batch, EmbeddingClient, EmbeddingError, EmbeddingResult};
use crate::llm::{Extraction, ExtractionRequest, LlmClient, LlmError};

const EXTRACTION_PROMPT: &str = "You extract a knowledge graph from source files. \
Reply with a JSON object {\"entities\": [{\"name\", \"entity_type\", \"description\"}], \
\"relations\": [{\"source\", \"target\", \"description\"}]}. Use exact identifiers as names \
for code symbols. Relation endpoints must be entity names. Reply with {} if nothing stands out.";

/// Classified HTTP failure.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpFailure {
    RateLimited { retry_after: Option<Duration> },
    Auth(String),
    Transient(String),
    Unrecoverable(String),
}

impl From<HttpFailure> for LlmError {
    fn from(f: HttpFailure) -> Self {
        match f {
            HttpFailure::RateLimited { retry_after } => LlmError::RateLimited { retry_after },
            HttpFailure::Auth(m) => LlmError::Auth(m),
            HttpFailure::Transient(m) => LlmError::Transient(m),
            HttpFailure::Unrecoverable(m) => LlmError::Unrecoverable(m),
        }
    }
}

impl From<HttpFailure> for EmbeddingError {
    fn from(f: HttpFailure) -> Self {
        match f {
            HttpFailure::RateLimited { retry_after } => EmbeddingError::RateLimited { retry_after },
            HttpFailure::Auth(m) => EmbeddingError::Auth(m),
            HttpFailure::Transient(m) => EmbeddingError::Transient(m),
            HttpFailure::Unrecoverable(m) => EmbeddingError::Unrecoverable(m),
        }
    }
}

/// Map a non-success status to a failure class.
///
/// 429 is rate limiting, 401/403 are credential problems, 408 and 5xx are
/// worth retrying; any other status will fail the same way again.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> HttpFailure {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body, 200));
    match status.as_u16() {
        429 => HttpFailure::RateLimited { retry_after },
        401 | 403 => HttpFailure::Auth(message),
        408 => HttpFailure::Transient(message),
        s if (500..600).contains(&s) => HttpFailure::Transient(message),
        _ => HttpFailure::Unrecoverable(message),
    }
}

/// `Retry-After` in delta-seconds form. HTTP dates are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn transport_failure(e: reqwest::Error) -> HttpFailure {
    if e.is_builder() {
        HttpFailure::Unrecoverable(e.to_string())
    } else {
        HttpFailure::Transient(e.to_string())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

async fn check_status(response: Response) -> Result<Response, HttpFailure> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let hint = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, hint, &body))
}

fn build_client(timeout_secs: u64) -> Result<Client, HttpFailure> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| HttpFailure::Unrecoverable(format!("failed to build HTTP client: {}", e)))
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

// Wire types

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

/// Parse the model's reply. Markdown fences around the JSON are tolerated.
pub fn parse_extraction(content: &str) -> Result<Extraction, LlmError> {
    let trimmed = content.trim();
    let json = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    if json.is_empty() {
        return Ok(Extraction::default());
    }
    serde_json::from_str(json)
        .map_err(|e| LlmError::Unrecoverable(format!("malformed extraction JSON: {}", e)))
}

/// Chat-completions extractor.
#[derive(Debug, Clone)]
pub struct OpenAiExtractor {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiExtractor {
    pub fn new(config: &LlmSection, api_key: Option<String>) -> Result<Self, LlmError> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            api_key,
        })
    }

    async fn request(&self, request: ExtractionRequest<'_>) -> Result<Extraction, LlmError> {
        let payload = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: EXTRACTION_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: format!(
                        "File: {}\nLanguage: {}\n\n{}",
                        request.path, request.language, request.content
                    ),
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat { kind: "json_object" },
        };

        debug!(model = %self.model, path = %request.path, "Sending extraction request");
        let mut req = self
            .client
            .post(endpoint(&self.base_url, "chat/completions"))
            .json(&payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(transport_failure)?;
        let response = check_status(response).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Unrecoverable(format!("failed to parse response body: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        trace!(content = %content, "Extraction reply");
        parse_extraction(&content)
    }
}

impl LlmClient for OpenAiExtractor {
    fn extract<'a>(
        &'a self,
        request: ExtractionRequest<'a>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Extraction, LlmError>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(LlmError::Cancelled),
                res = self.request(request) => res,
            }
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Embeddings endpoint client.
#[derive(Debug, Clone)]
pub struct OpenAiEmbeddings {
    client: Client,
    base_url: String,
    model: String,
    dimension: usize,
    custom_dimension: bool,
    api_key: Option<String>,
}

impl OpenAiEmbeddings {
    pub fn new(config: &EmbeddingSection, api_key: Option<String>) -> Result<Self, EmbeddingError> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            dimension: config.dimension,
            custom_dimension: config.custom_dimension,
            api_key,
        })
    }

    fn body<'a>(&'a self, texts: &'a [String]) -> EmbeddingRequest<'a> {
        EmbeddingRequest {
            model: &self.model,
            input: texts,
            encoding_format: "float",
            dimensions: self.custom_dimension.then_some(self.dimension),
        }
    }

    async fn request(&self, texts: &[String]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(model = %self.model, count = texts.len(), "Sending embedding request");
        let mut req = self
            .client
            .post(endpoint(&self.base_url, "embeddings"))
            .json(&self.body(texts));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(transport_failure)?;
        let response = check_status(response).await?;
        let mut parsed: EmbeddingResponse = response.json().await.map_err(|e| {
            EmbeddingError::Unrecoverable(format!("failed to parse response body: {}", e))
        })?;

        parsed.data.sort_by_key(|d| d.index);
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        validate_batch(texts.len(), &vectors, self.dimension)?;
        Ok(vectors)
    }
}

impl EmbeddingClient for OpenAiEmbeddings {
    fn embed<'a>(
        &'a self,
        texts: &'a [String],
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, EmbeddingResult<Vec<Vec<f32>>>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(EmbeddingError::Cancelled),
                res = self.request(texts) => res,
            }
        })
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_classify_status() {
        let hint = Some(Duration::from_secs(7));
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, hint, ""),
            HttpFailure::RateLimited { retry_after: hint }
        );
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, "bad key"),
            HttpFailure::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, ""),
            HttpFailure::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT, None, ""),
            HttpFailure::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, ""),
            HttpFailure::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, "context too long"),
            HttpFailure::Unrecoverable(m) if m.contains("context too long")
        ));
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_failure_conversion() {
        let e: LlmError = HttpFailure::Auth("401".into()).into();
        assert_eq!(e, LlmError::Auth("401".into()));
        let e: EmbeddingError = HttpFailure::RateLimited { retry_after: None }.into();
        assert_eq!(e, EmbeddingError::RateLimited { retry_after: None });
    }

    #[test]
    fn test_parse_extraction() {
        let reply = "```json\n{\"entities\": [{\"name\": \"UserService\", \"entity_type\": \"class\", \"description\": \"Users\"}]}\n```";
        let extraction = parse_extraction(reply).unwrap();
        assert_eq!(extraction.entities.len(), 1);
        assert!(extraction.relations.is_empty());

        assert_eq!(parse_extraction("").unwrap(), Extraction::default());
        assert!(matches!(
            parse_extraction("not json"),
            Err(LlmError::Unrecoverable(_))
        ));
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }

    #[test]
    fn test_embedding_request_dimensions() {
        let texts = vec!["UserService".to_string()];
        let mut config = EmbeddingSection {
            dimension: 256,
            ..Default::default()
        };

        let client = OpenAiEmbeddings::new(&config, None).unwrap();
        let body = serde_json::to_value(client.body(&texts)).unwrap();
        assert!(body.get("dimensions").is_none());
        assert_eq!(body["encoding_format"], "float");

        config.custom_dimension = true;
        let client = OpenAiEmbeddings::new(&config, None).unwrap();
        let body = serde_json::to_value(client.body(&texts)).unwrap();
        assert_eq!(body["dimensions"], 256);
        assert_eq!(body["input"][0], "UserService");
    }

    #[test]
    fn test_endpoint_join() {
        assert_eq!(
            endpoint("https://api.openai.com/v1/", "embeddings"),
            "https://api.openai.com/v1/embeddings"
        );
    }
}
