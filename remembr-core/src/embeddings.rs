//! Embedding provider interface and HTTP client
//!
//! The engine never computes embeddings itself. It calls an external
//! provider through [`EmbeddingProvider`]:
//! - **HttpEmbeddingClient**: OpenAI/Jina-compatible `/embeddings` endpoint
//!   with bounded timeouts and transient-only retries
//! - test doubles implement the trait directly

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config;

// ============================================================================
// EmbeddingProvider trait
// ============================================================================

/// Abstraction over embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed many texts, returning vectors in input order. Providers that
    /// support batching should override this to use a single request.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Model identifier recorded alongside stored vectors.
    fn model(&self) -> &str;

    /// Output dimensionality of [`Self::model`].
    fn dimensions(&self) -> usize;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid response from {model}: expected {expected} dimensions, got {actual}")]
    InvalidDimensions {
        model: String,
        expected: usize,
        actual: usize,
    },

    #[error("Provider returned {actual} embeddings for {expected} inputs")]
    CountMismatch { expected: usize, actual: usize },

    #[error("Missing API key (set {0})")]
    MissingApiKey(String),

    #[error("All {attempts} retry attempts failed: {last}")]
    RetryExhausted { attempts: usize, last: String },
}

impl EmbeddingError {
    /// Network errors, timeouts, rate limiting and 5xx responses are retried.
    /// Bad requests and unknown models are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            EmbeddingError::Http(e) => e.is_timeout() || e.is_connect(),
            EmbeddingError::Api { code, .. } => {
                *code == StatusCode::TOO_MANY_REQUESTS.as_u16() || *code >= 500
            }
            _ => false,
        }
    }

    /// The provider refused this particular input (malformed, too long).
    /// Retrying the same text will fail again; other inputs may succeed.
    pub fn is_input_rejected(&self) -> bool {
        matches!(self, EmbeddingError::Api { code, .. } if matches!(*code, 400 | 413 | 422))
    }
}

// ============================================================================
// Config
// ============================================================================

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpEmbeddingConfig {
    pub api_key: String,
    /// Environment variable the key is read from; named in errors.
    pub api_key_env: String,
    pub model: String,
    pub dimensions: usize,
    pub timeout: Duration,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub batch_size: usize,
}

impl HttpEmbeddingConfig {
    /// Build from the `[embedding]` config section, reading the API key from
    /// the configured environment variable.
    pub fn from_config(config: &config::EmbeddingConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();

        Self {
            api_key,
            api_key_env: config.api_key_env.clone(),
            model: config.model.clone(),
            dimensions: config.dimensions,
            timeout: Duration::from_secs(config.request_timeout_seconds),
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            batch_size: config.batch_size.max(1),
        }
    }
}

// ============================================================================
// Wire structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Message { message: String },
    Text(String),
}

// ============================================================================
// HttpEmbeddingClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpEmbeddingClient {
    client: Client,
    config: HttpEmbeddingConfig,
    base_url: String,
}

impl HttpEmbeddingClient {
    pub fn new(config: HttpEmbeddingConfig, base_url: impl Into<String>) -> Result<Self, EmbeddingError> {
        if config.api_key.is_empty() {
            return Err(EmbeddingError::MissingApiKey(config.api_key_env.clone()));
        }

        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            config,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &config::EmbeddingConfig) -> Result<Self, EmbeddingError> {
        Self::new(HttpEmbeddingConfig::from_config(config), config.base_url.clone())
    }

    async fn request_with_retry(&self, input: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let result = RetryIf::spawn(
            retry_strategy,
            || self.request_once(input),
            |e: &EmbeddingError| {
                let transient = e.is_transient();
                if transient {
                    tracing::warn!(error = %e, "Transient embedding failure, retrying");
                }
                transient
            },
        )
        .await;

        match result {
            Ok(vectors) => Ok(vectors),
            Err(e) if e.is_transient() => {
                tracing::error!(
                    attempts = self.config.max_retries + 1,
                    error = %e,
                    "All embedding retry attempts failed"
                );
                Err(EmbeddingError::RetryExhausted {
                    attempts: self.config.max_retries + 1,
                    last: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn request_once(&self, input: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingsRequest {
            model: &self.config.model,
            input,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|b| match (b.error, b.detail) {
                    (Some(ErrorDetail::Message { message }), _) => Some(message),
                    (Some(ErrorDetail::Text(text)), _) => Some(text),
                    (None, detail) => detail,
                })
                .unwrap_or(body);

            tracing::error!(code = status.as_u16(), message = %message, "Embedding API error");
            return Err(EmbeddingError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let mut parsed: EmbeddingsResponse = response.json().await?;
        if parsed.data.len() != input.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: input.len(),
                actual: parsed.data.len(),
            });
        }

        parsed.data.sort_by_key(|item| item.index.unwrap_or(usize::MAX));

        let mut vectors = Vec::with_capacity(parsed.data.len());
        for item in parsed.data {
            if item.embedding.len() != self.config.dimensions {
                return Err(EmbeddingError::InvalidDimensions {
                    model: self.config.model.clone(),
                    expected: self.config.dimensions,
                    actual: item.embedding.len(),
                });
            }
            vectors.push(item.embedding);
        }

        tracing::debug!(
            model = %self.config.model,
            count = vectors.len(),
            dimensions = self.config.dimensions,
            "Generated embeddings"
        );

        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let input = [text.to_string()];
        let mut vectors = self.request_with_retry(&input).await?;
        vectors.pop().ok_or(EmbeddingError::CountMismatch {
            expected: 1,
            actual: 0,
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.config.batch_size) {
            out.extend(self.request_with_retry(chunk).await?);
        }
        Ok(out)
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn name(&self) -> &str {
        "http"
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DIMS: usize = 8;

    fn test_config(api_key: &str) -> HttpEmbeddingConfig {
        HttpEmbeddingConfig {
            api_key: api_key.to_string(),
            api_key_env: "REMEMBR_TEST_EMBEDDING_KEY".to_string(),
            model: "jina-embeddings-v3".to_string(),
            dimensions: DIMS,
            timeout: Duration::from_secs(5),
            max_retries: 2,
            retry_delay_ms: 10,
            batch_size: 2,
        }
    }

    fn vector(seed: usize) -> Vec<f32> {
        (0..DIMS).map(|i| ((i + seed) as f32) / DIMS as f32).collect()
    }

    fn response_for(seeds: &[usize]) -> serde_json::Value {
        let data: Vec<serde_json::Value> = seeds
            .iter()
            .enumerate()
            .map(|(index, seed)| serde_json::json!({ "index": index, "embedding": vector(*seed) }))
            .collect();
        serde_json::json!({ "data": data })
    }

    #[tokio::test]
    async fn test_embed_calls_api_and_returns_vector() {
        let mock_server = MockServer::start().await;
        let client = HttpEmbeddingClient::new(test_config("test-key"), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_json(serde_json::json!({
                "model": "jina-embeddings-v3",
                "input": ["hello world"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(response_for(&[0])))
            .mount(&mock_server)
            .await;

        let embedding = client.embed("hello world").await.unwrap();
        assert_eq!(embedding, vector(0));
    }

    #[tokio::test]
    async fn test_missing_api_key_rejected() {
        let result = HttpEmbeddingClient::new(test_config(""), "http://localhost");
        match result {
            Err(EmbeddingError::MissingApiKey(var)) => assert_eq!(var, "REMEMBR_TEST_EMBEDDING_KEY"),
            other => panic!("expected MissingApiKey, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_api_key_names_configured_variable() {
        let config = config::EmbeddingConfig {
            api_key_env: format!("REMEMBR_UNSET_KEY_{}", uuid::Uuid::new_v4().simple()),
            ..Default::default()
        };
        let err = HttpEmbeddingClient::from_config(&config).unwrap_err();
        assert!(err.to_string().contains(&config.api_key_env), "{}", err);
        assert!(!err.to_string().contains(&config.model));
    }

    #[tokio::test]
    async fn test_retries_on_503_then_succeeds() {
        let mock_server = MockServer::start().await;
        let client = HttpEmbeddingClient::new(test_config("k"), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_json(serde_json::json!({
                "detail": "overloaded"
            })))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(response_for(&[3])))
            .mount(&mock_server)
            .await;

        let embedding = client.embed("hello").await.unwrap();
        assert_eq!(embedding, vector(3));
    }

    #[tokio::test]
    async fn test_persistent_500_exhausts_retries() {
        let mock_server = MockServer::start().await;
        let client = HttpEmbeddingClient::new(test_config("k"), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": { "message": "boom" }
            })))
            .expect(3)
            .mount(&mock_server)
            .await;

        match client.embed("hello").await {
            Err(EmbeddingError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.contains("boom"));
            }
            other => panic!("Expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_request_is_not_retried() {
        let mock_server = MockServer::start().await;
        let client = HttpEmbeddingClient::new(test_config("k"), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "detail": "unknown model"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        match client.embed("hello").await {
            Err(EmbeddingError::Api { code, message }) => {
                assert_eq!(code, 400);
                assert_eq!(message, "unknown model");
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_dimensions_is_permanent() {
        let mock_server = MockServer::start().await;
        let client = HttpEmbeddingClient::new(test_config("k"), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{ "index": 0, "embedding": [0.1, 0.2, 0.3] }]
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        match client.embed("hello").await {
            Err(EmbeddingError::InvalidDimensions { expected, actual, .. }) => {
                assert_eq!(expected, DIMS);
                assert_eq!(actual, 3);
            }
            other => panic!("Expected InvalidDimensions, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_batch_splits_requests_and_preserves_order() {
        let mock_server = MockServer::start().await;
        let client = HttpEmbeddingClient::new(test_config("k"), mock_server.uri()).unwrap();

        Mock::given(method("POST"))
            .and(body_json(serde_json::json!({
                "model": "jina-embeddings-v3",
                "input": ["a", "b"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    { "index": 1, "embedding": vector(2) },
                    { "index": 0, "embedding": vector(1) }
                ]
            })))
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(body_json(serde_json::json!({
                "model": "jina-embeddings-v3",
                "input": ["c"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(response_for(&[5])))
            .mount(&mock_server)
            .await;

        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let vectors = client.embed_batch(&texts).await.unwrap();

        assert_eq!(vectors, vec![vector(1), vector(2), vector(5)]);
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
    }

    #[test]
    fn test_transient_classification() {
        assert!(EmbeddingError::Api { code: 429, message: String::new() }.is_transient());
        assert!(EmbeddingError::Api { code: 502, message: String::new() }.is_transient());
        assert!(!EmbeddingError::Api { code: 404, message: String::new() }.is_transient());
        assert!(!EmbeddingError::MissingApiKey("X".to_string()).is_transient());
    }

    #[test]
    fn test_input_rejection_classification() {
        assert!(EmbeddingError::Api { code: 400, message: String::new() }.is_input_rejected());
        assert!(EmbeddingError::Api { code: 413, message: String::new() }.is_input_rejected());
        assert!(!EmbeddingError::Api { code: 401, message: String::new() }.is_input_rejected());
        assert!(!EmbeddingError::Api { code: 503, message: String::new() }.is_input_rejected());
        assert!(!EmbeddingError::MissingApiKey("X".to_string()).is_input_rejected());
    }
}
