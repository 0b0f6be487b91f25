//! 임베딩 모듈 - Gemini API를 통한 텍스트 벡터화
//!
//! 밀집 인덱스와 시맨틱 청킹이 사용하는 임베딩 프로바이더입니다.
//! 반환 벡터는 항상 L2 정규화되어 내적이 코사인 유사도가 됩니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let key = get_api_key().ok_or_else(|| anyhow!("no key"))?;
//! let embedder = GeminiEmbedding::with_dimension(key, 768)?;
//! let doc = embedder.embed("Hello, world!").await?;
//! let query = embedder.embed_query("greeting").await?;
//! ```

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::knowledge::l2_normalize;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 구현체는 `dimension()` 길이의 정규화된 벡터를 반환해야 합니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩 (문서용)
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 검색 질의 임베딩 (기본 구현: 문서용과 동일)
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(text).await
    }

    /// 배치 임베딩 (기본 구현: 순차 호출)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    fn dimension(&self) -> usize;

    fn name(&self) -> &str;
}

// ============================================================================
// Google Gemini Embedding
// ============================================================================

/// gemini-embedding-001 (MRL로 출력 차원 선택)
/// source: https://ai.google.dev/gemini-api/docs/embeddings
const GEMINI_MODEL: &str = "models/gemini-embedding-001";
const GEMINI_EMBED_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-embedding-001:embedContent";

/// 지원하는 출력 차원
pub const SUPPORTED_DIMENSIONS: [usize; 3] = [768, 1536, 3072];
pub const DEFAULT_DIMENSION: usize = 768;

/// 요청 간 최소 간격 (무료 티어 60 RPM)
const MIN_INTERVAL: Duration = Duration::from_millis(1000);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(2000);

/// API 키 환경 변수 (앞쪽 우선)
pub const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"];

/// 재시도 대기 시간 (지수 백오프)
fn backoff(attempt: u32) -> Duration {
    INITIAL_BACKOFF * 2u32.pow(attempt)
}

/// 요청 간격 조절기
#[derive(Debug, Default)]
struct Pacer {
    last: Option<Instant>,
}

impl Pacer {
    async fn wait(&mut self) {
        if let Some(wait) = self.last.and_then(|last| MIN_INTERVAL.checked_sub(last.elapsed())) {
            tracing::debug!("Pacing embedding request: {:?}", wait);
            tokio::time::sleep(wait).await;
        }
        self.last = Some(Instant::now());
    }
}

/// 요청 한 번의 결과
enum Attempt {
    Done(Vec<f32>),
    /// 네트워크 오류나 429: 백오프 후 재시도
    Retry(anyhow::Error),
}

/// Google Gemini 임베딩 구현체
#[derive(Debug)]
pub struct GeminiEmbedding {
    api_key: String,
    client: reqwest::Client,
    dimension: usize,
    pacer: Mutex<Pacer>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedRequest<'a> {
    model: &'static str,
    content: EmbedContent<'a>,
    task_type: &'static str,
    output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
struct EmbedContent<'a> {
    parts: [EmbedPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct EmbedPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(default)]
    status: String,
}

/// 문서와 질의를 다른 taskType으로 임베딩
#[derive(Debug, Clone, Copy)]
enum TaskType {
    Document,
    Query,
}

impl TaskType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "RETRIEVAL_DOCUMENT",
            Self::Query => "RETRIEVAL_QUERY",
        }
    }
}

impl GeminiEmbedding {
    /// 출력 차원을 지정하여 생성 (768, 1536, 3072)
    pub fn with_dimension(api_key: String, dimension: usize) -> Result<Self> {
        if !SUPPORTED_DIMENSIONS.contains(&dimension) {
            anyhow::bail!(
                "Invalid dimension: {}. Must be one of {:?}",
                dimension,
                SUPPORTED_DIMENSIONS
            );
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            client,
            dimension,
            pacer: Mutex::new(Pacer::default()),
        })
    }

    async fn request(&self, text: &str, task_type: TaskType) -> Result<Vec<f32>> {
        // 빈 텍스트는 API를 부르지 않음
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        let body = EmbedRequest {
            model: GEMINI_MODEL,
            content: EmbedContent {
                parts: [EmbedPart { text }],
            },
            task_type: task_type.as_str(),
            output_dimensionality: self.dimension,
        };

        let mut attempt = 0;
        loop {
            self.pacer.lock().await.wait().await;

            match self.send_once(&body).await? {
                Attempt::Done(values) => return Ok(values),
                Attempt::Retry(e) if attempt < MAX_RETRIES => {
                    let wait = backoff(attempt);
                    attempt += 1;
                    tracing::warn!("{}; retrying in {:?} ({}/{})", e, wait, attempt, MAX_RETRIES);
                    tokio::time::sleep(wait).await;
                }
                Attempt::Retry(e) => {
                    return Err(e.context(format!("Embedding failed after {} retries", MAX_RETRIES)))
                }
            }
        }
    }

    /// 요청 한 번 전송 (4xx/5xx 중 429 외에는 즉시 에러)
    async fn send_once(&self, body: &EmbedRequest<'_>) -> Result<Attempt> {
        // API 키는 URL이 아닌 헤더로 전송
        let response = match self
            .client
            .post(GEMINI_EMBED_URL)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Ok(Attempt::Retry(anyhow::anyhow!("Embedding request failed: {}", e))),
        };

        let status = response.status();
        let text = response.text().await.context("Failed to read response body")?;

        if status.is_success() {
            let parsed: EmbedResponse =
                serde_json::from_str(&text).context("Failed to parse embedding response")?;
            let mut values = parsed.embedding.values;
            if values.len() != self.dimension {
                anyhow::bail!(
                    "Gemini returned {} dimensions, expected {}",
                    values.len(),
                    self.dimension
                );
            }
            // 3072 미만 출력은 정규화되어 있지 않음
            l2_normalize(&mut values);
            return Ok(Attempt::Done(values));
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(Attempt::Retry(anyhow::anyhow!("Rate limit exceeded (429)")));
        }

        match serde_json::from_str::<ApiError>(&text) {
            Ok(error) => anyhow::bail!("Gemini API error ({}): {}", error.error.status, error.error.message),
            Err(_) => anyhow::bail!("Gemini API error ({}): {}", status, text),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.request(text, TaskType::Document).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.request(text, TaskType::Query).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // 배치 엔드포인트 대신 순차 호출 (간격은 Pacer가 조절)
        let mut results = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            tracing::debug!("Embedding {}/{}", i + 1, texts.len());
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "gemini-embedding-001"
    }
}

// ============================================================================
// API Key
// ============================================================================

/// 환경 변수에서 API 키 조회 (`GEMINI_API_KEY` > `GOOGLE_AI_API_KEY`)
pub fn get_api_key() -> Option<String> {
    first_key(|var| std::env::var(var).ok())
}

pub fn has_api_key() -> bool {
    get_api_key().is_some()
}

fn first_key(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    API_KEY_VARS.iter().find_map(|var| {
        let key = lookup(var).filter(|k| !k.trim().is_empty())?;
        tracing::debug!("Using API key from {}", var);
        Some(key)
    })
}

// ============================================================================
// Tests
// ============================================================================
