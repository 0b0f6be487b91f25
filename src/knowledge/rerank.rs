//! Rerank - Cross-encoder 재정렬
//!
//! 융합된 후보의 점수를 (질의, 본문) 쌍 점수로 교체하고 다시 정렬합니다.
//! 재현율은 바뀌지 않고 최종 순서와 선택만 바뀝니다.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::chunk::{sort_by_score_desc, ScoredChunk, SearchStage};
use crate::error::RagError;

// ============================================================================
// Reranker Trait
// ============================================================================

/// 쌍 단위 점수 함수
#[async_trait]
pub trait Reranker: Send + Sync {
    /// (질의, 본문) 관련성 점수
    async fn score(&self, query: &str, text: &str) -> Result<f32>;

    /// 배치 점수 (기본 구현: 순차 호출)
    async fn score_batch(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        let mut scores = Vec::with_capacity(texts.len());
        for text in texts {
            scores.push(self.score(query, text).await?);
        }
        Ok(scores)
    }

    fn name(&self) -> &str;
}

// ============================================================================
// RerankEngine
// ============================================================================

/// 리랭커를 감싸 후보 목록을 재정렬
#[derive(Clone)]
pub struct RerankEngine {
    reranker: Arc<dyn Reranker>,
}

impl RerankEngine {
    pub fn new(reranker: Arc<dyn Reranker>) -> Self {
        Self { reranker }
    }

    pub fn name(&self) -> &str {
        self.reranker.name()
    }

    /// 점수 교체 → 내림차순 정렬 → top_k
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<ScoredChunk>,
        top_k: usize,
    ) -> crate::error::Result<Vec<ScoredChunk>> {
        if candidates.is_empty() {
            return Ok(vec![]);
        }

        let texts: Vec<String> = candidates.iter().map(|c| c.chunk.content.clone()).collect();
        let scores = self
            .reranker
            .score_batch(query, &texts)
            .await
            .map_err(|e| RagError::Rerank(e.to_string()))?;

        if scores.len() != candidates.len() {
            return Err(RagError::Rerank(format!(
                "{} scores for {} candidates",
                scores.len(),
                candidates.len()
            )));
        }

        let input_count = candidates.len();
        let mut reranked: Vec<ScoredChunk> = candidates
            .into_iter()
            .zip(scores)
            .map(|(c, score)| ScoredChunk::new(c.chunk, score, SearchStage::Reranked))
            .collect();

        sort_by_score_desc(&mut reranked);
        reranked.truncate(top_k);

        tracing::debug!(
            "Reranked {} candidates with {} → {}",
            input_count,
            self.reranker.name(),
            reranked.len()
        );
        Ok(reranked)
    }
}

// ============================================================================
// HTTP Reranker (TEI 호환)
// ============================================================================

/// `/rerank` 요청 본문
#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
    raw_scores: bool,
}

/// `/rerank` 응답 항목
#[derive(Debug, Deserialize)]
struct RerankHit {
    index: usize,
    score: f32,
}

/// text-embeddings-inference 호환 `/rerank` 엔드포인트 클라이언트
///
/// 응답은 점수순이므로 `index`로 입력 순서를 복원합니다.
#[derive(Debug, Clone)]
pub struct HttpReranker {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpReranker {
    /// # Arguments
    /// * `base_url` - 예: `http://localhost:8080`
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            endpoint: format!("{}/rerank", base_url.trim_end_matches('/')),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// 응답 항목을 입력 순서의 점수 벡터로 변환
fn scores_in_input_order(hits: Vec<RerankHit>, len: usize) -> Result<Vec<f32>> {
    let mut scores = vec![None; len];
    for hit in hits {
        let slot = scores
            .get_mut(hit.index)
            .ok_or_else(|| anyhow::anyhow!("Rerank response index {} out of range", hit.index))?;
        *slot = Some(hit.score);
    }

    scores
        .into_iter()
        .enumerate()
        .map(|(i, s)| s.ok_or_else(|| anyhow::anyhow!("Rerank response missing index {}", i)))
        .collect()
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn score(&self, query: &str, text: &str) -> Result<f32> {
        let scores = self.score_batch(query, &[text.to_string()]).await?;
        scores
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty rerank response"))
    }

    async fn score_batch(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let request = RerankRequest {
            query,
            texts,
            raw_scores: false,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .context("Failed to send rerank request")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            anyhow::bail!("Rerank API error ({}): {}", status, body);
        }

        let hits: Vec<RerankHit> =
            serde_json::from_str(&body).context("Failed to parse rerank response")?;
        scores_in_input_order(hits, texts.len())
    }

    fn name(&self) -> &str {
        "http-rerank"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::chunk::Chunk;

    /// 질의 단어가 본문에 나온 횟수로 점수
    struct OverlapReranker;

    #[async_trait]
    impl Reranker for OverlapReranker {
        async fn score(&self, query: &str, text: &str) -> Result<f32> {
            Ok(query.split_whitespace().filter(|w| text.contains(w)).count() as f32)
        }

        fn name(&self) -> &str {
            "overlap"
        }
    }

    struct BrokenReranker;

    #[async_trait]
    impl Reranker for BrokenReranker {
        async fn score(&self, _query: &str, _text: &str) -> Result<f32> {
            anyhow::bail!("model not loaded")
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    fn candidates() -> Vec<ScoredChunk> {
        ["alpha", "alpha beta", "alpha beta gamma"]
            .iter()
            .enumerate()
            .map(|(i, t)| ScoredChunk::new(Chunk::new(*t, "d", i, i * 20, i * 20 + 16), 1.0 - i as f32 * 0.1, SearchStage::Rrf))
            .collect()
    }

    #[tokio::test]
    async fn test_rerank_reorders_and_truncates() {
        let engine = RerankEngine::new(Arc::new(OverlapReranker));
        let results = engine.rerank("alpha beta gamma", candidates(), 2).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.content, "alpha beta gamma");
        assert_eq!(results[0].score, 3.0);
        assert_eq!(results[0].stage, SearchStage::Reranked);
    }

    #[tokio::test]
    async fn test_rerank_empty() {
        let engine = RerankEngine::new(Arc::new(OverlapReranker));
        assert!(engine.rerank("q", vec![], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rerank_failure_is_rerank_error() {
        let engine = RerankEngine::new(Arc::new(BrokenReranker));
        let err = engine.rerank("q", candidates(), 5).await.unwrap_err();
        assert!(matches!(err, RagError::Rerank(_)));
    }

    #[test]
    fn test_scores_in_input_order() {
        let hits = vec![
            RerankHit { index: 1, score: 0.9 },
            RerankHit { index: 0, score: 0.2 },
        ];
        assert_eq!(scores_in_input_order(hits, 2).unwrap(), vec![0.2, 0.9]);

        let missing = vec![RerankHit { index: 0, score: 0.2 }];
        assert!(scores_in_input_order(missing, 2).is_err());
    }

    #[test]
    fn test_http_reranker_endpoint() {
        let reranker = HttpReranker::new("http://localhost:8080/").unwrap();
        assert_eq!(reranker.endpoint(), "http://localhost:8080/rerank");
    }
}
