//! 검색 결과 융합 - RRF / 가중치 정규화 합 / 다중 쿼리 병합
//!
//! 순수 함수만 있습니다. 두 검색 단계의 실행과 성능 저하 처리는 `HybridRetriever`가 맡습니다.
//!
//! ref: https://www.elastic.co/blog/hybrid-search-rrf

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::chunk::{sort_by_score_desc, ChunkId, ScoredChunk, SearchStage};
use crate::error::{RagError, Result};

/// RRF 상수 기본값
pub const DEFAULT_RRF_K: usize = 60;

// ============================================================================
// Options
// ============================================================================

/// 융합 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionType {
    /// Reciprocal Rank Fusion (순위만 사용)
    #[default]
    Rrf,
    /// min-max 정규화 후 가중합
    Weighted,
}

impl FromStr for FusionType {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rrf" => Ok(Self::Rrf),
            "weighted" => Ok(Self::Weighted),
            other => Err(RagError::Configuration(format!(
                "Unknown fusion type '{}' (expected rrf or weighted)",
                other
            ))),
        }
    }
}

impl fmt::Display for FusionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rrf => f.write_str("rrf"),
            Self::Weighted => f.write_str("weighted"),
        }
    }
}

/// 검색 옵션
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub top_k: usize,
    pub fusion: FusionType,
    /// 가중치 융합의 밀집 비중 (0.0 ~ 1.0)
    pub alpha: f32,
    pub rrf_k: usize,
    /// 가중치 융합 점수 하한
    pub score_threshold: Option<f32>,
    /// `user_id` 필터
    pub tenant: Option<String>,
    /// 리랭커 적용 여부 (리랭커가 주입된 경우에만 동작)
    pub rerank: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            fusion: FusionType::Rrf,
            alpha: 0.5,
            rrf_k: DEFAULT_RRF_K,
            score_threshold: None,
            tenant: None,
            rerank: false,
        }
    }
}

impl SearchOptions {
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k,
            ..Default::default()
        }
    }

    pub fn rrf(mut self, k: usize) -> Self {
        self.fusion = FusionType::Rrf;
        self.rrf_k = k;
        self
    }

    pub fn weighted(mut self, alpha: f32) -> Self {
        self.fusion = FusionType::Weighted;
        self.alpha = alpha;
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_rerank(mut self, rerank: bool) -> Self {
        self.rerank = rerank;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(RagError::Configuration("top_k must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(RagError::Configuration(format!(
                "alpha must be within 0.0..=1.0, got {}",
                self.alpha
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Fusion
// ============================================================================

/// min-max 정규화 ([0, 1]로 clamp, 모두 같으면 전부 0)
pub fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;

    if !range.is_finite() || range <= f32::EPSILON {
        return vec![0.0; scores.len()];
    }

    scores
        .iter()
        .map(|s| ((s - min) / range).clamp(0.0, 1.0))
        .collect()
}

/// RRF (Reciprocal Rank Fusion)
///
/// 각 목록의 1-based 순위 r에 `1 / (k + r)`를 주고 ChunkId별로 합산합니다.
/// 원점수 크기는 쓰지 않으므로 BM25와 코사인처럼 범위가 다른 점수에 적합합니다.
pub fn rrf_fuse(
    sparse: &[ScoredChunk],
    dense: &[ScoredChunk],
    rrf_k: usize,
    top_k: usize,
) -> Vec<ScoredChunk> {
    let k = rrf_k as f32;

    // 삽입 순서 유지 (동점일 때 결정적 순서)
    let mut positions: HashMap<ChunkId, usize> = HashMap::new();
    let mut fused: Vec<ScoredChunk> = Vec::new();

    for list in [sparse, dense] {
        for (rank, result) in list.iter().enumerate() {
            let contribution = 1.0 / (k + rank as f32 + 1.0);
            match positions.get(&result.id()) {
                Some(&i) => fused[i].score += contribution,
                None => {
                    positions.insert(result.id(), fused.len());
                    fused.push(ScoredChunk::new(result.chunk.clone(), contribution, SearchStage::Rrf));
                }
            }
        }
    }

    sort_by_score_desc(&mut fused);
    fused.truncate(top_k);
    fused
}

/// 가중치 정규화 합
///
/// `dense`는 후보 집합(밀집 상위 3k), `sparse_scores[i]`는 `dense[i]`의 BM25 원점수입니다.
/// 두 점수를 후보 집합 안에서 각각 min-max 정규화한 뒤 `α·dense + (1−α)·sparse`.
pub fn weighted_fuse(
    dense: &[ScoredChunk],
    sparse_scores: &[f32],
    alpha: f32,
    score_threshold: Option<f32>,
    top_k: usize,
) -> Vec<ScoredChunk> {
    let dense_raw: Vec<f32> = dense.iter().map(|r| r.score).collect();
    let dense_norm = min_max_normalize(&dense_raw);
    let sparse_norm = min_max_normalize(sparse_scores);

    let mut fused: Vec<ScoredChunk> = dense
        .iter()
        .enumerate()
        .map(|(i, result)| {
            let s = sparse_norm.get(i).copied().unwrap_or(0.0);
            let score = alpha * dense_norm[i] + (1.0 - alpha) * s;
            ScoredChunk::new(result.chunk.clone(), score, SearchStage::Weighted)
        })
        .collect();

    sort_by_score_desc(&mut fused);
    if let Some(threshold) = score_threshold {
        fused.retain(|r| r.score >= threshold);
    }
    fused.truncate(top_k);
    fused
}

/// 다중 쿼리 결과 병합 (ChunkId별 최고 점수 유지)
pub fn merge_multi_query(result_sets: Vec<Vec<ScoredChunk>>, top_k: usize) -> Vec<ScoredChunk> {
    let mut positions: HashMap<ChunkId, usize> = HashMap::new();
    let mut merged: Vec<ScoredChunk> = Vec::new();

    for result in result_sets.into_iter().flatten() {
        match positions.get(&result.id()) {
            Some(&i) => {
                if result.score > merged[i].score {
                    merged[i] = result;
                }
            }
            None => {
                positions.insert(result.id(), merged.len());
                merged.push(result);
            }
        }
    }

    sort_by_score_desc(&mut merged);
    merged.truncate(top_k);
    merged
}

// ============================================================================
// Tests
// ============================================================================
