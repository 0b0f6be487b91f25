//! Vector Store - 밀집 인덱스 트레이트 및 벡터 유틸리티
//!
//! 모든 백엔드는 정규화된 임베딩에 대해 내적(= 코사인 유사도)으로 검색합니다.
//! 백엔드 선택은 조립 시점에 설정(`embedding.store_type`)으로 결정됩니다.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::chunk::{Chunk, ScoredChunk};
use crate::error::{RagError, Result};

// ============================================================================
// VectorStore Trait
// ============================================================================

/// VectorStore 트레이트 (async)
///
/// `chunks[i]`는 `embeddings[i]`와 대응합니다. 변경은 `&mut self`,
/// 검색은 `&self`이므로 인덱싱과 검색의 직렬화는 호출자가 보장합니다.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 설정된 임베딩 차원
    fn dimension(&self) -> usize;

    /// 청크와 임베딩 추가
    ///
    /// 빈 배치는 `Ok(0)`. 개수 불일치나 차원 불일치는 배치 전체를 거부합니다.
    async fn add(&mut self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<usize>;

    /// 최근접 이웃 검색 (점수 내림차순)
    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        tenant: Option<&str>,
    ) -> Result<Vec<ScoredChunk>>;

    /// 디렉토리에 저장
    async fn save(&self, dir: &Path) -> Result<()>;

    /// 디렉토리에서 로드 (기존 내용 대체)
    async fn load(&mut self, dir: &Path) -> Result<()>;

    /// 전체 삭제
    async fn clear(&mut self) -> Result<()>;

    /// 저장된 청크 수
    async fn total_chunks(&self) -> Result<usize>;

    /// 백엔드 이름
    fn name(&self) -> &'static str;
}

/// 밀집 인덱스 백엔드 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    /// 프로세스 내 전수 탐색
    #[default]
    Flat,
    /// LanceDB 테이블
    Lance,
}

impl FromStr for StoreType {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "flat" => Ok(Self::Flat),
            "lance" | "lancedb" => Ok(Self::Lance),
            other => Err(RagError::Configuration(format!(
                "Unknown store type '{}' (expected flat or lance)",
                other
            ))),
        }
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flat => f.write_str("flat"),
            Self::Lance => f.write_str("lance"),
        }
    }
}

/// add() 입력 검증 (모든 백엔드 공통)
///
/// 빈 배치는 `EmptyInput`이며, 호출하는 `add()`는 이를 no-op으로 처리합니다.
pub(crate) fn validate_batch(chunks: &[Chunk], embeddings: &[Vec<f32>], dimension: usize) -> Result<()> {
    if chunks.len() != embeddings.len() {
        return Err(RagError::Vector(format!(
            "chunk/embedding count mismatch: {} chunks, {} embeddings",
            chunks.len(),
            embeddings.len()
        )));
    }

    if let Some(bad) = embeddings.iter().find(|e| e.len() != dimension) {
        return Err(RagError::DimensionMismatch {
            expected: dimension,
            actual: bad.len(),
        });
    }

    if chunks.is_empty() {
        return Err(RagError::EmptyInput("chunk batch"));
    }

    Ok(())
}

// ============================================================================
// meta.json
// ============================================================================

/// 밀집 인덱스 메타데이터 파일 이름
pub const DENSE_META_FILE: &str = "meta.json";

/// `meta.json` 내용
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseMeta {
    pub dimension: usize,
    #[serde(default)]
    pub backend: String,
}

impl DenseMeta {
    pub(crate) async fn write(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(dir.join(DENSE_META_FILE), json).await?;
        Ok(())
    }

    /// 읽기 + 차원 확인 (불일치, 누락, 파싱 실패는 모두 손상)
    pub(crate) async fn read_checked(dir: &Path, expected_dimension: usize) -> Result<Self> {
        let path = dir.join(DENSE_META_FILE);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| RagError::corrupt(&path, e))?;
        let meta: Self = serde_json::from_slice(&bytes).map_err(|e| RagError::corrupt(&path, e))?;

        if meta.dimension != expected_dimension {
            return Err(RagError::corrupt(
                &path,
                format!(
                    "stored dimension {} does not match configured {}",
                    meta.dimension, expected_dimension
                ),
            ));
        }
        Ok(meta)
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산
///
/// 두 벡터 간의 코사인 유사도를 계산합니다.
/// 결과는 -1.0 ~ 1.0 범위입니다.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product = dot(a, b);
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// 내적 (정규화된 벡터에서는 코사인 유사도와 같음)
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// 제자리 L2 정규화 (영벡터는 그대로)
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// 벡터들의 평균을 다시 정규화
pub fn mean_normalized(vectors: &[&[f32]]) -> Vec<f32> {
    let Some(first) = vectors.first() else {
        return vec![];
    };

    let mut mean = vec![0.0f32; first.len()];
    for v in vectors {
        for (m, x) in mean.iter_mut().zip(v.iter()) {
            *m += x;
        }
    }
    let n = vectors.len() as f32;
    for m in mean.iter_mut() {
        *m /= n;
    }

    l2_normalize(&mut mean);
    mean
}

// ============================================================================
// Tests
// ============================================================================
