//! Flat Vector Store - 전수 탐색 밀집 인덱스
//!
//! 근사 없이 모든 벡터와 내적을 계산합니다. 중간 규모 코퍼스에서는 충분히 빠르고
//! 결과가 항상 정확합니다.
//!
//! 저장 파일:
//! - `dense.index`: 차원 + 평탄화된 f32 벡터 (bincode)
//! - `chunks.bin`: 벡터 순서와 같은 청크 목록 (bincode)
//! - `meta.json`: `{"dimension": ...}`

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::chunk::{sort_by_score_desc, Chunk, ScoredChunk, SearchStage};
use super::vector::{dot, validate_batch, DenseMeta, VectorStore};
use crate::error::{RagError, Result};

pub const DENSE_INDEX_FILE: &str = "dense.index";
pub const CHUNKS_FILE: &str = "chunks.bin";

/// dense.index 직렬화 형식
#[derive(Debug, Serialize, Deserialize)]
struct DenseBlob {
    dimension: usize,
    vectors: Vec<f32>,
}

/// 전수 탐색 벡터 저장소
#[derive(Debug, Clone)]
pub struct FlatVectorStore {
    dimension: usize,
    chunks: Vec<Chunk>,
    /// `chunks.len() * dimension` 길이
    vectors: Vec<f32>,
}

impl FlatVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            chunks: Vec::new(),
            vectors: Vec::new(),
        }
    }

    /// 저장된 청크 (삽입 순서)
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    fn vector(&self, i: usize) -> &[f32] {
        &self.vectors[i * self.dimension..(i + 1) * self.dimension]
    }
}

#[async_trait]
impl VectorStore for FlatVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn add(&mut self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<usize> {
        match validate_batch(chunks, embeddings, self.dimension) {
            Err(RagError::EmptyInput(_)) => return Ok(0),
            other => other?,
        }

        self.vectors.reserve(embeddings.len() * self.dimension);
        for embedding in embeddings {
            self.vectors.extend_from_slice(embedding);
        }
        self.chunks.extend_from_slice(chunks);

        tracing::debug!("Flat store: added {} vectors (total {})", chunks.len(), self.chunks.len());
        Ok(chunks.len())
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        tenant: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        if query_embedding.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: query_embedding.len(),
            });
        }
        if top_k == 0 || self.chunks.is_empty() {
            return Ok(vec![]);
        }

        let mut results: Vec<ScoredChunk> = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| chunk.matches_tenant(tenant))
            .map(|(i, chunk)| {
                let score = dot(self.vector(i), query_embedding);
                ScoredChunk::new(chunk.clone(), score, SearchStage::Dense)
            })
            .collect();

        sort_by_score_desc(&mut results);
        results.truncate(top_k);
        Ok(results)
    }

    async fn save(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;

        let config = bincode::config::standard();
        let blob = DenseBlob {
            dimension: self.dimension,
            vectors: self.vectors.clone(),
        };
        tokio::fs::write(
            dir.join(DENSE_INDEX_FILE),
            bincode::serde::encode_to_vec(&blob, config)?,
        )
        .await?;
        tokio::fs::write(
            dir.join(CHUNKS_FILE),
            bincode::serde::encode_to_vec(&self.chunks, config)?,
        )
        .await?;

        DenseMeta {
            dimension: self.dimension,
            backend: self.name().to_string(),
        }
        .write(dir)
        .await?;

        tracing::debug!("Flat store saved ({} vectors)", self.chunks.len());
        Ok(())
    }

    async fn load(&mut self, dir: &Path) -> Result<()> {
        DenseMeta::read_checked(dir, self.dimension).await?;

        let config = bincode::config::standard();

        let index_path = dir.join(DENSE_INDEX_FILE);
        let bytes = tokio::fs::read(&index_path)
            .await
            .map_err(|e| RagError::corrupt(&index_path, e))?;
        let (blob, _): (DenseBlob, usize) = bincode::serde::decode_from_slice(&bytes, config)
            .map_err(|e| RagError::corrupt(&index_path, e))?;

        let chunks_path = dir.join(CHUNKS_FILE);
        let bytes = tokio::fs::read(&chunks_path)
            .await
            .map_err(|e| RagError::corrupt(&chunks_path, e))?;
        let (chunks, _): (Vec<Chunk>, usize) = bincode::serde::decode_from_slice(&bytes, config)
            .map_err(|e| RagError::corrupt(&chunks_path, e))?;

        if blob.dimension != self.dimension {
            return Err(RagError::corrupt(
                &index_path,
                format!("dimension {} != {}", blob.dimension, self.dimension),
            ));
        }
        if blob.vectors.len() != chunks.len() * self.dimension {
            return Err(RagError::corrupt(
                &index_path,
                format!(
                    "{} floats for {} chunks of dimension {}",
                    blob.vectors.len(),
                    chunks.len(),
                    self.dimension
                ),
            ));
        }

        self.vectors = blob.vectors;
        self.chunks = chunks;
        tracing::debug!("Flat store loaded ({} vectors)", self.chunks.len());
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        self.chunks.clear();
        self.vectors.clear();
        Ok(())
    }

    async fn total_chunks(&self) -> Result<usize> {
        Ok(self.chunks.len())
    }

    fn name(&self) -> &'static str {
        "flat"
    }
}

// ============================================================================
// Tests
// ============================================================================
