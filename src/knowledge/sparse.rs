//! Sparse Index - BM25 키워드 검색
//!
//! [`bm25`] 크레이트의 `Embedder`/`Scorer` 위에 한국어 토크나이저를 꽂아 사용합니다.
//! 파라미터는 k1=1.5, b=0.75 이고 IDF는 `ln(1 + (N - n + 0.5) / (n + 0.5))`라서
//! 모든 문서에 나오는 단어도 음수가 되지 않습니다.
//!
//! 청크 목록과 통계(문서 길이, avgdl)를 하나의 `sparse.bin`으로 저장하고,
//! 로드 시 저장된 avgdl로 스코어러를 다시 채웁니다.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use bm25::{Embedder, EmbedderBuilder, Scorer};
use serde::{Deserialize, Serialize};

use super::chunk::{sort_by_score_desc, Chunk, ChunkId, ScoredChunk, SearchStage};
use super::tokenizer::{tokenize, KoreanTokenizer};
use crate::error::{RagError, Result};

pub const SPARSE_FILE: &str = "sparse.bin";

const K1: f32 = 1.5;
const B: f32 = 0.75;

/// sparse.bin 직렬화 형식
#[derive(Serialize, Deserialize)]
struct SparseSnapshot {
    chunks: Vec<Chunk>,
    doc_len: Vec<u32>,
    avgdl: f32,
}

/// BM25 희소 인덱스
///
/// 문서 키는 코퍼스 위치(`usize`)입니다.
pub struct SparseIndex {
    chunks: Vec<Chunk>,
    doc_len: Vec<u32>,
    avgdl: f32,
    embedder: Embedder<u32, KoreanTokenizer>,
    scorer: Scorer<usize, u32>,
    /// ChunkId → 코퍼스 위치
    positions: HashMap<ChunkId, usize>,
}

fn build_embedder(avgdl: f32) -> Embedder<u32, KoreanTokenizer> {
    // 빈 코퍼스에서도 0으로 나누지 않도록
    let avgdl = if avgdl > 0.0 { avgdl } else { 1.0 };
    EmbedderBuilder::<u32, KoreanTokenizer>::with_avgdl(avgdl)
        .tokenizer(KoreanTokenizer)
        .k1(K1)
        .b(B)
        .build()
}

fn average(doc_len: &[u32]) -> f32 {
    if doc_len.is_empty() {
        return 0.0;
    }
    doc_len.iter().map(|&l| l as f32).sum::<f32>() / doc_len.len() as f32
}

impl Default for SparseIndex {
    fn default() -> Self {
        Self {
            chunks: Vec::new(),
            doc_len: Vec::new(),
            avgdl: 0.0,
            embedder: build_embedder(0.0),
            scorer: Scorer::new(),
            positions: HashMap::new(),
        }
    }
}

impl fmt::Debug for SparseIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseIndex")
            .field("chunks", &self.chunks.len())
            .field("avgdl", &self.avgdl)
            .finish()
    }
}

impl SparseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// 코퍼스 순서의 청크
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// 청크 추가 후 전체 코퍼스 통계 재계산
    ///
    /// avgdl이 바뀌면 기존 문서의 TF 가중치도 달라지므로 스코어러를 다시 채웁니다.
    pub fn add(&mut self, chunks: &[Chunk]) {
        if chunks.is_empty() {
            return;
        }

        for chunk in chunks {
            self.positions.insert(chunk.id(), self.chunks.len());
            self.doc_len.push(tokenize(&chunk.content).len() as u32);
            self.chunks.push(chunk.clone());
        }

        self.avgdl = average(&self.doc_len);
        self.rebuild();
        tracing::debug!("BM25 indexed {} chunks (total {})", chunks.len(), self.chunks.len());
    }

    /// 현재 avgdl로 임베더와 스코어러 재구성
    fn rebuild(&mut self) {
        self.embedder = build_embedder(self.avgdl);

        let mut scorer = Scorer::<usize, u32>::new();
        for (i, chunk) in self.chunks.iter().enumerate() {
            scorer.upsert(&i, self.embedder.embed(&chunk.content));
        }
        self.scorer = scorer;
    }

    /// 코퍼스 순서와 정렬된 전체 점수 벡터
    pub fn full_scores(&self, query: &str) -> Vec<f32> {
        if self.chunks.is_empty() {
            return vec![];
        }

        let query_embedding = self.embedder.embed(query);
        (0..self.chunks.len())
            .map(|i| {
                self.scorer
                    .score(&i, &query_embedding)
                    .filter(|s| s.is_finite())
                    .unwrap_or(0.0)
            })
            .collect()
    }

    /// 상위 top_k 검색 (점수 > 0 만)
    pub fn search(&self, query: &str, top_k: usize, tenant: Option<&str>) -> Vec<ScoredChunk> {
        if top_k == 0 || self.chunks.is_empty() {
            return vec![];
        }

        let scores = self.full_scores(query);
        let mut results: Vec<ScoredChunk> = scores
            .into_iter()
            .enumerate()
            .filter(|(i, score)| *score > 0.0 && self.chunks[*i].matches_tenant(tenant))
            .map(|(i, score)| ScoredChunk::new(self.chunks[i].clone(), score, SearchStage::Sparse))
            .collect();

        sort_by_score_desc(&mut results);
        results.truncate(top_k);
        results
    }

    /// ChunkId의 코퍼스 위치
    pub fn position_of(&self, id: ChunkId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    /// `full_scores` 결과에서 ChunkId로 점수 조회 (없으면 0)
    pub fn score_of(&self, id: ChunkId, scores: &[f32]) -> f32 {
        self.position_of(id)
            .and_then(|i| scores.get(i).copied())
            .unwrap_or(0.0)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// `dir/sparse.bin`에 저장
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        let snapshot = SparseSnapshot {
            chunks: self.chunks.clone(),
            doc_len: self.doc_len.clone(),
            avgdl: self.avgdl,
        };
        let bytes = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())?;
        std::fs::write(dir.join(SPARSE_FILE), bytes)?;
        Ok(())
    }

    /// `dir/sparse.bin`에서 로드
    ///
    /// 파일이 없으면 `IndexNotFound`, 디코딩 실패는 `IndexCorrupt`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(SPARSE_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RagError::IndexNotFound(path))
            }
            Err(e) => return Err(RagError::corrupt(&path, e)),
        };

        let (snapshot, _): (SparseSnapshot, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| RagError::corrupt(&path, e))?;

        if snapshot.doc_len.len() != snapshot.chunks.len() {
            return Err(RagError::corrupt(&path, "statistics not aligned with chunk list"));
        }
        if !snapshot.avgdl.is_finite() || snapshot.avgdl < 0.0 {
            return Err(RagError::corrupt(&path, format!("invalid avgdl {}", snapshot.avgdl)));
        }

        let positions = snapshot
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id(), i))
            .collect();

        let mut index = Self {
            chunks: snapshot.chunks,
            doc_len: snapshot.doc_len,
            avgdl: snapshot.avgdl,
            embedder: build_embedder(snapshot.avgdl),
            scorer: Scorer::new(),
            positions,
        };
        index.rebuild();
        Ok(index)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn corpus() -> Vec<Chunk> {
        ["사과는 과일이다", "바나나는 노랗다", "하늘은 파랗다"]
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk::new(*t, "fruits.txt", i, i * 10, i * 10 + t.chars().count()))
            .collect()
    }

    #[test]
    fn test_korean_query_ranks_matching_chunk_first() {
        let mut index = SparseIndex::new();
        index.add(&corpus());

        let results = index.search("사과", 5, None);
        assert!(!results.is_empty());
        assert_eq!(results[0].chunk.metadata.chunk_index, 0);
        assert!(results[0].score > 0.0);
        assert_eq!(results[0].stage, SearchStage::Sparse);
    }

    #[test]
    fn test_search_filters_zero_scores() {
        let mut index = SparseIndex::new();
        index.add(&corpus());
        assert!(index.search("존재하지않는단어", 5, None).is_empty());
    }

    #[test]
    fn test_full_scores_aligned_with_corpus() {
        let mut index = SparseIndex::new();
        let chunks = corpus();
        index.add(&chunks);

        let scores = index.full_scores("하늘");
        assert_eq!(scores.len(), 3);
        assert!(scores[2] > 0.0);
        assert_eq!(scores[0], 0.0);
        assert_eq!(index.score_of(chunks[2].id(), &scores), scores[2]);
        assert_eq!(index.score_of(Chunk::new("x", "other", 0, 0, 1).id(), &scores), 0.0);
    }

    #[test]
    fn test_append_recomputes_stats() {
        let mut index = SparseIndex::new();
        let chunks = corpus();
        index.add(&chunks[..1]);
        index.add(&chunks[1..]);

        let mut batch = SparseIndex::new();
        batch.add(&chunks);

        assert_eq!(index.full_scores("사과"), batch.full_scores("사과"));
        assert_eq!(index.position_of(chunks[2].id()), Some(2));
    }

    #[test]
    fn test_term_in_every_document_scores_positive() {
        let mut index = SparseIndex::new();
        let chunks: Vec<Chunk> = ["rust fast", "rust safe", "rust fun"]
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk::new(*t, "en.txt", i, i * 10, i * 10 + 9))
            .collect();
        index.add(&chunks);

        // 모든 문서에 있는 단어도 음수가 되지 않음
        assert!(index.full_scores("rust").iter().all(|s| *s > 0.0));
        assert_eq!(index.search("rust", 5, None).len(), 3);
    }

    #[test]
    fn test_tenant_filter() {
        let mut index = SparseIndex::new();
        index.add(&[
            Chunk::new("rust book", "a", 0, 0, 9).with_user_id("alice"),
            Chunk::new("rust guide", "a", 1, 9, 19).with_user_id("bob"),
            Chunk::new("python guide", "a", 2, 19, 31),
        ]);

        let results = index.search("rust", 5, Some("bob"));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.content, "rust guide");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut index = SparseIndex::new();
        index.add(&corpus());
        index.save(dir.path()).unwrap();

        let loaded = SparseIndex::load(dir.path()).unwrap();
        assert_eq!(loaded.chunks(), index.chunks());
        assert_eq!(loaded.full_scores("사과"), index.full_scores("사과"));
    }

    #[test]
    fn test_load_missing_vs_corrupt() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SparseIndex::load(dir.path()),
            Err(RagError::IndexNotFound(_))
        ));

        std::fs::write(dir.path().join(SPARSE_FILE), [0xFFu8; 3]).unwrap();
        assert!(matches!(
            SparseIndex::load(dir.path()),
            Err(RagError::IndexCorrupt { .. })
        ));
    }

    #[test]
    fn test_higher_term_frequency_scores_higher() {
        let mut index = SparseIndex::new();
        let chunks: Vec<Chunk> = ["rust programming", "rust rust rust is a programming language", "python programming"]
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk::new(*t, "en.txt", i, i * 50, i * 50 + t.len()))
            .collect();
        index.add(&chunks);

        let scores = index.full_scores("rust");
        assert!(scores[1] > scores[0]);
        assert_eq!(scores[2], 0.0);
    }

    #[test]
    fn test_empty_index() {
        let index = SparseIndex::new();
        assert!(index.is_empty());
        assert!(index.search("anything", 3, None).is_empty());
        assert!(index.full_scores("anything").is_empty());
    }
}
