//! Chunk 데이터 모델
//!
//! 인덱싱되는 텍스트 단위와 메타데이터, 그리고 검색 결과 타입입니다.
//! 청크는 생성 후 수정되지 않으며 희소/밀집 인덱스에 같은 ChunkId로 저장됩니다.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// ChunkId
// ============================================================================

/// 교차 인덱스 식별자
///
/// `(source, start_char, end_char)`의 sha256 앞 8바이트입니다.
/// 위치 기반 `chunk_index`와 달리 문서 간 충돌이 없고 재인덱싱에도 안정적입니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(u64);

impl ChunkId {
    pub fn derive(source: &str, start_char: usize, end_char: usize) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
        hasher.update((start_char as u64).to_le_bytes());
        hasher.update((end_char as u64).to_le_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self(u64::from_le_bytes(bytes))
    }

    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// ============================================================================
// Chunk
// ============================================================================

/// 청크 메타데이터
///
/// 필수 필드 외에 전략별 필드는 Option으로 둡니다.
/// (bincode는 자기 기술적 포맷이 아니므로 skip_serializing_if를 쓰지 않습니다)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// 원본 문서 식별자 (보통 절대 경로)
    pub source: String,
    /// 한 번의 청킹 호출 내 순서 (0부터)
    pub chunk_index: usize,
    /// 정규화된 원문 기준 시작 위치 (문자 단위)
    pub start_char: usize,
    /// 정규화된 원문 기준 끝 위치 (문자 단위)
    pub end_char: usize,
    /// Markdown 헤더 경로 (예: "# Title > ## Section")
    pub header_path: Option<String>,
    /// 청킹 전략 이름 ("semantic" 등)
    pub chunking_strategy: Option<String>,
    pub sentence_count: Option<usize>,
    pub avg_similarity: Option<f32>,
    /// 테넌트 격리용 사용자 ID
    pub user_id: Option<String>,
    /// 확장 필드
    pub extra: BTreeMap<String, String>,
}

/// 인덱싱 단위 텍스트
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub content: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// 청크 생성 헬퍼
    pub fn new(
        content: impl Into<String>,
        source: impl Into<String>,
        chunk_index: usize,
        start_char: usize,
        end_char: usize,
    ) -> Self {
        Self {
            content: content.into(),
            metadata: ChunkMetadata {
                source: source.into(),
                chunk_index,
                start_char,
                end_char,
                ..Default::default()
            },
        }
    }

    /// 테넌트 지정
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.metadata.user_id = Some(user_id.into());
        self
    }

    /// 교차 인덱스 식별자
    pub fn id(&self) -> ChunkId {
        ChunkId::derive(
            &self.metadata.source,
            self.metadata.start_char,
            self.metadata.end_char,
        )
    }

    /// 본문 길이 (문자 수)
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    /// 테넌트 필터 일치 여부 (필터가 없으면 항상 true)
    pub fn matches_tenant(&self, tenant: Option<&str>) -> bool {
        match tenant {
            Some(user_id) => self.metadata.user_id.as_deref() == Some(user_id),
            None => true,
        }
    }
}

// ============================================================================
// Search Result
// ============================================================================

/// 점수를 만든 검색 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchStage {
    /// BM25 원점수 (0 이상, 상한 없음)
    Sparse,
    /// 코사인 유사도 (-1.0 ~ 1.0)
    Dense,
    /// RRF 합산 점수
    Rrf,
    /// 정규화 가중합 (0.0 ~ 1.0)
    Weighted,
    /// Cross-encoder 점수
    Reranked,
}

impl SearchStage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sparse => "BM25",
            Self::Dense => "VEC",
            Self::Rrf => "RRF",
            Self::Weighted => "WGT",
            Self::Reranked => "RNK",
        }
    }
}

/// 점수가 매겨진 청크
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
    pub stage: SearchStage,
}

impl ScoredChunk {
    pub fn new(chunk: Chunk, score: f32, stage: SearchStage) -> Self {
        Self { chunk, score, stage }
    }

    pub fn id(&self) -> ChunkId {
        self.chunk.id()
    }
}

/// 점수 내림차순 정렬 (안정 정렬, NaN은 동점 취급)
pub(crate) fn sort_by_score_desc(results: &mut [ScoredChunk]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

// ============================================================================
// Tests
// ============================================================================
