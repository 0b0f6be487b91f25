//! Knowledge 모듈 - 하이브리드 검색 인덱스
//!
//! - Chunker: 고정 크기 / 마크다운 / 시맨틱 분할
//! - Sparse: BM25 키워드 검색 (한국어 형태 분석 포함)
//! - Dense: VectorStore (flat, LanceDB)
//! - Hybrid: RRF 또는 가중합으로 두 검색 결과 통합, 선택적 리랭킹
//! - Store: 원자적 저장 + 증분 인덱싱 장부

mod chunk;
mod chunker;
mod flat;
mod fusion;
mod hybrid;
mod indexer;
mod lance;
mod language;
mod rerank;
mod semantic;
mod sparse;
mod store;
mod tokenizer;
mod vector;

// Re-exports
pub use chunk::{Chunk, ChunkId, ChunkMetadata, ScoredChunk, SearchStage};
pub use chunker::{
    ChunkConfig, Chunker, ChunkingEngine, ChunkingStrategy, FixedSizeChunker, MarkdownChunker,
};
pub use flat::FlatVectorStore;
pub use fusion::{
    merge_multi_query, min_max_normalize, rrf_fuse, weighted_fuse, FusionType, SearchOptions,
    DEFAULT_RRF_K,
};
pub use hybrid::{HybridRetriever, HybridStats, SearchReport, DEFAULT_BATCH_SIZE};
pub use indexer::{IndexReport, Indexer};
pub use lance::LanceVectorStore;
pub use language::{
    detect_language, normalize_text, split_into_sentences, HangulSegmenter, Language, RegexSegmenter,
    Sentence, SentenceSegmenter,
};
pub use rerank::{HttpReranker, RerankEngine, Reranker};
pub use semantic::{FallbackReason, SemanticChunker, SemanticOutcome};
pub use sparse::SparseIndex;
pub use store::{
    compute_file_hash, default_index_path, get_data_dir, FileEntry, IndexMetadata, IndexStore,
};
pub use tokenizer::tokenize;
pub use vector::{cosine_similarity, l2_normalize, StoreType, VectorStore};
