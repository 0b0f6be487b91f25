//! terminal-rag - 하이브리드 텍스트 검색 엔진
//!
//! 문서를 청크로 나누어 BM25 희소 인덱스와 밀집 벡터 인덱스에 함께 저장하고,
//! RRF 또는 정규화 가중합으로 두 검색 결과를 통합합니다.

pub mod cli;
pub mod collector;
pub mod config;
pub mod embedding;
pub mod error;
pub mod knowledge;

// Re-exports
pub use crate::config::AppConfig;
pub use embedding::{get_api_key, has_api_key, EmbeddingProvider, GeminiEmbedding};
pub use error::{RagError, Result};
pub use knowledge::{
    Chunk, ChunkConfig, ChunkId, Chunker, ChunkingEngine, ChunkingStrategy, FlatVectorStore,
    FusionType, HybridRetriever, HybridStats, IndexMetadata, IndexReport, IndexStore, Indexer,
    LanceVectorStore, RerankEngine, Reranker, ScoredChunk, SearchOptions, SearchReport,
    SearchStage, SparseIndex, StoreType, VectorStore,
};
