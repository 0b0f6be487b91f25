//! 하이브리드 검색 - BM25 + 밀집 벡터 융합
//!
//! 희소(BM25)와 밀집(VectorStore) 검색을 동시에 실행하고
//! RRF 또는 정규화 가중합으로 통합합니다. 선택적으로 리랭커를 적용합니다.
//!
//! ref: https://www.elastic.co/blog/hybrid-search-rrf

use std::path::Path;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

use super::chunk::{Chunk, ScoredChunk};
use super::flat::FlatVectorStore;
use super::fusion::{merge_multi_query, rrf_fuse, weighted_fuse, FusionType, SearchOptions};
use super::lance::LanceVectorStore;
use super::rerank::{HttpReranker, RerankEngine};
use super::sparse::SparseIndex;
use super::store::{IndexMetadata, IndexStore};
use super::vector::{StoreType, VectorStore};

/// 기본 임베딩 배치 크기
pub const DEFAULT_BATCH_SIZE: usize = 100;

// ============================================================================
// Types
// ============================================================================

/// 검색 결과와 실행 경로 보고
#[derive(Debug, Clone, Default)]
pub struct SearchReport {
    pub results: Vec<ScoredChunk>,
    /// 결과를 내지 못한 단계 ("sparse", "dense")
    pub unavailable: Vec<&'static str>,
    /// 리랭커 점수로 정렬되었는지
    pub reranked: bool,
}

/// 인덱스 통계
#[derive(Debug, Clone)]
pub struct HybridStats {
    pub total_chunks: usize,
    pub indexed_files: usize,
    pub backend: &'static str,
    pub dimension: usize,
    pub embedder: String,
    pub reranker: Option<String>,
}

// ============================================================================
// HybridRetriever
// ============================================================================

/// 하이브리드 검색기
///
/// 희소 인덱스, 밀집 인덱스, 인덱싱 장부를 한 단위로 소유합니다.
/// 변경은 `&mut self`, 검색은 `&self`입니다.
pub struct HybridRetriever {
    sparse: SparseIndex,
    dense: Box<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    reranker: Option<RerankEngine>,
    ledger: IndexMetadata,
    batch_size: usize,
}

impl HybridRetriever {
    /// 새 검색기 생성
    ///
    /// 임베딩 차원과 밀집 인덱스 차원이 다르면 설정 에러입니다.
    pub fn new(dense: Box<dyn VectorStore>, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        if dense.dimension() != embedder.dimension() {
            return Err(RagError::Configuration(format!(
                "embedder '{}' produces {}-dim vectors but the {} index expects {}",
                embedder.name(),
                embedder.dimension(),
                dense.name(),
                dense.dimension()
            )));
        }

        Ok(Self {
            sparse: SparseIndex::new(),
            dense,
            embedder,
            reranker: None,
            ledger: IndexMetadata::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    /// 설정으로부터 구성 (백엔드, 리랭커, 배치 크기)
    pub async fn from_config(config: &AppConfig, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let dimension = config.embedding.dimension;

        let dense: Box<dyn VectorStore> = match config.embedding.store_type {
            StoreType::Flat => Box::new(FlatVectorStore::new(dimension)),
            StoreType::Lance => {
                Box::new(LanceVectorStore::open(&config.lance_path(), dimension).await?)
            }
        };

        let mut retriever = Self::new(dense, embedder)?.with_batch_size(config.embedding.batch_size);

        if config.retrieval.use_reranker {
            let reranker = HttpReranker::new(&config.retrieval.reranker_url)
                .map_err(|e| RagError::Configuration(e.to_string()))?;
            retriever = retriever.with_reranker(RerankEngine::new(Arc::new(reranker)));
        }

        tracing::debug!(
            "HybridRetriever ready: backend={}, dim={}, reranker={}",
            retriever.dense.name(),
            dimension,
            retriever.reranker.is_some()
        );
        Ok(retriever)
    }

    pub fn with_reranker(mut self, reranker: RerankEngine) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn sparse(&self) -> &SparseIndex {
        &self.sparse
    }

    pub fn ledger(&self) -> &IndexMetadata {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut IndexMetadata {
        &mut self.ledger
    }

    /// 인덱싱된 청크 수
    pub fn total_chunks(&self) -> usize {
        self.sparse.len()
    }

    pub fn stats(&self) -> HybridStats {
        HybridStats {
            total_chunks: self.sparse.len(),
            indexed_files: self.ledger.file_count(),
            backend: self.dense.name(),
            dimension: self.dense.dimension(),
            embedder: self.embedder.name().to_string(),
            reranker: self.reranker.as_ref().map(|r| r.name().to_string()),
        }
    }

    // ========================================================================
    // Indexing
    // ========================================================================

    /// 청크 인덱싱
    ///
    /// `embeddings`가 없으면 `batch_size` 단위로 임베딩합니다.
    /// 밀집 인덱스가 배치를 거부하면 희소 인덱스도 변경되지 않습니다.
    pub async fn index(&mut self, chunks: Vec<Chunk>, embeddings: Option<Vec<Vec<f32>>>) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let embeddings = match embeddings {
            Some(embeddings) => embeddings,
            None => self.embed_chunks(&chunks).await?,
        };

        let added = self.dense.add(&chunks, &embeddings).await?;
        self.sparse.add(&chunks);

        tracing::info!("Indexed {} chunks (total {})", added, self.sparse.len());
        Ok(added)
    }

    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(chunks.len());
        let batches = chunks.len().div_ceil(self.batch_size);

        for (i, batch) in chunks.chunks(self.batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let vectors = self
                .embedder
                .embed_batch(&texts)
                .await
                .map_err(|e| RagError::Embedding(e.to_string()))?;

            if vectors.len() != texts.len() {
                return Err(RagError::Embedding(format!(
                    "{} embeddings for {} texts",
                    vectors.len(),
                    texts.len()
                )));
            }

            tracing::debug!("Embedded batch {}/{} ({} texts)", i + 1, batches, texts.len());
            embeddings.extend(vectors);
        }

        Ok(embeddings)
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// 하이브리드 검색
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<Vec<ScoredChunk>> {
        Ok(self.search_with_report(query, options).await?.results)
    }

    /// 하이브리드 검색 (실행 경로 포함)
    pub async fn search_with_report(&self, query: &str, options: &SearchOptions) -> Result<SearchReport> {
        options.validate()?;

        if query.trim().is_empty() {
            return Ok(SearchReport::default());
        }
        // 양쪽 모두 비었으면 질의 임베딩도 생략
        if self.sparse.is_empty() && matches!(self.dense.total_chunks().await, Ok(0)) {
            return Ok(SearchReport::default());
        }

        // 리랭킹 시 후보를 넉넉히 받아 둔다
        let rerank = options.rerank && self.reranker.is_some();
        if options.rerank && self.reranker.is_none() {
            tracing::warn!("Rerank requested but no reranker configured");
        }
        let pool = if rerank { options.top_k * 2 } else { options.top_k };

        let mut report = match options.fusion {
            FusionType::Rrf => self.search_rrf(query, options, pool).await,
            FusionType::Weighted => self.search_weighted(query, options, pool).await,
        };

        if rerank {
            self.apply_rerank(query, options.top_k, &mut report).await;
        }
        report.results.truncate(options.top_k);

        tracing::debug!(
            "Search '{}' ({}) → {} results",
            query,
            options.fusion,
            report.results.len()
        );
        Ok(report)
    }

    /// RRF: 양쪽 상위 2k를 순위로 합산
    async fn search_rrf(&self, query: &str, options: &SearchOptions, pool: usize) -> SearchReport {
        let tenant = options.tenant.as_deref();
        let depth = options.top_k * 2;

        let (sparse, dense) = tokio::join!(
            async { self.sparse.search(query, depth, tenant) },
            self.dense_search(query, depth, tenant)
        );

        if sparse.is_empty() || dense.is_empty() {
            return degrade(sparse, dense, pool);
        }

        SearchReport {
            results: rrf_fuse(&sparse, &dense, options.rrf_k, pool),
            ..Default::default()
        }
    }

    /// 가중합: 밀집 상위 3k 후보 집합 안에서 정규화
    async fn search_weighted(&self, query: &str, options: &SearchOptions, pool: usize) -> SearchReport {
        let tenant = options.tenant.as_deref();

        let (scores, dense) = tokio::join!(
            async { self.sparse.full_scores(query) },
            self.dense_search(query, options.top_k * 3, tenant)
        );

        if dense.is_empty() {
            return degrade(self.sparse.search(query, pool, tenant), dense, pool);
        }

        // 후보의 희소 점수가 모두 0이어도 가중합은 그대로 적용 (정규화된 희소 점수 = 0)
        let candidate_scores: Vec<f32> = dense
            .iter()
            .map(|r| self.sparse.score_of(r.id(), &scores))
            .collect();

        let mut unavailable = Vec::new();
        if self.sparse.is_empty() {
            tracing::warn!("{}", RagError::FusionSourceUnavailable("sparse"));
            unavailable.push("sparse");
        }

        SearchReport {
            results: weighted_fuse(
                &dense,
                &candidate_scores,
                options.alpha,
                options.score_threshold,
                pool,
            ),
            unavailable,
            reranked: false,
        }
    }

    /// 질의 임베딩 → 밀집 검색. 실패는 빈 결과로 강등
    async fn dense_search(&self, query: &str, top_k: usize, tenant: Option<&str>) -> Vec<ScoredChunk> {
        let result = async {
            let embedding = self
                .embedder
                .embed_query(query)
                .await
                .map_err(|e| RagError::Embedding(e.to_string()))?;
            self.dense.search(&embedding, top_k, tenant).await
        }
        .await;

        match result {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!("Dense search failed: {}", e);
                vec![]
            }
        }
    }

    async fn apply_rerank(&self, query: &str, top_k: usize, report: &mut SearchReport) {
        let Some(engine) = &self.reranker else {
            return;
        };

        match engine.rerank(query, report.results.clone(), top_k).await {
            Ok(results) => {
                report.results = results;
                report.reranked = true;
            }
            Err(e) => tracing::warn!("{}; keeping fused order", e),
        }
    }

    /// 다중 쿼리 검색 (ChunkId별 최고 점수)
    pub async fn search_multi(&self, queries: &[String], options: &SearchOptions) -> Result<Vec<ScoredChunk>> {
        let mut result_sets = Vec::with_capacity(queries.len());
        for query in queries {
            result_sets.push(self.search(query, options).await?);
        }
        Ok(merge_multi_query(result_sets, options.top_k))
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// 희소/밀집/장부를 `path`에 저장
    pub async fn save(&self, path: &Path) -> Result<()> {
        IndexStore::new(path)
            .save(&self.sparse, self.dense.as_ref(), &self.ledger)
            .await
    }

    /// `path`에서 로드 (기존 내용 대체)
    pub async fn load(&mut self, path: &Path) -> Result<()> {
        let (sparse, ledger) = IndexStore::new(path).load(self.dense.as_mut()).await?;
        self.sparse = sparse;
        self.ledger = ledger;
        Ok(())
    }

    /// 메모리 인덱스와 장부 비우기
    pub async fn clear(&mut self) -> Result<()> {
        self.dense.clear().await?;
        self.sparse.clear();
        self.ledger.clear();
        tracing::info!("Index cleared");
        Ok(())
    }
}

/// 한쪽 단계가 비었을 때 다른 쪽 결과로 강등
///
/// 호출자는 `sparse`와 `dense` 중 하나 이상이 비었을 때만 호출합니다.
fn degrade(mut sparse: Vec<ScoredChunk>, mut dense: Vec<ScoredChunk>, top_k: usize) -> SearchReport {
    if dense.is_empty() && !sparse.is_empty() {
        tracing::warn!("{}", RagError::FusionSourceUnavailable("dense"));
        sparse.truncate(top_k);
        return SearchReport {
            results: sparse,
            unavailable: vec!["dense"],
            reranked: false,
        };
    }

    if sparse.is_empty() && !dense.is_empty() {
        tracing::warn!("{}", RagError::FusionSourceUnavailable("sparse"));
        dense.truncate(top_k);
        return SearchReport {
            results: dense,
            unavailable: vec!["sparse"],
            reranked: false,
        };
    }

    SearchReport {
        results: vec![],
        unavailable: vec!["sparse", "dense"],
        reranked: false,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::chunk::SearchStage;
    use crate::knowledge::rerank::Reranker;
    use crate::knowledge::vector::l2_normalize;
    use async_trait::async_trait;
    use tempfile::TempDir;

    const VOCAB: [&str; 4] = ["rust", "python", "cooking", "garden"];

    /// 어휘 단어 등장 여부로 만든 4차원 벡터
    struct VocabEmbedder;

    #[async_trait]
    impl EmbeddingProvider for VocabEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let lower = text.to_lowercase();
            let mut v: Vec<f32> = VOCAB
                .iter()
                .map(|w| if lower.contains(w) { 1.0 } else { 0.0 })
                .collect();
            if v.iter().all(|x| *x == 0.0) {
                v[0] = 0.01;
                v[3] = 0.01;
            }
            l2_normalize(&mut v);
            Ok(v)
        }

        fn dimension(&self) -> usize {
            4
        }

        fn name(&self) -> &str {
            "vocab"
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FailingEmbedder {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            anyhow::bail!("quota exceeded")
        }

        fn dimension(&self) -> usize {
            4
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    struct LengthReranker;

    #[async_trait]
    impl Reranker for LengthReranker {
        async fn score(&self, _query: &str, text: &str) -> anyhow::Result<f32> {
            Ok(text.len() as f32)
        }

        fn name(&self) -> &str {
            "length"
        }
    }

    fn corpus() -> Vec<Chunk> {
        [
            "rust ownership and borrowing",
            "python scripting for data",
            "cooking pasta at home",
            "garden tomatoes in summer",
            "rust async runtime with tokio",
        ]
        .iter()
        .enumerate()
        .map(|(i, t)| Chunk::new(*t, "/docs/notes.txt", i, i * 100, i * 100 + t.chars().count()))
        .collect()
    }

    async fn retriever() -> HybridRetriever {
        let mut r = HybridRetriever::new(Box::new(FlatVectorStore::new(4)), Arc::new(VocabEmbedder)).unwrap();
        r.index(corpus(), None).await.unwrap();
        r
    }

    #[test]
    fn test_dimension_mismatch_is_configuration_error() {
        let result = HybridRetriever::new(Box::new(FlatVectorStore::new(8)), Arc::new(VocabEmbedder));
        assert!(matches!(result, Err(RagError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_index_empty_is_noop() {
        let mut r = HybridRetriever::new(Box::new(FlatVectorStore::new(4)), Arc::new(VocabEmbedder)).unwrap();
        assert_eq!(r.index(vec![], None).await.unwrap(), 0);
        assert_eq!(r.total_chunks(), 0);
    }

    #[tokio::test]
    async fn test_index_rejected_batch_leaves_sparse_untouched() {
        let mut r = HybridRetriever::new(Box::new(FlatVectorStore::new(4)), Arc::new(VocabEmbedder)).unwrap();
        let bad = vec![vec![1.0, 0.0]; 5];
        let err = r.index(corpus(), Some(bad)).await.unwrap_err();

        assert!(matches!(err, RagError::DimensionMismatch { .. }));
        assert_eq!(r.total_chunks(), 0);
    }

    #[tokio::test]
    async fn test_index_embedding_failure() {
        let mut r = HybridRetriever::new(Box::new(FlatVectorStore::new(4)), Arc::new(FailingEmbedder)).unwrap();
        let err = r.index(corpus(), None).await.unwrap_err();
        assert!(matches!(err, RagError::Embedding(_)));
        assert_eq!(r.total_chunks(), 0);
    }

    #[tokio::test]
    async fn test_rrf_search() {
        let r = retriever().await;
        let results = r.search("rust tokio", &SearchOptions::new(3)).await.unwrap();

        assert!(!results.is_empty() && results.len() <= 3);
        assert_eq!(results[0].chunk.content, "rust async runtime with tokio");
        assert_eq!(results[0].stage, SearchStage::Rrf);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_weighted_search() {
        let r = retriever().await;
        let options = SearchOptions::new(2).weighted(0.5);
        let results = r.search("rust tokio", &options).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.content, "rust async runtime with tokio");
        assert_eq!(results[0].stage, SearchStage::Weighted);
        assert!(results.iter().all(|r| (0.0..=1.0).contains(&r.score)));
    }

    #[tokio::test]
    async fn test_empty_query_and_empty_index() {
        let r = retriever().await;
        assert!(r.search("   ", &SearchOptions::default()).await.unwrap().is_empty());

        let empty = HybridRetriever::new(Box::new(FlatVectorStore::new(4)), Arc::new(VocabEmbedder)).unwrap();
        assert!(empty.search("rust", &SearchOptions::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_options() {
        let r = retriever().await;
        let err = r.search("rust", &SearchOptions::new(0)).await.unwrap_err();
        assert!(matches!(err, RagError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_sparse_miss_degrades_to_dense() {
        let r = retriever().await;
        // BM25에 없는 단어라 희소 결과가 비어 있음
        let report = r
            .search_with_report("unknownword", &SearchOptions::new(2))
            .await
            .unwrap();

        assert_eq!(report.unavailable, vec!["sparse"]);
        assert!(report.results.iter().all(|r| r.stage == SearchStage::Dense));
    }

    #[tokio::test]
    async fn test_weighted_all_zero_sparse_still_weighted() {
        let r = retriever().await;
        let mut options = SearchOptions::new(5).weighted(0.5);
        options.score_threshold = Some(0.4);

        // 희소 점수가 전부 0 → 최종 점수 = α·norm_dense, 임계값 적용
        let report = r.search_with_report("unknownword", &options).await.unwrap();

        assert!(report.unavailable.is_empty());
        assert_eq!(report.results.len(), 3);
        for result in &report.results {
            assert_eq!(result.stage, SearchStage::Weighted);
            assert!((result.score - 0.5).abs() < 1e-6);
        }
        assert!(report.results.iter().all(|r| !r.chunk.content.contains("python")));
    }

    /// 밀집 인덱스만 채워진 검색기
    async fn dense_only() -> HybridRetriever {
        let chunks = corpus();
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = VocabEmbedder.embed_batch(&texts).await.unwrap();

        let mut store = FlatVectorStore::new(4);
        store.add(&chunks, &vectors).await.unwrap();
        HybridRetriever::new(Box::new(store), Arc::new(VocabEmbedder)).unwrap()
    }

    #[tokio::test]
    async fn test_empty_sparse_index_degrades_to_dense() {
        let r = dense_only().await;
        assert_eq!(r.total_chunks(), 0);

        let report = r.search_with_report("rust", &SearchOptions::new(2)).await.unwrap();
        assert_eq!(report.unavailable, vec!["sparse"]);
        assert_eq!(report.results.len(), 2);
        assert!(report.results.iter().all(|r| r.stage == SearchStage::Dense));
        assert!(report.results[0].chunk.content.contains("rust"));

        let weighted = r
            .search_with_report("rust", &SearchOptions::new(2).weighted(0.5))
            .await
            .unwrap();
        assert_eq!(weighted.unavailable, vec!["sparse"]);
        assert!(weighted.results.iter().all(|r| r.stage == SearchStage::Weighted));
    }

    #[tokio::test]
    async fn test_tenant_filter() {
        let mut r = HybridRetriever::new(Box::new(FlatVectorStore::new(4)), Arc::new(VocabEmbedder)).unwrap();
        let chunks = vec![
            Chunk::new("rust for alice", "/a.txt", 0, 0, 14).with_user_id("alice"),
            Chunk::new("rust for bob", "/b.txt", 0, 0, 12).with_user_id("bob"),
        ];
        r.index(chunks, None).await.unwrap();

        let options = SearchOptions::new(5).with_tenant("bob");
        let results = r.search("rust", &options).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.metadata.user_id.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_rerank_applied() {
        let r = retriever()
            .await
            .with_reranker(RerankEngine::new(Arc::new(LengthReranker)));
        let options = SearchOptions::new(2).with_rerank(true);
        let report = r.search_with_report("rust", &options).await.unwrap();

        assert!(report.reranked);
        assert_eq!(report.results[0].stage, SearchStage::Reranked);
        assert_eq!(report.results[0].chunk.content, "rust async runtime with tokio");
    }

    #[tokio::test]
    async fn test_search_multi_keeps_max_score() {
        let r = retriever().await;
        let queries = vec!["rust".to_string(), "garden".to_string()];
        let results = r.search_multi(&queries, &SearchOptions::new(10)).await.unwrap();

        let mut ids: Vec<_> = results.iter().map(|r| r.id()).collect();
        ids.dedup();
        assert_eq!(ids.len(), results.len());
        assert!(results.iter().any(|r| r.chunk.content.contains("garden")));
    }

    #[tokio::test]
    async fn test_save_load_and_clear() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("index");
        let mut r = retriever().await;
        r.ledger_mut().mark_indexed("/docs/notes.txt", "h", 5);
        r.save(&path).await.unwrap();

        let mut loaded = HybridRetriever::new(Box::new(FlatVectorStore::new(4)), Arc::new(VocabEmbedder)).unwrap();
        loaded.load(&path).await.unwrap();
        assert_eq!(loaded.total_chunks(), 5);
        assert!(loaded.ledger().is_indexed("/docs/notes.txt", "h"));

        let before = r.search("rust", &SearchOptions::new(3)).await.unwrap();
        let after = loaded.search("rust", &SearchOptions::new(3)).await.unwrap();
        assert_eq!(before, after);

        loaded.clear().await.unwrap();
        assert_eq!(loaded.total_chunks(), 0);
        assert_eq!(loaded.ledger().file_count(), 0);
    }
}
