//! CLI 모듈
//!
//! terminal-rag CLI 명령어 정의 및 구현

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::config::AppConfig;
use crate::embedding::{get_api_key, has_api_key, EmbeddingProvider, GeminiEmbedding};
use crate::error::RagError;
use crate::knowledge::{
    ChunkingEngine, ChunkingStrategy, FusionType, HybridRetriever, IndexMetadata, IndexStore,
    Indexer, ScoredChunk, SearchOptions, SparseIndex,
};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "terminal-rag")]
#[command(version, about = "하이브리드 검색 엔진 (BM25 + 벡터)", long_about = None)]
pub struct Cli {
    /// 설정 파일 경로
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// 디버그 로그 출력
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 파일 또는 폴더를 인덱싱 (.txt, .md, .markdown)
    Index {
        /// 인덱싱할 파일/폴더 경로
        path: PathBuf,

        /// 기존 인덱스를 버리고 전체 재인덱싱
        #[arg(long)]
        reset: bool,

        /// 청킹 전략 (auto, fixed, markdown, semantic)
        #[arg(short, long)]
        strategy: Option<ChunkingStrategy>,

        /// 청크에 기록할 사용자 ID
        #[arg(long)]
        tenant: Option<String>,
    },

    /// 인덱스 검색
    Search {
        /// 검색 쿼리
        query: String,

        /// 결과 개수
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// 융합 방식 (rrf, weighted)
        #[arg(short, long)]
        fusion: Option<FusionType>,

        /// 가중합의 밀집 비중 (0.0 ~ 1.0)
        #[arg(long)]
        alpha: Option<f32>,

        /// RRF k 상수
        #[arg(long)]
        rrf_k: Option<usize>,

        /// 사용자 ID 필터
        #[arg(long)]
        tenant: Option<String>,

        /// 리랭커 적용
        #[arg(long)]
        rerank: bool,

        /// 추가 쿼리 변형 (결과를 ChunkId별 최고 점수로 병합)
        #[arg(short = 'q', long = "query")]
        variants: Vec<String>,
    },

    /// 인덱스 상태 확인
    Status,

    /// 인덱스 삭제
    Clear,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    match cli.command {
        Commands::Index {
            path,
            reset,
            strategy,
            tenant,
        } => cmd_index(&config, &path, reset, strategy, tenant).await,
        Commands::Search {
            query,
            top_k,
            fusion,
            alpha,
            rrf_k,
            tenant,
            rerank,
            variants,
        } => {
            let mut options = config.search_options();
            if let Some(top_k) = top_k {
                options.top_k = top_k;
            }
            if let Some(fusion) = fusion {
                options.fusion = fusion;
            }
            if let Some(alpha) = alpha {
                options.alpha = alpha;
            }
            if let Some(rrf_k) = rrf_k {
                options.rrf_k = rrf_k;
            }
            options.tenant = tenant;
            options.rerank = options.rerank || rerank;

            cmd_search(&config, &query, &variants, &options).await
        }
        Commands::Status => cmd_status(&config),
        Commands::Clear => cmd_clear(&config),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// API 키 확인 후 임베더 생성
fn embedder(config: &AppConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let Some(api_key) = get_api_key() else {
        bail!(
            "API 키가 설정되지 않았습니다.\n\n\
             설정 방법:\n  \
             export GEMINI_API_KEY=your-api-key\n  \
             또는\n  \
             export GOOGLE_AI_API_KEY=your-api-key\n\n\
             API 키 발급: https://aistudio.google.com/app/apikey"
        );
    };
    let embedder = GeminiEmbedding::with_dimension(api_key, config.embedding.dimension)?;
    tracing::info!("Embedder: {} ({}d)", embedder.name(), embedder.dimension());
    Ok(Arc::new(embedder))
}

/// 인덱싱 명령어 (index)
async fn cmd_index(
    config: &AppConfig,
    path: &Path,
    reset: bool,
    strategy: Option<ChunkingStrategy>,
    tenant: Option<String>,
) -> Result<()> {
    let embedder = embedder(config)?;
    let mut retriever = HybridRetriever::from_config(config, embedder.clone())
        .await
        .context("HybridRetriever 초기화 실패")?;

    let index_path = config.index_path();
    if !reset {
        match retriever.load(index_path).await {
            Ok(()) => println!(
                "[*] 기존 인덱스 로드: {} 청크, {} 파일",
                retriever.total_chunks(),
                retriever.ledger().file_count()
            ),
            Err(e) if e.is_not_found() => println!("[*] 새 인덱스 생성: {:?}", index_path),
            Err(e @ RagError::IndexCorrupt { .. }) => {
                bail!("{}\n    --reset 옵션으로 다시 인덱싱하세요", e)
            }
            Err(e) => return Err(e).context("인덱스 로드 실패"),
        }
    }

    let strategy = strategy.unwrap_or(config.chunking.strategy);
    let engine = ChunkingEngine::new(config.chunk_config(), strategy).with_embedder(embedder);
    let mut indexer = Indexer::new(engine, index_path);
    if let Some(tenant) = tenant {
        indexer = indexer.with_user_id(tenant);
    }

    println!("[*] 인덱싱 중: {:?} (전략: {})", path, strategy);
    let report = indexer
        .run(&mut retriever, path, reset)
        .await
        .context("인덱싱 실패")?;

    if report.full_rebuild {
        println!("[*] 전체 재인덱싱 수행");
    }
    println!(
        "[OK] 완료: 파일 {} 개 중 인덱싱 {}, 건너뜀 {}, 실패 {}",
        report.files_seen, report.files_indexed, report.files_skipped, report.files_failed
    );
    println!(
        "     추가된 청크: {} (전체 {})",
        report.chunks_added,
        retriever.total_chunks()
    );
    Ok(())
}

/// 검색 명령어 (search)
async fn cmd_search(
    config: &AppConfig,
    query: &str,
    variants: &[String],
    options: &SearchOptions,
) -> Result<()> {
    let embedder = embedder(config)?;
    let mut retriever = HybridRetriever::from_config(config, embedder)
        .await
        .context("HybridRetriever 초기화 실패")?;

    match retriever.load(config.index_path()).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {
            bail!("인덱스가 없습니다. 먼저 `terminal-rag index <path>`를 실행하세요");
        }
        Err(e) => return Err(e).context("인덱스 로드 실패"),
    }

    println!("[*] 검색 중: \"{}\" ({})", query, options.fusion);

    let results = if variants.is_empty() {
        let report = retriever
            .search_with_report(query, options)
            .await
            .context("검색 실패")?;
        for stage in &report.unavailable {
            println!("[!] {} 검색 결과 없음, 다른 쪽 결과만 사용", stage);
        }
        if options.rerank && !report.reranked {
            println!("[!] 리랭킹이 적용되지 않았습니다");
        }
        report.results
    } else {
        let mut queries = vec![query.to_string()];
        queries.extend(variants.iter().cloned());
        retriever
            .search_multi(&queries, options)
            .await
            .context("검색 실패")?
    };

    if results.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", results.len());
    for (i, result) in results.iter().enumerate() {
        print_result(i + 1, result);
    }
    Ok(())
}

fn print_result(rank: usize, result: &ScoredChunk) {
    let meta = &result.chunk.metadata;
    println!(
        "{}. [{}] [점수: {:.4}] {} #{}",
        rank,
        result.stage.label(),
        result.score,
        meta.source,
        meta.chunk_index
    );
    if let Some(ref header) = meta.header_path {
        println!("   섹션: {}", header);
    }
    println!("   내용: {}", truncate_text(&result.chunk.content, 200));
    println!();
}

/// 상태 명령어 (status)
///
/// 임베딩 API 없이 디스크의 인덱스만 읽습니다.
fn cmd_status(config: &AppConfig) -> Result<()> {
    println!("[*] terminal-rag 상태\n");

    let index_path = config.index_path();
    println!("[*] 인덱스 경로: {:?}", index_path);
    println!(
        "    백엔드: {}, 차원: {}, 융합: {}",
        config.embedding.store_type, config.embedding.dimension, config.retrieval.fusion
    );

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    let store = IndexStore::new(index_path);
    if !store.exists() {
        println!("[!] 인덱스가 없습니다. `terminal-rag index <path>`로 생성하세요.");
        return Ok(());
    }

    match (SparseIndex::load(index_path), IndexMetadata::load(index_path)) {
        (Ok(sparse), Ok(ledger)) => {
            println!("[OK] 인덱싱된 파일: {} 개", ledger.file_count());
            println!("[OK] 청크: {} 개", sparse.len());
            let total: usize = sparse.chunks().iter().map(|c| c.content.len()).sum();
            println!("     총 콘텐츠: {}", format_bytes(total));
        }
        (Err(e), _) | (_, Err(e)) => {
            println!("[!] 인덱스 읽기 실패: {}", e);
        }
    }

    Ok(())
}

/// 삭제 명령어 (clear)
fn cmd_clear(config: &AppConfig) -> Result<()> {
    IndexStore::new(config.index_path())
        .remove()
        .context("인덱스 삭제 실패")?;

    let lance_path = config.lance_path();
    if lance_path.exists() {
        std::fs::remove_dir_all(&lance_path)
            .with_context(|| format!("LanceDB 삭제 실패: {:?}", lance_path))?;
    }

    println!("[OK] 인덱스가 삭제되었습니다: {:?}", config.index_path());
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_parse_search_flags() {
        let cli = Cli::parse_from([
            "terminal-rag", "search", "러스트 소유권", "-k", "3", "--fusion", "weighted",
            "--alpha", "0.7", "-q", "ownership", "-q", "borrow",
        ]);
        match cli.command {
            Commands::Search {
                query,
                top_k,
                fusion,
                alpha,
                variants,
                ..
            } => {
                assert_eq!(query, "러스트 소유권");
                assert_eq!(top_k, Some(3));
                assert_eq!(fusion, Some(FusionType::Weighted));
                assert_eq!(alpha, Some(0.7));
                assert_eq!(variants, vec!["ownership", "borrow"]);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn test_parse_index_flags() {
        let cli = Cli::parse_from(["terminal-rag", "index", "./docs", "--reset", "-s", "semantic", "-v"]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Index { path, reset, strategy, .. } => {
                assert_eq!(path, PathBuf::from("./docs"));
                assert!(reset);
                assert_eq!(strategy, Some(ChunkingStrategy::Semantic));
            }
            _ => panic!("expected index command"),
        }
    }

    #[test]
    fn test_status_without_index() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.project.index_path = temp.path().join("index");
        assert!(cmd_status(&config).is_ok());
        assert!(cmd_clear(&config).is_ok());
    }
}
