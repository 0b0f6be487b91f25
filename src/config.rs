//! 설정 모듈
//!
//! 우선순위: 기본값 → 설정 파일 → 환경 변수 (`RAG_<SECTION>__<KEY>`)
//!
//! ```text
//! RAG_RETRIEVAL__TOP_K=10
//! RAG_EMBEDDING__STORE_TYPE=lance
//! RAG_CHUNKING__STRATEGY=semantic
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::knowledge::{
    default_index_path, ChunkConfig, ChunkingStrategy, FusionType, SearchOptions, StoreType,
    DEFAULT_RRF_K,
};

/// 환경 변수 접두사
const ENV_PREFIX: &str = "RAG";
/// 설정 파일 경로 환경 변수
const CONFIG_PATH_ENV: &str = "RAG_CONFIG_PATH";
/// 기본 설정 파일 (확장자 자동 감지, 없어도 됨)
const DEFAULT_CONFIG_FILE: &str = "configs/default";

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub index_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub strategy: ChunkingStrategy,
    pub similarity_threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    pub provider: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub store_type: StoreType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub fusion: FusionType,
    pub alpha: f32,
    pub rrf_k: usize,
    #[serde(default)]
    pub score_threshold: Option<f32>,
    pub use_reranker: bool,
    pub reranker_url: String,
}

/// 로그 출력 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

// ============================================================================
// AppConfig
// ============================================================================

/// 전체 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub project: ProjectConfig,
    pub chunking: ChunkingSettings,
    pub embedding: EmbeddingSettings,
    pub retrieval: RetrievalSettings,
    pub logging: LoggingSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            project: ProjectConfig {
                index_path: default_index_path(),
            },
            chunking: ChunkingSettings {
                chunk_size: 1000,
                chunk_overlap: 150,
                strategy: ChunkingStrategy::Auto,
                similarity_threshold: 0.7,
            },
            embedding: EmbeddingSettings {
                provider: "gemini".to_string(),
                dimension: crate::embedding::DEFAULT_DIMENSION,
                batch_size: 100,
                store_type: StoreType::Flat,
            },
            retrieval: RetrievalSettings {
                top_k: 5,
                fusion: FusionType::Rrf,
                alpha: 0.5,
                rrf_k: DEFAULT_RRF_K,
                score_threshold: None,
                use_reranker: false,
                reranker_url: "http://localhost:8080".to_string(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                format: LogFormat::Text,
            },
        }
    }
}

impl AppConfig {
    /// 설정 로드 (.env 포함)
    ///
    /// `file`이 주어지면 필수, 아니면 `RAG_CONFIG_PATH` 또는 `configs/default.*`를 선택적으로 읽습니다.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let file = file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));
        Self::build(file.as_deref(), None)
    }

    /// 소스 조합 후 검증
    ///
    /// `env`가 `Some`이면 프로세스 환경 대신 해당 맵을 사용합니다.
    fn build(file: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default()).map_err(config_err)?;

        let file_source = match file {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let env_source = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(env);

        let config: Self = config::Config::builder()
            .add_source(defaults)
            .add_source(file_source)
            .add_source(env_source)
            .build()
            .map_err(config_err)?
            .try_deserialize()
            .map_err(config_err)?;

        config.validate()?;
        Ok(config)
    }

    /// 값 범위 검증
    pub fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        if !(100..=10_000).contains(&c.chunk_size) {
            return invalid(format!("chunking.chunk_size must be within 100..=10000, got {}", c.chunk_size));
        }
        if c.chunk_overlap >= c.chunk_size {
            return invalid(format!(
                "chunking.chunk_overlap ({}) must be smaller than chunk_size ({})",
                c.chunk_overlap, c.chunk_size
            ));
        }
        if !(0.0..=1.0).contains(&c.similarity_threshold) {
            return invalid(format!(
                "chunking.similarity_threshold must be within 0.0..=1.0, got {}",
                c.similarity_threshold
            ));
        }

        let e = &self.embedding;
        if e.provider != "gemini" {
            return invalid(format!("embedding.provider '{}' is not supported (gemini)", e.provider));
        }
        if e.dimension == 0 {
            return invalid("embedding.dimension must be positive".to_string());
        }
        if e.batch_size == 0 {
            return invalid("embedding.batch_size must be at least 1".to_string());
        }

        let r = &self.retrieval;
        if !(1..=100).contains(&r.top_k) {
            return invalid(format!("retrieval.top_k must be within 1..=100, got {}", r.top_k));
        }
        if !(0.0..=1.0).contains(&r.alpha) {
            return invalid(format!("retrieval.alpha must be within 0.0..=1.0, got {}", r.alpha));
        }
        if r.rrf_k == 0 {
            return invalid("retrieval.rrf_k must be at least 1".to_string());
        }
        if r.use_reranker && r.reranker_url.trim().is_empty() {
            return invalid("retrieval.reranker_url is required when use_reranker is set".to_string());
        }

        Ok(())
    }

    pub fn chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            chunk_size: self.chunking.chunk_size,
            chunk_overlap: self.chunking.chunk_overlap,
            similarity_threshold: self.chunking.similarity_threshold,
        }
    }

    /// 설정값으로 채운 기본 검색 옵션
    pub fn search_options(&self) -> SearchOptions {
        let r = &self.retrieval;
        SearchOptions {
            top_k: r.top_k,
            fusion: r.fusion,
            alpha: r.alpha,
            rrf_k: r.rrf_k,
            score_threshold: r.score_threshold,
            tenant: None,
            rerank: r.use_reranker,
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.project.index_path
    }

    /// LanceDB 경로 (`<index_path>.lance`, 인덱스 디렉토리 교체와 무관)
    pub fn lance_path(&self) -> PathBuf {
        let index = &self.project.index_path;
        let name = index
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "index".to_string());
        index.with_file_name(format!("{}.lance", name))
    }
}

fn config_err(e: config::ConfigError) -> RagError {
    RagError::Configuration(e.to_string())
}

fn invalid(message: String) -> Result<()> {
    Err(RagError::Configuration(message))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_config(), ChunkConfig::default());
        assert_eq!(config.search_options(), SearchOptions::default());
        assert!(config.index_path().ends_with(".terminal-rag/index"));
    }

    #[test]
    fn test_env_overrides() {
        let config = AppConfig::build(
            None,
            env(&[
                ("RAG_RETRIEVAL__TOP_K", "10"),
                ("RAG_RETRIEVAL__FUSION", "weighted"),
                ("RAG_EMBEDDING__STORE_TYPE", "lance"),
                ("RAG_CHUNKING__STRATEGY", "semantic"),
            ]),
        )
        .unwrap();

        assert_eq!(config.retrieval.top_k, 10);
        assert_eq!(config.retrieval.fusion, FusionType::Weighted);
        assert_eq!(config.embedding.store_type, StoreType::Lance);
        assert_eq!(config.chunking.strategy, ChunkingStrategy::Semantic);
    }

    #[test]
    fn test_file_then_env() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("rag.toml");
        std::fs::write(
            &path,
            "[chunking]\nchunk_size = 500\nchunk_overlap = 50\n\n[retrieval]\ntop_k = 7\n",
        )
        .unwrap();

        let config = AppConfig::build(Some(&path), env(&[("RAG_RETRIEVAL__TOP_K", "3")])).unwrap();
        assert_eq!(config.chunking.chunk_size, 500);
        assert_eq!(config.chunking.chunk_overlap, 50);
        assert_eq!(config.retrieval.top_k, 3);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let temp = TempDir::new().unwrap();
        let result = AppConfig::build(Some(&temp.path().join("nope.toml")), env(&[]));
        assert!(matches!(result, Err(RagError::Configuration(_))));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.chunking.chunk_overlap = config.chunking.chunk_size;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.retrieval.top_k = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.chunking.chunk_size = 50;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.embedding.batch_size = 0;
        assert!(config.validate().is_err());

        let result = AppConfig::build(None, env(&[("RAG_RETRIEVAL__ALPHA", "1.5")]));
        assert!(matches!(result, Err(RagError::Configuration(_))));
    }

    #[test]
    fn test_lance_path_is_sibling() {
        let mut config = AppConfig::default();
        config.project.index_path = PathBuf::from("/data/idx");
        assert_eq!(config.lance_path(), PathBuf::from("/data/idx.lance"));
    }
}
