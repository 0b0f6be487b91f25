//! 에러 타입
//!
//! 인덱스 계층에서 호출자가 구분해야 하는 실패 조건을 정의합니다.
//! CLI 계층은 anyhow로 감싸서 사용합니다.

use std::path::PathBuf;

use thiserror::Error;

/// 검색 엔진 에러
#[derive(Error, Debug)]
pub enum RagError {
    /// 잘못된 설정값 (시작 시 치명적)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 인덱스 경로가 없음 - 먼저 index를 실행해야 함
    #[error("Index not found at {0:?}")]
    IndexNotFound(PathBuf),

    /// 인덱스 파일은 있으나 읽을 수 없음
    #[error("Index corrupt at {path:?}: {reason}")]
    IndexCorrupt { path: PathBuf, reason: String },

    /// 임베딩 차원 불일치
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Empty input: {0}")]
    EmptyInput(&'static str),

    /// 검색 단계 하나가 결과를 내지 못함 (치명적이지 않음)
    #[error("Fusion source unavailable: {0}")]
    FusionSourceUnavailable(&'static str),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Rerank error: {0}")]
    Rerank(String),

    #[error("Vector store error: {0}")]
    Vector(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl RagError {
    /// 손상 에러 생성 헬퍼
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::IndexCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// 호출자가 "index 먼저 실행" 안내로 복구 가능한 에러인지
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::IndexNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
