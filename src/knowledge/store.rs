//! Index Store - 희소/밀집 인덱스와 인덱싱 장부를 한 단위로 저장
//!
//! 저장 위치: ~/.terminal-rag/index/
//!
//! ```text
//! {root}/dense.index      밀집 벡터 (flat 백엔드)
//! {root}/chunks.bin       벡터 순서의 청크 목록
//! {root}/meta.json        {"dimension": ...}
//! {root}/sparse.bin       BM25 통계 + 청크 목록
//! {root}/index_meta.json  파일별 해시/청크 수 장부
//! ```
//!
//! `save()`는 형제 디렉토리에 모두 쓴 뒤 rename으로 교체합니다.
//! 중간에 중단되어도 읽을 수 있는 부분 상태는 남지 않습니다.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::sparse::SparseIndex;
use super::vector::VectorStore;
use crate::error::{RagError, Result};

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.terminal-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::home_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".terminal-rag")
}

/// 기본 인덱스 경로 (~/.terminal-rag/index/)
pub fn default_index_path() -> PathBuf {
    get_data_dir().join("index")
}

// ============================================================================
// IndexMetadata (증분 인덱싱 장부)
// ============================================================================

pub const LEDGER_FILE: &str = "index_meta.json";
pub const LEDGER_VERSION: &str = "1.0";

/// 파일 하나의 인덱싱 기록
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// 파일 바이트의 sha256 (hex)
    pub hash: String,
    pub chunks_count: usize,
    #[serde(default)]
    pub indexed_at: Option<DateTime<Utc>>,
}

/// 증분 인덱싱 장부
///
/// 절대 경로 → `{hash, chunks_count}`. 해시가 같으면 재청킹/재임베딩을 건너뜁니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub indexed_files: BTreeMap<String, FileEntry>,
    pub version: String,
}

impl Default for IndexMetadata {
    fn default() -> Self {
        Self {
            indexed_files: BTreeMap::new(),
            version: LEDGER_VERSION.to_string(),
        }
    }
}

impl IndexMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// `dir/index_meta.json` 로드
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(LEDGER_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RagError::IndexNotFound(path))
            }
            Err(e) => return Err(RagError::corrupt(&path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| RagError::corrupt(&path, e))
    }

    /// `dir/index_meta.json` 저장
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(dir.join(LEDGER_FILE), json)?;
        Ok(())
    }

    /// 같은 해시로 이미 인덱싱되었는지
    pub fn is_indexed(&self, path: &str, hash: &str) -> bool {
        self.indexed_files
            .get(path)
            .is_some_and(|entry| entry.hash == hash)
    }

    /// 장부에 있으나 해시가 달라진 파일인지
    pub fn is_changed(&self, path: &str, hash: &str) -> bool {
        self.indexed_files
            .get(path)
            .is_some_and(|entry| entry.hash != hash)
    }

    pub fn mark_indexed(&mut self, path: impl Into<String>, hash: impl Into<String>, chunks_count: usize) {
        self.indexed_files.insert(
            path.into(),
            FileEntry {
                hash: hash.into(),
                chunks_count,
                indexed_at: Some(Utc::now()),
            },
        );
    }

    pub fn clear(&mut self) {
        self.indexed_files.clear();
    }

    pub fn file_count(&self) -> usize {
        self.indexed_files.len()
    }

    /// 장부에 기록된 소스 경로
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.indexed_files.keys().map(String::as_str)
    }

    /// 장부 기준 총 청크 수
    pub fn total_chunks(&self) -> usize {
        self.indexed_files.values().map(|e| e.chunks_count).sum()
    }
}

/// 바이트의 sha256 (hex)
pub fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 파일 내용의 sha256 (hex)
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hash_bytes(&bytes))
}

// ============================================================================
// IndexStore
// ============================================================================

/// 인덱스 디렉토리 저장/로드
#[derive(Debug, Clone)]
pub struct IndexStore {
    root: PathBuf,
}

impl IndexStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir() || self.backup_path().is_dir()
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "index".to_string());
        self.root.with_file_name(format!("{}.{}", name, suffix))
    }

    fn staging_path(&self) -> PathBuf {
        self.sibling("staging")
    }

    fn backup_path(&self) -> PathBuf {
        self.sibling("bak")
    }

    /// 전체 저장 (all-or-nothing)
    ///
    /// 1. staging 디렉토리에 모든 산출물 기록
    /// 2. 기존 root → .bak
    /// 3. staging → root
    /// 4. .bak 삭제
    pub async fn save(
        &self,
        sparse: &SparseIndex,
        dense: &dyn VectorStore,
        ledger: &IndexMetadata,
    ) -> Result<()> {
        let staging = self.staging_path();
        let backup = self.backup_path();

        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;

        sparse.save(&staging)?;
        dense.save(&staging).await?;
        ledger.save(&staging)?;

        if self.root.exists() {
            if backup.exists() {
                std::fs::remove_dir_all(&backup)?;
            }
            std::fs::rename(&self.root, &backup)?;
        }
        std::fs::rename(&staging, &self.root)?;

        if backup.exists() {
            std::fs::remove_dir_all(&backup)?;
        }

        tracing::info!(
            "Index saved to {:?} ({} chunks, {} files)",
            self.root,
            sparse.len(),
            ledger.file_count()
        );
        Ok(())
    }

    /// 교체 도중 중단되어 root 없이 .bak만 남은 경우 복구
    fn recover(&self) -> Result<()> {
        let backup = self.backup_path();
        if !self.root.exists() && backup.is_dir() {
            tracing::warn!("Recovering index from interrupted save: {:?}", backup);
            std::fs::rename(&backup, &self.root)?;
        }
        Ok(())
    }

    /// 전체 로드
    ///
    /// root가 없으면 `IndexNotFound`, 산출물이 없거나 읽을 수 없으면 `IndexCorrupt`.
    pub async fn load(&self, dense: &mut dyn VectorStore) -> Result<(SparseIndex, IndexMetadata)> {
        self.recover()?;

        if !self.root.is_dir() {
            return Err(RagError::IndexNotFound(self.root.clone()));
        }

        let sparse = SparseIndex::load(&self.root).map_err(|e| self.missing_is_corrupt(e))?;
        dense.load(&self.root).await?;
        let ledger = IndexMetadata::load(&self.root).map_err(|e| self.missing_is_corrupt(e))?;

        let dense_count = dense.total_chunks().await?;
        if dense_count != sparse.len() {
            return Err(RagError::corrupt(
                &self.root,
                format!(
                    "sparse index has {} chunks but dense index has {}",
                    sparse.len(),
                    dense_count
                ),
            ));
        }

        tracing::info!("Index loaded from {:?} ({} chunks)", self.root, sparse.len());
        Ok((sparse, ledger))
    }

    /// root는 있는데 산출물이 없으면 손상
    fn missing_is_corrupt(&self, e: RagError) -> RagError {
        match e {
            RagError::IndexNotFound(path) => RagError::corrupt(path, "artifact missing"),
            other => other,
        }
    }

    /// 디스크의 인덱스 삭제 (root, staging, .bak)
    pub fn remove(&self) -> Result<()> {
        for dir in [self.root.clone(), self.staging_path(), self.backup_path()] {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
        }
        tracing::info!("Index removed: {:?}", self.root);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
