//! Indexer - 파일 수집부터 저장까지의 인덱싱 파이프라인
//!
//! 파일 → sha256 → (장부와 같으면 건너뜀) → 정규화 → 청킹 → 임베딩 → 인덱스 → 장부 → 저장
//!
//! 청크는 제자리 수정하지 않으므로, 이미 인덱싱된 파일의 해시가 바뀌면
//! 전체 재인덱싱으로 전환합니다. 이때 다른 경로에서 인덱싱했던 파일도 장부에서
//! 다시 수집해 함께 재구성합니다. `reset`은 주어진 경로만으로 새로 만듭니다.
//!
//! 실행 도중 실패하면 저장하지 않으므로 디스크의 이전 인덱스는 그대로입니다.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::chunker::ChunkingEngine;
use super::hybrid::HybridRetriever;
use super::store::compute_file_hash;
use crate::collector::{CollectedFile, Document, FileCollector};

/// 인덱싱 결과 요약
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub files_seen: usize,
    pub files_indexed: usize,
    /// 해시가 같아 건너뛴 파일
    pub files_skipped: usize,
    /// 읽기 실패 (UTF-8 아님 등)
    pub files_failed: usize,
    pub chunks_added: usize,
    pub full_rebuild: bool,
}

/// 인덱싱 파이프라인
pub struct Indexer {
    engine: ChunkingEngine,
    collector: FileCollector,
    index_path: PathBuf,
    user_id: Option<String>,
}

impl Indexer {
    pub fn new(engine: ChunkingEngine, index_path: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            collector: FileCollector::with_defaults(),
            index_path: index_path.into(),
            user_id: None,
        }
    }

    pub fn with_collector(mut self, collector: FileCollector) -> Self {
        self.collector = collector;
        self
    }

    /// 모든 청크에 `user_id` 지정
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// `path`(파일 또는 폴더)를 인덱싱하고 한 번 저장
    ///
    /// `reset`이면 장부와 무관하게 전체 재인덱싱합니다.
    pub async fn run(&self, retriever: &mut HybridRetriever, path: &Path, reset: bool) -> Result<IndexReport> {
        let files = self
            .collector
            .collect(path)
            .with_context(|| format!("Failed to collect files from {:?}", path))?;

        let mut report = IndexReport {
            files_seen: files.len(),
            ..Default::default()
        };

        let mut hashed: Vec<(CollectedFile, String)> = Vec::with_capacity(files.len());
        for file in files {
            match compute_file_hash(&file.path) {
                Ok(hash) => hashed.push((file, hash)),
                Err(e) => {
                    tracing::warn!("Failed to hash {:?}: {}", file.path, e);
                    report.files_failed += 1;
                }
            }
        }

        let changed = hashed
            .iter()
            .filter(|(file, hash)| retriever.ledger().is_changed(&file.source(), hash))
            .count();

        if changed > 0 && !reset {
            tracing::info!("{} file(s) changed since last run, rebuilding index", changed);
            self.recollect_ledger(retriever, &mut hashed, &mut report);
        }

        report.full_rebuild = reset || changed > 0;
        if report.full_rebuild {
            retriever.clear().await.context("Failed to clear index")?;
        }

        for (file, hash) in &hashed {
            let source = file.source();
            if !report.full_rebuild && retriever.ledger().is_indexed(&source, hash) {
                tracing::debug!("Unchanged, skipping: {}", source);
                report.files_skipped += 1;
                continue;
            }

            let doc = match Document::load(file) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!("{:#}", e);
                    report.files_failed += 1;
                    continue;
                }
            };

            let mut chunks = self.engine.chunk_document(&doc).await;
            if let Some(user_id) = &self.user_id {
                chunks = chunks.into_iter().map(|c| c.with_user_id(user_id.clone())).collect();
            }

            let added = retriever
                .index(chunks, None)
                .await
                .with_context(|| format!("Failed to index {}", source))?;

            retriever.ledger_mut().mark_indexed(source, hash.clone(), added);
            report.files_indexed += 1;
            report.chunks_added += added;
        }

        if report.full_rebuild || report.files_indexed > 0 {
            retriever
                .save(&self.index_path)
                .await
                .with_context(|| format!("Failed to save index to {:?}", self.index_path))?;
        }

        tracing::info!(
            "Indexing done: {} seen, {} indexed, {} skipped, {} failed, {} chunks",
            report.files_seen,
            report.files_indexed,
            report.files_skipped,
            report.files_failed,
            report.chunks_added
        );
        Ok(report)
    }

    /// 이번 경로 밖에서 인덱싱된 장부 파일을 재구성 대상에 추가
    ///
    /// 더 이상 읽을 수 없는 파일은 경고 후 인덱스에서 빠집니다.
    fn recollect_ledger(
        &self,
        retriever: &HybridRetriever,
        hashed: &mut Vec<(CollectedFile, String)>,
        report: &mut IndexReport,
    ) {
        let collected: HashSet<String> = hashed.iter().map(|(file, _)| file.source()).collect();
        let others: Vec<String> = retriever
            .ledger()
            .sources()
            .filter(|source| !collected.contains(*source))
            .map(str::to_string)
            .collect();

        for source in others {
            let file = match self.collector.collect_file(Path::new(&source)) {
                Ok(Some(file)) => file,
                Ok(None) => {
                    tracing::warn!("No longer indexable, dropping: {}", source);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Dropping {} from index: {:#}", source, e);
                    continue;
                }
            };

            report.files_seen += 1;
            match compute_file_hash(&file.path) {
                Ok(hash) => hashed.push((file, hash)),
                Err(e) => {
                    tracing::warn!("Failed to hash {:?}: {}", file.path, e);
                    report.files_failed += 1;
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
