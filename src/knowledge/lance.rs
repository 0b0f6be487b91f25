//! LanceDB Vector Store - 밀집 인덱스
//!
//! ANN 검색과 엔진 측 `user_id` 필터를 LanceDB에 맡깁니다.
//!
//! 열린 경로(`<index_path>.lance`)는 작업용 테이블일 뿐이고 영속 상태가 아닙니다.
//! `add()`/`clear()`는 작업 테이블만 바꾸고, `save(dir)`가 전체 행을
//! `dir/vectors.lance`에 복사합니다. `dir`은 IndexStore의 스테이징 디렉토리라서
//! 인덱스 교체와 함께 원자적으로 반영됩니다. `load(dir)`는 그 스냅샷으로
//! 작업 테이블을 덮어씁니다.
//! ref: https://lancedb.github.io/lancedb/

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::{Connection, CreateTableMode};
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::DistanceType;

use super::chunk::{sort_by_score_desc, Chunk, ChunkMetadata, ScoredChunk, SearchStage};
use super::vector::{validate_batch, DenseMeta, VectorStore};
use crate::error::{RagError, Result};

/// 벡터 테이블 이름
const TABLE_NAME: &str = "chunks";
/// 인덱스 디렉토리 안의 스냅샷 DB
pub const SNAPSHOT_DIR: &str = "vectors.lance";

fn vector_err(context: &str, e: impl std::fmt::Display) -> RagError {
    RagError::Vector(format!("{}: {}", context, e))
}

/// SQL 문자열 리터럴 이스케이프
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

async fn connect(path: &Path) -> Result<Connection> {
    let path_str = path
        .to_str()
        .ok_or_else(|| RagError::Configuration(format!("Invalid path encoding: {:?}", path)))?;

    lancedb::connect(path_str)
        .execute()
        .await
        .map_err(|e| vector_err("Failed to connect to LanceDB", e))
}

/// 테이블 존재 여부 확인
async fn table_exists(db: &Connection) -> bool {
    db.table_names()
        .execute()
        .await
        .map(|names| names.contains(&TABLE_NAME.to_string()))
        .unwrap_or(false)
}

async fn open_table(db: &Connection) -> Result<lancedb::table::Table> {
    db.open_table(TABLE_NAME)
        .execute()
        .await
        .map_err(|e| vector_err("Failed to open table", e))
}

/// 테이블 전체 행 읽기
async fn read_all(db: &Connection) -> Result<Vec<RecordBatch>> {
    if !table_exists(db).await {
        return Ok(vec![]);
    }

    let table = open_table(db).await?;
    let rows = table
        .count_rows(None)
        .await
        .map_err(|e| vector_err("Failed to count rows", e))?;
    if rows == 0 {
        return Ok(vec![]);
    }

    // 일반 쿼리는 기본 limit이 있으므로 행 수를 명시
    table
        .query()
        .limit(rows)
        .execute()
        .await
        .map_err(|e| vector_err("Failed to scan table", e))?
        .try_collect()
        .await
        .map_err(|e| vector_err("Failed to read table rows", e))
}

/// 테이블 내용을 `batches`로 교체 (비어 있으면 테이블 삭제)
async fn replace_all(db: &Connection, batches: Vec<RecordBatch>) -> Result<usize> {
    let Some(schema) = batches.first().map(|b| b.schema()) else {
        if table_exists(db).await {
            db.drop_table(TABLE_NAME)
                .await
                .map_err(|e| vector_err("Failed to drop table", e))?;
        }
        return Ok(0);
    };

    let rows = batches.iter().map(|b| b.num_rows()).sum();
    db.create_table(
        TABLE_NAME,
        RecordBatchIterator::new(batches.into_iter().map(Ok), schema),
    )
    .mode(CreateTableMode::Overwrite)
    .execute()
    .await
    .map_err(|e| vector_err("Failed to write table", e))?;
    Ok(rows)
}

// ============================================================================
// LanceVectorStore
// ============================================================================

/// LanceDB 벡터 저장소 구현
///
/// 스키마: id(i64), source, content, user_id(nullable), metadata(JSON), embedding.
/// 점수는 dot 거리에서 환산한 내적입니다.
pub struct LanceVectorStore {
    db: Connection,
    path: PathBuf,
    dimension: usize,
}

impl LanceVectorStore {
    /// LanceDB 작업 저장소 열기
    ///
    /// # Arguments
    /// * `path` - 작업용 .lance 디렉토리 경로
    /// * `dimension` - 임베딩 차원
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        // 부모 디렉토리 생성
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let db = connect(path).await?;

        Ok(Self {
            db,
            path: path.to_path_buf(),
            dimension,
        })
    }

    /// 작업 데이터베이스 경로
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 벡터 테이블 스키마 생성
    fn create_schema(&self) -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("source", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
            Field::new("user_id", DataType::Utf8, true),
            Field::new("metadata", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                false,
            ),
        ])
    }

    /// 청크와 임베딩을 Arrow RecordBatch로 변환
    fn to_batch(&self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<RecordBatch> {
        // ChunkId 비트를 그대로 i64로 저장
        let ids: Vec<i64> = chunks.iter().map(|c| c.id().as_u64() as i64).collect();
        let sources: Vec<&str> = chunks.iter().map(|c| c.metadata.source.as_str()).collect();
        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        let user_ids: Vec<Option<&str>> = chunks
            .iter()
            .map(|c| c.metadata.user_id.as_deref())
            .collect();
        let metadata = chunks
            .iter()
            .map(|c| serde_json::to_string(&c.metadata))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // 임베딩을 FixedSizeList로 변환
        let embeddings_flat: Vec<f32> = embeddings.iter().flatten().copied().collect();
        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .map_err(|e| vector_err("Failed to create embedding array", e))?;

        RecordBatch::try_new(
            Arc::new(self.create_schema()),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(sources)),
                Arc::new(StringArray::from(contents)),
                Arc::new(StringArray::from(user_ids)),
                Arc::new(StringArray::from(metadata)),
                Arc::new(embeddings_list),
            ],
        )
        .map_err(|e| vector_err("Failed to create RecordBatch", e))
    }

    /// 검색 결과 배치를 ScoredChunk로 변환
    fn batch_to_results(batch: &RecordBatch, out: &mut Vec<ScoredChunk>) -> Result<()> {
        let contents = batch
            .column_by_name("content")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| RagError::Vector("Missing content column".to_string()))?;

        let metadata = batch
            .column_by_name("metadata")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| RagError::Vector("Missing metadata column".to_string()))?;

        // _distance 컬럼 (LanceDB가 자동 추가)
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
            .ok_or_else(|| RagError::Vector("Missing _distance column".to_string()))?;

        for i in 0..batch.num_rows() {
            let metadata: ChunkMetadata = serde_json::from_str(metadata.value(i))?;
            // dot 거리 = 1 - 내적
            let score = 1.0 - distances.value(i);

            out.push(ScoredChunk::new(
                Chunk {
                    content: contents.value(i).to_string(),
                    metadata,
                },
                score,
                SearchStage::Dense,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn add(&mut self, chunks: &[Chunk], embeddings: &[Vec<f32>]) -> Result<usize> {
        match validate_batch(chunks, embeddings, self.dimension) {
            Err(RagError::EmptyInput(_)) => return Ok(0),
            other => other?,
        }

        let batch = self.to_batch(chunks, embeddings)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        if table_exists(&self.db).await {
            // 기존 테이블에 추가
            open_table(&self.db)
                .await?
                .add(batches)
                .execute()
                .await
                .map_err(|e| vector_err("Failed to add vectors to table", e))?;
        } else {
            // 새 테이블 생성
            self.db
                .create_table(TABLE_NAME, batches)
                .execute()
                .await
                .map_err(|e| vector_err("Failed to create table", e))?;
        }

        tracing::debug!("LanceDB: added {} vectors", chunks.len());
        Ok(chunks.len())
    }

    async fn search(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        tenant: Option<&str>,
    ) -> Result<Vec<ScoredChunk>> {
        if query_embedding.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: query_embedding.len(),
            });
        }
        if top_k == 0 || !table_exists(&self.db).await {
            return Ok(vec![]);
        }

        let table = open_table(&self.db).await?;

        let mut query = table
            .vector_search(query_embedding.to_vec())
            .map_err(|e| vector_err("Failed to create vector search", e))?
            .distance_type(DistanceType::Dot)
            .limit(top_k);

        if let Some(user_id) = tenant {
            query = query.only_if(format!("user_id = {}", quote(user_id)));
        }

        let stream = query
            .execute()
            .await
            .map_err(|e| vector_err("Failed to execute vector search", e))?;

        // RecordBatch 스트림에서 결과 추출
        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| vector_err("Failed to read search results", e))?;

        let mut results = Vec::new();
        for batch in &batches {
            Self::batch_to_results(batch, &mut results)?;
        }

        sort_by_score_desc(&mut results);
        results.truncate(top_k);
        Ok(results)
    }

    async fn save(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;

        let snapshot = connect(&dir.join(SNAPSHOT_DIR)).await?;
        let rows = replace_all(&snapshot, read_all(&self.db).await?).await?;

        DenseMeta {
            dimension: self.dimension,
            backend: self.name().to_string(),
        }
        .write(dir)
        .await?;

        tracing::debug!("LanceDB snapshot saved ({} vectors)", rows);
        Ok(())
    }

    async fn load(&mut self, dir: &Path) -> Result<()> {
        DenseMeta::read_checked(dir, self.dimension).await?;

        // 스냅샷이 없으면 빈 인덱스 (행 수 검증은 IndexStore가 함)
        let snapshot_path = dir.join(SNAPSHOT_DIR);
        let batches = if snapshot_path.exists() {
            read_all(&connect(&snapshot_path).await?)
                .await
                .map_err(|e| RagError::corrupt(&snapshot_path, e))?
        } else {
            vec![]
        };

        let rows = replace_all(&self.db, batches).await?;
        tracing::debug!("LanceDB restored {} vectors into {:?}", rows, self.path);
        Ok(())
    }

    async fn clear(&mut self) -> Result<()> {
        replace_all(&self.db, vec![]).await?;
        Ok(())
    }

    async fn total_chunks(&self) -> Result<usize> {
        if !table_exists(&self.db).await {
            return Ok(0);
        }

        open_table(&self.db)
            .await?
            .count_rows(None)
            .await
            .map_err(|e| vector_err("Failed to count rows", e))
    }

    fn name(&self) -> &'static str {
        "lance"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DIM: usize = 4;

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[i] = 1.0;
        v
    }

    fn create_test_chunks() -> Vec<Chunk> {
        vec![
            Chunk::new("first", "doc.txt", 0, 0, 5),
            Chunk::new("second", "doc.txt", 1, 5, 11).with_user_id("alice"),
            Chunk::new("third", "doc.txt", 2, 11, 16).with_user_id("o'brien"),
        ]
    }

    #[tokio::test]
    async fn test_lance_store_basic() {
        let temp_dir = TempDir::new().unwrap();
        let lance_path = temp_dir.path().join("test.lance");

        let mut store = LanceVectorStore::open(&lance_path, DIM).await.unwrap();

        // 초기 상태
        assert_eq!(store.total_chunks().await.unwrap(), 0);

        // 삽입
        let chunks = create_test_chunks();
        let embeddings = vec![axis(0), axis(1), axis(2)];
        let inserted = store.add(&chunks, &embeddings).await.unwrap();
        assert_eq!(inserted, 3);
        assert_eq!(store.total_chunks().await.unwrap(), 3);

        // 삭제
        store.clear().await.unwrap();
        assert_eq!(store.total_chunks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_lance_search_with_tenant() {
        let temp_dir = TempDir::new().unwrap();
        let lance_path = temp_dir.path().join("search_test.lance");

        let mut store = LanceVectorStore::open(&lance_path, DIM).await.unwrap();
        let chunks = create_test_chunks();
        store
            .add(&chunks, &[axis(0), axis(1), axis(2)])
            .await
            .unwrap();

        let results = store.search(&axis(0), 2, None).await.unwrap();
        assert!(!results.is_empty());
        assert!(results.len() <= 2);
        assert_eq!(results[0].chunk.content, "first");
        assert_eq!(results[0].chunk.metadata.chunk_index, 0);

        let results = store.search(&axis(0), 5, Some("o'brien")).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.content, "third");
    }

    #[tokio::test]
    async fn test_lance_rejects_wrong_dimension() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = LanceVectorStore::open(&temp_dir.path().join("dim.lance"), DIM)
            .await
            .unwrap();

        let chunks = create_test_chunks();
        let err = store
            .add(&chunks[..1], &[vec![1.0, 0.0]])
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_unsaved_changes_do_not_reach_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let index_dir = temp_dir.path().join("index");

        let mut store = LanceVectorStore::open(&temp_dir.path().join("work.lance"), DIM)
            .await
            .unwrap();
        store
            .add(&create_test_chunks(), &[axis(0), axis(1), axis(2)])
            .await
            .unwrap();
        store.save(&index_dir).await.unwrap();

        // 저장 이후의 clear/add는 작업 테이블에만 반영
        store.clear().await.unwrap();
        store
            .add(&create_test_chunks()[..1], &[axis(3)])
            .await
            .unwrap();
        assert_eq!(store.total_chunks().await.unwrap(), 1);

        let mut restored = LanceVectorStore::open(&temp_dir.path().join("other.lance"), DIM)
            .await
            .unwrap();
        restored.load(&index_dir).await.unwrap();
        assert_eq!(restored.total_chunks().await.unwrap(), 3);

        store.load(&index_dir).await.unwrap();
        assert_eq!(store.total_chunks().await.unwrap(), 3);
        let results = store.search(&axis(1), 1, None).await.unwrap();
        assert_eq!(results[0].chunk.content, "second");
    }

    #[tokio::test]
    async fn test_empty_snapshot_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let index_dir = temp_dir.path().join("index");

        let store = LanceVectorStore::open(&temp_dir.path().join("work.lance"), DIM)
            .await
            .unwrap();
        store.save(&index_dir).await.unwrap();

        let mut restored = LanceVectorStore::open(&temp_dir.path().join("other.lance"), DIM)
            .await
            .unwrap();
        restored
            .add(&create_test_chunks()[..1], &[axis(0)])
            .await
            .unwrap();
        restored.load(&index_dir).await.unwrap();
        assert_eq!(restored.total_chunks().await.unwrap(), 0);
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("o'brien"), "'o''brien'");
    }
}
