//! Semantic Chunking
//!
//! 문장 임베딩의 유사도로 인접 문장을 묶습니다.
//! 주제가 바뀌는 지점에서 청크가 나뉘고, 크기 제한도 함께 지킵니다.
//!
//! 짧은 텍스트, 문장 분할 실패, 임베딩 실패는 `SemanticOutcome::Fallback`으로
//! 돌려주며 고정 크기 분할로의 전환은 호출자(`ChunkingEngine`)가 결정합니다.

use std::fmt;
use std::sync::Arc;

use super::chunk::Chunk;
use super::chunker::ChunkConfig;
use super::language::{split_into_sentences, Language, Sentence};
use super::vector::{cosine_similarity, mean_normalized};
use crate::embedding::EmbeddingProvider;

/// 시맨틱 청킹을 시도할 최소 텍스트 길이 (문자 수)
pub const MIN_TEXT_LENGTH: usize = 50;

/// 고정 크기 분할로 전환한 이유
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    TooShort(usize),
    Segmentation(String),
    NoSentences,
    Embedding(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort(len) => write!(f, "text too short ({} < {} chars)", len, MIN_TEXT_LENGTH),
            Self::Segmentation(e) => write!(f, "sentence segmentation failed: {}", e),
            Self::NoSentences => f.write_str("no sentences found"),
            Self::Embedding(e) => write!(f, "sentence embedding failed: {}", e),
        }
    }
}

/// 시맨틱 청킹 결과
#[derive(Debug, Clone, PartialEq)]
pub enum SemanticOutcome {
    Grouped(Vec<Chunk>),
    Fallback(FallbackReason),
}

/// 문장 그룹 (sentences 인덱스 목록)
#[derive(Debug, Default)]
struct Group {
    members: Vec<usize>,
    /// 공백 포함 본문 길이
    size: usize,
}

/// 유사도 기반 청커
pub struct SemanticChunker {
    config: ChunkConfig,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl SemanticChunker {
    pub fn new(config: ChunkConfig, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { config, embedder }
    }

    /// 텍스트를 의미 단위 청크로 분할
    pub async fn split(&self, text: &str, source: &str, language: Option<Language>) -> SemanticOutcome {
        if text.trim().is_empty() {
            return SemanticOutcome::Grouped(vec![]);
        }

        let text_len = text.chars().count();
        if text_len < MIN_TEXT_LENGTH {
            return SemanticOutcome::Fallback(FallbackReason::TooShort(text_len));
        }

        // 1. 문장 분할
        let sentences = match split_into_sentences(text, language) {
            Ok(s) if s.is_empty() => return SemanticOutcome::Fallback(FallbackReason::NoSentences),
            Ok(s) => s,
            Err(e) => return SemanticOutcome::Fallback(FallbackReason::Segmentation(e.to_string())),
        };

        // 2. 한 번에 배치 임베딩
        let texts: Vec<String> = sentences.iter().map(|s| s.text.clone()).collect();
        let embeddings = match self.embedder.embed_batch(&texts).await {
            Ok(e) if e.len() == texts.len() => e,
            Ok(e) => {
                return SemanticOutcome::Fallback(FallbackReason::Embedding(format!(
                    "{} vectors for {} sentences",
                    e.len(),
                    texts.len()
                )))
            }
            Err(e) => return SemanticOutcome::Fallback(FallbackReason::Embedding(e.to_string())),
        };

        // 3. 그룹화 → 4. 청크 생성 → 5. 오버랩
        let groups = self.group_sentences(&sentences, &embeddings);
        let chunks = self.build_chunks(&sentences, &embeddings, &groups, source);

        tracing::debug!(
            "Semantic chunking: {} sentences → {} chunks",
            sentences.len(),
            chunks.len()
        );
        SemanticOutcome::Grouped(chunks)
    }

    /// 유사도와 크기 조건을 모두 만족하면 현재 그룹에 추가
    fn group_sentences(&self, sentences: &[Sentence], embeddings: &[Vec<f32>]) -> Vec<Group> {
        let threshold = self.config.similarity_threshold;
        let mut groups = Vec::new();
        let mut current = Group::default();

        for (i, sentence) in sentences.iter().enumerate() {
            let sentence_len = sentence.char_len();

            if current.members.is_empty() {
                current.members.push(i);
                current.size = sentence_len;
                continue;
            }

            let members: Vec<&[f32]> = current.members.iter().map(|&m| embeddings[m].as_slice()).collect();
            let centroid = mean_normalized(&members);
            let similarity = cosine_similarity(&centroid, &embeddings[i]);
            let fits = current.size + 1 + sentence_len <= self.config.chunk_size;

            if similarity >= threshold && fits {
                current.members.push(i);
                current.size += 1 + sentence_len;
            } else {
                tracing::debug!(
                    "Semantic group closed: {} sentences, {} chars ({})",
                    current.members.len(),
                    current.size,
                    if similarity < threshold { "similarity drop" } else { "size limit" }
                );
                groups.push(std::mem::take(&mut current));
                current.members.push(i);
                current.size = sentence_len;
            }
        }

        if !current.members.is_empty() {
            groups.push(current);
        }
        groups
    }

    fn build_chunks(
        &self,
        sentences: &[Sentence],
        embeddings: &[Vec<f32>],
        groups: &[Group],
        source: &str,
    ) -> Vec<Chunk> {
        let mut chunks = Vec::with_capacity(groups.len());

        for (idx, group) in groups.iter().enumerate() {
            let (Some(&first), Some(&last)) = (group.members.first(), group.members.last()) else {
                continue;
            };

            let mut content = join_sentences(sentences, &group.members);
            let mut start = sentences[first].start;
            let end = sentences[last].end;

            // 이전 그룹의 끝 문장들을 앞에 붙임
            if idx > 0 && self.config.chunk_overlap > 0 {
                let overlap = self.overlap_members(sentences, &groups[idx - 1], content.chars().count());
                if let Some(&overlap_first) = overlap.first() {
                    content = format!("{} {}", join_sentences(sentences, &overlap), content);
                    start = sentences[overlap_first].start;
                }
            }

            let mut chunk = Chunk::new(content, source, chunks.len(), start, end);
            chunk.metadata.chunking_strategy = Some("semantic".to_string());
            chunk.metadata.sentence_count = Some(group.members.len());
            chunk.metadata.avg_similarity = Some(average_similarity(embeddings, &group.members));
            chunks.push(chunk);
        }

        chunks
    }

    /// 오버랩으로 가져올 이전 그룹 문장 (원래 순서)
    fn overlap_members(&self, sentences: &[Sentence], prev: &Group, current_len: usize) -> Vec<usize> {
        let mut taken = Vec::new();
        let mut overlap_len = 0;

        for &m in prev.members.iter().rev() {
            let added = sentences[m].char_len() + 1;
            if overlap_len + added > self.config.chunk_overlap
                || overlap_len + added + current_len > self.config.chunk_size
            {
                break;
            }
            overlap_len += added;
            taken.push(m);
        }

        taken.reverse();
        taken
    }
}

fn join_sentences(sentences: &[Sentence], members: &[usize]) -> String {
    members
        .iter()
        .map(|&m| sentences[m].text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// 그룹 중심과 멤버 간 평균 코사인 유사도 (소수점 3자리)
fn average_similarity(embeddings: &[Vec<f32>], members: &[usize]) -> f32 {
    if members.len() <= 1 {
        return 1.0;
    }

    let vectors: Vec<&[f32]> = members.iter().map(|&m| embeddings[m].as_slice()).collect();
    let centroid = mean_normalized(&vectors);
    let sum: f32 = vectors.iter().map(|v| cosine_similarity(&centroid, v)).sum();
    let avg = sum / vectors.len() as f32;
    (avg * 1000.0).round() / 1000.0
}

// ============================================================================
// Tests
// ============================================================================
