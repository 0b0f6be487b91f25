//! Text Chunking Module
//!
//! 정규화된 문서를 순서 있는 Chunk 목록으로 나눕니다.
//!
//! - `FixedSizeChunker`: 경계 인식 고정 크기 분할
//! - `MarkdownChunker`: ATX 헤더 섹션 단위 분할 + 헤더 경로
//! - `SemanticChunker`: 문장 임베딩 유사도로 그룹화 (semantic.rs)
//!
//! 모든 오프셋은 문자(char) 단위입니다.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::chunk::Chunk;
use super::language::CharCursor;
use super::semantic::{SemanticChunker, SemanticOutcome};
use crate::collector::Document;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkConfig {
    /// 최대 청크 크기 (문자 수)
    pub chunk_size: usize,
    /// 오버랩 크기 (문자 수)
    pub chunk_overlap: usize,
    /// 시맨틱 그룹 유지 최소 코사인 유사도
    pub similarity_threshold: f32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 150,
            similarity_threshold: 0.7,
        }
    }
}

impl ChunkConfig {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(100..=10_000).contains(&self.chunk_size) {
            return Err(RagError::Configuration(format!(
                "chunk_size must be between 100 and 10000, got {}",
                self.chunk_size
            )));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::Configuration(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(RagError::Configuration(format!(
                "similarity_threshold must be within 0.0..=1.0, got {}",
                self.similarity_threshold
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 동기 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 텍스트를 청크로 분할 (`chunk_index`는 0부터)
    fn chunk(&self, text: &str, source: &str) -> Vec<Chunk>;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// FixedSizeChunker
// ============================================================================

/// 분할 우선순위별 구분자
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "? ", "! ", "。", " "];

/// 경계 인식 고정 크기 청커
///
/// 창 안에서 우선순위가 가장 높은 구분자의 마지막 위치에서 자릅니다.
/// 구분자는 앞 청크에 남고, 찾지 못하면 창 끝에서 강제로 자릅니다.
#[derive(Debug, Clone)]
pub struct FixedSizeChunker {
    config: ChunkConfig,
}

impl FixedSizeChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    /// 분할 지점 (창 기준 문자 수)
    fn find_split_point(text: &[char], max_size: usize) -> usize {
        if text.len() <= max_size {
            return text.len();
        }

        let window = &text[..max_size];
        for sep in SEPARATORS {
            let sep: Vec<char> = sep.chars().collect();
            if let Some(pos) = rfind_chars(window, &sep) {
                if pos > 0 {
                    return pos + sep.len();
                }
            }
        }

        max_size
    }
}

/// 문자 슬라이스에서 마지막 일치 위치
fn rfind_chars(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

impl Chunker for FixedSizeChunker {
    fn chunk(&self, text: &str, source: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return vec![];
        }

        let chars: Vec<char> = text.chars().collect();
        let len = chars.len();
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < len {
            let remaining = &chars[start..];
            let split = Self::find_split_point(remaining, self.config.chunk_size);

            let content: String = remaining[..split].iter().collect();
            let content = content.trim();
            if !content.is_empty() {
                chunks.push(Chunk::new(content, source, chunks.len(), start, start + split));
            }

            if start + split >= len {
                break;
            }

            // 오버랩을 적용하되, 최소한 1자는 진행
            let next_start = (start + split).saturating_sub(self.config.chunk_overlap);
            start = next_start.max(start + 1);
        }

        chunks
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

// ============================================================================
// MarkdownChunker
// ============================================================================

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^(#{1,6})[ \t]+(.+)$").expect("valid regex"))
}

/// Markdown 섹션 (level 0 = 첫 헤더 이전 본문)
#[derive(Debug, Clone, PartialEq)]
struct Section {
    level: usize,
    title: String,
    /// trim된 본문 (헤더 줄 포함)
    content: String,
    /// `content` 시작 위치 (문자)
    start: usize,
    /// 다음 섹션 시작 위치 (문자)
    end: usize,
}

/// 트림된 본문과 그 시작 문자 위치
fn trimmed_span(text: &str, byte_start: usize, byte_end: usize, cursor: &mut CharCursor<'_>) -> (String, usize) {
    let slice = &text[byte_start..byte_end];
    let leading = slice.len() - slice.trim_start().len();
    (slice.trim().to_string(), cursor.char_index(byte_start + leading))
}

/// Markdown 인식 청커
///
/// 헤더 경계를 유지하고 각 청크에 상위 헤더 경로를 기록합니다.
/// `chunk_size`보다 긴 섹션은 고정 크기로 다시 나눕니다.
#[derive(Debug, Clone)]
pub struct MarkdownChunker {
    config: ChunkConfig,
}

impl MarkdownChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    /// Markdown을 섹션으로 파싱
    fn parse_sections(text: &str) -> Vec<Section> {
        let headers: Vec<_> = header_re().captures_iter(text).collect();
        let total_chars = text.chars().count();
        let mut cursor = CharCursor::new(text);

        if headers.is_empty() {
            let (content, start) = trimmed_span(text, 0, text.len(), &mut cursor);
            return vec![Section {
                level: 0,
                title: String::new(),
                content,
                start,
                end: total_chars,
            }];
        }

        let mut sections = Vec::new();

        // 첫 헤더 이전 내용
        let first_start = headers[0].get(0).map_or(0, |m| m.start());
        if first_start > 0 {
            let (content, start) = trimmed_span(text, 0, first_start, &mut cursor);
            if !content.is_empty() {
                let end = cursor.char_index(first_start);
                sections.push(Section {
                    level: 0,
                    title: String::new(),
                    content,
                    start,
                    end,
                });
            }
        }

        let header_starts: Vec<usize> = headers
            .iter()
            .filter_map(|c| c.get(0).map(|m| m.start()))
            .collect();

        for (i, caps) in headers.iter().enumerate() {
            let level = caps.get(1).map_or(0, |m| m.as_str().len());
            let title = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();

            // 다음 헤더까지 또는 끝까지
            let byte_start = header_starts[i];
            let byte_end = header_starts.get(i + 1).copied().unwrap_or(text.len());

            let (content, start) = trimmed_span(text, byte_start, byte_end, &mut cursor);
            let end = cursor.char_index(byte_end);
            sections.push(Section {
                level,
                title,
                content,
                start,
                end,
            });
        }

        sections
    }

    /// 현재 섹션의 헤더 경로 생성 (예: "# Title > ## Section")
    fn build_header_path(sections: &[Section], current: usize) -> Option<String> {
        let section = sections.get(current)?;
        if section.level == 0 {
            return None;
        }

        let mut parts = Vec::new();
        let mut target_level = section.level;

        // 현재 섹션부터 역순으로 상위 헤더 찾기
        for s in sections[..=current].iter().rev() {
            if s.level > 0 && s.level <= target_level {
                parts.push(format!("{} {}", "#".repeat(s.level), s.title));
                target_level = s.level - 1;
            }
            if target_level == 0 {
                break;
            }
        }

        parts.reverse();
        Some(parts.join(" > "))
    }
}

impl Chunker for MarkdownChunker {
    fn chunk(&self, text: &str, source: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return vec![];
        }

        let sections = Self::parse_sections(text);
        let fixed = FixedSizeChunker::new(self.config.clone());
        let mut chunks: Vec<Chunk> = Vec::new();

        for (idx, section) in sections.iter().enumerate() {
            if section.content.is_empty() {
                continue;
            }
            let header_path = Self::build_header_path(&sections, idx);

            if section.content.chars().count() > self.config.chunk_size {
                // 긴 섹션은 고정 크기로 분할, 오프셋은 원문 기준으로 재계산
                for mut sub in fixed.chunk(&section.content, source) {
                    sub.metadata.chunk_index = chunks.len();
                    sub.metadata.start_char += section.start;
                    sub.metadata.end_char += section.start;
                    sub.metadata.header_path = header_path.clone();
                    chunks.push(sub);
                }
            } else {
                let mut chunk = Chunk::new(
                    section.content.clone(),
                    source,
                    chunks.len(),
                    section.start,
                    section.end,
                );
                chunk.metadata.header_path = header_path;
                chunks.push(chunk);
            }
        }

        chunks
    }

    fn name(&self) -> &'static str {
        "markdown"
    }
}

// ============================================================================
// Strategy & Engine
// ============================================================================

/// 청킹 전략
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    /// 확장자로 결정 (.md/.markdown → Markdown, 그 외 Fixed)
    #[default]
    Auto,
    Fixed,
    Markdown,
    Semantic,
}

impl FromStr for ChunkingStrategy {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "fixed" => Ok(Self::Fixed),
            "markdown" | "md" => Ok(Self::Markdown),
            "semantic" => Ok(Self::Semantic),
            other => Err(RagError::Configuration(format!(
                "Unknown chunking strategy '{}' (expected auto, fixed, markdown or semantic)",
                other
            ))),
        }
    }
}

impl fmt::Display for ChunkingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Fixed => "fixed",
            Self::Markdown => "markdown",
            Self::Semantic => "semantic",
        };
        f.write_str(name)
    }
}

/// 전략 선택 + 실행
///
/// 시맨틱 전략은 임베더가 있어야 하며, 없거나 실패하면 고정 크기로 대체합니다.
pub struct ChunkingEngine {
    config: ChunkConfig,
    strategy: ChunkingStrategy,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl ChunkingEngine {
    pub fn new(config: ChunkConfig, strategy: ChunkingStrategy) -> Self {
        Self {
            config,
            strategy,
            embedder: None,
        }
    }

    /// 시맨틱 청킹용 임베더 주입
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// 문서에 적용할 실제 전략
    pub fn resolve_strategy(&self, doc: &Document) -> ChunkingStrategy {
        match self.strategy {
            ChunkingStrategy::Auto => {
                if doc.is_markdown() {
                    ChunkingStrategy::Markdown
                } else {
                    ChunkingStrategy::Fixed
                }
            }
            other => other,
        }
    }

    /// 문서를 청크로 분할
    pub async fn chunk_document(&self, doc: &Document) -> Vec<Chunk> {
        let strategy = self.resolve_strategy(doc);
        let chunks = match strategy {
            ChunkingStrategy::Markdown => MarkdownChunker::new(self.config.clone()).chunk(&doc.content, &doc.source),
            ChunkingStrategy::Semantic => self.chunk_semantic(doc).await,
            ChunkingStrategy::Fixed | ChunkingStrategy::Auto => {
                FixedSizeChunker::new(self.config.clone()).chunk(&doc.content, &doc.source)
            }
        };

        tracing::debug!(
            "Chunked {} with {} strategy: {} chunks",
            doc.source,
            strategy,
            chunks.len()
        );
        chunks
    }

    async fn chunk_semantic(&self, doc: &Document) -> Vec<Chunk> {
        let Some(embedder) = &self.embedder else {
            tracing::warn!("Semantic chunking requested without embedder, using fixed-size");
            return FixedSizeChunker::new(self.config.clone()).chunk(&doc.content, &doc.source);
        };

        let chunker = SemanticChunker::new(self.config.clone(), embedder.clone());
        match chunker.split(&doc.content, &doc.source, Some(doc.language)).await {
            SemanticOutcome::Grouped(chunks) => chunks,
            SemanticOutcome::Fallback(reason) => {
                tracing::info!("Semantic chunking fell back to fixed-size: {}", reason);
                FixedSizeChunker::new(self.config.clone()).chunk(&doc.content, &doc.source)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(size: usize, overlap: usize) -> FixedSizeChunker {
        FixedSizeChunker::new(ChunkConfig::new(size, overlap))
    }

    #[test]
    fn test_chunker_empty() {
        assert!(fixed(100, 10).chunk("", "s").is_empty());
        assert!(fixed(100, 10).chunk("  \n\t ", "s").is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = fixed(100, 10).chunk("  짧은 텍스트입니다.  ", "s");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "짧은 텍스트입니다.");
    }

    #[test]
    fn test_hard_cut_without_separators() {
        let text = "A".repeat(300);
        let chunks = fixed(100, 0).chunk(&text, "s");

        assert_eq!(chunks.len(), 3);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.char_len(), 100);
            assert_eq!(c.metadata.chunk_index, i);
            assert_eq!(c.metadata.start_char, i * 100);
        }
    }

    #[test]
    fn test_split_prefers_paragraph_break() {
        let text = format!("{}\n\n{}", "a ".repeat(30), "b ".repeat(60));
        let chunks = fixed(100, 0).chunk(&text, "s");

        assert!(chunks[0].content.chars().all(|c| c == 'a' || c == ' '));
        // 구분자는 앞 청크에 포함
        assert_eq!(chunks[0].metadata.end_char, 62);
        assert_eq!(chunks[1].metadata.start_char, 62);
    }

    #[test]
    fn test_overlap_and_ordering() {
        let text = "word ".repeat(200);
        let chunks = fixed(100, 20).chunk(&text, "s");

        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert!(pair[0].metadata.start_char <= pair[1].metadata.start_char);
            assert_eq!(pair[0].metadata.chunk_index + 1, pair[1].metadata.chunk_index);
            // 다음 청크는 이전 청크 끝에서 overlap만큼 앞에서 시작
            assert_eq!(pair[1].metadata.start_char, pair[0].metadata.end_char - 20);
        }
    }

    #[test]
    fn test_spans_partition_text_without_overlap() {
        let text = "문장 하나. ".repeat(50);
        let chunks = fixed(100, 0).chunk(&text, "s");

        assert_eq!(chunks[0].metadata.start_char, 0);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].metadata.end_char, pair[1].metadata.start_char);
        }
        assert_eq!(chunks.last().unwrap().metadata.end_char, text.chars().count());
    }

    #[test]
    fn test_overlap_larger_than_split_still_advances() {
        // 첫 분할이 2자에서 일어나 overlap(99)이 분할 거리보다 큼
        let text = format!("x {}", "y".repeat(300));
        let chunks = fixed(100, 99).chunk(&text, "s");

        assert_eq!(chunks[0].metadata.end_char, 2);
        for pair in chunks.windows(2) {
            assert!(pair[0].metadata.start_char < pair[1].metadata.start_char);
        }
        assert_eq!(chunks.last().unwrap().metadata.end_char, text.chars().count());
    }

    #[test]
    fn test_unicode_offsets() {
        let text = "가나다라마바사아자차카타파하".repeat(20);
        let chunks = fixed(100, 0).chunk(&text, "s");
        let chars: Vec<char> = text.chars().collect();

        for c in &chunks {
            let slice: String = chars[c.metadata.start_char..c.metadata.end_char].iter().collect();
            assert_eq!(slice.trim(), c.content);
        }
    }

    #[test]
    fn test_markdown_header_path() {
        let chunker = MarkdownChunker::new(ChunkConfig::new(1000, 0));
        let chunks = chunker.chunk("# A\n\n## B\n\nContent", "doc.md");

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].metadata.header_path.as_deref(), Some("# A"));
        assert_eq!(chunks[1].metadata.header_path.as_deref(), Some("# A > ## B"));
        assert!(chunks[1].content.contains("Content"));
    }

    #[test]
    fn test_markdown_sibling_path() {
        let text = "# Root\n\n## One\n\nfirst\n\n### Deep\n\ndeep\n\n## Two\n\nsecond";
        let chunks = MarkdownChunker::new(ChunkConfig::new(1000, 0)).chunk(text, "d.md");
        let paths: Vec<_> = chunks
            .iter()
            .map(|c| c.metadata.header_path.clone().unwrap_or_default())
            .collect();

        assert_eq!(
            paths,
            vec!["# Root", "# Root > ## One", "# Root > ## One > ### Deep", "# Root > ## Two"]
        );
    }

    #[test]
    fn test_markdown_preamble_and_no_headers() {
        let chunker = MarkdownChunker::new(ChunkConfig::new(1000, 0));

        let chunks = chunker.chunk("intro text\n\n# Title\n\nbody", "d.md");
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].metadata.header_path.is_none());
        assert_eq!(chunks[0].content, "intro text");

        let plain = chunker.chunk("just text, no headers", "d.md");
        assert_eq!(plain.len(), 1);
        assert!(plain[0].metadata.header_path.is_none());
    }

    #[test]
    fn test_markdown_long_section_rebased() {
        let body = "word ".repeat(60);
        let text = format!("# Intro\n\nshort\n\n## Long\n\n{}", body);
        let chunks = MarkdownChunker::new(ChunkConfig::new(100, 0)).chunk(&text, "d.md");

        assert!(chunks.len() > 2);
        let chars: Vec<char> = text.chars().collect();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.metadata.chunk_index, i);
            let slice: String = chars[c.metadata.start_char..c.metadata.end_char].iter().collect();
            assert!(slice.contains(c.content.as_str()));
        }
        assert!(chunks[1..]
            .iter()
            .all(|c| c.metadata.header_path.as_deref() == Some("# Intro > ## Long")));
    }

    #[test]
    fn test_config_validate() {
        assert!(ChunkConfig::default().validate().is_ok());
        assert!(ChunkConfig::new(50, 0).validate().is_err());
        assert!(ChunkConfig::new(200, 200).validate().is_err());
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("Semantic".parse::<ChunkingStrategy>().unwrap(), ChunkingStrategy::Semantic);
        assert!("tokens".parse::<ChunkingStrategy>().is_err());
        assert_eq!(ChunkingStrategy::Markdown.to_string(), "markdown");
    }

    #[tokio::test]
    async fn test_engine_auto_strategy() {
        let engine = ChunkingEngine::new(ChunkConfig::default(), ChunkingStrategy::Auto);
        let md = Document::from_text("# T\n\nbody", "/tmp/a.md");
        let txt = Document::from_text("plain body", "/tmp/a.txt");

        assert_eq!(engine.resolve_strategy(&md), ChunkingStrategy::Markdown);
        assert_eq!(engine.resolve_strategy(&txt), ChunkingStrategy::Fixed);

        let chunks = engine.chunk_document(&md).await;
        assert_eq!(chunks[0].metadata.header_path.as_deref(), Some("# T"));
    }

    #[tokio::test]
    async fn test_engine_semantic_without_embedder_falls_back() {
        let engine = ChunkingEngine::new(ChunkConfig::default(), ChunkingStrategy::Semantic);
        let doc = Document::from_text(&"Some sentence here. ".repeat(10), "/tmp/a.txt");
        let chunks = engine.chunk_document(&doc).await;

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].metadata.chunking_strategy.is_none());
    }
}
