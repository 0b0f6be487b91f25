//! 언어 감지, 텍스트 정규화, 문장 분할
//!
//! 외부 형태소 분석기 없이 문자 비율과 규칙으로 동작합니다.
//! 문장 분할기는 `SentenceSegmenter` 트레이트로 교체할 수 있습니다.

use std::fmt;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;

/// 이 길이(문자 수)를 넘는 문장은 쉼표/세미콜론/공백에서 추가 분할
pub const MAX_SENTENCE_LENGTH: usize = 2000;

/// 언어 판단 임계값 (해당 문자 비율)
const LANGUAGE_THRESHOLD: f32 = 0.3;

// ============================================================================
// Language
// ============================================================================

/// 감지된 언어
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Korean,
    English,
    Unknown,
}

impl Language {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Korean => "ko",
            Self::English => "en",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 한글 음절/자모 여부
pub fn is_hangul(c: char) -> bool {
    matches!(c, '\u{AC00}'..='\u{D7AF}' | '\u{1100}'..='\u{11FF}' | '\u{3130}'..='\u{318F}')
}

/// 텍스트 언어 감지
///
/// 한글/ASCII 알파벳 비율로 판단합니다. 공백, 숫자, 특수문자는 세지 않습니다.
pub fn detect_language(text: &str) -> Language {
    let mut korean = 0usize;
    let mut ascii = 0usize;

    for c in text.chars() {
        if is_hangul(c) {
            korean += 1;
        } else if c.is_ascii_alphabetic() {
            ascii += 1;
        }
    }

    let total = korean + ascii;
    if total == 0 {
        return Language::Unknown;
    }

    if korean as f32 / total as f32 >= LANGUAGE_THRESHOLD {
        Language::Korean
    } else if ascii as f32 / total as f32 >= LANGUAGE_THRESHOLD {
        Language::English
    } else {
        Language::Unknown
    }
}

// ============================================================================
// Normalization
// ============================================================================

fn horizontal_ws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\S\n]+").expect("valid regex"))
}

fn blank_lines_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"))
}

/// 문서 본문 정규화
///
/// 1. 탭 → 공백 4개, 줄 끝 공백 제거
/// 2. 연속 가로 공백 → 공백 하나 (줄바꿈 유지)
/// 3. 3개 이상 연속 줄바꿈 → 2개
/// 4. 앞뒤 공백 제거
///
/// 청크 오프셋은 이 함수의 결과를 기준으로 합니다.
pub fn normalize_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\t', "    ");
    let text = text
        .split('\n')
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    let text = horizontal_ws_re().replace_all(&text, " ");
    let text = blank_lines_re().replace_all(&text, "\n\n");
    text.trim().to_string()
}

// ============================================================================
// Sentences
// ============================================================================

/// 분할된 문장 (오프셋은 입력 텍스트 기준 문자 단위)
#[derive(Debug, Clone, PartialEq)]
pub struct Sentence {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

impl Sentence {
    pub fn char_len(&self) -> usize {
        self.end - self.start
    }
}

/// 문장 분할기 트레이트
pub trait SentenceSegmenter: Send + Sync {
    fn split(&self, text: &str) -> Result<Vec<Sentence>>;

    fn name(&self) -> &'static str;
}

/// 바이트 위치 → 문자 위치 변환 (단조 증가 조회에 최적화)
pub(crate) struct CharCursor<'a> {
    text: &'a str,
    byte: usize,
    chars: usize,
}

impl<'a> CharCursor<'a> {
    pub(crate) fn new(text: &'a str) -> Self {
        Self { text, byte: 0, chars: 0 }
    }

    pub(crate) fn char_index(&mut self, byte: usize) -> usize {
        if byte < self.byte {
            return self.text[..byte].chars().count();
        }
        self.chars += self.text[self.byte..byte].chars().count();
        self.byte = byte;
        self.chars
    }
}

/// 바이트 구간을 trim하여 문장으로 추가
fn push_trimmed(text: &str, start: usize, end: usize, cursor: &mut CharCursor<'_>, out: &mut Vec<Sentence>) {
    let slice = &text[start..end];
    let leading = slice.len() - slice.trim_start().len();
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return;
    }

    let byte_start = start + leading;
    let byte_end = byte_start + trimmed.len();
    let char_start = cursor.char_index(byte_start);
    let char_end = cursor.char_index(byte_end);

    out.push(Sentence {
        text: trimmed.to_string(),
        start: char_start,
        end: char_end,
    });
}

fn english_boundary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]\s+[A-Z]").expect("valid regex"))
}

/// 정규식 기반 분할기 (영어 등)
///
/// 마침표/물음표/느낌표 뒤 공백 + 대문자에서 문장을 나눕니다.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexSegmenter;

impl SentenceSegmenter for RegexSegmenter {
    fn split(&self, text: &str) -> Result<Vec<Sentence>> {
        let mut sentences = Vec::new();
        let mut cursor = CharCursor::new(text);
        let mut start = 0;

        for m in english_boundary_re().find_iter(text) {
            // 대문자 직전까지가 한 문장
            let boundary = m.end() - 1;
            push_trimmed(text, start, boundary, &mut cursor, &mut sentences);
            start = boundary;
        }
        push_trimmed(text, start, text.len(), &mut cursor, &mut sentences);

        Ok(sentences)
    }

    fn name(&self) -> &'static str {
        "regex"
    }
}

/// 한국어 분할기
///
/// 종결 부호 뒤 공백, 또는 종결 어미(다/요/죠/까/니)로 끝나는 줄에서 나눕니다.
/// 마침표 없이 줄바꿈으로 끝나는 한국어 문장도 처리합니다.
///
/// 형태소 분석 없는 근사입니다. 줄 중간의 "다 " 같은 종결 어미는 경계로 보지 않고,
/// "~니" 로 끝나는 명사 줄은 문장 끝으로 오인할 수 있습니다.
#[derive(Debug, Default, Clone, Copy)]
pub struct HangulSegmenter;

impl HangulSegmenter {
    fn is_terminal(c: char) -> bool {
        matches!(c, '.' | '!' | '?' | '。' | '！' | '？' | '…')
    }

    fn is_final_ending(c: char) -> bool {
        matches!(c, '다' | '요' | '죠' | '까' | '니' | '네')
    }

    fn is_closing(c: char) -> bool {
        matches!(c, '"' | '\'' | ')' | ']' | '”' | '’' | '」' | '』')
    }
}

impl SentenceSegmenter for HangulSegmenter {
    fn split(&self, text: &str) -> Result<Vec<Sentence>> {
        let mut sentences = Vec::new();
        let mut cursor = CharCursor::new(text);
        let mut start = 0;
        let mut last_visible: Option<char> = None;

        let mut iter = text.char_indices().peekable();
        while let Some((i, c)) = iter.next() {
            if c == '\n' {
                if last_visible.is_some_and(Self::is_final_ending) {
                    push_trimmed(text, start, i, &mut cursor, &mut sentences);
                    start = i;
                }
                continue;
            }

            if !c.is_whitespace() {
                last_visible = Some(c);
            }

            if Self::is_terminal(c) {
                // 연속 부호와 닫는 따옴표는 앞 문장에 포함
                let mut end = i + c.len_utf8();
                while let Some(&(j, next)) = iter.peek() {
                    if Self::is_terminal(next) || Self::is_closing(next) {
                        end = j + next.len_utf8();
                        iter.next();
                    } else {
                        break;
                    }
                }

                let at_boundary = match iter.peek() {
                    None => true,
                    Some(&(_, next)) => next.is_whitespace(),
                };
                if at_boundary {
                    push_trimmed(text, start, end, &mut cursor, &mut sentences);
                    start = end;
                    last_visible = None;
                }
            }
        }
        push_trimmed(text, start, text.len(), &mut cursor, &mut sentences);

        Ok(sentences)
    }

    fn name(&self) -> &'static str {
        "hangul"
    }
}

/// 언어별 분할기 선택
pub fn segmenter_for(language: Language) -> Box<dyn SentenceSegmenter> {
    match language {
        Language::Korean => Box::new(HangulSegmenter),
        Language::English | Language::Unknown => Box::new(RegexSegmenter),
    }
}

/// 언어에 맞게 문장 분할 (언어 미지정 시 자동 감지)
///
/// `MAX_SENTENCE_LENGTH`를 넘는 문장은 추가로 나눕니다.
pub fn split_into_sentences(text: &str, language: Option<Language>) -> Result<Vec<Sentence>> {
    if text.trim().is_empty() {
        return Ok(vec![]);
    }

    let language = language.unwrap_or_else(|| detect_language(text));
    tracing::debug!("Splitting sentences (language={})", language);

    let sentences = segmenter_for(language).split(text)?;
    Ok(sentences
        .into_iter()
        .flat_map(|s| split_long_sentence(s, MAX_SENTENCE_LENGTH))
        .collect())
}

/// 긴 문장을 자연스러운 경계에서 분할
///
/// 우선 `,`/`;` 뒤에서, 그래도 길면 공백에서, 단어 하나가 너무 길면 강제로 자릅니다.
pub fn split_long_sentence(sentence: Sentence, max_len: usize) -> Vec<Sentence> {
    if sentence.char_len() <= max_len || max_len == 0 {
        return vec![sentence];
    }

    let chars: Vec<char> = sentence.text.chars().collect();

    // 1. 쉼표/세미콜론 단위 (구분자는 앞 조각에 포함)
    let mut clauses = Vec::new();
    let mut clause_start = 0;
    for (i, &c) in chars.iter().enumerate() {
        if c == ',' || c == ';' {
            clauses.push((clause_start, i + 1));
            clause_start = i + 1;
        }
    }
    if clause_start < chars.len() {
        clauses.push((clause_start, chars.len()));
    }

    // 2. 너무 긴 조각은 단어 단위, 너무 긴 단어는 max_len 단위
    let mut atoms = Vec::new();
    for (s, e) in clauses {
        if e - s <= max_len {
            atoms.push((s, e));
            continue;
        }
        let mut word_start = s;
        for i in s..e {
            if chars[i].is_whitespace() && i + 1 > word_start {
                push_bounded(&mut atoms, word_start, i + 1, max_len);
                word_start = i + 1;
            }
        }
        if word_start < e {
            push_bounded(&mut atoms, word_start, e, max_len);
        }
    }

    // 3. 인접 조각을 max_len 이하로 묶기
    let mut packed: Vec<(usize, usize)> = Vec::new();
    for (s, e) in atoms {
        match packed.last_mut() {
            Some(last) if e - last.0 <= max_len => last.1 = e,
            _ => packed.push((s, e)),
        }
    }

    let parts: Vec<Sentence> = packed
        .into_iter()
        .filter_map(|(s, e)| {
            let mut s = s;
            let mut e = e;
            while s < e && chars[s].is_whitespace() {
                s += 1;
            }
            while e > s && chars[e - 1].is_whitespace() {
                e -= 1;
            }
            (s < e).then(|| Sentence {
                text: chars[s..e].iter().collect(),
                start: sentence.start + s,
                end: sentence.start + e,
            })
        })
        .collect();

    if parts.is_empty() {
        vec![sentence]
    } else {
        parts
    }
}

fn push_bounded(atoms: &mut Vec<(usize, usize)>, start: usize, end: usize, max_len: usize) {
    let mut s = start;
    while end - s > max_len {
        atoms.push((s, s + max_len));
        s += max_len;
    }
    if s < end {
        atoms.push((s, end));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language("안녕하세요 반갑습니다"), Language::Korean);
        assert_eq!(detect_language("Hello world"), Language::English);
        assert_eq!(detect_language("1234 !!!"), Language::Unknown);
        assert_eq!(detect_language(""), Language::Unknown);
        assert_eq!(Language::Korean.code(), "ko");
    }

    #[test]
    fn test_normalize_text() {
        let raw = "  Hello\t world  \n\n\n\nNext   line \r\n";
        assert_eq!(normalize_text(raw), "Hello world\n\nNext line");
    }

    #[test]
    fn test_split_sentences_english() {
        let text = "Hello world. This is a test. How are you?";
        let sentences = split_into_sentences(text, Some(Language::English)).unwrap();

        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[0].text, "Hello world.");
        assert_eq!(sentences[1].text, "This is a test.");
        assert_eq!(sentences[2].text, "How are you?");
    }

    #[test]
    fn test_sentence_offsets_point_into_source() {
        let text = "첫 문장입니다. 둘째 문장입니다.";
        let sentences = split_into_sentences(text, None).unwrap();
        let chars: Vec<char> = text.chars().collect();

        for s in &sentences {
            let slice: String = chars[s.start..s.end].iter().collect();
            assert_eq!(slice, s.text);
        }
    }

    #[test]
    fn test_split_sentences_korean() {
        let text = "안녕하세요. 저는 개발자입니다. 파이썬을 좋아합니다.";
        let sentences = split_into_sentences(text, Some(Language::Korean)).unwrap();

        assert_eq!(sentences.len(), 3);
        assert!(sentences[0].text.contains("안녕하세요"));
    }

    #[test]
    fn test_split_korean_line_endings() {
        let text = "오늘은 날씨가 좋다\n내일은 비가 온다";
        let sentences = HangulSegmenter.split(text).unwrap();
        assert_eq!(sentences.len(), 2);
    }

    #[test]
    fn test_split_long_sentence() {
        let text = format!("{}, {}", "a".repeat(30), "b".repeat(30));
        let sentence = Sentence {
            start: 10,
            end: 10 + text.chars().count(),
            text,
        };

        let parts = split_long_sentence(sentence, 40);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.char_len() <= 40));
        assert_eq!(parts[0].start, 10);
        assert!(parts[0].text.ends_with(','));
    }

    #[test]
    fn test_split_long_word_hard_cut() {
        let sentence = Sentence {
            text: "x".repeat(25),
            start: 0,
            end: 25,
        };
        let parts = split_long_sentence(sentence, 10);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].char_len(), 5);
    }
}
