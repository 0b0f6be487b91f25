//! BM25용 토크나이저
//!
//! 한글이 포함된 텍스트는 규칙 기반 분석기로, 나머지는 소문자 + 공백 분할로 처리합니다.
//! 인덱싱과 질의에 같은 함수를 사용해야 점수가 맞습니다.
//!
//! 한국어 분석은 형태소 분석기가 아닌 근사입니다. 사전 없이 조사/어미 목록으로
//! 접미사를 떼고 기능어를 버리므로, 품사 태깅이 필요한 경우(복합명사 분해,
//! 불규칙 활용)는 처리하지 못합니다. 표면형을 함께 남겨 재현율을 보완합니다.

use super::language::is_hangul;

/// `bm25` 크레이트에 꽂는 토크나이저 ([`tokenize`]와 동일)
#[derive(Debug, Clone, Copy, Default)]
pub struct KoreanTokenizer;

impl bm25::Tokenizer for KoreanTokenizer {
    fn tokenize(&self, input_text: &str) -> Vec<String> {
        tokenize(input_text)
    }
}

/// 조사/어미 (긴 것부터 매칭)
const KOREAN_SUFFIXES: &[&str] = &[
    "에서부터", "으로부터", "이었습니다", "였습니다", "입니다", "합니다", "습니다",
    "이라고", "에게서", "한테서", "까지는", "에서는", "으로는", "에게는",
    "이다", "니다", "었다", "았다", "였다", "한다", "하다", "에서", "에게", "한테",
    "으로", "부터", "까지", "처럼", "보다", "마다", "이나", "라고", "하고", "이고",
    "은", "는", "이", "가", "을", "를", "에", "의", "도", "로", "와", "과", "만", "다", "요",
];

/// 검색에 의미 없는 기능어
const STOPWORDS: &[&str] = &[
    "그리고", "그러나", "하지만", "그래서", "또는", "또한", "및", "즉", "그", "이", "저",
    "것", "수", "등", "때", "더", "좀", "잘", "a", "an", "the",
];

/// 텍스트를 BM25 토큰으로 분리
pub fn tokenize(text: &str) -> Vec<String> {
    if text.chars().any(is_hangul) {
        tokenize_korean(text)
    } else {
        text.split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|w| !w.is_empty())
            .collect()
    }
}

/// 규칙 기반 한국어 분석
///
/// 문장부호를 제거한 어절마다 표면형과 어간(조사/어미 제거)을 모두 냅니다.
/// "사과" 질의가 "사과는"을 포함한 청크와 일치하도록 하기 위함입니다.
fn tokenize_korean(text: &str) -> Vec<String> {
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    let mut tokens = Vec::new();
    for word in cleaned.split_whitespace() {
        let surface = word.to_lowercase();

        if !surface.chars().any(is_hangul) {
            push_token(&mut tokens, surface);
            continue;
        }

        let stem = strip_suffix(&surface);
        if stem != surface {
            push_token(&mut tokens, surface.clone());
            push_token(&mut tokens, stem.to_string());
        } else {
            push_token(&mut tokens, surface);
        }
    }
    tokens
}

fn push_token(tokens: &mut Vec<String>, token: String) {
    if !token.is_empty() && !STOPWORDS.contains(&token.as_str()) {
        tokens.push(token);
    }
}

/// 가장 긴 조사/어미 하나를 제거
///
/// 한 글자 접미사는 어간이 두 글자 이상 남을 때만 제거합니다 ("사과" → "사" 방지).
fn strip_suffix(word: &str) -> &str {
    let word_len = word.chars().count();

    for suffix in KOREAN_SUFFIXES {
        let Some(stem) = word.strip_suffix(suffix) else {
            continue;
        };
        let suffix_len = suffix.chars().count();
        let min_stem = if suffix_len == 1 { 2 } else { 1 };
        if word_len - suffix_len >= min_stem {
            return stem;
        }
    }
    word
}

// ============================================================================
// Tests
// ============================================================================
