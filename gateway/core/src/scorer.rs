//! Response Quality Scoring
//!
//! A pure, deterministic heuristic mapping response text to a quality score
//! in `[0, 1]`. Used by the router to pick a winner among fan-out answers.
//!
//! | Component  | Max  | Signals                                              |
//! |------------|------|------------------------------------------------------|
//! | length     | 0.30 | character count, saturating at 1000                  |
//! | code       | 0.25 | fence present, fences closed, code keywords          |
//! | content    | 0.25 | explanatory phrases, sentences, technical vocabulary |
//! | formatting | 0.20 | line breaks, headings, no runs of blank lines        |
//!
//! Any error marker ("error", "sorry", "failed", ...) scores exactly zero.
//! Every signal is a saturating count, so appending plain prose never lowers
//! a score.

#![allow(clippy::cast_precision_loss)]

const ERROR_MARKERS: &[&str] = &[
    "error",
    "exception",
    "sorry",
    "can't help",
    "cannot help",
    "failed",
];

const EXPLANATORY_MARKERS: &[&str] = &[
    "because",
    "for example",
    "therefore",
    "this means",
    "in other words",
    "such as",
    "e.g.",
    "note that",
];

const CODE_KEYWORDS: &[&str] = &[
    "fn ",
    "def ",
    "function",
    "class ",
    "return",
    "import ",
    "let ",
    "const ",
];

const TECHNICAL_TERMS: &[&str] = &[
    "algorithm",
    "function",
    "variable",
    "parameter",
    "interface",
    "implementation",
    "performance",
    "memory",
    "thread",
    "example",
    "type",
    "module",
];

const LENGTH_WEIGHT: f64 = 0.3;
const LENGTH_SATURATION: f64 = 1000.0;

const FENCE_WEIGHT: f64 = 0.1;
const CLOSED_FENCE_WEIGHT: f64 = 0.1;
const KEYWORD_WEIGHT: f64 = 0.05;

const EXPLANATORY_WEIGHT: f64 = 0.1;
const SENTENCE_WEIGHT: f64 = 0.08;
const TECHNICAL_WEIGHT: f64 = 0.07;

const NEWLINE_WEIGHT: f64 = 0.08;
const HEADING_WEIGHT: f64 = 0.07;
const NO_BLANK_RUN_WEIGHT: f64 = 0.05;

/// Per-component scores for one response
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ScoreBreakdown {
    /// Length component (0 to 0.3)
    pub length: f64,
    /// Code component (0 to 0.25)
    pub code: f64,
    /// Content component (0 to 0.25)
    pub content: f64,
    /// Formatting component (0 to 0.2)
    pub formatting: f64,
}

impl ScoreBreakdown {
    /// Score every component of `text`
    #[must_use]
    pub fn of(text: &str) -> Self {
        if text.trim().is_empty() {
            return Self::default();
        }
        let lower = text.to_lowercase();
        if ERROR_MARKERS.iter().any(|marker| lower.contains(marker)) {
            return Self::default();
        }

        Self {
            length: length_score(text),
            code: code_score(text, &lower),
            content: content_score(text, &lower),
            formatting: formatting_score(text),
        }
    }

    /// Sum of components, clamped to `[0, 1]`
    #[must_use]
    pub fn total(&self) -> f64 {
        (self.length + self.code + self.content + self.formatting).clamp(0.0, 1.0)
    }
}

/// Quality score in `[0, 1]`
#[must_use]
pub fn score_response(text: &str) -> f64 {
    ScoreBreakdown::of(text).total()
}

fn saturating(count: usize, saturation: usize, weight: f64) -> f64 {
    weight * (count.min(saturation) as f64 / saturation as f64)
}

fn count_occurrences(haystack: &str, needles: &[&str]) -> usize {
    needles
        .iter()
        .map(|needle| haystack.matches(needle).count())
        .sum()
}

fn length_score(text: &str) -> f64 {
    let chars = text.chars().count() as f64;
    LENGTH_WEIGHT * (chars / LENGTH_SATURATION).min(1.0)
}

fn code_score(text: &str, lower: &str) -> f64 {
    let fences = text.matches("```").count();
    let mut score = 0.0;
    if fences > 0 {
        score += FENCE_WEIGHT;
    }
    if fences >= 2 && fences % 2 == 0 {
        score += CLOSED_FENCE_WEIGHT;
    }
    if CODE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        score += KEYWORD_WEIGHT;
    }
    score
}

// A terminator only counts after a word character, so appending text never
// changes whether an earlier one counted.
fn sentence_count(text: &str) -> usize {
    let mut count = 0;
    let mut prev: Option<char> = None;
    for c in text.chars() {
        if matches!(c, '.' | '!' | '?')
            && prev.is_some_and(|p| p.is_alphanumeric() || matches!(p, ')' | '"' | '\''))
        {
            count += 1;
        }
        prev = Some(c);
    }
    count
}

fn content_score(text: &str, lower: &str) -> f64 {
    saturating(
        count_occurrences(lower, EXPLANATORY_MARKERS),
        3,
        EXPLANATORY_WEIGHT,
    ) + saturating(sentence_count(text), 5, SENTENCE_WEIGHT)
        + saturating(
            count_occurrences(lower, TECHNICAL_TERMS),
            5,
            TECHNICAL_WEIGHT,
        )
}

fn formatting_score(text: &str) -> f64 {
    let newlines = text.matches('\n').count();
    let headings = text
        .lines()
        .filter(|line| line.trim_start().starts_with('#'))
        .count();

    let mut score =
        saturating(newlines, 10, NEWLINE_WEIGHT) + saturating(headings, 2, HEADING_WEIGHT);
    if !text.contains("\n\n\n") {
        score += NO_BLANK_RUN_WEIGHT;
    }
    score
}
