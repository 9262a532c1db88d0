//! Labeling task registry.
//!
//! The set of tasks is closed: each variant carries its output column, the
//! label columns it needs from earlier tasks, and the parser applied to the
//! generation service's reply. `Task::ALL` is the execution order.

use std::fmt;
use std::str::FromStr;

mod prompt;

pub use prompt::{PromptError, PromptLibrary, PromptRow, PromptTemplate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {
    Distinctiveness,
    Redaction,
    PlotHint,
    SnippetSelection,
    SnippetGrading,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("unknown task '{name}'. Available: {available}")]
    UnknownTask { name: String, available: String },
}

impl Task {
    pub const ALL: [Task; 5] = [
        Task::Distinctiveness,
        Task::Redaction,
        Task::PlotHint,
        Task::SnippetSelection,
        Task::SnippetGrading,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Task::Distinctiveness => "distinctiveness",
            Task::Redaction => "redaction",
            Task::PlotHint => "plot_hint",
            Task::SnippetSelection => "snippet_selection",
            Task::SnippetGrading => "snippet_grading",
        }
    }

    /// Zero-based slot in `Task::ALL`.
    pub fn position(self) -> usize {
        Task::ALL
            .iter()
            .position(|t| *t == self)
            .unwrap_or(Task::ALL.len())
    }

    pub fn output_column(self) -> &'static str {
        match self {
            Task::Redaction => "redacted_speech",
            Task::SnippetSelection => "golden_snippet",
            other => other.name(),
        }
    }

    pub fn dependencies(self) -> &'static [&'static str] {
        match self {
            Task::SnippetSelection => &["redacted_speech"],
            Task::SnippetGrading => &["golden_snippet"],
            Task::Distinctiveness | Task::Redaction | Task::PlotHint => &[],
        }
    }

    pub fn parser(self) -> ResponseParser {
        match self {
            Task::Distinctiveness | Task::SnippetGrading => ResponseParser::Score { min: 1, max: 5 },
            Task::Redaction => ResponseParser::RedactedSpeech,
            Task::PlotHint => ResponseParser::QuotedSentence,
            Task::SnippetSelection => ResponseParser::Text,
        }
    }

    pub fn parse_response(self, raw: &str) -> Option<LabelValue> {
        self.parser().parse(raw)
    }

    pub fn available() -> String {
        Task::ALL
            .iter()
            .map(|t| t.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Task {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Task::ALL
            .iter()
            .copied()
            .find(|t| t.name() == wanted)
            .ok_or_else(|| TaskError::UnknownTask {
                name: wanted.to_string(),
                available: Task::available(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseParser {
    /// A bare integer inside `min..=max`.
    Score { min: i64, max: i64 },
    /// Any non-blank text, trimmed.
    Text,
    /// Speech text carrying `[REDACT: ...]` markers. A speech with nothing to
    /// redact is still a valid answer.
    RedactedSpeech,
    /// A single sentence, with wrapping quote characters removed.
    QuotedSentence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelValue {
    Score(i64),
    Text(String),
}

impl fmt::Display for LabelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelValue::Score(v) => write!(f, "{}", v),
            LabelValue::Text(v) => f.write_str(v),
        }
    }
}

impl ResponseParser {
    /// `None` means the reply was received but holds no usable value.
    pub fn parse(&self, raw: &str) -> Option<LabelValue> {
        match *self {
            ResponseParser::Score { min, max } => {
                let text = raw.trim();
                match text.parse::<i64>() {
                    Ok(score) if (min..=max).contains(&score) => Some(LabelValue::Score(score)),
                    Ok(score) => {
                        tracing::debug!(score, min, max, "score out of range");
                        None
                    }
                    Err(_) => {
                        tracing::debug!(response = %text, "could not parse score");
                        None
                    }
                }
            }
            ResponseParser::Text | ResponseParser::RedactedSpeech => {
                non_blank(raw.trim()).map(LabelValue::Text)
            }
            ResponseParser::QuotedSentence => {
                let text = raw.trim().trim_matches('"').trim_matches('\'').trim();
                non_blank(text).map(LabelValue::Text)
            }
        }
    }
}

impl fmt::Display for ResponseParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseParser::Score { min, max } => write!(f, "score {}-{}", min, max),
            ResponseParser::Text => f.write_str("text"),
            ResponseParser::RedactedSpeech => f.write_str("redacted speech"),
            ResponseParser::QuotedSentence => f.write_str("quoted sentence"),
        }
    }
}

fn non_blank(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
