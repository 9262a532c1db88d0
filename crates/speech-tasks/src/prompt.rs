use crate::Task;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Field values a template may reference: entity columns plus any
/// dependency labels merged onto the row.
pub type PromptRow = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("prompt template not found for task '{task}': {}", .path.display())]
    TemplateNotFound { task: String, path: PathBuf },
    #[error("failed to read prompt template {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("prompt template for '{task}' is malformed at byte {offset}: {reason}")]
    MalformedTemplate {
        task: String,
        offset: usize,
        reason: String,
    },
    #[error("prompt template for '{task}' references missing field(s): {}", .fields.join(", "))]
    MissingPlaceholder { task: String, fields: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A parsed template. `{name}` is a placeholder, `{{` and `}}` are literal
/// braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    task: String,
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn parse(task: &str, text: &str) -> Result<Self, PromptError> {
        let malformed = |offset: usize, reason: &str| PromptError::MalformedTemplate {
            task: task.to_string(),
            offset,
            reason: reason.to_string(),
        };
        let bytes = text.as_bytes();
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut i = 0;
        let mut run_start = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'{' if bytes.get(i + 1) == Some(&b'{') => {
                    literal.push_str(&text[run_start..i]);
                    literal.push('{');
                    i += 2;
                    run_start = i;
                }
                b'}' if bytes.get(i + 1) == Some(&b'}') => {
                    literal.push_str(&text[run_start..i]);
                    literal.push('}');
                    i += 2;
                    run_start = i;
                }
                b'{' => {
                    literal.push_str(&text[run_start..i]);
                    let close = text[i + 1..]
                        .find('}')
                        .map(|rel| i + 1 + rel)
                        .ok_or_else(|| malformed(i, "unclosed '{'"))?;
                    let name = text[i + 1..close].trim();
                    if name.is_empty() {
                        return Err(malformed(i, "empty placeholder"));
                    }
                    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                        return Err(malformed(i, &format!("invalid placeholder name '{}'", name)));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(name.to_string()));
                    i = close + 1;
                    run_start = i;
                }
                b'}' => return Err(malformed(i, "unmatched '}'")),
                _ => i += 1,
            }
        }
        literal.push_str(&text[run_start..]);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self {
            task: task.to_string(),
            segments,
        })
    }

    /// Distinct placeholder names, sorted.
    pub fn fields(&self) -> BTreeSet<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Field(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Fails with `MissingPlaceholder` when the template references a field
    /// outside `available`. Lets a caller reject a template before any row is
    /// rendered.
    pub fn check_fields<'f>(
        &self,
        available: impl IntoIterator<Item = &'f str>,
    ) -> Result<(), PromptError> {
        let available: BTreeSet<&str> = available.into_iter().collect();
        let unknown: Vec<String> = self
            .fields()
            .into_iter()
            .filter(|f| !available.contains(f))
            .map(str::to_string)
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(PromptError::MissingPlaceholder {
                task: self.task.clone(),
                fields: unknown,
            })
        }
    }

    /// Every referenced field is checked before anything is substituted.
    pub fn render(&self, row: &PromptRow) -> Result<String, PromptError> {
        let missing: Vec<String> = self
            .fields()
            .into_iter()
            .filter(|f| !row.contains_key(*f))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(PromptError::MissingPlaceholder {
                task: self.task.clone(),
                fields: missing,
            });
        }
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) => out.push_str(&row[name]),
            }
        }
        Ok(out)
    }
}

/// Directory of `<task>.md` templates. Templates are read on every call so
/// edits between runs are picked up.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    dir: PathBuf,
}

impl PromptLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn template_path(&self, task: Task) -> PathBuf {
        self.dir.join(format!("{}.md", task.name()))
    }

    pub fn load(&self, task: Task) -> Result<PromptTemplate, PromptError> {
        let path = self.template_path(task);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PromptError::TemplateNotFound {
                    task: task.name().to_string(),
                    path,
                })
            }
            Err(source) => return Err(PromptError::Io { path, source }),
        };
        PromptTemplate::parse(task.name(), &text)
    }

    pub fn render(&self, task: Task, row: &PromptRow) -> Result<String, PromptError> {
        self.load(task)?.render(row)
    }

    pub fn missing_templates(&self) -> Vec<Task> {
        Task::ALL
            .iter()
            .copied()
            .filter(|t| !self.template_path(*t).is_file())
            .collect()
    }
}
