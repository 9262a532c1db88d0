use crate::config::DatasetPaths;
use anyhow::{Context, Result};
use serde::Serialize;
use speech_core::{merge_for_output, write_merged, Entity, EntityKey, EntityStore, LabelBatch, LabelStore};
use speech_gen::{GenerationError, Generator};
use speech_tasks::{PromptLibrary, Task};

#[derive(Debug, thiserror::Error)]
pub enum RelabelError {
    #[error("No speeches found matching '{film}'{}", category_suffix(.category))]
    NoMatch {
        film: String,
        category: Option<String>,
    },
    #[error(
        "Multiple speeches match '{film}':\n{}\nUse --category to narrow your search.",
        .candidates.iter().map(|c| format!("  {}", c)).collect::<Vec<_>>().join("\n")
    )]
    AmbiguousMatch {
        film: String,
        candidates: Vec<String>,
    },
    #[error("Could not parse '{task}' response: {raw:?}")]
    UnparsableResponse { task: String, raw: String },
    #[error("generation failed for task '{task}': {source}")]
    Generation {
        task: String,
        #[source]
        source: GenerationError,
    },
    #[error("task '{task}' needs the generation service (or pass an override value)")]
    GeneratorRequired { task: String },
    #[error("override value for '{task}' is blank")]
    BlankOverride { task: String },
}

fn category_suffix(category: &Option<String>) -> String {
    category
        .as_ref()
        .map(|c| format!(" with category '{}'", c))
        .unwrap_or_default()
}

impl RelabelError {
    /// Stable identifier for machine-readable output.
    pub fn code(&self) -> &'static str {
        match self {
            RelabelError::NoMatch { .. } => "no_match",
            RelabelError::AmbiguousMatch { .. } => "ambiguous_match",
            RelabelError::UnparsableResponse { .. } => "unparsable_response",
            RelabelError::Generation { .. } => "generation_failed",
            RelabelError::GeneratorRequired { .. } => "generator_required",
            RelabelError::BlankOverride { .. } => "blank_override",
        }
    }
}

/// Case-insensitive substring match on the film title, optionally narrowed
/// by a substring of the category.
#[derive(Debug, Clone)]
pub struct EntitySelector {
    pub film: String,
    pub category: Option<String>,
}

impl EntitySelector {
    pub fn new(film: impl Into<String>, category: Option<String>) -> Self {
        Self {
            film: film.into(),
            category,
        }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        let film = self.film.to_lowercase();
        if !entity.film_title.to_lowercase().contains(&film) {
            return false;
        }
        match &self.category {
            Some(category) => entity
                .category
                .to_lowercase()
                .contains(&category.to_lowercase()),
            None => true,
        }
    }

    pub fn resolve<'e>(&self, entities: &'e [Entity]) -> Result<&'e Entity, RelabelError> {
        let matches: Vec<&Entity> = entities.iter().filter(|e| self.matches(e)).collect();
        match matches.as_slice() {
            [] => Err(RelabelError::NoMatch {
                film: self.film.clone(),
                category: self.category.clone(),
            }),
            [only] => Ok(*only),
            many => Err(RelabelError::AmbiguousMatch {
                film: self.film.clone(),
                candidates: many.iter().map(|e| e.describe()).collect(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelabelRequest {
    pub selector: EntitySelector,
    pub task: Task,
    pub note: Option<String>,
    pub override_value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    Override,
    Generated,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelabelOutcome {
    pub year: i32,
    pub category: String,
    pub entity: String,
    pub task: String,
    pub column: String,
    pub old_value: Option<String>,
    pub new_value: String,
    pub source: ValueSource,
}

/// Re-runs or overrides one task's label for a single entity.
pub struct RelabelTool<'a> {
    generator: Option<&'a dyn Generator>,
    prompts: PromptLibrary,
    paths: DatasetPaths,
}

impl<'a> RelabelTool<'a> {
    pub fn new(prompts: PromptLibrary, paths: DatasetPaths) -> Self {
        Self {
            generator: None,
            prompts,
            paths,
        }
    }

    pub fn with_generator(mut self, generator: &'a dyn Generator) -> Self {
        self.generator = Some(generator);
        self
    }

    /// `labels` and the files on disk are only touched once the new value is
    /// known; any error leaves both as they were.
    pub fn relabel(
        &self,
        request: &RelabelRequest,
        entities: &EntityStore,
        labels: &mut LabelStore,
    ) -> Result<RelabelOutcome> {
        let task = request.task;
        let column = task.output_column();
        if request
            .override_value
            .as_deref()
            .is_some_and(|v| v.trim().is_empty())
        {
            return Err(RelabelError::BlankOverride {
                task: task.name().to_string(),
            }
            .into());
        }
        let entity = request.selector.resolve(entities.entities())?;
        let key = entity.key();
        tracing::info!(entity = %entity.describe(), task = %task, "matched entity");

        let mut working = labels.clone();
        let old_value = working.get(&key, column).map(str::to_string);
        tracing::info!(column, old = ?old_value, "current label");
        working.clear(&key, column);

        let (new_value, source) = match &request.override_value {
            Some(value) => {
                tracing::info!(task = %task, "using manual override");
                (value.clone(), ValueSource::Override)
            }
            None => (
                self.generate(task, entity, &key, &working, request.note.as_deref())?,
                ValueSource::Generated,
            ),
        };

        let mut batch = LabelBatch::new(column);
        batch.push(key.clone(), new_value.clone());
        working.merge(&batch);
        working.save(&self.paths.labels)?;
        *labels = working;

        let merged = merge_for_output(entities.entities(), labels);
        write_merged(&self.paths.merged, &merged)?;

        Ok(RelabelOutcome {
            year: key.year,
            category: key.category,
            entity: entity.describe(),
            task: task.name().to_string(),
            column: column.to_string(),
            old_value,
            new_value,
            source,
        })
    }

    fn generate(
        &self,
        task: Task,
        entity: &Entity,
        key: &EntityKey,
        labels: &LabelStore,
        note: Option<&str>,
    ) -> Result<String> {
        let generator = self.generator.ok_or_else(|| RelabelError::GeneratorRequired {
            task: task.name().to_string(),
        })?;
        let mut row = entity.fields();
        for dep in task.dependencies() {
            if let Some(value) = labels.get(key, dep) {
                row.insert(dep.to_string(), value.to_string());
            }
        }
        let mut prompt = self
            .prompts
            .render(task, &row)
            .with_context(|| format!("failed to build '{}' prompt for {}", task, key))?;
        if let Some(note) = note.filter(|n| !n.trim().is_empty()) {
            prompt.push_str("\n\nNote from reviewer: ");
            prompt.push_str(note.trim());
        }

        tracing::info!(task = %task, "calling generation service");
        let raw = generator
            .generate(&prompt)
            .map_err(|source| RelabelError::Generation {
                task: task.name().to_string(),
                source,
            })?;
        match task.parse_response(&raw) {
            Some(value) => Ok(value.to_string()),
            None => Err(RelabelError::UnparsableResponse {
                task: task.name().to_string(),
                raw,
            }
            .into()),
        }
    }
}
