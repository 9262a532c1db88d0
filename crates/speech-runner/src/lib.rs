use anyhow::{Context, Result};
use speech_core::{EntityStore, LabelStore};
use speech_gen::Generator;

mod config;
mod engine;
mod relabel;
mod report;

pub use config::{
    find_project_root, Dataset, DatasetPaths, ExportSettings, GenerationSettings, Project,
    ProjectConfig, CONFIG_FILE,
};
pub use engine::{LabelingEngine, RunOutcome};
pub use relabel::{
    EntitySelector, RelabelError, RelabelOutcome, RelabelRequest, RelabelTool, ValueSource,
};
pub use report::{coverage_report, ColumnCoverage, RunReport, TaskReport, TaskStatus};

fn load_inputs(paths: &DatasetPaths) -> Result<(EntityStore, LabelStore)> {
    let entities = EntityStore::load(&paths.speeches)
        .with_context(|| format!("failed to load speeches from {}", paths.speeches.display()))?;
    let labels = LabelStore::load(&paths.labels)
        .with_context(|| format!("failed to load labels from {}", paths.labels.display()))?;
    Ok((entities, labels))
}

/// Runs every task over the dataset, resuming from whatever labels are
/// already on disk.
pub fn run_labeling(
    project: &Project,
    dataset: Dataset,
    generator: &dyn Generator,
) -> Result<RunOutcome> {
    let paths = project.dataset_paths(dataset);
    tracing::info!(dataset = dataset.as_str(), speeches = %paths.speeches.display(), "loading dataset");
    let (entities, labels) = load_inputs(&paths)?;
    tracing::info!(
        entities = entities.len(),
        labeled_rows = labels.len(),
        "inputs loaded"
    );
    LabelingEngine::new(generator, project.prompts(), &paths)
        .with_delay(project.request_delay())
        .run(&entities, labels)
}

pub fn run_relabel(
    project: &Project,
    dataset: Dataset,
    request: &RelabelRequest,
    generator: Option<&dyn Generator>,
) -> Result<RelabelOutcome> {
    let paths = project.dataset_paths(dataset);
    let (entities, mut labels) = load_inputs(&paths)?;
    let mut tool = RelabelTool::new(project.prompts(), paths);
    if let Some(generator) = generator {
        tool = tool.with_generator(generator);
    }
    tool.relabel(request, &entities, &mut labels)
}

pub fn coverage(project: &Project, dataset: Dataset) -> Result<Vec<ColumnCoverage>> {
    let paths = project.dataset_paths(dataset);
    let (entities, labels) = load_inputs(&paths)?;
    Ok(coverage_report(entities.entities(), &labels))
}

#[cfg(test)]
pub(crate) mod testutil {
    use chrono::Utc;
    use speech_core::Entity;
    use speech_gen::{GenerationError, Generator};
    use speech_tasks::{PromptLibrary, Task};
    use std::cell::RefCell;
    use std::fs;
    use std::path::{Path, PathBuf};

    pub fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "speech_runner_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    pub fn entity(year: i32, category: &str, film: &str) -> Entity {
        Entity {
            year,
            ceremony: Some((year - 1928) as u32),
            category: category.to_string(),
            film_title: film.to_string(),
            winner_raw: format!("{} winner (producer)", film),
            winner_clean: format!("{} winner", film),
            speech_clean: format!("Thank you to everyone who made {} possible.", film),
        }
    }

    pub fn write_prompts(root: &Path) -> PromptLibrary {
        let lib = PromptLibrary::new(root.join("prompts"));
        fs::create_dir_all(lib.dir()).expect("prompts dir");
        for task in Task::ALL {
            let text = match task {
                Task::Distinctiveness => {
                    "Distinctiveness of {film_title} ({year}, {category}):\n{speech_clean}"
                }
                Task::Redaction => "Redact names in {film_title}:\n{speech_clean}",
                Task::PlotHint => "Plot hint for {film_title}",
                Task::SnippetSelection => "Select a snippet for {film_title} from:\n{redacted_speech}",
                Task::SnippetGrading => "Grade: {golden_snippet}",
            };
            fs::write(lib.template_path(task), text).expect("write template");
        }
        lib
    }

    /// Replays canned responses in order, repeating the last one once the
    /// script runs out. `Err(())` stands in for a service failure.
    pub struct Scripted {
        responses: Vec<Result<&'static str, ()>>,
        seen: RefCell<Vec<String>>,
    }

    impl Scripted {
        pub fn new(responses: Vec<Result<&'static str, ()>>) -> Self {
            assert!(!responses.is_empty(), "script needs at least one response");
            Self {
                responses,
                seen: RefCell::new(Vec::new()),
            }
        }

        pub fn prompts(&self) -> Vec<String> {
            self.seen.borrow().clone()
        }
    }

    impl Generator for Scripted {
        fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
            let mut seen = self.seen.borrow_mut();
            let idx = seen.len().min(self.responses.len() - 1);
            seen.push(prompt.to_string());
            match self.responses[idx] {
                Ok(text) => Ok(text.to_string()),
                Err(()) => Err(GenerationError::Status {
                    status: 503,
                    body: "service unavailable".to_string(),
                }),
            }
        }
    }
}
