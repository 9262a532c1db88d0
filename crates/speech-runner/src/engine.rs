use crate::config::DatasetPaths;
use crate::report::{ColumnCoverage, RunReport, TaskReport, TaskStatus};
use anyhow::{Context, Result};
use chrono::Utc;
use speech_core::{
    find_unlabeled, merge_for_output, preview, write_merged, Entity, EntityStore, LabelBatch,
    LabelStore, MergedTable, ENTITY_COLUMNS,
};
use speech_gen::Generator;
use speech_tasks::{PromptLibrary, Task};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

/// Keeps at least `delay` between the end of one service call and the start
/// of the next.
struct Throttle {
    delay: Duration,
    last_call: Option<Instant>,
}

impl Throttle {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_call: None,
        }
    }

    fn wait(&self) {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                thread::sleep(self.delay - elapsed);
            }
        }
    }

    fn mark(&mut self) {
        self.last_call = Some(Instant::now());
    }
}

pub struct RunOutcome {
    pub report: RunReport,
    pub labels: LabelStore,
    pub merged: MergedTable,
}

/// Drives every task in registry order over the entity table, persisting the
/// label store after each task's batch.
pub struct LabelingEngine<'a, G: Generator + ?Sized> {
    generator: &'a G,
    prompts: PromptLibrary,
    labels_path: PathBuf,
    merged_path: PathBuf,
    delay: Duration,
}

impl<'a, G: Generator + ?Sized> LabelingEngine<'a, G> {
    pub fn new(generator: &'a G, prompts: PromptLibrary, paths: &DatasetPaths) -> Self {
        Self {
            generator,
            prompts,
            labels_path: paths.labels.clone(),
            merged_path: paths.merged.clone(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn run(&self, entities: &EntityStore, labels: LabelStore) -> Result<RunOutcome> {
        let started_at = Utc::now();
        let run_id = format!("run_{}", started_at.format("%Y%m%d_%H%M%S"));
        tracing::info!(%run_id, entities = entities.len(), "labeling run started");

        let mut labels = labels;
        let mut throttle = Throttle::new(self.delay);
        let mut tasks = Vec::with_capacity(Task::ALL.len());
        for task in Task::ALL {
            let report = self.run_task(task, entities.entities(), &mut labels, &mut throttle)?;
            tracing::info!(
                task = %task,
                column = task.output_column(),
                coverage = report.coverage.labeled,
                total = report.coverage.total,
                "task finished"
            );
            tasks.push(report);
        }

        let merged = merge_for_output(entities.entities(), &labels);
        write_merged(&self.merged_path, &merged)?;

        Ok(RunOutcome {
            report: RunReport {
                run_id,
                started_at,
                finished_at: Utc::now(),
                entities: entities.len(),
                tasks,
            },
            labels,
            merged,
        })
    }

    fn run_task(
        &self,
        task: Task,
        entities: &[Entity],
        labels: &mut LabelStore,
        throttle: &mut Throttle,
    ) -> Result<TaskReport> {
        let column = task.output_column();
        let missing: Vec<String> = task
            .dependencies()
            .iter()
            .filter(|dep| !labels.has_column(dep))
            .map(|dep| dep.to_string())
            .collect();
        if !missing.is_empty() {
            tracing::warn!(task = %task, ?missing, "skipping task: missing dependency columns");
            return Ok(TaskReport::new(
                TaskStatus::SkippedMissingDependencies { missing },
                ColumnCoverage::compute(task, entities, labels),
            ));
        }

        let unlabeled = find_unlabeled(entities, labels, column);
        if unlabeled.is_empty() {
            tracing::info!(task = %task, "all rows already labeled");
            return Ok(TaskReport::new(
                TaskStatus::Complete,
                ColumnCoverage::compute(task, entities, labels),
            ));
        }
        tracing::info!(
            task = %task,
            unlabeled = unlabeled.len(),
            total = entities.len(),
            "rows needing labels"
        );
        // a template asking for a field no row can supply fails before any service call
        self.prompts
            .load(task)
            .and_then(|tpl| {
                tpl.check_fields(ENTITY_COLUMNS.iter().chain(task.dependencies()).copied())
            })
            .with_context(|| format!("prompt template for '{}' cannot be used", task))?;

        let mut report = TaskReport::new(
            TaskStatus::Ran,
            ColumnCoverage::compute(task, entities, labels),
        );
        let mut batch = LabelBatch::new(column);
        let total = unlabeled.len();
        for (idx, entity) in unlabeled.iter().enumerate() {
            let key = entity.key();
            let mut row = entity.fields();
            let mut pending = Vec::new();
            for dep in task.dependencies() {
                match labels.get(&key, dep) {
                    Some(value) => {
                        row.insert(dep.to_string(), value.to_string());
                    }
                    None => pending.push(*dep),
                }
            }
            if !pending.is_empty() {
                report.dependency_pending += 1;
                tracing::warn!(task = %task, %key, ?pending, "dependency value not ready; row left for a later run");
                continue;
            }

            let prompt = self
                .prompts
                .render(task, &row)
                .with_context(|| format!("failed to build '{}' prompt for {}", task, key))?;
            tracing::info!(
                task = %task,
                progress = %format!("{}/{}", idx + 1, total),
                %key,
                winner = %preview(&entity.winner_clean, 30),
                "labeling"
            );
            report.attempted += 1;
            throttle.wait();
            let result = self.generator.generate(&prompt);
            throttle.mark();
            match result {
                Ok(raw) => match task.parse_response(&raw) {
                    Some(value) => {
                        batch.push(key, value.to_string());
                        report.newly_labeled += 1;
                    }
                    None => {
                        report.parse_failures += 1;
                        tracing::warn!(
                            task = %task,
                            %key,
                            response = %preview(&raw, 80),
                            "unparsable response; row left for next run"
                        );
                    }
                },
                Err(err) => {
                    report.service_failures += 1;
                    tracing::warn!(
                        task = %task,
                        %key,
                        error = %err,
                        timeout = err.is_timeout(),
                        prompt = %preview(&prompt, 80),
                        "generation failed; row skipped"
                    );
                }
            }
        }

        tracing::info!(
            task = %task,
            labeled = batch.len(),
            attempted = report.attempted,
            "batch complete"
        );
        if batch.is_empty() {
            tracing::info!(task = %task, "no new labels to save");
        } else {
            labels.merge(&batch);
            labels.save(&self.labels_path)?;
        }
        report.coverage = ColumnCoverage::compute(task, entities, labels);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{entity, temp_dir, write_prompts, Scripted};
    use speech_core::{read_merged, EntityKey};
    use std::fs;

    fn setup(tag: &str) -> (PathBuf, PromptLibrary, DatasetPaths) {
        let root = temp_dir(tag);
        let prompts = write_prompts(&root);
        let paths = DatasetPaths {
            speeches: root.join("data").join("test_speeches.csv"),
            labels: root.join("data").join("test_labels.csv"),
            merged: root.join("data").join("test_speeches_with_labels.csv"),
        };
        (root, prompts, paths)
    }

    fn two_entities() -> EntityStore {
        EntityStore::from_entities(
            vec![
                entity(2020, "Directing", "Parasite"),
                entity(2020, "Actor in a Leading Role", "Joker"),
            ],
            "memory",
        )
        .expect("entities")
    }

    #[test]
    fn failed_rows_are_not_recorded_and_successes_persist() {
        let (root, prompts, paths) = setup("engine_scenario");
        // distinctiveness: row 1 scores 4, row 2 fails; every later task fails too
        let generator = Scripted::new(vec![Ok("4"), Err(())]);
        let engine = LabelingEngine::new(&generator, prompts, &paths);
        let outcome = engine.run(&two_entities(), LabelStore::new()).expect("run");

        let stored = LabelStore::load(&paths.labels).expect("load persisted");
        assert_eq!(stored.len(), 1);
        assert_eq!(
            stored.get(&EntityKey::new(2020, "Directing"), "distinctiveness"),
            Some("4")
        );
        assert_eq!(
            stored.get(&EntityKey::new(2020, "Actor in a Leading Role"), "distinctiveness"),
            None
        );
        assert_eq!(stored.columns(), &["distinctiveness"]);

        let distinct = outcome.report.task(Task::Distinctiveness).expect("report");
        assert_eq!(distinct.newly_labeled, 1);
        assert_eq!(distinct.service_failures, 1);
        let selection = outcome.report.task(Task::SnippetSelection).expect("report");
        assert_eq!(
            selection.status,
            TaskStatus::SkippedMissingDependencies {
                missing: vec!["redacted_speech".to_string()]
            }
        );

        let merged = read_merged(&paths.merged).expect("merged");
        assert_eq!(merged.rows.len(), 2);
        assert_eq!(merged.label_columns, vec!["distinctiveness"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn rerun_only_submits_unlabeled_rows_and_coverage_never_drops() {
        let (root, prompts, paths) = setup("engine_resume");
        let entities = two_entities();

        let first = Scripted::new(vec![Ok("4"), Ok("seven"), Err(())]);
        let engine = LabelingEngine::new(&first, prompts.clone(), &paths);
        let run1 = engine.run(&entities, LabelStore::new()).expect("run 1");
        let coverage1: Vec<usize> = run1.report.tasks.iter().map(|t| t.coverage.labeled).collect();
        assert_eq!(run1.report.task(Task::Distinctiveness).map(|t| t.parse_failures), Some(1));

        // second run sees everything failing; nothing previously stored may change
        let second = Scripted::new(vec![Err(())]);
        let engine = LabelingEngine::new(&second, prompts, &paths);
        let persisted = LabelStore::load(&paths.labels).expect("load");
        let run2 = engine.run(&entities, persisted.clone()).expect("run 2");
        let coverage2: Vec<usize> = run2.report.tasks.iter().map(|t| t.coverage.labeled).collect();
        for (a, b) in coverage1.iter().zip(&coverage2) {
            assert!(b >= a, "coverage dropped: {:?} -> {:?}", coverage1, coverage2);
        }
        assert_eq!(run2.labels, persisted);
        assert!(
            second
                .prompts()
                .iter()
                .all(|p| !p.contains("Distinctiveness of Parasite")),
            "labeled row was resubmitted"
        );
        assert!(second
            .prompts()
            .iter()
            .any(|p| p.contains("Distinctiveness of Joker")));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn dependent_tasks_receive_earlier_outputs() {
        let (root, prompts, paths) = setup("engine_deps");
        let entities = EntityStore::from_entities(
            vec![entity(2004, "Best Picture", "The Return of the King")],
            "memory",
        )
        .expect("entities");
        let generator = Scripted::new(vec![
            Ok("5"),
            Ok("We thank [REDACT: Peter] and everyone in [REDACT: New Zealand]."),
            Ok("\"A small creature carries a burden across a continent.\""),
            Ok("We thank [REDACT: Peter]."),
            Ok("3"),
        ]);
        let engine = LabelingEngine::new(&generator, prompts, &paths);
        let outcome = engine.run(&entities, LabelStore::new()).expect("run");

        let prompts_seen = generator.prompts();
        assert_eq!(prompts_seen.len(), 5);
        assert!(prompts_seen[3].contains("[REDACT: New Zealand]"), "{}", prompts_seen[3]);
        assert!(prompts_seen[4].contains("Grade: We thank [REDACT: Peter]."), "{}", prompts_seen[4]);

        let key = EntityKey::new(2004, "Best Picture");
        assert_eq!(
            outcome.labels.get(&key, "plot_hint"),
            Some("A small creature carries a burden across a continent.")
        );
        assert_eq!(outcome.labels.get(&key, "snippet_grading"), Some("3"));
        assert_eq!(outcome.merged.rows[0].label("golden_snippet"), Some("We thank [REDACT: Peter]."));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn rows_missing_a_dependency_value_wait_for_a_later_run() {
        let (root, prompts, paths) = setup("engine_pending");
        let entities = two_entities();
        let mut labels = LabelStore::new();
        for key in [
            EntityKey::new(2020, "Directing"),
            EntityKey::new(2020, "Actor in a Leading Role"),
        ] {
            labels.set(key.clone(), "distinctiveness", "3");
            labels.set(key.clone(), "plot_hint", "hint");
        }
        labels.set(EntityKey::new(2020, "Directing"), "redacted_speech", "I thank [REDACT: Bong].");

        let generator = Scripted::new(vec![Err(()), Ok("I thank [REDACT: Bong]."), Err(())]);
        let engine = LabelingEngine::new(&generator, prompts, &paths);
        let outcome = engine.run(&entities, labels).expect("run");
        let selection = outcome.report.task(Task::SnippetSelection).expect("selection");
        assert_eq!(selection.dependency_pending, 1);
        assert_eq!(selection.newly_labeled, 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_template_is_fatal_but_keeps_earlier_batches() {
        let (root, prompts, paths) = setup("engine_missing_tpl");
        fs::remove_file(prompts.template_path(Task::Redaction)).expect("remove");
        let generator = Scripted::new(vec![Ok("2")]);
        let engine = LabelingEngine::new(&generator, prompts, &paths);
        let err = match engine.run(&two_entities(), LabelStore::new()) {
            Ok(_) => panic!("run should fail without a redaction template"),
            Err(err) => err,
        };
        assert!(format!("{:#}", err).contains("prompt template not found"), "{:#}", err);
        let stored = LabelStore::load(&paths.labels).expect("load");
        assert_eq!(stored.len(), 2);
        assert!(!stored.has_column("redacted_speech"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unknown_template_field_fails_before_any_service_call() {
        let (root, prompts, paths) = setup("engine_unknown_field");
        fs::write(
            prompts.template_path(Task::Distinctiveness),
            "Ceremony {ceremony}: {speech_clean} ({nominee_count} nominees)",
        )
        .expect("rewrite template");
        let generator = Scripted::new(vec![Ok("4")]);
        let engine = LabelingEngine::new(&generator, prompts, &paths);
        let err = match engine.run(&two_entities(), LabelStore::new()) {
            Ok(_) => panic!("template references a field no entity has"),
            Err(err) => err,
        };
        assert!(format!("{:#}", err).contains("nominee_count"), "{:#}", err);
        assert!(generator.prompts().is_empty());
        assert!(!paths.labels.exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn unknown_ceremony_renders_blank_for_every_row() {
        let (root, prompts, paths) = setup("engine_ceremony");
        fs::write(
            prompts.template_path(Task::Distinctiveness),
            "Ceremony [{ceremony}] {film_title}",
        )
        .expect("rewrite template");
        let mut undated = entity(2021, "Directing", "Nomadland");
        undated.ceremony = None;
        let entities = EntityStore::from_entities(
            vec![entity(2020, "Directing", "Parasite"), undated],
            "memory",
        )
        .expect("entities");
        let generator = Scripted::new(vec![Ok("3")]);
        let engine = LabelingEngine::new(&generator, prompts, &paths);
        let outcome = engine.run(&entities, LabelStore::new()).expect("run");
        let seen = generator.prompts();
        assert_eq!(seen[0], "Ceremony [92] Parasite");
        assert_eq!(seen[1], "Ceremony [] Nomadland");
        assert_eq!(
            outcome.report.task(Task::Distinctiveness).map(|t| t.newly_labeled),
            Some(2)
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn throttle_spaces_consecutive_calls() {
        let mut throttle = Throttle::new(Duration::from_millis(30));
        let start = Instant::now();
        throttle.wait();
        assert!(start.elapsed() < Duration::from_millis(30));
        throttle.mark();
        throttle.wait();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
