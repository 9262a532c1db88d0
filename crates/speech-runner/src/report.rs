use chrono::{DateTime, Utc};
use serde::Serialize;
use speech_core::{Entity, LabelStore};
use speech_tasks::{ResponseParser, Task};
use std::collections::BTreeMap;

/// How many entities hold a value for one task's column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnCoverage {
    pub task: String,
    pub column: String,
    pub labeled: usize,
    pub total: usize,
    /// Value counts, for integer-scored columns only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution: Option<BTreeMap<String, usize>>,
}

impl ColumnCoverage {
    pub fn compute(task: Task, entities: &[Entity], labels: &LabelStore) -> Self {
        let column = task.output_column();
        let values: Vec<&str> = entities
            .iter()
            .filter_map(|e| labels.get(&e.key(), column))
            .collect();
        let distribution = match task.parser() {
            ResponseParser::Score { .. } => {
                let mut counts = BTreeMap::new();
                for v in &values {
                    *counts.entry(score_bin(v)).or_insert(0) += 1;
                }
                Some(counts)
            }
            _ => None,
        };
        Self {
            task: task.name().to_string(),
            column: column.to_string(),
            labeled: values.len(),
            total: entities.len(),
            distribution,
        }
    }
}

/// `"4.0"` from a spreadsheet round trip and `"4"` share a bin.
fn score_bin(raw: &str) -> String {
    let text = raw.trim();
    if let Ok(score) = text.parse::<i64>() {
        return score.to_string();
    }
    match text.parse::<f64>() {
        Ok(f) if f.fract() == 0.0 => (f as i64).to_string(),
        _ => text.to_string(),
    }
}

pub fn coverage_report(entities: &[Entity], labels: &LabelStore) -> Vec<ColumnCoverage> {
    Task::ALL
        .iter()
        .map(|t| ColumnCoverage::compute(*t, entities, labels))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskStatus {
    /// Every entity already had a value.
    Complete,
    SkippedMissingDependencies { missing: Vec<String> },
    Ran,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub status: TaskStatus,
    pub attempted: usize,
    /// Values stored by this run. The column's total is in `coverage`.
    pub newly_labeled: usize,
    pub parse_failures: usize,
    pub service_failures: usize,
    pub dependency_pending: usize,
    pub coverage: ColumnCoverage,
}

impl TaskReport {
    pub fn new(status: TaskStatus, coverage: ColumnCoverage) -> Self {
        Self {
            status,
            attempted: 0,
            newly_labeled: 0,
            parse_failures: 0,
            service_failures: 0,
            dependency_pending: 0,
            coverage,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: usize,
    pub tasks: Vec<TaskReport>,
}

impl RunReport {
    pub fn task(&self, task: Task) -> Option<&TaskReport> {
        self.tasks.iter().find(|r| r.coverage.task == task.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::entity;
    use speech_core::EntityKey;

    #[test]
    fn coverage_counts_only_entities_and_bins_scores() {
        let entities = vec![
            entity(2020, "Directing", "Parasite"),
            entity(2020, "Actor in a Leading Role", "Joker"),
            entity(2019, "Directing", "Roma"),
        ];
        let mut labels = LabelStore::new();
        labels.set(EntityKey::new(2020, "Directing"), "distinctiveness", "4");
        labels.set(EntityKey::new(2019, "Directing"), "distinctiveness", "4");
        labels.set(EntityKey::new(1990, "Directing"), "distinctiveness", "2");
        labels.set(EntityKey::new(2019, "Directing"), "plot_hint", "A year in a Mexico City household.");

        let report = coverage_report(&entities, &labels);
        assert_eq!(report.len(), Task::ALL.len());
        let distinct = &report[0];
        assert_eq!(distinct.labeled, 2);
        assert_eq!(distinct.total, 3);
        assert_eq!(
            distinct.distribution.as_ref().map(|d| d.get("4").copied()),
            Some(Some(2))
        );
        let hint = report.iter().find(|c| c.column == "plot_hint").expect("plot_hint");
        assert_eq!(hint.labeled, 1);
        assert!(hint.distribution.is_none());
    }

    #[test]
    fn float_and_integer_scores_share_a_bin() {
        let entities = vec![
            entity(2020, "Directing", "Parasite"),
            entity(2019, "Directing", "Roma"),
            entity(2018, "Directing", "The Shape of Water"),
        ];
        let mut labels = LabelStore::new();
        labels.set(EntityKey::new(2020, "Directing"), "snippet_grading", "4.0");
        labels.set(EntityKey::new(2019, "Directing"), "snippet_grading", "4");
        labels.set(EntityKey::new(2018, "Directing"), "snippet_grading", " 3 ");
        let coverage = ColumnCoverage::compute(Task::SnippetGrading, &entities, &labels);
        let bins = coverage.distribution.expect("scored column");
        assert_eq!(bins.get("4"), Some(&2));
        assert_eq!(bins.get("3"), Some(&1));
        assert_eq!(bins.len(), 2);
    }

    #[test]
    fn task_report_json_keeps_run_count_apart_from_coverage() {
        let entities = vec![
            entity(2020, "Directing", "Parasite"),
            entity(2019, "Directing", "Roma"),
        ];
        let mut labels = LabelStore::new();
        labels.set(EntityKey::new(2020, "Directing"), "plot_hint", "Two families, one house.");
        labels.set(EntityKey::new(2019, "Directing"), "plot_hint", "A year in a Mexico City household.");
        let mut report = TaskReport::new(
            TaskStatus::Ran,
            ColumnCoverage::compute(Task::PlotHint, &entities, &labels),
        );
        report.attempted = 1;
        report.newly_labeled = 1;

        let value = serde_json::to_value(&report).expect("json");
        assert_eq!(value["status"]["kind"], "ran");
        assert_eq!(value["newly_labeled"], 1);
        assert_eq!(value["coverage"]["labeled"], 2);
        assert_eq!(value["coverage"]["total"], 2);
        let text = serde_json::to_string(&report).expect("json text");
        assert_eq!(text.matches("\"labeled\"").count(), 1, "{}", text);
    }
}
