use crate::entity::{Entity, EntityKey};
use crate::{atomic_write_bytes, CoreError};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Composite key shared by entities and labels.
pub const KEY_COLUMNS: [&str; 2] = ["year", "category"];

/// Newly produced values for a single output column.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelBatch {
    pub column: String,
    pub values: Vec<(EntityKey, String)>,
}

impl LabelBatch {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            values: Vec::new(),
        }
    }

    pub fn push(&mut self, key: EntityKey, value: impl Into<String>) {
        self.values.push((key, value.into()));
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Sparse table of task outputs. Only present cells are stored; a column
/// stays known once seen even when every cell has been cleared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelStore {
    columns: Vec<String>,
    rows: BTreeMap<EntityKey, BTreeMap<String, String>>,
}

impl LabelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads persisted labels, or an empty store when the file does not
    /// exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no existing labels file; starting fresh");
            return Ok(Self::new());
        }
        let data = fs::read(path)
            .with_context(|| format!("failed to read labels file {}", path.display()))?;
        let store = Self::from_csv(&data, &path.display().to_string())?;
        tracing::info!(
            path = %path.display(),
            rows = store.len(),
            columns = store.columns.len(),
            "loaded existing labels"
        );
        Ok(store)
    }

    fn from_csv(data: &[u8], origin: &str) -> Result<Self> {
        let mut reader = csv::Reader::from_reader(data);
        let headers = reader
            .headers()
            .with_context(|| format!("failed to read header of {}", origin))?
            .clone();
        let position = |name: &str| -> Result<usize> {
            headers.iter().position(|h| h == name).ok_or_else(|| {
                CoreError::MissingColumn {
                    path: origin.to_string(),
                    column: name.to_string(),
                }
                .into()
            })
        };
        let year_idx = position("year")?;
        let category_idx = position("category")?;
        let label_columns: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| !KEY_COLUMNS.contains(h))
            .map(|(i, h)| (i, h.to_string()))
            .collect();

        let mut store = Self::new();
        for (_, name) in &label_columns {
            store.ensure_column(name);
        }
        for record in reader.records() {
            let record = record.with_context(|| format!("invalid label row in {}", origin))?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            let raw_year = record.get(year_idx).unwrap_or("").trim();
            let year = parse_year(raw_year).ok_or_else(|| CoreError::InvalidYear {
                path: origin.to_string(),
                line,
                value: raw_year.to_string(),
            })?;
            let category = record.get(category_idx).unwrap_or("").to_string();
            let key = EntityKey::new(year, category);
            for (idx, name) in &label_columns {
                if let Some(value) = record.get(*idx) {
                    if !value.trim().is_empty() {
                        store.set(key.clone(), name, value);
                    }
                }
            }
        }
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_csv()?;
        atomic_write_bytes(path, &bytes)
            .with_context(|| format!("failed to write labels file {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            rows = self.len(),
            columns = self.columns.len(),
            "saved labels"
        );
        Ok(())
    }

    fn to_csv(&self) -> Result<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        let mut header: Vec<&str> = KEY_COLUMNS.to_vec();
        header.extend(self.columns.iter().map(String::as_str));
        writer.write_record(&header)?;
        for (key, cells) in &self.rows {
            let mut record = vec![key.year.to_string(), key.category.clone()];
            for column in &self.columns {
                record.push(cells.get(column).cloned().unwrap_or_default());
            }
            writer.write_record(&record)?;
        }
        Ok(writer.into_inner().map_err(|e| e.into_error())?)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Number of keys with at least one present cell.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Present, non-blank value of one cell.
    pub fn get(&self, key: &EntityKey, column: &str) -> Option<&str> {
        self.rows
            .get(key)
            .and_then(|cells| cells.get(column))
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn ensure_column(&mut self, column: &str) {
        if !self.has_column(column) {
            self.columns.push(column.to_string());
        }
    }

    /// A blank value is the same as no value: the cell is cleared and the
    /// column kept.
    pub fn set(&mut self, key: EntityKey, column: &str, value: impl Into<String>) {
        self.ensure_column(column);
        let value = value.into();
        if value.trim().is_empty() {
            self.clear(&key, column);
            return;
        }
        self.rows
            .entry(key)
            .or_default()
            .insert(column.to_string(), value);
    }

    /// Marks one cell absent and returns what it held. A row left with no
    /// cells is dropped; the column itself is kept.
    pub fn clear(&mut self, key: &EntityKey, column: &str) -> Option<String> {
        let cells = self.rows.get_mut(key)?;
        let old = cells.remove(column);
        if cells.is_empty() {
            self.rows.remove(key);
        }
        old
    }

    /// Applies one task's batch: batch values win for their key and column,
    /// every other cell is left as it was. An empty batch changes nothing.
    pub fn merge(&mut self, batch: &LabelBatch) {
        for (key, value) in &batch.values {
            self.set(key.clone(), &batch.column, value.clone());
        }
    }
}

fn parse_year(raw: &str) -> Option<i32> {
    if let Ok(year) = raw.parse::<i32>() {
        return Some(year);
    }
    // float-typed year columns ("2020.0") from spreadsheet round trips
    raw.parse::<f64>()
        .ok()
        .filter(|f| f.fract() == 0.0)
        .map(|f| f as i32)
}

/// Entity rows that still need a value in `column`, in entity order.
pub fn find_unlabeled(entities: &[Entity], labels: &LabelStore, column: &str) -> Vec<Entity> {
    let unlabeled: Vec<Entity> = if !labels.has_column(column) {
        entities.to_vec()
    } else {
        entities
            .iter()
            .filter(|e| labels.get(&e.key(), column).is_none())
            .cloned()
            .collect()
    };
    tracing::debug!(
        column,
        unlabeled = unlabeled.len(),
        total = entities.len(),
        "resolved unlabeled rows"
    );
    unlabeled
}
