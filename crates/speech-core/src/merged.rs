use crate::entity::{Entity, ENTITY_COLUMNS};
use crate::labels::LabelStore;
use crate::{atomic_write_bytes, CoreError};
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One entity with whatever labels it has.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRow {
    pub entity: Entity,
    pub labels: BTreeMap<String, String>,
}

impl MergedRow {
    pub fn label(&self, column: &str) -> Option<&str> {
        self.labels
            .get(column)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Entities left-joined with every label column, one row per entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedTable {
    pub label_columns: Vec<String>,
    pub rows: Vec<MergedRow>,
}

pub fn merge_for_output(entities: &[Entity], labels: &LabelStore) -> MergedTable {
    let label_columns = labels.columns().to_vec();
    let rows = entities
        .iter()
        .map(|entity| {
            let key = entity.key();
            let labels = label_columns
                .iter()
                .filter_map(|c| labels.get(&key, c).map(|v| (c.clone(), v.to_string())))
                .collect();
            MergedRow {
                entity: entity.clone(),
                labels,
            }
        })
        .collect();
    MergedTable {
        label_columns,
        rows,
    }
}

pub fn write_merged(path: &Path, table: &MergedTable) -> Result<()> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header: Vec<&str> = ENTITY_COLUMNS.to_vec();
    header.extend(table.label_columns.iter().map(String::as_str));
    writer.write_record(&header)?;
    for row in &table.rows {
        let mut record = row.entity.to_record();
        for column in &table.label_columns {
            record.push(row.labels.get(column).cloned().unwrap_or_default());
        }
        writer.write_record(&record)?;
    }
    let bytes = writer.into_inner().map_err(|e| e.into_error())?;
    atomic_write_bytes(path, &bytes)
        .with_context(|| format!("failed to write merged output {}", path.display()))?;
    tracing::info!(path = %path.display(), rows = table.rows.len(), "wrote merged output");
    Ok(())
}

pub fn read_merged(path: &Path) -> Result<MergedTable> {
    let data = fs::read(path)
        .with_context(|| format!("failed to read merged file {}", path.display()))?;
    let origin = path.display().to_string();
    let mut reader = csv::Reader::from_reader(data.as_slice());
    let headers = reader.headers()?.clone();
    let mut entity_idx = BTreeMap::new();
    for column in ENTITY_COLUMNS {
        let idx = headers
            .iter()
            .position(|h| h == column)
            .ok_or_else(|| CoreError::MissingColumn {
                path: origin.clone(),
                column: column.to_string(),
            })?;
        entity_idx.insert(column, idx);
    }
    let label_columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| !ENTITY_COLUMNS.contains(h))
        .map(|(i, h)| (i, h.to_string()))
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("invalid merged row in {}", origin))?;
        let cell = |column: &str| record.get(entity_idx[column]).unwrap_or("").to_string();
        let year_raw = cell("year");
        let year = year_raw
            .trim()
            .parse::<i32>()
            .map_err(|_| anyhow!("{}: invalid year '{}'", origin, year_raw))?;
        let ceremony_raw = cell("ceremony");
        let ceremony = if ceremony_raw.trim().is_empty() {
            None
        } else {
            Some(
                ceremony_raw
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| anyhow!("{}: invalid ceremony '{}'", origin, ceremony_raw))?,
            )
        };
        let entity = Entity {
            year,
            ceremony,
            category: cell("category"),
            film_title: cell("film_title"),
            winner_raw: cell("winner_raw"),
            winner_clean: cell("winner_clean"),
            speech_clean: cell("speech_clean"),
        };
        let labels = label_columns
            .iter()
            .filter_map(|(idx, name)| {
                record
                    .get(*idx)
                    .filter(|v| !v.trim().is_empty())
                    .map(|v| (name.clone(), v.to_string()))
            })
            .collect();
        rows.push(MergedRow { entity, labels });
    }
    Ok(MergedTable {
        label_columns: label_columns.into_iter().map(|(_, name)| name).collect(),
        rows,
    })
}
