use crate::CoreError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

/// Column order of the cleaned-speeches file and of the entity half of the
/// merged artifact.
pub const ENTITY_COLUMNS: [&str; 7] = [
    "year",
    "ceremony",
    "category",
    "film_title",
    "winner_raw",
    "winner_clean",
    "speech_clean",
];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityKey {
    pub year: i32,
    pub category: String,
}

impl EntityKey {
    pub fn new(year: i32, category: impl Into<String>) -> Self {
        Self {
            year,
            category: category.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.year, self.category)
    }
}

/// One award-category-year row produced by the cleaning collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub year: i32,
    pub ceremony: Option<u32>,
    pub category: String,
    pub film_title: String,
    pub winner_raw: String,
    pub winner_clean: String,
    pub speech_clean: String,
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.year, self.category.clone())
    }

    /// Named fields available to prompt templates, one per entity column.
    /// An unknown ceremony renders as an empty string.
    pub fn fields(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert("year".to_string(), self.year.to_string());
        out.insert(
            "ceremony".to_string(),
            self.ceremony.map(|c| c.to_string()).unwrap_or_default(),
        );
        out.insert("category".to_string(), self.category.clone());
        out.insert("film_title".to_string(), self.film_title.clone());
        out.insert("winner_raw".to_string(), self.winner_raw.clone());
        out.insert("winner_clean".to_string(), self.winner_clean.clone());
        out.insert("speech_clean".to_string(), self.speech_clean.clone());
        out
    }

    pub fn to_record(&self) -> Vec<String> {
        vec![
            self.year.to_string(),
            self.ceremony.map(|c| c.to_string()).unwrap_or_default(),
            self.category.clone(),
            self.film_title.clone(),
            self.winner_raw.clone(),
            self.winner_clean.clone(),
            self.speech_clean.clone(),
        ]
    }

    pub fn describe(&self) -> String {
        format!(
            "{} | {} | {} | {}",
            self.year, self.category, self.film_title, self.winner_clean
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    entities: Vec<Entity>,
}

impl EntityStore {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)
            .with_context(|| format!("failed to read entity file {}", path.display()))?;
        let mut reader = csv::Reader::from_reader(data.as_slice());
        let mut entities = Vec::new();
        for row in reader.deserialize::<Entity>() {
            let entity =
                row.with_context(|| format!("invalid entity row in {}", path.display()))?;
            entities.push(entity);
        }
        let store = Self::from_entities(entities, &path.display().to_string())?;
        tracing::info!(
            path = %path.display(),
            rows = store.len(),
            "loaded entities"
        );
        Ok(store)
    }

    /// Builds a store, rejecting a second row for an already seen key.
    pub fn from_entities(entities: Vec<Entity>, origin: &str) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for entity in &entities {
            if !seen.insert(entity.key()) {
                return Err(CoreError::DuplicateEntity {
                    path: origin.to_string(),
                    year: entity.year,
                    category: entity.category.clone(),
                }
                .into());
            }
        }
        Ok(Self { entities })
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
