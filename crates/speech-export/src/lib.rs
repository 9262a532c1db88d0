//! Game-data export: turns the merged speeches-with-labels table into the
//! JSON document the guessing game loads.

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use speech_core::{atomic_write_bytes, Entity, MergedRow, MergedTable};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

static REDACT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[REDACT:\s*(.*?)\]").expect("valid redaction pattern"));

const BLANK: &str = "______";
const OPTION_COUNT: usize = 6;

#[derive(Debug, Clone, Copy)]
pub struct ExportOptions {
    pub min_snippet_grade: i64,
    /// Decoy titles within this many years of the answer are preferred.
    pub decoy_year_range: i32,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            min_snippet_grade: 3,
            decoy_year_range: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameSpeech {
    pub id: usize,
    pub year: i32,
    pub category: String,
    pub film_title: String,
    pub winner_clean: String,
    pub golden_snippet: String,
    pub snippet_display: String,
    pub redactions: Vec<String>,
    pub full_speech_display: String,
    pub full_speech_raw: String,
    pub plot_hint: Option<String>,
    pub snippet_grading: i64,
    pub film_options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameData {
    pub speeches: Vec<GameSpeech>,
    pub categories: Vec<String>,
}

/// `[REDACT: x]` markers become blanks.
pub fn render_redacted(marked_up: &str) -> String {
    REDACT_PATTERN.replace_all(marked_up, BLANK).into_owned()
}

/// The redacted strings, in order of appearance.
pub fn extract_redactions(marked_up: &str) -> Vec<String> {
    REDACT_PATTERN
        .captures_iter(marked_up)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Peels wrapping `"""`, `'''`, `"` or `'` left around model output. Each
/// quote style is tried once, longest first.
pub fn strip_outer_quotes(text: &str) -> String {
    let mut text = text.trim();
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if text.len() > quote.len() * 2 && text.starts_with(quote) && text.ends_with(quote) {
            text = text[quote.len()..text.len() - quote.len()].trim();
        }
    }
    text.to_string()
}

fn unique_titles<'e>(entities: impl Iterator<Item = &'e Entity>) -> Vec<&'e str> {
    let mut seen = BTreeSet::new();
    entities
        .map(|e| e.film_title.as_str())
        .filter(|t| seen.insert(*t))
        .collect()
}

/// Up to `n` distinct titles from `pool` outside `exclude`. With a target
/// year, titles within `year_range` of it are taken first and the rest of
/// the pool only fills the shortfall.
fn sample_titles<R: Rng + ?Sized>(
    pool: &[&Entity],
    n: usize,
    exclude: &BTreeSet<String>,
    year: Option<(i32, i32)>,
    rng: &mut R,
) -> Vec<String> {
    let candidates: Vec<&Entity> = pool
        .iter()
        .copied()
        .filter(|e| !exclude.contains(&e.film_title))
        .collect();
    let Some((year, year_range)) = year else {
        let titles = unique_titles(candidates.iter().copied());
        return titles
            .choose_multiple(rng, n)
            .map(|t| t.to_string())
            .collect();
    };

    let nearby = unique_titles(
        candidates
            .iter()
            .copied()
            .filter(|e| (e.year - year).abs() <= year_range),
    );
    if nearby.len() >= n {
        return nearby
            .choose_multiple(rng, n)
            .map(|t| t.to_string())
            .collect();
    }
    let far = unique_titles(
        candidates
            .iter()
            .copied()
            .filter(|e| !nearby.contains(&e.film_title.as_str())),
    );
    let mut picks: Vec<String> = nearby.iter().map(|t| t.to_string()).collect();
    picks.extend(
        far.choose_multiple(rng, n - nearby.len())
            .map(|t| t.to_string()),
    );
    picks
}

/// Six shuffled titles: the answer plus two films from its category, then a
/// decoy film from another category with two of that category's films.
/// Short clusters are padded from the whole pool.
pub fn pick_film_options<R: Rng + ?Sized>(
    pool: &[Entity],
    answer: &Entity,
    year_range: i32,
    rng: &mut R,
) -> Vec<String> {
    let everything: Vec<&Entity> = pool.iter().collect();
    let mut used = BTreeSet::from([answer.film_title.clone()]);

    let same_category: Vec<&Entity> = pool
        .iter()
        .filter(|e| e.category == answer.category)
        .collect();
    let same_picks = sample_titles(
        &same_category,
        2,
        &used,
        Some((answer.year, year_range)),
        rng,
    );
    used.extend(same_picks.iter().cloned());
    let mut options = vec![answer.film_title.clone()];
    options.extend(same_picks);

    let other_category: Vec<&Entity> = pool
        .iter()
        .filter(|e| e.category != answer.category)
        .collect();
    let mut seed = sample_titles(
        &other_category,
        1,
        &used,
        Some((answer.year, year_range)),
        rng,
    );
    if seed.is_empty() {
        seed = sample_titles(&everything, 1, &used, None, rng);
    }
    if let Some(seed_title) = seed.into_iter().next() {
        used.insert(seed_title.clone());
        if let Some(seed_entity) = pool.iter().find(|e| e.film_title == seed_title) {
            let seed_category: Vec<&Entity> = pool
                .iter()
                .filter(|e| e.category == seed_entity.category)
                .collect();
            let peers = sample_titles(
                &seed_category,
                2,
                &used,
                Some((seed_entity.year, year_range)),
                rng,
            );
            used.extend(peers.iter().cloned());
            options.push(seed_title);
            options.extend(peers);
        }
    }

    if options.len() < OPTION_COUNT {
        let taken: BTreeSet<String> = options.iter().cloned().collect();
        let extra = sample_titles(&everything, OPTION_COUNT - options.len(), &taken, None, rng);
        options.extend(extra);
    }
    options.shuffle(rng);
    options
}

fn snippet_grade(row: &MergedRow) -> Option<i64> {
    let raw = row.label("snippet_grading")?.trim();
    raw.parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().map(|f| f as i64))
}

/// Keeps rows whose snippet grade meets the threshold and numbers them in
/// table order. `pool` supplies the decoy titles.
pub fn build_game_data<R: Rng + ?Sized>(
    merged: &MergedTable,
    pool: &[Entity],
    options: &ExportOptions,
    rng: &mut R,
) -> GameData {
    let kept: Vec<(&MergedRow, i64)> = merged
        .rows
        .iter()
        .filter_map(|row| snippet_grade(row).map(|grade| (row, grade)))
        .filter(|(_, grade)| *grade >= options.min_snippet_grade)
        .collect();
    tracing::info!(
        kept = kept.len(),
        total = merged.rows.len(),
        min_grade = options.min_snippet_grade,
        "filtered speeches by snippet grade"
    );

    let mut categories = BTreeSet::new();
    let speeches = kept
        .into_iter()
        .enumerate()
        .map(|(id, (row, grade))| {
            let entity = &row.entity;
            categories.insert(entity.category.clone());
            let golden_snippet = strip_outer_quotes(row.label("golden_snippet").unwrap_or_default());
            let redacted_speech = strip_outer_quotes(row.label("redacted_speech").unwrap_or_default());
            GameSpeech {
                id,
                year: entity.year,
                category: entity.category.clone(),
                film_title: entity.film_title.clone(),
                winner_clean: entity.winner_clean.clone(),
                snippet_display: render_redacted(&golden_snippet),
                redactions: extract_redactions(&golden_snippet),
                golden_snippet,
                full_speech_display: render_redacted(&redacted_speech),
                full_speech_raw: entity.speech_clean.clone(),
                plot_hint: row.label("plot_hint").map(str::to_string),
                snippet_grading: grade,
                film_options: pick_film_options(pool, entity, options.decoy_year_range, rng),
            }
        })
        .collect();

    GameData {
        speeches,
        categories: categories.into_iter().collect(),
    }
}

pub fn write_game_data(path: &Path, data: &GameData) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(data)?;
    bytes.push(b'\n');
    atomic_write_bytes(path, &bytes)
        .with_context(|| format!("failed to write game data {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        speeches = data.speeches.len(),
        categories = ?data.categories,
        "wrote game data"
    );
    Ok(())
}
