use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use speech_core::{read_merged, EntityStore};
use speech_export::{build_game_data, write_game_data, ExportOptions};
use speech_gen::Generator;
use speech_runner::{
    find_project_root, ColumnCoverage, Dataset, EntitySelector, Project, RelabelError,
    RelabelOutcome, RelabelRequest, RunReport, TaskStatus,
};
use speech_tasks::{Task, TaskError};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "speeches",
    version,
    about = "Incremental LLM labeling for Oscar acceptance speeches"
)]
struct Cli {
    /// Project directory holding speeches.yaml, data/ and prompts/.
    #[arg(long, global = true)]
    project: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, short, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every task over rows that still lack a label.
    Label {
        #[arg(long)]
        test: bool,
    },
    /// Redo one task's label for a single speech.
    Relabel {
        /// Case-insensitive substring of the film title.
        #[arg(long)]
        film: String,
        #[arg(long)]
        task: String,
        /// Appended to the prompt as a reviewer note.
        #[arg(long)]
        note: Option<String>,
        /// Store this value verbatim instead of calling the model.
        #[arg(long = "override")]
        override_value: Option<String>,
        /// Case-insensitive substring of the category.
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        test: bool,
    },
    /// Write the game JSON from the merged labels.
    Export {
        #[arg(long)]
        test: bool,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Show per-task label coverage.
    Coverage {
        #[arg(long)]
        test: bool,
    },
    /// List the task registry.
    Tasks,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose)?;
    let json_mode = cli.json;
    match run_command(cli) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&error_payload(&err));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(quiet: bool, verbose: bool) -> Result<()> {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_env("SPEECHES_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;
    Ok(())
}

fn load_project(explicit: Option<PathBuf>) -> Result<Project> {
    let root = match explicit {
        Some(path) => path,
        None => {
            let cwd = std::env::current_dir().context("failed to read current directory")?;
            find_project_root(&cwd)
        }
    };
    Project::load(&root)
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    let json = cli.json;
    match cli.command {
        Commands::Label { test } => {
            let project = load_project(cli.project)?;
            let dataset = Dataset::from_test_flag(test);
            let generator = project.generator()?;
            let outcome = speech_runner::run_labeling(&project, dataset, &generator)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "label",
                    "dataset": dataset.as_str(),
                    "report": serde_json::to_value(&outcome.report)?,
                })));
            }
            print_run_report(&outcome.report);
        }
        Commands::Relabel {
            film,
            task,
            note,
            override_value,
            category,
            test,
        } => {
            let task: Task = task.parse()?;
            let project = load_project(cli.project)?;
            let dataset = Dataset::from_test_flag(test);
            let client = match override_value {
                Some(_) => None,
                None => Some(project.generator()?),
            };
            let request = RelabelRequest {
                selector: EntitySelector::new(film, category),
                task,
                note,
                override_value,
            };
            let generator = client.as_ref().map(|c| c as &dyn Generator);
            let outcome = speech_runner::run_relabel(&project, dataset, &request, generator)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "relabel",
                    "dataset": dataset.as_str(),
                    "relabel": serde_json::to_value(&outcome)?,
                })));
            }
            print_relabel(&outcome);
        }
        Commands::Export { test, out, seed } => {
            let project = load_project(cli.project)?;
            let dataset = Dataset::from_test_flag(test);
            let paths = project.dataset_paths(dataset);
            let merged = read_merged(&paths.merged)?;
            let pool_path = project.dataset_paths(Dataset::Production).speeches;
            let pool = if pool_path.is_file() {
                EntityStore::load(&pool_path)?.entities().to_vec()
            } else {
                tracing::warn!(
                    path = %pool_path.display(),
                    "decoy pool not found; drawing film options from the exported rows"
                );
                merged.rows.iter().map(|r| r.entity.clone()).collect()
            };
            let options = ExportOptions {
                min_snippet_grade: project.config.export.min_snippet_grade,
                decoy_year_range: project.config.export.decoy_year_range,
            };
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let data = build_game_data(&merged, &pool, &options, &mut rng);
            let out = out.unwrap_or_else(|| project.export_output());
            write_game_data(&out, &data)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "export",
                    "dataset": dataset.as_str(),
                    "output": out.display().to_string(),
                    "speeches": data.speeches.len(),
                    "categories": data.categories,
                })));
            }
            println!("wrote {} speeches to {}", data.speeches.len(), out.display());
            println!("categories: {}", data.categories.join(", "));
        }
        Commands::Coverage { test } => {
            let project = load_project(cli.project)?;
            let dataset = Dataset::from_test_flag(test);
            let report = speech_runner::coverage(&project, dataset)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "coverage",
                    "dataset": dataset.as_str(),
                    "coverage": serde_json::to_value(&report)?,
                })));
            }
            for c in &report {
                print_coverage_line(c);
            }
        }
        Commands::Tasks => {
            let prompts = load_project(cli.project)?.prompts();
            let missing = prompts.missing_templates();
            let tasks: Vec<Value> = Task::ALL
                .iter()
                .map(|t| {
                    json!({
                        "task": t.name(),
                        "position": t.position(),
                        "column": t.output_column(),
                        "depends_on": t.dependencies(),
                        "parser": t.parser().to_string(),
                        "template": prompts.template_path(*t).display().to_string(),
                        "template_present": !missing.contains(t),
                    })
                })
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "tasks",
                    "tasks": tasks,
                })));
            }
            for t in Task::ALL {
                let deps = if t.dependencies().is_empty() {
                    "-".to_string()
                } else {
                    t.dependencies().join(", ")
                };
                let marker = if missing.contains(&t) { " (template missing)" } else { "" };
                println!(
                    "{}. {:<18} -> {:<16} needs: {:<16} parser: {}{}",
                    t.position() + 1,
                    t.name(),
                    t.output_column(),
                    deps,
                    t.parser(),
                    marker
                );
            }
        }
    }
    Ok(None)
}

fn print_coverage_line(c: &ColumnCoverage) {
    let mut line = format!("{:<18} {}/{}", c.column, c.labeled, c.total);
    if let Some(distribution) = &c.distribution {
        let bins = distribution
            .iter()
            .map(|(value, count)| format!("{}:{}", value, count))
            .collect::<Vec<_>>()
            .join(" ");
        if !bins.is_empty() {
            line.push_str(&format!("  [{}]", bins));
        }
    }
    println!("{}", line);
}

fn print_run_report(report: &RunReport) {
    println!("run_id: {}", report.run_id);
    println!("entities: {}", report.entities);
    for task in &report.tasks {
        let status = match &task.status {
            TaskStatus::Complete => "complete".to_string(),
            TaskStatus::Ran => format!(
                "+{} labeled, {} unparsable, {} failed, {} waiting on dependencies",
                task.newly_labeled, task.parse_failures, task.service_failures, task.dependency_pending
            ),
            TaskStatus::SkippedMissingDependencies { missing } => {
                format!("skipped (missing {})", missing.join(", "))
            }
        };
        println!(
            "{:<18} {}/{}  {}",
            task.coverage.column, task.coverage.labeled, task.coverage.total, status
        );
    }
}

fn print_relabel(outcome: &RelabelOutcome) {
    println!("Entity: {}", outcome.entity);
    println!("Task: {} (column {})", outcome.task, outcome.column);
    println!(
        "Old value: {}",
        outcome.old_value.as_deref().unwrap_or("(none)")
    );
    println!("New value: {}", outcome.new_value);
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_payload(err: &anyhow::Error) -> Value {
    if let Some(relabel) = err.downcast_ref::<RelabelError>() {
        let details = match relabel {
            RelabelError::AmbiguousMatch { candidates, .. } => json!({ "candidates": candidates }),
            RelabelError::UnparsableResponse { raw, .. } => json!({ "response": raw }),
            _ => json!({}),
        };
        return json_error(relabel.code(), relabel.to_string(), details);
    }
    if let Some(TaskError::UnknownTask { available, .. }) = err.downcast_ref::<TaskError>() {
        return json_error(
            "unknown_task",
            err.to_string(),
            json!({ "available": available }),
        );
    }
    json_error("command_failed", format!("{:#}", err), json!({}))
}
