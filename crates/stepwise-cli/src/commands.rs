//! Command handlers: run, validate, list.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;

use stepwise_core::engine::definition::{DefinitionError, load_definition_file};
use stepwise_core::engine::evaluator::StaticRoutes;
use stepwise_core::engine::executor::StepOutcome;
use stepwise_core::engine::runner::{RunnerOptions, WorkflowRunner};
use stepwise_core::render::{RenderRegistry, RenderedView};
use stepwise_core::store::InMemoryDefinitionStore;
use stepwise_infra::http::ReqwestDispatcher;
use stepwise_infra::sqlite::pool::default_database_url;
use stepwise_infra::sqlite::{DatabasePool, SqliteGateway};
use stepwise_types::definition::WorkflowDefinition;

type JsonMap = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

pub async fn run(
    file: &Path,
    step: Option<&str>,
    context: Option<&str>,
    database: Option<String>,
    routes: &[String],
    templates: Option<&Path>,
    json: bool,
) -> Result<()> {
    let definition = load_definition_file(file)
        .with_context(|| format!("failed to load definition from {}", file.display()))?;
    let definition_id = definition.id.clone();

    let seed = parse_seed(context)?;
    let route_table = parse_routes(routes)?;

    let database_url = match database {
        Some(url) => url,
        None => {
            let url = default_database_url();
            ensure_database_dir(&url)?;
            url
        }
    };

    let pool = DatabasePool::new(&database_url)
        .await
        .with_context(|| format!("failed to open database {database_url}"))?;
    let gateway = Arc::new(SqliteGateway::new(pool));
    let http = Arc::new(ReqwestDispatcher::new().context("failed to build HTTP client")?);

    let store = Arc::new(InMemoryDefinitionStore::new());
    store
        .insert(definition)
        .context("definition failed validation")?;

    let renders = match templates {
        Some(dir) => Arc::new(RenderRegistry::with_template_dir(dir)),
        None => Arc::new(RenderRegistry::with_builtins()),
    };

    let runner = WorkflowRunner::with_options(
        store,
        gateway,
        http,
        RunnerOptions {
            routes: Arc::new(route_table),
            renders,
            ..RunnerOptions::default()
        },
    );

    let outcome = runner.run_step(&definition_id, step, seed).await?;

    if json {
        let report = serde_json::json!({
            "run_id": outcome.run_id,
            "definition": outcome.definition_id,
            "last_step": outcome.last_step,
            "outcome": outcome.outcome.to_value(),
            "context": outcome.context,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("  {} Run finished", style("✓").green().bold());
    println!();
    println!("  {}  {}", style("Run id:").bold(), style(outcome.run_id).dim());
    println!("  {}  {}", style("Workflow:").bold(), style(&outcome.definition_id).cyan());
    println!("  {}  {}", style("Last step:").bold(), &outcome.last_step);
    println!();

    match &outcome.outcome {
        StepOutcome::Redirect { url } => {
            println!("  {} {}", style("Redirect to:").bold(), style(url).cyan());
        }
        StepOutcome::Form { html } | StepOutcome::View(RenderedView::Document(html)) => {
            println!("{html}");
        }
        StepOutcome::View(RenderedView::Payload(payload)) => {
            println!("{}", serde_json::to_string_pretty(payload)?);
        }
        StepOutcome::Value(value) => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
    }
    println!();

    Ok(())
}

fn parse_seed(context: Option<&str>) -> Result<JsonMap> {
    let Some(raw) = context else {
        return Ok(JsonMap::new());
    };
    let value: Value = serde_json::from_str(raw).context("--context is not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("--context must be a JSON object"),
    }
}

fn parse_routes(routes: &[String]) -> Result<StaticRoutes> {
    let mut table = StaticRoutes::new();
    for entry in routes {
        let (name, url) = entry
            .split_once('=')
            .with_context(|| format!("--route '{entry}' is not in name=url form"))?;
        table.insert(name, url);
    }
    Ok(table)
}

/// Create the data directory when running against the default database path.
fn ensure_database_dir(database_url: &str) -> Result<()> {
    let path = database_url.trim_start_matches("sqlite://");
    let path = path.split('?').next().unwrap_or(path);
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

pub fn validate(file: &Path, json: bool) -> Result<()> {
    match load_definition_file(file) {
        Ok(definition) => {
            if json {
                let report = serde_json::json!({
                    "valid": true,
                    "id": definition.id,
                    "steps": definition.steps.len(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            println!();
            println!(
                "  {} '{}' is valid ({} step{})",
                style("✓").green().bold(),
                style(&definition.id).cyan(),
                definition.steps.len(),
                if definition.steps.len() == 1 { "" } else { "s" },
            );
            println!();
            println!("{}", step_table(&definition));
            println!();
            Ok(())
        }
        Err(DefinitionError::Validation(message)) => {
            let problems: Vec<&str> = message.split("; ").collect();
            if json {
                let report = serde_json::json!({"valid": false, "errors": problems});
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!();
                for problem in &problems {
                    println!("  {} {}", style("✗").red().bold(), problem);
                }
                println!();
            }
            bail!("definition is invalid");
        }
        Err(err) => Err(err)
            .with_context(|| format!("failed to load definition from {}", file.display())),
    }
}

fn step_table(definition: &WorkflowDefinition) -> Table {
    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Step").fg(Color::White),
        Cell::new("Action").fg(Color::White),
        Cell::new("Targets").fg(Color::White),
    ]);

    for step in &definition.steps {
        let mut targets: Vec<String> = Vec::new();
        for condition in step
            .conditions
            .iter()
            .chain(step.response.iter().flat_map(|r| r.conditions.iter()))
        {
            if let Some(next) = &condition.next {
                targets.push(next.clone());
            }
        }
        if let Some(on_timeout) = &step.on_timeout {
            targets.push(format!("{on_timeout} (timeout)"));
        }

        table.add_row(vec![
            Cell::new(&step.id).fg(Color::Cyan),
            Cell::new(step.action.as_str()),
            Cell::new(targets.join(", ")).fg(Color::DarkGrey),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

pub fn list(dir: &Path, json: bool) -> Result<()> {
    let store = stepwise_infra::fs::FsDefinitionStore::new(dir);
    let results = store
        .discover()
        .with_context(|| format!("failed to read {}", dir.display()))?;

    if json {
        let report: Vec<Value> = results
            .iter()
            .map(|result| match result {
                Ok(def) => serde_json::json!({
                    "id": def.id,
                    "description": def.description,
                    "steps": def.steps.len(),
                }),
                Err(err) => serde_json::json!({"error": err.to_string()}),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if results.is_empty() {
        println!();
        println!(
            "  {} No definitions found in {}",
            style("i").blue().bold(),
            style(dir.display()).yellow()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Workflow").fg(Color::White),
        Cell::new("Steps").fg(Color::White),
        Cell::new("Description").fg(Color::White),
    ]);

    let mut broken = 0usize;
    for result in &results {
        match result {
            Ok(def) => {
                table.add_row(vec![
                    Cell::new(&def.id).fg(Color::Cyan),
                    Cell::new(def.steps.len()),
                    Cell::new(def.description.as_deref().unwrap_or("")),
                ]);
            }
            Err(err) => {
                broken += 1;
                table.add_row(vec![
                    Cell::new("(invalid)").fg(Color::Red),
                    Cell::new("-"),
                    Cell::new(err.to_string()).fg(Color::Red),
                ]);
            }
        }
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  {} workflow{}{}",
        style(results.len()).bold(),
        if results.len() == 1 { "" } else { "s" },
        if broken > 0 {
            format!(", {} invalid", style(broken).red())
        } else {
            String::new()
        },
    );
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seed_object() {
        let seed = parse_seed(Some(r#"{"order_id": "ord-1"}"#)).unwrap();
        assert_eq!(seed.get("order_id"), Some(&Value::from("ord-1")));
    }

    #[test]
    fn test_parse_seed_rejects_non_object() {
        assert!(parse_seed(Some("[1, 2]")).is_err());
        assert!(parse_seed(Some("not json")).is_err());
    }

    #[test]
    fn test_parse_seed_defaults_empty() {
        assert!(parse_seed(None).unwrap().is_empty());
    }

    #[test]
    fn test_parse_routes() {
        let routes = parse_routes(&["checkout=https://pay.test/c/{id}".to_string()]).unwrap();
        use stepwise_core::engine::evaluator::RouteResolver;
        let url = routes
            .resolve("checkout", &serde_json::json!({"id": "ord-1"}))
            .unwrap();
        assert_eq!(url, "https://pay.test/c/ord-1");
    }

    #[test]
    fn test_parse_routes_rejects_malformed() {
        assert!(parse_routes(&["no-equals-sign".to_string()]).is_err());
    }

    #[test]
    fn test_validate_reports_problems() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "steps:\n  - id: wait\n    action: poll_db\n").unwrap();
        assert!(validate(&path, true).is_err());
    }
}
