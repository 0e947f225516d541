//! Workflow definition parsing and validation.
//!
//! Definitions are authored as YAML. Parsing always validates: a definition
//! that refers to a step that does not exist, or configures an action
//! without the fields it needs, is rejected before a run ever starts.

use std::path::Path;

use stepwise_types::definition::{Condition, Step, StepAction, WorkflowDefinition};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("failed to parse workflow definition: {0}")]
    Parse(String),

    #[error("invalid workflow definition: {0}")]
    Validation(String),

    #[error("failed to read workflow definition: {0}")]
    Io(#[from] std::io::Error),

    #[error("workflow definition '{0}' not found")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a YAML definition.
pub fn parse_definition(source: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let definition: WorkflowDefinition =
        serde_yaml_ng::from_str(source).map_err(|err| DefinitionError::Parse(err.to_string()))?;
    validate(&definition)?;
    Ok(definition)
}

/// Load a definition from a file. A definition that does not carry its own
/// `id` takes the file stem.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let source = std::fs::read_to_string(path)?;
    let mut definition = parse_definition(&source)?;
    if definition.id.is_empty() {
        definition.id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    Ok(definition)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check structural invariants. All problems are reported at once.
pub fn validate(definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
    let mut problems = Vec::new();

    if definition.steps.is_empty() {
        problems.push("workflow has no steps".to_string());
    }

    let mut seen = std::collections::BTreeSet::new();
    for step in &definition.steps {
        if step.id.is_empty() {
            problems.push("a step has an empty id".to_string());
        } else if !seen.insert(step.id.as_str()) {
            problems.push(format!("duplicate step id '{}'", step.id));
        }
    }

    for step in &definition.steps {
        check_action_fields(step, &mut problems);
        check_step_targets(definition, step, &mut problems);
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(DefinitionError::Validation(problems.join("; ")))
    }
}

fn check_action_fields(step: &Step, problems: &mut Vec<String>) {
    match step.action {
        StepAction::HttpRequest => {
            if step.request.is_none() && step.mock_response.is_none() {
                problems.push(format!(
                    "step '{}' is an http_request without a request or mock_response",
                    step.id
                ));
            }
        }
        StepAction::HttpTrigger | StepAction::Redirect => {
            if step.request.is_none() {
                problems.push(format!(
                    "step '{}' is a {} without a request",
                    step.id,
                    step.action.as_str()
                ));
            }
        }
        StepAction::PollDb => {
            if step.table.is_none() {
                problems.push(format!("step '{}' is a poll_db without a table", step.id));
            }
            if step.query.is_none() {
                problems.push(format!("step '{}' is a poll_db without a query", step.id));
            }
        }
        StepAction::UiForm => {
            if step.template.is_none() {
                problems.push(format!("step '{}' is a ui_form without a template", step.id));
            }
        }
    }
}

fn check_step_targets(definition: &WorkflowDefinition, step: &Step, problems: &mut Vec<String>) {
    let mut targets: Vec<(&str, &str)> = Vec::new();
    if let Some(target) = step.on_timeout.as_deref() {
        targets.push((target, "on_timeout"));
    }
    for condition in &step.conditions {
        if let Some(target) = condition.next.as_deref() {
            targets.push((target, "condition"));
        }
    }
    if let Some(response) = &step.response {
        for condition in &response.conditions {
            if let Some(target) = condition.next.as_deref() {
                targets.push((target, "response condition"));
            }
        }
    }

    for (target, kind) in targets {
        if definition.step(target).is_none() {
            problems.push(format!(
                "step '{}' {} references unknown step '{}'",
                step.id, kind, target
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
description: create and settle an order
steps:
  - id: create_order
    action: http_request
    request:
      url: https://api.example.com/orders
      method: POST
    response:
      conditions:
        - when: "status == 'created'"
          next: await_settlement
  - id: await_settlement
    action: poll_db
    table: orders
    query:
      status: settled
    on_timeout: create_order
"#;

    fn expect_validation_error(source: &str) -> String {
        match parse_definition(source) {
            Err(DefinitionError::Validation(msg)) => msg,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_minimal_definition_parses() {
        let definition = parse_definition(MINIMAL).expect("valid definition");
        assert_eq!(definition.steps.len(), 2);
        assert_eq!(definition.steps[0].action, StepAction::HttpRequest);
    }

    #[test]
    fn test_empty_steps_rejected() {
        let msg = expect_validation_error("steps: []\n");
        assert!(msg.contains("no steps"));
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let msg = expect_validation_error(
            r#"
steps:
  - id: a
    action: ui_form
    template: checkout
  - id: a
    action: ui_form
    template: checkout
"#,
        );
        assert!(msg.contains("duplicate step id 'a'"));
    }

    #[test]
    fn test_unknown_condition_target_rejected() {
        let msg = expect_validation_error(
            r#"
steps:
  - id: start
    action: http_request
    mock_response:
      ok: true
    conditions:
      - when: "ok"
        next: missing_step
"#,
        );
        assert!(msg.contains("references unknown step 'missing_step'"));
    }

    #[test]
    fn test_unknown_timeout_target_rejected() {
        let msg = expect_validation_error(
            r#"
steps:
  - id: wait
    action: poll_db
    table: orders
    query:
      status: settled
    on_timeout: nowhere
"#,
        );
        assert!(msg.contains("on_timeout references unknown step 'nowhere'"));
    }

    #[test]
    fn test_http_request_needs_request_or_mock() {
        let msg = expect_validation_error("steps:\n  - id: bare\n    action: http_request\n");
        assert!(msg.contains("without a request or mock_response"));

        parse_definition(
            "steps:\n  - id: mocked\n    action: http_request\n    mock_response:\n      ok: true\n",
        )
        .expect("mock_response alone is enough");
    }

    #[test]
    fn test_poll_db_needs_table_and_query() {
        let msg = expect_validation_error("steps:\n  - id: wait\n    action: poll_db\n");
        assert!(msg.contains("without a table"));
        assert!(msg.contains("without a query"));
    }

    #[test]
    fn test_ui_form_needs_template() {
        let msg = expect_validation_error("steps:\n  - id: show\n    action: ui_form\n");
        assert!(msg.contains("without a template"));
    }

    #[test]
    fn test_all_problems_reported_together() {
        let msg = expect_validation_error(
            r#"
steps:
  - id: a
    action: poll_db
  - id: a
    action: ui_form
"#,
        );
        assert!(msg.contains("duplicate step id"));
        assert!(msg.contains("without a table"));
        assert!(msg.contains("without a template"));
    }

    #[test]
    fn test_load_file_takes_id_from_stem() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("order_flow.yaml");
        let mut file = std::fs::File::create(&path).expect("create file");
        file.write_all(MINIMAL.as_bytes()).expect("write file");

        let definition = load_definition_file(&path).expect("valid definition");
        assert_eq!(definition.id, "order_flow");
    }

    #[test]
    fn test_inline_id_wins_over_stem() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("whatever.yaml");
        std::fs::write(&path, format!("id: order_flow\n{MINIMAL}")).expect("write file");

        let definition = load_definition_file(&path).expect("valid definition");
        assert_eq!(definition.id, "order_flow");
    }
}
