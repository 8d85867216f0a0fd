use crate::{
    Diagnostic, Document, Node, NodeKind, PipelineNode, Severity, SourceRef, Step, TaskNode,
    ValidationError,
};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

pub trait LintRule {
    fn name(&self) -> &str;
    fn apply(&self, document: &Document) -> Vec<Diagnostic>;
}

pub fn validate(document: &Document, extra_rules: &[&dyn LintRule]) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    diagnostics.extend(rule_single_pipeline(document));
    diagnostics.extend(rule_node_id_unique(document));
    for pipeline in pipelines(document) {
        diagnostics.extend(rule_step_run_resolves(document, pipeline));
        diagnostics.extend(rule_step_source_resolves(pipeline));
        diagnostics.extend(rule_output_source_resolves(pipeline));
        diagnostics.extend(rule_acyclic(pipeline));
        diagnostics.extend(rule_scatter_ports_array(document, pipeline));
        diagnostics.extend(rule_step_out_declared(document, pipeline));
        diagnostics.extend(rule_step_input_declared(document, pipeline));
        diagnostics.extend(rule_gather_input_array(document, pipeline));
    }
    for task in document.nodes().filter_map(Node::as_task) {
        diagnostics.extend(rule_argument_reference_declared(task));
        diagnostics.extend(rule_capture_rule_supported(task));
    }

    for rule in extra_rules {
        diagnostics.extend(rule.apply(document));
    }

    diagnostics
}

pub fn validate_or_raise(
    document: &Document,
    extra_rules: &[&dyn LintRule],
) -> Result<Vec<Diagnostic>, ValidationError> {
    let diagnostics = validate(document, extra_rules);
    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ValidationError::new(diagnostics));
    }
    Ok(diagnostics)
}

fn pipelines(document: &Document) -> impl Iterator<Item = &PipelineNode> {
    document
        .find_nodes_by_kind(NodeKind::Pipeline)
        .filter_map(Node::as_pipeline)
}

fn step_task<'a>(document: &'a Document, step: &Step) -> Option<&'a TaskNode> {
    document.task(step.run_ref())
}

fn rule_single_pipeline(document: &Document) -> Vec<Diagnostic> {
    let ids: Vec<&str> = pipelines(document).map(|pipeline| pipeline.id.as_str()).collect();
    match ids.len() {
        1 => Vec::new(),
        0 => vec![Diagnostic::new(
            "single_pipeline",
            Severity::Error,
            "document must contain exactly one Workflow node; found none",
        )
        .with_fix("add a Workflow node to $graph")],
        _ => vec![
            Diagnostic::new(
                "single_pipeline",
                Severity::Error,
                format!(
                    "document must contain exactly one Workflow node; found {}",
                    ids.join(", ")
                ),
            )
            .with_node_id(ids[1]),
        ],
    }
}

fn rule_node_id_unique(document: &Document) -> Vec<Diagnostic> {
    document
        .entries()
        .filter(|(key, node)| *key != node.id())
        .map(|(key, node)| {
            Diagnostic::new(
                "node_id_unique",
                Severity::Error,
                format!("node registered as '{key}' carries id '{}'", node.id()),
            )
            .with_node_id(key)
        })
        .collect()
}

fn rule_step_run_resolves(document: &Document, pipeline: &PipelineNode) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for (step_id, step) in &pipeline.steps {
        let message = match document.find_node(step.run_ref()) {
            Some(Node::Task(_)) => continue,
            Some(Node::Pipeline(_)) => format!(
                "step runs '{}', which is a Workflow; nested workflows are not supported",
                step.run_ref()
            ),
            None => format!("step runs '{}', which is not in the document", step.run_ref()),
        };
        diagnostics.push(
            Diagnostic::new("step_run_resolves", Severity::Error, message)
                .with_node_id(&pipeline.id)
                .with_step_id(step_id),
        );
    }
    diagnostics
}

fn rule_step_source_resolves(pipeline: &PipelineNode) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for (step_id, step) in &pipeline.steps {
        for (port, input) in &step.inputs {
            for source in input.sources() {
                if let Some(reason) = unresolved_source(pipeline, &source) {
                    diagnostics.push(
                        Diagnostic::new(
                            "step_source_resolves",
                            Severity::Error,
                            format!("input '{port}' sources '{source}': {reason}"),
                        )
                        .with_node_id(&pipeline.id)
                        .with_step_id(step_id),
                    );
                }
            }
        }
    }
    diagnostics
}

fn unresolved_source(pipeline: &PipelineNode, source: &SourceRef) -> Option<String> {
    match &pipeline.resolve_source(source.clone()) {
        SourceRef::PipelineInput(name) => (!pipeline.inputs.contains_key(name))
            .then(|| format!("pipeline input '{name}' is not declared")),
        SourceRef::StepOutput { step, port } => match pipeline.steps.get(step) {
            None => Some(format!("step '{step}' does not exist")),
            Some(producer) if !producer.produces(port) => {
                Some(format!("step '{step}' does not produce '{port}'"))
            }
            Some(_) => None,
        },
    }
}

fn rule_output_source_resolves(pipeline: &PipelineNode) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for (output_id, output) in &pipeline.outputs {
        let sources = output.sources();
        if sources.is_empty() {
            diagnostics.push(
                Diagnostic::new(
                    "output_source_resolves",
                    Severity::Error,
                    format!("pipeline output '{output_id}' has no outputSource"),
                )
                .with_node_id(&pipeline.id),
            );
        }
        for source in sources {
            let reason = match pipeline.resolve_source(source.clone()) {
                SourceRef::PipelineInput(_) => Some("not a step output".to_string()),
                step_output => unresolved_source(pipeline, &step_output),
            };
            if let Some(reason) = reason {
                diagnostics.push(
                    Diagnostic::new(
                        "output_source_resolves",
                        Severity::Error,
                        format!("pipeline output '{output_id}' sources '{source}': {reason}"),
                    )
                    .with_node_id(&pipeline.id)
                    .with_step_id(source.step().unwrap_or(output_id)),
                );
            }
        }
    }
    diagnostics
}

fn rule_acyclic(pipeline: &PipelineNode) -> Vec<Diagnostic> {
    let edges = pipeline.dependency_edges();
    let mut graph = DiGraphMap::<&str, ()>::new();
    for step_id in pipeline.steps.keys() {
        graph.add_node(step_id.as_str());
    }
    for (from, to) in &edges {
        graph.add_edge(from.as_str(), to.as_str(), ());
    }

    match toposort(&graph, None) {
        Ok(_) => Vec::new(),
        Err(cycle) => vec![
            Diagnostic::new(
                "acyclic",
                Severity::Error,
                format!(
                    "step dependency graph has a cycle through '{}'",
                    cycle.node_id()
                ),
            )
            .with_node_id(&pipeline.id)
            .with_step_id(cycle.node_id()),
        ],
    }
}

fn rule_scatter_ports_array(document: &Document, pipeline: &PipelineNode) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for (step_id, step) in pipeline.steps.iter().filter(|(_, step)| step.is_scattered()) {
        let mut report = |message: String| {
            diagnostics.push(
                Diagnostic::new("scatter_ports_array", Severity::Error, message)
                    .with_node_id(&pipeline.id)
                    .with_step_id(step_id),
            );
        };

        let ports = step.scatter_ports();
        if ports.len() > 1 && step.scatter_method.is_none() {
            report(format!(
                "scatter over {} ports needs a scatterMethod",
                ports.len()
            ));
        }

        let task = step_task(document, step);
        for port in ports {
            let Some(input) = step.inputs.get(port) else {
                report(format!("scattered port '{port}' is not bound in 'in'"));
                continue;
            };

            match task.map(|task| task.inputs.get(port)) {
                Some(None) => report(format!(
                    "scattered port '{port}' is not declared on task '{}'",
                    step.run_ref()
                )),
                Some(Some(declared)) if !declared.schema().is_array() => report(format!(
                    "scattered port '{port}' must be array-typed on task '{}', found {}",
                    step.run_ref(),
                    declared.schema()
                )),
                _ => {}
            }

            let Some(field) = input.extracted_field() else {
                continue;
            };
            for source in input.sources() {
                let SourceRef::StepOutput {
                    step: producer,
                    port: produced,
                } = &source
                else {
                    continue;
                };
                let record = pipeline
                    .steps
                    .get(producer)
                    .and_then(|producer| step_task(document, producer))
                    .and_then(|task| task.outputs.get(produced))
                    .and_then(|output| output.schema().as_record_array());
                if record.is_some_and(|record| record.field(field).is_none()) {
                    report(format!(
                        "scattered port '{port}' extracts '{field}', which records of '{source}' do not have"
                    ));
                }
            }
        }
    }
    diagnostics
}

fn rule_step_out_declared(document: &Document, pipeline: &PipelineNode) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for (step_id, step) in &pipeline.steps {
        let Some(task) = step_task(document, step) else {
            continue;
        };
        for port in &step.outputs {
            if !task.outputs.contains_key(port) {
                diagnostics.push(
                    Diagnostic::new(
                        "step_out_declared",
                        Severity::Error,
                        format!("step lists output '{port}' that task '{}' does not declare", task.id),
                    )
                    .with_node_id(&pipeline.id)
                    .with_step_id(step_id),
                );
            }
        }
    }
    diagnostics
}

fn rule_step_input_declared(document: &Document, pipeline: &PipelineNode) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for (step_id, step) in &pipeline.steps {
        let Some(task) = step_task(document, step) else {
            continue;
        };
        for port in step.inputs.keys() {
            if !task.inputs.contains_key(port) {
                diagnostics.push(
                    Diagnostic::new(
                        "step_input_declared",
                        Severity::Warning,
                        format!("step binds input '{port}' that task '{}' does not declare", task.id),
                    )
                    .with_node_id(&pipeline.id)
                    .with_step_id(step_id)
                    .with_fix(format!("declare '{port}' on task '{}' or drop the binding", task.id)),
                );
            }
        }
    }
    diagnostics
}

/// A plain step consuming a scattered step's output receives a list.
fn rule_gather_input_array(document: &Document, pipeline: &PipelineNode) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for (step_id, step) in pipeline.steps.iter().filter(|(_, step)| !step.is_scattered()) {
        let Some(task) = step_task(document, step) else {
            continue;
        };
        for (port, input) in &step.inputs {
            let gathers = input.sources().iter().any(|source| {
                source
                    .step()
                    .and_then(|producer| pipeline.steps.get(producer))
                    .is_some_and(Step::is_scattered)
            });
            let Some(declared) = task.inputs.get(port) else {
                continue;
            };
            if gathers && !declared.schema().is_array() {
                diagnostics.push(
                    Diagnostic::new(
                        "gather_input_array",
                        Severity::Warning,
                        format!(
                            "input '{port}' gathers a scattered output but task '{}' declares it as {}",
                            task.id,
                            declared.schema()
                        ),
                    )
                    .with_node_id(&pipeline.id)
                    .with_step_id(step_id),
                );
            }
        }
    }
    diagnostics
}

fn rule_argument_reference_declared(task: &TaskNode) -> Vec<Diagnostic> {
    task.arguments
        .iter()
        .filter_map(|argument| argument.input_ref())
        .filter(|reference| !task.inputs.contains_key(&reference.port))
        .map(|reference| {
            Diagnostic::new(
                "argument_reference_declared",
                Severity::Error,
                format!(
                    "argument '{}' references undeclared input '{}'",
                    reference.render(),
                    reference.port
                ),
            )
            .with_node_id(&task.id)
        })
        .collect()
}

fn rule_capture_rule_supported(task: &TaskNode) -> Vec<Diagnostic> {
    task.outputs
        .iter()
        .filter(|(_, output)| output.capture_rule().is_none())
        .map(|(port, _)| {
            Diagnostic::new(
                "capture_rule_supported",
                Severity::Error,
                format!("output '{port}' needs a glob capture, optionally parsed as JSON"),
            )
            .with_node_id(&task.id)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DocumentFormat, StepInput, parse_document};

    const BASE: &str = include_str!("../tests/fixtures/base_pipeline.cwl");

    fn base() -> Document {
        parse_document(BASE, DocumentFormat::Yaml).expect("fixture should parse")
    }

    fn with_pipeline(document: &mut Document, edit: impl FnOnce(&mut PipelineNode)) {
        let mut pipeline = document.pipeline().expect("pipeline should exist").clone();
        edit(&mut pipeline);
        document.upsert_node(pipeline.into());
    }

    fn rules(diagnostics: &[Diagnostic]) -> Vec<&str> {
        diagnostics.iter().map(|d| d.rule.as_str()).collect()
    }

    #[test]
    fn validate_base_fixture_expected_no_diagnostics() {
        assert!(validate(&base(), &[]).is_empty());
    }

    #[test]
    fn validate_cycle_expected_acyclic_error() {
        let mut document = base();
        with_pipeline(&mut document, |pipeline| {
            if let Some(analyse) = pipeline.steps.get_mut("analyse") {
                analyse.inputs.insert(
                    "feedback".to_string(),
                    StepInput::Source("process/process_results".to_string()),
                );
            }
        });

        let diagnostics = validate(&document, &[]);
        assert!(rules(&diagnostics).contains(&"acyclic"));
    }

    #[test]
    fn validate_unknown_run_expected_step_error() {
        let mut document = base();
        with_pipeline(&mut document, |pipeline| {
            if let Some(process) = pipeline.steps.get_mut("process") {
                process.run = "#missing".to_string();
            }
        });

        let error = validate_or_raise(&document, &[]).expect_err("validation should fail");
        let first = error.first_error().expect("an error should be reported");
        assert_eq!(first.rule, "step_run_resolves");
        assert_eq!(first.step_id.as_deref(), Some("process"));
    }

    #[test]
    fn validate_source_naming_unproduced_port_expected_error() {
        let mut document = base();
        with_pipeline(&mut document, |pipeline| {
            if let Some(process) = pipeline.steps.get_mut("process") {
                process.inputs.insert(
                    "data_analysis_results".to_string(),
                    StepInput::Source("analyse/tiles".to_string()),
                );
            }
        });
        assert_eq!(rules(&validate(&document, &[])), ["step_source_resolves"]);
    }

    #[test]
    fn validate_output_from_pipeline_input_expected_error() {
        let mut document = base();
        with_pipeline(&mut document, |pipeline| {
            if let Some(output) = pipeline.outputs.get_mut("execution_results") {
                output.output_source = crate::OneOrMany::One("spatial_extent".to_string());
            }
        });
        assert_eq!(rules(&validate(&document, &[])), ["output_source_resolves"]);
    }

    #[test]
    fn validate_scatter_over_scalar_port_expected_error() {
        let mut document = base();
        with_pipeline(&mut document, |pipeline| {
            if let Some(analyse) = pipeline.steps.get_mut("analyse") {
                analyse.scatter = Some(crate::OneOrMany::One("spatial_extent".to_string()));
            }
        });
        let mut analyse = document.task("analyse").cloned().expect("analyse task");
        analyse.inputs.insert(
            "spatial_extent".to_string(),
            crate::InputPort::new(crate::PortSchema::string()),
        );
        document.upsert_node(analyse.into());

        assert_eq!(
            rules(&validate(&document, &[])),
            ["scatter_ports_array", "gather_input_array"]
        );
    }

    #[test]
    fn validate_argument_on_pruned_input_expected_error() {
        let mut document = base();
        let mut process = document.task("process").cloned().expect("process task");
        process.inputs.shift_remove("data_analysis_results");
        process
            .arguments
            .push(crate::Argument::input("data_analysis_results"));
        document.upsert_node(process.into());

        let diagnostics = validate(&document, &[]);
        assert!(rules(&diagnostics).contains(&"argument_reference_declared"));
        assert!(rules(&diagnostics).contains(&"step_input_declared"));
    }

    #[test]
    fn validate_unsupported_capture_expected_error() {
        let mut document = base();
        let mut analyse = document.task("analyse").cloned().expect("analyse task");
        if let Some(output) = analyse.outputs.get_mut("data_analysis_results") {
            output.output_binding = None;
        }
        document.upsert_node(analyse.into());
        assert_eq!(rules(&validate(&document, &[])), ["capture_rule_supported"]);
    }

    #[test]
    fn validate_step_input_undeclared_expected_warning_only() {
        let mut document = base();
        with_pipeline(&mut document, |pipeline| {
            if let Some(analyse) = pipeline.steps.get_mut("analyse") {
                analyse
                    .inputs
                    .insert("mode".to_string(), StepInput::Source("spatial_extent".to_string()));
            }
        });
        let diagnostics =
            validate_or_raise(&document, &[]).expect("warnings should not fail validation");
        assert_eq!(rules(&diagnostics), ["step_input_declared"]);
        assert_eq!(diagnostics[0].severity, Severity::Warning);
    }

    struct NoLabels;

    impl LintRule for NoLabels {
        fn name(&self) -> &str {
            "no_labels"
        }

        fn apply(&self, document: &Document) -> Vec<Diagnostic> {
            pipelines(document)
                .filter(|pipeline| pipeline.extra.contains_key("label"))
                .map(|pipeline| {
                    Diagnostic::new(self.name(), Severity::Info, "pipeline has a label")
                        .with_node_id(&pipeline.id)
                })
                .collect()
        }
    }

    #[test]
    fn validate_extra_rule_expected_included() {
        let diagnostics = validate(&base(), &[&NoLabels]);
        assert_eq!(rules(&diagnostics), ["no_labels"]);
    }
}
