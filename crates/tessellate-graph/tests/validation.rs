use tessellate_graph::{
    Argument, Diagnostic, Document, DocumentFormat, FinalizeConfig, Finalizer, GraphError,
    OneOrMany, PipelineNode, SourceRef, StepInput, finalize, finalize_in_place, parse_document,
    render_document, validate, validate_or_raise,
};

const BASE: &str = include_str!("fixtures/base_pipeline.cwl");

fn base() -> Document {
    parse_document(BASE, DocumentFormat::Yaml).expect("fixture should parse")
}

fn edit_pipeline(document: &mut Document, edit: impl FnOnce(&mut PipelineNode)) {
    let mut pipeline = document.pipeline().expect("pipeline should exist").clone();
    edit(&mut pipeline);
    document.upsert_node(pipeline.into());
}

#[test]
fn validate_or_raise_base_expected_ok() {
    let diagnostics = validate_or_raise(&base(), &[]).expect("base should be valid");
    assert!(diagnostics.is_empty());
}

#[test]
fn finalize_feedback_edge_expected_cycle_rejected() {
    let mut document = base();
    edit_pipeline(&mut document, |pipeline| {
        if let Some(analyse) = pipeline.steps.get_mut("analyse") {
            analyse.inputs.insert(
                "previous_results".to_string(),
                StepInput::Source("process/process_results".to_string()),
            );
        }
    });

    let error = finalize(&document, &FinalizeConfig::default()).expect_err("cycle should fail");
    match error {
        GraphError::GraphIntegrity {
            reason,
            offending_id,
        } => {
            assert!(reason.contains("[acyclic]"), "{reason}");
            assert!(
                ["analyse", "stageout_data_analysis", "split_tiles", "process"]
                    .contains(&offending_id.as_str()),
                "{offending_id}"
            );
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn finalize_missing_producer_step_expected_integrity_error_naming_it() {
    let mut document = base();
    edit_pipeline(&mut document, |pipeline| {
        pipeline.steps.shift_remove("analyse");
    });

    let error = finalize(&document, &FinalizeConfig::default()).expect_err("should fail");
    assert!(
        matches!(&error, GraphError::GraphIntegrity { offending_id, .. } if offending_id == "analyse"),
        "{error}"
    );
}

#[test]
fn finalize_missing_process_task_expected_integrity_error() {
    let mut document = base();
    edit_pipeline(&mut document, |pipeline| {
        if let Some(process) = pipeline.steps.get_mut("process") {
            process.run = "#process_v2".to_string();
        }
    });

    let error = finalize(&document, &FinalizeConfig::default()).expect_err("should fail");
    assert!(
        matches!(&error, GraphError::GraphIntegrity { reason, offending_id }
            if offending_id == "process" && reason.contains("process_v2")),
        "{error}"
    );
}

#[test]
fn finalize_missing_pipeline_input_expected_integrity_error() {
    let mut document = base();
    edit_pipeline(&mut document, |pipeline| {
        pipeline.inputs.clear();
    });

    let error = finalize(&document, &FinalizeConfig::default()).expect_err("should fail");
    assert!(
        matches!(&error, GraphError::GraphIntegrity { reason, .. } if reason.contains("spatial_extent")),
        "{error}"
    );
}

#[test]
fn finalize_in_place_argument_on_pruned_port_expected_error_and_untouched_document() {
    let mut document = base();
    let mut process = document.task("process").cloned().expect("process task");
    process.arguments.extend([
        Argument::literal("--data_analysis_results"),
        Argument::input("data_analysis_results"),
    ]);
    document.upsert_node(process.into());
    let before = document.clone();

    let error = finalize_in_place(&mut document, &FinalizeConfig::default())
        .expect_err("pruned port should fail validation");
    assert!(
        matches!(&error, GraphError::GraphIntegrity { offending_id, .. } if offending_id == "process"),
        "{error}"
    );
    assert_eq!(document, before);
    assert_eq!(document.len(), 3);
}

#[test]
fn parse_malformed_resource_requirement_expected_format_error() {
    let source = BASE.replace("coresMax: 2", "coresMax: [2]");
    let error = parse_document(&source, DocumentFormat::Yaml).expect_err("should be rejected");
    assert!(
        matches!(&error, GraphError::DocumentFormat(message) if message.contains("ResourceRequirement")),
        "{error}"
    );
}

#[test]
fn parse_union_port_type_expected_format_error() {
    let source = BASE.replacen(
        "spatial_extent:\n        type: string[]\n        doc",
        "spatial_extent:\n        type: [string, int]\n        doc",
        1,
    );
    let error = parse_document(&source, DocumentFormat::Yaml).expect_err("should be rejected");
    assert!(matches!(error, GraphError::DocumentFormat(_)));
}

#[test]
fn validate_finalized_then_broken_output_expected_diagnostic() {
    let mut document = finalize(&base(), &FinalizeConfig::default())
        .expect("finalize should succeed")
        .document;
    edit_pipeline(&mut document, |pipeline| {
        pipeline.steps.shift_remove("merge_results");
    });

    let diagnostics = validate(&document, &[]);
    assert!(
        diagnostics
            .iter()
            .any(|d| d.rule == "output_source_resolves" && d.is_error())
    );
}

/// A finalized document with `edit` applied, written out and read back.
fn reloaded_finalized(edit: impl FnOnce(&mut PipelineNode)) -> Document {
    let mut document = finalize(&base(), &FinalizeConfig::default())
        .expect("finalize should succeed")
        .document;
    edit_pipeline(&mut document, edit);
    let rendered =
        render_document(&document, DocumentFormat::Yaml).expect("render should succeed");
    parse_document(&rendered, DocumentFormat::Yaml).expect("rendered document should parse")
}

fn scatter_messages(diagnostics: &[Diagnostic]) -> Vec<&str> {
    diagnostics
        .iter()
        .filter(|d| d.rule == "scatter_ports_array")
        .inspect(|d| {
            assert!(d.is_error());
            assert_eq!(d.step_id.as_deref(), Some("process"));
        })
        .map(|d| d.message.as_str())
        .collect()
}

/// Validates without re-running the rewrite, which would repair the scatter.
fn finalize_without_edits(document: &Document) -> GraphError {
    Finalizer::new(FinalizeConfig::default())
        .with_edits(Vec::new())
        .finalize(document)
        .expect_err("broken scatter should fail validation")
}

#[test]
fn validate_scatter_extracting_unknown_record_field_expected_error() {
    let document = reloaded_finalized(|pipeline| {
        if let Some(process) = pipeline.steps.get_mut("process") {
            process.inputs.insert(
                "spatial_extent".to_string(),
                StepInput::field_extraction(&SourceRef::step_output("split_tiles", "tiles"), "bbox"),
            );
        }
    });

    let diagnostics = validate(&document, &[]);
    assert_eq!(
        scatter_messages(&diagnostics),
        ["scattered port 'spatial_extent' extracts 'bbox', which records of 'split_tiles/tiles' do not have"]
    );

    match finalize_without_edits(&document) {
        GraphError::GraphIntegrity {
            reason,
            offending_id,
        } => {
            assert!(reason.starts_with("[scatter_ports_array]"), "{reason}");
            assert!(reason.contains("'bbox'"), "{reason}");
            assert_eq!(offending_id, "process");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn validate_scatter_over_two_ports_without_method_expected_errors() {
    let document = reloaded_finalized(|pipeline| {
        if let Some(process) = pipeline.steps.get_mut("process") {
            process.scatter = Some(OneOrMany::Many(vec![
                "spatial_extent".to_string(),
                "other".to_string(),
            ]));
            process.scatter_method = None;
        }
    });

    let diagnostics = validate(&document, &[]);
    assert_eq!(
        scatter_messages(&diagnostics),
        [
            "scatter over 2 ports needs a scatterMethod",
            "scattered port 'other' is not bound in 'in'"
        ]
    );

    match finalize_without_edits(&document) {
        GraphError::GraphIntegrity {
            reason,
            offending_id,
        } => {
            assert_eq!(reason, "[scatter_ports_array] scatter over 2 ports needs a scatterMethod");
            assert_eq!(offending_id, "process");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn finalize_packed_qualified_sources_expected_valid() {
    let source = BASE
        .replace(
            "spatial_extent: spatial_extent",
            "spatial_extent: \"#main/spatial_extent\"",
        )
        .replace(
            "analyse/data_analysis_results",
            "\"#main/analyse/data_analysis_results\"",
        )
        .replace(
            "outputSource: process/process_results",
            "outputSource: \"#main/process/process_results\"",
        );
    let document = parse_document(&source, DocumentFormat::Yaml).expect("packed document should parse");

    assert!(validate(&document, &[]).is_empty());
    assert_eq!(
        document.dependency_edges().into_iter().collect::<Vec<_>>(),
        [("analyse".to_string(), "process".to_string())]
    );

    let finalized = finalize(&document, &FinalizeConfig::default())
        .expect("finalize should succeed")
        .document;
    assert!(validate_or_raise(&finalized, &[]).is_ok());
}
