//! Structural edits on the pipeline node.
//!
//! Edits run against a working copy of the pipeline and of every task they
//! touch. The caller only sees the result once the whole plan succeeded.

use crate::templates::{
    DATA_ANALYSIS_RESULTS, EXECUTION_RESULTS, MERGE_NODE_ID, PROCESS_RESULTS, SPATIAL_EXTENT,
    SPLIT_NODE_ID, SPLIT_RESULTS, STAGEOUT_NODE_ID, STAGEOUT_RESULTS, TILES,
};
use crate::{
    Document, GraphError, OneOrMany, PipelineNode, PipelineOutput, PortSchema, PortType,
    ScatterMethod, SourceRef, Step, StepInput, TaskNode,
};
use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::fmt;

pub const ANALYSE_STEP: &str = "analyse";
pub const PROCESS_STEP: &str = "process";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditOutcome {
    Applied,
    AlreadyApplied,
}

impl fmt::Display for EditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => f.write_str("applied"),
            Self::AlreadyApplied => f.write_str("already applied"),
        }
    }
}

/// Insert `step_id` between `producer` and the `consumer` step.
#[derive(Clone, Debug, PartialEq)]
pub struct Splice {
    pub producer: SourceRef,
    pub step_id: String,
    pub task_id: String,
    pub input: String,
    pub output: String,
    pub consumer: String,
    pub consumer_input: String,
}

/// Fan `step_id` out over `port`, fed by `field` of each record in `source`.
#[derive(Clone, Debug, PartialEq)]
pub struct PromoteScatter {
    pub step_id: String,
    pub port: String,
    pub source: SourceRef,
    pub field: String,
    pub method: ScatterMethod,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEdit {
    InsertStep {
        step_id: String,
        step: Step,
        before: Option<String>,
    },
    Splice(Splice),
    PromoteScatter(PromoteScatter),
    BindOutput {
        output: String,
        schema: PortSchema,
        source: SourceRef,
    },
}

impl PipelineEdit {
    pub fn label(&self) -> String {
        match self {
            Self::InsertStep { step_id, .. } => format!("insert step {step_id}"),
            Self::Splice(splice) => {
                format!("splice {} into {}", splice.step_id, splice.consumer)
            }
            Self::PromoteScatter(scatter) => {
                format!("scatter {} over {}", scatter.step_id, scatter.port)
            }
            Self::BindOutput { output, .. } => format!("bind output {output}"),
        }
    }
}

/// Edits turning the analyse -> process base pipeline into the
/// analyse -> stage-out -> split -> scattered process -> merge shape.
pub fn scatter_gather_plan() -> Vec<PipelineEdit> {
    let analysis = SourceRef::step_output(ANALYSE_STEP, DATA_ANALYSIS_RESULTS);
    let tiles = SourceRef::step_output(SPLIT_NODE_ID, TILES);

    vec![
        PipelineEdit::InsertStep {
            step_id: SPLIT_NODE_ID.to_string(),
            step: Step::new(SPLIT_NODE_ID)
                .with_input(
                    SPATIAL_EXTENT,
                    StepInput::from_source(&SourceRef::PipelineInput(SPATIAL_EXTENT.to_string())),
                )
                .with_input(DATA_ANALYSIS_RESULTS, StepInput::from_source(&analysis))
                .with_output(SPLIT_RESULTS)
                .with_output(TILES),
            before: Some(PROCESS_STEP.to_string()),
        },
        PipelineEdit::Splice(Splice {
            producer: analysis,
            step_id: STAGEOUT_NODE_ID.to_string(),
            task_id: STAGEOUT_NODE_ID.to_string(),
            input: DATA_ANALYSIS_RESULTS.to_string(),
            output: STAGEOUT_RESULTS.to_string(),
            consumer: SPLIT_NODE_ID.to_string(),
            consumer_input: STAGEOUT_RESULTS.to_string(),
        }),
        PipelineEdit::PromoteScatter(PromoteScatter {
            step_id: PROCESS_STEP.to_string(),
            port: SPATIAL_EXTENT.to_string(),
            source: tiles,
            field: SPATIAL_EXTENT.to_string(),
            method: ScatterMethod::FlatCrossproduct,
        }),
        PipelineEdit::InsertStep {
            step_id: MERGE_NODE_ID.to_string(),
            step: Step::new(MERGE_NODE_ID)
                .with_input(
                    PROCESS_RESULTS,
                    StepInput::from_source(&SourceRef::step_output(PROCESS_STEP, PROCESS_RESULTS)),
                )
                .with_output(EXECUTION_RESULTS),
            before: None,
        },
        PipelineEdit::BindOutput {
            output: EXECUTION_RESULTS.to_string(),
            schema: PortSchema::directory(),
            source: SourceRef::step_output(MERGE_NODE_ID, EXECUTION_RESULTS),
        },
    ]
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EditRecord {
    pub label: String,
    pub outcome: EditOutcome,
}

/// Result of a successful rewrite: the new pipeline, every task whose
/// definition changed, and what happened to each edit.
#[derive(Clone, Debug)]
pub struct Rewrite {
    pub pipeline: PipelineNode,
    pub tasks: Vec<TaskNode>,
    pub outcomes: Vec<EditRecord>,
}

impl Rewrite {
    pub fn applied(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|record| record.outcome == EditOutcome::Applied)
            .count()
    }
}

pub struct PipelineRewriter<'a> {
    document: &'a Document,
    synthesized: &'a [TaskNode],
}

impl<'a> PipelineRewriter<'a> {
    /// Task lookups resolve against `synthesized` first, then `document`.
    pub fn new(document: &'a Document, synthesized: &'a [TaskNode]) -> Self {
        Self {
            document,
            synthesized,
        }
    }

    pub fn rewrite(
        &self,
        pipeline: &PipelineNode,
        edits: &[PipelineEdit],
    ) -> Result<Rewrite, GraphError> {
        let mut workspace = Workspace {
            document: self.document,
            synthesized: self.synthesized,
            pipeline: pipeline.clone(),
            tasks: IndexMap::new(),
        };

        let mut outcomes = Vec::with_capacity(edits.len());
        for edit in edits {
            let outcome = workspace.apply(edit)?;
            if outcome == EditOutcome::AlreadyApplied {
                tracing::debug!(edit = %edit.label(), "edit already applied, skipping");
            }
            outcomes.push(EditRecord {
                label: edit.label(),
                outcome,
            });
        }

        Ok(Rewrite {
            pipeline: workspace.pipeline,
            tasks: workspace.tasks.into_values().collect(),
            outcomes,
        })
    }
}

struct Workspace<'a> {
    document: &'a Document,
    synthesized: &'a [TaskNode],
    pipeline: PipelineNode,
    tasks: IndexMap<String, TaskNode>,
}

impl Workspace<'_> {
    fn apply(&mut self, edit: &PipelineEdit) -> Result<EditOutcome, GraphError> {
        match edit {
            PipelineEdit::InsertStep {
                step_id,
                step,
                before,
            } => self.insert_step(step_id, step, before.as_deref()),
            PipelineEdit::Splice(splice) => self.splice(splice),
            PipelineEdit::PromoteScatter(scatter) => self.promote_scatter(scatter),
            PipelineEdit::BindOutput {
                output,
                schema,
                source,
            } => self.bind_output(output, schema, source),
        }
    }

    fn insert_step(
        &mut self,
        step_id: &str,
        step: &Step,
        before: Option<&str>,
    ) -> Result<EditOutcome, GraphError> {
        if let Some(existing) = self.pipeline.steps.get(step_id) {
            if existing.run_ref() == step.run_ref() {
                return Ok(EditOutcome::AlreadyApplied);
            }
            return Err(GraphError::integrity(
                step_id,
                format!(
                    "step already runs '{}', cannot insert one running '{}'",
                    existing.run_ref(),
                    step.run_ref()
                ),
            ));
        }

        self.require_task(step.run_ref(), step_id)?;
        for input in step.inputs.values() {
            for source in input.sources() {
                self.require_source(&source, step_id)?;
            }
        }

        self.place_step(step_id, step.clone(), before);
        Ok(EditOutcome::Applied)
    }

    fn splice(&mut self, splice: &Splice) -> Result<EditOutcome, GraphError> {
        self.require_source(&splice.producer, &splice.step_id)?;
        let consumer = self.step(&splice.consumer)?.clone();
        let inserted = SourceRef::step_output(&splice.step_id, &splice.output);
        let wired = consumer
            .inputs
            .get(&splice.consumer_input)
            .is_some_and(|input| input.sources() == [inserted.clone()]);

        match self.pipeline.steps.get(&splice.step_id) {
            Some(existing) if existing.run_ref() != splice.task_id => {
                return Err(GraphError::integrity(
                    &splice.step_id,
                    format!(
                        "step already runs '{}', cannot splice in '{}'",
                        existing.run_ref(),
                        splice.task_id
                    ),
                ));
            }
            Some(_) if wired => return Ok(EditOutcome::AlreadyApplied),
            Some(_) => {}
            None => {
                self.require_task(&splice.task_id, &splice.step_id)?;
                let step = Step::new(&splice.task_id)
                    .with_input(&splice.input, StepInput::from_source(&splice.producer))
                    .with_output(&splice.output);
                self.place_step(&splice.step_id, step, Some(&splice.consumer));
            }
        }

        let declared: BTreeSet<String> = self
            .require_task(consumer.run_ref(), &splice.consumer)?
            .inputs
            .keys()
            .cloned()
            .collect();
        let mut rewired = consumer;
        rewired.inputs.retain(|port, input| {
            declared.contains(port) || !input.sources().contains(&splice.producer)
        });
        rewired.inputs.insert(
            splice.consumer_input.clone(),
            StepInput::from_source(&inserted),
        );
        self.pipeline.steps.insert(splice.consumer.clone(), rewired);
        Ok(EditOutcome::Applied)
    }

    fn promote_scatter(&mut self, scatter: &PromoteScatter) -> Result<EditOutcome, GraphError> {
        let mut step = self.step(&scatter.step_id)?.clone();
        self.require_source(&scatter.source, &scatter.step_id)?;
        let target = self.record_field_schema(scatter)?;

        let task_id = step.run_ref().to_string();
        let mut task = self.require_task(&task_id, &scatter.step_id)?.clone();
        let Some(port) = task.inputs.get_mut(&scatter.port) else {
            return Err(GraphError::integrity(
                &task_id,
                format!("task declares no input '{}' to scatter over", scatter.port),
            ));
        };
        if widen(&scatter.port, port.schema(), &target)? {
            port.port_type = PortType::new(target);
        }
        task.inputs.retain(|name, _| name == &scatter.port);

        step.inputs = IndexMap::from([(
            scatter.port.clone(),
            StepInput::field_extraction(&scatter.source, &scatter.field),
        )]);
        step.scatter = Some(OneOrMany::One(scatter.port.clone()));
        step.scatter_method = Some(scatter.method);

        let unchanged = self.pipeline.steps.get(&scatter.step_id) == Some(&step)
            && self.task(&task_id) == Some(&task);
        if unchanged {
            return Ok(EditOutcome::AlreadyApplied);
        }

        self.pipeline.steps.insert(scatter.step_id.clone(), step);
        self.tasks.insert(task_id, task);
        Ok(EditOutcome::Applied)
    }

    fn bind_output(
        &mut self,
        output: &str,
        schema: &PortSchema,
        source: &SourceRef,
    ) -> Result<EditOutcome, GraphError> {
        if source.step().is_none() {
            return Err(GraphError::integrity(
                output,
                format!("pipeline output must come from a step, got '{source}'"),
            ));
        }
        self.require_source(source, output)?;

        let extra = match self.pipeline.outputs.get(output) {
            Some(existing)
                if existing.port_type.schema() == schema
                    && existing.sources() == [source.clone()] =>
            {
                return Ok(EditOutcome::AlreadyApplied);
            }
            Some(existing) => existing.extra.clone(),
            None => IndexMap::new(),
        };

        self.pipeline.outputs.insert(
            output.to_string(),
            PipelineOutput {
                port_type: PortType::new(schema.clone()),
                output_source: OneOrMany::Many(vec![source.to_string()]),
                extra,
            },
        );
        Ok(EditOutcome::Applied)
    }

    fn task(&self, id: &str) -> Option<&TaskNode> {
        self.tasks
            .get(id)
            .or_else(|| self.synthesized.iter().find(|task| task.id == id))
            .or_else(|| self.document.task(id))
    }

    fn require_task(&self, id: &str, referenced_by: &str) -> Result<&TaskNode, GraphError> {
        self.task(id).ok_or_else(|| {
            GraphError::integrity(referenced_by, format!("task '{id}' does not exist"))
        })
    }

    fn step(&self, id: &str) -> Result<&Step, GraphError> {
        self.pipeline
            .steps
            .get(id)
            .ok_or_else(|| GraphError::integrity(id, format!("step '{id}' does not exist")))
    }

    fn require_source(&self, source: &SourceRef, referenced_by: &str) -> Result<(), GraphError> {
        match &self.pipeline.resolve_source(source.clone()) {
            SourceRef::PipelineInput(name) if self.pipeline.inputs.contains_key(name) => Ok(()),
            SourceRef::PipelineInput(name) => Err(GraphError::integrity(
                referenced_by,
                format!("pipeline input '{name}' is not declared"),
            )),
            SourceRef::StepOutput { step, port } => {
                if self.step(step)?.produces(port) {
                    Ok(())
                } else {
                    Err(GraphError::integrity(
                        step.as_str(),
                        format!("step '{step}' does not produce '{port}'"),
                    ))
                }
            }
        }
    }

    /// Schema of `field` in the record-array output feeding the scatter.
    fn record_field_schema(&self, scatter: &PromoteScatter) -> Result<PortSchema, GraphError> {
        let SourceRef::StepOutput { step, port } = &scatter.source else {
            return Err(GraphError::integrity(
                &scatter.step_id,
                format!("scatter source '{}' is not a step output", scatter.source),
            ));
        };
        let producer = self.step(step)?;
        let task = self.require_task(producer.run_ref(), step)?;
        let output = task.outputs.get(port).ok_or_else(|| {
            GraphError::integrity(
                step.as_str(),
                format!("task '{}' declares no output '{port}'", task.id),
            )
        })?;
        let record = output.schema().as_record_array().ok_or_else(|| {
            GraphError::integrity(
                &scatter.step_id,
                format!(
                    "scatter source '{}' is {}, not a record array",
                    scatter.source,
                    output.schema()
                ),
            )
        })?;
        record
            .field(&scatter.field)
            .map(|field| field.schema.clone())
            .ok_or_else(|| {
                GraphError::integrity(
                    &scatter.step_id,
                    format!(
                        "records of '{}' have no field '{}'",
                        scatter.source, scatter.field
                    ),
                )
            })
    }

    fn place_step(&mut self, step_id: &str, step: Step, before: Option<&str>) {
        match before.and_then(|anchor| self.pipeline.steps.get_index_of(anchor)) {
            Some(index) => {
                self.pipeline
                    .steps
                    .shift_insert(index, step_id.to_string(), step);
            }
            None => {
                self.pipeline.steps.insert(step_id.to_string(), step);
            }
        }
    }
}

/// Whether `port` has to change from `from` to `to`. Only a scalar may be
/// widened to an array of itself.
fn widen(port: &str, from: &PortSchema, to: &PortSchema) -> Result<bool, GraphError> {
    if from == to {
        return Ok(false);
    }
    match (from, to.items()) {
        (PortSchema::Scalar(_) | PortSchema::Directory, Some(items)) if items == from => Ok(true),
        _ => Err(GraphError::UnsupportedPortWidening {
            port: port.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DocumentFormat, InputPort, TemplateConfig, parse_document, synthesize_nodes};

    const BASE: &str = include_str!("../tests/fixtures/base_pipeline.cwl");

    fn base() -> Document {
        parse_document(BASE, DocumentFormat::Yaml).expect("fixture should parse")
    }

    fn rewrite(document: &Document, edits: &[PipelineEdit]) -> Result<Rewrite, GraphError> {
        let synthesized = synthesize_nodes(&TemplateConfig::default());
        let pipeline = document.pipeline().expect("pipeline should exist");
        PipelineRewriter::new(document, &synthesized).rewrite(pipeline, edits)
    }

    fn step_ids(pipeline: &PipelineNode) -> Vec<&str> {
        pipeline.steps.keys().map(String::as_str).collect()
    }

    #[test]
    fn scatter_gather_plan_expected_step_order() {
        let result = rewrite(&base(), &scatter_gather_plan()).expect("rewrite should succeed");
        assert_eq!(
            step_ids(&result.pipeline),
            [
                "analyse",
                "stageout_data_analysis",
                "split_tiles",
                "process",
                "merge_results"
            ]
        );
        assert_eq!(result.applied(), 5);
    }

    #[test]
    fn scatter_gather_plan_expected_only_process_task_changed() {
        let result = rewrite(&base(), &scatter_gather_plan()).expect("rewrite should succeed");
        let ids: Vec<&str> = result.tasks.iter().map(|task| task.id.as_str()).collect();
        assert_eq!(ids, ["process"]);

        let process = &result.tasks[0];
        assert_eq!(process.inputs.keys().collect::<Vec<_>>(), ["spatial_extent"]);
        assert_eq!(
            process.inputs.get("spatial_extent").map(InputPort::schema),
            Some(&PortSchema::string_array())
        );
    }

    #[test]
    fn splice_consumer_without_declared_producer_port_expected_input_dropped() {
        let document = base();
        let mut synthesized = synthesize_nodes(&TemplateConfig::default()).to_vec();
        synthesized[1].inputs.shift_remove(DATA_ANALYSIS_RESULTS);
        let pipeline = document.pipeline().expect("pipeline should exist");

        let result = PipelineRewriter::new(&document, &synthesized)
            .rewrite(pipeline, &scatter_gather_plan()[..2])
            .expect("rewrite should succeed");
        let split = result
            .pipeline
            .steps
            .get(SPLIT_NODE_ID)
            .expect("split step should exist");
        assert_eq!(
            split.inputs.keys().collect::<Vec<_>>(),
            ["spatial_extent", "stageout_data_analysis_results"]
        );
    }

    #[test]
    fn rewrite_twice_expected_every_edit_already_applied() {
        let document = base();
        let synthesized = synthesize_nodes(&TemplateConfig::default());
        let first = rewrite(&document, &scatter_gather_plan()).expect("rewrite should succeed");

        let mut rewritten = document.clone();
        rewritten.upsert_node(first.pipeline.clone().into());
        for task in &first.tasks {
            rewritten.upsert_node(task.clone().into());
        }

        let second = PipelineRewriter::new(&rewritten, &synthesized)
            .rewrite(&first.pipeline, &scatter_gather_plan())
            .expect("second rewrite should succeed");
        assert_eq!(second.applied(), 0);
        assert!(second.tasks.is_empty());
        assert_eq!(second.pipeline, first.pipeline);
    }

    #[test]
    fn insert_step_same_id_other_task_expected_integrity_error() {
        let edit = PipelineEdit::InsertStep {
            step_id: PROCESS_STEP.to_string(),
            step: Step::new(MERGE_NODE_ID),
            before: None,
        };
        let error = rewrite(&base(), &[edit]).expect_err("conflicting insert should fail");
        assert!(
            matches!(error, GraphError::GraphIntegrity { offending_id, .. } if offending_id == "process")
        );
    }

    #[test]
    fn splice_missing_producer_expected_integrity_error_naming_step() {
        let mut plan = scatter_gather_plan();
        if let PipelineEdit::Splice(splice) = &mut plan[1] {
            splice.producer = SourceRef::step_output("ingest", DATA_ANALYSIS_RESULTS);
        }
        let error = rewrite(&base(), &plan).expect_err("splice should fail");
        assert!(
            matches!(error, GraphError::GraphIntegrity { offending_id, .. } if offending_id == "ingest")
        );
    }

    #[test]
    fn promote_scatter_unknown_record_field_expected_integrity_error() {
        let mut plan = scatter_gather_plan();
        if let PipelineEdit::PromoteScatter(scatter) = &mut plan[2] {
            scatter.field = "bbox".to_string();
        }
        let error = rewrite(&base(), &plan).expect_err("scatter should fail");
        assert!(
            matches!(error, GraphError::GraphIntegrity { reason, .. } if reason.contains("bbox"))
        );
    }

    #[test]
    fn promote_scatter_scalar_port_expected_widened_to_array() {
        let mut document = base();
        let mut process = document.task(PROCESS_STEP).cloned().expect("process task");
        process
            .inputs
            .insert(SPATIAL_EXTENT.to_string(), InputPort::new(PortSchema::string()));
        document.upsert_node(process.into());

        let result = rewrite(&document, &scatter_gather_plan()).expect("rewrite should succeed");
        let port = result.tasks[0]
            .inputs
            .get(SPATIAL_EXTENT)
            .expect("port should exist");
        assert_eq!(port.schema(), &PortSchema::string_array());
        assert_eq!(port.port_type.notation(), &serde_json::json!("string[]"));
    }

    #[test]
    fn promote_scatter_directory_port_expected_unsupported_widening() {
        let mut document = base();
        let mut process = document.task(PROCESS_STEP).cloned().expect("process task");
        process
            .inputs
            .insert(SPATIAL_EXTENT.to_string(), InputPort::new(PortSchema::directory()));
        document.upsert_node(process.into());

        let error = rewrite(&document, &scatter_gather_plan()).expect_err("widening should fail");
        assert!(matches!(
            error,
            GraphError::UnsupportedPortWidening { port, from, to }
                if port == "spatial_extent" && from == "Directory" && to == "string[]"
        ));
    }

    #[test]
    fn bind_output_replaces_source_and_keeps_extra_fields() {
        let mut document = base();
        let mut pipeline = document.pipeline().expect("pipeline").clone();
        if let Some(output) = pipeline.outputs.get_mut(EXECUTION_RESULTS) {
            output
                .extra
                .insert("label".to_string(), serde_json::json!("results"));
        }
        document.upsert_node(pipeline.into());

        let result = rewrite(&document, &scatter_gather_plan()).expect("rewrite should succeed");
        let output = result
            .pipeline
            .outputs
            .get(EXECUTION_RESULTS)
            .expect("output should exist");
        assert_eq!(
            output.sources(),
            [SourceRef::step_output(MERGE_NODE_ID, EXECUTION_RESULTS)]
        );
        assert_eq!(output.extra.get("label"), Some(&serde_json::json!("results")));
    }

    #[test]
    fn widen_rules_expected() {
        let string = PortSchema::string();
        let strings = PortSchema::string_array();
        assert!(!widen("p", &strings, &strings).expect("same type is a no-op"));
        assert!(widen("p", &string, &strings).expect("scalar widens"));
        assert!(widen("p", &strings, &string).is_err());
        assert!(widen("p", &PortSchema::directory(), &strings).is_err());
    }
}
