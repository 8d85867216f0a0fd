//! Finalizer: locate the pipeline, rewrite it, append the synthesized
//! tasks, validate. Every stage works on a copy of the input document, so
//! a failure at any point leaves the caller's document as it was.

use crate::{
    Diagnostic, Document, EditOutcome, EditRecord, FinalizeConfig, GraphError, Node,
    PipelineEdit, PipelineRewriter, TaskNode, ValidationError, document_fingerprint,
    scatter_gather_plan, synthesize_nodes, validate_or_raise,
};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizeStage {
    Start,
    LocatePipelineNode,
    RewritePipeline,
    SynthesizeAndAppendNodes,
    ValidateDocument,
    Done,
}

impl fmt::Display for FinalizeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::LocatePipelineNode => "locate_pipeline_node",
            Self::RewritePipeline => "rewrite_pipeline",
            Self::SynthesizeAndAppendNodes => "synthesize_and_append_nodes",
            Self::ValidateDocument => "validate_document",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FinalizeReport {
    pub pipeline_id: String,
    pub edits: Vec<EditRecord>,
    pub appended: Vec<String>,
    pub already_present: Vec<String>,
    pub warnings: Vec<Diagnostic>,
    pub input_fingerprint: String,
    pub output_fingerprint: String,
}

impl FinalizeReport {
    /// False when finalizing produced the document it was given.
    pub fn changed(&self) -> bool {
        self.input_fingerprint != self.output_fingerprint
    }

    pub fn edits_applied(&self) -> usize {
        self.edits
            .iter()
            .filter(|record| record.outcome == EditOutcome::Applied)
            .count()
    }
}

impl fmt::Display for FinalizeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pipeline '{}': {} of {} edit(s) applied, {} node(s) appended, {} already present, {} warning(s)",
            self.pipeline_id,
            self.edits_applied(),
            self.edits.len(),
            self.appended.len(),
            self.already_present.len(),
            self.warnings.len()
        )
    }
}

#[derive(Clone, Debug)]
pub struct Finalized {
    pub document: Document,
    pub report: FinalizeReport,
}

pub struct Finalizer {
    config: FinalizeConfig,
    edits: Vec<PipelineEdit>,
}

impl Finalizer {
    pub fn new(config: FinalizeConfig) -> Self {
        Self {
            config,
            edits: scatter_gather_plan(),
        }
    }

    /// Replaces the scatter/gather plan with `edits`.
    pub fn with_edits(mut self, edits: Vec<PipelineEdit>) -> Self {
        self.edits = edits;
        self
    }

    pub fn config(&self) -> &FinalizeConfig {
        &self.config
    }

    pub fn finalize(&self, document: &Document) -> Result<Finalized, GraphError> {
        let mut stage = FinalizeStage::Start;
        let result = self.run(document, &mut stage);
        if let Err(error) = &result {
            tracing::debug!(stage = %stage, error = %error, "finalize failed");
        }
        result
    }

    fn run(&self, document: &Document, stage: &mut FinalizeStage) -> Result<Finalized, GraphError> {
        let input_fingerprint = document_fingerprint(document)?;

        advance(stage, FinalizeStage::LocatePipelineNode);
        let pipeline = document.pipeline()?;
        let pipeline_id = pipeline.id.clone();

        advance(stage, FinalizeStage::RewritePipeline);
        let mut synthesized = synthesize_nodes(&self.config.templates);
        let rewrite = PipelineRewriter::new(document, &synthesized).rewrite(pipeline, &self.edits)?;
        if rewrite.applied() > 0 {
            tracing::info!(pipeline = %pipeline_id, edits = rewrite.applied(), "updating pipeline node");
        }

        let mut working = document.clone();
        working.replace_node(&pipeline_id, rewrite.pipeline.into())?;
        for task in rewrite.tasks {
            store_task(&mut working, &mut synthesized, task)?;
        }

        advance(stage, FinalizeStage::SynthesizeAndAppendNodes);
        let mut appended = Vec::new();
        let mut already_present = Vec::new();
        for node in synthesized {
            match working.find_node(&node.id) {
                Some(Node::Task(existing)) if existing == &node => {
                    tracing::debug!(node = %node.id, "task node already present");
                    already_present.push(node.id);
                }
                Some(_) => return Err(GraphError::DuplicateId { id: node.id }),
                None => {
                    tracing::info!(node = %node.id, "adding task node");
                    appended.push(node.id.clone());
                    working.append_node(node.into())?;
                }
            }
        }

        advance(stage, FinalizeStage::ValidateDocument);
        let warnings = validate_or_raise(&working, &[])
            .map_err(|error| integrity_failure(error, &pipeline_id))?;
        for warning in &warnings {
            tracing::warn!(rule = %warning.rule, "{warning}");
        }

        let output_fingerprint = document_fingerprint(&working)?;
        advance(stage, FinalizeStage::Done);
        Ok(Finalized {
            document: working,
            report: FinalizeReport {
                pipeline_id,
                edits: rewrite.outcomes,
                appended,
                already_present,
                warnings,
                input_fingerprint,
                output_fingerprint,
            },
        })
    }
}

fn advance(stage: &mut FinalizeStage, next: FinalizeStage) {
    tracing::debug!(from = %stage, to = %next, "finalize stage");
    *stage = next;
}

/// Puts a rewritten task back where it came from: the document, or the
/// batch of synthesized nodes still waiting to be appended.
fn store_task(
    working: &mut Document,
    synthesized: &mut [TaskNode],
    task: TaskNode,
) -> Result<(), GraphError> {
    if let Some(slot) = synthesized.iter_mut().find(|node| node.id == task.id) {
        *slot = task;
        return Ok(());
    }
    let id = task.id.clone();
    working.replace_node(&id, task.into()).map(|_| ())
}

fn integrity_failure(error: ValidationError, pipeline_id: &str) -> GraphError {
    match error.first_error() {
        Some(diagnostic) => GraphError::integrity(
            diagnostic.location().unwrap_or(pipeline_id),
            format!("[{}] {}", diagnostic.rule, diagnostic.message),
        ),
        None => GraphError::Validation(error),
    }
}

pub fn finalize(document: &Document, config: &FinalizeConfig) -> Result<Finalized, GraphError> {
    Finalizer::new(config.clone()).finalize(document)
}

/// Finalizes `document` and commits the result into it. On error the
/// document is untouched.
pub fn finalize_in_place(
    document: &mut Document,
    config: &FinalizeConfig,
) -> Result<FinalizeReport, GraphError> {
    let Finalized {
        document: finalized,
        report,
    } = finalize(document, config)?;
    *document = finalized;
    Ok(report)
}
