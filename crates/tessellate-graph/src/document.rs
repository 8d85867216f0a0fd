//! In-memory model of a `$graph` pipeline document.
//!
//! Nodes live in an id-keyed ordered map: lookups are by id, and insertion
//! order is kept so that serialization is deterministic. Fields the model
//! does not name are carried in `extra` maps and written back unchanged.

use crate::{GraphError, PortSchema, PortType};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

pub const RESOURCE_REQUIREMENT: &str = "ResourceRequirement";
pub const DOCKER_REQUIREMENT: &str = "DockerRequirement";

const JSON_PARSE_EVAL: &str = "${ return JSON.parse(self[0].contents); }";

/// A string or a list of strings; CWL accepts both for sources, scatter
/// ports and base commands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn as_slice(&self) -> &[String] {
        match self {
            Self::One(value) => std::slice::from_ref(value),
            Self::Many(values) => values,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.as_slice().iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Where a step input or pipeline output takes its value from.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceRef {
    PipelineInput(String),
    StepOutput { step: String, port: String },
}

impl SourceRef {
    /// `input`, `step/port`, or the packed `#pipeline/step/port`. The
    /// pipeline qualifier is dropped; a qualified pipeline input
    /// (`#pipeline/input`) needs [`PipelineNode::resolve_source`].
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim_start_matches('#');
        let mut segments = raw.rsplitn(3, '/');
        match (segments.next(), segments.next()) {
            (Some(port), Some(step)) => Self::StepOutput {
                step: step.to_string(),
                port: port.to_string(),
            },
            _ => Self::PipelineInput(raw.to_string()),
        }
    }

    pub fn step_output(step: impl Into<String>, port: impl Into<String>) -> Self {
        Self::StepOutput {
            step: step.into(),
            port: port.into(),
        }
    }

    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepOutput { step, .. } => Some(step),
            Self::PipelineInput(_) => None,
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PipelineInput(name) => f.write_str(name),
            Self::StepOutput { step, port } => write!(f, "{step}/{port}"),
        }
    }
}

/// `$(inputs.<port>)` or `$(inputs.<port>[<index>])`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InputRef {
    pub port: String,
    pub index: Option<usize>,
}

impl InputRef {
    pub fn parse(raw: &str) -> Option<Self> {
        let inner = raw.strip_prefix("$(inputs.")?.strip_suffix(')')?;
        let (port, index) = match inner.split_once('[') {
            Some((port, rest)) => {
                let digits = rest.strip_suffix(']')?;
                (port, Some(digits.parse::<usize>().ok()?))
            }
            None => (inner, None),
        };
        if port.is_empty()
            || !port
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return None;
        }

        let parsed = Self {
            port: port.to_string(),
            index,
        };
        // `$(inputs.a[01])` stays a literal so it is written back untouched.
        (parsed.render() == raw).then_some(parsed)
    }

    pub fn render(&self) -> String {
        match self.index {
            Some(index) => format!("$(inputs.{}[{index}])", self.port),
            None => format!("$(inputs.{})", self.port),
        }
    }
}

/// One positional entry of a task's `arguments`.
#[derive(Clone, Debug, PartialEq)]
pub enum Argument {
    Literal(String),
    Input(InputRef),
    Binding(Value),
}

impl Argument {
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    pub fn input(port: impl Into<String>) -> Self {
        Self::Input(InputRef {
            port: port.into(),
            index: None,
        })
    }

    pub fn element(port: impl Into<String>, index: usize) -> Self {
        Self::Input(InputRef {
            port: port.into(),
            index: Some(index),
        })
    }

    pub fn input_ref(&self) -> Option<&InputRef> {
        match self {
            Self::Input(reference) => Some(reference),
            _ => None,
        }
    }
}

impl Serialize for Argument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Literal(value) => serializer.serialize_str(value),
            Self::Input(reference) => serializer.serialize_str(&reference.render()),
            Self::Binding(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Argument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(raw) => match InputRef::parse(&raw) {
                Some(reference) => Self::Input(reference),
                None => Self::Literal(raw),
            },
            other => Self::Binding(other),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Integer(u64),
    Float(f64),
    Expression(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceBounds {
    #[serde(rename = "coresMax", default, skip_serializing_if = "Option::is_none")]
    pub cores_max: Option<Quantity>,
    #[serde(rename = "ramMax", default, skip_serializing_if = "Option::is_none")]
    pub ram_max: Option<Quantity>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl ResourceBounds {
    pub fn new(cores_max: u64, ram_max: u64) -> Self {
        Self {
            cores_max: Some(Quantity::Integer(cores_max)),
            ram_max: Some(Quantity::Integer(ram_max)),
            extra: IndexMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    #[serde(rename = "dockerPull")]
    pub docker_pull: String,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl ContainerRef {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            docker_pull: image.into(),
            extra: IndexMap::new(),
        }
    }
}

/// `requirements` or `hints`, in either map or list notation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Requirements {
    entries: IndexMap<String, Value>,
    listed: bool,
}

impl Requirements {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, class: &str) -> Option<&Value> {
        self.entries.get(class)
    }

    pub fn insert(&mut self, class: impl Into<String>, value: Value) {
        self.entries.insert(class.into(), value);
    }

    pub fn resource_bounds(&self) -> Option<ResourceBounds> {
        self.typed(RESOURCE_REQUIREMENT)
    }

    pub fn container(&self) -> Option<ContainerRef> {
        self.typed(DOCKER_REQUIREMENT)
    }

    pub fn set_resource_bounds(&mut self, bounds: &ResourceBounds) {
        self.set_typed(RESOURCE_REQUIREMENT, bounds);
    }

    pub fn set_container(&mut self, container: &ContainerRef) {
        self.set_typed(DOCKER_REQUIREMENT, container);
    }

    fn typed<T: for<'de> Deserialize<'de>>(&self, class: &str) -> Option<T> {
        self.entries
            .get(class)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    fn set_typed<T: Serialize>(&mut self, class: &str, value: &T) {
        if let Ok(value) = serde_json::to_value(value) {
            self.entries.insert(class.to_string(), value);
        }
    }

    fn check(&self) -> Result<(), String> {
        if let Some(value) = self.entries.get(RESOURCE_REQUIREMENT) {
            serde_json::from_value::<ResourceBounds>(value.clone())
                .map_err(|err| format!("malformed {RESOURCE_REQUIREMENT}: {err}"))?;
        }
        if let Some(value) = self.entries.get(DOCKER_REQUIREMENT) {
            serde_json::from_value::<ContainerRef>(value.clone())
                .map_err(|err| format!("malformed {DOCKER_REQUIREMENT}: {err}"))?;
        }
        Ok(())
    }
}

impl Serialize for Requirements {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if !self.listed {
            return self.entries.serialize(serializer);
        }

        let listed: Vec<Value> = self
            .entries
            .iter()
            .map(|(class, value)| {
                let mut entry = serde_json::Map::new();
                entry.insert("class".to_string(), Value::String(class.clone()));
                if let Value::Object(fields) = value {
                    entry.extend(fields.clone());
                }
                Value::Object(entry)
            })
            .collect();
        listed.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Requirements {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let requirements = match Value::deserialize(deserializer)? {
            Value::Object(map) => Self {
                entries: map.into_iter().collect(),
                listed: false,
            },
            Value::Array(items) => {
                let mut entries = IndexMap::new();
                for item in items {
                    let Value::Object(mut fields) = item else {
                        return Err(D::Error::custom("requirement entries must be mappings"));
                    };
                    let Some(Value::String(class)) = fields.remove("class") else {
                        return Err(D::Error::custom("requirement entry has no 'class'"));
                    };
                    entries.insert(class, Value::Object(fields));
                }
                Self {
                    entries,
                    listed: true,
                }
            }
            other => {
                return Err(D::Error::custom(format!(
                    "requirements must be a mapping or a list, got {other}"
                )));
            }
        };

        requirements.check().map_err(D::Error::custom)?;
        Ok(requirements)
    }
}

/// How the execution engine harvests an output after the task ran.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureRule {
    Glob { pattern: String },
    GlobJson { pattern: String },
}

impl CaptureRule {
    pub fn glob(pattern: impl Into<String>) -> Self {
        Self::Glob {
            pattern: pattern.into(),
        }
    }

    pub fn glob_json(pattern: impl Into<String>) -> Self {
        Self::GlobJson {
            pattern: pattern.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glob: Option<Value>,
    #[serde(rename = "loadContents", default, skip_serializing_if = "Option::is_none")]
    pub load_contents: Option<bool>,
    #[serde(rename = "outputEval", default, skip_serializing_if = "Option::is_none")]
    pub output_eval: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl OutputBinding {
    pub fn capture_rule(&self) -> Option<CaptureRule> {
        let pattern = self.glob.as_ref()?.as_str()?.to_string();
        if !self.extra.is_empty() {
            return None;
        }
        match (self.load_contents, self.output_eval.as_deref()) {
            (None | Some(false), None) => Some(CaptureRule::Glob { pattern }),
            (Some(true), Some(eval)) if eval.contains("JSON.parse(") => {
                Some(CaptureRule::GlobJson { pattern })
            }
            _ => None,
        }
    }
}

impl From<CaptureRule> for OutputBinding {
    fn from(rule: CaptureRule) -> Self {
        match rule {
            CaptureRule::Glob { pattern } => Self {
                glob: Some(Value::String(pattern)),
                ..Self::default()
            },
            CaptureRule::GlobJson { pattern } => Self {
                glob: Some(Value::String(pattern)),
                load_contents: Some(true),
                output_eval: Some(JSON_PARSE_EVAL.to_string()),
                extra: IndexMap::new(),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputPort {
    #[serde(rename = "type")]
    pub port_type: PortType,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl InputPort {
    pub fn new(schema: PortSchema) -> Self {
        Self {
            port_type: schema.into(),
            extra: IndexMap::new(),
        }
    }

    pub fn schema(&self) -> &PortSchema {
        self.port_type.schema()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputPort {
    #[serde(rename = "type")]
    pub port_type: PortType,
    #[serde(rename = "outputBinding", default, skip_serializing_if = "Option::is_none")]
    pub output_binding: Option<OutputBinding>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl OutputPort {
    pub fn captured(schema: PortSchema, rule: CaptureRule) -> Self {
        Self {
            port_type: schema.into(),
            output_binding: Some(rule.into()),
            extra: IndexMap::new(),
        }
    }

    pub fn schema(&self) -> &PortSchema {
        self.port_type.schema()
    }

    pub fn capture_rule(&self) -> Option<CaptureRule> {
        self.output_binding.as_ref().and_then(OutputBinding::capture_rule)
    }
}

/// A runnable unit (`class: CommandLineTool`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    #[serde(rename = "baseCommand", default, skip_serializing_if = "Option::is_none")]
    pub base_command: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Argument>,
    #[serde(default, skip_serializing_if = "Requirements::is_empty")]
    pub requirements: Requirements,
    #[serde(default, skip_serializing_if = "Requirements::is_empty")]
    pub hints: Requirements,
    #[serde(default)]
    pub inputs: IndexMap<String, InputPort>,
    #[serde(default)]
    pub outputs: IndexMap<String, OutputPort>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl TaskNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_command: None,
            arguments: Vec::new(),
            requirements: Requirements::default(),
            hints: Requirements::default(),
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
            extra: IndexMap::new(),
        }
    }

    pub fn resource_bounds(&self) -> Option<ResourceBounds> {
        self.requirements
            .resource_bounds()
            .or_else(|| self.hints.resource_bounds())
    }

    pub fn container(&self) -> Option<ContainerRef> {
        self.hints
            .container()
            .or_else(|| self.requirements.container())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    #[serde(rename = "type")]
    pub port_type: PortType,
    #[serde(rename = "outputSource")]
    pub output_source: OneOrMany,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl PipelineOutput {
    pub fn sources(&self) -> Vec<SourceRef> {
        self.output_source.iter().map(SourceRef::parse).collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InputBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<OneOrMany>,
    #[serde(rename = "valueFrom", default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<String>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepInput {
    Source(String),
    Binding(InputBinding),
}

impl StepInput {
    pub fn from_source(source: &SourceRef) -> Self {
        Self::Source(source.to_string())
    }

    /// A binding that hands each element's `field` to the step.
    pub fn field_extraction(source: &SourceRef, field: &str) -> Self {
        Self::Binding(InputBinding {
            source: Some(OneOrMany::One(source.to_string())),
            value_from: Some(render_field_extraction(field)),
            extra: IndexMap::new(),
        })
    }

    pub fn sources(&self) -> Vec<SourceRef> {
        match self {
            Self::Source(raw) => vec![SourceRef::parse(raw)],
            Self::Binding(binding) => binding
                .source
                .iter()
                .flat_map(OneOrMany::iter)
                .map(SourceRef::parse)
                .collect(),
        }
    }

    pub fn value_from(&self) -> Option<&str> {
        match self {
            Self::Binding(binding) => binding.value_from.as_deref(),
            Self::Source(_) => None,
        }
    }

    pub fn extracted_field(&self) -> Option<&str> {
        self.value_from().and_then(parse_field_extraction)
    }
}

pub fn render_field_extraction(field: &str) -> String {
    format!("$(self.{field})")
}

/// Field name of a `$(self.<field>)` expression; other expressions are
/// passed through to the engine uninterpreted.
pub fn parse_field_extraction(expression: &str) -> Option<&str> {
    let field = expression.strip_prefix("$(self.")?.strip_suffix(')')?;
    (!field.is_empty()
        && field
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_'))
    .then_some(field)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScatterMethod {
    #[serde(rename = "dotproduct")]
    Dotproduct,
    #[serde(rename = "nested_crossproduct")]
    NestedCrossproduct,
    #[serde(rename = "flat_crossproduct")]
    FlatCrossproduct,
}

/// An instantiation of a task inside the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub run: String,
    #[serde(rename = "in", default)]
    pub inputs: IndexMap<String, StepInput>,
    #[serde(rename = "out", default)]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scatter: Option<OneOrMany>,
    #[serde(rename = "scatterMethod", default, skip_serializing_if = "Option::is_none")]
    pub scatter_method: Option<ScatterMethod>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl Step {
    pub fn new(task_id: &str) -> Self {
        Self {
            run: format!("#{task_id}"),
            inputs: IndexMap::new(),
            outputs: Vec::new(),
            scatter: None,
            scatter_method: None,
            extra: IndexMap::new(),
        }
    }

    pub fn with_input(mut self, port: impl Into<String>, input: StepInput) -> Self {
        self.inputs.insert(port.into(), input);
        self
    }

    pub fn with_output(mut self, port: impl Into<String>) -> Self {
        self.outputs.push(port.into());
        self
    }

    pub fn run_ref(&self) -> &str {
        self.run.trim_start_matches('#')
    }

    pub fn produces(&self, port: &str) -> bool {
        self.outputs.iter().any(|output| output == port)
    }

    pub fn scatter_ports(&self) -> Vec<&str> {
        self.scatter.iter().flat_map(OneOrMany::iter).collect()
    }

    pub fn is_scattered(&self) -> bool {
        self.scatter.as_ref().is_some_and(|ports| !ports.is_empty())
    }
}

/// The single node wiring steps together (`class: Workflow`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineNode {
    pub id: String,
    #[serde(default)]
    pub inputs: IndexMap<String, InputPort>,
    #[serde(default)]
    pub outputs: IndexMap<String, PipelineOutput>,
    #[serde(default)]
    pub steps: IndexMap<String, Step>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl PipelineNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inputs: IndexMap::new(),
            outputs: IndexMap::new(),
            steps: IndexMap::new(),
            extra: IndexMap::new(),
        }
    }

    /// Reads `<pipeline-id>/<input>` as this pipeline's input unless a
    /// step carries the pipeline's id.
    pub fn resolve_source(&self, source: SourceRef) -> SourceRef {
        match source {
            SourceRef::StepOutput { step, port }
                if step == self.id && !self.steps.contains_key(&step) =>
            {
                SourceRef::PipelineInput(port)
            }
            other => other,
        }
    }

    /// Producer -> consumer pairs derived from step input sources.
    pub fn dependency_edges(&self) -> BTreeSet<(String, String)> {
        let mut edges = BTreeSet::new();
        for (step_id, step) in &self.steps {
            for input in step.inputs.values() {
                for source in input.sources() {
                    if let Some(from) = self.resolve_source(source).step() {
                        edges.insert((from.to_string(), step_id.clone()));
                    }
                }
            }
        }
        edges
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Task,
    Pipeline,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task => f.write_str("CommandLineTool"),
            Self::Pipeline => f.write_str("Workflow"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class")]
pub enum Node {
    #[serde(rename = "CommandLineTool")]
    Task(TaskNode),
    #[serde(rename = "Workflow")]
    Pipeline(PipelineNode),
}

impl Node {
    pub fn id(&self) -> &str {
        match self {
            Self::Task(task) => &task.id,
            Self::Pipeline(pipeline) => &pipeline.id,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Task(_) => NodeKind::Task,
            Self::Pipeline(_) => NodeKind::Pipeline,
        }
    }

    pub fn as_task(&self) -> Option<&TaskNode> {
        match self {
            Self::Task(task) => Some(task),
            Self::Pipeline(_) => None,
        }
    }

    pub fn as_pipeline(&self) -> Option<&PipelineNode> {
        match self {
            Self::Pipeline(pipeline) => Some(pipeline),
            Self::Task(_) => None,
        }
    }
}

impl From<TaskNode> for Node {
    fn from(task: TaskNode) -> Self {
        Self::Task(task)
    }
}

impl From<PipelineNode> for Node {
    fn from(pipeline: PipelineNode) -> Self {
        Self::Pipeline(pipeline)
    }
}

/// Wire shape of the document: top-level fields plus the `$graph` list.
#[derive(Debug, Deserialize)]
pub(crate) struct RawDocument {
    #[serde(flatten)]
    header: IndexMap<String, Value>,
    #[serde(rename = "$graph")]
    graph: Vec<Node>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Document {
    header: IndexMap<String, Value>,
    nodes: IndexMap<String, Node>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_nodes(
        header: IndexMap<String, Value>,
        nodes: impl IntoIterator<Item = Node>,
    ) -> Result<Self, GraphError> {
        let mut document = Self {
            header,
            nodes: IndexMap::new(),
        };
        for node in nodes {
            document.append_node(node)?;
        }
        Ok(document)
    }

    pub(crate) fn from_raw(raw: RawDocument) -> Result<Self, GraphError> {
        Self::from_nodes(raw.header, raw.graph)
    }

    /// Top-level fields other than `$graph` (`cwlVersion`, `$namespaces`, ...).
    pub fn header(&self) -> &IndexMap<String, Value> {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn find_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn find_nodes_by_kind(&self, kind: NodeKind) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(move |node| node.kind() == kind)
    }

    pub fn task(&self, id: &str) -> Option<&TaskNode> {
        self.find_node(id).and_then(Node::as_task)
    }

    /// The single pipeline node.
    pub fn pipeline(&self) -> Result<&PipelineNode, GraphError> {
        let mut pipelines = self
            .find_nodes_by_kind(NodeKind::Pipeline)
            .filter_map(Node::as_pipeline);
        let Some(first) = pipelines.next() else {
            return Err(GraphError::MissingPipelineNode);
        };

        let rest: Vec<&PipelineNode> = pipelines.collect();
        if rest.is_empty() {
            return Ok(first);
        }

        let mut ids = vec![first.id.clone()];
        ids.extend(rest.into_iter().map(|pipeline| pipeline.id.clone()));
        Err(GraphError::AmbiguousPipelineNode { ids })
    }

    pub fn append_node(&mut self, node: Node) -> Result<(), GraphError> {
        if self.nodes.contains_key(node.id()) {
            return Err(GraphError::DuplicateId {
                id: node.id().to_string(),
            });
        }
        self.nodes.insert(node.id().to_string(), node);
        Ok(())
    }

    /// Swaps the node registered under `old_id` for `node`, keeping its
    /// position. Returns the replaced node.
    pub fn replace_node(&mut self, old_id: &str, node: Node) -> Result<Node, GraphError> {
        let Some(index) = self.nodes.get_index_of(old_id) else {
            return Err(GraphError::NodeNotFound {
                id: old_id.to_string(),
            });
        };

        if node.id() != old_id && self.nodes.contains_key(node.id()) {
            return Err(GraphError::DuplicateId {
                id: node.id().to_string(),
            });
        }

        let Some((_, previous)) = self.nodes.shift_remove_index(index) else {
            return Err(GraphError::NodeNotFound {
                id: old_id.to_string(),
            });
        };
        self.nodes.shift_insert(index, node.id().to_string(), node);
        Ok(previous)
    }

    /// Inserts `node`, or replaces the node with the same id in place.
    pub fn upsert_node(&mut self, node: Node) -> Option<Node> {
        self.nodes.insert(node.id().to_string(), node)
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.nodes.iter().map(|(key, node)| (key.as_str(), node))
    }

    /// Producer -> consumer step pairs over every pipeline node.
    pub fn dependency_edges(&self) -> BTreeSet<(String, String)> {
        self.find_nodes_by_kind(NodeKind::Pipeline)
            .filter_map(Node::as_pipeline)
            .flat_map(PipelineNode::dependency_edges)
            .collect()
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct RawDocumentRef<'a> {
            #[serde(flatten)]
            header: &'a IndexMap<String, Value>,
            #[serde(rename = "$graph")]
            graph: Vec<&'a Node>,
        }

        let raw = RawDocumentRef {
            header: &self.header,
            graph: self.nodes.values().collect(),
        };
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let raw = RawDocument::deserialize(deserializer)?;
        Self::from_raw(raw).map_err(D::Error::custom)
    }
}
