//! Fixed task templates spliced into the base pipeline.
//!
//! Every call builds fresh values; nothing is cached between calls, so
//! independent finalize calls never share template state.

use crate::{
    Argument, CaptureRule, ContainerRef, InputPort, OneOrMany, OutputPort, PortSchema,
    RecordSchema, ResourceBounds, TaskNode, TemplateConfig,
};

pub const STAGEOUT_NODE_ID: &str = "stageout_data_analysis";
pub const SPLIT_NODE_ID: &str = "split_tiles";
pub const MERGE_NODE_ID: &str = "merge_results";

pub const DATA_ANALYSIS_RESULTS: &str = "data_analysis_results";
pub const STAGEOUT_RESULTS: &str = "stageout_data_analysis_results";
pub const SPATIAL_EXTENT: &str = "spatial_extent";
pub const SPLIT_RESULTS: &str = "split_tiles_results";
pub const TILES: &str = "tiles";
pub const TILE_RECORD: &str = "TileRecord";
pub const PROCESS_RESULTS: &str = "process_results";
pub const EXECUTION_RESULTS: &str = "execution_results";

const BASE_COMMAND: &str = "python";
const BOUNDING_BOX_LEN: usize = 4;

pub fn build_stageout_node(container: &ContainerRef, resources: &ResourceBounds) -> TaskNode {
    let mut node = tool_node(
        STAGEOUT_NODE_ID,
        "/app/stageout_data_analysis.py",
        container,
        resources,
    );
    node.arguments.extend([
        Argument::literal("--data_analysis_results"),
        Argument::input(DATA_ANALYSIS_RESULTS),
    ]);
    node.inputs.insert(
        DATA_ANALYSIS_RESULTS.to_string(),
        InputPort::new(PortSchema::directory()),
    );
    node.outputs.insert(
        STAGEOUT_RESULTS.to_string(),
        OutputPort::captured(PortSchema::directory(), CaptureRule::glob(".")),
    );
    node
}

pub fn build_split_node(container: &ContainerRef, resources: &ResourceBounds) -> TaskNode {
    let mut node = tool_node(SPLIT_NODE_ID, "/app/split_tiles.py", container, resources);
    node.arguments.push(Argument::literal("--spatial_extent"));
    node.arguments
        .extend((0..BOUNDING_BOX_LEN).map(|index| Argument::element(SPATIAL_EXTENT, index)));
    node.arguments.extend([
        Argument::literal("--data_analysis_results"),
        Argument::input(DATA_ANALYSIS_RESULTS),
    ]);

    node.inputs.insert(
        SPATIAL_EXTENT.to_string(),
        InputPort::new(PortSchema::string_array()),
    );
    node.inputs.insert(
        DATA_ANALYSIS_RESULTS.to_string(),
        InputPort::new(PortSchema::directory()),
    );
    node.inputs.insert(
        STAGEOUT_RESULTS.to_string(),
        InputPort::new(PortSchema::directory()),
    );

    node.outputs.insert(
        SPLIT_RESULTS.to_string(),
        OutputPort::captured(PortSchema::directory(), CaptureRule::glob(".")),
    );
    node.outputs.insert(
        TILES.to_string(),
        OutputPort::captured(
            PortSchema::record_array(tile_record()),
            CaptureRule::glob_json("tiles/tiles.json"),
        ),
    );
    node
}

pub fn build_merge_node(container: &ContainerRef, resources: &ResourceBounds) -> TaskNode {
    let mut node = tool_node(MERGE_NODE_ID, "/app/merge_results.py", container, resources);
    node.arguments.extend([
        Argument::literal("--scatter_execution_results"),
        Argument::input(PROCESS_RESULTS),
    ]);
    node.inputs.insert(
        PROCESS_RESULTS.to_string(),
        InputPort::new(PortSchema::directory_array()),
    );
    node.outputs.insert(
        EXECUTION_RESULTS.to_string(),
        OutputPort::captured(PortSchema::directory(), CaptureRule::glob(".")),
    );
    node
}

/// Stage-out, split and merge, in that order.
pub fn synthesize_nodes(config: &TemplateConfig) -> [TaskNode; 3] {
    [
        build_stageout_node(&config.container, &config.stageout),
        build_split_node(&config.container, &config.split),
        build_merge_node(&config.container, &config.merge),
    ]
}

/// One element of the split task's tile list.
pub fn tile_record() -> RecordSchema {
    RecordSchema::new(TILE_RECORD).with_field(SPATIAL_EXTENT, PortSchema::string_array())
}

fn tool_node(
    id: &str,
    script: &str,
    container: &ContainerRef,
    resources: &ResourceBounds,
) -> TaskNode {
    let mut node = TaskNode::new(id);
    node.base_command = Some(OneOrMany::One(BASE_COMMAND.to_string()));
    node.arguments.push(Argument::literal(script));
    node.requirements.set_resource_bounds(resources);
    node.hints.set_container(container);
    node
}
