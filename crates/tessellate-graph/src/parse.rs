use crate::document::RawDocument;
use crate::{Document, GraphError};
use std::path::Path;

/// Serialization of a pipeline document on disk or on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DocumentFormat {
    #[default]
    Yaml,
    Json,
}

impl DocumentFormat {
    /// `.json` selects JSON; `.cwl`, `.yaml`, `.yml` and anything else YAML.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        match path.as_ref().extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

pub fn parse_document(source: &str, format: DocumentFormat) -> Result<Document, GraphError> {
    let raw: RawDocument = match format {
        DocumentFormat::Yaml => serde_yaml::from_str(source)
            .map_err(|err| GraphError::DocumentFormat(err.to_string()))?,
        DocumentFormat::Json => serde_json::from_str(source)
            .map_err(|err| GraphError::DocumentFormat(err.to_string()))?,
    };
    Document::from_raw(raw)
}

pub fn render_document(document: &Document, format: DocumentFormat) -> Result<String, GraphError> {
    match format {
        DocumentFormat::Yaml => serde_yaml::to_string(document)
            .map_err(|err| GraphError::DocumentFormat(err.to_string())),
        DocumentFormat::Json => serde_json::to_string_pretty(document)
            .map(|mut rendered| {
                rendered.push('\n');
                rendered
            })
            .map_err(|err| GraphError::DocumentFormat(err.to_string())),
    }
}

/// blake3 digest of the document's canonical JSON rendering, hex encoded.
pub fn document_fingerprint(document: &Document) -> Result<String, GraphError> {
    let bytes =
        serde_json::to_vec(document).map_err(|err| GraphError::DocumentFormat(err.to_string()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeKind, PortSchema};

    const MINIMAL: &str = r##"
cwlVersion: v1.2
$namespaces:
  s: https://schema.org/
s:softwareVersion: 0.1.0
$graph:
  - class: CommandLineTool
    id: analyse
    baseCommand: python
    arguments: ["/app/analyse.py", "$(inputs.spatial_extent[0])"]
    inputs:
      spatial_extent:
        type: string[]
    outputs:
      data_analysis_results:
        type: Directory
        outputBinding:
          glob: .
  - class: Workflow
    id: main
    inputs:
      spatial_extent:
        type: string[]
    outputs:
      execution_results:
        type: Directory
        outputSource: analyse/data_analysis_results
    steps:
      analyse:
        run: "#analyse"
        in:
          spatial_extent: spatial_extent
        out: [data_analysis_results]
"##;

    #[test]
    fn document_format_from_path_expected_extension_mapping() {
        assert_eq!(DocumentFormat::from_path("app.json"), DocumentFormat::Json);
        assert_eq!(DocumentFormat::from_path("app.JSON"), DocumentFormat::Json);
        assert_eq!(DocumentFormat::from_path("app.cwl"), DocumentFormat::Yaml);
        assert_eq!(DocumentFormat::from_path("app"), DocumentFormat::Yaml);
    }

    #[test]
    fn parse_document_yaml_expected_nodes_and_header() {
        let document = parse_document(MINIMAL, DocumentFormat::Yaml).expect("document should parse");
        assert_eq!(document.len(), 2);
        assert_eq!(document.find_nodes_by_kind(NodeKind::Pipeline).count(), 1);
        assert!(document.header().contains_key("$namespaces"));

        let analyse = document.task("analyse").expect("analyse should be a task");
        assert_eq!(
            analyse.inputs.get("spatial_extent").map(|port| port.schema()),
            Some(&PortSchema::string_array())
        );
    }

    #[test]
    fn parse_document_duplicate_ids_expected_duplicate_error() {
        let source = r#"{"$graph": [
            {"class": "CommandLineTool", "id": "a"},
            {"class": "CommandLineTool", "id": "a"}
        ]}"#;
        let error = parse_document(source, DocumentFormat::Json).expect_err("should be rejected");
        assert!(matches!(error, GraphError::DuplicateId { id } if id == "a"));
    }

    #[test]
    fn parse_document_unknown_class_expected_format_error() {
        let source = r#"{"$graph": [{"class": "ExpressionTool", "id": "a"}]}"#;
        let error = parse_document(source, DocumentFormat::Json).expect_err("should be rejected");
        assert!(matches!(error, GraphError::DocumentFormat(_)));
    }

    #[test]
    fn parse_document_unsupported_port_type_expected_format_error() {
        let source = r#"{"$graph": [{
            "class": "CommandLineTool", "id": "a",
            "inputs": {"mode": {"type": {"type": "enum", "symbols": ["x"]}}}
        }]}"#;
        let error = parse_document(source, DocumentFormat::Json).expect_err("should be rejected");
        assert!(matches!(error, GraphError::DocumentFormat(message) if message.contains("enum")));
    }

    #[test]
    fn render_then_parse_expected_same_document_and_text() {
        let document = parse_document(MINIMAL, DocumentFormat::Yaml).expect("document should parse");
        for format in [DocumentFormat::Yaml, DocumentFormat::Json] {
            let rendered = render_document(&document, format).expect("render should succeed");
            let reparsed = parse_document(&rendered, format).expect("reparse should succeed");
            assert_eq!(reparsed, document);
            assert_eq!(
                render_document(&reparsed, format).expect("render should succeed"),
                rendered
            );
        }
    }

    #[test]
    fn document_fingerprint_expected_stable_across_formats() {
        let document = parse_document(MINIMAL, DocumentFormat::Yaml).expect("document should parse");
        let json = render_document(&document, DocumentFormat::Json).expect("render should succeed");
        let from_json = parse_document(&json, DocumentFormat::Json).expect("reparse should succeed");
        assert_eq!(
            document_fingerprint(&document).expect("fingerprint should succeed"),
            document_fingerprint(&from_json).expect("fingerprint should succeed")
        );
    }
}
