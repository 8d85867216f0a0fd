use crate::{ContainerRef, DocumentFormat, GraphError, ResourceBounds};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONTAINER: &str = "pminel/zoo_reference_implementation_v4";

/// Parameters of the synthesized stage-out, split and merge tasks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    pub container: ContainerRef,
    pub stageout: ResourceBounds,
    pub split: ResourceBounds,
    pub merge: ResourceBounds,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            container: ContainerRef::new(DEFAULT_CONTAINER),
            stageout: ResourceBounds::new(1, 512),
            split: ResourceBounds::new(1, 512),
            merge: ResourceBounds::new(1, 1024),
        }
    }
}

/// Runtime configuration for a finalize call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizeConfig {
    pub templates: TemplateConfig,
}

impl FinalizeConfig {
    pub fn parse(source: &str, format: DocumentFormat) -> Result<Self, GraphError> {
        match format {
            DocumentFormat::Yaml => serde_yaml::from_str(source)
                .map_err(|err| GraphError::DocumentFormat(format!("config: {err}"))),
            DocumentFormat::Json => serde_json::from_str(source)
                .map_err(|err| GraphError::DocumentFormat(format!("config: {err}"))),
        }
    }

    pub fn with_container(mut self, image: impl Into<String>) -> Self {
        self.templates.container = ContainerRef::new(image);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Quantity;

    #[test]
    fn finalize_config_defaults_match_reference_templates() {
        let config = FinalizeConfig::default();
        assert_eq!(config.templates.container.docker_pull, DEFAULT_CONTAINER);
        assert_eq!(config.templates.stageout, ResourceBounds::new(1, 512));
        assert_eq!(config.templates.split, ResourceBounds::new(1, 512));
        assert_eq!(config.templates.merge, ResourceBounds::new(1, 1024));
    }

    #[test]
    fn parse_partial_yaml_expected_remaining_defaults() {
        let config = FinalizeConfig::parse(
            "templates:\n  merge:\n    coresMax: 4\n    ramMax: 4096\n",
            DocumentFormat::Yaml,
        )
        .expect("config should parse");

        assert_eq!(config.templates.merge.cores_max, Some(Quantity::Integer(4)));
        assert_eq!(config.templates.merge.ram_max, Some(Quantity::Integer(4096)));
        assert_eq!(config.templates.split, ResourceBounds::new(1, 512));
        assert_eq!(config.templates.container.docker_pull, DEFAULT_CONTAINER);
    }

    #[test]
    fn parse_json_container_override_expected_image() {
        let config = FinalizeConfig::parse(
            r#"{"templates": {"container": {"dockerPull": "registry.local/tiles:2"}}}"#,
            DocumentFormat::Json,
        )
        .expect("config should parse");
        assert_eq!(config.templates.container.docker_pull, "registry.local/tiles:2");
    }

    #[test]
    fn parse_malformed_config_expected_format_error() {
        let error = FinalizeConfig::parse("templates: [1, 2]", DocumentFormat::Yaml)
            .expect_err("config should be rejected");
        assert!(matches!(error, GraphError::DocumentFormat(_)));
    }
}
