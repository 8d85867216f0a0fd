//! Contract with the execution engine that runs a finalized document.
//!
//! This crate only produces what the engine consumes; it never submits.
//! The engine must run one job per element of a scattered array, in any
//! order, start the merge step only after every scattered job finished,
//! hand the merge step its inputs in scatter-array order, and fail the
//! step as soon as one scattered job fails for good.

use crate::Document;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const PROCESS_ID_ENV: &str = "PROCESS_ID";
pub const SUB_PATH_PARAMETER: &str = "sub_path";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuota {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cores: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ram_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size_mb: Option<u64>,
}

/// Run-time configuration handed to the engine next to the document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunBundle {
    pub namespace: String,
    pub run_id: String,
    #[serde(default)]
    pub quotas: ResourceQuota,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub additional_parameters: BTreeMap<String, String>,
}

impl RunBundle {
    pub fn new(service_id: &str, run_id: &str) -> Self {
        Self {
            namespace: format!("{service_id}-{run_id}").to_lowercase().replace('_', "-"),
            run_id: run_id.to_string(),
            quotas: ResourceQuota::default(),
            env: BTreeMap::from([(PROCESS_ID_ENV.to_string(), run_id.to_string())]),
            secrets: BTreeMap::new(),
            node_selector: BTreeMap::new(),
            additional_parameters: BTreeMap::from([(
                SUB_PATH_PARAMETER.to_string(),
                run_id.to_string(),
            )]),
        }
    }

    pub fn with_quotas(mut self, quotas: ResourceQuota) -> Self {
        self.quotas = quotas;
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }

    pub fn with_node_selector(mut self, label: impl Into<String>, value: impl Into<String>) -> Self {
        self.node_selector.insert(label.into(), value.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_parameters.insert(name.into(), value.into());
        self
    }

    /// Per-run scratch directory below `tmp_root`.
    pub fn working_dir(&self, tmp_root: &Path) -> PathBuf {
        tmp_root.join(&self.namespace)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLog {
    pub step_id: String,
    pub location: String,
}

/// What the engine reports back for one run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub outputs: BTreeMap<String, String>,
    pub usage_report: Option<String>,
    pub step_logs: Vec<StepLog>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("run rejected: {0}")]
    Rejected(String),
    #[error("engine failure: {0}")]
    Backend(String),
}

pub trait ExecutionEngine: Send + Sync {
    fn submit(&self, document: &Document, bundle: &RunBundle) -> Result<RunHandle, EngineError>;
}
