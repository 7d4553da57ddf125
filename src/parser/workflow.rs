// ABOUTME: Workflow definition structure and JSON/YAML loading
// ABOUTME: Defines WorkflowDefinition, its run settings, and the async WorkflowParser

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use super::error::{ParserError, Result};
use super::step::StepDefinition;

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    /// Initial run variables, visible as `$context`
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
    pub steps: Vec<StepDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<WorkflowSettings>,
}

/// Per-workflow overrides of the runtime defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_steps: Option<usize>,
    #[serde(
        with = "humantime_serde",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub step_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Json,
    Yaml,
}

impl DefinitionFormat {
    /// Guess the format from a file extension, defaulting to YAML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => DefinitionFormat::Json,
            _ => DefinitionFormat::Yaml,
        }
    }

    /// Guess the format from content: JSON documents start with `{`
    pub fn sniff(content: &str) -> Self {
        if content.trim_start().starts_with('{') {
            DefinitionFormat::Json
        } else {
            DefinitionFormat::Yaml
        }
    }
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            version: default_version(),
            variables: Map::new(),
            steps,
            settings: None,
        }
    }

    /// Parse workflow from a JSON or YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(ParserError::IoError)?;
        Self::parse(&content, DefinitionFormat::from_path(path))
    }

    /// Parse workflow from JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        Self::parse(content, DefinitionFormat::Json)
    }

    /// Parse workflow from YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        Self::parse(content, DefinitionFormat::Yaml)
    }

    pub fn parse(content: &str, format: DefinitionFormat) -> Result<Self> {
        let workflow: WorkflowDefinition = match format {
            DefinitionFormat::Json => serde_json::from_str(content)?,
            DefinitionFormat::Yaml => serde_yaml::from_str(content)?,
        };
        workflow.validate_structure()?;
        Ok(workflow)
    }

    /// Validate basic workflow structure
    fn validate_structure(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ParserError::MissingField("name".to_string()));
        }

        if self.steps.is_empty() {
            return Err(ParserError::EmptyWorkflow);
        }

        if let Some(step) = self.steps.iter().find(|s| s.id.trim().is_empty()) {
            return Err(ParserError::MissingField(format!(
                "id (step '{}')",
                step.display_name()
            )));
        }

        Ok(())
    }

    /// Identifier used for `$workflow.id`, falling back to the name
    pub fn workflow_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }

    /// Get all step IDs in declaration order
    pub fn step_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// Get step definition by ID
    pub fn get_step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Get all steps that list a specific step in `dependsOn`
    pub fn get_dependent_steps(&self, step_id: &str) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.depends_on.iter().any(|d| d == step_id))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Merge variables from external source
    pub fn merge_variables(&mut self, vars: Map<String, Value>) {
        self.variables.extend(vars);
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(ParserError::JsonError)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(ParserError::YamlError)
    }

    /// Save workflow to file, choosing the format from the extension
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match DefinitionFormat::from_path(path) {
            DefinitionFormat::Json => self.to_json()?,
            DefinitionFormat::Yaml => self.to_yaml()?,
        };
        std::fs::write(path, content).map_err(ParserError::IoError)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowParser;

impl WorkflowParser {
    pub fn new() -> Self {
        Self
    }

    pub async fn parse_file<P: AsRef<Path>>(&self, path: P) -> Result<WorkflowDefinition> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(ParserError::IoError)?;
        WorkflowDefinition::parse(&content, DefinitionFormat::from_path(path))
    }

    pub fn parse_string(&self, content: &str) -> Result<WorkflowDefinition> {
        WorkflowDefinition::parse(content, DefinitionFormat::sniff(content))
    }
}

impl Default for WorkflowParser {
    fn default() -> Self {
        Self::new()
    }
}
