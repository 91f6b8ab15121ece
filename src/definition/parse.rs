use crate::error::WorkflowError;

use super::schema::WorkflowDefinition;

/// Supported definition file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Yaml,
    Json,
}

/// Parse a workflow definition from text. Unknown fields are rejected so
/// typos in submitted definitions fail loudly instead of silently
/// deactivating a setting.
pub fn parse_definition(
    content: &str,
    format: DefinitionFormat,
) -> Result<WorkflowDefinition, WorkflowError> {
    match format {
        DefinitionFormat::Yaml => serde_yaml::from_str(content)
            .map_err(|e| WorkflowError::DefinitionParse(e.to_string())),
        DefinitionFormat::Json => serde_json::from_str(content)
            .map_err(|e| WorkflowError::DefinitionParse(e.to_string())),
    }
}
