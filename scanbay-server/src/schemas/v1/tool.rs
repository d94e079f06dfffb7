use scanbay_core::ToolDefinition;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct ToolResponse {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Argument template with `{target}`, `{query}`, `{options}` and
    /// `{xml_output}` placeholders.
    pub command: Vec<String>,
    pub default_options: String,
    /// Whether tasks for this tool get an Nmap XML output file.
    pub structured_output: bool,
}

impl ToolResponse {
    pub fn new(id: &str, tool: &ToolDefinition) -> Self {
        Self {
            id: id.to_owned(),
            name: tool.name.clone(),
            description: tool.description.clone(),
            command: tool.command.clone(),
            default_options: tool.default_options.clone(),
            structured_output: tool.is_structured(id),
        }
    }
}
