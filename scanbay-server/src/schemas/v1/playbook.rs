use scanbay_core::PlaybookDefinition;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct PlaybookResponse {
    pub id: String,
    pub name: String,
    pub description: String,
    pub trigger_tool: String,
    pub trigger_options: String,
    /// Rules as written in the catalog, in evaluation order.
    pub rules: Vec<serde_json::Value>,
}

impl From<&PlaybookDefinition> for PlaybookResponse {
    fn from(playbook: &PlaybookDefinition) -> Self {
        Self {
            id: playbook.id.clone(),
            name: playbook.name.clone(),
            description: playbook.description.clone(),
            trigger_tool: playbook.trigger.tool_id.clone(),
            trigger_options: playbook.trigger.options.clone(),
            rules: playbook.rules.clone(),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RunPlaybookRequest {
    pub project_id: i64,
    #[serde(default)]
    pub priority: i64,
}
