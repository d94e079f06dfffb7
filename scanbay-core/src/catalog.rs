//! Read-only tool and playbook catalogs, loaded once at startup from JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::warn;

/// Tool identifiers the runtime will ever execute, whatever the catalog says.
pub const ALLOWED_TOOLS: [&str; 6] = ["nmap", "searchsploit", "sqlmap", "dirb", "curl", "gobuster"];

pub fn is_allowed_tool(tool_id: &str) -> bool {
    ALLOWED_TOOLS.contains(&tool_id)
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid catalog JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tool '{0}' has an empty command template")]
    EmptyCommand(String),
}

// ── tools ────────────────────────────────────────────────────────────────────

/// One entry of `tools.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Argument-vector template. `{target}`/`{query}`, `{options}` and
    /// `{xml_output}` are substituted per task; every other element is
    /// passed through literally.
    #[serde(deserialize_with = "deserialize_command_template")]
    pub command: Vec<String>,
    #[serde(default)]
    pub default_options: String,
    /// Whether the tool writes Nmap-style XML. Defaults to `true` for `nmap`.
    #[serde(default)]
    pub structured_output: Option<bool>,
}

impl ToolDefinition {
    /// `true` when the template takes a free-text query instead of a host.
    pub fn takes_query(&self) -> bool {
        self.command.iter().any(|part| part == "{query}")
    }

    pub fn uses_xml_placeholder(&self) -> bool {
        self.command.iter().any(|part| part == "{xml_output}")
    }

    /// Whether tasks for `tool_id` get an XML output file: the explicit flag,
    /// else `nmap` or any template naming `{xml_output}`.
    pub fn is_structured(&self, tool_id: &str) -> bool {
        self.structured_output
            .unwrap_or(tool_id == "nmap" || self.uses_xml_placeholder())
    }
}

/// A template may be written as an array or as a single command line.
#[derive(Deserialize)]
#[serde(untagged)]
enum CommandTemplate {
    Argv(Vec<String>),
    Line(String),
}

fn deserialize_command_template<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match CommandTemplate::deserialize(deserializer)? {
        CommandTemplate::Argv(argv) => Ok(argv),
        CommandTemplate::Line(line) => shlex::split(&line).ok_or_else(|| {
            serde::de::Error::custom(format!("unbalanced quoting in command template: {line}"))
        }),
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolCatalog {
    tools: BTreeMap<String, ToolDefinition>,
}

impl ToolCatalog {
    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        let tools: BTreeMap<String, ToolDefinition> = serde_json::from_str(raw)?;
        for (tool_id, tool) in &tools {
            if tool.command.is_empty() {
                return Err(CatalogError::EmptyCommand(tool_id.clone()));
            }
            if !is_allowed_tool(tool_id) {
                warn!(tool_id = %tool_id, "catalog entry is not in the tool allow-list and will never run");
            }
        }
        Ok(Self { tools })
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        Self::from_json_str(&read_catalog(path)?)
    }

    pub fn get(&self, tool_id: &str) -> Option<&ToolDefinition> {
        self.tools.get(tool_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ToolDefinition)> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ── playbooks ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub tool_id: String,
    #[serde(default)]
    pub options: String,
}

/// One entry of `playbooks.json`.
///
/// Rules stay as raw JSON so that one malformed rule can be reported and
/// skipped without rejecting the whole playbook; see [`PlaybookRule::from_value`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger: TriggerDefinition,
    #[serde(default)]
    pub rules: Vec<serde_json::Value>,
}

/// A validated playbook rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybookRule {
    pub on_service: Vec<String>,
    pub tool_id: String,
    pub name: String,
    pub options: String,
}

#[derive(Deserialize)]
struct RawRule {
    #[serde(default)]
    on_service: Vec<String>,
    action: Option<RawAction>,
}

#[derive(Deserialize)]
struct RawAction {
    tool_id: Option<String>,
    name: Option<String>,
    options: Option<String>,
}

impl PlaybookRule {
    /// Validate one raw rule; the error text describes what is missing.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, String> {
        let raw: RawRule = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
        let on_service: Vec<String> = raw
            .on_service
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect();
        if on_service.is_empty() {
            return Err("rule has no on_service entries".into());
        }
        let action = raw.action.ok_or("rule has no action")?;
        let tool_id = action
            .tool_id
            .filter(|t| !t.is_empty())
            .ok_or("action has no tool_id")?;
        let options = action.options.ok_or("action has no options")?;
        Ok(Self {
            on_service,
            name: action.name.unwrap_or_else(|| tool_id.clone()),
            tool_id,
            options,
        })
    }

    /// Substring match of any `on_service` entry against `service_name`.
    pub fn matches(&self, service_name: &str) -> bool {
        self.on_service
            .iter()
            .any(|needle| service_name.contains(needle.as_str()))
    }
}

#[derive(Deserialize)]
struct PlaybookFile {
    #[serde(rename = "PLAYBOOKS", default)]
    playbooks: Vec<PlaybookDefinition>,
}

#[derive(Debug, Clone, Default)]
pub struct PlaybookCatalog {
    playbooks: Vec<PlaybookDefinition>,
}

impl PlaybookCatalog {
    pub fn new(playbooks: Vec<PlaybookDefinition>) -> Self {
        let mut unique: Vec<PlaybookDefinition> = Vec::with_capacity(playbooks.len());
        for playbook in playbooks {
            if unique.iter().any(|p| p.id == playbook.id) {
                warn!(playbook_id = %playbook.id, "duplicate playbook id ignored");
                continue;
            }
            unique.push(playbook);
        }
        Self { playbooks: unique }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        let file: PlaybookFile = serde_json::from_str(raw)?;
        Ok(Self::new(file.playbooks))
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        Self::from_json_str(&read_catalog(path)?)
    }

    pub fn get(&self, playbook_id: &str) -> Option<&PlaybookDefinition> {
        self.playbooks.iter().find(|p| p.id == playbook_id)
    }

    pub fn all(&self) -> &[PlaybookDefinition] {
        &self.playbooks
    }
}

fn read_catalog(path: &Path) -> Result<String, CatalogError> {
    std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })
}
