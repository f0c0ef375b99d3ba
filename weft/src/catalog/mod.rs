//! Command catalog: parse the YAML catalog into [`AgentConfig`], validate
//! output schemas, and expose command lookup.
//!
//! The catalog file carries `version`, `systemPrompt`, and a `commands` map.
//! Each command supplies instructions (a template string), an optional model,
//! a tool filter, an execution strategy, a draft 2020-12 `outputSchema`, an
//! `exitExpression`, and an `mcpServers` JSON string naming its tool servers.
//! Commands are wrapped in `Arc` so lookup after startup is a lock-free read.

mod schema;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub use schema::normalize_output_schema;

/// Errors from loading or validating the command catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("read catalog {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parse catalog yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("command {command}: output schema: {message}")]
    Schema { command: String, message: String },
    #[error("command {command}: mcpServers: {message}")]
    ToolServers { command: String, message: String },
}

/// How a tool server is spawned: command line and environment.
#[derive(Clone, Debug, Deserialize)]
pub struct ToolServerDescriptor {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// One named command: everything the session runtime needs to drive an agent.
#[derive(Clone, Debug)]
pub struct AgentCommand {
    pub name: String,
    pub system_prompt: String,
    pub description: Option<String>,
    /// Template string rendered against the event payload.
    pub instructions: String,
    pub model: Option<String>,
    /// Tool filter forwarded to the agent.
    pub tools: Vec<String>,
    pub execution_strategy: Option<String>,
    /// Normalized, draft 2020-12 validated object schema.
    pub output_schema: Value,
    /// Documents the output-schema contract; chaining keys off the
    /// structured output's `success` boolean.
    pub exit_expression: Option<String>,
    pub tool_servers: HashMap<String, ToolServerDescriptor>,
}

/// The whole catalog: version, shared system prompt, commands by name.
#[derive(Clone, Debug, Default)]
pub struct AgentConfig {
    pub version: String,
    pub system_prompt: String,
    commands: HashMap<String, Arc<AgentCommand>>,
}

impl AgentConfig {
    /// Loads and validates the catalog from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parses and validates a catalog document.
    pub fn parse(yaml: &str) -> Result<Self, CatalogError> {
        let raw: RawCatalog = serde_yaml::from_str(yaml)?;
        let system_prompt = raw.system_prompt.unwrap_or_default();

        let mut commands = HashMap::with_capacity(raw.commands.len());
        for (name, cmd) in raw.commands {
            let output_schema = to_json(cmd.output_schema).map_err(|e| CatalogError::Schema {
                command: name.clone(),
                message: e,
            })?;
            let output_schema =
                normalize_output_schema(output_schema).map_err(|message| CatalogError::Schema {
                    command: name.clone(),
                    message,
                })?;

            let tool_servers = parse_tool_servers(cmd.mcp_servers.as_deref()).map_err(
                |message| CatalogError::ToolServers {
                    command: name.clone(),
                    message,
                },
            )?;

            let command = AgentCommand {
                name: name.clone(),
                system_prompt: system_prompt.clone(),
                description: cmd.description,
                instructions: cmd.instructions.unwrap_or_default(),
                model: cmd.model,
                tools: cmd.tools,
                execution_strategy: cmd.execution_strategy,
                output_schema,
                exit_expression: cmd.exit_expression,
                tool_servers,
            };
            commands.insert(name, Arc::new(command));
        }

        Ok(Self {
            version: raw.version.unwrap_or_default(),
            system_prompt,
            commands,
        })
    }

    /// Looks up a command by name.
    pub fn get(&self, name: &str) -> Option<Arc<AgentCommand>> {
        self.commands.get(name).cloned()
    }

    /// Names of all commands, for router registration.
    pub fn command_names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// The `mcpServers` field is a JSON string: `{"name": {"command": ..}}`.
fn parse_tool_servers(
    raw: Option<&str>,
) -> Result<HashMap<String, ToolServerDescriptor>, String> {
    let Some(raw) = raw else {
        return Ok(HashMap::new());
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(HashMap::new());
    }
    serde_json::from_str(raw).map_err(|e| e.to_string())
}

fn to_json(yaml: Option<serde_yaml::Value>) -> Result<Value, String> {
    match yaml {
        Some(v) => serde_json::to_value(v).map_err(|e| e.to_string()),
        None => Err("missing outputSchema".to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    version: Option<String>,
    #[serde(rename = "systemPrompt")]
    system_prompt: Option<String>,
    #[serde(default)]
    commands: HashMap<String, RawCommand>,
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    description: Option<String>,
    instructions: Option<String>,
    model: Option<String>,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(rename = "executionStrategy")]
    execution_strategy: Option<String>,
    #[serde(rename = "outputSchema")]
    output_schema: Option<serde_yaml::Value>,
    #[serde(rename = "exitExpression")]
    exit_expression: Option<String>,
    #[serde(rename = "mcpServers")]
    mcp_servers: Option<String>,
}
