use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

use super::{ToolContext, ToolDefinition, ToolHandler, ToolSet, ToolSource};

/// An HTTP tool described by a `<data_dir>/tools/*.toml` file.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolManifest {
    pub name: String,
    pub description: String,
    #[serde(default = "default_parameters")]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub requires_confirmation: bool,
    pub endpoint: String,
}

fn default_parameters() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// POSTs the call arguments as JSON to the manifest's endpoint.
pub struct HttpToolHandler {
    endpoint: String,
    client: Client,
}

impl HttpToolHandler {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl ToolHandler for HttpToolHandler {
    async fn call(&self, ctx: &ToolContext, args: &serde_json::Value) -> Result<serde_json::Value> {
        let res = self
            .client
            .post(&self.endpoint)
            .header("X-Conversation-Id", &ctx.conversation_id)
            .json(args)
            .send()
            .await?;
        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            return Err(anyhow!("{} returned {}: {}", self.endpoint, status, body));
        }
        Ok(serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body)))
    }
}

/// Tools loaded from manifest files in a directory. A missing directory
/// yields an empty set; unparsable manifests are skipped.
pub struct ManifestToolSource {
    dir: PathBuf,
}

impl ManifestToolSource {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ToolSource for ManifestToolSource {
    fn name(&self) -> &str {
        "manifest"
    }

    async fn load(&self) -> Result<ToolSet> {
        let mut set = ToolSet::new();
        if !self.dir.is_dir() {
            return Ok(set);
        }

        let mut paths = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("toml") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let contents = match fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to read tool manifest at {:?}: {}", path, e);
                    continue;
                }
            };
            let manifest = match toml::from_str::<ToolManifest>(&contents) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Failed to parse tool manifest at {:?}: {}", path, e);
                    continue;
                }
            };

            let handler = Arc::new(HttpToolHandler::new(manifest.endpoint.clone()));
            if manifest.requires_confirmation {
                set.register_with_confirmation(
                    ToolDefinition::requires_confirmation(
                        manifest.name.clone(),
                        manifest.description,
                        manifest.parameters,
                    ),
                    handler,
                );
            } else {
                set.register(ToolDefinition::auto(
                    manifest.name.clone(),
                    manifest.description,
                    manifest.parameters,
                    handler,
                ));
            }
            info!("Loaded manifest tool: {}", manifest.name);
        }
        Ok(set)
    }
}
