use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::core::config::{EmbeddingConfig, api_key_from_env};

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` client.
pub struct HttpEmbedder {
    base_url: String,
    model: String,
    api_key: String,
    client: Client,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: String) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key,
            client: Client::new(),
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        Self::new(
            config.base_url.clone(),
            config.model.clone(),
            api_key_from_env(&config.api_key_env),
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let req = EmbeddingRequest {
            model: &self.model,
            input: text,
        };
        let mut request = self.client.post(self.endpoint()).json(&req);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let res = request.send().await?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "Embedding API Error: {}",
                res.text().await.unwrap_or_default()
            ));
        }
        let parsed: EmbeddingResponse = res.json().await?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow!("Embedding API returned no vectors"))
    }
}
