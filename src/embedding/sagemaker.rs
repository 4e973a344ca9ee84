//! SageMaker runtime embedding backend.
//!
//! Each text is sent as its own `InvokeEndpoint` call:
//!
//! ```text
//! POST https://runtime.sagemaker.{region}.amazonaws.com/endpoints/{name}/invocations
//! {"text": "steel kettle"}  →  {"result": [0.01, -0.12, ...]}
//! ```
//!
//! Calls within a batch run concurrently, at most `embedding.max_workers`
//! at a time, and results keep the input order. A failed call only fails
//! its own text.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::Method;
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

use super::TextEmbedder;
use crate::aws::{uri_encode, AwsCredentials, RecyclingClient, SigV4Signer};
use crate::config::EmbeddingConfig;

pub struct SagemakerEmbedder {
    endpoint_name: String,
    url: String,
    signer: SigV4Signer,
    client: RecyclingClient,
    max_workers: usize,
}

#[derive(Debug, Deserialize)]
struct InvocationResponse {
    result: Vec<f32>,
}

impl SagemakerEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let credentials = AwsCredentials::from_env()?;
        Self::with_credentials(config, credentials)
    }

    pub fn with_credentials(config: &EmbeddingConfig, credentials: AwsCredentials) -> Result<Self> {
        let endpoint_name = config
            .sagemaker_endpoint
            .clone()
            .context("embedding.sagemaker_endpoint is required for provider 'sagemaker'")?;
        let region = config
            .region
            .as_deref()
            .context("embedding.region is required for provider 'sagemaker'")?;

        Ok(Self {
            url: invocation_url(region, &endpoint_name),
            endpoint_name,
            signer: SigV4Signer::new(credentials, region, "sagemaker"),
            client: RecyclingClient::new(Duration::from_secs(config.timeout_secs)),
            max_workers: config.max_workers,
        })
    }

    async fn invoke(&self, text: &str) -> Result<Vec<f32>> {
        let client = self.client.get()?;
        let body = serde_json::to_vec(&serde_json::json!({ "text": text }))?;
        let headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("accept".to_string(), "application/json".to_string()),
        ];
        let resp = self
            .signer
            .send(&client, Method::POST, &self.url, &headers, body)
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("InvokeEndpoint {} failed (HTTP {}): {}", self.endpoint_name, status, text);
        }
        let parsed: InvocationResponse = resp
            .json()
            .await
            .context("Invalid InvokeEndpoint response")?;
        Ok(parsed.result)
    }

    async fn invoke_logged(&self, text: &str) -> Option<Vec<f32>> {
        match self.invoke(text).await {
            Ok(v) => Some(v),
            Err(e) => {
                error!(endpoint = %self.endpoint_name, error = %e, "Error invoking embedding endpoint");
                None
            }
        }
    }
}

fn invocation_url(region: &str, endpoint_name: &str) -> String {
    format!(
        "https://runtime.sagemaker.{}.amazonaws.com/endpoints/{}/invocations",
        region,
        uri_encode(endpoint_name)
    )
}

#[async_trait]
impl TextEmbedder for SagemakerEmbedder {
    fn model_name(&self) -> &str {
        &self.endpoint_name
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let calls: Vec<_> = texts.iter().map(|text| self.invoke_logged(text)).collect();
        let results: Vec<Option<Vec<f32>>> = stream::iter(calls)
            .buffered(self.max_workers)
            .collect()
            .await;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingProviderKind;

    fn config() -> EmbeddingConfig {
        EmbeddingConfig {
            provider: EmbeddingProviderKind::Sagemaker,
            dims: 384,
            model_path: None,
            tokenizer_path: None,
            sagemaker_endpoint: Some("sentence-bert".to_string()),
            region: Some("ap-east-1".to_string()),
            batch_size: 5,
            max_workers: 10,
            max_seq_len: 256,
            timeout_secs: 30,
        }
    }

    fn creds() -> AwsCredentials {
        AwsCredentials {
            access_key_id: "AKID".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: None,
        }
    }

    #[test]
    fn test_invocation_url() {
        let embedder = SagemakerEmbedder::with_credentials(&config(), creds()).unwrap();
        assert_eq!(
            embedder.url,
            "https://runtime.sagemaker.ap-east-1.amazonaws.com/endpoints/sentence-bert/invocations"
        );
        assert_eq!(embedder.model_name(), "sentence-bert");
    }

    #[test]
    fn test_requires_endpoint() {
        let mut cfg = config();
        cfg.sagemaker_endpoint = None;
        assert!(SagemakerEmbedder::with_credentials(&cfg, creds()).is_err());
    }

    #[test]
    fn test_response_shape() {
        let parsed: InvocationResponse =
            serde_json::from_str(r#"{"result": [0.5, -0.25]}"#).unwrap();
        assert_eq!(parsed.result, vec![0.5, -0.25]);
    }

    #[tokio::test]
    async fn test_embed_texts_reports_each_failed_invocation() {
        let mut embedder = SagemakerEmbedder::with_credentials(&config(), creds()).unwrap();
        embedder.url = "http://127.0.0.1:1/endpoints/sentence-bert/invocations".to_string();
        let texts: Vec<String> = (0..12).map(|i| format!("product {}", i)).collect();

        let results = embedder.embed_texts(&texts).await.unwrap();
        assert_eq!(results.len(), texts.len());
        assert!(results.iter().all(Option::is_none));
    }
}
