//! Amazon SQS adapter over the SQS JSON protocol.
//!
//! Publishing a raw product sends a [`ProductMessage`] (`product_id` plus
//! `modified_date`) that the embedding worker later consumes. The same
//! client receives and deletes messages for [`crate::worker`].
//!
//! Every call is a signed `POST /` with an `X-Amz-Target` header naming the
//! action and a JSON body; see the
//! [SQS API reference](https://docs.aws.amazon.com/AWSSimpleQueueService/latest/APIReference/Welcome.html).
//!
//! # Configuration
//!
//! ```toml
//! [sqs]
//! queue_url = "https://sqs.ap-east-1.amazonaws.com/123456789012/products"
//! region = "ap-east-1"
//! # endpoint_url = "http://localhost:4566"   # LocalStack
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error};

use crate::aws::{AwsCredentials, RecyclingClient, SigV4Signer};
use crate::config::SqsConfig;
use crate::models::{ProductMessage, RawProductDetails};
use crate::traits::UpsertRawProductDetails;
use crate::worker::{MessageSource, ReceivedMessage};

/// SQS rejects batches larger than this.
pub const MAX_BATCH_ENTRIES: usize = 10;

pub struct SqsQueue {
    queue_url: String,
    endpoint: String,
    signer: SigV4Signer,
    client: RecyclingClient,
    upsert_batch_size: usize,
    receive_batch_size: u32,
    wait_time_secs: u32,
}

#[derive(Debug, Deserialize)]
struct BatchResultEntry {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct BatchFailureEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Code", default)]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct SendMessageBatchResponse {
    #[serde(rename = "Successful", default)]
    successful: Vec<BatchResultEntry>,
    #[serde(rename = "Failed", default)]
    failed: Vec<BatchFailureEntry>,
}

#[derive(Debug, Deserialize)]
struct SqsMessage {
    #[serde(rename = "MessageId", default)]
    message_id: String,
    #[serde(rename = "ReceiptHandle")]
    receipt_handle: String,
    #[serde(rename = "Body")]
    body: String,
}

#[derive(Debug, Deserialize)]
struct ReceiveMessageResponse {
    #[serde(rename = "Messages", default)]
    messages: Vec<SqsMessage>,
}

impl SqsQueue {
    pub fn new(config: &SqsConfig) -> Result<Self> {
        let credentials = AwsCredentials::from_env()?;
        Ok(Self::with_credentials(config, credentials))
    }

    pub fn with_credentials(config: &SqsConfig, credentials: AwsCredentials) -> Self {
        let endpoint = config
            .endpoint_url
            .clone()
            .unwrap_or_else(|| format!("https://sqs.{}.amazonaws.com", config.region));
        // long polls must finish before the client gives up
        let timeout = Duration::from_secs(u64::from(config.wait_time_secs) + 10);

        Self {
            queue_url: config.queue_url.clone(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            signer: SigV4Signer::new(credentials, &config.region, "sqs"),
            client: RecyclingClient::new(timeout),
            upsert_batch_size: config.upsert_batch_size.min(MAX_BATCH_ENTRIES),
            receive_batch_size: config.receive_batch_size,
            wait_time_secs: config.wait_time_secs,
        }
    }

    async fn call(&self, action: &str, body: Value) -> Result<Value> {
        let client = self.client.get()?;
        let headers = vec![
            (
                "content-type".to_string(),
                "application/x-amz-json-1.0".to_string(),
            ),
            ("x-amz-target".to_string(), format!("AmazonSQS.{}", action)),
        ];
        let url = format!("{}/", self.endpoint);
        let resp = self
            .signer
            .send(&client, Method::POST, &url, &headers, serde_json::to_vec(&body)?)
            .await
            .with_context(|| format!("SQS {} request failed", action))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("SQS {} failed (HTTP {}): {}", action, status, text);
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).with_context(|| format!("Invalid SQS {} response", action))
    }

    async fn send_one(&self, product: &RawProductDetails) -> Result<()> {
        let body = serde_json::to_string(&ProductMessage::from(product))?;
        self.call(
            "SendMessage",
            json!({ "QueueUrl": self.queue_url, "MessageBody": body }),
        )
        .await?;
        Ok(())
    }

    async fn send_batch(&self, products: &[RawProductDetails]) -> Result<Vec<bool>> {
        let entries = products
            .iter()
            .enumerate()
            .map(|(i, p)| -> Result<Value> {
                Ok(json!({
                    "Id": i.to_string(),
                    "MessageBody": serde_json::to_string(&ProductMessage::from(p))?,
                }))
            })
            .collect::<Result<Vec<Value>>>()?;

        let resp = self
            .call(
                "SendMessageBatch",
                json!({ "QueueUrl": self.queue_url, "Entries": entries }),
            )
            .await?;
        let parsed: SendMessageBatchResponse =
            serde_json::from_value(resp).context("Invalid SendMessageBatch response")?;
        Ok(batch_outcome(&parsed, products))
    }
}

/// Map a `SendMessageBatch` response back to entry positions. Entry ids are
/// the positions within the batch; an entry missing from both lists failed.
fn batch_outcome(resp: &SendMessageBatchResponse, products: &[RawProductDetails]) -> Vec<bool> {
    let mut outcome = vec![false; products.len()];
    for ok in &resp.successful {
        if let Some(slot) = ok.id.parse::<usize>().ok().and_then(|i| outcome.get_mut(i)) {
            *slot = true;
        }
    }
    for failed in &resp.failed {
        if let Some(product) = failed.id.parse::<usize>().ok().and_then(|i| products.get(i)) {
            error!(
                product_id = %product.product_id,
                code = %failed.code,
                message = %failed.message,
                "SQS rejected message"
            );
        }
        if let Some(slot) = failed.id.parse::<usize>().ok().and_then(|i| outcome.get_mut(i)) {
            *slot = false;
        }
    }
    outcome
}

#[async_trait]
impl UpsertRawProductDetails for SqsQueue {
    async fn upsert(&self, product: &RawProductDetails) -> bool {
        match self.send_one(product).await {
            Ok(_) => true,
            Err(e) => {
                error!(product_id = %product.product_id, error = %e, "Error publishing raw product details");
                false
            }
        }
    }

    async fn upsert_many(&self, products: &[RawProductDetails]) -> Vec<bool> {
        let mut successes = Vec::with_capacity(products.len());
        for chunk in products.chunks(self.upsert_batch_size) {
            match self.send_batch(chunk).await {
                Ok(flags) => successes.extend(flags),
                Err(e) => {
                    let ids: Vec<&str> = chunk.iter().map(|p| p.product_id.as_str()).collect();
                    error!(product_ids = ?ids, error = %e, "Error publishing raw product batch");
                    successes.extend(std::iter::repeat(false).take(chunk.len()));
                }
            }
        }
        successes
    }

    async fn close(&self) -> bool {
        self.client.reset();
        true
    }
}

#[async_trait]
impl MessageSource for SqsQueue {
    async fn receive(&self) -> Result<Vec<ReceivedMessage>> {
        let resp = self
            .call(
                "ReceiveMessage",
                json!({
                    "QueueUrl": self.queue_url,
                    "MaxNumberOfMessages": self.receive_batch_size,
                    "WaitTimeSeconds": self.wait_time_secs,
                }),
            )
            .await?;
        let parsed: ReceiveMessageResponse = if resp.is_null() {
            ReceiveMessageResponse { messages: Vec::new() }
        } else {
            serde_json::from_value(resp).context("Invalid ReceiveMessage response")?
        };
        debug!(count = parsed.messages.len(), "Received messages");

        Ok(parsed
            .messages
            .into_iter()
            .map(|m| ReceivedMessage {
                message_id: m.message_id,
                receipt_handle: m.receipt_handle,
                body: m.body,
            })
            .collect())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        self.call(
            "DeleteMessage",
            json!({ "QueueUrl": self.queue_url, "ReceiptHandle": receipt_handle }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn raw(id: &str) -> RawProductDetails {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        RawProductDetails {
            product_id: id.to_string(),
            name: "kettle".to_string(),
            main_category: "appliances".to_string(),
            sub_category: "kitchen".to_string(),
            image_url: String::new(),
            ratings: 4.1,
            discount_price: 10.0,
            actual_price: 12.0,
            modified_date: date,
            created_date: date,
        }
    }

    #[test]
    fn test_batch_outcome_marks_only_failed_entries() {
        let products = vec![raw("a"), raw("b"), raw("c")];
        let resp: SendMessageBatchResponse = serde_json::from_value(json!({
            "Successful": [
                { "Id": "0", "MessageId": "m0", "MD5OfMessageBody": "x" },
                { "Id": "2", "MessageId": "m2", "MD5OfMessageBody": "y" }
            ],
            "Failed": [
                { "Id": "1", "Code": "InternalError", "Message": "boom", "SenderFault": false }
            ]
        }))
        .unwrap();
        assert_eq!(batch_outcome(&resp, &products), vec![true, false, true]);
    }

    #[test]
    fn test_batch_outcome_missing_entry_is_failure() {
        let products = vec![raw("a"), raw("b")];
        let resp: SendMessageBatchResponse =
            serde_json::from_value(json!({ "Successful": [ { "Id": "1" } ] })).unwrap();
        assert_eq!(batch_outcome(&resp, &products), vec![false, true]);
    }

    #[test]
    fn test_receive_response_parses_messages() {
        let resp: ReceiveMessageResponse = serde_json::from_value(json!({
            "Messages": [{
                "MessageId": "id-1",
                "ReceiptHandle": "rh-1",
                "Body": "{\"product_id\":\"1\",\"modified_date\":\"2024-05-01 08:00:00.000000\"}",
                "MD5OfBody": "abc"
            }]
        }))
        .unwrap();
        assert_eq!(resp.messages.len(), 1);
        assert_eq!(resp.messages[0].receipt_handle, "rh-1");
        let msg: ProductMessage = serde_json::from_str(&resp.messages[0].body).unwrap();
        assert_eq!(msg.product_id, "1");
    }

    #[test]
    fn test_batch_size_capped_at_ten() {
        let config = SqsConfig {
            queue_url: "http://localhost:4566/000000000000/products".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: Some("http://localhost:4566/".to_string()),
            upsert_batch_size: 25,
            wait_time_secs: 1,
            receive_batch_size: 10,
        };
        let creds = AwsCredentials {
            access_key_id: "test".to_string(),
            secret_access_key: "test".to_string(),
            session_token: None,
        };
        let queue = SqsQueue::with_credentials(&config, creds);
        assert_eq!(queue.upsert_batch_size, MAX_BATCH_ENTRIES);
        assert_eq!(queue.endpoint, "http://localhost:4566");
    }
}
