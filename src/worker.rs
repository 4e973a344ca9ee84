//! Queue worker: drives the embedding pipeline from SQS.
//!
//! Each poll receives up to `sqs.receive_batch_size` messages. One message
//! runs through [`EmbeddingPipeline::embed_product`]; more run through
//! [`EmbeddingPipeline::embed_products`]. Outcomes are folded per receipt
//! handle (a handle succeeds only if every product under it succeeded),
//! successful messages are deleted, and failed ones are left on the queue
//! for redelivery after the visibility timeout.
//!
//! A body that does not parse as a [`ProductMessage`] counts as a failure.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::models::ProductMessage;
use crate::pipeline::EmbeddingPipeline;
use crate::sqs::SqsQueue;

/// A message as received from the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

/// Where the worker gets its messages from.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Long-poll for the next batch. An empty batch is not an error.
    async fn receive(&self) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledge a processed message.
    async fn delete(&self, receipt_handle: &str) -> Result<()>;
}

/// Outcome of one poll.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub deleted: usize,
    /// Receipt handles left on the queue.
    pub failed: Vec<String>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Worker {
    source: Arc<dyn MessageSource>,
    pipeline: EmbeddingPipeline,
}

impl Worker {
    pub fn new(source: Arc<dyn MessageSource>, pipeline: EmbeddingPipeline) -> Self {
        Self { source, pipeline }
    }

    /// Receive one batch and process it.
    pub async fn run_once(&self) -> Result<BatchReport> {
        let messages = self.source.receive().await?;
        Ok(self.process(&messages).await)
    }

    /// Process already received messages.
    pub async fn process(&self, messages: &[ReceivedMessage]) -> BatchReport {
        let mut report = BatchReport {
            received: messages.len(),
            ..Default::default()
        };
        if messages.is_empty() {
            return report;
        }

        // receipt handles in arrival order, and their folded outcome
        let mut handles: Vec<&str> = Vec::new();
        let mut outcome: HashMap<&str, bool> = HashMap::new();
        let mut parsed: Vec<(&str, ProductMessage)> = Vec::new();

        for msg in messages {
            let handle = msg.receipt_handle.as_str();
            if !outcome.contains_key(handle) {
                handles.push(handle);
                outcome.insert(handle, true);
            }
            match serde_json::from_str::<ProductMessage>(&msg.body) {
                Ok(product) => parsed.push((handle, product)),
                Err(e) => {
                    warn!(message_id = %msg.message_id, error = %e, "Unparseable message body");
                    outcome.insert(handle, false);
                }
            }
        }

        let products: Vec<ProductMessage> = parsed.iter().map(|(_, p)| p.clone()).collect();
        let results = match products.len() {
            0 => Vec::new(),
            1 => vec![self.pipeline.embed_product(&products[0]).await],
            _ => self.pipeline.embed_products(&products).await,
        };

        for ((handle, _), ok) in parsed.iter().zip(results) {
            if let Some(slot) = outcome.get_mut(handle) {
                *slot &= ok;
            }
        }

        for handle in handles {
            if outcome.get(handle).copied().unwrap_or(false) {
                match self.source.delete(handle).await {
                    Ok(()) => report.deleted += 1,
                    Err(e) => {
                        error!(error = %e, "Failed to delete message");
                        report.failed.push(handle.to_string());
                    }
                }
            } else {
                report.failed.push(handle.to_string());
            }
        }

        if report.is_success() {
            debug!(received = report.received, deleted = report.deleted, "Batch processed");
        } else {
            error!(
                received = report.received,
                deleted = report.deleted,
                failed = report.failed.len(),
                "Batch had failures; messages left for redelivery"
            );
        }
        report
    }

    /// Poll forever. Receive errors back off briefly and retry.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.run_once().await {
                Ok(report) if report.received > 0 => {
                    info!(
                        received = report.received,
                        deleted = report.deleted,
                        failed = report.failed.len(),
                        "Processed batch"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Failed to receive messages");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// Poll until `shutdown` resolves, then close the pipeline.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let result = tokio::select! {
            biased;
            _ = shutdown => {
                info!("Shutdown requested, stopping worker");
                Ok(())
            }
            result = self.run() => result,
        };
        self.close().await;
        result
    }

    pub async fn close(&self) {
        self.pipeline.close().await;
    }
}

/// `psearch worker`: consume the embedding queue.
pub async fn run_worker(config: &Config, once: bool) -> Result<()> {
    let queue = Arc::new(SqsQueue::new(&config.sqs)?);
    let pipeline = EmbeddingPipeline::from_config(config)?;
    let worker = Worker::new(queue, pipeline);

    if !once {
        info!(queue = %config.sqs.queue_url, "Worker started");
        return worker
            .run_until(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
    }

    let report = worker.run_once().await;
    worker.close().await;
    let report = report?;

    println!("worker (once)");
    println!("  received: {}", report.received);
    println!("  deleted: {}", report.deleted);
    println!("  failed: {}", report.failed.len());

    if !report.is_success() {
        bail!("{} message(s) failed", report.failed.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmbeddedProductDetails, RawProductDetails};
    use crate::traits::{
        EmbedRawProductDetails, FetchRawProductDetails, UpsertEmbeddedProductDetails,
    };
    use chrono::{NaiveDate, NaiveDateTime};
    use std::sync::Mutex;

    fn date() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 7, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    /// Knows every product except "missing".
    struct Catalogue;

    #[async_trait]
    impl FetchRawProductDetails for Catalogue {
        async fn fetch(&self, product_id: &str) -> Option<RawProductDetails> {
            if product_id == "missing" {
                return None;
            }
            Some(RawProductDetails {
                product_id: product_id.to_string(),
                name: "thing".to_string(),
                main_category: String::new(),
                sub_category: String::new(),
                image_url: String::new(),
                ratings: 0.0,
                discount_price: 0.0,
                actual_price: 0.0,
                modified_date: date(),
                created_date: date(),
            })
        }

        async fn fetch_many(&self, ids: &[String]) -> Vec<Option<RawProductDetails>> {
            let mut out = Vec::new();
            for id in ids {
                out.push(self.fetch(id).await);
            }
            out
        }
    }

    struct Unit;

    #[async_trait]
    impl EmbedRawProductDetails for Unit {
        async fn embed(&self, p: &RawProductDetails) -> Option<EmbeddedProductDetails> {
            Some(EmbeddedProductDetails {
                product_id: p.product_id.clone(),
                embedding: vec![1.0],
                modified_date: p.modified_date,
                created_date: p.created_date,
            })
        }

        async fn embed_many(&self, ps: &[RawProductDetails]) -> Vec<Option<EmbeddedProductDetails>> {
            let mut out = Vec::new();
            for p in ps {
                out.push(self.embed(p).await);
            }
            out
        }
    }

    struct Sink;

    #[async_trait]
    impl UpsertEmbeddedProductDetails for Sink {
        async fn upsert(&self, _: &EmbeddedProductDetails) -> bool {
            true
        }

        async fn upsert_many(&self, ps: &[EmbeddedProductDetails]) -> Vec<bool> {
            vec![true; ps.len()]
        }
    }

    #[derive(Default)]
    struct ClosingSink {
        closed: Mutex<bool>,
    }

    #[async_trait]
    impl UpsertEmbeddedProductDetails for ClosingSink {
        async fn upsert(&self, _: &EmbeddedProductDetails) -> bool {
            true
        }

        async fn upsert_many(&self, ps: &[EmbeddedProductDetails]) -> Vec<bool> {
            vec![true; ps.len()]
        }

        async fn close(&self) -> bool {
            *self.closed.lock().unwrap() = true;
            true
        }
    }

    struct FakeQueue {
        batch: Vec<ReceivedMessage>,
        deleted: Mutex<Vec<String>>,
        reject_delete: Option<String>,
    }

    #[async_trait]
    impl MessageSource for FakeQueue {
        async fn receive(&self) -> Result<Vec<ReceivedMessage>> {
            Ok(self.batch.clone())
        }

        async fn delete(&self, receipt_handle: &str) -> Result<()> {
            if self.reject_delete.as_deref() == Some(receipt_handle) {
                bail!("delete refused");
            }
            self.deleted.lock().unwrap().push(receipt_handle.to_string());
            Ok(())
        }
    }

    fn message(handle: &str, product_id: &str) -> ReceivedMessage {
        ReceivedMessage {
            message_id: format!("m-{}", handle),
            receipt_handle: handle.to_string(),
            body: format!(
                r#"{{"product_id":"{}","modified_date":"2024-07-01 00:00:00.000000"}}"#,
                product_id
            ),
        }
    }

    fn worker(batch: Vec<ReceivedMessage>, reject_delete: Option<&str>) -> (Worker, Arc<FakeQueue>) {
        let queue = Arc::new(FakeQueue {
            batch,
            deleted: Mutex::new(Vec::new()),
            reject_delete: reject_delete.map(str::to_string),
        });
        let pipeline = EmbeddingPipeline::new(Arc::new(Catalogue), Arc::new(Unit), vec![Arc::new(Sink)]);
        (Worker::new(queue.clone(), pipeline), queue)
    }

    #[tokio::test]
    async fn test_deletes_successes_and_keeps_failures() {
        let (worker, queue) = worker(
            vec![
                message("h1", "1"),
                message("h2", "missing"),
                ReceivedMessage {
                    message_id: "m-h3".to_string(),
                    receipt_handle: "h3".to_string(),
                    body: "not json".to_string(),
                },
                message("h4", "4"),
            ],
            None,
        );
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.received, 4);
        assert_eq!(report.deleted, 2);
        assert_eq!(report.failed, vec!["h2".to_string(), "h3".to_string()]);
        assert_eq!(
            *queue.deleted.lock().unwrap(),
            vec!["h1".to_string(), "h4".to_string()]
        );
    }

    #[tokio::test]
    async fn test_single_message() {
        let (worker, queue) = worker(vec![message("h1", "1")], None);
        let report = worker.run_once().await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.deleted, 1);
        assert_eq!(queue.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shared_receipt_handle_is_anded() {
        let (worker, queue) = worker(vec![message("h1", "1"), message("h1", "missing")], None);
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.failed, vec!["h1".to_string()]);
        assert!(queue.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_error_is_failure() {
        let (worker, _) = worker(vec![message("h1", "1"), message("h2", "2")], Some("h2"));
        let report = worker.run_once().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed, vec!["h2".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_poll() {
        let (worker, _) = worker(Vec::new(), None);
        let report = worker.run_once().await.unwrap();
        assert_eq!(report, BatchReport::default());
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_run_until_shutdown_closes_pipeline() {
        let queue = Arc::new(FakeQueue {
            batch: vec![message("h1", "1")],
            deleted: Mutex::new(Vec::new()),
            reject_delete: None,
        });
        let sink = Arc::new(ClosingSink::default());
        let stores: Vec<Arc<dyn UpsertEmbeddedProductDetails>> = vec![sink.clone()];
        let pipeline = EmbeddingPipeline::new(Arc::new(Catalogue), Arc::new(Unit), stores);
        let worker = Worker::new(queue, pipeline);

        worker.run_until(std::future::ready(())).await.unwrap();
        assert!(*sink.closed.lock().unwrap());
    }
}
