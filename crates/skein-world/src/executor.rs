// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The executor seam.
//!
//! The queue does not know how workflow or step code runs; it hands every
//! dequeued message to an injected [`Executor`]. Production wires the
//! HTTP front-end through [`HttpExecutor`]; tests inject in-memory
//! implementations.

use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::queue::MessageData;

/// Handles one dequeued message. An `Err` puts the job on the retry
/// ladder; an `Ok` completes it.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute the message addressed to the reconstructed caller-side
    /// queue name (`__wkf_workflow_<id>` or `__wkf_step_<id>`).
    async fn execute(&self, queue_name: &str, message: MessageData) -> anyhow::Result<Value>;
}

/// Executor that POSTs each dispatch to an HTTP endpoint as JSON.
///
/// Request body: `{"queueName": ..., "message": <MessageData>}`. Any
/// non-2xx response is an error and feeds the retry ladder.
pub struct HttpExecutor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpExecutor {
    /// Create an executor that dispatches to `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(25))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(&self, queue_name: &str, message: MessageData) -> anyhow::Result<Value> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "queueName": queue_name,
                "message": message,
            }))
            .send()
            .await
            .with_context(|| format!("executor request to {} failed", self.endpoint))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            bail!("executor returned {status}: {body}");
        }

        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl Executor for EchoExecutor {
        async fn execute(&self, queue_name: &str, message: MessageData) -> anyhow::Result<Value> {
            Ok(json!({"queue": queue_name, "id": message.id}))
        }
    }

    #[tokio::test]
    async fn test_executor_trait_object() {
        let executor: std::sync::Arc<dyn Executor> = std::sync::Arc::new(EchoExecutor);
        let message = MessageData {
            id: "abc".to_string(),
            data: json!([1, 2]),
            attempt: 1,
            message_id: "msg_01TEST".to_string(),
            idempotency_key: None,
        };
        let result = executor
            .execute("__wkf_workflow_abc", message)
            .await
            .unwrap();
        assert_eq!(result["queue"], "__wkf_workflow_abc");
        assert_eq!(result["id"], "abc");
    }
}
