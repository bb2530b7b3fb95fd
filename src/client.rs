//! Retry-safe access to the array's REST object store.
//!
//! The array rejects concurrent calls from a single client identity and
//! throttles bursty ones with transient busy codes, so every call is
//! serialized through one mutex and retried on the enumerated busy codes
//! only. Anything else surfaces as a generic [`DriverError::Api`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::RETRY_DELAY;
use crate::error::{DriverError, Result};

/// Busy codes the array answers with while it is throttling or still
/// working on a previous request. Only these are worth retrying.
const RETRYABLE_ERRORS: [&str; 4] = [
    "MC_ERR_BUSY",
    "MC_ERR_BUSY_SPECIFIC",
    "MC_ERR_INPROGRESS",
    "MC_ERR_START_TIMEOUT",
];

/// A failed call against the remote object store.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    /// HTTP-level status, when the request made it to the array.
    pub status: Option<u16>,
    pub message: String,
}

impl TransportError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        TransportError {
            status,
            message: message.into(),
        }
    }

    fn is_retryable(&self) -> bool {
        self.status == Some(400) && RETRYABLE_ERRORS.contains(&self.message.as_str())
    }
}

/// The array's generic search/create/update/delete contract. The concrete
/// REST implementation lives in [`crate::rest`]; tests provide an
/// in-memory one.
#[async_trait]
pub trait ArrayTransport: Send + Sync {
    async fn search(
        &self,
        resource: &str,
        filters: &Value,
    ) -> std::result::Result<Vec<Value>, TransportError>;
    async fn create(
        &self,
        resource: &str,
        fields: &Value,
    ) -> std::result::Result<Value, TransportError>;
    async fn update(
        &self,
        resource: &str,
        id: u64,
        fields: &Value,
    ) -> std::result::Result<Value, TransportError>;
    async fn delete(&self, resource: &str, id: u64) -> std::result::Result<(), TransportError>;
}

enum Op<'a> {
    Search { resource: &'a str, filters: &'a Value },
    Create { resource: &'a str, fields: &'a Value },
    Update { resource: &'a str, id: u64, fields: &'a Value },
    Delete { resource: &'a str, id: u64 },
}

enum OpResult {
    Hits(Vec<Value>),
    Object(Value),
    Deleted,
}

/// Serialized, busy-retrying wrapper around an [`ArrayTransport`].
pub struct ArrayClient {
    transport: Arc<dyn ArrayTransport>,
    lock: Mutex<()>,
    retries: u32,
    retry_delay: Duration,
}

impl ArrayClient {
    pub fn new(transport: Arc<dyn ArrayTransport>, retries: u32) -> Self {
        ArrayClient {
            transport,
            lock: Mutex::new(()),
            retries: retries.max(1),
            retry_delay: RETRY_DELAY,
        }
    }

    #[cfg(test)]
    pub fn without_delay(mut self) -> Self {
        self.retry_delay = Duration::ZERO;
        self
    }

    pub async fn search(&self, resource: &str, filters: Value) -> Result<Vec<Value>> {
        match self.execute(Op::Search { resource, filters: &filters }).await? {
            OpResult::Hits(hits) => Ok(hits),
            _ => unreachable!("search returns hits"),
        }
    }

    pub async fn create(&self, resource: &str, fields: Value) -> Result<Value> {
        match self.execute(Op::Create { resource, fields: &fields }).await? {
            OpResult::Object(object) => Ok(object),
            _ => unreachable!("create returns an object"),
        }
    }

    pub async fn update(&self, resource: &str, id: u64, fields: Value) -> Result<Value> {
        match self.execute(Op::Update { resource, id, fields: &fields }).await? {
            OpResult::Object(object) => Ok(object),
            _ => unreachable!("update returns an object"),
        }
    }

    pub async fn delete(&self, resource: &str, id: u64) -> Result<()> {
        self.execute(Op::Delete { resource, id }).await?;
        Ok(())
    }

    /// Runs one remote call under the client mutex, sleeping and retrying
    /// while the array reports a transient busy code, up to the retry
    /// ceiling.
    async fn execute(&self, op: Op<'_>) -> Result<OpResult> {
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }

            let result = {
                let _serialized = self.lock.lock().await;
                match &op {
                    Op::Search { resource, filters } => self
                        .transport
                        .search(resource, filters)
                        .await
                        .map(OpResult::Hits),
                    Op::Create { resource, fields } => self
                        .transport
                        .create(resource, fields)
                        .await
                        .map(OpResult::Object),
                    Op::Update { resource, id, fields } => self
                        .transport
                        .update(resource, *id, fields)
                        .await
                        .map(OpResult::Object),
                    Op::Delete { resource, id } => self
                        .transport
                        .delete(resource, *id)
                        .await
                        .map(|_| OpResult::Deleted),
                }
            };

            match result {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    if attempt >= self.retries {
                        return Err(DriverError::Api(format!(
                            "array still busy after {} retries: {}",
                            self.retries, e.message
                        )));
                    }
                    info!("Array busy ({}), retry {}/{}", e.message, attempt, self.retries);
                }
                Err(e) => return Err(DriverError::Api(e.message)),
            }
        }
    }
}
