//! Newline-delimited JSON over TCP
//!
//! Keeps one connection open and reconnects lazily after any failure. A
//! batch counts as acknowledged once it has been fully written and
//! flushed to the socket.

use super::{encode_lines, AuditSink};
use crate::config::duration_serde;
use crate::error::{BeatError, Result};
use crate::types::Batch;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// TCP sink configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpSinkConfig {
    /// `host:port` of the line receiver
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    #[serde(default = "default_write_timeout", with = "duration_serde")]
    pub write_timeout: Duration,
}

fn default_address() -> String {
    "127.0.0.1:12225".to_string()
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_write_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for TcpSinkConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            connect_timeout: default_connect_timeout(),
            write_timeout: default_write_timeout(),
        }
    }
}

/// TCP line sink
pub struct TcpSink {
    name: String,
    config: TcpSinkConfig,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpSink {
    pub fn new(name: impl Into<String>, config: TcpSinkConfig) -> Self {
        Self {
            name: name.into(),
            config,
            stream: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.address),
        )
        .await
        .map_err(|_| {
            BeatError::sink(
                &self.name,
                format!("connect to {} timed out", self.config.address),
                true,
            )
        })?
        .map_err(|e| {
            BeatError::sink(
                &self.name,
                format!("connect to {}: {}", self.config.address, e),
                true,
            )
        })?;

        tracing::info!(sink = %self.name, address = %self.config.address, "Connected");
        Ok(stream)
    }
}

#[async_trait]
impl AuditSink for TcpSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, batch: &Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let bytes = encode_lines(&batch.events)?;

        let mut guard = self.stream.lock().await;
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        let write = async {
            stream.write_all(&bytes).await?;
            stream.flush().await
        };

        let outcome = tokio::time::timeout(self.config.write_timeout, write).await;
        match outcome {
            Ok(Ok(())) => {
                *guard = Some(stream);
                tracing::debug!(
                    sink = %self.name,
                    source_id = %batch.source_id,
                    events = batch.len(),
                    bytes = bytes.len(),
                    "Batch sent"
                );
                Ok(())
            }
            // Dropping the stream forces a reconnect on the next attempt
            Ok(Err(e)) => Err(BeatError::sink(
                &self.name,
                format!("write to {}: {}", self.config.address, e),
                true,
            )),
            Err(_) => Err(BeatError::sink(
                &self.name,
                format!("write to {} timed out", self.config.address),
                true,
            )),
        }
    }
}
