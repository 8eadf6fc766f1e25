//! Outcome sinks: a uniform publish capability
//!
//! Info payloads and failed records leave the loader through sinks backed
//! by the same broker abstractions used for input, by a local file, or by
//! memory in tests. Publish failures are classified transient and retried
//! by the dispatcher; exhausting those retries is process-fatal, because
//! losing failure visibility is as serious as losing the record itself.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use loader_common::{Error, Result};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::transport::PublishWire;

/// Uniform publish capability for info and failure payloads.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short sink name used in logs.
    fn name(&self) -> &'static str;

    async fn publish(&self, payload: &Value) -> Result<()>;
}

/// Sink appending JSON Lines to a local file.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl FileSink {
    pub async fn create(path: impl AsRef<Path>) -> Result<FileSink> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(FileSink {
            path,
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn publish(&self, payload: &Value) -> Result<()> {
        let mut line = payload.to_string();
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await.map_err(|err| {
            Error::SinkPublish(format!("writing {}: {err}", self.path.display()))
        })?;
        file.flush()
            .await
            .map_err(|err| Error::SinkPublish(format!("flushing {}: {err}", self.path.display())))
    }
}

/// Sink publishing through an outbound wire client.
pub struct WireSink<W: PublishWire> {
    wire: W,
    label: &'static str,
}

impl<W: PublishWire> WireSink<W> {
    pub fn new(wire: W, label: &'static str) -> Self {
        WireSink { wire, label }
    }

    pub fn wire(&self) -> &W {
        &self.wire
    }
}

#[async_trait]
impl<W: PublishWire> Sink for WireSink<W> {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn publish(&self, payload: &Value) -> Result<()> {
        self.wire
            .publish(payload.to_string().as_bytes())
            .await
            .map_err(|err| Error::SinkPublish(format!("{}: {err}", self.label)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryPublish;
    use serde_json::json;

    #[tokio::test]
    async fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.jsonl");
        let sink = FileSink::create(&path).await.unwrap();

        sink.publish(&json!({"RECORD_ID": "1"})).await.unwrap();
        sink.publish(&json!({"RECORD_ID": "2"})).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"1\""));
    }

    #[tokio::test]
    async fn wire_sink_maps_failures() {
        let sink = WireSink::new(MemoryPublish::new(), "info");
        sink.wire().fail_next(1);

        let err = sink.publish(&json!({})).await.unwrap_err();
        assert!(matches!(err, Error::SinkPublish(_)));

        sink.publish(&json!({"ok": true})).await.unwrap();
        assert_eq!(sink.wire().published().len(), 1);
    }
}
