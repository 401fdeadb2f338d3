//! File output writer.

use anyhow::{Context, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::model::{Query, QueryResult, Server};
use crate::output::sample_path;

/// Appends `key value timestamp` lines to a file, flushing after each batch.
#[derive(Debug)]
pub struct FileWriter {
    path: String,
    file: Mutex<Option<File>>,
}

impl FileWriter {
    pub fn new(path: String) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating parent directory for {}", self.path))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening output file {}", self.path))?;
        *self.file.lock().await = Some(file);
        Ok(())
    }

    pub fn validate(&self) -> Option<String> {
        if self.path.is_empty() {
            return Some("file writer requires a non-empty path".to_string());
        }
        None
    }

    pub async fn write(
        &self,
        server: &Server,
        query: &Query,
        results: &[QueryResult],
    ) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .context("file writer used before start or after close")?;
        let mut buf = String::new();
        for result in results {
            buf.push_str(&format!(
                "{} {} {}\n",
                sample_path(server, query, result),
                result.value,
                result.timestamp_ms / 1000
            ));
        }
        file.write_all(buf.as_bytes())
            .await
            .with_context(|| format!("writing to {}", self.path))?;
        file.flush().await?;
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
        }
        Ok(())
    }
}
