//! Console output writer.

use anyhow::Result;

use crate::model::{Query, QueryResult, Server};
use crate::output::sample_path;

/// Writes each sample as a single `key value timestamp` line on stdout.
/// Mostly useful for debugging a new configuration.
#[derive(Debug, Default)]
pub struct ConsoleWriter;

impl ConsoleWriter {
    pub fn new() -> Self {
        Self
    }

    pub async fn start(&self) -> Result<()> {
        Ok(())
    }

    pub fn validate(&self) -> Option<String> {
        None
    }

    pub async fn write(
        &self,
        server: &Server,
        query: &Query,
        results: &[QueryResult],
    ) -> Result<()> {
        for result in results {
            println!(
                "{} {} {}",
                sample_path(server, query, result),
                result.value,
                result.timestamp_ms / 1000
            );
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        Ok(())
    }
}
