//! Output writers: sink adapters that forward query results downstream.
//!
//! Every sink implements the same capability surface (`start`,
//! `validate_setup`, `write`, `close`) behind the [`OutputWriter`] wrapper.
//! Writer instances are created by the configuration parser, started before
//! first use, shared between the lifecycle controller and the result dispatch
//! workers, and closed exactly once when their configuration generation is
//! retired.
//!
//! # Examples
//!
//! **YAML Format:**
//! ```yaml
//! output_writers:
//!   - type: graphite
//!     host: graphite.example.com
//!     port: 2003
//!     prefix: beanpoll
//!   - type: file
//!     path: /var/log/beanpoll/samples.out
//! ```
//!
//! **JSON Format:**
//! ```json
//! {
//!   "output_writers": [
//!     { "type": "graphite", "host": "graphite.example.com", "port": 2003 },
//!     { "type": "console" }
//!   ]
//! }
//! ```

mod console;
mod file;
mod graphite;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::model::{Query, QueryResult, Server};

pub use console::ConsoleWriter;
pub use file::FileWriter;
pub use graphite::GraphiteWriter;

/// Declarative writer configuration, one tagged variant per sink kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WriterConfig {
    /// Print samples as single lines on stdout.
    Console,
    /// Append `key value timestamp` lines to a file.
    File { path: String },
    /// Graphite plaintext protocol over TCP.
    Graphite {
        host: String,
        port: u16,
        #[serde(default)]
        prefix: Option<String>,
    },
}

impl WriterConfig {
    /// Instantiate the writer described by this configuration.
    pub fn build(&self) -> OutputWriter {
        let sink = match self {
            WriterConfig::Console => WriterSink::Console(ConsoleWriter::new()),
            WriterConfig::File { path } => WriterSink::File(FileWriter::new(path.clone())),
            WriterConfig::Graphite { host, port, prefix } => WriterSink::Graphite(
                GraphiteWriter::new(host.clone(), *port, prefix.clone()),
            ),
        };
        OutputWriter::new(sink)
    }
}

/// The concrete sink behind an [`OutputWriter`].
#[derive(Debug)]
pub enum WriterSink {
    Console(ConsoleWriter),
    File(FileWriter),
    Graphite(GraphiteWriter),
    #[cfg(test)]
    Mock(mock::MockWriter),
}

/// A sink adapter plus its lifecycle bookkeeping.
#[derive(Debug)]
pub struct OutputWriter {
    sink: WriterSink,
    started: AtomicBool,
    close_count: AtomicUsize,
}

impl OutputWriter {
    pub fn new(sink: WriterSink) -> Self {
        Self {
            sink,
            started: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
        }
    }

    /// Short sink-kind label used in log messages.
    pub fn kind(&self) -> &'static str {
        match &self.sink {
            WriterSink::Console(_) => "console",
            WriterSink::File(_) => "file",
            WriterSink::Graphite(_) => "graphite",
            #[cfg(test)]
            WriterSink::Mock(_) => "mock",
        }
    }

    /// Acquire whatever resources the sink needs before the first `write`.
    pub async fn start(&self) -> Result<()> {
        match &self.sink {
            WriterSink::Console(w) => w.start().await?,
            WriterSink::File(w) => w.start().await?,
            WriterSink::Graphite(w) => w.start().await?,
            #[cfg(test)]
            WriterSink::Mock(w) => w.start(),
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Check that this writer can service the `(server, query)` pairing.
    pub fn validate_setup(&self, server: &Server, query: &Query) -> Result<(), AgentError> {
        let problem = match &self.sink {
            WriterSink::Console(w) => w.validate(),
            WriterSink::File(w) => w.validate(),
            WriterSink::Graphite(w) => w.validate(),
            #[cfg(test)]
            WriterSink::Mock(w) => w.validate(),
        };
        match problem {
            None => Ok(()),
            Some(message) => Err(AgentError::Validation {
                server: server.key(),
                query: query.object_name.clone(),
                message,
            }),
        }
    }

    /// Forward one batch of results. Failures are returned to the caller,
    /// which logs and swallows them so one bad sink cannot starve the rest.
    pub async fn write(
        &self,
        server: &Server,
        query: &Query,
        results: &[QueryResult],
    ) -> Result<()> {
        match &self.sink {
            WriterSink::Console(w) => w.write(server, query, results).await,
            WriterSink::File(w) => w.write(server, query, results).await,
            WriterSink::Graphite(w) => w.write(server, query, results).await,
            #[cfg(test)]
            WriterSink::Mock(w) => w.write(server, query, results),
        }
    }

    /// Release the sink's resources. The lifecycle controller calls this
    /// exactly once per writer when the owning configuration is retired.
    pub async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        match &self.sink {
            WriterSink::Console(w) => w.close().await,
            WriterSink::File(w) => w.close().await,
            WriterSink::Graphite(w) => w.close().await,
            #[cfg(test)]
            WriterSink::Mock(w) => w.close(),
        }
    }

    /// Whether `start()` has run and `close()` has not.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Number of times `close()` has been invoked.
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn sink_for_tests(&self) -> &WriterSink {
        &self.sink
    }
}

/// Render the dotted sample key for a result batch entry:
/// `<server>.<query result name>.<attribute>[.<composite key>]`.
pub(crate) fn sample_path(server: &Server, query: &Query, result: &QueryResult) -> String {
    format!(
        "{}.{}.{}",
        server.display_name(),
        query.result_name(),
        result.sample_key()
    )
}
