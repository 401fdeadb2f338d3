//! Runtime data model: servers, queries, and query results.
//!
//! `Server` and `Query` are produced by the configuration parser at load or
//! reload time and are immutable until the next reload replaces them. Output
//! writer instances ride along on both levels and are shared with the result
//! dispatch workers.

use std::sync::Arc;

use crate::output::OutputWriter;

/// A configured target process to poll.
///
/// Identity is `host:port`; `alias` only changes how samples are keyed by the
/// writers.
#[derive(Debug)]
pub struct Server {
    pub host: String,
    pub port: u16,
    pub alias: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Seconds-resolution cron expression; when present and valid it takes
    /// precedence over the interval trigger.
    pub cron: Option<String>,
    /// Per-server polling period, overriding the global run period.
    pub run_period_seconds: Option<u64>,
    pub queries: Vec<Arc<Query>>,
    pub output_writers: Vec<Arc<OutputWriter>>,
}

impl Server {
    /// Stable `host:port` identity, used to key executor pools and job names.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Name under which samples are emitted: the alias when set, `host:port`
    /// otherwise.
    pub fn display_name(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.key())
    }

    /// Writers that apply to `query`: the union of server-level writers and
    /// the query's own.
    pub fn writers_for(&self, query: &Query) -> Vec<Arc<OutputWriter>> {
        self.output_writers
            .iter()
            .chain(query.output_writers.iter())
            .cloned()
            .collect()
    }

    /// Every writer reachable from this server, across both levels.
    pub fn all_writers(&self) -> Vec<Arc<OutputWriter>> {
        self.output_writers
            .iter()
            .cloned()
            .chain(
                self.queries
                    .iter()
                    .flat_map(|q| q.output_writers.iter().cloned()),
            )
            .collect()
    }
}

/// A single attribute-extraction request addressed to a server.
#[derive(Debug)]
pub struct Query {
    /// Management object name, e.g. `java.lang:type=Memory`.
    pub object_name: String,
    /// Attributes to read from the object.
    pub attributes: Vec<String>,
    /// Optional prefix used instead of the object name when keying samples.
    pub result_alias: Option<String>,
    /// For composite attribute values, only these keys are kept. Empty keeps
    /// all numeric keys.
    pub keys: Vec<String>,
    pub output_writers: Vec<Arc<OutputWriter>>,
}

impl Query {
    /// Name under which this query's samples are keyed.
    pub fn result_name(&self) -> &str {
        self.result_alias.as_deref().unwrap_or(&self.object_name)
    }
}

/// One numeric sample produced by executing a query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Attribute the value was read from.
    pub attribute: String,
    /// Composite key inside the attribute, when the value was a map.
    pub key: Option<String>,
    pub value: f64,
    /// Sample time in epoch milliseconds.
    pub timestamp_ms: i64,
}

impl QueryResult {
    /// Dotted sample key: `attribute` or `attribute.key`.
    pub fn sample_key(&self) -> String {
        match &self.key {
            Some(k) => format!("{}.{}", self.attribute, k),
            None => self.attribute.clone(),
        }
    }
}

/// A fixed set of servers handed to the agent for a one-shot standalone run.
#[derive(Debug, Default)]
pub struct ProcessConfig {
    pub servers: Vec<Arc<Server>>,
}
