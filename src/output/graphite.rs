//! Graphite output writer.
//!
//! Speaks the Graphite plaintext protocol (`<path> <value> <epoch-secs>\n`)
//! over TCP. The connection is established lazily and dropped on any write
//! error, so the next batch triggers a reconnect.

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use crate::model::{Query, QueryResult, Server};
use crate::output::sample_path;

#[derive(Debug)]
pub struct GraphiteWriter {
    host: String,
    port: u16,
    prefix: Option<String>,
    stream: Mutex<Option<TcpStream>>,
}

impl GraphiteWriter {
    pub fn new(host: String, port: u16, prefix: Option<String>) -> Self {
        Self {
            host,
            port,
            prefix,
            stream: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        // Connection is deferred to the first write; a Graphite endpoint
        // that is down at startup must not fail the whole reload.
        Ok(())
    }

    pub fn validate(&self) -> Option<String> {
        if self.host.is_empty() {
            return Some("graphite writer requires a host".to_string());
        }
        if self.port == 0 {
            return Some("graphite writer requires a non-zero port".to_string());
        }
        None
    }

    pub async fn write(
        &self,
        server: &Server,
        query: &Query,
        results: &[QueryResult],
    ) -> Result<()> {
        let mut payload = String::new();
        for result in results {
            let path = sample_path(server, query, result);
            match &self.prefix {
                Some(prefix) => payload.push_str(&format!(
                    "{}.{} {} {}\n",
                    prefix,
                    path,
                    result.value,
                    result.timestamp_ms / 1000
                )),
                None => payload.push_str(&format!(
                    "{} {} {}\n",
                    path,
                    result.value,
                    result.timestamp_ms / 1000
                )),
            }
        }

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect((self.host.as_str(), self.port))
                .await
                .with_context(|| format!("connecting to graphite at {}:{}", self.host, self.port))?;
            debug!(host = %self.host, port = self.port, "connected to graphite");
            *guard = Some(stream);
        }
        let stream = guard.as_mut().expect("stream populated above");
        if let Err(e) = stream.write_all(payload.as_bytes()).await {
            // Drop the broken connection so the next batch reconnects.
            *guard = None;
            return Err(e).with_context(|| format!("writing to graphite at {}:{}", self.host, self.port));
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn validate_rejects_empty_endpoint() {
        assert!(GraphiteWriter::new(String::new(), 2003, None)
            .validate()
            .is_some());
        assert!(GraphiteWriter::new("g".to_string(), 0, None)
            .validate()
            .is_some());
        assert!(GraphiteWriter::new("g".to_string(), 2003, None)
            .validate()
            .is_none());
    }

    #[tokio::test]
    async fn writes_plaintext_lines_with_prefix() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = String::new();
            socket.read_to_string(&mut buf).await.unwrap();
            buf
        });

        let writer = GraphiteWriter::new(
            addr.ip().to_string(),
            addr.port(),
            Some("metrics".to_string()),
        );
        let server = Server {
            host: "app01".to_string(),
            port: 8778,
            alias: None,
            username: None,
            password: None,
            cron: None,
            run_period_seconds: None,
            queries: vec![],
            output_writers: vec![],
        };
        let query = Arc::new(Query {
            object_name: "java.lang:type=Threading".to_string(),
            attributes: vec!["ThreadCount".to_string()],
            result_alias: Some("threads".to_string()),
            keys: vec![],
            output_writers: vec![],
        });
        let results = vec![QueryResult {
            attribute: "ThreadCount".to_string(),
            key: None,
            value: 7.0,
            timestamp_ms: 5_000,
        }];
        writer.write(&server, &query, &results).await.unwrap();
        writer.close().await.unwrap();

        let received = accept.await.unwrap();
        assert_eq!(received, "metrics.app01:8778.threads.ThreadCount 7 5\n");
    }
}
