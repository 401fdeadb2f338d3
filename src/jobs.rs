//! The server job: the unit of work fired by one scheduler tick.
//!
//! A tick submits one query task per query to the server's query pool. Each
//! query task performs the remote read and, on success, hands the result
//! batch to the result pool for writer dispatch. Per-query and per-writer
//! failures are logged and swallowed so one broken query or sink cannot
//! starve the rest of the tick.

use std::sync::Arc;

use tracing::{error, warn};

use crate::client::MBeanClient;
use crate::executors::BoundedExecutor;
use crate::model::Server;

pub struct ServerJob {
    server: Arc<Server>,
    client: Arc<dyn MBeanClient>,
    query_pool: Arc<BoundedExecutor>,
    result_pool: Arc<BoundedExecutor>,
}

impl ServerJob {
    pub fn new(
        server: Arc<Server>,
        client: Arc<dyn MBeanClient>,
        query_pool: Arc<BoundedExecutor>,
        result_pool: Arc<BoundedExecutor>,
    ) -> Self {
        Self {
            server,
            client,
            query_pool,
            result_pool,
        }
    }

    /// Fire one tick: submit every query on this server to the query pool.
    /// Submission never blocks; a full queue drops the tick for that query.
    pub fn run(&self) {
        for query in &self.server.queries {
            let server = Arc::clone(&self.server);
            let client = Arc::clone(&self.client);
            let query_owned = Arc::clone(query);
            let result_pool = Arc::clone(&self.result_pool);

            let task = async move {
                let results = match client.read_attributes(&server, &query_owned).await {
                    Ok(results) => results,
                    Err(e) => {
                        error!(
                            server = %server.key(),
                            query = %query_owned.object_name,
                            error = %e,
                            "query failed"
                        );
                        return;
                    }
                };
                if results.is_empty() {
                    return;
                }

                let writers = server.writers_for(&query_owned);
                let dispatch_server = Arc::clone(&server);
                let dispatch_query = Arc::clone(&query_owned);
                let dispatch = async move {
                    for writer in writers {
                        if let Err(e) = writer
                            .write(&dispatch_server, &dispatch_query, &results)
                            .await
                        {
                            error!(
                                server = %dispatch_server.key(),
                                query = %dispatch_query.object_name,
                                writer = writer.kind(),
                                error = %e,
                                "writer failed"
                            );
                        }
                    }
                };
                if let Err(rejection) = result_pool.try_execute(dispatch) {
                    warn!(
                        server = %server.key(),
                        query = %query_owned.object_name,
                        ?rejection,
                        "result pool refused dispatch, dropping batch"
                    );
                }
            };

            if let Err(rejection) = self.query_pool.try_execute(task) {
                warn!(
                    server = %self.server.key(),
                    query = %query.object_name,
                    ?rejection,
                    "query pool refused task, dropping tick for this query"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    use super::*;
    use crate::executors::PoolRole;
    use crate::model::{Query, QueryResult};
    use crate::output::mock::MockWriter;
    use crate::output::{OutputWriter, WriterSink};

    struct FixedClient {
        results: Mutex<Vec<QueryResult>>,
        fail: bool,
    }

    #[async_trait]
    impl MBeanClient for FixedClient {
        async fn read_attributes(
            &self,
            _server: &Server,
            _query: &Query,
        ) -> Result<Vec<QueryResult>> {
            if self.fail {
                return Err(anyhow!("connection refused"));
            }
            Ok(self.results.lock().unwrap().clone())
        }
    }

    fn sample() -> QueryResult {
        QueryResult {
            attribute: "ThreadCount".to_string(),
            key: None,
            value: 3.0,
            timestamp_ms: 1_000,
        }
    }

    fn server_with_mock_writer() -> (Arc<Server>, Arc<OutputWriter>) {
        let writer = Arc::new(OutputWriter::new(WriterSink::Mock(MockWriter::default())));
        let query = Arc::new(Query {
            object_name: "java.lang:type=Threading".to_string(),
            attributes: vec!["ThreadCount".to_string()],
            result_alias: None,
            keys: vec![],
            output_writers: vec![writer.clone()],
        });
        let server = Arc::new(Server {
            host: "h".to_string(),
            port: 1,
            alias: None,
            username: None,
            password: None,
            cron: None,
            run_period_seconds: None,
            queries: vec![query],
            output_writers: vec![],
        });
        (server, writer)
    }

    fn pools() -> (Arc<BoundedExecutor>, Arc<BoundedExecutor>) {
        (
            Arc::new(BoundedExecutor::new(PoolRole::Query, "h:1", 4)),
            Arc::new(BoundedExecutor::new(PoolRole::Result, "h:1", 4)),
        )
    }

    fn writes_of(writer: &Arc<OutputWriter>) -> usize {
        match writer.sink_for_tests() {
            WriterSink::Mock(mock) => mock.writes.lock().unwrap().len(),
            _ => 0,
        }
    }

    #[tokio::test]
    async fn tick_delivers_results_to_writers() {
        let (server, writer) = server_with_mock_writer();
        let (query_pool, result_pool) = pools();
        let client = Arc::new(FixedClient {
            results: Mutex::new(vec![sample()]),
            fail: false,
        });

        let job = ServerJob::new(server, client, query_pool.clone(), result_pool.clone());
        job.run();

        query_pool.shutdown(Duration::from_secs(1)).await;
        result_pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(writes_of(&writer), 1);
    }

    #[tokio::test]
    async fn failed_query_reaches_no_writer() {
        let (server, writer) = server_with_mock_writer();
        let (query_pool, result_pool) = pools();
        let client = Arc::new(FixedClient {
            results: Mutex::new(vec![]),
            fail: true,
        });

        let job = ServerJob::new(server, client, query_pool.clone(), result_pool.clone());
        job.run();

        query_pool.shutdown(Duration::from_secs(1)).await;
        result_pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(writes_of(&writer), 0);
    }

    #[tokio::test]
    async fn empty_result_batches_are_not_dispatched() {
        let (server, writer) = server_with_mock_writer();
        let (query_pool, result_pool) = pools();
        let client = Arc::new(FixedClient {
            results: Mutex::new(vec![]),
            fail: false,
        });

        let job = ServerJob::new(server, client, query_pool.clone(), result_pool.clone());
        job.run();

        query_pool.shutdown(Duration::from_secs(1)).await;
        result_pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(writes_of(&writer), 0);
    }

    #[tokio::test]
    async fn full_query_pool_drops_the_tick() {
        let (server, writer) = server_with_mock_writer();
        let result_pool = Arc::new(BoundedExecutor::new(PoolRole::Result, "h:1", 4));
        let query_pool = Arc::new(BoundedExecutor::new(PoolRole::Query, "h:1", 1));

        // Occupy the worker and fill the one queue slot.
        let gate = Arc::new(tokio::sync::Notify::new());
        let started = Arc::new(tokio::sync::Notify::new());
        {
            let gate = gate.clone();
            let started = started.clone();
            query_pool
                .try_execute(async move {
                    started.notify_one();
                    gate.notified().await;
                })
                .unwrap();
        }
        started.notified().await;
        query_pool.try_execute(async {}).unwrap();

        let client = Arc::new(FixedClient {
            results: Mutex::new(vec![sample()]),
            fail: false,
        });
        let job = ServerJob::new(server, client, query_pool.clone(), result_pool.clone());
        job.run();

        gate.notify_one();
        query_pool.shutdown(Duration::from_secs(1)).await;
        result_pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(writes_of(&writer), 0);
    }
}
