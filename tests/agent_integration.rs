//! Integration tests for the beanpoll agent.
//!
//! End-to-end scenarios drive the agent through its public API with a stub
//! management client and file writers, observing samples on disk. The
//! command-line surface is exercised through the compiled binary.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::time;

use beanpoll::agent::{Agent, State};
use beanpoll::client::MBeanClient;
use beanpoll::config::AgentConfig;
use beanpoll::error::AgentError;
use beanpoll::model::{Query, QueryResult, Server};

struct StubClient;

#[async_trait]
impl MBeanClient for StubClient {
    async fn read_attributes(&self, _server: &Server, _query: &Query) -> Result<Vec<QueryResult>> {
        Ok(vec![QueryResult {
            attribute: "ThreadCount".to_string(),
            key: None,
            value: 5.0,
            timestamp_ms: 1_700_000_000_000,
        }])
    }
}

fn server_decl(host: &str, out_path: &Path, schedule: &str) -> String {
    format!(
        r#"{{"host": "{host}", "port": 9999, {schedule}
            "queries": [{{"object_name": "java.lang:type=Threading",
                          "attributes": ["ThreadCount"],
                          "output_writers": [{{"type": "file", "path": "{}"}}]}}]}}"#,
        out_path.display()
    )
}

fn write_config(config_dir: &Path, decls: &[String]) {
    fs::write(
        config_dir.join("servers.json"),
        format!(r#"{{"servers": [{}]}}"#, decls.join(",")),
    )
    .unwrap();
}

fn fast_agent(config_dir: &Path) -> Arc<Agent> {
    let mut config = AgentConfig::new(config_dir.to_path_buf());
    config.run_period_seconds = 1;
    config.scheduler_grace = Duration::from_millis(200);
    Agent::new(config, Arc::new(StubClient))
}

fn sample_count(path: &Path) -> usize {
    fs::read_to_string(path)
        .map(|c| c.lines().count())
        .unwrap_or(0)
}

/// Cold start with two interval-triggered servers: both jobs scheduled, both
/// writers observe samples, stop closes every writer.
#[tokio::test]
async fn cold_start_polls_two_servers() {
    let config_dir = TempDir::new().unwrap();
    let out_dir = TempDir::new().unwrap();
    let out1 = out_dir.path().join("h1.out");
    let out2 = out_dir.path().join("h2.out");
    write_config(
        config_dir.path(),
        &[
            server_decl("h1", &out1, r#""run_period_seconds": 1,"#),
            server_decl("h2", &out2, r#""run_period_seconds": 1,"#),
        ],
    );

    let agent = fast_agent(config_dir.path());
    agent.start().await.unwrap();
    assert_eq!(agent.scheduled_job_count().await, 2);

    // Spread delays the first tick by at most one period.
    time::sleep(Duration::from_millis(3_000)).await;
    assert!(sample_count(&out1) >= 1, "h1 writer saw no samples");
    assert!(sample_count(&out2) >= 1, "h2 writer saw no samples");

    let writers: Vec<_> = agent
        .servers()
        .await
        .iter()
        .flat_map(|s| s.all_writers())
        .collect();
    agent.stop().await.unwrap();
    assert_eq!(agent.state().await, State::Stopped);
    for writer in &writers {
        assert_eq!(writer.close_count(), 1);
    }
}

/// A seconds-resolution cron trigger drives repeated writes.
#[tokio::test]
async fn cron_trigger_fires_every_second() {
    let config_dir = TempDir::new().unwrap();
    let out_dir = TempDir::new().unwrap();
    let out = out_dir.path().join("cron.out");
    write_config(
        config_dir.path(),
        &[server_decl("h1", &out, r#""cron": "* * * * * *","#)],
    );

    let agent = fast_agent(config_dir.path());
    agent.start().await.unwrap();

    time::sleep(Duration::from_millis(4_500)).await;
    assert!(
        sample_count(&out) >= 3,
        "expected at least 3 cron-driven writes, saw {}",
        sample_count(&out)
    );
    agent.stop().await.unwrap();
}

/// An unparsable cron expression falls back to the interval trigger instead
/// of failing the reload.
#[tokio::test]
async fn bad_cron_falls_back_to_interval() {
    let config_dir = TempDir::new().unwrap();
    let out_dir = TempDir::new().unwrap();
    let out = out_dir.path().join("fallback.out");
    write_config(
        config_dir.path(),
        &[server_decl(
            "h1",
            &out,
            r#""cron": "not-a-cron", "run_period_seconds": 1,"#,
        )],
    );

    let agent = fast_agent(config_dir.path());
    agent.start().await.unwrap();
    assert_eq!(agent.scheduled_job_count().await, 1);

    time::sleep(Duration::from_millis(3_500)).await;
    assert!(sample_count(&out) >= 2, "interval fallback produced no cadence");
    agent.stop().await.unwrap();
}

/// Rewriting the config file grows the job set after the watch-and-debounce
/// pipeline fires; the retired server's writer is closed and the new
/// generation's writers are started.
#[tokio::test]
async fn reload_on_modification_reschedules() {
    let config_dir = TempDir::new().unwrap();
    let out_dir = TempDir::new().unwrap();
    let out1 = out_dir.path().join("h1.out");
    let out2 = out_dir.path().join("h2.out");
    write_config(
        config_dir.path(),
        &[server_decl("h1", &out1, r#""run_period_seconds": 1,"#)],
    );

    let agent = fast_agent(config_dir.path());
    agent.start().await.unwrap();
    assert_eq!(agent.scheduled_job_count().await, 1);
    let old_writers: Vec<_> = agent
        .servers()
        .await
        .iter()
        .flat_map(|s| s.all_writers())
        .collect();

    write_config(
        config_dir.path(),
        &[
            server_decl("h1", &out1, r#""run_period_seconds": 1,"#),
            server_decl("h2", &out2, r#""run_period_seconds": 1,"#),
        ],
    );

    // Event settle (1 s) + reload debounce (1 s) + slack.
    time::sleep(Duration::from_millis(4_000)).await;
    assert_eq!(agent.reload_count(), 1);
    assert_eq!(agent.scheduled_job_count().await, 2);
    for writer in &old_writers {
        assert_eq!(writer.close_count(), 1);
    }
    assert!(agent
        .servers()
        .await
        .iter()
        .flat_map(|s| s.all_writers())
        .all(|w| w.is_started()));

    agent.stop().await.unwrap();
}

/// Deleting the only config file reloads down to zero jobs and closes the
/// original writers.
#[tokio::test]
async fn deleting_config_descends_to_zero_jobs() {
    let config_dir = TempDir::new().unwrap();
    let out_dir = TempDir::new().unwrap();
    let out1 = out_dir.path().join("h1.out");
    let out2 = out_dir.path().join("h2.out");
    write_config(
        config_dir.path(),
        &[
            server_decl("h1", &out1, r#""run_period_seconds": 1,"#),
            server_decl("h2", &out2, r#""run_period_seconds": 1,"#),
        ],
    );

    let agent = fast_agent(config_dir.path());
    agent.start().await.unwrap();
    assert_eq!(agent.scheduled_job_count().await, 2);
    let old_writers: Vec<_> = agent
        .servers()
        .await
        .iter()
        .flat_map(|s| s.all_writers())
        .collect();

    fs::remove_file(config_dir.path().join("servers.json")).unwrap();
    time::sleep(Duration::from_millis(4_000)).await;

    assert_eq!(agent.scheduled_job_count().await, 0);
    assert!(agent.servers().await.is_empty());
    for writer in &old_writers {
        assert_eq!(writer.close_count(), 1);
    }

    agent.stop().await.unwrap();
}

/// One valid and one malformed file: with `continue_on_error` only the valid
/// one is scheduled; without it the startup fails loudly.
#[tokio::test]
async fn malformed_file_behavior_follows_continue_on_error() {
    let config_dir = TempDir::new().unwrap();
    let out_dir = TempDir::new().unwrap();
    let out = out_dir.path().join("h1.out");
    write_config(
        config_dir.path(),
        &[server_decl("h1", &out, r#""run_period_seconds": 1,"#)],
    );
    fs::write(config_dir.path().join("broken.json"), "{ not json").unwrap();

    let mut config = AgentConfig::new(config_dir.path().to_path_buf());
    config.run_period_seconds = 1;
    config.scheduler_grace = Duration::from_millis(200);
    config.continue_on_error = true;
    let agent = Agent::new(config, Arc::new(StubClient));
    agent.start().await.unwrap();
    assert_eq!(agent.scheduled_job_count().await, 1);
    agent.stop().await.unwrap();

    let mut strict = AgentConfig::new(config_dir.path().to_path_buf());
    strict.run_period_seconds = 1;
    strict.scheduler_grace = Duration::from_millis(200);
    let agent = Agent::new(strict, Arc::new(StubClient));
    assert!(matches!(
        agent.start().await,
        Err(AgentError::ConfigParse { .. })
    ));
    assert_eq!(agent.state().await, State::Stopped);
}

/// `--help` must exit 0 without starting the agent.
#[tokio::test]
async fn cli_help_exits_cleanly() {
    let output = tokio::process::Command::new(env!("CARGO_BIN_EXE_beanpoll"))
        .arg("--help")
        .output()
        .await
        .expect("failed to run beanpoll --help");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--config"));
    assert!(stdout.contains("--run-period"));
}

/// A missing configuration path fails startup with a nonzero exit.
#[tokio::test]
async fn cli_missing_config_path_fails() {
    let output = tokio::process::Command::new(env!("CARGO_BIN_EXE_beanpoll"))
        .arg("--config")
        .arg("/nonexistent/beanpoll-config")
        .output()
        .await
        .expect("failed to run beanpoll");
    assert!(!output.status.success());
}
