mod common;

use common::{FakeWarehouse, StaticCredentials};
use starpipe::clients::Warehouse;
use starpipe::core::{ChannelSink, RunEvent};
use starpipe::pipeline::parse_execution_date;
use starpipe::{BuildError, CancellationToken, PipelineDef, RunOptions, RunResult, StarpipeEngine, TaskState};
use std::path::Path;
use std::sync::Arc;

fn sparkify() -> PipelineDef {
    let mut pipeline = PipelineDef::from_file(Path::new("pipelines/sparkify.yml")).unwrap();
    pipeline.defaults.retry_delay_secs = 0;
    pipeline
}

fn options() -> RunOptions {
    RunOptions::new(parse_execution_date("2024-01-01").unwrap())
}

async fn run(pipeline: PipelineDef, warehouse: Arc<FakeWarehouse>) -> anyhow::Result<RunResult> {
    let engine = StarpipeEngine::new(pipeline);
    let ctx = engine.execution_context(&options(), warehouse, Arc::new(StaticCredentials));
    engine.run(ctx, None, CancellationToken::new()).await
}

#[test]
fn test_sparkify_pipeline_loads() {
    let pipeline = sparkify();
    assert_eq!(pipeline.name(), "sparkify");

    let graph = pipeline.build_graph().unwrap();
    assert_eq!(graph.len(), 11);
    let order = graph.topological_order();
    assert_eq!(order.first(), Some(&"begin_execution"));
    assert_eq!(order.last(), Some(&"end_execution"));
}

#[tokio::test]
async fn test_full_run_succeeds() {
    let warehouse = Arc::new(FakeWarehouse::sparkify());
    let result = run(sparkify(), warehouse.clone()).await.unwrap();

    assert!(result.succeeded(), "{}", result.summary());
    assert_eq!(result.exit_code(), 0);
    assert_eq!(result.count(TaskState::Succeeded), 11);
    assert_eq!(warehouse.rows("staging_events"), 8056);
    assert_eq!(warehouse.rows("songplays"), 6820);
    assert_eq!(warehouse.rows("users"), 104);
}

#[tokio::test]
async fn test_statements_follow_dependencies() {
    let warehouse = Arc::new(FakeWarehouse::sparkify());
    run(sparkify(), warehouse.clone()).await.unwrap();

    let statements = warehouse.statements();
    let first = |needle: &str| statements.iter().position(|s| s.contains(needle)).unwrap();
    let last = |needle: &str| statements.iter().rposition(|s| s.contains(needle)).unwrap();

    assert!(last("CREATE TABLE") < first("COPY staging_events"));
    assert!(last("CREATE TABLE") < first("COPY staging_songs"));
    assert!(last("COPY staging_") < first("DELETE FROM songplays"));
    assert!(last("DELETE FROM songplays") < first("INSERT INTO users"));
    assert!(last("INSERT INTO time") < first("SELECT COUNT(*)"));
}

#[tokio::test]
async fn test_transient_staging_failure_is_retried() {
    let warehouse = Arc::new(FakeWarehouse::sparkify().fail("COPY staging_events", 2, true));
    let result = run(sparkify(), warehouse.clone()).await.unwrap();

    assert!(result.succeeded(), "{}", result.summary());
    let staged = result.task("stage_events").unwrap();
    assert_eq!(staged.state, TaskState::Succeeded);
    assert_eq!(staged.attempts, 3);

    // every attempt cleared the table first, so the retries left no duplicates
    assert_eq!(warehouse.statements_matching("TRUNCATE TABLE staging_events;"), 3);
    assert_eq!(warehouse.rows("staging_events"), 8056);
}

#[tokio::test]
async fn test_fake_copy_appends_without_truncate() {
    let warehouse = FakeWarehouse::new().with_rows("staging_events", 10);
    warehouse.execute("COPY staging_events FROM 's3://raw/a';").await.unwrap();
    warehouse.execute("COPY staging_events FROM 's3://raw/a';").await.unwrap();
    assert_eq!(warehouse.rows("staging_events"), 20);
}

#[tokio::test]
async fn test_partial_copy_retry_leaves_no_duplicates() {
    let clean = Arc::new(FakeWarehouse::sparkify());
    run(sparkify(), clean.clone()).await.unwrap();

    // the first COPY writes its rows and then drops the connection
    let warehouse = Arc::new(FakeWarehouse::sparkify().fail_after_loading("COPY staging_events", 1));
    let result = run(sparkify(), warehouse.clone()).await.unwrap();

    assert!(result.succeeded(), "{}", result.summary());
    assert_eq!(result.task("stage_events").unwrap().attempts, 2);
    assert_eq!(warehouse.statements_matching("COPY staging_events"), 2);
    assert_eq!(warehouse.rows("staging_events"), clean.rows("staging_events"));
    assert_eq!(warehouse.rows("staging_events"), 8056);
}

#[tokio::test]
async fn test_retries_exhausted_fails_run() {
    let warehouse = Arc::new(FakeWarehouse::sparkify().fail("COPY staging_events", 5, true));
    let result = run(sparkify(), warehouse.clone()).await.unwrap();

    assert!(!result.succeeded());
    let staged = result.task("stage_events").unwrap();
    assert_eq!(staged.state, TaskState::Failed);
    assert_eq!(staged.attempts, 3);
    assert_eq!(
        result.task("load_songplays_fact_table").unwrap().skipped_because.as_deref(),
        Some("stage_events")
    );
}

#[tokio::test]
async fn test_fatal_failure_is_not_retried() {
    let warehouse = Arc::new(FakeWarehouse::sparkify().fail("COPY staging_songs", 1, false));
    let result = run(sparkify(), warehouse.clone()).await.unwrap();

    assert!(!result.succeeded());
    assert_eq!(result.exit_code(), 1);

    let songs = result.task("stage_songs").unwrap();
    assert_eq!(songs.state, TaskState::Failed);
    assert_eq!(songs.attempts, 1);
    assert_eq!(result.task("stage_events").unwrap().state, TaskState::Succeeded);

    for id in [
        "load_songplays_fact_table",
        "load_user_dim_table",
        "load_time_dim_table",
        "run_data_quality_checks",
        "end_execution",
    ] {
        let task = result.task(id).unwrap();
        assert_eq!(task.state, TaskState::Skipped, "{}", id);
        assert_eq!(task.attempts, 0, "{}", id);
    }
    assert_eq!(warehouse.statements_matching("DELETE FROM songplays"), 0);
}

#[tokio::test]
async fn test_quality_gate_vetoes_run() {
    let warehouse = Arc::new(FakeWarehouse::sparkify().with_rows("songs", 0));
    let result = run(sparkify(), warehouse.clone()).await.unwrap();

    assert!(!result.succeeded());
    let gate = result.task("run_data_quality_checks").unwrap();
    assert_eq!(gate.state, TaskState::Failed);
    assert_eq!(gate.attempts, 1);
    let error = gate.error.as_deref().unwrap();
    assert!(error.contains("songs"), "{}", error);
    assert!(error.contains("observed 0"), "{}", error);

    let end = result.task("end_execution").unwrap();
    assert_eq!(end.state, TaskState::Skipped);
    assert_eq!(end.skipped_because.as_deref(), Some("run_data_quality_checks"));

    // the loads themselves went through
    assert_eq!(
        result.task("load_song_dim_table").unwrap().state,
        TaskState::Succeeded
    );
}

#[tokio::test]
async fn test_empty_song_staging_starves_dimensions_and_vetoes_run() {
    let warehouse = Arc::new(FakeWarehouse::sparkify().with_rows("staging_songs", 0));
    let result = run(sparkify(), warehouse.clone()).await.unwrap();

    assert!(!result.succeeded());
    assert_eq!(result.exit_code(), 1);

    // every load ran, the empty source only shows up in the numbers
    for id in [
        "stage_songs",
        "load_songplays_fact_table",
        "load_song_dim_table",
        "load_artist_dim_table",
    ] {
        assert_eq!(result.task(id).unwrap().state, TaskState::Succeeded, "{}", id);
    }
    assert_eq!(warehouse.rows("staging_songs"), 0);
    assert_eq!(warehouse.rows("songs"), 0);
    assert_eq!(warehouse.rows("artists"), 0);
    assert_eq!(warehouse.rows("users"), 104);

    let gate = result.task("run_data_quality_checks").unwrap();
    assert_eq!(gate.state, TaskState::Failed);
    assert_eq!(gate.attempts, 1);
    let error = gate.error.as_deref().unwrap();
    assert!(error.contains("songs failed"), "{}", error);
    assert!(error.contains("artists failed"), "{}", error);
    assert!(!error.contains("users failed"), "{}", error);

    assert_eq!(
        result.task("end_execution").unwrap().skipped_because.as_deref(),
        Some("run_data_quality_checks")
    );
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let warehouse = Arc::new(FakeWarehouse::sparkify());
    run(sparkify(), warehouse.clone()).await.unwrap();
    let first: Vec<i64> = ["staging_events", "songplays", "users", "time"]
        .iter()
        .map(|t| warehouse.rows(t))
        .collect();

    let result = run(sparkify(), warehouse.clone()).await.unwrap();
    assert!(result.succeeded());
    let second: Vec<i64> = ["staging_events", "songplays", "users", "time"]
        .iter()
        .map(|t| warehouse.rows(t))
        .collect();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_cycle_prevents_any_execution() {
    let mut pipeline = sparkify();
    pipeline
        .edges
        .push(("begin_execution".to_string(), "end_execution".to_string()));

    let warehouse = Arc::new(FakeWarehouse::sparkify());
    let err = run(pipeline, warehouse.clone()).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::Cycle { .. })
    ));
    assert!(warehouse.statements().is_empty());
}

#[tokio::test]
async fn test_execution_date_outside_window() {
    let engine = StarpipeEngine::new(sparkify());
    let warehouse = Arc::new(FakeWarehouse::sparkify());
    let options = RunOptions::new(parse_execution_date("2025-01-01").unwrap());
    let ctx = engine.execution_context(&options, warehouse.clone(), Arc::new(StaticCredentials));

    let err = engine.run(ctx, None, CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("validity window"));
    assert!(warehouse.statements().is_empty());
}

#[tokio::test]
async fn test_cancelled_run_executes_nothing() {
    let engine = StarpipeEngine::new(sparkify());
    let warehouse = Arc::new(FakeWarehouse::sparkify());
    let ctx = engine.execution_context(&options(), warehouse.clone(), Arc::new(StaticCredentials));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = engine.run(ctx, Some(2), cancel).await.unwrap();

    assert!(result.cancelled);
    assert!(!result.succeeded());
    assert_eq!(result.count(TaskState::Skipped), 11);
    assert!(warehouse.statements().is_empty());
}

#[tokio::test]
async fn test_templated_key_and_events() {
    let yaml = r#"
metadata:
  name: templated
defaults:
  retry_delay_secs: 0
variables:
  prefix: log-data
tasks:
  - id: stage
    operator:
      kind: staging_load
      table: staging_events
      bucket: raw
      key: "{prefix}/{year}/{month}/{ds}-events.json"
"#;
    let engine = StarpipeEngine::new(PipelineDef::parse(yaml).unwrap());
    let warehouse = Arc::new(FakeWarehouse::new());
    let (sink, mut events) = ChannelSink::new();
    let ctx = engine
        .execution_context(&options(), warehouse.clone(), Arc::new(StaticCredentials))
        .with_events(Arc::new(sink));

    let result = engine.run(ctx, None, CancellationToken::new()).await.unwrap();
    assert!(result.succeeded());

    let copy = warehouse
        .statements()
        .into_iter()
        .find(|s| s.starts_with("COPY"))
        .unwrap();
    assert!(copy.contains("'s3://raw/log-data/2024/01/2024-01-01-events.json'"), "{}", copy);
    assert!(copy.contains("ACCESS_KEY_ID 'AKIAINTEGRATION'"));

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(match event {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::TaskStarted { .. } => "task_started",
            RunEvent::TaskLog { .. } => continue,
            RunEvent::TaskSucceeded { .. } => "task_succeeded",
            RunEvent::RunFinished { succeeded, .. } => {
                assert!(succeeded);
                "run_finished"
            }
            _ => "other",
        });
    }
    assert_eq!(
        kinds,
        vec!["run_started", "task_started", "task_succeeded", "run_finished"]
    );
}

#[tokio::test]
async fn test_unknown_variable_fails_task_without_retry() {
    let yaml = r#"
metadata:
  name: broken
tasks:
  - id: stage
    operator:
      kind: staging_load
      table: staging_events
      bucket: raw
      key: "log-data/{missing}"
"#;
    let warehouse = Arc::new(FakeWarehouse::new());
    let result = run(PipelineDef::parse(yaml).unwrap(), warehouse.clone())
        .await
        .unwrap();

    let stage = result.task("stage").unwrap();
    assert_eq!(stage.state, TaskState::Failed);
    assert_eq!(stage.attempts, 1);
    assert!(stage.error.as_deref().unwrap().contains("missing"));
    assert!(warehouse.statements().is_empty());
}
