#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dagu::config::model::{
    Condition, ContinueOn, DagFile, HandlerMap, OneOrMany, RepeatPolicy, RetryPolicy, StepDef,
};
use dagu::dag::Dag;
use dagu::engine::{RunContext, RunReporter, RunStatus, Runtime, RuntimeEvent};
use dagu::exec::NodeStatus;

fn step(name: &str, command: &str, depends: &[&str]) -> StepDef {
    StepDef {
        name: name.to_string(),
        command: Some(OneOrMany::One(command.to_string())),
        depends: depends.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

fn build_runtime(file: DagFile, workdir: &Path) -> (Runtime, Arc<Dag>) {
    let dag = Arc::new(Dag::from_file(file, &workdir.join("test.yaml"), None));
    let ctx = RunContext {
        dag_name: dag.name.clone(),
        request_id: "req0000abcd".to_string(),
        log_dir: dag.log_dir.clone(),
        params: None,
        started_at: Utc::now(),
    };
    let runtime = Runtime::new(dag.clone(), ctx);
    (runtime, dag)
}

fn dag_file(steps: Vec<StepDef>, workdir: &Path) -> DagFile {
    DagFile {
        name: Some("scenario".to_string()),
        log_dir: Some(workdir.join("logs").to_string_lossy().into_owned()),
        steps,
        ..Default::default()
    }
}

fn node<'a>(
    snapshot: &'a dagu::engine::RunSnapshot,
    name: &str,
) -> &'a dagu::engine::NodeSnapshot {
    snapshot
        .nodes
        .iter()
        .find(|n| n.name == name)
        .unwrap_or_else(|| panic!("node '{name}' missing from snapshot"))
}

async fn wait_until_running(reporter: &Arc<RunReporter>, name: &str) {
    for _ in 0..200 {
        let snapshot = reporter.snapshot();
        if node(&snapshot, name).status == NodeStatus::Running {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("step '{name}' never reached Running");
}

#[tokio::test]
async fn captured_output_is_visible_to_dependent() {
    let workdir = tempfile::tempdir().unwrap();

    let mut producer = step("a", "echo hi", &[]);
    producer.output = Some("RESULT".to_string());
    let consumer = step("b", "echo ${RESULT}", &["a"]);

    let (runtime, _dag) = build_runtime(
        dag_file(vec![producer, consumer], workdir.path()),
        workdir.path(),
    );
    let reporter = runtime.reporter();

    let status = runtime.run().await.unwrap();
    assert_eq!(status, RunStatus::Success);

    let snapshot = reporter.snapshot();
    assert_eq!(node(&snapshot, "a").status, NodeStatus::Success);
    assert_eq!(node(&snapshot, "b").status, NodeStatus::Success);

    let log_path = node(&snapshot, "b").log_path.clone().unwrap();
    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(log.contains("hi"), "dependent log should contain captured value: {log:?}");
}

#[tokio::test]
async fn argv_command_preserves_whitespace_in_arguments() {
    let workdir = tempfile::tempdir().unwrap();

    // The list form is never split, so an argument may contain spaces.
    let listed = StepDef {
        name: "l".to_string(),
        command: Some(OneOrMany::Many(vec![
            "echo".to_string(),
            "a b".to_string(),
        ])),
        ..Default::default()
    };

    let (runtime, _dag) = build_runtime(dag_file(vec![listed], workdir.path()), workdir.path());
    let reporter = runtime.reporter();

    let status = runtime.run().await.unwrap();
    assert_eq!(status, RunStatus::Success);

    let snapshot = reporter.snapshot();
    let log_path = node(&snapshot, "l").log_path.clone().unwrap();
    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(log.contains("a b"), "argv argument must stay one word: {log:?}");
}

#[tokio::test]
async fn argv_elements_get_backtick_substitution() {
    let workdir = tempfile::tempdir().unwrap();

    let listed = StepDef {
        name: "l".to_string(),
        command: Some(OneOrMany::Many(vec![
            "echo".to_string(),
            "value=`echo 01`".to_string(),
        ])),
        ..Default::default()
    };

    let (runtime, _dag) = build_runtime(dag_file(vec![listed], workdir.path()), workdir.path());
    let reporter = runtime.reporter();

    let status = runtime.run().await.unwrap();
    assert_eq!(status, RunStatus::Success);

    let snapshot = reporter.snapshot();
    let log_path = node(&snapshot, "l").log_path.clone().unwrap();
    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(log.contains("value=01"), "argv element should be interpolated: {log:?}");
}

#[tokio::test]
async fn failed_step_keeps_captured_output_unpublished() {
    let workdir = tempfile::tempdir().unwrap();

    // The producer writes stdout but fails; its capture variable must not
    // reach the dependent even though the dependent continues on failure.
    let mut producer = step("a", "sh -c \"echo partial; exit 1\"", &[]);
    producer.output = Some("LEAK".to_string());
    let mut consumer = step("b", "echo got=${LEAK}", &["a"]);
    consumer.continue_on = ContinueOn {
        failure: true,
        skipped: false,
    };

    let (runtime, _dag) = build_runtime(
        dag_file(vec![producer, consumer], workdir.path()),
        workdir.path(),
    );
    let reporter = runtime.reporter();

    let status = runtime.run().await.unwrap();
    assert_eq!(status, RunStatus::Error);

    let snapshot = reporter.snapshot();
    assert_eq!(node(&snapshot, "a").status, NodeStatus::Error);
    assert_eq!(node(&snapshot, "b").status, NodeStatus::Success);

    let log_path = node(&snapshot, "b").log_path.clone().unwrap();
    let log = std::fs::read_to_string(log_path).unwrap();
    assert_eq!(
        log.trim(),
        "got=",
        "failed producer's stdout must not be published"
    );
}

#[tokio::test]
async fn met_precondition_lets_step_run() {
    let workdir = tempfile::tempdir().unwrap();

    let mut gated = step("m", "echo ran", &[]);
    gated.preconditions = vec![Condition {
        condition: "echo 01".to_string(),
        expected: "01".to_string(),
    }];

    let (runtime, _dag) = build_runtime(dag_file(vec![gated], workdir.path()), workdir.path());
    let reporter = runtime.reporter();

    let status = runtime.run().await.unwrap();
    assert_eq!(status, RunStatus::Success);
    assert_eq!(node(&reporter.snapshot(), "m").status, NodeStatus::Success);
}

#[tokio::test]
async fn unmet_precondition_skips_step_and_dependents() {
    let workdir = tempfile::tempdir().unwrap();

    let mut gated = step("m", "echo ran", &[]);
    gated.preconditions = vec![Condition {
        condition: "echo 01".to_string(),
        expected: "02".to_string(),
    }];
    let dependent = step("d", "echo after", &["m"]);
    let mut tolerant = step("t", "echo tolerant", &["m"]);
    tolerant.continue_on = ContinueOn {
        failure: false,
        skipped: true,
    };

    let (runtime, _dag) = build_runtime(
        dag_file(vec![gated, dependent, tolerant], workdir.path()),
        workdir.path(),
    );
    let reporter = runtime.reporter();

    let status = runtime.run().await.unwrap();
    let snapshot = reporter.snapshot();

    assert_eq!(node(&snapshot, "m").status, NodeStatus::Skipped);
    assert!(node(&snapshot, "m").last_error.is_none());
    assert_eq!(node(&snapshot, "d").status, NodeStatus::Skipped);
    assert_eq!(node(&snapshot, "t").status, NodeStatus::Success);
    assert_eq!(status, RunStatus::Success);
}

#[tokio::test]
async fn retry_limit_bounds_spawn_count() {
    let workdir = tempfile::tempdir().unwrap();
    let counter = workdir.path().join("count.txt");

    let mut failing = step(
        "f",
        &format!("sh -c \"echo x >> {}; exit 1\"", counter.display()),
        &[],
    );
    failing.retry_policy = RetryPolicy {
        limit: 2,
        interval_sec: 0,
    };

    let (runtime, _dag) = build_runtime(dag_file(vec![failing], workdir.path()), workdir.path());
    let reporter = runtime.reporter();

    let status = runtime.run().await.unwrap();
    assert_eq!(status, RunStatus::Error);

    let snapshot = reporter.snapshot();
    assert_eq!(node(&snapshot, "f").status, NodeStatus::Error);
    assert_eq!(node(&snapshot, "f").retry_count, 2);

    let attempts = std::fs::read_to_string(&counter).unwrap().lines().count();
    assert_eq!(attempts, 3, "limit=2 means exactly three spawns");
}

#[tokio::test]
async fn failure_and_exit_handlers_fire_in_order() {
    let workdir = tempfile::tempdir().unwrap();

    let file = DagFile {
        handler_on: HandlerMap {
            failure: Some(step("notify-failure", "echo failure", &[])),
            exit: Some(step("cleanup", "echo exit", &[])),
            ..Default::default()
        },
        ..dag_file(vec![step("f", "sh -c \"exit 1\"", &[])], workdir.path())
    };

    let (runtime, _dag) = build_runtime(file, workdir.path());
    let reporter = runtime.reporter();

    let status = runtime.run().await.unwrap();
    assert_eq!(status, RunStatus::Error);

    let snapshot = reporter.snapshot();
    let handler_names: Vec<&str> = snapshot.handlers.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(handler_names, vec!["notify-failure", "cleanup"]);
    assert!(snapshot
        .handlers
        .iter()
        .all(|n| n.status == NodeStatus::Success));
}

#[tokio::test]
async fn cancel_terminates_running_step_and_skips_descendants() {
    let workdir = tempfile::tempdir().unwrap();

    let file = dag_file(
        vec![
            step("a", "echo first", &[]),
            step("b", "sleep 30", &["a"]),
            step("c", "echo last", &["b"]),
        ],
        workdir.path(),
    );

    let (runtime, _dag) = build_runtime(file, workdir.path());
    let reporter = runtime.reporter();
    let events_tx = runtime.events_sender();

    let run_task = tokio::spawn(runtime.run());

    wait_until_running(&reporter, "b").await;
    events_tx.send(RuntimeEvent::CancelRequested).await.unwrap();

    let status = run_task.await.unwrap().unwrap();
    assert_eq!(status, RunStatus::Canceled);

    let snapshot = reporter.snapshot();
    assert_eq!(node(&snapshot, "a").status, NodeStatus::Success);
    assert_eq!(node(&snapshot, "b").status, NodeStatus::Canceled);
    assert_eq!(node(&snapshot, "c").status, NodeStatus::Skipped);
}

#[tokio::test]
async fn repeat_policy_reruns_until_cancel() {
    let workdir = tempfile::tempdir().unwrap();

    let mut repeating = step("r", "echo tick", &[]);
    repeating.repeat_policy = RepeatPolicy {
        repeat: true,
        interval_sec: 0,
    };

    let (runtime, _dag) = build_runtime(dag_file(vec![repeating], workdir.path()), workdir.path());
    let reporter = runtime.reporter();
    let events_tx = runtime.events_sender();

    let run_task = tokio::spawn(runtime.run());

    tokio::time::sleep(Duration::from_millis(500)).await;
    events_tx.send(RuntimeEvent::CancelRequested).await.unwrap();

    let status = run_task.await.unwrap().unwrap();
    assert_eq!(status, RunStatus::Canceled);

    let snapshot = reporter.snapshot();
    assert_eq!(node(&snapshot, "r").status, NodeStatus::Canceled);
    assert!(
        node(&snapshot, "r").done_count >= 2,
        "expected at least two completed repeat cycles, got {}",
        node(&snapshot, "r").done_count
    );
}

#[tokio::test]
async fn serial_cap_orders_independent_steps_by_declaration() {
    let workdir = tempfile::tempdir().unwrap();

    let file = dag_file(
        vec![step("a", "sleep 0.2", &[]), step("b", "sleep 0.2", &[])],
        workdir.path(),
    );

    let (runtime, _dag) = build_runtime(file, workdir.path());
    let reporter = runtime.reporter();

    let status = runtime.run().await.unwrap();
    assert_eq!(status, RunStatus::Success);

    let snapshot = reporter.snapshot();
    let a = node(&snapshot, "a");
    let b = node(&snapshot, "b");
    assert!(
        b.started_at.unwrap() >= a.finished_at.unwrap(),
        "default max_active_runs=1 must serialize independent steps"
    );
}

#[tokio::test]
async fn dependency_edges_order_timestamps() {
    let workdir = tempfile::tempdir().unwrap();

    let file = dag_file(
        vec![step("u", "sleep 0.1", &[]), step("v", "echo v", &["u"])],
        workdir.path(),
    );

    let (runtime, _dag) = build_runtime(file, workdir.path());
    let reporter = runtime.reporter();

    runtime.run().await.unwrap();
    let snapshot = reporter.snapshot();

    let u = node(&snapshot, "u");
    let v = node(&snapshot, "v");
    assert!(v.started_at.unwrap() >= u.finished_at.unwrap());
}

#[tokio::test]
async fn script_body_runs_and_temp_file_is_removed() {
    let workdir = tempfile::tempdir().unwrap();

    let mut scripted = StepDef {
        name: "s".to_string(),
        script: Some("echo from-script\n".to_string()),
        ..Default::default()
    };
    scripted.dir = Some(workdir.path().to_string_lossy().into_owned());

    let (runtime, _dag) = build_runtime(dag_file(vec![scripted], workdir.path()), workdir.path());
    let reporter = runtime.reporter();

    let status = runtime.run().await.unwrap();
    assert_eq!(status, RunStatus::Success);

    let snapshot = reporter.snapshot();
    let log_path = node(&snapshot, "s").log_path.clone().unwrap();
    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(log.contains("from-script"));

    let leftovers: Vec<_> = std::fs::read_dir(workdir.path())
        .unwrap()
        .flatten()
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("dagu_script-")
        })
        .collect();
    assert!(leftovers.is_empty(), "script temp files must be removed");
}

#[tokio::test]
async fn stdout_redirect_tees_into_file_and_log() {
    let workdir = tempfile::tempdir().unwrap();

    let mut redirected = step("r", "echo teed", &[]);
    redirected.stdout = Some("out.txt".to_string());
    redirected.dir = Some(workdir.path().to_string_lossy().into_owned());

    let (runtime, _dag) = build_runtime(dag_file(vec![redirected], workdir.path()), workdir.path());
    let reporter = runtime.reporter();

    let status = runtime.run().await.unwrap();
    assert_eq!(status, RunStatus::Success);

    let redirect = std::fs::read_to_string(workdir.path().join("out.txt")).unwrap();
    assert!(redirect.contains("teed"));

    let snapshot = reporter.snapshot();
    let log_path = node(&snapshot, "r").log_path.clone().unwrap();
    let log = std::fs::read_to_string(log_path).unwrap();
    assert!(log.contains("teed"));
}

#[tokio::test]
async fn run_level_precondition_short_circuits_to_skipped() {
    let workdir = tempfile::tempdir().unwrap();

    let file = DagFile {
        preconditions: vec![Condition {
            condition: "echo no".to_string(),
            expected: "yes".to_string(),
        }],
        ..dag_file(vec![step("a", "echo never", &[])], workdir.path())
    };

    let (runtime, _dag) = build_runtime(file, workdir.path());
    let reporter = runtime.reporter();

    let status = runtime.run().await.unwrap();
    assert_eq!(status, RunStatus::Skipped);

    // Nothing was admitted; the step never left its initial state.
    let snapshot = reporter.snapshot();
    assert_eq!(node(&snapshot, "a").status, NodeStatus::None);
}

#[tokio::test]
async fn missing_binary_fails_step_and_propagates() {
    let workdir = tempfile::tempdir().unwrap();

    let file = dag_file(
        vec![
            step("a", "definitely-not-a-real-binary-xyz", &[]),
            step("b", "echo next", &["a"]),
        ],
        workdir.path(),
    );

    let (runtime, _dag) = build_runtime(file, workdir.path());
    let reporter = runtime.reporter();

    let status = runtime.run().await.unwrap();
    assert_eq!(status, RunStatus::Error);

    let snapshot = reporter.snapshot();
    assert_eq!(node(&snapshot, "a").status, NodeStatus::Error);
    assert!(node(&snapshot, "a").last_error.is_some());
    assert_eq!(node(&snapshot, "b").status, NodeStatus::Skipped);
}
