//! End-to-end builds through the executor.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use grog_lib::config::LoadOutputsMode;
use grog_lib::execute::ExecuteError;
use grog_lib::model::{Alias, BuildNode, PlatformSelector};
use tokio_util::sync::CancellationToken;

use super::common::{OverlapBackend, TestWorkspace, label, nodes, target, target_with_io};

fn generator() -> Vec<BuildNode> {
  nodes([target_with_io(
    "//app:gen",
    "cat src.txt > out.txt",
    &[],
    &["src.txt"],
    &["out.txt"],
  )])
}

#[tokio::test]
async fn second_run_is_a_cache_hit_and_restores_outputs() {
  let ws = TestWorkspace::new();
  ws.write("app/src.txt", "hello");

  let first = ws.build(generator()).await.unwrap();
  assert!(first.is_success(), "{first}");
  assert_eq!(first.executed, 1);
  assert_eq!(ws.read("app/out.txt"), "hello");

  ws.remove("app/out.txt");
  let second = ws.build(generator()).await.unwrap();
  assert_eq!(second.cache_hits, 1);
  assert_eq!(second.executed, 0);
  assert_eq!(ws.read("app/out.txt"), "hello");
}

#[tokio::test]
async fn changed_input_invalidates_the_cache() {
  let ws = TestWorkspace::new();
  ws.write("app/src.txt", "one");
  ws.build(generator()).await.unwrap();

  ws.write("app/src.txt", "two");
  let report = ws.build(generator()).await.unwrap();
  assert_eq!(report.executed, 1);
  assert_eq!(report.cache_hits, 0);
  assert_eq!(ws.read("app/out.txt"), "two");
}

#[tokio::test]
async fn failing_command_reports_exit_code_and_output() {
  let ws = TestWorkspace::new();
  ws.mkdir("app");

  let report = ws
    .build(nodes([
      target("//app:broken", "echo boom; exit 3", &[]),
      target("//app:after", "touch after.txt", &["//app:broken"]),
    ]))
    .await
    .unwrap();

  assert!(!report.is_success());
  assert_eq!(report.failures.len(), 1);
  let failure = &report.failures[0];
  assert_eq!(failure.label, label("//app:broken"));
  assert_eq!(failure.exit_code, Some(3));
  assert!(failure.output.as_deref().unwrap_or_default().contains("boom"));
  assert!(report.cancelled.contains(&label("//app:after")));
  assert!(!ws.exists("app/after.txt"));
}

fn fail_fast_graph() -> Vec<BuildNode> {
  nodes([
    target("//app:bad", "exit 1", &[]),
    target("//app:slow", "sleep 1", &[]),
    target("//app:later", "touch later.txt", &["//app:slow"]),
  ])
}

#[tokio::test]
async fn fail_fast_cancels_unrelated_targets() {
  let mut ws = TestWorkspace::new();
  ws.config.fail_fast = true;
  ws.mkdir("app");

  let report = ws.build(fail_fast_graph()).await.unwrap();
  assert_eq!(report.failures.len(), 1);
  assert!(report.cancelled.contains(&label("//app:later")));
  assert!(!ws.exists("app/later.txt"));
}

#[tokio::test]
async fn without_fail_fast_unrelated_targets_finish() {
  let ws = TestWorkspace::new();
  ws.mkdir("app");

  let report = ws.build(fail_fast_graph()).await.unwrap();
  assert_eq!(report.failures.len(), 1);
  assert!(report.cancelled.is_empty());
  assert_eq!(report.executed, 2);
  assert!(ws.exists("app/later.txt"));
}

#[tokio::test]
async fn worker_count_bounds_parallel_commands() {
  let mut ws = TestWorkspace::new();
  ws.config.num_workers = 1;
  ws.mkdir("app");

  let start = Instant::now();
  let report = ws
    .build(nodes([
      target("//app:a", "sleep 0.3", &[]),
      target("//app:b", "sleep 0.3", &[]),
      target("//app:c", "sleep 0.3", &[]),
    ]))
    .await
    .unwrap();

  assert_eq!(report.executed, 3);
  assert!(start.elapsed() >= Duration::from_millis(900), "took {:?}", start.elapsed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_count_bounds_cache_checks_too() {
  let mut ws = TestWorkspace::new();
  ws.config.num_workers = 1;
  ws.mkdir("app");

  let backend = Arc::new(OverlapBackend::new(ws.local_backend()));
  let targets = (0..6).map(|i| target(&format!("//app:t{i}"), "true", &[]));
  let report = ws
    .build_with(nodes(targets), backend.clone(), CancellationToken::new())
    .await
    .unwrap();

  assert!(report.is_success(), "{report}");
  assert_eq!(report.executed, 6);
  assert_eq!(backend.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn foreign_platform_target_is_skipped() {
  let ws = TestWorkspace::new();
  ws.mkdir("app");

  let mut only_plan9 = target("//app:native", "touch native.txt", &[]);
  only_plan9.platform = Some(PlatformSelector {
    os: vec!["plan9".to_string()],
    arch: vec![],
  });

  let report = ws
    .build(nodes([only_plan9, target("//app:next", "touch next.txt", &["//app:native"])]))
    .await
    .unwrap();

  assert!(report.is_success(), "{report}");
  assert_eq!(report.skipped, 1);
  assert!(!ws.exists("app/native.txt"));
  assert!(ws.exists("app/next.txt"));
}

fn aliased_graph() -> Vec<BuildNode> {
  let mut graph = nodes([
    target_with_io("//app:lib", "echo lib > lib.txt", &[], &[], &["lib.txt"]),
    target_with_io("//app:bin", "cat lib.txt > bin.txt", &["//:lib"], &[], &["bin.txt"]),
  ]);
  graph.push(BuildNode::Alias(Alias {
    label: label("//:lib"),
    actual: label("//app:lib"),
  }));
  graph
}

#[tokio::test]
async fn alias_passes_cache_state_through() {
  let ws = TestWorkspace::new();
  ws.mkdir("app");

  let first = ws.build(aliased_graph()).await.unwrap();
  assert!(first.is_success(), "{first}");
  assert_eq!(first.successes, 3);
  assert_eq!(ws.read("app/bin.txt"), "lib\n");

  let second = ws.build(aliased_graph()).await.unwrap();
  assert_eq!(second.cache_hits, 3);
}

#[tokio::test]
async fn disabled_cache_runs_every_time() {
  let mut ws = TestWorkspace::new();
  ws.config.enable_cache = false;
  ws.mkdir("app");

  let graph = || nodes([target_with_io("//app:count", "echo x >> count.txt", &[], &[], &["count.txt"])]);
  assert_eq!(ws.build(graph()).await.unwrap().executed, 1);
  assert_eq!(ws.build(graph()).await.unwrap().executed, 1);
  assert_eq!(ws.read("app/count.txt"), "x\nx\n");
}

#[tokio::test]
async fn missing_declared_output_fails_the_target() {
  let mut ws = TestWorkspace::new();
  ws.config.enable_cache = false;
  ws.mkdir("app");

  let report = ws
    .build(nodes([target_with_io("//app:liar", "true", &[], &[], &["missing.txt"])]))
    .await
    .unwrap();

  assert_eq!(report.failures.len(), 1);
  assert!(report.failures[0].message.contains("missing.txt"), "{}", report.failures[0].message);
}

fn minimal_graph() -> Vec<BuildNode> {
  nodes([
    target_with_io("//a:a", "echo a > a.txt", &[], &[], &["a.txt"]),
    target_with_io(
      "//b:b",
      "cat ../a/a.txt input.txt > b.txt",
      &["//a:a"],
      &["input.txt"],
      &["b.txt"],
    ),
  ])
}

#[tokio::test]
async fn minimal_mode_loads_dependency_outputs_only_when_needed() {
  let mut ws = TestWorkspace::new();
  ws.config.load_outputs = LoadOutputsMode::Minimal;
  ws.mkdir("a");
  ws.write("b/input.txt", "one\n");

  assert_eq!(ws.build(minimal_graph()).await.unwrap().executed, 2);
  ws.remove("a/a.txt");
  ws.remove("b/b.txt");

  let cached = ws.build(minimal_graph()).await.unwrap();
  assert_eq!(cached.cache_hits, 2);
  assert!(!ws.exists("a/a.txt"));
  assert!(!ws.exists("b/b.txt"));

  ws.write("b/input.txt", "two\n");
  let rebuilt = ws.build(minimal_graph()).await.unwrap();
  assert!(rebuilt.is_success(), "{rebuilt}");
  assert_eq!(rebuilt.cache_hits, 1);
  assert_eq!(rebuilt.executed, 1);
  assert_eq!(ws.read("a/a.txt"), "a\n");
  assert_eq!(ws.read("b/b.txt"), "a\ntwo\n");
}

#[tokio::test]
async fn target_timeout_is_reported_as_failure() {
  let ws = TestWorkspace::new();
  ws.mkdir("app");

  let mut sleepy = target("//app:sleepy", "sleep 5", &[]);
  sleepy.timeout = Some(Duration::from_millis(200));

  let report = ws.build(nodes([sleepy])).await.unwrap();
  assert_eq!(report.failures.len(), 1);
  assert!(report.failures[0].message.contains("timed out"), "{}", report.failures[0].message);
}

#[tokio::test]
async fn cancelling_the_build_stops_running_commands() {
  let ws = TestWorkspace::new();
  ws.mkdir("app");

  let ctx = CancellationToken::new();
  let canceller = ctx.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(200)).await;
    canceller.cancel();
  });

  let start = Instant::now();
  let result = ws
    .build_with(nodes([target("//app:forever", "sleep 10", &[])]), ws.local_backend(), ctx)
    .await;

  assert!(matches!(result, Err(ExecuteError::Cancelled)));
  assert!(start.elapsed() < Duration::from_secs(5));
}
