//! Graph walks driven directly through the walker.

use std::sync::{Arc, Mutex};

use grog_lib::graph::{CacheResult, Graph, Walker};
use tokio_util::sync::CancellationToken;

use super::common::{label, nodes, target};

fn layered_graph() -> Arc<Graph> {
  Arc::new(
    Graph::from_nodes(nodes([
      target("//base:a", "", &[]),
      target("//base:b", "", &[]),
      target("//mid:c", "", &["//base:a", "//base:b"]),
      target("//top:d", "", &["//mid:c"]),
      target("//top:e", "", &["//base:b"]),
    ]))
    .unwrap(),
  )
}

#[tokio::test]
async fn dependencies_complete_before_dependents_start() {
  let graph = layered_graph();
  let finished = Arc::new(Mutex::new(Vec::new()));

  let log = finished.clone();
  let check_graph = graph.clone();
  let outcome = Walker::new(graph.clone(), false)
    .walk(CancellationToken::new(), move |_, node, _| {
      let log = log.clone();
      let graph = check_graph.clone();
      async move {
        let done = log.lock().unwrap().clone();
        for dep in graph.get_dependencies(node.label()) {
          if !done.contains(&dep) {
            return Err(format!("{} started before {dep}", node.label()));
          }
        }
        log.lock().unwrap().push(node.label().clone());
        Ok::<_, String>(CacheResult::Miss)
      }
    })
    .await
    .unwrap();

  assert!(outcome.is_success());
  assert_eq!(outcome.completions.len(), 5);
  assert_eq!(finished.lock().unwrap().len(), 5);
}

#[tokio::test]
async fn failure_cancels_only_descendants() {
  let outcome = Walker::new(layered_graph(), false)
    .walk(CancellationToken::new(), |_, node, _| async move {
      if node.label() == &label("//base:a") {
        Err("broken".to_string())
      } else {
        Ok(CacheResult::Miss)
      }
    })
    .await
    .unwrap();

  assert!(!outcome.is_success());
  assert!(outcome.cancelled.contains(&label("//mid:c")));
  assert!(outcome.cancelled.contains(&label("//top:d")));
  assert!(outcome.completions[&label("//top:e")].is_success);
  assert_eq!(
    outcome.completions[&label("//base:a")].error.as_deref().map(String::as_str),
    Some("broken")
  );
}

#[tokio::test]
async fn cache_hits_propagate_to_dependents() {
  let seen = Arc::new(Mutex::new(Vec::new()));
  let log = seen.clone();

  Walker::new(layered_graph(), false)
    .walk(CancellationToken::new(), move |_, node, deps_cached| {
      let log = log.clone();
      async move {
        log.lock().unwrap().push((node.label().clone(), deps_cached));
        // Everything but //base:b is served from the cache.
        if node.label() == &label("//base:b") {
          Ok::<_, String>(CacheResult::Miss)
        } else {
          Ok(CacheResult::Hit)
        }
      }
    })
    .await
    .unwrap();

  let seen = seen.lock().unwrap();
  let deps_cached = |name: &str| seen.iter().find(|(l, _)| l == &label(name)).map(|(_, cached)| *cached);
  assert_eq!(deps_cached("//base:a"), Some(true));
  assert_eq!(deps_cached("//mid:c"), Some(false));
  assert_eq!(deps_cached("//top:d"), Some(true));
  assert_eq!(deps_cached("//top:e"), Some(false));
}
