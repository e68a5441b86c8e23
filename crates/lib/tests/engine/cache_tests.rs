//! Cache backends seen from a full build.

use std::sync::Arc;

use grog_lib::cache::{CacheBackend, FsBackend, RemoteWrapper};
use grog_lib::model::BuildNode;
use tokio_util::sync::CancellationToken;

use super::common::{TestWorkspace, nodes, target_with_io};

fn bundle() -> Vec<BuildNode> {
  nodes([target_with_io(
    "//web:bundle",
    "mkdir -p dist/assets && cp page.html dist/ && echo css > dist/assets/site.css && ln -sf page.html dist/index.html",
    &[],
    &["page.html"],
    &["dir::dist"],
  )])
}

#[cfg(unix)]
#[tokio::test]
async fn directory_outputs_are_restored_with_symlinks() {
  let ws = TestWorkspace::new();
  ws.write("web/page.html", "<html></html>");

  let first = ws.build(bundle()).await.unwrap();
  assert!(first.is_success(), "{first}");

  ws.remove("web/dist");
  let second = ws.build(bundle()).await.unwrap();
  assert_eq!(second.cache_hits, 1);
  assert_eq!(ws.read("web/dist/assets/site.css"), "css\n");
  assert_eq!(ws.read("web/dist/page.html"), "<html></html>");

  let link = ws.path("web/dist/index.html");
  assert!(link.symlink_metadata().unwrap().file_type().is_symlink());
  assert_eq!(std::fs::read_link(link).unwrap(), std::path::PathBuf::from("page.html"));
}

#[tokio::test]
async fn remote_cache_is_shared_between_local_caches() {
  let ws = TestWorkspace::new();
  ws.write("web/page.html", "<html></html>");
  let remote: Arc<dyn CacheBackend> = Arc::new(FsBackend::new(ws.temp.path().join("remote")));

  let first_local: Arc<dyn CacheBackend> = Arc::new(FsBackend::new(ws.temp.path().join("local-1")));
  let first = ws
    .build_with(
      bundle(),
      Arc::new(RemoteWrapper::new(first_local, remote.clone())),
      CancellationToken::new(),
    )
    .await
    .unwrap();
  assert_eq!(first.executed, 1);

  ws.remove("web/dist");
  let second_local: Arc<dyn CacheBackend> = Arc::new(FsBackend::new(ws.temp.path().join("local-2")));
  let second = ws
    .build_with(
      bundle(),
      Arc::new(RemoteWrapper::new(second_local.clone(), remote)),
      CancellationToken::new(),
    )
    .await
    .unwrap();
  assert_eq!(second.cache_hits, 1);
  assert_eq!(ws.read("web/dist/page.html"), "<html></html>");

  // Reads from the remote were copied into the new local cache.
  assert!(ws.temp.path().join("local-2").join("web").exists());
}

#[tokio::test]
async fn emptied_cache_causes_a_rebuild() {
  let ws = TestWorkspace::new();
  ws.write("web/page.html", "<html></html>");
  ws.build(bundle()).await.unwrap();

  std::fs::remove_dir_all(ws.config.workspace_cache_dir()).unwrap();
  let report = ws.build(bundle()).await.unwrap();
  assert_eq!(report.executed, 1);
  assert_eq!(report.cache_hits, 0);
}
