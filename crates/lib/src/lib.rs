//! grog-lib: build execution engine for grog
//!
//! Given a fully resolved graph of targets, this crate:
//! - walks the graph in dependency order with bounded parallelism
//! - computes a change hash per target from its definition, inputs and dependencies
//! - skips targets whose outputs are already cached and restores those outputs
//! - runs the remaining commands and stores their file, directory and docker outputs

pub mod archive;
pub mod cache;
pub mod change_hash;
pub mod config;
pub mod consts;
pub mod execute;
pub mod graph;
pub mod model;
pub mod outputs;
pub mod platform;
pub mod status;
pub mod util;
pub mod worker;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use config::EngineConfig;
use execute::{BuildReport, ExecuteError, Executor};
use graph::Graph;
use outputs::DockerCli;
use status::SharedStatusSink;

/// Build `graph` with the cache backend and docker client derived from
/// `config`.
pub async fn build(
  ctx: CancellationToken,
  config: Arc<EngineConfig>,
  graph: Arc<Graph>,
  sink: SharedStatusSink,
) -> Result<BuildReport, ExecuteError> {
  let backend = cache::backend_from_config(&config).map_err(|e| ExecuteError::Outputs(e.into()))?;
  let docker: Option<Arc<dyn outputs::DockerClient>> = config
    .docker
    .enabled
    .then(|| Arc::new(DockerCli::default()) as Arc<dyn outputs::DockerClient>);

  let executor = Arc::new(Executor::new(config, graph, backend, docker, sink));
  executor.run(ctx).await
}
