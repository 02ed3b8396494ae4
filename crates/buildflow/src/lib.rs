//! The buildflow build engine.
//!
//! Wires the kernel together: external producers declare [`Target`]s, a
//! [`driver::ActionProducer`] turns ready targets into actions, the
//! [`session::BuildSession`] event loop drives the graph through its status
//! lifecycle, consulting the action cache before dispatching to the
//! work-stealing pool, and a [`report::BuildReport`] summarizes the session.
//!
//! ```rust,ignore
//! use buildflow::{BuildConfig, BuildSession, CommandDriver};
//! use buildflow_graph::BuildGraph;
//!
//! let mut graph = BuildGraph::new();
//! graph.add_target(lib_target)?;
//! graph.add_target(app_target)?;
//! graph.add_dependency(&"app".into(), &"lib".into())?;
//!
//! let config = BuildConfig::from_env(workspace.join(".buildflow"));
//! let session = BuildSession::new(graph, driver, config).await?;
//! let report = session.run().await?;
//! std::process::exit(report.exit_code());
//! ```

pub mod config;
pub mod driver;
pub mod report;
pub mod session;

pub use buildflow_core::{
    Action, ActionId, ActionKind, ActionResult, ActionStatus, CancellationToken, Digest, Error,
    ErrorClass, Result, Target, TargetId, TargetKind,
};
pub use buildflow_graph::{BuildGraph, FailurePolicy, NodeStatus};
pub use config::BuildConfig;
pub use driver::{ActionProducer, CommandDriver};
pub use report::BuildReport;
pub use session::BuildSession;

/// Initialize the process-wide tracing subscriber once, honoring
/// `RUST_LOG`-style filtering. Later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
