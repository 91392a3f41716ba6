mod diagnostics;
mod runner;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use crate::engine::diagnostics::{Diagnostics, NodeExecution};
pub(crate) use crate::engine::runner::converge;

use crate::error::ProviderError;
use crate::resource::{ResourceKind, Value};

/// Per-resource progress through a convergence run.
#[derive(Debug, Clone)]
pub enum NodeStatus {
    /// Not yet eligible; producers still outstanding.
    NotStarted,
    /// Dispatched to the provider.
    Applying,
    /// Applied. `changed` is false when the recorded input snapshot was
    /// unchanged and the provider was not called at all.
    Succeeded { changed: bool },
    /// The provider call for this resource failed.
    Failed(ProviderError),
    /// Never dispatched because a producer failed.
    Skipped {
        /// The resource whose failure caused the skip.
        failed_producer: String,
    },
    /// Never dispatched because the run was cancelled.
    Cancelled,
}

impl NodeStatus {
    pub fn succeeded(&self) -> bool {
        matches!(self, NodeStatus::Succeeded { .. })
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::NotStarted => write!(f, "not started"),
            NodeStatus::Applying => write!(f, "applying"),
            NodeStatus::Succeeded { changed: true } => write!(f, "applied"),
            NodeStatus::Succeeded { changed: false } => write!(f, "unchanged"),
            NodeStatus::Failed(error) => write!(f, "failed: {error}"),
            NodeStatus::Skipped { failed_producer } => {
                write!(f, "skipped ('{failed_producer}' failed)")
            }
            NodeStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of a whole run: [`Completed`](RunStatus::Completed) only if every
/// resource succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    PartiallyFailed,
}

/// Final status of one resource, as listed in the [`RunReport`].
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub kind: ResourceKind,
    pub status: NodeStatus,
}

/// The per-resource outcome of a convergence run, plus the resolved run
/// outputs declared with [`Stack::export`](crate::Stack::export).
#[derive(Debug)]
pub struct RunReport {
    pub status: RunStatus,
    pub nodes: BTreeMap<String, NodeReport>,
    /// Exported outputs that resolved; exports whose producer failed are
    /// absent.
    pub outputs: BTreeMap<String, Value>,
    pub diagnostics: Diagnostics,
}

impl RunReport {
    pub fn completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn status_of(&self, name: &str) -> Option<&NodeStatus> {
        self.nodes.get(name).map(|node| &node.status)
    }

    /// Every resource that failed, with its error.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &ProviderError)> {
        self.nodes.iter().filter_map(|(name, node)| match &node.status {
            NodeStatus::Failed(error) => Some((name.as_str(), error)),
            _ => None,
        })
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self.status {
            RunStatus::Completed => "completed",
            RunStatus::PartiallyFailed => "partially failed",
        };
        writeln!(f, "{status}")?;

        for (name, node) in &self.nodes {
            writeln!(f, "  {} ({}): {}", name, node.kind, node.status)?;
        }

        for (name, value) in &self.outputs {
            writeln!(f, "  {name} = {value}")?;
        }

        Ok(())
    }
}

/// Cooperative cancellation for a convergence run.
///
/// Cancelling never aborts an in-flight provider call; whatever finishes is
/// recorded in the state store, and resources not yet dispatched are simply
/// never started.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
