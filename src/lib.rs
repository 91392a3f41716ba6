#![forbid(unsafe_code)]

//! Declarative infrastructure topology engine with parallel convergence and
//! incremental state.
//!
//! A deployment is declared as a [`Stack`] of resources whose inputs are
//! either literal values or references to outputs other resources will
//! produce. References are validated as the stack is built, induce the
//! dependency graph implicitly, and cannot point forward, so the graph is
//! acyclic by construction.
//!
//! [`Deployment::converge`] walks the graph in dependency order against a
//! pluggable [`Provider`]: independent resources apply in parallel, each
//! output settles an [`Eventual`] that downstream resources consume, and a
//! failure skips exactly the failed resource's consumers while unrelated
//! branches keep going. The [`StateStore`] remembers the last-applied input
//! snapshot per resource, so re-converging an unchanged declaration issues
//! no provider calls at all.
//!
//! # Example
//!
//! ```rust,no_run
//! use trellis::{Input, ResourceKind, Stack, StateStore};
//!
//! # fn provider() -> impl trellis::Provider {
//! #     struct Nop;
//! #     impl trellis::Provider for Nop {
//! #         fn apply(&self, r: trellis::ApplyRequest<'_>) -> Result<trellis::Outputs, trellis::ProviderError> {
//! #             Ok(r.kind.outputs().iter().map(|a| (a.to_string(), trellis::Value::Null)).collect())
//! #         }
//! #         fn read(&self, _: ResourceKind, _: &str) -> Result<Option<trellis::Outputs>, trellis::ProviderError> {
//! #             Ok(None)
//! #         }
//! #     }
//! #     Nop
//! # }
//! let mut stack = Stack::new();
//! let network = stack.resource(
//!     ResourceKind::Network,
//!     "net",
//!     [("cidr_block", Input::literal("10.0.0.0/16"))],
//! )?;
//! stack.resource(
//!     ResourceKind::SecurityGroup,
//!     "web-sg",
//!     [("vpc_id", network.output("id"))],
//! )?;
//!
//! let mut state = StateStore::load("deploy.json")?;
//! let report = stack.finish().converge(&provider(), &mut state)?;
//! state.save("deploy.json")?;
//!
//! assert!(report.completed());
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! The canned web-service deployment lives in [`topology`].

mod core;
pub mod envfile;
mod engine;
mod error;
mod eventual;
mod graph;
mod provider;
mod resource;
mod stack;
mod state;
pub mod topology;
#[cfg(feature = "logging")]
mod utils;

pub use crate::engine::{
    CancelToken, Diagnostics, NodeExecution, NodeReport, NodeStatus, RunReport, RunStatus,
};
pub use crate::error::{ConfigError, ConvergeError, Fault, ProviderError, StateError};
pub use crate::eventual::Eventual;
pub use crate::provider::{ApplyRequest, Outputs, Provider};
pub use crate::resource::{Input, OutputRef, ResourceKind, ResourceNode, Value};
pub use crate::stack::{Deployment, ResourceHandle, Stack};
pub use crate::state::{Record, StateStore};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
