use std::collections::BTreeMap;

use console::style;

use crate::core::ArcStr;
use crate::engine::{CancelToken, RunReport};
use crate::error::{ConfigError, ConvergeError};
use crate::graph::DependencyGraph;
use crate::provider::Provider;
use crate::resource::{Input, OutputRef, ResourceKind, ResourceNode};
use crate::state::StateStore;

/// The declaration under construction.
///
/// A `Stack` accumulates resources one at a time and wires them together
/// through their [`ResourceHandle`]s. Because a handle only exists once its
/// resource is in the stack, inputs can never reference a resource declared
/// later, which rules out dependency cycles at declaration time.
///
/// Once declared, convert it into a [`Deployment`] to converge.
///
/// # Example
///
/// ```rust,no_run
/// use trellis::{Input, ResourceKind, Stack};
///
/// let mut stack = Stack::new();
/// let network = stack.resource(
///     ResourceKind::Network,
///     "net",
///     [("cidr_block", Input::literal("10.0.0.0/16"))],
/// )?;
/// stack.resource(
///     ResourceKind::SecurityGroup,
///     "web-sg",
///     [("vpc_id", network.output("id"))],
/// )?;
/// # Ok::<(), trellis::ConfigError>(())
/// ```
pub struct Stack {
    pub(crate) graph: DependencyGraph,
    pub(crate) exports: BTreeMap<String, Input>,
}

impl Stack {
    /// Creates a new, empty stack.
    pub fn new() -> Self {
        Self {
            graph: DependencyGraph::new(),
            exports: BTreeMap::new(),
        }
    }

    /// Declares a resource and returns the handle used to wire its outputs
    /// into resources declared after it.
    pub fn resource<N, K, I>(
        &mut self,
        kind: ResourceKind,
        name: N,
        inputs: I,
    ) -> Result<ResourceHandle, ConfigError>
    where
        N: Into<ArcStr>,
        K: Into<String>,
        I: IntoIterator<Item = (K, Input)>,
    {
        let name = name.into();
        let inputs = inputs
            .into_iter()
            .map(|(key, input)| (key.into(), input))
            .collect();

        self.graph
            .add(ResourceNode::new(kind, name.clone(), inputs))?;

        Ok(ResourceHandle { kind, name })
    }

    /// Declares a named output of the whole run, e.g. the endpoint a
    /// converged topology is reachable at. References are validated against
    /// the resources declared so far.
    pub fn export(&mut self, name: impl Into<String>, input: Input) -> Result<(), ConfigError> {
        let name = name.into();

        if let Some(reference) = input.reference() {
            let Some(producer) = self.graph.get(&reference.node) else {
                return Err(ConfigError::UnknownResource(
                    format!("export '{name}'"),
                    reference.node.to_string(),
                ));
            };

            if !producer.kind().outputs().contains(&&*reference.output) {
                return Err(ConfigError::UnknownOutput(
                    format!("export '{name}'"),
                    reference.node.to_string(),
                    reference.output.to_string(),
                ));
            }
        }

        self.exports.insert(name, input);
        Ok(())
    }

    /// Freezes the declaration.
    pub fn finish(self) -> Deployment {
        Deployment {
            graph: self.graph,
            exports: self.exports,
        }
    }
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.graph.node_indices() {
            let node = &self.graph.graph[index];
            writeln!(
                f,
                "    {:?}[\"{}\\n{}\"]",
                index.index(),
                node.name(),
                node.kind()
            )?;
        }

        for edge in self.graph.graph.edge_indices() {
            let (source, target) = self.graph.graph.edge_endpoints(edge).unwrap();
            let producer = &self.graph.graph[source];
            let consumer = &self.graph.graph[target];

            let attrs: Vec<&str> = consumer
                .inputs
                .values()
                .filter_map(Input::reference)
                .filter(|reference| reference.node() == producer.name())
                .map(OutputRef::output)
                .collect();

            writeln!(
                f,
                "    {:?} -- \"{}\" --> {:?}",
                source.index(),
                attrs.join(", "),
                target.index()
            )?;
        }

        Ok(())
    }
}

/// A lightweight token for a declared resource, used to reference its
/// eventual outputs from later declarations.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    kind: ResourceKind,
    name: ArcStr,
}

impl ResourceHandle {
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Builds an input referencing one of this resource's output
    /// attributes. The attribute name is validated when the input is used
    /// in a declaration.
    pub fn output(&self, attr: &str) -> Input {
        Input::Ref(OutputRef {
            node: self.name.clone(),
            output: attr.into(),
        })
    }
}

/// A frozen declaration, ready to be converged against a provider.
///
/// Eventual outputs settle once per declaration, so a `Deployment` value
/// represents a single run; idempotent re-runs re-declare the same stack
/// against the same [`StateStore`].
pub struct Deployment {
    pub(crate) graph: DependencyGraph,
    pub(crate) exports: BTreeMap<String, Input>,
}

impl Deployment {
    /// Starts a new declaration.
    pub fn declare() -> Stack {
        Stack::new()
    }

    /// Number of declared resources.
    pub fn len(&self) -> usize {
        self.graph.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.graph.node_count() == 0
    }

    /// Looks up a declared resource, e.g. to subscribe to its outputs.
    pub fn resource(&self, name: &str) -> Option<&ResourceNode> {
        self.graph.get(name)
    }

    /// Converges real infrastructure to match this declaration.
    ///
    /// Resources whose recorded input snapshot is unchanged are no-ops;
    /// everything else is applied through `provider` in dependency order,
    /// independent branches in parallel. See [`RunReport`] for the
    /// per-resource outcome.
    pub fn converge(
        &self,
        provider: &dyn Provider,
        state: &mut StateStore,
    ) -> Result<RunReport, ConvergeError> {
        self.converge_with(provider, state, &CancelToken::new())
    }

    /// Like [`converge`](Self::converge), with a cancellation token checked
    /// before each dispatch. In-flight provider calls always finish and are
    /// recorded; resources not yet dispatched are never started.
    pub fn converge_with(
        &self,
        provider: &dyn Provider,
        state: &mut StateStore,
        cancel: &CancelToken,
    ) -> Result<RunReport, ConvergeError> {
        eprintln!(
            "Converging {} ({} resources declared)",
            style("trellis").red(),
            self.len(),
        );

        crate::engine::converge(self, provider, state, cancel)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_handles_wire_edges() {
        let mut stack = Stack::new();
        let network = stack
            .resource(
                ResourceKind::Network,
                "net",
                [("cidr_block", Input::literal("10.0.0.0/16"))],
            )
            .unwrap();
        stack
            .resource(
                ResourceKind::SecurityGroup,
                "web-sg",
                [("vpc_id", network.output("id"))],
            )
            .unwrap();

        let deployment = stack.finish();
        assert_eq!(deployment.len(), 2);

        let sg = deployment.resource("web-sg").unwrap();
        assert_eq!(sg.depends_on(), vec![ArcStr::from("net")]);
    }

    #[test]
    fn test_export_of_unknown_resource_rejected() {
        let mut stack = Stack::new();
        let orphan = ResourceHandle {
            kind: ResourceKind::LoadBalancer,
            name: "ghost".into(),
        };

        let err = stack.export("url", orphan.output("dns_name")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownResource(_, _)));
    }

    #[test]
    fn test_mermaid_rendering() {
        let mut stack = Stack::new();
        let network = stack
            .resource(ResourceKind::Network, "net", Vec::<(&str, Input)>::new())
            .unwrap();
        stack
            .resource(
                ResourceKind::SecurityGroup,
                "web-sg",
                [("vpc_id", network.output("id"))],
            )
            .unwrap();

        let rendered = stack.to_string();
        assert!(rendered.starts_with("graph LR"));
        assert!(rendered.contains("net\\nnetwork"));
        assert!(rendered.contains("-- \"id\" -->"));
    }
}
