//! The convergence scheduler.
//!
//! Resources are applied by a thread pool in dependency order: a node is
//! dispatched the moment its last producer succeeds, so independent
//! branches converge concurrently while chained resources apply strictly in
//! sequence. The scheduler thread is the only writer of the state store and
//! the only place eventuals are settled, which gives every consumer a
//! happens-before edge on its inputs.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::Hash32;
use crate::engine::{
    CancelToken, Diagnostics, NodeExecution, NodeReport, NodeStatus, RunReport, RunStatus,
};
use crate::error::{ConvergeError, Fault, ProviderError};
use crate::provider::{ApplyRequest, Outputs, Provider, check_outputs};
use crate::resource::{Input, ResourceNode, Value};
use crate::stack::Deployment;
use crate::state::{Record, StateStore, fingerprint};

/// Result of one provider call, reported back to the scheduler.
struct Done {
    index: NodeIndex,
    result: Result<Outputs, ProviderError>,
    inputs: BTreeMap<String, Value>,
    hash: Hash32,
    start: Instant,
    duration: Duration,
}

pub(crate) fn converge(
    deployment: &Deployment,
    provider: &dyn Provider,
    state: &mut StateStore,
    cancel: &CancelToken,
) -> Result<RunReport, ConvergeError> {
    let graph = &deployment.graph.graph;

    // Runs primarily to refuse cycles before any provider call; the order
    // itself also seeds the ready queue deterministically.
    let order = deployment.graph.topo_order()?;
    let total = order.len();

    // Build a map from a producer to the nodes that consume it.
    let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
    for edge in graph.raw_edges() {
        dependents
            .entry(edge.source())
            .or_default()
            .push(edge.target());
    }

    // Number of producers each node is still waiting on.
    let mut waiting_on: Vec<usize> = (0..total)
        .map(|i| {
            graph
                .neighbors_directed(NodeIndex::new(i), Direction::Incoming)
                .count()
        })
        .collect();

    let mut statuses: Vec<NodeStatus> = vec![NodeStatus::NotStarted; total];
    let mut timings: HashMap<NodeIndex, NodeExecution> = HashMap::new();
    let mut settled = 0usize;

    let root_span = tracing::span!(Level::INFO, "converging");
    root_span.pb_set_length(total as u64);
    root_span.pb_set_style(
        &ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    root_span.pb_set_message("Applying resources...");
    let _enter = root_span.enter();

    let pb_style = ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .unwrap();

    rayon::scope(|s| -> Result<(), ConvergeError> {
        let (result_sender, result_receiver) = channel::<Done>();

        // Nodes with no producers are eligible immediately, in declaration
        // order.
        let mut ready: VecDeque<NodeIndex> = order
            .iter()
            .copied()
            .filter(|index| waiting_on[index.index()] == 0)
            .collect();

        let mut in_flight = 0usize;

        loop {
            // Dispatch everything eligible right now.
            while let Some(index) = ready.pop_front() {
                if !matches!(statuses[index.index()], NodeStatus::NotStarted) {
                    continue;
                }

                if cancel.is_cancelled() {
                    let n = cascade_cancel(index, &dependents, &mut statuses);
                    settled += n;
                    root_span.pb_inc(n as u64);
                    continue;
                }

                let node = &graph[index];

                // Materialize the input map. Every reference has settled
                // successfully, or this node would have been skipped.
                let mut inputs = BTreeMap::new();
                for (attr, input) in &node.inputs {
                    let value = match input {
                        Input::Literal(value) => value.clone(),
                        Input::Ref(reference) => deployment
                            .graph
                            .get(&reference.node)
                            .and_then(|producer| producer.output(&reference.output))
                            .expect("references validated at declaration")
                            .try_get()
                            .expect("producer settled before dispatch")
                            .expect("producer succeeded before dispatch"),
                    };
                    inputs.insert(attr.clone(), value);
                }

                let hash = fingerprint(&inputs);
                let previous = state.get(node.name());

                let unchanged = previous.is_some_and(|record| {
                    record.kind == node.kind()
                        && record.input_hash == hash
                        && node
                            .kind()
                            .outputs()
                            .iter()
                            .all(|attr| record.outputs.contains_key(*attr))
                });

                if unchanged {
                    // Same snapshot as the last run; restore the recorded
                    // outputs without calling the provider.
                    let record = previous.expect("checked above");
                    for (attr, eventual) in &node.outputs {
                        eventual.resolve(record.outputs[*attr].clone())?;
                    }

                    statuses[index.index()] = NodeStatus::Succeeded { changed: false };
                    settled += 1;
                    root_span.pb_inc(1);
                    unlock(index, &dependents, &mut waiting_on, &mut ready);
                    continue;
                }

                statuses[index.index()] = NodeStatus::Applying;
                in_flight += 1;

                let name = node.name().to_string();
                let kind = node.kind();
                let previous = previous.cloned();
                let sender = result_sender.clone();
                let pb_style = pb_style.clone();

                s.spawn(move |_| {
                    let span = tracing::span!(Level::INFO, "apply", name = %name);
                    span.pb_set_style(&pb_style);
                    span.pb_set_message(&format!("Applying {name}"));
                    let _enter = span.enter();

                    let start = Instant::now();

                    // A panicking provider must not wedge the scheduler, so
                    // it is demoted to an ordinary failed apply.
                    let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        let request = ApplyRequest {
                            kind,
                            name: &name,
                            inputs: &inputs,
                            previous: previous.as_ref(),
                        };
                        let outputs = provider.apply(request)?;
                        check_outputs(kind, &name, &outputs)?;
                        Ok(outputs)
                    })) {
                        Ok(result) => result,
                        Err(panic) => {
                            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                                format!("Apply panicked: {s}")
                            } else if let Some(s) = panic.downcast_ref::<String>() {
                                format!("Apply panicked: {s}")
                            } else {
                                String::from("Apply panicked with unknown payload")
                            };

                            Err(ProviderError::msg(msg))
                        }
                    };

                    let _ = sender.send(Done {
                        index,
                        result,
                        inputs,
                        hash,
                        start,
                        duration: start.elapsed(),
                    });
                });
            }

            if settled == total {
                break;
            }

            // Something is still in flight, or the counts above are wrong.
            debug_assert!(in_flight > 0);

            let done = result_receiver.recv().expect("worker holds a sender");
            in_flight -= 1;

            let node = &graph[done.index];
            timings.insert(
                done.index,
                NodeExecution {
                    start: done.start,
                    duration: done.duration,
                },
            );

            match done.result {
                Ok(outputs) => {
                    for (attr, eventual) in &node.outputs {
                        // Coverage was checked on the worker.
                        eventual.resolve(outputs[*attr].clone())?;
                    }

                    state.put(
                        node.name(),
                        Record {
                            kind: node.kind(),
                            inputs: done.inputs,
                            input_hash: done.hash,
                            outputs,
                        },
                    );

                    statuses[done.index.index()] = NodeStatus::Succeeded { changed: true };
                    settled += 1;
                    root_span.pb_inc(1);
                    unlock(done.index, &dependents, &mut waiting_on, &mut ready);
                }
                Err(error) => {
                    tracing::error!(name = %node.name(), "apply failed: {error}");

                    for eventual in node.outputs.values() {
                        eventual.fail(error.clone())?;
                    }
                    statuses[done.index.index()] = NodeStatus::Failed(error.clone());
                    settled += 1;
                    root_span.pb_inc(1);

                    // Transitive consumers settle without provider calls;
                    // unrelated branches keep converging.
                    let n =
                        skip_consumers(done.index, &error, graph, &dependents, &mut statuses)?;
                    settled += n;
                    root_span.pb_inc(n as u64);
                }
            }
        }

        Ok(())
    })?;

    tracing::info!("Convergence complete");

    let mut nodes = BTreeMap::new();
    let mut all_ok = true;

    for index in graph.node_indices() {
        let node = &graph[index];
        let status = statuses[index.index()].clone();

        all_ok &= status.succeeded();
        nodes.insert(
            node.name().to_string(),
            NodeReport {
                kind: node.kind(),
                status,
            },
        );
    }

    let outputs = resolve_exports(deployment);

    let timings = timings
        .into_iter()
        .map(|(index, execution)| (graph[index].name().to_string(), execution))
        .collect();

    Ok(RunReport {
        status: if all_ok {
            RunStatus::Completed
        } else {
            RunStatus::PartiallyFailed
        },
        nodes,
        outputs,
        diagnostics: Diagnostics { timings },
    })
}

/// Decrements the dependency counts of `index`'s consumers, queueing any
/// that became eligible.
fn unlock(
    index: NodeIndex,
    dependents: &HashMap<NodeIndex, Vec<NodeIndex>>,
    waiting_on: &mut [usize],
    ready: &mut VecDeque<NodeIndex>,
) {
    let Some(consumers) = dependents.get(&index) else {
        return;
    };

    for &consumer in consumers {
        waiting_on[consumer.index()] -= 1;
        if waiting_on[consumer.index()] == 0 {
            ready.push_back(consumer);
        }
    }
}

/// Settles every transitive consumer of a failed node as skipped, failing
/// their outputs with the root error. Returns how many nodes settled.
fn skip_consumers(
    failed: NodeIndex,
    error: &ProviderError,
    graph: &DiGraph<ResourceNode, ()>,
    dependents: &HashMap<NodeIndex, Vec<NodeIndex>>,
    statuses: &mut [NodeStatus],
) -> Result<usize, Fault> {
    let cause = graph[failed].name().to_string();
    let mut settled = 0;

    let mut queue: VecDeque<NodeIndex> =
        dependents.get(&failed).cloned().unwrap_or_default().into();

    while let Some(index) = queue.pop_front() {
        // A node with several producers is only skipped once, and a node
        // already settled by another branch stays settled.
        if !matches!(statuses[index.index()], NodeStatus::NotStarted) {
            continue;
        }

        for eventual in graph[index].outputs.values() {
            eventual.fail(error.clone())?;
        }

        statuses[index.index()] = NodeStatus::Skipped {
            failed_producer: cause.clone(),
        };
        settled += 1;

        queue.extend(dependents.get(&index).cloned().unwrap_or_default());
    }

    Ok(settled)
}

/// Settles a node that was never dispatched due to cancellation, along with
/// every transitive consumer. Their eventuals stay pending: no error
/// occurred, the work simply never started.
fn cascade_cancel(
    root: NodeIndex,
    dependents: &HashMap<NodeIndex, Vec<NodeIndex>>,
    statuses: &mut [NodeStatus],
) -> usize {
    let mut settled = 0;
    let mut queue = VecDeque::from([root]);

    while let Some(index) = queue.pop_front() {
        if !matches!(statuses[index.index()], NodeStatus::NotStarted) {
            continue;
        }

        statuses[index.index()] = NodeStatus::Cancelled;
        settled += 1;

        queue.extend(dependents.get(&index).cloned().unwrap_or_default());
    }

    settled
}

/// Resolves the declared run outputs from the settled graph. Exports whose
/// producer failed or never ran are left out.
fn resolve_exports(deployment: &Deployment) -> BTreeMap<String, Value> {
    let mut outputs = BTreeMap::new();

    for (name, input) in &deployment.exports {
        let value = match input {
            Input::Literal(value) => Some(value.clone()),
            Input::Ref(reference) => deployment
                .graph
                .get(&reference.node)
                .and_then(|producer| producer.output(&reference.output))
                .and_then(|eventual| eventual.try_get())
                .and_then(Result::ok),
        };

        if let Some(value) = value {
            outputs.insert(name.clone(), value);
        }
    }

    outputs
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;
    use crate::resource::ResourceKind;
    use crate::stack::Stack;

    /// Provider that records apply order and fabricates outputs as
    /// `<name>-<attr>`, failing for configured names.
    #[derive(Default)]
    struct RecordingProvider {
        applied: Mutex<Vec<String>>,
        failures: HashSet<String>,
        cancel: Option<CancelToken>,
    }

    impl RecordingProvider {
        fn failing(names: &[&str]) -> Self {
            Self {
                failures: names.iter().map(|n| n.to_string()).collect(),
                ..Self::default()
            }
        }

        fn applied(&self) -> Vec<String> {
            self.applied.lock().unwrap().clone()
        }
    }

    impl Provider for RecordingProvider {
        fn apply(&self, request: ApplyRequest<'_>) -> Result<Outputs, ProviderError> {
            self.applied.lock().unwrap().push(request.name.to_string());

            if let Some(token) = &self.cancel {
                token.cancel();
            }

            if self.failures.contains(request.name) {
                return Err(ProviderError::msg(format!("{} exploded", request.name)));
            }

            Ok(request
                .kind
                .outputs()
                .iter()
                .map(|attr| (attr.to_string(), Value::from(format!("{}-{attr}", request.name))))
                .collect())
        }

        fn read(&self, _: ResourceKind, _: &str) -> Result<Option<Outputs>, ProviderError> {
            Ok(None)
        }
    }

    /// network <- security group <- load balancer, plus an independent
    /// cluster.
    fn declare(cidr: &str) -> Deployment {
        let mut stack = Stack::new();

        let network = stack
            .resource(
                ResourceKind::Network,
                "net",
                [("cidr_block", Input::literal(cidr))],
            )
            .unwrap();
        let group = stack
            .resource(
                ResourceKind::SecurityGroup,
                "sg",
                [("vpc_id", network.output("id"))],
            )
            .unwrap();
        let lb = stack
            .resource(
                ResourceKind::LoadBalancer,
                "lb",
                [
                    ("security_group", group.output("id")),
                    ("subnet_ids", network.output("public_subnet_ids")),
                ],
            )
            .unwrap();
        stack
            .resource(ResourceKind::Cluster, "cluster", Vec::<(&str, Input)>::new())
            .unwrap();

        stack.export("url", lb.output("dns_name")).unwrap();
        stack.finish()
    }

    #[test]
    fn test_clean_run_completes() {
        let deployment = declare("10.0.0.0/16");
        let provider = RecordingProvider::default();
        let mut state = StateStore::new();

        let report = deployment.converge(&provider, &mut state).unwrap();

        assert!(report.completed());
        assert_eq!(provider.applied().len(), 4);
        assert_eq!(state.len(), 4);
        assert_eq!(report.outputs["url"], Value::from("lb-dns_name"));

        // Producers apply strictly before their consumers.
        let applied = provider.applied();
        let position = |name: &str| applied.iter().position(|n| n == name).unwrap();
        assert!(position("net") < position("sg"));
        assert!(position("sg") < position("lb"));
    }

    #[test]
    fn test_subscriptions_observe_resolved_outputs() {
        let deployment = declare("10.0.0.0/16");

        let seen = std::sync::Arc::new(Mutex::new(None));
        let sink = seen.clone();
        deployment
            .resource("lb")
            .unwrap()
            .output("dns_name")
            .unwrap()
            .on_ready(move |outcome| {
                *sink.lock().unwrap() = Some(outcome.unwrap());
            });

        let mut state = StateStore::new();
        deployment
            .converge(&RecordingProvider::default(), &mut state)
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), Some(Value::from("lb-dns_name")));
    }

    #[test]
    fn test_inputs_resolve_before_dispatch() {
        struct AssertingProvider(RecordingProvider);

        impl Provider for AssertingProvider {
            fn apply(&self, request: ApplyRequest<'_>) -> Result<Outputs, ProviderError> {
                if request.name == "sg" {
                    assert_eq!(request.inputs["vpc_id"], Value::from("net-id"));
                }
                self.0.apply(request)
            }

            fn read(&self, kind: ResourceKind, name: &str) -> Result<Option<Outputs>, ProviderError> {
                self.0.read(kind, name)
            }
        }

        let deployment = declare("10.0.0.0/16");
        let provider = AssertingProvider(RecordingProvider::default());
        let mut state = StateStore::new();

        let report = deployment.converge(&provider, &mut state).unwrap();
        assert!(report.completed());
    }

    #[test]
    fn test_failure_skips_consumers_but_not_independent_branches() {
        let deployment = declare("10.0.0.0/16");
        let provider = RecordingProvider::failing(&["net"]);
        let mut state = StateStore::new();

        let report = deployment.converge(&provider, &mut state).unwrap();

        assert_eq!(report.status, RunStatus::PartiallyFailed);
        assert!(matches!(report.status_of("net"), Some(NodeStatus::Failed(_))));
        assert!(matches!(
            report.status_of("sg"),
            Some(NodeStatus::Skipped { failed_producer }) if failed_producer == "net"
        ));
        assert!(matches!(
            report.status_of("lb"),
            Some(NodeStatus::Skipped { failed_producer }) if failed_producer == "net"
        ));
        assert!(matches!(
            report.status_of("cluster"),
            Some(NodeStatus::Succeeded { changed: true })
        ));

        // Exactly one failure, attributed to the network; the skipped
        // resources were never dispatched.
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.failures().next().unwrap().0, "net");

        let mut applied = provider.applied();
        applied.sort();
        assert_eq!(applied, ["cluster", "net"]);

        // Skipped outputs fail through to any consumer.
        let lb = deployment.resource("lb").unwrap();
        assert!(lb.output("dns_name").unwrap().try_get().unwrap().is_err());

        // The failed subtree never published outputs.
        assert!(!report.outputs.contains_key("url"));
    }

    #[test]
    fn test_rerun_with_unchanged_inputs_is_noop() {
        let mut state = StateStore::new();

        let first = declare("10.0.0.0/16");
        let provider = RecordingProvider::default();
        first.converge(&provider, &mut state).unwrap();
        assert_eq!(provider.applied().len(), 4);

        // Same declaration, fresh run: every node restores from state.
        let second = declare("10.0.0.0/16");
        let provider = RecordingProvider::default();
        let report = second.converge(&provider, &mut state).unwrap();

        assert!(report.completed());
        assert!(provider.applied().is_empty());
        assert!(report
            .nodes
            .values()
            .all(|node| matches!(node.status, NodeStatus::Succeeded { changed: false })));

        // Restored outputs still feed the exports.
        assert_eq!(report.outputs["url"], Value::from("lb-dns_name"));
    }

    #[test]
    fn test_changed_input_reapplies_only_affected_nodes() {
        let mut state = StateStore::new();

        let first = declare("10.0.0.0/16");
        first
            .converge(&RecordingProvider::default(), &mut state)
            .unwrap();

        // The network input changed, but its fabricated outputs have not,
        // so downstream snapshots still match.
        let second = declare("10.1.0.0/16");
        let provider = RecordingProvider::default();
        let report = second.converge(&provider, &mut state).unwrap();

        assert!(report.completed());
        assert_eq!(provider.applied(), ["net"]);
        assert!(matches!(
            report.status_of("sg"),
            Some(NodeStatus::Succeeded { changed: false })
        ));
    }

    #[test]
    fn test_independent_nodes_converge_to_same_state_regardless_of_order() {
        let declare_pair = || {
            let mut stack = Stack::new();
            stack
                .resource(ResourceKind::Cluster, "c", Vec::<(&str, Input)>::new())
                .unwrap();
            stack
                .resource(ResourceKind::LogGroup, "d", Vec::<(&str, Input)>::new())
                .unwrap();
            stack.finish()
        };

        let mut state_a = StateStore::new();
        let mut state_b = StateStore::new();

        declare_pair()
            .converge(&RecordingProvider::default(), &mut state_a)
            .unwrap();
        declare_pair()
            .converge(&RecordingProvider::default(), &mut state_b)
            .unwrap();

        // Whatever the interleaving, the recorded state is identical.
        for name in ["c", "d"] {
            let a = state_a.get(name).unwrap();
            let b = state_b.get(name).unwrap();
            assert_eq!(a.input_hash, b.input_hash);
            assert_eq!(a.outputs, b.outputs);
        }
    }

    #[test]
    fn test_cancellation_never_starts_pending_nodes() {
        let deployment = declare("10.0.0.0/16");
        let cancel = CancelToken::new();

        // The first apply cancels the run mid-flight.
        let provider = RecordingProvider {
            cancel: Some(cancel.clone()),
            ..RecordingProvider::default()
        };
        let mut state = StateStore::new();

        let report = deployment
            .converge_with(&provider, &mut state, &cancel)
            .unwrap();

        assert_eq!(report.status, RunStatus::PartiallyFailed);

        // Whatever was in flight finished and was recorded.
        let applied = provider.applied();
        assert!(!applied.is_empty());
        assert_eq!(state.len(), applied.len());

        // Everything else never started.
        let cancelled = report
            .nodes
            .values()
            .filter(|node| matches!(node.status, NodeStatus::Cancelled))
            .count();
        assert_eq!(cancelled, 4 - applied.len());
    }

    #[test]
    fn test_panicking_provider_is_a_failed_apply() {
        struct PanickingProvider;

        impl Provider for PanickingProvider {
            fn apply(&self, request: ApplyRequest<'_>) -> Result<Outputs, ProviderError> {
                panic!("no credentials for {}", request.name);
            }

            fn read(&self, _: ResourceKind, _: &str) -> Result<Option<Outputs>, ProviderError> {
                Ok(None)
            }
        }

        let mut stack = Stack::new();
        stack
            .resource(ResourceKind::Cluster, "c", Vec::<(&str, Input)>::new())
            .unwrap();
        let deployment = stack.finish();

        let mut state = StateStore::new();
        let report = deployment.converge(&PanickingProvider, &mut state).unwrap();

        assert_eq!(report.status, RunStatus::PartiallyFailed);
        let (name, error) = report.failures().next().unwrap();
        assert_eq!(name, "c");
        assert!(error.to_string().contains("no credentials"));
    }

    #[test]
    fn test_defensive_cycle_check_runs_before_any_provider_call() {
        use std::collections::BTreeMap as Map;

        use crate::graph::DependencyGraph;
        use crate::resource::{OutputRef, ResourceNode};

        let mut graph = DependencyGraph::new();
        let a = graph
            .add(ResourceNode::new(ResourceKind::Cluster, "a".into(), Map::new()))
            .unwrap();
        let b = graph
            .add(ResourceNode::new(
                ResourceKind::LogGroup,
                "b".into(),
                Map::from([(
                    "cluster".to_string(),
                    Input::Ref(OutputRef {
                        node: "a".into(),
                        output: "arn".into(),
                    }),
                )]),
            ))
            .unwrap();

        // Unreachable through the builder; simulate a corrupted graph.
        graph.graph.add_edge(b, a, ());

        let deployment = Deployment {
            graph,
            exports: BTreeMap::new(),
        };
        let provider = RecordingProvider::default();
        let mut state = StateStore::new();

        let err = deployment.converge(&provider, &mut state).unwrap_err();
        assert!(matches!(
            err,
            ConvergeError::Config(crate::error::ConfigError::Cycle(_))
        ));
        assert!(provider.applied().is_empty());
    }

    #[test]
    fn test_missing_provider_output_fails_the_node() {
        struct HollowProvider;

        impl Provider for HollowProvider {
            fn apply(&self, _: ApplyRequest<'_>) -> Result<Outputs, ProviderError> {
                Ok(Outputs::new())
            }

            fn read(&self, _: ResourceKind, _: &str) -> Result<Option<Outputs>, ProviderError> {
                Ok(None)
            }
        }

        let mut stack = Stack::new();
        stack
            .resource(ResourceKind::Network, "net", Vec::<(&str, Input)>::new())
            .unwrap();
        let deployment = stack.finish();

        let mut state = StateStore::new();
        let report = deployment.converge(&HollowProvider, &mut state).unwrap();

        assert_eq!(report.status, RunStatus::PartiallyFailed);
        assert!(report.failures().next().unwrap().1.to_string().contains("id"));
    }
}
