use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::ArcStr;
use crate::eventual::Eventual;

/// Attribute values are JSON-shaped: strings, numbers, booleans, lists and
/// maps. Maps serialize with sorted keys, which keeps input fingerprints
/// canonical.
pub type Value = serde_json::Value;

/// The kind of an infrastructure resource.
///
/// The kind fixes which output attributes a resource exposes once applied,
/// and is the tag a provider dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Network,
    SecurityGroup,
    ImageRepository,
    ImageBuild,
    Cluster,
    LoadBalancer,
    LogGroup,
    LogStream,
    ContainerService,
    DnsZone,
    DnsRecord,
}

impl ResourceKind {
    /// Output attribute names every resource of this kind exposes.
    pub fn outputs(self) -> &'static [&'static str] {
        match self {
            ResourceKind::Network => &["id", "public_subnet_ids", "private_subnet_ids"],
            ResourceKind::SecurityGroup => &["id"],
            ResourceKind::ImageRepository => &["url"],
            ResourceKind::ImageBuild => &["image_uri"],
            ResourceKind::Cluster => &["arn"],
            ResourceKind::LoadBalancer => &["dns_name", "zone_id", "target_group_arn"],
            ResourceKind::LogGroup => &["name", "arn"],
            ResourceKind::LogStream => &["name"],
            ResourceKind::ContainerService => &["arn"],
            ResourceKind::DnsZone => &["zone_id"],
            ResourceKind::DnsRecord => &["fqdn"],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::ImageRepository => "image_repository",
            ResourceKind::ImageBuild => "image_build",
            ResourceKind::Cluster => "cluster",
            ResourceKind::LoadBalancer => "load_balancer",
            ResourceKind::LogGroup => "log_group",
            ResourceKind::LogStream => "log_stream",
            ResourceKind::ContainerService => "container_service",
            ResourceKind::DnsZone => "dns_zone",
            ResourceKind::DnsRecord => "dns_record",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference to one output attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRef {
    pub(crate) node: ArcStr,
    pub(crate) output: ArcStr,
}

impl OutputRef {
    /// Logical name of the producing resource.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Name of the consumed output attribute.
    pub fn output(&self) -> &str {
        &self.output
    }
}

/// A single input attribute of a resource: either a literal value known at
/// declaration time, or a reference to an output another resource will
/// produce during the run.
///
/// References are what induce dependency edges; graph construction walks
/// this union, never runtime type inspection.
#[derive(Debug, Clone)]
pub enum Input {
    Literal(Value),
    Ref(OutputRef),
}

impl Input {
    pub fn literal(value: impl Into<Value>) -> Self {
        Input::Literal(value.into())
    }

    /// The producer this input depends on, if any.
    pub fn reference(&self) -> Option<&OutputRef> {
        match self {
            Input::Literal(_) => None,
            Input::Ref(reference) => Some(reference),
        }
    }
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Input::Literal(value)
    }
}

/// A declared unit of infrastructure.
///
/// Identity is the logical name, unique within a stack. Inputs are fixed at
/// declaration time; outputs are pending [`Eventual`]s owned by this node
/// and settled exactly once during its single apply attempt.
pub struct ResourceNode {
    pub(crate) kind: ResourceKind,
    pub(crate) name: ArcStr,
    pub(crate) inputs: BTreeMap<String, Input>,
    pub(crate) outputs: BTreeMap<&'static str, Eventual<Value>>,
}

impl ResourceNode {
    pub(crate) fn new(kind: ResourceKind, name: ArcStr, inputs: BTreeMap<String, Input>) -> Self {
        let outputs = kind
            .outputs()
            .iter()
            .map(|attr| (*attr, Eventual::named(format!("{name}.{attr}"))))
            .collect();

        Self {
            kind,
            name,
            inputs,
            outputs,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Distinct logical names of the resources this node consumes outputs
    /// from, derived by scanning the input map for references.
    pub fn depends_on(&self) -> Vec<ArcStr> {
        let mut seen = Vec::new();

        for input in self.inputs.values() {
            if let Some(reference) = input.reference()
                && !seen.contains(&reference.node)
            {
                seen.push(reference.node.clone());
            }
        }

        seen
    }

    /// The eventual holding the given output attribute, if the kind exposes
    /// it.
    pub fn output(&self, attr: &str) -> Option<&Eventual<Value>> {
        self.outputs.get(attr)
    }
}

impl std::fmt::Debug for ResourceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceNode")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .finish()
    }
}
