//! The declared web-service topology.
//!
//! This is the deployment the engine exists for: a virtual network, an
//! internet-facing load balancer with TLS termination, a container image
//! build, the containerized backend service, log capture, and a DNS alias
//! binding the public domain to the balancer. Everything here is pure
//! declaration; the [`Deployment`] it produces is converged elsewhere.

use camino::Utf8PathBuf;
use serde_json::json;

use crate::envfile;
use crate::error::ConfigError;
use crate::resource::{Input, ResourceKind, Value};
use crate::stack::{Deployment, Stack};

/// Container settings for the backend service.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub cpu: u32,
    /// Memory in MiB.
    pub memory: u32,
    pub port: u16,
    pub desired_count: u32,
    pub architecture: String,
}

impl Default for ContainerSpec {
    fn default() -> Self {
        Self {
            name: "api".to_string(),
            cpu: 512,
            memory: 400,
            port: 80,
            desired_count: 2,
            architecture: "ARM64".to_string(),
        }
    }
}

/// Settings for the declared topology.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Prefix for the logical resource names.
    pub prefix: String,
    pub cidr_block: String,
    /// Public domain the service is reachable at; also the DNS zone that is
    /// looked up for the alias record.
    pub domain: String,
    /// TLS certificate identifier for the HTTPS listener.
    pub certificate: String,
    pub dockerfile: Utf8PathBuf,
    pub build_context: Utf8PathBuf,
    /// Optional `KEY=VALUE` file feeding the container environment. Unset
    /// entries are dropped; a missing file means no extra environment.
    pub env_file: Option<Utf8PathBuf>,
    pub log_region: String,
    pub container: ContainerSpec,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            prefix: "app".to_string(),
            cidr_block: "10.0.0.0/16".to_string(),
            domain: "api.example.com".to_string(),
            certificate: "certificate/insert-yours-here".to_string(),
            dockerfile: "./api/Dockerfile".into(),
            build_context: "../".into(),
            env_file: None,
            log_region: "eu-central-1".to_string(),
            container: ContainerSpec::default(),
        }
    }
}

/// Declares the full topology and returns it ready to converge. The run
/// exports `url` (the load balancer endpoint) and `public_domain`.
pub fn declare(config: &TopologyConfig) -> Result<Deployment, ConfigError> {
    let mut stack = Stack::new();
    let p = &config.prefix;

    let network = stack.resource(
        ResourceKind::Network,
        format!("{p}-network"),
        [("cidr_block", Input::literal(config.cidr_block.as_str()))],
    )?;

    let group = stack.resource(
        ResourceKind::SecurityGroup,
        format!("{p}-web-sg"),
        [
            ("vpc_id", network.output("id")),
            (
                "ingress",
                Input::literal(json!([
                    {
                        "description": "allow HTTP access from anywhere",
                        "from_port": 80,
                        "to_port": 80,
                        "protocol": "tcp",
                        "cidr_blocks": ["0.0.0.0/0"],
                    },
                    {
                        "description": "allow HTTPS access from anywhere",
                        "from_port": 443,
                        "to_port": 443,
                        "protocol": "tcp",
                        "cidr_blocks": ["0.0.0.0/0"],
                    },
                ])),
            ),
            (
                "egress",
                Input::literal(json!([
                    {
                        "from_port": 0,
                        "to_port": 0,
                        "protocol": "-1",
                        "cidr_blocks": ["0.0.0.0/0"],
                    },
                ])),
            ),
        ],
    )?;

    let repository = stack.resource(
        ResourceKind::ImageRepository,
        format!("{p}-registry"),
        Vec::<(&str, Input)>::new(),
    )?;

    let image = stack.resource(
        ResourceKind::ImageBuild,
        format!("{p}-image"),
        [
            ("repository_url", repository.output("url")),
            ("dockerfile", Input::literal(config.dockerfile.as_str())),
            ("context", Input::literal(config.build_context.as_str())),
        ],
    )?;

    let cluster = stack.resource(
        ResourceKind::Cluster,
        format!("{p}-cluster"),
        Vec::<(&str, Input)>::new(),
    )?;

    let balancer = stack.resource(
        ResourceKind::LoadBalancer,
        format!("{p}-lb"),
        [
            ("security_group", group.output("id")),
            ("subnet_ids", network.output("public_subnet_ids")),
            ("target_port", Input::literal(80)),
            ("health_check_matcher", Input::literal("200-299")),
            (
                "listeners",
                Input::literal(json!([
                    {
                        "port": 80,
                        "protocol": "HTTP",
                        "redirect": {
                            "protocol": "HTTPS",
                            "port": "443",
                            "status_code": "HTTP_301",
                        },
                    },
                    {
                        "port": 443,
                        "protocol": "HTTPS",
                        "certificate": config.certificate,
                    },
                ])),
            ),
        ],
    )?;

    let logs = stack.resource(
        ResourceKind::LogGroup,
        format!("{p}-logs"),
        Vec::<(&str, Input)>::new(),
    )?;

    let stream = stack.resource(
        ResourceKind::LogStream,
        format!("{p}-log-stream"),
        [("group", logs.output("name"))],
    )?;

    // The environment is ordinary literal data: the file is read and
    // filtered down to set entries at declaration time, before the service
    // node exists.
    let environment: serde_json::Map<String, Value> = config
        .env_file
        .as_ref()
        .map(envfile::load)
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| (key, Value::String(value)))
        .collect();

    stack.resource(
        ResourceKind::ContainerService,
        format!("{p}-service"),
        [
            ("cluster", cluster.output("arn")),
            ("subnet_ids", network.output("private_subnet_ids")),
            ("security_group", group.output("id")),
            ("assign_public_ip", Input::literal(true)),
            ("desired_count", Input::literal(config.container.desired_count)),
            ("image", image.output("image_uri")),
            ("container_name", Input::literal(config.container.name.as_str())),
            ("cpu", Input::literal(config.container.cpu)),
            ("memory", Input::literal(config.container.memory)),
            ("port", Input::literal(config.container.port)),
            (
                "architecture",
                Input::literal(config.container.architecture.as_str()),
            ),
            ("target_group", balancer.output("target_group_arn")),
            ("log_group", logs.output("name")),
            ("log_stream", stream.output("name")),
            ("log_region", Input::literal(config.log_region.as_str())),
            ("environment", Input::literal(Value::Object(environment))),
        ],
    )?;

    let zone = stack.resource(
        ResourceKind::DnsZone,
        format!("{p}-zone"),
        [("zone_name", Input::literal(config.domain.as_str()))],
    )?;

    stack.resource(
        ResourceKind::DnsRecord,
        format!("{p}-dns"),
        [
            ("name", Input::literal(config.domain.as_str())),
            ("record_type", Input::literal("A")),
            ("zone_id", zone.output("zone_id")),
            ("alias_name", balancer.output("dns_name")),
            ("alias_zone_id", balancer.output("zone_id")),
            ("evaluate_target_health", Input::literal(true)),
        ],
    )?;

    stack.export("url", balancer.output("dns_name"))?;
    stack.export("public_domain", Input::literal(config.domain.as_str()))?;

    Ok(stack.finish())
}
