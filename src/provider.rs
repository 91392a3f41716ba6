use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::resource::{ResourceKind, Value};
use crate::state::Record;

/// The output attribute map a provider returns for an applied resource.
pub type Outputs = BTreeMap<String, Value>;

/// A fully resolved request to create or update one resource.
///
/// By the time a provider sees this, every referenced output has settled and
/// the input map contains only concrete values.
#[derive(Debug)]
pub struct ApplyRequest<'a> {
    pub kind: ResourceKind,
    /// Logical name of the resource within the stack.
    pub name: &'a str,
    pub inputs: &'a BTreeMap<String, Value>,
    /// The last-applied snapshot, if this resource was converged before.
    /// Providers may diff against it to decide between update and create.
    pub previous: Option<&'a Record>,
}

/// The pluggable boundary performing actual infrastructure operations.
///
/// The engine guarantees that `apply` is called at most once per resource
/// per run, never before the resource's producers succeeded, and never at
/// all when the recorded input snapshot is unchanged.
pub trait Provider: Send + Sync {
    /// Creates or updates the resource and returns its output attributes.
    /// The returned map must cover every attribute the kind declares.
    fn apply(&self, request: ApplyRequest<'_>) -> Result<Outputs, ProviderError>;

    /// Returns the last known outputs of the resource, or `None` if the
    /// provider has no record of it.
    fn read(&self, kind: ResourceKind, name: &str) -> Result<Option<Outputs>, ProviderError>;
}

/// Rejects apply results that are missing output attributes the kind
/// promises, so downstream consumers never see a hole where a value should
/// be.
pub(crate) fn check_outputs(
    kind: ResourceKind,
    name: &str,
    outputs: &Outputs,
) -> Result<(), ProviderError> {
    for attr in kind.outputs() {
        if !outputs.contains_key(*attr) {
            return Err(ProviderError::msg(format!(
                "provider returned no '{attr}' output for {kind} '{name}'"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_check_outputs_flags_missing_attribute() {
        let outputs = Outputs::from([("dns_name".to_string(), Value::from("lb.example"))]);

        let err = check_outputs(ResourceKind::LoadBalancer, "edge", &outputs).unwrap_err();
        assert!(err.to_string().contains("zone_id"));
    }

    #[test]
    fn test_check_outputs_accepts_full_set() {
        let outputs = Outputs::from([
            ("dns_name".to_string(), Value::from("lb.example")),
            ("zone_id".to_string(), Value::from("Z123")),
            ("target_group_arn".to_string(), Value::from("arn:tg")),
        ]);

        assert!(check_outputs(ResourceKind::LoadBalancer, "edge", &outputs).is_ok());
    }
}
