//! Services and the inter-dependency mappings that reference other placements.
//!
//! Grounded on `src/libmanifest/manifestservice.c` and
//! `src/libmanifest/interdependencymapping.c`. The original keeps
//! dependencies as pointers patched up after parsing; here a dependency is
//! just a key triple resolved by lookup at traversal time (§9 design note),
//! which survives set-algebra operations (C2) without any pointer fix-up.

use std::collections::BTreeMap;
use std::cmp::Ordering;

use crate::property::PropertyValue;
use crate::{Error, ErrorKind, Result};

/// A reference to another placement: `(service, container, target)`.
/// Sort order is `(target, container, service)`, lexicographic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterDependencyMapping {
    pub service: String,
    pub container: String,
    pub target: String,
}

impl InterDependencyMapping {
    pub fn new(service: impl Into<String>, container: impl Into<String>, target: impl Into<String>) -> Self {
        InterDependencyMapping {
            service: service.into(),
            container: container.into(),
            target: target.into(),
        }
    }

    fn sort_key(&self) -> (&str, &str, &str) {
        (&self.target, &self.container, &self.service)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.is_empty() || self.container.is_empty() || self.target.is_empty() {
            bail!(ErrorKind::ValidationError(
                "inter-dependency mapping must set service, container and target".into()
            ));
        }
        Ok(())
    }
}

impl PartialOrd for InterDependencyMapping {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InterDependencyMapping {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// A service as declared in `<services>`: a build output, a handler type,
/// its dependency edges, and the containers it optionally hosts for others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestService {
    pub name: String,
    /// Content-addressed build output path
    pub pkg: String,
    /// Handler identifier invoked on the client-interface (the `type` field)
    #[serde(rename = "type")]
    pub service_type: String,
    /// Ordering-significant: activation waits on these, in order
    #[serde(default)]
    pub depends_on: Vec<InterDependencyMapping>,
    /// Ordering-irrelevant: informational connections, not activation order
    #[serde(default)]
    pub connects_to: Vec<InterDependencyMapping>,
    /// Containers this service hosts for other services, keyed by container name
    #[serde(default)]
    pub provides_containers: BTreeMap<String, BTreeMap<String, PropertyValue>>,
}

impl ManifestService {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!(ErrorKind::ValidationError("service is missing name".into()));
        }
        if self.pkg.is_empty() {
            bail!(ErrorKind::ValidationError(format!(
                "service '{}' is missing pkg",
                self.name
            )));
        }
        if self.service_type.is_empty() {
            bail!(ErrorKind::ValidationError(format!(
                "service '{}' is missing type",
                self.name
            )));
        }
        for dep in self.depends_on.iter().chain(self.connects_to.iter()) {
            dep.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inter_dependency_mapping_sorts_by_target_then_container_then_service() {
        let mut xs = vec![
            InterDependencyMapping::new("b", "main", "T2"),
            InterDependencyMapping::new("a", "main", "T1"),
            InterDependencyMapping::new("a", "aux", "T1"),
        ];
        xs.sort();
        assert_eq!(
            xs,
            vec![
                InterDependencyMapping::new("a", "aux", "T1"),
                InterDependencyMapping::new("a", "main", "T1"),
                InterDependencyMapping::new("b", "main", "T2"),
            ]
        );
    }

    #[test]
    fn validate_rejects_missing_fields() {
        let dep = InterDependencyMapping::new("", "main", "T1");
        assert!(dep.validate().is_err());

        let svc = ManifestService {
            name: "".into(),
            pkg: "/nix/store/xxx".into(),
            service_type: "process".into(),
            depends_on: vec![],
            connects_to: vec![],
            provides_containers: BTreeMap::new(),
        };
        assert!(svc.validate().is_err());
    }
}
