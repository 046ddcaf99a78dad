//! Placements (`ServiceMapping`) and state references (`SnapshotMapping`),
//! plus the status enum the scheduler (C5) drives through its state machine.
//!
//! Grounded on `src/libmanifest/activationmapping.c` and
//! `src/convert-manifest/oldsnapshotmapping.c`. The source mutates a `status`
//! field embedded directly in the activation mapping struct; per the §9
//! design note we keep `status` as a field the scheduler is the sole writer
//! of, while treating the rest of the mapping as immutable manifest data.

use std::cmp::Ordering;

/// Runtime status of a `ServiceMapping` as it moves through the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingStatus {
    Deactivated,
    InProgress,
    Activated,
    Error,
}

/// A placement: service `S` runs in container `C` on target `T`.
///
/// Identity key is `(target, container, service)`, unique within one manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMapping {
    pub service: String,
    pub container: String,
    pub target: String,
    /// If set, names the service (by key) that hosts `container` instead of the target
    #[serde(default)]
    pub container_provided_by_service: Option<String>,
    #[serde(default = "default_status", skip_serializing)]
    pub status: MappingStatus,
}

fn default_status() -> MappingStatus {
    MappingStatus::Deactivated
}

/// The `(target, container, service)` identity key for a `ServiceMapping`.
pub type ServiceMappingKey = (String, String, String);

impl ServiceMapping {
    pub fn new(service: impl Into<String>, container: impl Into<String>, target: impl Into<String>) -> Self {
        ServiceMapping {
            service: service.into(),
            container: container.into(),
            target: target.into(),
            container_provided_by_service: None,
            status: MappingStatus::Deactivated,
        }
    }

    pub fn key(&self) -> ServiceMappingKey {
        (self.target.clone(), self.container.clone(), self.service.clone())
    }

    fn sort_key(&self) -> (&str, &str, &str) {
        (&self.target, &self.container, &self.service)
    }
}

impl PartialEq for ServiceMapping {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for ServiceMapping {}

impl PartialOrd for ServiceMapping {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ServiceMapping {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// A piece of state that must migrate when a service's placement changes.
///
/// Identity key is `(target, container, component)`, unique within one manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMapping {
    pub component: String,
    pub container: String,
    pub target: String,
    pub service: String,
    #[serde(default)]
    pub container_provided_by_service: Option<String>,
    /// Scheduler scratch space for the migration engine (C7)
    #[serde(default, skip_serializing)]
    pub transferred: bool,
}

pub type SnapshotMappingKey = (String, String, String);

impl SnapshotMapping {
    pub fn key(&self) -> SnapshotMappingKey {
        (self.target.clone(), self.container.clone(), self.component.clone())
    }

    fn sort_key(&self) -> (&str, &str, &str) {
        (&self.target, &self.container, &self.component)
    }
}

impl PartialEq for SnapshotMapping {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for SnapshotMapping {}

impl PartialOrd for SnapshotMapping {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SnapshotMapping {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_mapping_key_identifies_by_target_container_service() {
        let m = ServiceMapping::new("api", "main", "T1");
        assert_eq!(
            m.key(),
            ("T1".to_string(), "main".to_string(), "api".to_string())
        );
    }

    #[test]
    fn service_mappings_sort_lexicographically() {
        let mut xs = vec![
            ServiceMapping::new("api", "main", "T2"),
            ServiceMapping::new("db", "main", "T1"),
            ServiceMapping::new("api", "main", "T1"),
        ];
        xs.sort();
        let keys: Vec<_> = xs.iter().map(|m| m.key()).collect();
        assert_eq!(
            keys,
            vec![
                ("T1".to_string(), "main".to_string(), "api".to_string()),
                ("T1".to_string(), "main".to_string(), "db".to_string()),
                ("T2".to_string(), "main".to_string(), "api".to_string()),
            ]
        );
    }
}
