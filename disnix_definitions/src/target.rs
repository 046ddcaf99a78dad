//! The target model (C3): a deployable machine's properties, its container
//! table and the CPU-core budget semaphore the scheduler draws on.
//!
//! Grounded on `src/libinfrastructure/target.c` / `target.h` in the original
//! implementation. The source keeps `available_cores` as a plain `int` field
//! mutated directly because the whole coordinator runs on one thread; we keep
//! that single-owner discipline here rather than reaching for `Arc<Mutex<_>>`
//! or an atomic -- the scheduler (C5) is the sole caller of `request_core` /
//! `release_core` and it never shares a `Target` across threads.

use std::collections::BTreeMap;

use crate::property::PropertyValue;
use crate::{Error, ErrorKind, Result};

/// A deployable machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Architecture tag (e.g. `x86_64-linux`)
    pub system: String,
    /// Opaque command the core invokes to talk to this target
    pub client_interface: String,
    /// Name of the property in `properties` that is this machine's identity key
    pub target_property: String,
    /// Arbitrary target machine properties
    pub properties: BTreeMap<String, PropertyValue>,
    /// Container-specific configuration properties, keyed by container name
    pub containers: BTreeMap<String, BTreeMap<String, PropertyValue>>,
    /// Total CPU cores this machine has for deployment work
    #[serde(default = "default_num_of_cores")]
    pub num_of_cores: u32,
    /// CPU cores currently free; mutated only by `request_core`/`release_core`
    #[serde(skip, default)]
    pub available_cores: u32,
}

fn default_num_of_cores() -> u32 {
    1
}

impl Target {
    pub fn new(
        system: String,
        client_interface: String,
        target_property: String,
        properties: BTreeMap<String, PropertyValue>,
        containers: BTreeMap<String, BTreeMap<String, PropertyValue>>,
        num_of_cores: u32,
    ) -> Self {
        let cores = if num_of_cores == 0 { 1 } else { num_of_cores };
        Target {
            system,
            client_interface,
            target_property,
            properties,
            containers,
            num_of_cores: cores,
            available_cores: cores,
        }
    }

    /// Enforces the §3 invariants for a single target.
    pub fn validate(&self) -> Result<()> {
        if self.target_property.is_empty() {
            bail!(ErrorKind::ValidationError(
                "target is missing targetProperty".into()
            ));
        }
        if self.client_interface.is_empty() {
            bail!(ErrorKind::ValidationError(
                "target is missing clientInterface".into()
            ));
        }
        if self.num_of_cores < 1 {
            bail!(ErrorKind::ValidationError(format!(
                "target '{}' has numOfCores < 1",
                self.target_property
            )));
        }
        if !self.properties.contains_key(&self.target_property) {
            bail!(ErrorKind::ValidationError(format!(
                "target is missing its own identity property '{}'",
                self.target_property
            )));
        }
        Ok(())
    }

    /// Returns `properties[target_property]` as a string -- the machine's identity key.
    pub fn find_target_key(&self) -> Result<String> {
        self.properties
            .get(&self.target_property)
            .map(PropertyValue::as_env_value)
            .ok_or_else(|| {
                ErrorKind::ValidationError(format!(
                    "target property '{}' not present on target",
                    self.target_property
                ))
                .into()
            })
    }

    /// Assembles `KEY=VALUE` environment entries for a named container.
    /// Empty if the container isn't hosted by this target.
    pub fn container_env(&self, container_name: &str) -> Vec<String> {
        match self.containers.get(container_name) {
            Some(props) => props
                .iter()
                .map(|(k, v)| format!("{}={}", k, v.as_env_value()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Atomically (single-threaded: just a checked decrement) takes a core
    /// slot if one is available. Never blocks.
    pub fn request_core(&mut self) -> bool {
        if self.available_cores > 0 {
            self.available_cores -= 1;
            true
        } else {
            false
        }
    }

    /// Returns a core slot to the pool.
    pub fn release_core(&mut self) {
        debug_assert!(
            self.available_cores < self.num_of_cores,
            "released more cores than were ever requested"
        );
        self.available_cores = (self.available_cores + 1).min(self.num_of_cores);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn sample_target() -> Target {
        Target::new(
            "x86_64-linux".into(),
            "disnix-ssh-client".into(),
            "hostname".into(),
            btreemap! { "hostname".into() => PropertyValue::String("test1".into()) },
            BTreeMap::new(),
            2,
        )
    }

    #[test]
    fn request_and_release_core_bound_available_cores() {
        let mut t = sample_target();
        assert!(t.request_core());
        assert!(t.request_core());
        assert!(!t.request_core());
        assert_eq!(t.available_cores, 0);
        t.release_core();
        assert_eq!(t.available_cores, 1);
        t.release_core();
        assert_eq!(t.available_cores, 2);
    }

    #[test]
    fn release_core_never_exceeds_num_of_cores() {
        let mut t = sample_target();
        t.release_core();
        assert_eq!(t.available_cores, 2);
    }

    #[test]
    fn validate_rejects_missing_identity_property() {
        let mut t = sample_target();
        t.properties.clear();
        assert!(t.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_cores() {
        let mut t = sample_target();
        t.num_of_cores = 0;
        assert!(t.validate().is_err());
    }

    #[test]
    fn find_target_key_reads_identity_property() {
        let t = sample_target();
        assert_eq!(t.find_target_key().unwrap(), "test1");
    }

    #[test]
    fn container_env_empty_for_unknown_container() {
        let t = sample_target();
        assert!(t.container_env("nope").is_empty());
    }
}
