//! The transition engine (C6): deactivates obsolete placements, activates
//! new ones, and rolls back to the old configuration on either failure.
//!
//! Grounded on `src/activate/transition.c`'s top-level `transition()`, which
//! calls `deactivate_obsolete_mappings` then `activate_new_mappings`, rolling
//! back through `rollback_to_old_mappings` / `rollback_new_mappings` on
//! failure. Only the activation phases roll back -- per the §9 design note,
//! forcing a rollback of already-completed deactivations/migrations would
//! risk data loss worse than the reported failure, so that asymmetry is kept.

use std::collections::BTreeMap;

use disnix_definitions::mapping::{MappingStatus, ServiceMapping, ServiceMappingKey};
use disnix_definitions::service::ManifestService;
use disnix_definitions::setalgebra::Keyed;
use disnix_definitions::target::Target;

use crate::scheduler::{self, Direction};
use crate::signal::Interrupt;
use crate::{ErrorKind, Result};

/// Resets any mapping in `keys` still stuck at `ERROR` back to
/// `completed_direction`'s terminal status, so a scheduler run in the
/// opposite direction picks it up from that status's "starting" state.
fn reset_errors(union: &mut [ServiceMapping], keys: &[ServiceMappingKey], completed_direction: Direction) {
    let reset_to = completed_direction.terminal();
    for key in keys {
        if let Some(m) = union.iter_mut().find(|m| &m.key() == key) {
            if m.status == MappingStatus::Error {
                m.status = reset_to;
            }
        }
    }
}

/// Runs the deactivate-then-activate transition over `union`. `old_keys` is
/// every mapping key from the *old* manifest (used to restore the full
/// prior configuration on rollback, not just the subset this run touched).
pub async fn transition(
    union: &mut Vec<ServiceMapping>,
    to_deactivate: &[ServiceMappingKey],
    to_activate: &[ServiceMappingKey],
    old_keys: &[ServiceMappingKey],
    services: &BTreeMap<String, ManifestService>,
    targets: &mut BTreeMap<String, Target>,
    interface_override: Option<&str>,
    dry_run: bool,
    interrupt: &Interrupt,
) -> Result<()> {
    info!("transition: deactivating {} obsolete mapping(s)", to_deactivate.len());
    let deactivate_ok = scheduler::run(
        union,
        to_deactivate,
        Direction::Deactivate,
        services,
        targets,
        interface_override,
        dry_run,
        interrupt,
    )
    .await?;

    if !deactivate_ok {
        warn!("deactivation of obsolete mappings failed, rolling back to the old configuration");
        reset_errors(union, to_deactivate, Direction::Deactivate);
        let _ = scheduler::run(
            union,
            old_keys,
            Direction::Activate,
            services,
            targets,
            interface_override,
            dry_run,
            interrupt,
        )
        .await;
        return Err(ErrorKind::SchedulerError(
            "deactivation of obsolete mappings failed; rolled back to the old configuration".into(),
        )
        .into());
    }

    info!("transition: activating {} new mapping(s)", to_activate.len());
    let activate_ok = scheduler::run(
        union,
        to_activate,
        Direction::Activate,
        services,
        targets,
        interface_override,
        dry_run,
        interrupt,
    )
    .await?;

    if !activate_ok {
        warn!("activation of new mappings failed, rolling back");
        reset_errors(union, to_activate, Direction::Activate);
        let _ = scheduler::run(
            union,
            to_activate,
            Direction::Deactivate,
            services,
            targets,
            interface_override,
            dry_run,
            interrupt,
        )
        .await;
        reset_errors(union, old_keys, Direction::Deactivate);
        let _ = scheduler::run(
            union,
            old_keys,
            Direction::Activate,
            services,
            targets,
            interface_override,
            dry_run,
            interrupt,
        )
        .await;
        return Err(ErrorKind::SchedulerError(
            "activation of new mappings failed; rolled back new mappings and re-activated the old configuration".into(),
        )
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use disnix_definitions::service::InterDependencyMapping;
    use disnix_definitions::PropertyValue;
    use maplit::btreemap;

    fn target() -> Target {
        Target::new(
            "x86_64-linux".into(),
            "true".into(),
            "hostname".into(),
            btreemap! { "hostname".into() => PropertyValue::String("t1".into()) },
            BTreeMap::new(),
            2,
        )
    }

    fn service(name: &str, deps: Vec<InterDependencyMapping>) -> ManifestService {
        ManifestService {
            name: name.to_string(),
            pkg: format!("/nix/store/{}", name),
            service_type: "process".into(),
            depends_on: deps,
            connects_to: vec![],
            provides_containers: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn fresh_install_activates_dependency_chain_in_order() {
        let mut a = ServiceMapping::new("db", "main", "T1");
        a.status = MappingStatus::Deactivated;
        let mut b = ServiceMapping::new("api", "main", "T1");
        b.status = MappingStatus::Deactivated;
        let mut union = vec![a, b];
        union.sort();

        let services = btreemap! {
            "db".to_string() => service("db", vec![]),
            "api".to_string() => service("api", vec![InterDependencyMapping::new("db", "main", "T1")]),
        };
        let mut targets = btreemap! { "T1".to_string() => target() };
        let interrupt = Interrupt::new();
        let to_activate: Vec<_> = union.iter().map(|m| m.key()).collect();

        let result = transition(
            &mut union,
            &[],
            &to_activate,
            &[],
            &services,
            &mut targets,
            None,
            true,
            &interrupt,
        )
        .await;

        assert!(result.is_ok());
        assert!(union.iter().all(|m| m.status == MappingStatus::Activated));
    }

    #[tokio::test]
    async fn activation_failure_rolls_back_to_old_configuration() {
        let mut a = ServiceMapping::new("a", "main", "T1");
        a.status = MappingStatus::Activated;
        let mut b = ServiceMapping::new("b", "main", "Tmissing");
        b.status = MappingStatus::Deactivated;
        let mut union = vec![a.clone(), b.clone()];
        union.sort();

        let services = btreemap! {
            "a".to_string() => service("a", vec![]),
            "b".to_string() => service("b", vec![]),
        };
        let mut targets = btreemap! { "T1".to_string() => target() };
        let interrupt = Interrupt::new();
        let old_keys = vec![a.key()];
        let to_activate = vec![b.key()];

        let result = transition(
            &mut union,
            &[],
            &to_activate,
            &old_keys,
            &services,
            &mut targets,
            None,
            true,
            &interrupt,
        )
        .await;

        assert!(result.is_err());
        let a_status = union.iter().find(|m| m.key() == a.key()).unwrap().status;
        assert_eq!(a_status, MappingStatus::Activated);
    }
}
