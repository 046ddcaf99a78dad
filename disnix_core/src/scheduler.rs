//! The dependency-ordered scheduler (C5): drives every `ServiceMapping` in
//! a union array from its starting status to `ACTIVATED` (or `DEACTIVATED`)
//! while respecting the `depends_on` partial order and each target's core
//! budget.
//!
//! Grounded directly on `src/activate/transition.c`'s `activate()` /
//! `deactivate()` pair: a recursive descent that stops at the first
//! dependency still pending, a per-target `numOfCores` semaphore gating how
//! many subprocesses may be in flight at once, and an outer loop that reaps
//! exactly one finished child per pass (`wait_for_activation_or_deactivation`)
//! before recomputing which mappings are still pending. The C source mutates
//! a `status` field in place on each mapping; this keeps that shape (see the
//! note on `disnix_definitions::mapping::ServiceMapping::status`) but swaps
//! the blocking `waitpid` loop for `futures::stream::FuturesUnordered`, the
//! bounded-concurrency primitive this pack reaches for (see `process.rs`).

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use futures::stream::{FuturesUnordered, StreamExt};

use disnix_definitions::mapping::{MappingStatus, ServiceMapping, ServiceMappingKey};
use disnix_definitions::service::ManifestService;
use disnix_definitions::setalgebra::Keyed;
use disnix_definitions::target::Target;

use crate::client::Invocation;
use crate::signal::Interrupt;
use crate::{ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Activate,
    Deactivate,
}

impl Direction {
    fn verb(self) -> &'static str {
        match self {
            Direction::Activate => "activate",
            Direction::Deactivate => "deactivate",
        }
    }

    pub(crate) fn terminal(self) -> MappingStatus {
        match self {
            Direction::Activate => MappingStatus::Activated,
            Direction::Deactivate => MappingStatus::Deactivated,
        }
    }

    pub(crate) fn starting(self) -> MappingStatus {
        match self {
            Direction::Activate => MappingStatus::Deactivated,
            Direction::Deactivate => MappingStatus::Activated,
        }
    }

    pub(crate) fn opposite(self) -> Direction {
        match self {
            Direction::Activate => Direction::Deactivate,
            Direction::Deactivate => Direction::Activate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepResult {
    Done,
    InProgress,
    Wait,
    Error,
}

type SpawnFuture = Pin<Box<dyn Future<Output = (ServiceMappingKey, Result<()>)> + Send>>;

/// Drives `union` to a terminal state for every key in `input_keys`, in the
/// given direction. Returns `Ok(true)` if every mapping ended up `ACTIVATED`
/// (resp. `DEACTIVATED`) with no `ERROR`s; `Ok(false)` otherwise, including
/// when the run is cut short by an interrupt (no new work is spawned once
/// `interrupt.is_set()`, but in-flight children are still awaited).
pub async fn run(
    union: &mut Vec<ServiceMapping>,
    input_keys: &[ServiceMappingKey],
    direction: Direction,
    services: &BTreeMap<String, ManifestService>,
    targets: &mut BTreeMap<String, Target>,
    interface_override: Option<&str>,
    dry_run: bool,
    interrupt: &Interrupt,
) -> Result<bool> {
    let mut spawned: FuturesUnordered<SpawnFuture> = FuturesUnordered::new();
    let mut overall_ok = true;

    loop {
        if !interrupt.is_set() {
            for key in input_keys {
                let mut pass = Pass {
                    union,
                    services,
                    targets,
                    interface_override,
                    dry_run,
                    spawned: &mut spawned,
                };
                if pass.step(key, direction)? == StepResult::Error {
                    overall_ok = false;
                }
            }
        } else {
            overall_ok = false;
        }

        let all_terminal = input_keys.iter().all(|k| is_terminal(union, k, direction));
        if all_terminal && spawned.is_empty() {
            break;
        }
        if spawned.is_empty() {
            overall_ok = false;
            break;
        }

        if let Some((key, result)) = spawned.next().await {
            apply_reap(union, targets, &key, direction, result, &mut overall_ok);
        }
    }

    Ok(overall_ok)
}

fn is_terminal(union: &[ServiceMapping], key: &ServiceMappingKey, direction: Direction) -> bool {
    match union.iter().find(|m| &m.key() == key) {
        Some(m) => m.status == direction.terminal() || m.status == MappingStatus::Error,
        None => true,
    }
}

fn apply_reap(
    union: &mut [ServiceMapping],
    targets: &mut BTreeMap<String, Target>,
    key: &ServiceMappingKey,
    direction: Direction,
    result: Result<()>,
    overall_ok: &mut bool,
) {
    let idx = match union.iter().position(|m| &m.key() == key) {
        Some(i) => i,
        None => return,
    };
    let target_name = union[idx].target.clone();
    match result {
        Ok(()) => union[idx].status = direction.terminal(),
        Err(e) => {
            warn!("mapping {:?} failed: {}", key, e);
            union[idx].status = MappingStatus::Error;
            *overall_ok = false;
        }
    }
    if let Some(t) = targets.get_mut(&target_name) {
        t.release_core();
    }
}

struct Pass<'a> {
    union: &'a mut Vec<ServiceMapping>,
    services: &'a BTreeMap<String, ManifestService>,
    targets: &'a mut BTreeMap<String, Target>,
    interface_override: Option<&'a str>,
    dry_run: bool,
    spawned: &'a mut FuturesUnordered<SpawnFuture>,
}

impl<'a> Pass<'a> {
    fn step(&mut self, key: &ServiceMappingKey, direction: Direction) -> Result<StepResult> {
        let idx = match self.union.iter().position(|m| &m.key() == key) {
            Some(i) => i,
            None => {
                return Err(ErrorKind::SchedulerError(format!(
                    "mapping {:?} referenced but not present in the union array",
                    key
                ))
                .into())
            }
        };

        let status = self.union[idx].status;
        if status == MappingStatus::Error {
            return Ok(StepResult::Error);
        }
        if status == direction.terminal() {
            return Ok(StepResult::Done);
        }
        if status == MappingStatus::InProgress {
            return Ok(StepResult::InProgress);
        }
        debug_assert_eq!(status, direction.starting());

        for dep_key in self.dependency_keys(idx, direction) {
            match self.step(&dep_key, direction)? {
                StepResult::Done => continue,
                other => return Ok(other),
            }
        }

        self.spawn(idx, key.clone(), direction)
    }

    /// Edges to resolve before `idx` may change state: for activation, the
    /// mappings named by `idx`'s service `depends_on`; for deactivation,
    /// every other mapping whose service depends on `idx` (the reverse
    /// edge), recomputed fresh each call rather than precomputed once.
    fn dependency_keys(&self, idx: usize, direction: Direction) -> Vec<ServiceMappingKey> {
        let mapping = &self.union[idx];
        match direction {
            Direction::Activate => self
                .services
                .get(&mapping.service)
                .map(|s| {
                    s.depends_on
                        .iter()
                        .map(|d| (d.target.clone(), d.container.clone(), d.service.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            Direction::Deactivate => {
                let (this_service, this_container, this_target) =
                    (mapping.service.clone(), mapping.container.clone(), mapping.target.clone());
                self.union
                    .iter()
                    .filter(|candidate| {
                        self.services
                            .get(&candidate.service)
                            .map(|s| {
                                s.depends_on.iter().any(|d| {
                                    d.service == this_service
                                        && d.container == this_container
                                        && d.target == this_target
                                })
                            })
                            .unwrap_or(false)
                    })
                    .map(|candidate| candidate.key())
                    .collect()
            }
        }
    }

    fn spawn(&mut self, idx: usize, key: ServiceMappingKey, direction: Direction) -> Result<StepResult> {
        let target_name = self.union[idx].target.clone();
        let target = match self.targets.get_mut(&target_name) {
            Some(t) => t,
            None => {
                return match direction {
                    Direction::Activate => {
                        warn!(
                            "target '{}' referenced by mapping {:?} is not present, marking as ERROR",
                            target_name, key
                        );
                        self.union[idx].status = MappingStatus::Error;
                        Ok(StepResult::Error)
                    }
                    Direction::Deactivate => {
                        info!(
                            "target '{}' no longer present, short-circuiting deactivation of {:?}",
                            target_name, key
                        );
                        self.union[idx].status = MappingStatus::Deactivated;
                        Ok(StepResult::Done)
                    }
                };
            }
        };

        if !target.request_core() {
            return Ok(StepResult::Wait);
        }

        let container = self.union[idx].container.clone();
        let service = self.union[idx].service.clone();
        let interface = self
            .interface_override
            .unwrap_or(&target.client_interface)
            .to_string();

        let mut envs: Vec<(String, String)> = target
            .container_env(&container)
            .into_iter()
            .filter_map(|kv| {
                let mut parts = kv.splitn(2, '=');
                let k = parts.next()?.to_string();
                let v = parts.next().unwrap_or("").to_string();
                Some((k, v))
            })
            .collect();
        envs.push(("DISNIX_SERVICE".to_string(), service.clone()));

        let args = vec![self
            .services
            .get(&service)
            .map(|s| s.pkg.clone())
            .unwrap_or_default()];

        let dry_run = self.dry_run;
        let verb = direction.verb().to_string();
        let target_key = target.find_target_key().unwrap_or_else(|_| target_name.clone());
        let inv = Invocation::new(&interface, dry_run, target_key, verb, args, envs);
        let fut_key = key;
        let fut: SpawnFuture = Box::pin(async move {
            let result = inv.run().await;
            (fut_key, result)
        });
        self.spawned.push(fut);

        self.union[idx].status = MappingStatus::InProgress;
        Ok(StepResult::InProgress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disnix_definitions::service::InterDependencyMapping;
    use maplit::btreemap;
    use std::collections::BTreeMap;

    fn target(cores: u32) -> Target {
        Target::new(
            "x86_64-linux".into(),
            "true".into(),
            "hostname".into(),
            btreemap! { "hostname".into() => disnix_definitions::PropertyValue::String("t1".into()) },
            BTreeMap::new(),
            cores,
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
    async fn activates_a_simple_dependency_chain_in_order() {
        let mut union = vec![
            ServiceMapping::new("db", "main", "T1"),
            ServiceMapping::new("api", "main", "T1"),
        ];
        union.sort();
        let services = btreemap! {
            "db".to_string() => service("db", vec![]),
            "api".to_string() => service("api", vec![InterDependencyMapping::new("db", "main", "T1")]),
        };
        let mut targets = btreemap! { "T1".to_string() => target(2) };
        let interrupt = Interrupt::new();
        let keys: Vec<_> = union.iter().map(|m| m.key()).collect();

        let ok = run(
            &mut union,
            &keys,
            Direction::Activate,
            &services,
            &mut targets,
            None,
            true,
            &interrupt,
        )
        .await
        .unwrap();

        assert!(ok);
        assert!(union.iter().all(|m| m.status == MappingStatus::Activated));
    }

    #[tokio::test]
    async fn activation_against_missing_target_is_marked_error() {
        let mut union = vec![ServiceMapping::new("api", "main", "Tgone")];
        let services = btreemap! { "api".to_string() => service("api", vec![]) };
        let mut targets: BTreeMap<String, Target> = BTreeMap::new();
        let interrupt = Interrupt::new();
        let keys: Vec<_> = union.iter().map(|m| m.key()).collect();

        let ok = run(
            &mut union,
            &keys,
            Direction::Activate,
            &services,
            &mut targets,
            None,
            true,
            &interrupt,
        )
        .await
        .unwrap();
        assert!(!ok);
        assert_eq!(union[0].status, MappingStatus::Error);
    }

    #[tokio::test]
    async fn deactivation_against_missing_target_short_circuits_to_deactivated() {
        let mut m = ServiceMapping::new("api", "main", "Tgone");
        m.status = MappingStatus::Activated;
        let mut union = vec![m];
        let services = btreemap! { "api".to_string() => service("api", vec![]) };
        let mut targets: BTreeMap<String, Target> = BTreeMap::new();
        let interrupt = Interrupt::new();
        let keys: Vec<_> = union.iter().map(|m| m.key()).collect();

        let ok = run(
            &mut union,
            &keys,
            Direction::Deactivate,
            &services,
            &mut targets,
            None,
            true,
            &interrupt,
        )
        .await
        .unwrap();
        assert!(ok);
        assert_eq!(union[0].status, MappingStatus::Deactivated);
    }

    #[tokio::test]
    async fn core_budget_serializes_mappings_on_a_single_core_target() {
        let mut union = vec![
            ServiceMapping::new("a", "main", "T1"),
            ServiceMapping::new("b", "main", "T1"),
        ];
        union.sort();
        let services = btreemap! {
            "a".to_string() => service("a", vec![]),
            "b".to_string() => service("b", vec![]),
        };
        let mut targets = btreemap! { "T1".to_string() => target(1) };
        let interrupt = Interrupt::new();
        let keys: Vec<_> = union.iter().map(|m| m.key()).collect();

        let ok = run(
            &mut union,
            &keys,
            Direction::Activate,
            &services,
            &mut targets,
            None,
            true,
            &interrupt,
        )
        .await
        .unwrap();
        assert!(ok);
        assert!(union.iter().all(|m| m.status == MappingStatus::Activated));
    }
}
