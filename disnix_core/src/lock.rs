//! The distributed locking phase (C8): acquires an advisory lock on every
//! target before a transition, releasing whatever was acquired if any one
//! lock fails or SIGINT fires during the wait.
//!
//! Grounded on `src/activate/locking.c`'s `lock`/`unlock`, which fan out one
//! lock (resp. unlock) subprocess per target and collect
//! results; unlike the scheduler (C5) there is no dependency order here, so
//! a plain `futures::future::join_all` over per-target futures is enough --
//! no per-target core budget applies either, since this is a negligible-cost
//! control-plane call per §5.

use std::collections::BTreeMap;

use disnix_definitions::target::Target;

use crate::client::Invocation;
use crate::signal::Interrupt;
use crate::Result;

fn target_key_of(key: &str, target: &Target) -> String {
    target.find_target_key().unwrap_or_else(|_| key.to_string())
}

async fn run_verb_on_targets(
    keys: &[String],
    targets: &BTreeMap<String, Target>,
    verb: &str,
    profile: &str,
    interface_override: Option<&str>,
    dry_run: bool,
) -> Vec<(String, Result<()>)> {
    let mut handles = Vec::new();
    for key in keys {
        let target = match targets.get(key) {
            Some(t) => t,
            None => continue,
        };
        let iface = interface_override.unwrap_or(&target.client_interface).to_string();
        let tk = target_key_of(key, target);
        let profile = profile.to_string();
        let verb = verb.to_string();
        handles.push(async move {
            let inv = Invocation::new(&iface, dry_run, tk.clone(), verb, vec![profile], vec![]);
            (tk, inv.run().await)
        });
    }
    futures::future::join_all(handles).await
}

/// Acquires a lock on every target. On any failure -- or if `interrupt` was
/// set by the time every lock subprocess has been reaped -- unlocks whatever
/// was successfully acquired and returns `Ok(false)`.
pub async fn lock(
    targets: &BTreeMap<String, Target>,
    profile: &str,
    interface_override: Option<&str>,
    dry_run: bool,
    interrupt: &Interrupt,
) -> Result<bool> {
    let all_keys: Vec<String> = targets.keys().cloned().collect();
    info!("lock phase: acquiring locks on {} target(s)", all_keys.len());

    let results = run_verb_on_targets(&all_keys, targets, "lock", profile, interface_override, dry_run).await;

    let mut acquired = Vec::new();
    let mut all_ok = true;
    for (key, r) in results {
        match r {
            Ok(()) => acquired.push(key),
            Err(e) => {
                warn!("[{}]: failed to acquire lock: {}", key, e);
                all_ok = false;
            }
        }
    }
    if interrupt.is_set() {
        warn!("interrupted during lock phase");
        all_ok = false;
    }

    if !all_ok {
        warn!("lock phase failed, releasing {} lock(s) already acquired", acquired.len());
        let _ = run_verb_on_targets(&acquired, targets, "unlock", profile, interface_override, dry_run).await;
        return Ok(false);
    }

    info!("lock phase: all locks acquired");
    Ok(true)
}

/// Best-effort unlock of every target. Failures are logged and reflected in
/// the aggregate return value, but every target is still attempted.
pub async fn unlock(
    targets: &BTreeMap<String, Target>,
    profile: &str,
    interface_override: Option<&str>,
    dry_run: bool,
) -> Result<bool> {
    let all_keys: Vec<String> = targets.keys().cloned().collect();
    info!("unlocking {} target(s)", all_keys.len());
    let results = run_verb_on_targets(&all_keys, targets, "unlock", profile, interface_override, dry_run).await;
    let mut ok = true;
    for (key, r) in results {
        if let Err(e) = r {
            warn!("[{}]: failed to release lock: {}", key, e);
            ok = false;
        }
    }
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use disnix_definitions::PropertyValue;
    use maplit::btreemap;

    fn target() -> Target {
        Target::new(
            "x86_64-linux".into(),
            "true".into(),
            "hostname".into(),
            btreemap! { "hostname".into() => PropertyValue::String("t1".into()) },
            BTreeMap::new(),
            1,
        )
    }

    #[tokio::test]
    async fn lock_succeeds_in_dry_run_across_all_targets() {
        let targets = btreemap! { "T1".to_string() => target(), "T2".to_string() => target() };
        let interrupt = Interrupt::new();
        let ok = lock(&targets, "default", None, true, &interrupt).await.unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn lock_fails_when_interrupted() {
        let targets = btreemap! { "T1".to_string() => target() };
        let interrupt = Interrupt::new();
        interrupt.trip();
        let ok = lock(&targets, "default", None, true, &interrupt).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn unlock_is_best_effort_across_all_targets() {
        let targets = btreemap! { "T1".to_string() => target() };
        let ok = unlock(&targets, "default", None, true).await.unwrap();
        assert!(ok);
    }
}
