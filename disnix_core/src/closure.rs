//! Closure transfer helpers (C11): pushes or pulls a Nix closure between the
//! coordinator and a target, transferring only what the other side is
//! actually missing.
//!
//! Grounded on `src/libpkgmgmt/copy-closure.c`'s `copy_closure_to`/
//! `copy_closure_from` pair: query requisites, diff against what the far
//! side already has, export the
//! difference to a temp file, then `import` it. Temp files use the
//! `tempfile` crate (used the same way across this example pack, e.g.
//! `emilengler-arti`'s `tor-persist` state files) so cleanup happens on
//! every exit path, including an early error return.

use tempfile::NamedTempFile;
use tokio::process::Command;

use crate::client::Invocation;
use crate::{ErrorKind, Result};

async fn local_requisites(paths: &[String]) -> Result<Vec<String>> {
    let output = Command::new("nix-store").arg("--query").arg("--requisites").args(paths).output().await?;
    if !output.status.success() {
        return Err(ErrorKind::SubprocessError(
            "query-requisites".into(),
            "coordinator".into(),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect())
}

/// Pushes `paths`'s closure from the coordinator to `target`. Queries local
/// requisites, asks the target which of those it's missing via
/// `print-invalid`, exports only the missing set to a temp file, then has
/// the target `import` it.
pub async fn copy_closure_to(interface: &str, target_key: &str, paths: &[String], dry_run: bool) -> Result<()> {
    let requisites = local_requisites(paths).await?;

    let missing = Invocation::new(
        interface,
        dry_run,
        target_key,
        "print-invalid",
        requisites.clone(),
        vec![],
    )
    .run_capture()
    .await?;

    if missing.is_empty() {
        debug!("[{}]: target already has every requisite, nothing to export", target_key);
        return Ok(());
    }

    let tmp = NamedTempFile::new().map_err(|e| {
        ErrorKind::SubprocessError("export".into(), target_key.to_string(), format!("cannot create temp file: {}", e))
    })?;
    export_to_file(&missing, tmp.path(), target_key).await?;

    Invocation::new(
        interface,
        dry_run,
        target_key,
        "import",
        vec!["--localfile".into(), tmp.path().display().to_string()],
        vec![],
    )
    .run()
    .await
    // `tmp` is dropped (and removed) here regardless of the outcome above.
}

/// Mirror of `copy_closure_to`: pulls `paths`'s closure from `target` onto
/// the coordinator.
pub async fn copy_closure_from(interface: &str, target_key: &str, paths: &[String], dry_run: bool) -> Result<()> {
    let remote_requisites = Invocation::new(
        interface,
        dry_run,
        target_key,
        "query-requisites",
        paths.to_vec(),
        vec![],
    )
    .run_capture()
    .await?;

    let local_valid = local_requisites(&remote_requisites).await.unwrap_or_default();
    let missing: Vec<String> = remote_requisites
        .into_iter()
        .filter(|p| !local_valid.contains(p))
        .collect();

    if missing.is_empty() {
        debug!("[{}]: coordinator already has every requisite, nothing to import", target_key);
        return Ok(());
    }

    let tmp = NamedTempFile::new().map_err(|e| {
        ErrorKind::SubprocessError("export".into(), target_key.to_string(), format!("cannot create temp file: {}", e))
    })?;

    Invocation::new(
        interface,
        dry_run,
        target_key,
        "export",
        vec!["--remotefile".into(), tmp.path().display().to_string()],
        vec![],
    )
    .run()
    .await?;

    let status = Command::new("nix-store")
        .arg("--import")
        .arg(tmp.path())
        .status()
        .await?;
    if !status.success() {
        return Err(ErrorKind::SubprocessError(
            "import".into(),
            "coordinator".into(),
            format!("exit code {}", status.code().unwrap_or(-1)),
        )
        .into());
    }
    Ok(())
}

async fn export_to_file(paths: &[String], dest: &std::path::Path, target_key: &str) -> Result<()> {
    let output = Command::new("nix-store").arg("--export").args(paths).output().await?;
    if !output.status.success() {
        return Err(ErrorKind::SubprocessError(
            "export".into(),
            target_key.to_string(),
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        )
        .into());
    }
    tokio::fs::write(dest, output.stdout).await?;
    Ok(())
}
