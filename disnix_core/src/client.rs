//! Invokes a target's client-interface command for a single verb (§6).
//!
//! Grounded on `shipcat_cli::kubectl`'s `kexec`/`kout` pair: build a
//! `tokio::process::Command`, await its completion, log non-zero exits as
//! warnings and surface them to the caller as a typed error rather than a
//! bare `bool`. A dry run swaps the real command for a harmless one instead
//! of branching inside every call site (§9 design note: the "dummy spawn"
//! plan lives in exactly one place).

use tokio::process::Command;

use crate::{ErrorKind, Result};

/// One verb invocation against one target, built and awaited by the caller.
pub struct Invocation {
    target_key: String,
    verb: String,
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(
        interface: &str,
        dry_run: bool,
        target_key: impl Into<String>,
        verb: impl Into<String>,
        args: Vec<String>,
        envs: Vec<(String, String)>,
    ) -> Self {
        let verb = verb.into();
        if dry_run {
            Invocation {
                target_key: target_key.into(),
                verb,
                program: "true".to_string(),
                args: Vec::new(),
                envs,
            }
        } else {
            Invocation {
                target_key: target_key.into(),
                verb,
                program: interface.to_string(),
                args,
                envs,
            }
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        if self.program != "true" {
            cmd.arg("--target").arg(&self.target_key).arg(&self.verb);
            cmd.args(&self.args);
        }
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd
    }

    /// Runs the command to completion, returning `Ok(())` on a zero exit and
    /// a `SubprocessError` otherwise.
    pub async fn run(self) -> Result<()> {
        debug!("[{}] {} {}", self.target_key, self.verb, self.args.join(" "));
        let status = self.command().status().await?;
        if status.success() {
            Ok(())
        } else {
            let detail = format!("exit code {}", status.code().unwrap_or(-1));
            warn!("[{}] {} failed: {}", self.target_key, self.verb, detail);
            Err(ErrorKind::SubprocessError(self.verb, self.target_key, detail).into())
        }
    }

    /// Runs the command to completion, returning its stdout split into
    /// non-empty lines. Used by verbs that report back a set of identifiers
    /// (e.g. which snapshot generations exist on a target).
    pub async fn run_capture(self) -> Result<Vec<String>> {
        debug!("[{}] {} {} (capturing output)", self.target_key, self.verb, self.args.join(" "));
        let output = self.command().output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("[{}] {} failed: {}", self.target_key, self.verb, stderr);
            return Err(ErrorKind::SubprocessError(self.verb, self.target_key, stderr).into());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_invocation_swaps_in_a_no_op_program() {
        let inv = Invocation::new(
            "disnix-ssh-client",
            true,
            "host1",
            "activate",
            vec!["/nix/store/xxx".into()],
            vec![],
        );
        assert_eq!(inv.program, "true");
        assert!(inv.args.is_empty());
    }

    #[test]
    fn real_invocation_keeps_interface_and_args() {
        let inv = Invocation::new(
            "disnix-ssh-client",
            false,
            "host1",
            "activate",
            vec!["/nix/store/xxx".into()],
            vec![("key".into(), "val".into())],
        );
        assert_eq!(inv.program, "disnix-ssh-client");
        assert_eq!(inv.args, vec!["/nix/store/xxx".to_string()]);
        assert_eq!(inv.envs, vec![("key".to_string(), "val".to_string())]);
    }
}
