//! System boundary
//!
//! Everything that touches the host (nft, iproute2, init scripts, the
//! tunnel engine binary) goes through the [`Shell`] trait, so the
//! classifier, router and orchestrator stay testable without root.

use std::process::Command;
use std::sync::Mutex;

use log::{debug, warn};

use crate::error::{AppError, Result};
use crate::utils::version::extract_version;

/// Outcome of one external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Minimal process-spawning seam.
pub trait Shell: Send + Sync {
    /// Run and report the outcome without treating failure as an error.
    fn try_run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run and fail on a non-zero exit status.
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let out = self.try_run(program, args)?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(AppError::Supervisor(format!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                out.stderr.trim()
            )))
        }
    }
}

/// Real implementation over `std::process::Command`.
pub struct SystemShell;

impl Shell for SystemShell {
    fn try_run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!("exec: {} {}", program, args.join(" "));
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Scripted fake for tests: records every invocation and replays
/// canned outputs keyed by `program arg0 arg1 ...` prefix match.
pub struct ScriptedShell {
    pub calls: Mutex<Vec<String>>,
    responses: Vec<(String, CommandOutput)>,
    /// Outcome for commands with no scripted response.
    default_success: bool,
}

impl ScriptedShell {
    pub fn new() -> ScriptedShell {
        ScriptedShell {
            calls: Mutex::new(Vec::new()),
            responses: Vec::new(),
            default_success: true,
        }
    }

    pub fn failing_by_default() -> ScriptedShell {
        ScriptedShell {
            default_success: false,
            ..ScriptedShell::new()
        }
    }

    pub fn respond(mut self, prefix: &str, success: bool, stdout: &str) -> ScriptedShell {
        self.responses.push((
            prefix.to_string(),
            CommandOutput {
                success,
                stdout: stdout.to_string(),
                stderr: if success { String::new() } else { "scripted failure".to_string() },
            },
        ));
        self
    }

    pub fn recorded(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for ScriptedShell {
    fn default() -> Self {
        ScriptedShell::new()
    }
}

impl Shell for ScriptedShell {
    fn try_run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let line = format!("{} {}", program, args.join(" "));
        self.calls.lock().unwrap().push(line.clone());
        for (prefix, out) in &self.responses {
            if line.starts_with(prefix.as_str()) {
                return Ok(out.clone());
            }
        }
        Ok(CommandOutput {
            success: self.default_success,
            stdout: String::new(),
            stderr: if self.default_success {
                String::new()
            } else {
                "unscripted command".to_string()
            },
        })
    }
}

/// Init-script and interface plumbing for the tunnel engine and the
/// resolver.
pub struct ProcessSupervisor<'a> {
    shell: &'a dyn Shell,
}

impl<'a> ProcessSupervisor<'a> {
    pub fn new(shell: &'a dyn Shell) -> ProcessSupervisor<'a> {
        ProcessSupervisor { shell }
    }

    pub fn restart_engine(&self) -> Result<()> {
        self.shell
            .run("/etc/init.d/sing-box", &["restart"])
            .map_err(|e| AppError::Supervisor(format!("engine restart: {}", e)))?;
        Ok(())
    }

    pub fn restart_resolver(&self) -> Result<()> {
        self.shell
            .run("/etc/init.d/dnsmasq", &["restart"])
            .map_err(|e| AppError::Supervisor(format!("resolver restart: {}", e)))?;
        Ok(())
    }

    pub fn engine_running(&self) -> bool {
        matches!(
            self.shell.try_run("pidof", &["sing-box"]),
            Ok(out) if out.success && !out.stdout.trim().is_empty()
        )
    }

    pub fn interface_exists(&self, name: &str) -> bool {
        matches!(
            self.shell.try_run("ip", &["link", "show", name]),
            Ok(out) if out.success
        )
    }

    /// Installed engine version, if the binary answers.
    pub fn engine_version(&self) -> Option<String> {
        match self.shell.try_run("sing-box", &["version"]) {
            Ok(out) if out.success => {
                let v = extract_version(&out.stdout);
                if v.is_none() {
                    warn!("could not parse engine version from: {}", out.stdout.trim());
                }
                v
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_fails_on_nonzero_status() {
        let shell = ScriptedShell::new().respond("false", false, "");
        assert!(shell.run("false", &[]).is_err());
    }

    #[test]
    fn engine_version_parses_banner() {
        let shell =
            ScriptedShell::new().respond("sing-box version", true, "sing-box version 1.11.3\n");
        let sup = ProcessSupervisor::new(&shell);
        assert_eq!(sup.engine_version().as_deref(), Some("1.11.3"));
    }

    #[test]
    fn engine_running_needs_a_pid() {
        let shell = ScriptedShell::new().respond("pidof sing-box", true, "1234\n");
        assert!(ProcessSupervisor::new(&shell).engine_running());

        let shell = ScriptedShell::new().respond("pidof sing-box", false, "");
        assert!(!ProcessSupervisor::new(&shell).engine_running());
    }

    #[test]
    fn calls_are_recorded_in_order() {
        let shell = ScriptedShell::new();
        let sup = ProcessSupervisor::new(&shell);
        let _ = sup.restart_resolver();
        let _ = sup.restart_engine();
        assert_eq!(
            shell.recorded(),
            vec![
                "/etc/init.d/dnsmasq restart".to_string(),
                "/etc/init.d/sing-box restart".to_string(),
            ]
        );
    }
}
