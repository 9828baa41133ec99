//! External process execution.
//!
//! Every CLI the kernel talks to (`git`, `trc`) goes through
//! [`run_command`]: argv list, explicit working directory, captured
//! stdout/stderr. The calling process's cwd is never inherited implicitly
//! and never mutated. A non-zero exit is data, not an error; only failing
//! to spawn is.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `program` with `args` in `cwd`, capturing output.
///
/// The child inherits this process's environment unchanged. Output is
/// decoded lossily; the CLIs we drive emit UTF-8.
pub fn run_command(program: &str, args: &[&str], cwd: &Path) -> Result<CommandOutput> {
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|source| ProcessError::Spawn {
            program: program.to_string(),
            source,
        })?;

    Ok(CommandOutput {
        // Signal-terminated processes have no code; report -1 like a shell.
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn captures_stdout_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let out = run_command("sh", &["-c", "echo hello"], dir.path()).unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.stderr.is_empty());
    }

    #[test]
    fn nonzero_exit_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let out = run_command("sh", &["-c", "echo oops >&2; exit 3"], dir.path()).unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn runs_in_requested_cwd() {
        let dir = TempDir::new().unwrap();
        let out = run_command("pwd", &[], dir.path()).unwrap();
        let reported = std::path::PathBuf::from(out.stdout.trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
        // The parent's cwd is untouched.
        assert_ne!(std::env::current_dir().unwrap(), dir.path());
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let dir = TempDir::new().unwrap();
        let result = run_command("definitely-not-a-real-binary-9f2", &[], dir.path());
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }
}
