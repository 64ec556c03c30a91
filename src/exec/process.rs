//! External command execution under admission control.
//!
//! Every conversion tool (ImageMagick, jbig2enc, qpdf) is reached through
//! [`CommandRunner::run`]: acquire a scheduler permit, spawn, register the
//! child's pid for memory accounting, collect stdout. The permit is released
//! on every exit path, and children are killed if the calling task is
//! cancelled, so an aborted build leaves no orphaned converters behind.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, error};

use super::memory::JobScheduler;
use crate::error::BuildError;

/// Runs external commands, one scheduler permit per invocation.
#[derive(Clone)]
pub struct CommandRunner {
    scheduler: JobScheduler,
}

impl CommandRunner {
    pub fn new(scheduler: JobScheduler) -> CommandRunner {
        CommandRunner { scheduler }
    }

    /// Run `argv` to completion and return its standard output.
    ///
    /// Standard error is captured: logged at debug level on success, carried
    /// inside [`BuildError::ExternalToolFailed`] on a non-zero exit. A
    /// program that cannot be spawned at all maps to
    /// [`BuildError::ExternalToolMissing`].
    pub async fn run(&self, argv: &[OsString], cwd: Option<&Path>) -> Result<Vec<u8>, BuildError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| BuildError::InvalidConfig("empty command line".into()))?;

        let mut permit = self.scheduler.acquire().await;
        debug!(command = %display_argv(argv), "running external command");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|err| match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                error!(program = %program.to_string_lossy(), "program not found");
                BuildError::ExternalToolMissing {
                    program: program.to_string_lossy().into_owned(),
                }
            }
            _ => BuildError::io(PathBuf::from(program), err),
        })?;
        if let Some(pid) = child.id() {
            permit.register_process(pid);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| BuildError::io(PathBuf::from(program), err))?;
        drop(permit);

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim_end();
        if !stderr.is_empty() {
            debug!(program = %program.to_string_lossy(), stderr, "external command diagnostics");
        }
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            error!(command = %display_argv(argv), code, "external command failed");
            return Err(BuildError::ExternalToolFailed {
                program: program.to_string_lossy().into_owned(),
                code,
                stderr: stderr.to_string(),
            });
        }
        Ok(output.stdout)
    }
}

fn display_argv(argv: &[OsString]) -> String {
    argv.iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Absolutize a path for use as a command argument.
///
/// Tools are often run with a different working directory than ours, so
/// every path handed to them must be absolute.
pub(crate) fn absolute_arg(path: &Path) -> Result<OsString, BuildError> {
    std::path::absolute(path)
        .map(PathBuf::into_os_string)
        .map_err(|err| BuildError::io(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<OsString> {
        parts.iter().map(OsString::from).collect()
    }

    fn runner() -> CommandRunner {
        CommandRunner::new(JobScheduler::new(2, 1 << 30, 0))
    }

    #[tokio::test]
    async fn captures_stdout_of_a_successful_command() {
        let output = runner().run(&argv(&["echo", "hello"]), None).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output).trim(), "hello");
    }

    #[tokio::test]
    async fn missing_program_is_reported_by_name() {
        let err = runner()
            .run(&argv(&["definitely-not-a-real-tool-4242"]), None)
            .await
            .unwrap_err();
        match err {
            BuildError::ExternalToolMissing { program } => {
                assert_eq!(program, "definitely-not-a-real-tool-4242");
            }
            other => panic!("expected ExternalToolMissing, got: {other}"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_carries_code_and_stderr() {
        let err = runner()
            .run(&argv(&["sh", "-c", "echo oops >&2; exit 3"]), None)
            .await
            .unwrap_err();
        match err {
            BuildError::ExternalToolFailed {
                program,
                code,
                stderr,
            } => {
                assert_eq!(program, "sh");
                assert_eq!(code, 3);
                assert!(stderr.contains("oops"));
            }
            other => panic!("expected ExternalToolFailed, got: {other}"),
        }
    }

    #[tokio::test]
    async fn cwd_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let output = runner()
            .run(&argv(&["sh", "-c", "pwd"]), Some(dir.path()))
            .await
            .unwrap();
        let reported = PathBuf::from(String::from_utf8_lossy(&output).trim().to_string());
        assert_eq!(
            std::fs::canonicalize(&reported).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }
}
