//! Shell-Out Runner
//!
//! All external commands go through [`CommandRunner`], which decides whether
//! a command needs to enter the host's mount or IPC namespace, whether it
//! runs inside the chroot, and whether sudo is required.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Optional parameters for [`CommandRunner::run`].
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Piped into the child's stdin (a trailing newline is the caller's
    /// responsibility).
    pub stdin: Option<String>,
    /// Do not wrap the command in `chroot .` (for tools like file(1) or
    /// smartctl that may not exist inside the chroot).
    pub no_chroot: bool,
    /// Do not enter host namespaces even for mount/umount/cryptsetup.
    pub no_nsenter: bool,
    /// Suppress failure logging (for commands that are expected to fail,
    /// e.g. trying LUKS keys in order).
    pub skip_log: bool,
}

/// Executes external commands with the namespace and chroot wrapping that
/// the autopilot's deployment requires.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    /// True when a chroot is configured (and is the process's cwd).
    chroot_active: bool,
}

impl CommandRunner {
    pub fn new(chroot_active: bool) -> Self {
        Self { chroot_active }
    }

    /// Run the command and return its stdout. A non-zero exit status is an
    /// error carrying the collected stderr.
    pub async fn run(&self, argv: &[&str], opts: CommandOptions) -> Result<String> {
        let argv = self.assemble(argv, &opts);
        let command_line = argv.join(" ");
        debug!("executing command: {command_line}");

        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if opts.stdin.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command.spawn().map_err(|err| Error::CommandFailed {
            command: command_line.clone(),
            reason: err.to_string(),
        })?;

        if let Some(input) = &opts.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(input.as_bytes()).await;
                // close stdin so the child sees EOF
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| Error::CommandFailed {
                command: command_line.clone(),
                reason: err.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !opts.skip_log {
            for line in stderr.lines().filter(|line| !line.is_empty()) {
                warn!("output from {}: {line}", argv[0]);
            }
        }
        for line in stdout.lines().filter(|line| !line.trim().is_empty()) {
            debug!("exec({command_line}) produced stdout: {line}");
        }

        if output.status.success() {
            Ok(stdout)
        } else {
            let reason = match output.status.code() {
                Some(code) => format!("exit status {code}"),
                None => "killed by signal".to_string(),
            };
            Err(Error::CommandFailed {
                command: command_line,
                reason: match stderr.lines().find(|line| !line.trim().is_empty()) {
                    Some(first_line) => format!("{reason}: {first_line}"),
                    None => reason,
                },
            })
        }
    }

    /// Prepend nsenter/chroot/sudo as required.
    fn assemble(&self, argv: &[&str], opts: &CommandOptions) -> Vec<String> {
        let mut result: Vec<String> = Vec::with_capacity(argv.len() + 6);

        // mount/umount must run in the host mount namespace; cryptsetup
        // additionally needs the host IPC namespace (device-mapper talks to
        // udev)
        if !opts.no_nsenter {
            match argv[0] {
                "mount" | "umount" => {
                    result.extend(
                        ["nsenter", "--mount=/proc/1/ns/mnt", "--"]
                            .iter()
                            .map(|s| s.to_string()),
                    );
                }
                "cryptsetup" => {
                    result.extend(
                        [
                            "nsenter",
                            "--mount=/proc/1/ns/mnt",
                            "--ipc=/proc/1/ns/ipc",
                            "--",
                        ]
                        .iter()
                        .map(|s| s.to_string()),
                    );
                }
                _ => {}
            }
        }

        // cwd is the chroot directory, so `chroot .` enters it
        if !opts.no_chroot && self.chroot_active {
            result.extend(["chroot", "."].iter().map(|s| s.to_string()));
        }

        // become root if necessary (useful for development mode)
        if unsafe { libc::geteuid() } != 0 {
            result.push("sudo".to_string());
        }

        result.extend(argv.iter().map(|s| s.to_string()));
        result
    }
}
