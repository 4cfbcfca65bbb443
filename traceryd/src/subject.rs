//! Subject process management.
//!
//! The front-end spawns the instrumented subject with the probe's
//! environment set, optionally redirecting its output and piping stdin
//! through, and enforces the wall-clock kill timeout.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::process::{Child, Command};
use tracery_wire::{InstMode, ObjectType};

use crate::dispatch::StreamControl;

/// How to launch the subject.
#[derive(Debug, Clone, Default)]
pub struct SubjectSpec {
    /// Program and its arguments.
    pub command: Vec<String>,
    /// Arguments forwarded to the subject VM, ahead of the program's own.
    pub vm_args: Vec<String>,
    /// Exported as `CLASSPATH`.
    pub classpath: Option<String>,
    /// Redirect stdout and stderr here.
    pub output: Option<PathBuf>,
    /// Pass our stdin through instead of closing it.
    pub pipe_stdin: bool,
}

pub struct SubjectProcess {
    child: Child,
}

/// Launch the subject with the probe environment pointing back at us.
pub fn spawn(
    spec: &SubjectSpec,
    port: u16,
    mode: InstMode,
    object_type: ObjectType,
) -> Result<SubjectProcess> {
    let (program, rest) = spec
        .command
        .split_first()
        .context("empty subject command")?;
    let mut cmd = Command::new(program);
    cmd.args(&spec.vm_args);
    cmd.args(rest);
    if let Some(cp) = &spec.classpath {
        cmd.env("CLASSPATH", cp);
    }
    cmd.env("TRACERY_PORT", port.to_string());
    cmd.env("TRACERY_MODE", mode.code().to_string());
    cmd.env("TRACERY_OBJECT_TYPE", object_type.code().to_string());
    cmd.stdin(if spec.pipe_stdin {
        Stdio::inherit()
    } else {
        Stdio::null()
    });
    if let Some(path) = &spec.output {
        let file = std::fs::File::create(path)
            .with_context(|| format!("creating subject output file {}", path.display()))?;
        let for_stderr = file
            .try_clone()
            .context("cloning subject output handle")?;
        cmd.stdout(Stdio::from(file));
        cmd.stderr(Stdio::from(for_stderr));
    }
    cmd.kill_on_drop(true);
    let child = cmd
        .spawn()
        .with_context(|| format!("launching subject {program}"))?;
    info!("subject launched: {}", spec.command.join(" "));
    Ok(SubjectProcess { child })
}

impl SubjectProcess {
    /// Wait for the subject, enforcing the optional wall-clock limit. On
    /// expiry the receive loops are asked to stop and the subject is
    /// killed; a truncated final frame is expected and tolerated upstream.
    /// Returns true when the limit fired.
    pub async fn wait_with_limit(
        mut self,
        limit: Option<Duration>,
        control: &StreamControl,
    ) -> Result<bool> {
        match limit {
            None => {
                let status = self.child.wait().await.context("waiting for subject")?;
                info!("subject exited with {status}");
                Ok(false)
            }
            Some(limit) => match tokio::time::timeout(limit, self.child.wait()).await {
                Ok(status) => {
                    let status = status.context("waiting for subject")?;
                    info!("subject exited with {status}");
                    Ok(false)
                }
                Err(_) => {
                    warn!("time limit of {}s reached, killing subject", limit.as_secs());
                    control.request_stop(0);
                    control.request_stop(1);
                    self.child.kill().await.ok();
                    Ok(true)
                }
            },
        }
    }
}
