//! Docker compose workload driven over ssh.
//!
//! Every operation renders a small bash script and pipes it to `ssh <host> bash -s`.
//! The compose project is named after the stack, so `stop` can address it
//! without the start-time configuration.
use crate::inventory::{WorkloadConfig, WorkloadTarget};
use crate::{TransientError, WorkloadRuntime};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Single-quote a value for bash.
pub fn sh_escape_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// Keep the last `max_chars` characters.
pub fn tail_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().rev().take(max_chars).collect::<String>().chars().rev().collect()
}

#[derive(Clone, Debug)]
pub struct SshComposeWorkload {
    pub user: String,
    pub key_path: Option<String>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Directory on the host holding the compose file and env file.
    pub remote_dir: String,
}

impl SshComposeWorkload {
    pub fn new(user: &str, key_path: Option<String>, remote_dir: &str) -> Self {
        Self {
            user: user.to_string(),
            key_path,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(300),
            remote_dir: remote_dir.to_string(),
        }
    }

    fn destination(&self, target: &WorkloadTarget) -> Result<String> {
        let address = target
            .address
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .with_context(|| format!("{} has no reachable address", target.resource_id))?;
        Ok(format!("{}@{}", self.user, address))
    }

    async fn run_script(&self, target: &WorkloadTarget, script: &str, timeout: Duration) -> Result<String> {
        let destination = self.destination(target)?;
        let mut cmd = Command::new("ssh");
        if let Some(key) = &self.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg(&destination)
            .arg("bash -s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("ssh spawn failed for {}", destination))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
        }

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(res) => res.with_context(|| format!("ssh wait failed for {}", destination))?,
            Err(_) => {
                return Err(TransientError(format!(
                    "ssh to {} timed out after {}s",
                    destination,
                    timeout.as_secs()
                ))
                .into())
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        tracing::debug!(
            "[ssh] {} exited {} after {}ms",
            destination,
            output.status,
            started.elapsed().as_millis()
        );
        if !output.status.success() {
            // 255 is ssh's own failure (unreachable host, refused connection)
            if output.status.code() == Some(255) {
                return Err(TransientError(format!(
                    "ssh to {} failed: {}",
                    destination,
                    tail_str(&stderr, 2000)
                ))
                .into());
            }
            anyhow::bail!(
                "remote script failed on {} (exit={}): {}",
                destination,
                output.status,
                tail_str(&stderr, 2000)
            );
        }
        Ok(stdout)
    }
}

/// Script merging the workload environment into `.env` and bringing the
/// compose project up. Keys already in the file (the bootstrap writes some)
/// survive unless the workload sets them again.
pub fn render_start_script(remote_dir: &str, project: &str, config: &WorkloadConfig) -> String {
    let mut script = String::from("set -euo pipefail\n");
    script.push_str(&format!("mkdir -p {dir}\ncd {dir}\n", dir = sh_escape_single(remote_dir)));
    script.push_str("touch .env\n");
    for (key, value) in &config.environment {
        let key = sh_escape_single(key);
        script.push_str(&format!(
            "awk -v k={} 'index($0, k \"=\") != 1' .env > .env.tmp && mv .env.tmp .env\n",
            key
        ));
        script.push_str(&format!(
            "printf '%s=%s\\n' {} {} >> .env\n",
            key,
            sh_escape_single(value)
        ));
    }
    script.push_str(&format!(
        "docker compose -f {} -p {} --env-file .env up -d\n",
        sh_escape_single(&config.compose_file),
        sh_escape_single(project)
    ));
    script
}

pub fn render_stop_script(project: &str, grace_period: Duration) -> String {
    format!(
        "set -uo pipefail\ndocker compose -p {} stop -t {}\n",
        sh_escape_single(project),
        grace_period.as_secs()
    )
}

pub fn render_unmount_script(mount_points: &[String]) -> String {
    let mut script = String::from("set -uo pipefail\nsync\n");
    for mp in mount_points {
        script.push_str(&format!(
            "if mountpoint -q {mp}; then sudo umount -l {mp} || true; fi\n",
            mp = sh_escape_single(mp)
        ));
    }
    script
}

/// `shutdown` takes whole minutes; anything under a minute rounds up to one.
pub fn render_shutdown_script(delay: Duration) -> String {
    let minutes = delay.as_secs().div_ceil(60).max(1);
    format!("sudo shutdown -h +{}\n", minutes)
}

#[derive(Clone, Debug)]
pub struct SshComposeRuntime {
    pub ssh: SshComposeWorkload,
    /// Mount points unmounted before shutdown.
    pub mount_points: Vec<String>,
}

#[async_trait]
impl WorkloadRuntime for SshComposeRuntime {
    async fn start(&self, target: &WorkloadTarget, config: &WorkloadConfig) -> Result<()> {
        let project = if config.project_name.is_empty() {
            target.stack_name.as_str()
        } else {
            config.project_name.as_str()
        };
        let script = render_start_script(&self.ssh.remote_dir, project, config);
        self.ssh
            .run_script(target, &script, self.ssh.command_timeout)
            .await
            .context("docker compose up")?;
        Ok(())
    }

    async fn stop(&self, target: &WorkloadTarget, grace_period: Duration) -> Result<()> {
        let script = render_stop_script(&target.stack_name, grace_period);
        // the remote stop honors the grace period itself; leave room for the ssh round trip
        let bound = grace_period + self.ssh.connect_timeout;
        self.ssh.run_script(target, &script, bound).await?;
        Ok(())
    }

    async fn unmount_storage(&self, target: &WorkloadTarget) -> Result<()> {
        if self.mount_points.is_empty() {
            return Ok(());
        }
        let script = render_unmount_script(&self.mount_points);
        self.ssh
            .run_script(target, &script, self.ssh.connect_timeout * 3)
            .await?;
        Ok(())
    }

    async fn schedule_host_shutdown(&self, target: &WorkloadTarget, delay: Duration) -> Result<()> {
        let script = render_shutdown_script(delay);
        self.ssh
            .run_script(target, &script, self.ssh.connect_timeout * 3)
            .await?;
        Ok(())
    }
}
