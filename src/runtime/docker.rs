use async_trait::async_trait;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::fs::File;
use tokio::process::Command;
use tracing::debug;

use super::{ContainerRuntime, UnitSpec, UnitState};
use crate::error::{Error, Result};

/// [`ContainerRuntime`] backed by the `docker` command-line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, args: &[&str]) -> Result<Output> {
        debug!(binary = %self.binary, ?args, "docker");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Runtime(format!("Failed to execute {}: {}", self.binary, e)))
    }
}

/// Builds the argument list for `docker run`.
pub(crate) fn run_args(spec: &UnitSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];
    if spec.tty {
        args.push("-t".to_string());
    }
    for mount in &spec.mounts {
        args.push("-v".to_string());
        args.push(mount.to_volume_arg());
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Parses `docker inspect --format '{{.State.Status}} {{.State.ExitCode}}'`.
pub(crate) fn parse_state(line: &str) -> Option<UnitState> {
    let mut parts = line.split_whitespace();
    let status = parts.next()?;
    let exit_code = parts.next().and_then(|c| c.parse::<i64>().ok()).unwrap_or(0);

    match status {
        "created" => Some(UnitState::Created),
        "running" | "restarting" | "paused" | "removing" => Some(UnitState::Running),
        "exited" | "dead" => Some(UnitState::Exited { exit_code }),
        _ => None,
    }
}

fn is_no_such(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ping(&self) -> Result<()> {
        let output = self
            .exec(&["version", "--format", "{{.Server.Version}}"])
            .await?;
        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "Docker daemon unreachable: {}",
                stderr_of(&output)
            )));
        }
        Ok(())
    }

    async fn run(&self, spec: &UnitSpec) -> Result<()> {
        let args = run_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.exec(&args).await?;
        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "Failed to start {}: {}",
                spec.name,
                stderr_of(&output)
            )));
        }
        Ok(())
    }

    async fn capture_logs(&self, name: &str, dest: &Path) -> Result<()> {
        let file = File::create(dest).await?;
        let stderr = file.try_clone().await?.into_std().await;
        let stdout = file.into_std().await;

        let status = Command::new(&self.binary)
            .args(["logs", "-f", name])
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .status()
            .await
            .map_err(|e| Error::Runtime(format!("Failed to follow logs of {}: {}", name, e)))?;

        if !status.success() {
            return Err(Error::Runtime(format!(
                "Log capture for {} exited with {}",
                name, status
            )));
        }
        Ok(())
    }

    async fn wait(&self, name: &str) -> Result<i64> {
        let output = self.exec(&["wait", name]).await?;
        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "Failed to wait for {}: {}",
                name,
                stderr_of(&output)
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<i64>()
            .map_err(|_| Error::Runtime(format!("Unexpected wait output for {}: {}", name, stdout.trim())))
    }

    async fn inspect(&self, name: &str) -> Result<UnitState> {
        let output = self
            .exec(&[
                "inspect",
                "--type",
                "container",
                "--format",
                "{{.State.Status}} {{.State.ExitCode}}",
                name,
            ])
            .await?;

        if !output.status.success() {
            let stderr = stderr_of(&output);
            if is_no_such(&stderr) {
                return Ok(UnitState::Absent);
            }
            return Err(Error::Runtime(format!("Failed to inspect {}: {}", name, stderr)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_state(stdout.trim())
            .ok_or_else(|| Error::Runtime(format!("Unknown state for {}: {}", name, stdout.trim())))
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let output = self.exec(&["rm", "-f", name]).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if is_no_such(&stderr) {
                return Ok(());
            }
            return Err(Error::Runtime(format!("Failed to remove {}: {}", name, stderr)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Mount;

    #[tokio::test]
    async fn test_capture_logs_streams_into_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("unit.log");
        // `echo` stands in for the client and prints its arguments.
        let cli = DockerCli::new("echo");

        cli.capture_logs("vol3-abc-windows.info.Info", &dest).await.unwrap();
        let captured = std::fs::read_to_string(&dest).unwrap();
        assert_eq!(captured, "logs -f vol3-abc-windows.info.Info\n");
    }

    #[test]
    fn test_run_args() {
        let spec = UnitSpec {
            name: "vol3-abc-windows.info.Info".to_string(),
            image: "sp00kyskelet0n/volatility3".to_string(),
            command: vec!["vol".to_string(), "-q".to_string()],
            mounts: vec![Mount::ro("/dumps", "/dump_dir")],
            tty: true,
        };

        assert_eq!(
            run_args(&spec),
            vec![
                "run",
                "-d",
                "--name",
                "vol3-abc-windows.info.Info",
                "-t",
                "-v",
                "/dumps:/dump_dir:ro",
                "sp00kyskelet0n/volatility3",
                "vol",
                "-q",
            ]
        );
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state("created 0"), Some(UnitState::Created));
        assert_eq!(parse_state("running 0"), Some(UnitState::Running));
        assert_eq!(
            parse_state("exited 137"),
            Some(UnitState::Exited { exit_code: 137 })
        );
        assert_eq!(
            parse_state("dead 1"),
            Some(UnitState::Exited { exit_code: 1 })
        );
        assert_eq!(parse_state("bogus 0"), None);
        assert_eq!(parse_state(""), None);
    }

    #[test]
    fn test_no_such_detection() {
        assert!(is_no_such("Error: No such container: vol3-x"));
        assert!(is_no_such("Error: No such object: vol3-x"));
        assert!(!is_no_such("permission denied"));
    }
}
