//! Docker CLI backend

use super::{BuildRequest, ContainerRuntime, LaunchSpec, RunningProcess};
use crate::error::{Result, TandemError};
use crate::service::MountSource;
use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Runs services as containers through the `docker` CLI
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    /// Path or name of the docker binary
    bin: String,
}

impl DockerRuntime {
    /// Create a backend that invokes `bin`
    pub fn new(bin: &str) -> Self {
        Self {
            bin: bin.to_string(),
        }
    }

    /// Run a docker subcommand to completion
    async fn run(&self, args: &[String]) -> Result<Output> {
        tracing::debug!("{} {}", self.bin, args.join(" "));
        Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TandemError::Runtime(format!("Failed to run {}: {}", self.bin, e)))
    }

    /// Arguments for `docker run`
    pub fn run_args(spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            spec.container_name.clone(),
            "--network".to_string(),
            spec.network.clone(),
        ];

        for alias in &spec.aliases {
            args.push("--network-alias".to_string());
            args.push(alias.clone());
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for mount in &spec.mounts {
            let source = match &mount.source {
                MountSource::HostPath(path) => path.display().to_string(),
                MountSource::Named(name) => name.clone(),
            };
            let mut volume = format!("{}:{}", source, mount.target);
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push("-v".to_string());
            args.push(volume);
        }
        for port in &spec.ports {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image.clone());
        if let Some(command) = &spec.command {
            args.extend(command.iter().cloned());
        }
        args
    }

    /// Arguments for `docker build`
    pub fn build_args(request: &BuildRequest) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "-t".to_string(),
            request.tag.clone(),
            "-f".to_string(),
            request.recipe.display().to_string(),
        ];
        for (key, value) in &request.args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &request.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(request.context.display().to_string());
        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn prepare(&self, network: &str) -> Result<()> {
        let output = self
            .run(&["network".to_string(), "create".to_string(), network.to_string()])
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            tracing::info!("Created network {}", network);
        } else if stderr.contains("already exists") {
            tracing::debug!("Network {} already exists", network);
        } else {
            return Err(TandemError::Runtime(format!(
                "Failed to create network {}: {}",
                network,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn build(&self, request: &BuildRequest) -> Result<()> {
        tracing::info!("Building {} from {}", request.tag, request.context.display());
        let output = self.run(&Self::build_args(request)).await?;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            tracing::debug!(service = %request.service, "{}", line);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            return Err(TandemError::Build {
                service: request.service.clone(),
                message: tail.into_iter().rev().collect::<Vec<_>>().join("\n"),
            });
        }
        Ok(())
    }

    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn RunningProcess>> {
        let mut child = Command::new(&self.bin)
            .args(Self::run_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TandemError::Spawn {
                service: spec.service.clone(),
                message: e.to_string(),
            })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(spec.service.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(spec.service.clone(), stderr);
        }

        Ok(Box::new(DockerProcess {
            id: spec.container_name.clone(),
            bin: self.bin.clone(),
            child,
        }))
    }

    async fn remove(&self, container_name: &str) -> Result<()> {
        let output = self
            .run(&["rm".to_string(), "-f".to_string(), container_name.to_string()])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("No such container") {
                return Err(TandemError::Runtime(format!(
                    "Failed to remove {}: {}",
                    container_name,
                    stderr.trim()
                )));
            }
        }
        Ok(())
    }

    async fn teardown(&self, network: &str) -> Result<()> {
        let output = self
            .run(&["network".to_string(), "rm".to_string(), network.to_string()])
            .await?;
        if output.status.success() {
            tracing::info!("Removed network {}", network);
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("not found") {
                tracing::warn!("Failed to remove network {}: {}", network, stderr.trim());
            }
        }
        Ok(())
    }
}

/// Re-emit each line a process writes as a tracing event
fn forward_output<R>(service: String, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(service = %service, "{}", line);
        }
    });
}

/// Attached `docker run` client process
struct DockerProcess {
    id: String,
    bin: String,
    child: Child,
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[async_trait]
impl RunningProcess for DockerProcess {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| TandemError::Runtime(format!("Failed to wait for {}: {}", self.id, e)))?;
        Ok(exit_code(status))
    }

    async fn terminate(&mut self, grace: Duration) -> Result<i32> {
        // The attached client proxies SIGTERM to the container.
        if let Some(pid) = self.child.id() {
            let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if ret != 0 {
                tracing::debug!(
                    "SIGTERM to {} failed: {}",
                    self.id,
                    std::io::Error::last_os_error()
                );
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status.map_err(|e| {
                    TandemError::Runtime(format!("Failed to wait for {}: {}", self.id, e))
                })?;
                Ok(exit_code(status))
            }
            Err(_) => {
                tracing::warn!("{} did not stop within {:?}, killing", self.id, grace);
                match Command::new(&self.bin)
                    .args(["rm", "-f", self.id.as_str()])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await
                {
                    Ok(status) if status.success() => {}
                    Ok(status) => tracing::warn!("{} rm -f {} exited with {}", self.bin, self.id, status),
                    Err(e) => tracing::warn!("Failed to run {} rm -f {}: {}", self.bin, self.id, e),
                }
                self.child
                    .kill()
                    .await
                    .map_err(|e| TandemError::Runtime(format!("Failed to kill {}: {}", self.id, e)))?;
                Ok(128 + libc::SIGKILL)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{MountBinding, PortBinding};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn spec() -> LaunchSpec {
        let mut env = BTreeMap::new();
        env.insert("GOOGLE_CLOUD_PROJECT".to_string(), "analytics-demo".to_string());
        let mut labels = BTreeMap::new();
        labels.insert("tandem.service".to_string(), "ga4_server".to_string());

        LaunchSpec {
            service: "ga4_server".to_string(),
            container_name: "ga4_server".to_string(),
            image: "demo-ga4_server:latest".to_string(),
            command: Some(vec!["python".to_string(), "main.py".to_string()]),
            env,
            mounts: vec![MountBinding {
                source: MountSource::HostPath(PathBuf::from("/home/op/.config/gcloud")),
                target: "/root/.config/gcloud".to_string(),
                read_only: true,
            }],
            ports: vec![PortBinding::new(8002, 8002)],
            network: "demo_default".to_string(),
            aliases: vec!["ga4_server".to_string()],
            labels,
        }
    }

    #[test]
    fn test_run_args() {
        let args = DockerRuntime::run_args(&spec());
        let joined = args.join(" ");
        assert!(joined.starts_with("run --rm --name ga4_server --network demo_default"));
        assert!(joined.contains("--network-alias ga4_server"));
        assert!(joined.contains("-e GOOGLE_CLOUD_PROJECT=analytics-demo"));
        assert!(joined.contains("-v /home/op/.config/gcloud:/root/.config/gcloud:ro"));
        assert!(joined.contains("-p 8002:8002"));
        assert!(joined.contains("--label tandem.service=ga4_server"));
        assert!(joined.ends_with("demo-ga4_server:latest python main.py"));
    }

    #[test]
    fn test_build_args() {
        let mut args = BTreeMap::new();
        args.insert("PY".to_string(), "3.11".to_string());
        let request = BuildRequest {
            service: "hostclient".to_string(),
            context: PathBuf::from("/srv/demo/client"),
            recipe: PathBuf::from("/srv/demo/client/Dockerfile"),
            tag: "demo-hostclient:latest".to_string(),
            args,
            labels: BTreeMap::new(),
        };
        assert_eq!(
            DockerRuntime::build_args(&request),
            vec![
                "build",
                "-t",
                "demo-hostclient:latest",
                "-f",
                "/srv/demo/client/Dockerfile",
                "--build-arg",
                "PY=3.11",
                "/srv/demo/client",
            ]
        );
    }

    #[test]
    fn test_exit_code_from_signal() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGTERM)), 128 + libc::SIGTERM);
    }

    #[tokio::test]
    async fn test_terminate_kills_when_grace_expires_and_rm_fails() {
        let child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut process = DockerProcess {
            id: "demo-api-1".to_string(),
            bin: "/nonexistent/docker".to_string(),
            child,
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let code = process.terminate(Duration::from_millis(100)).await.unwrap();
        assert_eq!(code, 128 + libc::SIGKILL);
    }
}
