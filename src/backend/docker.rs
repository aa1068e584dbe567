//! Production backend driver over the `docker` CLI.
//!
//! Every resource the driver creates carries the `hive.instance` label so
//! a crashed host can be cleaned up by the next one. File injection uses
//! `docker cp -` with an in-memory tar stream, which creates parent
//! directories inside the container as needed.

use log::{debug, warn};
use std::collections::HashMap;
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::process::{ChildStderr, ChildStdout, Command};

use async_trait::async_trait;

use crate::backend::backend_trait::ContainerBackend;
use crate::backend::types::{
    ContainerOptions, ExecResult, LogStream, StartedContainer, INSTANCE_LABEL,
};
use crate::error_handling::types::BackendError;

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(60);

pub struct DockerBackend {
    docker_bin: String,
    instance: String,
    op_timeout: Duration,
}

impl DockerBackend {
    pub fn new(docker_bin: String, instance: String) -> Self {
        Self {
            docker_bin,
            instance,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    /// Checks that the runtime endpoint answers at all.
    pub async fn ping(&self) -> Result<(), BackendError> {
        self.run(&["version", "--format", "{{.Server.Version}}"], Some(self.op_timeout))
            .await
            .map_err(|e| BackendError::RuntimeNotAvailable(e.to_string()))?;
        Ok(())
    }

    fn label_arg(&self) -> String {
        format!("{}={}", INSTANCE_LABEL, self.instance)
    }

    /// Runs a docker subcommand, capturing output. A `None` timeout means
    /// the command may run indefinitely (log streaming, wait).
    async fn run(
        &self,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> Result<String, BackendError> {
        self.run_with_stdin(args, None, timeout).await
    }

    async fn run_with_stdin(
        &self,
        args: &[&str],
        stdin: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<String, BackendError> {
        let stdout = self.run_bytes(args, stdin, timeout).await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    /// Core command runner; stdout is handed back untouched because some
    /// subcommands (`cp` to stdout) emit binary tar data.
    async fn run_bytes(
        &self,
        args: &[&str],
        stdin: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, BackendError> {
        let command_name = format!("{} {}", self.docker_bin, args.join(" "));
        debug!("running: {}", command_name);

        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| BackendError::CommandFailed {
            command: command_name.clone(),
            detail: e.to_string(),
        })?;

        if let Some(bytes) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(bytes).await?;
                pipe.shutdown().await?;
                drop(pipe);
            }
        }

        let wait = child.wait_with_output();
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| BackendError::Timeout(command_name.clone()))??,
            None => wait.await?,
        };

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(BackendError::CommandFailed {
                command: command_name,
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Builds a tar archive holding the given file mounts, with each entry
    /// path relative to the container root.
    fn files_archive(files: &HashMap<String, Vec<u8>>) -> Result<Vec<u8>, BackendError> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            let entry_path = path.trim_start_matches('/');
            builder
                .append_data(&mut header, entry_path, content.as_slice())
                .map_err(BackendError::IoError)?;
        }
        builder.into_inner().map_err(BackendError::IoError)
    }

    /// Extracts the contents of a single-file tar stream, as produced by
    /// `docker cp <id>:<path> -`.
    fn single_file_from_archive(archive: &[u8]) -> Option<Vec<u8>> {
        let mut ar = tar::Archive::new(archive);
        for entry in ar.entries().ok()? {
            let mut entry = entry.ok()?;
            if entry.header().entry_type().is_file() {
                let mut content = Vec::new();
                entry.read_to_end(&mut content).ok()?;
                return Some(content);
            }
        }
        None
    }

    async fn remove_container(&self, id: &str) -> Result<(), BackendError> {
        match self.run(&["rm", "--force", id], Some(self.op_timeout)).await {
            Ok(_) => Ok(()),
            // Removal must succeed when the container is already gone.
            Err(BackendError::CommandFailed { detail, .. })
                if detail.contains("No such container") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        nocache: bool,
    ) -> Result<String, BackendError> {
        let context = context_dir.to_string_lossy().into_owned();
        let mut args = vec!["build", "--tag", tag];
        if nocache {
            args.push("--no-cache");
        }
        args.push(&context);
        // Builds can legitimately take a long time; no timeout here.
        self.run(&args, None)
            .await
            .map_err(|e| BackendError::BuildFailed(e.to_string()))?;
        Ok(tag.to_string())
    }

    async fn image_version(&self, image: &str) -> Result<Option<String>, BackendError> {
        let label = self.label_arg();
        let id = self
            .run(&["create", "--label", &label, image], Some(self.op_timeout))
            .await?
            .trim()
            .to_string();

        let result = self
            .run_bytes(
                &["cp", &format!("{}:/version.txt", id), "-"],
                None,
                Some(self.op_timeout),
            )
            .await;
        let _ = self.remove_container(&id).await;

        match result {
            Ok(archive) => Ok(Self::single_file_from_archive(&archive)
                .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn start_container(
        &self,
        image: &str,
        opts: ContainerOptions,
    ) -> Result<StartedContainer, BackendError> {
        let label = self.label_arg();
        let mut args: Vec<String> = vec!["create".into(), "--label".into(), label];
        for (key, value) in &opts.env {
            args.push("--env".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(image.into());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self
            .run(&arg_refs, Some(self.op_timeout))
            .await
            .map_err(|e| BackendError::StartFailed(e.to_string()))?
            .trim()
            .to_string();

        // Everything after creation rolls the container back on failure so
        // the caller never has to clean up a half-started container.
        let setup = async {
            if !opts.files.is_empty() {
                let archive = Self::files_archive(&opts.files)?;
                self.run_with_stdin(
                    &["cp", "-", &format!("{}:/", id)],
                    Some(&archive),
                    Some(self.op_timeout),
                )
                .await?;
            }
            for archive in &opts.tar_archives {
                self.run_with_stdin(
                    &["cp", "-", &format!("{}:/", id)],
                    Some(archive),
                    Some(self.op_timeout),
                )
                .await?;
            }
            for network in &opts.networks {
                self.run(&["network", "connect", network, &id], Some(self.op_timeout))
                    .await?;
            }
            self.run(&["start", &id], Some(self.op_timeout)).await?;

            let mut ips = HashMap::new();
            ips.insert("bridge".to_string(), self.inspect_ip(&id, "bridge").await?);
            for network in &opts.networks {
                ips.insert(network.clone(), self.inspect_ip(&id, network).await?);
            }
            Ok::<_, BackendError>(ips)
        };

        match setup.await {
            Ok(ips) => Ok(StartedContainer { id, ips }),
            Err(e) => {
                warn!("start of container {} failed, removing it: {}", id, e);
                let _ = self.remove_container(&id).await;
                Err(BackendError::StartFailed(e.to_string()))
            }
        }
    }

    async fn stop_container(&self, id: &str) -> Result<(), BackendError> {
        self.remove_container(id).await
    }

    async fn wait_container(&self, id: &str) -> Result<i64, BackendError> {
        let out = self.run(&["wait", id], None).await?;
        out.trim()
            .parse::<i64>()
            .map_err(|e| BackendError::CommandFailed {
                command: format!("{} wait {}", self.docker_bin, id),
                detail: format!("unparseable exit code {:?}: {}", out.trim(), e),
            })
    }

    async fn inspect_ip(&self, id: &str, network: &str) -> Result<IpAddr, BackendError> {
        let format = format!(
            "{{{{with index .NetworkSettings.Networks \"{}\"}}}}{{{{.IPAddress}}}}{{{{end}}}}",
            network
        );
        let out = self
            .run(&["inspect", "--format", &format, id], Some(self.op_timeout))
            .await?;
        let trimmed = out.trim();
        if trimmed.is_empty() {
            return Err(BackendError::NotAttached {
                container: id.to_string(),
                network: network.to_string(),
            });
        }
        trimmed.parse().map_err(|e| BackendError::CommandFailed {
            command: format!("{} inspect {}", self.docker_bin, id),
            detail: format!("bad IP {:?}: {}", trimmed, e),
        })
    }

    async fn create_network(&self, name: &str) -> Result<String, BackendError> {
        let label = self.label_arg();
        let out = self
            .run(
                &["network", "create", "--label", &label, name],
                Some(self.op_timeout),
            )
            .await?;
        Ok(out.trim().to_string())
    }

    async fn remove_network(&self, name: &str) -> Result<(), BackendError> {
        match self.run(&["network", "rm", name], Some(self.op_timeout)).await {
            Ok(_) => Ok(()),
            Err(BackendError::CommandFailed { detail, .. })
                if detail.contains("not found") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn connect_container(&self, network: &str, id: &str) -> Result<(), BackendError> {
        self.run(&["network", "connect", network, id], Some(self.op_timeout))
            .await
            .map(|_| ())
    }

    async fn disconnect_container(&self, network: &str, id: &str) -> Result<(), BackendError> {
        self.run(
            &["network", "disconnect", "--force", network, id],
            Some(self.op_timeout),
        )
        .await
        .map(|_| ())
    }

    async fn exec(
        &self,
        id: &str,
        cmd: &str,
        user: &str,
        privileged: bool,
    ) -> Result<ExecResult, BackendError> {
        let command_name = format!("{} exec {}", self.docker_bin, id);
        let mut args: Vec<&str> = vec!["exec"];
        if privileged {
            args.push("--privileged");
        }
        if !user.is_empty() {
            args.push("--user");
            args.push(user);
        }
        args.extend_from_slice(&[id, "/bin/sh", "-c", cmd]);

        let output = Command::new(&self.docker_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackendError::CommandFailed {
                command: command_name,
                detail: e.to_string(),
            })?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn follow_logs(&self, id: &str) -> Result<LogStream, BackendError> {
        let child = Command::new(&self.docker_bin)
            .args(["logs", "--follow", id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::CommandFailed {
                command: format!("{} logs --follow {}", self.docker_bin, id),
                detail: e.to_string(),
            })?;
        Ok(Box::pin(DockerLogStream::new(child)))
    }

    async fn network_gateway(&self, network: &str) -> Result<IpAddr, BackendError> {
        let out = self
            .run(
                &[
                    "network",
                    "inspect",
                    "--format",
                    "{{(index .IPAM.Config 0).Gateway}}",
                    network,
                ],
                Some(self.op_timeout),
            )
            .await?;
        parse_gateway(&out).ok_or_else(|| BackendError::CommandFailed {
            command: format!("{} network inspect {}", self.docker_bin, network),
            detail: format!("bad gateway address {:?}", out.trim()),
        })
    }

    async fn sweep(&self, label_key: &str) -> Result<usize, BackendError> {
        let filter = format!("label={}", label_key);
        let mut removed = 0usize;

        let containers = self
            .run(&["ps", "--all", "--quiet", "--filter", &filter], Some(self.op_timeout))
            .await?;
        for id in containers.split_whitespace() {
            match self.remove_container(id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("sweep: cannot remove container {}: {}", id, e),
            }
        }

        let networks = self
            .run(
                &["network", "ls", "--quiet", "--filter", &filter],
                Some(self.op_timeout),
            )
            .await?;
        for id in networks.split_whitespace() {
            match self.remove_network(id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("sweep: cannot remove network {}: {}", id, e),
            }
        }
        Ok(removed)
    }
}

/// Gateway addresses sometimes come back with a CIDR suffix.
fn parse_gateway(raw: &str) -> Option<IpAddr> {
    let trimmed = raw.trim();
    let addr = trimmed.split('/').next().unwrap_or(trimmed);
    addr.parse().ok()
}

/// Interleaves a `docker logs --follow` child's stdout and stderr into a
/// single stream. EOF is reached once both pipes are closed, which happens
/// when the container exits.
struct DockerLogStream {
    _child: tokio::process::Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl DockerLogStream {
    fn new(mut child: tokio::process::Child) -> Self {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        Self {
            _child: child,
            stdout,
            stderr,
        }
    }
}

impl AsyncRead for DockerLogStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let mut pending = false;

        if let Some(out) = this.stdout.as_mut() {
            let before = buf.filled().len();
            match Pin::new(out).poll_read(cx, buf) {
                Poll::Ready(Ok(())) => {
                    if buf.filled().len() > before {
                        return Poll::Ready(Ok(()));
                    }
                    this.stdout = None;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => pending = true,
            }
        }

        if let Some(err) = this.stderr.as_mut() {
            let before = buf.filled().len();
            match Pin::new(err).poll_read(cx, buf) {
                Poll::Ready(Ok(())) => {
                    if buf.filled().len() > before {
                        return Poll::Ready(Ok(()));
                    }
                    this.stderr = None;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => pending = true,
            }
        }

        if this.stdout.is_none() && this.stderr.is_none() {
            Poll::Ready(Ok(()))
        } else if pending {
            Poll::Pending
        } else {
            // One side hit EOF this round and the other is already gone.
            Poll::Ready(Ok(()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_files_archive_roundtrip() {
        let mut files = HashMap::new();
        files.insert("/genesis.json".to_string(), b"{\"config\":{}}".to_vec());
        files.insert("/keys/key1".to_string(), b"secret".to_vec());

        let archive = DockerBackend::files_archive(&files).unwrap();
        let mut ar = tar::Archive::new(archive.as_slice());
        let mut seen = std::collections::HashMap::new();
        for entry in ar.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            seen.insert(path, content);
        }
        assert_eq!(seen.get("genesis.json").unwrap(), b"{\"config\":{}}");
        assert_eq!(seen.get("keys/key1").unwrap(), b"secret");
    }

    #[test]
    fn test_single_file_from_archive() {
        let mut files = HashMap::new();
        files.insert("/version.txt".to_string(), b"1.10.3-stable\n".to_vec());
        let archive = DockerBackend::files_archive(&files).unwrap();
        let content = DockerBackend::single_file_from_archive(&archive).unwrap();
        assert_eq!(content, b"1.10.3-stable\n");
    }

    #[test]
    fn test_parse_gateway() {
        assert_eq!(
            parse_gateway("172.17.0.1\n"),
            Some("172.17.0.1".parse().unwrap())
        );
        assert_eq!(
            parse_gateway("172.17.0.1/16"),
            Some("172.17.0.1".parse().unwrap())
        );
        assert_eq!(parse_gateway(""), None);
    }
}
