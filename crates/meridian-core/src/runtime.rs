//! Runtime Adapter: the boundary between Meridian and whatever actually runs
//! containers.
//!
//! [`RuntimeAdapter`] is the trait the App Manager drives; [`LocalRuntimeAdapter`]
//! shells out to a `docker`/`podman`-compatible CLI, and [`MockRuntimeAdapter`]
//! backs unit tests the way `meridian_storage::MemoryStore` backs storage
//! tests.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::RuntimeError;

/// Everything the Runtime Adapter needs to start one replica of an app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub app_name: String,
    pub image: String,
    pub port: u16,
    pub env: HashMap<String, String>,
    pub cpu_limit: Option<f64>,
    pub memory_limit_mb: Option<u64>,
}

/// Identity and network coordinates of a container just created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedContainer {
    pub container_id: String,
    pub ip: String,
    pub port: u16,
}

/// Instantaneous resource usage, as `spec.md` §4.3 defines it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_bytes: u64,
}

/// A label selector used to enumerate managed containers after a crash.
#[derive(Debug, Clone, Default)]
pub struct LabelSelector {
    pub app_name: Option<String>,
}

/// A container discovered via [`RuntimeAdapter::list_by_labels`].
#[derive(Debug, Clone)]
pub struct DiscoveredContainer {
    pub container_id: String,
    pub app_name: String,
    pub replica_index: u32,
    pub ip: String,
    pub port: u16,
}

/// Contract the App Manager drives, independent of the concrete container
/// runtime underneath.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync + 'static {
    async fn create(
        &self,
        spec: &ContainerSpec,
        replica_index: u32,
    ) -> Result<CreatedContainer, RuntimeError>;

    async fn stop(&self, container_id: &str, grace_seconds: u32) -> Result<(), RuntimeError>;
    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError>;
    async fn restart(&self, container_id: &str, grace_seconds: u32) -> Result<(), RuntimeError>;
    async fn stats(&self, container_id: &str) -> Result<ContainerStats, RuntimeError>;
    async fn list_by_labels(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<DiscoveredContainer>, RuntimeError>;
}

/// Reference [`RuntimeAdapter`] that shells out to a `docker`/`podman`
/// compatible CLI binary.
pub struct LocalRuntimeAdapter {
    binary: String,
    network: String,
}

impl LocalRuntimeAdapter {
    #[must_use]
    pub fn new(binary: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            network: network.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(classify_cli_failure(&stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

fn classify_cli_failure(stderr: &str) -> RuntimeError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no such container") {
        RuntimeError::NotFound(stderr.to_owned())
    } else if lower.contains("no space left") || lower.contains("cannot allocate") {
        RuntimeError::ResourceExhausted(stderr.to_owned())
    } else {
        RuntimeError::Invalid(stderr.to_owned())
    }
}

#[async_trait]
impl RuntimeAdapter for LocalRuntimeAdapter {
    async fn create(
        &self,
        spec: &ContainerSpec,
        replica_index: u32,
    ) -> Result<CreatedContainer, RuntimeError> {
        let labels = [
            format!("app={}", spec.app_name),
            format!("replica={replica_index}"),
            "managed=true".to_owned(),
        ];
        let mut args = vec![
            "run".to_owned(),
            "-d".to_owned(),
            "--network".to_owned(),
            self.network.clone(),
            "-p".to_owned(),
            format!("{}", spec.port),
        ];
        for label in &labels {
            args.push("--label".to_owned());
            args.push(label.clone());
        }
        for (key, value) in &spec.env {
            args.push("-e".to_owned());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());

        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        let container_id = self.run(&args_ref).await?;

        let ip = self
            .run(&[
                "inspect",
                "-f",
                "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}",
                &container_id,
            ])
            .await
            .unwrap_or_default();

        Ok(CreatedContainer {
            container_id,
            ip,
            port: spec.port,
        })
    }

    async fn stop(&self, container_id: &str, grace_seconds: u32) -> Result<(), RuntimeError> {
        self.run(&["stop", "-t", &grace_seconds.to_string(), container_id])
            .await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.run(&["rm", "-f", container_id]).await?;
        Ok(())
    }

    async fn restart(&self, container_id: &str, grace_seconds: u32) -> Result<(), RuntimeError> {
        self.run(&["restart", "-t", &grace_seconds.to_string(), container_id])
            .await?;
        Ok(())
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats, RuntimeError> {
        let raw = self
            .run(&[
                "stats",
                "--no-stream",
                "--format",
                "{{.CPUPerc}},{{.MemPerc}},{{.MemUsage}}",
                container_id,
            ])
            .await?;
        parse_stats_line(&raw)
    }

    async fn list_by_labels(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<DiscoveredContainer>, RuntimeError> {
        let mut args = vec!["ps".to_owned(), "-a".to_owned(), "--filter".to_owned()];
        args.push("label=managed=true".to_owned());
        if let Some(app_name) = &selector.app_name {
            args.push("--filter".to_owned());
            args.push(format!("label=app={app_name}"));
        }
        args.push("--format".to_owned());
        args.push("{{.ID}}".to_owned());

        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        let listing = self.run(&args_ref).await?;
        debug!(count = listing.lines().count(), "discovered managed containers");
        // Full label/IP introspection per id is left to callers that need it;
        // a from-scratch adapter surfaces ids here and resolves detail lazily.
        Ok(listing
            .lines()
            .map(|id| DiscoveredContainer {
                container_id: id.to_owned(),
                app_name: selector.app_name.clone().unwrap_or_default(),
                replica_index: 0,
                ip: String::new(),
                port: 0,
            })
            .collect())
    }
}

fn parse_stats_line(raw: &str) -> Result<ContainerStats, RuntimeError> {
    let parts: Vec<&str> = raw.splitn(3, ',').collect();
    let [cpu, mem, mem_usage] = parts.as_slice() else {
        return Err(RuntimeError::Invalid(format!("unparseable stats line: {raw}")));
    };
    let cpu_percent = cpu.trim_end_matches('%').parse().unwrap_or(0.0);
    let memory_percent = mem.trim_end_matches('%').parse().unwrap_or(0.0);
    let memory_bytes = mem_usage
        .split('/')
        .next()
        .map(parse_byte_size)
        .unwrap_or(0);
    Ok(ContainerStats {
        cpu_percent,
        memory_percent,
        memory_bytes,
    })
}

fn parse_byte_size(s: &str) -> u64 {
    let s = s.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(digits_end);
    let value: f64 = number.parse().unwrap_or(0.0);
    let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
        "KB" | "KIB" => 1024.0,
        "MB" | "MIB" => 1024.0 * 1024.0,
        "GB" | "GIB" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    (value * multiplier) as u64
}

/// In-memory [`RuntimeAdapter`] for tests: no process ever spawns.
#[derive(Default)]
pub struct MockRuntimeAdapter {
    containers: Mutex<HashMap<String, (ContainerSpec, u32)>>,
    next_id: Mutex<u64>,
}

impl MockRuntimeAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuntimeAdapter for MockRuntimeAdapter {
    async fn create(
        &self,
        spec: &ContainerSpec,
        replica_index: u32,
    ) -> Result<CreatedContainer, RuntimeError> {
        let mut next_id = self.next_id.lock().await;
        *next_id += 1;
        let container_id = format!("mock-{}-{next_id}", spec.app_name);
        self.containers
            .lock()
            .await
            .insert(container_id.clone(), (spec.clone(), replica_index));
        Ok(CreatedContainer {
            container_id,
            ip: "127.0.0.1".to_owned(),
            port: spec.port,
        })
    }

    async fn stop(&self, container_id: &str, _grace_seconds: u32) -> Result<(), RuntimeError> {
        if !self.containers.lock().await.contains_key(container_id) {
            return Err(RuntimeError::NotFound(container_id.to_owned()));
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.containers.lock().await.remove(container_id);
        Ok(())
    }

    async fn restart(&self, container_id: &str, _grace_seconds: u32) -> Result<(), RuntimeError> {
        if !self.containers.lock().await.contains_key(container_id) {
            return Err(RuntimeError::NotFound(container_id.to_owned()));
        }
        Ok(())
    }

    async fn stats(&self, container_id: &str) -> Result<ContainerStats, RuntimeError> {
        if !self.containers.lock().await.contains_key(container_id) {
            return Err(RuntimeError::NotFound(container_id.to_owned()));
        }
        Ok(ContainerStats {
            cpu_percent: 5.0,
            memory_percent: 10.0,
            memory_bytes: 64 * 1024 * 1024,
        })
    }

    async fn list_by_labels(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<DiscoveredContainer>, RuntimeError> {
        let containers = self.containers.lock().await;
        Ok(containers
            .iter()
            .filter(|(_, (spec, _))| {
                selector
                    .app_name
                    .as_deref()
                    .is_none_or(|name| spec.app_name == name)
            })
            .map(|(id, (spec, replica_index))| DiscoveredContainer {
                container_id: id.clone(),
                app_name: spec.app_name.clone(),
                replica_index: *replica_index,
                ip: "127.0.0.1".to_owned(),
                port: spec.port,
            })
            .collect())
    }
}

/// Shared handle to a runtime adapter, used by all callers that don't care
/// which concrete implementation backs it.
pub type SharedRuntime = Arc<dyn RuntimeAdapter>;

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            app_name: "alpha".to_owned(),
            image: "alpha:latest".to_owned(),
            port: 8080,
            env: HashMap::new(),
            cpu_limit: None,
            memory_limit_mb: None,
        }
    }

    #[tokio::test]
    async fn mock_adapter_creates_and_lists_by_app() {
        let adapter = MockRuntimeAdapter::new();
        let created = adapter.create(&spec(), 0).await.expect("create");
        let selector = LabelSelector {
            app_name: Some("alpha".to_owned()),
        };
        let found = adapter.list_by_labels(&selector).await.expect("list");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].container_id, created.container_id);
    }

    #[tokio::test]
    async fn mock_adapter_stop_on_unknown_container_is_not_found() {
        let adapter = MockRuntimeAdapter::new();
        let err = adapter
            .stop("does-not-exist", 5)
            .await
            .expect_err("must fail");
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[test]
    fn byte_size_parsing_handles_common_units() {
        assert_eq!(parse_byte_size("128MiB"), 128 * 1024 * 1024);
        assert_eq!(parse_byte_size("1GiB"), 1024 * 1024 * 1024);
    }
}
