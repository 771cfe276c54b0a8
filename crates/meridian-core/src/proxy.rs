//! Proxy Manager: renders upstream/server configs and drives validated,
//! atomic reloads of the front proxy.

use std::collections::HashSet;
use std::path::PathBuf;

use meridian_storage::model::Instance;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::ProxyError;

/// Load-balancing algorithm for one app's upstream, per `spec.md` §4.8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Algorithm {
    RoundRobin,
    LeastConn,
    IpHash,
    ConsistentHash { key_expr: String },
}

impl Algorithm {
    fn directive(&self) -> String {
        match self {
            Self::RoundRobin => String::new(),
            Self::LeastConn => "least_conn;".to_owned(),
            Self::IpHash => "ip_hash;".to_owned(),
            Self::ConsistentHash { key_expr } => format!("hash {key_expr} consistent;"),
        }
    }
}

/// One rendered `server` line inside an upstream block.
#[derive(Debug, Clone)]
pub struct UpstreamServer {
    pub address: String,
    pub weight: u32,
    pub max_fails: u32,
    pub fail_timeout_seconds: u32,
    pub max_conns: Option<u32>,
    pub backup: bool,
}

/// Derive a server's weight from its observed load: reduce on high CPU/mem
/// or repeated recent failures. `1` is the baseline for an unloaded,
/// healthy instance.
#[must_use]
pub fn derive_weight(cpu_percent: f64, memory_percent: f64, consecutive_failures: u32) -> u32 {
    let mut weight = 10_u32;
    if cpu_percent > 80.0 || memory_percent > 80.0 {
        weight = weight.saturating_sub(5);
    }
    if consecutive_failures > 0 {
        weight = weight.saturating_sub(3 * consecutive_failures.min(3));
    }
    weight.max(1)
}

/// Build the server list for an app from its instances, including only
/// those with `status = running ∧ health_status = healthy`.
#[must_use]
pub fn routable_servers(instances: &[Instance], loads: &[(f64, f64)]) -> Vec<UpstreamServer> {
    instances
        .iter()
        .zip(loads.iter().chain(std::iter::repeat(&(0.0, 0.0))))
        .filter(|(instance, _)| instance.is_routable())
        .map(|(instance, &(cpu, mem))| UpstreamServer {
            address: format!("{}:{}", instance.ip, instance.port),
            weight: derive_weight(cpu, mem, instance.consecutive_failures),
            max_fails: 3,
            fail_timeout_seconds: 10,
            max_conns: None,
            backup: false,
        })
        .collect()
}

/// Render the `<app>_upstream.conf` block.
#[must_use]
pub fn render_upstream(app_name: &str, algorithm: &Algorithm, servers: &[UpstreamServer]) -> String {
    let mut out = format!("upstream {app_name} {{\n");
    let directive = algorithm.directive();
    if !directive.is_empty() {
        out.push_str("    ");
        out.push_str(&directive);
        out.push('\n');
    }
    for server in servers {
        let mut line = format!(
            "    server {} weight={} max_fails={} fail_timeout={}s",
            server.address, server.weight, server.max_fails, server.fail_timeout_seconds
        );
        if let Some(max_conns) = server.max_conns {
            line.push_str(&format!(" max_conns={max_conns}"));
        }
        if server.backup {
            line.push_str(" backup");
        }
        line.push_str(";\n");
        out.push_str(&line);
    }
    out.push_str("}\n");
    out
}

/// Render the `<app>_server.conf` block: a thin server stanza proxying to
/// the named upstream.
#[must_use]
pub fn render_server(app_name: &str, listen_port: u16) -> String {
    format!(
        "server {{\n    listen {listen_port};\n    server_name {app_name};\n    location / {{\n        proxy_pass http://{app_name};\n    }}\n}}\n"
    )
}

/// Renders, validates, and atomically reloads proxy configs. A single
/// internal mutex serializes writes to the config directory; reads of
/// `active_apps` are lock-free snapshots.
pub struct ProxyManager {
    config_dir: PathBuf,
    proxy_binary: String,
    write_lock: Mutex<()>,
    active_apps: RwLock<HashSet<String>>,
}

impl ProxyManager {
    #[must_use]
    pub fn new(config_dir: impl Into<PathBuf>, proxy_binary: impl Into<String>) -> Self {
        Self {
            config_dir: config_dir.into(),
            proxy_binary: proxy_binary.into(),
            write_lock: Mutex::new(()),
            active_apps: RwLock::new(HashSet::new()),
        }
    }

    /// Write one rendered config file, test it, and reload on success.
    /// On failure the temp file is deleted and the previous config is left
    /// untouched — the atomic-reload invariant from `spec.md` §8.
    pub async fn write_and_reload(&self, file_stem: &str, contents: &str) -> Result<(), ProxyError> {
        let _guard = self.write_lock.lock().await;

        let final_path = self.config_dir.join(format!("{file_stem}.conf"));
        let temp_path = self.config_dir.join(format!("{file_stem}.conf.tmp"));

        fs::write(&temp_path, contents).await?;

        let test = Command::new(&self.proxy_binary)
            .arg("-t")
            .output()
            .await?;
        if !test.status.success() {
            let _ = fs::remove_file(&temp_path).await;
            let stderr = String::from_utf8_lossy(&test.stderr).into_owned();
            warn!(file_stem, stderr, "proxy config test failed");
            return Err(ProxyError::ConfigTestFailed(stderr));
        }

        fs::rename(&temp_path, &final_path).await?;

        let reload = Command::new(&self.proxy_binary)
            .args(["-s", "reload"])
            .output()
            .await?;
        if !reload.status.success() {
            let stderr = String::from_utf8_lossy(&reload.stderr).into_owned();
            return Err(ProxyError::ReloadFailed(stderr));
        }

        info!(file_stem, "proxy config reloaded");
        Ok(())
    }

    /// Render and reload both config artifacts for one app, then mark it
    /// active for orphan tracking.
    pub async fn reload_app(
        &self,
        app_name: &str,
        algorithm: &Algorithm,
        servers: &[UpstreamServer],
        listen_port: u16,
    ) -> Result<(), ProxyError> {
        let upstream = render_upstream(app_name, algorithm, servers);
        self.write_and_reload(&format!("{app_name}_upstream"), &upstream)
            .await?;

        let server = render_server(app_name, listen_port);
        self.write_and_reload(&format!("{app_name}_server"), &server)
            .await?;

        self.active_apps.write().await.insert(app_name.to_owned());
        Ok(())
    }

    /// Remove config files for apps no longer in `known_apps`, reloading
    /// once afterward.
    pub async fn remove_orphans(&self, known_apps: &HashSet<String>) -> Result<Vec<String>, ProxyError> {
        let orphans: Vec<String> = {
            let active = self.active_apps.read().await;
            active.difference(known_apps).cloned().collect()
        };
        if orphans.is_empty() {
            return Ok(orphans);
        }

        let _guard = self.write_lock.lock().await;
        for app_name in &orphans {
            let _ = fs::remove_file(self.config_dir.join(format!("{app_name}_upstream.conf"))).await;
            let _ = fs::remove_file(self.config_dir.join(format!("{app_name}_server.conf"))).await;
        }
        let reload = Command::new(&self.proxy_binary)
            .args(["-s", "reload"])
            .output()
            .await?;
        if !reload.status.success() {
            let stderr = String::from_utf8_lossy(&reload.stderr).into_owned();
            return Err(ProxyError::ReloadFailed(stderr));
        }

        let mut active = self.active_apps.write().await;
        for app_name in &orphans {
            active.remove(app_name);
        }
        Ok(orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_drops_under_load_and_never_reaches_zero() {
        assert_eq!(derive_weight(10.0, 10.0, 0), 10);
        assert_eq!(derive_weight(90.0, 10.0, 0), 5);
        assert_eq!(derive_weight(90.0, 10.0, 5), 1);
    }

    #[test]
    fn render_upstream_includes_algorithm_directive() {
        let servers = vec![UpstreamServer {
            address: "10.0.0.1:8080".to_owned(),
            weight: 10,
            max_fails: 3,
            fail_timeout_seconds: 10,
            max_conns: None,
            backup: false,
        }];
        let rendered = render_upstream("alpha", &Algorithm::LeastConn, &servers);
        assert!(rendered.contains("least_conn;"));
        assert!(rendered.contains("server 10.0.0.1:8080"));
    }

    #[test]
    fn round_robin_omits_directive() {
        let rendered = render_upstream("alpha", &Algorithm::RoundRobin, &[]);
        assert!(!rendered.contains("least_conn"));
        assert!(!rendered.contains("ip_hash"));
    }
}
