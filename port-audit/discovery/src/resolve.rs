//! Process to container attribution.
//!
//! A process is mapped to its container in two hops: the container
//! runtime's scope id is read from the process's cgroup membership, and the
//! runtime is then asked for that container's Kubernetes labels.

use crate::exec::Executor;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::trace;

const CONTAINER_NAME_LABEL: &str = "io.kubernetes.container.name";
const POD_NAME_LABEL: &str = "io.kubernetes.pod.name";
const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";

/// Matches `<runtime>-<id>.scope`, e.g. `crio-<id>.scope` or
/// `cri-containerd-<id>.scope`. Ids are long hex strings, which keeps
/// systemd units such as `session-3.scope` from matching.
static SCOPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<runtime>[a-z][a-z-]*?)-(?P<id>[0-9a-fA-F]{12,})\.scope")
        .expect("scope pattern must compile")
});

/// The workload that owns a socket. Fields are empty when unknown.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attribution {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("container id not found in cgroup of pid {0}")]
    ContainerIdNotFound(u32),

    #[error("inspecting container {id}: expected 1 container, got {got}")]
    ContainerCount { id: String, got: usize },

    #[error("container {id} has no {label} label")]
    MissingLabel { id: String, label: &'static str },

    #[error("invalid container runtime output: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Exec(#[from] anyhow::Error),
}

#[derive(Debug, Deserialize)]
struct ContainerList {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct ContainerResolver {
    scope: Regex,
}

// === impl ContainerResolver ===

impl Default for ContainerResolver {
    fn default() -> Self {
        Self {
            scope: SCOPE.clone(),
        }
    }
}

impl ContainerResolver {
    /// Overrides the scope pattern, which must have an `id` capture group.
    pub fn new(scope: Regex) -> Self {
        Self { scope }
    }

    /// Finds the container that runs `pid` on the context's node.
    pub async fn resolve<E: Executor>(
        &self,
        exec: &E,
        ctx: &E::Context,
        pid: u32,
    ) -> Result<Attribution, ResolveError> {
        let path = format!("/proc/{pid}/cgroup");
        let cgroup = exec.run(ctx, &["cat", path.as_str()]).await?;
        let id = self
            .container_id(&String::from_utf8_lossy(&cgroup))
            .ok_or(ResolveError::ContainerIdNotFound(pid))?;
        trace!(pid, %id, "Found container id");

        let out = exec
            .run(ctx, &["crictl", "ps", "-o", "json", "--id", id.as_str()])
            .await?;
        Self::from_runtime_json(&id, &out)
    }

    /// Extracts the container id from a process's cgroup file.
    pub fn container_id(&self, cgroup: &str) -> Option<String> {
        self.scope
            .captures(cgroup)
            .and_then(|c| c.name("id"))
            .map(|id| id.as_str().to_string())
    }

    /// Reads the attribution from `crictl ps -o json` output, which must
    /// describe exactly one container.
    pub fn from_runtime_json(id: &str, json: &[u8]) -> Result<Attribution, ResolveError> {
        let ContainerList { mut containers } = serde_json::from_slice(json)?;
        if containers.len() != 1 {
            return Err(ResolveError::ContainerCount {
                id: id.to_string(),
                got: containers.len(),
            });
        }
        let Container { mut labels } = containers.remove(0);

        let container = labels
            .remove(CONTAINER_NAME_LABEL)
            .ok_or_else(|| ResolveError::MissingLabel {
                id: id.to_string(),
                label: CONTAINER_NAME_LABEL,
            })?;
        Ok(Attribution {
            namespace: labels.remove(POD_NAMESPACE_LABEL).unwrap_or_default(),
            pod: labels.remove(POD_NAME_LABEL).unwrap_or_default(),
            container,
        })
    }
}
