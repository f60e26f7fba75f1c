//! Cluster node inventory.

use crate as k8s;
use anyhow::{Context, Result};
use kube::api::{ListParams, ResourceExt};
use port_audit_discovery::{Inventory, Node};
use std::collections::BTreeMap;
use tracing::debug;

const ROLE_PREFIX: &str = "node-role.kubernetes.io/";
const CONTROL_PLANE_ROLES: [&str; 2] = ["master", "control-plane"];
const MASTER: &str = "master";
const WORKER: &str = "worker";

/// Lists nodes through the Kubernetes API.
#[derive(Clone)]
pub struct ClusterNodes {
    client: k8s::Client,
    selector: Option<String>,
}

impl ClusterNodes {
    pub fn new(client: k8s::Client) -> Self {
        Self {
            client,
            selector: None,
        }
    }

    /// Only lists nodes matching a label selector.
    pub fn with_selector(self, selector: Option<String>) -> Self {
        Self { selector, ..self }
    }
}

#[async_trait::async_trait]
impl Inventory for ClusterNodes {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api = k8s::Api::<k8s::Node>::all(self.client.clone());
        let mut params = ListParams::default();
        if let Some(selector) = self.selector.as_deref() {
            params = params.labels(selector);
        }
        let nodes = api.list(&params).await.context("listing nodes")?;

        Ok(nodes
            .into_iter()
            .map(|node| {
                let group = node_group(node.labels());
                let name = node.name_any();
                debug!(%name, %group, "Found node");
                Node::new(name, group)
            })
            .collect())
    }
}

/// Derives a node's group from its `node-role.kubernetes.io/<role>` labels.
///
/// Control-plane nodes are `master`. Otherwise a custom pool role wins over
/// the generic `worker` role, which is also the fallback.
pub fn node_group(labels: &BTreeMap<String, String>) -> String {
    let roles = labels
        .keys()
        .filter_map(|k| k.strip_prefix(ROLE_PREFIX))
        .filter(|role| !role.is_empty())
        .collect::<Vec<_>>();

    if roles.iter().any(|r| CONTROL_PLANE_ROLES.contains(r)) {
        return MASTER.to_string();
    }
    roles
        .into_iter()
        .find(|r| *r != WORKER)
        .unwrap_or(WORKER)
        .to_string()
}
