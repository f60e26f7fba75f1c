use crate::{artifacts::ArtifactDir, report::Report};
use anyhow::{Context, Result};
use clap::Parser;
use port_audit_core::Format;
use port_audit_discovery::{Fleet, Inventory};
use port_audit_k8s::{ClusterNodes, DebugPods, RetryBudget};
use std::{num::NonZeroUsize, path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "port-audit",
    version,
    about = "Discovers the ports every cluster node listens on"
)]
pub struct Args {
    #[clap(long, default_value = "port_audit=info,warn", env = "PORT_AUDIT_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    /// Directory that receives the raw dumps, matrices and diff.
    #[clap(long, short = 'd', default_value = ".")]
    destination_dir: PathBuf,

    /// Output format of the generated matrices.
    #[clap(long, default_value = "csv")]
    format: Format,

    /// A matrix to compare discovered flows against.
    ///
    /// The format is inferred from the file extension.
    #[clap(long)]
    expected: Option<PathBuf>,

    /// Namespace holding the debug pods. Created and removed if missing.
    #[clap(long, default_value = "port-audit-debug")]
    debug_namespace: String,

    /// Image of the debug pods. It must provide `chroot` and `sleep`.
    #[clap(
        long,
        default_value = "registry.access.redhat.com/ubi9/ubi-minimal:latest"
    )]
    debug_image: String,

    /// Only probe nodes matching this label selector.
    #[clap(long)]
    node_selector: Option<String>,

    #[clap(long, default_value = "1000")]
    exec_interval_ms: u64,

    #[clap(long, default_value = "30")]
    exec_timeout_secs: u64,

    #[clap(long, default_value = "120")]
    pod_ready_timeout_secs: u64,

    /// Limits how many nodes are probed at once.
    #[clap(long)]
    max_concurrency: Option<NonZeroUsize>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            destination_dir,
            format,
            expected,
            debug_namespace,
            debug_image,
            node_selector,
            exec_interval_ms,
            exec_timeout_secs,
            pod_ready_timeout_secs,
            max_concurrency,
        } = self;

        log_format.try_init(log_level)?;

        // Fail on a bad expected matrix before touching the cluster.
        let expected = match expected {
            Some(path) => Some(Report::load_expected(&path).await?),
            None => None,
        };
        let out = ArtifactDir::create(destination_dir).await?;

        let client = client.try_client().await?;
        let nodes = ClusterNodes::new(client.clone())
            .with_selector(node_selector)
            .list_nodes()
            .await?;
        info!(nodes = nodes.len(), "Listed nodes");

        let exec = DebugPods::new(client, debug_namespace, debug_image)
            .with_ready_timeout(Duration::from_secs(pod_ready_timeout_secs))
            .with_retry(RetryBudget {
                interval: Duration::from_millis(exec_interval_ms),
                timeout: Duration::from_secs(exec_timeout_secs),
            });
        let discovery = Fleet::new(Arc::new(exec))
            .with_max_concurrency(max_concurrency)
            .discover(nodes)
            .instrument(info_span!("discover"))
            .await
            .context("discovering listening ports")?;

        let summary = Report::new(format)
            .with_expected(expected)
            .write(&out, &discovery)
            .await?;
        info!(
            dir = %out.root().display(),
            flows = summary.flows,
            node_groups = summary.node_groups.len(),
            "Done"
        );
        Ok(())
    }
}
