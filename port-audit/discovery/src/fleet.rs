use crate::{
    exec::{Executor, Node},
    probe::{NodeProbe, Prober},
};
use anyhow::{anyhow, Context, Result};
use port_audit_core::FlowMatrix;
use std::{num::NonZeroUsize, sync::Arc};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, info_span, warn, Instrument};

/// Probes every node of a cluster concurrently.
#[derive(Debug)]
pub struct Fleet<E> {
    exec: Arc<E>,
    prober: Prober<E>,
    max_concurrency: Option<NonZeroUsize>,
}

/// The result of a fleet-wide discovery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Discovery {
    /// The canonical matrix of every node's flows.
    pub matrix: FlowMatrix,
    /// Each node's raw TCP table, as `node: <name>` blocks in completion order.
    pub raw_tcp: Vec<u8>,
    /// Each node's raw UDP table, as `node: <name>` blocks in completion order.
    pub raw_udp: Vec<u8>,
}

// === impl Fleet ===

impl<E: Executor> Fleet<E> {
    pub fn new(exec: Arc<E>) -> Self {
        Self {
            prober: Prober::new(exec.clone()),
            exec,
            max_concurrency: None,
        }
    }

    pub fn with_prober(self, prober: Prober<E>) -> Self {
        Self { prober, ..self }
    }

    /// Limits how many nodes are probed at once. Unbounded by default.
    pub fn with_max_concurrency(self, max: Option<NonZeroUsize>) -> Self {
        Self {
            max_concurrency: max,
            ..self
        }
    }

    /// Discovers the flows of every node.
    ///
    /// Either every node is probed successfully or an error is returned; no
    /// partial matrix is ever produced. When several nodes fail, the first
    /// failure observed is returned. Shared executor resources are torn
    /// down in either case.
    pub async fn discover(&self, nodes: Vec<Node>) -> Result<Discovery> {
        self.exec
            .setup()
            .await
            .context("preparing execution environment")?;

        let res = self.probe_all(nodes).await;

        let teardown = self
            .exec
            .teardown()
            .await
            .context("tearing down execution environment");

        match (res, teardown) {
            (Ok(discovery), Ok(())) => Ok(discovery),
            (Ok(_), Err(error)) => Err(error),
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(cleanup)) => {
                warn!(error = %format!("{cleanup:#}"), "Failed to tear down after discovery failure");
                Err(error)
            }
        }
    }

    async fn probe_all(&self, nodes: Vec<Node>) -> Result<Discovery> {
        let limit = self
            .max_concurrency
            .map(|max| Arc::new(Semaphore::new(max.get())));

        let mut tasks = JoinSet::new();
        for node in nodes {
            let prober = self.prober.clone();
            let limit = limit.clone();
            let span = info_span!("node", node = %node.name);
            tasks.spawn(
                async move {
                    let _permit = match limit {
                        Some(limit) => Some(limit.acquire_owned().await?),
                        None => None,
                    };
                    let res = prober.probe(&node).await;
                    Ok::<_, anyhow::Error>((node, res))
                }
                .instrument(span),
            );
        }

        // Workers hand their results back through the join set, so only
        // this loop touches the aggregate.
        let mut records = Vec::new();
        let mut raw_tcp = Vec::new();
        let mut raw_udp = Vec::new();
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let (node, res) = match joined {
                Ok(Ok(done)) => done,
                Ok(Err(error)) => {
                    failure.get_or_insert(error);
                    continue;
                }
                Err(error) => {
                    failure.get_or_insert(anyhow!(error).context("node probe task failed"));
                    continue;
                }
            };

            match res {
                Ok(probe) => {
                    if failure.is_none() {
                        debug!(node = %node.name, "Aggregating");
                        append_raw(&mut raw_tcp, &node, &probe.raw_tcp);
                        append_raw(&mut raw_udp, &node, &probe.raw_udp);
                        records.extend(NodeProbe::into_records(probe));
                    }
                }
                Err(error) => {
                    if failure.is_none() {
                        warn!(node = %node.name, "Probe failed; waiting for running probes");
                    }
                    failure.get_or_insert(error.context(format!("probing node {}", node.name)));
                }
            }
        }

        if let Some(error) = failure {
            return Err(error);
        }

        let matrix = FlowMatrix::canonical(records);
        info!(flows = matrix.len(), "Discovered");
        Ok(Discovery {
            matrix,
            raw_tcp,
            raw_udp,
        })
    }
}

fn append_raw(buf: &mut Vec<u8>, node: &Node, raw: &[u8]) {
    buf.extend_from_slice(format!("node: {}\n", node.name).as_bytes());
    buf.extend_from_slice(raw);
    buf.push(b'\n');
}
