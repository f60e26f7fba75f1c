use crate::{
    exec::{Executor, Node},
    loopback::LoopbackFilter,
    resolve::{Attribution, ContainerResolver},
    ss::{SocketEntry, SocketTable, TCP_DUMP, UDP_DUMP},
};
use anyhow::{Context, Result};
use port_audit_core::{FlowRecord, Protocol};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Probes a single node's listening sockets.
#[derive(Debug)]
pub struct Prober<E> {
    exec: Arc<E>,
    table: SocketTable,
    resolver: ContainerResolver,
}

/// The flows found on one node, along with the raw socket tables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeProbe {
    pub tcp: Vec<FlowRecord>,
    pub udp: Vec<FlowRecord>,
    pub raw_tcp: Vec<u8>,
    pub raw_udp: Vec<u8>,
}

// === impl Prober ===

impl<E> Clone for Prober<E> {
    fn clone(&self) -> Self {
        Self {
            exec: self.exec.clone(),
            table: self.table.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

impl<E: Executor> Prober<E> {
    pub fn new(exec: Arc<E>) -> Self {
        Self {
            exec,
            table: SocketTable::default(),
            resolver: ContainerResolver::default(),
        }
    }

    pub fn with_socket_table(self, table: SocketTable) -> Self {
        Self { table, ..self }
    }

    pub fn with_resolver(self, resolver: ContainerResolver) -> Self {
        Self { resolver, ..self }
    }

    /// Probes `node` inside a fresh execution context.
    ///
    /// The context is destroyed before returning, whether or not probing
    /// succeeded. If probing fails, that error is returned even when
    /// cleanup fails too.
    #[instrument(skip_all, fields(node = %node.name, group = %node.group))]
    pub async fn probe(&self, node: &Node) -> Result<NodeProbe> {
        let ctx = self
            .exec
            .create_context(node)
            .await
            .with_context(|| format!("creating execution context on node {}", node.name))?;

        let res = self.probe_in(&ctx, node).await;

        let destroyed = self
            .exec
            .destroy_context(ctx)
            .await
            .with_context(|| format!("destroying execution context on node {}", node.name));

        match (res, destroyed) {
            (Ok(probe), Ok(())) => {
                info!(tcp = probe.tcp.len(), udp = probe.udp.len(), "Probed");
                Ok(probe)
            }
            (Ok(_), Err(error)) => Err(error),
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(cleanup)) => {
                warn!(error = %format!("{cleanup:#}"), "Failed to clean up after probe failure");
                Err(error)
            }
        }
    }

    async fn probe_in(&self, ctx: &E::Context, node: &Node) -> Result<NodeProbe> {
        let raw_tcp = self
            .exec
            .run(ctx, TCP_DUMP)
            .await
            .context("dumping TCP sockets")?;
        let raw_udp = self
            .exec
            .run(ctx, UDP_DUMP)
            .await
            .context("dumping UDP sockets")?;

        let lo = LoopbackFilter::discover(&*self.exec, ctx).await?;

        let tcp = self.flows(ctx, node, Protocol::Tcp, &raw_tcp, &lo).await;
        let udp = self.flows(ctx, node, Protocol::Udp, &raw_udp, &lo).await;

        Ok(NodeProbe {
            tcp,
            udp,
            raw_tcp,
            raw_udp,
        })
    }

    async fn flows(
        &self,
        ctx: &E::Context,
        node: &Node,
        protocol: Protocol,
        raw: &[u8],
        lo: &LoopbackFilter,
    ) -> Vec<FlowRecord> {
        let entries = self
            .table
            .parse(protocol, &String::from_utf8_lossy(raw), lo);

        let mut flows = Vec::with_capacity(entries.len());
        for mut entry in entries {
            entry.attribution = self.attribute(ctx, &entry).await;
            flows.push(flow(node, entry));
        }
        flows
    }

    /// Resolves the socket's container. Attribution is best-effort: any
    /// failure leaves it empty.
    async fn attribute(&self, ctx: &E::Context, entry: &SocketEntry) -> Attribution {
        let Some(pid) = entry.pid else {
            debug!(local = %entry.local, "No pid; leaving container unattributed");
            return Attribution::default();
        };
        match self.resolver.resolve(&*self.exec, ctx, pid).await {
            Ok(attribution) => attribution,
            Err(error) => {
                debug!(local = %entry.local, pid, %error, "Failed to resolve container");
                Attribution::default()
            }
        }
    }
}

fn flow(node: &Node, entry: SocketEntry) -> FlowRecord {
    let SocketEntry {
        protocol,
        port,
        service,
        attribution:
            Attribution {
                namespace,
                pod,
                container,
            },
        ..
    } = entry;
    FlowRecord {
        namespace,
        service,
        pod,
        container,
        optional: false,
        ..FlowRecord::ingress(node.group.clone(), protocol, port)
    }
}

// === impl NodeProbe ===

impl NodeProbe {
    /// All flows, UDP first.
    pub fn records(&self) -> impl Iterator<Item = &FlowRecord> {
        self.udp.iter().chain(self.tcp.iter())
    }

    pub fn into_records(self) -> Vec<FlowRecord> {
        let mut records = self.udp;
        records.extend(self.tcp);
        records
    }
}
