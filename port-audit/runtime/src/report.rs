use crate::artifacts::WriteArtifact;
use anyhow::{Context, Result};
use port_audit_core::{FlowMatrix, Format, MatrixDiff};
use port_audit_discovery::Discovery;
use std::path::Path;
use tracing::info;

pub const RAW_TCP: &str = "raw-ss-tcp";
pub const RAW_UDP: &str = "raw-ss-udp";
pub const MATRIX: &str = "ss-generated-matrix";
pub const DIFF: &str = "matrix-diff-ss";

/// Writes the artifacts of a discovery run.
#[derive(Clone, Debug, Default)]
pub struct Report {
    format: Format,
    expected: Option<FlowMatrix>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub flows: usize,
    pub node_groups: Vec<String>,
    pub diff: Option<DiffSummary>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub unique_to_expected: usize,
    pub unique_to_discovered: usize,
}

// === impl Report ===

impl Report {
    pub fn new(format: Format) -> Self {
        Self {
            format,
            expected: None,
        }
    }

    /// Compares discovered flows against an expected matrix.
    pub fn with_expected(self, expected: Option<FlowMatrix>) -> Self {
        Self { expected, ..self }
    }

    /// Reads an expected matrix, inferring its format from the extension.
    pub async fn load_expected(path: &Path) -> Result<FlowMatrix> {
        let format = Format::from_path(path)?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mut matrix = FlowMatrix::decode(&bytes, format)
            .with_context(|| format!("parsing {}", path.display()))?;
        matrix.sort_and_remove_duplicates();
        info!(path = %path.display(), flows = matrix.len(), "Loaded expected matrix");
        Ok(matrix)
    }

    pub async fn write<W: WriteArtifact + ?Sized>(
        &self,
        out: &W,
        discovery: &Discovery,
    ) -> Result<Summary> {
        out.write_artifact(RAW_TCP, &discovery.raw_tcp).await?;
        out.write_artifact(RAW_UDP, &discovery.raw_udp).await?;

        let ext = self.format.extension();
        self.write_matrix(out, &format!("{MATRIX}.{ext}"), &discovery.matrix)
            .await?;

        let partitions = discovery.matrix.by_node_group();
        for (group, matrix) in partitions.iter() {
            self.write_matrix(out, &format!("{MATRIX}-{group}.{ext}"), matrix)
                .await?;
        }

        let diff = match self.expected.as_ref() {
            Some(expected) => {
                let diff = MatrixDiff::new(expected, &discovery.matrix);
                let summary = DiffSummary {
                    unique_to_expected: diff.unique_to_primary().len(),
                    unique_to_discovered: diff.unique_to_secondary().len(),
                };
                out.write_artifact(DIFF, diff.to_string().as_bytes())
                    .await?;
                info!(
                    unique_to_expected = summary.unique_to_expected,
                    unique_to_discovered = summary.unique_to_discovered,
                    "Compared with expected matrix"
                );
                Some(summary)
            }
            None => None,
        };

        info!(
            flows = discovery.matrix.len(),
            node_groups = partitions.len(),
            "Wrote report"
        );
        Ok(Summary {
            flows: discovery.matrix.len(),
            node_groups: partitions.into_keys().collect(),
            diff,
        })
    }

    async fn write_matrix<W: WriteArtifact + ?Sized>(
        &self,
        out: &W,
        name: &str,
        matrix: &FlowMatrix,
    ) -> Result<()> {
        let encoded = matrix
            .encode(self.format)
            .with_context(|| format!("encoding {name}"))?;
        out.write_artifact(name, &encoded).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use port_audit_core::{FlowRecord, Protocol};
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Memory(Mutex<BTreeMap<String, Vec<u8>>>);

    #[async_trait::async_trait]
    impl WriteArtifact for Memory {
        async fn write_artifact(&self, name: &str, contents: &[u8]) -> Result<()> {
            self.0.lock().insert(name.to_string(), contents.to_vec());
            Ok(())
        }
    }

    impl Memory {
        fn names(&self) -> Vec<String> {
            self.0.lock().keys().cloned().collect()
        }

        fn text(&self, name: &str) -> String {
            let artifacts = self.0.lock();
            let bytes = artifacts.get(name).expect("artifact must be written");
            String::from_utf8(bytes.clone()).expect("artifact must be utf-8")
        }
    }

    fn flow(group: &str, protocol: Protocol, port: u16, service: &str) -> FlowRecord {
        FlowRecord {
            service: service.to_string(),
            ..FlowRecord::ingress(group, protocol, port)
        }
    }

    fn discovery() -> Discovery {
        Discovery {
            matrix: FlowMatrix::canonical(vec![
                flow("worker", Protocol::Udp, 40000, "rpc.statd"),
                flow("worker", Protocol::Tcp, 22, "sshd"),
                flow("master", Protocol::Tcp, 6443, "kube-apiserver"),
            ]),
            raw_tcp: b"node: worker-0\nLISTEN 0 128 0.0.0.0:22 0.0.0.0:*\n\n".to_vec(),
            raw_udp: b"node: worker-0\n\n".to_vec(),
        }
    }

    #[tokio::test]
    async fn writes_matrix_and_partitions() {
        let out = Memory::default();
        let summary = Report::new(Format::Csv)
            .write(&out, &discovery())
            .await
            .expect("report must be written");

        assert_eq!(
            summary,
            Summary {
                flows: 3,
                node_groups: vec!["master".to_string(), "worker".to_string()],
                diff: None,
            }
        );
        assert_eq!(
            out.names(),
            [
                "raw-ss-tcp",
                "raw-ss-udp",
                "ss-generated-matrix-master.csv",
                "ss-generated-matrix-worker.csv",
                "ss-generated-matrix.csv",
            ]
        );
        assert_eq!(
            out.text("raw-ss-tcp"),
            "node: worker-0\nLISTEN 0 128 0.0.0.0:22 0.0.0.0:*\n\n"
        );
        assert_eq!(
            out.text("ss-generated-matrix-worker.csv"),
            "Direction,Protocol,Port,Namespace,Service,Pod,Container,NodeGroup,Optional\n\
             Ingress,TCP,22,,sshd,,,worker,false\n\
             Ingress,UDP,40000,,rpc.statd,,,worker,false\n"
        );
    }

    #[tokio::test]
    async fn writes_diff_against_expected() {
        let expected = FlowMatrix::canonical(vec![
            flow("master", Protocol::Tcp, 6443, "kube-apiserver"),
            flow("worker", Protocol::Tcp, 9100, "node-exporter"),
        ]);

        let out = Memory::default();
        let summary = Report::new(Format::Json)
            .with_expected(Some(expected))
            .write(&out, &discovery())
            .await
            .expect("report must be written");

        assert_eq!(
            summary.diff,
            Some(DiffSummary {
                unique_to_expected: 1,
                unique_to_discovered: 2,
            })
        );
        assert!(out.names().contains(&"ss-generated-matrix.json".to_string()));
        assert_eq!(
            out.text(DIFF),
            "Direction,Protocol,Port,Namespace,Service,Pod,Container,NodeGroup,Optional\n\
             Ingress,TCP,6443,,kube-apiserver,,,master,false\n\
             + Ingress,TCP,9100,,node-exporter,,,worker,false\n\
             - Ingress,TCP,22,,sshd,,,worker,false\n"
        );
    }

    #[tokio::test]
    async fn loads_expected() {
        let path = std::env::temp_dir().join(format!("port-audit-expected-{}.yml", std::process::id()));
        tokio::fs::write(
            &path,
            "- direction: Ingress\n  protocol: UDP\n  port: 53\n  nodeGroup: worker\n  optional: false\n\
             - direction: Ingress\n  protocol: TCP\n  port: 22\n  nodeGroup: worker\n  optional: false\n",
        )
        .await
        .expect("must write fixture");

        let matrix = Report::load_expected(&path)
            .await
            .expect("must load matrix");
        tokio::fs::remove_file(&path).await.expect("must clean up");

        let ports = matrix
            .records
            .iter()
            .map(|r| (r.protocol, r.port))
            .collect::<Vec<_>>();
        assert_eq!(ports, [(Protocol::Tcp, 22), (Protocol::Udp, 53)]);

        let missing = Report::load_expected(Path::new("/nonexistent/expected.csv")).await;
        assert!(missing.is_err());
        let unknown = Report::load_expected(Path::new("/nonexistent/expected.txt")).await;
        assert!(unknown.is_err());
    }
}
