use crate::{flow::FlowRecord, format::write_row, matrix::FlowMatrix, COLUMNS};
use std::fmt;

/// Services that register on random ports and never belong in policy.
///
/// `rpc.statd` (the NFS status monitor) picks a fresh port on every start.
const NOISE_SERVICES: &[&str] = &["rpc.statd"];

/// The identity-keyed difference between two matrices.
#[derive(Clone, Debug)]
pub struct MatrixDiff<'a> {
    primary: &'a FlowMatrix,
    secondary: &'a FlowMatrix,
}

// === impl MatrixDiff ===

impl<'a> MatrixDiff<'a> {
    pub fn new(primary: &'a FlowMatrix, secondary: &'a FlowMatrix) -> Self {
        Self { primary, secondary }
    }

    /// Records in the primary matrix with no identity match in the secondary.
    pub fn unique_to_primary(&self) -> Vec<&'a FlowRecord> {
        unique(self.primary, self.secondary)
    }

    /// Records in the secondary matrix with no identity match in the primary.
    pub fn unique_to_secondary(&self) -> Vec<&'a FlowRecord> {
        unique(self.secondary, self.primary)
    }

    pub fn is_empty(&self) -> bool {
        self.unique_to_primary().is_empty() && self.unique_to_secondary().is_empty()
    }
}

fn unique<'a>(from: &'a FlowMatrix, against: &FlowMatrix) -> Vec<&'a FlowRecord> {
    let keys = against.keys();
    from.records
        .iter()
        .filter(|r| !keys.contains(&r.key()))
        .collect()
}

fn is_noise(record: &FlowRecord) -> bool {
    NOISE_SERVICES.contains(&record.service.as_str())
}

/// Renders a line-oriented report.
///
/// After a header row, every primary record is listed, prefixed with `+`
/// when it has no match in the secondary matrix. Secondary-only records
/// follow, prefixed with `-`, except for known noise services.
impl fmt::Display for MatrixDiff<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_row(f, &COLUMNS)?;
        f.write_str("\n")?;

        let secondary = self.secondary.keys();
        for record in self.primary.records.iter() {
            if secondary.contains(&record.key()) {
                writeln!(f, "{record}")?;
            } else {
                writeln!(f, "+ {record}")?;
            }
        }

        for record in self.unique_to_secondary() {
            if is_noise(record) {
                continue;
            }
            writeln!(f, "- {record}")?;
        }

        Ok(())
    }
}
