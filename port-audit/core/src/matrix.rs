use crate::flow::{DynamicRange, FlowKey, FlowRecord};
use ahash::AHashSet as HashSet;
use std::collections::BTreeMap;
use tracing::debug;

/// An ordered collection of flows plus the dynamic port ranges that apply
/// alongside them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlowMatrix {
    pub records: Vec<FlowRecord>,
    pub dynamic_ranges: Vec<DynamicRange>,
}

// === impl FlowMatrix ===

impl FlowMatrix {
    pub fn new(records: Vec<FlowRecord>) -> Self {
        Self {
            records,
            dynamic_ranges: Vec::new(),
        }
    }

    pub fn with_dynamic_ranges(mut self, ranges: impl IntoIterator<Item = DynamicRange>) -> Self {
        self.dynamic_ranges.extend(ranges);
        self
    }

    /// Builds a matrix from records and puts it in canonical form.
    pub fn canonical(records: Vec<FlowRecord>) -> Self {
        let mut matrix = Self::new(records);
        matrix.sort_and_remove_duplicates();
        matrix
    }

    /// The number of flow records. Dynamic ranges are not counted.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if there are no flow records, regardless of dynamic ranges.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns true if a record with the same identity as `record` exists.
    pub fn contains(&self, record: &FlowRecord) -> bool {
        self.records.iter().any(|r| r.same_flow(record))
    }

    pub(crate) fn keys(&self) -> HashSet<FlowKey<'_>> {
        self.records.iter().map(FlowRecord::key).collect()
    }

    /// Puts the matrix into canonical form.
    ///
    /// Of all records sharing an identity, only the first in the current
    /// order is kept. Survivors are then ordered by node group, protocol and
    /// port. Dynamic ranges are deduplicated and ordered the same way by
    /// protocol and bounds.
    pub fn sort_and_remove_duplicates(&mut self) {
        let mut seen = HashSet::with_capacity(self.records.len());
        let mut keep = Vec::with_capacity(self.records.len());
        for record in self.records.iter() {
            keep.push(seen.insert(record.key()));
        }
        drop(seen);

        let before = self.records.len();
        let mut keep = keep.into_iter();
        self.records.retain(|_| keep.next().unwrap_or(false));
        if self.records.len() < before {
            debug!(
                duplicates = before - self.records.len(),
                "Removed duplicate flows"
            );
        }
        self.records.sort_by(|a, b| a.key().cmp(&b.key()));

        let mut ranges = HashSet::with_capacity(self.dynamic_ranges.len());
        self.dynamic_ranges.retain(|r| ranges.insert(r.clone()));
        self.dynamic_ranges
            .sort_by_key(|r| (r.protocol, r.min_port, r.max_port));
    }

    /// Splits the matrix into one sub-matrix per node group.
    ///
    /// Every partition carries all of the dynamic ranges, since each pool
    /// needs the same range allowances.
    pub fn by_node_group(&self) -> BTreeMap<String, FlowMatrix> {
        let mut groups = BTreeMap::<String, FlowMatrix>::new();
        for record in self.records.iter() {
            groups
                .entry(record.node_group.clone())
                .or_insert_with(|| FlowMatrix {
                    records: Vec::new(),
                    dynamic_ranges: self.dynamic_ranges.clone(),
                })
                .records
                .push(record.clone());
        }
        groups
    }

    pub fn node_groups(&self) -> Vec<&str> {
        let mut groups = self
            .records
            .iter()
            .map(|r| r.node_group.as_str())
            .collect::<Vec<_>>();
        groups.sort_unstable();
        groups.dedup();
        groups
    }
}

impl FromIterator<FlowRecord> for FlowMatrix {
    fn from_iter<I: IntoIterator<Item = FlowRecord>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl Extend<FlowRecord> for FlowMatrix {
    fn extend<I: IntoIterator<Item = FlowRecord>>(&mut self, iter: I) {
        self.records.extend(iter)
    }
}

#[cfg(test)]
mod tests;
