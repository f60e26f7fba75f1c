use super::*;
use crate::flow::Protocol;

fn rec(group: &str, protocol: Protocol, port: u16, service: &str) -> FlowRecord {
    FlowRecord {
        service: service.to_string(),
        ..FlowRecord::ingress(group, protocol, port)
    }
}

fn fixture() -> Vec<FlowRecord> {
    vec![
        rec("worker", Protocol::Udp, 500, "pluto"),
        rec("master", Protocol::Tcp, 6443, "kube-apiserver"),
        rec("worker", Protocol::Tcp, 22, "sshd"),
        rec("master", Protocol::Udp, 111, "rpcbind"),
        rec("worker", Protocol::Udp, 111, "rpcbind"),
        rec("master", Protocol::Tcp, 22, "sshd"),
        rec("worker", Protocol::Tcp, 22, ""),
        rec("master", Protocol::Tcp, 10250, "kubelet"),
    ]
}

fn keys(m: &FlowMatrix) -> Vec<(String, Protocol, u16)> {
    m.records
        .iter()
        .map(|r| (r.node_group.clone(), r.protocol, r.port))
        .collect()
}

#[test]
fn canonical_order() {
    let m = FlowMatrix::canonical(fixture());
    assert_eq!(
        keys(&m),
        vec![
            ("master".to_string(), Protocol::Tcp, 22),
            ("master".to_string(), Protocol::Tcp, 6443),
            ("master".to_string(), Protocol::Tcp, 10250),
            ("master".to_string(), Protocol::Udp, 111),
            ("worker".to_string(), Protocol::Tcp, 22),
            ("worker".to_string(), Protocol::Udp, 111),
            ("worker".to_string(), Protocol::Udp, 500),
        ]
    );
}

#[test]
fn first_duplicate_wins() {
    let m = FlowMatrix::canonical(fixture());
    let sshd = m
        .records
        .iter()
        .filter(|r| r.node_group == "worker" && r.port == 22)
        .collect::<Vec<_>>();
    assert_eq!(sshd.len(), 1);
    assert_eq!(sshd[0].service, "sshd");

    // Reversing the input flips which duplicate is encountered first.
    let mut reversed = fixture();
    reversed.reverse();
    let m = FlowMatrix::canonical(reversed);
    let sshd = m
        .records
        .iter()
        .find(|r| r.node_group == "worker" && r.port == 22)
        .unwrap();
    assert_eq!(sshd.service, "");
}

#[test]
fn canonicalization_is_idempotent() {
    let once = FlowMatrix::canonical(fixture());
    let mut twice = once.clone();
    twice.sort_and_remove_duplicates();
    assert_eq!(once, twice);
}

#[test]
fn order_is_independent_of_input_order() {
    let expected = keys(&FlowMatrix::canonical(fixture()));
    let mut input = fixture();
    for i in 0..input.len() {
        input.rotate_left(1);
        // Only compare identities: which duplicate survives depends on input
        // order by design.
        assert_eq!(keys(&FlowMatrix::canonical(input.clone())), expected, "rotation {i}");
    }
    input.reverse();
    assert_eq!(keys(&FlowMatrix::canonical(input)), expected);
}

#[test]
fn dynamic_ranges_are_deduplicated_and_sorted() {
    let mut m = FlowMatrix::new(vec![]).with_dynamic_ranges(vec![
        DynamicRange::ingress(Protocol::Udp, 30000, 32767, "node ports"),
        DynamicRange::ingress(Protocol::Tcp, 30000, 32767, "node ports"),
        DynamicRange::ingress(Protocol::Udp, 30000, 32767, "node ports"),
        DynamicRange::ingress(Protocol::Tcp, 9000, 9999, "host level services"),
    ]);
    m.sort_and_remove_duplicates();
    let bounds = m
        .dynamic_ranges
        .iter()
        .map(|r| (r.protocol, r.min_port, r.max_port))
        .collect::<Vec<_>>();
    assert_eq!(
        bounds,
        vec![
            (Protocol::Tcp, 9000, 9999),
            (Protocol::Tcp, 30000, 32767),
            (Protocol::Udp, 30000, 32767),
        ]
    );
}

#[test]
fn partitions_broadcast_dynamic_ranges() {
    let range = DynamicRange::ingress(Protocol::Tcp, 30000, 32767, "node ports");
    let m = FlowMatrix::canonical(fixture()).with_dynamic_ranges(vec![range.clone()]);
    let parts = m.by_node_group();
    assert_eq!(parts.keys().collect::<Vec<_>>(), vec!["master", "worker"]);
    assert_eq!(parts["master"].len(), 4);
    assert_eq!(parts["worker"].len(), 3);
    for part in parts.values() {
        assert_eq!(part.dynamic_ranges, vec![range.clone()]);
        assert!(part.records.windows(2).all(|w| w[0].key() < w[1].key()));
    }
    assert_eq!(m.node_groups(), vec!["master", "worker"]);
}

#[test]
fn contains_uses_identity() {
    let m = FlowMatrix::canonical(fixture());
    assert!(m.contains(&FlowRecord::ingress("master", Protocol::Tcp, 6443)));
    assert!(!m.contains(&FlowRecord::ingress("worker", Protocol::Tcp, 6443)));
}

#[test]
fn length_counts_records_only() {
    let ranges = FlowMatrix::default().with_dynamic_ranges(vec![DynamicRange::ingress(
        Protocol::Tcp,
        30000,
        32767,
        "node ports",
    )]);
    assert_eq!(ranges.len(), 0);
    assert!(ranges.is_empty());
    assert_eq!(ranges.dynamic_ranges.len(), 1);

    let m = FlowMatrix::canonical(fixture());
    assert_eq!(m.len(), m.records.len());
    assert!(!m.is_empty());
}
