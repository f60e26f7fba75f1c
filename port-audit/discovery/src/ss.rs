//! Parsing of `ss` socket tables.

use crate::{loopback::LoopbackFilter, resolve::Attribution};
use once_cell::sync::Lazy;
use port_audit_core::Protocol;
use regex::Regex;
use tracing::{debug, trace};

/// Dumps listening TCP sockets, numerically and with owning processes.
pub const TCP_DUMP: &[&str] = &["ss", "-Htlnp"];

/// Dumps bound UDP sockets, numerically and with owning processes.
pub const UDP_DUMP: &[&str] = &["ss", "-Hulnp"];

/// `State Recv-Q Send-Q Local:Port Peer:Port Process`
const LOCAL_COLUMN: usize = 3;

static USERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"users:\(\("(?P<name>[^"]+)""#).expect("users pattern must compile"));

static PID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"pid=(?P<pid>\d+)").expect("pid pattern must compile"));

/// One socket from a socket table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SocketEntry {
    pub protocol: Protocol,
    /// The `<address>:<port>` local endpoint as printed.
    pub local: String,
    pub port: u16,
    pub pid: Option<u32>,
    /// The owning program's name, or empty if the table did not show it.
    pub service: String,
    /// Filled in once the owning container is resolved.
    pub attribution: Attribution,
}

/// Extraction rules for whitespace-separated socket tables.
#[derive(Clone, Debug)]
pub struct SocketTable {
    local_column: usize,
    users: Regex,
    pid: Regex,
}

// === impl SocketTable ===

impl Default for SocketTable {
    fn default() -> Self {
        Self {
            local_column: LOCAL_COLUMN,
            users: USERS.clone(),
            pid: PID.clone(),
        }
    }
}

impl SocketTable {
    /// Overrides the extraction rules.
    ///
    /// `users` must have a `name` capture group and `pid` a `pid` capture
    /// group.
    pub fn new(local_column: usize, users: Regex, pid: Regex) -> Self {
        Self {
            local_column,
            users,
            pid,
        }
    }

    /// Parses a raw socket table, skipping loopback-only sockets and lines
    /// that cannot be parsed.
    pub fn parse(&self, protocol: Protocol, raw: &str, lo: &LoopbackFilter) -> Vec<SocketEntry> {
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| {
                let local = self.local(line)?;
                if lo.is_loopback_endpoint(local) {
                    trace!(%line, "Skipping loopback socket");
                    return None;
                }
                self.parse_line(protocol, line)
            })
            .collect()
    }

    /// Parses a single line without any loopback filtering.
    pub fn parse_line(&self, protocol: Protocol, line: &str) -> Option<SocketEntry> {
        let local = self.local(line)?;

        let port = match local.rsplit_once(':').map(|(_, p)| p.parse::<u16>()) {
            Some(Ok(port)) => port,
            Some(Err(error)) => {
                debug!(%line, %error, "Skipping socket with invalid port");
                return None;
            }
            None => {
                debug!(%line, "Skipping socket without a port");
                return None;
            }
        };

        let service = match self.users.captures(line).and_then(|c| c.name("name")) {
            Some(name) => name.as_str().to_string(),
            None => {
                debug!(%line, "No owning process");
                String::new()
            }
        };

        let pid = self
            .pid
            .captures(line)
            .and_then(|c| c.name("pid"))
            .and_then(|p| p.as_str().parse().ok());

        Some(SocketEntry {
            protocol,
            local: local.to_string(),
            port,
            pid,
            service,
            attribution: Attribution::default(),
        })
    }

    fn local<'l>(&self, line: &'l str) -> Option<&'l str> {
        let local = line.split_whitespace().nth(self.local_column);
        if local.is_none() {
            debug!(%line, "Skipping short line");
        }
        local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Case {
        line: &'static str,
        local: &'static str,
        port: u16,
        pid: Option<u32>,
        service: &'static str,
    }

    const TCP: &[Case] = &[
        Case {
            line: r#"LISTEN 0      4096         0.0.0.0:9100       0.0.0.0:*    users:(("node_exporter",pid=4120,fd=3))"#,
            local: "0.0.0.0:9100",
            port: 9100,
            pid: Some(4120),
            service: "node_exporter",
        },
        Case {
            line: r#"LISTEN 0      128              [::]:22           [::]:*    users:(("sshd",pid=1215,fd=4))"#,
            local: "[::]:22",
            port: 22,
            pid: Some(1215),
            service: "sshd",
        },
        Case {
            line: r#"LISTEN 0      4096               *:10250            *:*    users:(("kubelet",pid=2870,fd=29))"#,
            local: "*:10250",
            port: 10250,
            pid: Some(2870),
            service: "kubelet",
        },
        Case {
            line: r#"LISTEN 0      4096  [fe80::5054:ff:fe12:3456]%enp1s0:9537  [::]:*  users:(("crio",pid=2301,fd=12))"#,
            local: "[fe80::5054:ff:fe12:3456]%enp1s0:9537",
            port: 9537,
            pid: Some(2301),
            service: "crio",
        },
        Case {
            line: "LISTEN 0      4096         0.0.0.0:2049       0.0.0.0:*",
            local: "0.0.0.0:2049",
            port: 2049,
            pid: None,
            service: "",
        },
    ];

    const UDP: &[Case] = &[
        Case {
            line: r#"UNCONN 0      0            0.0.0.0:111        0.0.0.0:*    users:(("rpcbind",pid=1012,fd=5),("systemd",pid=1,fd=60))"#,
            local: "0.0.0.0:111",
            port: 111,
            pid: Some(1012),
            service: "rpcbind",
        },
        Case {
            line: r#"UNCONN 0      0       10.46.97.104:500        0.0.0.0:*    users:(("pluto",pid=2115,fd=21))"#,
            local: "10.46.97.104:500",
            port: 500,
            pid: Some(2115),
            service: "pluto",
        },
        Case {
            line: r#"UNCONN 0      0                 [::]:4789          [::]:*"#,
            local: "[::]:4789",
            port: 4789,
            pid: None,
            service: "",
        },
    ];

    #[test]
    fn corpus() {
        let table = SocketTable::default();
        for (protocol, cases) in [(Protocol::Tcp, TCP), (Protocol::Udp, UDP)] {
            for case in cases {
                let entry = table
                    .parse_line(protocol, case.line)
                    .unwrap_or_else(|| panic!("must parse: {}", case.line));
                assert_eq!(entry.protocol, protocol, "{}", case.line);
                assert_eq!(entry.local, case.local, "{}", case.line);
                assert_eq!(entry.port, case.port, "{}", case.line);
                assert_eq!(entry.pid, case.pid, "{}", case.line);
                assert_eq!(entry.service, case.service, "{}", case.line);
                assert_eq!(entry.attribution, Attribution::default());
            }
        }
    }

    #[test]
    fn drops_unparseable_lines() {
        let table = SocketTable::default();
        for line in [
            "State  Recv-Q Send-Q Local Address:Port Peer Address:Port Process",
            "LISTEN 0 4096 0.0.0.0:http 0.0.0.0:*",
            "LISTEN 0 4096 0.0.0.0:70000 0.0.0.0:*",
            "LISTEN 0 4096",
            "garbage",
        ] {
            assert_eq!(table.parse_line(Protocol::Tcp, line), None, "{line}");
        }
    }

    #[test]
    fn filters_loopback_tcp() {
        let raw = r#"LISTEN 0      4096       127.0.0.1:8797       0.0.0.0:*    users:(("machine-config-",pid=3388,fd=7))
LISTEN 0      4096       127.0.0.1:8798       0.0.0.0:*    users:(("machine-config-",pid=3388,fd=9))
LISTEN 0      4096         0.0.0.0:9100       0.0.0.0:*    users:(("node_exporter",pid=4120,fd=3))
"#;
        let entries = SocketTable::default().parse(Protocol::Tcp, raw, &LoopbackFilter::default());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].local, "0.0.0.0:9100");
        assert_eq!(entries[0].service, "node_exporter");
    }

    #[test]
    fn filters_loopback_aliases() {
        let raw = r#"
UNCONN 0      0          127.0.0.1:323        0.0.0.0:*    users:(("chronyd",pid=1030,fd=5))
UNCONN 0      0              [::1]:323           [::]:*    users:(("chronyd",pid=1030,fd=6))
UNCONN 0      0         172.20.0.1:53         0.0.0.0:*    users:(("coredns",pid=5120,fd=9))
UNCONN 0      0           10.0.0.5:53         0.0.0.0:*    users:(("coredns",pid=5120,fd=10))
"#;
        let table = SocketTable::default();

        let entries = table.parse(Protocol::Udp, raw, &LoopbackFilter::default());
        let locals = entries.iter().map(|e| e.local.as_str()).collect::<Vec<_>>();
        assert_eq!(locals, vec!["172.20.0.1:53", "10.0.0.5:53"]);

        let lo = LoopbackFilter::new(vec!["172.20.0.1".parse().unwrap()]);
        let entries = table.parse(Protocol::Udp, raw, &lo);
        let locals = entries.iter().map(|e| e.local.as_str()).collect::<Vec<_>>();
        assert_eq!(locals, vec!["10.0.0.5:53"]);
    }

    #[test]
    fn custom_rules() {
        // A layout with the local endpoint in the first column.
        let table = SocketTable::new(
            0,
            Regex::new(r"prog=(?P<name>\S+)").unwrap(),
            Regex::new(r"proc=(?P<pid>\d+)").unwrap(),
        );
        let entry = table
            .parse_line(Protocol::Tcp, "0.0.0.0:8080 prog=haproxy proc=77")
            .unwrap();
        assert_eq!(entry.port, 8080);
        assert_eq!(entry.service, "haproxy");
        assert_eq!(entry.pid, Some(77));
    }
}
