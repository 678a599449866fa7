use std::collections::HashMap;
use std::net::SocketAddr;
use strata_io::{ContId, Event, Reactor};

/// Resolver completion, posted as `Event::HostLookup`.
pub struct HostLookupResult {
    pub token: u64,
    pub host: String,
    pub port: u16,
    /// Candidate addresses, IPv4 first. Empty means resolution failed.
    pub addrs: Vec<SocketAddr>,
}

/// Host lookup front. Resolution itself is a blocking `ToSocketAddrs` call:
/// it only runs off the steady-state hot path (connect time, after pool
/// miss), and the completion is still delivered asynchronously so DNS-order
/// effects stay observable.
#[derive(Default)]
pub struct Resolver {
    overrides: HashMap<String, Vec<SocketAddr>>,
    /// When false, only overrides and IP literals resolve (tests).
    pub use_system_dns: bool,
}

impl Resolver {
    pub fn new() -> Self {
        Self { overrides: HashMap::new(), use_system_dns: true }
    }

    pub fn with_overrides(overrides: HashMap<String, Vec<SocketAddr>>) -> Self {
        Self { overrides, use_system_dns: false }
    }

    pub fn add_override(&mut self, host: &str, addrs: Vec<SocketAddr>) {
        self.overrides.insert(host.to_string(), addrs);
    }

    /// Resolve and post a `HostLookup` completion to `cont`.
    pub fn resolve(&self, rx: &mut Reactor, cont: ContId, host: &str, port: u16, token: u64) {
        let addrs = self.lookup(host, port);
        if addrs.is_empty() {
            tracing::warn!(host = host, port = port, "Host lookup failed");
        }
        rx.post_completion(
            cont,
            Event::HostLookup,
            HostLookupResult { token, host: host.to_string(), port, addrs },
        );
    }

    fn lookup(&self, host: &str, port: u16) -> Vec<SocketAddr> {
        if let Some(addrs) = self.overrides.get(host) {
            return addrs.clone();
        }
        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            return vec![SocketAddr::new(ip, port)];
        }
        if !self.use_system_dns {
            return Vec::new();
        }
        use std::net::ToSocketAddrs;
        let all: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
            Ok(iter) => iter.collect(),
            Err(_) => return Vec::new(),
        };
        // IPv4 first: `localhost` often resolves to ::1 first while most
        // upstreams listen on IPv4 only.
        let mut sorted: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv4()).collect();
        sorted.extend(all.iter().copied().filter(|a| a.is_ipv6()));
        sorted
    }
}

/// Per-transaction next-hop cursor: the parent-proxy override, then each
/// configured parent, then (when no parents are configured) the origin
/// itself. Exhaustion surfaces as 502.
pub struct NextHopSelector {
    hops: Vec<(String, u16)>,
    cursor: usize,
    via_parent: bool,
}

impl NextHopSelector {
    pub fn new(
        origin_host: &str,
        origin_port: u16,
        parents: &[String],
        parent_override: Option<(String, u16)>,
    ) -> Self {
        let mut hops = Vec::new();
        if let Some((host, port)) = parent_override {
            hops.push((host, port));
        }
        for parent in parents {
            if let Some((host, port)) = split_host_port(parent) {
                hops.push((host, port));
            }
        }
        let via_parent = !hops.is_empty();
        if hops.is_empty() {
            hops.push((origin_host.to_string(), origin_port));
        }
        Self { hops, cursor: 0, via_parent }
    }

    /// Whether next hops are parent proxies (the absolute-form request
    /// target must be preserved for parents).
    pub fn via_parent(&self) -> bool {
        self.via_parent
    }

    pub fn current(&self) -> Option<&(String, u16)> {
        self.hops.get(self.cursor)
    }

    pub fn advance(&mut self) -> Option<&(String, u16)> {
        self.cursor += 1;
        self.hops.get(self.cursor)
    }

    pub fn exhausted(&self) -> bool {
        self.cursor >= self.hops.len()
    }
}

pub fn split_host_port(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}
