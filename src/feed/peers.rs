//! Peer records and the inbound connection ACL.
//!
//! A peer is matched by static IP first, then CIDR range, then reverse DNS
//! with forward confirmation: the remote IP's PTR names are resolved
//! forward again and accepted only when one of the answers is the original
//! IP. DNS queries are serialized through a small semaphore so a probe
//! storm cannot amplify into resolver traffic, and every query carries a
//! timeout.

use hickory_resolver::TokioAsyncResolver;
use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::{DnsConfig, PeerConfig};
use crate::error::{Classify, ErrorClass};

use super::pattern::FeedPatterns;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("Peer {peer}: invalid IP address {addr}")]
    InvalidIp { peer: String, addr: String },

    #[error("Peer {peer}: invalid CIDR {cidr}")]
    InvalidCidr { peer: String, cidr: String },

    #[error("Peer {peer}: invalid hostname {hostname}: {reason}")]
    InvalidHostname {
        peer: String,
        hostname: String,
        reason: &'static str,
    },

    #[error("DNS error: {0}")]
    Dns(String),
}

impl Classify for PeerError {
    fn class(&self) -> ErrorClass {
        match self {
            PeerError::Dns(_) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

/// Live per-peer traffic counters.
#[derive(Debug, Default)]
pub struct PeerCounters {
    pub articles_sent: AtomicU64,
    pub articles_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub last_connected_unix: AtomicU64,
}

impl PeerCounters {
    pub fn record_received(&self, bytes: u64) {
        self.articles_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: u64) {
        self.articles_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn touch_connected(&self) {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.last_connected_unix.store(now, Ordering::Relaxed);
    }
}

/// One configured peer: identity, addressing, feed policy, limits.
#[derive(Debug)]
pub struct PeerRecord {
    pub name: String,
    pub hostname: Option<String>,
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
    pub cidr: Vec<IpNet>,
    /// Outbound feed policy (send/exclude/reject).
    pub send_patterns: FeedPatterns,
    /// Inbound accept policy.
    pub accept_patterns: FeedPatterns,
    pub enabled: bool,
    pub require_tls: bool,
    pub max_articles_per_session: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub counters: PeerCounters,
}

impl PeerRecord {
    /// Build and validate from config.
    pub fn from_config(config: &PeerConfig) -> Result<Self, PeerError> {
        let mut ipv4 = Vec::new();
        for addr in &config.ipv4 {
            ipv4.push(addr.parse().map_err(|_| PeerError::InvalidIp {
                peer: config.name.clone(),
                addr: addr.clone(),
            })?);
        }
        let mut ipv6 = Vec::new();
        for addr in &config.ipv6 {
            ipv6.push(addr.parse().map_err(|_| PeerError::InvalidIp {
                peer: config.name.clone(),
                addr: addr.clone(),
            })?);
        }
        let mut cidr = Vec::new();
        for range in &config.cidr {
            cidr.push(range.parse().map_err(|_| PeerError::InvalidCidr {
                peer: config.name.clone(),
                cidr: range.clone(),
            })?);
        }
        if let Some(hostname) = &config.hostname {
            if let Err(reason) = validate_hostname(hostname) {
                return Err(PeerError::InvalidHostname {
                    peer: config.name.clone(),
                    hostname: hostname.clone(),
                    reason,
                });
            }
        }

        Ok(Self {
            name: config.name.clone(),
            hostname: config.hostname.clone(),
            ipv4,
            ipv6,
            cidr,
            send_patterns: FeedPatterns::from_lists(
                &config.send,
                &config.exclude,
                &config.reject,
            ),
            accept_patterns: FeedPatterns::from_lists(&config.accept, &[], &config.reject),
            enabled: config.enabled,
            require_tls: config.require_tls,
            max_articles_per_session: config.max_articles_per_session,
            username: config.username.clone(),
            password: config.password.clone(),
            counters: PeerCounters::default(),
        })
    }

    /// Static address match (exact IPs, then CIDR ranges).
    pub fn matches_addr(&self, remote: IpAddr) -> bool {
        match remote {
            IpAddr::V4(v4) => {
                if self.ipv4.contains(&v4) {
                    return true;
                }
            }
            IpAddr::V6(v6) => {
                if self.ipv6.contains(&v6) {
                    return true;
                }
            }
        }
        self.cidr.iter().any(|net| net.contains(&remote))
    }
}

/// RFC 1123 hostname validation as applied to peer config.
pub fn validate_hostname(hostname: &str) -> Result<(), &'static str> {
    if hostname.is_empty() || hostname.len() > 253 {
        return Err("length must be 1..=253");
    }
    if hostname.parse::<IpAddr>().is_ok() {
        return Err("must not be an IP literal");
    }
    if hostname.eq_ignore_ascii_case("localhost") {
        return Err("must not be localhost");
    }
    if !hostname.contains('.') {
        return Err("must contain a dot");
    }
    for label in hostname.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err("label length must be 1..=63");
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err("labels must be alphanumeric or hyphen");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err("labels must not start or end with a hyphen");
        }
    }
    Ok(())
}

/// The peer table plus the DNS plumbing for ACL checks.
pub struct PeerRegistry {
    peers: RwLock<Vec<Arc<PeerRecord>>>,
    resolver: Mutex<Option<TokioAsyncResolver>>,
    dns_sem: Arc<Semaphore>,
    dns_timeout: Duration,
}

impl PeerRegistry {
    pub fn from_config(configs: &[PeerConfig], dns: &DnsConfig) -> Result<Self, PeerError> {
        let mut peers = Vec::with_capacity(configs.len());
        for config in configs {
            peers.push(Arc::new(PeerRecord::from_config(config)?));
        }
        Ok(Self {
            peers: RwLock::new(peers),
            resolver: Mutex::new(None),
            dns_sem: Arc::new(Semaphore::new(dns.parallel.max(1))),
            dns_timeout: Duration::from_secs(dns.timeout_seconds),
        })
    }

    pub fn peers(&self) -> Vec<Arc<PeerRecord>> {
        self.peers.read().clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<PeerRecord>> {
        self.peers.read().iter().find(|p| p.name == name).cloned()
    }

    fn resolver(&self) -> Result<TokioAsyncResolver, PeerError> {
        let mut slot = self.resolver.lock();
        if let Some(resolver) = slot.as_ref() {
            return Ok(resolver.clone());
        }
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| PeerError::Dns(e.to_string()))?;
        *slot = Some(resolver.clone());
        Ok(resolver)
    }

    /// Decide whether `remote` may connect, and as which peer.
    ///
    /// Static IPs and CIDR ranges are consulted first; peers with a
    /// configured hostname get a forward-confirmed reverse-DNS check as the
    /// last resort. Returns `None` when no enabled peer matches.
    #[tracing::instrument(name = "peer.acl", skip(self), fields(%remote))]
    pub async fn check_connection_acl(&self, remote: IpAddr) -> Option<Arc<PeerRecord>> {
        let peers = self.peers();

        for peer in peers.iter().filter(|p| p.enabled) {
            if peer.matches_addr(remote) {
                tracing::info!(peer = %peer.name, "Connection matched peer by address");
                peer.counters.touch_connected();
                return Some(peer.clone());
            }
        }

        // Reverse DNS only when some enabled peer could match by hostname.
        let hostname_peers: Vec<_> = peers
            .iter()
            .filter(|p| p.enabled && p.hostname.is_some())
            .cloned()
            .collect();
        if !hostname_peers.is_empty() {
            if let Some(confirmed) = self.rdns_confirm(remote).await {
                for peer in &hostname_peers {
                    let expected = peer.hostname.as_deref().unwrap_or_default();
                    if confirmed.eq_ignore_ascii_case(expected) {
                        tracing::info!(
                            peer = %peer.name,
                            hostname = %confirmed,
                            "Connection matched peer by forward-confirmed RDNS"
                        );
                        peer.counters.touch_connected();
                        return Some(peer.clone());
                    }
                }
            }
        }

        tracing::warn!("Connection rejected by peer ACL");
        None
    }

    /// Reverse-resolve `remote` and forward-confirm the candidates.
    /// Returns the first hostname whose forward lookup contains `remote`.
    async fn rdns_confirm(&self, remote: IpAddr) -> Option<String> {
        let resolver = match self.resolver() {
            Ok(resolver) => resolver,
            Err(e) => {
                tracing::warn!(error = %e, "Resolver unavailable, skipping RDNS");
                return None;
            }
        };

        // All queries funnel through the semaphore.
        let _permit = self.dns_sem.acquire().await.ok()?;

        let reverse = tokio::time::timeout(self.dns_timeout, resolver.reverse_lookup(remote))
            .await
            .ok()?
            .ok()?;

        for name in reverse.iter() {
            let candidate = name.to_utf8();
            let candidate = candidate.trim_end_matches('.').to_ascii_lowercase();
            if validate_hostname(&candidate).is_err() {
                tracing::debug!(%candidate, "Skipping invalid PTR candidate");
                continue;
            }
            let forward =
                tokio::time::timeout(self.dns_timeout, resolver.lookup_ip(candidate.as_str()))
                    .await;
            let Ok(Ok(addresses)) = forward else {
                continue;
            };
            if addresses.iter().any(|ip| ip == remote) {
                return Some(candidate);
            }
            tracing::debug!(%candidate, "PTR candidate failed forward confirmation");
        }
        None
    }
}
