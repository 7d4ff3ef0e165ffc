//! Public address tracking.
//!
//! Resolves the host this instance should advertise to the rendezvous
//! service. Lookup failures never surface as errors: they yield
//! [`PublicAddress::Unknown`], which callers treat as "unchanged".

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for a single HTTP address lookup.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a public address lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicAddress {
    /// A resolved `host:port` address.
    Known(String),
    /// The lookup failed or no source is configured.
    Unknown,
}

impl PublicAddress {
    pub fn as_known(&self) -> Option<&str> {
        match self {
            PublicAddress::Known(addr) => Some(addr),
            PublicAddress::Unknown => None,
        }
    }
}

/// Something that can report this host's externally visible host name or IP.
#[async_trait]
pub trait AddressSource: Send + Sync + 'static {
    /// Fetch the current host, or `None` on failure.
    async fn fetch_host(&self) -> Option<String>;
}

/// Asks an HTTP echo service (e.g. `https://api.ipify.org`) for our IP.
pub struct HttpAddressSource {
    url: String,
    client: reqwest::Client,
}

impl HttpAddressSource {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl AddressSource for HttpAddressSource {
    async fn fetch_host(&self) -> Option<String> {
        let resp = match self.client.get(&self.url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(url = %self.url, error = %e, "Public address lookup failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(url = %self.url, status = %resp.status(), "Public address lookup rejected");
            return None;
        }
        let body = resp.text().await.ok()?;
        match body.trim().parse::<IpAddr>() {
            Ok(ip) => Some(ip.to_string()),
            Err(_) => {
                warn!(url = %self.url, "Public address service returned a non-IP body");
                None
            }
        }
    }
}

/// A fixed host, for deployments with a known public name.
pub struct StaticAddressSource(pub String);

#[async_trait]
impl AddressSource for StaticAddressSource {
    async fn fetch_host(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Periodically re-resolved public address of this instance.
pub struct PublicAddressTracker {
    source: Option<Box<dyn AddressSource>>,
    port: AtomicU16,
    last: Mutex<PublicAddress>,
}

impl PublicAddressTracker {
    /// Track the address `<host from source>:<port>`.
    pub fn new(source: Option<Box<dyn AddressSource>>, port: u16) -> Self {
        Self {
            source,
            port: AtomicU16::new(port),
            last: Mutex::new(PublicAddress::Unknown),
        }
    }

    /// Change the advertised port, e.g. once the listener is bound.
    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }

    /// Resolve the current address. Never fails; yields `Unknown` instead.
    pub async fn resolve(&self) -> PublicAddress {
        let Some(source) = &self.source else {
            return PublicAddress::Unknown;
        };
        let port = self.port.load(Ordering::Relaxed);
        let resolved = match source.fetch_host().await {
            Some(host) if host.contains(':') && !host.starts_with('[') => {
                PublicAddress::Known(format!("[{host}]:{port}"))
            }
            Some(host) => PublicAddress::Known(format!("{host}:{port}")),
            None => PublicAddress::Unknown,
        };
        if let PublicAddress::Known(addr) = &resolved {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            if last.as_known() != Some(addr.as_str()) {
                debug!(address = %addr, "Public address resolved");
            }
            *last = resolved.clone();
        }
        resolved
    }

    /// The most recent known address, if any.
    pub fn last_known(&self) -> PublicAddress {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns scripted hosts in order, then repeats the last one.
    struct Scripted {
        hosts: Vec<Option<String>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AddressSource for Scripted {
        async fn fetch_host(&self) -> Option<String> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            self.hosts[i.min(self.hosts.len() - 1)].clone()
        }
    }

    #[tokio::test]
    async fn test_no_source_is_unknown() {
        let tracker = PublicAddressTracker::new(None, 4000);
        assert_eq!(tracker.resolve().await, PublicAddress::Unknown);
    }

    #[tokio::test]
    async fn test_static_source() {
        let tracker = PublicAddressTracker::new(
            Some(Box::new(StaticAddressSource("realm.example.com".into()))),
            4000,
        );
        assert_eq!(
            tracker.resolve().await,
            PublicAddress::Known("realm.example.com:4000".into())
        );
    }

    #[tokio::test]
    async fn test_failure_keeps_last_known() {
        let tracker = PublicAddressTracker::new(
            Some(Box::new(Scripted {
                hosts: vec![Some("203.0.113.7".into()), None],
                calls: AtomicUsize::new(0),
            })),
            4000,
        );
        assert_eq!(
            tracker.resolve().await,
            PublicAddress::Known("203.0.113.7:4000".into())
        );
        assert_eq!(tracker.resolve().await, PublicAddress::Unknown);
        assert_eq!(
            tracker.last_known(),
            PublicAddress::Known("203.0.113.7:4000".into())
        );
    }

    #[tokio::test]
    async fn test_port_follows_listener() {
        let tracker = PublicAddressTracker::new(
            Some(Box::new(StaticAddressSource("127.0.0.1".into()))),
            0,
        );
        tracker.set_port(41234);
        assert_eq!(
            tracker.resolve().await,
            PublicAddress::Known("127.0.0.1:41234".into())
        );
    }

    #[tokio::test]
    async fn test_ipv6_bracketed() {
        let tracker =
            PublicAddressTracker::new(Some(Box::new(StaticAddressSource("2001:db8::1".into()))), 4000);
        assert_eq!(
            tracker.resolve().await,
            PublicAddress::Known("[2001:db8::1]:4000".into())
        );
    }

    #[tokio::test]
    async fn test_http_source_unreachable_is_none() {
        // Port 9 on localhost is the discard port and is almost never served over HTTP.
        let source = HttpAddressSource::new("http://127.0.0.1:9/");
        assert_eq!(source.fetch_host().await, None);
    }
}
