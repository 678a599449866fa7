use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;

/// Per-channel capability registry.
///
/// A channel *is* a byte endpoint and *has* TLS/ALPN/etc. capabilities
/// orthogonally. Capabilities are registered at channel construction; a
/// missing entry means the feature is absent on this channel, not that the
/// lookup was invalid.
#[derive(Default)]
pub struct ServiceMap {
    map: HashMap<TypeId, Rc<dyn Any>>,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: 'static>(&mut self, service: T) -> &mut Self {
        self.map.insert(TypeId::of::<T>(), Rc::new(service));
        self
    }

    pub fn get<T: 'static>(&self) -> Option<Rc<T>> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|rc| Rc::clone(rc).downcast::<T>().ok())
    }

    pub fn has<T: 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }
}

/// Basic TLS facts for a handshaken channel.
#[derive(Debug, Clone)]
pub struct TlsBasic {
    pub protocol: String,
    pub cipher: String,
    pub sni: Option<String>,
    pub session_reused: bool,
}

/// TLS 1.3 early data state.
#[derive(Debug, Clone)]
pub struct TlsEarlyData {
    pub early_data_len: u64,
    pub max_early_data: u32,
    pub recv_max_early_data: u32,
}

impl TlsEarlyData {
    pub const DEFAULT_MAX_EARLY_DATA: u32 = 16384;
}

/// Negotiated application protocol.
#[derive(Debug, Clone)]
pub struct Alpn {
    pub negotiated: Option<String>,
    pub offered: Vec<String>,
}

impl Alpn {
    pub fn http1() -> Self {
        Self {
            negotiated: Some("http/1.1".into()),
            offered: vec!["http/1.1".into(), "http/1.0".into()],
        }
    }
}

/// Session resumption outcome for hit-rate reporting.
#[derive(Debug, Clone)]
pub struct TlsSessionResumption {
    pub resumed: bool,
    pub via_ticket: bool,
}

/// PROXY-protocol facts forwarded by an edge balancer.
#[derive(Debug, Clone)]
pub struct ProxyProtocolInfo {
    pub version: u8,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_service_is_returned() {
        let mut map = ServiceMap::new();
        map.register(Alpn::http1());
        let alpn = map.get::<Alpn>().unwrap();
        assert_eq!(alpn.negotiated.as_deref(), Some("http/1.1"));
        assert!(alpn.offered.contains(&"http/1.0".to_string()));
    }

    #[test]
    fn missing_service_is_none_not_error() {
        let map = ServiceMap::new();
        assert!(map.get::<TlsBasic>().is_none());
        assert!(!map.has::<TlsEarlyData>());
    }

    #[test]
    fn services_are_orthogonal() {
        let mut map = ServiceMap::new();
        map.register(TlsBasic {
            protocol: "TLSv1.3".into(),
            cipher: "TLS_AES_128_GCM_SHA256".into(),
            sni: Some("example.com".into()),
            session_reused: false,
        });
        map.register(TlsEarlyData {
            early_data_len: 0,
            max_early_data: TlsEarlyData::DEFAULT_MAX_EARLY_DATA,
            recv_max_early_data: TlsEarlyData::DEFAULT_MAX_EARLY_DATA,
        });
        assert!(map.has::<TlsBasic>());
        assert!(map.has::<TlsEarlyData>());
        assert!(!map.has::<TlsSessionResumption>());
    }
}
