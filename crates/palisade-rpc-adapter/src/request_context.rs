use http::{Extensions, HeaderMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// W3C trace-context headers carried by the inbound HTTP request.
#[derive(Debug, Clone, Default)]
pub struct TraceContextHeaders {
    pub traceparent: Option<String>,
    pub tracestate: Option<String>,
    pub baggage: Option<String>,
}

/// Remote end of the TCP connection the request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Address every per-client policy is keyed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

const UNKNOWN_IP: &str = "unknown";

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
}

/// The caller behind `peer`.
///
/// Forwarding headers are only believed when `peer` is a trusted proxy. `X-Forwarded-For` is
/// read right to left, skipping trusted hops, so entries a client prepends never win.
/// `X-Real-IP` is consulted only without `X-Forwarded-For`.
pub fn resolve_client_ip(peer: IpAddr, headers: &HeaderMap, trusted: &[IpAddr]) -> IpAddr {
    if !trusted.contains(&peer) {
        return peer;
    }
    if let Some(forwarded) = header(headers, "x-forwarded-for") {
        let mut client = peer;
        for hop in forwarded.rsplit(',').map(str::trim) {
            let Ok(ip) = hop.parse::<IpAddr>() else {
                break;
            };
            client = ip;
            if !trusted.contains(&ip) {
                break;
            }
        }
        return client;
    }
    header(headers, "x-real-ip")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(peer)
}

/// Stash everything the RPC handlers need from the HTTP layer into the request extensions.
pub fn capture(headers: &HeaderMap, trusted: &[IpAddr], extensions: &mut Extensions) {
    extensions.insert(TraceContextHeaders {
        traceparent: header(headers, "traceparent"),
        tracestate: header(headers, "tracestate"),
        baggage: header(headers, "baggage"),
    });
    if let Some(PeerAddr(peer)) = extensions.get::<PeerAddr>().copied() {
        let ip = resolve_client_ip(peer.ip(), headers, trusted);
        extensions.insert(ClientIp(ip.to_string()));
    }
}

/// `"unknown"` only for calls that did not come through a socket.
pub fn client_ip(extensions: &Extensions) -> &str {
    extensions
        .get::<ClientIp>()
        .map(|ip| ip.0.as_str())
        .unwrap_or(UNKNOWN_IP)
}

/// Tags every request on one connection with that connection's peer address.
#[derive(Debug, Clone)]
pub struct WithPeer<S> {
    inner: S,
    peer: SocketAddr,
}

impl<S> WithPeer<S> {
    pub fn new(inner: S, peer: SocketAddr) -> Self {
        Self { inner, peer }
    }
}

impl<S, B> Service<http::Request<B>> for WithPeer<S>
where
    S: Service<http::Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: http::Request<B>) -> Self::Future {
        request.extensions_mut().insert(PeerAddr(self.peer));
        self.inner.call(request)
    }
}

#[derive(Debug, Clone)]
pub struct RequestContextLayer {
    trusted_proxies: Arc<[IpAddr]>,
}

impl RequestContextLayer {
    pub fn new(trusted_proxies: Vec<IpAddr>) -> Self {
        Self {
            trusted_proxies: trusted_proxies.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestContextService<S> {
    inner: S,
    trusted_proxies: Arc<[IpAddr]>,
}

impl<S> Layer<S> for RequestContextLayer {
    type Service = RequestContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestContextService {
            inner,
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

impl<S, B> Service<http::Request<B>> for RequestContextService<S>
where
    S: Service<http::Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: http::Request<B>) -> Self::Future {
        let headers = request.headers().clone();
        capture(&headers, &self.trusted_proxies, request.extensions_mut());
        self.inner.call(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn from_peer(peer: &str) -> Extensions {
        let mut extensions = Extensions::new();
        extensions.insert(PeerAddr(SocketAddr::new(ip(peer), 50_000)));
        extensions
    }

    #[test]
    fn untrusted_peer_cannot_claim_another_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("127.0.0.1"));
        headers.insert("x-real-ip", HeaderValue::from_static("127.0.0.1"));

        let mut extensions = from_peer("203.0.113.9");
        capture(&headers, &[], &mut extensions);
        assert_eq!(client_ip(&extensions), "203.0.113.9");

        let mut extensions = from_peer("203.0.113.9");
        capture(&headers, &[ip("10.0.0.2")], &mut extensions);
        assert_eq!(client_ip(&extensions), "203.0.113.9");
    }

    #[test]
    fn trusted_proxy_forwards_the_nearest_untrusted_hop() {
        let proxy = ip("10.0.0.2");
        let mut headers = HeaderMap::new();
        // The client prepended a fake entry; the proxy appended the real one.
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("127.0.0.1, 198.51.100.4, 10.0.0.3"),
        );
        let trusted = [proxy, ip("10.0.0.3")];
        assert_eq!(resolve_client_ip(proxy, &headers, &trusted), ip("198.51.100.4"));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.2"));
        assert_eq!(resolve_client_ip(proxy, &headers, &trusted), ip("198.51.100.2"));

        assert_eq!(resolve_client_ip(proxy, &HeaderMap::new(), &trusted), proxy);
    }

    #[test]
    fn garbage_forwarding_headers_fall_back_to_the_peer() {
        let proxy = ip("10.0.0.2");
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(resolve_client_ip(proxy, &headers, &[proxy]), proxy);
    }

    #[test]
    fn without_a_socket_the_caller_is_unknown() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.4"));
        let mut extensions = Extensions::new();
        capture(&headers, &[], &mut extensions);
        assert_eq!(client_ip(&extensions), "unknown");
        assert!(extensions.get::<TraceContextHeaders>().is_some());
    }

    #[test]
    fn trace_headers_are_captured() {
        let mut headers = HeaderMap::new();
        headers.insert("tracestate", HeaderValue::from_static("dd=s:1"));
        headers.insert("baggage", HeaderValue::from_static("k=v"));

        let mut extensions = from_peer("192.0.2.1");
        capture(&headers, &[], &mut extensions);
        let stored = extensions.get::<TraceContextHeaders>().unwrap();
        assert_eq!(stored.traceparent, None);
        assert_eq!(stored.tracestate.as_deref(), Some("dd=s:1"));
        assert_eq!(stored.baggage.as_deref(), Some("k=v"));
        assert_eq!(client_ip(&extensions), "192.0.2.1");
    }
}
