use jsonrpsee::server::{serve_with_graceful_shutdown, stop_channel, Methods, Server, ServerHandle};
use std::net::IpAddr;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::request_context::{RequestContextLayer, WithPeer};

/// Serve `methods` on `listener` until the returned handle is stopped.
///
/// Connections are accepted here rather than inside jsonrpsee so each request can be tagged
/// with the socket's peer address before the HTTP middleware runs.
pub fn spawn(
    listener: TcpListener,
    methods: impl Into<Methods>,
    trusted_proxies: Vec<IpAddr>,
) -> ServerHandle {
    let methods: Methods = methods.into();
    let middleware = tower::ServiceBuilder::new().layer(RequestContextLayer::new(trusted_proxies));
    let service_builder = Server::builder()
        .set_http_middleware(middleware)
        .to_service_builder();
    let (stop_handle, server_handle) = stop_channel();

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = stop_handle.clone().shutdown() => break,
            };
            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let service = WithPeer::new(
                service_builder
                    .clone()
                    .build(methods.clone(), stop_handle.clone()),
                peer,
            );
            let stopped = stop_handle.clone().shutdown();
            tokio::spawn(async move {
                if let Err(e) = serve_with_graceful_shutdown(stream, service, stopped).await {
                    debug!(peer = %peer, "Connection closed with error: {}", e);
                }
            });
        }
        info!("Stopped accepting connections");
    });

    server_handle
}
