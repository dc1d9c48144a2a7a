use crate::ca::CertificateAuthority;
use crate::chrome::TabPool;
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::rewrite::RewritingTransport;
use crate::transport::Transport;
use http::uri::{PathAndQuery, Scheme};
use hyper::{
    server::conn::{AddrStream, Http},
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode, Uri,
};
use log::{debug, error, info, warn};
use std::{
    convert::Infallible,
    future::Future,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{net::TcpStream, task::JoinSet, time::timeout};
use tokio_rustls::{rustls::ServerConfig as TlsServerConfig, TlsAcceptor};

const CONNECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Configuration for the proxy server.
pub struct ProxyConfig<F: Future<Output = ()>> {
    /// The address to listen on.
    pub listen_addr: SocketAddr,
    /// A future that once resolved will cause the proxy server to shut down.
    pub shutdown_signal: F,
    /// The rewriting transport every proxied request goes through.
    pub rewriter: Arc<RewritingTransport>,
    /// URL allow-list; absent means everything is allowed.
    pub filter: Option<Arc<Filter>>,
    /// Certificate authority for MITM interception; absent means CONNECT
    /// requests are spliced as opaque tunnels.
    pub ca: Option<Arc<CertificateAuthority>>,
    /// TLS material for the client-facing listener itself.
    pub tls: Option<Arc<TlsServerConfig>>,
    /// Deadline for reading a request head from the client.
    pub read_timeout: Duration,
    /// Receives the bound listener address once accepting begins.
    pub ready: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
    /// Browser pool to close (releasing its control context) as soon as the
    /// server stops accepting, before in-flight requests drain.
    pub tab_pool: Option<Arc<TabPool>>,
}

/// Attempts to start the proxy server with the provided configuration.
pub async fn start_proxy<F>(config: ProxyConfig<F>) -> Result<()>
where
    F: Future<Output = ()>,
{
    let session = ProxySession {
        rewriter: config.rewriter,
        filter: config.filter,
        ca: config.ca,
    };

    match config.tls {
        None => {
            serve_plain(
                config.listen_addr,
                session,
                config.shutdown_signal,
                config.read_timeout,
                config.ready,
                config.tab_pool,
            )
            .await
        }
        Some(tls) => {
            serve_tls(
                config.listen_addr,
                session,
                config.shutdown_signal,
                tls,
                config.ready,
                config.tab_pool,
            )
            .await
        }
    }
}

async fn serve_plain<F>(
    listen_addr: SocketAddr,
    session: ProxySession,
    shutdown_signal: F,
    read_timeout: Duration,
    ready: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
    tab_pool: Option<Arc<TabPool>>,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let make_service = make_service_fn(move |conn: &AddrStream| {
        let session = session.clone();
        let client_addr = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                session.clone().proxy(req, client_addr)
            }))
        }
    });

    let server = Server::try_bind(&listen_addr)
        .map_err(|err| Error::Config(format!("binding {listen_addr}: {err}")))?
        .http1_preserve_header_case(true)
        .http1_title_case_headers(true)
        .http1_header_read_timeout(read_timeout)
        .serve(make_service);

    if let Some(ready) = ready {
        let _ = ready.send(server.local_addr());
    }

    // Stop accepting on the signal and release the browser pool's control
    // context right away; hyper then drains in-flight requests.
    let shutdown = async move {
        shutdown_signal.await;
        if let Some(pool) = &tab_pool {
            info!("closing browser pool");
            pool.close();
        }
    };

    server
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(Error::from)
}

async fn serve_tls<F>(
    listen_addr: SocketAddr,
    session: ProxySession,
    shutdown_signal: F,
    tls: Arc<TlsServerConfig>,
    ready: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
    tab_pool: Option<Arc<TabPool>>,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|err| Error::Config(format!("binding {listen_addr}: {err}")))?;
    if let Some(ready) = ready {
        if let Ok(addr) = listener.local_addr() {
            let _ = ready.send(addr);
        }
    }

    let acceptor = TlsAcceptor::from(tls);
    let mut connections = JoinSet::new();

    tokio::pin!(shutdown_signal);
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => break,
            accepted = listener.accept() => {
                let (stream, client_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("accept error: {err}");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let session = session.clone();
                connections.spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let service = service_fn(move |req| {
                                session.clone().proxy(req, client_addr)
                            });
                            if let Err(err) = Http::new()
                                .serve_connection(tls_stream, service)
                                .with_upgrades()
                                .await
                            {
                                debug!("client connection from {client_addr}: {err}");
                            }
                        }
                        Err(err) => debug!("TLS accept from {client_addr}: {err}"),
                    }
                });
            }
        }
    }

    // Acceptance has stopped; release the browser pool's control context
    // before the listener goes away and in-flight connections drain.
    if let Some(pool) = &tab_pool {
        info!("closing browser pool");
        pool.close();
    }

    drop(listener);
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown grace period elapsed with connections in flight");
    }
    Ok(())
}

#[derive(Clone)]
struct ProxySession {
    rewriter: Arc<RewritingTransport>,
    filter: Option<Arc<Filter>>,
    ca: Option<Arc<CertificateAuthority>>,
}

impl ProxySession {
    async fn proxy(
        self,
        req: Request<Body>,
        client_addr: SocketAddr,
    ) -> Result<Response<Body>, hyper::Error> {
        if req.method() == Method::CONNECT {
            self.process_connect(req, client_addr).await
        } else {
            self.process_request(req).await
        }
    }

    async fn process_request(self, mut req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
        if req.uri().scheme().is_none() || req.uri().authority().is_none() {
            return Ok(status_response(
                StatusCode::BAD_REQUEST,
                "request URI must be absolute for proxy",
            ));
        }

        let method = req.method().clone();
        let url = req.uri().to_string();
        if !self.allowed(&url) {
            info!("[forbidden] {method} {url}");
            return Ok(status_response(StatusCode::FORBIDDEN, "forbidden"));
        }

        strip_hop_by_hop(req.headers_mut());
        // Negotiate only encodings the rewriting pipeline can decode.
        req.headers_mut().insert(
            http::header::ACCEPT_ENCODING,
            http::HeaderValue::from_static("gzip, deflate"),
        );

        let started = Instant::now();
        match self.rewriter.round_trip(req).await {
            Ok(res) => {
                info!(
                    "{method} {url} -> {} in {:?}",
                    res.status(),
                    started.elapsed()
                );
                Ok(res)
            }
            Err(err) => {
                error!("proxy roundtrip error for {url}: {err}");
                Ok(status_response(StatusCode::BAD_GATEWAY, "proxy error"))
            }
        }
    }

    async fn process_connect(
        self,
        req: Request<Body>,
        client_addr: SocketAddr,
    ) -> Result<Response<Body>, hyper::Error> {
        let Some(authority) = req.uri().authority().cloned() else {
            return Ok(status_response(
                StatusCode::BAD_REQUEST,
                "CONNECT target missing",
            ));
        };

        if !self.allowed(&format!("https://{}/", authority.host())) {
            info!("[forbidden] CONNECT {authority}");
            return Ok(status_response(StatusCode::FORBIDDEN, "forbidden"));
        }

        match self.ca.clone() {
            Some(ca) => self.connect_mitm(req, authority, ca, client_addr).await,
            None => connect_tunnel(req, authority).await,
        }
    }

    async fn connect_mitm(
        self,
        req: Request<Body>,
        authority: http::uri::Authority,
        ca: Arc<CertificateAuthority>,
        client_addr: SocketAddr,
    ) -> Result<Response<Body>, hyper::Error> {
        // Mint before acknowledging so a failure can still answer the
        // CONNECT with a status line.
        let tls_config = match ca.server_config(authority.as_str()) {
            Ok(config) => config,
            Err(err) => {
                error!("MITM certificate for {authority} failed: {err}");
                return Ok(status_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "certificate generation failed",
                ));
            }
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    match TlsAcceptor::from(tls_config).accept(upgraded).await {
                        Ok(stream) => {
                            debug!("MITM session for {authority} from {client_addr}");
                            if let Err(err) = self.serve_mitm(stream, authority.clone()).await {
                                let text = err.to_string();
                                if !text.starts_with("error shutting down connection") {
                                    debug!("MITM session for {authority}: {text}");
                                }
                            }
                        }
                        Err(err) => debug!("TLS handshake with client for {authority}: {err}"),
                    }
                }
                Err(err) => debug!("upgrade error for {authority}: {err}"),
            }
        });

        Ok(Response::new(Body::empty()))
    }

    /// Serves decrypted HTTP/1.1 requests read off the hijacked TLS stream,
    /// strictly in arrival order, each through the rewriting transport.
    async fn serve_mitm(
        self,
        stream: tokio_rustls::server::TlsStream<hyper::upgrade::Upgraded>,
        authority: http::uri::Authority,
    ) -> Result<(), hyper::Error> {
        let service = service_fn(move |req: Request<Body>| {
            let session = self.clone();
            let authority = authority.clone();
            async move {
                let path_and_query = req
                    .uri()
                    .path_and_query()
                    .cloned()
                    .unwrap_or_else(|| PathAndQuery::from_static("/"));
                let uri = Uri::builder()
                    .scheme(Scheme::HTTPS)
                    .authority(authority)
                    .path_and_query(path_and_query)
                    .build();

                let req = match uri {
                    Ok(uri) => {
                        let (mut parts, body) = req.into_parts();
                        parts.uri = uri;
                        Request::from_parts(parts, body)
                    }
                    Err(err) => {
                        warn!("rebuilding MITM request URI: {err}");
                        return Ok(status_response(StatusCode::BAD_REQUEST, "bad request"));
                    }
                };

                session.process_request(req).await
            }
        });

        Http::new()
            .http1_only(true)
            .serve_connection(stream, service)
            .await
    }

    fn allowed(&self, url: &str) -> bool {
        self.filter.as_ref().map(|f| f.allowed(url)).unwrap_or(true)
    }
}

/// Opaque CONNECT tunnel: dial the target, acknowledge, then splice bytes in
/// both directions until either side closes.
async fn connect_tunnel(
    req: Request<Body>,
    authority: http::uri::Authority,
) -> Result<Response<Body>, hyper::Error> {
    let target = authority.to_string();
    let mut origin = match timeout(CONNECT_DIAL_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!("CONNECT dial {target}: {err}");
            return Ok(status_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "unable to connect to destination",
            ));
        }
        Err(_) => {
            warn!("CONNECT dial {target}: timed out");
            return Ok(status_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "unable to connect to destination",
            ));
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(mut upgraded) => {
                if let Err(err) = tokio::io::copy_bidirectional(&mut upgraded, &mut origin).await {
                    debug!("tunnel to {target} closed: {err}");
                }
            }
            Err(err) => debug!("upgrade error for {target}: {err}"),
        }
    });

    Ok(Response::new(Body::empty()))
}

fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn status_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Loads a rustls server configuration from PEM certificate and key files,
/// for serving the proxy's own listener over TLS.
pub fn load_server_config(cert_file: &str, key_file: &str) -> Result<Arc<TlsServerConfig>> {
    use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};

    let cert_pem = std::fs::read(cert_file)?;
    let key_pem = std::fs::read(key_file)?;

    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut cert_pem.as_slice())?
        .into_iter()
        .map(Certificate)
        .collect();
    if certs.is_empty() {
        return Err(Error::TlsMaterial(format!("no certificates in {cert_file}")));
    }

    let key = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_slice())?
        .into_iter()
        .next()
        .or_else(|| {
            rustls_pemfile::rsa_private_keys(&mut key_pem.as_slice())
                .ok()
                .and_then(|keys| keys.into_iter().next())
        })
        .ok_or_else(|| Error::TlsMaterial(format!("no private key in {key_file}")))?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKey(key))
        .map_err(|err| Error::TlsMaterial(err.to_string()))?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("proxy-authorization", "Basic x".parse().unwrap());
        headers.insert("te", "trailers".parse().unwrap());
        headers.insert("trailer", "Expires".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("upgrade", "websocket".parse().unwrap());
        headers.insert("proxy-authenticate", "Basic".parse().unwrap());
        headers.insert("accept", "text/markdown".parse().unwrap());

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn status_response_carries_code_and_body() {
        let res = status_response(StatusCode::FORBIDDEN, "forbidden");
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }
}
