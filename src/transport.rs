use crate::error::{Error, Result};
use async_trait::async_trait;
use hyper::{client::HttpConnector, Body, Client, Request, Response};
use hyper_proxy::{Intercept, Proxy as UpstreamProxy, ProxyConnector};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use std::sync::Arc;
use tokio_rustls::rustls::{
    self,
    client::{ServerCertVerified, ServerCertVerifier},
    ClientConfig,
};

/// Executes one request against an origin. Implemented by the direct
/// network transport and by the browser tab pool, so the rewriting layer
/// stays oblivious to how a body was fetched.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>>;

    /// Short tag identifying the transport in the `X-Transport` header.
    fn label(&self) -> &'static str;
}

#[derive(Clone)]
enum MaybeProxyClient {
    Proxy(Client<ProxyConnector<HttpsConnector<HttpConnector>>>),
    Https(Client<HttpsConnector<HttpConnector>>),
}

/// Direct network transport: hyper client over HTTPS with webpki roots,
/// optionally chained through an upstream proxy.
#[derive(Clone)]
pub struct HttpTransport {
    client: MaybeProxyClient,
}

impl HttpTransport {
    /// Builds the transport. `upstream` chains every request through the
    /// given proxy URL; `insecure` skips upstream certificate verification.
    pub fn new(upstream: Option<&str>, insecure: bool) -> Result<Self> {
        let https = if insecure {
            let tls = ClientConfig::builder()
                .with_safe_defaults()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
                .with_no_client_auth();
            HttpsConnectorBuilder::new()
                .with_tls_config(tls)
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .build()
        } else {
            HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .build()
        };

        let client = match upstream {
            Some(url) => {
                let uri: hyper::Uri = url
                    .parse()
                    .map_err(|err| Error::Config(format!("invalid upstream proxy {url:?}: {err}")))?;
                let proxy = UpstreamProxy::new(Intercept::All, uri);
                let connector = ProxyConnector::from_proxy(https, proxy)
                    .map_err(|err| Error::Config(format!("upstream proxy connector: {err}")))?;
                MaybeProxyClient::Proxy(
                    Client::builder()
                        .http1_title_case_headers(true)
                        .http1_preserve_header_case(true)
                        .build(connector),
                )
            }
            None => MaybeProxyClient::Https(
                Client::builder()
                    .http1_title_case_headers(true)
                    .http1_preserve_header_case(true)
                    .build(https),
            ),
        };

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>> {
        let res = match &self.client {
            MaybeProxyClient::Proxy(client) => client.request(req).await?,
            MaybeProxyClient::Https(client) => client.request(req).await?,
        };
        Ok(res)
    }

    fn label(&self) -> &'static str {
        "http"
    }
}

/// Accepts whatever certificate the upstream presents. Only installed when
/// the operator explicitly enables insecure upstream TLS.
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
