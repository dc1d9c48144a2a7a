use crate::cache::DiskCache;
use crate::convert;
use crate::decoder;
use crate::error::Result;
use crate::output::OutputWriter;
use crate::templates::{self, TemplateStore};
use crate::tokens::TokenCounter;
use crate::transport::Transport;
use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, VARY};
use http::response::Parts;
use hyper::{body::HttpBody, Body, HeaderMap, Request, Response};
use log::warn;
use std::sync::Arc;

/// Wraps a transport and rewrites eligible responses on the way back:
/// decode the content encoding, bound the read, cache the raw body, convert
/// HTML or JSON to Markdown, and resynchronise the framing headers.
pub struct RewritingTransport {
    pub inner: Arc<dyn Transport>,
    /// Convert `text/html` responses to Markdown.
    pub convert_html: bool,
    /// Convert `application/json` responses to Markdown via Mustache.
    pub convert_json: bool,
    /// Only convert when the client sent `Accept: text/markdown`.
    pub negotiate_only: bool,
    /// Maximum body bytes to read; 0 reads without bound.
    pub max_body_size: u64,
    pub tokens: Option<TokenCounter>,
    pub cache: Option<DiskCache>,
    pub output: Option<OutputWriter>,
    pub templates: Option<TemplateStore>,
}

#[async_trait]
impl Transport for RewritingTransport {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>> {
        let url = req.uri().to_string();
        let wants_markdown = wants_markdown(req.headers());

        let mut res = self.inner.round_trip(req).await?;
        res.headers_mut().insert(
            HeaderName::from_static("x-transport"),
            HeaderValue::from_static(self.inner.label()),
        );

        let content_type = header_str(res.headers(), &CONTENT_TYPE);
        let is_html = convert::is_html_content_type(content_type);
        let is_json = convert::is_json_content_type(content_type);
        if !is_html && !is_json {
            return Ok(res);
        }

        let should_convert_html =
            is_html && self.convert_html && (!self.negotiate_only || wants_markdown);
        let should_convert_json =
            is_json && self.convert_json && (!self.negotiate_only || wants_markdown);

        // HTML keeps going for decoding and caching even when unconverted;
        // JSON that will not convert is returned as-is.
        if is_json && !should_convert_json {
            return Ok(res);
        }

        let encoding = header_str(res.headers(), &CONTENT_ENCODING).to_string();
        if !decoder::is_supported(&encoding) {
            warn!("unsupported content-encoding {encoding:?} for {url}");
            return Ok(res);
        }

        let (mut parts, body) = res.into_parts();
        let decoded = decoder::decode_body(body, &encoding)?;

        let (raw, read_error) = read_bounded(decoded, self.max_body_size).await;
        if let Some(err) = read_error {
            warn!("reading response body for {url}: {err}");
            return Ok(passthrough(parts, raw));
        }

        if is_html {
            if let Some(cache) = &self.cache {
                if cache.is_cacheable(parts.status, &parts.headers) {
                    let ttl = cache.ttl(&parts.headers);
                    if let Err(err) = cache.put(&url, &raw, ttl) {
                        warn!("cache put error for {url}: {err}");
                    }
                }
            }
        }

        if should_convert_json {
            let template = templates::match_template(self.templates.as_ref(), &url);
            return Ok(match convert::json_to_markdown(&raw, &template) {
                Ok(md) => self.finalize_markdown(parts, &url, md),
                Err(err) => {
                    warn!("json-to-markdown conversion error for {url}: {err}");
                    passthrough(parts, raw)
                }
            });
        }

        if should_convert_html {
            let md = convert::html_to_markdown(&String::from_utf8_lossy(&raw));
            return Ok(self.finalize_markdown(parts, &url, md));
        }

        Ok(passthrough(parts, raw))
    }

    fn label(&self) -> &'static str {
        self.inner.label()
    }
}

impl RewritingTransport {
    /// Replaces the body with converted Markdown and rewrites the framing
    /// headers accordingly.
    fn finalize_markdown(&self, mut parts: Parts, url: &str, md: String) -> Response<Body> {
        if let Some(counter) = &self.tokens {
            let count = counter.count(&md);
            if let Ok(value) = HeaderValue::from_str(&count.to_string()) {
                parts
                    .headers
                    .insert(HeaderName::from_static("x-token-count"), value);
            }
        }

        if let Some(output) = &self.output {
            if let Err(err) = output.write(url, md.as_bytes()) {
                warn!("output write error for {url}: {err}");
            }
        }

        parts.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/markdown; charset=utf-8"),
        );
        parts.headers.remove(CONTENT_ENCODING);
        parts.headers.insert(CONTENT_LENGTH, content_length(md.len()));
        parts.headers.insert(VARY, HeaderValue::from_static("accept"));

        Response::from_parts(parts, Body::from(md))
    }
}

/// Rebuilds the response around the decoded bytes without conversion.
fn passthrough(mut parts: Parts, raw: Vec<u8>) -> Response<Body> {
    parts.headers.remove(CONTENT_ENCODING);
    parts.headers.insert(CONTENT_LENGTH, content_length(raw.len()));
    Response::from_parts(parts, Body::from(raw))
}

fn content_length(len: usize) -> HeaderValue {
    HeaderValue::from_str(&len.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// True iff any `Accept` media-range equals `text/markdown`, ignoring case
/// and parameters.
fn wants_markdown(headers: &HeaderMap) -> bool {
    header_str(headers, &http::header::ACCEPT)
        .split(',')
        .map(|part| part.split(';').next().unwrap_or_default().trim())
        .any(|media| media.eq_ignore_ascii_case("text/markdown"))
}

/// Reads the body to EOF, truncating at `limit` bytes when `limit > 0`.
/// A mid-stream failure returns the bytes collected so far with the error.
async fn read_bounded(mut body: Body, limit: u64) -> (Vec<u8>, Option<hyper::Error>) {
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        match chunk {
            Ok(data) => {
                if limit > 0 {
                    let remaining = (limit as usize).saturating_sub(buf.len());
                    if data.len() >= remaining {
                        buf.extend_from_slice(&data[..remaining]);
                        return (buf, None);
                    }
                }
                buf.extend_from_slice(&data);
            }
            Err(err) => return (buf, Some(err)),
        }
    }
    (buf, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use async_compression::tokio::bufread::GzipEncoder;
    use http::StatusCode;
    use std::fs;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    struct StubTransport {
        status: StatusCode,
        headers: Vec<(&'static str, String)>,
        body: Vec<u8>,
    }

    impl StubTransport {
        fn html(body: &str) -> Self {
            Self {
                status: StatusCode::OK,
                headers: vec![("content-type", String::from("text/html"))],
                body: body.as_bytes().to_vec(),
            }
        }

        fn json(body: &str) -> Self {
            Self {
                status: StatusCode::OK,
                headers: vec![("content-type", String::from("application/json"))],
                body: body.as_bytes().to_vec(),
            }
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn round_trip(&self, _req: Request<Body>) -> Result<Response<Body>> {
            let mut builder = Response::builder().status(self.status);
            for (name, value) in &self.headers {
                builder = builder.header(*name, value);
            }
            Ok(builder.body(Body::from(self.body.clone())).unwrap())
        }

        fn label(&self) -> &'static str {
            "http"
        }
    }

    fn rewriter(inner: StubTransport) -> RewritingTransport {
        RewritingTransport {
            inner: Arc::new(inner),
            convert_html: true,
            convert_json: false,
            negotiate_only: false,
            max_body_size: 0,
            tokens: None,
            cache: None,
            output: None,
            templates: None,
        }
    }

    fn request(url: &str) -> Request<Body> {
        Request::builder().uri(url).body(Body::empty()).unwrap()
    }

    fn request_accepting_markdown(url: &str) -> Request<Body> {
        Request::builder()
            .uri(url)
            .header("accept", "text/markdown")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(res: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(res.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzipEncoder::new(data);
        let mut out = Vec::new();
        enc.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn html_converts_to_markdown_with_rewritten_framing() {
        let mut rt = rewriter(StubTransport::html("<h1>Hello</h1><p>World</p>"));
        rt.tokens = Some(TokenCounter::new("cl100k_base").unwrap());

        let res = rt.round_trip(request("http://example.com/")).await.unwrap();
        assert_eq!(
            res.headers().get(CONTENT_TYPE).unwrap(),
            "text/markdown; charset=utf-8"
        );
        assert_eq!(res.headers().get(VARY).unwrap(), "accept");
        assert_eq!(res.headers().get("x-transport").unwrap(), "http");
        let token_count: u64 = res
            .headers()
            .get("x-token-count")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(token_count > 0);

        let declared: usize = res
            .headers()
            .get(CONTENT_LENGTH)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let body = body_string(res).await;
        assert_eq!(declared, body.len());
        assert!(body.starts_with("# Hello"), "got {body:?}");
        assert!(body.contains("World"), "got {body:?}");
    }

    #[tokio::test]
    async fn negotiate_only_passes_html_through_without_accept() {
        let mut rt = rewriter(StubTransport::html("<h1>Hello</h1><p>World</p>"));
        rt.negotiate_only = true;

        let res = rt.round_trip(request("http://example.com/")).await.unwrap();
        assert_eq!(res.headers().get(CONTENT_TYPE).unwrap(), "text/html");
        assert!(res.headers().get(VARY).is_none());
        let declared: usize = res
            .headers()
            .get(CONTENT_LENGTH)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let body = body_string(res).await;
        assert_eq!(body, "<h1>Hello</h1><p>World</p>");
        assert_eq!(declared, body.len());
    }

    #[tokio::test]
    async fn negotiate_only_converts_when_the_client_asks() {
        let mut rt = rewriter(StubTransport::html("<h1>Hello</h1>"));
        rt.negotiate_only = true;

        let res = rt
            .round_trip(request_accepting_markdown("http://example.com/"))
            .await
            .unwrap();
        assert_eq!(
            res.headers().get(CONTENT_TYPE).unwrap(),
            "text/markdown; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn accept_matching_ignores_case_and_parameters() {
        let mut rt = rewriter(StubTransport::html("<h1>Hello</h1>"));
        rt.negotiate_only = true;

        let req = Request::builder()
            .uri("http://example.com/")
            .header("accept", "text/html, Text/Markdown;q=0.9")
            .body(Body::empty())
            .unwrap();
        let res = rt.round_trip(req).await.unwrap();
        assert_eq!(
            res.headers().get(CONTENT_TYPE).unwrap(),
            "text/markdown; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn json_renders_a_markdown_table_without_a_user_template() {
        let mut rt = rewriter(StubTransport::json(
            r#"{"users":[{"name":"Alice","role":"admin"},{"name":"Bob","role":"user"}]}"#,
        ));
        rt.convert_json = true;

        let res = rt
            .round_trip(request("http://api.example.com/users"))
            .await
            .unwrap();
        let body = body_string(res).await;
        assert!(body.contains("| name | role |"), "got {body:?}");
        assert!(body.contains("| Alice | admin |"), "got {body:?}");
        assert!(body.contains("| Bob | user |"), "got {body:?}");
    }

    #[tokio::test]
    async fn json_uses_the_matching_user_template() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("api.example.com.mustache"),
            "# {{{greeting}}}, {{{name}}}!",
        )
        .unwrap();

        let mut rt = rewriter(StubTransport::json(r#"{"name":"Alice","greeting":"Hello"}"#));
        rt.convert_json = true;
        rt.templates = Some(TemplateStore::new(dir.path()).unwrap());

        let res = rt
            .round_trip(request("https://api.example.com/greet"))
            .await
            .unwrap();
        assert_eq!(body_string(res).await, "# Hello, Alice!");
    }

    #[tokio::test]
    async fn json_stays_untouched_when_conversion_is_off() {
        let rt = rewriter(StubTransport::json(r#"{"a":1}"#));
        let res = rt.round_trip(request("http://example.com/")).await.unwrap();
        assert_eq!(res.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(body_string(res).await, r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn invalid_json_falls_through_with_the_original_body() {
        let mut rt = rewriter(StubTransport::json("not json"));
        rt.convert_json = true;

        let res = rt.round_trip(request("http://example.com/")).await.unwrap();
        assert_eq!(res.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        assert!(res.headers().get(VARY).is_none());
        assert_eq!(body_string(res).await, "not json");
    }

    #[tokio::test]
    async fn non_html_non_json_responses_pass_untouched() {
        let rt = rewriter(StubTransport {
            status: StatusCode::OK,
            headers: vec![("content-type", String::from("image/png"))],
            body: vec![1, 2, 3],
        });
        let res = rt.round_trip(request("http://example.com/")).await.unwrap();
        assert_eq!(res.headers().get(CONTENT_TYPE).unwrap(), "image/png");
        assert_eq!(res.headers().get("x-transport").unwrap(), "http");
    }

    #[tokio::test]
    async fn gzip_bodies_are_decoded_before_conversion() {
        let encoded = gzip(b"<h1>Hello</h1>").await;
        let rt = rewriter(StubTransport {
            status: StatusCode::OK,
            headers: vec![
                ("content-type", String::from("text/html")),
                ("content-encoding", String::from("gzip")),
            ],
            body: encoded,
        });

        let res = rt.round_trip(request("http://example.com/")).await.unwrap();
        assert!(res.headers().get(CONTENT_ENCODING).is_none());
        assert!(body_string(res).await.starts_with("# Hello"));
    }

    #[tokio::test]
    async fn decoded_passthrough_resyncs_framing() {
        let encoded = gzip(b"<h1>Hi</h1>").await;
        let mut rt = rewriter(StubTransport {
            status: StatusCode::OK,
            headers: vec![
                ("content-type", String::from("text/html")),
                ("content-encoding", String::from("gzip")),
            ],
            body: encoded,
        });
        rt.convert_html = false;

        let res = rt.round_trip(request("http://example.com/")).await.unwrap();
        assert!(res.headers().get(CONTENT_ENCODING).is_none());
        let declared: usize = res
            .headers()
            .get(CONTENT_LENGTH)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        let body = body_string(res).await;
        assert_eq!(body, "<h1>Hi</h1>");
        assert_eq!(declared, body.len());
    }

    #[tokio::test]
    async fn unsupported_encoding_passes_the_encoded_body_through() {
        let rt = rewriter(StubTransport {
            status: StatusCode::OK,
            headers: vec![
                ("content-type", String::from("text/html")),
                ("content-encoding", String::from("br")),
            ],
            body: vec![0xde, 0xad],
        });

        let res = rt.round_trip(request("http://example.com/")).await.unwrap();
        assert_eq!(res.headers().get(CONTENT_ENCODING).unwrap(), "br");
        let bytes = hyper::body::to_bytes(res.into_body()).await.unwrap();
        assert_eq!(&bytes[..], &[0xde, 0xad]);
    }

    #[tokio::test]
    async fn max_body_size_truncates_the_read() {
        let mut rt = rewriter(StubTransport::html("<p>0123456789</p>"));
        rt.convert_html = false;
        rt.max_body_size = 4;

        let res = rt.round_trip(request("http://example.com/")).await.unwrap();
        assert_eq!(body_string(res).await, "<p>0");
    }

    #[tokio::test]
    async fn cacheable_html_lands_in_the_cache_directory() {
        let dir = TempDir::new().unwrap();
        let mut rt = rewriter(StubTransport {
            status: StatusCode::OK,
            headers: vec![
                ("content-type", String::from("text/html")),
                ("cache-control", String::from("max-age=60")),
            ],
            body: b"<h1>cached</h1>".to_vec(),
        });
        let cache = DiskCache::new(dir.path(), true).unwrap();
        rt.cache = Some(cache.clone());

        rt.round_trip(request("http://example.com/page")).await.unwrap();
        assert_eq!(
            cache.get("http://example.com/page").as_deref(),
            Some(&b"<h1>cached</h1>"[..])
        );
    }

    #[tokio::test]
    async fn no_store_responses_never_reach_the_cache() {
        let dir = TempDir::new().unwrap();
        let mut rt = rewriter(StubTransport {
            status: StatusCode::OK,
            headers: vec![
                ("content-type", String::from("text/html")),
                ("cache-control", String::from("no-store")),
            ],
            body: b"<h1>secret</h1>".to_vec(),
        });
        rt.cache = Some(DiskCache::new(dir.path(), true).unwrap());

        rt.round_trip(request("http://example.com/page")).await.unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn converted_bodies_are_written_to_the_output_directory() {
        let dir = TempDir::new().unwrap();
        let mut rt = rewriter(StubTransport::html("<h1>Saved</h1>"));
        rt.output = Some(OutputWriter::new(dir.path()).unwrap());

        rt.round_trip(request("http://example.com/post")).await.unwrap();
        let saved = fs::read_to_string(dir.path().join("example.com__post.md")).unwrap();
        assert!(saved.starts_with("# Saved"));
    }

    #[tokio::test]
    async fn transport_errors_surface_unchanged() {
        struct FailingTransport;

        #[async_trait]
        impl Transport for FailingTransport {
            async fn round_trip(&self, _req: Request<Body>) -> Result<Response<Body>> {
                Err(Error::Transport(String::from("connection refused")))
            }

            fn label(&self) -> &'static str {
                "http"
            }
        }

        let rt = RewritingTransport {
            inner: Arc::new(FailingTransport),
            convert_html: true,
            convert_json: false,
            negotiate_only: false,
            max_body_size: 0,
            tokens: None,
            cache: None,
            output: None,
            templates: None,
        };
        assert!(matches!(
            rt.round_trip(request("http://example.com/")).await,
            Err(Error::Transport(_))
        ));
    }
}
