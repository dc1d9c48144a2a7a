use crate::error::{Error, Result};
use crate::transport::Transport;
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::page::Page;
use futures::StreamExt;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Body, Client, Request, Response, StatusCode, Version};
use log::{debug, info, warn};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinHandle, time::timeout};

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default wall-clock deadline for a single tab round trip.
pub const DEFAULT_TAB_TIMEOUT: Duration = Duration::from_secs(30);

/// A bounded pool of tabs against one remote browser instance, driven over
/// the DevTools protocol and exposed as a request transport.
///
/// The pool navigates, waits for the document and returns the DOM-serialised
/// HTML as a synthetic 200 response. It does not forward request headers or
/// cookies and never reports the real origin status; callers that need HTTP
/// fidelity use the direct transport instead.
pub struct TabPool {
    browser: Browser,
    handler_task: JoinHandle<()>,
    permits: Arc<Semaphore>,
    tab_timeout: Duration,
}

impl TabPool {
    /// Connects to the control endpoint (e.g. `http://localhost:9222`),
    /// verifying it is reachable by fetching its version descriptor first.
    /// `pool_size` values below 1 are clamped to 1.
    pub async fn connect(
        control_url: &str,
        pool_size: i64,
        tab_timeout: Duration,
    ) -> Result<Self> {
        let ws_url = probe_version(control_url).await?;

        let (browser, mut handler) = Browser::connect(ws_url)
            .await
            .map_err(|err| Error::ChromeUnreachable(format!("{control_url}: {err}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        info!("connected to browser at {control_url} (pool size {})", clamp_pool_size(pool_size));
        Ok(Self {
            browser,
            handler_task,
            permits: Arc::new(Semaphore::new(clamp_pool_size(pool_size))),
            tab_timeout,
        })
    }

    /// Releases the control connection and all tabs.
    pub fn close(&self) {
        self.permits.close();
        self.handler_task.abort();
        debug!("browser pool closed");
    }

    async fn fetch_rendered(&self, url: &str) -> Result<String> {
        let page = self
            .browser
            .new_page(url)
            .await
            .map_err(|err| Error::Transport(format!("opening tab for {url}: {err}")))?;

        let html = render_outer_html(&page, url).await;
        if let Err(err) = page.close().await {
            debug!("closing tab for {url}: {err}");
        }
        html
    }
}

async fn render_outer_html(page: &Page, url: &str) -> Result<String> {
    page.wait_for_navigation()
        .await
        .map_err(|err| Error::Transport(format!("navigation to {url}: {err}")))?;
    page.content()
        .await
        .map_err(|err| Error::Transport(format!("serialising {url}: {err}")))
}

#[async_trait]
impl Transport for TabPool {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>> {
        let url = req.uri().to_string();

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;

        let html = timeout(self.tab_timeout, self.fetch_rendered(&url))
            .await
            .map_err(|_| Error::Transport(format!("tab deadline exceeded for {url}")))??;

        let response = Response::builder()
            .status(StatusCode::OK)
            .version(Version::HTTP_11)
            .header(CONTENT_TYPE, "text/html; charset=utf-8")
            .header(CONTENT_LENGTH, html.len())
            .body(Body::from(html))
            .map_err(|err| Error::Transport(err.to_string()))?;
        Ok(response)
    }

    fn label(&self) -> &'static str {
        "chrome"
    }
}

/// Fetches `<control_url>/json/version` and returns the websocket debugger
/// URL, retrying a few times while the browser starts up.
async fn probe_version(control_url: &str) -> Result<String> {
    let version_url: hyper::Uri = format!("{}/json/version", control_url.trim_end_matches('/'))
        .parse()
        .map_err(|err| Error::Config(format!("invalid chrome URL {control_url:?}: {err}")))?;

    let client = Client::new();
    let mut last_error = String::from("no attempts made");

    for attempt in 1..=CONNECT_ATTEMPTS {
        let probe = async {
            let res = client.get(version_url.clone()).await?;
            if res.status() != StatusCode::OK {
                return Err(Error::ChromeUnreachable(format!(
                    "version endpoint returned {}",
                    res.status()
                )));
            }
            let body = hyper::body::to_bytes(res.into_body()).await?;
            let descriptor: serde_json::Value = serde_json::from_slice(&body)?;
            descriptor
                .get("webSocketDebuggerUrl")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::ChromeUnreachable(String::from(
                        "version descriptor lacks webSocketDebuggerUrl",
                    ))
                })
        };

        match timeout(VERSION_PROBE_TIMEOUT, probe).await {
            Ok(Ok(ws_url)) => return Ok(ws_url),
            Ok(Err(err)) => last_error = err.to_string(),
            Err(_) => last_error = String::from("version probe timed out"),
        }

        if attempt < CONNECT_ATTEMPTS {
            warn!(
                "browser connection attempt {attempt}/{CONNECT_ATTEMPTS} failed: {last_error} (retrying)"
            );
            tokio::time::sleep(CONNECT_RETRY_DELAY).await;
        }
    }

    Err(Error::ChromeUnreachable(format!(
        "{control_url} after {CONNECT_ATTEMPTS} attempts: {last_error}"
    )))
}

fn clamp_pool_size(pool_size: i64) -> usize {
    pool_size.max(1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_size_clamps_to_one() {
        assert_eq!(clamp_pool_size(0), 1);
        assert_eq!(clamp_pool_size(-3), 1);
        assert_eq!(clamp_pool_size(8), 8);
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_fast() {
        // Nothing listens on this port; all attempts should fail.
        let result = probe_version("http://127.0.0.1:1").await;
        assert!(matches!(
            result,
            Err(Error::ChromeUnreachable(_)) | Err(Error::Transport(_))
        ));
    }
}
