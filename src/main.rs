use clap::Parser;
use log::{info, warn};
use mdmitm::{
    ca::CertificateAuthority,
    cache::DiskCache,
    chrome::{TabPool, DEFAULT_TAB_TIMEOUT},
    config::Config,
    error::{Error, Result},
    filter::Filter,
    output::OutputWriter,
    proxy::{self, ProxyConfig},
    rewrite::RewritingTransport,
    shutdown_signal,
    templates::TemplateStore,
    tokens::TokenCounter,
    transport::{HttpTransport, Transport},
};
use std::{path::Path, sync::Arc, time::Duration};

/// An HTTPS forward proxy that rewrites HTML and JSON responses into
/// Markdown, counts tokens, and optionally caches the original bodies.
#[derive(Debug, Parser)]
#[command(name = "mdmitm", version, about)]
struct Args {
    /// Config file (default: ./config.yml when present)
    #[arg(long)]
    config: Option<String>,

    /// Proxy listen address (overrides config)
    #[arg(long)]
    addr: Option<String>,

    /// Enable TLS on the proxy listener (overrides config)
    #[arg(long)]
    tls: bool,

    /// Auto-generate the listener certificate (overrides config)
    #[arg(long)]
    auto_cert: bool,

    /// Cache directory for HTML responses (overrides config)
    #[arg(long)]
    cache_dir: Option<String>,

    /// Max response body size in bytes (overrides config)
    #[arg(long)]
    max_body_size: Option<u64>,

    /// Skip TLS certificate verification for upstream requests
    #[arg(long)]
    tls_insecure: bool,

    /// Directory to write converted Markdown files
    #[arg(long)]
    output_dir: Option<String>,

    /// Only convert when the client sends Accept: text/markdown
    #[arg(long)]
    negotiate_only: bool,

    /// Enable JSON-to-Markdown conversion via Mustache templates
    #[arg(long)]
    convert_json: bool,

    /// Directory containing .mustache template files for JSON conversion
    #[arg(long)]
    template_dir: Option<String>,

    /// Transport type: http (direct) or chrome (headless browser rendering)
    #[arg(long)]
    transport: Option<String>,

    /// Browser control endpoint URL for the chrome transport
    #[arg(long)]
    chrome_url: Option<String>,

    /// Concurrent browser tab limit for the chrome transport
    #[arg(long)]
    pool_size: Option<i64>,

    /// Regex patterns for allowed URLs (repeatable)
    #[arg(long = "allow")]
    allow: Vec<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

fn apply_flags(config: &mut Config, args: &Args) {
    if let Some(addr) = &args.addr {
        config.proxy.addr = addr.clone();
    }
    if args.tls {
        config.tls.enabled = true;
    }
    if args.auto_cert {
        config.tls.auto_cert = true;
    }
    if let Some(dir) = &args.cache_dir {
        config.cache.dir = dir.clone();
        config.cache.enabled = true;
    }
    if let Some(size) = args.max_body_size {
        if size > 0 {
            config.max_body_size = size;
        }
    }
    if args.tls_insecure {
        config.tls.insecure = true;
    }
    if let Some(dir) = &args.output_dir {
        config.output.dir = dir.clone();
        config.output.enabled = true;
    }
    if args.negotiate_only {
        config.conversion.negotiate_only = true;
    }
    if args.convert_json {
        config.conversion.convert_json = true;
    }
    if let Some(dir) = &args.template_dir {
        config.conversion.template_dir = dir.clone();
    }
    if let Some(kind) = &args.transport {
        config.transport.kind = kind.clone();
    }
    if let Some(url) = &args.chrome_url {
        config.transport.chrome_url = url.clone();
    }
    if let Some(size) = args.pool_size {
        if size > 0 {
            config.transport.pool_size = size;
        }
    }
    if !args.allow.is_empty() {
        config.filter.allowed = args.allow.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("mdmitm: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref().map(Path::new))?;
    apply_flags(&mut config, &args);

    env_logger::Builder::new()
        .parse_filters(&config.log_level)
        .init();

    // TLS on the listener implies MITM for CONNECT traffic.
    if config.tls.enabled {
        config.mitm.enabled = true;
    }

    let listen_addr = config.listen_addr()?;

    let tokens = TokenCounter::new(&config.conversion.tiktoken_encoding)?;

    let cache = if config.cache.enabled && !config.cache.dir.is_empty() {
        info!("HTML cache enabled: {}", config.cache.dir);
        Some(DiskCache::new(&config.cache.dir, config.cache.respect_headers)?)
    } else {
        None
    };

    let output = if config.output.enabled && !config.output.dir.is_empty() {
        info!("Markdown output enabled: {}", config.output.dir);
        Some(OutputWriter::new(&config.output.dir)?)
    } else {
        None
    };

    let templates = if !config.conversion.template_dir.is_empty() {
        info!("Mustache templates loaded from: {}", config.conversion.template_dir);
        Some(TemplateStore::new(&config.conversion.template_dir)?)
    } else {
        None
    };

    if config.conversion.convert_json {
        info!("JSON-to-Markdown conversion enabled");
    }
    if config.tls.insecure {
        warn!("TLS certificate verification disabled for upstream requests");
    }

    let filter = if config.filter.allowed.is_empty() {
        None
    } else {
        info!(
            "request filter enabled with {} pattern(s)",
            config.filter.allowed.len()
        );
        Some(Arc::new(Filter::new(&config.filter.allowed)?))
    };

    let ca = if config.mitm.enabled {
        let cert_dir = if config.mitm.cert_dir.is_empty() {
            if config.tls.enabled && config.tls.auto_cert {
                // Share the listener's certificate directory so clients
                // trust one root for both.
                Some(Path::new(config.tls.auto_cert_dir.as_str()))
            } else {
                None
            }
        } else {
            Some(Path::new(config.mitm.cert_dir.as_str()))
        };

        let ca = Arc::new(CertificateAuthority::new(cert_dir)?);
        info!("HTTPS MITM interception enabled");
        match ca.root_cert_path() {
            Some(path) => info!("CA certificate: {} (clients must trust it)", path.display()),
            None => info!("CA material is in-memory only"),
        }
        Some(ca)
    } else {
        None
    };

    let mut tab_pool: Option<Arc<TabPool>> = None;
    let inner: Arc<dyn Transport> = match config.transport.kind.as_str() {
        "chrome" | "chromedp" => {
            info!(
                "chrome transport enabled, connecting to {}",
                config.transport.chrome_url
            );
            let pool = Arc::new(
                TabPool::connect(
                    &config.transport.chrome_url,
                    config.transport.pool_size,
                    DEFAULT_TAB_TIMEOUT,
                )
                .await?,
            );
            tab_pool = Some(Arc::clone(&pool));
            pool
        }
        "http" | "" => Arc::new(HttpTransport::new(
            (!config.proxy.upstream.is_empty()).then_some(config.proxy.upstream.as_str()),
            config.tls.insecure,
        )?),
        other => {
            return Err(Error::Config(format!(
                "unknown transport type {other:?} (expected \"http\" or \"chrome\")"
            )))
        }
    };

    let rewriter = Arc::new(RewritingTransport {
        inner,
        convert_html: config.conversion.enabled,
        convert_json: config.conversion.convert_json,
        negotiate_only: config.conversion.negotiate_only,
        max_body_size: config.max_body_size,
        tokens: Some(tokens),
        cache,
        output,
        templates,
    });

    let tls = if config.tls.enabled {
        let server_config = if !config.tls.cert_file.is_empty() && !config.tls.key_file.is_empty() {
            proxy::load_server_config(&config.tls.cert_file, &config.tls.key_file)?
        } else if config.tls.auto_cert {
            let ca = ca
                .as_ref()
                .ok_or_else(|| Error::Config(String::from("TLS auto-cert requires MITM material")))?;
            ca.server_config(&config.tls.auto_cert_host)?
        } else {
            return Err(Error::Config(String::from(
                "tls.enabled needs cert_file/key_file or auto_cert",
            )));
        };
        info!("TLS enabled on proxy listener");
        Some(server_config)
    } else {
        None
    };

    info!(
        "starting proxy on {} (TLS: {}, convert: {}, max body: {} bytes)",
        listen_addr, config.tls.enabled, config.conversion.enabled, config.max_body_size
    );

    let result = proxy::start_proxy(ProxyConfig {
        listen_addr,
        shutdown_signal: shutdown_signal(),
        rewriter,
        filter,
        ca,
        tls,
        read_timeout: Duration::from_secs(config.proxy.read_timeout),
        ready: None,
        tab_pool,
    })
    .await;

    info!("proxy stopped");
    result
}
