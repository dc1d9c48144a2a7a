use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::Path};

/// Full proxy configuration, layered defaults -> file -> environment ->
/// flags. Flags are applied by the binary; environment keys use the `MITM_`
/// prefix with `_` separating the structure (e.g. `MITM_PROXY_ADDR`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub proxy: ProxySection,
    pub tls: TlsSection,
    pub conversion: ConversionSection,
    pub max_body_size: u64,
    pub cache: CacheSection,
    pub output: OutputSection,
    pub mitm: MitmSection,
    pub transport: TransportSection,
    pub filter: FilterSection,
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySection {
    pub addr: String,
    /// Client-leg read deadline in seconds.
    pub read_timeout: u64,
    /// Client-leg write deadline in seconds.
    pub write_timeout: u64,
    /// Optional upstream proxy URL to chain through.
    pub upstream: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsSection {
    pub enabled: bool,
    pub cert_file: String,
    pub key_file: String,
    pub auto_cert: bool,
    pub auto_cert_host: String,
    pub auto_cert_dir: String,
    /// Skip certificate verification on upstream requests.
    pub insecure: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConversionSection {
    pub enabled: bool,
    pub tiktoken_encoding: String,
    pub negotiate_only: bool,
    pub convert_json: bool,
    pub template_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub dir: String,
    pub respect_headers: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputSection {
    pub enabled: bool,
    pub dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MitmSection {
    pub enabled: bool,
    /// Directory for root and leaf certificate persistence; empty keeps
    /// material in memory only.
    pub cert_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportSection {
    /// "http" for the direct transport, "chrome" for the browser pool.
    #[serde(rename = "type")]
    pub kind: String,
    pub chrome_url: String,
    pub pool_size: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FilterSection {
    pub allowed: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxySection::default(),
            tls: TlsSection::default(),
            conversion: ConversionSection::default(),
            max_body_size: 10 * 1024 * 1024,
            cache: CacheSection::default(),
            output: OutputSection::default(),
            mitm: MitmSection::default(),
            transport: TransportSection::default(),
            filter: FilterSection::default(),
            log_level: String::from("info"),
        }
    }
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            addr: String::from("0.0.0.0:8080"),
            read_timeout: 30,
            write_timeout: 30,
            upstream: String::new(),
        }
    }
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: String::new(),
            key_file: String::new(),
            auto_cert: true,
            auto_cert_host: String::from("localhost"),
            auto_cert_dir: String::from("./certs"),
            insecure: false,
        }
    }
}

impl Default for ConversionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            tiktoken_encoding: String::from("cl100k_base"),
            negotiate_only: false,
            convert_json: false,
            template_dir: String::new(),
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: String::new(),
            respect_headers: true,
        }
    }
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: String::new(),
        }
    }
}

impl Default for MitmSection {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_dir: String::new(),
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            kind: String::from("http"),
            chrome_url: String::from("http://localhost:9222"),
            pool_size: 4,
        }
    }
}

impl Default for FilterSection {
    fn default() -> Self {
        Self { allowed: Vec::new() }
    }
}

impl Config {
    /// Loads configuration: defaults, overlaid by the YAML file (the given
    /// path must exist; the default `./config.yml` may be absent), then by
    /// `MITM_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|err| {
                    Error::Config(format!("reading {}: {err}", path.display()))
                })?;
                serde_yaml::from_str(&text)
                    .map_err(|err| Error::Config(format!("parsing {}: {err}", path.display())))?
            }
            None => {
                let fallback = Path::new("config.yml");
                if fallback.exists() {
                    let text = std::fs::read_to_string(fallback)
                        .map_err(|err| Error::Config(format!("reading config.yml: {err}")))?;
                    serde_yaml::from_str(&text)
                        .map_err(|err| Error::Config(format!("parsing config.yml: {err}")))?
                } else {
                    Config::default()
                }
            }
        };

        config.apply_env(std::env::vars());
        Ok(config)
    }

    /// Applies `MITM_*` environment overrides from the given variables.
    pub fn apply_env<I: IntoIterator<Item = (String, String)>>(&mut self, vars: I) {
        for (key, value) in vars {
            match key.as_str() {
                "MITM_PROXY_ADDR" => self.proxy.addr = value,
                "MITM_PROXY_READ_TIMEOUT" => parse_into(&mut self.proxy.read_timeout, &value),
                "MITM_PROXY_WRITE_TIMEOUT" => parse_into(&mut self.proxy.write_timeout, &value),
                "MITM_PROXY_UPSTREAM" => self.proxy.upstream = value,
                "MITM_TLS_ENABLED" => parse_bool_into(&mut self.tls.enabled, &value),
                "MITM_TLS_CERT_FILE" => self.tls.cert_file = value,
                "MITM_TLS_KEY_FILE" => self.tls.key_file = value,
                "MITM_TLS_AUTO_CERT" => parse_bool_into(&mut self.tls.auto_cert, &value),
                "MITM_TLS_AUTO_CERT_HOST" => self.tls.auto_cert_host = value,
                "MITM_TLS_AUTO_CERT_DIR" => self.tls.auto_cert_dir = value,
                "MITM_TLS_INSECURE" => parse_bool_into(&mut self.tls.insecure, &value),
                "MITM_CONVERSION_ENABLED" => parse_bool_into(&mut self.conversion.enabled, &value),
                "MITM_CONVERSION_TIKTOKEN_ENCODING" => self.conversion.tiktoken_encoding = value,
                "MITM_CONVERSION_NEGOTIATE_ONLY" => {
                    parse_bool_into(&mut self.conversion.negotiate_only, &value)
                }
                "MITM_CONVERSION_CONVERT_JSON" => {
                    parse_bool_into(&mut self.conversion.convert_json, &value)
                }
                "MITM_CONVERSION_TEMPLATE_DIR" => self.conversion.template_dir = value,
                "MITM_MAX_BODY_SIZE" => parse_into(&mut self.max_body_size, &value),
                "MITM_CACHE_ENABLED" => parse_bool_into(&mut self.cache.enabled, &value),
                "MITM_CACHE_DIR" => self.cache.dir = value,
                "MITM_CACHE_RESPECT_HEADERS" => {
                    parse_bool_into(&mut self.cache.respect_headers, &value)
                }
                "MITM_OUTPUT_ENABLED" => parse_bool_into(&mut self.output.enabled, &value),
                "MITM_OUTPUT_DIR" => self.output.dir = value,
                "MITM_MITM_ENABLED" => parse_bool_into(&mut self.mitm.enabled, &value),
                "MITM_MITM_CERT_DIR" => self.mitm.cert_dir = value,
                "MITM_TRANSPORT_TYPE" => self.transport.kind = value,
                "MITM_TRANSPORT_CHROME_URL" => self.transport.chrome_url = value,
                "MITM_TRANSPORT_POOL_SIZE" => parse_into(&mut self.transport.pool_size, &value),
                "MITM_FILTER_ALLOW" => {
                    self.filter.allowed = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                }
                "MITM_LOG_LEVEL" => self.log_level = value,
                _ => {}
            }
        }
    }

    /// The listener address parsed as a socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.proxy
            .addr
            .parse()
            .map_err(|err| Error::Config(format!("invalid listen address {:?}: {err}", self.proxy.addr)))
    }
}

fn parse_into<T: std::str::FromStr>(target: &mut T, value: &str) {
    if let Ok(parsed) = value.trim().parse() {
        *target = parsed;
    } else {
        log::warn!("ignoring unparseable config override {value:?}");
    }
}

fn parse_bool_into(target: &mut bool, value: &str) {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *target = true,
        "0" | "false" | "no" | "off" => *target = false,
        other => log::warn!("ignoring unparseable boolean override {other:?}"),
    }
}
