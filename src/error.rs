use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(String),

    #[error("TLS material: {0}")]
    TlsMaterial(String),

    #[error("CA private key is not RSA")]
    UnsupportedKeyType,

    #[error("unsupported content-encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("request URL not allowed")]
    Forbidden,

    #[error("request URI must be absolute for proxy")]
    BadRequest,

    #[error("transport: {0}")]
    Transport(String),

    #[error("chrome control endpoint unreachable: {0}")]
    ChromeUnreachable(String),

    #[error("parsing JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("mustache template: {0}")]
    Template(String),

    #[error("conversion: {0}")]
    Converter(String),

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<rcgen::RcgenError> for Error {
    fn from(err: rcgen::RcgenError) -> Self {
        Error::TlsMaterial(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
