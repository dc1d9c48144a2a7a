pub mod ca;
pub mod cache;
pub mod chrome;
pub mod config;
pub mod convert;
pub mod decoder;
pub mod error;
pub mod filter;
pub mod output;
pub mod proxy;
pub mod rewrite;
pub mod templates;
pub mod tokens;
pub mod transport;

pub use error::Error;

/// Resolves when the host process receives an interrupt or termination
/// signal.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.expect("failed to install CTRL+C signal handler");
            }
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
}
