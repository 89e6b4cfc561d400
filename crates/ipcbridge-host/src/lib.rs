//! ipcbridge-host: the privileged side of an ipcbridge.
//!
//! [`ConnectionManager`] performs real socket and pipe I/O; [`adapters`] expose it as
//! the host behind any of the four bridge transports.

pub mod adapters;
pub mod config;
pub mod manager;

pub use adapters::{
    ManagerHost, ManagerProxy, ManagerSink, callback_bridge, closure_bridge, message_bridge,
    proxy_bridge, register_callbacks,
};
pub use config::ManagerConfig;
pub use manager::{ConnectionManager, ManagerError, PartialWrite};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a stderr subscriber for host processes.
///
/// `RUST_LOG` wins when set; otherwise `IPCBRIDGE_LOG` picks the level for both crates.
/// `LOG_FORMAT=json` switches to JSON lines. A subscriber already installed is kept.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("IPCBRIDGE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("ipcbridge={level},ipcbridge_host={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_tolerates_repeat_calls() {
        init_tracing();
        init_tracing();
        tracing::debug!("subscriber installed");
    }
}
