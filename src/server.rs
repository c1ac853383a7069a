//! The accept loop.
//!
//! Binds a listener and runs one [`Connection`] task per accepted socket.
//! The protocol engine itself consumes only what the tenant injects; the
//! listener address is the one piece of configuration owned here.
use std::{env::var, io, sync::Arc};

use tokio::net::TcpListener;

use crate::{Connection, tenant::Tenant};

/// Listener configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
}

impl Config {
    /// Retrieve configuration from environment variable.
    ///
    /// It reads:
    /// - `VELD_SERVER_HOST`
    /// - `VELD_SERVER_PORT`
    pub fn from_env() -> Config {
        let host = var("VELD_SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_owned());
        let port = var("VELD_SERVER_PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .unwrap_or(5656);
        Self { host, port }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Accept connections forever, one task each.
pub async fn listen(config: Config, tenant: Arc<dyn Tenant>) -> io::Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    log::info!("listening on {}:{}", config.host, config.port);

    loop {
        let (socket, peer) = listener.accept().await?;
        socket.set_nodelay(true)?;
        let tenant = tenant.clone();
        tokio::spawn(async move {
            if let Err(err) = Connection::new(socket, tenant).serve().await {
                log::error!("client {peer}: {err:#}");
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_defaults() {
        // Env is not set under test; the defaults apply.
        let config = Config::from_env();
        assert_eq!(config.port, 5656);
        assert!(!config.host.is_empty());
    }
}
