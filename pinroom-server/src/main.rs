//! pinroom server: PIN rooms over WebSocket.
//!
//! Usage:
//! ```text
//! pinroom-server --port 8080 --allowed-origin https://*.onrender.com
//! RUST_LOG=debug PORT=10000 pinroom-server --welcome
//! ```

use clap::Parser;
use pinroom_hub::config::{EchoPolicy, HubConfig};
use pinroom_hub::origin::OriginPolicy;
use pinroom_hub::server::{HubServer, ServerConfig};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// PIN-addressed WebSocket rooms
#[derive(Parser, Clone, Debug)]
#[command(name = "pinroom-server", version, about = "PIN-addressed WebSocket rooms")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Bind address
    #[arg(long, env = "PINROOM_BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: IpAddr,

    /// Trusted origin, `scheme://host[:port]` (host may be `*.domain`)
    #[arg(long = "allowed-origin", env = "PINROOM_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Accept upgrades from any origin
    #[arg(long)]
    allow_any_origin: bool,

    /// Outbound queue capacity per peer
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,

    /// Seconds of silence before a peer is dropped; pings go out at 90% of this
    #[arg(long, default_value_t = 60)]
    pong_wait_secs: u64,

    /// Seconds allowed for each write
    #[arg(long, default_value_t = 10)]
    write_wait_secs: u64,

    /// Largest inbound message, in bytes
    #[arg(long, default_value_t = 512)]
    max_message_size: usize,

    /// Do not echo messages back to their sender
    #[arg(long)]
    no_echo: bool,

    /// Send a `joined` system message to each new peer
    #[arg(long)]
    welcome: bool,
}

impl Args {
    fn server_config(&self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let origins = if self.allow_any_origin {
            OriginPolicy::permissive()
        } else if self.allowed_origins.is_empty() {
            OriginPolicy::default()
        } else {
            OriginPolicy::from_patterns(&self.allowed_origins)?
        };

        let hub = HubConfig {
            queue_capacity: self.queue_capacity,
            write_wait: Duration::from_secs(self.write_wait_secs),
            max_message_size: self.max_message_size,
            echo: if self.no_echo { EchoPolicy::Others } else { EchoPolicy::All },
            welcome: self.welcome,
            ..HubConfig::default()
        }
        .with_pong_wait(Duration::from_secs(self.pong_wait_secs));

        Ok(ServerConfig {
            bind_addr: SocketAddr::new(self.bind_address, self.port).to_string(),
            hub,
            origins,
        })
    }
}

/// Resolve on SIGINT / SIGTERM (Ctrl-C elsewhere).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => log::info!("Received SIGINT - initiating graceful shutdown"),
                    _ = sigterm.recv() => log::info!("Received SIGTERM - initiating graceful shutdown"),
                }
                return;
            }
            _ => log::warn!("Failed to install signal handlers, falling back to Ctrl-C"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("Received Ctrl-C - initiating graceful shutdown");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.server_config()?;
    if config.origins.allows_any() {
        log::warn!("Origin checks disabled (--allow-any-origin)");
    }

    let server = HubServer::new(config)?;
    server.run(shutdown_signal()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_hub_defaults() {
        let args = Args::try_parse_from(["pinroom-server"]).unwrap();
        let config = args.server_config().unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.hub, HubConfig::default());
        assert_eq!(config.origins, OriginPolicy::default());
    }

    #[test]
    fn test_flags_map_to_config() {
        let args = Args::try_parse_from([
            "pinroom-server",
            "--port",
            "10000",
            "--bind-address",
            "127.0.0.1",
            "--allowed-origin",
            "https://*.onrender.com,http://localhost:3000",
            "--pong-wait-secs",
            "30",
            "--no-echo",
            "--welcome",
        ])
        .unwrap();
        let config = args.server_config().unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:10000");
        assert_eq!(config.origins.trusted().len(), 2);
        assert_eq!(config.hub.pong_wait, Duration::from_secs(30));
        assert_eq!(config.hub.ping_period, Duration::from_secs(27));
        assert_eq!(config.hub.echo, EchoPolicy::Others);
        assert!(config.hub.welcome);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_allow_any_origin() {
        let args = Args::try_parse_from(["pinroom-server", "--allow-any-origin"]).unwrap();
        assert!(args.server_config().unwrap().origins.allows_any());
    }

    #[test]
    fn test_bad_origin_pattern_rejected() {
        let args = Args::try_parse_from(["pinroom-server", "--allowed-origin", "not-an-origin"]).unwrap();
        assert!(args.server_config().is_err());
    }

    #[test]
    fn test_ipv6_bind_address_is_bracketed() {
        let args = Args::try_parse_from(["pinroom-server", "--bind-address", "::"]).unwrap();
        let config = args.server_config().unwrap();
        assert_eq!(config.bind_addr, "[::]:8080");
        assert!(config.bind_addr.parse::<SocketAddr>().is_ok());

        let args = Args::try_parse_from(["pinroom-server", "--bind-address", "::1", "--port", "9000"]).unwrap();
        assert_eq!(args.server_config().unwrap().bind_addr, "[::1]:9000");
    }

    #[test]
    fn test_bad_bind_address_rejected() {
        assert!(Args::try_parse_from(["pinroom-server", "--bind-address", "not-an-ip"]).is_err());
    }
}
