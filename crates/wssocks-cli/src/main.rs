//! wssocks: SOCKS5 over WebSocket proxy tool.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use wssocks_client::{ClientOptions, WsSocksClient};
use wssocks_core::socks::SocksAuth;
use wssocks_server::{ReverseTokenOptions, ServerOptions, WsSocksServer};

#[derive(Parser)]
#[command(name = "wssocks", version, about = "SOCKS5 over WebSocket proxy tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start SOCKS5 over WebSocket proxy client
    Client {
        /// Authentication token
        #[arg(short, long, env = "WSSOCKS_TOKEN")]
        token: String,

        /// WebSocket server address
        #[arg(short, long, default_value = "ws://localhost:8765")]
        url: String,

        /// Use reverse socks5 proxy
        #[arg(short, long)]
        reverse: bool,

        /// SOCKS5 server listen address for forward proxy
        #[arg(short = 's', long, default_value = "127.0.0.1")]
        socks_host: String,

        /// SOCKS5 server listen port for forward proxy
        #[arg(short = 'p', long, default_value_t = 1080)]
        socks_port: u16,

        /// SOCKS5 authentication username
        #[arg(short = 'n', long)]
        socks_username: Option<String>,

        /// SOCKS5 authentication password
        #[arg(short = 'w', long, env = "WSSOCKS_SOCKS_PASSWORD")]
        socks_password: Option<String>,

        /// Start the SOCKS server immediately
        #[arg(short = 'i', long)]
        socks_no_wait: bool,

        /// Stop when the server disconnects
        #[arg(short = 'R', long)]
        no_reconnect: bool,

        /// Show debug logs
        #[arg(short, long)]
        debug: bool,
    },

    /// Start SOCKS5 over WebSocket proxy server
    Server {
        /// WebSocket server listen address
        #[arg(short = 'H', long, default_value = "0.0.0.0")]
        ws_host: String,

        /// WebSocket server listen port
        #[arg(short = 'P', long, default_value_t = 8765)]
        ws_port: u16,

        /// Specify auth token, auto-generate if not provided
        #[arg(short, long, env = "WSSOCKS_TOKEN")]
        token: Option<String>,

        /// Use reverse socks5 proxy
        #[arg(short, long)]
        reverse: bool,

        /// SOCKS5 server listen address for reverse proxy
        #[arg(short = 's', long, default_value = "127.0.0.1")]
        socks_host: String,

        /// SOCKS5 server listen port for reverse proxy
        #[arg(short = 'p', long, default_value_t = 1080)]
        socks_port: u16,

        /// SOCKS5 username for authentication
        #[arg(short = 'n', long)]
        socks_username: Option<String>,

        /// SOCKS5 password for authentication
        #[arg(short = 'w', long, env = "WSSOCKS_SOCKS_PASSWORD")]
        socks_password: Option<String>,

        /// Enable HTTP API with specified key
        #[arg(short = 'k', long)]
        api_key: Option<String>,

        /// HTTP API listen address
        #[arg(long, default_value = "127.0.0.1")]
        api_host: String,

        /// HTTP API listen port
        #[arg(long, default_value_t = 8766)]
        api_port: u16,

        /// Show debug logs
        #[arg(short, long)]
        debug: bool,
    },

    /// Print the version number
    Version,
}

fn init_logging(debug: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Version => {
            println!("wssocks version {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Client {
            token,
            url,
            reverse,
            socks_host,
            socks_port,
            socks_username,
            socks_password,
            socks_no_wait,
            no_reconnect,
            debug,
        } => {
            init_logging(debug);
            let socks_auth = match (socks_username, socks_password) {
                (Some(username), Some(password)) => Some(SocksAuth { username, password }),
                _ => None,
            };
            let client = WsSocksClient::new(
                token,
                ClientOptions {
                    url,
                    reverse,
                    socks_host,
                    socks_port,
                    socks_auth,
                    socks_wait_server: !socks_no_wait,
                    reconnect: !no_reconnect,
                    ..Default::default()
                },
            );
            tokio::select! {
                result = client.clone().run() => {
                    result.context("client error")?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal");
                    client.stop();
                }
            }
            Ok(())
        }
        Command::Server {
            ws_host,
            ws_port,
            token,
            reverse,
            socks_host,
            socks_port,
            socks_username,
            socks_password,
            api_key,
            api_host,
            api_port,
            debug,
        } => {
            init_logging(debug);
            let managed_by_api = api_key.is_some();
            let server = WsSocksServer::new(ServerOptions {
                ws_host,
                ws_port,
                socks_host: socks_host.clone(),
                api_key,
                api_host,
                api_port,
            });

            // Token management moves to the API when a key is configured.
            if !managed_by_api {
                if reverse {
                    let (use_token, port) = server
                        .add_reverse_token(ReverseTokenOptions {
                            token,
                            port: socks_port,
                            username: socks_username.clone(),
                            password: socks_password.clone(),
                        })
                        .await
                        .with_context(|| {
                            format!("cannot allocate SOCKS5 port: {socks_host}:{socks_port}")
                        })?;
                    info!("Configuration:");
                    info!("  Mode: reverse proxy (SOCKS5 on server -> client -> network)");
                    info!("  Token: {use_token}");
                    info!("  SOCKS5 port: {port}");
                    if let (Some(username), Some(_)) = (&socks_username, &socks_password) {
                        info!("  SOCKS5 username: {username}");
                    }
                } else {
                    let use_token = server.add_forward_token(token);
                    info!("Configuration:");
                    info!("  Mode: forward proxy (SOCKS5 on client -> server -> network)");
                    info!("  Token: {use_token}");
                }
            }

            tokio::select! {
                result = server.serve() => {
                    result.context("server error")?;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal");
                }
            }
            Ok(())
        }
    }
}
