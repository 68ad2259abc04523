use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Session-authenticated egress tunnel",
    long_about = "domain-tunnel exposes two front-ends backed by one credential/domain directory:\n\n\
- an HTTP header tunnel (handshake, keep-alive, data forwarding to mapped domains)\n\
- a SOCKS5 listener with line-based username/password authentication\n\n\
Each authenticated HTTP client is bound to a single mapped target domain per session.\n\
The directory file is reloaded automatically when it changes on disk."
)]
pub struct Cli {
    /// HTTP tunnel listen port
    #[arg(long = "http-port", default_value_t = 8080)]
    pub http_port: u16,

    /// SOCKS5 listen port
    #[arg(long = "socks-port", default_value_t = 1080)]
    pub socks_port: u16,

    /// IP address to bind both listeners
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: Ipv4Addr,

    /// Path to the credential/domain-mapping file
    #[arg(short, long, default_value = "config.json")]
    pub config: String,

    /// Directory for the server log file (console-only when omitted)
    #[arg(long = "log-dir")]
    pub log_dir: Option<String>,

    /// Timeout in seconds for SOCKS5 relay setup
    #[arg(short = 't', long, default_value_t = 10)]
    pub request_timeout: u64,
}

/// Server configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub http_listen_addr: SocketAddr,
    pub socks_listen_addr: SocketAddr,
    pub config_path: String,
    pub log_dir: Option<String>,
    pub request_timeout: u64,
}

impl ServerConfig {
    pub fn from_cli(args: Cli) -> Self {
        Self {
            http_listen_addr: SocketAddr::from((args.listen_ip, args.http_port)),
            socks_listen_addr: SocketAddr::from((args.listen_ip, args.socks_port)),
            config_path: args.config,
            log_dir: args.log_dir,
            request_timeout: args.request_timeout,
        }
    }
}
