use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default public routes: browsable without a session
const DEFAULT_PUBLIC_ROUTES: &str = "/,/login,/register,/verify-otp,/products,/categories";

/// Storefront credential lifecycle manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Storefront API base URL
    #[arg(short = 'u', long, env = "STOREFRONT_API_URL")]
    pub api_url: Option<String>,

    /// Path to the credential store (SQLite)
    #[arg(short = 's', long, env = "AUTH_STORE_FILE")]
    pub store_file: Option<String>,

    /// Seconds before expiry at which a token counts as near-expiry
    #[arg(long, env = "TOKEN_REFRESH_THRESHOLD", default_value = "300")]
    pub refresh_threshold: u64,

    /// Periodic refresh interval in seconds
    #[arg(long, env = "TOKEN_REFRESH_INTERVAL", default_value = "300")]
    pub refresh_interval: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "10")]
    pub http_timeout: u64,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "5")]
    pub connect_timeout: u64,

    /// Route unauthenticated navigations are redirected to
    #[arg(long, env = "LOGIN_ROUTE", default_value = "/login")]
    pub login_route: String,

    /// Comma-separated routes reachable without a session
    #[arg(long, env = "PUBLIC_ROUTES", default_value = DEFAULT_PUBLIC_ROUTES)]
    pub public_routes: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Log in with email and password (password is prompted)
    Login {
        #[arg(short, long)]
        email: String,
    },
    /// Create an account (password is prompted)
    Register {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        email: String,
    },
    /// Complete a login or registration with the emailed one-time code
    VerifyOtp {
        #[arg(short, long)]
        email: String,
        otp: String,
        /// The code belongs to a registration rather than a login
        #[arg(long)]
        registration: bool,
    },
    /// End the session and clear stored credentials
    Logout,
    /// Show session and credential status
    Status,
    /// Send an authenticated GET request and print the response
    Get { path: String },
    /// Run the navigation guard for a route
    Navigate { path: String },
    /// Keep the session alive until Ctrl-C
    Watch,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Storefront API
    pub api_url: String,

    // Credential store
    pub store_file: PathBuf,

    // Refresh
    pub token_refresh_threshold: u64,
    pub token_refresh_interval: u64,

    // HTTP client
    pub http_request_timeout: u64,
    pub http_connect_timeout: u64,

    // Navigation
    pub login_route: String,
    pub public_routes: Vec<String>,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Build configuration from parsed arguments (CLI > ENV > defaults)
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let config = Config {
            api_url: args
                .api_url
                .clone()
                .filter(|s| !s.trim().is_empty())
                .context("STOREFRONT_API_URL is required (use -u or set STOREFRONT_API_URL env var)")?
                .trim_end_matches('/')
                .to_string(),

            store_file: args
                .store_file
                .as_deref()
                .map(expand_tilde)
                .unwrap_or_else(default_store_file),

            token_refresh_threshold: args.refresh_threshold,
            token_refresh_interval: args.refresh_interval,

            http_request_timeout: args.http_timeout,
            http_connect_timeout: args.connect_timeout,

            login_route: args.login_route.clone(),
            public_routes: parse_public_routes(&args.public_routes),

            log_level: args.log_level.clone(),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.api_url)
            .with_context(|| format!("STOREFRONT_API_URL is not a valid URL: {}", self.api_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("STOREFRONT_API_URL must use http or https: {}", self.api_url);
        }

        if self.token_refresh_interval == 0 {
            anyhow::bail!("TOKEN_REFRESH_INTERVAL must be greater than zero");
        }

        if self.http_request_timeout == 0 {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }

        if !self.login_route.starts_with('/') {
            anyhow::bail!("LOGIN_ROUTE must start with '/': {}", self.login_route);
        }

        Ok(())
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn default_store_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".storefront")
        .join("auth.sqlite3")
}

/// Parse a comma-separated route list, dropping blanks
fn parse_public_routes(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(|r| {
            if r.starts_with('/') {
                r.to_string()
            } else {
                format!("/{}", r)
            }
        })
        .collect()
}
