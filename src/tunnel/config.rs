//! Tunnel configuration and tuning resolution.
//!
//! [`Config`] is the caller-supplied description of one tunnel. The session
//! keeps its own copy and only ever writes back the OS-assigned local port.
//!
//! Tuning values follow a three-tier priority:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_CONNECT_TIMEOUT` | 30s | SSH connect and handshake timeout in seconds |
//! | `SSH_COMPRESSION` | true | Enable zlib compression |
//! | `SSH_MAX_RETRIES` | 3 | Reconnect attempts after the transport is lost |
//! | `SSH_RETRY_DELAY_MS` | 1000ms | Initial reconnect delay in milliseconds |
//! | `TUNNEL_CHANNEL_OPEN_ATTEMPTS` | 25 | Attempts to open a direct-tcpip channel |
//! | `TUNNEL_CHANNEL_OPEN_DELAY_MS` | 200ms | Delay between channel-open attempts |
//! | `TUNNEL_WRITE_ATTEMPTS` | 500 | Retry periods without progress before a client-to-SSH write aborts its channel |
//! | `TUNNEL_WRITE_RETRY_DELAY_MS` | 10ms | Length of one retry period for blocked SSH writes |
//! | `TUNNEL_MAX_STALLED_PASSES` | 300 | Successive periods in which every SSH write is blocked before reconnecting |
//! | `TUNNEL_BUFFER_SIZE` | 16384 | Per-direction channel buffer size in bytes |
//!
//! [`Config::from_env`] additionally reads the connection itself from
//! `TUNNEL_SSH_HOST`, `TUNNEL_SSH_PORT`, `TUNNEL_SSH_USER`,
//! `TUNNEL_SSH_PASSWORD`, `TUNNEL_SSH_KEY`, `TUNNEL_SSH_PUBLIC_KEY`,
//! `TUNNEL_SSH_PASSPHRASE`, `TUNNEL_AUTH`, `TUNNEL_LOCAL_IP`,
//! `TUNNEL_LOCAL_PORT`, `TUNNEL_REMOTE_HOST`, `TUNNEL_REMOTE_PORT` and
//! `TUNNEL_LOG_LEVEL`.

use std::env;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{Result, TunnelError};
use super::log::{LogCallback, LogContext, UserContext};

/// Default SSH connection timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default reconnect attempts once the transport is lost
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default initial reconnect delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Maximum reconnect delay cap
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

pub(crate) const DEFAULT_CHANNEL_OPEN_ATTEMPTS: u32 = 25;
pub(crate) const DEFAULT_CHANNEL_OPEN_DELAY_MS: u64 = 200;
pub(crate) const DEFAULT_WRITE_ATTEMPTS: u32 = 500;
pub(crate) const DEFAULT_WRITE_RETRY_DELAY_MS: u64 = 10;
pub(crate) const DEFAULT_MAX_STALLED_PASSES: u32 = 300;
pub(crate) const DEFAULT_BUFFER_SIZE: usize = 16384;

pub(crate) const DEFAULT_SSH_PORT: u16 = 22;

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub(crate) const COMPRESSION_ENV_VAR: &str = "SSH_COMPRESSION";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "SSH_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "SSH_RETRY_DELAY_MS";
pub(crate) const CHANNEL_OPEN_ATTEMPTS_ENV_VAR: &str = "TUNNEL_CHANNEL_OPEN_ATTEMPTS";
pub(crate) const CHANNEL_OPEN_DELAY_MS_ENV_VAR: &str = "TUNNEL_CHANNEL_OPEN_DELAY_MS";
pub(crate) const WRITE_ATTEMPTS_ENV_VAR: &str = "TUNNEL_WRITE_ATTEMPTS";
pub(crate) const WRITE_RETRY_DELAY_MS_ENV_VAR: &str = "TUNNEL_WRITE_RETRY_DELAY_MS";
pub(crate) const MAX_STALLED_PASSES_ENV_VAR: &str = "TUNNEL_MAX_STALLED_PASSES";
pub(crate) const BUFFER_SIZE_ENV_VAR: &str = "TUNNEL_BUFFER_SIZE";

const SSH_HOST_ENV_VAR: &str = "TUNNEL_SSH_HOST";
const SSH_PORT_ENV_VAR: &str = "TUNNEL_SSH_PORT";
const SSH_USER_ENV_VAR: &str = "TUNNEL_SSH_USER";
const SSH_PASSWORD_ENV_VAR: &str = "TUNNEL_SSH_PASSWORD";
const SSH_KEY_ENV_VAR: &str = "TUNNEL_SSH_KEY";
const SSH_PUBLIC_KEY_ENV_VAR: &str = "TUNNEL_SSH_PUBLIC_KEY";
const SSH_PASSPHRASE_ENV_VAR: &str = "TUNNEL_SSH_PASSPHRASE";
const AUTH_ENV_VAR: &str = "TUNNEL_AUTH";
const LOCAL_IP_ENV_VAR: &str = "TUNNEL_LOCAL_IP";
const LOCAL_PORT_ENV_VAR: &str = "TUNNEL_LOCAL_PORT";
const REMOTE_HOST_ENV_VAR: &str = "TUNNEL_REMOTE_HOST";
const REMOTE_PORT_ENV_VAR: &str = "TUNNEL_REMOTE_PORT";
const LOG_LEVEL_ENV_VAR: &str = "TUNNEL_LOG_LEVEL";

/// SSH authentication method requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthType {
    /// Succeeds only when the server accepts the `none` method.
    #[default]
    None,
    Password,
    PublicKey,
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthType::None => f.write_str("none"),
            AuthType::Password => f.write_str("password"),
            AuthType::PublicKey => f.write_str("public-key"),
        }
    }
}

impl FromStr for AuthType {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(AuthType::None),
            "password" => Ok(AuthType::Password),
            "public-key" | "publickey" | "key" => Ok(AuthType::PublicKey),
            other => Err(TunnelError::InvalidConfig(format!(
                "unknown auth type '{other}'"
            ))),
        }
    }
}

/// Severity of a log message, also used as the callback threshold.
///
/// Ordered from least to most verbose, so a configured level admits every
/// severity that compares less than or equal to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// Whether a message of `severity` passes this threshold.
    pub fn allows(self, severity: LogLevel) -> bool {
        severity <= self
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        };
        f.write_str(name)
    }
}

impl FromStr for LogLevel {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => Err(TunnelError::InvalidConfig(format!(
                "unknown log level '{other}'"
            ))),
        }
    }
}

/// Timeouts, retry bounds and buffer sizes used by setup and the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTuning {
    pub connect_timeout: Duration,
    pub compression: bool,
    pub channel_open_attempts: u32,
    pub channel_open_delay: Duration,
    pub write_attempts: u32,
    pub write_retry_delay: Duration,
    pub max_stalled_passes: u32,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub buffer_size: usize,
}

impl Default for TunnelTuning {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            compression: true,
            channel_open_attempts: DEFAULT_CHANNEL_OPEN_ATTEMPTS,
            channel_open_delay: Duration::from_millis(DEFAULT_CHANNEL_OPEN_DELAY_MS),
            write_attempts: DEFAULT_WRITE_ATTEMPTS,
            write_retry_delay: Duration::from_millis(DEFAULT_WRITE_RETRY_DELAY_MS),
            max_stalled_passes: DEFAULT_MAX_STALLED_PASSES,
            reconnect_attempts: DEFAULT_MAX_RETRIES,
            reconnect_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl TunnelTuning {
    /// Resolve every value from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            connect_timeout: Duration::from_secs(resolve_connect_timeout(None)),
            compression: resolve_compression(None),
            channel_open_attempts: resolve_channel_open_attempts(None),
            channel_open_delay: Duration::from_millis(resolve_channel_open_delay_ms(None)),
            write_attempts: resolve_write_attempts(None),
            write_retry_delay: Duration::from_millis(resolve_write_retry_delay_ms(None)),
            max_stalled_passes: resolve_max_stalled_passes(None),
            reconnect_attempts: resolve_max_retries(None),
            reconnect_delay: Duration::from_millis(resolve_retry_delay_ms(None)),
            buffer_size: resolve_buffer_size(None),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(TunnelError::InvalidConfig("buffer size must be non-zero".into()));
        }
        if self.channel_open_attempts == 0 {
            return Err(TunnelError::InvalidConfig(
                "channel open attempts must be at least 1".into(),
            ));
        }
        if self.write_attempts == 0 || self.max_stalled_passes == 0 {
            return Err(TunnelError::InvalidConfig(
                "write retry bounds must be at least 1".into(),
            ));
        }
        if self.write_retry_delay.is_zero() {
            return Err(TunnelError::InvalidConfig(
                "write retry delay must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn resolve_from_env<T: FromStr>(param: Option<T>, var: &str, default: T) -> T {
    // Priority 1: Use parameter if provided
    if let Some(value) = param {
        return value;
    }

    // Priority 2: Use environment variable if set
    if let Ok(raw) = env::var(var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    // Priority 3: Default value
    default
}

/// Resolve the connection timeout in seconds: parameter -> env var -> default
pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> u64 {
    resolve_from_env(timeout_param, CONNECT_TIMEOUT_ENV_VAR, DEFAULT_CONNECT_TIMEOUT_SECS)
}

/// Resolve the reconnect attempt bound: parameter -> env var -> default
pub(crate) fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    resolve_from_env(max_retries_param, MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES)
}

/// Resolve the initial reconnect delay: parameter -> env var -> default
pub(crate) fn resolve_retry_delay_ms(retry_delay_param: Option<u64>) -> u64 {
    resolve_from_env(retry_delay_param, RETRY_DELAY_MS_ENV_VAR, DEFAULT_RETRY_DELAY_MS)
}

pub(crate) fn resolve_channel_open_attempts(param: Option<u32>) -> u32 {
    resolve_from_env(param, CHANNEL_OPEN_ATTEMPTS_ENV_VAR, DEFAULT_CHANNEL_OPEN_ATTEMPTS)
}

pub(crate) fn resolve_channel_open_delay_ms(param: Option<u64>) -> u64 {
    resolve_from_env(param, CHANNEL_OPEN_DELAY_MS_ENV_VAR, DEFAULT_CHANNEL_OPEN_DELAY_MS)
}

pub(crate) fn resolve_write_attempts(param: Option<u32>) -> u32 {
    resolve_from_env(param, WRITE_ATTEMPTS_ENV_VAR, DEFAULT_WRITE_ATTEMPTS)
}

pub(crate) fn resolve_write_retry_delay_ms(param: Option<u64>) -> u64 {
    resolve_from_env(param, WRITE_RETRY_DELAY_MS_ENV_VAR, DEFAULT_WRITE_RETRY_DELAY_MS)
}

pub(crate) fn resolve_max_stalled_passes(param: Option<u32>) -> u32 {
    resolve_from_env(param, MAX_STALLED_PASSES_ENV_VAR, DEFAULT_MAX_STALLED_PASSES)
}

pub(crate) fn resolve_buffer_size(param: Option<usize>) -> usize {
    resolve_from_env(param, BUFFER_SIZE_ENV_VAR, DEFAULT_BUFFER_SIZE)
}

/// Resolve the compression setting: parameter -> env var -> default (true)
pub(crate) fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

/// Everything needed to run one tunnel.
#[derive(Clone)]
pub struct Config {
    pub auth_type: AuthType,
    pub log_level: LogLevel,
    pub private_key_path: Option<PathBuf>,
    pub public_key_path: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub local_ip: IpAddr,
    /// `0` lets the OS pick; the session writes the chosen port back.
    pub local_port: u16,
    /// Resolved by the SSH server, not locally.
    pub remote_host: String,
    pub remote_port: u16,
    pub ssh_server_ip: String,
    pub ssh_server_port: u16,
    pub username: String,
    pub password: Option<String>,
    pub log_callback: Option<LogCallback>,
    pub user_context: Option<UserContext>,
    pub tuning: TunnelTuning,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("auth_type", &self.auth_type)
            .field("log_level", &self.log_level)
            .field("private_key_path", &self.private_key_path)
            .field("public_key_path", &self.public_key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("local_ip", &self.local_ip)
            .field("local_port", &self.local_port)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("ssh_server_ip", &self.ssh_server_ip)
            .field("ssh_server_port", &self.ssh_server_port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("log_callback", &self.log_callback.as_ref().map(|_| "<callback>"))
            .field("user_context", &self.user_context.as_ref().map(|_| "<context>"))
            .field("tuning", &self.tuning)
            .finish()
    }
}

impl Config {
    /// A config with no authentication, info logging and an OS-assigned
    /// loopback port.
    pub fn new(
        ssh_server: impl Into<String>,
        username: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            auth_type: AuthType::None,
            log_level: LogLevel::Info,
            private_key_path: None,
            public_key_path: None,
            passphrase: None,
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_port: 0,
            remote_host: remote_host.into(),
            remote_port,
            ssh_server_ip: ssh_server.into(),
            ssh_server_port: DEFAULT_SSH_PORT,
            username: username.into(),
            password: None,
            log_callback: None,
            user_context: None,
            tuning: TunnelTuning::default(),
        }
    }

    pub fn ssh_port(mut self, port: u16) -> Self {
        self.ssh_server_port = port;
        self
    }

    /// Switch to password authentication.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.auth_type = AuthType::Password;
        self.password = Some(password.into());
        self
    }

    /// Switch to public-key authentication with the given private key.
    pub fn private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.auth_type = AuthType::PublicKey;
        self.private_key_path = Some(path.into());
        self
    }

    pub fn public_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.public_key_path = Some(path.into());
        self
    }

    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn auth_type(mut self, auth_type: AuthType) -> Self {
        self.auth_type = auth_type;
        self
    }

    pub fn local(mut self, ip: IpAddr, port: u16) -> Self {
        self.local_ip = ip;
        self.local_port = port;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn log_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&LogContext<'_>, &str, LogLevel) + Send + Sync + 'static,
    {
        self.log_callback = Some(Arc::new(callback));
        self
    }

    pub fn user_context(mut self, context: UserContext) -> Self {
        self.user_context = Some(context);
        self
    }

    pub fn tuning(mut self, tuning: TunnelTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// `host:port` of the destination as seen from the SSH server.
    pub fn remote_address(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// `host:port` of the SSH server.
    pub fn ssh_address(&self) -> String {
        format!("{}:{}", self.ssh_server_ip, self.ssh_server_port)
    }

    /// Check the fields a session needs before any network I/O.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(TunnelError::InvalidConfig(message.to_string()));

        if self.username.trim().is_empty() {
            return invalid("username is empty");
        }
        if self.ssh_server_ip.trim().is_empty() {
            return invalid("SSH server address is empty");
        }
        if self.ssh_server_port == 0 {
            return invalid("SSH server port is 0");
        }
        if self.remote_host.trim().is_empty() {
            return invalid("remote host is empty");
        }
        if self.remote_port == 0 {
            return invalid("remote port is 0");
        }

        match self.auth_type {
            AuthType::Password if self.password.is_none() => {
                return invalid("password authentication requires a password");
            }
            AuthType::PublicKey if self.private_key_path.is_none() => {
                return invalid("public-key authentication requires a private key path");
            }
            _ => {}
        }

        self.tuning.validate()
    }

    /// Build a config from `TUNNEL_*` environment variables.
    ///
    /// When `TUNNEL_AUTH` is unset the method is inferred: a key path selects
    /// public-key, a password selects password, otherwise `none`.
    pub fn from_env() -> Result<Self> {
        let ssh_host = required_env(SSH_HOST_ENV_VAR)?;
        let username = required_env(SSH_USER_ENV_VAR)?;
        let remote_host = required_env(REMOTE_HOST_ENV_VAR)?;
        let remote_port = parse_env(REMOTE_PORT_ENV_VAR)?.ok_or_else(|| missing(REMOTE_PORT_ENV_VAR))?;

        let mut config = Config::new(ssh_host, username, remote_host, remote_port)
            .tuning(TunnelTuning::from_env());

        if let Some(port) = parse_env(SSH_PORT_ENV_VAR)? {
            config.ssh_server_port = port;
        }
        if let Some(ip) = parse_env(LOCAL_IP_ENV_VAR)? {
            config.local_ip = ip;
        }
        if let Some(port) = parse_env(LOCAL_PORT_ENV_VAR)? {
            config.local_port = port;
        }
        if let Some(level) = parse_env(LOG_LEVEL_ENV_VAR)? {
            config.log_level = level;
        }

        config.password = optional_env(SSH_PASSWORD_ENV_VAR);
        config.private_key_path = optional_env(SSH_KEY_ENV_VAR).map(PathBuf::from);
        config.public_key_path = optional_env(SSH_PUBLIC_KEY_ENV_VAR).map(PathBuf::from);
        config.passphrase = optional_env(SSH_PASSPHRASE_ENV_VAR);

        config.auth_type = match parse_env(AUTH_ENV_VAR)? {
            Some(auth_type) => auth_type,
            None if config.private_key_path.is_some() => AuthType::PublicKey,
            None if config.password.is_some() => AuthType::Password,
            None => AuthType::None,
        };

        Ok(config)
    }
}

fn missing(var: &str) -> TunnelError {
    TunnelError::InvalidConfig(format!("{var} is not set"))
}

fn optional_env(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.is_empty())
}

fn required_env(var: &str) -> Result<String> {
    optional_env(var).ok_or_else(|| missing(var))
}

fn parse_env<T>(var: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    optional_env(var)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| TunnelError::InvalidConfig(format!("{var}='{raw}': {e}")))
        })
        .transpose()
}
