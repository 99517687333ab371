use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for smsgated
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Modem slots, one per SIM card
    #[serde(default)]
    pub modems: Vec<ModemSlot>,

    /// Pool-wide modem settings
    #[serde(default)]
    pub modempool: PoolConfig,

    /// Mail forwarding of received SMS
    #[serde(default)]
    pub mail: MailConfig,

    /// API listener
    #[serde(default)]
    pub server: ServerConfig,

    /// API feature flags and access tokens
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging, tracing and metrics
    #[serde(default)]
    pub logging: LoggingConfig,

    /// System call restriction
    #[serde(default)]
    pub seccomp: SeccompConfig,
}

/// Static configuration of one modem slot.
///
/// Loaded once at startup; changes require a restart.
#[derive(Debug, Clone, Deserialize)]
pub struct ModemSlot {
    /// Slot identifier, e.g. "00"
    pub id: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Device path, may contain `*` and `?` in the file name
    pub port: String,

    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Expected IMEI of the modem behind `port`
    pub imei: Option<String>,

    /// Own phone number in E.123 international form
    pub phone_number: String,

    /// Provider label (informational)
    #[serde(default)]
    pub provider: String,

    pub pin: Option<String>,

    /// USSD code that returns the prepaid balance
    pub ussd_balance_code: Option<String>,

    /// Regex extracting the balance from the USSD response (group 1)
    pub ussd_balance_pattern: Option<String>,

    #[serde(default = "default_currency")]
    pub currency: String,

    #[serde(default = "default_balance_warning")]
    pub balance_warning: f64,

    #[serde(default = "default_balance_critical")]
    pub balance_critical: f64,

    /// Routable prefixes, space separated or a list
    #[serde(default, deserialize_with = "string_list")]
    pub prefixes: Vec<String>,

    #[serde(default)]
    pub cost_per_sms: f64,

    /// Overrides `modempool.health_check_interval`
    #[serde(default, with = "humantime_serde::option")]
    pub health_check_interval: Option<Duration>,

    /// Overrides `modempool.self_test`
    pub self_test: Option<SelfTestCadence>,

    #[serde(default)]
    pub encoding: Encoding,

    /// Mail recipient for SMS received on this slot
    pub email_address: Option<String>,
}

impl ModemSlot {
    /// Health check interval for this slot
    pub fn health_interval(&self, pool: &PoolConfig) -> Duration {
        self.health_check_interval
            .unwrap_or(pool.health_check_interval)
    }

    /// Self-test cadence for this slot
    pub fn self_test_cadence(&self, pool: &PoolConfig) -> SelfTestCadence {
        self.self_test.unwrap_or(pool.self_test)
    }

    /// Whether the port pattern needs expansion
    pub fn has_wildcard(&self) -> bool {
        self.port.contains(['*', '?'])
    }

    /// Whether a balance query is configured
    pub fn balance_check_enabled(&self) -> bool {
        self.ussd_balance_code.is_some() && self.ussd_balance_pattern.is_some()
    }
}

/// Character set used on the modem link
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Encoding {
    #[default]
    Gsm,
    Ucs2,
}

impl Encoding {
    /// Name used with `AT+CSCS`
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Gsm => "GSM",
            Encoding::Ucs2 => "UCS2",
        }
    }
}

/// How often a slot sends its self-addressed keep-alive SMS
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SelfTestCadence {
    Daily,
    Weekly,
    #[default]
    Monthly,
}

/// Pool-wide settings
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Default health check interval
    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Default self-test cadence
    #[serde(default)]
    pub self_test: SelfTestCadence,

    /// IMEI to device path cache
    #[serde(default = "default_hint_file")]
    pub hint_file: PathBuf,

    /// Completed self-test periods
    #[serde(default = "default_self_test_file")]
    pub self_test_file: PathBuf,

    /// Retry cadence for slots without a live session
    #[serde(default = "default_discovery_interval", with = "humantime_serde")]
    pub discovery_interval: Duration,

    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    #[serde(default = "default_sms_timeout", with = "humantime_serde")]
    pub sms_timeout: Duration,

    #[serde(default = "default_ussd_timeout", with = "humantime_serde")]
    pub ussd_timeout: Duration,

    #[serde(default = "default_registration_timeout", with = "humantime_serde")]
    pub registration_timeout: Duration,

    /// Longest time a command may wait in a session queue before it starts
    #[serde(default = "default_queue_timeout", with = "humantime_serde")]
    pub queue_timeout: Duration,

    /// Commands buffered per session
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// How long received SMS stay fetchable
    #[serde(default = "default_inbound_retention", with = "humantime_serde")]
    pub inbound_retention: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            health_check_interval: default_health_check_interval(),
            self_test: SelfTestCadence::default(),
            hint_file: default_hint_file(),
            self_test_file: default_self_test_file(),
            discovery_interval: default_discovery_interval(),
            command_timeout: default_command_timeout(),
            sms_timeout: default_sms_timeout(),
            ussd_timeout: default_ussd_timeout(),
            registration_timeout: default_registration_timeout(),
            queue_timeout: default_queue_timeout(),
            queue_depth: default_queue_depth(),
            inbound_retention: default_inbound_retention(),
        }
    }
}

/// SMTPS delivery of received SMS
#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub server: String,

    /// Implicit TLS port; plain port 25 is rejected
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Default recipient when a slot has no `email_address`
    pub recipient: Option<String>,

    /// CA bundle used to verify the server
    #[serde(default = "default_ca_file")]
    pub ca_file: PathBuf,

    /// Name sent with EHLO
    #[serde(default = "default_helo_name")]
    pub helo_name: String,

    /// Delivery attempts per mail before it is dropped
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, doubled per attempt
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Per-session SMTP timeout
    #[serde(default = "default_smtp_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server: String::new(),
            port: default_smtp_port(),
            user: String::new(),
            password: String::new(),
            recipient: None,
            ca_file: default_ca_file(),
            helo_name: default_helo_name(),
            max_attempts: default_max_attempts(),
            retry_delay: default_retry_delay(),
            timeout: default_smtp_timeout(),
        }
    }
}

/// API listener
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Certificate chain (PEM); TLS is disabled without it
    pub certificate: Option<PathBuf>,

    /// Private key (PEM)
    pub key: Option<PathBuf>,

    #[serde(default)]
    pub min_tls_version: TlsVersion,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_api_port(),
            certificate: None,
            key: None,
            min_tls_version: TlsVersion::default(),
        }
    }
}

/// Minimum accepted TLS protocol version
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub enum TlsVersion {
    #[default]
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

/// API feature flags and hashed tokens
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub enable_send_sms: bool,

    #[serde(default)]
    pub enable_send_ussd: bool,

    #[serde(default)]
    pub tokens: TokenConfig,
}

/// Argon2 PHC hashes per capability
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenConfig {
    #[serde(default)]
    pub send_sms: Vec<String>,

    #[serde(default)]
    pub send_ussd: Vec<String>,

    #[serde(default)]
    pub get_health_state: Vec<String>,

    #[serde(default)]
    pub get_stats: Vec<String>,

    /// Inbound fetch tokens keyed by slot id
    #[serde(default)]
    pub fetch_sms: HashMap<String, Vec<String>>,
}

/// Logging and telemetry
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter; debug exposes SIM PINs and message bodies
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    /// OTLP endpoint for trace export
    pub otlp_endpoint: Option<String>,

    #[serde(default = "default_sample_rate")]
    pub trace_sample_rate: f64,

    /// Prometheus endpoint
    pub metrics_address: Option<SocketAddr>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            otlp_endpoint: None,
            trace_sample_rate: default_sample_rate(),
            metrics_address: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeccompConfig {
    #[serde(default)]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_baud() -> u32 {
    115_200
}

fn default_currency() -> String {
    "EUR".to_string()
}

fn default_balance_warning() -> f64 {
    5.0
}

fn default_balance_critical() -> f64 {
    1.0
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(600)
}

fn default_hint_file() -> PathBuf {
    PathBuf::from("/var/lib/smsgated/ports.hint")
}

fn default_self_test_file() -> PathBuf {
    PathBuf::from("/var/lib/smsgated/self-test.state")
}

fn default_discovery_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_sms_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_ussd_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_registration_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_queue_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_queue_depth() -> usize {
    64
}

fn default_inbound_retention() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_smtp_port() -> u16 {
    465
}

fn default_ca_file() -> PathBuf {
    PathBuf::from("/etc/ssl/certs/ca-certificates.crt")
}

fn default_helo_name() -> String {
    "smsgated".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_smtp_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    7000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

/// Accepts either `"+49 +43"` or `["+49", "+43"]`
fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Joined(String),
        List(Vec<String>),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Joined(s) => s.split_whitespace().map(str::to_string).collect(),
        Raw::List(items) => items,
    })
}

/// Durations as humantime strings ("10s", "5m") or plain seconds
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    fn to_duration<E: serde::de::Error>(raw: Raw) -> Result<Duration, E> {
        match raw {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => humantime::parse_duration(&s).map_err(E::custom),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        to_duration(Raw::deserialize(deserializer)?)
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<Raw>::deserialize(deserializer)?
                .map(to_duration)
                .transpose()
        }
    }
}
