//! Configuration management for the Aurora Iceberg REST server.
//!
//! Settings live in a flat key/value [`Properties`] map. A configuration file
//! is a YAML mapping of dotted keys (`http.port: 9001`); nested mappings are
//! flattened with `.` so both styles are accepted. After the file is read,
//! every recognised key can be overridden by an `AURORA_*` environment
//! variable (`http.port` -> `AURORA_HTTP_PORT`).
//!
//! Each recognised key is declared once as a typed [`ConfigEntry`] with its
//! default and validity check. The typed views ([`ServerConfig`],
//! [`MetricsConfig`], [`IcebergServerConfig`]) are built from a `Properties`
//! map and validated before any resource is allocated.
//!
//! # Examples
//!
//! ```
//! use aurora_core::config::{IcebergServerConfig, Properties};
//!
//! let props = Properties::from_yaml("host: 127.0.0.1\nhttp.port: 0\n").unwrap();
//! let config = IcebergServerConfig::from_properties(props).unwrap();
//! assert_eq!(config.server.host, "127.0.0.1");
//! assert!(config.server.validate().is_ok());
//! ```

use crate::error::ConfigError;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

pub const POSITIVE_NUMBER_ERROR_MSG: &str = "must be a positive number";
pub const NOT_BLANK_ERROR_MSG: &str = "must not be blank";

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "AURORA_";

// ============================================================================
// Properties
// ============================================================================

/// Flat, ordered key/value configuration map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads properties from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a YAML mapping.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::load_failed(path.display().to_string(), e.to_string()))?;

        Self::from_yaml(&contents).map_err(|e| match e {
            ConfigError::LoadFailed { reason, .. } => {
                ConfigError::load_failed(path.display().to_string(), reason)
            }
            other => other,
        })
    }

    /// Parses properties from a YAML document.
    ///
    /// Scalars are stored as their string form, sequences are joined with
    /// commas and `null` is stored as an empty (blank) value.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let document: Value = serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::load_failed("<yaml>", e.to_string()))?;

        let mut entries = BTreeMap::new();
        match document {
            Value::Null => {}
            Value::Mapping(_) => flatten_into("", &document, &mut entries)?,
            _ => {
                return Err(ConfigError::load_failed(
                    "<yaml>",
                    "top level of a configuration file must be a mapping",
                ))
            }
        }

        Ok(Self { entries })
    }

    /// Sets a value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Builder-style variant of [`Properties::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns every entry under `prefix`, with the prefix stripped.
    pub fn with_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.entries
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, v)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty()).then(|| (rest.to_owned(), v.clone()))
            })
            .collect()
    }

    /// Overrides `keys` from the process environment.
    pub fn apply_env_overrides(&mut self, keys: &[&str]) -> usize {
        self.apply_overrides_from(keys, |name| std::env::var(name).ok())
    }

    /// Overrides `keys` using `lookup` to resolve environment variable names.
    ///
    /// Returns the number of keys that were overridden.
    pub fn apply_overrides_from<F>(&mut self, keys: &[&str], lookup: F) -> usize
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut applied = 0;
        for key in keys {
            let var = env_var_name(key);
            if let Some(value) = lookup(&var) {
                debug!(key = %key, env = %var, "Configuration overridden from environment");
                self.entries.insert((*key).to_owned(), value);
                applied += 1;
            }
        }
        applied
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Environment variable consulted for a configuration key.
pub fn env_var_name(key: &str) -> String {
    let mut name = String::with_capacity(ENV_PREFIX.len() + key.len());
    name.push_str(ENV_PREFIX);
    for c in key.chars() {
        match c {
            '.' | '-' => name.push('_'),
            c => name.push(c.to_ascii_uppercase()),
        }
    }
    name
}

fn flatten_into(
    prefix: &str,
    value: &Value,
    out: &mut BTreeMap<String, String>,
) -> Result<(), ConfigError> {
    match value {
        Value::Mapping(map) => {
            for (k, v) in map {
                let key = scalar_to_string(k).ok_or_else(|| {
                    ConfigError::load_failed("<yaml>", format!("unsupported key under '{prefix}'"))
                })?;
                let full = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(&full, v, out)?;
            }
        }
        Value::Sequence(items) => {
            let joined = items
                .iter()
                .map(|item| {
                    scalar_to_string(item).ok_or_else(|| {
                        ConfigError::invalid_value(prefix, "lists may only contain scalars")
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
                .join(",");
            out.insert(prefix.to_owned(), joined);
        }
        Value::Tagged(tagged) => flatten_into(prefix, &tagged.value, out)?,
        scalar => {
            out.insert(prefix.to_owned(), scalar_to_string(scalar).unwrap_or_default());
        }
    }
    Ok(())
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

// ============================================================================
// Typed entries
// ============================================================================

/// A type that can be parsed from a raw configuration string.
pub trait ConfigValue: Sized {
    fn parse_value(raw: &str) -> Result<Self, String>;
}

impl ConfigValue for String {
    fn parse_value(raw: &str) -> Result<Self, String> {
        Ok(raw.trim().to_owned())
    }
}

impl ConfigValue for bool {
    fn parse_value(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(format!("expected true or false, got '{other}'")),
        }
    }
}

macro_rules! numeric_config_value {
    ($($ty:ty),*) => {
        $(
            impl ConfigValue for $ty {
                fn parse_value(raw: &str) -> Result<Self, String> {
                    let raw = raw.trim();
                    if raw.is_empty() {
                        return Err("expected a number, got a blank value".to_owned());
                    }
                    raw.parse::<$ty>()
                        .map_err(|e| format!("'{raw}' is not a valid {}: {e}", stringify!($ty)))
                }
            }
        )*
    };
}

numeric_config_value!(u16, u32, u64, usize, i32, i64);

/// Comma separated list; blank items are dropped.
impl ConfigValue for Vec<String> {
    fn parse_value(raw: &str) -> Result<Self, String> {
        Ok(raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_owned)
            .collect())
    }
}

struct Check<T> {
    predicate: fn(&T) -> bool,
    message: &'static str,
}

impl<T> Clone for Check<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Check<T> {}

/// Declaration of one configuration key.
pub struct ConfigEntry<T> {
    pub key: &'static str,
    pub doc: &'static str,
    default: Option<&'static str>,
    check: Option<Check<T>>,
}

impl<T> Clone for ConfigEntry<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ConfigEntry<T> {}

impl<T> fmt::Debug for ConfigEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigEntry")
            .field("key", &self.key)
            .field("default", &self.default)
            .finish()
    }
}

impl<T> ConfigEntry<T> {
    pub const fn new(key: &'static str, doc: &'static str) -> Self {
        Self {
            key,
            doc,
            default: None,
            check: None,
        }
    }

    /// Default, written the same way a user would write the value.
    pub const fn with_default(self, default: &'static str) -> Self {
        Self {
            default: Some(default),
            ..self
        }
    }

    pub const fn with_check(self, predicate: fn(&T) -> bool, message: &'static str) -> Self {
        Self {
            check: Some(Check { predicate, message }),
            ..self
        }
    }

    pub fn default_value(&self) -> Option<&'static str> {
        self.default
    }
}

impl<T: ConfigValue> ConfigEntry<T> {
    /// Reads the entry, falling back to its default.
    ///
    /// # Errors
    ///
    /// Fails when the key is absent and has no default, when the value does
    /// not parse, or when it fails the entry's check.
    pub fn read(&self, props: &Properties) -> Result<T, ConfigError> {
        let raw = props
            .get(self.key)
            .or(self.default)
            .ok_or_else(|| ConfigError::missing_field(self.key))?;
        self.parse(raw)
    }

    /// Reads an entry that may legitimately be absent.
    pub fn read_optional(&self, props: &Properties) -> Result<Option<T>, ConfigError> {
        match props.get(self.key).or(self.default) {
            Some(raw) => self.parse(raw).map(Some),
            None => Ok(None),
        }
    }

    fn parse(&self, raw: &str) -> Result<T, ConfigError> {
        let value =
            T::parse_value(raw).map_err(|reason| ConfigError::invalid_value(self.key, reason))?;
        if let Some(check) = self.check {
            if !(check.predicate)(&value) {
                return Err(ConfigError::invalid_value(self.key, check.message));
            }
        }
        Ok(value)
    }
}

fn positive_u64(value: &u64) -> bool {
    *value > 0
}

fn positive_usize(value: &usize) -> bool {
    *value > 0
}

fn not_blank(value: &String) -> bool {
    !value.trim().is_empty()
}

pub const SERVER_SHUTDOWN_TIMEOUT: ConfigEntry<u64> = ConfigEntry::new(
    "server.shutdown.timeout",
    "Grace period (millis) granted to a signal-triggered shutdown",
)
.with_default("3000")
.with_check(positive_u64, POSITIVE_NUMBER_ERROR_MSG);

pub const CATALOG_BACKEND: ConfigEntry<String> =
    ConfigEntry::new("catalog-backend", "Catalog backend of the Iceberg REST server")
        .with_default("memory")
        .with_check(not_blank, NOT_BLANK_ERROR_MSG);

pub const HOST: ConfigEntry<String> = ConfigEntry::new("host", "Interface the server binds to")
    .with_default("0.0.0.0")
    .with_check(not_blank, NOT_BLANK_ERROR_MSG);

pub const HTTP_PORT: ConfigEntry<u16> =
    ConfigEntry::new("http.port", "Plaintext listening port (0 picks an ephemeral port)")
        .with_default("9001");

pub const HTTPS_PORT: ConfigEntry<u16> =
    ConfigEntry::new("https.port", "TLS listening port (0 picks an ephemeral port)")
        .with_default("9433");

pub const ENABLE_HTTPS: ConfigEntry<bool> =
    ConfigEntry::new("enable.https", "Serve over TLS instead of plaintext").with_default("false");

pub const ENABLE_CLIENT_AUTH: ConfigEntry<bool> =
    ConfigEntry::new("enable.client.auth", "Require and verify client certificates")
        .with_default("false");

pub const KEYSTORE_PATH: ConfigEntry<String> =
    ConfigEntry::new("keystore.path", "Server certificate and private key");

pub const KEYSTORE_PASSWORD: ConfigEntry<String> =
    ConfigEntry::new("keystore.password", "Password of the key store");

pub const KEYSTORE_MANAGER_PASSWORD: ConfigEntry<String> = ConfigEntry::new(
    "keystore.manager.password",
    "Password protecting the private key inside the key store",
);

pub const KEYSTORE_TYPE: ConfigEntry<KeyStoreType> =
    ConfigEntry::new("keystore.type", "Key store format: PEM or PKCS12").with_default("PEM");

pub const TLS_PROTOCOL: ConfigEntry<String> =
    ConfigEntry::new("tls.protocol", "Pinned TLS protocol: TLSv1.2, TLSv1.3 or TLS");

pub const ENABLE_CIPHER_ALGORITHMS: ConfigEntry<Vec<String>> = ConfigEntry::new(
    "enable.cipher.algorithms",
    "Comma separated allow-list of IANA cipher suite names",
)
.with_default("");

pub const TRUSTSTORE_PATH: ConfigEntry<String> =
    ConfigEntry::new("truststore.path", "CA certificates used to verify clients");

pub const TRUSTSTORE_PASSWORD: ConfigEntry<String> =
    ConfigEntry::new("truststore.password", "Password of the trust store");

pub const TRUSTSTORE_TYPE: ConfigEntry<KeyStoreType> =
    ConfigEntry::new("truststore.type", "Trust store format: PEM or PKCS12").with_default("PEM");

pub const MIN_THREADS: ConfigEntry<usize> =
    ConfigEntry::new("min.threads", "Worker threads kept alive when idle")
        .with_default("8")
        .with_check(positive_usize, POSITIVE_NUMBER_ERROR_MSG);

pub const MAX_THREADS: ConfigEntry<usize> =
    ConfigEntry::new("max.threads", "Upper bound on worker threads")
        .with_default("200")
        .with_check(positive_usize, POSITIVE_NUMBER_ERROR_MSG);

pub const THREAD_POOL_WORK_QUEUE_SIZE: ConfigEntry<usize> = ConfigEntry::new(
    "thread.pool.work.queue.size",
    "Connections allowed to wait for a worker",
)
.with_default("100")
.with_check(positive_usize, POSITIVE_NUMBER_ERROR_MSG);

pub const THREAD_POOL_ADMISSION_TIMEOUT: ConfigEntry<u64> = ConfigEntry::new(
    "thread.pool.admission.timeout",
    "How long (millis) the acceptor waits for a free queue slot before dropping a connection",
)
.with_default("5000")
.with_check(positive_u64, POSITIVE_NUMBER_ERROR_MSG);

pub const IDLE_TIMEOUT: ConfigEntry<u64> =
    ConfigEntry::new("idle.timeout", "Idle connection timeout (millis)")
        .with_default("30000")
        .with_check(positive_u64, POSITIVE_NUMBER_ERROR_MSG);

pub const STOP_TIMEOUT: ConfigEntry<u64> =
    ConfigEntry::new("stop.timeout", "Time (millis) in-flight work may take to drain on stop")
        .with_default("30000")
        .with_check(positive_u64, POSITIVE_NUMBER_ERROR_MSG);

pub const REQUEST_HEADER_SIZE: ConfigEntry<usize> =
    ConfigEntry::new("request.header.size", "Maximum request header size (bytes)")
        .with_default("131072")
        .with_check(positive_usize, POSITIVE_NUMBER_ERROR_MSG);

pub const RESPONSE_HEADER_SIZE: ConfigEntry<usize> =
    ConfigEntry::new("response.header.size", "Maximum response header size (bytes)")
        .with_default("131072")
        .with_check(positive_usize, POSITIVE_NUMBER_ERROR_MSG);

pub const CUSTOM_FILTERS: ConfigEntry<Vec<String>> =
    ConfigEntry::new("custom.filters", "Comma separated names of registered filters")
        .with_default("");

/// Prefix of per-filter parameters: `filters.<name>.param.<key>`.
pub const FILTER_PARAM_PREFIX: &str = "filters.";

pub const ICEBERG_METRICS_STORE: ConfigEntry<String> = ConfigEntry::new(
    "iceberg.metrics.store",
    "Metrics store backend: memory or file (unset disables persistence)",
);

pub const ICEBERG_METRICS_STORE_PATH: ConfigEntry<String> =
    ConfigEntry::new("iceberg.metrics.store.path", "File of the file metrics store");

pub const ICEBERG_METRICS_STORE_CAPACITY: ConfigEntry<usize> = ConfigEntry::new(
    "iceberg.metrics.store.capacity",
    "Events retained by the memory metrics store",
)
.with_default("10000")
.with_check(positive_usize, POSITIVE_NUMBER_ERROR_MSG);

pub const ICEBERG_METRICS_STORE_RETAIN_DAYS: ConfigEntry<i32> = ConfigEntry::new(
    "iceberg.metrics.store.retain.days",
    "Days metric records are kept; zero or negative keeps them forever",
)
.with_default("-1");

pub const ICEBERG_METRICS_QUEUE_CAPACITY: ConfigEntry<usize> =
    ConfigEntry::new("iceberg.metrics.queue.capacity", "Capacity of the metric event queue")
        .with_default("1000")
        .with_check(positive_usize, POSITIVE_NUMBER_ERROR_MSG);

pub const ICEBERG_METRICS_EVICTION_INTERVAL: ConfigEntry<u64> = ConfigEntry::new(
    "iceberg.metrics.eviction.interval",
    "Interval (millis) between retention sweeps",
)
.with_default("3600000")
.with_check(positive_u64, POSITIVE_NUMBER_ERROR_MSG);

/// Keys that may be overridden from the environment.
pub const KNOWN_KEYS: &[&str] = &[
    SERVER_SHUTDOWN_TIMEOUT.key,
    CATALOG_BACKEND.key,
    HOST.key,
    HTTP_PORT.key,
    HTTPS_PORT.key,
    ENABLE_HTTPS.key,
    ENABLE_CLIENT_AUTH.key,
    KEYSTORE_PATH.key,
    KEYSTORE_PASSWORD.key,
    KEYSTORE_MANAGER_PASSWORD.key,
    KEYSTORE_TYPE.key,
    TLS_PROTOCOL.key,
    ENABLE_CIPHER_ALGORITHMS.key,
    TRUSTSTORE_PATH.key,
    TRUSTSTORE_PASSWORD.key,
    TRUSTSTORE_TYPE.key,
    MIN_THREADS.key,
    MAX_THREADS.key,
    THREAD_POOL_WORK_QUEUE_SIZE.key,
    THREAD_POOL_ADMISSION_TIMEOUT.key,
    IDLE_TIMEOUT.key,
    STOP_TIMEOUT.key,
    REQUEST_HEADER_SIZE.key,
    RESPONSE_HEADER_SIZE.key,
    CUSTOM_FILTERS.key,
    ICEBERG_METRICS_STORE.key,
    ICEBERG_METRICS_STORE_PATH.key,
    ICEBERG_METRICS_STORE_CAPACITY.key,
    ICEBERG_METRICS_STORE_RETAIN_DAYS.key,
    ICEBERG_METRICS_QUEUE_CAPACITY.key,
    ICEBERG_METRICS_EVICTION_INTERVAL.key,
];

// ============================================================================
// Server configuration
// ============================================================================

/// Format of a key or trust store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStoreType {
    /// PEM file with certificates (and, for key stores, a private key)
    #[default]
    Pem,
    /// PKCS#12 archive
    Pkcs12,
}

impl FromStr for KeyStoreType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PEM" => Ok(Self::Pem),
            "PKCS12" | "P12" | "PFX" => Ok(Self::Pkcs12),
            other => Err(format!("unsupported store type '{other}', expected PEM or PKCS12")),
        }
    }
}

impl ConfigValue for KeyStoreType {
    fn parse_value(raw: &str) -> Result<Self, String> {
        raw.parse()
    }
}

impl fmt::Display for KeyStoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStoreType::Pem => write!(f, "PEM"),
            KeyStoreType::Pkcs12 => write!(f, "PKCS12"),
        }
    }
}

/// Key material and handshake policy of a TLS connector.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    pub key_store_path: String,
    pub key_store_password: String,
    pub key_manager_password: String,
    pub key_store_type: KeyStoreType,
    /// `TLSv1.2`, `TLSv1.3` or `TLS`; `None` enables every supported version
    pub protocol: Option<String>,
    /// IANA cipher suite names; empty enables the provider defaults
    pub cipher_suites: Vec<String>,
    pub client_auth_required: bool,
    pub trust_store_path: Option<String>,
    pub trust_store_password: Option<String>,
    pub trust_store_type: KeyStoreType,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("key_store_path", &self.key_store_path)
            .field("key_store_password", &"<redacted>")
            .field("key_manager_password", &"<redacted>")
            .field("key_store_type", &self.key_store_type)
            .field("protocol", &self.protocol)
            .field("cipher_suites", &self.cipher_suites)
            .field("client_auth_required", &self.client_auth_required)
            .field("trust_store_path", &self.trust_store_path)
            .field("trust_store_type", &self.trust_store_type)
            .finish()
    }
}

impl TlsMaterial {
    fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        Ok(Self {
            key_store_path: KEYSTORE_PATH.read_optional(props)?.unwrap_or_default(),
            key_store_password: KEYSTORE_PASSWORD.read_optional(props)?.unwrap_or_default(),
            key_manager_password: KEYSTORE_MANAGER_PASSWORD
                .read_optional(props)?
                .unwrap_or_default(),
            key_store_type: KEYSTORE_TYPE.read(props)?,
            protocol: TLS_PROTOCOL
                .read_optional(props)?
                .filter(|protocol| !protocol.is_empty()),
            cipher_suites: ENABLE_CIPHER_ALGORITHMS.read(props)?,
            client_auth_required: ENABLE_CLIENT_AUTH.read(props)?,
            trust_store_path: TRUSTSTORE_PATH.read_optional(props)?,
            trust_store_password: TRUSTSTORE_PASSWORD.read_optional(props)?,
            trust_store_type: TRUSTSTORE_TYPE.read(props)?,
        })
    }

    /// Checks that every secret the connector needs is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_not_blank(KEYSTORE_PATH.key, &self.key_store_path, "enable.https is true")?;
        require_not_blank(
            KEYSTORE_PASSWORD.key,
            &self.key_store_password,
            "enable.https is true",
        )?;
        require_not_blank(
            KEYSTORE_MANAGER_PASSWORD.key,
            &self.key_manager_password,
            "enable.https is true",
        )?;

        if self.client_auth_required {
            require_not_blank(
                TRUSTSTORE_PATH.key,
                self.trust_store_path.as_deref().unwrap_or_default(),
                "enable.client.auth is true",
            )?;
            require_not_blank(
                TRUSTSTORE_PASSWORD.key,
                self.trust_store_password.as_deref().unwrap_or_default(),
                "enable.client.auth is true",
            )?;
        }

        if let Some(protocol) = &self.protocol {
            if !matches!(protocol.as_str(), "TLS" | "TLSv1.2" | "TLSv1.3") {
                return Err(ConfigError::invalid_value(
                    TLS_PROTOCOL.key,
                    format!("unsupported protocol '{protocol}', expected TLSv1.2, TLSv1.3 or TLS"),
                ));
            }
        }

        Ok(())
    }
}

fn require_not_blank(field: &str, value: &str, when: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::invalid_value(
            field,
            format!("{NOT_BLANK_ERROR_MSG} when {when}"),
        ));
    }
    Ok(())
}

/// HTTP server runtime configuration.
///
/// Construct with [`ServerConfig::from_properties`] or start from
/// [`ServerConfig::default`] and adjust fields; call
/// [`ServerConfig::validate`] before use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    pub https_port: u16,
    pub enable_https: bool,
    pub tls: Option<TlsMaterial>,
    pub min_threads: usize,
    pub max_threads: usize,
    pub work_queue_size: usize,
    pub admission_timeout: Duration,
    pub idle_timeout: Duration,
    pub stop_timeout: Duration,
    pub request_header_size: usize,
    pub response_header_size: usize,
    /// Registered filter names, in chain order
    pub custom_filters: Vec<String>,
    /// Per-filter init parameters, keyed by filter name
    pub filter_params: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            http_port: 9001,
            https_port: 9433,
            enable_https: false,
            tls: None,
            min_threads: 8,
            max_threads: 200,
            work_queue_size: 100,
            admission_timeout: Duration::from_millis(5000),
            idle_timeout: Duration::from_millis(30_000),
            stop_timeout: Duration::from_millis(30_000),
            request_header_size: 128 * 1024,
            response_header_size: 128 * 1024,
            custom_filters: Vec::new(),
            filter_params: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    /// Builds the server view of `props`.
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let enable_https = ENABLE_HTTPS.read(props)?;
        let tls = if enable_https {
            Some(TlsMaterial::from_properties(props)?)
        } else {
            None
        };

        let custom_filters = CUSTOM_FILTERS.read(props)?;
        let filter_params = custom_filters
            .iter()
            .map(|name| {
                let prefix = format!("{FILTER_PARAM_PREFIX}{name}.param.");
                (name.clone(), props.with_prefix(&prefix))
            })
            .collect();

        Ok(Self {
            host: HOST.read(props)?,
            http_port: HTTP_PORT.read(props)?,
            https_port: HTTPS_PORT.read(props)?,
            enable_https,
            tls,
            min_threads: MIN_THREADS.read(props)?,
            max_threads: MAX_THREADS.read(props)?,
            work_queue_size: THREAD_POOL_WORK_QUEUE_SIZE.read(props)?,
            admission_timeout: Duration::from_millis(THREAD_POOL_ADMISSION_TIMEOUT.read(props)?),
            idle_timeout: Duration::from_millis(IDLE_TIMEOUT.read(props)?),
            stop_timeout: Duration::from_millis(STOP_TIMEOUT.read(props)?),
            request_header_size: REQUEST_HEADER_SIZE.read(props)?,
            response_header_size: RESPONSE_HEADER_SIZE.read(props)?,
            custom_filters,
            filter_params,
        })
    }

    /// Validates invariants between fields.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint, naming its configuration key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid_value(HOST.key, NOT_BLANK_ERROR_MSG));
        }
        if self.min_threads == 0 {
            return Err(ConfigError::invalid_value(MIN_THREADS.key, POSITIVE_NUMBER_ERROR_MSG));
        }
        if self.max_threads < self.min_threads {
            return Err(ConfigError::invalid_value(
                MAX_THREADS.key,
                format!(
                    "must be at least min.threads ({}), got {}",
                    self.min_threads, self.max_threads
                ),
            ));
        }

        let positive = [
            (THREAD_POOL_WORK_QUEUE_SIZE.key, self.work_queue_size as u128),
            (THREAD_POOL_ADMISSION_TIMEOUT.key, self.admission_timeout.as_millis()),
            (IDLE_TIMEOUT.key, self.idle_timeout.as_millis()),
            (STOP_TIMEOUT.key, self.stop_timeout.as_millis()),
            (REQUEST_HEADER_SIZE.key, self.request_header_size as u128),
            (RESPONSE_HEADER_SIZE.key, self.response_header_size as u128),
        ];
        if let Some((key, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::invalid_value(*key, POSITIVE_NUMBER_ERROR_MSG));
        }

        if self.enable_https {
            match &self.tls {
                Some(tls) => tls.validate()?,
                None => {
                    return Err(ConfigError::invalid_value(
                        KEYSTORE_PATH.key,
                        format!("{NOT_BLANK_ERROR_MSG} when enable.https is true"),
                    ))
                }
            }
        }

        Ok(())
    }

    /// Port the connector binds: the HTTPS port when TLS is enabled.
    pub fn port(&self) -> u16 {
        if self.enable_https {
            self.https_port
        } else {
            self.http_port
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }

    /// TLS material when HTTPS is enabled.
    pub fn tls_material(&self) -> Option<&TlsMaterial> {
        if self.enable_https {
            self.tls.as_ref()
        } else {
            None
        }
    }
}

// ============================================================================
// Metrics configuration
// ============================================================================

/// Backend persisting drained metric events.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MetricsStoreKind {
    /// Events are drained and discarded
    #[default]
    None,
    /// Bounded in-memory ring buffer
    Memory { capacity: usize },
    /// JSON lines file
    File { path: PathBuf },
}

impl fmt::Display for MetricsStoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricsStoreKind::None => write!(f, "none"),
            MetricsStoreKind::Memory { .. } => write!(f, "memory"),
            MetricsStoreKind::File { .. } => write!(f, "file"),
        }
    }
}

/// Asynchronous metrics pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    pub store: MetricsStoreKind,
    pub queue_capacity: usize,
    /// Zero or negative keeps records forever
    pub retain_days: i32,
    pub eviction_interval: Duration,
    /// Longest time the consumer waits before writing a partial batch
    pub flush_interval: Duration,
    /// Bound on the final flush performed by `close`
    pub close_timeout: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            store: MetricsStoreKind::None,
            queue_capacity: 1000,
            retain_days: -1,
            eviction_interval: Duration::from_secs(3600),
            flush_interval: Duration::from_millis(100),
            close_timeout: Duration::from_secs(3),
        }
    }
}

impl MetricsConfig {
    pub fn from_properties(props: &Properties) -> Result<Self, ConfigError> {
        let store = match ICEBERG_METRICS_STORE.read_optional(props)? {
            None => MetricsStoreKind::None,
            Some(kind) => match kind.to_ascii_lowercase().as_str() {
                "" | "none" => MetricsStoreKind::None,
                "memory" => MetricsStoreKind::Memory {
                    capacity: ICEBERG_METRICS_STORE_CAPACITY.read(props)?,
                },
                "file" => {
                    let path = ICEBERG_METRICS_STORE_PATH
                        .read_optional(props)?
                        .filter(|path| !path.is_empty())
                        .ok_or_else(|| {
                            ConfigError::invalid_value(
                                ICEBERG_METRICS_STORE_PATH.key,
                                format!("{NOT_BLANK_ERROR_MSG} when iceberg.metrics.store is file"),
                            )
                        })?;
                    MetricsStoreKind::File {
                        path: PathBuf::from(path),
                    }
                }
                _ => return Err(ConfigError::unsupported("metrics store", kind)),
            },
        };

        Ok(Self {
            store,
            queue_capacity: ICEBERG_METRICS_QUEUE_CAPACITY.read(props)?,
            retain_days: ICEBERG_METRICS_STORE_RETAIN_DAYS.read(props)?,
            eviction_interval: Duration::from_millis(
                ICEBERG_METRICS_EVICTION_INTERVAL.read(props)?,
            ),
            ..Self::default()
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid_value(
                ICEBERG_METRICS_QUEUE_CAPACITY.key,
                POSITIVE_NUMBER_ERROR_MSG,
            ));
        }
        if let MetricsStoreKind::Memory { capacity: 0 } = self.store {
            return Err(ConfigError::invalid_value(
                ICEBERG_METRICS_STORE_CAPACITY.key,
                POSITIVE_NUMBER_ERROR_MSG,
            ));
        }
        if self.eviction_interval.is_zero() {
            return Err(ConfigError::invalid_value(
                ICEBERG_METRICS_EVICTION_INTERVAL.key,
                POSITIVE_NUMBER_ERROR_MSG,
            ));
        }
        Ok(())
    }

    /// Retention window, or `None` when records are kept forever.
    pub fn retention(&self) -> Option<Duration> {
        (self.retain_days > 0).then(|| {
            let days = u64::from(self.retain_days.unsigned_abs());
            Duration::from_secs(days * 86_400)
        })
    }
}

// ============================================================================
// Process configuration
// ============================================================================

/// Complete configuration of an Iceberg REST server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcebergServerConfig {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    /// Grace period for signal-triggered shutdown
    pub shutdown_timeout: Duration,
    pub catalog_backend: String,
    /// Raw properties, for components that read their own keys
    pub properties: Properties,
}

impl Default for IcebergServerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            metrics: MetricsConfig::default(),
            shutdown_timeout: Duration::from_millis(3000),
            catalog_backend: "memory".to_owned(),
            properties: Properties::default(),
        }
    }
}

impl IcebergServerConfig {
    /// Loads a configuration file and applies environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut props = Properties::from_file(path)?;
        props.apply_env_overrides(KNOWN_KEYS);
        Self::from_properties(props)
    }

    pub fn from_properties(props: Properties) -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::from_properties(&props)?,
            metrics: MetricsConfig::from_properties(&props)?,
            shutdown_timeout: Duration::from_millis(SERVER_SHUTDOWN_TIMEOUT.read(&props)?),
            catalog_backend: CATALOG_BACKEND.read(&props)?,
            properties: props,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.metrics.validate()?;
        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                SERVER_SHUTDOWN_TIMEOUT.key,
                POSITIVE_NUMBER_ERROR_MSG,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tls_props() -> Properties {
        Properties::new()
            .with("enable.https", "true")
            .with("keystore.path", "/etc/aurora/server.pem")
            .with("keystore.password", "changeit")
            .with("keystore.manager.password", "changeit")
    }

    #[test]
    fn test_defaults() {
        let config = IcebergServerConfig::from_properties(Properties::new()).unwrap();
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.metrics, MetricsConfig::default());
        assert_eq!(config.shutdown_timeout, Duration::from_millis(3000));
        assert_eq!(config.catalog_backend, "memory");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_flat_and_nested() {
        let yaml = r#"
host: 127.0.0.1
http.port: 8080
iceberg.metrics.store: memory
iceberg.metrics.store.retain.days: 7
thread:
  pool:
    work.queue.size: 16
custom.filters: [request-id, response-headers]
filters.response-headers.param.X-Served-By: aurora
"#;
        let props = Properties::from_yaml(yaml).unwrap();
        assert_eq!(props.get("thread.pool.work.queue.size"), Some("16"));
        assert_eq!(props.get("custom.filters"), Some("request-id,response-headers"));

        let config = IcebergServerConfig::from_properties(props).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.http_port, 8080);
        assert_eq!(config.server.work_queue_size, 16);
        assert_eq!(config.metrics.retain_days, 7);
        assert_eq!(
            config.metrics.store,
            MetricsStoreKind::Memory { capacity: 10000 }
        );
        assert_eq!(
            config.server.custom_filters,
            vec!["request-id".to_owned(), "response-headers".to_owned()]
        );
        assert_eq!(
            config.server.filter_params["response-headers"].get("X-Served-By"),
            Some(&"aurora".to_owned())
        );
        assert!(config.server.filter_params["request-id"].is_empty());
    }

    #[test]
    fn test_from_yaml_rejects_non_mapping() {
        assert!(Properties::from_yaml("- a\n- b\n").is_err());
        assert!(Properties::from_yaml("").unwrap().is_empty());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "http.port: 9100").unwrap();
        let props = Properties::from_file(file.path()).unwrap();
        assert_eq!(props.get("http.port"), Some("9100"));

        let missing = Properties::from_file("/nonexistent/aurora.yaml");
        assert!(matches!(missing, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_env_overrides() {
        assert_eq!(env_var_name("http.port"), "AURORA_HTTP_PORT");
        assert_eq!(env_var_name("catalog-backend"), "AURORA_CATALOG_BACKEND");

        let mut props = Properties::new().with("http.port", "9001");
        let applied = props.apply_overrides_from(KNOWN_KEYS, |name| {
            (name == "AURORA_HTTP_PORT").then(|| "9555".to_owned())
        });
        assert_eq!(applied, 1);
        assert_eq!(props.get("http.port"), Some("9555"));
    }

    #[test]
    fn test_invalid_number_names_key() {
        let props = Properties::new().with("min.threads", "many");
        let err = ServerConfig::from_properties(&props).unwrap_err();
        assert_eq!(err.field(), Some("min.threads"));

        let props = Properties::new().with("idle.timeout", "");
        let err = ServerConfig::from_properties(&props).unwrap_err();
        assert_eq!(err.field(), Some("idle.timeout"));
    }

    #[test]
    fn test_check_rejects_zero() {
        let props = Properties::new().with("thread.pool.work.queue.size", "0");
        let err = ServerConfig::from_properties(&props).unwrap_err();
        assert_eq!(err.field(), Some("thread.pool.work.queue.size"));

        let props = Properties::new().with("server.shutdown.timeout", "0");
        assert!(IcebergServerConfig::from_properties(props).is_err());
    }

    #[test]
    fn test_validate_thread_bounds() {
        let config = ServerConfig {
            min_threads: 10,
            max_threads: 4,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().field(), Some("max.threads"));

        let config = ServerConfig {
            min_threads: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().field(), Some("min.threads"));
    }

    #[test]
    fn test_tls_blank_keystore_path_rejected() {
        let props = tls_props().with("keystore.path", "  ");
        let config = ServerConfig::from_properties(&props).unwrap();
        let err = config.validate().unwrap_err();
        assert_eq!(err.field(), Some("keystore.path"));
    }

    #[test]
    fn test_tls_missing_manager_password_rejected() {
        let mut props = tls_props();
        props.remove("keystore.manager.password");
        let config = ServerConfig::from_properties(&props).unwrap();
        assert_eq!(
            config.validate().unwrap_err().field(),
            Some("keystore.manager.password")
        );
    }

    #[test]
    fn test_client_auth_requires_truststore() {
        let props = tls_props().with("enable.client.auth", "true");
        let config = ServerConfig::from_properties(&props).unwrap();
        assert_eq!(config.validate().unwrap_err().field(), Some("truststore.path"));

        let props = props
            .with("truststore.path", "/etc/aurora/ca.pem")
            .with("truststore.password", "changeit");
        let config = ServerConfig::from_properties(&props).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.port(), 9433);
    }

    #[test]
    fn test_tls_protocol_validated() {
        let props = tls_props().with("tls.protocol", "SSLv3");
        let config = ServerConfig::from_properties(&props).unwrap();
        assert_eq!(config.validate().unwrap_err().field(), Some("tls.protocol"));
    }

    #[test]
    fn test_keystore_type_parsing() {
        assert_eq!("pkcs12".parse::<KeyStoreType>(), Ok(KeyStoreType::Pkcs12));
        assert_eq!("PEM".parse::<KeyStoreType>(), Ok(KeyStoreType::Pem));
        assert!("JKS".parse::<KeyStoreType>().is_err());
    }

    #[test]
    fn test_tls_debug_redacts_passwords() {
        let config = ServerConfig::from_properties(&tls_props()).unwrap();
        let rendered = format!("{:?}", config.tls);
        assert!(!rendered.contains("changeit"));
    }

    #[test]
    fn test_metrics_store_kinds() {
        let props = Properties::new()
            .with("iceberg.metrics.store", "file")
            .with("iceberg.metrics.store.path", "/var/lib/aurora/metrics.jsonl");
        let config = MetricsConfig::from_properties(&props).unwrap();
        assert_eq!(
            config.store,
            MetricsStoreKind::File {
                path: PathBuf::from("/var/lib/aurora/metrics.jsonl")
            }
        );

        let props = Properties::new().with("iceberg.metrics.store", "file");
        let err = MetricsConfig::from_properties(&props).unwrap_err();
        assert_eq!(err.field(), Some("iceberg.metrics.store.path"));

        let props = Properties::new().with("iceberg.metrics.store", "jdbc");
        assert!(matches!(
            MetricsConfig::from_properties(&props),
            Err(ConfigError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_retention_window() {
        let mut config = MetricsConfig::default();
        assert_eq!(config.retention(), None);
        config.retain_days = 0;
        assert_eq!(config.retention(), None);
        config.retain_days = 7;
        assert_eq!(config.retention(), Some(Duration::from_secs(7 * 86_400)));
    }

    #[test]
    fn test_with_prefix() {
        let props = Properties::new()
            .with("filters.a.param.x", "1")
            .with("filters.a.param.y", "2")
            .with("filters.b.param.x", "3");
        let params = props.with_prefix("filters.a.param.");
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("y"), Some(&"2".to_owned()));
    }
}
