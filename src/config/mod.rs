//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::varnish::prepare_proxy_urls;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "spurgo";
const ENV_PREFIX: &str = "SPURGO";
const DEFAULT_MAX_HEADER_LENGTH: u64 = 7500;
const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 3;
const DEFAULT_TAG_LENGTH: u64 = 8;
const MAX_TAG_LENGTH: u64 = 64;
const DEFAULT_STORE_ENTRY_LIMIT: u64 = 1024;
const DEFAULT_STORE_DIR: &str = "var/spurgo";

/// Command-line arguments for the Spurgo binary.
#[derive(Debug, Parser)]
#[command(
    name = "spurgo",
    version,
    about = "Tag-based cache invalidation for a Varnish-fronted content site"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SPURGO_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Ban cached responses on every configured proxy endpoint.
    Clear(ClearArgs),
    /// Request a URL with cache debugging enabled and print the proxy's verdict.
    Check(CheckArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ClearArgs {
    #[command(flatten)]
    pub overrides: ProxyOverrides,

    /// Restrict the ban to an exact hostname; may be given multiple times.
    #[arg(long = "domain", value_name = "HOST")]
    pub domains: Vec<String>,

    /// Restrict a full ban to responses of this content type.
    #[arg(long = "content-type", value_name = "MIME")]
    pub content_type: Option<String>,

    /// Ban entries carrying this cache tag instead of banning everything;
    /// may be given multiple times.
    #[arg(long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,
}

#[derive(Debug, Args, Clone)]
pub struct CheckArgs {
    #[command(flatten)]
    pub overrides: ProxyOverrides,

    /// URL to request with cache debugging enabled.
    #[arg(value_name = "URL")]
    pub url: String,

    /// Probe this port instead of the one implied by the URL, for example to
    /// bypass a load balancer in front of the proxy.
    #[arg(long = "port", value_name = "PORT")]
    pub port: Option<u16>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ProxyOverrides {
    /// Override the proxy endpoint list (single URL or comma-separated).
    #[arg(long = "proxy-url", value_name = "URL")]
    pub proxy_url: Option<String>,

    /// Override the per-request proxy timeout.
    #[arg(long = "proxy-timeout-seconds", value_name = "SECONDS")]
    pub proxy_timeout_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub engine: EngineSettings,
    pub proxy: ProxySettings,
    pub cache_headers: CacheHeaderSettings,
    pub store: StoreSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Master switch for annotation and invalidation alike.
    pub enabled: bool,
    pub context: RuntimeContext,
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Normalized proxy endpoint base URLs.
    pub endpoints: Vec<String>,
    /// Upper bound for a single ban header value.
    pub max_header_length: NonZeroUsize,
    /// Tags that never trigger a ban.
    pub ignored_tags: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheHeaderSettings {
    /// Suppresses response annotation without touching invalidation.
    pub disabled: bool,
    /// Fallback shared lifetime in seconds for content without its own.
    pub default_shared_max_age: Option<u64>,
    pub shorten_tags: bool,
    pub tag_length: NonZeroUsize,
    /// Adds a debugging marker header to annotated responses.
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub entry_limit: NonZeroUsize,
    pub directory: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeContext {
    Development,
    Production,
}

impl RuntimeContext {
    pub fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match &cli.command {
        Command::Clear(args) => raw.apply_proxy_overrides(&args.overrides),
        Command::Check(args) => raw.apply_proxy_overrides(&args.overrides),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    engine: RawEngineSettings,
    proxy: RawProxySettings,
    cache_headers: RawCacheHeaderSettings,
    store: RawStoreSettings,
    logging: RawLoggingSettings,
}

impl RawSettings {
    fn apply_proxy_overrides(&mut self, overrides: &ProxyOverrides) {
        if let Some(url) = overrides.proxy_url.as_ref() {
            self.proxy.url = Some(ProxyUrls::One(url.clone()));
        }
        if let Some(seconds) = overrides.proxy_timeout_seconds {
            self.proxy.timeout_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            engine,
            proxy,
            cache_headers,
            store,
            logging,
        } = raw;

        let engine = build_engine_settings(engine)?;
        let proxy = build_proxy_settings(proxy)?;
        let cache_headers = build_cache_header_settings(cache_headers)?;
        let store = build_store_settings(store)?;
        let logging = build_logging_settings(logging)?;

        Ok(Self {
            engine,
            proxy,
            cache_headers,
            store,
            logging,
        })
    }
}

fn build_engine_settings(engine: RawEngineSettings) -> Result<EngineSettings, LoadError> {
    let context = match engine.context.as_deref() {
        None => RuntimeContext::Production,
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "development" => RuntimeContext::Development,
            "production" => RuntimeContext::Production,
            other => {
                return Err(LoadError::invalid(
                    "engine.context",
                    format!("unknown context `{other}`, expected `development` or `production`"),
                ));
            }
        },
    };

    Ok(EngineSettings {
        enabled: engine.enabled.unwrap_or(true),
        context,
    })
}

fn build_proxy_settings(proxy: RawProxySettings) -> Result<ProxySettings, LoadError> {
    let configured = proxy.url.map(ProxyUrls::into_vec).unwrap_or_default();
    let endpoints = prepare_proxy_urls(&configured);
    for endpoint in &endpoints {
        url::Url::parse(endpoint).map_err(|err| {
            LoadError::invalid("proxy.url", format!("`{endpoint}` is not a valid URL: {err}"))
        })?;
    }

    let max_header_length = non_zero_usize(
        proxy.max_header_length.unwrap_or(DEFAULT_MAX_HEADER_LENGTH),
        "proxy.max_header_length",
    )?;

    let timeout_seconds = proxy.timeout_seconds.unwrap_or(DEFAULT_PROXY_TIMEOUT_SECS);
    if timeout_seconds == 0 {
        return Err(LoadError::invalid(
            "proxy.timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ProxySettings {
        endpoints,
        max_header_length,
        ignored_tags: proxy.ignored_tags.unwrap_or_default(),
        timeout: Duration::from_secs(timeout_seconds),
    })
}

fn build_cache_header_settings(
    cache_headers: RawCacheHeaderSettings,
) -> Result<CacheHeaderSettings, LoadError> {
    let tag_length_value = cache_headers.tag_length.unwrap_or(DEFAULT_TAG_LENGTH);
    // Shortened tags are hex digest prefixes, so 64 characters is the ceiling.
    if tag_length_value > MAX_TAG_LENGTH {
        return Err(LoadError::invalid(
            "cache_headers.tag_length",
            "must not exceed 64",
        ));
    }
    let tag_length = non_zero_usize(tag_length_value, "cache_headers.tag_length")?;

    Ok(CacheHeaderSettings {
        disabled: cache_headers.disabled.unwrap_or(false),
        default_shared_max_age: cache_headers.default_shared_max_age,
        shorten_tags: cache_headers.shorten_tags.unwrap_or(false),
        tag_length,
        debug: cache_headers.debug.unwrap_or(false),
    })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let entry_limit = non_zero_usize(
        store.entry_limit.unwrap_or(DEFAULT_STORE_ENTRY_LIMIT),
        "store.entry_limit",
    )?;

    let directory = store
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid("store.directory", "path must not be empty"));
    }

    Ok(StoreSettings {
        entry_limit,
        directory,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEngineSettings {
    enabled: Option<bool>,
    context: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawProxySettings {
    url: Option<ProxyUrls>,
    max_header_length: Option<u64>,
    ignored_tags: Option<Vec<String>>,
    timeout_seconds: Option<u64>,
}

/// Endpoint lists may be written as a single string, possibly
/// comma-separated, or as a proper list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ProxyUrls {
    One(String),
    Many(Vec<String>),
}

impl ProxyUrls {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheHeaderSettings {
    disabled: Option<bool>,
    default_shared_max_age: Option<u64>,
    shorten_tags: Option<bool>,
    tag_length: Option<u64>,
    debug: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    entry_limit: Option<u64>,
    directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_usize: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value_usize).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
