use chrono_tz::Tz;
use reqwest::Url;
use serde_json::Value;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::background::backoff::BackoffPolicy;
use crate::error::ConfigError;
use crate::ingest::identity::IdentityProjection;
use crate::ingest::normalizer::RequiredAttributes;
use crate::utils::time::parse_zone;

/// Upper bound for every `*_SECONDS` setting (one year).
const MAX_SECONDS: u64 = 365 * 86_400;

const DEFAULT_ENDPOINT: &str = "https://etraffic.dgt.es/etrafficWEB/api/cache/getFilteredData";
const DEFAULT_PAYLOAD: &str = r#"{"filtrosVia":["Carreteras cortadas","Tráfico lento","Circulación restringida","Desvíos y embolsamientos","Otras vialidades"],"filtrosCausa":["Obras","Accidente","Meteorológicos","Restricciones de circulación","Otras incidencias","Otras afecciones"]}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub endpoint: Url,
    pub method: UpstreamMethod,
    /// Request body for `POST`.
    pub payload: Option<Value>,
    pub allowed_hosts: Vec<String>,
    pub xor_key: String,
    pub timezone: Tz,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub initial_delay: Duration,
    pub backoff: BackoffPolicy,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub stale_after: Duration,
    pub gc_after: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub required: RequiredAttributes,
    pub identity: IdentityProjection,
    pub retain_raw: bool,
    pub timezone: Tz,
}

#[derive(Debug, Clone)]
pub struct ElasticConfig {
    pub url: Url,
    pub index: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub bootstrap_limit: usize,
    /// Extra attempts after a transport error or a 502/503/504.
    pub max_retries: u32,
    pub verify_certs: bool,
    /// PEM bundle trusted in addition to the system roots.
    pub ca_certs: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
    pub api_key: Option<String>,
    pub api_key_header: String,
    /// Per-client requests per window on `/v16` and `/v16/:id`.
    pub rate_limit_max_requests: u32,
    /// Per-client requests per window on `/health`.
    pub health_rate_limit_max_requests: u32,
    pub rate_limit_window: Duration,
    pub trust_x_forwarded_for: bool,
    /// Serve the stored upstream record in API responses.
    pub include_raw: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub poller: PollerConfig,
    pub store: StoreConfig,
    pub normalizer: NormalizerConfig,
    /// `None` disables the durable mirror.
    pub elasticsearch: Option<ElasticConfig>,
    pub api: ApiConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration from any key lookup; `from_env` is this over the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let endpoint_raw = vars.string("UPSTREAM_ENDPOINT", DEFAULT_ENDPOINT);
        let allowed_hosts = vars.list("UPSTREAM_ALLOWED_HOSTS", &["etraffic.dgt.es"]);
        let endpoint = parse_http_url("UPSTREAM_ENDPOINT", &endpoint_raw)?;
        check_host_allowed(&endpoint, &allowed_hosts)?;

        let method = match vars.string("UPSTREAM_METHOD", "POST").to_ascii_uppercase().as_str() {
            "GET" => UpstreamMethod::Get,
            "POST" => UpstreamMethod::Post,
            other => return Err(ConfigError::invalid("UPSTREAM_METHOD", other, "expected GET or POST")),
        };
        let payload = match method {
            UpstreamMethod::Get => None,
            UpstreamMethod::Post => {
                let raw = vars.string("UPSTREAM_PAYLOAD", DEFAULT_PAYLOAD);
                let value = serde_json::from_str::<Value>(&raw)
                    .map_err(|e| ConfigError::invalid("UPSTREAM_PAYLOAD", raw.clone(), e.to_string()))?;
                Some(value)
            }
        };

        let xor_key = vars.string("UPSTREAM_XOR_KEY", "K");
        if xor_key.is_empty() {
            return Err(ConfigError::invalid("UPSTREAM_XOR_KEY", "", "must not be empty"));
        }
        let tz_name = vars.string("UPSTREAM_TIMEZONE", "Europe/Madrid");
        let timezone = parse_zone(&tz_name).map_err(|e| ConfigError::invalid("UPSTREAM_TIMEZONE", tz_name.clone(), e))?;
        let request_timeout = vars.seconds("REQUEST_TIMEOUT_SECONDS", 10)?;
        non_zero("REQUEST_TIMEOUT_SECONDS", request_timeout)?;

        let backoff = BackoffPolicy {
            base: vars.seconds("POLLING_BACKOFF_BASE_SECONDS", 5)?,
            max: vars.seconds("POLLING_BACKOFF_MAX_SECONDS", 60)?,
            jitter_fraction: vars.parse("POLLING_JITTER_FRACTION", 0.2f64)?,
        };
        non_zero("POLLING_BACKOFF_BASE_SECONDS", backoff.base)?;
        if backoff.base > backoff.max {
            return Err(ConfigError::invalid(
                "POLLING_BACKOFF_MAX_SECONDS",
                backoff.max.as_secs().to_string(),
                "must be at least POLLING_BACKOFF_BASE_SECONDS",
            ));
        }
        if !(0.0..=1.0).contains(&backoff.jitter_fraction) {
            return Err(ConfigError::invalid(
                "POLLING_JITTER_FRACTION",
                backoff.jitter_fraction.to_string(),
                "must be within [0, 1]",
            ));
        }
        let poller = PollerConfig {
            enabled: vars.flag("POLLING_ENABLED", true),
            poll_interval: vars.seconds("POLL_INTERVAL_SECONDS", 45)?,
            initial_delay: vars.seconds("POLLING_INITIAL_DELAY_SECONDS", 1)?,
            backoff,
            request_timeout,
        };
        non_zero("POLL_INTERVAL_SECONDS", poller.poll_interval)?;

        let store = StoreConfig {
            stale_after: vars.seconds("STALE_AFTER_SECONDS", 180)?,
            gc_after: vars.seconds("LOST_GC_SECONDS", 86_400)?,
            sweep_interval: vars.seconds("SWEEP_INTERVAL_SECONDS", 15)?,
        };
        non_zero("STALE_AFTER_SECONDS", store.stale_after)?;
        non_zero("SWEEP_INTERVAL_SECONDS", store.sweep_interval)?;

        let identity_raw = vars.string(
            "IDENTITY_FIELDS",
            "upstream_id,latitude,longitude,road,kilometre,cause,kind",
        );
        let identity = identity_raw
            .parse::<IdentityProjection>()
            .map_err(|e| ConfigError::invalid("IDENTITY_FIELDS", identity_raw.clone(), e))?;
        let normalizer = NormalizerConfig {
            required: RequiredAttributes::default(),
            identity,
            retain_raw: vars.flag("RETAIN_RAW_PAYLOAD", true),
            timezone,
        };

        let upstream = UpstreamConfig {
            endpoint,
            method,
            payload,
            allowed_hosts,
            xor_key,
            timezone,
            request_timeout,
        };

        let elasticsearch = Self::elastic_from(&vars)?;

        let api_key = vars.optional("API_KEY");
        if vars.flag("API_KEY_REQUIRED", true) && api_key.is_none() {
            return Err(ConfigError::Missing { key: "API_KEY" });
        }
        let api = ApiConfig {
            port: vars.parse("PORT", 8000u16)?,
            api_key,
            api_key_header: vars.string("API_KEY_HEADER", "X-API-Key"),
            rate_limit_max_requests: vars.parse("RATE_LIMIT_MAX_REQUESTS", 30u32)?,
            health_rate_limit_max_requests: vars.parse("RATE_LIMIT_HEALTH_MAX_REQUESTS", 10u32)?,
            rate_limit_window: vars.seconds("RATE_LIMIT_WINDOW_SECONDS", 60)?,
            trust_x_forwarded_for: vars.flag("TRUST_X_FORWARDED_FOR", false),
            include_raw: vars.flag("API_INCLUDE_RAW", false),
        };

        Ok(Self {
            upstream,
            poller,
            store,
            normalizer,
            elasticsearch,
            api,
        })
    }

    fn elastic_from<F>(vars: &Vars<F>) -> Result<Option<ElasticConfig>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(raw_url) = vars.optional("ELASTICSEARCH_URL") else {
            return Ok(None);
        };
        let url = parse_http_url("ELASTICSEARCH_URL", &raw_url)?;
        if url.scheme() != "https" && !vars.flag("ELASTICSEARCH_ALLOW_INSECURE", false) {
            return Err(ConfigError::invalid(
                "ELASTICSEARCH_URL",
                raw_url,
                "plain http requires ELASTICSEARCH_ALLOW_INSECURE=true",
            ));
        }
        let request_timeout = vars.seconds("ELASTICSEARCH_REQUEST_TIMEOUT", 10)?;
        non_zero("ELASTICSEARCH_REQUEST_TIMEOUT", request_timeout)?;
        Ok(Some(ElasticConfig {
            url,
            index: vars.string("ELASTICSEARCH_INDEX", "v16-events"),
            username: vars.optional("ELASTICSEARCH_USERNAME"),
            password: vars.optional("ELASTICSEARCH_PASSWORD"),
            api_key: vars.optional("ELASTICSEARCH_API_KEY"),
            request_timeout,
            bootstrap_limit: vars.parse("ELASTICSEARCH_BOOTSTRAP_LIMIT", 5000usize)?,
            max_retries: vars.parse("ELASTICSEARCH_MAX_RETRIES", 3u32)?,
            verify_certs: vars.flag("ELASTICSEARCH_VERIFY_CERTS", true),
            ca_certs: vars.optional("ELASTICSEARCH_CA_CERTS").map(PathBuf::from),
        }))
    }
}

/// Reject endpoints whose host is not allow-listed. Checked at load time and again
/// before each request.
pub fn check_host_allowed(endpoint: &Url, allowed_hosts: &[String]) -> Result<(), ConfigError> {
    let host = endpoint.host_str().unwrap_or_default().to_ascii_lowercase();
    if allowed_hosts.iter().any(|allowed| allowed.eq_ignore_ascii_case(&host)) {
        Ok(())
    } else {
        Err(ConfigError::HostNotAllowed(host))
    }
}

fn parse_http_url(key: &'static str, raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|e| ConfigError::invalid(key, raw, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}

fn non_zero(key: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::invalid(key, "0", "must be greater than zero"));
    }
    Ok(())
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.optional(key) {
            Some(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"),
            None => default,
        }
    }

    fn list(&self, key: &str, default: &[&str]) -> Vec<String> {
        let items: Vec<String> = self
            .optional(key)
            .map(|v| {
                v.split(',')
                    .map(|item| item.trim().to_ascii_lowercase())
                    .filter(|item| !item.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if items.is_empty() {
            default.iter().map(|item| item.to_string()).collect()
        } else {
            items
        }
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            Some(v) => v.parse().map_err(|e: T::Err| ConfigError::invalid(key, v.clone(), e.to_string())),
            None => Ok(default),
        }
    }

    fn seconds(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        let secs = self.parse(key, default)?;
        if secs > MAX_SECONDS {
            return Err(ConfigError::invalid(
                key,
                secs.to_string(),
                format!("must be at most {} seconds", MAX_SECONDS),
            ));
        }
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let mut vars: HashMap<String, String> = HashMap::from([("API_KEY".to_string(), "secret".to_string())]);
        for (k, v) in pairs {
            vars.insert(k.to_string(), v.to_string());
        }
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_are_sane() {
        let config = config_with(&[]).unwrap();
        assert_eq!(config.upstream.method, UpstreamMethod::Post);
        assert!(config.upstream.payload.is_some());
        assert_eq!(config.poller.poll_interval, Duration::from_secs(45));
        assert_eq!(config.poller.backoff.base, Duration::from_secs(5));
        assert_eq!(config.store.stale_after, Duration::from_secs(180));
        assert_eq!(config.store.gc_after, Duration::from_secs(86_400));
        assert!(config.elasticsearch.is_none());
        assert!(config.normalizer.retain_raw);
        assert!(!config.api.include_raw);
        assert_eq!(config.api.rate_limit_max_requests, 30);
        assert_eq!(config.api.health_rate_limit_max_requests, 10);
        assert_eq!(config.api.port, 8000);
    }

    #[test]
    fn host_outside_allow_list_is_rejected() {
        let err = config_with(&[("UPSTREAM_ENDPOINT", "https://evil.example.com/feed")]).unwrap_err();
        assert!(matches!(err, ConfigError::HostNotAllowed(host) if host == "evil.example.com"));

        let ok = config_with(&[
            ("UPSTREAM_ENDPOINT", "https://Mirror.Example.com/feed"),
            ("UPSTREAM_ALLOWED_HOSTS", "etraffic.dgt.es, mirror.example.com"),
        ]);
        assert!(ok.is_ok());
    }

    #[test]
    fn non_http_scheme_is_rejected() {
        let err = config_with(&[("UPSTREAM_ENDPOINT", "ftp://etraffic.dgt.es/feed")]).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedScheme(_)));
    }

    #[test]
    fn api_key_is_required_unless_disabled() {
        let err = Config::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key: "API_KEY" }));

        let config = Config::from_lookup(|key| (key == "API_KEY_REQUIRED").then(|| "false".to_string())).unwrap();
        assert!(config.api.api_key.is_none());
    }

    #[test]
    fn backoff_bounds_are_validated() {
        assert!(config_with(&[("POLLING_BACKOFF_BASE_SECONDS", "90")]).is_err());
        assert!(config_with(&[("POLLING_JITTER_FRACTION", "1.5")]).is_err());
        assert!(config_with(&[("POLLING_BACKOFF_BASE_SECONDS", "abc")]).is_err());
        assert!(config_with(&[("STALE_AFTER_SECONDS", "0")]).is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let err = config_with(&[
            ("POLLING_BACKOFF_BASE_SECONDS", "9223372036854775807"),
            ("POLLING_BACKOFF_MAX_SECONDS", "18446744073709551615"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "POLLING_BACKOFF_BASE_SECONDS", .. }));
        assert!(config_with(&[("RATE_LIMIT_WINDOW_SECONDS", "18446744073709551615")]).is_err());
        assert!(config_with(&[("LOST_GC_SECONDS", "31536000")]).is_ok());
    }

    #[test]
    fn post_payload_must_be_json_but_get_ignores_it() {
        assert!(config_with(&[("UPSTREAM_PAYLOAD", "{not json")]).is_err());
        let config = config_with(&[("UPSTREAM_METHOD", "get"), ("UPSTREAM_PAYLOAD", "{not json")]).unwrap();
        assert_eq!(config.upstream.method, UpstreamMethod::Get);
        assert!(config.upstream.payload.is_none());
    }

    #[test]
    fn elasticsearch_requires_https_unless_allowed() {
        assert!(config_with(&[("ELASTICSEARCH_URL", "http://localhost:9200")]).is_err());
        let config = config_with(&[
            ("ELASTICSEARCH_URL", "http://localhost:9200"),
            ("ELASTICSEARCH_ALLOW_INSECURE", "yes"),
        ])
        .unwrap();
        let elastic = config.elasticsearch.unwrap();
        assert_eq!(elastic.index, "v16-events");
        assert_eq!(elastic.bootstrap_limit, 5000);
        assert_eq!(elastic.max_retries, 3);
        assert!(elastic.verify_certs);
        assert!(elastic.ca_certs.is_none());
    }

    #[test]
    fn elasticsearch_tls_options() {
        let config = config_with(&[
            ("ELASTICSEARCH_URL", "https://es.internal:9200"),
            ("ELASTICSEARCH_VERIFY_CERTS", "false"),
            ("ELASTICSEARCH_CA_CERTS", "/etc/ssl/es-ca.pem"),
            ("ELASTICSEARCH_MAX_RETRIES", "0"),
        ])
        .unwrap();
        let elastic = config.elasticsearch.unwrap();
        assert!(!elastic.verify_certs);
        assert_eq!(elastic.ca_certs, Some(PathBuf::from("/etc/ssl/es-ca.pem")));
        assert_eq!(elastic.max_retries, 0);
    }

    #[test]
    fn identity_fields_are_parsed() {
        let config = config_with(&[("IDENTITY_FIELDS", "lat,lon,cause")]).unwrap();
        assert_eq!(config.normalizer.identity.fields().len(), 3);
        assert!(config_with(&[("IDENTITY_FIELDS", "lat,shoe_size")]).is_err());
    }
}
