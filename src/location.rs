//! Country and timezone from IP geolocation.
//!
//! Providers are queried in order with a short timeout each; the walk stops at
//! the first one that returns a JSON object. Each field of that response is
//! validated on its own and dropped when invalid, so either may resolve
//! without the other. Nothing here is ever an error for the caller: an
//! unresolved field just means the global default is used.

use std::time::Duration;

use serde_json::Value;

use crate::config::is_country_code;
use crate::host::HostPaths;

pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);

/// A geolocation endpoint and the JSON fields it uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeoProvider {
    pub name: &'static str,
    pub url: &'static str,
    pub country_field: &'static str,
    pub timezone_field: &'static str,
}

/// Queried in this order.
pub const PROVIDERS: &[GeoProvider] = &[
    GeoProvider {
        name: "ipapi.co",
        url: "https://ipapi.co/json/",
        country_field: "country_code",
        timezone_field: "timezone",
    },
    GeoProvider {
        name: "ipinfo.io",
        url: "https://ipinfo.io/json",
        country_field: "country",
        timezone_field: "timezone",
    },
    GeoProvider {
        name: "ip-api.com",
        url: "http://ip-api.com/json/",
        country_field: "countryCode",
        timezone_field: "timezone",
    },
];

/// Fetches a URL and parses the body as JSON.
pub trait GeoFetcher {
    fn fetch_json(&self, url: &str) -> Result<Value, String>;
}

/// Blocking HTTP client.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("archstrap/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self { client })
    }
}

impl GeoFetcher for HttpFetcher {
    fn fetch_json(&self, url: &str) -> Result<Value, String> {
        let response = self.client.get(url).send().map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        response.json::<Value>().map_err(|e| e.to_string())
    }
}

/// Resolved location; either field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub country: Option<String>,
    pub timezone: Option<String>,
}

impl Location {
    pub fn is_empty(&self) -> bool {
        self.country.is_none() && self.timezone.is_none()
    }
}

pub struct LocationResolver<'a> {
    fetcher: &'a dyn GeoFetcher,
    host: &'a HostPaths,
    providers: &'a [GeoProvider],
}

impl<'a> LocationResolver<'a> {
    pub fn new(fetcher: &'a dyn GeoFetcher, host: &'a HostPaths) -> Self {
        Self {
            fetcher,
            host,
            providers: PROVIDERS,
        }
    }

    pub fn with_providers(mut self, providers: &'a [GeoProvider]) -> Self {
        self.providers = providers;
        self
    }

    pub fn resolve(&self) -> Location {
        for provider in self.providers {
            match self.fetcher.fetch_json(provider.url) {
                Ok(Value::Object(body))
                    if !body.contains_key(provider.country_field)
                        && !body.contains_key(provider.timezone_field) =>
                {
                    // Error replies such as {"error":true,"reason":"RateLimited"}
                    tracing::debug!(
                        provider = provider.name,
                        body = %serde_json::Value::Object(body),
                        "response has no location fields"
                    );
                }
                Ok(Value::Object(body)) => {
                    let location = self.extract(provider, &body);
                    tracing::info!(
                        provider = provider.name,
                        country = location.country.as_deref().unwrap_or("-"),
                        timezone = location.timezone.as_deref().unwrap_or("-"),
                        "location resolved"
                    );
                    return location;
                }
                Ok(_) => tracing::debug!(provider = provider.name, "response is not a JSON object"),
                Err(e) => tracing::debug!(provider = provider.name, error = %e, "lookup failed"),
            }
        }
        tracing::info!("location unresolved, using defaults");
        Location::default()
    }

    fn extract(&self, provider: &GeoProvider, body: &serde_json::Map<String, Value>) -> Location {
        let field = |name: &str| body.get(name).and_then(Value::as_str).map(str::trim);

        let country = field(provider.country_field)
            .filter(|c| is_country_code(c))
            .map(str::to_string);
        let timezone = field(provider.timezone_field)
            .filter(|tz| self.host.timezone_exists(tz))
            .map(str::to_string);

        if country.is_none() {
            tracing::debug!(provider = provider.name, value = ?field(provider.country_field), "country discarded");
        }
        if timezone.is_none() {
            tracing::debug!(provider = provider.name, value = ?field(provider.timezone_field), "timezone discarded");
        }
        Location { country, timezone }
    }
}
