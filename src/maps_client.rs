//! Upstream access to the mapping platform's web services.
//!
//! Tool handlers never talk to HTTP directly: they describe an
//! [`UpstreamRequest`] and hand it to the [`RequestPipeline`], which applies
//! the cache, the per-tool rate limit and the retry policy around a
//! [`MapsProvider`].

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header::RETRY_AFTER, Client};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::{
    cache::{create_key, BoundedCache},
    config::Config,
    errors::{AppError, NETWORK_ERROR, UPSTREAM_API_ERROR},
    rate_limiter::RateLimiter,
    retry::{RetryPolicy, RetryableError},
};

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Geocode,
    PlaceTextSearch,
    PlaceNearbySearch,
    FindPlace,
    PlaceDetails,
    PlaceAutocomplete,
    Directions,
    DistanceMatrix,
    Elevation,
    Timezone,
    Geolocate,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Self::Geocode => "/maps/api/geocode/json",
            Self::PlaceTextSearch => "/maps/api/place/textsearch/json",
            Self::PlaceNearbySearch => "/maps/api/place/nearbysearch/json",
            Self::FindPlace => "/maps/api/place/findplacefromtext/json",
            Self::PlaceDetails => "/maps/api/place/details/json",
            Self::PlaceAutocomplete => "/maps/api/place/autocomplete/json",
            Self::Directions => "/maps/api/directions/json",
            Self::DistanceMatrix => "/maps/api/distancematrix/json",
            Self::Elevation => "/maps/api/elevation/json",
            Self::Timezone => "/maps/api/timezone/json",
            Self::Geolocate => "/geolocation/v1/geolocate",
        }
    }

    pub fn cache_prefix(self) -> &'static str {
        match self {
            Self::Geocode => "geocode",
            Self::PlaceTextSearch => "place_textsearch",
            Self::PlaceNearbySearch => "place_nearby",
            Self::FindPlace => "place_find",
            Self::PlaceDetails => "place_details",
            Self::PlaceAutocomplete => "place_autocomplete",
            Self::Directions => "directions",
            Self::DistanceMatrix => "distance_matrix",
            Self::Elevation => "elevation",
            Self::Timezone => "timezone",
            Self::Geolocate => "geolocate",
        }
    }

    /// Geolocation answers depend on the caller's network, not only on the
    /// request, so it is never memoised.
    pub fn is_cacheable(self) -> bool {
        !matches!(self, Self::Geolocate)
    }

    pub fn uses_post(self) -> bool {
        matches!(self, Self::Geolocate)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub endpoint: Endpoint,
    pub params: Map<String, Value>,
    pub body: Option<Value>,
}

impl UpstreamRequest {
    pub fn get(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            params: Map::new(),
            body: None,
        }
    }

    pub fn post(endpoint: Endpoint, body: Value) -> Self {
        Self {
            endpoint,
            params: Map::new(),
            body: Some(body),
        }
    }

    pub fn param(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn param_opt<V: Into<Value>>(self, name: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.param(name, value),
            None => self,
        }
    }

    /// Cache identity: query parameters plus the POST body, if any.
    fn cache_key(&self) -> String {
        let mut identity = self.params.clone();
        if let Some(body) = &self.body {
            identity.insert("__body".to_string(), body.clone());
        }
        create_key(self.endpoint.cache_prefix(), &identity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkErrorKind {
    Timeout,
    Connect,
    Other,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpstreamFailure {
    #[error("upstream returned HTTP {status}")]
    Http {
        status: u16,
        retry_after: Option<Duration>,
        body: String,
    },
    #[error("network error ({kind}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },
    #[error("upstream status {status}: {message}")]
    Api { status: String, message: String },
    #[error("invalid upstream response: {message}")]
    Decode { message: String },
}

impl RetryableError for UpstreamFailure {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            Self::Network { kind, .. } => {
                matches!(kind, NetworkErrorKind::Timeout | NetworkErrorKind::Connect)
            }
            Self::Api { .. } | Self::Decode { .. } => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<UpstreamFailure> for AppError {
    fn from(failure: UpstreamFailure) -> Self {
        let message = failure.to_string();
        match failure {
            UpstreamFailure::Http {
                status,
                retry_after,
                body,
            } => AppError::domain(
                UPSTREAM_API_ERROR,
                message,
                Some(json!({
                    "httpStatus": status,
                    "retryAfterMs": retry_after.map(|delay| delay.as_millis() as u64),
                    "body": body,
                })),
            ),
            UpstreamFailure::Network { kind, .. } => {
                AppError::domain(NETWORK_ERROR, message, Some(json!({ "kind": kind })))
            }
            UpstreamFailure::Api {
                status,
                message: error_message,
            } => AppError::domain(
                UPSTREAM_API_ERROR,
                message,
                Some(json!({ "status": status, "error_message": error_message })),
            ),
            UpstreamFailure::Decode { .. } => AppError::domain(UPSTREAM_API_ERROR, message, None),
        }
    }
}

#[async_trait]
pub trait MapsProvider: Send + Sync {
    async fn fetch(&self, request: &UpstreamRequest) -> Result<Value, UpstreamFailure>;
}

#[derive(Debug, Clone)]
pub struct GoogleMapsClient {
    client: Client,
    api_key: String,
    maps_base_url: String,
    geolocation_base_url: String,
}

impl GoogleMapsClient {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| AppError::configuration(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            maps_base_url: config.maps_base_url.clone(),
            geolocation_base_url: config.geolocation_base_url.clone(),
        })
    }

    fn url_for(&self, endpoint: Endpoint) -> String {
        let base = match endpoint {
            Endpoint::Geolocate => &self.geolocation_base_url,
            _ => &self.maps_base_url,
        };
        format!("{base}{}", endpoint.path())
    }
}

#[async_trait]
impl MapsProvider for GoogleMapsClient {
    async fn fetch(&self, request: &UpstreamRequest) -> Result<Value, UpstreamFailure> {
        let url = self.url_for(request.endpoint);
        let mut query = query_pairs(&request.params);
        query.push(("key".to_string(), self.api_key.clone()));

        debug!(endpoint = request.endpoint.path(), "calling upstream");

        let builder = if request.endpoint.uses_post() {
            self.client
                .post(&url)
                .query(&query)
                .json(request.body.as_ref().unwrap_or(&Value::Null))
        } else {
            self.client.get(&url).query(&query)
        };

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| parse_retry_after(value, Utc::now()));
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamFailure::Http {
                status: status.as_u16(),
                retry_after,
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let payload: Value = response.json().await.map_err(|err| UpstreamFailure::Decode {
            message: err.without_url().to_string(),
        })?;
        check_api_status(payload)
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> UpstreamFailure {
    let kind = if err.is_timeout() {
        NetworkErrorKind::Timeout
    } else if err.is_connect() {
        NetworkErrorKind::Connect
    } else {
        NetworkErrorKind::Other
    };

    // The request URL carries the API key.
    UpstreamFailure::Network {
        kind,
        message: err.without_url().to_string(),
    }
}

pub fn query_pairs(params: &Map<String, Value>) -> Vec<(String, String)> {
    params
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| {
            let rendered = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (name.clone(), rendered)
        })
        .collect()
}

/// Accepts both delta-seconds and HTTP-date forms.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Web-service payloads report failures in a `status` field with HTTP 200.
pub fn check_api_status(payload: Value) -> Result<Value, UpstreamFailure> {
    let Some(status) = payload.get("status").and_then(Value::as_str) else {
        return Ok(payload);
    };

    match status {
        "OK" | "ZERO_RESULTS" => Ok(payload),
        other => Err(UpstreamFailure::Api {
            status: other.to_string(),
            message: payload
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or("request was rejected by the upstream API")
                .to_string(),
        }),
    }
}

/// validate → cache lookup → rate limit → retry(upstream) → cache store.
pub struct RequestPipeline {
    provider: Arc<dyn MapsProvider>,
    cache: BoundedCache<Value>,
    rate_limiter: RateLimiter,
    retry: RetryPolicy,
}

impl RequestPipeline {
    pub fn new(
        provider: Arc<dyn MapsProvider>,
        cache: BoundedCache<Value>,
        rate_limiter: RateLimiter,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            cache,
            rate_limiter,
            retry,
        }
    }

    pub fn from_config(provider: Arc<dyn MapsProvider>, config: &Config) -> Self {
        Self::new(
            provider,
            BoundedCache::new(&config.cache),
            RateLimiter::new(&config.rate_limit),
            RetryPolicy::new(&config.retry),
        )
    }

    pub fn cache(&self) -> &BoundedCache<Value> {
        &self.cache
    }

    /// Runs one upstream request on behalf of `tool`. Cache hits do not
    /// consume rate-limit tokens.
    pub async fn execute(&self, tool: &str, request: UpstreamRequest) -> Result<Value, AppError> {
        let cache_key = request
            .endpoint
            .is_cacheable()
            .then(|| request.cache_key());

        if let Some(key) = cache_key.as_deref() {
            if let Some(cached) = self.cache.get(key) {
                return Ok(cached);
            }
        }

        self.rate_limiter.check(tool)?;

        let provider = &self.provider;
        let request = &request;
        let payload = self
            .retry
            .run(move || provider.fetch(request))
            .await
            .map_err(AppError::from)?;

        if let Some(key) = cache_key {
            self.cache.set(key, payload.clone());
        }

        Ok(payload)
    }
}
