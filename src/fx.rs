//! Foreign-exchange rates
//!
//! Rates come from an EUR-based public feed and are cached in the store for
//! 24 hours. A cross rate is `rates[target] / rates[base]`; same-currency
//! requests short-circuit to 1.0.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::store::RoomStore;

/// Store key for the cached EUR-based rate table
pub const FX_CACHE_KEY: &str = "fx:ecb:latest";

/// Cache lifetime for fetched rates
pub const FX_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const FALLBACK_RATES_URL: &str = "https://api.frankfurter.app/latest?from=EUR";

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct RatesFeed {
    #[serde(default)]
    base: String,
    #[serde(default)]
    rates: HashMap<String, f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedRates {
    #[serde(default)]
    rates: HashMap<String, f64>,
    #[serde(default)]
    as_of: i64,
    #[serde(default)]
    base: String,
}

/// Conversion rate between two currencies, plus the rate timestamp.
pub async fn rate(
    client: &reqwest::Client,
    store: &dyn RoomStore,
    rates_url: &str,
    base: &str,
    target: &str,
) -> AppResult<(f64, DateTime<Utc>)> {
    if base.eq_ignore_ascii_case(target) {
        return Ok((1.0, Utc::now()));
    }
    let (rates, as_of) = ecb_rates(client, store, rates_url).await?;
    let base_rate = rates.get(&base.to_uppercase()).copied().unwrap_or(0.0);
    if base_rate == 0.0 {
        return Err(AppError::Upstream("unsupported base currency".to_string()));
    }
    let target_rate = rates.get(&target.to_uppercase()).copied().unwrap_or(0.0);
    if target_rate == 0.0 {
        return Err(AppError::Upstream("unsupported target currency".to_string()));
    }
    Ok((target_rate / base_rate, as_of))
}

async fn ecb_rates(
    client: &reqwest::Client,
    store: &dyn RoomStore,
    rates_url: &str,
) -> AppResult<(HashMap<String, f64>, DateTime<Utc>)> {
    if let Ok(Some(cached)) = store.cache_get(FX_CACHE_KEY).await {
        if let Ok(payload) = serde_json::from_str::<CachedRates>(&cached) {
            if !payload.rates.is_empty() {
                let as_of = Utc
                    .timestamp_opt(payload.as_of, 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                return Ok((payload.rates, as_of));
            }
        }
    }

    let candidates = [force_eur_base(rates_url), FALLBACK_RATES_URL.to_string()];
    let (rates, base) = fetch_rates_with_fallback(client, &candidates).await?;

    let as_of = Utc::now();
    let cached = CachedRates {
        rates: rates.clone(),
        as_of: as_of.timestamp(),
        base,
    };
    if let Ok(encoded) = serde_json::to_string(&cached) {
        if let Err(err) = store.cache_set(FX_CACHE_KEY, &encoded, FX_CACHE_TTL).await {
            warn!(error = %err, "fx cache write failed");
        }
    }
    Ok((rates, as_of))
}

async fn fetch_rates_with_fallback(
    client: &reqwest::Client,
    urls: &[String],
) -> AppResult<(HashMap<String, f64>, String)> {
    let mut last_err = AppError::Upstream("rates fetch failed".to_string());
    for url in urls {
        match fetch_rates(client, url).await {
            Ok(result) => return Ok(result),
            Err(err) => {
                warn!(url, error = %err, "rates fetch attempt failed");
                last_err = err;
            }
        }
    }
    Err(last_err)
}

async fn fetch_rates(
    client: &reqwest::Client,
    url: &str,
) -> AppResult<(HashMap<String, f64>, String)> {
    let response = client.get(url).timeout(FETCH_TIMEOUT).send().await?;
    if !response.status().is_success() {
        return Err(AppError::Upstream(format!(
            "rates fetch failed: status {}",
            response.status().as_u16()
        )));
    }
    let feed: RatesFeed = response.json().await?;
    if feed.rates.is_empty() {
        return Err(AppError::Upstream("rates fetch failed: empty rates".to_string()));
    }
    let base = {
        let trimmed = feed.base.trim().to_uppercase();
        if trimmed.is_empty() {
            "EUR".to_string()
        } else {
            trimmed
        }
    };
    let mut rates = feed.rates;
    rates.insert(base.clone(), 1.0);
    Ok((rates, base))
}

fn force_eur_base(raw: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(raw) else {
        return raw.to_string();
    };
    let has_base = parsed.query_pairs().any(|(key, _)| key == "base");
    if !has_base {
        parsed.query_pairs_mut().append_pair("base", "EUR");
    }
    parsed.to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_force_eur_base_appends_only_when_missing() {
        assert_eq!(
            force_eur_base("https://rates.example/latest"),
            "https://rates.example/latest?base=EUR"
        );
        assert_eq!(
            force_eur_base("https://rates.example/latest?base=USD"),
            "https://rates.example/latest?base=USD"
        );
        // unparseable input passes through untouched
        assert_eq!(force_eur_base("not a url"), "not a url");
    }

    #[tokio::test]
    async fn test_fetch_rates_inserts_base_at_unity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "base": "EUR",
                "date": "2024-05-01",
                "rates": { "USD": 1.08, "GBP": 0.85 }
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let (rates, base) = fetch_rates(&client, &format!("{}/latest", server.uri()))
            .await
            .expect("rates fetch succeeds");
        assert_eq!(base, "EUR");
        assert_eq!(rates["EUR"], 1.0);
        assert_eq!(rates["USD"], 1.08);
    }

    #[tokio::test]
    async fn test_fetch_rates_rejects_empty_tables() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "base": "EUR",
                "rates": {}
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = fetch_rates(&client, &server.uri()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fallback_url_is_tried_after_primary_fails() {
        let primary = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&primary)
            .await;

        let fallback = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "base": "EUR",
                "rates": { "USD": 1.10 }
            })))
            .expect(1)
            .mount(&fallback)
            .await;

        let client = reqwest::Client::new();
        let urls = [primary.uri(), fallback.uri()];
        let (rates, _) = fetch_rates_with_fallback(&client, &urls)
            .await
            .expect("fallback succeeds");
        assert_eq!(rates["USD"], 1.10);
    }
}
