//! Vehicle-data provider client and identifier validation
//!
//! The provider is a black box behind [`VehicleLookup`]: a VIN or plate
//! goes in, an opaque report payload comes out. Lookup failure is never a
//! user-facing error; the acquisition flow substitutes a deterministic
//! placeholder instead.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

const VIN_LENGTH: usize = 17;

/// VIN used when a plate lookup cannot resolve one
pub const PLATE_FALLBACK_VIN: &str = "1HGBH41JXMN109186";

/// Sentinel VINs that map to the non-clean sample reports
const CAUTION_VIN: &str = "2T1BURHE5JC073215";
const HIGH_RISK_VIN: &str = "3FA6P0H77KR245892";

/// Two-letter US state codes accepted for plate lookups, DC included
pub const US_STATE_CODES: [&str; 51] = [
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ",
    "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT",
    "VA", "WA", "WV", "WI", "WY", "DC",
];

/// A validated 17-character VIN
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Vin(String);

impl Vin {
    /// Uppercase, strip characters outside the VIN alphabet, then require
    /// exactly 17 characters. I, O and Q are never part of a VIN.
    pub fn parse(input: &str) -> ApiResult<Self> {
        let cleaned: String = input
            .chars()
            .map(|c| c.to_ascii_uppercase())
            .filter(|c| c.is_ascii_digit() || (c.is_ascii_uppercase() && !matches!(c, 'I' | 'O' | 'Q')))
            .collect();

        if cleaned.len() != VIN_LENGTH {
            return Err(ApiError::Validation("Invalid VIN format".to_string()));
        }

        Ok(Self(cleaned))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Vin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated plate + state pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlateQuery {
    pub plate: String,
    pub state: String,
}

impl PlateQuery {
    pub fn parse(plate: &str, state: &str) -> ApiResult<Self> {
        let plate: String = plate
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if !(2..=8).contains(&plate.len()) {
            return Err(ApiError::Validation(
                "Invalid license plate format".to_string(),
            ));
        }

        let state = state.trim().to_ascii_uppercase();
        if !US_STATE_CODES.contains(&state.as_str()) {
            return Err(ApiError::Validation("Invalid state code".to_string()));
        }

        Ok(Self { plate, state })
    }
}

/// Result of a plate lookup: the resolved VIN plus the report payload
#[derive(Debug, Clone)]
pub struct PlateLookup {
    pub vin: String,
    pub data: serde_json::Value,
}

/// Black-box vehicle-data provider
#[async_trait]
pub trait VehicleLookup: Send + Sync {
    async fn lookup_vin(&self, vin: &Vin) -> ApiResult<serde_json::Value>;
    async fn lookup_plate(&self, plate: &PlateQuery) -> ApiResult<PlateLookup>;
}

/// HTTP client for the Auto Data Direct API
pub struct VehicleDataClient {
    client: reqwest::Client,
    api_url: Option<String>,
    api_key: Option<String>,
}

impl VehicleDataClient {
    pub fn new(client: reqwest::Client, api_url: Option<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            api_url,
            api_key,
        }
    }

    fn endpoint(&self) -> ApiResult<(&str, &str)> {
        match (self.api_url.as_deref(), self.api_key.as_deref()) {
            (Some(url), Some(key)) => Ok((url.trim_end_matches('/'), key)),
            _ => Err(ApiError::Internal(
                "vehicle data service not configured".to_string(),
            )),
        }
    }

    fn retry_strategy() -> impl Iterator<Item = std::time::Duration> {
        // Two retries with exponential backoff; transient provider errors
        // are common enough to be worth absorbing.
        ExponentialBackoff::from_millis(200).take(2)
    }
}

#[async_trait]
impl VehicleLookup for VehicleDataClient {
    async fn lookup_vin(&self, vin: &Vin) -> ApiResult<serde_json::Value> {
        let (url, key) = self.endpoint()?;
        let request_url = format!("{url}/vin/{vin}");

        Retry::spawn(Self::retry_strategy(), || async {
            let response = self
                .client
                .get(&request_url)
                .bearer_auth(key)
                .send()
                .await
                .map_err(|e| ApiError::Internal(format!("vehicle data request failed: {e}")))?;

            if !response.status().is_success() {
                return Err(ApiError::Internal(format!(
                    "vehicle data lookup returned {}",
                    response.status()
                )));
            }

            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| ApiError::Internal(format!("vehicle data response invalid: {e}")))
        })
        .await
    }

    async fn lookup_plate(&self, plate: &PlateQuery) -> ApiResult<PlateLookup> {
        let (url, key) = self.endpoint()?;
        let request_url = format!("{url}/plate");

        let data = Retry::spawn(Self::retry_strategy(), || async {
            let response = self
                .client
                .post(&request_url)
                .bearer_auth(key)
                .json(&json!({ "plate": plate.plate, "state": plate.state }))
                .send()
                .await
                .map_err(|e| ApiError::Internal(format!("plate lookup request failed: {e}")))?;

            if !response.status().is_success() {
                return Err(ApiError::Internal(format!(
                    "plate lookup returned {}",
                    response.status()
                )));
            }

            response
                .json::<serde_json::Value>()
                .await
                .map_err(|e| ApiError::Internal(format!("plate lookup response invalid: {e}")))
        })
        .await?;

        let vin = data
            .get("vin")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| ApiError::Internal("plate lookup response missing vin".to_string()))?;

        Ok(PlateLookup { vin, data })
    }
}

/// Deterministic placeholder served when the provider is unavailable.
/// The product never shows a dead end; the sentinel VINs produce the
/// caution and high-risk sample reports so those paths stay demoable.
pub fn fallback_report(vin: &str, report_id: Uuid) -> serde_json::Value {
    let (risk_level, accident_count, title_brands) = match vin {
        CAUTION_VIN => ("caution", 1, vec!["salvage"]),
        HIGH_RISK_VIN => ("high-risk", 3, vec!["salvage", "flood"]),
        _ => ("clean", 0, vec![]),
    };

    json!({
        "reportId": report_id,
        "vin": vin,
        "source": "placeholder",
        "riskLevel": risk_level,
        "overview": {
            "make": "Unknown",
            "model": "Unknown",
            "year": null,
            "lastReportedOdometer": null,
        },
        "accidents": {
            "count": accident_count,
            "records": [],
        },
        "titleBrands": title_brands,
        "recalls": [],
        "ownershipHistory": [],
        "salesHistory": [],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_vin_parses() {
        let vin = Vin::parse("1HGBH41JXMN109186").unwrap();
        assert_eq!(vin.as_str(), "1HGBH41JXMN109186");
    }

    #[test]
    fn test_vin_is_cleaned_and_uppercased() {
        let vin = Vin::parse(" 1hgbh41jxmn109186 ").unwrap();
        assert_eq!(vin.as_str(), "1HGBH41JXMN109186");

        let hyphenated = Vin::parse("1HG-BH4-1JX-MN1-091-86").unwrap();
        assert_eq!(hyphenated.as_str(), "1HGBH41JXMN109186");
    }

    #[test]
    fn test_vin_rejects_bad_lengths() {
        assert!(Vin::parse("1HGBH41JXMN10918").is_err());
        assert!(Vin::parse("1HGBH41JXMN1091867").is_err());
        assert!(Vin::parse("").is_err());
    }

    #[test]
    fn test_vin_excluded_letters_do_not_count() {
        // I/O/Q are stripped, leaving too few characters
        assert!(Vin::parse("IHGBH41JXMN109186").is_err());
        assert!(Vin::parse("1HGBH41JXMN10918O").is_err());
    }

    #[test]
    fn test_plate_validation() {
        let query = PlateQuery::parse("abc-1234", "ca").unwrap();
        assert_eq!(query.plate, "ABC1234");
        assert_eq!(query.state, "CA");

        assert!(PlateQuery::parse("A", "CA").is_err(), "Too short");
        assert!(PlateQuery::parse("ABCDEFGHI", "CA").is_err(), "Too long");
        assert!(PlateQuery::parse("ABC123", "ZZ").is_err(), "Bad state");
        assert!(PlateQuery::parse("ABC123", "").is_err());
    }

    #[test]
    fn test_fallback_report_variants() {
        let id = Uuid::new_v4();

        let clean = fallback_report("1HGBH41JXMN109186", id);
        assert_eq!(clean["riskLevel"], "clean");
        assert_eq!(clean["source"], "placeholder");

        let caution = fallback_report(CAUTION_VIN, id);
        assert_eq!(caution["riskLevel"], "caution");

        let high_risk = fallback_report(HIGH_RISK_VIN, id);
        assert_eq!(high_risk["riskLevel"], "high-risk");
        assert_eq!(high_risk["accidents"]["count"], 3);
    }

    #[tokio::test]
    async fn test_lookup_vin_hits_provider() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/vin/1HGBH41JXMN109186")
            .with_status(200)
            .with_body(r#"{"vin":"1HGBH41JXMN109186","make":"Honda"}"#)
            .create_async()
            .await;

        let client = VehicleDataClient::new(
            reqwest::Client::new(),
            Some(server.url()),
            Some("test-key".to_string()),
        );
        let vin = Vin::parse("1HGBH41JXMN109186").unwrap();
        let data = client.lookup_vin(&vin).await.unwrap();
        assert_eq!(data["make"], "Honda");
    }

    #[tokio::test]
    async fn test_lookup_vin_provider_error_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/vin/1HGBH41JXMN109186")
            .with_status(503)
            .expect_at_least(1)
            .create_async()
            .await;

        let client = VehicleDataClient::new(
            reqwest::Client::new(),
            Some(server.url()),
            Some("test-key".to_string()),
        );
        let vin = Vin::parse("1HGBH41JXMN109186").unwrap();
        assert!(client.lookup_vin(&vin).await.is_err());
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_an_error() {
        let client = VehicleDataClient::new(reqwest::Client::new(), None, None);
        let vin = Vin::parse("1HGBH41JXMN109186").unwrap();
        assert!(client.lookup_vin(&vin).await.is_err());
    }
}
