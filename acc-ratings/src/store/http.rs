//! JSON/HTTP client for the ratings API.
//!
//! # Example
//!
//! ```ignore
//! use acc_ratings::store::HttpRatingStore;
//!
//! let store = HttpRatingStore::with_base_url("https://acc.example.org/api")?;
//! let options = store.rating_options().await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    AssessmentRef, AuthApi, AverageRecord, BulkResolveRequest, CommentUpdate, HistoricalAverages,
    RatingStore, RatingSubmission, RefreshRequest, TokenResponse,
};
use crate::config::ApiConfig;
use crate::session::{AccessToken, RefreshToken, TokenGrant};
use crate::types::{AssessmentId, AttributeId, CapabilityId, RatingId, RatingRecord, RatingValue, UserId};
use crate::{Error, Result};

/// Map a non-success response to an error.
fn status_error(status: StatusCode, body: String) -> Error {
    if status == StatusCode::UNAUTHORIZED {
        Error::Unauthorized(body)
    } else {
        Error::Api {
            status: status.as_u16(),
            message: body,
        }
    }
}

/// Parse a success body; malformed JSON is a serialization error.
fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}

/// Query-string form of a timestamp, as the backend parses it.
fn query_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ────────────────────────────────────────────────────────────────────────────
// HttpRatingStore
// ────────────────────────────────────────────────────────────────────────────

/// [`RatingStore`] and [`AuthApi`] over HTTP.
pub struct HttpRatingStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRatingStore {
    /// Create a client from API configuration.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Create a client with default settings for `base_url`.
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        Self::new(&ApiConfig {
            base_url: base_url.into(),
            ..ApiConfig::default()
        })
    }

    /// Get the base URL for this client.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
        let response: Response = request
            .send()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;
        decode_body(&body)
    }
}

#[async_trait]
impl AuthApi for HttpRatingStore {
    async fn login(&self, username: &str, password: &str) -> Result<TokenGrant> {
        let request = self
            .client
            .post(self.url("/token"))
            .form(&[("username", username), ("password", password)]);
        let response: TokenResponse = Self::send(request).await?;
        debug!(username, "login succeeded");
        Ok(response.into())
    }

    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenGrant> {
        let request = self.client.post(self.url("/refresh-token")).json(&RefreshRequest {
            refresh_token: refresh_token.expose_secret(),
        });
        let response: TokenResponse = Self::send(request).await?;
        Ok(response.into())
    }
}

#[async_trait]
impl RatingStore for HttpRatingStore {
    async fn resolve_assessments(
        &self,
        capability_ids: &[CapabilityId],
        attribute_ids: &[AttributeId],
    ) -> Result<Vec<AssessmentRef>> {
        let body = BulkResolveRequest {
            capability_ids: capability_ids.to_vec(),
            attribute_ids: attribute_ids.to_vec(),
        };
        debug!(
            capabilities = capability_ids.len(),
            attributes = attribute_ids.len(),
            "resolving assessments"
        );
        let request = self
            .client
            .post(self.url("/capability-assessments/bulk/ids"))
            .json(&body);
        Self::send(request).await
    }

    async fn submit_rating(
        &self,
        token: &AccessToken,
        submission: &RatingSubmission,
    ) -> Result<RatingRecord> {
        let path = format!(
            "/capability-assessments/{}/",
            submission.capability_assessment_id
        );
        let request = self
            .client
            .post(self.url(&path))
            .bearer_auth(token.expose_secret())
            .json(submission);
        Self::send(request).await
    }

    async fn update_comment(
        &self,
        token: &AccessToken,
        rating_id: RatingId,
        update: &CommentUpdate,
    ) -> Result<RatingRecord> {
        let path = format!("/capability-assessments/ratings/{rating_id}/");
        let request = self
            .client
            .put(self.url(&path))
            .bearer_auth(token.expose_secret())
            .json(update);
        Self::send(request).await
    }

    async fn user_ratings(
        &self,
        user_id: UserId,
        assessment_ids: &[AssessmentId],
    ) -> Result<Vec<RatingRecord>> {
        let request = self
            .client
            .post(self.url("/capability-assessments/ratings/batch/"))
            .query(&[("user_id", user_id.get())])
            .json(assessment_ids);
        Self::send(request).await
    }

    async fn aggregate(&self, assessment_id: AssessmentId) -> Result<AverageRecord> {
        let path = format!("/capability-assessments/{assessment_id}/aggregate");
        Self::send(self.client.get(self.url(&path))).await
    }

    async fn aggregates(&self, assessment_ids: &[AssessmentId]) -> Result<Vec<AverageRecord>> {
        let request = self
            .client
            .post(self.url("/capability-assessments/aggregates"))
            .json(assessment_ids);
        Self::send(request).await
    }

    async fn historical(
        &self,
        assessment_ids: &[AssessmentId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HistoricalAverages> {
        let request = self
            .client
            .post(self.url("/capability-assessments/historical-graph-data"))
            .query(&[
                ("start_date", query_timestamp(start)),
                ("end_date", query_timestamp(end)),
            ])
            .json(assessment_ids);
        Self::send(request).await
    }

    async fn rating_options(&self) -> Result<Vec<RatingValue>> {
        Self::send(self.client.get(self.url("/rating-options/"))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn base_url_drops_trailing_slash() {
        let store = HttpRatingStore::with_base_url("http://localhost:8000/").unwrap();
        assert_eq!(store.base_url(), "http://localhost:8000");
        assert_eq!(
            store.url("/capability-assessments/bulk/ids"),
            "http://localhost:8000/capability-assessments/bulk/ids"
        );
    }

    #[test]
    fn new_uses_configured_timeout() {
        let config = ApiConfig {
            base_url: "http://acc.internal".to_string(),
            request_timeout: Duration::from_secs(3),
        };
        let store = HttpRatingStore::new(&config).unwrap();
        assert_eq!(store.base_url(), "http://acc.internal");
    }

    #[test]
    fn unauthorized_status_maps_to_auth_error() {
        let err = status_error(StatusCode::UNAUTHORIZED, "token expired".to_string());
        assert!(err.is_auth());
    }

    #[test]
    fn other_statuses_keep_code_and_body() {
        let err = status_error(StatusCode::UNPROCESSABLE_ENTITY, "bad rating".to_string());
        match err {
            Error::Api { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "bad rating");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn malformed_success_body_is_a_serialization_error() {
        let err = decode_body::<TokenResponse>(b"<html>gateway</html>").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));

        let options: Vec<RatingValue> = decode_body(br#"["Stable","Not Applicable"]"#).unwrap();
        assert_eq!(options, vec![RatingValue::Stable, RatingValue::NotApplicable]);
    }

    #[test]
    fn query_timestamps_are_utc_iso() {
        let instant = Utc.with_ymd_and_hms(2026, 2, 3, 4, 5, 6).unwrap();
        assert_eq!(query_timestamp(instant), "2026-02-03T04:05:06.000Z");
    }

    #[tokio::test]
    async fn unreachable_server_is_a_request_error() {
        let config = ApiConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            request_timeout: Duration::from_millis(500),
        };
        let store = HttpRatingStore::new(&config).unwrap();
        let err = store.rating_options().await.unwrap_err();
        assert!(matches!(err, Error::Request(_)));
    }
}
