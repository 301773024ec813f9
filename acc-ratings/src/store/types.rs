//! Request and response bodies exchanged with the ratings API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{AccessToken, RefreshToken, TokenGrant};
use crate::types::{AssessmentId, AttributeId, CapabilityId, CellKey, RatingValue};

/// Body of the bulk resolve call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResolveRequest {
    pub capability_ids: Vec<CapabilityId>,
    pub attribute_ids: Vec<AttributeId>,
}

/// One resolved cell of the bulk resolve response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentRef {
    pub capability_id: CapabilityId,
    pub attribute_id: AttributeId,
    pub capability_assessment_id: AssessmentId,
}

impl AssessmentRef {
    pub fn cell(&self) -> CellKey {
        CellKey::new(self.capability_id, self.attribute_id)
    }
}

/// Body of a single rating submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingSubmission {
    pub capability_assessment_id: AssessmentId,
    pub rating: RatingValue,
    pub timestamp: DateTime<Utc>,
}

/// Body of a comment update, addressed to an existing rating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentUpdate {
    pub comments: String,
    pub timestamp: DateTime<Utc>,
}

/// Server-side average for one assessment; `None` when nothing numeric was
/// recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AverageRecord {
    pub capability_assessment_id: AssessmentId,
    pub average_rating: Option<f64>,
    /// Number of ratings behind the average, when the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating_count: Option<u32>,
}

/// One as-of average in the historical graph data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalEntry {
    pub capability_assessment_id: AssessmentId,
    #[serde(default)]
    pub capability_id: Option<CapabilityId>,
    #[serde(default)]
    pub attribute_id: Option<AttributeId>,
    #[serde(default)]
    pub capability_name: Option<String>,
    #[serde(default)]
    pub attribute_name: Option<String>,
    pub average_rating: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating_count: Option<u32>,
}

/// Historical graph data: as-of averages at both ends of a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalAverages {
    #[serde(default)]
    pub start_date: Vec<HistoricalEntry>,
    #[serde(default)]
    pub end_date: Vec<HistoricalEntry>,
}

/// Body of the refresh call.
#[derive(Debug, Serialize)]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Token response from the login and refresh endpoints.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expiry: DateTime<Utc>,
    /// Scheme of the token; always "bearer" in practice.
    #[serde(default)]
    pub token_type: Option<String>,
}

impl From<TokenResponse> for TokenGrant {
    fn from(response: TokenResponse) -> Self {
        Self {
            access_token: AccessToken::new(response.access_token),
            refresh_token: response.refresh_token.map(RefreshToken::new),
            expires_at: response.expiry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_resolve_request_serializes_plain_ids() {
        let request = BulkResolveRequest {
            capability_ids: vec![CapabilityId(1), CapabilityId(2)],
            attribute_ids: vec![AttributeId(7)],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"capability_ids": [1, 2], "attribute_ids": [7]})
        );
    }

    #[test]
    fn assessment_ref_cell_key() {
        let r: AssessmentRef = serde_json::from_str(
            r#"{"capability_id": 4, "attribute_id": 9, "capability_assessment_id": 101}"#,
        )
        .unwrap();
        assert_eq!(r.cell().to_string(), "4-9");
        assert_eq!(r.capability_assessment_id, AssessmentId(101));
    }

    #[test]
    fn token_response_keeps_token_type() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token": "a", "token_type": "bearer", "expiry": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(response.token_type.as_deref(), Some("bearer"));
        assert!(response.refresh_token.is_none());
    }

    #[test]
    fn average_record_accepts_null_average() {
        let record: AverageRecord =
            serde_json::from_str(r#"{"capability_assessment_id": 3, "average_rating": null}"#)
                .unwrap();
        assert_eq!(record.average_rating, None);
        assert_eq!(record.rating_count, None);
    }

    #[test]
    fn historical_averages_parse_both_boundaries() {
        let json = r#"{
            "start_date": [],
            "end_date": [{
                "capability_assessment_id": 8,
                "capability_name": "Search",
                "attribute_name": "Accuracy",
                "average_rating": 3.5
            }]
        }"#;
        let data: HistoricalAverages = serde_json::from_str(json).unwrap();
        assert!(data.start_date.is_empty());
        assert_eq!(data.end_date[0].average_rating, Some(3.5));
        assert_eq!(data.end_date[0].attribute_name.as_deref(), Some("Accuracy"));
    }

    #[test]
    fn token_response_converts_to_grant() {
        let json = r#"{
            "access_token": "abc",
            "refresh_token": "def",
            "token_type": "bearer",
            "expiry": "2026-01-01T00:00:00Z"
        }"#;
        let response: TokenResponse = serde_json::from_str(json).unwrap();
        let grant: TokenGrant = response.into();
        assert_eq!(grant.access_token.expose_secret(), "abc");
        assert_eq!(grant.refresh_token.unwrap().expose_secret(), "def");
    }

    #[test]
    fn submission_uses_wire_rating_names() {
        let submission = RatingSubmission {
            capability_assessment_id: AssessmentId(5),
            rating: RatingValue::CriticalConcern,
            timestamp: "2026-03-01T12:00:00Z".parse().unwrap(),
        };
        let json = serde_json::to_value(&submission).unwrap();
        assert_eq!(json["rating"], "Critical Concern");
        assert_eq!(json["capability_assessment_id"], 5);
    }
}
