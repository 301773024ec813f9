//! Core domain types: identifiers, cells, rating values and records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Get the raw numeric value.
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }
    };
}

numeric_id!(
    /// Identifier of an ACC model, the top-level grouping a user evaluates.
    AccModelId
);
numeric_id!(
    /// Identifier of a component owned by an ACC model.
    ComponentId
);
numeric_id!(
    /// Identifier of a capability owned by a component.
    CapabilityId
);
numeric_id!(
    /// Identifier of a quality attribute.
    AttributeId
);
numeric_id!(
    /// Server-assigned identifier of a (capability, attribute) assessment cell.
    AssessmentId
);
numeric_id!(
    /// Server-assigned identifier of a rating.
    RatingId
);
numeric_id!(
    /// Identifier of a user.
    UserId
);

/// Address of one cell in the capability × attribute matrix.
///
/// Displays and parses as `"capability_id-attribute_id"`, the key the
/// presentation layer uses for its cell maps.
///
/// ```
/// use acc_ratings::{AttributeId, CapabilityId, CellKey};
///
/// let key = CellKey::new(CapabilityId(7), AttributeId(2));
/// assert_eq!(key.to_string(), "7-2");
/// assert_eq!("7-2".parse::<CellKey>().unwrap(), key);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    pub capability_id: CapabilityId,
    pub attribute_id: AttributeId,
}

impl CellKey {
    pub fn new(capability_id: CapabilityId, attribute_id: AttributeId) -> Self {
        Self {
            capability_id,
            attribute_id,
        }
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.capability_id, self.attribute_id)
    }
}

impl FromStr for CellKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cap, attr) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidInput(format!("malformed cell key: {s}")))?;
        let parse = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| Error::InvalidInput(format!("malformed cell key: {s}")))
        };
        Ok(Self::new(CapabilityId(parse(cap)?), AttributeId(parse(attr)?)))
    }
}

impl Serialize for CellKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CellKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The value a user picks for a cell.
///
/// This is the closed wire enumeration sent to the server. It is not a
/// [`Bucket`](crate::aggregation::Bucket): buckets are derived from averages
/// of many ratings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RatingValue {
    #[serde(rename = "Stable")]
    Stable,
    #[serde(rename = "Acceptable")]
    Acceptable,
    #[serde(rename = "Low Impact")]
    LowImpact,
    #[serde(rename = "Critical Concern")]
    CriticalConcern,
    #[serde(rename = "Not Applicable")]
    NotApplicable,
}

impl RatingValue {
    /// Every selectable value, in the order the rating options are offered.
    pub const ALL: [RatingValue; 5] = [
        RatingValue::Stable,
        RatingValue::Acceptable,
        RatingValue::LowImpact,
        RatingValue::CriticalConcern,
        RatingValue::NotApplicable,
    ];

    /// Numeric score on the 1..=4 scale; `None` for "Not Applicable".
    pub fn score(self) -> Option<u8> {
        match self {
            RatingValue::Stable => Some(4),
            RatingValue::Acceptable => Some(3),
            RatingValue::LowImpact => Some(2),
            RatingValue::CriticalConcern => Some(1),
            RatingValue::NotApplicable => None,
        }
    }

    /// Inverse of [`score`](Self::score).
    pub fn from_score(score: u8) -> Option<Self> {
        match score {
            4 => Some(RatingValue::Stable),
            3 => Some(RatingValue::Acceptable),
            2 => Some(RatingValue::LowImpact),
            1 => Some(RatingValue::CriticalConcern),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RatingValue::Stable => "Stable",
            RatingValue::Acceptable => "Acceptable",
            RatingValue::LowImpact => "Low Impact",
            RatingValue::CriticalConcern => "Critical Concern",
            RatingValue::NotApplicable => "Not Applicable",
        }
    }
}

impl fmt::Display for RatingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One user's current rating of an assessment, as stored by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingRecord {
    pub id: RatingId,
    pub user_id: UserId,
    pub capability_assessment_id: AssessmentId,
    pub rating: RatingValue,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// An ACC model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccModel {
    pub id: AccModelId,
    pub name: String,
}

/// A quality dimension every capability is rated against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: AttributeId,
    pub name: String,
}

/// A component of an ACC model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub id: ComponentId,
    pub name: String,
    pub acc_model_id: AccModelId,
}

/// A capability owned by a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub id: CapabilityId,
    pub name: String,
    pub component_id: ComponentId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_key_display_and_parse() {
        let key = CellKey::new(CapabilityId(12), AttributeId(3));
        assert_eq!(key.to_string(), "12-3");
        assert_eq!("12-3".parse::<CellKey>().unwrap(), key);
    }

    #[test]
    fn cell_key_rejects_malformed_input() {
        assert!("12".parse::<CellKey>().is_err());
        assert!("a-3".parse::<CellKey>().is_err());
        assert!("12-".parse::<CellKey>().is_err());
    }

    #[test]
    fn cell_key_serializes_as_string() {
        let key = CellKey::new(CapabilityId(1), AttributeId(2));
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"1-2\"");
        let back: CellKey = serde_json::from_str("\"1-2\"").unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn rating_value_wire_names() {
        assert_eq!(
            serde_json::to_string(&RatingValue::LowImpact).unwrap(),
            "\"Low Impact\""
        );
        let v: RatingValue = serde_json::from_str("\"Not Applicable\"").unwrap();
        assert_eq!(v, RatingValue::NotApplicable);
    }

    #[test]
    fn rating_value_scores() {
        assert_eq!(RatingValue::Stable.score(), Some(4));
        assert_eq!(RatingValue::CriticalConcern.score(), Some(1));
        assert_eq!(RatingValue::NotApplicable.score(), None);
        for value in RatingValue::ALL {
            if let Some(score) = value.score() {
                assert_eq!(RatingValue::from_score(score), Some(value));
            }
        }
        assert_eq!(RatingValue::from_score(0), None);
    }

    #[test]
    fn rating_record_tolerates_missing_optional_fields() {
        let json = r#"{
            "id": 5,
            "user_id": 9,
            "capability_assessment_id": 40,
            "rating": "Acceptable"
        }"#;
        let record: RatingRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, RatingId(5));
        assert!(record.comments.is_none());
        assert!(record.timestamp.is_none());
    }
}
