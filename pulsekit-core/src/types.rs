//! Core domain types for pulsekit
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Request** | One unit of outbound HTTP work, persisted until delivered |
//! | **Event** | One structured occurrence, batched into a Request on flush |
//! | **Feature** | A consent-gated capability (sessions, events, crashes, ...) |
//! | **Device id** | The identity every Request is attributed to |
//! | **Drain** | One activation of the loop that delivers the store head by head |

use serde::{Deserialize, Serialize};

// ============================================
// Consent features
// ============================================

/// A capability gated by user consent.
///
/// The serialized form is the name the collection server expects in
/// `consent` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Feature {
    Sessions,
    Events,
    Location,
    Views,
    Clicks,
    Crashes,
    Users,
    Push,
    StarRating,
    RemoteConfig,
    Feedback,
}

impl Feature {
    /// Every feature, in wire order
    pub const ALL: [Feature; 11] = [
        Feature::Sessions,
        Feature::Events,
        Feature::Location,
        Feature::Views,
        Feature::Clicks,
        Feature::Crashes,
        Feature::Users,
        Feature::Push,
        Feature::StarRating,
        Feature::RemoteConfig,
        Feature::Feedback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Sessions => "sessions",
            Feature::Events => "events",
            Feature::Location => "location",
            Feature::Views => "views",
            Feature::Clicks => "clicks",
            Feature::Crashes => "crashes",
            Feature::Users => "users",
            Feature::Push => "push",
            Feature::StarRating => "star-rating",
            Feature::RemoteConfig => "remote-config",
            Feature::Feedback => "feedback",
        }
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown feature: {}", s))
    }
}

// ============================================
// Device identity
// ============================================

/// Who chose the device id. Sent as the `t` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceIdType {
    /// Supplied by the host application
    DeveloperProvided,
    /// Generated by the SDK
    SdkGenerated,
}

impl DeviceIdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceIdType::DeveloperProvided => "developer_provided",
            DeviceIdType::SdkGenerated => "sdk_generated",
        }
    }

    /// Numeric code used on the wire
    pub fn code(&self) -> u8 {
        match self {
            DeviceIdType::DeveloperProvided => 0,
            DeviceIdType::SdkGenerated => 1,
        }
    }
}

impl std::str::FromStr for DeviceIdType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "developer_provided" => Ok(DeviceIdType::DeveloperProvided),
            "sdk_generated" => Ok(DeviceIdType::SdkGenerated),
            _ => Err(format!("unknown device id type: {}", s)),
        }
    }
}

/// The current device identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceId {
    pub id: String,
    pub kind: DeviceIdType,
}

impl DeviceId {
    pub fn developer(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: DeviceIdType::DeveloperProvided,
        }
    }

    /// A fresh random id
    pub fn generate() -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            kind: DeviceIdType::SdkGenerated,
        }
    }
}
