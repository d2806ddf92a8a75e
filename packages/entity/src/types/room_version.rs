use serde::{Deserialize, Serialize};

/// Which state resolution algorithm a room version selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateResolutionVersion {
    V1,
    V2,
}

/// How event IDs are derived for a room version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventIdFormat {
    /// `$opaque:domain`, minted by the origin server (v1/v2 rooms).
    DomainQualified,
    /// `$` + standard unpadded base64 of the reference hash (v3 rooms).
    Base64ReferenceHash,
    /// `$` + url-safe unpadded base64 of the reference hash (v4+ rooms).
    UrlSafeBase64ReferenceHash,
}

/// Immutable descriptor of a room version's behavioral flags.
///
/// All authorization and resolution logic is parameterized by one of these;
/// an event may only be interpreted under its room's declared version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RoomVersion {
    #[serde(rename = "1")]
    V1,
    #[serde(rename = "2")]
    V2,
    #[serde(rename = "3")]
    V3,
    #[serde(rename = "4")]
    V4,
    #[serde(rename = "5")]
    V5,
    #[serde(rename = "6")]
    V6,
    #[serde(rename = "7")]
    V7,
    #[serde(rename = "8")]
    V8,
    #[serde(rename = "9")]
    V9,
    #[serde(rename = "10")]
    V10,
    #[serde(rename = "11")]
    V11,
}

impl RoomVersion {
    pub const DEFAULT: RoomVersion = RoomVersion::V10;

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1" => Some(Self::V1),
            "2" => Some(Self::V2),
            "3" => Some(Self::V3),
            "4" => Some(Self::V4),
            "5" => Some(Self::V5),
            "6" => Some(Self::V6),
            "7" => Some(Self::V7),
            "8" => Some(Self::V8),
            "9" => Some(Self::V9),
            "10" => Some(Self::V10),
            "11" => Some(Self::V11),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "1",
            Self::V2 => "2",
            Self::V3 => "3",
            Self::V4 => "4",
            Self::V5 => "5",
            Self::V6 => "6",
            Self::V7 => "7",
            Self::V8 => "8",
            Self::V9 => "9",
            Self::V10 => "10",
            Self::V11 => "11",
        }
    }

    fn ordinal(&self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
            Self::V3 => 3,
            Self::V4 => 4,
            Self::V5 => 5,
            Self::V6 => 6,
            Self::V7 => 7,
            Self::V8 => 8,
            Self::V9 => 9,
            Self::V10 => 10,
            Self::V11 => 11,
        }
    }

    pub fn state_resolution(&self) -> StateResolutionVersion {
        if self.ordinal() >= 2 {
            StateResolutionVersion::V2
        } else {
            StateResolutionVersion::V1
        }
    }

    pub fn event_id_format(&self) -> EventIdFormat {
        match self.ordinal() {
            1 | 2 => EventIdFormat::DomainQualified,
            3 => EventIdFormat::Base64ReferenceHash,
            _ => EventIdFormat::UrlSafeBase64ReferenceHash,
        }
    }

    /// v1-v5 rooms special-case `m.room.aliases` in the auth rules.
    pub fn special_case_aliases_auth(&self) -> bool {
        self.ordinal() <= 5
    }

    /// v5+ requires signing-key validity periods to be honored.
    pub fn enforce_key_validity(&self) -> bool {
        self.ordinal() >= 5
    }

    /// v6+ rejects canonical JSON with out-of-range integers or floats.
    pub fn strict_canonical_json(&self) -> bool {
        self.ordinal() >= 6
    }

    /// v6+ applies power-level limits to the `notifications` map too.
    pub fn limit_notifications_power_levels(&self) -> bool {
        self.ordinal() >= 6
    }

    /// v7+ supports the `knock` join rule.
    pub fn knock_join_rule(&self) -> bool {
        self.ordinal() >= 7
    }

    /// v8+ supports restricted joins via `join_authorised_via_users_server`.
    pub fn restricted_joins(&self) -> bool {
        self.ordinal() >= 8
    }

    /// v10+ supports the combined `knock_restricted` join rule.
    pub fn knock_restricted_join_rule(&self) -> bool {
        self.ordinal() >= 10
    }

    /// v10+ requires power-level values to be integers, not strings.
    pub fn integer_power_levels(&self) -> bool {
        self.ordinal() >= 10
    }

    /// v11 keeps the full `m.room.create` content under redaction and keeps
    /// `redacts` on redaction events.
    pub fn updated_redaction_rules(&self) -> bool {
        self.ordinal() >= 11
    }

    /// v11 drops the `creator` content field; the room creator is the create
    /// event's sender.
    pub fn implicit_room_creator(&self) -> bool {
        self.ordinal() >= 11
    }
}

impl std::fmt::Display for RoomVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_versions() {
        assert_eq!(RoomVersion::parse("1"), Some(RoomVersion::V1));
        assert_eq!(RoomVersion::parse("11"), Some(RoomVersion::V11));
        assert_eq!(RoomVersion::parse("org.example.custom"), None);
    }

    #[test]
    fn capability_boundaries() {
        assert_eq!(RoomVersion::V1.state_resolution(), StateResolutionVersion::V1);
        assert_eq!(RoomVersion::V2.state_resolution(), StateResolutionVersion::V2);
        assert_eq!(RoomVersion::V3.event_id_format(), EventIdFormat::Base64ReferenceHash);
        assert_eq!(
            RoomVersion::V4.event_id_format(),
            EventIdFormat::UrlSafeBase64ReferenceHash
        );
        assert!(!RoomVersion::V7.restricted_joins());
        assert!(RoomVersion::V8.restricted_joins());
        assert!(RoomVersion::V11.updated_redaction_rules());
        assert!(!RoomVersion::V10.updated_redaction_rules());
    }
}
