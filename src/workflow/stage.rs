//! The fixed set of conversational stages a turn can be routed to.

use serde::{Deserialize, Serialize};

/// One node in the funnel. Every turn is routed to exactly one stage; the
/// classifier may never produce anything outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    QualifyLead,
    CollectDetails,
    ShowServices,
    BookAppointment,
    ProvideBrandInfo,
    FollowUp,
    GenerateResponse,
}

impl Stage {
    /// Parse a classification label. Unrecognized labels are the caller's
    /// cue to fall back to [`Stage::GenerateResponse`].
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "qualify_lead" => Some(Self::QualifyLead),
            "collect_details" => Some(Self::CollectDetails),
            "show_services" => Some(Self::ShowServices),
            "book_appointment" => Some(Self::BookAppointment),
            "provide_brand_info" => Some(Self::ProvideBrandInfo),
            "follow_up" => Some(Self::FollowUp),
            "generate_response" => Some(Self::GenerateResponse),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QualifyLead => "qualify_lead",
            Self::CollectDetails => "collect_details",
            Self::ShowServices => "show_services",
            Self::BookAppointment => "book_appointment",
            Self::ProvideBrandInfo => "provide_brand_info",
            Self::FollowUp => "follow_up",
            Self::GenerateResponse => "generate_response",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_roundtrip() {
        for stage in [
            Stage::QualifyLead,
            Stage::CollectDetails,
            Stage::ShowServices,
            Stage::BookAppointment,
            Stage::ProvideBrandInfo,
            Stage::FollowUp,
            Stage::GenerateResponse,
        ] {
            assert_eq!(Stage::from_label(stage.as_str()), Some(stage));
        }
    }

    #[test]
    fn unknown_labels_are_rejected() {
        assert_eq!(Stage::from_label("escalate"), None);
        assert_eq!(Stage::from_label(""), None);
        // Whitespace and case are tolerated
        assert_eq!(Stage::from_label("  Collect_Details \n"), Some(Stage::CollectDetails));
    }
}
