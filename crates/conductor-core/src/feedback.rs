use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConductorError, Result};
use crate::types::Payload;

/// Lowest accepted rating.
pub const MIN_RATING: f64 = 1.0;
/// Highest accepted rating.
pub const MAX_RATING: f64 = 5.0;
/// Midpoint, used for "modified" signals and unrated corrections.
pub const MID_RATING: f64 = (MIN_RATING + MAX_RATING) / 2.0;

/// What kind of signal a feedback row carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    ExplicitRating,
    ExplicitCorrection,
    ImplicitUsage,
}

impl FeedbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExplicitRating => "explicit_rating",
            Self::ExplicitCorrection => "explicit_correction",
            Self::ImplicitUsage => "implicit_usage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "explicit_rating" => Some(Self::ExplicitRating),
            "explicit_correction" => Some(Self::ExplicitCorrection),
            "implicit_usage" => Some(Self::ImplicitUsage),
            _ => None,
        }
    }
}

/// Observed consumer action behind an implicit signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplicitAction {
    Accepted,
    Modified,
    Ignored,
}

impl ImplicitAction {
    pub fn rating(&self) -> f64 {
        match self {
            Self::Accepted => MAX_RATING,
            Self::Modified => MID_RATING,
            Self::Ignored => MIN_RATING,
        }
    }
}

/// A recorded feedback row. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub id: String,
    /// Execution the feedback refers to.
    pub request_id: String,
    pub capability: String,
    pub kind: FeedbackKind,
    pub rating: f64,
    #[serde(default)]
    pub correction: Option<Payload>,
    pub founder_id: String,
    pub workspace_id: String,
    pub created_at: DateTime<Utc>,
}

/// Caller-facing feedback payload, before a rating is derived.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackSubmission {
    pub capability: String,
    #[serde(default)]
    pub kind: Option<FeedbackKind>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub action: Option<ImplicitAction>,
    #[serde(default)]
    pub correction: Option<Payload>,
}

impl FeedbackSubmission {
    pub fn rating(capability: impl Into<String>, rating: f64) -> Self {
        Self {
            capability: capability.into(),
            kind: Some(FeedbackKind::ExplicitRating),
            rating: Some(rating),
            ..Default::default()
        }
    }

    pub fn correction(capability: impl Into<String>, corrected: Payload) -> Self {
        Self {
            capability: capability.into(),
            kind: Some(FeedbackKind::ExplicitCorrection),
            correction: Some(corrected),
            ..Default::default()
        }
    }

    pub fn implicit(capability: impl Into<String>, action: ImplicitAction) -> Self {
        Self {
            capability: capability.into(),
            kind: Some(FeedbackKind::ImplicitUsage),
            action: Some(action),
            ..Default::default()
        }
    }

    /// Infer the kind when the caller left it out.
    pub fn resolved_kind(&self) -> FeedbackKind {
        match self.kind {
            Some(kind) => kind,
            None if self.correction.is_some() => FeedbackKind::ExplicitCorrection,
            None if self.action.is_some() => FeedbackKind::ImplicitUsage,
            None => FeedbackKind::ExplicitRating,
        }
    }

    /// Validate the submission and derive its numeric rating.
    pub fn derive_rating(&self) -> Result<f64> {
        if self.capability.trim().is_empty() {
            return Err(ConductorError::InvalidFeedback(
                "capability must not be empty".into(),
            ));
        }
        if let Some(r) = self.rating {
            if !r.is_finite() || !(MIN_RATING..=MAX_RATING).contains(&r) {
                return Err(ConductorError::InvalidFeedback(format!(
                    "rating {} outside [{}, {}]",
                    r, MIN_RATING, MAX_RATING
                )));
            }
        }

        match self.resolved_kind() {
            FeedbackKind::ExplicitRating => self.rating.ok_or_else(|| {
                ConductorError::InvalidFeedback("explicit rating requires a rating".into())
            }),
            FeedbackKind::ExplicitCorrection => {
                if self.correction.is_none() {
                    return Err(ConductorError::InvalidFeedback(
                        "correction feedback requires a corrected output".into(),
                    ));
                }
                Ok(self.rating.unwrap_or(MID_RATING))
            }
            FeedbackKind::ImplicitUsage => match (self.action, self.rating) {
                (Some(action), _) => Ok(action.rating()),
                (None, Some(r)) => Ok(r),
                (None, None) => Err(ConductorError::InvalidFeedback(
                    "implicit feedback requires an observed action".into(),
                )),
            },
        }
    }

    /// Turn the submission into a storable row.
    pub fn into_feedback(
        self,
        request_id: impl Into<String>,
        founder_id: impl Into<String>,
        workspace_id: impl Into<String>,
    ) -> Result<Feedback> {
        let rating = self.derive_rating()?;
        let kind = self.resolved_kind();
        Ok(Feedback {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.into(),
            capability: self.capability,
            kind,
            rating,
            correction: self.correction,
            founder_id: founder_id.into(),
            workspace_id: workspace_id.into(),
            created_at: Utc::now(),
        })
    }
}

/// Advisory routing hint derived from aggregated feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingPreference {
    pub founder_id: String,
    pub capability: String,
    pub avoid: bool,
    pub reason: String,
    pub confidence: f64,
    pub average_rating: f64,
    pub samples: usize,
    pub updated_at: DateTime<Utc>,
}

/// Labeled example captured from a correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExemplar {
    pub request_id: String,
    pub capability: String,
    pub founder_id: String,
    #[serde(default)]
    pub input: Option<Payload>,
    #[serde(default)]
    pub wrong_output: Option<Payload>,
    pub corrected_output: Payload,
    pub created_at: DateTime<Utc>,
}
