//! Feedback collection and routing-preference learning.
//!
//! Feedback rows are append-only. `refresh_preferences` folds a founder's
//! recent feedback into one advisory `RoutingPreference` per capability;
//! the executor only consults them for nodes that opt in.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use conductor_core::config::LearningConfig;
use conductor_core::error::Result;
use conductor_core::event::EventBus;
use conductor_core::feedback::{
    Feedback, FeedbackKind, RoutingPreference, TrainingExemplar, MAX_RATING, MIN_RATING,
};
use conductor_core::traits::FeedbackStore;
use conductor_core::types::{ExecutionEvent, NodeRecord};

/// Largest possible variance of ratings in [MIN_RATING, MAX_RATING].
const MAX_VARIANCE: f64 = (MAX_RATING - MIN_RATING) * (MAX_RATING - MIN_RATING) / 4.0;

/// Source of avoided capabilities consulted by the executor.
pub trait PreferenceSource: Send + Sync + 'static {
    fn avoided_capabilities(&self, founder_id: &str) -> BoxFuture<'_, HashSet<String>>;
}

pub struct LearningEngine {
    store: Arc<dyn FeedbackStore>,
    config: LearningConfig,
    cache: RwLock<HashMap<String, Vec<RoutingPreference>>>,
    events: Option<Arc<EventBus>>,
}

impl LearningEngine {
    pub fn new(store: Arc<dyn FeedbackStore>, config: LearningConfig) -> Self {
        Self {
            store,
            config,
            cache: RwLock::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &LearningConfig {
        &self.config
    }

    /// Record one feedback row.
    ///
    /// Returns `false` when a row for the same (request, capability, kind)
    /// already exists; nothing is written in that case. Corrections are
    /// stored together with a training exemplar, using `origin` for the
    /// input and the output that was corrected.
    pub async fn record(&self, feedback: Feedback, origin: Option<&NodeRecord>) -> Result<bool> {
        let inserted = match (&feedback.kind, &feedback.correction) {
            (FeedbackKind::ExplicitCorrection, Some(corrected)) => {
                let exemplar = TrainingExemplar {
                    request_id: feedback.request_id.clone(),
                    capability: feedback.capability.clone(),
                    founder_id: feedback.founder_id.clone(),
                    input: origin.and_then(|n| n.input.clone()),
                    wrong_output: origin.and_then(|n| n.output.clone()),
                    corrected_output: corrected.clone(),
                    created_at: feedback.created_at,
                };
                self.store.append_correction(&feedback, &exemplar).await?
            }
            _ => self.store.append_feedback(&feedback).await?,
        };
        if !inserted {
            debug!(
                request_id = %feedback.request_id,
                capability = %feedback.capability,
                kind = feedback.kind.as_str(),
                "Duplicate feedback ignored"
            );
            return Ok(false);
        }

        info!(
            request_id = %feedback.request_id,
            founder_id = %feedback.founder_id,
            capability = %feedback.capability,
            kind = feedback.kind.as_str(),
            rating = feedback.rating,
            "Feedback recorded"
        );
        Ok(true)
    }

    /// Rebuild the preference set for one founder from the feedback window.
    pub async fn refresh_preferences(&self, founder_id: &str) -> Result<Vec<RoutingPreference>> {
        let since = Utc::now() - Duration::days(self.config.window_days);
        let rows = self.store.query_feedback(founder_id, None, since).await?;

        let mut by_capability: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for row in &rows {
            by_capability
                .entry(row.capability.clone())
                .or_default()
                .push(row.rating);
        }

        let now = Utc::now();
        let preferences: Vec<RoutingPreference> = by_capability
            .into_iter()
            .filter(|(_, ratings)| ratings.len() >= self.config.min_samples.max(1))
            .map(|(capability, ratings)| {
                let (average, variance) = mean_and_variance(&ratings);
                let avoid = average < self.config.avoid_below;
                let reason = if avoid {
                    format!(
                        "average rating {:.2} over {} samples is below {:.2}",
                        average,
                        ratings.len(),
                        self.config.avoid_below
                    )
                } else {
                    format!("average rating {:.2} over {} samples", average, ratings.len())
                };
                RoutingPreference {
                    founder_id: founder_id.to_string(),
                    capability,
                    avoid,
                    reason,
                    confidence: (1.0 - variance / MAX_VARIANCE).clamp(0.0, 1.0),
                    average_rating: average,
                    samples: ratings.len(),
                    updated_at: now,
                }
            })
            .collect();

        self.store.save_preferences(founder_id, &preferences).await?;
        self.cache
            .write()
            .await
            .insert(founder_id.to_string(), preferences.clone());

        let avoided: Vec<String> = preferences
            .iter()
            .filter(|p| p.avoid)
            .map(|p| p.capability.clone())
            .collect();
        info!(
            founder_id,
            feedback = rows.len(),
            preferences = preferences.len(),
            avoided = avoided.len(),
            "Routing preferences refreshed"
        );
        if let Some(events) = &self.events {
            events.publish(ExecutionEvent::PreferencesRefreshed {
                founder_id: founder_id.to_string(),
                avoided,
            });
        }
        Ok(preferences)
    }

    /// Refresh every founder with feedback. Returns how many succeeded.
    pub async fn refresh_all(&self) -> Result<usize> {
        let founders = self.store.list_founders().await?;
        let mut refreshed = 0;
        for founder in founders {
            match self.refresh_preferences(&founder).await {
                Ok(_) => refreshed += 1,
                Err(e) => warn!(founder_id = %founder, error = %e, "Preference refresh failed"),
            }
        }
        Ok(refreshed)
    }

    /// Current preferences for a founder, from cache or the store.
    pub async fn preferences(&self, founder_id: &str) -> Result<Vec<RoutingPreference>> {
        if let Some(cached) = self.cache.read().await.get(founder_id) {
            return Ok(cached.clone());
        }
        let loaded = self.store.load_preferences(founder_id).await?;
        self.cache
            .write()
            .await
            .insert(founder_id.to_string(), loaded.clone());
        Ok(loaded)
    }

    pub async fn exemplars(
        &self,
        founder_id: &str,
        capability: Option<&str>,
    ) -> Result<Vec<TrainingExemplar>> {
        self.store.list_exemplars(founder_id, capability).await
    }
}

impl PreferenceSource for LearningEngine {
    fn avoided_capabilities(&self, founder_id: &str) -> BoxFuture<'_, HashSet<String>> {
        let founder_id = founder_id.to_string();
        Box::pin(async move {
            match self.preferences(&founder_id).await {
                Ok(prefs) => prefs
                    .into_iter()
                    .filter(|p| p.avoid)
                    .map(|p| p.capability)
                    .collect(),
                Err(e) => {
                    warn!(founder_id = %founder_id, error = %e, "Could not load routing preferences");
                    HashSet::new()
                }
            }
        })
    }
}

/// Population mean and variance.
fn mean_and_variance(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance)
}
