use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use conductor_core::error::{ConductorError, Result};

use crate::learning::LearningEngine;

/// Rebuilds routing preferences for every founder on a cron schedule.
pub struct PreferenceRefresher {
    schedule: Schedule,
    learning: Arc<LearningEngine>,
    cancel: CancellationToken,
}

impl PreferenceRefresher {
    /// `expression` uses the six-field `cron` syntax (seconds first).
    pub fn new(
        expression: &str,
        learning: Arc<LearningEngine>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let schedule = Schedule::from_str(expression).map_err(|e| {
            ConductorError::Config(format!("invalid refresh schedule '{}': {}", expression, e))
        })?;
        info!(schedule = %expression, "Preference refresh scheduled");
        Ok(Self {
            schedule,
            learning,
            cancel,
        })
    }

    /// Run the refresh loop. Blocks until cancelled.
    pub async fn run(&self) {
        loop {
            let now = Utc::now();
            let Some(fire_at) = self.schedule.upcoming(Utc).next() else {
                warn!("Refresh schedule has no upcoming times, refresher idle");
                self.cancel.cancelled().await;
                break;
            };
            let delay = (fire_at - now).to_std().unwrap_or(Duration::from_secs(1));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    match self.learning.refresh_all().await {
                        Ok(founders) => info!(founders, "Routing preferences refreshed"),
                        Err(e) => error!(error = %e, "Preference refresh failed"),
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("Preference refresher shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::config::LearningConfig;
    use conductor_memory::InMemoryStore;

    fn engine() -> Arc<LearningEngine> {
        Arc::new(LearningEngine::new(
            Arc::new(InMemoryStore::new()),
            LearningConfig::default(),
        ))
    }

    #[test]
    fn test_invalid_schedule_rejected() {
        let err = PreferenceRefresher::new("every hour", engine(), CancellationToken::new())
            .err()
            .unwrap();
        assert!(matches!(err, ConductorError::Config(_)));
    }

    #[tokio::test]
    async fn test_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let refresher =
            PreferenceRefresher::new("0 0 * * * *", engine(), cancel.clone()).unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), refresher.run())
            .await
            .unwrap();
    }
}
