//! Per-pavilion slot label adjustments
//!
//! The availability feed and the reservation endpoint do not always agree on
//! a slot's label: some pavilions expect a start time a few minutes earlier
//! than the feed reports. Offsets live in a JSON map of pavilion id to
//! minutes and are applied to the slot before it is submitted.
//!
//! [`calibrate`] finds an offset by probing the reservation endpoint: a
//! SLOT_TAKEN answer (HTTP 422) means the label is valid, a PARAMETER_ERROR
//! means it is not.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::{ReservationEndpoint, ReservationPayload};
use crate::error::{Error, Result};
use crate::models::{AttemptOutcome, Session, SlotTime, Target};
use crate::submission::classify_response;

/// Minute offsets keyed by pavilion id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotAdjustments {
    offsets: BTreeMap<String, i32>,
}

impl SlotAdjustments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load offsets from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::with_source(format!("reading adjustments {}", path.display()), e)
        })?;
        let adjustments: Self = serde_json::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            pavilions = adjustments.offsets.len(),
            "Loaded slot adjustments"
        );
        Ok(adjustments)
    }

    /// Load offsets when a path is configured, empty when the file is absent
    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            Some(path) => {
                tracing::warn!(path = %path.display(), "Adjustment file not found, using none");
                Ok(Self::new())
            }
            None => Ok(Self::new()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn set(&mut self, pavilion_id: impl Into<String>, minutes: i32) {
        self.offsets.insert(pavilion_id.into(), minutes);
    }

    pub fn offset_for(&self, pavilion_id: &str) -> i32 {
        self.offsets.get(pavilion_id).copied().unwrap_or(0)
    }

    /// Slot label to submit for a feed slot
    pub fn apply(&self, pavilion_id: &str, slot: SlotTime) -> SlotTime {
        let offset = self.offset_for(pavilion_id);
        if offset != 0 {
            tracing::debug!(
                pavilion = pavilion_id,
                from = %slot,
                offset_minutes = offset,
                "Adjusting slot time"
            );
        }
        slot.shift_minutes(offset)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

// ============================================================================
// Calibration
// ============================================================================

/// Outcome of probing one pavilion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalibrationReport {
    pub pavilion_id: String,
    pub base_slot: SlotTime,
    /// Offsets tried in order with their outcome
    pub tried: Vec<(i32, AttemptOutcome)>,
    /// First offset that produced SLOT_TAKEN
    pub confirmed_offset: Option<i32>,
}

impl CalibrationReport {
    /// Offset to store: the confirmed one, or zero
    pub fn offset(&self) -> i32 {
        self.confirmed_offset.unwrap_or(0)
    }
}

/// Calibration probe settings
#[derive(Debug, Clone)]
pub struct CalibrationSettings {
    /// Largest backwards shift tried, in minutes
    pub max_minutes: i32,
    pub step_minutes: i32,
    /// Pause after a rejected label
    pub rejected_delay: Duration,
    /// Pause after an unexpected answer
    pub unexpected_delay: Duration,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            max_minutes: 30,
            step_minutes: 5,
            rejected_delay: Duration::from_millis(500),
            unexpected_delay: Duration::from_secs(1),
        }
    }
}

/// Probe shifts of 0, -step, ... -max minutes until one is accepted as valid
pub async fn calibrate(
    endpoint: &dyn ReservationEndpoint,
    target: &Target,
    base_slot: SlotTime,
    session: &Session,
    settings: &CalibrationSettings,
) -> CalibrationReport {
    let mut report = CalibrationReport {
        pavilion_id: target.pavilion_id.clone(),
        base_slot,
        tried: Vec::new(),
        confirmed_offset: None,
    };

    let step = settings.step_minutes.max(1);
    let mut shift = 0;
    while shift <= settings.max_minutes {
        let offset = -shift;
        let slot = base_slot.shift_minutes(offset);
        let payload = ReservationPayload::for_target(target, slot);

        let outcome = match endpoint.post_reservation(&payload, session).await {
            Ok(response) => classify_response(response.status, &response.body).0,
            Err(e) => {
                tracing::warn!(error = %e, slot = %slot, "Calibration probe failed");
                AttemptOutcome::NetworkError
            }
        };
        tracing::info!(
            pavilion = %target.pavilion_id,
            slot = %slot,
            offset_minutes = offset,
            outcome = %outcome,
            "Calibration probe"
        );
        report.tried.push((offset, outcome));

        match outcome {
            AttemptOutcome::SlotTaken | AttemptOutcome::Success => {
                report.confirmed_offset = Some(offset);
                return report;
            }
            AttemptOutcome::ParameterError => tokio::time::sleep(settings.rejected_delay).await,
            _ => tokio::time::sleep(settings.unexpected_delay).await,
        }

        shift += step;
    }

    tracing::warn!(
        pavilion = %target.pavilion_id,
        max_minutes = settings.max_minutes,
        "No valid slot label found, keeping zero offset"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{FetchError, RawResponse};
    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};
    use std::sync::Mutex;

    /// Accepts only one start time as a valid label
    struct LabelEndpoint {
        valid: &'static str,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ReservationEndpoint for LabelEndpoint {
        async fn post_reservation(
            &self,
            payload: &ReservationPayload,
            _session: &Session,
        ) -> std::result::Result<RawResponse, FetchError> {
            self.seen.lock().unwrap().push(payload.start_time.clone());
            if payload.start_time == self.valid {
                Ok(RawResponse::new(422, r#"{"error":{"name":"unavailable"}}"#))
            } else {
                Ok(RawResponse::new(400, r#"{"error":{"name":"invalid_parameter"}}"#))
            }
        }
    }

    fn target() -> Target {
        Target {
            pavilion_id: "H1H9".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 10, 13).unwrap(),
            event_code: "H1H9".to_string(),
            channel: 5,
            scheduled_instant: None,
            ticket_ids: vec!["T1".to_string()],
            start_time: None,
        }
    }

    fn session() -> Session {
        Session {
            token: "session_id=abc".to_string(),
            issued_at: Utc::now(),
            estimated_expiry: Utc::now(),
            generation: 1,
        }
    }

    #[test]
    fn test_apply_offsets() {
        let mut adjustments = SlotAdjustments::new();
        adjustments.set("H1H9", -10);

        let slot: SlotTime = "1845".parse().unwrap();
        assert_eq!(adjustments.apply("H1H9", slot).as_hhmm(), "1835");
        assert_eq!(adjustments.apply("C7R0", slot).as_hhmm(), "1845");
    }

    #[test]
    fn test_load_and_save_json_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adjustments.json");
        std::fs::write(&path, r#"{"H1H9": -10, "C7R0": -5}"#).unwrap();

        let adjustments = SlotAdjustments::load(&path).unwrap();
        assert_eq!(adjustments.len(), 2);
        assert_eq!(adjustments.offset_for("C7R0"), -5);

        let copy = dir.path().join("copy.json");
        adjustments.save(&copy).unwrap();
        assert_eq!(SlotAdjustments::load(&copy).unwrap(), adjustments);
    }

    #[test]
    fn test_missing_optional_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.json");
        assert!(SlotAdjustments::load_optional(Some(&missing)).unwrap().is_empty());
        assert!(SlotAdjustments::load_optional(None).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibrate_finds_first_valid_label() {
        let endpoint = LabelEndpoint {
            valid: "1835",
            seen: Mutex::new(Vec::new()),
        };
        let report = calibrate(
            &endpoint,
            &target(),
            "1845".parse().unwrap(),
            &session(),
            &CalibrationSettings::default(),
        )
        .await;

        assert_eq!(report.confirmed_offset, Some(-10));
        assert_eq!(*endpoint.seen.lock().unwrap(), vec!["1845", "1840", "1835"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibrate_gives_up_after_max_shift() {
        let endpoint = LabelEndpoint {
            valid: "0000",
            seen: Mutex::new(Vec::new()),
        };
        let report = calibrate(
            &endpoint,
            &target(),
            "1845".parse().unwrap(),
            &session(),
            &CalibrationSettings::default(),
        )
        .await;

        assert_eq!(report.confirmed_offset, None);
        assert_eq!(report.offset(), 0);
        assert_eq!(report.tried.len(), 7);
    }
}
