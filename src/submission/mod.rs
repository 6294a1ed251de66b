//! Single reservation submission
//!
//! [`SubmissionAttempt::fire`] sends exactly one POST and classifies the
//! answer. It never retries; retry cadence belongs to the scheduler. Every
//! failure resolves to an [`AttemptOutcome`], so nothing is propagated as an
//! error.
//!
//! Classification:
//!
//! | Response                                   | Outcome           |
//! |--------------------------------------------|-------------------|
//! | 2xx with `{}` or a reservation id list     | `SUCCESS`         |
//! | 409 / 422                                  | `SLOT_TAKEN`      |
//! | 409 / 422 naming an invalid parameter      | `PARAMETER_ERROR` |
//! | 400 and other 4xx                          | `PARAMETER_ERROR` |
//! | 401                                        | `AUTH_ERROR`      |
//! | 403, 429, 5xx, non-JSON 2xx, transport     | `NETWORK_ERROR`   |

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::adjust::SlotAdjustments;
use crate::client::{ReservationEndpoint, ReservationPayload};
use crate::clock::WallClock;
use crate::models::{AttemptOutcome, AttemptRecord, Session, SlotTime, Target};

/// Longest response excerpt kept on an attempt record
const DETAIL_LIMIT: usize = 200;

/// Fires one reservation POST per call
pub struct SubmissionAttempt {
    endpoint: Arc<dyn ReservationEndpoint>,
    adjustments: Arc<SlotAdjustments>,
    wall: Arc<dyn WallClock>,
}

impl SubmissionAttempt {
    pub fn new(
        endpoint: Arc<dyn ReservationEndpoint>,
        adjustments: Arc<SlotAdjustments>,
        wall: Arc<dyn WallClock>,
    ) -> Self {
        Self {
            endpoint,
            adjustments,
            wall,
        }
    }

    pub fn endpoint(&self) -> Arc<dyn ReservationEndpoint> {
        Arc::clone(&self.endpoint)
    }

    /// Payload for `slot` after the pavilion's adjustment
    pub fn build_payload(&self, target: &Target, slot: SlotTime) -> ReservationPayload {
        let submitted = self.adjustments.apply(&target.pavilion_id, slot);
        ReservationPayload::for_target(target, submitted)
    }

    /// Send one reservation request and classify the answer
    pub async fn fire(
        &self,
        target: &Target,
        slot: SlotTime,
        session: &Session,
        sequence: u32,
    ) -> AttemptRecord {
        let payload = self.build_payload(target, slot);
        let submitted: SlotTime = payload.start_time.parse().unwrap_or(slot);
        let timestamp = self.wall.now();
        let started = Instant::now();

        let (http_status, outcome, detail) =
            match self.endpoint.post_reservation(&payload, session).await {
                Ok(response) => {
                    let (outcome, detail) = classify_response(response.status, &response.body);
                    (Some(response.status), outcome, detail)
                }
                Err(e) => (None, AttemptOutcome::NetworkError, Some(e.to_string())),
            };

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            target = %target.key(),
            sequence,
            status = ?http_status,
            outcome = %outcome,
            latency_ms,
            "Reservation attempt"
        );

        AttemptRecord {
            sequence,
            timestamp,
            target: target.key(),
            start_time: submitted,
            http_status,
            outcome,
            detail,
            latency_ms,
        }
    }
}

/// Classify a reservation response into an outcome and a short detail
pub fn classify_response(status: u16, body: &str) -> (AttemptOutcome, Option<String>) {
    let json: Option<Value> = serde_json::from_str(body.trim()).ok();
    let detail = error_detail(json.as_ref()).or_else(|| excerpt(body));

    let outcome = match status {
        200..=299 => match &json {
            Some(value) if is_reservation_success(value) => AttemptOutcome::Success,
            Some(value) if value.get("error").is_some() => {
                if names_invalid_parameter(value) {
                    AttemptOutcome::ParameterError
                } else {
                    AttemptOutcome::SlotTaken
                }
            }
            // Anything else is not a confirmed reservation; keep firing
            Some(_) => AttemptOutcome::NetworkError,
            None if status == 204 && body.trim().is_empty() => AttemptOutcome::Success,
            None => AttemptOutcome::NetworkError,
        },
        401 => AttemptOutcome::AuthError,
        403 | 429 => AttemptOutcome::NetworkError,
        409 | 422 => match &json {
            Some(value) if names_invalid_parameter(value) => AttemptOutcome::ParameterError,
            _ => AttemptOutcome::SlotTaken,
        },
        400..=499 => AttemptOutcome::ParameterError,
        _ => AttemptOutcome::NetworkError,
    };

    let detail = match outcome {
        AttemptOutcome::Success => None,
        _ => detail,
    };
    (outcome, detail)
}

fn is_reservation_success(value: &Value) -> bool {
    match value {
        Value::Object(map) if map.is_empty() => true,
        Value::Object(map) => map
            .get("user_visiting_reservation_ids")
            .is_some_and(is_id_list),
        Value::Array(_) => is_id_list(value),
        _ => false,
    }
}

fn is_id_list(value: &Value) -> bool {
    match value {
        Value::Array(ids) => !ids.is_empty() && ids.iter().all(|id| id.is_u64() || id.is_string()),
        _ => false,
    }
}

fn error_code(value: &Value) -> Option<&str> {
    let error = value.get("error")?;
    error
        .as_str()
        .or_else(|| error.get("name").and_then(Value::as_str))
        .or_else(|| error.get("code").and_then(Value::as_str))
}

fn names_invalid_parameter(value: &Value) -> bool {
    error_code(value)
        .or_else(|| value.get("code").and_then(Value::as_str))
        .is_some_and(|code| {
            let code = code.to_ascii_lowercase();
            code.contains("invalid") || code.contains("parameter")
        })
}

fn error_detail(json: Option<&Value>) -> Option<String> {
    let value = json?;
    let code = error_code(value);
    let message = value
        .get("error")
        .and_then(|e| e.get("message"))
        .or_else(|| value.get("message"))
        .and_then(Value::as_str);

    match (code, message) {
        (Some(code), Some(message)) => Some(format!("{code}: {message}")),
        (Some(code), None) => Some(code.to_string()),
        (None, Some(message)) => Some(message.to_string()),
        (None, None) => None,
    }
}

fn excerpt(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(DETAIL_LIMIT).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_shapes() {
        assert_eq!(classify_response(200, "{}").0, AttemptOutcome::Success);
        assert_eq!(
            classify_response(200, r#"{"user_visiting_reservation_ids":[123]}"#).0,
            AttemptOutcome::Success
        );
        assert_eq!(classify_response(204, "").0, AttemptOutcome::Success);
        assert_eq!(classify_response(200, "[101, 102]").0, AttemptOutcome::Success);
        assert_eq!(classify_response(200, "{}").1, None);
    }

    #[test]
    fn test_unconfirmed_bodies_are_not_success() {
        for body in [
            "null",
            "[]",
            r#""queued""#,
            r#"{"message":"please retry later"}"#,
            r#"{"user_visiting_reservation_ids":[]}"#,
            "",
        ] {
            let (outcome, _) = classify_response(200, body);
            assert_eq!(outcome, AttemptOutcome::NetworkError, "body {body:?}");
        }
        assert_eq!(
            classify_response(200, r#"{"message":"please retry later"}"#).1.as_deref(),
            Some("please retry later")
        );
    }

    #[test]
    fn test_slot_taken() {
        let (outcome, detail) =
            classify_response(422, r#"{"error":{"name":"schedule_full","message":"満席"}}"#);
        assert_eq!(outcome, AttemptOutcome::SlotTaken);
        assert_eq!(detail.as_deref(), Some("schedule_full: 満席"));
        assert_eq!(classify_response(409, "").0, AttemptOutcome::SlotTaken);
    }

    #[test]
    fn test_parameter_errors() {
        assert_eq!(
            classify_response(400, r#"{"error":{"name":"invalid_parameter"}}"#).0,
            AttemptOutcome::ParameterError
        );
        assert_eq!(
            classify_response(422, r#"{"error":"invalid_parameter"}"#).0,
            AttemptOutcome::ParameterError
        );
        assert_eq!(classify_response(404, "not found").0, AttemptOutcome::ParameterError);
        assert_eq!(
            classify_response(200, r#"{"error":{"code":"INVALID_EVENT"}}"#).0,
            AttemptOutcome::ParameterError
        );
    }

    #[test]
    fn test_auth_and_network() {
        assert_eq!(classify_response(401, "").0, AttemptOutcome::AuthError);
        assert_eq!(classify_response(403, "<html>").0, AttemptOutcome::NetworkError);
        assert_eq!(classify_response(429, "").0, AttemptOutcome::NetworkError);
        assert_eq!(classify_response(503, "").0, AttemptOutcome::NetworkError);
        assert_eq!(
            classify_response(200, "<html>challenge</html>").0,
            AttemptOutcome::NetworkError
        );
    }

    #[test]
    fn test_detail_is_truncated() {
        let body = "x".repeat(1000);
        let (_, detail) = classify_response(500, &body);
        assert_eq!(detail.map(|d| d.len()), Some(DETAIL_LIMIT));
    }
}
