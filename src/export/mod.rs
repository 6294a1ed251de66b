//! CSV export of attempt history and poll samples
//!
//! One row per attempt or sample, flattened with the run id and target
//! fields so the files can be analysed without the run context.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::scheduler::RunStatus;

/// Flattened attempt record
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRow {
    pub run_id: Uuid,
    pub date: String,
    pub pavilion_id: String,
    pub event_code: String,
    pub channel: u8,
    pub start_time: String,
    pub sequence: u32,
    pub http_status: Option<u16>,
    pub outcome: &'static str,
    pub latency_ms: u64,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Flattened poll sample
#[derive(Debug, Clone, Serialize)]
pub struct SampleRow {
    pub run_id: Uuid,
    pub date: String,
    pub pavilion_id: String,
    pub event_code: String,
    pub channel: u8,
    pub slot_time: Option<String>,
    pub status: &'static str,
    pub capacity: Option<u32>,
    pub http_status: Option<u16>,
    pub timestamp: DateTime<Utc>,
}

pub fn attempt_rows(runs: &[RunStatus]) -> Vec<AttemptRow> {
    runs.iter()
        .flat_map(|run| {
            run.attempts.iter().map(move |attempt| AttemptRow {
                run_id: run.run_id,
                date: run.target.entrance_date(),
                pavilion_id: run.target.pavilion_id.clone(),
                event_code: run.target.event_code.clone(),
                channel: run.target.channel,
                start_time: attempt.start_time.as_hhmm(),
                sequence: attempt.sequence,
                http_status: attempt.http_status,
                outcome: attempt.outcome.as_str(),
                latency_ms: attempt.latency_ms,
                detail: attempt.detail.clone(),
                timestamp: attempt.timestamp,
            })
        })
        .collect()
}

pub fn sample_rows(runs: &[RunStatus]) -> Vec<SampleRow> {
    runs.iter()
        .flat_map(|run| {
            run.samples.iter().map(move |sample| SampleRow {
                run_id: run.run_id,
                date: run.target.entrance_date(),
                pavilion_id: run.target.pavilion_id.clone(),
                event_code: run.target.event_code.clone(),
                channel: run.target.channel,
                slot_time: sample.slot_time.map(|s| s.as_hhmm()),
                status: sample.status.as_str(),
                capacity: sample.capacity,
                http_status: sample.http_status,
                timestamp: sample.timestamp,
            })
        })
        .collect()
}

fn write_rows<W: Write, R: Serialize>(writer: W, rows: &[R]) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for row in rows {
        csv_writer.serialize(row)?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Write every attempt of `runs` as CSV
pub fn write_attempts_csv<W: Write>(writer: W, runs: &[RunStatus]) -> Result<usize> {
    let rows = attempt_rows(runs);
    write_rows(writer, &rows)?;
    Ok(rows.len())
}

/// Write every retained poll sample of `runs` as CSV
pub fn write_samples_csv<W: Write>(writer: W, runs: &[RunStatus]) -> Result<usize> {
    let rows = sample_rows(runs);
    write_rows(writer, &rows)?;
    Ok(rows.len())
}

/// Render attempts to an in-memory CSV string
pub fn attempts_csv_string(runs: &[RunStatus]) -> Result<String> {
    let mut buffer = Vec::new();
    write_attempts_csv(&mut buffer, runs)?;
    String::from_utf8(buffer).map_err(|e| Error::with_source("attempt CSV is not UTF-8", e))
}

/// Render samples to an in-memory CSV string
pub fn samples_csv_string(runs: &[RunStatus]) -> Result<String> {
    let mut buffer = Vec::new();
    write_samples_csv(&mut buffer, runs)?;
    String::from_utf8(buffer).map_err(|e| Error::with_source("sample CSV is not UTF-8", e))
}

/// Write attempts to `path`, creating parent directories
pub fn export_attempts_to_file(path: &Path, runs: &[RunStatus]) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let written = write_attempts_csv(file, runs)?;
    tracing::info!(path = %path.display(), rows = written, "Exported attempt history");
    Ok(written)
}

/// Write samples to `path`, creating parent directories
pub fn export_samples_to_file(path: &Path, runs: &[RunStatus]) -> Result<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let written = write_samples_csv(file, runs)?;
    tracing::info!(path = %path.display(), rows = written, "Exported poll samples");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AttemptOutcome, AttemptRecord, PollSample, PollStatus, Target, TriggerMode, WindowPolicy,
    };
    use chrono::NaiveDate;

    fn run() -> RunStatus {
        let target = Target {
            pavilion_id: "H1H9".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 10, 13).unwrap(),
            event_code: "H1H9".to_string(),
            channel: 5,
            scheduled_instant: None,
            ticket_ids: vec!["T1".to_string()],
            start_time: Some("1845".parse().unwrap()),
        };
        let mut status = RunStatus::new(
            Uuid::nil(),
            target,
            TriggerMode::OnAvailability,
            WindowPolicy::Unbounded,
            500,
            None,
            Utc::now(),
        );
        status.record_sample(
            PollSample {
                timestamp: Utc::now(),
                target: status.key.clone(),
                status: PollStatus::Limited,
                slot_time: Some("1845".parse().unwrap()),
                capacity: Some(2),
                http_status: Some(200),
                error: None,
            },
            10,
        );
        for (sequence, outcome) in [(1, AttemptOutcome::SlotTaken), (2, AttemptOutcome::Success)] {
            let record = AttemptRecord {
                sequence,
                timestamp: Utc::now(),
                target: status.key.clone(),
                start_time: "1835".parse().unwrap(),
                http_status: Some(if sequence == 1 { 422 } else { 200 }),
                outcome,
                detail: None,
                latency_ms: 42,
            };
            status.record_attempt(record);
        }
        status
    }

    #[test]
    fn test_attempts_csv_has_header_and_rows() {
        let csv = attempts_csv_string(&[run()]).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "run_id,date,pavilion_id,event_code,channel,start_time,sequence,http_status,outcome,latency_ms,detail,timestamp"
        );
        let first = lines.next().unwrap();
        assert!(first.contains(",20251013,H1H9,H1H9,5,1835,1,422,SLOT_TAKEN,42,,"));
        assert!(lines.next().unwrap().contains("SUCCESS"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_samples_csv_rows() {
        let csv = samples_csv_string(&[run()]).unwrap();
        let row = csv.lines().nth(1).unwrap();
        assert!(row.contains(",1845,LIMITED,2,200,"));
    }

    #[test]
    fn test_export_to_file_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/attempts.csv");
        assert_eq!(export_attempts_to_file(&path, &[run()]).unwrap(), 2);
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("run_id,"));
    }

    #[test]
    fn test_empty_export_writes_nothing() {
        assert_eq!(attempts_csv_string(&[]).unwrap(), "");
    }
}
