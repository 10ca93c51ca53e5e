use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sqlx::PgPool;
use tracing::{info, warn};

use crate::aggregate::{self, CounterDelta};
use crate::catalog::Catalog;
use crate::db::{self, SUPER_ADMIN_ID};
use crate::error::PipelineError;
use crate::mapping::{self, ColumnMapping};
use crate::models::{Actor, ActorRole, RecordSummary, RiskLevel, UploadSummary};
use crate::reconcile;
use crate::scoring::{Prediction, ScoringGateway, ScoringRequestItem};
use crate::standardize::{standardize_rows, AliasResolver, CanonicalRecord};

/// One already-parsed spreadsheet: the file name plus its header→value
/// rows. Byte-level decoding stays at the CLI boundary.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub rows: Vec<HashMap<String, String>>,
}

/// Per-file result of a multi-file upload. Failures are isolated: one
/// bad file never blocks its siblings.
#[derive(Debug)]
pub struct UploadOutcome {
    pub file_name: String,
    pub result: Result<UploadSummary, PipelineError>,
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn open_csv(path: &Path, name: &str) -> Result<csv::Reader<std::fs::File>, PipelineError> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if extension != "csv" {
        return Err(PipelineError::UnsupportedFileFormat(name.to_string()));
    }
    csv::Reader::from_path(path)
        .map_err(|e| PipelineError::UnsupportedFileFormat(format!("{name}: {e}")))
}

/// Header row only, in file order, for drafting a column mapping.
pub fn read_headers(path: &Path) -> Result<Vec<String>, PipelineError> {
    let name = file_label(path);
    let mut reader = open_csv(path, &name)?;
    let headers = reader
        .headers()
        .map_err(|e| PipelineError::UnsupportedFileFormat(format!("{name}: {e}")))?
        .iter()
        .map(|h| h.to_string())
        .collect();
    Ok(headers)
}

/// Read one CSV into rows. Other extensions are rejected before any
/// parsing happens.
pub fn read_upload_file(path: &Path) -> Result<UploadFile, PipelineError> {
    let name = file_label(path);
    let mut reader = open_csv(path, &name)?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| PipelineError::UnsupportedFileFormat(format!("{name}: {e}")))?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| PipelineError::UnsupportedFileFormat(format!("{name}: {e}")))?;
        let row: HashMap<String, String> = headers
            .iter()
            .cloned()
            .zip(record.iter().map(|cell| cell.to_string()))
            .collect();
        rows.push(row);
    }

    Ok(UploadFile { name, rows })
}

/// Ingest a set of files on behalf of a mentor. Setup failures (unknown
/// mentor, no admin, catalog unreadable) abort the whole call; everything
/// after that is reported per file.
pub async fn ingest_files<G: ScoringGateway>(
    pool: &PgPool,
    gateway: &G,
    mentor_email: &str,
    paths: &[PathBuf],
) -> Result<Vec<UploadOutcome>, PipelineError> {
    let mentor = db::fetch_actor(pool, mentor_email)
        .await?
        .filter(|a| a.role == ActorRole::Mentor)
        .ok_or_else(|| PipelineError::UnknownActor(mentor_email.to_string()))?;
    let institute_id = mentor
        .institute_id
        .ok_or_else(|| PipelineError::UnknownActor(format!("{mentor_email} has no institute")))?;
    let admin = db::fetch_admin(pool, institute_id)
        .await?
        .ok_or_else(|| PipelineError::UnknownActor(format!("no admin for institute {institute_id}")))?;

    let catalog = Catalog::load(pool).await?;
    let column_mapping = mapping::fetch_mapping(pool, institute_id).await?;

    let mut outcomes = Vec::with_capacity(paths.len());
    for path in paths {
        let outcome = process_path(
            pool,
            gateway,
            &catalog,
            column_mapping.as_ref(),
            &mentor,
            &admin,
            path,
        )
        .await;

        let file_name = file_label(path);
        match &outcome {
            Ok(summary) => info!(
                file = %file_name,
                rows = summary.total_rows,
                successes = summary.success_events,
                "file ingested"
            ),
            Err(err) if err.is_skip() => warn!(file = %file_name, "empty file skipped"),
            Err(err) => warn!(file = %file_name, kind = err.kind(), error = %err, "file rejected"),
        }
        outcomes.push(UploadOutcome {
            file_name,
            result: outcome,
        });
    }

    Ok(outcomes)
}

async fn process_path<G: ScoringGateway>(
    pool: &PgPool,
    gateway: &G,
    catalog: &Catalog,
    column_mapping: Option<&ColumnMapping>,
    mentor: &Actor,
    admin: &Actor,
    path: &Path,
) -> Result<UploadSummary, PipelineError> {
    let file = read_upload_file(path)?;
    if file.rows.is_empty() {
        return Err(PipelineError::EmptyFile);
    }

    let resolver = match column_mapping {
        Some(mapping) => AliasResolver::from_mapping(&mapping.columns, catalog),
        None => AliasResolver::from_catalog(catalog),
    };
    let records = standardize_rows(&file.rows, &resolver, catalog)?;

    let items: Vec<ScoringRequestItem> = records
        .iter()
        .enumerate()
        .map(|(index, record)| ScoringRequestItem {
            // Unique correlation id even when a file repeats a roll id.
            id: format!("{index}:{}", record.roll_id),
            features: record.features.clone(),
        })
        .collect();

    info!(file = %file.name, rows = records.len(), "scoring batch");
    let predictions = gateway.predict(&items).await?;

    // One transaction per file; a duplicate-key race with a concurrent
    // upload gets a single retry before surfacing.
    let mut attempt = 0;
    loop {
        let result = apply_batch(pool, mentor, admin, &file.name, &records, &predictions).await;
        match result {
            Err(PipelineError::DuplicateStudent { ref roll_id }) if attempt == 0 => {
                attempt += 1;
                warn!(file = %file.name, roll_id = %roll_id, "duplicate key race, retrying file once");
            }
            other => return other,
        }
    }
}

async fn apply_batch(
    pool: &PgPool,
    mentor: &Actor,
    admin: &Actor,
    file_name: &str,
    records: &[CanonicalRecord],
    predictions: &[Prediction],
) -> Result<UploadSummary, PipelineError> {
    let institute_id = mentor
        .institute_id
        .ok_or_else(|| PipelineError::UnknownActor(format!("{} has no institute", mentor.email)))?;

    let mut tx = pool.begin().await?;
    let mut merged = CounterDelta::default();
    let mut summaries = Vec::with_capacity(records.len());

    for (record, prediction) in records.iter().zip(predictions) {
        let (summary, delta) =
            reconcile::reconcile_record(&mut tx, mentor, institute_id, record, prediction).await?;
        merged.merge(&delta);
        summaries.push(summary);
    }

    aggregate::apply_delta(&mut tx, &[mentor.id, admin.id, SUPER_ADMIN_ID], &merged).await?;
    tx.commit().await?;

    Ok(build_summary(file_name, summaries))
}

fn build_summary(file_name: &str, records: Vec<RecordSummary>) -> UploadSummary {
    let mut risk_high = 0;
    let mut risk_medium = 0;
    let mut risk_low = 0;
    let mut success_events = 0;

    for record in &records {
        match record.risk_level {
            RiskLevel::High => risk_high += 1,
            RiskLevel::Medium => risk_medium += 1,
            RiskLevel::Low => risk_low += 1,
        }
        if record.success_event {
            success_events += 1;
        }
    }

    UploadSummary {
        file_name: file_name.to_string(),
        total_rows: records.len(),
        risk_high,
        risk_medium,
        risk_low,
        success_events,
        records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(roll: &str, level: RiskLevel, success: bool) -> RecordSummary {
        RecordSummary {
            roll_id: roll.to_string(),
            risk_level: level,
            risk_score: 0.5,
            previous_risk_level: None,
            success_event: success,
            explanation: None,
            recommendation: None,
        }
    }

    #[test]
    fn summary_counts_risks_and_successes() {
        let summary = build_summary(
            "cohort.csv",
            vec![
                record("S1", RiskLevel::High, false),
                record("S2", RiskLevel::Low, true),
                record("S3", RiskLevel::Low, false),
                record("S4", RiskLevel::Medium, false),
            ],
        );

        assert_eq!(summary.total_rows, 4);
        assert_eq!(summary.risk_high, 1);
        assert_eq!(summary.risk_medium, 1);
        assert_eq!(summary.risk_low, 2);
        assert_eq!(summary.success_events, 1);
    }

    #[test]
    fn non_csv_extension_is_rejected_up_front() {
        let err = read_upload_file(Path::new("roster.xlsx")).expect_err("xlsx");
        assert_eq!(err.kind(), "UNSUPPORTED_FILE_FORMAT");
    }

    #[test]
    fn high_then_low_upload_flows_through_the_counters() {
        let catalog = Catalog::new(crate::catalog::default_fields());
        let resolver = AliasResolver::from_catalog(&catalog);
        let rows: Vec<HashMap<String, String>> = vec![[
            ("Student ID", "S1"),
            ("Student Name", "Avery Lee"),
            ("Attendance %", "40"),
            ("CGPA", "3.0"),
            ("Fees Paid", "no"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()];

        let records = standardize_rows(&rows, &resolver, &catalog).expect("standardize");
        assert_eq!(records[0].roll_id, "S1");
        assert_eq!(
            records[0].features.get("attendancePercentage"),
            Some(&serde_json::json!(40.0))
        );

        // First upload classifies S1 high: one new student at every tier.
        let mut tiers = CounterDelta::default();
        let created = reconcile::evaluate(None, RiskLevel::High);
        tiers.merge(&reconcile::outcome_delta(created, RiskLevel::High));
        assert_eq!(tiers.high, 1);
        assert_eq!(tiers.success, 0);

        // Re-upload scores S1 low: the risk moves and a success event fires.
        let improved = reconcile::evaluate(Some(RiskLevel::High), RiskLevel::Low);
        tiers.merge(&reconcile::outcome_delta(improved, RiskLevel::Low));
        assert_eq!(tiers.high, 0);
        assert_eq!(tiers.low, 1);
        assert_eq!(tiers.success, 1);
    }
}
