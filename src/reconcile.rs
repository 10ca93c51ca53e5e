use sqlx::Row;
use uuid::Uuid;

use crate::aggregate::CounterDelta;
use crate::catalog::METADATA_VERSION;
use crate::db::PgTx;
use crate::error::PipelineError;
use crate::models::{Actor, RecordSummary, RiskLevel};
use crate::scoring::Prediction;
use crate::standardize::CanonicalRecord;

/// Result of classifying one record against the student's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// First sighting of this roll id under the institute.
    Created,
    /// Same risk level as before; only the canonical input refreshes.
    Unchanged,
    /// Risk level moved. `success` fires only on an improving move to
    /// low from a worse level, at the moment of that move.
    Moved { from: RiskLevel, success: bool },
}

pub fn evaluate(current: Option<RiskLevel>, incoming: RiskLevel) -> Outcome {
    match current {
        None => Outcome::Created,
        Some(level) if level == incoming => Outcome::Unchanged,
        Some(level) => Outcome::Moved {
            from: level,
            success: matches!(level, RiskLevel::High | RiskLevel::Medium)
                && incoming == RiskLevel::Low,
        },
    }
}

/// Signed counter change implied by one outcome.
pub fn outcome_delta(outcome: Outcome, incoming: RiskLevel) -> CounterDelta {
    match outcome {
        Outcome::Created => CounterDelta::risk(incoming, 1),
        Outcome::Unchanged => CounterDelta::default(),
        Outcome::Moved { from, success } => {
            let mut delta = CounterDelta::risk(from, -1);
            delta.bump(incoming, 1);
            if success {
                delta.success += 1;
            }
            delta
        }
    }
}

/// Resolve one classified record against the store inside the batch
/// transaction: look the student up with a row lock, create or update it,
/// and report the counter delta the caller must apply in the same
/// transaction.
pub async fn reconcile_record(
    tx: &mut PgTx<'_>,
    mentor: &Actor,
    institute_id: Uuid,
    record: &CanonicalRecord,
    prediction: &Prediction,
) -> Result<(RecordSummary, CounterDelta), PipelineError> {
    let existing = sqlx::query(
        "SELECT risk_level FROM futureguard.students \
         WHERE roll_id = $1 AND institute_id = $2 FOR UPDATE",
    )
    .bind(&record.roll_id)
    .bind(institute_id)
    .fetch_optional(&mut **tx)
    .await?;

    let current = match existing {
        Some(row) => {
            let raw: String = row.get("risk_level");
            Some(RiskLevel::parse(&raw).ok_or_else(|| {
                PipelineError::Database(sqlx::Error::Decode(
                    format!("unexpected risk_level {raw:?} for student {}", record.roll_id).into(),
                ))
            })?)
        }
        None => None,
    };

    let incoming = prediction.risk_label;
    let outcome = evaluate(current, incoming);

    match outcome {
        Outcome::Created => {
            let inserted = sqlx::query(
                "INSERT INTO futureguard.students \
                 (roll_id, institute_id, mentor_id, risk_level, previous_risk_level, success, \
                  standardized_input, metadata_version, last_updated_by) \
                 VALUES ($1, $2, $3, $4, NULL, FALSE, $5, $6, $7)",
            )
            .bind(&record.roll_id)
            .bind(institute_id)
            .bind(mentor.id)
            .bind(incoming.as_str())
            .bind(record.merged())
            .bind(METADATA_VERSION)
            .bind(mentor.id)
            .execute(&mut **tx)
            .await;

            if let Err(sqlx::Error::Database(db_err)) = &inserted {
                if db_err.is_unique_violation() {
                    return Err(PipelineError::DuplicateStudent {
                        roll_id: record.roll_id.clone(),
                    });
                }
            }
            inserted?;
        }
        Outcome::Unchanged => {
            sqlx::query(
                "UPDATE futureguard.students \
                 SET standardized_input = $3, metadata_version = $4, last_updated_by = $5, \
                     updated_at = now() \
                 WHERE roll_id = $1 AND institute_id = $2",
            )
            .bind(&record.roll_id)
            .bind(institute_id)
            .bind(record.merged())
            .bind(METADATA_VERSION)
            .bind(mentor.id)
            .execute(&mut **tx)
            .await?;
        }
        Outcome::Moved { from, success } => {
            sqlx::query(
                "UPDATE futureguard.students \
                 SET risk_level = $3, previous_risk_level = $4, success = $5, \
                     standardized_input = $6, metadata_version = $7, last_updated_by = $8, \
                     updated_at = now() \
                 WHERE roll_id = $1 AND institute_id = $2",
            )
            .bind(&record.roll_id)
            .bind(institute_id)
            .bind(incoming.as_str())
            .bind(from.as_str())
            .bind(success)
            .bind(record.merged())
            .bind(METADATA_VERSION)
            .bind(mentor.id)
            .execute(&mut **tx)
            .await?;
        }
    }

    let summary = RecordSummary {
        roll_id: record.roll_id.clone(),
        risk_level: incoming,
        risk_score: prediction.risk_score,
        previous_risk_level: match outcome {
            Outcome::Moved { from, .. } => Some(from),
            _ => None,
        },
        success_event: matches!(outcome, Outcome::Moved { success: true, .. }),
        explanation: prediction.explanation.clone(),
        recommendation: prediction.recommendation.clone(),
    };

    Ok((summary, outcome_delta(outcome, incoming)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_creates() {
        assert_eq!(evaluate(None, RiskLevel::High), Outcome::Created);
        let delta = outcome_delta(Outcome::Created, RiskLevel::High);
        assert_eq!(delta.high, 1);
        assert_eq!(delta.medium + delta.low + delta.success, 0);
    }

    #[test]
    fn unchanged_risk_emits_no_delta() {
        let outcome = evaluate(Some(RiskLevel::Medium), RiskLevel::Medium);
        assert_eq!(outcome, Outcome::Unchanged);
        assert!(outcome_delta(outcome, RiskLevel::Medium).is_zero());
    }

    #[test]
    fn improving_to_low_fires_success_once() {
        let outcome = evaluate(Some(RiskLevel::High), RiskLevel::Low);
        assert_eq!(
            outcome,
            Outcome::Moved {
                from: RiskLevel::High,
                success: true,
            }
        );
        let delta = outcome_delta(outcome, RiskLevel::Low);
        assert_eq!(delta.high, -1);
        assert_eq!(delta.low, 1);
        assert_eq!(delta.success, 1);
    }

    #[test]
    fn medium_to_low_is_also_a_success() {
        let outcome = evaluate(Some(RiskLevel::Medium), RiskLevel::Low);
        assert!(matches!(outcome, Outcome::Moved { success: true, .. }));
    }

    #[test]
    fn regressions_and_sideways_moves_are_not_successes() {
        for (from, to) in [
            (RiskLevel::Low, RiskLevel::High),
            (RiskLevel::Low, RiskLevel::Medium),
            (RiskLevel::Medium, RiskLevel::High),
            (RiskLevel::High, RiskLevel::Medium),
        ] {
            let outcome = evaluate(Some(from), to);
            assert!(
                matches!(outcome, Outcome::Moved { success: false, .. }),
                "{from} -> {to}"
            );
        }
    }

    #[test]
    fn success_fires_once_per_low_landing() {
        // high -> low -> high -> low: two distinct success events.
        let sequence = [RiskLevel::High, RiskLevel::Low, RiskLevel::High, RiskLevel::Low];
        let mut current: Option<RiskLevel> = None;
        let mut successes = 0;

        for incoming in sequence {
            match evaluate(current, incoming) {
                Outcome::Moved { success: true, .. } => successes += 1,
                _ => {}
            }
            current = Some(incoming);
        }

        assert_eq!(successes, 2);
    }

    #[test]
    fn regression_does_not_retract_counted_success() {
        let mut batch = CounterDelta::default();
        let improved = evaluate(Some(RiskLevel::High), RiskLevel::Low);
        batch.merge(&outcome_delta(improved, RiskLevel::Low));
        let regressed = evaluate(Some(RiskLevel::Low), RiskLevel::High);
        batch.merge(&outcome_delta(regressed, RiskLevel::High));

        assert_eq!(batch.success, 1);
        assert_eq!(batch.high, 0);
        assert_eq!(batch.low, 0);
    }
}
