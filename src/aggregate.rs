use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, PgTx, SUPER_ADMIN_ID};
use crate::error::PipelineError;
use crate::models::{ActorRole, CounterSnapshot, RiskLevel};

/// Signed counter change produced by reconciliation. Deltas merge across
/// a whole upload batch and apply in the same transaction as the student
/// writes that caused them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub high: i64,
    pub medium: i64,
    pub low: i64,
    pub success: i64,
}

impl CounterDelta {
    pub fn risk(level: RiskLevel, amount: i64) -> Self {
        let mut delta = CounterDelta::default();
        delta.bump(level, amount);
        delta
    }

    pub fn bump(&mut self, level: RiskLevel, amount: i64) {
        match level {
            RiskLevel::High => self.high += amount,
            RiskLevel::Medium => self.medium += amount,
            RiskLevel::Low => self.low += amount,
        }
    }

    pub fn merge(&mut self, other: &CounterDelta) {
        self.high += other.high;
        self.medium += other.medium;
        self.low += other.low;
        self.success += other.success;
    }

    pub fn is_zero(&self) -> bool {
        *self == CounterDelta::default()
    }

    /// The negation of an actor's full risk/success snapshot, used to
    /// back a deleted child's contribution out of its parents.
    pub fn subtracting(snapshot: &CounterSnapshot) -> Self {
        CounterDelta {
            high: -snapshot.risk_high,
            medium: -snapshot.risk_medium,
            low: -snapshot.risk_low,
            success: -snapshot.success,
        }
    }
}

/// Parent counter adjustment for an active-flag change. `None` when the
/// flag did not actually change, so re-submitting the current status is
/// a guaranteed no-op.
pub fn flip_adjustment(was_active: bool, now_active: bool) -> Option<(i64, i64)> {
    match (was_active, now_active) {
        (false, true) => Some((1, -1)),
        (true, false) => Some((-1, 1)),
        _ => None,
    }
}

/// Apply one merged delta to every tier in scope, in a fixed order
/// (mentor, admin, super admin) inside the caller's transaction. A
/// missing actor row aborts the transaction rather than dropping a tier.
pub async fn apply_delta(
    tx: &mut PgTx<'_>,
    actor_ids: &[Uuid],
    delta: &CounterDelta,
) -> Result<(), PipelineError> {
    if delta.is_zero() {
        return Ok(());
    }

    for actor_id in actor_ids {
        let updated = sqlx::query(
            "UPDATE futureguard.actors \
             SET risk_high = risk_high + $1, risk_medium = risk_medium + $2, \
                 risk_low = risk_low + $3, success_count = success_count + $4 \
             WHERE id = $5",
        )
        .bind(delta.high)
        .bind(delta.medium)
        .bind(delta.low)
        .bind(delta.success)
        .bind(actor_id)
        .execute(&mut **tx)
        .await?;

        if updated.rows_affected() != 1 {
            return Err(PipelineError::UnknownActor(actor_id.to_string()));
        }
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub struct MentorRemoval {
    pub mentor_email: String,
    pub students_removed: u64,
    pub counters_subtracted: CounterSnapshot,
}

/// Delete a mentor and back its entire contribution out of the admin and
/// super admin counters, all in one transaction.
pub async fn remove_mentor(pool: &PgPool, email: &str) -> Result<MentorRemoval, PipelineError> {
    let mut tx = pool.begin().await?;

    let mentor = db::fetch_actor_tx(&mut tx, email)
        .await?
        .filter(|a| a.role == ActorRole::Mentor)
        .ok_or_else(|| PipelineError::UnknownActor(email.to_string()))?;
    let institute_id = mentor
        .institute_id
        .ok_or_else(|| PipelineError::UnknownActor(format!("{email} has no institute")))?;
    let admin = db::fetch_admin_tx(&mut tx, institute_id)
        .await?
        .ok_or_else(|| PipelineError::UnknownActor(format!("no admin for institute {institute_id}")))?;

    let subtraction = CounterDelta::subtracting(&mentor.counters);
    apply_delta(&mut tx, &[admin.id, SUPER_ADMIN_ID], &subtraction).await?;

    let (active_delta, inactive_delta): (i64, i64) =
        if mentor.active { (-1, 0) } else { (0, -1) };
    sqlx::query(
        "UPDATE futureguard.actors \
         SET mentors_active = mentors_active + $1, mentors_inactive = mentors_inactive + $2 \
         WHERE id = $3",
    )
    .bind(active_delta)
    .bind(inactive_delta)
    .bind(admin.id)
    .execute(&mut *tx)
    .await?;

    let students_removed = sqlx::query("DELETE FROM futureguard.students WHERE mentor_id = $1")
        .bind(mentor.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    sqlx::query("DELETE FROM futureguard.actors WHERE id = $1")
        .bind(mentor.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    info!(
        mentor = email,
        students_removed, "mentor removed, counters corrected"
    );

    Ok(MentorRemoval {
        mentor_email: mentor.email,
        students_removed,
        counters_subtracted: mentor.counters,
    })
}

#[derive(Debug, Clone)]
pub struct InstituteRemoval {
    pub institute_name: String,
    pub students_removed: u64,
    pub actors_removed: u64,
}

/// Delete an institute with all of its actors and students, backing the
/// admin's counter snapshot out of the super admin.
pub async fn remove_institute(
    pool: &PgPool,
    name: &str,
) -> Result<InstituteRemoval, PipelineError> {
    let mut tx = pool.begin().await?;

    let institute = db::fetch_institute_tx(&mut tx, name)
        .await?
        .ok_or_else(|| PipelineError::UnknownActor(format!("institute {name}")))?;

    if let Some(admin) = db::fetch_admin_tx(&mut tx, institute.id).await? {
        let subtraction = CounterDelta::subtracting(&admin.counters);
        apply_delta(&mut tx, &[SUPER_ADMIN_ID], &subtraction).await?;
    } else {
        warn!(institute = name, "removing institute without an admin");
    }

    let (active_delta, inactive_delta): (i64, i64) =
        if institute.active { (-1, 0) } else { (0, -1) };
    sqlx::query(
        "UPDATE futureguard.actors \
         SET institutes_active = institutes_active + $1, institutes_inactive = institutes_inactive + $2 \
         WHERE id = $3",
    )
    .bind(active_delta)
    .bind(inactive_delta)
    .bind(SUPER_ADMIN_ID)
    .execute(&mut *tx)
    .await?;

    let students_removed = sqlx::query("DELETE FROM futureguard.students WHERE institute_id = $1")
        .bind(institute.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    let actors_removed = sqlx::query("DELETE FROM futureguard.actors WHERE institute_id = $1")
        .bind(institute.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    // column_mappings rows go with the institute via ON DELETE CASCADE.
    sqlx::query("DELETE FROM futureguard.institutes WHERE id = $1")
        .bind(institute.id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    info!(
        institute = name,
        students_removed, actors_removed, "institute removed, counters corrected"
    );

    Ok(InstituteRemoval {
        institute_name: institute.name,
        students_removed,
        actors_removed,
    })
}

/// Flip a mentor's active flag. Returns `false` without touching any
/// counter when the flag already has the requested value.
pub async fn set_mentor_active(
    pool: &PgPool,
    email: &str,
    active: bool,
) -> Result<bool, PipelineError> {
    let mut tx = pool.begin().await?;

    let mentor = db::fetch_actor_tx(&mut tx, email)
        .await?
        .filter(|a| a.role == ActorRole::Mentor)
        .ok_or_else(|| PipelineError::UnknownActor(email.to_string()))?;

    let Some((active_delta, inactive_delta)) = flip_adjustment(mentor.active, active) else {
        return Ok(false);
    };

    let institute_id = mentor
        .institute_id
        .ok_or_else(|| PipelineError::UnknownActor(format!("{email} has no institute")))?;
    let admin = db::fetch_admin_tx(&mut tx, institute_id)
        .await?
        .ok_or_else(|| PipelineError::UnknownActor(format!("no admin for institute {institute_id}")))?;

    sqlx::query("UPDATE futureguard.actors SET active = $1 WHERE id = $2")
        .bind(active)
        .bind(mentor.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "UPDATE futureguard.actors \
         SET mentors_active = mentors_active + $1, mentors_inactive = mentors_inactive + $2 \
         WHERE id = $3",
    )
    .bind(active_delta)
    .bind(inactive_delta)
    .bind(admin.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Flip an institute's active flag against the super admin's rollup,
/// with the same no-op guard.
pub async fn set_institute_active(
    pool: &PgPool,
    name: &str,
    active: bool,
) -> Result<bool, PipelineError> {
    let mut tx = pool.begin().await?;

    let institute = db::fetch_institute_tx(&mut tx, name)
        .await?
        .ok_or_else(|| PipelineError::UnknownActor(format!("institute {name}")))?;

    let Some((active_delta, inactive_delta)) = flip_adjustment(institute.active, active) else {
        return Ok(false);
    };

    sqlx::query("UPDATE futureguard.institutes SET active = $1 WHERE id = $2")
        .bind(active)
        .bind(institute.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "UPDATE futureguard.actors \
         SET institutes_active = institutes_active + $1, institutes_inactive = institutes_inactive + $2 \
         WHERE id = $3",
    )
    .bind(active_delta)
    .bind(inactive_delta)
    .bind(SUPER_ADMIN_ID)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_merge_componentwise() {
        let mut batch = CounterDelta::default();
        batch.merge(&CounterDelta::risk(RiskLevel::High, 1));
        let mut improved = CounterDelta::risk(RiskLevel::High, -1);
        improved.bump(RiskLevel::Low, 1);
        improved.success += 1;
        batch.merge(&improved);

        assert_eq!(
            batch,
            CounterDelta {
                high: 0,
                medium: 0,
                low: 1,
                success: 1,
            }
        );
        assert!(!batch.is_zero());
    }

    #[test]
    fn batch_of_offsetting_transitions_collapses_to_zero() {
        let mut batch = CounterDelta::default();
        let mut up = CounterDelta::risk(RiskLevel::Low, -1);
        up.bump(RiskLevel::High, 1);
        let mut down = CounterDelta::risk(RiskLevel::High, -1);
        down.bump(RiskLevel::Low, 1);
        batch.merge(&up);
        batch.merge(&down);
        assert!(batch.is_zero());
    }

    #[test]
    fn subtracting_negates_the_snapshot() {
        let snapshot = CounterSnapshot {
            risk_high: 4,
            risk_medium: 2,
            risk_low: 7,
            success: 3,
            ..CounterSnapshot::default()
        };
        let delta = CounterDelta::subtracting(&snapshot);
        assert_eq!(delta.high, -4);
        assert_eq!(delta.medium, -2);
        assert_eq!(delta.low, -7);
        assert_eq!(delta.success, -3);
    }

    #[test]
    fn flip_adjustment_is_idempotent_on_no_change() {
        assert_eq!(flip_adjustment(true, true), None);
        assert_eq!(flip_adjustment(false, false), None);
        assert_eq!(flip_adjustment(false, true), Some((1, -1)));
        assert_eq!(flip_adjustment(true, false), Some((-1, 1)));
    }
}
