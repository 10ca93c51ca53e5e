use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::error::PipelineError;
use crate::models::{ActorRole, ColumnRule};

/// An institute's accepted column mapping. While `locked`, saves are
/// rejected until the super admin unlocks it.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    pub institute_id: Uuid,
    pub columns: Vec<ColumnRule>,
    pub locked: bool,
    pub updated_at: DateTime<Utc>,
}

pub async fn fetch_mapping(
    pool: &PgPool,
    institute_id: Uuid,
) -> Result<Option<ColumnMapping>, PipelineError> {
    let row = sqlx::query(
        "SELECT institute_id, columns, locked, updated_at \
         FROM futureguard.column_mappings WHERE institute_id = $1",
    )
    .bind(institute_id)
    .fetch_optional(pool)
    .await?;

    row.map(|row| {
        let columns: Vec<ColumnRule> = serde_json::from_value(row.get::<Value, _>("columns"))
            .map_err(|e| PipelineError::Database(sqlx::Error::Decode(e.into())))?;
        Ok(ColumnMapping {
            institute_id: row.get("institute_id"),
            columns,
            locked: row.get("locked"),
            updated_at: row.get("updated_at"),
        })
    })
    .transpose()
}

/// Drafting gate: a locked institute keeps even draft mappings out until
/// the super admin unlocks it.
pub async fn ensure_unlocked(pool: &PgPool, institute_id: Uuid) -> Result<(), PipelineError> {
    let locked = sqlx::query(
        "SELECT locked FROM futureguard.column_mappings WHERE institute_id = $1",
    )
    .bind(institute_id)
    .fetch_optional(pool)
    .await?
    .map(|row| row.get::<bool, _>("locked"))
    .unwrap_or(false);

    if locked {
        return Err(PipelineError::ConfigLocked(institute_id));
    }
    Ok(())
}

/// Catalog-required fields not covered by any accepted rule, by display
/// name.
pub fn required_coverage_gaps(rules: &[ColumnRule], catalog: &Catalog) -> Vec<String> {
    catalog
        .required_fields()
        .filter(|field| {
            !rules
                .iter()
                .any(|rule| rule.field_key.as_deref() == Some(field.field_key.as_str()))
        })
        .map(|field| field.display_name.clone())
        .collect()
}

/// Gate for saving a mapping. The lock check runs first so a locked
/// institute always fails with `CONFIG_LOCKED` regardless of payload.
fn check_save(
    institute_id: Uuid,
    locked: bool,
    rules: &[ColumnRule],
    catalog: &Catalog,
) -> Result<(), PipelineError> {
    if locked {
        return Err(PipelineError::ConfigLocked(institute_id));
    }
    let missing = required_coverage_gaps(rules, catalog);
    if !missing.is_empty() {
        return Err(PipelineError::RequiredFieldsMissing { row: None, missing });
    }
    Ok(())
}

/// Gate for lock/unlock requests: mentors hold no mapping authority and
/// only the super admin may unlock.
fn check_lock_authority(locked: bool, role: ActorRole) -> Result<(), PipelineError> {
    match role {
        ActorRole::Mentor => Err(PipelineError::Forbidden(
            "mentors cannot change mapping locks".to_string(),
        )),
        ActorRole::Admin if !locked => Err(PipelineError::Forbidden(
            "only the super admin can unlock a mapping".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Finalize a draft as the institute's mapping.
pub async fn save_mapping(
    pool: &PgPool,
    institute_id: Uuid,
    rules: &[ColumnRule],
    catalog: &Catalog,
) -> Result<(), PipelineError> {
    let mut tx = pool.begin().await?;

    let locked = sqlx::query(
        "SELECT locked FROM futureguard.column_mappings WHERE institute_id = $1 FOR UPDATE",
    )
    .bind(institute_id)
    .fetch_optional(&mut *tx)
    .await?
    .map(|row| row.get::<bool, _>("locked"))
    .unwrap_or(false);

    check_save(institute_id, locked, rules, catalog)?;

    let columns = serde_json::to_value(rules)
        .map_err(|e| PipelineError::Database(sqlx::Error::Decode(e.into())))?;

    sqlx::query(
        "INSERT INTO futureguard.column_mappings (institute_id, columns, locked, updated_at) \
         VALUES ($1, $2, FALSE, now()) \
         ON CONFLICT (institute_id) DO UPDATE \
         SET columns = EXCLUDED.columns, updated_at = now()",
    )
    .bind(institute_id)
    .bind(columns)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Lock or unlock an institute's mapping. Locking requires the required
/// fields to be fully mapped; unlocking a missing mapping is a no-op.
pub async fn set_lock(
    pool: &PgPool,
    institute_id: Uuid,
    locked: bool,
    actor_role: ActorRole,
    catalog: &Catalog,
) -> Result<(), PipelineError> {
    check_lock_authority(locked, actor_role)?;

    let mut tx = pool.begin().await?;

    let existing = sqlx::query(
        "SELECT columns FROM futureguard.column_mappings WHERE institute_id = $1 FOR UPDATE",
    )
    .bind(institute_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = existing else {
        if locked {
            return Err(PipelineError::RequiredFieldsMissing {
                row: None,
                missing: catalog
                    .required_fields()
                    .map(|f| f.display_name.clone())
                    .collect(),
            });
        }
        tx.commit().await?;
        return Ok(());
    };

    if locked {
        let rules: Vec<ColumnRule> = serde_json::from_value(row.get::<Value, _>("columns"))
            .map_err(|e| PipelineError::Database(sqlx::Error::Decode(e.into())))?;
        let missing = required_coverage_gaps(&rules, catalog);
        if !missing.is_empty() {
            return Err(PipelineError::RequiredFieldsMissing { row: None, missing });
        }
    }

    sqlx::query(
        "UPDATE futureguard.column_mappings SET locked = $2, updated_at = now() \
         WHERE institute_id = $1",
    )
    .bind(institute_id)
    .bind(locked)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::default_fields;
    use crate::matcher::build_draft;
    use crate::models::FieldType;

    fn full_rules(catalog: &Catalog) -> Vec<ColumnRule> {
        let headers: Vec<String> = ["Student ID", "Name", "Attendance %", "CGPA", "Fees Paid"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        build_draft(&headers, catalog).rules
    }

    #[test]
    fn locked_mapping_rejects_any_payload() {
        let catalog = Catalog::new(default_fields());
        let institute_id = Uuid::new_v4();
        let rules = full_rules(&catalog);

        let err = check_save(institute_id, true, &rules, &catalog).expect_err("locked");
        assert_eq!(err.kind(), "CONFIG_LOCKED");
    }

    #[test]
    fn unlocked_save_requires_full_required_coverage() {
        let catalog = Catalog::new(default_fields());
        let institute_id = Uuid::new_v4();

        let partial = vec![ColumnRule {
            source_header: "Roll No".to_string(),
            field_key: Some("studentId".to_string()),
            field_type: FieldType::String,
            required: true,
            transformations: Vec::new(),
        }];
        let err = check_save(institute_id, false, &partial, &catalog).expect_err("gaps");
        assert_eq!(err.kind(), "REQUIRED_FIELDS_MISSING");

        let complete = full_rules(&catalog);
        assert!(check_save(institute_id, false, &complete, &catalog).is_ok());
    }

    #[test]
    fn coverage_ignores_unmapped_rules() {
        let catalog = Catalog::new(default_fields());
        let rules = vec![ColumnRule {
            source_header: "Mystery".to_string(),
            field_key: None,
            field_type: FieldType::String,
            required: false,
            transformations: Vec::new(),
        }];
        let gaps = required_coverage_gaps(&rules, &catalog);
        assert_eq!(gaps.len(), catalog.required_fields().count());
    }

    #[test]
    fn only_the_super_admin_unlocks() {
        assert!(check_lock_authority(false, ActorRole::SuperAdmin).is_ok());
        assert_eq!(
            check_lock_authority(false, ActorRole::Admin)
                .expect_err("admin unlock")
                .kind(),
            "FORBIDDEN"
        );
        assert_eq!(
            check_lock_authority(true, ActorRole::Mentor)
                .expect_err("mentor lock")
                .kind(),
            "FORBIDDEN"
        );
        assert!(check_lock_authority(true, ActorRole::Admin).is_ok());
    }
}
