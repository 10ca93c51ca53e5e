use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::catalog;
use crate::models::{Actor, ActorRole, AuditRow, CounterSnapshot, Institute, RiskLevel, StudentRow};

pub type PgTx<'a> = Transaction<'a, Postgres>;

/// The platform super admin is a singleton addressed by this well-known
/// id, never by "first row found".
pub const SUPER_ADMIN_ID: Uuid = Uuid::from_u128(0x00f0_99aa_7c1d_4c6f_9b52_1d6a00f09901);

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    for field in catalog::default_fields() {
        sqlx::query(
            r#"
            INSERT INTO futureguard.field_catalog
            (field_key, display_name, field_type, required, category, use_in_ml, synonyms, default_value)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (field_key) DO UPDATE
            SET display_name = EXCLUDED.display_name,
                field_type = EXCLUDED.field_type,
                required = EXCLUDED.required,
                category = EXCLUDED.category,
                use_in_ml = EXCLUDED.use_in_ml,
                synonyms = EXCLUDED.synonyms,
                default_value = EXCLUDED.default_value
            "#,
        )
        .bind(&field.field_key)
        .bind(&field.display_name)
        .bind(field.field_type.as_str())
        .bind(field.required)
        .bind(&field.category)
        .bind(field.use_in_ml)
        .bind(&field.synonyms)
        .bind(&field.default_value)
        .execute(pool)
        .await?;
    }

    let institutes = vec![
        (
            Uuid::parse_str("5b6c4a51-7f0e-4f24-9c05-2f4b8b2a6f10")?,
            "Horizon Institute of Technology",
        ),
        (
            Uuid::parse_str("9e1d2c3b-4a5f-4678-8d90-1a2b3c4d5e6f")?,
            "Northgate College",
        ),
    ];

    for (id, name) in &institutes {
        sqlx::query(
            r#"
            INSERT INTO futureguard.institutes (id, name, active)
            VALUES ($1, $2, TRUE)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(name)
        .execute(pool)
        .await?;
    }

    // (id, name, email, role, institute, mentors_active, institutes_active)
    let actors = vec![
        (
            SUPER_ADMIN_ID,
            "Platform Root",
            "platform.root@futureguard.example",
            ActorRole::SuperAdmin,
            None,
            0i64,
            institutes.len() as i64,
        ),
        (
            Uuid::parse_str("11a1b2c3-d4e5-4f60-8171-82939aabbcc1")?,
            "Priya Raman",
            "priya.raman@horizon.example",
            ActorRole::Admin,
            Some(institutes[0].0),
            2,
            0,
        ),
        (
            Uuid::parse_str("22b2c3d4-e5f6-4071-8292-a3b4c5d6e7f2")?,
            "Marcus Cole",
            "marcus.cole@northgate.example",
            ActorRole::Admin,
            Some(institutes[1].0),
            1,
            0,
        ),
        (
            Uuid::parse_str("33c3d4e5-f6a7-4182-93a3-b4c5d6e7f8a3")?,
            "Avery Lee",
            "avery.lee@horizon.example",
            ActorRole::Mentor,
            Some(institutes[0].0),
            0,
            0,
        ),
        (
            Uuid::parse_str("44d4e5f6-a7b8-4293-a4b4-c5d6e7f8a9b4")?,
            "Jules Moreno",
            "jules.moreno@horizon.example",
            ActorRole::Mentor,
            Some(institutes[0].0),
            0,
            0,
        ),
        (
            Uuid::parse_str("55e5f6a7-b8c9-43a4-b5c5-d6e7f8a9b0c5")?,
            "Kiara Patel",
            "kiara.patel@northgate.example",
            ActorRole::Mentor,
            Some(institutes[1].0),
            0,
            0,
        ),
    ];

    for (id, name, email, role, institute_id, mentors_active, institutes_active) in actors {
        sqlx::query(
            r#"
            INSERT INTO futureguard.actors
            (id, full_name, email, role, institute_id, active, mentors_active, institutes_active)
            VALUES ($1, $2, $3, $4, $5, TRUE, $6, $7)
            ON CONFLICT (email) DO UPDATE
            SET full_name = EXCLUDED.full_name
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(email)
        .bind(role.as_str())
        .bind(institute_id)
        .bind(mentors_active)
        .bind(institutes_active)
        .execute(pool)
        .await?;
    }

    Ok(())
}

fn actor_from_row(row: &PgRow) -> Result<Actor, sqlx::Error> {
    let raw_role: String = row.get("role");
    let role = ActorRole::parse(&raw_role)
        .ok_or_else(|| sqlx::Error::Decode(format!("unexpected actor role {raw_role:?}").into()))?;

    Ok(Actor {
        id: row.get("id"),
        full_name: row.get("full_name"),
        email: row.get("email"),
        role,
        institute_id: row.get("institute_id"),
        active: row.get("active"),
        counters: CounterSnapshot {
            risk_high: row.get("risk_high"),
            risk_medium: row.get("risk_medium"),
            risk_low: row.get("risk_low"),
            success: row.get("success_count"),
            mentors_active: row.get("mentors_active"),
            mentors_inactive: row.get("mentors_inactive"),
            institutes_active: row.get("institutes_active"),
            institutes_inactive: row.get("institutes_inactive"),
        },
    })
}

const ACTOR_COLUMNS: &str = "id, full_name, email, role, institute_id, active, \
     risk_high, risk_medium, risk_low, success_count, \
     mentors_active, mentors_inactive, institutes_active, institutes_inactive";

pub async fn fetch_actor(pool: &PgPool, email: &str) -> Result<Option<Actor>, sqlx::Error> {
    let query = format!("SELECT {ACTOR_COLUMNS} FROM futureguard.actors WHERE email = $1");
    sqlx::query(&query)
        .bind(email)
        .fetch_optional(pool)
        .await?
        .map(|row| actor_from_row(&row))
        .transpose()
}

pub async fn fetch_actor_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Actor>, sqlx::Error> {
    let query = format!("SELECT {ACTOR_COLUMNS} FROM futureguard.actors WHERE id = $1");
    sqlx::query(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?
        .map(|row| actor_from_row(&row))
        .transpose()
}

pub async fn fetch_admin(
    pool: &PgPool,
    institute_id: Uuid,
) -> Result<Option<Actor>, sqlx::Error> {
    let query = format!(
        "SELECT {ACTOR_COLUMNS} FROM futureguard.actors \
         WHERE institute_id = $1 AND role = 'admin'"
    );
    sqlx::query(&query)
        .bind(institute_id)
        .fetch_optional(pool)
        .await?
        .map(|row| actor_from_row(&row))
        .transpose()
}

/// Row-locked actor fetch for the cascade and flip paths.
pub async fn fetch_actor_tx(
    tx: &mut PgTx<'_>,
    email: &str,
) -> Result<Option<Actor>, sqlx::Error> {
    let query = format!(
        "SELECT {ACTOR_COLUMNS} FROM futureguard.actors WHERE email = $1 FOR UPDATE"
    );
    sqlx::query(&query)
        .bind(email)
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| actor_from_row(&row))
        .transpose()
}

pub async fn fetch_admin_tx(
    tx: &mut PgTx<'_>,
    institute_id: Uuid,
) -> Result<Option<Actor>, sqlx::Error> {
    let query = format!(
        "SELECT {ACTOR_COLUMNS} FROM futureguard.actors \
         WHERE institute_id = $1 AND role = 'admin' FOR UPDATE"
    );
    sqlx::query(&query)
        .bind(institute_id)
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| actor_from_row(&row))
        .transpose()
}

pub async fn fetch_institute(
    pool: &PgPool,
    name: &str,
) -> Result<Option<Institute>, sqlx::Error> {
    let row = sqlx::query("SELECT id, name, active FROM futureguard.institutes WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| Institute {
        id: row.get("id"),
        name: row.get("name"),
        active: row.get("active"),
    }))
}

pub async fn fetch_institute_tx(
    tx: &mut PgTx<'_>,
    name: &str,
) -> Result<Option<Institute>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, name, active FROM futureguard.institutes WHERE name = $1 FOR UPDATE",
    )
    .bind(name)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|row| Institute {
        id: row.get("id"),
        name: row.get("name"),
        active: row.get("active"),
    }))
}

/// Students visible to a dashboard scope: a single mentor, a whole
/// institute, or the platform.
pub async fn fetch_students(
    pool: &PgPool,
    mentor_id: Option<Uuid>,
    institute_id: Option<Uuid>,
) -> Result<Vec<StudentRow>, sqlx::Error> {
    let mut query = String::from(
        "SELECT roll_id, institute_id, mentor_id, risk_level, previous_risk_level, \
         success, updated_at \
         FROM futureguard.students",
    );

    if mentor_id.is_some() {
        query.push_str(" WHERE mentor_id = $1");
    } else if institute_id.is_some() {
        query.push_str(" WHERE institute_id = $1");
    }
    query.push_str(" ORDER BY updated_at DESC");

    let mut rows = sqlx::query(&query);
    if let Some(value) = mentor_id {
        rows = rows.bind(value);
    } else if let Some(value) = institute_id {
        rows = rows.bind(value);
    }

    let records = rows.fetch_all(pool).await?;
    let mut students = Vec::with_capacity(records.len());

    for row in records {
        let raw_level: String = row.get("risk_level");
        let risk_level = RiskLevel::parse(&raw_level).ok_or_else(|| {
            sqlx::Error::Decode(format!("unexpected risk_level {raw_level:?}").into())
        })?;
        let previous_risk_level = row
            .get::<Option<String>, _>("previous_risk_level")
            .as_deref()
            .and_then(RiskLevel::parse);

        students.push(StudentRow {
            roll_id: row.get("roll_id"),
            institute_id: row.get("institute_id"),
            mentor_id: row.get("mentor_id"),
            risk_level,
            previous_risk_level,
            success: row.get("success"),
            updated_at: row.get("updated_at"),
        });
    }

    Ok(students)
}

/// Recompute every actor's risk counts from its current students and
/// pair them with the stored counters. Any difference is drift.
pub async fn audit_counters(pool: &PgPool) -> Result<Vec<AuditRow>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        SELECT a.email, a.role, a.risk_high, a.risk_medium, a.risk_low,
               COUNT(s.roll_id) FILTER (WHERE s.risk_level = 'high')   AS expected_high,
               COUNT(s.roll_id) FILTER (WHERE s.risk_level = 'medium') AS expected_medium,
               COUNT(s.roll_id) FILTER (WHERE s.risk_level = 'low')    AS expected_low
        FROM futureguard.actors a
        LEFT JOIN futureguard.students s
          ON (a.role = 'mentor' AND s.mentor_id = a.id)
          OR (a.role = 'admin' AND s.institute_id = a.institute_id)
          OR (a.role = 'super_admin')
        GROUP BY a.id, a.email, a.role, a.risk_high, a.risk_medium, a.risk_low
        ORDER BY a.role, a.email
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut audit = Vec::with_capacity(rows.len());
    for row in rows {
        let raw_role: String = row.get("role");
        let role = ActorRole::parse(&raw_role).ok_or_else(|| {
            sqlx::Error::Decode(format!("unexpected actor role {raw_role:?}").into())
        })?;

        audit.push(AuditRow {
            email: row.get("email"),
            role,
            stored: (
                row.get("risk_high"),
                row.get("risk_medium"),
                row.get("risk_low"),
            ),
            expected: (
                row.get("expected_high"),
                row.get("expected_medium"),
                row.get("expected_low"),
            ),
        });
    }

    Ok(audit)
}
