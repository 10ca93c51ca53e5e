use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::High => "high",
            RiskLevel::Medium => "medium",
            RiskLevel::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "high" => Some(RiskLevel::High),
            "medium" => Some(RiskLevel::Medium),
            "low" => Some(RiskLevel::Low),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Mentor,
    Admin,
    SuperAdmin,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorRole::Mentor => "mentor",
            ActorRole::Admin => "admin",
            ActorRole::SuperAdmin => "super_admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mentor" => Some(ActorRole::Mentor),
            "admin" => Some(ActorRole::Admin),
            "super_admin" => Some(ActorRole::SuperAdmin),
            _ => None,
        }
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rolled-up counters attached to every actor. All tiers use the risk
/// and success columns; the `mentors_*` pair is only meaningful on
/// admins and the `institutes_*` pair only on the super admin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub risk_high: i64,
    pub risk_medium: i64,
    pub risk_low: i64,
    pub success: i64,
    pub mentors_active: i64,
    pub mentors_inactive: i64,
    pub institutes_active: i64,
    pub institutes_inactive: i64,
}

impl CounterSnapshot {
    pub fn risk_total(&self) -> i64 {
        self.risk_high + self.risk_medium + self.risk_low
    }
}

#[derive(Debug, Clone)]
pub struct Actor {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub role: ActorRole,
    pub institute_id: Option<Uuid>,
    pub active: bool,
    pub counters: CounterSnapshot,
}

#[derive(Debug, Clone)]
pub struct Institute {
    pub id: Uuid,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub roll_id: String,
    pub institute_id: Uuid,
    pub mentor_id: Uuid,
    pub risk_level: RiskLevel,
    pub previous_risk_level: Option<RiskLevel>,
    pub success: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "string" => Some(FieldType::String),
            "number" => Some(FieldType::Number),
            "boolean" => Some(FieldType::Boolean),
            "date" => Some(FieldType::Date),
            _ => None,
        }
    }
}

/// One column of an institute's mapping, serialized into the
/// `column_mappings.columns` jsonb payload. An unmapped header keeps
/// `field_key = None` and rides along for operator review.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnRule {
    pub source_header: String,
    pub field_key: Option<String>,
    pub field_type: FieldType,
    pub required: bool,
    #[serde(default)]
    pub transformations: Vec<String>,
}

/// Per-file result of one ingestion call. Ephemeral: reported to the
/// operator and logged, never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub file_name: String,
    pub total_rows: usize,
    pub risk_high: usize,
    pub risk_medium: usize,
    pub risk_low: usize,
    pub success_events: usize,
    pub records: Vec<RecordSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSummary {
    pub roll_id: String,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub previous_risk_level: Option<RiskLevel>,
    pub success_event: bool,
    pub explanation: Option<serde_json::Value>,
    pub recommendation: Option<String>,
}

/// One actor's stored risk counters next to the counts recomputed from
/// its current students, for the counter-conservation audit.
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub email: String,
    pub role: ActorRole,
    pub stored: (i64, i64, i64),
    pub expected: (i64, i64, i64),
}

impl AuditRow {
    pub fn has_drift(&self) -> bool {
        self.stored != self.expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_level_round_trips_through_strings() {
        for level in [RiskLevel::High, RiskLevel::Medium, RiskLevel::Low] {
            assert_eq!(RiskLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(RiskLevel::parse("critical"), None);
    }

    #[test]
    fn column_rule_serializes_camel_case() {
        let rule = ColumnRule {
            source_header: "Att %".to_string(),
            field_key: Some("attendancePercentage".to_string()),
            field_type: FieldType::Number,
            required: true,
            transformations: Vec::new(),
        };
        let json = serde_json::to_value(&rule).expect("serialize rule");
        assert_eq!(json["sourceHeader"], "Att %");
        assert_eq!(json["fieldKey"], "attendancePercentage");
        assert_eq!(json["fieldType"], "number");
    }
}
