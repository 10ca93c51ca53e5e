use std::collections::HashSet;
use std::fmt::Write;

use uuid::Uuid;

use crate::models::{Actor, ActorRole, AuditRow, CounterSnapshot, StudentRow};

/// Share of counted successes against the high-risk pool, as shown on
/// the dashboards.
pub fn success_rate(counters: &CounterSnapshot) -> i64 {
    if counters.success == 0 || counters.risk_high == 0 {
        return 0;
    }
    ((counters.success as f64 / counters.risk_high as f64) * 100.0).round() as i64
}

pub fn render_report(scope_label: &str, actor: &Actor, students: &[StudentRow]) -> String {
    let counters = &actor.counters;
    let mut output = String::new();

    let _ = writeln!(output, "# FutureGuard Risk Report");
    let _ = writeln!(output, "Generated for {scope_label}");
    let _ = writeln!(
        output,
        "Scope owner: {} ({})",
        actor.full_name, actor.email
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Counters");
    let _ = writeln!(output, "- high: {}", counters.risk_high);
    let _ = writeln!(output, "- medium: {}", counters.risk_medium);
    let _ = writeln!(output, "- low: {}", counters.risk_low);
    let _ = writeln!(output, "- students tracked: {}", counters.risk_total());
    let _ = writeln!(
        output,
        "- successes: {} ({}% of high-risk pool)",
        counters.success,
        success_rate(counters)
    );

    match actor.role {
        ActorRole::Admin => {
            let mentors: HashSet<Uuid> = students.iter().map(|s| s.mentor_id).collect();
            let _ = writeln!(output);
            let _ = writeln!(output, "## Mentor Accounts");
            let _ = writeln!(output, "- active: {}", counters.mentors_active);
            let _ = writeln!(output, "- inactive: {}", counters.mentors_inactive);
            let _ = writeln!(output, "- with students on file: {}", mentors.len());
        }
        ActorRole::SuperAdmin => {
            let institutes: HashSet<Uuid> = students.iter().map(|s| s.institute_id).collect();
            let _ = writeln!(output);
            let _ = writeln!(output, "## Institutes");
            let _ = writeln!(output, "- active: {}", counters.institutes_active);
            let _ = writeln!(output, "- inactive: {}", counters.institutes_inactive);
            let _ = writeln!(output, "- with students on file: {}", institutes.len());
        }
        ActorRole::Mentor => {}
    }

    let mut recent = students.to_vec();
    recent.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Students");

    if recent.is_empty() {
        let _ = writeln!(output, "No students recorded for this scope.");
    } else {
        for student in recent.iter().take(10) {
            let mut line = format!(
                "- {} risk {} (updated {})",
                student.roll_id,
                student.risk_level,
                student.updated_at.date_naive()
            );
            if let Some(previous) = student.previous_risk_level {
                line.push_str(&format!(", was {previous}"));
            }
            if student.success {
                line.push_str(", success");
            }
            let _ = writeln!(output, "{line}");
        }
    }

    output
}

pub fn render_audit(rows: &[AuditRow]) -> String {
    let drifted: Vec<&AuditRow> = rows.iter().filter(|row| row.has_drift()).collect();

    let mut output = String::new();
    let _ = writeln!(output, "# Counter Audit");
    let _ = writeln!(output, "Actors checked: {}", rows.len());
    let _ = writeln!(output);

    if drifted.is_empty() {
        let _ = writeln!(output, "All counters match the student ledger.");
        return output;
    }

    let _ = writeln!(output, "## Drifted Counters");
    for row in drifted {
        let _ = writeln!(
            output,
            "- {} ({}): stored high/medium/low {}/{}/{}, ledger {}/{}/{}",
            row.email,
            row.role,
            row.stored.0,
            row.stored.1,
            row.stored.2,
            row.expected.0,
            row.expected.1,
            row.expected.2
        );
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RiskLevel;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn actor(role: ActorRole, counters: CounterSnapshot) -> Actor {
        Actor {
            id: Uuid::new_v4(),
            full_name: "Priya Raman".to_string(),
            email: "priya.raman@horizon.example".to_string(),
            role,
            institute_id: None,
            active: true,
            counters,
        }
    }

    fn student(roll: &str, days_ago: i64, risk: RiskLevel) -> StudentRow {
        StudentRow {
            roll_id: roll.to_string(),
            institute_id: Uuid::new_v4(),
            mentor_id: Uuid::new_v4(),
            risk_level: risk,
            previous_risk_level: None,
            success: false,
            updated_at: Utc::now() - Duration::days(days_ago),
        }
    }

    #[test]
    fn success_rate_guards_zero_denominators() {
        assert_eq!(success_rate(&CounterSnapshot::default()), 0);

        let only_successes = CounterSnapshot {
            success: 3,
            ..CounterSnapshot::default()
        };
        assert_eq!(success_rate(&only_successes), 0);

        let half = CounterSnapshot {
            risk_high: 4,
            success: 2,
            ..CounterSnapshot::default()
        };
        assert_eq!(success_rate(&half), 50);
    }

    #[test]
    fn admin_report_includes_mentor_account_counters() {
        let counters = CounterSnapshot {
            risk_high: 2,
            risk_low: 1,
            mentors_active: 3,
            mentors_inactive: 1,
            ..CounterSnapshot::default()
        };
        let report = render_report(
            "Horizon Institute of Technology",
            &actor(ActorRole::Admin, counters),
            &[],
        );

        assert!(report.contains("## Mentor Accounts"));
        assert!(report.contains("- active: 3"));
        assert!(report.contains("- with students on file: 0"));
        assert!(report.contains("- students tracked: 3"));
        assert!(report.contains("No students recorded for this scope."));
    }

    #[test]
    fn recent_students_are_newest_first_and_capped() {
        let mut students: Vec<StudentRow> = (0..12)
            .map(|i| student(&format!("S{i}"), i, RiskLevel::Medium))
            .collect();
        students.reverse();

        let report = render_report(
            "mentor avery.lee@horizon.example",
            &actor(ActorRole::Mentor, CounterSnapshot::default()),
            &students,
        );

        assert!(report.contains("- S0 risk medium"));
        assert!(!report.contains("- S11 risk medium"));
        let s0 = report.find("- S0 ").expect("S0 listed");
        let s5 = report.find("- S5 ").expect("S5 listed");
        assert!(s0 < s5);
    }

    #[test]
    fn audit_reports_drift_only() {
        let clean = AuditRow {
            email: "avery.lee@horizon.example".to_string(),
            role: ActorRole::Mentor,
            stored: (1, 0, 2),
            expected: (1, 0, 2),
        };
        let drifted = AuditRow {
            email: "priya.raman@horizon.example".to_string(),
            role: ActorRole::Admin,
            stored: (2, 0, 2),
            expected: (1, 0, 2),
        };

        let all_clean = render_audit(&[clean.clone()]);
        assert!(all_clean.contains("All counters match"));

        let with_drift = render_audit(&[clean, drifted]);
        assert!(with_drift.contains("## Drifted Counters"));
        assert!(with_drift.contains("priya.raman@horizon.example"));
        assert!(!with_drift.contains("- avery.lee@horizon.example"));
    }
}
