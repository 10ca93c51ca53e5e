use std::collections::HashMap;

use serde_json::{json, Value};
use sqlx::{PgPool, Row};

use crate::matcher::normalize_header;
use crate::models::FieldType;

/// Canonical field that carries the student's natural identity. Rows are
/// keyed by this field's value within an institute.
pub const ROLL_ID_FIELD: &str = "studentId";

/// Version stamped onto `students.metadata_version` at write time.
pub const METADATA_VERSION: i32 = 1;

#[derive(Debug, Clone)]
pub struct FieldDefinition {
    pub field_key: String,
    pub display_name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub category: Option<String>,
    pub use_in_ml: bool,
    pub synonyms: Vec<String>,
    pub default_value: Option<Value>,
}

/// The authoritative list of canonical field definitions. Read-only input
/// to the matcher and standardizer; mutated only by catalog
/// administration, which lives outside this crate.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub fields: Vec<FieldDefinition>,
}

impl Catalog {
    pub fn new(fields: Vec<FieldDefinition>) -> Self {
        Catalog { fields }
    }

    pub async fn load(pool: &PgPool) -> Result<Self, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT field_key, display_name, field_type, required, category, use_in_ml, \
             synonyms, default_value \
             FROM futureguard.field_catalog ORDER BY field_key",
        )
        .fetch_all(pool)
        .await?;

        let fields = rows
            .iter()
            .map(|row| FieldDefinition {
                field_key: row.get("field_key"),
                display_name: row.get("display_name"),
                field_type: FieldType::parse(row.get::<String, _>("field_type").as_str())
                    .unwrap_or(FieldType::String),
                required: row.get("required"),
                category: row.get("category"),
                use_in_ml: row.get("use_in_ml"),
                synonyms: row.get("synonyms"),
                default_value: row.get("default_value"),
            })
            .collect();

        Ok(Catalog { fields })
    }

    pub fn by_key(&self, field_key: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.field_key == field_key)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.required)
    }

    /// Normalized field key, display name, and every synonym, each
    /// pointing at its definition. Later entries never displace earlier
    /// ones so a shared synonym resolves deterministically.
    pub fn alias_map(&self) -> HashMap<String, &FieldDefinition> {
        let mut map: HashMap<String, &FieldDefinition> = HashMap::new();
        for field in &self.fields {
            let mut keys = vec![
                normalize_header(&field.field_key),
                normalize_header(&field.display_name),
            ];
            keys.extend(field.synonyms.iter().map(|s| normalize_header(s)));
            for key in keys {
                if key.is_empty() {
                    continue;
                }
                map.entry(key).or_insert(field);
            }
        }
        map
    }
}

fn field(
    field_key: &str,
    display_name: &str,
    field_type: FieldType,
    required: bool,
    category: &str,
    use_in_ml: bool,
    synonyms: &[&str],
    default_value: Option<Value>,
) -> FieldDefinition {
    FieldDefinition {
        field_key: field_key.to_string(),
        display_name: display_name.to_string(),
        field_type,
        required,
        category: Some(category.to_string()),
        use_in_ml,
        synonyms: synonyms.iter().map(|s| s.to_string()).collect(),
        default_value,
    }
}

/// Seed catalog shipped with the platform.
pub fn default_fields() -> Vec<FieldDefinition> {
    vec![
        field(
            "studentId",
            "Student ID",
            FieldType::String,
            true,
            "identity",
            false,
            &[
                "id",
                "student id",
                "student_id",
                "student no",
                "student number",
                "student_no",
                "enrollment id",
                "enrollment no",
                "enrollment number",
                "roll",
                "roll id",
                "roll no",
                "roll number",
                "roll_no",
                "registration id",
                "registration number",
            ],
            None,
        ),
        field(
            "studentName",
            "Student Name",
            FieldType::String,
            true,
            "identity",
            false,
            &[
                "name",
                "student name",
                "student_name",
                "full name",
                "full_name",
                "candidate name",
                "learner name",
            ],
            None,
        ),
        field(
            "dateOfBirth",
            "Date of Birth",
            FieldType::Date,
            false,
            "identity",
            false,
            &["dob", "date of birth", "birthdate", "birth date", "date_of_birth"],
            None,
        ),
        field(
            "gender",
            "Gender",
            FieldType::String,
            false,
            "identity",
            false,
            &["gender", "sex", "male/female", "m/f", "student gender"],
            None,
        ),
        field(
            "age",
            "Age",
            FieldType::Number,
            false,
            "identity",
            true,
            &["age", "student age", "student_age", "years", "yrs", "current age"],
            None,
        ),
        field(
            "attendancePercentage",
            "Attendance %",
            FieldType::Number,
            true,
            "attendance",
            true,
            &[
                "attendance",
                "attendance %",
                "attendance%",
                "attendance percentage",
                "attendance percent",
                "att %",
                "att%",
                "presence",
            ],
            None,
        ),
        field(
            "lateSubmissionCount",
            "Late Submissions",
            FieldType::Number,
            false,
            "behavior",
            true,
            &[
                "late submissions",
                "late submission count",
                "late work",
                "delayed submissions",
                "missed deadlines",
            ],
            Some(json!(0)),
        ),
        field(
            "cgpa",
            "CGPA / Marks",
            FieldType::Number,
            true,
            "academic",
            true,
            &[
                "cgpa",
                "gpa",
                "grade",
                "grades",
                "marks",
                "score",
                "percentage",
                "average marks",
                "overall grade",
            ],
            None,
        ),
        field(
            "previousYearPerformance",
            "Previous Year Performance",
            FieldType::Number,
            false,
            "academic",
            true,
            &[
                "previous year performance",
                "last year performance",
                "previous marks",
                "last year marks",
                "prior year score",
            ],
            None,
        ),
        field(
            "mathScore",
            "Math Score",
            FieldType::Number,
            false,
            "academic",
            true,
            &["math score", "maths score", "mathematics", "math marks", "maths marks"],
            None,
        ),
        field(
            "englishScore",
            "English Score",
            FieldType::Number,
            false,
            "academic",
            true,
            &["english score", "english marks", "language score"],
            None,
        ),
        field(
            "scienceScore",
            "Science Score",
            FieldType::Number,
            false,
            "academic",
            true,
            &["science score", "science marks", "physics chemistry biology"],
            None,
        ),
        field(
            "projectScore",
            "Project / Practical Score",
            FieldType::Number,
            false,
            "academic",
            true,
            &[
                "project score",
                "project marks",
                "practical score",
                "practical marks",
                "lab score",
                "lab marks",
            ],
            None,
        ),
        field(
            "totalMarks",
            "Total Marks",
            FieldType::Number,
            false,
            "academic",
            true,
            &["total marks", "overall marks", "marks obtained", "final score"],
            None,
        ),
        field(
            "feesPaid",
            "Fees Paid",
            FieldType::Boolean,
            true,
            "financial",
            true,
            &[
                "fees paid",
                "fee paid",
                "fees",
                "fee status",
                "payment status",
                "paid",
                "paid?",
                "is paid",
                "fees cleared",
            ],
            None,
        ),
        field(
            "libraryDues",
            "Library Dues",
            FieldType::Number,
            false,
            "financial",
            true,
            &["library dues", "library fine", "book dues", "library pending"],
            Some(json!(0)),
        ),
        field(
            "sportsScore",
            "Sports / Extra-Curricular",
            FieldType::Number,
            false,
            "extracurricular",
            true,
            &[
                "sports score",
                "sports marks",
                "extracurricular",
                "extra curricular",
                "activities score",
            ],
            None,
        ),
        field(
            "behaviorScore",
            "Behavior / Discipline",
            FieldType::Number,
            false,
            "behavior",
            true,
            &["behavior score", "behaviour score", "discipline", "conduct", "character"],
            None,
        ),
        field(
            "scholarshipEligibility",
            "Scholarship Eligibility",
            FieldType::Boolean,
            false,
            "academic",
            true,
            &[
                "scholarship",
                "scholarship eligibility",
                "eligible for scholarship",
                "scholarship status",
            ],
            Some(json!(false)),
        ),
        field(
            "specialNeedsFlag",
            "Special Needs",
            FieldType::Boolean,
            false,
            "identity",
            true,
            &[
                "special needs",
                "special assistance",
                "disability",
                "differently abled",
                "handicap",
            ],
            Some(json!(false)),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_marks_identity_and_ml_fields() {
        let catalog = Catalog::new(default_fields());
        let roll = catalog.by_key(ROLL_ID_FIELD).expect("roll id field");
        assert!(roll.required);
        assert!(!roll.use_in_ml);

        let attendance = catalog.by_key("attendancePercentage").expect("attendance");
        assert!(attendance.required);
        assert!(attendance.use_in_ml);
    }

    #[test]
    fn alias_map_resolves_synonyms_and_field_keys() {
        let catalog = Catalog::new(default_fields());
        let aliases = catalog.alias_map();

        let by_synonym = aliases.get(&normalize_header("roll no")).expect("synonym");
        assert_eq!(by_synonym.field_key, "studentId");

        let by_key = aliases
            .get(&normalize_header("attendancePercentage"))
            .expect("field key");
        assert_eq!(by_key.field_key, "attendancePercentage");
    }

    #[test]
    fn required_fields_cover_the_upload_contract() {
        let catalog = Catalog::new(default_fields());
        let required: Vec<&str> = catalog
            .required_fields()
            .map(|f| f.field_key.as_str())
            .collect();
        assert_eq!(
            required,
            vec!["studentId", "studentName", "attendancePercentage", "cgpa", "feesPaid"]
        );
    }
}
