use thiserror::Error;
use uuid::Uuid;

/// Pipeline error kinds. Every failure surfaces a stable machine-readable
/// code via [`PipelineError::kind`] alongside the human-readable message.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported file format: {0}")]
    UnsupportedFileFormat(String),

    #[error("file contains no data rows")]
    EmptyFile,

    /// Required catalog fields absent from a row (or from a mapping being
    /// saved/locked, in which case `row` is `None`).
    #[error("required fields missing{}: {}", row_suffix(.row), .missing.join(", "))]
    RequiredFieldsMissing {
        row: Option<usize>,
        missing: Vec<String>,
    },

    #[error("column mapping is locked for institute {0}")]
    ConfigLocked(Uuid),

    #[error("scoring service unavailable: {0}")]
    ScoringUnavailable(String),

    /// Concurrent write to the same (roll id, institute) key.
    #[error("concurrent write conflict for student {roll_id}")]
    DuplicateStudent { roll_id: String },

    #[error("unknown actor: {0}")]
    UnknownActor(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn row_suffix(row: &Option<usize>) -> String {
    match row {
        Some(n) => format!(" (row {n})"),
        None => String::new(),
    }
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::UnsupportedFileFormat(_) => "UNSUPPORTED_FILE_FORMAT",
            PipelineError::EmptyFile => "EMPTY_FILE",
            PipelineError::RequiredFieldsMissing { .. } => "REQUIRED_FIELDS_MISSING",
            PipelineError::ConfigLocked(_) => "CONFIG_LOCKED",
            PipelineError::ScoringUnavailable(_) => "SCORING_UNAVAILABLE",
            PipelineError::DuplicateStudent { .. } => "DUPLICATE_STUDENT",
            PipelineError::UnknownActor(_) => "UNKNOWN_ACTOR",
            PipelineError::Forbidden(_) => "FORBIDDEN",
            PipelineError::Database(_) => "DATABASE",
        }
    }

    /// EmptyFile is the only kind that leaves the rest of a multi-file
    /// upload untouched without being reported as a failure.
    pub fn is_skip(&self) -> bool {
        matches!(self, PipelineError::EmptyFile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_message_names_row_and_fields() {
        let err = PipelineError::RequiredFieldsMissing {
            row: Some(3),
            missing: vec!["Attendance %".to_string(), "Fees Paid".to_string()],
        };
        assert_eq!(err.kind(), "REQUIRED_FIELDS_MISSING");
        assert_eq!(
            err.to_string(),
            "required fields missing (row 3): Attendance %, Fees Paid"
        );
    }

    #[test]
    fn mapping_level_message_omits_row() {
        let err = PipelineError::RequiredFieldsMissing {
            row: None,
            missing: vec!["Student ID".to_string()],
        };
        assert_eq!(err.to_string(), "required fields missing: Student ID");
    }
}
