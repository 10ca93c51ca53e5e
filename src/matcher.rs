use std::collections::HashSet;

use crate::catalog::{Catalog, FieldDefinition};
use crate::models::{ColumnRule, FieldType};

/// Minimum similarity for a header to be matched to a catalog field.
pub const SIMILARITY_THRESHOLD: f64 = 0.6;

/// Shared normalization for headers, field keys, and synonyms:
/// camelCase transitions split, everything lowercased, punctuation and
/// runs of whitespace collapsed to single spaces.
pub fn normalize_header(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_alphanumeric() {
            if c.is_uppercase() {
                if i > 0 && chars[i - 1].is_lowercase() {
                    out.push(' ');
                }
                out.extend(c.to_lowercase());
            } else {
                out.push(c);
            }
        } else {
            out.push(' ');
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sørensen–Dice coefficient over character bigrams, whitespace ignored.
/// Strings shorter than one bigram only match on equality.
pub fn dice_coefficient(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().filter(|c| !c.is_whitespace()).collect();
    let b: Vec<char> = b.chars().filter(|c| !c.is_whitespace()).collect();

    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    if a.len() < 2 || b.len() < 2 {
        return 0.0;
    }

    let mut bigrams = std::collections::HashMap::new();
    for pair in a.windows(2) {
        *bigrams.entry((pair[0], pair[1])).or_insert(0usize) += 1;
    }

    let mut matches = 0usize;
    for pair in b.windows(2) {
        if let Some(count) = bigrams.get_mut(&(pair[0], pair[1])) {
            if *count > 0 {
                *count -= 1;
                matches += 1;
            }
        }
    }

    (2.0 * matches as f64) / ((a.len() - 1) + (b.len() - 1)) as f64
}

/// A draft column mapping produced from one file's headers, returned for
/// operator review before being saved.
#[derive(Debug, Clone)]
pub struct DraftMapping {
    pub rules: Vec<ColumnRule>,
    /// Catalog-required fields no accepted rule covers, by display name.
    pub missing_fields: Vec<String>,
}

fn unmapped(header: &str) -> ColumnRule {
    ColumnRule {
        source_header: header.to_string(),
        field_key: None,
        field_type: FieldType::String,
        required: false,
        transformations: Vec::new(),
    }
}

/// Fuzzy-match raw headers against the catalog. Each header takes its
/// best-scoring candidate above the threshold; a field key already
/// claimed by an earlier header leaves later collisions unmapped.
pub fn build_draft(headers: &[String], catalog: &Catalog) -> DraftMapping {
    let candidates: Vec<(&FieldDefinition, Vec<String>)> = catalog
        .fields
        .iter()
        .map(|field| {
            let mut names = vec![
                normalize_header(&field.field_key),
                normalize_header(&field.display_name),
            ];
            names.extend(field.synonyms.iter().map(|s| normalize_header(s)));
            (field, names)
        })
        .collect();

    let mut claimed: HashSet<&str> = HashSet::new();
    let mut rules = Vec::with_capacity(headers.len());

    for header in headers {
        let normalized = normalize_header(header);
        let mut best: Option<(f64, &FieldDefinition)> = None;

        for (field, names) in &candidates {
            for name in names {
                let score = dice_coefficient(&normalized, name);
                if best.map_or(true, |(top, _)| score > top) {
                    best = Some((score, field));
                }
            }
        }

        let rule = match best {
            Some((score, field))
                if score > SIMILARITY_THRESHOLD && !claimed.contains(field.field_key.as_str()) =>
            {
                claimed.insert(field.field_key.as_str());
                ColumnRule {
                    source_header: header.clone(),
                    field_key: Some(field.field_key.clone()),
                    field_type: field.field_type,
                    required: field.required,
                    transformations: Vec::new(),
                }
            }
            _ => unmapped(header),
        };
        rules.push(rule);
    }

    let missing_fields = catalog
        .required_fields()
        .filter(|f| !claimed.contains(f.field_key.as_str()))
        .map(|f| f.display_name.clone())
        .collect();

    DraftMapping {
        rules,
        missing_fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::default_fields;

    #[test]
    fn normalization_splits_camel_case_and_strips_punctuation() {
        assert_eq!(normalize_header("attendancePercentage"), "attendance percentage");
        assert_eq!(normalize_header("Att %"), "att");
        assert_eq!(normalize_header("  Roll_No. "), "roll no");
        assert_eq!(normalize_header("FEES PAID?"), "fees paid");
    }

    #[test]
    fn dice_coefficient_bounds() {
        assert_eq!(dice_coefficient("attendance", "attendance"), 1.0);
        assert_eq!(dice_coefficient("a", "b"), 0.0);
        assert_eq!(dice_coefficient("", "attendance"), 0.0);
        let partial = dice_coefficient("night", "nacht");
        assert!((partial - 0.25).abs() < 1e-9);
    }

    #[test]
    fn close_synonym_matches_and_junk_stays_unmapped() {
        let catalog = Catalog::new(default_fields());
        let headers = vec!["Att %".to_string(), "xyz123".to_string()];
        let draft = build_draft(&headers, &catalog);

        assert_eq!(
            draft.rules[0].field_key.as_deref(),
            Some("attendancePercentage")
        );
        assert_eq!(draft.rules[0].field_type, FieldType::Number);
        assert!(draft.rules[0].required);
        assert_eq!(draft.rules[1].field_key, None);
    }

    #[test]
    fn later_collision_on_same_field_key_is_unmapped() {
        let catalog = Catalog::new(default_fields());
        let headers = vec!["Roll No".to_string(), "Student Number".to_string()];
        let draft = build_draft(&headers, &catalog);

        assert_eq!(draft.rules[0].field_key.as_deref(), Some("studentId"));
        assert_eq!(draft.rules[1].field_key, None);
    }

    #[test]
    fn missing_fields_lists_uncovered_required_display_names() {
        let catalog = Catalog::new(default_fields());
        let headers = vec!["Roll No".to_string(), "Attendance %".to_string()];
        let draft = build_draft(&headers, &catalog);

        assert!(draft.missing_fields.contains(&"Student Name".to_string()));
        assert!(draft.missing_fields.contains(&"CGPA / Marks".to_string()));
        assert!(draft.missing_fields.contains(&"Fees Paid".to_string()));
        assert!(!draft.missing_fields.contains(&"Attendance %".to_string()));
    }

    #[test]
    fn full_header_row_maps_cleanly() {
        let catalog = Catalog::new(default_fields());
        let headers: Vec<String> = ["Student ID", "Name", "Attendance %", "CGPA", "Fees Paid"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let draft = build_draft(&headers, &catalog);

        let keys: Vec<Option<&str>> = draft.rules.iter().map(|r| r.field_key.as_deref()).collect();
        assert_eq!(
            keys,
            vec![
                Some("studentId"),
                Some("studentName"),
                Some("attendancePercentage"),
                Some("cgpa"),
                Some("feesPaid"),
            ]
        );
        assert!(draft.missing_fields.is_empty());
    }
}
