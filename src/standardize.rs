use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde_json::{Map, Number, Value};
use uuid::Uuid;

use crate::catalog::{Catalog, FieldDefinition, ROLL_ID_FIELD};
use crate::error::PipelineError;
use crate::matcher::normalize_header;
use crate::models::{ColumnRule, FieldType};

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%d-%m-%Y"];

/// A row's values keyed by catalog field key after type coercion,
/// independent of the original header spelling. Feature values feed the
/// scoring gateway; identity values stay out of the feature set.
#[derive(Debug, Clone)]
pub struct CanonicalRecord {
    pub roll_id: String,
    pub features: BTreeMap<String, Value>,
    pub identity: BTreeMap<String, Value>,
}

impl CanonicalRecord {
    /// Single object persisted as `students.standardized_input`.
    pub fn merged(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in self.identity.iter().chain(self.features.iter()) {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }
}

/// Resolves normalized raw headers to catalog definitions, either from an
/// institute's accepted column mapping or from the global catalog aliases.
pub struct AliasResolver<'a> {
    map: HashMap<String, &'a FieldDefinition>,
}

impl<'a> AliasResolver<'a> {
    pub fn from_catalog(catalog: &'a Catalog) -> Self {
        AliasResolver {
            map: catalog.alias_map(),
        }
    }

    /// Only accepted rules participate; unmapped columns stay invisible
    /// to standardization.
    pub fn from_mapping(rules: &[ColumnRule], catalog: &'a Catalog) -> Self {
        let mut map = HashMap::new();
        for rule in rules {
            let Some(field_key) = rule.field_key.as_deref() else {
                continue;
            };
            if let Some(field) = catalog.by_key(field_key) {
                map.insert(normalize_header(&rule.source_header), field);
            }
        }
        AliasResolver { map }
    }

    pub fn resolve(&self, raw_header: &str) -> Option<&'a FieldDefinition> {
        self.map.get(&normalize_header(raw_header)).copied()
    }
}

/// Coerce a raw cell to the field's declared type. Empty cells and
/// unparseable numbers/booleans come back as `None` (undefined).
pub fn coerce_value(raw: &str, field_type: FieldType) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    match field_type {
        FieldType::String => Some(Value::String(trimmed.to_string())),
        FieldType::Number => trimmed
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        FieldType::Boolean => match trimmed.to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" | "paid" => Some(Value::Bool(true)),
            "false" | "no" | "n" | "0" | "unpaid" | "pending" => Some(Value::Bool(false)),
            _ => None,
        },
        FieldType::Date => {
            for format in DATE_FORMATS {
                if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
                    return Some(Value::String(date.format("%Y-%m-%d").to_string()));
                }
            }
            // Unrecognized date shapes pass through untouched.
            Some(Value::String(trimmed.to_string()))
        }
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

fn value_as_roll_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Standardize every row of one file. Fail-fast: the first row missing a
/// catalog-required field rejects the whole file, so no partial import
/// ever reaches scoring or aggregation.
pub fn standardize_rows(
    rows: &[HashMap<String, String>],
    resolver: &AliasResolver<'_>,
    catalog: &Catalog,
) -> Result<Vec<CanonicalRecord>, PipelineError> {
    let mut records = Vec::with_capacity(rows.len());

    for (index, row) in rows.iter().enumerate() {
        let mut features: BTreeMap<String, Value> = BTreeMap::new();
        let mut identity: BTreeMap<String, Value> = BTreeMap::new();

        // Deterministic merge regardless of map iteration order.
        let mut cells: Vec<(&String, &String)> = row.iter().collect();
        cells.sort_by(|a, b| a.0.cmp(b.0));

        for (header, raw) in cells {
            let Some(field) = resolver.resolve(header) else {
                continue;
            };
            let Some(value) = coerce_value(raw, field.field_type) else {
                continue;
            };
            if field.use_in_ml {
                features.insert(field.field_key.clone(), value);
            } else {
                identity.insert(field.field_key.clone(), value);
            }
        }

        for field in &catalog.fields {
            if field.use_in_ml && !features.contains_key(&field.field_key) {
                if let Some(default) = &field.default_value {
                    features.insert(field.field_key.clone(), default.clone());
                }
            }
        }

        let missing: Vec<String> = catalog
            .required_fields()
            .filter(|f| {
                is_blank(features.get(&f.field_key).or_else(|| identity.get(&f.field_key)))
            })
            .map(|f| f.display_name.clone())
            .collect();

        if !missing.is_empty() {
            return Err(PipelineError::RequiredFieldsMissing {
                row: Some(index + 1),
                missing,
            });
        }

        let roll_id = identity
            .get(ROLL_ID_FIELD)
            .or_else(|| features.get(ROLL_ID_FIELD))
            .and_then(value_as_roll_id)
            .unwrap_or_else(|| format!("upload-{}", Uuid::new_v4()));

        records.push(CanonicalRecord {
            roll_id,
            features,
            identity,
        });
    }

    Ok(records)
}
