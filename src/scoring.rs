use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;
use crate::models::RiskLevel;

/// One record handed to the scorer: a correlation id (passed through
/// unchanged) plus the ML feature subset of the canonical record.
#[derive(Debug, Clone, Serialize)]
pub struct ScoringRequestItem {
    pub id: String,
    pub features: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Prediction {
    pub id: String,
    pub risk_label: RiskLevel,
    pub risk_score: f64,
    #[serde(default)]
    pub explanation: Option<Value>,
    #[serde(default)]
    pub recommendation: Option<String>,
}

#[derive(Serialize)]
struct PredictRequest<'a> {
    students: &'a [ScoringRequestItem],
}

#[derive(Deserialize)]
struct PredictResponse {
    results: Vec<Prediction>,
}

/// External batch classifier. One call per file; any failure aborts the
/// whole batch so no partial scoring is ever committed.
pub trait ScoringGateway {
    fn predict(
        &self,
        students: &[ScoringRequestItem],
    ) -> impl std::future::Future<Output = Result<Vec<Prediction>, PipelineError>> + Send;
}

/// HTTP client for the scoring service's `POST /predict`.
pub struct HttpScoringGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpScoringGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::ScoringUnavailable(e.to_string()))?;

        Ok(HttpScoringGateway {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

impl ScoringGateway for HttpScoringGateway {
    async fn predict(
        &self,
        students: &[ScoringRequestItem],
    ) -> Result<Vec<Prediction>, PipelineError> {
        let url = format!("{}/predict", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&PredictRequest { students })
            .send()
            .await
            .map_err(|e| PipelineError::ScoringUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::ScoringUnavailable(format!(
                "scoring service returned {status}"
            )));
        }

        let body: PredictResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::ScoringUnavailable(format!("malformed response: {e}")))?;

        align_predictions(students, body.results)
    }
}

/// Re-key the scorer's output to request order. A count mismatch or a
/// missing id means the batch cannot be trusted and the file is aborted.
pub fn align_predictions(
    students: &[ScoringRequestItem],
    predictions: Vec<Prediction>,
) -> Result<Vec<Prediction>, PipelineError> {
    if predictions.len() != students.len() {
        return Err(PipelineError::ScoringUnavailable(format!(
            "scored {} of {} records",
            predictions.len(),
            students.len()
        )));
    }

    let mut by_id: HashMap<String, Prediction> = predictions
        .into_iter()
        .map(|p| (p.id.clone(), p))
        .collect();

    let mut ordered = Vec::with_capacity(students.len());
    for student in students {
        match by_id.remove(&student.id) {
            Some(prediction) => ordered.push(prediction),
            None => {
                return Err(PipelineError::ScoringUnavailable(format!(
                    "no prediction for record {}",
                    student.id
                )))
            }
        }
    }

    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> ScoringRequestItem {
        ScoringRequestItem {
            id: id.to_string(),
            features: BTreeMap::new(),
        }
    }

    fn prediction(id: &str, label: RiskLevel) -> Prediction {
        Prediction {
            id: id.to_string(),
            risk_label: label,
            risk_score: 0.5,
            explanation: None,
            recommendation: None,
        }
    }

    #[test]
    fn predictions_reorder_to_request_order() {
        let students = vec![item("0:S1"), item("1:S2")];
        let shuffled = vec![
            prediction("1:S2", RiskLevel::Low),
            prediction("0:S1", RiskLevel::High),
        ];

        let aligned = align_predictions(&students, shuffled).expect("aligned");
        assert_eq!(aligned[0].id, "0:S1");
        assert_eq!(aligned[0].risk_label, RiskLevel::High);
        assert_eq!(aligned[1].id, "1:S2");
    }

    #[test]
    fn count_mismatch_aborts_the_batch() {
        let students = vec![item("0:S1"), item("1:S2")];
        let err = align_predictions(&students, vec![prediction("0:S1", RiskLevel::Low)])
            .expect_err("short response");
        assert_eq!(err.kind(), "SCORING_UNAVAILABLE");
    }

    #[test]
    fn unknown_correlation_id_aborts_the_batch() {
        let students = vec![item("0:S1")];
        let err = align_predictions(&students, vec![prediction("0:S9", RiskLevel::Low)])
            .expect_err("wrong id");
        assert_eq!(err.kind(), "SCORING_UNAVAILABLE");
    }

    #[test]
    fn risk_labels_deserialize_lowercase() {
        let parsed: Prediction = serde_json::from_value(serde_json::json!({
            "id": "0:S1",
            "risk_label": "medium",
            "risk_score": 0.41,
            "explanation": {"attendancePercentage": -0.2},
            "recommendation": "Schedule a check-in"
        }))
        .expect("deserialize prediction");
        assert_eq!(parsed.risk_label, RiskLevel::Medium);
        assert_eq!(parsed.recommendation.as_deref(), Some("Schedule a check-in"));
    }
}
