use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message shown for every classify failure that carries no message of its own.
pub const CONNECT_ERROR: &str = "Could not connect to backend.";

/// Traffic-light health classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Signal {
    Green,
    Yellow,
    Red,
}

impl Signal {
    pub fn indicator(self) -> &'static str {
        match self {
            Signal::Green => "🟢",
            Signal::Yellow => "🟡",
            Signal::Red => "🔴",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Green => "Green",
            Signal::Yellow => "Yellow",
            Signal::Red => "Red",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nutrients per 100g. Unknown numeric keys are kept in `other`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Nutrition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carbohydrates: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saturated_fat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sugar: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fiber: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sodium: Option<f64>,
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// One line of the "Nutrition Facts" panel.
#[derive(Debug, Clone, PartialEq)]
pub struct NutrientRow {
    pub name: &'static str,
    pub value: Option<f64>,
    pub unit: &'static str,
}

impl NutrientRow {
    pub fn display_value(&self) -> String {
        match self.value {
            Some(v) => format!("{v} {}", self.unit),
            None => "N/A".to_string(),
        }
    }
}

impl Nutrition {
    pub fn rows(&self) -> Vec<NutrientRow> {
        let row = |name, value, unit| NutrientRow { name, value, unit };
        vec![
            row("Calories", self.calories, "kcal"),
            row("Protein", self.protein, "g"),
            row("Carbs", self.carbohydrates, "g"),
            row("Total Fat", self.fat, "g"),
            row("Sat. Fat", self.saturated_fat, "g"),
            row("Sugars", self.sugar, "g"),
            row("Fiber", self.fiber, "g"),
            row("Sodium", self.sodium, "mg"),
        ]
    }
}

/// Which model produced the score, plus whatever diagnostics it attached.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScoringMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring_system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_used: Option<bool>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub diagnostics: Map<String, Value>,
}

impl ScoringMetadata {
    pub fn is_empty(&self) -> bool {
        self.scoring_system.is_none()
            && self.scoring_version.is_none()
            && self.fallback_used.is_none()
            && self.diagnostics.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub signal: Signal,
    pub score: f64,
    pub nutrition: Nutrition,
    pub scoring: ScoringMetadata,
}

impl Classification {
    pub fn score_text(&self) -> String {
        format!("{:.1} / 100", self.score)
    }
}

/// What the scan screen holds after a classify call.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanResult {
    Classified(Classification),
    Failed { error: String },
}

impl ScanResult {
    pub fn failed(error: impl Into<String>) -> Self {
        ScanResult::Failed {
            error: error.into(),
        }
    }

    pub fn connect_error() -> Self {
        Self::failed(CONNECT_ERROR)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ScanResult::Failed { error } => Some(error),
            ScanResult::Classified(_) => None,
        }
    }

    pub fn classification(&self) -> Option<&Classification> {
        match self {
            ScanResult::Classified(c) => Some(c),
            ScanResult::Failed { .. } => None,
        }
    }
}

/// Body of a classify response. Every field is optional so that a missing field
/// is distinguishable from a malformed one.
#[derive(Debug, Deserialize)]
pub(crate) struct ClassifyBody {
    pub label: Option<String>,
    pub signal: Option<Signal>,
    pub score: Option<f64>,
    pub nutrition: Option<Nutrition>,
    pub error: Option<String>,
    pub scoring_system: Option<String>,
    pub scoring_version: Option<String>,
    pub fallback_used: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClassifyBody {
    pub fn into_result(self) -> ScanResult {
        match (self.label, self.signal, self.score, self.nutrition) {
            (Some(label), Some(signal), Some(score), Some(nutrition))
                if (0.0..=100.0).contains(&score) =>
            {
                ScanResult::Classified(Classification {
                    label,
                    signal,
                    score,
                    nutrition,
                    scoring: ScoringMetadata {
                        scoring_system: self.scoring_system,
                        scoring_version: self.scoring_version,
                        fallback_used: self.fallback_used,
                        diagnostics: self.extra,
                    },
                })
            }
            _ => match self.error {
                Some(error) if !error.trim().is_empty() => ScanResult::Failed { error },
                _ => ScanResult::connect_error(),
            },
        }
    }
}
