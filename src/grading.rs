use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

pub const SETTINGS_KEY: &str = "grading";
pub const DEFAULT_PASS_PERCENT: f64 = 40.0;
const MAX_BANDS: usize = 20;
const MAX_GRADE_LABEL_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub grade: String,
    pub min_percent: f64,
}

/// Percentage-to-grade bands, kept sorted by descending threshold so the
/// mapping is monotonic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GradeScale {
    bands: Vec<GradeBand>,
}

impl GradeScale {
    pub fn new(mut bands: Vec<GradeBand>) -> Result<Self, String> {
        if bands.is_empty() {
            return Err("bands must not be empty".into());
        }
        if bands.len() > MAX_BANDS {
            return Err(format!("at most {} bands are allowed", MAX_BANDS));
        }
        for b in bands.iter_mut() {
            b.grade = b.grade.trim().to_string();
            if b.grade.is_empty() || b.grade.len() > MAX_GRADE_LABEL_LEN {
                return Err(format!(
                    "grade labels must be 1..={} characters",
                    MAX_GRADE_LABEL_LEN
                ));
            }
            if !b.min_percent.is_finite() || !(0.0..=100.0).contains(&b.min_percent) {
                return Err(format!(
                    "minPercent for grade {} must be in 0..=100",
                    b.grade
                ));
            }
        }
        bands.sort_by(|a, b| {
            b.min_percent
                .partial_cmp(&a.min_percent)
                .unwrap_or(Ordering::Equal)
        });
        for pair in bands.windows(2) {
            if pair[0].min_percent == pair[1].min_percent {
                return Err(format!(
                    "grades {} and {} share minPercent {}",
                    pair[0].grade, pair[1].grade, pair[0].min_percent
                ));
            }
        }
        for (i, b) in bands.iter().enumerate() {
            if bands[..i].iter().any(|o| o.grade.eq_ignore_ascii_case(&b.grade)) {
                return Err(format!("duplicate grade label: {}", b.grade));
            }
        }
        Ok(Self { bands })
    }

    pub fn bands(&self) -> &[GradeBand] {
        &self.bands
    }

    pub fn grade_for(&self, percent: f64) -> &str {
        for b in &self.bands {
            if percent >= b.min_percent {
                return &b.grade;
            }
        }
        // Below every threshold: lowest band.
        self.bands
            .last()
            .map(|b| b.grade.as_str())
            .unwrap_or_default()
    }
}

impl Default for GradeScale {
    fn default() -> Self {
        let band = |grade: &str, min_percent: f64| GradeBand {
            grade: grade.to_string(),
            min_percent,
        };
        Self {
            bands: vec![
                band("A", 75.0),
                band("B", 60.0),
                band("C", 50.0),
                band("D", 40.0),
                band("F", 0.0),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradingConfig {
    pub scale: GradeScale,
    pub pass_percent: f64,
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            scale: GradeScale::default(),
            pass_percent: DEFAULT_PASS_PERCENT,
        }
    }
}

impl GradingConfig {
    pub fn is_pass(&self, percent: f64) -> bool {
        percent >= self.pass_percent
    }

    pub fn to_json(&self) -> Value {
        json!({
            "bands": self.scale.bands(),
            "passPercent": self.pass_percent,
        })
    }

    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        for (k, v) in patch {
            match k.as_str() {
                "bands" => {
                    let bands: Vec<GradeBand> = serde_json::from_value(v.clone())
                        .map_err(|e| format!("bands must be a list of {{grade, minPercent}}: {}", e))?;
                    self.scale = GradeScale::new(bands)?;
                }
                "passPercent" => {
                    let p = v
                        .as_f64()
                        .ok_or_else(|| "passPercent must be a number".to_string())?;
                    if !(0.0..=100.0).contains(&p) {
                        return Err("passPercent must be in 0..=100".into());
                    }
                    self.pass_percent = p;
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            }
        }
        Ok(())
    }

    /// Stored values are applied best-effort; anything malformed keeps the
    /// default for that field.
    pub fn from_stored(saved: Option<&Value>) -> Self {
        let mut cfg = Self::default();
        let Some(obj) = saved.and_then(|v| v.as_object()) else {
            return cfg;
        };
        for (k, v) in obj {
            let mut one = Map::new();
            one.insert(k.clone(), v.clone());
            let _ = cfg.apply_patch(&one);
        }
        cfg
    }
}
