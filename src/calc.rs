use crate::formula::{Formula, FormulaContext, FormulaError};
use crate::grading::GradeScale;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

const SUM_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubCriteria {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub max_score: f64,
    #[serde(default)]
    pub order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub raw_max_score: f64,
    pub reduced_score: f64,
    /// Percentage of the calculated score that counts toward the final score.
    /// Absent means 100.
    #[serde(default)]
    pub weightage: Option<f64>,
    #[serde(default)]
    pub formula: Option<String>,
    #[serde(default)]
    pub sub_criteria: Vec<SubCriteria>,
}

impl Component {
    /// Raw maximum as the calculator sees it: the sub-criteria maxima when the
    /// component is partitioned, the configured raw max otherwise.
    pub fn raw_max(&self) -> f64 {
        if self.sub_criteria.is_empty() {
            self.raw_max_score
        } else {
            self.sub_criteria.iter().map(|s| s.max_score).sum()
        }
    }

    pub fn formula_source(&self) -> Option<&str> {
        self.formula
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn weightage_percent(&self) -> f64 {
        self.weightage.unwrap_or(100.0)
    }

    pub fn ordered_sub_criteria(&self) -> Vec<&SubCriteria> {
        let mut out: Vec<&SubCriteria> = self.sub_criteria.iter().collect();
        out.sort_by_key(|s| s.order);
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentSchema {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub term: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub class_id: Option<String>,
    pub total_marks: f64,
    pub components: Vec<Component>,
    #[serde(default)]
    pub published: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubCriteriaScore {
    pub sub_criteria_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentScore {
    pub student_id: String,
    pub component_id: String,
    #[serde(default)]
    pub raw_score: Option<f64>,
    #[serde(default)]
    pub sub_scores: Vec<SubCriteriaScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Entered,
    Pending,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    FormulaError,
    OutOfRange,
    UnknownComponent,
    UnknownSubCriteria,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalcIssue {
    pub student_id: String,
    pub component_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_criteria_id: Option<String>,
    #[serde(rename = "code")]
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentResult {
    pub component_id: String,
    pub name: String,
    pub status: ComponentStatus,
    pub raw: f64,
    pub raw_max: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sub_scores: Vec<f64>,
    pub calculated: f64,
    pub max_score: f64,
    pub weightage: f64,
    pub weighted: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculatedResult {
    pub student_id: String,
    pub components: Vec<ComponentResult>,
    pub final_score: f64,
    pub final_percentage: f64,
    pub grade: String,
    pub complete: bool,
    pub issues: Vec<CalcIssue>,
}

impl CalculatedResult {
    pub fn has_any_entry(&self) -> bool {
        self.components
            .iter()
            .any(|c| c.status != ComponentStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentAverage {
    pub component_id: String,
    pub name: String,
    pub max_score: f64,
    pub average: f64,
    /// Students with an entry for this component; `average` is taken over these only.
    pub entered_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GradeCount {
    pub grade: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSummary {
    pub student_count: usize,
    pub entered_student_count: usize,
    pub component_averages: Vec<ComponentAverage>,
    pub grade_distribution: Vec<GradeCount>,
    pub average_score: f64,
    pub average_percentage: f64,
    pub highest_score: f64,
    pub lowest_score: f64,
    pub median_percentage: f64,
}

pub fn validate_schema(schema: &AssessmentSchema) -> Result<(), CalcError> {
    if schema.components.is_empty() {
        return Err(CalcError::new("invalid_schema", "schema has no components"));
    }
    if !(schema.total_marks.is_finite() && schema.total_marks > 0.0) {
        return Err(CalcError::new("invalid_schema", "totalMarks must be > 0")
            .with_details(serde_json::json!({ "totalMarks": schema.total_marks })));
    }
    let mut seen: HashSet<&str> = HashSet::new();
    for c in &schema.components {
        if c.id.trim().is_empty() {
            return Err(CalcError::new("invalid_schema", "component id must not be empty")
                .with_details(serde_json::json!({ "component": c.name })));
        }
        if !seen.insert(c.id.as_str()) {
            return Err(CalcError::new("invalid_schema", "duplicate component id")
                .with_details(serde_json::json!({ "componentId": c.id })));
        }
        let mut seen_sub: HashSet<&str> = HashSet::new();
        for s in &c.sub_criteria {
            if s.id.trim().is_empty() || !seen_sub.insert(s.id.as_str()) {
                return Err(CalcError::new(
                    "invalid_schema",
                    "sub-criteria ids must be non-empty and unique within a component",
                )
                .with_details(serde_json::json!({ "componentId": c.id, "subCriteriaId": s.id })));
            }
        }
    }
    Ok(())
}

/// Soft consistency checks. Authors may deliberately deviate, so these are
/// reported, never enforced.
pub fn schema_warnings(schema: &AssessmentSchema) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for c in &schema.components {
        if !c.sub_criteria.is_empty() && c.raw_max_score > 0.0 {
            let sub_total = c.raw_max();
            if (sub_total - c.raw_max_score).abs() > SUM_TOLERANCE {
                out.push(format!(
                    "component {}: sub-criteria maxima sum to {} but rawMaxScore is {}",
                    c.name, sub_total, c.raw_max_score
                ));
            }
        }
    }
    let reduced_total: f64 = schema
        .components
        .iter()
        .map(|c| c.reduced_score * c.weightage_percent() / 100.0)
        .sum();
    if (reduced_total - schema.total_marks).abs() > SUM_TOLERANCE {
        out.push(format!(
            "weighted component maxima sum to {} but totalMarks is {}",
            reduced_total, schema.total_marks
        ));
    }
    out
}

fn default_scaling(raw: f64, raw_max: f64, reduced_score: f64) -> f64 {
    if raw_max > 0.0 {
        raw / raw_max * reduced_score
    } else {
        0.0
    }
}

fn clamp_score(value: f64, max: f64) -> (f64, bool) {
    let max = max.max(0.0);
    if value < 0.0 {
        (0.0, true)
    } else if value > max {
        (max, true)
    } else {
        (value, false)
    }
}

/// A schema with its formulas parsed, ready to score any number of students.
#[derive(Debug)]
pub struct CompiledSchema<'a> {
    schema: &'a AssessmentSchema,
    formulas: Vec<Option<Result<Formula, FormulaError>>>,
    index: HashMap<&'a str, usize>,
}

impl<'a> CompiledSchema<'a> {
    pub fn compile(schema: &'a AssessmentSchema) -> Result<Self, CalcError> {
        validate_schema(schema)?;
        let formulas = schema
            .components
            .iter()
            .map(|c| c.formula_source().map(Formula::parse))
            .collect();
        let index = schema
            .components
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.as_str(), i))
            .collect();
        Ok(Self {
            schema,
            formulas,
            index,
        })
    }

    /// Score one student. Entries belonging to other students are skipped; for
    /// repeated entries on one component the last one wins.
    pub fn calculate<'s, I>(&self, student_id: &str, scores: I, scale: &GradeScale) -> CalculatedResult
    where
        I: IntoIterator<Item = &'s ComponentScore>,
    {
        let mut issues: Vec<CalcIssue> = Vec::new();
        let mut by_component: HashMap<&str, &ComponentScore> = HashMap::new();
        for s in scores {
            if s.student_id != student_id {
                continue;
            }
            match self.index.get_key_value(s.component_id.as_str()) {
                Some((&key, _)) => {
                    by_component.insert(key, s);
                }
                None => issues.push(CalcIssue {
                    student_id: student_id.to_string(),
                    component_id: s.component_id.clone(),
                    sub_criteria_id: None,
                    kind: IssueKind::UnknownComponent,
                    message: "score entry references a component not in this schema".into(),
                }),
            }
        }

        let mut components: Vec<ComponentResult> = Vec::with_capacity(self.schema.components.len());
        for (i, c) in self.schema.components.iter().enumerate() {
            let entry = by_component.get(c.id.as_str()).copied();
            let result = self.calculate_component(i, c, student_id, entry, &mut issues);
            components.push(result);
        }

        let final_score: f64 = components.iter().map(|c| c.weighted).sum();
        let final_percentage = final_score / self.schema.total_marks * 100.0;
        let complete = components
            .iter()
            .all(|c| c.status != ComponentStatus::Pending);

        CalculatedResult {
            student_id: student_id.to_string(),
            components,
            final_score,
            final_percentage,
            grade: scale.grade_for(final_percentage).to_string(),
            complete,
            issues,
        }
    }

    fn calculate_component(
        &self,
        idx: usize,
        c: &Component,
        student_id: &str,
        entry: Option<&ComponentScore>,
        issues: &mut Vec<CalcIssue>,
    ) -> ComponentResult {
        let issue_count_before = issues.len();
        let issue = |kind: IssueKind, sub_criteria_id: Option<String>, message: String| CalcIssue {
            student_id: student_id.to_string(),
            component_id: c.id.clone(),
            sub_criteria_id,
            kind,
            message,
        };

        let raw_max = c.raw_max();
        let ordered = c.ordered_sub_criteria();
        let mut sub_scores: Vec<f64> = vec![0.0; ordered.len()];
        let mut any_sub = false;

        if let Some(e) = entry {
            for ss in &e.sub_scores {
                let Some(k) = ordered.iter().position(|sc| sc.id == ss.sub_criteria_id) else {
                    issues.push(issue(
                        IssueKind::UnknownSubCriteria,
                        Some(ss.sub_criteria_id.clone()),
                        "sub-score references unknown sub-criteria".into(),
                    ));
                    continue;
                };
                let (v, out_of_range) = clamp_score(ss.score, ordered[k].max_score);
                if out_of_range {
                    issues.push(issue(
                        IssueKind::OutOfRange,
                        Some(ss.sub_criteria_id.clone()),
                        format!(
                            "sub-score {} outside 0..={} for {}",
                            ss.score, ordered[k].max_score, ordered[k].name
                        ),
                    ));
                }
                sub_scores[k] = v;
                any_sub = true;
            }
        }

        let entered_raw = entry.and_then(|e| e.raw_score);
        let entered = any_sub || entered_raw.is_some();
        let mut raw = if any_sub {
            sub_scores.iter().sum()
        } else {
            entered_raw.unwrap_or(0.0)
        };

        if entered && !any_sub {
            let (v, out_of_range) = clamp_score(raw, raw_max);
            if out_of_range {
                issues.push(issue(
                    IssueKind::OutOfRange,
                    None,
                    format!("raw score {} outside 0..={}", raw, raw_max),
                ));
            }
            raw = v;
        }

        let calculated = if !entered {
            0.0
        } else {
            let evaluated = match &self.formulas[idx] {
                None => Ok(default_scaling(raw, raw_max, c.reduced_score)),
                Some(Ok(f)) => f.eval(&FormulaContext {
                    raw,
                    raw_max,
                    sub_scores: &sub_scores,
                    total_max: raw_max,
                }),
                Some(Err(e)) => Err(e.clone()),
            };
            match evaluated {
                Ok(v) => v,
                Err(e) => {
                    let message = if e.is_parse_error() {
                        format!("formula could not be parsed: {}", e)
                    } else {
                        format!("formula evaluation error: {}", e)
                    };
                    issues.push(issue(IssueKind::FormulaError, None, message));
                    0.0
                }
            }
        };

        let status = if !entered {
            ComponentStatus::Pending
        } else if issues.len() > issue_count_before {
            ComponentStatus::Invalid
        } else {
            ComponentStatus::Entered
        };
        let weightage = c.weightage_percent();

        ComponentResult {
            component_id: c.id.clone(),
            name: c.name.clone(),
            status,
            raw,
            raw_max,
            sub_scores,
            calculated,
            max_score: c.reduced_score,
            weightage,
            weighted: calculated * weightage / 100.0,
        }
    }
}

pub fn calculate_student(
    schema: &AssessmentSchema,
    student_id: &str,
    scores: &[ComponentScore],
    scale: &GradeScale,
) -> Result<CalculatedResult, CalcError> {
    Ok(CompiledSchema::compile(schema)?.calculate(student_id, scores, scale))
}

/// Score every roster member. Students without entries come back fully
/// pending; entries for students outside the roster are ignored.
pub fn calculate_roster(
    schema: &AssessmentSchema,
    student_ids: &[String],
    scores: &[ComponentScore],
    scale: &GradeScale,
) -> Result<Vec<CalculatedResult>, CalcError> {
    let compiled = CompiledSchema::compile(schema)?;
    let mut by_student: HashMap<&str, Vec<&ComponentScore>> = HashMap::new();
    for s in scores {
        by_student.entry(s.student_id.as_str()).or_default().push(s);
    }
    Ok(student_ids
        .iter()
        .map(|id| {
            let entries = by_student.get(id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            compiled.calculate(id, entries.iter().copied(), scale)
        })
        .collect())
}

fn compute_median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0
    }
}

fn mean(values: impl Iterator<Item = f64>) -> (f64, usize) {
    let mut sum = 0.0_f64;
    let mut n = 0usize;
    for v in values {
        sum += v;
        n += 1;
    }
    if n > 0 {
        (sum / n as f64, n)
    } else {
        (0.0, 0)
    }
}

pub fn summarize_class(
    schema: &AssessmentSchema,
    results: &[CalculatedResult],
    scale: &GradeScale,
) -> ClassSummary {
    let component_averages = schema
        .components
        .iter()
        .map(|c| {
            let (average, entered_count) = mean(
                results
                    .iter()
                    .filter_map(|r| r.components.iter().find(|rc| rc.component_id == c.id))
                    .filter(|rc| rc.status != ComponentStatus::Pending)
                    .map(|rc| rc.calculated),
            );
            ComponentAverage {
                component_id: c.id.clone(),
                name: c.name.clone(),
                max_score: c.reduced_score,
                average,
                entered_count,
            }
        })
        .collect();

    let grade_distribution = scale
        .bands()
        .iter()
        .map(|b| GradeCount {
            grade: b.grade.clone(),
            count: results.iter().filter(|r| r.grade == b.grade).count(),
        })
        .collect();

    let (average_score, _) = mean(results.iter().map(|r| r.final_score));
    let (average_percentage, _) = mean(results.iter().map(|r| r.final_percentage));
    let highest_score = results
        .iter()
        .map(|r| r.final_score)
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
        .unwrap_or(0.0);
    let lowest_score = results
        .iter()
        .map(|r| r.final_score)
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))))
        .unwrap_or(0.0);
    let percentages: Vec<f64> = results.iter().map(|r| r.final_percentage).collect();

    ClassSummary {
        student_count: results.len(),
        entered_student_count: results.iter().filter(|r| r.has_any_entry()).count(),
        component_averages,
        grade_distribution,
        average_score,
        average_percentage,
        highest_score,
        lowest_score,
        median_percentage: compute_median(&percentages),
    }
}
