//! Quality gate - vetoes a run when output tables do not look right

use super::{validate_identifier, Operator};
use crate::clients::Rows;
use crate::core::TaskContext;
use crate::error::{BuildError, OperatorError, QualityGateFailure, Violation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Gate declaration. `tables` is shorthand for a `min_rows: 1` rule per table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualityGateDecl {
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub rules: Vec<QualityRuleDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualityRuleDecl {
    pub table: String,
    #[serde(default)]
    pub min_rows: Option<i64>,
    /// Columns that must never be NULL
    #[serde(default)]
    pub no_nulls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QualityCheck {
    MinRows(i64),
    NoNulls(String),
}

impl fmt::Display for QualityCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MinRows(n) => write!(f, "row count >= {}", n),
            Self::NoNulls(column) => write!(f, "no NULL {}", column),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityRule {
    pub table: String,
    pub check: QualityCheck,
}

impl QualityRule {
    pub fn min_rows(table: impl Into<String>, min: i64) -> Self {
        Self {
            table: table.into(),
            check: QualityCheck::MinRows(min),
        }
    }

    fn count_query(&self) -> String {
        match &self.check {
            QualityCheck::MinRows(_) => format!("SELECT COUNT(*) FROM {};", self.table),
            QualityCheck::NoNulls(column) => format!(
                "SELECT COUNT(*) FROM {} WHERE {} IS NULL;",
                self.table, column
            ),
        }
    }

    fn holds(&self, observed: i64) -> bool {
        match &self.check {
            QualityCheck::MinRows(min) => observed >= *min,
            QualityCheck::NoNulls(_) => observed == 0,
        }
    }
}

impl QualityGateDecl {
    pub(crate) fn resolve(&self, task_id: &str) -> Result<QualityGateOperator, BuildError> {
        let mut rules: Vec<QualityRule> = self
            .tables
            .iter()
            .map(|table| QualityRule::min_rows(table.clone(), 1))
            .collect();

        for decl in &self.rules {
            if decl.min_rows.is_none() && decl.no_nulls.is_empty() {
                rules.push(QualityRule::min_rows(decl.table.clone(), 1));
            }
            if let Some(min) = decl.min_rows {
                rules.push(QualityRule::min_rows(decl.table.clone(), min));
            }
            for column in &decl.no_nulls {
                validate_identifier(task_id, "column", column)?;
                rules.push(QualityRule {
                    table: decl.table.clone(),
                    check: QualityCheck::NoNulls(column.clone()),
                });
            }
        }

        if rules.is_empty() {
            return Err(BuildError::invalid_config(
                task_id,
                "quality gate declares no rules",
            ));
        }
        for rule in &rules {
            validate_identifier(task_id, "table", &rule.table)?;
        }

        Ok(QualityGateOperator { rules })
    }
}

/// Evaluates every rule, then fails if any of them did not hold
#[derive(Debug, Clone)]
pub struct QualityGateOperator {
    pub rules: Vec<QualityRule>,
}

impl QualityGateOperator {
    pub fn new(rules: Vec<QualityRule>) -> Self {
        Self { rules }
    }
}

/// First column of the first row, when present
fn first_count(rule: &QualityRule, rows: &Rows) -> Result<Option<i64>, OperatorError> {
    let Some(value) = rows.first().and_then(|row| row.first()) else {
        return Ok(None);
    };
    value.trim().parse::<i64>().map(Some).map_err(|_| {
        OperatorError::fatal(format!(
            "quality check on {} returned a non-numeric count '{}'",
            rule.table, value
        ))
    })
}

#[async_trait]
impl Operator for QualityGateOperator {
    fn kind(&self) -> &'static str {
        "quality_gate"
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<(), OperatorError> {
        let mut violations = Vec::new();

        for rule in &self.rules {
            ctx.log(format!("Checking {} on {}", rule.check, rule.table));
            let rows = ctx.warehouse().execute(&rule.count_query()).await?;

            let observed = match (first_count(rule, &rows)?, &rule.check) {
                (Some(n), _) => n,
                // an empty result means nothing was counted
                (None, QualityCheck::MinRows(_)) => 0,
                (None, QualityCheck::NoNulls(_)) => {
                    return Err(OperatorError::fatal(format!(
                        "quality check on {} returned no result",
                        rule.table
                    )))
                }
            };

            if rule.holds(observed) {
                ctx.log(format!(
                    "Data quality check passed: {} {} (observed {})",
                    rule.table, rule.check, observed
                ));
            } else {
                ctx.log(format!(
                    "Data quality check failed: {} {} (observed {})",
                    rule.table, rule.check, observed
                ));
                violations.push(Violation {
                    table: rule.table.clone(),
                    check: rule.check.to_string(),
                    observed,
                });
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(QualityGateFailure { violations }.into())
        }
    }
}
