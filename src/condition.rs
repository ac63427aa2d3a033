use crate::permission::{Condition, LogicalOperator, Operator};
use crate::value::Value;
use lru::LruCache;
use regex::{Regex, RegexBuilder};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

const REGEX_CACHE_CAPACITY: usize = 256;

/// Outcome of a single condition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionResult {
    pub field: String,
    pub operator: Operator,
    pub expected: Value,
    /// Resolved context value; `Null` when the path was absent.
    pub actual: Value,
    pub logical_operator: LogicalOperator,
    pub passed: bool,
}

impl ConditionResult {
    /// Whether this result pulled the combined outcome of a list of two or
    /// more conditions towards denial. A lone condition is judged on
    /// `passed` alone, see [`combine`].
    pub fn is_blocking(&self) -> bool {
        match self.logical_operator {
            LogicalOperator::Not => self.passed,
            LogicalOperator::And | LogicalOperator::Or => !self.passed,
        }
    }

    fn predicate(&self) -> String {
        format!("{} {} {}", self.field, self.operator, self.expected)
    }
}

impl fmt::Display for ConditionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.logical_operator == LogicalOperator::Not {
            f.write_str("NOT ")?;
        }
        f.write_str(&self.predicate())
    }
}

/// Combined outcome of a condition list.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionOutcome {
    pub passed: bool,
    pub results: Vec<ConditionResult>,
}

impl ConditionOutcome {
    /// Human-readable list of the conditions that caused a denial.
    pub fn unmet_summary(&self) -> String {
        if let [only] = self.results.as_slice() {
            return if only.passed {
                String::new()
            } else {
                only.predicate()
            };
        }
        self.results
            .iter()
            .filter(|result| result.is_blocking())
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Evaluator for permission conditions.
///
/// Evaluation never fails: malformed conditions (unknown operator, invalid
/// regex, non-comparable operands) are logged and evaluate to `false`.
/// `REGEX` patterns are compiled once and kept in a bounded LRU memo;
/// invalid patterns are remembered too and warned about once.
pub struct ConditionEvaluator {
    regexes: Mutex<LruCache<String, Option<Regex>>>,
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        let capacity = NonZeroUsize::new(REGEX_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            regexes: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates one condition against a context tree.
    pub fn evaluate(&self, condition: &Condition, context: &Value) -> ConditionResult {
        let actual = context.resolve(&condition.field);
        let passed = self.compare(&condition.operator, actual, &condition.value, &condition.field);
        ConditionResult {
            field: condition.field.clone(),
            operator: condition.operator.clone(),
            expected: condition.value.clone(),
            actual: actual.cloned().unwrap_or_default(),
            logical_operator: condition.logical_operator.unwrap_or_default(),
            passed,
        }
    }

    /// Evaluates a condition list in declaration order and combines it.
    pub fn evaluate_all(&self, conditions: &[Condition], context: &Value) -> ConditionOutcome {
        let results: Vec<ConditionResult> = conditions
            .iter()
            .map(|condition| self.evaluate(condition, context))
            .collect();
        ConditionOutcome {
            passed: combine(&results),
            results,
        }
    }

    fn compare(
        &self,
        operator: &Operator,
        actual: Option<&Value>,
        expected: &Value,
        field: &str,
    ) -> bool {
        match operator {
            Operator::Eq => values_equal(actual, expected),
            Operator::Ne => !values_equal(actual, expected),
            Operator::In | Operator::Nin => {
                let Some(candidates) = expected.as_list() else {
                    warn!(field, %operator, "membership operator requires a list value");
                    return false;
                };
                let actual = actual.cloned().unwrap_or_default();
                let found = candidates.contains(&actual);
                if *operator == Operator::In { found } else { !found }
            }
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                let Some((lhs, rhs)) = numeric_operands(actual, expected, field, operator) else {
                    return false;
                };
                match operator {
                    Operator::Gt => lhs > rhs,
                    Operator::Gte => lhs >= rhs,
                    Operator::Lt => lhs < rhs,
                    _ => lhs <= rhs,
                }
            }
            Operator::Contains => {
                if let Some(Value::List(items)) = actual {
                    return items.contains(expected);
                }
                string_operands(actual, expected)
                    .is_some_and(|(lhs, rhs)| lhs.to_lowercase().contains(&rhs.to_lowercase()))
            }
            Operator::StartsWith => {
                string_operands(actual, expected).is_some_and(|(lhs, rhs)| lhs.starts_with(&rhs))
            }
            Operator::EndsWith => {
                string_operands(actual, expected).is_some_and(|(lhs, rhs)| lhs.ends_with(&rhs))
            }
            Operator::Regex => self.regex_matches(actual, expected, field),
            Operator::Unrecognized(name) => {
                warn!(field, operator = %name, "unknown condition operator; treating as unmet");
                false
            }
        }
    }

    fn regex_matches(&self, actual: Option<&Value>, expected: &Value, field: &str) -> bool {
        let Some(pattern) = expected.coerce_string() else {
            warn!(field, %expected, "regex condition requires a string pattern");
            return false;
        };
        let Some(regex) = self.compiled(&pattern, field) else {
            return false;
        };
        actual
            .and_then(Value::coerce_string)
            .is_some_and(|text| regex.is_match(&text))
    }

    fn compiled(&self, pattern: &str, field: &str) -> Option<Regex> {
        let mut regexes = self.regexes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = regexes.get(pattern) {
            return cached.clone();
        }
        let compiled = match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => Some(regex),
            Err(error) => {
                warn!(field, pattern, %error, "invalid regex in condition");
                None
            }
        };
        regexes.put(pattern.to_string(), compiled.clone());
        compiled
    }

    fn compiled_patterns(&self) -> usize {
        self.regexes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl fmt::Debug for ConditionEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionEvaluator")
            .field("compiled_patterns", &self.compiled_patterns())
            .finish()
    }
}

/// Positional left fold over condition results.
///
/// Starting from `true`, an `OR` result is or-ed in, a `NOT` result is
/// and-ed in negated, anything else is and-ed in. An empty list passes; a
/// single condition yields its own result regardless of its operator.
pub fn combine(results: &[ConditionResult]) -> bool {
    match results {
        [] => true,
        [only] => only.passed,
        _ => results.iter().fold(true, |acc, result| match result.logical_operator {
            LogicalOperator::Or => acc || result.passed,
            LogicalOperator::Not => acc && !result.passed,
            LogicalOperator::And => acc && result.passed,
        }),
    }
}

fn values_equal(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        Some(actual) => actual == expected,
        None => expected.is_null(),
    }
}

fn numeric_operands(
    actual: Option<&Value>,
    expected: &Value,
    field: &str,
    operator: &Operator,
) -> Option<(f64, f64)> {
    let Some(actual) = actual else {
        debug!(field, %operator, "numeric comparison against absent field");
        return None;
    };
    match (actual.as_number(), expected.as_number()) {
        (Some(lhs), Some(rhs)) => Some((lhs, rhs)),
        _ => {
            warn!(field, %operator, %actual, %expected, "non-numeric operands");
            None
        }
    }
}

fn string_operands(actual: Option<&Value>, expected: &Value) -> Option<(String, String)> {
    Some((actual?.coerce_string()?, expected.coerce_string()?))
}
