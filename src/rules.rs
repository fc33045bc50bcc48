//! Rule Evaluator.
//!
//! Evaluates named [`StateRule`]s against live tag values. The evaluator is
//! stateless: one call reads the rule's tags once and answers. Waiting until a
//! rule holds is the Validation step's job (see [`crate::interpreter`]).
//!
//! `multi_condition` rules are a logical AND over every condition, and every
//! listed tag is read before any comparison so the reported observation is
//! complete even when an early condition already fails.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::trace;

use crate::definition::{Condition, Operand, Operator, StateRule};
use crate::error::{Observed, ObservedTag, RuleError, TagError};
use crate::tags::{TagStore, TagValue};

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// True when every condition held.
    pub satisfied: bool,
    /// Values read for this evaluation, one entry per distinct tag.
    pub observed: Observed,
}

/// Applies `operator` to two tag values.
///
/// Booleans only support `equal` and `not_equal` and are never coerced to
/// numbers. Two ints compare as integers; any other numeric pair compares as
/// floats. Returns `None` when the pair cannot be compared.
pub fn compare(operator: Operator, actual: TagValue, expected: TagValue) -> Option<bool> {
    use std::cmp::Ordering;

    let ordering = match (actual, expected) {
        (TagValue::Bool(a), TagValue::Bool(b)) => {
            return match operator {
                Operator::Equal => Some(a == b),
                Operator::NotEqual => Some(a != b),
                _ => None,
            };
        }
        (TagValue::Bool(_), _) | (_, TagValue::Bool(_)) => return None,
        (TagValue::Int(a), TagValue::Int(b)) => a.cmp(&b),
        (a, b) => {
            let (a, b) = (a.as_f64()?, b.as_f64()?);
            a.partial_cmp(&b)?
        }
    };

    Some(match operator {
        Operator::Equal => ordering == Ordering::Equal,
        Operator::NotEqual => ordering != Ordering::Equal,
        Operator::LessThan => ordering == Ordering::Less,
        Operator::LessThanEqual => ordering != Ordering::Greater,
        Operator::GreaterThan => ordering == Ordering::Greater,
        Operator::GreaterThanEqual => ordering != Ordering::Less,
    })
}

/// Evaluates named state rules.
#[derive(Debug, Clone)]
pub struct RuleEvaluator {
    rules: Arc<HashMap<String, StateRule>>,
}

impl RuleEvaluator {
    /// Evaluator over the given rules.
    pub fn new(rules: Arc<HashMap<String, StateRule>>) -> Self {
        Self { rules }
    }

    /// Looks up a rule.
    pub fn rule(&self, name: &str) -> Option<&StateRule> {
        self.rules.get(name)
    }

    /// Evaluates `name` once.
    ///
    /// `params` fills `{"param": ..}` operands, falling back to the rule's
    /// defaults. A tag without a value yet ([`TagError::Unavailable`]) makes the
    /// rule unsatisfied rather than failing it; any other read error fails.
    pub async fn evaluate(
        &self,
        name: &str,
        params: &HashMap<String, TagValue>,
        tags: &dyn TagStore,
    ) -> Result<Evaluation, RuleError> {
        let rule = self
            .rules
            .get(name)
            .ok_or_else(|| RuleError::UnknownRule(name.to_string()))?;

        let expected: Vec<TagValue> = rule
            .conditions()
            .iter()
            .map(|c| operand_value(rule, c, params))
            .collect::<Result<_, _>>()?;

        let mut observed: Vec<ObservedTag> = Vec::new();
        for condition in rule.conditions() {
            if observed.iter().any(|o| o.tag == condition.tag) {
                continue;
            }
            let value = match tags.read(&condition.tag).await {
                Ok(v) => Some(v),
                Err(TagError::Unavailable(_)) => None,
                Err(e) => return Err(e.into()),
            };
            observed.push(ObservedTag {
                tag: condition.tag.clone(),
                value,
            });
        }

        let mut satisfied = true;
        for (condition, expected) in rule.conditions().iter().zip(expected) {
            let actual = observed
                .iter()
                .find(|o| o.tag == condition.tag)
                .and_then(|o| o.value);
            let Some(actual) = actual else {
                satisfied = false;
                continue;
            };
            let holds = compare(condition.operator, actual, expected).ok_or_else(|| {
                RuleError::Incomparable {
                    tag: condition.tag.clone(),
                    operator: condition.operator.to_string(),
                    actual,
                    expected,
                }
            })?;
            satisfied &= holds;
        }

        trace!(rule = name, satisfied, "rule evaluated");
        Ok(Evaluation {
            satisfied,
            observed: Observed(observed),
        })
    }
}

fn operand_value(
    rule: &StateRule,
    condition: &Condition,
    params: &HashMap<String, TagValue>,
) -> Result<TagValue, RuleError> {
    match &condition.value {
        Operand::Literal(v) => Ok(*v),
        Operand::Param(p) => params
            .get(p)
            .or_else(|| rule.defaults.get(p))
            .copied()
            .ok_or_else(|| RuleError::MissingParam {
                rule: rule.name.clone(),
                param: p.clone(),
            }),
    }
}
