//! Condition expression trees
//!
//! The store consumes a small expression language to scope deletes and
//! metadata queries: binary comparisons over tag values (`=`, `!=`, `=~`,
//! `!~`, plus ordering operators for `time`), combined with `AND` / `OR`.
//! The reserved variable `_name` refers to the measurement name and `time`
//! to the point timestamp; any other variable beginning with `_` is a
//! system name and is ignored by tag filters.

use crate::types::{TagSet, TimeRange, MAX_TIME, MIN_TIME};
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Reserved variable naming the measurement.
pub const NAME_VAR: &str = "_name";

/// Reserved variable naming the point timestamp.
pub const TIME_VAR: &str = "time";

/// True for reserved variables (leading underscore).
pub fn is_system_name(name: &str) -> bool {
    name.starts_with('_')
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `=`
    Eq,
    /// `!=`
    NotEq,
    /// `=~`
    EqRegex,
    /// `!~`
    NotEqRegex,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
    /// `AND`
    And,
    /// `OR`
    Or,
}

impl Op {
    /// True for the four comparison operators that can match tag values.
    pub fn is_tag_comparison(&self) -> bool {
        matches!(self, Op::Eq | Op::NotEq | Op::EqRegex | Op::NotEqRegex)
    }
}

/// Literal operands.
#[derive(Debug, Clone)]
pub enum Literal {
    /// A string value.
    String(String),
    /// An integer, used for `time` bounds.
    Integer(i64),
    /// A compiled regular expression.
    Regex(Arc<Regex>),
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::String(a), Literal::String(b)) => a == b,
            (Literal::Integer(a), Literal::Integer(b)) => a == b,
            (Literal::Regex(a), Literal::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

/// A condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A variable reference: a tag key or reserved name.
    VarRef(String),
    /// A literal operand.
    Literal(Literal),
    /// A binary operation.
    Binary {
        /// Operator.
        op: Op,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// A variable reference.
    pub fn var(name: impl Into<String>) -> Self {
        Expr::VarRef(name.into())
    }

    /// A string literal.
    pub fn string(value: impl Into<String>) -> Self {
        Expr::Literal(Literal::String(value.into()))
    }

    /// An integer literal.
    pub fn integer(value: i64) -> Self {
        Expr::Literal(Literal::Integer(value))
    }

    /// A regex literal.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Expr::Literal(Literal::Regex(Arc::new(Regex::new(pattern)?))))
    }

    /// A binary expression.
    pub fn binary(op: Op, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// `key = value` over a tag (or reserved name).
    pub fn tag_eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Expr::binary(Op::Eq, Expr::var(key), Expr::string(value))
    }

    /// `_name = measurement`.
    pub fn measurement_eq(measurement: impl Into<String>) -> Self {
        Expr::tag_eq(NAME_VAR, measurement)
    }

    /// `lhs AND rhs`.
    pub fn and(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(Op::And, lhs, rhs)
    }

    /// `lhs OR rhs`.
    pub fn or(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(Op::Or, lhs, rhs)
    }

    /// The variable name on the left side, when this node is a comparison
    /// with a `VarRef` LHS.
    pub fn lhs_var(&self) -> Option<&str> {
        match self {
            Expr::Binary { lhs, .. } => match lhs.as_ref() {
                Expr::VarRef(name) => Some(name),
                _ => None,
            },
            _ => None,
        }
    }

    /// Evaluate against a measurement name and tag set.
    ///
    /// Returns `None` when the truth value cannot be determined from tags
    /// alone (e.g. a field comparison); callers needing a conservative
    /// answer treat `None` as a potential match. A missing tag compares as
    /// the empty string.
    pub fn matches_tags(&self, measurement: &str, tags: &TagSet) -> Option<bool> {
        match self {
            Expr::Binary { op: Op::And, lhs, rhs } => {
                match (lhs.matches_tags(measurement, tags), rhs.matches_tags(measurement, tags)) {
                    (Some(false), _) | (_, Some(false)) => Some(false),
                    (Some(true), Some(true)) => Some(true),
                    _ => None,
                }
            }
            Expr::Binary { op: Op::Or, lhs, rhs } => {
                match (lhs.matches_tags(measurement, tags), rhs.matches_tags(measurement, tags)) {
                    (Some(true), _) | (_, Some(true)) => Some(true),
                    (Some(false), Some(false)) => Some(false),
                    _ => None,
                }
            }
            Expr::Binary { op, lhs, rhs } if op.is_tag_comparison() => {
                let name = match lhs.as_ref() {
                    Expr::VarRef(name) => name,
                    _ => return None,
                };
                if name == TIME_VAR {
                    return None;
                }
                let actual = if name == NAME_VAR {
                    measurement
                } else if is_system_name(name) {
                    return None;
                } else {
                    tags.get(name).unwrap_or("")
                };
                match (op, rhs.as_ref()) {
                    (Op::Eq, Expr::Literal(Literal::String(want))) => Some(actual == want),
                    (Op::NotEq, Expr::Literal(Literal::String(want))) => Some(actual != want),
                    (Op::EqRegex, Expr::Literal(Literal::Regex(re))) => Some(re.is_match(actual)),
                    (Op::NotEqRegex, Expr::Literal(Literal::Regex(re))) => Some(!re.is_match(actual)),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::VarRef(name) => write!(f, "{name}"),
            Expr::Literal(Literal::String(s)) => write!(f, "'{s}'"),
            Expr::Literal(Literal::Integer(i)) => write!(f, "{i}"),
            Expr::Literal(Literal::Regex(re)) => write!(f, "/{}/", re.as_str()),
            Expr::Binary { op, lhs, rhs } => {
                let op = match op {
                    Op::Eq => "=",
                    Op::NotEq => "!=",
                    Op::EqRegex => "=~",
                    Op::NotEqRegex => "!~",
                    Op::Lt => "<",
                    Op::LtEq => "<=",
                    Op::Gt => ">",
                    Op::GtEq => ">=",
                    Op::And => "AND",
                    Op::Or => "OR",
                };
                write!(f, "({lhs} {op} {rhs})")
            }
        }
    }
}

/// Rewrite an expression bottom-up.
///
/// `f` is applied to every node after its children have been rewritten;
/// returning `None` removes the node. A binary node whose operand was
/// removed collapses to the surviving operand.
pub fn rewrite(expr: Expr, f: &impl Fn(Expr) -> Option<Expr>) -> Option<Expr> {
    let expr = match expr {
        Expr::Binary { op, lhs, rhs } => {
            let lhs = rewrite(*lhs, f);
            let rhs = rewrite(*rhs, f);
            match (lhs, rhs) {
                (Some(lhs), Some(rhs)) => Expr::binary(op, lhs, rhs),
                (Some(side), None) | (None, Some(side)) => side,
                (None, None) => return None,
            }
        }
        other => other,
    };
    f(expr)
}

/// Simplify an expression: `x AND x` / `x OR x` collapse to `x`.
pub fn reduce(expr: Expr) -> Expr {
    match expr {
        Expr::Binary { op, lhs, rhs } if matches!(op, Op::And | Op::Or) => {
            let lhs = reduce(*lhs);
            let rhs = reduce(*rhs);
            if lhs == rhs {
                lhs
            } else {
                Expr::binary(op, lhs, rhs)
            }
        }
        other => other,
    }
}

/// Keep only comparisons against the reserved measurement name.
///
/// The result selects measurements; every comparison whose LHS is not
/// `_name` is dropped.
pub fn measurement_expr(cond: &Expr) -> Option<Expr> {
    rewrite(cond.clone(), &|e| match &e {
        Expr::Binary { op, .. } if op.is_tag_comparison() => match e.lhs_var() {
            Some(NAME_VAR) => Some(e),
            _ => None,
        },
        _ => Some(e),
    })
    .map(reduce)
}

/// Keep only comparisons against user tags.
///
/// The result filters series by tag value; comparisons whose LHS is a
/// system name (or not a variable) are dropped.
pub fn filter_expr(cond: &Expr) -> Option<Expr> {
    rewrite(cond.clone(), &|e| match &e {
        Expr::Binary { op, .. } if op.is_tag_comparison() => match e.lhs_var() {
            Some(name) if !is_system_name(name) && name != TIME_VAR => Some(e),
            _ => None,
        },
        _ => Some(e),
    })
    .map(reduce)
}

/// Split a condition into its non-time part and the time range it implies.
///
/// Comparisons of the form `time <op> <integer>` are removed from the
/// expression and folded into the returned range; the range defaults to
/// `[MIN_TIME, MAX_TIME]` on each unconstrained side.
pub fn condition_time_range(cond: Option<&Expr>) -> (Option<Expr>, TimeRange) {
    let Some(cond) = cond else {
        return (None, TimeRange::unbounded());
    };

    let mut min = MIN_TIME;
    let mut max = MAX_TIME;
    collect_time_bounds(cond, &mut min, &mut max);

    let remaining = rewrite(cond.clone(), &|e| match &e {
        Expr::Binary { .. } if e.lhs_var() == Some(TIME_VAR) => None,
        _ => Some(e),
    })
    .map(reduce);

    (remaining, TimeRange::new(min, max))
}

fn collect_time_bounds(expr: &Expr, min: &mut i64, max: &mut i64) {
    if let Expr::Binary { op, lhs, rhs } = expr {
        match op {
            Op::And => {
                collect_time_bounds(lhs, min, max);
                collect_time_bounds(rhs, min, max);
            }
            _ => {
                let is_time = matches!(lhs.as_ref(), Expr::VarRef(name) if name == TIME_VAR);
                if !is_time {
                    return;
                }
                let Expr::Literal(Literal::Integer(ts)) = rhs.as_ref() else {
                    return;
                };
                match op {
                    Op::GtEq => *min = (*min).max(*ts),
                    Op::Gt => *min = (*min).max(ts.saturating_add(1)),
                    Op::LtEq => *max = (*max).min(*ts),
                    Op::Lt => *max = (*max).min(ts.saturating_sub(1)),
                    Op::Eq => {
                        *min = (*min).max(*ts);
                        *max = (*max).min(*ts);
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs.iter().copied().collect()
    }

    #[test]
    fn matches_measurement_and_tag() {
        let cond = Expr::and(
            Expr::measurement_eq("cpu"),
            Expr::tag_eq("host", "a"),
        );
        assert_eq!(cond.matches_tags("cpu", &tags(&[("host", "a")])), Some(true));
        assert_eq!(cond.matches_tags("cpu", &tags(&[("host", "b")])), Some(false));
        assert_eq!(cond.matches_tags("mem", &tags(&[("host", "a")])), Some(false));
    }

    #[test]
    fn missing_tag_compares_as_empty() {
        let cond = Expr::tag_eq("host", "");
        assert_eq!(cond.matches_tags("cpu", &TagSet::new()), Some(true));
    }

    #[test]
    fn regex_comparison() {
        let cond = Expr::binary(
            Op::EqRegex,
            Expr::var("host"),
            Expr::regex("^web-[0-9]+$").unwrap(),
        );
        assert_eq!(cond.matches_tags("cpu", &tags(&[("host", "web-12")])), Some(true));
        assert_eq!(cond.matches_tags("cpu", &tags(&[("host", "db-1")])), Some(false));
    }

    #[test]
    fn field_comparison_is_unknown() {
        let cond = Expr::binary(Op::Gt, Expr::var("usage"), Expr::integer(10));
        assert_eq!(cond.matches_tags("cpu", &TagSet::new()), None);
        // AND with an unknown side stays unknown unless the other side is false.
        let combined = Expr::and(cond, Expr::measurement_eq("mem"));
        assert_eq!(combined.matches_tags("cpu", &TagSet::new()), Some(false));
    }

    #[test]
    fn measurement_expr_drops_tag_comparisons() {
        let cond = Expr::and(
            Expr::measurement_eq("cpu"),
            Expr::tag_eq("host", "a"),
        );
        let m = measurement_expr(&cond).unwrap();
        assert_eq!(m, Expr::measurement_eq("cpu"));
    }

    #[test]
    fn filter_expr_drops_system_names() {
        let cond = Expr::and(
            Expr::measurement_eq("cpu"),
            Expr::tag_eq("host", "a"),
        );
        let f = filter_expr(&cond).unwrap();
        assert_eq!(f, Expr::tag_eq("host", "a"));
    }

    #[test]
    fn filter_expr_can_remove_everything() {
        let cond = Expr::measurement_eq("cpu");
        assert_eq!(filter_expr(&cond), None);
    }

    #[test]
    fn time_bounds_extracted_and_stripped() {
        let cond = Expr::and(
            Expr::binary(Op::GtEq, Expr::var(TIME_VAR), Expr::integer(100)),
            Expr::and(
                Expr::binary(Op::Lt, Expr::var(TIME_VAR), Expr::integer(200)),
                Expr::tag_eq("host", "a"),
            ),
        );
        let (rest, range) = condition_time_range(Some(&cond));
        assert_eq!(range, TimeRange::new(100, 199));
        assert_eq!(rest, Some(Expr::tag_eq("host", "a")));
    }

    #[test]
    fn no_condition_is_unbounded() {
        let (rest, range) = condition_time_range(None);
        assert!(rest.is_none());
        assert!(range.is_unbounded());
    }

    #[test]
    fn reduce_collapses_duplicate_sides() {
        let e = Expr::and(Expr::tag_eq("a", "1"), Expr::tag_eq("a", "1"));
        assert_eq!(reduce(e), Expr::tag_eq("a", "1"));
    }
}
