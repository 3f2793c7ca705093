//! PromQL tenancy enforcement: parse a query, constrain every selector with
//! the tenant's label matchers, serialise it back.

use promql_parser::label::{MatchOp, Matcher, Matchers};
use promql_parser::parser::{self, Expr};
use regex::Regex;
use thiserror::Error;

use crate::auth::Tenancy;

/// Label carrying the tenant namespace on every series.
pub const NAMESPACE_LABEL: &str = "namespace";

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("invalid PromQL query: {0}")]
    Parse(String),
    #[error("query already constrains label {label:?}")]
    ConflictingMatcher { label: String },
    #[error("matcher pattern for label {label:?} doesn't compile: {source}")]
    InvalidPattern {
        label: String,
        #[source]
        source: regex::Error,
    },
    #[error("unsupported expression construct")]
    UnsupportedExpression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Equal,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMatcher {
    pub name: String,
    pub kind: MatchKind,
    pub value: String,
}

/// The ordered list of matchers injected into every selector for one
/// tenancy: one regex-OR matcher per extra label (lexicographic label
/// order), then the `namespace` matcher (equality when the tenancy holds a
/// single namespace, regex-OR otherwise).
///
/// Values are joined as raw regex fragments, without escaping: namespaces
/// and label values are administratively controlled, never user input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewritePlan {
    pub matchers: Vec<PlannedMatcher>,
}

impl RewritePlan {
    pub fn from_tenancy(tenancy: &Tenancy) -> Self {
        let mut matchers = Vec::with_capacity(tenancy.labels.len() + 1);

        for (label, values) in &tenancy.labels {
            matchers.push(PlannedMatcher {
                name: label.clone(),
                kind: MatchKind::Regex,
                value: values.join("|"),
            });
        }

        match tenancy.namespaces.as_slice() {
            [] => {}
            [namespace] => matchers.push(PlannedMatcher {
                name: NAMESPACE_LABEL.to_owned(),
                kind: MatchKind::Equal,
                value: namespace.clone(),
            }),
            namespaces => matchers.push(PlannedMatcher {
                name: NAMESPACE_LABEL.to_owned(),
                kind: MatchKind::Regex,
                value: namespaces.join("|"),
            }),
        }

        Self { matchers }
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }
}

/// Parses `query` and appends every planned matcher to every vector, matrix
/// and subquery selector, then re-serialises the expression.
///
/// A selector that already constrains one of the planned labels is only
/// accepted when its matcher is identical to the planned one; anything else
/// would let a query weaken the tenancy and is rejected.
pub fn enforce(query: &str, plan: &RewritePlan) -> Result<String, RewriteError> {
    let mut expr = parser::parse(query).map_err(RewriteError::Parse)?;
    inject_expr(&mut expr, plan)?;
    Ok(expr.to_string())
}

fn inject_expr(expr: &mut Expr, plan: &RewritePlan) -> Result<(), RewriteError> {
    match expr {
        Expr::VectorSelector(selector) => inject_matchers(&mut selector.matchers, plan),
        Expr::MatrixSelector(selector) => inject_matchers(&mut selector.vs.matchers, plan),
        Expr::Subquery(subquery) => inject_expr(&mut subquery.expr, plan),
        Expr::Paren(paren) => inject_expr(&mut paren.expr, plan),
        Expr::Unary(unary) => inject_expr(&mut unary.expr, plan),
        Expr::Binary(binary) => {
            inject_expr(&mut binary.lhs, plan)?;
            inject_expr(&mut binary.rhs, plan)
        }
        Expr::Aggregate(aggregate) => {
            if let Some(param) = aggregate.param.as_deref_mut() {
                inject_expr(param, plan)?;
            }
            inject_expr(&mut aggregate.expr, plan)
        }
        Expr::Call(call) => {
            for arg in &mut call.args.args {
                inject_expr(arg, plan)?;
            }
            Ok(())
        }
        Expr::NumberLiteral(_) | Expr::StringLiteral(_) => Ok(()),
        // Any selector variant this walk doesn't know about must not pass
        // through unconstrained.
        _ => Err(RewriteError::UnsupportedExpression),
    }
}

fn inject_matchers(matchers: &mut Matchers, plan: &RewritePlan) -> Result<(), RewriteError> {
    // With `or`-joined matcher groups the plain list may be empty; injecting
    // into it anyway would add matchers to a group the selector never uses.
    if !matchers.matchers.is_empty() || matchers.or_matchers.is_empty() {
        inject_group(&mut matchers.matchers, plan)?;
    }

    for group in &mut matchers.or_matchers {
        inject_group(group, plan)?;
    }

    Ok(())
}

fn inject_group(group: &mut Vec<Matcher>, plan: &RewritePlan) -> Result<(), RewriteError> {
    for planned in &plan.matchers {
        if let Some(existing) = group.iter().find(|matcher| matcher.name == planned.name) {
            if is_equivalent(existing, planned) {
                continue;
            }

            return Err(RewriteError::ConflictingMatcher {
                label: planned.name.clone(),
            });
        }

        group.push(build_matcher(planned)?);
    }

    Ok(())
}

fn is_equivalent(existing: &Matcher, planned: &PlannedMatcher) -> bool {
    if existing.value != planned.value {
        return false;
    }

    matches!(
        (&existing.op, planned.kind),
        (MatchOp::Equal, MatchKind::Equal) | (MatchOp::Re(_), MatchKind::Regex)
    )
}

fn build_matcher(planned: &PlannedMatcher) -> Result<Matcher, RewriteError> {
    let op = match planned.kind {
        MatchKind::Equal => MatchOp::Equal,
        MatchKind::Regex => MatchOp::Re(Regex::new(&planned.value).map_err(|source| {
            RewriteError::InvalidPattern {
                label: planned.name.clone(),
                source,
            }
        })?),
    };

    Ok(Matcher {
        op,
        name: planned.name.clone(),
        value: planned.value.clone(),
    })
}
