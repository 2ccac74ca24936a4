//! Q objects and comparator lookups.
//!
//! A [`Q`] is either a leaf holding `field-lookup-key -> value` pairs or a
//! compound node combining child Q objects with AND/OR, and may be negated.
//! Keys use the `__` path syntax:
//!
//! ```
//! use terrapin_db::query::Q;
//!
//! // name = 'Alice' AND events.name LIKE '%final%'
//! let q = Q::new("name", "Alice").and_filter("events__name__icontains", "final");
//!
//! // rating > 3 OR NOT (tournament_id = 1)
//! let either = Q::new("rating__gt", 3) | !Q::new("tournament", 1);
//!
//! // The empty Q is an identity for both connectors.
//! assert!((Q::empty() & Q::empty()).is_empty());
//! # let _ = (q, either);
//! ```

use std::ops;

use terrapin_core::{OrmError, OrmResult};

use crate::query::compiler::{CompareOp, Criterion, Term};
use crate::query::expressions::Expression;
use crate::value::Value;

/// Path separator in filter keys.
pub const LOOKUP_SEP: &str = "__";

/// How the children of a compound node are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

#[derive(Debug, Clone)]
enum QNode {
    /// Conjoined filters; empty for the identity node.
    Leaf(Vec<(String, Expression)>),
    Compound {
        connector: Connector,
        children: Vec<Q>,
    },
}

/// A composable filter tree.
#[derive(Debug, Clone)]
pub struct Q {
    node: QNode,
    negated: bool,
}

impl Default for Q {
    fn default() -> Self {
        Self::empty()
    }
}

impl Q {
    /// The identity filter; combining it with another Q yields the other Q.
    pub const fn empty() -> Self {
        Self {
            node: QNode::Leaf(Vec::new()),
            negated: false,
        }
    }

    /// A leaf with one `key -> value` filter.
    pub fn new(key: impl Into<String>, value: impl Into<Expression>) -> Self {
        Self {
            node: QNode::Leaf(vec![(key.into(), value.into())]),
            negated: false,
        }
    }

    /// Adds another filter, conjoined with the existing ones.
    #[must_use]
    pub fn and_filter(self, key: impl Into<String>, value: impl Into<Expression>) -> Self {
        match self {
            Self {
                node: QNode::Leaf(mut filters),
                negated: false,
            } => {
                filters.push((key.into(), value.into()));
                Self {
                    node: QNode::Leaf(filters),
                    negated: false,
                }
            }
            other => other & Self::new(key, value),
        }
    }

    /// Conjunction of all `children`.
    pub fn all(children: impl IntoIterator<Item = Self>) -> Self {
        children.into_iter().fold(Self::empty(), |acc, q| acc & q)
    }

    /// Disjunction of all `children`.
    pub fn any(children: impl IntoIterator<Item = Self>) -> Self {
        children.into_iter().fold(Self::empty(), |acc, q| acc | q)
    }

    #[must_use]
    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// Whether this node filters nothing.
    pub fn is_empty(&self) -> bool {
        match &self.node {
            QNode::Leaf(filters) => filters.is_empty(),
            QNode::Compound { children, .. } => children.iter().all(Self::is_empty),
        }
    }

    pub const fn is_negated(&self) -> bool {
        self.negated
    }

    /// The filters of a leaf node; empty for compound nodes.
    pub fn filters(&self) -> &[(String, Expression)] {
        match &self.node {
            QNode::Leaf(filters) => filters,
            QNode::Compound { .. } => &[],
        }
    }

    /// The children of a compound node; empty for leaves.
    pub fn children(&self) -> &[Self] {
        match &self.node {
            QNode::Leaf(_) => &[],
            QNode::Compound { children, .. } => children,
        }
    }

    /// The connector of a compound node.
    pub const fn connector(&self) -> Option<Connector> {
        match &self.node {
            QNode::Leaf(_) => None,
            QNode::Compound { connector, .. } => Some(*connector),
        }
    }

    fn combine(self, rhs: Self, connector: Connector) -> Self {
        if rhs.is_empty() {
            return self;
        }
        if self.is_empty() {
            return rhs;
        }
        match self {
            Self {
                node:
                    QNode::Compound {
                        connector: c,
                        mut children,
                    },
                negated: false,
            } if c == connector => {
                children.push(rhs);
                Self {
                    node: QNode::Compound {
                        connector,
                        children,
                    },
                    negated: false,
                }
            }
            lhs => Self {
                node: QNode::Compound {
                    connector,
                    children: vec![lhs, rhs],
                },
                negated: false,
            },
        }
    }
}

impl ops::BitAnd for Q {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.combine(rhs, Connector::And)
    }
}

impl ops::BitOr for Q {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.combine(rhs, Connector::Or)
    }
}

impl ops::Not for Q {
    type Output = Self;

    fn not(self) -> Self::Output {
        self.negate()
    }
}

/// Comparator suffix of a filter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Exact,
    Not,
    In,
    NotIn,
    IsNull,
    NotIsNull,
    Gt,
    Gte,
    Lt,
    Lte,
    Range,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    IExact,
}

impl Comparator {
    pub fn parse(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "exact" => Self::Exact,
            "not" => Self::Not,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "isnull" => Self::IsNull,
            "not_isnull" => Self::NotIsNull,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "range" => Self::Range,
            "contains" => Self::Contains,
            "icontains" => Self::IContains,
            "startswith" => Self::StartsWith,
            "istartswith" => Self::IStartsWith,
            "endswith" => Self::EndsWith,
            "iendswith" => Self::IEndsWith,
            "iexact" => Self::IExact,
            _ => return None,
        })
    }

    /// Builds the criterion for `term <comparator> rhs`. `text_column` tells
    /// whether `term` is a text column; LIKE comparators cast other columns
    /// to text first.
    pub fn criterion(self, term: Term, rhs: Term, text_column: bool) -> OrmResult<Criterion> {
        let criterion = match self {
            Self::Exact => match rhs {
                Term::Value(Value::Null) => Criterion::IsNull {
                    term,
                    negated: false,
                },
                rhs => Criterion::compare(term, CompareOp::Eq, rhs),
            },
            Self::Not => match rhs {
                Term::Value(Value::Null) => Criterion::IsNull {
                    term,
                    negated: true,
                },
                rhs => Criterion::compare(term.clone(), CompareOp::Ne, rhs).or(Criterion::IsNull {
                    term,
                    negated: false,
                }),
            },
            Self::In => membership(term, rhs, false)?,
            Self::NotIn => match membership(term.clone(), rhs, true)? {
                Criterion::Always(true) => Criterion::Always(true),
                crit => crit.or(Criterion::IsNull {
                    term,
                    negated: false,
                }),
            },
            Self::IsNull | Self::NotIsNull => {
                let flag = match &rhs {
                    Term::Value(v) => v.as_bool(),
                    _ => None,
                }
                .ok_or_else(|| {
                    OrmError::ParamsError("isnull lookups take a boolean value".to_string())
                })?;
                Criterion::IsNull {
                    term,
                    negated: flag == (self == Self::NotIsNull),
                }
            }
            Self::Gt => Criterion::compare(term, CompareOp::Gt, rhs),
            Self::Gte => Criterion::compare(term, CompareOp::Gte, rhs),
            Self::Lt => Criterion::compare(term, CompareOp::Lt, rhs),
            Self::Lte => Criterion::compare(term, CompareOp::Lte, rhs),
            Self::Range => match rhs {
                Term::Value(Value::List(items)) if items.len() == 2 => {
                    let mut items = items.into_iter();
                    let low = items.next().unwrap_or(Value::Null);
                    let high = items.next().unwrap_or(Value::Null);
                    Criterion::Between {
                        term,
                        low: Term::Value(low),
                        high: Term::Value(high),
                    }
                }
                _ => {
                    return Err(OrmError::ParamsError(
                        "range lookups take a list of two values".to_string(),
                    ))
                }
            },
            Self::Contains | Self::IContains => like(term, &rhs, text_column, self == Self::IContains, |s| {
                format!("%{s}%")
            })?,
            Self::StartsWith | Self::IStartsWith => {
                like(term, &rhs, text_column, self == Self::IStartsWith, |s| format!("{s}%"))?
            }
            Self::EndsWith | Self::IEndsWith => {
                like(term, &rhs, text_column, self == Self::IEndsWith, |s| format!("%{s}"))?
            }
            Self::IExact => like(term, &rhs, text_column, true, str::to_string)?,
        };
        Ok(criterion)
    }
}

fn membership(term: Term, rhs: Term, negated: bool) -> OrmResult<Criterion> {
    match rhs {
        Term::Value(Value::List(items)) if items.is_empty() => Ok(Criterion::Always(negated)),
        Term::Value(Value::List(items)) => Ok(Criterion::In {
            term,
            values: items.into_iter().map(Term::Value).collect(),
            negated,
        }),
        Term::Subquery(select) => Ok(Criterion::InSelect {
            term,
            select,
            negated,
        }),
        other => Err(OrmError::ParamsError(format!(
            "in lookups take a list or a subquery, got {other:?}"
        ))),
    }
}

fn like(
    term: Term,
    rhs: &Term,
    text_column: bool,
    case_insensitive: bool,
    pattern: impl FnOnce(&str) -> String,
) -> OrmResult<Criterion> {
    let text = match rhs {
        Term::Value(Value::String(s)) => s.clone(),
        Term::Value(v) if !v.is_null() => v.group_key(),
        _ => {
            return Err(OrmError::ParamsError(
                "pattern lookups take a non-null literal value".to_string(),
            ))
        }
    };
    let term = if text_column {
        term
    } else {
        Term::Cast {
            term: Box::new(term),
            sql_type: "VARCHAR".to_string(),
        }
    };
    Ok(Criterion::Like {
        term,
        pattern: Term::Value(Value::String(pattern(&escape_like(&text)))),
        case_insensitive,
    })
}

/// Escapes LIKE wildcards with `\`.
pub fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Splits a filter key into its path segments and comparator.
pub fn split_key(key: &str) -> (Vec<&str>, Comparator) {
    let mut parts: Vec<&str> = key.split(LOOKUP_SEP).collect();
    if parts.len() > 1 {
        if let Some(comparator) = parts.last().and_then(|s| Comparator::parse(s)) {
            parts.pop();
            return (parts, comparator);
        }
    }
    (parts, Comparator::Exact)
}
