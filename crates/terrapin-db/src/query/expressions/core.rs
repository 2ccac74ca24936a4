//! Query expressions, aggregates and F-references.
//!
//! [`Expression`] is what annotations, filter values and custom orderings are
//! written in. Field references are plain `__` paths resolved later against
//! the model, so `Expression::f("events__name")` joins `events` when used.
//!
//! ```
//! use terrapin_db::query::expressions::{AggregateFunc, Expression};
//!
//! // rating * 7 + 3
//! let score = Expression::f("rating") * 7 + 3;
//!
//! // COUNT(events)
//! let events = Expression::aggregate(AggregateFunc::Count, Expression::f("events"));
//! assert!(events.contains_aggregate());
//! assert!(!score.contains_aggregate());
//! ```

use std::ops;

use crate::query::compiler::ArithOp;
use crate::query::lookups::Q;
use crate::query::queryset::QuerySet;
use crate::value::Value;

/// A value-producing expression.
#[derive(Debug, Clone)]
pub enum Expression {
    /// A literal, bound as a parameter.
    Value(Value),
    /// A field path of the current model (`rating`, `tournament__name`).
    F(String),
    /// A field of the enclosing query, inside a subquery.
    OuterRef(String),
    /// Verbatim SQL.
    Raw(String),
    /// A plain SQL function call.
    Func { name: String, args: Vec<Expression> },
    Aggregate {
        func: AggregateFunc,
        arg: Box<Expression>,
        distinct: bool,
    },
    Arith {
        op: ArithOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Case {
        whens: Vec<When>,
        default: Option<Box<Expression>>,
    },
    /// A nested query producing one column.
    Subquery(Box<QuerySet>),
    /// A random number, for random ordering.
    Random,
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub const fn sql_name(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

/// One `WHEN condition THEN value` branch.
#[derive(Debug, Clone)]
pub struct When {
    pub condition: Q,
    pub then: Expression,
}

impl When {
    pub fn new(condition: Q, then: impl Into<Expression>) -> Self {
        Self {
            condition,
            then: then.into(),
        }
    }
}

impl Expression {
    pub fn f(path: impl Into<String>) -> Self {
        Self::F(path.into())
    }

    pub fn value(v: impl Into<Value>) -> Self {
        Self::Value(v.into())
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Self::Raw(sql.into())
    }

    pub fn func(name: impl Into<String>, args: Vec<Self>) -> Self {
        Self::Func {
            name: name.into(),
            args,
        }
    }

    pub fn aggregate(func: AggregateFunc, arg: Self) -> Self {
        Self::Aggregate {
            func,
            arg: Box::new(arg),
            distinct: false,
        }
    }

    pub fn aggregate_distinct(func: AggregateFunc, arg: Self) -> Self {
        Self::Aggregate {
            func,
            arg: Box::new(arg),
            distinct: true,
        }
    }

    pub fn case(whens: Vec<When>, default: Option<Self>) -> Self {
        Self::Case {
            whens,
            default: default.map(Box::new),
        }
    }

    fn arith(op: ArithOp, left: Self, right: Self) -> Self {
        Self::Arith {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Whether resolving this expression forces grouping.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Self::Aggregate { .. } => true,
            Self::Func { args, .. } => args.iter().any(Self::contains_aggregate),
            Self::Arith { left, right, .. } => left.contains_aggregate() || right.contains_aggregate(),
            Self::Case { whens, default } => {
                whens.iter().any(|w| w.then.contains_aggregate())
                    || default.as_deref().is_some_and(Self::contains_aggregate)
            }
            Self::Value(_)
            | Self::F(_)
            | Self::OuterRef(_)
            | Self::Raw(_)
            | Self::Subquery(_)
            | Self::Random => false,
        }
    }
}

macro_rules! expression_from_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Expression {
                fn from(v: $ty) -> Self {
                    Self::Value(Value::from(v))
                }
            }
        )*
    };
}

expression_from_value!(
    bool,
    i16,
    i32,
    i64,
    u32,
    f32,
    f64,
    String,
    &str,
    Vec<Value>,
    chrono::NaiveDate,
    chrono::NaiveDateTime,
    chrono::DateTime<chrono::Utc>,
    chrono::NaiveTime,
    uuid::Uuid,
    serde_json::Value,
);

impl From<Value> for Expression {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Expression {
    fn from(v: Option<T>) -> Self {
        Self::Value(v.into())
    }
}

impl From<QuerySet> for Expression {
    fn from(qs: QuerySet) -> Self {
        Self::Subquery(Box::new(qs))
    }
}

macro_rules! arith_op {
    ($($trait:ident :: $method:ident => $op:ident),* $(,)?) => {
        $(
            impl<T: Into<Expression>> ops::$trait<T> for Expression {
                type Output = Self;
                fn $method(self, rhs: T) -> Self::Output {
                    Self::arith(ArithOp::$op, self, rhs.into())
                }
            }
        )*
    };
}

arith_op! {
    Add::add => Add,
    Sub::sub => Sub,
    Mul::mul => Mul,
    Div::div => Div,
    Rem::rem => Mod,
}
