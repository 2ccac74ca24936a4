//! SQL AST and compiler.
//!
//! Resolution produces a small SQL AST ([`Select`], [`Term`], [`Criterion`],
//! [`Join`]) that is independent of the target database. [`SqlCompiler`]
//! renders it for one [`Dialect`], collecting parameters into a single list
//! so that nested subqueries keep consistent placeholder numbering on
//! PostgreSQL (`$1, $2, ...`). SQLite and MySQL use `?`.

use crate::value::Value;

/// LIMIT emitted when OFFSET is given without LIMIT on dialects that
/// cannot express an unbounded OFFSET.
pub const IMPLICIT_LIMIT: u64 = 1_000_000;

/// SQL dialect of a database engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    SQLite,
    PostgreSQL,
    MySQL,
}

impl Dialect {
    /// Maps a configured engine name onto a dialect.
    pub fn from_engine(engine: &str) -> Option<Self> {
        match engine.to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Some(Self::SQLite),
            "postgres" | "postgresql" | "psql" => Some(Self::PostgreSQL),
            "mysql" | "mariadb" => Some(Self::MySQL),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::SQLite => "sqlite",
            Self::PostgreSQL => "postgres",
            Self::MySQL => "mysql",
        }
    }

    pub const fn quote_char(self) -> char {
        match self {
            Self::MySQL => '`',
            Self::SQLite | Self::PostgreSQL => '"',
        }
    }

    /// Quotes an identifier, doubling embedded quote characters.
    pub fn quote(self, ident: &str) -> String {
        let q = self.quote_char();
        let escaped = ident.replace(q, &format!("{q}{q}"));
        format!("{q}{escaped}{q}")
    }

    /// Parameter placeholder for the given 1-based index.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::PostgreSQL => format!("${index}"),
            Self::SQLite | Self::MySQL => "?".to_string(),
        }
    }

    /// Whether OFFSET is only valid together with LIMIT.
    pub const fn requires_limit(self) -> bool {
        matches!(self, Self::SQLite | Self::MySQL)
    }

    /// Whether comments are part of the column/table definition.
    pub const fn inline_comments(self) -> bool {
        matches!(self, Self::SQLite | Self::MySQL)
    }

    const fn like_escape(self) -> &'static str {
        match self {
            Self::MySQL => "'\\\\'",
            Self::SQLite | Self::PostgreSQL => "'\\'",
        }
    }
}

/// A table in FROM or JOIN position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
        }
    }

    pub fn aliased(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: Some(alias.into()),
        }
    }

    /// The name columns are qualified with.
    pub fn ident(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
        }
    }
}

/// A value-producing SQL fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// `"table"."column"`, or just `"column"` when `table` is empty.
    Column { table: String, column: String },
    /// Reference to a select-list alias.
    Alias(String),
    /// A bound parameter.
    Value(Value),
    /// Verbatim SQL.
    Raw(String),
    Func {
        name: String,
        args: Vec<Term>,
        distinct: bool,
    },
    Arith {
        op: ArithOp,
        left: Box<Term>,
        right: Box<Term>,
    },
    Cast {
        term: Box<Term>,
        sql_type: String,
    },
    Case {
        whens: Vec<(Criterion, Term)>,
        default: Option<Box<Term>>,
    },
    Subquery(Box<Select>),
    /// `RANDOM()` or the dialect's equivalent.
    Random,
    Star,
}

impl Term {
    pub fn column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::Column {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn func(name: impl Into<String>, args: Vec<Self>) -> Self {
        Self::Func {
            name: name.into(),
            args,
            distinct: false,
        }
    }
}

/// Binary comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// A boolean SQL condition.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Criterion {
    /// No condition. Identity for both `and` and `or`.
    #[default]
    Empty,
    /// A constant truth value.
    Always(bool),
    Compare {
        left: Term,
        op: CompareOp,
        right: Term,
    },
    In {
        term: Term,
        values: Vec<Term>,
        negated: bool,
    },
    InSelect {
        term: Term,
        select: Box<Select>,
        negated: bool,
    },
    Between {
        term: Term,
        low: Term,
        high: Term,
    },
    IsNull {
        term: Term,
        negated: bool,
    },
    /// LIKE with a `\` escape character.
    Like {
        term: Term,
        pattern: Term,
        case_insensitive: bool,
    },
    And(Vec<Criterion>),
    Or(Vec<Criterion>),
    Not(Box<Criterion>),
    Raw(String),
}

impl Criterion {
    pub fn compare(left: Term, op: CompareOp, right: Term) -> Self {
        Self::Compare { left, op, right }
    }

    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Conjunction; `Empty` on either side is absorbed.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::Empty, x) | (x, Self::Empty) => x,
            (Self::And(mut a), Self::And(b)) => {
                a.extend(b);
                Self::And(a)
            }
            (Self::And(mut a), x) => {
                a.push(x);
                Self::And(a)
            }
            (x, Self::And(mut b)) => {
                b.insert(0, x);
                Self::And(b)
            }
            (a, b) => Self::And(vec![a, b]),
        }
    }

    /// Disjunction; `Empty` on either side is absorbed.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        match (self, other) {
            (Self::Empty, x) | (x, Self::Empty) => x,
            (Self::Or(mut a), Self::Or(b)) => {
                a.extend(b);
                Self::Or(a)
            }
            (Self::Or(mut a), x) => {
                a.push(x);
                Self::Or(a)
            }
            (x, Self::Or(mut b)) => {
                b.insert(0, x);
                Self::Or(b)
            }
            (a, b) => Self::Or(vec![a, b]),
        }
    }

    /// Negation. `Empty` stays empty.
    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            Self::Empty => Self::Empty,
            Self::Always(b) => Self::Always(!b),
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Left,
    Inner,
}

impl JoinKind {
    pub const fn sql_keyword(self) -> &'static str {
        match self {
            Self::Left => "LEFT OUTER JOIN",
            Self::Inner => "INNER JOIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    pub on: Criterion,
}

impl Join {
    pub fn left(table: TableRef, on: Criterion) -> Self {
        Self {
            kind: JoinKind::Left,
            table,
            on,
        }
    }
}

/// Adds `join` unless a join with the same alias is already present.
pub fn push_join(joins: &mut Vec<Join>, join: Join) -> bool {
    if joins.iter().any(|j| j.table.ident() == join.table.ident()) {
        return false;
    }
    joins.push(join);
    true
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub term: Term,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderTerm {
    pub term: Term,
    pub descending: bool,
}

/// A SELECT statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub from: TableRef,
    pub columns: Vec<SelectItem>,
    pub joins: Vec<Join>,
    pub where_clause: Criterion,
    pub group_by: Vec<Term>,
    pub having: Criterion,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub distinct: bool,
}

impl Select {
    pub fn new(from: TableRef) -> Self {
        Self {
            from,
            columns: Vec::new(),
            joins: Vec::new(),
            where_clause: Criterion::Empty,
            group_by: Vec::new(),
            having: Criterion::Empty,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
        }
    }

    pub fn column(&mut self, term: Term, alias: Option<String>) {
        self.columns.push(SelectItem { term, alias });
    }

    /// Adds a join, ignoring duplicates of an already joined alias.
    pub fn add_join(&mut self, join: Join) -> bool {
        push_join(&mut self.joins, join)
    }
}

/// An UPDATE statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: String,
    pub assignments: Vec<(String, Term)>,
    pub where_clause: Criterion,
}

/// A DELETE statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: String,
    pub where_clause: Criterion,
}

/// Renders the AST for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct SqlCompiler {
    dialect: Dialect,
}

impl SqlCompiler {
    pub const fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn q(&self, ident: &str) -> String {
        self.dialect.quote(ident)
    }

    fn bind(&self, value: &Value, params: &mut Vec<Value>) -> String {
        params.push(value.clone());
        self.dialect.placeholder(params.len())
    }

    /// Compiles a SELECT into SQL and parameters.
    pub fn compile_select(&self, select: &Select) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = self.select_sql(select, &mut params);
        (sql, params)
    }

    /// Compiles a SELECT, appending to an existing parameter list.
    pub fn select_sql(&self, select: &Select, params: &mut Vec<Value>) -> String {
        let mut sql = String::from("SELECT ");
        if select.distinct {
            sql.push_str("DISTINCT ");
        }

        if select.columns.is_empty() {
            sql.push('*');
        } else {
            let cols: Vec<String> = select
                .columns
                .iter()
                .map(|item| {
                    let term = self.term_sql(&item.term, params);
                    match &item.alias {
                        Some(alias) => format!("{term} {}", self.q(alias)),
                        None => term,
                    }
                })
                .collect();
            sql.push_str(&cols.join(","));
        }

        sql.push_str(" FROM ");
        sql.push_str(&self.table_sql(&select.from));

        for join in &select.joins {
            sql.push_str(&format!(
                " {} {} ON {}",
                join.kind.sql_keyword(),
                self.table_sql(&join.table),
                self.criterion_sql(&join.on, params)
            ));
        }

        if !select.where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.criterion_sql(&select.where_clause, params));
        }

        if !select.group_by.is_empty() {
            let terms: Vec<String> = select
                .group_by
                .iter()
                .map(|t| self.term_sql(t, params))
                .collect();
            sql.push_str(&format!(" GROUP BY {}", terms.join(",")));
        }

        if !select.having.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&self.criterion_sql(&select.having, params));
        }

        if !select.order_by.is_empty() {
            let orders: Vec<String> = select
                .order_by
                .iter()
                .map(|o| match &o.term {
                    // Raw SQL carries its own direction.
                    Term::Raw(sql) => sql.clone(),
                    term => {
                        let dir = if o.descending { "DESC" } else { "ASC" };
                        format!("{} {dir}", self.term_sql(term, params))
                    }
                })
                .collect();
            sql.push_str(&format!(" ORDER BY {}", orders.join(",")));
        }

        let limit = match (select.limit, select.offset) {
            (None, Some(_)) if self.dialect.requires_limit() => Some(IMPLICIT_LIMIT),
            (limit, _) => limit,
        };
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = select.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        sql
    }

    fn table_sql(&self, table: &TableRef) -> String {
        match &table.alias {
            Some(alias) => format!("{} {}", self.q(&table.name), self.q(alias)),
            None => self.q(&table.name),
        }
    }

    /// Compiles a single term.
    pub fn term_sql(&self, term: &Term, params: &mut Vec<Value>) -> String {
        match term {
            Term::Column { table, column } if table.is_empty() => self.q(column),
            Term::Column { table, column } => format!("{}.{}", self.q(table), self.q(column)),
            Term::Alias(alias) => self.q(alias),
            Term::Value(Value::List(items)) => {
                let parts: Vec<String> = items.iter().map(|v| self.bind(v, params)).collect();
                format!("({})", parts.join(","))
            }
            Term::Value(value) => self.bind(value, params),
            Term::Raw(sql) => sql.clone(),
            Term::Func {
                name,
                args,
                distinct,
            } => {
                let args: Vec<String> = args.iter().map(|a| self.term_sql(a, params)).collect();
                let distinct = if *distinct { "DISTINCT " } else { "" };
                format!("{name}({distinct}{})", args.join(","))
            }
            Term::Arith { op, left, right } => {
                let l = self.term_sql(left, params);
                let r = self.term_sql(right, params);
                format!("({l}{}{r})", op.symbol())
            }
            Term::Cast { term, sql_type } => {
                // MySQL only casts to CHAR, not VARCHAR.
                let sql_type = match (self.dialect, sql_type.as_str()) {
                    (Dialect::MySQL, "VARCHAR") => "CHAR",
                    (_, other) => other,
                };
                format!("CAST({} AS {sql_type})", self.term_sql(term, params))
            }
            Term::Case { whens, default } => {
                let mut sql = String::from("CASE");
                for (cond, then) in whens {
                    let cond = self.criterion_sql(cond, params);
                    let then = self.term_sql(then, params);
                    sql.push_str(&format!(" WHEN {cond} THEN {then}"));
                }
                if let Some(default) = default {
                    sql.push_str(&format!(" ELSE {}", self.term_sql(default, params)));
                }
                sql.push_str(" END");
                sql
            }
            Term::Subquery(select) => format!("({})", self.select_sql(select, params)),
            Term::Random => match self.dialect {
                Dialect::MySQL => "RAND()".to_string(),
                Dialect::SQLite | Dialect::PostgreSQL => "RANDOM()".to_string(),
            },
            Term::Star => "*".to_string(),
        }
    }

    /// Compiles a criterion.
    pub fn criterion_sql(&self, criterion: &Criterion, params: &mut Vec<Value>) -> String {
        match criterion {
            Criterion::Empty | Criterion::Always(true) => "1=1".to_string(),
            Criterion::Always(false) => "1=0".to_string(),
            Criterion::Compare { left, op, right } => {
                let l = self.term_sql(left, params);
                let r = self.term_sql(right, params);
                format!("{l}{}{r}", op.symbol())
            }
            Criterion::In {
                values, negated, ..
            } if values.is_empty() => (if *negated { "1=1" } else { "1=0" }).to_string(),
            Criterion::In {
                term,
                values,
                negated,
            } => {
                let t = self.term_sql(term, params);
                let vals: Vec<String> = values.iter().map(|v| self.term_sql(v, params)).collect();
                let op = if *negated { "NOT IN" } else { "IN" };
                format!("{t} {op} ({})", vals.join(","))
            }
            Criterion::InSelect {
                term,
                select,
                negated,
            } => {
                let t = self.term_sql(term, params);
                let op = if *negated { "NOT IN" } else { "IN" };
                format!("{t} {op} ({})", self.select_sql(select, params))
            }
            Criterion::Between { term, low, high } => {
                let t = self.term_sql(term, params);
                let lo = self.term_sql(low, params);
                let hi = self.term_sql(high, params);
                format!("{t} BETWEEN {lo} AND {hi}")
            }
            Criterion::IsNull { term, negated } => {
                let t = self.term_sql(term, params);
                if *negated {
                    format!("{t} IS NOT NULL")
                } else {
                    format!("{t} IS NULL")
                }
            }
            Criterion::Like {
                term,
                pattern,
                case_insensitive,
            } => {
                let t = self.term_sql(term, params);
                let p = self.term_sql(pattern, params);
                let escape = self.dialect.like_escape();
                match (case_insensitive, self.dialect) {
                    (false, _) => format!("{t} LIKE {p} ESCAPE {escape}"),
                    (true, Dialect::PostgreSQL) => format!("{t} ILIKE {p} ESCAPE {escape}"),
                    (true, _) => format!("UPPER({t}) LIKE UPPER({p}) ESCAPE {escape}"),
                }
            }
            Criterion::And(children) => self.join_criteria(children, " AND ", params),
            Criterion::Or(children) => self.join_criteria(children, " OR ", params),
            Criterion::Not(inner) => format!("NOT {}", self.wrapped(inner, params)),
            Criterion::Raw(sql) => sql.clone(),
        }
    }

    fn wrapped(&self, criterion: &Criterion, params: &mut Vec<Value>) -> String {
        let sql = self.criterion_sql(criterion, params);
        match criterion {
            Criterion::And(c) | Criterion::Or(c) if c.len() > 1 => sql,
            _ => format!("({sql})"),
        }
    }

    fn join_criteria(&self, children: &[Criterion], sep: &str, params: &mut Vec<Value>) -> String {
        let parts: Vec<String> = children
            .iter()
            .filter(|c| !c.is_empty())
            .map(|c| self.criterion_sql(c, params))
            .collect();
        match parts.len() {
            0 => "1=1".to_string(),
            1 => parts.into_iter().collect(),
            _ => format!("({})", parts.join(sep)),
        }
    }

    /// Compiles a single-row INSERT. `returning` names the pk column on
    /// dialects that support `RETURNING`.
    pub fn compile_insert(
        &self,
        table: &str,
        columns: &[String],
        values: &[Value],
        returning: Option<&str>,
    ) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let cols: Vec<String> = columns.iter().map(|c| self.q(c)).collect();
        let placeholders: Vec<String> = values.iter().map(|v| self.bind(v, &mut params)).collect();
        let mut sql = if cols.is_empty() {
            match self.dialect {
                Dialect::MySQL => format!("INSERT INTO {} () VALUES ()", self.q(table)),
                Dialect::SQLite | Dialect::PostgreSQL => {
                    format!("INSERT INTO {} DEFAULT VALUES", self.q(table))
                }
            }
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.q(table),
                cols.join(","),
                placeholders.join(",")
            )
        };
        if let (Some(pk), Dialect::PostgreSQL) = (returning, self.dialect) {
            sql.push_str(&format!(" RETURNING {}", self.q(pk)));
        }
        (sql, params)
    }

    pub fn compile_update(&self, update: &Update) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sets: Vec<String> = update
            .assignments
            .iter()
            .map(|(column, term)| format!("{}={}", self.q(column), self.term_sql(term, &mut params)))
            .collect();
        let mut sql = format!("UPDATE {} SET {}", self.q(&update.table), sets.join(","));
        if !update.where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.criterion_sql(&update.where_clause, &mut params));
        }
        (sql, params)
    }

    pub fn compile_delete(&self, delete: &Delete) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM {}", self.q(&delete.table));
        if !delete.where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.criterion_sql(&delete.where_clause, &mut params));
        }
        (sql, params)
    }
}
