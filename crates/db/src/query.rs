//! Query handles with named parameter binding.
//!
//! SeaORM statements carry positional values only. A [`NamedQuery`] keeps
//! `:name` placeholders and their bound values until execution, then renders
//! them into the backend's positional form. A [`Criteria`] wraps a SeaORM
//! select built from an entity.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};
use sea_orm::sea_query::{IntoCondition, SelectStatement};
use sea_orm::{DbBackend, EntityTrait, QueryTrait, Statement, Value};
use unitwork_shared::{PersistError, PersistResult};

/// Values that can be bound as a calendar day.
///
/// Any time-of-day component is discarded before binding.
pub trait CalendarDay {
    /// Returns the calendar day.
    fn calendar_day(&self) -> NaiveDate;
}

impl CalendarDay for NaiveDate {
    fn calendar_day(&self) -> NaiveDate {
        *self
    }
}

impl CalendarDay for NaiveDateTime {
    fn calendar_day(&self) -> NaiveDate {
        self.date()
    }
}

impl<Tz: TimeZone> CalendarDay for DateTime<Tz> {
    fn calendar_day(&self) -> NaiveDate {
        self.date_naive()
    }
}

/// Result window applied on execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    /// Rows to skip.
    pub first_result: Option<u64>,
    /// Maximum rows to return.
    pub max_results: Option<u64>,
}

/// Source text copied through without placeholder substitution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verbatim {
    Quoted(char),
    LineComment,
    BlockComment,
}

#[derive(Debug, Clone, PartialEq)]
enum Binding {
    Single(Value),
    List(Vec<Value>),
}

/// SQL text with `:name` placeholders and their bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedQuery {
    sql: String,
    bindings: HashMap<String, Binding>,
    page: Page,
}

impl NamedQuery {
    /// Creates a query from SQL text.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            bindings: HashMap::new(),
            page: Page::default(),
        }
    }

    /// Returns the SQL text as written.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Returns the result window.
    #[must_use]
    pub fn page(&self) -> Page {
        self.page
    }

    /// Binds a single value, replacing any earlier binding of `name`.
    pub fn bind(&mut self, name: &str, value: impl Into<Value>) {
        self.bindings
            .insert(name.to_string(), Binding::Single(value.into()));
    }

    /// Binds a list of values, expanded to comma-separated placeholders.
    pub fn bind_list<I, V>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.bindings.insert(name.to_string(), Binding::List(values));
    }

    /// Binds a calendar day.
    pub fn bind_date(&mut self, name: &str, when: &impl CalendarDay) {
        self.bind(name, when.calendar_day());
    }

    /// Returns the single value bound to `name`.
    #[must_use]
    pub fn bound(&self, name: &str) -> Option<&Value> {
        match self.bindings.get(name) {
            Some(Binding::Single(value)) => Some(value),
            _ => None,
        }
    }

    /// Sets the number of rows to skip.
    pub fn set_first_result(&mut self, first: u64) {
        self.page.first_result = Some(first);
    }

    /// Sets the maximum number of rows.
    pub fn set_max_results(&mut self, max: u64) {
        self.page.max_results = Some(max);
    }

    /// Renders the query into a positional statement for `backend`.
    ///
    /// Placeholders inside quoted text, SQL comments and `::` casts are left
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::IllegalState` if a placeholder has no binding
    /// or a list binding is empty.
    pub fn to_statement(&self, backend: DbBackend) -> PersistResult<Statement> {
        let mut sql = String::with_capacity(self.sql.len() + 16);
        let mut values = Vec::new();
        let mut chars = self.sql.chars().peekable();
        let mut verbatim: Option<Verbatim> = None;

        while let Some(c) = chars.next() {
            if let Some(mode) = verbatim {
                sql.push(c);
                match mode {
                    Verbatim::Quoted(q) if c == q => verbatim = None,
                    Verbatim::LineComment if c == '\n' => verbatim = None,
                    Verbatim::BlockComment if c == '*' && chars.peek() == Some(&'/') => {
                        chars.next();
                        sql.push('/');
                        verbatim = None;
                    }
                    _ => {}
                }
                continue;
            }

            match c {
                '\'' | '"' => {
                    verbatim = Some(Verbatim::Quoted(c));
                    sql.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    sql.push_str("--");
                    verbatim = Some(Verbatim::LineComment);
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    sql.push_str("/*");
                    verbatim = Some(Verbatim::BlockComment);
                }
                ':' if chars.peek() == Some(&':') => {
                    chars.next();
                    sql.push_str("::");
                }
                ':' if chars.peek().is_some_and(|n| n.is_ascii_alphabetic() || *n == '_') => {
                    let mut name = String::new();
                    while let Some(&n) = chars.peek() {
                        if n.is_ascii_alphanumeric() || n == '_' {
                            name.push(n);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    self.render_binding(&name, backend, &mut sql, &mut values)?;
                }
                _ => sql.push(c),
            }
        }

        let open_comment = verbatim == Some(Verbatim::LineComment);
        append_page(&mut sql, self.page, backend, open_comment);

        Ok(Statement::from_sql_and_values(backend, sql, values))
    }

    fn render_binding(
        &self,
        name: &str,
        backend: DbBackend,
        sql: &mut String,
        values: &mut Vec<Value>,
    ) -> PersistResult<()> {
        match self.bindings.get(name) {
            None => Err(PersistError::illegal_state(format!(
                "no value bound for parameter :{name}"
            ))),
            Some(Binding::Single(value)) => {
                values.push(value.clone());
                push_placeholder(sql, backend, values.len());
                Ok(())
            }
            Some(Binding::List(list)) if list.is_empty() => Err(PersistError::illegal_state(
                format!("empty parameter list bound for :{name}"),
            )),
            Some(Binding::List(list)) => {
                for (i, value) in list.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    values.push(value.clone());
                    push_placeholder(sql, backend, values.len());
                }
                Ok(())
            }
        }
    }
}

fn push_placeholder(sql: &mut String, backend: DbBackend, position: usize) {
    match backend {
        DbBackend::Postgres => {
            sql.push('$');
            sql.push_str(&position.to_string());
        }
        _ => sql.push('?'),
    }
}

fn append_page(sql: &mut String, page: Page, backend: DbBackend, open_comment: bool) {
    if page == Page::default() {
        return;
    }

    if open_comment {
        // Keep the clause out of a trailing `--` comment.
        sql.push('\n');
    } else {
        let trimmed = sql.trim_end().trim_end_matches(';').len();
        sql.truncate(trimmed);
    }

    match (page.max_results, page.first_result) {
        (Some(max), first) => {
            sql.push_str(&format!(" LIMIT {max}"));
            if let Some(first) = first {
                sql.push_str(&format!(" OFFSET {first}"));
            }
        }
        (None, Some(first)) => match backend {
            DbBackend::Postgres => sql.push_str(&format!(" OFFSET {first}")),
            DbBackend::Sqlite => sql.push_str(&format!(" LIMIT -1 OFFSET {first}")),
            _ => sql.push_str(&format!(" LIMIT {} OFFSET {first}", u64::MAX)),
        },
        (None, None) => {}
    }
}

/// Entity-rooted select with optional restrictions.
#[derive(Debug, Clone)]
pub struct Criteria {
    select: SelectStatement,
    page: Page,
}

impl Criteria {
    /// Selects every column of `E`.
    #[must_use]
    pub fn new<E: EntityTrait>() -> Self {
        Self {
            select: E::find().into_query(),
            page: Page::default(),
        }
    }

    /// Adds a `WHERE` restriction, combined with earlier ones by `AND`.
    pub fn restrict(&mut self, condition: impl IntoCondition) {
        self.select.cond_where(condition.into_condition());
    }

    /// Sets the number of rows to skip.
    pub fn set_first_result(&mut self, first: u64) {
        self.page.first_result = Some(first);
    }

    /// Sets the maximum number of rows.
    pub fn set_max_results(&mut self, max: u64) {
        self.page.max_results = Some(max);
    }

    /// Renders the select for `backend`.
    #[must_use]
    pub fn to_statement(&self, backend: DbBackend) -> Statement {
        let mut select = self.select.clone();
        if let Some(max) = self.page.max_results {
            select.limit(max);
        }
        if let Some(first) = self.page.first_result {
            select.offset(first);
        }
        backend.build(&select)
    }
}

/// The query handle a session currently holds.
#[derive(Debug, Clone)]
pub enum ActiveQuery {
    /// SQL with named parameters.
    Named(NamedQuery),
    /// Entity-rooted select.
    Criteria(Criteria),
}

impl ActiveQuery {
    pub(crate) fn named_mut(&mut self) -> PersistResult<&mut NamedQuery> {
        match self {
            Self::Named(query) => Ok(query),
            Self::Criteria(_) => Err(PersistError::illegal_state(
                "named parameters cannot be bound on a criteria",
            )),
        }
    }

    pub(crate) fn set_first_result(&mut self, first: u64) {
        match self {
            Self::Named(query) => query.set_first_result(first),
            Self::Criteria(criteria) => criteria.set_first_result(first),
        }
    }

    pub(crate) fn set_max_results(&mut self, max: u64) {
        match self {
            Self::Named(query) => query.set_max_results(max),
            Self::Criteria(criteria) => criteria.set_max_results(max),
        }
    }

    pub(crate) fn to_statement(&self, backend: DbBackend) -> PersistResult<Statement> {
        match self {
            Self::Named(query) => query.to_statement(backend),
            Self::Criteria(criteria) => Ok(criteria.to_statement(backend)),
        }
    }
}

#[cfg(test)]
#[path = "query_tests.rs"]
mod tests;
