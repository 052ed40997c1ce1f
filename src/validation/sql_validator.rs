use sqlparser::ast::{
    Expr, LimitClause, Query, SetExpr, Statement, Value, Visit, Visitor,
};
use sqlparser::dialect::{
    Dialect as SqlDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect,
};
use sqlparser::parser::Parser;
use std::ops::ControlFlow;

use crate::api::middleware::AppError;
use crate::models::Dialect;

pub const DEFAULT_LIMIT: u64 = 1000;

/// LIMIT reporting for an executed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LimitInfo {
    pub has_limit: bool,
    pub limit_value: Option<u64>,
}

/// Dialect-aware SQL validation. Stateless.
pub struct SqlValidator;

impl SqlValidator {
    /// Parse exactly one statement.
    pub fn parse(sql: &str, dialect: Dialect) -> Result<Statement, AppError> {
        let parser_dialect = Self::parser_dialect(dialect);
        let mut statements = Parser::parse_sql(parser_dialect.as_ref(), sql).map_err(|e| {
            let message = e.to_string();
            let (line, column) = Self::error_location(&message);
            AppError::SyntaxError {
                message,
                sql: sql.to_string(),
                line,
                column,
            }
        })?;

        match statements.len() {
            0 => Err(AppError::SyntaxError {
                message: "Empty SQL query".to_string(),
                sql: sql.to_string(),
                line: None,
                column: None,
            }),
            1 => Ok(statements.remove(0)),
            _ => Err(AppError::NonSelectStatement {
                kind: "multiple statements".to_string(),
            }),
        }
    }

    /// Only read queries pass: SELECT, WITH, VALUES, TABLE and set operations
    /// over them.
    pub fn validate_read_only(statement: &Statement) -> Result<(), AppError> {
        match statement {
            Statement::Query(query) => Self::check_query(query),
            other => Err(Self::rejected(&other.to_string())),
        }
    }

    /// Parse and check in one step.
    pub fn validate(sql: &str, dialect: Dialect) -> Result<Statement, AppError> {
        let statement = Self::parse(sql, dialect)?;
        Self::validate_read_only(&statement)?;
        Ok(statement)
    }

    /// Append `LIMIT default_limit` unless a LIMIT already appears anywhere in
    /// the statement. Input that does not parse is returned unchanged.
    pub fn ensure_limit(sql: &str, dialect: Dialect, default_limit: u64) -> String {
        let Ok(mut statement) = Self::parse(sql, dialect) else {
            return sql.to_string();
        };
        if Self::contains_limit(&statement) {
            return sql.to_string();
        }
        let Statement::Query(query) = &mut statement else {
            return sql.to_string();
        };

        let limit = Expr::Value(Value::Number(default_limit.to_string(), false).into());
        query.limit_clause = match query.limit_clause.take() {
            Some(LimitClause::LimitOffset {
                offset, limit_by, ..
            }) => Some(LimitClause::LimitOffset {
                limit: Some(limit),
                offset,
                limit_by,
            }),
            _ => Some(LimitClause::LimitOffset {
                limit: Some(limit),
                offset: None,
                limit_by: vec![],
            }),
        };

        statement.to_string()
    }

    /// Whether the statement limits its rows and the top-level literal limit.
    pub fn limit_info(sql: &str, dialect: Dialect) -> LimitInfo {
        let Ok(statement) = Self::parse(sql, dialect) else {
            return LimitInfo::default();
        };

        let limit_value = match &statement {
            Statement::Query(query) => match &query.limit_clause {
                Some(LimitClause::LimitOffset {
                    limit: Some(limit), ..
                }) => Self::literal_u64(limit),
                Some(LimitClause::OffsetCommaLimit { limit, .. }) => Self::literal_u64(limit),
                _ => None,
            },
            _ => None,
        };

        LimitInfo {
            has_limit: Self::contains_limit(&statement),
            limit_value,
        }
    }

    fn parser_dialect(dialect: Dialect) -> Box<dyn SqlDialect> {
        match dialect {
            Dialect::MySql => Box::new(MySqlDialect {}),
            Dialect::PostgreSql => Box::new(PostgreSqlDialect {}),
            Dialect::Sqlite => Box::new(SQLiteDialect {}),
        }
    }

    fn check_query(query: &Query) -> Result<(), AppError> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                Self::check_query(&cte.query)?;
            }
        }
        Self::check_set_expr(&query.body)
    }

    fn check_set_expr(expr: &SetExpr) -> Result<(), AppError> {
        match expr {
            SetExpr::Select(select) if select.into.is_some() => {
                Err(AppError::NonSelectStatement {
                    kind: "SELECT INTO".to_string(),
                })
            }
            SetExpr::Select(_) | SetExpr::Values(_) | SetExpr::Table(_) => Ok(()),
            SetExpr::Query(query) => Self::check_query(query),
            SetExpr::SetOperation { left, right, .. } => {
                Self::check_set_expr(left)?;
                Self::check_set_expr(right)
            }
            other => Err(Self::rejected(&other.to_string())),
        }
    }

    /// Name the statement kind after its leading keyword.
    fn rejected(rendered: &str) -> AppError {
        let kind = rendered
            .split_whitespace()
            .next()
            .map(str::to_uppercase)
            .unwrap_or_else(|| "UNKNOWN".to_string());
        AppError::NonSelectStatement { kind }
    }

    fn contains_limit(statement: &Statement) -> bool {
        let mut finder = LimitFinder::default();
        let _ = statement.visit(&mut finder);
        finder.found
    }

    fn literal_u64(expr: &Expr) -> Option<u64> {
        match expr {
            Expr::Value(v) => match &v.value {
                Value::Number(n, _) => n.parse().ok(),
                _ => None,
            },
            _ => None,
        }
    }

    /// Pull `Line: N, Column: M` out of a parser message.
    fn error_location(message: &str) -> (Option<u64>, Option<u64>) {
        let number_after = |label: &str| -> Option<u64> {
            let start = message.find(label)? + label.len();
            let digits: String = message[start..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse().ok().filter(|n| *n > 0)
        };
        (number_after("Line: "), number_after("Column: "))
    }
}

/// Stops at the first query carrying a row limit.
#[derive(Default)]
struct LimitFinder {
    found: bool,
}

impl Visitor for LimitFinder {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        let limited = matches!(
            query.limit_clause,
            Some(LimitClause::LimitOffset { limit: Some(_), .. })
                | Some(LimitClause::OffsetCommaLimit { .. })
        ) || query.fetch.is_some();

        if limited {
            self.found = true;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Dialect; 3] = [Dialect::MySql, Dialect::PostgreSql, Dialect::Sqlite];

    fn kind_of(sql: &str, dialect: Dialect) -> String {
        match SqlValidator::validate(sql, dialect) {
            Err(AppError::NonSelectStatement { kind }) => kind,
            other => panic!("expected NonSelectStatement for {:?}, got {:?}", sql, other),
        }
    }

    #[test]
    fn test_write_and_ddl_statements_rejected() {
        for dialect in ALL {
            assert_eq!(kind_of("INSERT INTO users VALUES (1)", dialect), "INSERT");
            assert_eq!(kind_of("UPDATE users SET name = 'x'", dialect), "UPDATE");
            assert_eq!(kind_of("DELETE FROM users", dialect), "DELETE");
            assert_eq!(kind_of("DROP TABLE users", dialect), "DROP");
            assert_eq!(kind_of("CREATE TABLE t (id INT)", dialect), "CREATE");
            assert_eq!(kind_of("ALTER TABLE t ADD COLUMN c INT", dialect), "ALTER");
        }
    }

    #[test]
    fn test_read_queries_pass() {
        for dialect in ALL {
            for sql in [
                "SELECT * FROM users",
                "SELECT id, name FROM users WHERE id > 10 ORDER BY id",
                "WITH recent AS (SELECT * FROM orders) SELECT * FROM recent",
                "SELECT a FROM t UNION SELECT a FROM u",
                "SELECT 1",
            ] {
                assert!(
                    SqlValidator::validate(sql, dialect).is_ok(),
                    "{} ({:?})",
                    sql,
                    dialect
                );
            }
        }
    }

    #[test]
    fn test_select_into_rejected() {
        assert_eq!(
            kind_of("SELECT * INTO archive FROM users", Dialect::PostgreSql),
            "SELECT INTO"
        );
    }

    #[test]
    fn test_data_modifying_cte_rejected() {
        let result = SqlValidator::validate(
            "WITH gone AS (DELETE FROM users RETURNING *) SELECT * FROM gone",
            Dialect::PostgreSql,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_multiple_statements_rejected() {
        assert!(matches!(
            SqlValidator::validate("SELECT 1; SELECT 2", Dialect::Sqlite),
            Err(AppError::NonSelectStatement { .. })
        ));
        assert!(matches!(
            SqlValidator::validate("SELECT 1; DROP TABLE users", Dialect::MySql),
            Err(AppError::NonSelectStatement { .. })
        ));
    }

    #[test]
    fn test_syntax_errors() {
        match SqlValidator::parse("SELEC * FROM users", Dialect::PostgreSql) {
            Err(AppError::SyntaxError { sql, message, .. }) => {
                assert_eq!(sql, "SELEC * FROM users");
                assert!(!message.is_empty());
            }
            other => panic!("expected syntax error, got {:?}", other),
        }
        assert!(matches!(
            SqlValidator::parse("   ", Dialect::Sqlite),
            Err(AppError::SyntaxError { .. })
        ));
    }

    #[test]
    fn test_error_location_parsing() {
        let (line, column) = SqlValidator::error_location(
            "sql parser error: Expected: an expression, found: FROM at Line: 2, Column: 3",
        );
        assert_eq!(line, Some(2));
        assert_eq!(column, Some(3));
        assert_eq!(SqlValidator::error_location("no location"), (None, None));
    }

    #[test]
    fn test_ensure_limit_appends() {
        for dialect in ALL {
            let sql = SqlValidator::ensure_limit("SELECT * FROM t", dialect, DEFAULT_LIMIT);
            assert_eq!(sql, "SELECT * FROM t LIMIT 1000");
        }
    }

    #[test]
    fn test_ensure_limit_keeps_existing() {
        let sql = "SELECT * FROM users LIMIT 100";
        assert_eq!(SqlValidator::ensure_limit(sql, Dialect::PostgreSql, 1000), sql);

        let nested = "SELECT * FROM (SELECT * FROM t LIMIT 5) AS s";
        assert_eq!(SqlValidator::ensure_limit(nested, Dialect::Sqlite, 1000), nested);

        let mysql = "SELECT * FROM t LIMIT 10, 20";
        assert_eq!(SqlValidator::ensure_limit(mysql, Dialect::MySql, 1000), mysql);
    }

    #[test]
    fn test_ensure_limit_preserves_offset() {
        let sql = SqlValidator::ensure_limit("SELECT * FROM t OFFSET 5", Dialect::PostgreSql, 50);
        assert!(sql.contains("LIMIT 50"), "{}", sql);
        assert!(sql.contains("OFFSET 5"), "{}", sql);
    }

    #[test]
    fn test_ensure_limit_fail_open() {
        let broken = "SELEC nonsense";
        assert_eq!(SqlValidator::ensure_limit(broken, Dialect::MySql, 1000), broken);
    }

    #[test]
    fn test_ensure_limit_idempotent() {
        for dialect in ALL {
            for sql in [
                "SELECT * FROM t",
                "SELECT a FROM t UNION SELECT a FROM u",
                "WITH x AS (SELECT 1 AS a) SELECT a FROM x",
                "SELECT * FROM t LIMIT 3",
            ] {
                let once = SqlValidator::ensure_limit(sql, dialect, 1000);
                let twice = SqlValidator::ensure_limit(&once, dialect, 1000);
                assert_eq!(once, twice, "{} ({:?})", sql, dialect);
            }
        }
    }

    #[test]
    fn test_limit_keyword_in_identifiers_and_comments() {
        for sql in [
            "SELECT * FROM table_limit",
            "SELECT limit_value FROM users",
            "SELECT * FROM users -- LIMIT 10",
        ] {
            let rewritten = SqlValidator::ensure_limit(sql, Dialect::PostgreSql, 1000);
            assert!(rewritten.ends_with("LIMIT 1000"), "{}", rewritten);
        }
    }

    #[test]
    fn test_limit_info() {
        assert_eq!(
            SqlValidator::limit_info("SELECT * FROM t LIMIT 1000", Dialect::Sqlite),
            LimitInfo {
                has_limit: true,
                limit_value: Some(1000)
            }
        );
        assert_eq!(
            SqlValidator::limit_info("SELECT * FROM t LIMIT 5, 25", Dialect::MySql).limit_value,
            Some(25)
        );
        assert_eq!(
            SqlValidator::limit_info("SELECT * FROM t", Dialect::PostgreSql),
            LimitInfo::default()
        );
        let nested = SqlValidator::limit_info(
            "SELECT * FROM (SELECT * FROM t LIMIT 5) AS s",
            Dialect::PostgreSql,
        );
        assert!(nested.has_limit);
        assert_eq!(nested.limit_value, None);
    }
}
