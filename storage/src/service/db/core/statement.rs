//! Dialect-aware statement builders
//!
//! Builders are obtained from a [`DbExecutor`](super::executor::DbExecutor)
//! and render SQL with the placeholders of the executor's dialect.

use super::dialect::{quote_ident, Dialect};
use super::types::SqlValue;

/// Rendered SQL plus its positional arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<SqlValue>,
}

impl Statement {
    /// Raw SQL with already-matching placeholders
    pub fn raw(sql: impl Into<String>, args: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }
}

#[derive(Debug, Clone)]
enum Cond {
    Eq(String, SqlValue),
    In(String, Vec<SqlValue>),
}

#[derive(Debug, Clone, Default)]
struct Filter {
    conds: Vec<Cond>,
}

impl Filter {
    fn render(&self, dialect: Dialect, args: &mut Vec<SqlValue>) -> String {
        if self.conds.is_empty() {
            return String::new();
        }
        let parts: Vec<String> = self
            .conds
            .iter()
            .map(|cond| match cond {
                Cond::Eq(col, SqlValue::Null) => format!("{} IS NULL", quote_ident(col)),
                Cond::Eq(col, value) => {
                    args.push(value.clone());
                    format!("{} = {}", quote_ident(col), dialect.placeholder(args.len()))
                }
                Cond::In(_, values) if values.is_empty() => "1 = 0".to_string(),
                Cond::In(col, values) => {
                    let marks: Vec<String> = values
                        .iter()
                        .map(|v| {
                            args.push(v.clone());
                            dialect.placeholder(args.len())
                        })
                        .collect();
                    format!("{} IN ({})", quote_ident(col), marks.join(", "))
                }
            })
            .collect();
        format!(" WHERE {}", parts.join(" AND "))
    }
}

/// SELECT builder
#[derive(Debug, Clone)]
pub struct SelectBuilder {
    dialect: Dialect,
    table: String,
    columns: Vec<String>,
    filter: Filter,
    order_by: Vec<String>,
}

impl SelectBuilder {
    pub fn new(dialect: Dialect, table: &str) -> Self {
        Self {
            dialect,
            table: table.to_string(),
            columns: Vec::new(),
            filter: Filter::default(),
            order_by: Vec::new(),
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn filter_eq(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.filter.conds.push(Cond::Eq(column.to_string(), value.into()));
        self
    }

    pub fn filter_in(mut self, column: &str, values: Vec<SqlValue>) -> Self {
        self.filter.conds.push(Cond::In(column.to_string(), values));
        self
    }

    /// Adds `(column, value)` equality filters, e.g. a config table's scope.
    pub fn filter_all(mut self, filters: &[(String, SqlValue)]) -> Self {
        for (col, value) in filters {
            self.filter.conds.push(Cond::Eq(col.clone(), value.clone()));
        }
        self
    }

    pub fn order_by(mut self, column: &str) -> Self {
        self.order_by.push(column.to_string());
        self
    }

    pub fn build(self) -> Statement {
        let mut args = Vec::new();
        let cols = if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut sql = format!("SELECT {} FROM {}", cols, quote_ident(&self.table));
        sql.push_str(&self.filter.render(self.dialect, &mut args));
        if !self.order_by.is_empty() {
            let order: Vec<String> = self.order_by.iter().map(|c| quote_ident(c)).collect();
            sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }
        Statement { sql, args }
    }
}

/// INSERT builder, with optional upsert clause
///
/// `SqlValue::Null` renders as a literal `NULL` rather than a bind, so the
/// column type never has to be inferred from an untyped null parameter.
#[derive(Debug, Clone)]
pub struct InsertBuilder {
    dialect: Dialect,
    table: String,
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
    on_conflict: Option<(Vec<String>, Vec<String>)>,
}

impl InsertBuilder {
    pub fn new(dialect: Dialect, table: &str) -> Self {
        Self {
            dialect,
            table: table.to_string(),
            columns: Vec::new(),
            rows: Vec::new(),
            on_conflict: None,
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Appends one row; values follow the column order.
    pub fn row(mut self, values: Vec<SqlValue>) -> Self {
        debug_assert_eq!(values.len(), self.columns.len());
        self.rows.push(values);
        self
    }

    pub fn has_rows(&self) -> bool {
        !self.rows.is_empty()
    }

    /// `ON CONFLICT (conflict) DO UPDATE SET col = excluded.col` for each of `update`
    pub fn on_conflict_update(mut self, conflict: &[&str], update: &[&str]) -> Self {
        self.on_conflict = Some((
            conflict.iter().map(|c| c.to_string()).collect(),
            update.iter().map(|c| c.to_string()).collect(),
        ));
        self
    }

    pub fn build(self) -> Statement {
        debug_assert!(!self.rows.is_empty(), "INSERT without rows");
        let mut args = Vec::new();
        let cols: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        let rows: Vec<String> = self
            .rows
            .into_iter()
            .map(|row| {
                let marks: Vec<String> = row
                    .into_iter()
                    .map(|v| match v {
                        SqlValue::Null => "NULL".to_string(),
                        v => {
                            args.push(v);
                            self.dialect.placeholder(args.len())
                        }
                    })
                    .collect();
                format!("({})", marks.join(", "))
            })
            .collect();
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote_ident(&self.table),
            cols.join(", "),
            rows.join(", ")
        );
        if let Some((conflict, update)) = self.on_conflict {
            let target: Vec<String> = conflict.iter().map(|c| quote_ident(c)).collect();
            let sets: Vec<String> = update
                .iter()
                .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
                .collect();
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                target.join(", "),
                sets.join(", ")
            ));
        }
        Statement { sql, args }
    }
}

/// UPDATE builder
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    dialect: Dialect,
    table: String,
    sets: Vec<(String, SqlValue)>,
    filter: Filter,
}

impl UpdateBuilder {
    pub fn new(dialect: Dialect, table: &str) -> Self {
        Self {
            dialect,
            table: table.to_string(),
            sets: Vec::new(),
            filter: Filter::default(),
        }
    }

    pub fn set(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.sets.push((column.to_string(), value.into()));
        self
    }

    pub fn filter_eq(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.filter.conds.push(Cond::Eq(column.to_string(), value.into()));
        self
    }

    pub fn build(self) -> Statement {
        let mut args = Vec::new();
        let sets: Vec<String> = self
            .sets
            .into_iter()
            .map(|(col, v)| match v {
                SqlValue::Null => format!("{} = NULL", quote_ident(&col)),
                v => {
                    args.push(v);
                    format!("{} = {}", quote_ident(&col), self.dialect.placeholder(args.len()))
                }
            })
            .collect();
        let mut sql = format!("UPDATE {} SET {}", quote_ident(&self.table), sets.join(", "));
        sql.push_str(&self.filter.render(self.dialect, &mut args));
        Statement { sql, args }
    }
}

/// DELETE builder
#[derive(Debug, Clone)]
pub struct DeleteBuilder {
    dialect: Dialect,
    table: String,
    filter: Filter,
}

impl DeleteBuilder {
    pub fn new(dialect: Dialect, table: &str) -> Self {
        Self {
            dialect,
            table: table.to_string(),
            filter: Filter::default(),
        }
    }

    pub fn filter_eq(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.filter.conds.push(Cond::Eq(column.to_string(), value.into()));
        self
    }

    pub fn filter_all(mut self, filters: &[(String, SqlValue)]) -> Self {
        for (col, value) in filters {
            self.filter.conds.push(Cond::Eq(col.clone(), value.clone()));
        }
        self
    }

    pub fn build(self) -> Statement {
        let mut args = Vec::new();
        let mut sql = format!("DELETE FROM {}", quote_ident(&self.table));
        sql.push_str(&self.filter.render(self.dialect, &mut args));
        Statement { sql, args }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_postgres_numbering() {
        let stmt = SelectBuilder::new(Dialect::Postgres, "cm_user_attrs")
            .columns(&["key", "value"])
            .filter_eq("user_id", "u1")
            .filter_in("key", vec!["a".into(), "b".into()])
            .order_by("key")
            .build();
        assert_eq!(
            stmt.sql,
            "SELECT \"key\", \"value\" FROM \"cm_user_attrs\" \
             WHERE \"user_id\" = $1 AND \"key\" IN ($2, $3) ORDER BY \"key\""
        );
        assert_eq!(stmt.args.len(), 3);
    }

    #[test]
    fn test_select_null_and_empty_in() {
        let stmt = SelectBuilder::new(Dialect::Sqlite, "t")
            .filter_eq("a", SqlValue::Null)
            .filter_in("b", Vec::new())
            .build();
        assert_eq!(stmt.sql, "SELECT * FROM \"t\" WHERE \"a\" IS NULL AND 1 = 0");
        assert!(stmt.args.is_empty());
    }

    #[test]
    fn test_upsert_sqlite() {
        let stmt = InsertBuilder::new(Dialect::Sqlite, "cm_migrations")
            .columns(&["filename", "checksum"])
            .row(vec!["0001.sql".into(), "abc".into()])
            .on_conflict_update(&["filename"], &["checksum"])
            .build();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"cm_migrations\" (\"filename\", \"checksum\") VALUES (?, ?) \
             ON CONFLICT (\"filename\") DO UPDATE SET \"checksum\" = excluded.\"checksum\""
        );
    }

    #[test]
    fn test_multi_row_insert_postgres() {
        let stmt = InsertBuilder::new(Dialect::Postgres, "t")
            .columns(&["a", "b"])
            .row(vec![SqlValue::Int(1), "x".into()])
            .row(vec![SqlValue::Int(2), "y".into()])
            .build();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"t\" (\"a\", \"b\") VALUES ($1, $2), ($3, $4)"
        );
        assert_eq!(stmt.args[2], SqlValue::Int(2));
    }

    #[test]
    fn test_update_and_delete() {
        let stmt = UpdateBuilder::new(Dialect::Postgres, "t")
            .set("v", "new")
            .filter_eq("k", "key")
            .build();
        assert_eq!(stmt.sql, "UPDATE \"t\" SET \"v\" = $1 WHERE \"k\" = $2");

        let stmt = DeleteBuilder::new(Dialect::Postgres, "t")
            .filter_all(&[("domain_id".to_string(), "d".into())])
            .build();
        assert_eq!(stmt.sql, "DELETE FROM \"t\" WHERE \"domain_id\" = $1");
    }
}
