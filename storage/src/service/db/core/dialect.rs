//! SQL dialect specifics
//!
//! Everything that differs between PostgreSQL and SQLite lives here: bind
//! placeholders, catalog lookups and the seed-script macros.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Supported SQL dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Name of the per-dialect migration subdirectory
    pub fn dir_name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite3",
        }
    }

    /// Bind placeholder for the 1-based parameter `index`
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => "?".to_string(),
        }
    }

    /// Query counting tables named by the single bound parameter
    pub fn table_exists_sql(&self) -> &'static str {
        match self {
            Dialect::Postgres => {
                "SELECT COUNT(*) AS cnt FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1"
            }
            Dialect::Sqlite => {
                "SELECT COUNT(*) AS cnt FROM sqlite_master WHERE type = 'table' AND name = ?"
            }
        }
    }

    /// Rewrites the seed macros `$NOW('<interval>')` and `$HEX('<hex>')`.
    pub fn rewrite_seed(&self, script: &str) -> String {
        let (now_re, hex_re) = seed_macros();
        let now_repl = match self {
            Dialect::Postgres => "(now() + interval '$1')",
            Dialect::Sqlite => "datetime('now', '$1')",
        };
        let hex_repl = match self {
            Dialect::Postgres => "decode('$1', 'hex')",
            Dialect::Sqlite => "X'$1'",
        };
        let script = now_re.replace_all(script, now_repl);
        hex_re.replace_all(&script, hex_repl).into_owned()
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Postgres => write!(f, "postgres"),
            Dialect::Sqlite => write!(f, "sqlite"),
        }
    }
}

fn seed_macros() -> &'static (Regex, Regex) {
    static MACROS: OnceLock<(Regex, Regex)> = OnceLock::new();
    MACROS.get_or_init(|| {
        (
            Regex::new(r"\$NOW\('([^']*)'\)").expect("static regex"),
            Regex::new(r"\$HEX\('([0-9A-Fa-f]*)'\)").expect("static regex"),
        )
    })
}

/// Quotes an identifier for both dialects.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.placeholder(3), "$3");
        assert_eq!(Dialect::Sqlite.placeholder(3), "?");
    }

    #[test]
    fn test_seed_rewrite_postgres() {
        let sql = "INSERT INTO t VALUES ($NOW('-2 days'), $HEX('deadBEEF'));";
        assert_eq!(
            Dialect::Postgres.rewrite_seed(sql),
            "INSERT INTO t VALUES ((now() + interval '-2 days'), decode('deadBEEF', 'hex'));"
        );
    }

    #[test]
    fn test_seed_rewrite_sqlite() {
        let sql = "INSERT INTO t VALUES ($NOW('-1 hour'), $HEX('00ff'));";
        assert_eq!(
            Dialect::Sqlite.rewrite_seed(sql),
            "INSERT INTO t VALUES (datetime('now', '-1 hour'), X'00ff');"
        );
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("key"), "\"key\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
