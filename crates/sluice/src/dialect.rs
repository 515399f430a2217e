//! SQL dialect abstraction for sluice
//!
//! Each supported backend provides:
//! - Identifier quoting and parameter placeholders
//! - Catalog queries (tables, columns, indexes, row estimates)
//! - SELECT generation through sea-query

use crate::security::escape_string_literal;
use sea_query::{
    Alias, Asterisk, Expr, IntoIden, MysqlQueryBuilder, Order, PostgresQueryBuilder, Query,
    SelectStatement, TableRef,
};

fn sea_table_ref(schema: Option<&str>, table: &str) -> TableRef {
    match schema {
        Some(s) => TableRef::SchemaTable(Alias::new(s).into_iden(), Alias::new(table).into_iden()),
        None => TableRef::Table(Alias::new(table).into_iden()),
    }
}

fn select_statement(
    schema: Option<&str>,
    table: &str,
    columns: &[&str],
    where_clause: Option<&str>,
    order_by: &[(&str, bool)],
    limit: Option<u64>,
) -> SelectStatement {
    let mut stmt = Query::select();
    stmt.from(sea_table_ref(schema, table));

    if columns.is_empty() {
        stmt.column(Asterisk);
    } else {
        for col in columns {
            stmt.column(Alias::new(*col));
        }
    }

    if let Some(w) = where_clause {
        stmt.and_where(Expr::cust(w));
    }

    for (col, asc) in order_by {
        stmt.order_by(
            Alias::new(*col),
            if *asc { Order::Asc } else { Order::Desc },
        );
    }

    if let Some(l) = limit {
        stmt.limit(l);
    }
    stmt
}

fn in_list(values: &[String]) -> String {
    values
        .iter()
        .map(|v| format!("'{}'", escape_string_literal(v)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Get the placeholder for a parameter (e.g., $1, ?)
    fn placeholder(&self, index: usize) -> String;

    /// Catalog query listing base tables.
    ///
    /// Result columns: `table_catalog`, `table_schema`, `table_name`.
    fn list_tables_sql(&self, include_schemas: &[String]) -> String;

    /// Catalog query listing the columns of one table in ordinal order.
    ///
    /// Result columns: `column_name`, `data_type`, `nullable`, `ordinal_position`,
    /// `column_default`, `character_maximum_length`, `numeric_precision`,
    /// `numeric_scale`, `pk_ordinal`, `auto_increment`.
    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String;

    /// Catalog query listing index columns of one table.
    ///
    /// Result columns: `index_name`, `column_name`, `is_unique`, `is_primary`, `seq`.
    fn list_indexes_sql(&self, schema: Option<&str>, table: &str) -> String;

    /// Statistics query returning a single `estimated_rows` value
    fn estimate_rows_sql(&self, schema: Option<&str>, table: &str) -> String;

    /// Build a SELECT statement
    fn build_select(
        &self,
        schema: Option<&str>,
        table: &str,
        columns: &[&str],
        where_clause: Option<&str>,
        order_by: &[(&str, bool)],
        limit: Option<u64>,
    ) -> String;
}

// ===========================================================================
// PostgreSQL
// ===========================================================================

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn list_tables_sql(&self, include_schemas: &[String]) -> String {
        let filter = if include_schemas.is_empty() {
            "table_schema NOT IN ('pg_catalog', 'information_schema') AND table_schema NOT LIKE 'pg_toast%'".to_string()
        } else {
            format!("table_schema IN ({})", in_list(include_schemas))
        };
        format!(
            "SELECT table_catalog, table_schema, table_name \
             FROM information_schema.tables \
             WHERE table_type = 'BASE TABLE' AND {} \
             ORDER BY table_schema, table_name",
            filter
        )
    }

    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema = escape_string_literal(schema.unwrap_or("public"));
        let table = escape_string_literal(table);
        format!(
            r#"SELECT
                c.column_name,
                c.data_type,
                c.is_nullable = 'YES' AS nullable,
                c.ordinal_position,
                c.column_default,
                c.character_maximum_length,
                c.numeric_precision,
                c.numeric_scale,
                pk.ordinal_position AS pk_ordinal,
                (c.column_default LIKE 'nextval(%' OR c.is_identity = 'YES') AS auto_increment
            FROM information_schema.columns c
            LEFT JOIN (
                SELECT ku.column_name, ku.ordinal_position
                FROM information_schema.table_constraints tc
                JOIN information_schema.key_column_usage ku
                    ON tc.constraint_name = ku.constraint_name
                    AND tc.table_schema = ku.table_schema
                    AND tc.table_name = ku.table_name
                WHERE tc.constraint_type = 'PRIMARY KEY'
                    AND tc.table_schema = '{schema}'
                    AND tc.table_name = '{table}'
            ) pk ON c.column_name = pk.column_name
            WHERE c.table_schema = '{schema}' AND c.table_name = '{table}'
            ORDER BY c.ordinal_position"#
        )
    }

    fn list_indexes_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema = escape_string_literal(schema.unwrap_or("public"));
        let table = escape_string_literal(table);
        format!(
            r#"SELECT
                i.relname AS index_name,
                a.attname AS column_name,
                ix.indisunique AS is_unique,
                ix.indisprimary AS is_primary,
                k.ord AS seq
            FROM pg_index ix
            JOIN pg_class t ON t.oid = ix.indrelid
            JOIN pg_class i ON i.oid = ix.indexrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            CROSS JOIN LATERAL unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
            WHERE n.nspname = '{schema}' AND t.relname = '{table}'
            ORDER BY i.relname, k.ord"#
        )
    }

    fn estimate_rows_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema = escape_string_literal(schema.unwrap_or("public"));
        let table = escape_string_literal(table);
        format!(
            "SELECT c.reltuples::bigint AS estimated_rows \
             FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = '{}' AND c.relname = '{}'",
            schema, table
        )
    }

    fn build_select(
        &self,
        schema: Option<&str>,
        table: &str,
        columns: &[&str],
        where_clause: Option<&str>,
        order_by: &[(&str, bool)],
        limit: Option<u64>,
    ) -> String {
        select_statement(schema, table, columns, where_clause, order_by, limit)
            .to_string(PostgresQueryBuilder)
    }
}

// ===========================================================================
// MySQL
// ===========================================================================

/// MySQL dialect (schemas are databases)
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn list_tables_sql(&self, include_schemas: &[String]) -> String {
        let filter = if include_schemas.is_empty() {
            "TABLE_SCHEMA = DATABASE()".to_string()
        } else {
            format!("TABLE_SCHEMA IN ({})", in_list(include_schemas))
        };
        format!(
            "SELECT NULL AS table_catalog, TABLE_SCHEMA AS table_schema, TABLE_NAME AS table_name \
             FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_TYPE = 'BASE TABLE' AND {} \
             ORDER BY TABLE_SCHEMA, TABLE_NAME",
            filter
        )
    }

    fn list_columns_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema_filter = match schema {
            Some(s) => format!("'{}'", escape_string_literal(s)),
            None => "DATABASE()".to_string(),
        };
        let table = escape_string_literal(table);
        format!(
            r#"SELECT
                c.COLUMN_NAME AS column_name,
                c.COLUMN_TYPE AS data_type,
                c.IS_NULLABLE = 'YES' AS nullable,
                c.ORDINAL_POSITION AS ordinal_position,
                c.COLUMN_DEFAULT AS column_default,
                c.CHARACTER_MAXIMUM_LENGTH AS character_maximum_length,
                c.NUMERIC_PRECISION AS numeric_precision,
                c.NUMERIC_SCALE AS numeric_scale,
                k.ORDINAL_POSITION AS pk_ordinal,
                c.EXTRA LIKE '%auto_increment%' AS auto_increment
            FROM INFORMATION_SCHEMA.COLUMNS c
            LEFT JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE k
                ON k.TABLE_SCHEMA = c.TABLE_SCHEMA
                AND k.TABLE_NAME = c.TABLE_NAME
                AND k.COLUMN_NAME = c.COLUMN_NAME
                AND k.CONSTRAINT_NAME = 'PRIMARY'
            WHERE c.TABLE_SCHEMA = {schema_filter} AND c.TABLE_NAME = '{table}'
            ORDER BY c.ORDINAL_POSITION"#
        )
    }

    fn list_indexes_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema_filter = match schema {
            Some(s) => format!("'{}'", escape_string_literal(s)),
            None => "DATABASE()".to_string(),
        };
        let table = escape_string_literal(table);
        format!(
            "SELECT INDEX_NAME AS index_name, COLUMN_NAME AS column_name, \
             NON_UNIQUE = 0 AS is_unique, INDEX_NAME = 'PRIMARY' AS is_primary, \
             SEQ_IN_INDEX AS seq \
             FROM INFORMATION_SCHEMA.STATISTICS \
             WHERE TABLE_SCHEMA = {} AND TABLE_NAME = '{}' \
             ORDER BY INDEX_NAME, SEQ_IN_INDEX",
            schema_filter, table
        )
    }

    fn estimate_rows_sql(&self, schema: Option<&str>, table: &str) -> String {
        let schema_filter = match schema {
            Some(s) => format!("'{}'", escape_string_literal(s)),
            None => "DATABASE()".to_string(),
        };
        format!(
            "SELECT TABLE_ROWS AS estimated_rows FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_SCHEMA = {} AND TABLE_NAME = '{}'",
            schema_filter,
            escape_string_literal(table)
        )
    }

    fn build_select(
        &self,
        schema: Option<&str>,
        table: &str,
        columns: &[&str],
        where_clause: Option<&str>,
        order_by: &[(&str, bool)],
        limit: Option<u64>,
    ) -> String {
        select_statement(schema, table, columns, where_clause, order_by, limit)
            .to_string(MysqlQueryBuilder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_quoting() {
        let d = PostgresDialect;
        assert_eq!(d.quote_identifier("users"), "\"users\"");
        assert_eq!(d.quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(d.placeholder(2), "$2");
    }

    #[test]
    fn test_mysql_quoting() {
        let d = MySqlDialect;
        assert_eq!(d.quote_identifier("users"), "`users`");
        assert_eq!(d.placeholder(7), "?");
    }

    #[test]
    fn test_postgres_select_with_filter_and_order() {
        let sql = PostgresDialect.build_select(
            Some("public"),
            "orders",
            &["id", "total"],
            Some("\"id\" > $1"),
            &[("id", true)],
            None,
        );
        assert!(sql.starts_with(r#"SELECT "id", "total" FROM "public"."orders""#));
        assert!(sql.contains(r#"WHERE "id" > $1"#));
        assert!(sql.ends_with(r#"ORDER BY "id" ASC"#));
    }

    #[test]
    fn test_mysql_select_wildcard_with_limit() {
        let sql = MySqlDialect.build_select(Some("shop"), "logs", &[], None, &[], Some(50));
        assert!(sql.contains("SELECT *"));
        assert!(sql.contains("`shop`.`logs`"));
        assert!(sql.contains("LIMIT 50"));
    }

    #[test]
    fn test_catalog_queries_escape_literals() {
        let sql = PostgresDialect.list_columns_sql(Some("public"), "o'brien");
        assert!(sql.contains("'o''brien'"));

        let sql = MySqlDialect.list_tables_sql(&["a'b".to_string()]);
        assert!(sql.contains("IN ('a''b')"));
    }

    #[test]
    fn test_mysql_defaults_to_current_database() {
        let sql = MySqlDialect.estimate_rows_sql(None, "orders");
        assert!(sql.contains("TABLE_SCHEMA = DATABASE()"));
    }
}
