fn leading_keyword(sql: &str) -> &str {
    let sql = sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
    let end = sql
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(sql.len());
    &sql[..end]
}

#[cfg_attr(
    not(any(feature = "sqlite-rusqlite", feature = "postgres-raw")),
    allow(dead_code)
)]
pub(crate) fn is_insert(sql: &str) -> bool {
    let keyword = leading_keyword(sql);
    keyword.eq_ignore_ascii_case("insert") || keyword.eq_ignore_ascii_case("replace")
}

/// Statements whose affected-row count is meaningful. `WITH` is included for
/// CTE-prefixed writes; a read-only `WITH ... SELECT` is filtered separately.
#[cfg_attr(not(feature = "sqlite-rusqlite"), allow(dead_code))]
pub(crate) fn modifies_rows(sql: &str) -> bool {
    let keyword = leading_keyword(sql);
    ["insert", "replace", "update", "delete", "with"]
        .iter()
        .any(|k| keyword.eq_ignore_ascii_case(k))
}

/// Statements that only read and never report affected rows.
#[cfg_attr(
    not(any(feature = "mysql-sqlx", feature = "postgres-raw")),
    allow(dead_code)
)]
pub(crate) fn is_read_only(sql: &str) -> bool {
    let keyword = leading_keyword(sql);
    [
        "select", "with", "show", "values", "explain", "describe", "desc", "pragma", "table",
    ]
    .iter()
    .any(|k| keyword.eq_ignore_ascii_case(k))
}
