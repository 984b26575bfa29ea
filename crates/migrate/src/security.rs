//! Identifier safety for statement text
//!
//! Table names cannot be sent as bound parameters, so the ledger table name
//! is validated against an allow-list pattern and then quoted before it is
//! embedded in SQL. Data values always stay bound parameters.

use crate::error::{MigrateError, MigrateResult};

/// PostgreSQL truncates identifiers longer than this many bytes
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Keywords rejected as bare identifiers, even though quoting would make them legal
static SQL_KEYWORDS: &[&str] = &[
    "SELECT",
    "INSERT",
    "UPDATE",
    "DELETE",
    "FROM",
    "WHERE",
    "JOIN",
    "UNION",
    "DROP",
    "CREATE",
    "ALTER",
    "GRANT",
    "REVOKE",
    "TRUNCATE",
    "TABLE",
    "INDEX",
    "EXEC",
    "EXECUTE",
    "DECLARE",
    "CAST",
    "USER",
    "SESSION_USER",
    "CURRENT_USER",
    "ORDER",
    "GROUP",
    "LIMIT",
];

/// Validate a single identifier part: ASCII letters, digits and underscores,
/// not starting with a digit, at most 63 bytes, not a reserved keyword.
pub fn validate_identifier(identifier: &str) -> MigrateResult<()> {
    let first = identifier
        .chars()
        .next()
        .ok_or_else(|| MigrateError::InvalidIdentifier("identifier cannot be empty".to_string()))?;

    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(MigrateError::InvalidIdentifier(format!(
            "'{}' is too long (max {} characters)",
            identifier, MAX_IDENTIFIER_LEN
        )));
    }

    if let Some(c) = identifier
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        return Err(MigrateError::InvalidIdentifier(format!(
            "'{}' contains invalid character '{}'",
            identifier, c
        )));
    }

    if first.is_ascii_digit() {
        return Err(MigrateError::InvalidIdentifier(format!(
            "'{}' cannot start with a number",
            identifier
        )));
    }

    let upper = identifier.to_ascii_uppercase();
    if SQL_KEYWORDS.contains(&upper.as_str()) {
        return Err(MigrateError::InvalidIdentifier(format!(
            "'{}' is a reserved SQL keyword",
            identifier
        )));
    }

    Ok(())
}

/// Validate a table name that may be qualified with one schema
/// (`schema.table`) and return its parts.
pub fn validate_table_name(name: &str) -> MigrateResult<Vec<&str>> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(MigrateError::InvalidIdentifier(format!(
            "'{}' has more than one schema qualifier",
            name
        )));
    }

    for part in &parts {
        validate_identifier(part)?;
    }
    Ok(parts)
}

/// Double-quote an identifier part, doubling embedded quotes
pub fn escape_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Validate and quote a possibly schema-qualified table name
pub fn quote_table_name(name: &str) -> MigrateResult<String> {
    let parts = validate_table_name(name)?;
    Ok(parts
        .into_iter()
        .map(escape_identifier)
        .collect::<Vec<_>>()
        .join("."))
}
