// instancemanager/src/utils/sql.rs

/// Quotes an SQL identifier, doubling embedded double quotes.
pub fn quote_identifier(name: &str) -> String {
    let end = name.find('\0').unwrap_or(name.len());
    format!("\"{}\"", name[..end].replace('"', "\"\""))
}

/// Quotes an SQL string literal. Literals containing backslashes use the
/// escape-string syntax so they are read the same way whatever the value of
/// `standard_conforming_strings`.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!(" E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

/// Quotes a value for a libpq connection string (`key=value` pairs).
pub fn quote_conninfo_value(value: &str) -> String {
    if !value.is_empty()
        && !value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\')
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Quotes a value for a `postgresql.conf` line. The configuration parser
/// treats a backslash inside quotes as an escape, so it is doubled too.
pub fn quote_config_value(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}
