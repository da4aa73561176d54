//! SQL text for the target writer.
//!
//! Target tables and columns come from mapping configuration, so every
//! identifier is quoted here and every value is bound as a text parameter
//! with an explicit cast.

use super::StoreError;

/// Quote a single identifier (`a"b` -> `"a""b"`).
///
/// # Errors
///
/// Returns `InvalidIdentifier` for empty names or names containing NUL.
pub fn quote_ident(name: &str) -> Result<String, StoreError> {
    if name.is_empty() || name.contains('\0') {
        return Err(StoreError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Split `schema.table`, defaulting the schema to `public`.
#[must_use]
pub fn split_table(table: &str) -> (&str, &str) {
    table.split_once('.').unwrap_or(("public", table))
}

/// `"schema"."table"`.
///
/// # Errors
///
/// Returns `InvalidIdentifier` for empty parts.
pub fn qualified_table(table: &str) -> Result<String, StoreError> {
    let (schema, name) = split_table(table);
    Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(name)?))
}

/// A target column with the type its parameter is cast to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastColumn {
    pub name: String,
    pub cast: String,
}

/// Multi-row upsert returning `(inserted, key_value)` per row.
///
/// # Errors
///
/// Returns `InvalidIdentifier` for unquotable names.
pub fn upsert(
    table: &str,
    key_column: &str,
    columns: &[CastColumn],
    row_count: usize,
) -> Result<String, StoreError> {
    let table_sql = qualified_table(table)?;
    let key_sql = quote_ident(key_column)?;
    let column_list = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut param = 0usize;
    let values = (0..row_count)
        .map(|_| {
            let placeholders = columns
                .iter()
                .map(|c| {
                    param += 1;
                    format!("${param}::{}", c.cast)
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("({placeholders})")
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut updates: Vec<String> = column_list
        .iter()
        .filter(|c| **c != key_sql)
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    if updates.is_empty() {
        updates.push(format!("{key_sql} = EXCLUDED.{key_sql}"));
    }

    Ok(format!(
        "INSERT INTO {table_sql} ({}) VALUES {values} ON CONFLICT ({key_sql}) DO UPDATE SET {} RETURNING (xmax = 0) AS inserted, {key_sql}::text AS key_value",
        column_list.join(", "),
        updates.join(", "),
    ))
}

/// Delete rows whose key is not in the JSON array bound as `$1`.
///
/// # Errors
///
/// Returns `InvalidIdentifier` for unquotable names.
pub fn delete_stale(table: &str, key_column: &str) -> Result<String, StoreError> {
    let key = quote_ident(key_column)?;
    Ok(format!(
        "DELETE FROM {} WHERE {key} IS NOT NULL AND {key}::text NOT IN (SELECT jsonb_array_elements_text($1::jsonb))",
        qualified_table(table)?
    ))
}

/// Delete the row whose key equals `$1`.
///
/// # Errors
///
/// Returns `InvalidIdentifier` for unquotable names.
pub fn delete_by_key(table: &str, key_column: &str) -> Result<String, StoreError> {
    Ok(format!(
        "DELETE FROM {} WHERE {}::text = $1",
        qualified_table(table)?,
        quote_ident(key_column)?
    ))
}

/// Stamp `column` with the current time on the row whose key equals `$1`.
///
/// # Errors
///
/// Returns `InvalidIdentifier` for unquotable names.
pub fn soft_delete_by_key(
    table: &str,
    key_column: &str,
    column: &str,
) -> Result<String, StoreError> {
    Ok(format!(
        "UPDATE {} SET {} = NOW() WHERE {}::text = $1",
        qualified_table(table)?,
        quote_ident(column)?,
        quote_ident(key_column)?
    ))
}

/// Load `(match_value, return_value)` pairs, at most `limit` rows.
///
/// # Errors
///
/// Returns `InvalidIdentifier` for unquotable names.
pub fn lookup(
    table: &str,
    match_column: &str,
    return_column: &str,
    limit: usize,
) -> Result<String, StoreError> {
    let match_sql = quote_ident(match_column)?;
    Ok(format!(
        "SELECT {match_sql} AS match_value, {} AS return_value FROM {} WHERE {match_sql} IS NOT NULL LIMIT {limit}",
        quote_ident(return_column)?,
        qualified_table(table)?
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, cast: &str) -> CastColumn {
        CastColumn {
            name: name.to_string(),
            cast: cast.to_string(),
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("Price").unwrap(), "\"Price\"");
        assert_eq!(quote_ident("a\"b").unwrap(), "\"a\"\"b\"");
        assert!(quote_ident("").is_err());
    }

    #[test]
    fn test_qualified_table_defaults_to_public() {
        assert_eq!(qualified_table("products").unwrap(), "\"public\".\"products\"");
        assert_eq!(
            qualified_table("catalog.products").unwrap(),
            "\"catalog\".\"products\""
        );
    }

    #[test]
    fn test_upsert_sql() {
        let sql = upsert(
            "products",
            "shopify_id",
            &[col("shopify_id", "text"), col("price", "numeric(10,2)")],
            2,
        )
        .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"products\" (\"shopify_id\", \"price\") VALUES ($1::text, $2::numeric(10,2)), ($3::text, $4::numeric(10,2)) ON CONFLICT (\"shopify_id\") DO UPDATE SET \"price\" = EXCLUDED.\"price\" RETURNING (xmax = 0) AS inserted, \"shopify_id\"::text AS key_value"
        );
    }

    #[test]
    fn test_upsert_with_only_key_still_returns_rows() {
        let sql = upsert("t", "id", &[col("id", "bigint")], 1).unwrap();
        assert!(sql.contains("DO UPDATE SET \"id\" = EXCLUDED.\"id\""));
    }

    #[test]
    fn test_delete_and_lookup_sql() {
        assert_eq!(
            delete_by_key("t", "id").unwrap(),
            "DELETE FROM \"public\".\"t\" WHERE \"id\"::text = $1"
        );
        assert!(delete_stale("t", "id").unwrap().contains("jsonb_array_elements_text($1::jsonb)"));
        assert_eq!(
            soft_delete_by_key("t", "id", "deleted_at").unwrap(),
            "UPDATE \"public\".\"t\" SET \"deleted_at\" = NOW() WHERE \"id\"::text = $1"
        );
        assert!(lookup("vendors", "name", "id", 5001).unwrap().ends_with("LIMIT 5001"));
    }
}
