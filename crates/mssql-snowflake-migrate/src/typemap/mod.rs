//! Type mapping between MSSQL and Snowflake.

/// Destination type used for any source type the table does not know.
pub const DEFAULT_TYPE: &str = "TEXT";

/// Map an MSSQL data type to Snowflake.
///
/// Never fails: unknown or empty type names map to [`DEFAULT_TYPE`] so that
/// an unseen source type cannot block a migration.
pub fn mssql_to_snowflake(mssql_type: &str) -> &'static str {
    match normalize(mssql_type).as_str() {
        // Integer types
        "bigint" => "BIGINT",
        "int" => "INTEGER",
        "smallint" => "SMALLINT",
        "tinyint" => "TINYINT",
        "bit" => "BOOLEAN",

        // Decimal/numeric
        "decimal" | "money" | "smallmoney" => "FLOAT",
        "numeric" => "NUMBER",

        // Floating point
        "float" | "real" => "FLOAT",

        // Date/time types
        "date" => "DATE",
        "datetime" | "datetime2" | "smalldatetime" => "TIMESTAMP_NTZ",
        "time" => "TIME",

        // String types
        "char" | "varchar" | "text" | "ntext" => "TEXT",
        "nchar" => "CHAR",
        "nvarchar" => "VARCHAR",

        // Binary types
        "binary" | "image" => "BINARY",
        "varbinary" => "VARBINARY",

        // Everything else degrades to text, except variants
        "sql_variant" => "VARIANT",
        "uniqueidentifier" | "xml" | "hierarchyid" => "TEXT",

        _ => DEFAULT_TYPE,
    }
}

/// Reduce a type name to its lookup key.
///
/// Strips brackets, any `schema.` prefix, length/precision suffixes and
/// trailing qualifiers such as `COLLATE ...`, then lowercases.
/// `"[sys].[NVARCHAR](50)"` becomes `"nvarchar"`.
pub fn normalize(type_name: &str) -> String {
    let unbracketed: String = type_name.chars().filter(|c| *c != '[' && *c != ']').collect();
    let base = unbracketed.split('(').next().unwrap_or_default();
    let base = base.rsplit('.').next().unwrap_or_default();
    base.split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase()
}
