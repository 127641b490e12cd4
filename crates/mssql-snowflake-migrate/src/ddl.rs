//! Destination DDL generation.

use crate::source::Table;
use crate::target::quote_ident;
use crate::typemap::mssql_to_snowflake;

/// Build the `CREATE TABLE` statement for a source table.
///
/// Columns are emitted in the table's declared order; bulk loads rely on the
/// same positional order as the staged header. All names are quoted, so they
/// keep their source spelling and case.
pub fn create_table_ddl(table: &Table) -> String {
    let columns = table
        .columns
        .iter()
        .map(|col| format!("{} {}", quote_ident(&col.name), mssql_to_snowflake(&col.data_type)))
        .collect::<Vec<_>>()
        .join(", ");

    format!("CREATE TABLE {} ({})", quote_ident(&table.name), columns)
}
