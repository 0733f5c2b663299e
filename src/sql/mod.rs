//! T-SQL text assembly.
//!
//! Nothing outside this module concatenates identifiers or literals into
//! statement text: captured names always pass through [`quote_ident`] or
//! [`quote_literal`].

pub(crate) mod catalog;
pub(crate) mod statement;

pub use catalog::CatalogQuery;
pub use statement::{FileGrowth, FileRelocation, Guard, GuardedStatement, Statement, UserBinding};

/// Bracket-quotes an identifier, doubling any closing bracket (`QUOTENAME` semantics).
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Renders a Unicode string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("N'{}'", value.replace('\'', "''"))
}

/// Two-part name such as `[dbo].[Orders]`.
pub fn qualified_name(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Joins a directory and file name using the separator style of the directory.
///
/// Server paths are interpreted by the instance, not by this process, so
/// `std::path` cannot be used: a Linux client may be talking to a Windows
/// instance and vice versa.
pub fn join_server_path(directory: &str, file_name: &str) -> String {
    if directory.is_empty() {
        return file_name.to_string();
    }
    if directory.ends_with('/') || directory.ends_with('\\') {
        return format!("{}{}", directory, file_name);
    }
    let separator = if directory.contains('/') && !directory.contains('\\') {
        '/'
    } else {
        '\\'
    };
    format!("{}{}{}", directory, separator, file_name)
}
