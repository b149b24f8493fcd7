use thiserror::Error;

/// Errors from parsing the textual forms the server trades in: distinguished
/// names, search filters and LDAP URLs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The input's scheme is not an LDAP scheme, or the input is not a URL
    /// at all. Callers use this to fall back to plain-DN interpretation.
    #[error("not an LDAP URL")]
    BadScheme,

    #[error("invalid distinguished name: {0}")]
    InvalidDn(String),

    #[error("invalid search filter: {0}")]
    InvalidFilter(String),

    #[error("invalid LDAP URL: {0}")]
    InvalidUrl(String),
}

#[macro_export]
macro_rules! op_error {
    ($code:ident, $($arg:tt)*) => {
        // Construct the operation error.
        return Err($crate::backend::OpError::new(
            $crate::types::ResultCode::$code,
            format!($($arg)*),
        ))
    };
}
