//! Service path grammar: `service<delimiter>method`.

use crate::error::{Error, Result};

/// Leading character that marks a method as not reachable over RPC.
pub const RESERVED_PREFIX: char = '_';

/// Service segment that asks a server to terminate instead of dispatching.
pub const SHUTDOWN_SENTINEL: &str = "#CS#";

/// Whether `method` is blocked from remote dispatch.
pub fn is_reserved(method: &str) -> bool {
    method.starts_with(RESERVED_PREFIX)
}

/// A service path split into its two segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServicePath<'a> {
    pub service: &'a str,
    pub method: &'a str,
}

impl<'a> ServicePath<'a> {
    /// Parse and validate a path on the sending side.
    ///
    /// Everything after the first delimiter is the method, so a method may
    /// itself contain the delimiter.
    pub fn parse(path: &'a str, delimiter: &str) -> Result<Self> {
        if delimiter.is_empty() || path.trim().is_empty() {
            return Err(Error::InvalidPath(path.to_string()));
        }

        let Some((service, method)) = path.split_once(delimiter) else {
            return Err(Error::MissingMethod(path.to_string()));
        };

        if service.is_empty() || service == SHUTDOWN_SENTINEL {
            return Err(Error::InvalidPath(path.to_string()));
        }
        if method.is_empty() {
            return Err(Error::MissingMethod(path.to_string()));
        }
        if is_reserved(method) {
            return Err(Error::InvalidMethod(method.to_string()));
        }

        Ok(Self { service, method })
    }

    /// Split a path on the receiving side without validating it.
    ///
    /// A path without a delimiter yields an empty method.
    pub fn split(path: &'a str, delimiter: &str) -> Self {
        match path.split_once(delimiter).filter(|_| !delimiter.is_empty()) {
            Some((service, method)) => Self { service, method },
            None => Self {
                service: path,
                method: "",
            },
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.service == SHUTDOWN_SENTINEL
    }

    pub fn join(&self, delimiter: &str) -> String {
        format!("{}{}{}", self.service, delimiter, self.method)
    }
}

/// Path carried by the shutdown sentinel request.
pub fn shutdown_path(delimiter: &str) -> String {
    format!("{SHUTDOWN_SENTINEL}{delimiter}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn parse_splits_on_first_delimiter() {
        let path = ServicePath::parse("users.find.byId", ".").unwrap();
        assert_eq!(path.service, "users");
        assert_eq!(path.method, "find.byId");
    }

    #[test]
    fn parse_honours_custom_delimiter() {
        let path = ServicePath::parse("users::find", "::").unwrap();
        assert_eq!(path.service, "users");
        assert_eq!(path.method, "find");
        assert_eq!(path.join("::"), "users::find");
    }

    #[test]
    fn parse_rejects_single_segment() {
        for path in ["users", "users.", "x"] {
            let err = ServicePath::parse(path, ".").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MissingMethod, "{path}");
        }
    }

    #[test]
    fn parse_rejects_empty_or_sentinel_service() {
        for path in ["", "   ", ".echo", "#CS#.echo"] {
            let err = ServicePath::parse(path, ".").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidPath, "{path:?}");
        }
    }

    #[test]
    fn parse_rejects_reserved_method() {
        let err = ServicePath::parse("users._internal", ".").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidMethod);
        assert!(err.is_validation());
    }

    #[test]
    fn split_is_lenient() {
        let path = ServicePath::split("users", ".");
        assert_eq!(path.service, "users");
        assert_eq!(path.method, "");

        let sentinel = shutdown_path(".");
        let path = ServicePath::split(&sentinel, ".");
        assert!(path.is_shutdown());
    }
}
