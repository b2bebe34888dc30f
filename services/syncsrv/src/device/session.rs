//! Authenticated device session

/// One login's worth of credentials
///
/// Sessions are immutable; re-authentication produces a new one with a
/// higher `version`, so anything keyed on the version (out-of-service
/// assertions) is invalidated with it.
#[derive(Debug, Clone)]
pub struct Session {
    version: u64,
    cookie: Option<String>,
}

impl Session {
    pub fn new(version: u64, cookie: Option<String>) -> Self {
        Self { version, cookie }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }
}

/// Extract `name=value` from a `Set-Cookie` header, dropping attributes
pub fn parse_set_cookie(header: &str) -> Option<String> {
    header
        .split(';')
        .next()
        .map(str::trim)
        .filter(|pair| pair.contains('='))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_cookie() {
        assert_eq!(
            parse_set_cookie("session=abc123; Path=/; HttpOnly"),
            Some("session=abc123".to_string())
        );
        assert_eq!(parse_set_cookie("garbage"), None);
    }
}
