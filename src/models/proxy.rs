use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Egress proxy endpoint parsed from one line of `proxies.txt`.
///
/// Readiness bookkeeping (`next_ready_at`) lives in the pool, not here; once
/// a proxy is handed to an account the binding is stable for the process
/// lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Proxy {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum ProxyParseError {
    #[error("expected host:port:username:password, got {0} field(s)")]
    FieldCount(usize),
    #[error("invalid port: {0}")]
    Port(String),
}

impl Proxy {
    /// Parse a `host:port:username:password` line.
    pub fn parse_line(line: &str) -> Result<Self, ProxyParseError> {
        let parts: Vec<&str> = line.trim().split(':').collect();
        if parts.len() != 4 {
            return Err(ProxyParseError::FieldCount(parts.len()));
        }
        let port: u16 = parts[1]
            .parse()
            .map_err(|_| ProxyParseError::Port(parts[1].to_string()))?;
        Ok(Self {
            id: format!("{}:{}", parts[0], port),
            host: parts[0].to_string(),
            port,
            username: parts[2].to_string(),
            password: parts[3].to_string(),
        })
    }

    /// Proxy URL without credentials; auth is applied via basic auth.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let proxy = Proxy::parse_line("10.0.0.1:8080:user:pass").unwrap();
        assert_eq!(proxy.id, "10.0.0.1:8080");
        assert_eq!(proxy.host, "10.0.0.1");
        assert_eq!(proxy.port, 8080);
        assert_eq!(proxy.username, "user");
        assert_eq!(proxy.password, "pass");
        assert_eq!(proxy.url(), "http://10.0.0.1:8080");
    }

    #[test]
    fn test_parse_line_trims_whitespace() {
        let proxy = Proxy::parse_line("  proxy.example.com:3128:u:p\n").unwrap();
        assert_eq!(proxy.host, "proxy.example.com");
    }

    #[test]
    fn test_parse_line_rejects_bad_field_count() {
        assert_eq!(
            Proxy::parse_line("host:8080:user"),
            Err(ProxyParseError::FieldCount(3))
        );
        assert_eq!(
            Proxy::parse_line("host:8080:user:pass:extra"),
            Err(ProxyParseError::FieldCount(5))
        );
    }

    #[test]
    fn test_parse_line_rejects_bad_port() {
        assert_eq!(
            Proxy::parse_line("host:http:user:pass"),
            Err(ProxyParseError::Port("http".to_string()))
        );
    }
}
