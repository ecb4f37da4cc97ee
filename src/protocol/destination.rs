//! `host:port` destinations carried by OPEN frames.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TunnelError};

/// Longest destination accepted in an OPEN payload.
pub const MAX_DESTINATION_LEN: usize = 512;

/// A remote endpoint the host relay should dial.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    host: String,
    port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        let host_part = host.trim_start_matches('[').trim_end_matches(']');
        if host_part.is_empty() {
            return Err(TunnelError::InvalidDestination("empty host".to_string()));
        }
        if host_part.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(TunnelError::InvalidDestination(format!(
                "host contains whitespace: {:?}",
                host
            )));
        }
        if port == 0 {
            return Err(TunnelError::InvalidDestination(format!(
                "port 0 for host {}",
                host
            )));
        }
        let dest = Self {
            host: host_part.to_string(),
            port,
        };
        if dest.to_string().len() > MAX_DESTINATION_LEN {
            return Err(TunnelError::InvalidDestination(format!(
                "destination longer than {} bytes",
                MAX_DESTINATION_LEN
            )));
        }
        Ok(dest)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse an OPEN payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload).map_err(|e| {
            TunnelError::InvalidDestination(format!("invalid UTF-8 in destination: {}", e))
        })?;
        text.parse()
    }
}

impl FromStr for Destination {
    type Err = TunnelError;

    /// Accepts `host:port`, `1.2.3.4:port` and `[v6::addr]:port`.
    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::InvalidDestination(format!("missing port in {:?}", s)))?;
        if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
            return Err(TunnelError::InvalidDestination(format!(
                "IPv6 host must be bracketed: {:?}",
                s
            )));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| TunnelError::InvalidDestination(format!("bad port in {:?}", s)))?;
        Destination::new(host, port)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let dest: Destination = "example.org:443".parse().unwrap();
        assert_eq!(dest.host(), "example.org");
        assert_eq!(dest.port(), 443);
        assert_eq!(dest.to_string(), "example.org:443");
    }

    #[test]
    fn test_parse_ipv6() {
        let dest: Destination = "[::1]:8443".parse().unwrap();
        assert_eq!(dest.host(), "::1");
        assert_eq!(dest.to_string(), "[::1]:8443");
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!("example.org".parse::<Destination>().is_err());
        assert!("example.org:0".parse::<Destination>().is_err());
        assert!("example.org:70000".parse::<Destination>().is_err());
        assert!(":443".parse::<Destination>().is_err());
        assert!("::1:443".parse::<Destination>().is_err());
        assert!("exa mple.org:443".parse::<Destination>().is_err());
        assert!(Destination::from_payload(&[0xff, 0xfe, b':', b'1']).is_err());
    }

    #[test]
    fn test_length_limit() {
        let host = "a".repeat(MAX_DESTINATION_LEN);
        assert!(Destination::new(host, 443).is_err());
    }
}
