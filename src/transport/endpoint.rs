//! Inter-VM endpoint addresses.
//!
//! Format:
//! - `vsock:<cid>:<port>` - vsock, `cid` may be `any` when listening
//! - `unix:<path>` - Unix domain socket, for local development

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::TunnelError;

/// Wildcard CID for listening on every interface.
pub const VSOCK_CID_ANY: u32 = 0xFFFF_FFFF;

/// Address of one end of the inter-VM channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Vsock { cid: u32, port: u32 },
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| TunnelError::Config(format!("invalid endpoint {:?}: {}", s, why));

        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(invalid("empty socket path"));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }

        if let Some(rest) = s.strip_prefix("vsock:") {
            let (cid, port) = rest
                .split_once(':')
                .ok_or_else(|| invalid("expected vsock:<cid>:<port>"))?;
            let cid = match cid {
                "any" => VSOCK_CID_ANY,
                cid => cid.parse().map_err(|_| invalid("bad cid"))?,
            };
            let port = port.parse().map_err(|_| invalid("bad port"))?;
            return Ok(Endpoint::Vsock { cid, port });
        }

        Err(invalid("expected a vsock: or unix: prefix"))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Vsock { cid, port } if *cid == VSOCK_CID_ANY => {
                write!(f, "vsock:any:{}", port)
            }
            Endpoint::Vsock { cid, port } => write!(f, "vsock:{}:{}", cid, port),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vsock() {
        assert_eq!(
            "vsock:3:5000".parse::<Endpoint>().unwrap(),
            Endpoint::Vsock { cid: 3, port: 5000 }
        );
        let any: Endpoint = "vsock:any:5000".parse().unwrap();
        assert_eq!(any, Endpoint::Vsock { cid: VSOCK_CID_ANY, port: 5000 });
        assert_eq!(any.to_string(), "vsock:any:5000");
    }

    #[test]
    fn test_parse_unix() {
        let endpoint: Endpoint = "unix:/tmp/tunnel.sock".parse().unwrap();
        assert_eq!(endpoint, Endpoint::Unix(PathBuf::from("/tmp/tunnel.sock")));
        assert_eq!(endpoint.to_string(), "unix:/tmp/tunnel.sock");
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "tcp:1.2.3.4:80", "unix:", "vsock:3", "vsock:x:1", "vsock:3:99999999999"] {
            assert!(bad.parse::<Endpoint>().is_err(), "{:?} should not parse", bad);
        }
    }
}
