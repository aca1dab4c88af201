//! Socket address representation shared by all transports.
//!
//! Addresses are a tagged union mirroring what the transports can actually
//! produce. Numeric fields are stored in network byte order, the way they
//! travel on the wire; [`std::fmt::Display`] converts back to the
//! conventional textual forms (`a.b.c.d:port`, `[v6]:port`, paths, names).

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr as StdSocketAddr};

/// A transport-level socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SockAddr {
    /// Address family not (yet) known.
    Unspec,
    /// In-process rendezvous name (`inproc://name`).
    Inproc { name: String },
    /// Filesystem path of a Unix domain socket (`ipc:///path`).
    Ipc { path: String },
    /// IPv4 address and port, both in network byte order.
    In4 { addr: u32, port: u16 },
    /// IPv6 address and port; the address is already a byte sequence,
    /// the port is in network byte order.
    In6 { addr: [u8; 16], port: u16 },
    /// Linux abstract-namespace name; may contain NUL bytes.
    Abstract { name: Vec<u8> },
}

impl SockAddr {
    /// Short name of the address family, mirroring the URL scheme.
    pub fn family(&self) -> &'static str {
        match self {
            SockAddr::Unspec => "unspec",
            SockAddr::Inproc { .. } => "inproc",
            SockAddr::Ipc { .. } => "ipc",
            SockAddr::In4 { .. } => "inet",
            SockAddr::In6 { .. } => "inet6",
            SockAddr::Abstract { .. } => "abstract",
        }
    }

    /// Convert from a standard library TCP/UDP address.
    pub fn from_std(addr: StdSocketAddr) -> Self {
        match addr {
            StdSocketAddr::V4(v4) => SockAddr::In4 {
                addr: u32::from(*v4.ip()).to_be(),
                port: v4.port().to_be(),
            },
            StdSocketAddr::V6(v6) => SockAddr::In6 {
                addr: v6.ip().octets(),
                port: v6.port().to_be(),
            },
        }
    }

    /// Back to a standard library address, when the family allows it.
    pub fn to_std(&self) -> Option<StdSocketAddr> {
        match self {
            SockAddr::In4 { addr, port } => Some(StdSocketAddr::from((
                Ipv4Addr::from(u32::from_be(*addr)),
                u16::from_be(*port),
            ))),
            SockAddr::In6 { addr, port } => {
                Some(StdSocketAddr::from((Ipv6Addr::from(*addr), u16::from_be(*port))))
            }
            _ => None,
        }
    }
}

/// Escape a byte string the way abstract socket names are rendered in URLs:
/// printable ASCII passes through, everything else becomes `%XX`.
pub(crate) fn uri_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        let printable = b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~');
        if printable {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Inverse of [`uri_encode`]; invalid escapes are passed through verbatim.
pub(crate) fn uri_decode(s: &str) -> Vec<u8> {
    let raw = s.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                raw.get(i + 1).and_then(|c| (*c as char).to_digit(16)),
                raw.get(i + 2).and_then(|c| (*c as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }
    out
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockAddr::Unspec => write!(f, "<unspecified>"),
            SockAddr::Inproc { name } => write!(f, "{name}"),
            SockAddr::Ipc { path } => write!(f, "{path}"),
            SockAddr::In4 { addr, port } => {
                let ip = Ipv4Addr::from(u32::from_be(*addr));
                write!(f, "{ip}:{}", u16::from_be(*port))
            }
            SockAddr::In6 { addr, port } => {
                let ip = Ipv6Addr::from(*addr);
                write!(f, "[{ip}]:{}", u16::from_be(*port))
            }
            SockAddr::Abstract { name } => {
                write!(f, "abstract://{}", uri_encode(name))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_round_trips_through_std() {
        let std_addr: StdSocketAddr = "10.1.2.3:4567".parse().unwrap();
        let sa = SockAddr::from_std(std_addr);
        assert_eq!(sa.to_string(), "10.1.2.3:4567");
        assert_eq!(sa.to_std(), Some(std_addr));
        assert_eq!(sa.family(), "inet");
    }

    #[test]
    fn ipv6_renders_bracketed() {
        let std_addr: StdSocketAddr = "[::1]:9000".parse().unwrap();
        let sa = SockAddr::from_std(std_addr);
        assert_eq!(sa.to_string(), "[::1]:9000");
        assert_eq!(sa.to_std(), Some(std_addr));
    }

    #[test]
    fn abstract_names_escape_nul_bytes() {
        let sa = SockAddr::Abstract {
            name: b"jam\x00jar".to_vec(),
        };
        assert_eq!(sa.to_string(), "abstract://jam%00jar");
        assert_eq!(uri_decode("jam%00jar"), b"jam\x00jar".to_vec());
    }

    #[test]
    fn uri_decode_passes_bad_escapes_through() {
        assert_eq!(uri_decode("a%zz"), b"a%zz".to_vec());
        assert_eq!(uri_decode("trailing%"), b"trailing%".to_vec());
    }
}
