//! Address parsing and resolution.
//!
//! Configuration strings come in three shapes:
//!
//! - `host`: the default port applies
//! - `host:port`: only when the string holds exactly one colon
//! - `[literal]` or `[literal]:port`: bracketed IPv6 literal
//!
//! A string with several colons and no brackets is taken as a bare host
//! (usually an unbracketed IPv6 literal) and gets the default port. That
//! reading is ambiguous for inputs like `::1:1688`, which resolve to the
//! literal `::1:1688` on the default port rather than `::1` on port 1688.
//!
//! # Examples
//!
//! ```
//! use kmsd_core::{AddressFamily, AddressSpec};
//!
//! let spec = AddressSpec::parse("[2001:db8::1]:1688", 1688, AddressFamily::Any).unwrap();
//! assert_eq!(spec.host(), "2001:db8::1");
//! assert_eq!(spec.port(), "1688");
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};

use crate::error::{AddressError, AddressResult};

/// Longest address string accepted by [`AddressSpec::parse`].
pub const MAX_ADDRESS_LEN: usize = 255;

/// How much of an over-long address is quoted in the error.
const TOO_LONG_PREFIX_CHARS: usize = 32;

/// Address-family restriction applied when resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// IPv4 and IPv6.
    #[default]
    Any,
    /// IPv4 only.
    Ipv4,
    /// IPv6 only.
    Ipv6,
}

impl AddressFamily {
    /// Whether `addr` belongs to this family.
    pub fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Any => write!(f, "any"),
            AddressFamily::Ipv4 => write!(f, "IPv4"),
            AddressFamily::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// Label used in connection diagnostics ("IPv4" or "IPv6").
pub fn family_label(addr: &SocketAddr) -> &'static str {
    if addr.is_ipv6() { "IPv6" } else { "IPv4" }
}

/// How a parsed [`AddressSpec`] is turned into socket addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveHints {
    /// Only accept IP literals; never consult the name resolver.
    pub numeric_host: bool,
    /// Resolve for bind intent. An empty host then means the wildcard
    /// addresses of every allowed family.
    pub passive: bool,
}

impl ResolveHints {
    /// Hints for listening sockets: numeric host, passive.
    pub const fn listen() -> Self {
        Self {
            numeric_host: true,
            passive: true,
        }
    }

    /// Hints for outbound connections: names allowed, active.
    pub const fn connect() -> Self {
        Self {
            numeric_host: false,
            passive: false,
        }
    }
}

/// A configuration address split into host and port tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpec {
    input: String,
    host: String,
    port: String,
    family: AddressFamily,
}

impl AddressSpec {
    /// Split `input` into host and port tokens.
    ///
    /// `default_port` fills in the port when `input` carries none.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::TooLong`] when `input` exceeds
    /// [`MAX_ADDRESS_LEN`] bytes. Every other problem surfaces at
    /// [`resolve`](Self::resolve) time.
    pub fn parse(
        input: &str,
        default_port: u16,
        family: AddressFamily,
    ) -> AddressResult<Self> {
        if input.len() > MAX_ADDRESS_LEN {
            return Err(AddressError::TooLong {
                prefix: input.chars().take(TOO_LONG_PREFIX_CHARS).collect(),
                len: input.len(),
                max: MAX_ADDRESS_LEN,
            });
        }

        let (host, port) = match (input.starts_with('['), input.rfind(']')) {
            (true, Some(close)) => {
                let port = input[close + 1..].strip_prefix(':');
                (&input[1..close], port)
            }
            _ => match input.split_once(':') {
                Some((host, port)) if !port.contains(':') => (host, Some(port)),
                _ => (input, None),
            },
        };

        Ok(Self {
            input: input.to_owned(),
            host: host.to_owned(),
            port: port.map_or_else(|| default_port.to_string(), str::to_owned),
            family,
        })
    }

    /// The string this spec was parsed from.
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Host token (brackets stripped).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port token, explicit or defaulted.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Family constraint.
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Resolve into concrete socket addresses.
    ///
    /// Candidates keep the resolver's order, are filtered by the family
    /// constraint and de-duplicated.
    ///
    /// # Errors
    ///
    /// Fails when the port is not a decimal `u16`, when the host is empty
    /// without passive intent, when a name is given in numeric mode, when
    /// the resolver fails, or when no candidate survives the family filter.
    pub fn resolve(&self, hints: ResolveHints) -> AddressResult<Vec<SocketAddr>> {
        let port: u16 = self
            .port
            .parse()
            .map_err(|_| AddressError::InvalidPort {
                address: self.input.clone(),
                port: self.port.clone(),
            })?;

        let candidates: Vec<SocketAddr> = if self.host.is_empty() {
            if !hints.passive {
                return Err(AddressError::EmptyHost {
                    address: self.input.clone(),
                });
            }
            vec![
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            ]
        } else if let Ok(ip) = self.host.parse::<IpAddr>() {
            vec![SocketAddr::new(ip, port)]
        } else if hints.numeric_host {
            return Err(AddressError::NotNumeric {
                address: self.input.clone(),
            });
        } else {
            (self.host.as_str(), port)
                .to_socket_addrs()
                .map_err(|source| AddressError::Resolve {
                    address: self.input.clone(),
                    source,
                })?
                .collect()
        };

        let mut resolved: Vec<SocketAddr> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if self.family.matches(&candidate) && !resolved.contains(&candidate) {
                resolved.push(candidate);
            }
        }

        if resolved.is_empty() {
            return Err(AddressError::NoCandidates {
                address: self.input.clone(),
                family: self.family,
            });
        }
        tracing::debug!(
            address = %self.input,
            candidates = resolved.len(),
            "address resolved"
        );
        Ok(resolved)
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.input)
    }
}
