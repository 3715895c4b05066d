//  ADDRESS.rs
//    by Lut99
//
//  Created:
//    14 Mar 2024, 10:09:23
//  Last edited:
//    30 Jul 2024, 16:47:02
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines the Address struct, which identifies a peer (typically a
//!   worker process) by host and port. It is more lenient than a
//!   `SocketAddr`, since it also accepts hostnames.
//

use std::fmt::{Display, Formatter, Result as FResult};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use enum_debug::EnumDebug;
use log::trace;
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};


/***** ERRORS *****/
/// Errors that relate to parsing Addresses.
#[derive(Debug)]
pub enum AddressError {
    /// Invalid port number.
    IllegalPortNumber { raw: String, err: std::num::ParseIntError },
    /// Missing the colon separator (':') in the address.
    MissingColon { raw: String },
    /// The host-part of the address was empty.
    MissingHost { raw: String },
}
impl Display for AddressError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use AddressError::*;
        match self {
            IllegalPortNumber { raw, .. } => write!(f, "Illegal port number '{raw}'"),
            MissingColon { raw } => write!(f, "Missing host/port separator ':' in '{raw}' (did you forget to define a port?)"),
            MissingHost { raw } => write!(f, "Missing host in address '{raw}'"),
        }
    }
}
impl std::error::Error for AddressError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use AddressError::*;
        match self {
            IllegalPortNumber { err, .. } => Some(err),
            MissingColon { .. } => None,
            MissingHost { .. } => None,
        }
    }
}





/***** LIBRARY *****/
/// Defines a more lenient alternative to a SocketAddr that also accepts hostnames.
#[derive(Clone, Debug, EnumDebug, Eq, Hash, PartialEq)]
pub enum Address {
    /// It's an Ipv4 address.
    Ipv4(Ipv4Addr, u16),
    /// It's an Ipv6 address.
    Ipv6(Ipv6Addr, u16),
    /// It's a hostname.
    Hostname(String, u16),
}
impl Address {
    /// Constructor for the Address that initializes it for the given hostname.
    ///
    /// # Arguments
    /// - `hostname`: The hostname for this address.
    /// - `port`: The port for this address.
    ///
    /// # Returns
    /// A new Address instance.
    #[inline]
    pub fn hostname(hostname: impl Into<String>, port: u16) -> Self { Self::Hostname(hostname.into(), port) }

    /// Returns the port of this address.
    #[inline]
    pub fn port(&self) -> u16 {
        use Address::*;
        match self {
            Ipv4(_, port) => *port,
            Ipv6(_, port) => *port,
            Hostname(_, port) => *port,
        }
    }

    /// Formats this Address as a URL on which a gRPC endpoint may be reached.
    ///
    /// # Returns
    /// A `http://<host>:<port>` string.
    #[inline]
    pub fn grpc_url(&self) -> String { format!("http://{self}") }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> FResult {
        use Address::*;
        match self {
            Ipv4(addr, port) => write!(f, "{addr}:{port}"),
            Ipv6(addr, port) => write!(f, "[{addr}]:{port}"),
            Hostname(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        trace!("Parsing address '{s}'");

        // Find the split between the host and the port (mind IPv6 brackets)
        let (host, port): (&str, &str) = match s.rfind(':') {
            Some(pos) => (&s[..pos], &s[pos + 1..]),
            None => {
                return Err(AddressError::MissingColon { raw: s.into() });
            },
        };
        if host.is_empty() {
            return Err(AddressError::MissingHost { raw: s.into() });
        }

        // Parse the port
        let port: u16 = match u16::from_str(port) {
            Ok(port) => port,
            Err(err) => {
                return Err(AddressError::IllegalPortNumber { raw: s.into(), err });
            },
        };

        // Resolve the host to one of the variants
        if host.len() >= 2 && host.starts_with('[') && host.ends_with(']') {
            if let Ok(addr) = Ipv6Addr::from_str(&host[1..host.len() - 1]) {
                return Ok(Self::Ipv6(addr, port));
            }
        }
        if let Ok(addr) = Ipv4Addr::from_str(host) {
            return Ok(Self::Ipv4(addr, port));
        }
        Ok(Self::Hostname(host.into(), port))
    }
}

impl Serialize for Address {
    #[inline]
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        /// Visitor for the Address.
        struct AddressVisitor;
        impl<'de> Visitor<'de> for AddressVisitor {
            type Value = Address;

            fn expecting(&self, f: &mut Formatter) -> FResult { write!(f, "an address:port pair") }

            #[inline]
            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Address::from_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(AddressVisitor)
    }
}

impl AsRef<Address> for Address {
    #[inline]
    fn as_ref(&self) -> &Self { self }
}
impl From<&Address> for Address {
    #[inline]
    fn from(value: &Address) -> Self { value.clone() }
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parse_ipv4() {
        let addr: Address = Address::from_str("127.0.0.1:5500").unwrap();
        assert_eq!(addr, Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1), 5500));
        assert_eq!(addr.to_string(), "127.0.0.1:5500");
    }

    #[test]
    fn address_parse_hostname() {
        let addr: Address = Address::from_str("worker1:6000").unwrap();
        assert_eq!(addr, Address::Hostname("worker1".into(), 6000));
        assert_eq!(addr.grpc_url(), "http://worker1:6000");
    }

    #[test]
    fn address_parse_ipv6() {
        let addr: Address = Address::from_str("[::1]:8080").unwrap();
        assert_eq!(addr, Address::Ipv6(Ipv6Addr::LOCALHOST, 8080));
        assert_eq!(addr.to_string(), "[::1]:8080");
    }

    #[test]
    fn address_parse_errors() {
        assert!(matches!(Address::from_str("localhost"), Err(AddressError::MissingColon { .. })));
        assert!(matches!(Address::from_str(":8080"), Err(AddressError::MissingHost { .. })));
        assert!(matches!(Address::from_str("localhost:http"), Err(AddressError::IllegalPortNumber { .. })));
    }
}
