use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// Convenience wrapper so bind addresses can be given as `IpAddr`,
/// `Ipv4Addr` or string literals.
pub struct IpAddress(pub(crate) IpAddr);

impl From<IpAddr> for IpAddress {
    fn from(ip: IpAddr) -> Self {
        IpAddress(ip)
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(ip: Ipv4Addr) -> Self {
        IpAddress(IpAddr::V4(ip))
    }
}

impl From<&str> for IpAddress {
    fn from(s: &str) -> Self {
        IpAddress(IpAddr::from_str(s).unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)))
    }
}
