//! Virtual interface parameters

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::{DEFAULT_NETMASK, MTU};

/// Parameter set a tun device is opened with
///
/// DNS servers are carried through to the caller unchanged; the bridge
/// does not apply any resolution policy of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunParams {
    /// Interface name (ignored on macOS, where a `utun` name is assigned)
    pub name: String,
    /// Address assigned to the interface
    pub address: Ipv4Addr,
    /// Gateway (point-to-point destination) of the interface
    pub gateway: Ipv4Addr,
    /// Network mask
    pub netmask: Ipv4Addr,
    /// DNS servers handed to the host
    pub dns_servers: Vec<Ipv4Addr>,
    /// Maximum transmission unit
    pub mtu: u16,
}

impl TunParams {
    /// Create a new parameter builder
    pub fn builder() -> TunParamsBuilder {
        TunParamsBuilder::new()
    }

    /// Build parameters from the textual arguments of the host entry point
    ///
    /// `dns` is a comma separated list; blank entries are skipped. The
    /// netmask is `255.255.255.0` and the MTU 1500.
    pub fn from_strings(name: &str, address: &str, gateway: &str, dns: &str) -> Result<Self> {
        let mut builder = TunParams::builder()
            .name(name)
            .address_str(address)?
            .gateway_str(gateway)?;

        for server in split_dns(dns) {
            builder = builder.dns_str(server)?;
        }

        builder.build()
    }

    /// Prefix length of the netmask
    pub fn prefix_len(&self) -> Result<u8> {
        netmask_to_prefix(self.netmask)
    }

    /// Validate the parameter set
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("interface name must not be empty".into()));
        }

        if self.address.is_unspecified() {
            return Err(Error::InvalidAddress(format!(
                "interface address {} is unspecified",
                self.address
            )));
        }

        if self.address == self.gateway {
            return Err(Error::InvalidAddress(format!(
                "interface address and gateway are both {}",
                self.address
            )));
        }

        self.prefix_len()?;

        crate::check_mtu(self.mtu)
    }
}

impl fmt::Display for TunParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dns = self
            .dns_servers
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(
            f,
            "name={} addr={} gw={} mask={} dns=[{}] mtu={}",
            self.name, self.address, self.gateway, self.netmask, dns, self.mtu
        )
    }
}

/// Split a comma separated DNS list, dropping blank entries
pub fn split_dns(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Convert a netmask to its prefix length, rejecting non-contiguous masks
pub fn netmask_to_prefix(mask: Ipv4Addr) -> Result<u8> {
    let bits = u32::from(mask);
    let prefix = bits.leading_ones();
    if bits.checked_shl(prefix).unwrap_or(0) != 0 {
        return Err(Error::InvalidNetmask(mask.to_string()));
    }
    Ok(prefix as u8)
}

fn parse_ipv4(field: &str, value: &str) -> Result<Ipv4Addr> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidAddress(format!("{}: {:?}", field, value)))
}

/// Builder for [`TunParams`]
#[derive(Debug)]
pub struct TunParamsBuilder {
    params: TunParams,
}

impl Default for TunParamsBuilder {
    fn default() -> Self {
        Self {
            params: TunParams {
                name: String::new(),
                address: Ipv4Addr::UNSPECIFIED,
                gateway: Ipv4Addr::UNSPECIFIED,
                netmask: DEFAULT_NETMASK,
                dns_servers: Vec::new(),
                mtu: MTU as u16,
            },
        }
    }
}

impl TunParamsBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interface name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.params.name = name.into();
        self
    }

    /// Set the interface address
    pub fn address(mut self, address: Ipv4Addr) -> Self {
        self.params.address = address;
        self
    }

    /// Set the interface address from a string
    pub fn address_str(self, address: &str) -> Result<Self> {
        let addr = parse_ipv4("address", address)?;
        Ok(self.address(addr))
    }

    /// Set the gateway
    pub fn gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.params.gateway = gateway;
        self
    }

    /// Set the gateway from a string
    pub fn gateway_str(self, gateway: &str) -> Result<Self> {
        let gw = parse_ipv4("gateway", gateway)?;
        Ok(self.gateway(gw))
    }

    /// Set the netmask
    pub fn netmask(mut self, netmask: Ipv4Addr) -> Self {
        self.params.netmask = netmask;
        self
    }

    /// Add a DNS server
    pub fn dns(mut self, server: Ipv4Addr) -> Self {
        self.params.dns_servers.push(server);
        self
    }

    /// Add a DNS server from a string
    pub fn dns_str(self, server: &str) -> Result<Self> {
        let ip = parse_ipv4("dns", server)?;
        Ok(self.dns(ip))
    }

    /// Set the MTU
    pub fn mtu(mut self, mtu: u16) -> Self {
        self.params.mtu = mtu;
        self
    }

    /// Build and validate the parameters
    pub fn build(self) -> Result<TunParams> {
        self.params.validate()?;
        Ok(self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netmask_to_prefix() {
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 255, 0)).unwrap(), 24);
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 0, 0)).unwrap(), 16);
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 255, 255)).unwrap(), 32);
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(0, 0, 0, 0)).unwrap(), 0);
    }

    #[test]
    fn test_netmask_rejects_holes() {
        let err = netmask_to_prefix(Ipv4Addr::new(255, 0, 255, 0)).unwrap_err();
        assert!(matches!(err, Error::InvalidNetmask(_)));
    }

    #[test]
    fn test_from_strings() {
        let params =
            TunParams::from_strings("tun1", "240.0.0.2", "240.0.0.1", "8.8.8.8, 1.1.1.1,").unwrap();

        assert_eq!(params.name, "tun1");
        assert_eq!(params.address, Ipv4Addr::new(240, 0, 0, 2));
        assert_eq!(params.gateway, Ipv4Addr::new(240, 0, 0, 1));
        assert_eq!(params.netmask, DEFAULT_NETMASK);
        assert_eq!(
            params.dns_servers,
            vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)]
        );
        assert_eq!(params.mtu, 1500);
        assert_eq!(params.prefix_len().unwrap(), 24);
    }

    #[test]
    fn test_from_strings_empty_dns() {
        let params = TunParams::from_strings("tun1", "10.0.0.2", "10.0.0.1", "").unwrap();
        assert!(params.dns_servers.is_empty());
    }

    #[test]
    fn test_invalid_address_names_field() {
        let err = TunParams::from_strings("tun1", "10.0.0.300", "10.0.0.1", "").unwrap_err();
        match err {
            Error::InvalidAddress(msg) => assert!(msg.starts_with("address")),
            other => panic!("unexpected error: {other}"),
        }

        let err = TunParams::from_strings("tun1", "10.0.0.2", "gw", "").unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(ref msg) if msg.starts_with("gateway")));
    }

    #[test]
    fn test_validation_empty_name() {
        let result = TunParams::builder()
            .address(Ipv4Addr::new(10, 0, 0, 2))
            .gateway(Ipv4Addr::new(10, 0, 0, 1))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_invalid_mtu() {
        let result = TunParams::builder()
            .name("tun1")
            .address(Ipv4Addr::new(10, 0, 0, 2))
            .gateway(Ipv4Addr::new(10, 0, 0, 1))
            .mtu(10)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_mtu_bounds() {
        let with_mtu = |mtu| {
            TunParams::builder()
                .name("tun1")
                .address(Ipv4Addr::new(10, 0, 0, 2))
                .gateway(Ipv4Addr::new(10, 0, 0, 1))
                .mtu(mtu)
                .build()
        };
        assert!(with_mtu(crate::MIN_MTU).is_ok());
        assert!(with_mtu(crate::MTU as u16).is_ok());
        assert!(matches!(with_mtu(crate::MIN_MTU - 1), Err(Error::Config(_))));
        assert!(matches!(with_mtu(9000), Err(Error::Config(_))));
    }

    #[test]
    fn test_display_lists_parameters() {
        let params = TunParams::from_strings("tun1", "10.0.0.2", "10.0.0.1", "8.8.8.8").unwrap();
        assert_eq!(
            params.to_string(),
            "name=tun1 addr=10.0.0.2 gw=10.0.0.1 mask=255.255.255.0 dns=[8.8.8.8] mtu=1500"
        );
    }
}
