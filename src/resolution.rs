use std::{
    collections::HashSet,
    io,
    net::{IpAddr, SocketAddr},
};

use log::debug;
use trust_dns_resolver::Resolver;

use crate::DEFAULT_PORT;

/// Splits `host[:port]`, falling back to the default port. Bracketed IPv6
/// literals (`[::1]:25565`) are accepted.
pub fn parse_address(input: &str) -> io::Result<(String, u16)> {
    let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidInput, msg);
    let input = input.trim();

    if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid(format!("unterminated IPv6 literal in {:?}", input)))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port).map_err(invalid)?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => return Err(invalid(format!("unexpected {:?} after address", tail))),
        };
        return Ok((host.to_string(), port));
    }

    match input.rsplit_once(':') {
        // a bare IPv6 address has several colons and no port
        Some((host, _)) if host.contains(':') => Ok((input.to_string(), DEFAULT_PORT)),
        Some((host, port)) => Ok((host.to_string(), parse_port(port).map_err(invalid)?)),
        None if input.is_empty() => Err(invalid("empty address".to_string())),
        None => Ok((input.to_string(), DEFAULT_PORT)),
    }
}

fn parse_port(port: &str) -> Result<u16, String> {
    port.parse::<u16>()
        .map_err(|_| format!("invalid port {:?}", port))
}

/// Resolves a server address the way the game client does: the
/// `_minecraft._tcp` SRV record wins, plain A/AAAA records otherwise.
pub fn resolve_minecraft_ips(provided_address: (String, u16)) -> io::Result<HashSet<SocketAddr>> {
    if let Some(literal) = ip_literal(&provided_address.0, provided_address.1) {
        return Ok(literal);
    }
    let resolver = Resolver::from_system_conf()?;

    let mut resolved_addresses: HashSet<SocketAddr> = HashSet::default();

    if let Ok(srv) = resolver.srv_lookup(format!("_minecraft._tcp.{}", provided_address.0)) {
        for v in srv.iter() {
            debug!("SRV record points {} at {}:{}", provided_address.0, v.target(), v.port());
            let target = resolver.lookup_ip(v.target().to_ascii().as_str())?;

            for address in target.iter() {
                resolved_addresses.insert(SocketAddr::new(address, v.port()));
            }
        }
    }

    if resolved_addresses.is_empty() {
        resolved_addresses = lookup_host(&resolver, &provided_address.0, provided_address.1)?;
    }

    Ok(resolved_addresses)
}

/// Plain A/AAAA resolution without looking at SRV records.
pub fn resolve_host_ips(host: &str, port: u16) -> io::Result<HashSet<SocketAddr>> {
    if let Some(literal) = ip_literal(host, port) {
        return Ok(literal);
    }
    lookup_host(&Resolver::from_system_conf()?, host, port)
}

fn lookup_host(resolver: &Resolver, host: &str, port: u16) -> io::Result<HashSet<SocketAddr>> {
    let target = resolver.lookup_ip(host)?;
    Ok(target
        .iter()
        .map(|address| SocketAddr::new(address, port))
        .collect())
}

/// Address literals need no resolver, and so no system resolver config.
fn ip_literal(host: &str, port: u16) -> Option<HashSet<SocketAddr>> {
    host.parse::<IpAddr>()
        .ok()
        .map(|ip| HashSet::from([SocketAddr::new(ip, port)]))
}
