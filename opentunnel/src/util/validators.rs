// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::SocketAddr;

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(AnyErr::from)
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

pub fn parse_port(v: &str) -> Result<u16> {
  v.parse::<u16>()
    .map_err(|_| AnyErr::msg("Port must be an integer between 0 and 65535"))
}

/// Accepts `host:port`, or a bare host which is paired with `default_port`
pub fn parse_endpoint(v: &str, default_port: u16) -> Result<String> {
  let v = v
    .trim_start_matches("tcp://")
    .trim_start_matches("wss://")
    .trim_start_matches("ws://")
    .trim_end_matches('/');
  if v.is_empty() {
    return Err(AnyErr::msg("Endpoint must not be empty"));
  }
  match v.rsplit_once(':') {
    Some((host, port)) if !host.is_empty() && !host.ends_with(':') => {
      parse_port(port)?;
      Ok(v.to_string())
    }
    _ => Ok(format!("{}:{}", v, default_port)),
  }
}

/// Hostnames routed by SNI: ASCII labels separated by dots, no trailing dot
pub fn parse_hostname(v: &str) -> Result<String> {
  let host = v.to_ascii_lowercase();
  let well_formed = !host.is_empty()
    && host.len() <= 253
    && host.split('.').all(|label| {
      !label.is_empty()
        && label.len() <= 63
        && label
          .bytes()
          .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    });
  if well_formed {
    Ok(host)
  } else {
    Err(AnyErr::msg(format!("{:?} is not a valid hostname", v)))
  }
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_port(v: &str) -> Result<(), String> {
  parse_port(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_endpoint(v: &str) -> Result<(), String> {
  parse_endpoint(v, 0).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_hostname(v: &str) -> Result<(), String> {
  parse_hostname(v).map(|_| ()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
  use super::{parse_endpoint, parse_hostname, parse_port};

  #[test]
  fn endpoints_receive_default_ports() {
    assert_eq!(parse_endpoint("relay.example.com", 9001).unwrap(), "relay.example.com:9001");
    assert_eq!(parse_endpoint("tcp://127.0.0.1:4000/", 9001).unwrap(), "127.0.0.1:4000");
    assert!(parse_endpoint("relay:notaport", 9001).is_err());
    assert!(parse_endpoint("", 9001).is_err());
  }

  #[test]
  fn hostnames_are_lowercased_and_checked() {
    assert_eq!(parse_hostname("A.Example.COM").unwrap(), "a.example.com");
    assert!(parse_hostname("trailing.dot.").is_err());
    assert!(parse_hostname("bad host").is_err());
    assert!(parse_port("70000").is_err());
  }
}
