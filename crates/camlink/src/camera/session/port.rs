//! Endpoint path handling: normalization, access-point paths and endpoint resolution.

use crate::camera::driver::PortInfo;

/// Standard PTP/IP port.
pub const DEFAULT_PTPIP_PORT: u16 = 15740;
/// Address most cameras use for their own Wi-Fi access point.
pub const DEFAULT_ACCESS_POINT_ADDRESS: &str = "192.168.1.1";

const PTPIP_PREFIX: &str = "ptpip:";

/// Normalizes a user-supplied endpoint path.
///
/// A bare address like "192.168.1.1" has no scheme, so it gets the `ptpip:` prefix.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if !trimmed.is_empty() && !trimmed.contains(':') && trimmed.contains('.') {
        format!("{PTPIP_PREFIX}{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Builds the endpoint path for a camera access point. Port 0 leaves the port to the driver.
pub fn access_point_path(address: &str, port: u16) -> String {
    let address = address.trim();
    let address = if address.is_empty() {
        DEFAULT_ACCESS_POINT_ADDRESS
    } else {
        address
    };
    if port == 0 {
        format!("{PTPIP_PREFIX}{address}")
    } else {
        format!("{PTPIP_PREFIX}{address}:{port}")
    }
}

/// Host and port of a `ptpip:` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtpIpAddress {
    pub host: String,
    pub port: u16,
}

/// Parses `ptpip:host[:port]`. The port defaults to [`DEFAULT_PTPIP_PORT`].
pub fn parse_ptpip(path: &str) -> Option<PtpIpAddress> {
    let rest = path.strip_prefix(PTPIP_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().ok()?;
            Some(PtpIpAddress {
                host: host.to_string(),
                port,
            })
        }
        None => Some(PtpIpAddress {
            host: rest.to_string(),
            port: DEFAULT_PTPIP_PORT,
        }),
    }
}

/// Picks the endpoint for `path`.
///
/// An exact path match wins. Otherwise the first network endpoint is used, carrying the
/// requested path so the driver still knows which address to dial.
pub fn resolve_port(ports: &[PortInfo], path: &str) -> Option<PortInfo> {
    if let Some(exact) = ports.iter().find(|p| p.path == path) {
        return Some(exact.clone());
    }
    let network = ports.iter().find(|p| p.kind.is_network())?;
    let mut resolved = network.clone();
    if path.starts_with(PTPIP_PREFIX) {
        resolved.path = path.to_string();
    }
    Some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::driver::PortKind;

    fn port(path: &str, kind: PortKind) -> PortInfo {
        PortInfo {
            name: path.to_string(),
            path: path.to_string(),
            kind,
        }
    }

    #[test]
    fn test_normalize_bare_ip_gets_prefix() {
        assert_eq!(normalize_path("192.168.1.1"), "ptpip:192.168.1.1");
        assert_eq!(normalize_path("  10.0.0.5 "), "ptpip:10.0.0.5");
    }

    #[test]
    fn test_normalize_keeps_schemes() {
        assert_eq!(normalize_path("ptpip:192.168.1.1:15740"), "ptpip:192.168.1.1:15740");
        assert_eq!(normalize_path("usb:001,004"), "usb:001,004");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn test_access_point_path() {
        assert_eq!(access_point_path("192.168.0.10", 15740), "ptpip:192.168.0.10:15740");
        assert_eq!(access_point_path("192.168.0.10", 0), "ptpip:192.168.0.10");
        assert_eq!(access_point_path("", DEFAULT_PTPIP_PORT), "ptpip:192.168.1.1:15740");
    }

    #[test]
    fn test_parse_ptpip() {
        assert_eq!(
            parse_ptpip("ptpip:192.168.1.1:15740"),
            Some(PtpIpAddress {
                host: "192.168.1.1".into(),
                port: 15740
            })
        );
        assert_eq!(parse_ptpip("ptpip:10.0.0.1").map(|a| a.port), Some(DEFAULT_PTPIP_PORT));
        assert_eq!(parse_ptpip("ptpip:10.0.0.1:http"), None);
        assert_eq!(parse_ptpip("usb:001,002"), None);
        assert_eq!(parse_ptpip("ptpip:"), None);
    }

    #[test]
    fn test_resolve_exact_match() {
        let ports = vec![port("ptpip:", PortKind::PtpIp), port("usb:001,004", PortKind::Usb)];
        let resolved = resolve_port(&ports, "usb:001,004").unwrap();
        assert_eq!(resolved.kind, PortKind::Usb);
    }

    #[test]
    fn test_resolve_falls_back_to_network_port_with_requested_path() {
        let ports = vec![port("usb:001,004", PortKind::Usb), port("ptpip:", PortKind::PtpIp)];
        let resolved = resolve_port(&ports, "ptpip:192.168.1.1:15740").unwrap();
        assert_eq!(resolved.kind, PortKind::PtpIp);
        assert_eq!(resolved.path, "ptpip:192.168.1.1:15740");
    }

    #[test]
    fn test_resolve_without_network_port_fails() {
        let ports = vec![port("usb:001,004", PortKind::Usb)];
        assert!(resolve_port(&ports, "ptpip:192.168.1.1").is_none());
    }
}
