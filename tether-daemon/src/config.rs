//! Daemon configuration: JSON file plus command-line overrides.

use std::io;
use std::path::Path;
use std::{fs, fmt};

use serde::{Deserialize, Serialize};
use tether::BannerConfig;

/// Identity advertised in the handshake banner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BannerIdentity {
    /// `ro.product.name` value.
    pub product: String,
    /// `ro.product.model` value.
    pub model: String,
    /// `ro.product.device` value.
    pub device: String,
    /// Capability strings advertised to peers.
    pub features: Vec<String>,
}

/// Persistent daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Listen addresses: `tcp:<port>` or `vsock:<port>`.
    pub listen: Vec<String>,
    /// Banner identity.
    pub banner: BannerIdentity,
    /// Deny privileged services (restricted operating mode).
    pub restricted: bool,
    /// Require authentication before transports go online.
    pub auth_required: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: vec!["tcp:5555".to_owned()],
            banner: BannerIdentity {
                features: vec!["shell_v2".to_owned()],
                ..BannerIdentity::default()
            },
            restricted: false,
            auth_required: false,
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from a JSON file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Renders this identity as the device-side banner configuration.
    pub fn banner_config(&self) -> BannerConfig {
        let mut banner = BannerConfig::device();
        for (key, value) in [
            ("ro.product.name", &self.banner.product),
            ("ro.product.model", &self.banner.model),
            ("ro.product.device", &self.banner.device),
        ] {
            if !value.is_empty() {
                banner.properties.push((key.to_owned(), value.clone()));
            }
        }
        banner.features.clone_from(&self.banner.features);
        banner
    }
}

/// A parsed listen address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenAddr {
    /// TCP on the given port.
    Tcp(u16),
    /// AF_VSOCK on the given port.
    Vsock(u32),
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(port) => write!(f, "tcp:{port}"),
            Self::Vsock(port) => write!(f, "vsock:{port}"),
        }
    }
}

/// Parses `tcp:<port>` / `vsock:<port>` listen specs.
pub fn parse_listen(spec: &str) -> Result<ListenAddr, String> {
    if let Some(port) = spec.strip_prefix("tcp:") {
        return port
            .parse::<u16>()
            .map(ListenAddr::Tcp)
            .map_err(|_| format!("bad tcp port in '{spec}'"));
    }
    if let Some(port) = spec.strip_prefix("vsock:") {
        return port
            .parse::<u32>()
            .map(ListenAddr::Vsock)
            .map_err(|_| format!("bad vsock port in '{spec}'"));
    }
    Err(format!("unknown listen spec '{spec}' (want tcp:<port> or vsock:<port>)"))
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn listen_spec_parsing() {
        assert_eq!(parse_listen("tcp:5555"), Ok(ListenAddr::Tcp(5555)));
        assert_eq!(parse_listen("vsock:5555"), Ok(ListenAddr::Vsock(5555)));
        assert!(parse_listen("tcp:banana").is_err());
        assert!(parse_listen("tcp:").is_err());
        assert!(parse_listen("udp:5555").is_err());
        assert!(parse_listen("5555").is_err());
    }

    #[test]
    fn config_roundtrips_through_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"listen":["tcp:7777"],"restricted":true,
                "banner":{{"product":"widget","features":["shell_v2","spin"]}}}}"#
        )
        .unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.listen, vec!["tcp:7777"]);
        assert!(config.restricted);
        assert!(!config.auth_required);

        let banner = config.banner_config().render();
        assert!(banner.starts_with("device::"));
        assert!(banner.contains("ro.product.name=widget"));
        assert!(banner.contains("features=shell_v2,spin"));
    }

    #[test]
    fn missing_config_file_errors() {
        assert!(DaemonConfig::load(Path::new("/no/such/config.json")).is_err());
    }
}
