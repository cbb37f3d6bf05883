//! Handshake banner rendering and parsing.
//!
//! A banner is the `CNXN` payload:
//! `<systemtype>::<key>=<value>;...;features=<a>,<b>`: the remote's
//! role, product identity, and capability list in one string. Parsing
//! never fails: missing or malformed fields are simply left empty so a
//! terse peer still comes online.

use crate::transport::ConnectionState;

/// Banner property key for the product name.
pub const PROP_PRODUCT: &str = "ro.product.name";
/// Banner property key for the model.
pub const PROP_MODEL: &str = "ro.product.model";
/// Banner property key for the device name.
pub const PROP_DEVICE: &str = "ro.product.device";
/// Banner property key carrying the comma-separated feature list.
pub const PROP_FEATURES: &str = "features";

/// The identity this process advertises in its own `CNXN` banner.
#[derive(Debug, Clone)]
pub struct BannerConfig {
    /// Role word: `host`, `device`, `recovery`, ...
    pub system_type: String,
    /// Identity properties, rendered as `key=value;` pairs.
    pub properties: Vec<(String, String)>,
    /// Capability strings advertised to the peer.
    pub features: Vec<String>,
}

impl BannerConfig {
    /// A bare host-side banner.
    pub fn host() -> Self {
        Self {
            system_type: "host".to_owned(),
            properties: Vec::new(),
            features: Vec::new(),
        }
    }

    /// A bare device-side banner.
    pub fn device() -> Self {
        Self {
            system_type: "device".to_owned(),
            properties: Vec::new(),
            features: Vec::new(),
        }
    }

    /// True when this process plays the host role in the handshake.
    pub fn is_host(&self) -> bool {
        self.system_type == "host"
    }

    /// Renders the on-wire banner string.
    pub fn render(&self) -> String {
        let mut parts: Vec<String> = self
            .properties
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if !self.features.is_empty() {
            parts.push(format!("{PROP_FEATURES}={}", self.features.join(",")));
        }
        format!("{}::{}", self.system_type, parts.join(";"))
    }
}

/// Fields extracted from a peer's banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedBanner {
    pub state: ConnectionState,
    pub product: String,
    pub model: String,
    pub device: String,
    pub features: Vec<String>,
}

/// Parses a banner. Unknown system types map to [`ConnectionState::Host`];
/// repeated keys are last-write-wins; unknown keys are ignored.
pub(crate) fn parse(banner: &str) -> ParsedBanner {
    let mut pieces = banner.splitn(3, ':');
    let system_type = pieces.next().unwrap_or_default();
    let _leftover = pieces.next();
    let props = pieces.next().unwrap_or_default();

    let mut parsed = ParsedBanner {
        state: state_for(system_type),
        product: String::new(),
        model: String::new(),
        device: String::new(),
        features: Vec::new(),
    };

    for prop in props.split(';') {
        let Some((key, value)) = prop.split_once('=') else {
            continue;
        };
        match key {
            PROP_PRODUCT => parsed.product = value.to_owned(),
            PROP_MODEL => parsed.model = value.to_owned(),
            PROP_DEVICE => parsed.device = value.to_owned(),
            PROP_FEATURES => {
                parsed.features = value
                    .split(',')
                    .filter(|f| !f.is_empty())
                    .map(str::to_owned)
                    .collect();
            }
            _ => {}
        }
    }
    parsed
}

fn state_for(system_type: &str) -> ConnectionState {
    match system_type {
        "bootloader" => ConnectionState::Bootloader,
        "device" => ConnectionState::Device,
        "recovery" => ConnectionState::Recovery,
        "sideload" => ConnectionState::Sideload,
        "rescue" => ConnectionState::Rescue,
        // Hosts send "host"; anything unrecognized is treated the same
        // way rather than refusing the connection.
        _ => ConnectionState::Host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_roundtrips_through_parse() {
        let config = BannerConfig {
            system_type: "device".to_owned(),
            properties: vec![
                (PROP_PRODUCT.to_owned(), "foo".to_owned()),
                (PROP_MODEL.to_owned(), "bar".to_owned()),
            ],
            features: vec!["woodly".to_owned(), "doodly".to_owned()],
        };

        let parsed = parse(&config.render());
        assert_eq!(parsed.state, ConnectionState::Device);
        assert_eq!(parsed.product, "foo");
        assert_eq!(parsed.model, "bar");
        assert_eq!(parsed.features, vec!["woodly", "doodly"]);
    }

    #[test]
    fn bare_banner_parses_empty() {
        let parsed = parse("host::");
        assert_eq!(parsed.state, ConnectionState::Host);
        assert_eq!(parsed.product, "");
        assert!(parsed.features.is_empty());
    }

    #[test]
    fn unknown_system_type_is_host() {
        assert_eq!(parse("flurble::").state, ConnectionState::Host);
    }

    #[test]
    fn repeated_keys_last_write_wins() {
        let parsed = parse("device::ro.product.name=a;ro.product.name=b");
        assert_eq!(parsed.product, "b");
    }

    #[test]
    fn malformed_props_are_skipped() {
        let parsed = parse("device::notakeyvalue;ro.product.model=m;;=x");
        assert_eq!(parsed.model, "m");
        assert_eq!(parsed.product, "");
    }
}
