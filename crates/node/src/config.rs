//! Node configuration: CLI argument validation and the optional JSON config
//! file that replaces positional arguments.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

const DEVICE_PATTERN: &str = r"^(cuda(:\d+)?|mps|[ctx]pu)$";
const HOSTNAME_PATTERN: &str =
    r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$";
const IPV4_PATTERN: &str =
    r"^(((2[0-5]{0,2}|1[0-9]{0,2}|[1-9][0-9]?|0)\.){3}(2[0-5]{0,2}|1[0-9]{0,2}|[1-9][0-9]?)|localhost)$";

/// Compute device the node pins its perturbation work to, e.g. `cuda:1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Device(String);

impl Device {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pattern = Regex::new(DEVICE_PATTERN).expect("device pattern must compile");
        if pattern.is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(format!("{s:?} is not a valid device"))
        }
    }
}

impl TryFrom<String> for Device {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.0
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validates `host[:port]` where host is an IPv4 address, `localhost`, or a
/// hostname. Used as a clap value parser.
pub fn parse_host(s: &str) -> Result<String, String> {
    let host = match s.rsplit_once(':') {
        Some((host, port)) => {
            port.parse::<u16>()
                .map_err(|_| format!("{s:?} has an invalid port"))?;
            host
        }
        None => s,
    };

    let hostname = Regex::new(HOSTNAME_PATTERN).expect("hostname pattern must compile");
    let ipv4 = Regex::new(IPV4_PATTERN).expect("ipv4 pattern must compile");
    if ipv4.is_match(host) || hostname.is_match(host) {
        Ok(s.to_string())
    } else {
        Err(format!("{s:?} is not a valid IP address or domain name"))
    }
}

/// Config file alternative to positional arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub device: Device,
}

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&raw)?;
        parse_host(&config.host).map_err(|err| anyhow::anyhow!("{err}"))?;
        Ok(config)
    }
}
