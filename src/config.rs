use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use advmac::MacAddr6;
use ini::Ini;
use tracing::warn;

use crate::pool::Algorithm;

const DEFAULT_ADMIN_LISTEN: &str = "127.0.0.1:22227";
const DEFAULT_DB_PATH: &str = "oxidhcp.db";
const DEFAULT_EVICT_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_CONFLICT_DELAY: Duration = Duration::from_secs(600);

/// Server wide configuration
pub struct Config {
    pub listen: Vec<String>,
    pub relays: Vec<RelayConf>,
    pub networks: Vec<NetworkConf>,
    pub admin_listen: SocketAddr,
    pub db_path: PathBuf,
    pub log_level: tracing::Level,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RelayConf {
    pub iface: String,
    pub upstream: Ipv4Addr,
}

/// One `[network <addr>]` section.
#[derive(Debug, Clone)]
pub struct NetworkConf {
    pub network: Ipv4Addr,
    pub enabled: bool,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Vec<Ipv4Addr>,
    pub dns: Vec<Ipv4Addr>,
    pub domain_name: Option<String>,
    pub default_lease: Duration,
    pub max_lease: Duration,
    pub reserved: Vec<Ipv4Addr>,
    pub assigned: Vec<(MacAddr6, Ipv4Addr)>,
    pub next_hop: Option<Ipv4Addr>,
    pub algorithm: Algorithm,
    pub evict_delay: Duration,
    pub conflict_delay: Duration,
    pub probe: bool,
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        err: std::io::Error,
        path: PathBuf,
    },
    Parsing {
        err: ini::ParseError,
        path: PathBuf,
    },
    MissingSection(&'static str),
    MissingKey {
        section: String,
        key: &'static str,
    },
    InvalidValue {
        section: String,
        key: &'static str,
        value: String,
    },
    NoNetworks,
    LogLevel(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { err, path } => write!(f, "`{}`: {err}", path.to_string_lossy()),
            ConfigError::Parsing { err, path } => {
                write!(f, "Parsing `{}`: {err}", path.to_string_lossy())
            }
            ConfigError::MissingSection(section) => write!(f, "Missing `[{section}]` section"),
            ConfigError::MissingKey { section, key } => {
                write!(f, "Missing key `{key}` in section `[{section}]`")
            }
            ConfigError::InvalidValue {
                section,
                key,
                value,
            } => write!(f, "Bad value `{value}` for `{key}` in section `[{section}]`"),
            ConfigError::NoNetworks => write!(f, "No usable network sections were configured"),
            ConfigError::LogLevel(value) => write!(
                f,
                r#"Unexpected log level {value}. Expected one of [trace, debug, info, warn, error]"#
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

fn required<'a>(
    section: &'a ini::Properties,
    section_name: &str,
    key: &'static str,
) -> Result<&'a str, ConfigError> {
    match section.get(key) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim()),
        _ => Err(ConfigError::MissingKey {
            section: section_name.to_string(),
            key,
        }),
    }
}

fn parse_ip(section_name: &str, key: &'static str, value: &str) -> Result<Ipv4Addr, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        section: section_name.to_string(),
        key,
        value: value.to_string(),
    })
}

fn parse_ip_list(
    section_name: &str,
    key: &'static str,
    value: &str,
) -> Result<Vec<Ipv4Addr>, ConfigError> {
    value
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| parse_ip(section_name, key, part))
        .collect()
}

fn parse_seconds(
    section_name: &str,
    key: &'static str,
    value: &str,
) -> Result<Duration, ConfigError> {
    let seconds: u64 = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        section: section_name.to_string(),
        key,
        value: value.to_string(),
    })?;
    Ok(Duration::from_secs(seconds))
}

/// Expand `ip_reserved`: a comma list of single addresses or `a-b` ranges.
pub fn ips_from_ranges(section_name: &str, value: &str) -> Result<Vec<Ipv4Addr>, ConfigError> {
    let mut out = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            None => out.push(parse_ip(section_name, "ip_reserved", part)?),
            Some((low, high)) => {
                let low = u32::from(parse_ip(section_name, "ip_reserved", low)?);
                let high = u32::from(parse_ip(section_name, "ip_reserved", high)?);
                if high < low {
                    return Err(ConfigError::InvalidValue {
                        section: section_name.to_string(),
                        key: "ip_reserved",
                        value: part.to_string(),
                    });
                }
                for addr in low..=high {
                    out.push(Ipv4Addr::from(addr));
                }
            }
        }
    }
    Ok(out)
}

/// Parse `ip_assigned`: comma list of `aa:bb:cc:dd:ee:ff:ip` bindings. The
/// MAC's own colons mean the address is whatever follows the sixth one.
pub fn parse_assigned(
    section_name: &str,
    value: &str,
) -> Result<Vec<(MacAddr6, Ipv4Addr)>, ConfigError> {
    let mut out = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let invalid = || ConfigError::InvalidValue {
            section: section_name.to_string(),
            key: "ip_assigned",
            value: part.to_string(),
        };
        let (mac_text, ip_text) = part.rsplit_once(':').ok_or_else(invalid)?;
        let mac = MacAddr6::parse_str(mac_text).map_err(|_| invalid())?;
        let ip = ip_text.parse().map_err(|_| invalid())?;
        out.push((mac, ip));
    }
    Ok(out)
}

impl Config {
    /// Load the INI configuration. Broken network sections are logged and
    /// skipped; a file with nothing left to serve is fatal.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let ini = Ini::load_from_file(&path).map_err(|err| match err {
            ini::Error::Io(err) => ConfigError::Io {
                err,
                path: path.clone(),
            },
            ini::Error::Parse(err) => ConfigError::Parsing {
                err,
                path: path.clone(),
            },
        })?;

        let interfaces = ini
            .section(Some("interfaces"))
            .ok_or(ConfigError::MissingSection("interfaces"))?;

        let listen: Vec<String> = interfaces
            .get("listen")
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        let mut relays = Vec::new();
        for entry in interfaces
            .get("relay")
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
        {
            let (iface, upstream) = entry
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidValue {
                    section: "interfaces".to_string(),
                    key: "relay",
                    value: entry.to_string(),
                })?;
            relays.push(RelayConf {
                iface: iface.trim().to_string(),
                upstream: parse_ip("interfaces", "relay", upstream)?,
            });
        }

        if listen.is_empty() && relays.is_empty() {
            return Err(ConfigError::MissingKey {
                section: "interfaces".to_string(),
                key: "listen",
            });
        }

        let admin_listen = match interfaces.get("admin_listen") {
            Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                section: "interfaces".to_string(),
                key: "admin_listen",
                value: value.to_string(),
            })?,
            None => DEFAULT_ADMIN_LISTEN.parse().expect("default admin address"),
        };

        let db_path = interfaces
            .get("db_path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        let log_level = match interfaces.get("log_level") {
            Some(value) if !value.trim().is_empty() => tracing::Level::from_str(value.trim())
                .map_err(|_| ConfigError::LogLevel(value.to_string()))?,
            _ => tracing::Level::INFO,
        };

        let mut networks = Vec::new();
        for (name, section) in ini.iter() {
            let name = match name {
                Some(name) if name.starts_with("network ") => name,
                _ => continue,
            };
            match parse_network(name, section) {
                Ok(Some(network)) => networks.push(network),
                Ok(None) => {}
                Err(err) => {
                    warn!(%err, section = name, "skipping misconfigured network section");
                }
            }
        }

        if networks.is_empty() && relays.is_empty() {
            return Err(ConfigError::NoNetworks);
        }

        Ok(Config {
            listen,
            relays,
            networks,
            admin_listen,
            db_path,
            log_level,
            path,
        })
    }
}

fn parse_network(
    name: &str,
    section: &ini::Properties,
) -> Result<Option<NetworkConf>, ConfigError> {
    if section.get("dhcpd").unwrap_or("enabled").trim() == "disabled" {
        return Ok(None);
    }
    let addr_text = name.trim_start_matches("network ").trim();
    let network = parse_ip(name, "dhcpd", addr_text)?;

    let start = parse_ip(name, "dhcp_start", required(section, name, "dhcp_start")?)?;
    let end = parse_ip(name, "dhcp_end", required(section, name, "dhcp_end")?)?;
    if u32::from(start) > u32::from(end) {
        return Err(ConfigError::InvalidValue {
            section: name.to_string(),
            key: "dhcp_start",
            value: format!("{start}-{end}"),
        });
    }

    let netmask = parse_ip(name, "netmask", required(section, name, "netmask")?)?;
    let gateway = parse_ip_list(name, "gateway", section.get("gateway").unwrap_or(""))?;
    let dns = parse_ip_list(name, "dns", section.get("dns").unwrap_or(""))?;
    let domain_name = section
        .get("domain-name")
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let default_lease = parse_seconds(
        name,
        "dhcp_default_lease_time",
        section.get("dhcp_default_lease_time").unwrap_or("3600"),
    )?;
    let max_lease = parse_seconds(
        name,
        "dhcp_max_lease_time",
        section.get("dhcp_max_lease_time").unwrap_or("86400"),
    )?;

    let reserved = ips_from_ranges(name, section.get("ip_reserved").unwrap_or(""))?;
    let assigned = parse_assigned(name, section.get("ip_assigned").unwrap_or(""))?;

    let next_hop = match section.get("next_hop").map(str::trim) {
        Some(value) if !value.is_empty() => Some(parse_ip(name, "next_hop", value)?),
        _ => None,
    };

    let algorithm = match section.get("algorithm").map(str::trim) {
        Some(value) => Algorithm::parse(value).ok_or_else(|| ConfigError::InvalidValue {
            section: name.to_string(),
            key: "algorithm",
            value: value.to_string(),
        })?,
        None => Algorithm::default(),
    };

    let evict_delay = match section.get("evict_delay") {
        Some(value) => parse_seconds(name, "evict_delay", value)?,
        None => DEFAULT_EVICT_DELAY,
    };
    let conflict_delay = match section.get("conflict_delay") {
        Some(value) => parse_seconds(name, "conflict_delay", value)?,
        None => DEFAULT_CONFLICT_DELAY,
    };
    let probe = section.get("probe").map(str::trim) != Some("disabled");

    Ok(Some(NetworkConf {
        network,
        enabled: true,
        start,
        end,
        netmask,
        gateway,
        dns,
        domain_name,
        default_lease,
        max_lease,
        reserved,
        assigned,
        next_hop,
        algorithm,
        evict_delay,
        conflict_delay,
        probe,
    }))
}
