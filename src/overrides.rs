use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use compact_str::{format_compact, CompactString};
use dashmap::DashMap;
use dhcproto::v4::{self, DhcpOption, UnknownOption};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum OverrideError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("invalid options payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("invalid option code {0}")]
    BadCode(i64),

    #[error("invalid {kind} value `{value}` for option {code}")]
    BadValue {
        kind: &'static str,
        code: u8,
        value: String,
    },

    #[error("unsupported option type `{0}`")]
    BadType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideKind {
    Network,
    Mac,
}

impl OverrideKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideKind::Network => "network",
            OverrideKind::Mac => "mac",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "network" => Some(OverrideKind::Network),
            "mac" => Some(OverrideKind::Mac),
            _ => None,
        }
    }
}

/// One overridden option as stored and exchanged over the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideOption {
    pub option_code: u8,
    pub option_value: String,
    pub option_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionOverride {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: OverrideKind,
    pub target: String,
    pub options: Vec<OverrideOption>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dhcp_option_overrides (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    type TEXT NOT NULL CHECK(type IN ('network', 'mac')),
    target TEXT NOT NULL,
    options TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(type, target)
);
CREATE INDEX IF NOT EXISTS idx_type_target ON dhcp_option_overrides(type, target);
";

/// Persistent per-network and per-MAC option overrides in a single-file
/// SQLite database, with a read-through cache in front. A store failure on
/// the packet path degrades to network defaults and is logged; writes come
/// only from the admin API and surface their errors there.
pub struct OverrideStore {
    conn: Mutex<Connection>,
    cache: DashMap<CompactString, Option<Arc<Vec<OverrideOption>>>>,
}

impl OverrideStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, OverrideError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cache: DashMap::new(),
        })
    }

    pub fn open_in_memory() -> Result<Self, OverrideError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cache: DashMap::new(),
        })
    }

    fn cache_key(kind: OverrideKind, target: &str) -> CompactString {
        format_compact!("{}|{}", kind.as_str(), target)
    }

    pub fn save(
        &self,
        kind: OverrideKind,
        target: &str,
        options: &[OverrideOption],
    ) -> Result<(), OverrideError> {
        let payload = serde_json::to_string(options)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO dhcp_option_overrides (type, target, options, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(type, target) DO UPDATE SET
                 options = excluded.options,
                 updated_at = excluded.updated_at",
            params![kind.as_str(), target, payload, now],
        )?;
        drop(conn);
        self.cache.remove(&Self::cache_key(kind, target));
        Ok(())
    }

    pub fn get(
        &self,
        kind: OverrideKind,
        target: &str,
    ) -> Result<Option<OptionOverride>, OverrideError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row(
                "SELECT id, type, target, options, created_at, updated_at
                 FROM dhcp_option_overrides WHERE type = ?1 AND target = ?2",
                params![kind.as_str(), target],
                Self::row_to_override,
            )
            .optional()?;
        row.transpose()
    }

    /// Returns true when an entry existed and was removed.
    pub fn delete(&self, kind: OverrideKind, target: &str) -> Result<bool, OverrideError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let affected = conn.execute(
            "DELETE FROM dhcp_option_overrides WHERE type = ?1 AND target = ?2",
            params![kind.as_str(), target],
        )?;
        drop(conn);
        self.cache.remove(&Self::cache_key(kind, target));
        Ok(affected > 0)
    }

    pub fn list(&self, kind: Option<OverrideKind>) -> Result<Vec<OptionOverride>, OverrideError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        match kind {
            Some(kind) => {
                let mut stmt = conn.prepare(
                    "SELECT id, type, target, options, created_at, updated_at
                     FROM dhcp_option_overrides WHERE type = ?1 ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![kind.as_str()], Self::row_to_override)?;
                for row in rows {
                    out.push(row??);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, type, target, options, created_at, updated_at
                     FROM dhcp_option_overrides ORDER BY type, created_at DESC",
                )?;
                let rows = stmt.query_map([], Self::row_to_override)?;
                for row in rows {
                    out.push(row??);
                }
            }
        }
        Ok(out)
    }

    fn row_to_override(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<Result<OptionOverride, OverrideError>> {
        let id: i64 = row.get(0)?;
        let kind: String = row.get(1)?;
        let target: String = row.get(2)?;
        let options_json: String = row.get(3)?;
        let created_at: String = row.get(4)?;
        let updated_at: String = row.get(5)?;

        Ok((|| {
            let options: Vec<OverrideOption> = serde_json::from_str(&options_json)?;
            let kind = OverrideKind::parse(&kind).unwrap_or(OverrideKind::Network);
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            Ok(OptionOverride {
                id,
                kind,
                target,
                options,
                created_at,
                updated_at,
            })
        })())
    }

    /// Read-through lookup of just the options for the packet path. Errors
    /// degrade to "no override" after logging; negative results are cached.
    pub fn options_for(&self, kind: OverrideKind, target: &str) -> Option<Arc<Vec<OverrideOption>>> {
        let key = Self::cache_key(kind, target);
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }
        let fetched = match self.get(kind, target) {
            Ok(row) => row.map(|o| Arc::new(o.options)),
            Err(err) => {
                warn!(%err, kind = kind.as_str(), target, "override store unavailable, using defaults");
                return None;
            }
        };
        self.cache.insert(key, fetched.clone());
        fetched
    }

    /// Forget everything read-through so edits made outside the admin API
    /// become visible (wired to SIGHUP).
    pub fn flush_cache(&self) {
        self.cache.clear();
    }
}

fn parse_ipv4(code: u8, value: &str) -> Result<Ipv4Addr, OverrideError> {
    value.trim().parse().map_err(|_| OverrideError::BadValue {
        kind: "ip",
        code,
        value: value.to_string(),
    })
}

/// Convert one stored override into a wire option. Codes the crate models
/// natively get typed variants; everything else rides through opaque.
pub fn to_dhcp_option(option: &OverrideOption) -> Result<DhcpOption, OverrideError> {
    let code = option.option_code;
    let value = option.option_value.as_str();
    let raw: Vec<u8> = match option.option_type.as_str() {
        "ip" => {
            let addr = parse_ipv4(code, value)?;
            match code {
                1 => return Ok(DhcpOption::SubnetMask(addr)),
                3 => return Ok(DhcpOption::Router(vec![addr])),
                6 => return Ok(DhcpOption::DomainNameServer(vec![addr])),
                _ => addr.octets().to_vec(),
            }
        }
        "ips" => {
            let mut addrs = Vec::new();
            for part in value.split(',') {
                addrs.push(parse_ipv4(code, part)?);
            }
            match code {
                3 => return Ok(DhcpOption::Router(addrs)),
                6 => return Ok(DhcpOption::DomainNameServer(addrs)),
                _ => addrs.iter().flat_map(|a| a.octets()).collect(),
            }
        }
        "string" => match code {
            15 => return Ok(DhcpOption::DomainName(value.to_string())),
            _ => value.as_bytes().to_vec(),
        },
        "uint32" => {
            let parsed: u32 = value.parse().map_err(|_| OverrideError::BadValue {
                kind: "uint32",
                code,
                value: value.to_string(),
            })?;
            match code {
                51 => return Ok(DhcpOption::AddressLeaseTime(parsed)),
                _ => parsed.to_be_bytes().to_vec(),
            }
        }
        "uint16" => {
            let parsed: u16 = value.parse().map_err(|_| OverrideError::BadValue {
                kind: "uint16",
                code,
                value: value.to_string(),
            })?;
            parsed.to_be_bytes().to_vec()
        }
        "uint8" => {
            let parsed: u8 = value.parse().map_err(|_| OverrideError::BadValue {
                kind: "uint8",
                code,
                value: value.to_string(),
            })?;
            vec![parsed]
        }
        "hex" => {
            let stripped: String = value.chars().filter(|c| !": -".contains(*c)).collect();
            if stripped.len() % 2 != 0 {
                return Err(OverrideError::BadValue {
                    kind: "hex",
                    code,
                    value: value.to_string(),
                });
            }
            let mut bytes = Vec::with_capacity(stripped.len() / 2);
            for pair in stripped.as_bytes().chunks(2) {
                let text = std::str::from_utf8(pair).unwrap_or("");
                let byte =
                    u8::from_str_radix(text, 16).map_err(|_| OverrideError::BadValue {
                        kind: "hex",
                        code,
                        value: value.to_string(),
                    })?;
                bytes.push(byte);
            }
            bytes
        }
        other => return Err(OverrideError::BadType(other.to_string())),
    };

    Ok(DhcpOption::Unknown(UnknownOption::new(
        v4::OptionCode::from(code),
        raw,
    )))
}
