use std::net::Ipv4Addr;
use std::process::{Command, Stdio};
use std::time::Duration;

use advmac::MacAddr6;
use tracing::{debug, warn};

use crate::pool::FREE_MAC;

/// Liveness check for a candidate address before it is offered. `true`
/// means some other host already answers for the address and it must not
/// be handed out.
pub trait LivenessProbe: Send + Sync {
    fn in_use(&self, ip: Ipv4Addr, client: MacAddr6, iface: &str, layer2: bool) -> bool;
}

/// Probe that never finds a conflict, for tests and for networks with
/// probing disabled.
pub struct NoProbe;

impl LivenessProbe for NoProbe {
    fn in_use(&self, _ip: Ipv4Addr, _client: MacAddr6, _iface: &str, _layer2: bool) -> bool {
        false
    }
}

/// Kernel-backed probe: the neighbor table for L2 scopes, then one ICMP
/// echo with a bounded deadline.
pub struct SystemProbe {
    timeout: Duration,
}

impl SystemProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn arp_lookup(&self, ip: Ipv4Addr, iface: &str) -> Option<MacAddr6> {
        let table = std::fs::read_to_string("/proc/net/arp").ok()?;
        let needle = ip.to_string();
        for line in table.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // IP, HW type, Flags, HW address, Mask, Device
            if fields.len() < 6 || fields[0] != needle {
                continue;
            }
            if fields[2] == "0x0" || fields[5] != iface {
                continue;
            }
            if let Ok(mac) = MacAddr6::parse_str(fields[3]) {
                if mac != FREE_MAC {
                    return Some(mac);
                }
            }
        }
        None
    }

    fn ping(&self, ip: Ipv4Addr) -> bool {
        let seconds = self.timeout.as_secs().clamp(1, 30).to_string();
        match Command::new("ping")
            .args(["-c", "1", "-W", &seconds, &ip.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(err) => {
                warn!(%err, %ip, "ping unavailable, treating address as free");
                false
            }
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl LivenessProbe for SystemProbe {
    fn in_use(&self, ip: Ipv4Addr, client: MacAddr6, iface: &str, layer2: bool) -> bool {
        if layer2 {
            if let Some(owner) = self.arp_lookup(ip, iface) {
                if owner != client {
                    debug!(%ip, %owner, "address present in neighbor table");
                    return true;
                }
            }
        }
        self.ping(ip)
    }
}
