use std::ffi::CString;
use std::io;
use std::net::Ipv4Addr;

use advmac::MacAddr6;
use thiserror::Error;
use tracing::trace;

const ETH_P_IP: u16 = 0x0800;
const DHCP_SERVER_PORT: u16 = 67;
const DHCP_CLIENT_PORT: u16 = 68;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("interface {0} not found")]
    InterfaceNotFound(String),

    #[error("no MAC address for interface {0}")]
    NoHardwareAddress(String),

    #[error("raw send on {iface} failed: {source}")]
    Send {
        iface: String,
        #[source]
        source: io::Error,
    },

    #[error("raw socket: {0}")]
    Socket(#[from] io::Error),
}

/// Frame-level reply path for clients that do not yet have an address and
/// cannot be reached by unicast UDP.
pub trait L2Sender: Send + Sync {
    fn send_l2(
        &self,
        iface: &str,
        dst_mac: MacAddr6,
        payload: &[u8],
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
    ) -> Result<(), LinkError>;
}

/// Discards every frame; used by tests.
pub struct NoopLink;

impl L2Sender for NoopLink {
    fn send_l2(
        &self,
        _iface: &str,
        _dst_mac: MacAddr6,
        _payload: &[u8],
        _src_ip: Ipv4Addr,
        _dst_ip: Ipv4Addr,
    ) -> Result<(), LinkError> {
        Ok(())
    }
}

/// AF_PACKET sender building the Ethernet/IPv4/UDP framing itself.
pub struct RawClient;

impl RawClient {
    fn open() -> Result<OwnedFd, LinkError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                i32::from(ETH_P_IP.to_be()),
            )
        };
        if fd < 0 {
            return Err(LinkError::Socket(io::Error::last_os_error()));
        }
        Ok(OwnedFd(fd))
    }
}

struct OwnedFd(libc::c_int);

impl Drop for OwnedFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

pub fn interface_index(name: &str) -> Result<u32, LinkError> {
    let c_name =
        CString::new(name).map_err(|_| LinkError::InterfaceNotFound(name.to_string()))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(LinkError::InterfaceNotFound(name.to_string()));
    }
    Ok(index)
}

pub fn interface_mac(name: &str) -> Result<MacAddr6, LinkError> {
    let path = format!("/sys/class/net/{name}/address");
    let text =
        std::fs::read_to_string(path).map_err(|_| LinkError::NoHardwareAddress(name.to_string()))?;
    MacAddr6::parse_str(text.trim()).map_err(|_| LinkError::NoHardwareAddress(name.to_string()))
}

/// First IPv4 address assigned to the named interface.
pub fn interface_ipv4(name: &str) -> Result<Ipv4Addr, LinkError> {
    unsafe {
        let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut addrs) != 0 {
            return Err(LinkError::Socket(io::Error::last_os_error()));
        }
        let mut cursor = addrs;
        let mut found = None;
        while !cursor.is_null() {
            let entry = &*cursor;
            cursor = entry.ifa_next;

            if entry.ifa_name.is_null() || entry.ifa_addr.is_null() {
                continue;
            }
            let ifa_name = std::ffi::CStr::from_ptr(entry.ifa_name);
            if ifa_name.to_string_lossy() != name {
                continue;
            }
            if (*entry.ifa_addr).sa_family != libc::AF_INET as libc::sa_family_t {
                continue;
            }
            let sockaddr = &*(entry.ifa_addr as *const libc::sockaddr_in);
            found = Some(Ipv4Addr::from(u32::from_be(sockaddr.sin_addr.s_addr)));
            break;
        }
        libc::freeifaddrs(addrs);
        found.ok_or_else(|| LinkError::InterfaceNotFound(name.to_string()))
    }
}

fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn build_frame(
    src_mac: MacAddr6,
    dst_mac: MacAddr6,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + 20 + 8 + payload.len());

    frame.extend_from_slice(&dst_mac.to_array());
    frame.extend_from_slice(&src_mac.to_array());
    frame.extend_from_slice(&ETH_P_IP.to_be_bytes());

    let total_len = (20 + 8 + payload.len()) as u16;
    let mut ip = [0u8; 20];
    ip[0] = 0x45; // version 4, ihl 5
    ip[1] = 0x10; // low-delay tos, matching kernel DHCP traffic
    ip[2..4].copy_from_slice(&total_len.to_be_bytes());
    ip[8] = 64; // ttl
    ip[9] = 17; // udp
    ip[12..16].copy_from_slice(&src_ip.octets());
    ip[16..20].copy_from_slice(&dst_ip.octets());
    let checksum = internet_checksum(&ip);
    ip[10..12].copy_from_slice(&checksum.to_be_bytes());
    frame.extend_from_slice(&ip);

    let udp_len = (8 + payload.len()) as u16;
    frame.extend_from_slice(&DHCP_SERVER_PORT.to_be_bytes());
    frame.extend_from_slice(&DHCP_CLIENT_PORT.to_be_bytes());
    frame.extend_from_slice(&udp_len.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes()); // checksum optional for ipv4
    frame.extend_from_slice(payload);

    frame
}

impl L2Sender for RawClient {
    fn send_l2(
        &self,
        iface: &str,
        dst_mac: MacAddr6,
        payload: &[u8],
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
    ) -> Result<(), LinkError> {
        let if_index = interface_index(iface)?;
        let src_mac = interface_mac(iface)?;
        let frame = build_frame(src_mac, dst_mac, src_ip, dst_ip, payload);

        let socket = RawClient::open()?;

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = ETH_P_IP.to_be();
        addr.sll_ifindex = if_index as i32;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&dst_mac.to_array());

        let sent = unsafe {
            libc::sendto(
                socket.0,
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(LinkError::Send {
                iface: iface.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        trace!(iface, %dst_mac, bytes = frame.len(), "sent raw frame");
        Ok(())
    }
}
