use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, trace, warn};

use crate::codec;
use crate::interface::Interface;
use crate::worker::Job;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Socket for broadcast DHCP on one NIC: bound to the wildcard address so
/// limited broadcasts arrive, pinned to the device so we know which
/// interface they came in on.
pub fn broadcast_socket(iface: &str) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.bind_device(Some(iface.as_bytes()))?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT).into())?;
    Ok(socket.into())
}

/// Per-interface unicast socket on the client port, where upstream servers
/// address their replies to a relay.
pub fn unicast_socket(addr: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(addr, DHCP_CLIENT_PORT).into())?;
    Ok(socket.into())
}

/// Socket unicast replies are sent from; shares the server port with the
/// per-interface listeners.
pub fn reply_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT).into())?;
    Ok(socket.into())
}

/// Receive-failure throttle. A reset bounced back by a peer or an
/// interrupted syscall retries at once; a socket that keeps failing gets a
/// linearly growing pause, capped at roughly the time the worker pool
/// needs to drain a full job queue, since sleeping past that only delays
/// recovery.
struct RecvThrottle {
    consecutive: u32,
}

impl RecvThrottle {
    const STEP: Duration = Duration::from_millis(25);
    const CEILING: Duration = Duration::from_millis(500);

    fn new() -> Self {
        Self { consecutive: 0 }
    }

    fn clear(&mut self) {
        self.consecutive = 0;
    }

    fn pause_for(&mut self, err: &io::Error) {
        if matches!(
            err.kind(),
            io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
        ) {
            debug!(%err, "transient receive error");
            return;
        }
        self.consecutive = self.consecutive.saturating_add(1);
        let pause = Self::STEP
            .saturating_mul(self.consecutive)
            .min(Self::CEILING);
        error!(%err, consecutive = self.consecutive, "receive failing, throttling");
        thread::sleep(pause);
    }
}

/// Blocking receive loop: validate at the codec layer, then queue the job.
/// Enqueueing blocks while all workers are busy and the queue is full; the
/// OS socket buffer absorbs the burst.
pub fn run_listener(iface: Arc<Interface>, socket: UdpSocket, jobs: SyncSender<Job>) {
    let mut buf = [0u8; 2048];
    let mut throttle = RecvThrottle::new();

    info!(iface = %iface.name, addr = %iface.ipv4, "listener running");
    loop {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(received) => {
                throttle.clear();
                received
            }
            Err(err) => {
                throttle.pause_for(&err);
                continue;
            }
        };
        trace!(len, %src, "received datagram");

        let (message, msg_type) = match codec::decode_request(&buf[..len]) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(%err, %src, "dropping malformed packet");
                continue;
            }
        };

        let job = Job {
            message,
            msg_type,
            iface: Arc::clone(&iface),
            src,
            dst: iface.ipv4,
        };
        if jobs.send(job).is_err() {
            // worker pool is gone; nothing left to do on this thread
            return;
        }
    }
}

/// Spawn the broadcast and unicast listener threads for one interface.
pub fn spawn_listeners(
    iface: Arc<Interface>,
    broadcast: UdpSocket,
    unicast: UdpSocket,
    jobs: SyncSender<Job>,
) -> Vec<thread::JoinHandle<()>> {
    let mut handles = Vec::with_capacity(2);

    let broadcast_iface = Arc::clone(&iface);
    let broadcast_jobs = jobs.clone();
    handles.push(
        thread::Builder::new()
            .name(format!("bcast-{}", iface.name))
            .spawn(move || run_listener(broadcast_iface, broadcast, broadcast_jobs))
            .expect("failed to spawn broadcast listener"),
    );

    let unicast_iface = Arc::clone(&iface);
    handles.push(
        thread::Builder::new()
            .name(format!("ucast-{}", iface.name))
            .spawn(move || run_listener(unicast_iface, unicast, jobs))
            .expect("failed to spawn unicast listener"),
    );

    handles
}
