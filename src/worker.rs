use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread;

use dhcproto::v4;
use tracing::{debug, error, warn};

use crate::codec::{self, MessageExt};
use crate::context::ServerContext;
use crate::interface::{Answer, Interface};

pub const QUEUE_CAPACITY: usize = 100;
pub const WORKER_COUNT: usize = 100;

const DHCP_SERVER_PORT: u16 = 67;

/// One validated packet waiting for a worker.
pub struct Job {
    pub message: v4::Message,
    pub msg_type: v4::MessageType,
    pub iface: Arc<Interface>,
    /// Remote peer the datagram came from.
    pub src: SocketAddr,
    /// Local address it arrived on.
    pub dst: Ipv4Addr,
}

/// Start the fixed worker pool. Workers share the receiving end of the
/// bounded queue; producers block while it is full.
pub fn spawn_workers(
    ctx: Arc<ServerContext>,
    jobs: Receiver<Job>,
    count: usize,
) -> Vec<thread::JoinHandle<()>> {
    let jobs = Arc::new(Mutex::new(jobs));
    (0..count)
        .map(|id| {
            let ctx = Arc::clone(&ctx);
            let jobs = Arc::clone(&jobs);
            thread::Builder::new()
                .name(format!("dhcp-worker-{id}"))
                .spawn(move || loop {
                    let job = {
                        let guard = jobs.lock().unwrap_or_else(|e| e.into_inner());
                        guard.recv()
                    };
                    match job {
                        Ok(job) => {
                            // one bad packet must never take a worker down
                            let outcome = catch_unwind(AssertUnwindSafe(|| process(&ctx, job)));
                            if let Err(panic) = outcome {
                                error!(?panic, "handler panicked, recovering");
                            }
                        }
                        Err(_) => return, // producers are gone
                    }
                })
                .expect("failed to spawn worker thread")
        })
        .collect()
}

fn process(ctx: &ServerContext, job: Job) {
    let answer = match job.iface.serve(ctx, &job.message, job.msg_type) {
        Some(answer) => answer,
        None => return,
    };
    dispatch(ctx, &job, answer);
}

/// Route a reply: unicast UDP when the peer has a usable source address,
/// raw L2 toward the client hardware address otherwise.
fn dispatch(ctx: &ServerContext, job: &Job, answer: Answer) {
    match answer {
        Answer::Reply { message, src_ip } => {
            let bytes = match codec::encode(&message) {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!(%err, "failed to encode reply");
                    return;
                }
            };
            let peer_ip = match job.src {
                SocketAddr::V4(addr) => *addr.ip(),
                SocketAddr::V6(_) => return,
            };
            let giaddr = job.message.giaddr();
            if giaddr != Ipv4Addr::UNSPECIFIED || peer_ip != Ipv4Addr::UNSPECIFIED {
                let Some(socket) = &ctx.reply_socket else {
                    warn!("no reply socket configured, dropping reply");
                    return;
                };
                match socket.send_to(&bytes, job.src) {
                    Ok(sent) => debug!(peer = %job.src, sent, "unicast reply"),
                    Err(err) => error!(%err, peer = %job.src, "failed to send reply"),
                }
            } else {
                // first exchange on broadcast: the client owns no address yet
                let dst_mac = match message.client_mac() {
                    Some(mac) => mac,
                    None => return,
                };
                let dst_ip = message.yiaddr();
                if let Err(err) =
                    ctx.link
                        .send_l2(&job.iface.name, dst_mac, &bytes, src_ip, dst_ip)
                {
                    error!(%err, iface = %job.iface.name, "raw send failed");
                }
            }
        }
        Answer::RelayUpstream { message, upstream } => {
            let bytes = match codec::encode(&message) {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!(%err, "failed to encode relayed message");
                    return;
                }
            };
            let Some(socket) = ctx.relay_sockets.get(&job.iface.name) else {
                warn!(iface = %job.iface.name, "no relay socket, dropping forward");
                return;
            };
            let target = SocketAddrV4::new(upstream, DHCP_SERVER_PORT);
            match socket.send_to(&bytes, target) {
                Ok(sent) => debug!(%target, sent, "forwarded upstream"),
                Err(err) => error!(%err, %target, "failed to forward upstream"),
            }
        }
        Answer::RelayClient { message, dst_ip } => {
            let bytes = match codec::encode(&message) {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!(%err, "failed to encode relayed reply");
                    return;
                }
            };
            let dst_mac = match message.client_mac() {
                Some(mac) => mac,
                None => return,
            };
            if let Err(err) =
                ctx.link
                    .send_l2(&job.iface.name, dst_mac, &bytes, job.iface.ipv4, dst_ip)
            {
                error!(%err, iface = %job.iface.name, "raw relay send failed");
            }
        }
    }
}
