use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{info, warn};

use oxidhcp::api::{self, ApiState};
use oxidhcp::cache::{spawn_sweeper, SystemClock};
use oxidhcp::config::Config;
use oxidhcp::context::ServerContext;
use oxidhcp::interface::{Interface, InterfaceKind};
use oxidhcp::overrides::OverrideStore;
use oxidhcp::probe::SystemProbe;
use oxidhcp::rawlink::{interface_ipv4, RawClient};
use oxidhcp::sched::Scheduler;
use oxidhcp::scope::NetworkScope;
use oxidhcp::signal::spawn_sighup_handler;
use oxidhcp::worker::{spawn_workers, QUEUE_CAPACITY, WORKER_COUNT};
use oxidhcp::{logging, scope, transport};

const SWEEP_INTERVAL_LEASES: Duration = Duration::from_secs(10);
const SWEEP_INTERVAL_XIDS: Duration = Duration::from_secs(2);

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("OXIDHCP_CONFIG").ok())
        .unwrap_or_else(|| "config.ini".to_string())
        .into()
}

fn main() -> anyhow::Result<()> {
    let config = Config::load(config_path())
        .map_err(anyhow::Error::from)
        .context("loading configuration")?;
    logging::init_stdout(config.log_level);

    let overrides = Arc::new(
        OverrideStore::open(&config.db_path)
            .with_context(|| format!("opening {}", config.db_path.display()))?,
    );

    let clock = Arc::new(SystemClock);
    let scheduler = Scheduler::new(clock.clone());
    let _scheduler_thread = scheduler.spawn();

    let mut ctx = ServerContext::new(
        clock.clone(),
        scheduler.clone(),
        Arc::clone(&overrides),
        Arc::new(SystemProbe::default()),
        Arc::new(RawClient),
    );
    ctx.reply_socket = Some(Arc::new(
        transport::reply_socket().context("binding reply socket")?,
    ));

    // serving interfaces: attach every network whose pool or next hop the
    // interface can reach
    let mut interfaces: Vec<Arc<Interface>> = Vec::new();
    for name in &config.listen {
        let addr = match interface_ipv4(name) {
            Ok(addr) => addr,
            Err(err) => {
                warn!(%err, iface = %name, "cannot find interface on the system");
                continue;
            }
        };
        let mut scopes = Vec::new();
        for network in &config.networks {
            if scope::ip_range(network.start, network.end) == 0 {
                continue;
            }
            let scope = NetworkScope::from_conf(network, addr, clock.clone(), scheduler.clone());
            // L2 networks attach to the interface that lives inside them,
            // L3 networks to any interface that can reach the next hop
            if scope.contains(addr) || scope.next_hop.is_some() {
                info!(iface = %name, network = %scope.net, size = scope.size, "serving network");
                scopes.push(Arc::new(scope));
            }
        }
        if scopes.is_empty() {
            warn!(iface = %name, "interface has no serviceable networks");
            continue;
        }
        interfaces.push(Arc::new(Interface::new(
            name.clone(),
            addr,
            InterfaceKind::Server,
            scopes,
        )));
    }

    for relay in &config.relays {
        match interface_ipv4(&relay.iface) {
            Ok(addr) => {
                info!(iface = %relay.iface, upstream = %relay.upstream, "relay interface");
                interfaces.push(Arc::new(Interface::new(
                    relay.iface.clone(),
                    addr,
                    InterfaceKind::Relay {
                        upstream: relay.upstream,
                    },
                    Vec::new(),
                )));
            }
            Err(err) => warn!(%err, iface = %relay.iface, "cannot find relay interface"),
        }
    }

    if interfaces.is_empty() {
        bail!("no usable interfaces, refusing to start");
    }

    for iface in &interfaces {
        for scope in &iface.scopes {
            spawn_sweeper(
                &format!("{}-leases", iface.name),
                Arc::clone(&scope.leases),
                SWEEP_INTERVAL_LEASES,
            );
            spawn_sweeper(
                &format!("{}-xids", iface.name),
                Arc::clone(&scope.xids),
                SWEEP_INTERVAL_XIDS,
            );
        }
    }

    let (jobs_tx, jobs_rx) = mpsc::sync_channel(QUEUE_CAPACITY);
    let ctx = Arc::new(ctx);
    let _workers = spawn_workers(Arc::clone(&ctx), jobs_rx, WORKER_COUNT);

    for iface in &interfaces {
        let broadcast = transport::broadcast_socket(&iface.name)
            .with_context(|| format!("binding broadcast socket on {}", iface.name))?;
        let unicast = transport::unicast_socket(iface.ipv4)
            .with_context(|| format!("binding unicast socket on {}", iface.name))?;
        if iface.is_relay() {
            let unicast = unicast.try_clone().context("cloning relay socket")?;
            ctx.relay_sockets
                .insert(iface.name.clone(), Arc::new(unicast));
        }
        transport::spawn_listeners(Arc::clone(iface), broadcast, unicast, jobs_tx.clone());
    }
    drop(jobs_tx);

    spawn_sighup_handler(Arc::clone(&overrides));

    let state = ApiState {
        ctx: Arc::clone(&ctx),
        interfaces: Arc::new(interfaces),
        config_path: config.path.clone(),
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building admin runtime")?;
    runtime
        .block_on(api::serve(state, config.admin_listen))
        .context("running admin API")?;

    Ok(())
}
