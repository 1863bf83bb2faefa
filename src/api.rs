use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use ini::Ini;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, warn};

use crate::context::ServerContext;
use crate::interface::Interface;
use crate::overrides::{OverrideKind, OverrideOption};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONCURRENCY: usize = 64;
/// TTL applied to a lease entry when an operator schedules its release.
const ADMIN_RELEASE_TTL: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<ServerContext>,
    pub interfaces: Arc<Vec<Arc<Interface>>>,
    pub config_path: PathBuf,
}

#[derive(Serialize)]
struct Node {
    mac: String,
    ip: String,
    ends_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct Stats {
    interface: String,
    network: String,
    free: usize,
    percentfree: usize,
    used: usize,
    percentused: usize,
    options: HashMap<String, String>,
    members: Vec<Node>,
    status: String,
    size: usize,
}

#[derive(Serialize)]
struct StatsItems {
    items: Vec<Stats>,
    status: String,
}

#[derive(Serialize, Deserialize)]
struct ConfigSection {
    network: String,
    #[serde(default)]
    dns: String,
    #[serde(default)]
    gateway: String,
    #[serde(default)]
    dhcp_start: String,
    #[serde(default)]
    dhcp_end: String,
    #[serde(default)]
    netmask: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    domain_name: String,
    #[serde(default)]
    dhcp_default_lease_time: String,
    #[serde(default)]
    dhcp_max_lease_time: String,
    #[serde(default)]
    dhcpd: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    ip_reserved: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    ip_assigned: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    algorithm: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    next_hop: String,
}

#[derive(Serialize, Deserialize)]
struct ConfigDoc {
    interfaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    relay: Vec<String>,
    networks: Vec<ConfigSection>,
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn to_wall(ctx: &ServerContext, deadline: Instant) -> DateTime<Utc> {
    let remaining = deadline.saturating_duration_since(ctx.clock.now());
    Utc::now() + chrono::Duration::from_std(remaining).unwrap_or(chrono::Duration::zero())
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/dhcp/ip/{ip}", get(ip_to_mac))
        .route(
            "/api/v1/dhcp/mac/{mac}",
            get(mac_to_ip).delete(release_mac),
        )
        .route("/api/v1/dhcp/stats", get(all_stats))
        .route("/api/v1/dhcp/stats/{iface}", get(iface_stats))
        .route("/api/v1/dhcp/stats/{iface}/{network}", get(network_stats))
        .route("/api/v1/config", get(get_config).post(update_config))
        .route("/api/v1/dhcp/options", get(list_overrides))
        .route(
            "/api/v1/dhcp/options/{kind}/{target}",
            get(get_override).post(save_override).delete(delete_override),
        )
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENCY))
        .with_state(state)
}

pub async fn serve(state: ApiState, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin API listening");
    axum::serve(listener, router(state)).await
}

async fn ip_to_mac(State(state): State<ApiState>, Path(ip): Path<String>) -> Response {
    match state.ctx.directory.mac_for(&ip) {
        Some((mac, ends_at)) => Json(Node {
            mac: mac.to_string(),
            ip,
            ends_at,
        })
        .into_response(),
        None => api_error(StatusCode::NOT_FOUND, "Cannot find match for this IP address"),
    }
}

async fn mac_to_ip(State(state): State<ApiState>, Path(mac): Path<String>) -> Response {
    let mac = mac.to_lowercase();
    match state.ctx.directory.ip_for(&mac) {
        Some((ip, ends_at)) => Json(Node {
            mac,
            ip: ip.to_string(),
            ends_at,
        })
        .into_response(),
        None => api_error(
            StatusCode::NOT_FOUND,
            "Cannot find match for this MAC address",
        ),
    }
}

/// Shorten the client's lease-cache TTL so the sweeper evicts it almost
/// immediately and the slot flows back through the normal delayed return.
async fn release_mac(State(state): State<ApiState>, Path(mac): Path<String>) -> Response {
    let mac = mac.to_lowercase();
    let mut network = String::new();
    if let Some((ip, _)) = state.ctx.directory.ip_for(&mac) {
        if let Ok(addr) = ip.parse() {
            for iface in state.interfaces.iter() {
                for scope in &iface.scopes {
                    if !scope.contains(addr) {
                        continue;
                    }
                    network = scope.net.to_string();
                    if let Some(slot) = scope.leases.get(&mac) {
                        let _ = scope.leases.replace(&mac, slot, ADMIN_RELEASE_TTL);
                        info!(%mac, ip = %addr, "release scheduled");
                    }
                }
            }
        }
    }
    Json(json!({ "mac": mac, "network": network, "status": "ACK" })).into_response()
}

fn scope_stats(state: &ApiState, iface: &Interface, filter: Option<&str>) -> Vec<Stats> {
    let mut out = Vec::new();
    for scope in &iface.scopes {
        if let Some(filter) = filter {
            match filter.parse::<std::net::Ipv4Addr>() {
                Ok(addr) if scope.contains(addr) => {}
                _ => continue,
            }
        }

        let mut options = HashMap::new();
        options.insert(
            "optionIPAddressLeaseTime".to_string(),
            format!("{}s", scope.lease_duration.as_secs()),
        );
        options.insert(
            "subnetMask".to_string(),
            scope.defaults.subnet_mask.to_string(),
        );
        if !scope.defaults.routers.is_empty() {
            options.insert(
                "routers".to_string(),
                scope
                    .defaults
                    .routers
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        if !scope.defaults.dns.is_empty() {
            options.insert(
                "domainNameServers".to_string(),
                scope
                    .defaults
                    .dns
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            );
        }
        if let Some(domain) = &scope.defaults.domain_name {
            options.insert("domainName".to_string(), domain.clone());
        }

        let members: Vec<Node> = scope
            .leases
            .items()
            .into_iter()
            .map(|(mac, slot, expires_at)| Node {
                mac: mac.to_string(),
                ip: scope.addr_of(slot).to_string(),
                ends_at: to_wall(&state.ctx, expires_at),
            })
            .collect();

        let free = scope.pool.free_remaining();
        let used = scope.size - free;
        let percentfree = if scope.size > 0 { free * 100 / scope.size } else { 0 };
        let percentused = if scope.size > 0 { used * 100 / scope.size } else { 0 };

        let leased = scope.leased_count();
        let reserved = scope.permanently_reserved();
        let status = if leased + reserved == used {
            "Normal".to_string()
        } else {
            format!(
                "Accounted {} leases and {} reserved but the pool holds {}",
                leased, reserved, used
            )
        };

        out.push(Stats {
            interface: iface.name.clone(),
            network: scope.net.to_string(),
            free,
            percentfree,
            used,
            percentused,
            options,
            members,
            status,
            size: scope.size,
        });
    }
    out
}

async fn all_stats(State(state): State<ApiState>) -> Response {
    let mut items = Vec::new();
    for iface in state.interfaces.iter() {
        items.extend(scope_stats(&state, iface, None));
    }
    Json(StatsItems {
        items,
        status: "200".to_string(),
    })
    .into_response()
}

async fn iface_stats(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.interfaces.iter().find(|i| i.name == name) {
        Some(iface) => Json(scope_stats(&state, iface, None)).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "Interface not found"),
    }
}

async fn network_stats(
    State(state): State<ApiState>,
    Path((name, network)): Path<(String, String)>,
) -> Response {
    match state.interfaces.iter().find(|i| i.name == name) {
        Some(iface) => Json(scope_stats(&state, iface, Some(&network))).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "Interface not found"),
    }
}

async fn get_config(State(state): State<ApiState>) -> Response {
    let ini = match Ini::load_from_file(&state.config_path) {
        Ok(ini) => ini,
        Err(err) => {
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to load configuration: {err}"),
            )
        }
    };

    let mut doc = ConfigDoc {
        interfaces: Vec::new(),
        relay: Vec::new(),
        networks: Vec::new(),
    };

    if let Some(section) = ini.section(Some("interfaces")) {
        if let Some(listen) = section.get("listen") {
            doc.interfaces = listen.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(relay) = section.get("relay") {
            doc.relay = relay.split(',').map(|s| s.trim().to_string()).collect();
        }
    }

    for (name, section) in ini.iter() {
        let Some(name) = name else { continue };
        let Some(network) = name.strip_prefix("network ") else {
            continue;
        };
        let value = |key: &str| section.get(key).unwrap_or("").to_string();
        doc.networks.push(ConfigSection {
            network: network.trim().to_string(),
            dns: value("dns"),
            gateway: value("gateway"),
            dhcp_start: value("dhcp_start"),
            dhcp_end: value("dhcp_end"),
            netmask: value("netmask"),
            domain_name: value("domain-name"),
            dhcp_default_lease_time: value("dhcp_default_lease_time"),
            dhcp_max_lease_time: value("dhcp_max_lease_time"),
            dhcpd: value("dhcpd"),
            ip_reserved: value("ip_reserved"),
            ip_assigned: value("ip_assigned"),
            algorithm: value("algorithm"),
            next_hop: value("next_hop"),
        });
    }

    Json(doc).into_response()
}

async fn update_config(State(state): State<ApiState>, Json(doc): Json<ConfigDoc>) -> Response {
    let mut ini = Ini::new();

    {
        let mut section = ini.with_section(Some("interfaces"));
        if !doc.interfaces.is_empty() {
            section.set("listen", doc.interfaces.join(","));
        }
        if !doc.relay.is_empty() {
            section.set("relay", doc.relay.join(","));
        }
    }

    for network in &doc.networks {
        let name = format!("network {}", network.network);
        let mut section = ini.with_section(Some(name));
        let pairs = [
            ("dns", &network.dns),
            ("gateway", &network.gateway),
            ("dhcp_start", &network.dhcp_start),
            ("dhcp_end", &network.dhcp_end),
            ("netmask", &network.netmask),
            ("domain-name", &network.domain_name),
            (
                "dhcp_default_lease_time",
                &network.dhcp_default_lease_time,
            ),
            ("dhcp_max_lease_time", &network.dhcp_max_lease_time),
            ("dhcpd", &network.dhcpd),
            ("ip_reserved", &network.ip_reserved),
            ("ip_assigned", &network.ip_assigned),
            ("algorithm", &network.algorithm),
            ("next_hop", &network.next_hop),
        ];
        for (key, value) in pairs {
            if !value.is_empty() {
                section.set(key, value);
            }
        }
    }

    if let Err(err) = ini.write_to_file(&state.config_path) {
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to save configuration: {err}"),
        );
    }

    Json(json!({
        "status": "success",
        "message": "Configuration updated successfully. Restart the service to apply changes.",
    }))
    .into_response()
}

fn parse_kind(kind: &str) -> Result<OverrideKind, Response> {
    OverrideKind::parse(kind).ok_or_else(|| {
        api_error(
            StatusCode::BAD_REQUEST,
            "Invalid type. Must be 'network' or 'mac'",
        )
    })
}

fn normalize_target(kind: OverrideKind, target: &str) -> String {
    match kind {
        OverrideKind::Mac => target.to_lowercase(),
        OverrideKind::Network => target.to_string(),
    }
}

async fn save_override(
    State(state): State<ApiState>,
    Path((kind, target)): Path<(String, String)>,
    Json(options): Json<Vec<OverrideOption>>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    for option in &options {
        if option.option_value.is_empty() {
            return api_error(
                StatusCode::BAD_REQUEST,
                format!("Empty value for option {}", option.option_code),
            );
        }
    }
    let target = normalize_target(kind, &target);
    if let Err(err) = state.ctx.overrides.save(kind, &target, &options) {
        warn!(%err, %target, "failed to save option override");
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to save option override: {err}"),
        );
    }
    Json(json!({
        "status": "success",
        "message": format!("Option overrides saved for {} {}", kind.as_str(), target),
        "target": target,
        "options": options,
    }))
    .into_response()
}

async fn delete_override(
    State(state): State<ApiState>,
    Path((kind, target)): Path<(String, String)>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    let target = normalize_target(kind, &target);
    match state.ctx.overrides.delete(kind, &target) {
        Ok(true) => Json(json!({
            "status": "success",
            "message": format!("Option overrides removed for {} {}", kind.as_str(), target),
            "target": target,
        }))
        .into_response(),
        Ok(false) => api_error(
            StatusCode::NOT_FOUND,
            format!("No option overrides found for {} {}", kind.as_str(), target),
        ),
        Err(err) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to delete option override: {err}"),
        ),
    }
}

async fn get_override(
    State(state): State<ApiState>,
    Path((kind, target)): Path<(String, String)>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    let target = normalize_target(kind, &target);
    match state.ctx.overrides.get(kind, &target) {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => api_error(
            StatusCode::NOT_FOUND,
            format!("No option override found for {} {}", kind.as_str(), target),
        ),
        Err(err) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to get option override: {err}"),
        ),
    }
}

async fn list_overrides(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let kind = match params.get("type").map(String::as_str) {
        None | Some("") => None,
        Some(value) => match OverrideKind::parse(value) {
            Some(kind) => Some(kind),
            None => {
                return api_error(
                    StatusCode::BAD_REQUEST,
                    "Invalid type parameter. Must be 'network' or 'mac'",
                )
            }
        },
    };
    match state.ctx.overrides.list(kind) {
        Ok(rows) => Json(json!({
            "status": "success",
            "count": rows.len(),
            "overrides": rows,
        }))
        .into_response(),
        Err(err) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to list option overrides: {err}"),
        ),
    }
}
