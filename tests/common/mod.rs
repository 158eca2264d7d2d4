//! In-process stand-ins for Keystone, Glance, the oVirt engine and the imageio
//! proxy, all served from one axum router on 127.0.0.1.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::header::{AUTHORIZATION, CONTENT_RANGE, RANGE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::{Value, json};

use remote_blockdev::{Backend, Plugin};

pub const IMAGE_ID: &str = "5e3d0b1a-image";
pub const IMAGE_NAME: &str = "cirros";
pub const DISK_ID: &str = "9b7c2d4e-disk";
pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "secret";
const KEYSTONE_TOKEN: &str = "keystone-token";
const SSO_TOKEN: &str = "sso-token";

#[derive(Default)]
pub struct Counters {
    pub downloads: AtomicUsize,
    pub revokes: AtomicUsize,
    pub logouts: AtomicUsize,
    pub range_requests: AtomicUsize,
    pub transfers_created: AtomicUsize,
    pub conflicts: AtomicUsize,
    pub disk_polls: AtomicUsize,
    /// Finalize requests received, authorized or not.
    pub finalize_attempts: AtomicUsize,
}

struct TransferState {
    disk: String,
    phase: &'static str,
    polls_until_ready: u32,
    /// GETs still answered after finalize before the transfer disappears.
    gone_after: Option<u32>,
    inactivity_timeout: u64,
}

pub struct MockCloud {
    pub base: String,
    pub image: Vec<u8>,
    pub counters: Counters,
    /// Keep new transfers in the initializing phase forever.
    pub stuck_initializing: AtomicBool,
    /// Return half of every ranged response body.
    pub short_reads: AtomicBool,
    /// Answer every ranged request with the whole image and a 200.
    pub ignore_ranges: AtomicBool,
    /// Serve ranges starting one byte past the requested offset.
    pub misaligned_ranges: AtomicBool,
    /// Expire the engine token as soon as the first transfer is created.
    pub expire_token_after_create: AtomicBool,
    token_expired: AtomicBool,
    transfers: Mutex<HashMap<String, TransferState>>,
    finalized: Mutex<HashMap<String, usize>>,
    created: Mutex<Vec<(String, u64)>>,
    peers: Mutex<Vec<SocketAddr>>,
    next_transfer: AtomicUsize,
}

impl MockCloud {
    pub fn finalize_count(&self, id: &str) -> usize {
        self.finalized.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_finalizes(&self) -> usize {
        self.finalized.lock().unwrap().values().sum()
    }

    /// `(transfer id, inactivity timeout)` in creation order.
    pub fn created_transfers(&self) -> Vec<(String, u64)> {
        self.created.lock().unwrap().clone()
    }

    pub fn proxy_peers(&self) -> Vec<SocketAddr> {
        self.peers.lock().unwrap().clone()
    }

    pub fn live_transfers(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }
}

pub fn image_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

pub async fn start(image: Vec<u8>) -> Arc<MockCloud> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let cloud = Arc::new(MockCloud {
        base: format!("http://{addr}"),
        image,
        counters: Counters::default(),
        stuck_initializing: AtomicBool::new(false),
        short_reads: AtomicBool::new(false),
        ignore_ranges: AtomicBool::new(false),
        misaligned_ranges: AtomicBool::new(false),
        expire_token_after_create: AtomicBool::new(false),
        token_expired: AtomicBool::new(false),
        transfers: Mutex::new(HashMap::new()),
        finalized: Mutex::new(HashMap::new()),
        created: Mutex::new(Vec::new()),
        peers: Mutex::new(Vec::new()),
        next_transfer: AtomicUsize::new(1),
    });

    let app = Router::new()
        .route("/v3/auth/tokens", post(keystone_auth).delete(keystone_revoke))
        .route("/glance/v2/images", get(glance_list))
        .route("/glance/v2/images/:id", get(glance_image))
        .route("/glance/v2/images/:id/file", get(glance_file))
        .route("/ovirt-engine/sso/oauth/token", post(sso_token))
        .route("/ovirt-engine/services/sso-logout", get(sso_logout))
        .route("/ovirt-engine/api/imagetransfers", post(create_transfer))
        .route("/ovirt-engine/api/imagetransfers/:id", get(get_transfer))
        .route("/ovirt-engine/api/imagetransfers/:id/cancel", post(cancel_transfer))
        .route("/ovirt-engine/api/imagetransfers/:id/finalize", post(finalize_transfer))
        .route("/ovirt-engine/api/disks/:id", get(get_disk))
        .route("/images/:id", get(proxy_read))
        .with_state(cloud.clone());

    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });

    cloud
}

/// Plugin for the OpenStack backend pointed at the mock.
pub fn openstack_plugin(cloud: &MockCloud, password: &str, image: &str) -> Plugin {
    let mut plugin = Plugin::new(Backend::Openstack);
    plugin.config("auth_url", &format!("{}/v3", cloud.base)).unwrap();
    plugin.config("username", USERNAME).unwrap();
    plugin.config("password", password).unwrap();
    plugin.config("project_name", "demo").unwrap();
    plugin.config("image", image).unwrap();
    plugin
}

/// Plugin for the oVirt backend pointed at the mock, with fast polling.
pub fn ovirt_plugin(cloud: &MockCloud, password: &str) -> Plugin {
    let mut plugin = Plugin::new(Backend::Ovirt);
    plugin
        .config("url", &format!("{}/ovirt-engine/api", cloud.base))
        .unwrap();
    plugin.config("username", USERNAME).unwrap();
    plugin.config("password", password).unwrap();
    plugin.config("disk", DISK_ID).unwrap();
    plugin.config("poll_interval", "0.01").unwrap();
    plugin.config("poll_max_interval", "0.02").unwrap();
    plugin.config("poll_timeout", "5").unwrap();
    plugin
}

fn has_token(headers: &HeaderMap, name: &str, expected: &str) -> bool {
    headers.get(name).and_then(|v| v.to_str().ok()) == Some(expected)
}

// ---- Keystone ----

async fn keystone_auth(State(cloud): State<Arc<MockCloud>>, Json(body): Json<Value>) -> Response {
    let user = &body["auth"]["identity"]["password"]["user"];
    if user["name"] != USERNAME || user["password"] != PASSWORD {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let catalog = json!({
        "token": {
            "catalog": [
                { "type": "identity", "endpoints": [
                    { "interface": "public", "region": "RegionOne", "url": format!("{}/v3", cloud.base) }
                ]},
                { "type": "image", "endpoints": [
                    { "interface": "internal", "region": "RegionOne", "url": "http://127.0.0.1:1/unused" },
                    { "interface": "public", "region": "RegionOne", "url": format!("{}/glance/v2/", cloud.base) }
                ]}
            ]
        }
    });
    (
        StatusCode::CREATED,
        [("X-Subject-Token", KEYSTONE_TOKEN)],
        Json(catalog),
    )
        .into_response()
}

async fn keystone_revoke(State(cloud): State<Arc<MockCloud>>, headers: HeaderMap) -> StatusCode {
    if !has_token(&headers, "x-subject-token", KEYSTONE_TOKEN) {
        return StatusCode::NOT_FOUND;
    }
    cloud.counters.revokes.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT
}

// ---- Glance ----

fn image_json(cloud: &MockCloud) -> Value {
    json!({
        "id": IMAGE_ID,
        "name": IMAGE_NAME,
        "status": "active",
        "size": cloud.image.len(),
        "disk_format": "raw",
    })
}

async fn glance_image(
    State(cloud): State<Arc<MockCloud>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !has_token(&headers, "x-auth-token", KEYSTONE_TOKEN) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if id != IMAGE_ID {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(image_json(&cloud)).into_response()
}

async fn glance_list(
    State(cloud): State<Arc<MockCloud>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !has_token(&headers, "x-auth-token", KEYSTONE_TOKEN) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let images: Vec<Value> = if query.get("name").map(String::as_str) == Some(IMAGE_NAME) {
        vec![image_json(&cloud)]
    } else {
        Vec::new()
    };
    Json(json!({ "images": images })).into_response()
}

async fn glance_file(
    State(cloud): State<Arc<MockCloud>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !has_token(&headers, "x-auth-token", KEYSTONE_TOKEN) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if id != IMAGE_ID {
        return StatusCode::NOT_FOUND.into_response();
    }
    cloud.counters.downloads.fetch_add(1, Ordering::SeqCst);
    Body::from(cloud.image.clone()).into_response()
}

// ---- oVirt engine ----

async fn sso_token(Form(form): Form<HashMap<String, String>>) -> Response {
    let field = |k: &str| form.get(k).map(String::as_str);
    if field("grant_type") != Some("password")
        || field("username") != Some(USERNAME)
        || field("password") != Some(PASSWORD)
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "access_denied", "error_description": "Cannot authenticate user" })),
        )
            .into_response();
    }
    Json(json!({ "access_token": SSO_TOKEN, "scope": "ovirt-app-api", "token_type": "bearer" }))
        .into_response()
}

async fn sso_logout(
    State(cloud): State<Arc<MockCloud>>,
    Query(query): Query<HashMap<String, String>>,
) -> StatusCode {
    if query.get("token").map(String::as_str) == Some(SSO_TOKEN) {
        cloud.counters.logouts.fetch_add(1, Ordering::SeqCst);
    }
    StatusCode::OK
}

fn engine_authorized(cloud: &MockCloud, headers: &HeaderMap) -> bool {
    !cloud.token_expired.load(Ordering::SeqCst)
        && has_token(headers, "authorization", &format!("Bearer {SSO_TOKEN}"))
}

fn transfer_json(cloud: &MockCloud, id: &str, state: &TransferState) -> Value {
    let mut body = json!({
        "id": id,
        "phase": state.phase,
        "direction": "download",
        "inactivity_timeout": state.inactivity_timeout.to_string(),
        "disk": { "id": state.disk },
    });
    if state.phase == "transferring" {
        body["proxy_url"] = json!(format!("{}/images/{id}", cloud.base));
        body["transfer_url"] = json!(format!("{}/images/{id}", cloud.base));
        body["signed_ticket"] = json!(format!("ticket-{id}"));
    }
    body
}

async fn create_transfer(
    State(cloud): State<Arc<MockCloud>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !engine_authorized(&cloud, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let disk = body["disk"]["id"].as_str().unwrap_or_default().to_string();
    let inactivity_timeout = body["inactivity_timeout"].as_u64().unwrap_or(0);

    let mut transfers = cloud.transfers.lock().unwrap();
    if transfers.values().any(|t| t.disk == disk) {
        cloud.counters.conflicts.fetch_add(1, Ordering::SeqCst);
        return (
            StatusCode::CONFLICT,
            Json(json!({ "reason": "Operation Failed", "detail": "disk is locked" })),
        )
            .into_response();
    }

    let id = format!("t-{}", cloud.next_transfer.fetch_add(1, Ordering::SeqCst));
    let state = TransferState {
        disk,
        phase: "initializing",
        polls_until_ready: 1,
        gone_after: None,
        inactivity_timeout,
    };
    let body = transfer_json(&cloud, &id, &state);
    transfers.insert(id.clone(), state);
    cloud.created.lock().unwrap().push((id, inactivity_timeout));
    cloud.counters.transfers_created.fetch_add(1, Ordering::SeqCst);
    if cloud.expire_token_after_create.load(Ordering::SeqCst) {
        cloud.token_expired.store(true, Ordering::SeqCst);
    }
    (StatusCode::CREATED, Json(body)).into_response()
}

async fn get_transfer(
    State(cloud): State<Arc<MockCloud>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !engine_authorized(&cloud, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut transfers = cloud.transfers.lock().unwrap();
    if transfers.get(&id).is_some_and(|t| t.gone_after == Some(0)) {
        transfers.remove(&id);
    }
    let Some(state) = transfers.get_mut(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let Some(n) = state.gone_after {
        state.gone_after = Some(n - 1);
    }

    if state.phase == "initializing" && !cloud.stuck_initializing.load(Ordering::SeqCst) {
        if state.polls_until_ready > 0 {
            state.polls_until_ready -= 1;
        } else {
            state.phase = "transferring";
        }
    }
    Json(transfer_json(&cloud, &id, state)).into_response()
}

async fn cancel_transfer(
    State(cloud): State<Arc<MockCloud>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    if !engine_authorized(&cloud, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    match cloud.transfers.lock().unwrap().get_mut(&id) {
        Some(state) => {
            state.phase = "cancelled_user";
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn finalize_transfer(
    State(cloud): State<Arc<MockCloud>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    cloud.counters.finalize_attempts.fetch_add(1, Ordering::SeqCst);
    if !engine_authorized(&cloud, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    let mut transfers = cloud.transfers.lock().unwrap();
    let Some(state) = transfers.get_mut(&id) else {
        return StatusCode::NOT_FOUND;
    };
    state.phase = "finalizing_success";
    state.gone_after = Some(1);
    *cloud.finalized.lock().unwrap().entry(id).or_default() += 1;
    StatusCode::OK
}

async fn get_disk(
    State(cloud): State<Arc<MockCloud>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !engine_authorized(&cloud, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if id != DISK_ID {
        return StatusCode::NOT_FOUND.into_response();
    }
    // Locked right after the probe transfer, OK from the second poll on.
    let polls = cloud.counters.disk_polls.fetch_add(1, Ordering::SeqCst);
    let status = if polls == 0 { "locked" } else { "ok" };
    Json(json!({
        "id": DISK_ID,
        "status": status,
        "provisioned_size": cloud.image.len().to_string(),
    }))
    .into_response()
}

// ---- imageio proxy ----

async fn proxy_read(
    State(cloud): State<Arc<MockCloud>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    cloud.peers.lock().unwrap().push(peer);
    cloud.counters.range_requests.fetch_add(1, Ordering::SeqCst);

    let active = cloud
        .transfers
        .lock()
        .unwrap()
        .get(&id)
        .is_some_and(|t| t.phase == "transferring");
    if !active {
        return StatusCode::NOT_FOUND.into_response();
    }
    if !has_token(&headers, AUTHORIZATION.as_str(), &format!("ticket-{id}")) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let total = cloud.image.len() as u64;
    let range = headers.get(RANGE).and_then(|v| v.to_str().ok());
    if cloud.ignore_ranges.load(Ordering::SeqCst) {
        return Body::from(cloud.image.clone()).into_response();
    }
    let (mut start, mut end_exclusive) = match range.map(|r| parse_range_header(r, total)) {
        Some(Ok(range)) => range,
        Some(Err(status)) => return status.into_response(),
        None => return Body::from(cloud.image.clone()).into_response(),
    };
    if cloud.misaligned_ranges.load(Ordering::SeqCst) {
        start += 1;
        end_exclusive = (end_exclusive + 1).min(total);
    }

    let mut body = cloud.image[start as usize..end_exclusive as usize].to_vec();
    if cloud.short_reads.load(Ordering::SeqCst) {
        body.truncate(body.len() / 2);
    }
    (
        StatusCode::PARTIAL_CONTENT,
        [(
            CONTENT_RANGE,
            format!("bytes {start}-{}/{total}", end_exclusive - 1),
        )],
        body,
    )
        .into_response()
}

fn parse_range_header(header: &str, total_size: u64) -> Result<(u64, u64), StatusCode> {
    // Only supports a single range: bytes=start-end
    let bounds = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or(StatusCode::BAD_REQUEST)?;
    let (start, end) = bounds.split_once('-').ok_or(StatusCode::BAD_REQUEST)?;
    let start: u64 = start.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    let end_inclusive: u64 = end.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    if start >= total_size {
        return Err(StatusCode::RANGE_NOT_SATISFIABLE);
    }
    let end_exclusive = (end_inclusive + 1).min(total_size);
    if end_exclusive <= start {
        return Err(StatusCode::RANGE_NOT_SATISFIABLE);
    }
    Ok((start, end_exclusive))
}
