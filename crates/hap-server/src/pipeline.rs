//! Authenticated HAP requests against the accessory tree.
//!
//! Batch items run concurrently; each handler call is raced against a slow
//! threshold (warning only) and a timeout (the item fails with
//! [`HapStatus::OperationTimedOut`]). Batch responses always mirror the
//! request: one entry per requested characteristic.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use hap_accessory::characteristic::{Characteristic, WarningKind, WriteOptions};
use hap_accessory::{Accessory, RequestContext, ResourceRequest, PRIMARY_AID};
use hap_accessory::value::Perm;
use hap_core::connection::ConnectionId;
use hap_core::hap_type;
use hap_core::status::{HapStatus, HttpStatus};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::events::EventHub;
use crate::http::{HttpRequest, HttpResponse, CONTENT_TYPE_JPEG};

/// Who a request runs for.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub connection: ConnectionId,
    pub ctx: RequestContext,
}

/// A `/prepare` reservation for a timed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedWrite {
    pub pid: u64,
    pub expires: Instant,
}

/// Optional fields requested alongside read values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadFlags {
    pub meta: bool,
    pub perms: bool,
    pub kind: bool,
    pub ev: bool,
}

impl ReadFlags {
    pub fn from_request(request: &HttpRequest) -> Self {
        Self {
            meta: request.query_flag("meta"),
            perms: request.query_flag("perms"),
            kind: request.query_flag("type"),
            ev: request.query_flag("ev"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Read,
    Write,
}

impl Operation {
    fn slow(self) -> WarningKind {
        match self {
            Self::Read => WarningKind::SlowRead,
            Self::Write => WarningKind::SlowWrite,
        }
    }

    fn timeout(self) -> WarningKind {
        match self {
            Self::Read => WarningKind::TimeoutRead,
            Self::Write => WarningKind::TimeoutWrite,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    characteristics: Vec<WriteItem>,
    #[serde(default)]
    pid: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WriteItem {
    aid: u64,
    iid: u64,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    ev: Option<bool>,
    #[serde(rename = "authData", default)]
    auth_data: Option<String>,
    #[serde(default)]
    r: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct PrepareRequest {
    ttl: u64,
    pid: u64,
}

struct ReadCache {
    taken_at: Instant,
    admin: bool,
    values: Arc<HashMap<(u64, u64), Value>>,
}

/// Request handling shared by every connection.
pub struct Pipeline {
    accessory: Arc<Accessory>,
    hub: Arc<EventHub>,
    slow_threshold: Duration,
    timeout: Duration,
    cache_window: Duration,
    max_timed_write_ttl: Duration,
    read_cache: Mutex<Option<ReadCache>>,
}

impl Pipeline {
    pub fn new(accessory: Arc<Accessory>, hub: Arc<EventHub>, config: &ServerConfig) -> Self {
        Self {
            accessory,
            hub,
            slow_threshold: config.slow_threshold,
            timeout: config.timeout,
            cache_window: config.accessories_cache_window,
            max_timed_write_ttl: config.max_timed_write_ttl,
            read_cache: Mutex::new(None),
        }
    }

    /// Drop cached `/accessories` values, e.g. after the tree changed.
    pub fn invalidate_cache(&self) {
        *self.read_cache.lock() = None;
    }

    /// Await `operation`, warning once it is slow and failing at the timeout.
    async fn with_deadlines<T, F>(
        &self,
        characteristic: &Characteristic,
        aid: u64,
        op: Operation,
        operation: F,
    ) -> Result<T, HapStatus>
    where
        F: Future<Output = Result<T, HapStatus>>,
    {
        tokio::pin!(operation);
        tokio::select! {
            result = &mut operation => return result,
            _ = tokio::time::sleep(self.slow_threshold) => {
                characteristic.emit_warning(
                    op.slow(),
                    format!(
                        "{} of {}.{} ({}) took longer than {}ms",
                        op.as_str(),
                        aid,
                        characteristic.iid(),
                        characteristic.name(),
                        self.slow_threshold.as_millis()
                    ),
                );
            }
        }

        let remaining = self.timeout.saturating_sub(self.slow_threshold);
        match tokio::time::timeout(remaining, operation).await {
            Ok(result) => result,
            Err(_) => {
                characteristic.emit_warning(
                    op.timeout(),
                    format!(
                        "{} of {}.{} ({}) timed out after {}ms",
                        op.as_str(),
                        aid,
                        characteristic.iid(),
                        characteristic.name(),
                        self.timeout.as_millis()
                    ),
                );
                Err(HapStatus::OperationTimedOut)
            }
        }
    }

    // --- /accessories ---

    pub async fn accessories(&self, ctx: &RequestContext) -> HttpResponse {
        let values = self.accessory_values(ctx).await;
        let body = self
            .accessory
            .to_hap_json(&|aid, c| values.get(&(aid, c.iid())).cloned());
        HttpResponse::json(HttpStatus::Ok, &body)
    }

    async fn accessory_values(&self, ctx: &RequestContext) -> Arc<HashMap<(u64, u64), Value>> {
        if let Some(cache) = self.read_cache.lock().as_ref() {
            if cache.admin == ctx.is_admin && cache.taken_at.elapsed() < self.cache_window {
                debug!("Serving /accessories from read cache");
                return Arc::clone(&cache.values);
            }
        }

        let mut targets = Vec::new();
        for accessory in self.accessory.all_accessories() {
            let aid = accessory.aid();
            for service in accessory.services() {
                for characteristic in service.characteristics() {
                    if characteristic.has_perm(Perm::PairedRead) {
                        targets.push((aid, characteristic));
                    }
                }
            }
        }

        let reads = targets.iter().map(|(aid, characteristic)| async move {
            let result = self
                .with_deadlines(characteristic, *aid, Operation::Read, characteristic.handle_get(ctx))
                .await;
            let value = match result {
                Ok(value) => value.to_json(),
                Err(_) => Value::Null,
            };
            ((*aid, characteristic.iid()), value)
        });
        let values: Arc<HashMap<(u64, u64), Value>> = Arc::new(join_all(reads).await.into_iter().collect());

        *self.read_cache.lock() = Some(ReadCache {
            taken_at: Instant::now(),
            admin: ctx.is_admin,
            values: Arc::clone(&values),
        });
        values
    }

    // --- GET /characteristics ---

    pub async fn get_characteristics(&self, scope: &RequestScope, request: &HttpRequest) -> HttpResponse {
        let Some(ids) = request.query_param("id").and_then(parse_ids) else {
            return HttpResponse::hap_status(HttpStatus::BadRequest, HapStatus::InvalidValueInRequest);
        };
        if has_duplicates(ids.iter().copied()) {
            debug!(connection = %scope.connection, "Duplicate ids in read request");
            return HttpResponse::hap_status(HttpStatus::BadRequest, HapStatus::InvalidValueInRequest);
        }
        let flags = ReadFlags::from_request(request);

        let reads = ids
            .iter()
            .map(|&(aid, iid)| self.read_one(scope, aid, iid, flags));
        let results = join_all(reads).await;
        batch_response(results, HttpStatus::Ok)
    }

    async fn read_one(
        &self,
        scope: &RequestScope,
        aid: u64,
        iid: u64,
        flags: ReadFlags,
    ) -> Result<Map<String, Value>, (u64, u64, HapStatus)> {
        let Some(characteristic) = self.accessory.find_characteristic(aid, iid) else {
            return Err((aid, iid, HapStatus::InvalidValueInRequest));
        };
        let value = self
            .with_deadlines(&characteristic, aid, Operation::Read, characteristic.handle_get(&scope.ctx))
            .await
            .map_err(|status| (aid, iid, status))?;

        let mut item = Map::new();
        item.insert("aid".into(), json!(aid));
        item.insert("iid".into(), json!(iid));
        item.insert("value".into(), value.to_json());
        if flags.meta {
            item.extend(characteristic.props().meta_json());
        }
        if flags.perms {
            item.insert("perms".into(), characteristic.props().perms_json());
        }
        if flags.kind {
            item.insert("type".into(), json!(hap_type::to_short_form(&characteristic.uuid())));
        }
        if flags.ev {
            item.insert(
                "ev".into(),
                json!(self.hub.is_subscribed(scope.connection, aid, iid)),
            );
        }
        Ok(item)
    }

    // --- PUT /characteristics ---

    pub async fn put_characteristics(
        &self,
        scope: &RequestScope,
        body: &[u8],
        timed_write: &mut Option<TimedWrite>,
    ) -> HttpResponse {
        let request: WriteRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                debug!(connection = %scope.connection, error = %e, "Malformed write request");
                return HttpResponse::hap_status(HttpStatus::BadRequest, HapStatus::InvalidValueInRequest);
            }
        };
        if has_duplicates(request.characteristics.iter().map(|c| (c.aid, c.iid))) {
            debug!(connection = %scope.connection, "Duplicate ids in write request");
            return HttpResponse::hap_status(HttpStatus::BadRequest, HapStatus::InvalidValueInRequest);
        }

        let timed = match request.pid {
            Some(pid) => match timed_write.take() {
                Some(prepared) if prepared.pid == pid && Instant::now() <= prepared.expires => true,
                _ => {
                    debug!(connection = %scope.connection, pid, "Timed write without a valid prepare");
                    return HttpResponse::hap_status(
                        HttpStatus::BadRequest,
                        HapStatus::InvalidValueInRequest,
                    );
                }
            },
            None => false,
        };

        let writes = request
            .characteristics
            .iter()
            .map(|item| self.write_one(scope, item, timed));
        let results = join_all(writes).await;

        let all_plain = results
            .iter()
            .all(|r| matches!(r, Ok(item) if !item.contains_key("value")));
        if all_plain {
            return HttpResponse::new(HttpStatus::NoContent);
        }
        let items = results
            .into_iter()
            .map(|result| match result {
                Ok(mut item) => {
                    item.insert("status".into(), json!(HapStatus::Success.code()));
                    Value::Object(item)
                }
                Err((aid, iid, status)) => status_item(aid, iid, status),
            })
            .collect::<Vec<_>>();
        HttpResponse::json(HttpStatus::MultiStatus, &json!({ "characteristics": items }))
    }

    async fn write_one(
        &self,
        scope: &RequestScope,
        item: &WriteItem,
        timed: bool,
    ) -> Result<Map<String, Value>, (u64, u64, HapStatus)> {
        let (aid, iid) = (item.aid, item.iid);
        let fail = |status| (aid, iid, status);
        let Some(characteristic) = self.accessory.find_characteristic(aid, iid) else {
            return Err(fail(HapStatus::InvalidValueInRequest));
        };
        if item.value.is_none() && item.ev.is_none() {
            debug!(connection = %scope.connection, aid, iid, "Write item without value or ev");
            return Err(fail(HapStatus::InvalidValueInRequest));
        }

        if let Some(enable) = item.ev {
            characteristic.can_subscribe(&scope.ctx).map_err(fail)?;
            if enable {
                if self.hub.subscribe(scope.connection, aid, iid) {
                    characteristic.add_subscriber();
                }
            } else if self.hub.unsubscribe(scope.connection, aid, iid) {
                characteristic.remove_subscriber();
            }
            debug!(connection = %scope.connection, aid, iid, enable, "Notification toggled");
        }

        let mut result = Map::new();
        result.insert("aid".into(), json!(aid));
        result.insert("iid".into(), json!(iid));

        if let Some(raw) = &item.value {
            let options = WriteOptions {
                timed,
                auth_data: item.auth_data.clone(),
                response: item.r.unwrap_or(false),
            };
            let response = self
                .with_deadlines(
                    &characteristic,
                    aid,
                    Operation::Write,
                    characteristic.handle_set(raw, &options, &scope.ctx),
                )
                .await
                .map_err(fail)?;
            if let Some(value) = response {
                result.insert("value".into(), value.to_json());
            }
        }
        Ok(result)
    }

    // --- PUT /prepare ---

    pub fn prepare(&self, scope: &RequestScope, body: &[u8], timed_write: &mut Option<TimedWrite>) -> HttpResponse {
        let request: PrepareRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                debug!(connection = %scope.connection, error = %e, "Malformed prepare request");
                return HttpResponse::hap_status(HttpStatus::BadRequest, HapStatus::InvalidValueInRequest);
            }
        };
        let ttl = Duration::from_millis(request.ttl);
        if ttl > self.max_timed_write_ttl {
            warn!(connection = %scope.connection, ttl_ms = request.ttl, "Prepare TTL too long");
            return HttpResponse::hap_status(HttpStatus::BadRequest, HapStatus::InvalidValueInRequest);
        }
        *timed_write = Some(TimedWrite {
            pid: request.pid,
            expires: Instant::now() + ttl,
        });
        debug!(connection = %scope.connection, pid = request.pid, ttl_ms = request.ttl, "Timed write prepared");
        HttpResponse::hap_status(HttpStatus::Ok, HapStatus::Success)
    }

    // --- POST /resource ---

    pub async fn resource(&self, body: &[u8]) -> HttpResponse {
        let request: ResourceRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Malformed resource request");
                return HttpResponse::hap_status(HttpStatus::BadRequest, HapStatus::InvalidValueInRequest);
            }
        };
        let aid = request.aid.unwrap_or(PRIMARY_AID);
        let provider = self
            .accessory
            .find_accessory(aid)
            .and_then(|accessory| accessory.resource_provider());
        let Some(provider) = provider else {
            return HttpResponse::hap_status(HttpStatus::NotFound, HapStatus::ResourceDoesNotExist);
        };

        match tokio::time::timeout(self.timeout, provider.handle_resource(&request)).await {
            Ok(Ok(data)) => HttpResponse::with_body(HttpStatus::Ok, CONTENT_TYPE_JPEG, data),
            Ok(Err(HapStatus::ResourceDoesNotExist)) => {
                HttpResponse::hap_status(HttpStatus::NotFound, HapStatus::ResourceDoesNotExist)
            }
            Ok(Err(status)) => HttpResponse::hap_status(HttpStatus::InternalServerError, status),
            Err(_) => {
                warn!(aid, resource = %request.resource_type, "Resource request timed out");
                HttpResponse::hap_status(HttpStatus::InternalServerError, HapStatus::OperationTimedOut)
            }
        }
    }
}

/// Parse `1.10,2.9` into `(aid, iid)` pairs.
fn parse_ids(query: &str) -> Option<Vec<(u64, u64)>> {
    query
        .split(',')
        .map(|pair| {
            let (aid, iid) = pair.trim().split_once('.')?;
            Some((aid.parse().ok()?, iid.parse().ok()?))
        })
        .collect()
}

fn has_duplicates(ids: impl Iterator<Item = (u64, u64)>) -> bool {
    let mut seen = HashSet::new();
    ids.into_iter().any(|id| !seen.insert(id))
}

fn status_item(aid: u64, iid: u64, status: HapStatus) -> Value {
    json!({ "aid": aid, "iid": iid, "status": status.code() })
}

/// `ok_status` when every item succeeded, 207 with per-item statuses otherwise.
fn batch_response(
    results: Vec<Result<Map<String, Value>, (u64, u64, HapStatus)>>,
    ok_status: HttpStatus,
) -> HttpResponse {
    let any_failed = results.iter().any(Result::is_err);
    let items = results
        .into_iter()
        .map(|result| match result {
            Ok(mut item) => {
                if any_failed {
                    item.insert("status".into(), json!(HapStatus::Success.code()));
                }
                Value::Object(item)
            }
            Err((aid, iid, status)) => status_item(aid, iid, status),
        })
        .collect::<Vec<_>>();
    let status = if any_failed { HttpStatus::MultiStatus } else { ok_status };
    HttpResponse::json(status, &json!({ "characteristics": items }))
}
