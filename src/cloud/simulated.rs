//! SF-021: Simulated cloud backend.
//!
//! Stands in for a provider SDK: generates identifiers and computed
//! attributes per kind, models asynchronous readiness (distributions deploy,
//! certificates validate), and can persist its objects to a JSON file so
//! separate CLI invocations see the same cloud. Tests use the fault hooks
//! (`fail_on`, `hang_on`, `tamper`) and the call log.

use super::{ApiError, CloudRegistry, LiveResource, ResourceApi};
use crate::core::types::{Attributes, ProviderConfig, ResourceKind, DEFAULT_PROVIDER};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// One of the five capability operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiOp {
    Create,
    Read,
    Update,
    Delete,
    WaitUntilReady,
}

impl ApiOp {
    /// Whether the operation changes cloud state.
    pub fn is_mutation(self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Delete)
    }
}

/// A recorded API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCall {
    pub op: ApiOp,
    pub kind: ResourceKind,
    pub provider: String,
    /// Logical resource ID (falls back to the cloud ID for unknown objects)
    pub resource_id: String,
    /// Attributes sent with create/update
    pub attributes: Option<Attributes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimObject {
    kind: ResourceKind,
    provider: String,
    region: String,
    resource_id: String,
    serial: u64,
    ready: bool,
    declared: Attributes,
    /// Out-of-band changes, applied over the generated view
    #[serde(default)]
    overrides: Attributes,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Objects {
    next_serial: u64,
    objects: BTreeMap<String, SimObject>,
}

#[derive(Default)]
struct Faults {
    fail: HashMap<(String, ApiOp), String>,
    hang: HashSet<String>,
}

#[derive(Default)]
struct Shared {
    objects: Mutex<Objects>,
    calls: Mutex<Vec<ApiCall>>,
    faults: Mutex<Faults>,
    latency: Mutex<Duration>,
    persist: Option<PathBuf>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts concurrent calls for the lifetime of one API call.
struct InFlight<'a>(&'a Shared);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An in-process cloud shared by all handles created from it.
#[derive(Clone, Default)]
pub struct SimulatedCloud {
    shared: Arc<Shared>,
}

impl SimulatedCloud {
    /// An empty, memory-only cloud.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cloud persisted at `path`, starting empty if the file does not exist.
    pub fn open(path: &Path) -> Result<Self, ApiError> {
        let objects = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| ApiError::Backend(format!("cannot read {}: {}", path.display(), e)))?;
            serde_json::from_str(&content)
                .map_err(|e| ApiError::Backend(format!("invalid cloud file {}: {}", path.display(), e)))?
        } else {
            Objects::default()
        };
        Ok(Self {
            shared: Arc::new(Shared {
                objects: Mutex::new(objects),
                persist: Some(path.to_path_buf()),
                ..Shared::default()
            }),
        })
    }

    /// Delay every API call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.shared.latency) = latency;
    }

    /// Build a registry holding a handle for every kind under `default`
    /// and each declared provider alias.
    pub fn registry(&self, providers: &IndexMap<String, ProviderConfig>) -> CloudRegistry {
        let mut registry = CloudRegistry::new();
        let mut aliases: Vec<(String, ProviderConfig)> = Vec::new();
        if !providers.contains_key(DEFAULT_PROVIDER) {
            aliases.push((DEFAULT_PROVIDER.to_string(), ProviderConfig::default()));
        }
        aliases.extend(providers.iter().map(|(k, v)| (k.clone(), v.clone())));

        for (alias, provider) in aliases {
            for kind in ResourceKind::ALL {
                registry.register(
                    alias.clone(),
                    Arc::new(self.handle(&alias, &provider.region, kind)),
                );
            }
        }
        registry
    }

    /// A handle for one provider alias and kind.
    pub fn handle(&self, provider: &str, region: &str, kind: ResourceKind) -> SimulatedHandle {
        SimulatedHandle {
            cloud: self.clone(),
            provider: provider.to_string(),
            region: region.to_string(),
            kind,
        }
    }

    /// Make the next `op` on `resource_id` fail with `message`. One-shot.
    pub fn fail_on(&self, resource_id: &str, op: ApiOp, message: &str) {
        lock(&self.shared.faults)
            .fail
            .insert((resource_id.to_string(), op), message.to_string());
    }

    /// Make `wait_until_ready` on `resource_id` never complete.
    pub fn hang_on(&self, resource_id: &str) {
        lock(&self.shared.faults).hang.insert(resource_id.to_string());
    }

    /// Change a live attribute behind the engine's back.
    pub fn tamper(&self, resource_id: &str, attribute: &str, value: Value) -> bool {
        let mut objects = lock(&self.shared.objects);
        let found = match objects
            .objects
            .values_mut()
            .find(|o| o.resource_id == resource_id)
        {
            Some(obj) => {
                obj.overrides.insert(attribute.to_string(), value);
                true
            }
            None => false,
        };
        if found {
            self.persist_quietly(&objects);
        }
        found
    }

    /// Delete an object behind the engine's back.
    pub fn remove_out_of_band(&self, resource_id: &str) -> bool {
        let mut objects = lock(&self.shared.objects);
        let before = objects.objects.len();
        objects.objects.retain(|_, o| o.resource_id != resource_id);
        let removed = objects.objects.len() != before;
        if removed {
            self.persist_quietly(&objects);
        }
        removed
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<ApiCall> {
        lock(&self.shared.calls).clone()
    }

    /// Calls that change cloud state.
    pub fn mutating_calls(&self) -> Vec<ApiCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.op.is_mutation())
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.shared.calls).clear();
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    /// Whether an object exists for the logical resource ID.
    pub fn contains(&self, resource_id: &str) -> bool {
        lock(&self.shared.objects)
            .objects
            .values()
            .any(|o| o.resource_id == resource_id)
    }

    pub fn object_count(&self) -> usize {
        lock(&self.shared.objects).objects.len()
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.shared)
    }

    fn latency(&self) -> Duration {
        *lock(&self.shared.latency)
    }

    fn record(&self, call: ApiCall) {
        lock(&self.shared.calls).push(call);
    }

    fn take_fault(&self, resource_id: &str, op: ApiOp) -> Option<String> {
        lock(&self.shared.faults)
            .fail
            .remove(&(resource_id.to_string(), op))
    }

    fn hangs(&self, resource_id: &str) -> bool {
        lock(&self.shared.faults).hang.contains(resource_id)
    }

    fn resource_id_of(&self, cloud_id: &str) -> String {
        lock(&self.shared.objects)
            .objects
            .get(cloud_id)
            .map(|o| o.resource_id.clone())
            .unwrap_or_else(|| cloud_id.to_string())
    }

    fn persist_quietly(&self, objects: &Objects) {
        if let Err(e) = self.persist(objects) {
            tracing::warn!(error = %e, "cannot persist simulated cloud");
        }
    }

    fn persist(&self, objects: &Objects) -> Result<(), ApiError> {
        let Some(path) = &self.shared.persist else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ApiError::Backend(format!("cannot create {}: {}", parent.display(), e)))?;
        }
        let json = serde_json::to_string_pretty(objects)
            .map_err(|e| ApiError::Backend(format!("serialize error: {}", e)))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| ApiError::Backend(format!("cannot write {}: {}", tmp.display(), e)))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| ApiError::Backend(format!("cannot rename {}: {}", tmp.display(), e)))
    }
}

/// A capability handle bound to one provider alias and kind.
pub struct SimulatedHandle {
    cloud: SimulatedCloud,
    provider: String,
    region: String,
    kind: ResourceKind,
}

impl SimulatedHandle {
    fn call(&self, op: ApiOp, resource_id: &str, attributes: Option<&Attributes>) -> Result<(), ApiError> {
        self.cloud.record(ApiCall {
            op,
            kind: self.kind,
            provider: self.provider.clone(),
            resource_id: resource_id.to_string(),
            attributes: attributes.cloned(),
        });
        match self.cloud.take_fault(resource_id, op) {
            Some(message) => Err(ApiError::Rejected {
                kind: self.kind,
                message,
            }),
            None => Ok(()),
        }
    }

    async fn simulate_latency(&self) {
        let latency = self.cloud.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn not_found(&self, cloud_id: &str) -> ApiError {
        ApiError::NotFound {
            kind: self.kind,
            cloud_id: cloud_id.to_string(),
        }
    }
}

#[async_trait]
impl ResourceApi for SimulatedHandle {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn create(&self, resource_id: &str, attributes: &Attributes) -> Result<LiveResource, ApiError> {
        let _flight = self.cloud.enter();
        self.simulate_latency().await;
        self.call(ApiOp::Create, resource_id, Some(attributes))?;

        let mut objects = lock(&self.cloud.shared.objects);
        objects.next_serial += 1;
        let obj = SimObject {
            kind: self.kind,
            provider: self.provider.clone(),
            region: self.region.clone(),
            resource_id: resource_id.to_string(),
            serial: objects.next_serial,
            ready: false,
            declared: attributes.clone(),
            overrides: Attributes::new(),
        };
        let live = live_view(&obj);
        if objects.objects.contains_key(&live.cloud_id) {
            return Err(ApiError::Rejected {
                kind: self.kind,
                message: format!("{} already exists", live.cloud_id),
            });
        }
        objects.objects.insert(live.cloud_id.clone(), obj);
        self.cloud.persist(&objects)?;
        Ok(live)
    }

    async fn read(&self, cloud_id: &str) -> Result<Option<LiveResource>, ApiError> {
        let _flight = self.cloud.enter();
        self.simulate_latency().await;
        self.call(ApiOp::Read, &self.cloud.resource_id_of(cloud_id), None)?;

        let objects = lock(&self.cloud.shared.objects);
        Ok(objects.objects.get(cloud_id).map(live_view))
    }

    async fn update(&self, cloud_id: &str, attributes: &Attributes) -> Result<LiveResource, ApiError> {
        let _flight = self.cloud.enter();
        self.simulate_latency().await;
        self.call(ApiOp::Update, &self.cloud.resource_id_of(cloud_id), Some(attributes))?;

        let mut objects = lock(&self.cloud.shared.objects);
        let previous = objects
            .objects
            .remove(cloud_id)
            .ok_or_else(|| self.not_found(cloud_id))?;
        let mut obj = previous.clone();
        obj.declared = attributes.clone();
        obj.overrides.clear();
        obj.ready = false;
        let live = live_view(&obj);

        // Renaming a resource moves it to its new identifier.
        if objects.objects.contains_key(&live.cloud_id) {
            objects.objects.insert(cloud_id.to_string(), previous);
            return Err(ApiError::Rejected {
                kind: self.kind,
                message: format!("{} already exists", live.cloud_id),
            });
        }
        objects.objects.insert(live.cloud_id.clone(), obj);
        self.cloud.persist(&objects)?;
        Ok(live)
    }

    async fn delete(&self, cloud_id: &str) -> Result<(), ApiError> {
        let _flight = self.cloud.enter();
        self.simulate_latency().await;
        self.call(ApiOp::Delete, &self.cloud.resource_id_of(cloud_id), None)?;

        let mut objects = lock(&self.cloud.shared.objects);
        if objects.objects.remove(cloud_id).is_none() {
            return Err(self.not_found(cloud_id));
        }
        self.cloud.persist(&objects)
    }

    async fn wait_until_ready(&self, cloud_id: &str) -> Result<LiveResource, ApiError> {
        let _flight = self.cloud.enter();
        self.simulate_latency().await;
        let resource_id = self.cloud.resource_id_of(cloud_id);
        self.call(ApiOp::WaitUntilReady, &resource_id, None)?;

        if self.cloud.hangs(&resource_id) {
            return std::future::pending().await;
        }

        let mut objects = lock(&self.cloud.shared.objects);
        let live = {
            let obj = objects
                .objects
                .get_mut(cloud_id)
                .ok_or_else(|| self.not_found(cloud_id))?;
            obj.ready = true;
            live_view(obj)
        };
        self.cloud.persist(&objects)?;
        Ok(live)
    }
}

fn text(attrs: &Attributes, key: &str) -> String {
    attrs
        .get(key)
        .map(crate::core::types::json_value_to_string)
        .unwrap_or_default()
}

/// Declared attributes merged with the kind's generated attributes.
fn live_view(obj: &SimObject) -> LiveResource {
    let serial = obj.serial;
    let region = obj.region.as_str();
    let mut computed = Attributes::new();

    match obj.kind {
        ResourceKind::Bucket => {
            let b = text(&obj.declared, "bucket");
            computed.insert("id".into(), json!(b));
            computed.insert("arn".into(), json!(format!("arn:sim:s3:::{b}")));
            computed.insert("bucket_domain_name".into(), json!(format!("{b}.s3.sim-cloud.test")));
            computed.insert(
                "bucket_regional_domain_name".into(),
                json!(format!("{b}.s3.{region}.sim-cloud.test")),
            );
            computed.insert(
                "website_endpoint".into(),
                json!(format!("{b}.s3-website.{region}.sim-cloud.test")),
            );
        }
        ResourceKind::CdnDistribution => {
            let id = format!("E{serial:012X}");
            computed.insert("arn".into(), json!(format!("arn:sim:cdn::000000000000:distribution/{id}")));
            computed.insert("domain_name".into(), json!(format!("d{serial:012x}.cdn.sim-cloud.test")));
            computed.insert("hosted_zone_id".into(), json!("Z2SIMCDN000000"));
            computed.insert(
                "status".into(),
                json!(if obj.ready { "Deployed" } else { "InProgress" }),
            );
            computed.insert("id".into(), json!(id));
        }
        ResourceKind::DnsZone => {
            let zone_id = format!("Z{serial:010}");
            computed.insert("arn".into(), json!(format!("arn:sim:dns:::hostedzone/{zone_id}")));
            computed.insert(
                "name_servers".into(),
                json!((1..=4).map(|n| format!("ns-{n}.sim-dns.test")).collect::<Vec<_>>()),
            );
            computed.insert("zone_id".into(), json!(zone_id));
        }
        ResourceKind::DnsRecord => {
            let name = text(&obj.declared, "name");
            let fqdn = name.trim_end_matches('.').to_string();
            let id = format!(
                "{}_{}_{}",
                text(&obj.declared, "zone_id"),
                fqdn,
                text(&obj.declared, "record_type")
            );
            computed.insert("fqdn".into(), json!(fqdn));
            computed.insert("id".into(), json!(id));
        }
        ResourceKind::TlsCertificate => {
            let domain = text(&obj.declared, "domain_name");
            let arn = format!("arn:sim:acm:{region}:000000000000:certificate/{serial:08x}");
            computed.insert("arn".into(), json!(arn));
            computed.insert(
                "status".into(),
                json!(if obj.ready { "ISSUED" } else { "PENDING_VALIDATION" }),
            );
            computed.insert(
                "validation_record_name".into(),
                json!(format!("_{serial:08x}.{domain}.")),
            );
            computed.insert("validation_record_type".into(), json!("CNAME"));
            computed.insert(
                "validation_record_value".into(),
                json!(format!("_{:08x}.validations.sim-cloud.test.", serial ^ 0x5a5a_5a5a)),
            );
            computed.insert("id".into(), json!(arn));
        }
        ResourceKind::AccessPolicy => {
            computed.insert(
                "id".into(),
                json!(format!("{}-policy", text(&obj.declared, "bucket"))),
            );
        }
    }

    let cloud_id = match obj.kind {
        ResourceKind::DnsZone => text(&computed, "zone_id"),
        _ => text(&computed, "id"),
    };

    let mut attributes = obj.declared.clone();
    attributes.extend(computed);
    attributes.extend(obj.overrides.clone());
    LiveResource {
        cloud_id,
        attributes,
    }
}
