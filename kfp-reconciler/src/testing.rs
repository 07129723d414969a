//! In-memory collaborators for tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kfp_models::{Databag, Relation, Status};
use kube::api::DynamicObject;

use crate::interfaces::{DATA_KEY, VERSIONS_KEY};
use crate::model::UnitModel;
use crate::resources::{describe, ApplyError, ClusterApi};
use crate::workload::{CheckStatus, Layer, Workload};

fn bag(entries: &[(&str, &str)]) -> Databag {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Structured relation whose remote side speaks v1 and optionally sent `data`
pub fn sdi_relation(name: &str, id: u32, app: &str, data: Option<&str>) -> Relation {
    let mut app_data = bag(&[(VERSIONS_KEY, "- v1\n")]);
    if let Some(data) = data {
        app_data.insert(DATA_KEY.to_string(), data.to_string());
    }
    Relation {
        id,
        name: name.to_string(),
        remote_app: Some(app.to_string()),
        app_data,
        ..Default::default()
    }
}

/// `mysql` relation with one remote unit holding `data`
pub fn legacy_relation(id: u32, data: &[(&str, &str)]) -> Relation {
    Relation {
        id,
        name: "mysql".to_string(),
        remote_app: Some("mysql".to_string()),
        units: BTreeMap::from([("mysql/0".to_string(), bag(data))]),
        ..Default::default()
    }
}

/// `relational-db` relation whose provider answered with `data`
pub fn modern_relation(id: u32, data: &[(&str, &str)]) -> Relation {
    Relation {
        id,
        name: "relational-db".to_string(),
        remote_app: Some("mysql-k8s".to_string()),
        app_data: bag(data),
        ..Default::default()
    }
}

pub struct FakeModel {
    leader: AtomicBool,
    relations: Mutex<BTreeMap<String, Vec<Relation>>>,
    statuses: Mutex<Vec<Status>>,
    writes: AtomicUsize,
}

impl FakeModel {
    pub fn leader() -> Self {
        Self {
            leader: AtomicBool::new(true),
            relations: Mutex::new(BTreeMap::new()),
            statuses: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn follower() -> Self {
        let model = Self::leader();
        model.leader.store(false, Ordering::SeqCst);
        model
    }

    pub fn add_relation(&self, relation: Relation) {
        let mut relations = self.relations.lock().unwrap();
        let entry = relations.entry(relation.name.clone()).or_default();
        entry.push(relation);
        entry.sort_by_key(|r| r.id);
    }

    pub fn relations_snapshot(&self, name: &str) -> Vec<Relation> {
        self.relations.lock().unwrap().get(name).cloned().unwrap_or_default()
    }

    /// Every status set through the model, in order
    pub fn statuses(&self) -> Vec<Status> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn app_data_writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnitModel for FakeModel {
    fn app_name(&self) -> &str {
        "kfp-api"
    }

    fn model_name(&self) -> &str {
        "kubeflow"
    }

    async fn is_leader(&self) -> anyhow::Result<bool> {
        Ok(self.leader.load(Ordering::SeqCst))
    }

    async fn relations(&self, name: &str) -> anyhow::Result<Vec<Relation>> {
        Ok(self.relations_snapshot(name))
    }

    async fn set_app_data(&self, relation: &Relation, data: &Databag) -> anyhow::Result<()> {
        let mut relations = self.relations.lock().unwrap();
        let target = relations
            .get_mut(&relation.name)
            .and_then(|list| list.iter_mut().find(|r| r.id == relation.id))
            .ok_or_else(|| anyhow::anyhow!("relation {} not found", relation.relation_id()))?;
        target.local_app_data.extend(data.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_status(&self, status: &Status) -> anyhow::Result<()> {
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }
}

pub struct FakeWorkload {
    connected: bool,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    plan: Mutex<Layer>,
    replans: AtomicUsize,
    fail_replan: AtomicBool,
    check: Mutex<Option<CheckStatus>>,
}

impl FakeWorkload {
    pub fn connected() -> Self {
        Self {
            connected: true,
            files: Mutex::new(BTreeMap::new()),
            plan: Mutex::new(Layer::default()),
            replans: AtomicUsize::new(0),
            fail_replan: AtomicBool::new(false),
            check: Mutex::new(Some(CheckStatus::Up)),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            connected: false,
            ..Self::connected()
        }
    }

    pub fn set_check(&self, status: Option<CheckStatus>) {
        *self.check.lock().unwrap() = status;
    }

    pub fn set_plan(&self, plan: Layer) {
        *self.plan.lock().unwrap() = plan;
    }

    pub fn fail_replan(&self) {
        self.fail_replan.store(true, Ordering::SeqCst);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn replans(&self) -> usize {
        self.replans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Workload for FakeWorkload {
    async fn can_connect(&self) -> bool {
        self.connected
    }

    async fn push(&self, path: &str, content: &[u8]) -> anyhow::Result<()> {
        self.files.lock().unwrap().insert(path.to_string(), content.to_vec());
        Ok(())
    }

    async fn plan(&self) -> anyhow::Result<Layer> {
        Ok(self.plan.lock().unwrap().clone())
    }

    async fn add_layer(&self, _label: &str, layer: &Layer) -> anyhow::Result<()> {
        let mut plan = self.plan.lock().unwrap();
        plan.services.extend(layer.services.clone());
        plan.checks.extend(layer.checks.clone());
        Ok(())
    }

    async fn replan(&self) -> anyhow::Result<()> {
        self.replans.fetch_add(1, Ordering::SeqCst);
        if self.fail_replan.load(Ordering::SeqCst) {
            anyhow::bail!("change failed");
        }
        Ok(())
    }

    async fn get_check(&self, _name: &str) -> anyhow::Result<Option<CheckStatus>> {
        Ok(*self.check.lock().unwrap())
    }
}

/// Cluster keeping applied objects by `Kind/namespace/name`
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<String, serde_json::Value>>,
    conflicts: Mutex<Vec<String>>,
    forced: Mutex<Vec<String>>,
}

impl FakeCluster {
    /// Report a conflict for non-forced applies of `object`
    pub fn conflict_on(&self, object: &str) {
        self.conflicts.lock().unwrap().push(object.to_string());
    }

    pub fn objects(&self) -> BTreeMap<String, serde_json::Value> {
        self.objects.lock().unwrap().clone()
    }

    pub fn forced_applies(&self) -> Vec<String> {
        self.forced.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn apply(
        &self,
        object: &DynamicObject,
        _field_manager: &str,
        force: bool,
    ) -> Result<(), ApplyError> {
        let key = describe(object);
        if force {
            self.forced.lock().unwrap().push(key.clone());
        } else if self.conflicts.lock().unwrap().contains(&key) {
            return Err(ApplyError::Conflict(key));
        }
        let value = serde_json::to_value(object).map_err(anyhow::Error::from)?;
        self.objects.lock().unwrap().insert(key, value);
        Ok(())
    }

    async fn delete(&self, object: &DynamicObject) -> Result<(), ApplyError> {
        let key = describe(object);
        match self.objects.lock().unwrap().remove(&key) {
            Some(_) => Ok(()),
            None => Err(ApplyError::NotFound(key)),
        }
    }
}
