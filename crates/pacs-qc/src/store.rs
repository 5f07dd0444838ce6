//! 归档状态存储与事务
//!
//! [`ArchiveStore`] 保存已提交的实体图、审计日志和待完成的删除请求。
//! [`Transaction`] 持有一份工作副本，提交时按实体版本号做乐观并发检查：
//! 读取后被他人修改或删除的行、被他人抢先创建的行、被他人抢先占用的 UID
//! 都会使整个事务以 `Conflict` 失败。
//! 未提交就丢弃的事务自动回滚。

use crate::dispatch::DeleteRequest;
use crate::graph::{EntityGraph, GraphSnapshot};
use crate::history::HistoryLog;
use pacs_core::{CodeEntity, Entity, PacsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 归档状态
#[derive(Debug, Clone, Default)]
pub struct ArchiveState {
    pub graph: EntityGraph,
    pub history: HistoryLog,
    pending_deletes: BTreeMap<Uuid, DeleteRequest>,
    /// 本事务产生、提交后才分发的删除请求
    outbox: Vec<DeleteRequest>,
    /// 只读但依赖其版本的患者，提交时同样做版本检查
    patient_reads: BTreeSet<Uuid>,
}

/// 归档状态的可序列化快照
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveSnapshot {
    #[serde(flatten)]
    pub graph: GraphSnapshot,
    #[serde(default)]
    pub history: HistoryLog,
    #[serde(default)]
    pub pending_deletes: Vec<DeleteRequest>,
}

impl ArchiveState {
    pub fn new(graph: EntityGraph) -> Self {
        Self {
            graph,
            ..Default::default()
        }
    }

    pub fn from_snapshot(snapshot: ArchiveSnapshot) -> Result<Self> {
        let mut state = Self::new(EntityGraph::from_snapshot(snapshot.graph)?);
        state.history = snapshot.history;
        for request in snapshot.pending_deletes {
            state.pending_deletes.insert(request.id, request);
        }
        Ok(state)
    }

    pub fn snapshot(&self) -> ArchiveSnapshot {
        ArchiveSnapshot {
            graph: self.graph.snapshot(),
            history: self.history.clone(),
            pending_deletes: self.pending_deletes.values().cloned().collect(),
        }
    }

    pub fn pending_deletes(&self) -> impl Iterator<Item = &DeleteRequest> {
        self.pending_deletes.values()
    }

    pub fn pending_delete(&self, id: Uuid) -> Option<&DeleteRequest> {
        self.pending_deletes.get(&id)
    }

    /// 实例是否属于某个未完成的删除请求
    pub fn is_marked_for_delete(&self, instance_id: Uuid) -> bool {
        self.pending_deletes
            .values()
            .any(|request| request.instances.contains(&instance_id))
    }

    pub(crate) fn stage_delete(&mut self, request: DeleteRequest) {
        self.outbox.push(request.clone());
        self.pending_deletes.insert(request.id, request);
    }

    /// 登记对患者的依赖读取：提交前该患者被并发修改则冲突
    pub(crate) fn guard_patient(&mut self, patient_id: Uuid) {
        self.patient_reads.insert(patient_id);
    }

    pub(crate) fn take_pending_delete(&mut self, id: Uuid) -> Result<DeleteRequest> {
        self.pending_deletes
            .remove(&id)
            .ok_or_else(|| PacsError::not_found(format!("Delete request {}", id)))
    }
}

/// 已提交状态的共享存储
#[derive(Debug, Clone, Default)]
pub struct ArchiveStore {
    state: Arc<RwLock<ArchiveState>>,
}

impl ArchiveStore {
    pub fn new(state: ArchiveState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn from_snapshot(snapshot: ArchiveSnapshot) -> Result<Self> {
        Ok(Self::new(ArchiveState::from_snapshot(snapshot)?))
    }

    pub fn snapshot(&self) -> ArchiveSnapshot {
        self.read(ArchiveState::snapshot)
    }

    /// 在已提交状态上执行只读访问
    pub fn read<T>(&self, f: impl FnOnce(&ArchiveState) -> T) -> T {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&state)
    }

    /// 开启事务
    pub fn begin(&self) -> Transaction {
        let base = self.read(ArchiveState::clone);
        let working = base.clone();
        let tx = Transaction {
            id: Uuid::new_v4(),
            store: self.clone(),
            base,
            working,
            finished: false,
        };
        debug!("Transaction {} started", tx.id);
        tx
    }
}

/// 事务提交结果
#[derive(Debug, Clone, Default)]
pub struct Committed {
    pub transaction: Uuid,
    /// 本事务追加的审计记录
    pub history: Vec<Uuid>,
    /// 待分发的删除请求
    pub deletes: Vec<DeleteRequest>,
}

/// 事务：工作副本 + 提交时的乐观并发检查
#[derive(Debug)]
pub struct Transaction {
    id: Uuid,
    store: ArchiveStore,
    base: ArchiveState,
    working: ArchiveState,
    finished: bool,
}

impl Transaction {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> &ArchiveState {
        &self.working
    }

    pub fn graph(&self) -> &EntityGraph {
        &self.working.graph
    }

    /// 直接修改工作副本（入库路径使用）
    pub fn graph_mut(&mut self) -> &mut EntityGraph {
        &mut self.working.graph
    }

    /// 保存点：闭包失败时工作副本恢复到调用前
    pub fn atomically<T>(&mut self, f: impl FnOnce(&mut ArchiveState) -> Result<T>) -> Result<T> {
        let savepoint = self.working.clone();
        match f(&mut self.working) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.working = savepoint;
                debug!("Transaction {} rolled back to savepoint: {}", self.id, e);
                Err(e)
            }
        }
    }

    /// 提交：全部变更一起生效，或在冲突时全部放弃
    pub fn commit(mut self) -> Result<Committed> {
        self.finished = true;
        let base = std::mem::take(&mut self.base);
        let mut working = std::mem::take(&mut self.working);

        let mut guard = self
            .store
            .state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let committed = &mut *guard;

        let patients = TableDiff::between(&base.graph.patients, &working.graph.patients);
        let studies = TableDiff::between(&base.graph.studies, &working.graph.studies);
        let series = TableDiff::between(&base.graph.series, &working.graph.series);
        let instances = TableDiff::between(&base.graph.instances, &working.graph.instances);
        let locations = TableDiff::between(&base.graph.locations, &working.graph.locations);
        let codes = TableDiff::between(&base.graph.codes, &working.graph.codes);

        let check = patients
            .check(&committed.graph.patients, "Patient")
            .and_then(|_| studies.check(&committed.graph.studies, "Study"))
            .and_then(|_| series.check(&committed.graph.series, "Series"))
            .and_then(|_| instances.check(&committed.graph.instances, "Instance"))
            .and_then(|_| locations.check(&committed.graph.locations, "Location"))
            .and_then(|_| codes.check(&committed.graph.codes, "Code"))
            .and_then(|_| check_new_codes(&codes, &committed.graph.codes))
            .and_then(|_| check_new_uids(&base, &working, committed))
            .and_then(|_| check_patient_reads(&base, &working, committed))
            .and_then(|_| check_pending_deletes(&base, &working, committed));
        if let Err(e) = check {
            warn!("Transaction {} aborted: {}", self.id, e);
            return Err(e);
        }

        let changed_rows = patients.len() + studies.len() + series.len() + instances.len() + locations.len();
        patients.apply(&mut committed.graph.patients);
        studies.apply(&mut committed.graph.studies);
        series.apply(&mut committed.graph.series);
        instances.apply(&mut committed.graph.instances);
        locations.apply(&mut committed.graph.locations);
        codes.apply(&mut committed.graph.codes);
        committed.graph.reindex();

        for id in base.pending_deletes.keys() {
            if !working.pending_deletes.contains_key(id) {
                committed.pending_deletes.remove(id);
            }
        }
        for (id, request) in &working.pending_deletes {
            if !base.pending_deletes.contains_key(id) {
                committed.pending_deletes.insert(*id, request.clone());
            }
        }

        let mut history = Vec::new();
        for record in working.history.since(base.history.len()) {
            history.push(committed.history.append(record.clone()));
        }

        let deletes = std::mem::take(&mut working.outbox);
        info!(
            "Transaction {} committed: {} rows changed, {} history records, {} delete requests",
            self.id,
            changed_rows,
            history.len(),
            deletes.len()
        );
        Ok(Committed {
            transaction: self.id,
            history,
            deletes,
        })
    }

    pub fn rollback(mut self) {
        self.finished = true;
        debug!("Transaction {} rolled back", self.id);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Transaction {} dropped without commit, rolled back", self.id);
        }
    }
}

/// 单表变更集
struct TableDiff<T> {
    /// 新建或修改的行，以及读取时的版本（新建为 None）
    upserts: Vec<(T, Option<u64>)>,
    /// 删除的行及读取时的版本
    removals: Vec<(Uuid, u64)>,
}

impl<T: Entity + Clone> TableDiff<T> {
    fn between(base: &HashMap<Uuid, T>, working: &HashMap<Uuid, T>) -> Self {
        let upserts = working
            .values()
            .filter_map(|row| {
                let read = base.get(&row.id()).map(Entity::version);
                (read != Some(row.version())).then(|| (row.clone(), read))
            })
            .collect();
        let removals = base
            .values()
            .filter(|row| !working.contains_key(&row.id()))
            .map(|row| (row.id(), row.version()))
            .collect();
        Self { upserts, removals }
    }

    fn len(&self) -> usize {
        self.upserts.len() + self.removals.len()
    }

    fn check(&self, committed: &HashMap<Uuid, T>, table: &str) -> Result<()> {
        for (row, read) in &self.upserts {
            if committed.get(&row.id()).map(Entity::version) != *read {
                return Err(PacsError::Conflict(format!("{} {} 已被并发修改", table, row.id())));
            }
        }
        for (id, read) in &self.removals {
            if committed.get(id).map(Entity::version) != Some(*read) {
                return Err(PacsError::Conflict(format!("{} {} 已被并发修改", table, id)));
            }
        }
        Ok(())
    }

    fn apply(self, committed: &mut HashMap<Uuid, T>) {
        for (row, _) in self.upserts {
            committed.insert(row.id(), row);
        }
        for (id, _) in self.removals {
            committed.remove(&id);
        }
    }
}

/// 并发登记的同值编码会分裂编码表
fn check_new_codes(codes: &TableDiff<CodeEntity>, committed: &HashMap<Uuid, CodeEntity>) -> Result<()> {
    for (code, read) in &codes.upserts {
        if read.is_none()
            && committed
                .values()
                .any(|existing| existing.id != code.id && existing.code.same_code(&code.code))
        {
            return Err(PacsError::Conflict(format!("编码 {} 已被并发登记", code.code)));
        }
    }
    Ok(())
}

/// 本事务新建的检查/系列/实例 UID 不能已被并发事务占用
fn check_new_uids(base: &ArchiveState, working: &ArchiveState, committed: &ArchiveState) -> Result<()> {
    let (base, working, committed) = (&base.graph, &working.graph, &committed.graph);
    for study in working.studies.values().filter(|s| !base.studies.contains_key(&s.id)) {
        if let Some(existing) = committed.find_study(&study.study_uid) {
            if existing.id != study.id && !base.studies.contains_key(&existing.id) {
                return Err(PacsError::Conflict(format!("检查 {} 已被并发创建", study.study_uid)));
            }
        }
    }
    for series in working.series.values().filter(|s| !base.series.contains_key(&s.id)) {
        if let Some(existing) = committed.find_series(&series.series_uid) {
            if existing.id != series.id && !base.series.contains_key(&existing.id) {
                return Err(PacsError::Conflict(format!("系列 {} 已被并发创建", series.series_uid)));
            }
        }
    }
    for instance in working.instances.values().filter(|i| !base.instances.contains_key(&i.id)) {
        if let Some(existing) = committed.find_instance(&instance.sop_instance_uid) {
            if existing.id != instance.id && !base.instances.contains_key(&existing.id) {
                return Err(PacsError::Conflict(format!("实例 {} 已被并发创建", instance.sop_instance_uid)));
            }
        }
    }
    Ok(())
}

fn check_patient_reads(base: &ArchiveState, working: &ArchiveState, committed: &ArchiveState) -> Result<()> {
    for id in &working.patient_reads {
        let read = base.graph.patients.get(id).map(Entity::version);
        if committed.graph.patients.get(id).map(Entity::version) != read {
            return Err(PacsError::Conflict(format!("患者 {} 已被并发修改", id)));
        }
    }
    Ok(())
}

fn check_pending_deletes(base: &ArchiveState, working: &ArchiveState, committed: &ArchiveState) -> Result<()> {
    for id in base.pending_deletes.keys() {
        if !working.pending_deletes.contains_key(id) && !committed.pending_deletes.contains_key(id) {
            return Err(PacsError::Conflict(format!("删除请求 {} 已被并发完成", id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_core::{Attributes, IdWithIssuer, Patient, StudyUid};

    fn store_with_study() -> (ArchiveStore, Uuid) {
        let store = ArchiveStore::default();
        let mut tx = store.begin();
        let patient = tx
            .graph_mut()
            .add_patient(Patient::new(IdWithIssuer::new("P001", None), Attributes::new()))
            .unwrap();
        let study = tx.graph_mut().create_study(patient, StudyUid::new("1.2"), Attributes::new()).unwrap();
        tx.commit().unwrap();
        (store, study)
    }

    #[test]
    fn test_commit_applies_and_drop_rolls_back() {
        let (store, study) = store_with_study();
        assert_eq!(store.read(|s| s.graph.counts().studies), 1);

        {
            let mut tx = store.begin();
            tx.graph_mut().study_mut(study).unwrap().attributes.set("StudyDescription", "dropped");
        }
        assert!(store.read(|s| s.graph.study(study).unwrap().description().is_none()));
    }

    #[test]
    fn test_concurrent_update_conflicts() {
        let (store, study) = store_with_study();
        let mut first = store.begin();
        let mut second = store.begin();
        first.graph_mut().study_mut(study).unwrap().attributes.set("StudyDescription", "first");
        second.graph_mut().study_mut(study).unwrap().attributes.set("StudyDescription", "second");

        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert!(matches!(err, PacsError::Conflict(_)));
        assert!(err.is_retryable());
        assert_eq!(store.read(|s| s.graph.study(study).unwrap().description().map(str::to_string)), Some("first".to_string()));
    }

    #[test]
    fn test_concurrent_create_with_same_uid_conflicts() {
        let (store, study) = store_with_study();
        let patient = store.read(|s| s.graph.study(study).unwrap().patient_id);
        let mut first = store.begin();
        let mut second = store.begin();
        first.graph_mut().create_study(patient, StudyUid::new("1.3"), Attributes::new()).unwrap();
        second.graph_mut().create_study(patient, StudyUid::new("1.3"), Attributes::new()).unwrap();

        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert!(matches!(err, PacsError::Conflict(_)));
        assert_eq!(store.read(|s| s.graph.counts().studies), 2);
    }

    #[test]
    fn test_guarded_patient_read_conflicts() {
        let (store, study) = store_with_study();
        let patient = store.read(|s| s.graph.study(study).unwrap().patient_id);
        let mut reader = store.begin();
        reader
            .atomically(|state| {
                state.guard_patient(patient);
                Ok(())
            })
            .unwrap();

        let mut writer = store.begin();
        writer.graph_mut().patient_mut(patient).unwrap().attributes.set("PatientName", "Wang^Wu");
        writer.commit().unwrap();

        assert!(matches!(reader.commit(), Err(PacsError::Conflict(_))));
    }

    #[test]
    fn test_atomically_restores_working_copy() {
        let (store, study) = store_with_study();
        let mut tx = store.begin();
        let result: Result<()> = tx.atomically(|state| {
            state.graph.study_mut(study)?.attributes.set("StudyDescription", "partial");
            Err(PacsError::not_permitted("abort"))
        });
        assert!(result.is_err());
        assert!(tx.graph().study(study).unwrap().description().is_none());

        let committed = tx.commit().unwrap();
        assert!(committed.history.is_empty());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (store, _) = store_with_study();
        let json = serde_json::to_string(&store.snapshot()).unwrap();
        let restored = ArchiveStore::from_snapshot(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(restored.read(|s| s.graph.counts()), store.read(|s| s.graph.counts()));
    }
}
