//! 结构变更引擎
//!
//! 合并、拆分、分段、拒绝/恢复、删除、属性更新、患者身份操作和替换对账。
//! 每个操作都在 [`Transaction::atomically`] 中执行：先校验前置条件，再修改实体图，
//! 回收触及的空容器，最后追加审计记录并返回 [`QcOperationContext`]。
//! 任何一步失败时工作副本恢复原状。

use crate::command::{MergeRequest, PatientOperationRequest, SegmentRequest, SplitRequest};
use crate::context::{ClonedInstance, QcOperationContext, QcRequest, ReplacedInstance};
use crate::dispatch::{DeleteDispatcher, DeleteRequest, DeleteScope};
use crate::graph::EntityGraph;
use crate::history::{
    InstanceHistory, PatientCommand, PatientRecord, QcOperation, QcUpdateHistory, UpdateRecord, UpdateScope,
};
use crate::identity::{GraphPatientService, PatientIdentityService};
use crate::merge_path::MergePathResolver;
use crate::query_attributes::QueryAttributesCalculator;
use crate::reaper::EmptinessReaper;
use crate::rejection::RejectionLedger;
use crate::store::{ArchiveState, ArchiveStore, Committed, Transaction};
use pacs_core::utils::generate_dicom_uid_with_root;
use pacs_core::{
    keywords, Attributes, Code, IdWithIssuer, Instance, PacsError, Patient, Result, SeriesQueryAttributes, SeriesUid,
    SopInstanceUid, StudyQueryAttributes, StudyUid,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const STUDY_IDENTITY: &[&str] = &[keywords::STUDY_INSTANCE_UID];
const SERIES_IDENTITY: &[&str] = &[keywords::SERIES_INSTANCE_UID, keywords::STUDY_INSTANCE_UID];
const UID_KEYWORDS: &[&str] = &[
    keywords::STUDY_INSTANCE_UID,
    keywords::SERIES_INSTANCE_UID,
    keywords::SOP_INSTANCE_UID,
];
const PATIENT_IDENTITY: &[&str] = &[
    keywords::PATIENT_ID,
    keywords::ISSUER_OF_PATIENT_ID,
    keywords::ISSUER_UNIVERSAL_ENTITY_ID,
    keywords::ISSUER_UNIVERSAL_ENTITY_ID_TYPE,
];

/// 结构变更引擎
pub struct StructuralChangeEngine {
    identity: Arc<dyn PatientIdentityService>,
    dispatcher: Arc<dyn DeleteDispatcher>,
}

impl StructuralChangeEngine {
    pub fn new(dispatcher: Arc<dyn DeleteDispatcher>) -> Self {
        Self {
            identity: Arc::new(GraphPatientService),
            dispatcher,
        }
    }

    pub fn with_identity_service(mut self, identity: Arc<dyn PatientIdentityService>) -> Self {
        self.identity = identity;
        self
    }

    /// 提交事务，并把事务中产生的删除请求交给分发器
    ///
    /// 分发失败不影响已提交的状态，请求保持待完成，可通过 [`Self::redispatch_pending`] 重发。
    pub fn commit(&self, tx: Transaction) -> Result<Committed> {
        let committed = tx.commit()?;
        for request in &committed.deletes {
            if let Err(e) = self.dispatcher.dispatch(request) {
                error!("Failed to dispatch delete request {}: {}", request.id, e);
            }
        }
        Ok(committed)
    }

    /// 重新分发全部未完成的删除请求
    pub fn redispatch_pending(&self, store: &ArchiveStore) -> Result<usize> {
        let pending: Vec<DeleteRequest> = store.read(|state| state.pending_deletes().cloned().collect());
        for request in &pending {
            self.dispatcher.dispatch(request)?;
        }
        Ok(pending.len())
    }

    // ========== 查询辅助 ==========

    /// 实例可见且不在待删除请求中
    pub fn can_apply_qc(&self, tx: &Transaction, uid: &SopInstanceUid) -> Result<bool> {
        let state = tx.state();
        qc_applicable(state, state.graph.instance_by_uid(uid)?.id)
    }

    pub fn locate_instances<'t>(&self, tx: &'t Transaction, uids: &[SopInstanceUid]) -> Result<Vec<&'t Instance>> {
        uids.iter().map(|uid| tx.graph().instance_by_uid(uid)).collect()
    }

    /// 按 PatientID / IssuerOfPatientID 属性查找患者
    pub fn find_patient<'t>(&self, tx: &'t Transaction, attrs: &Attributes) -> Result<&'t Patient> {
        find_patient_by_attrs(tx.graph(), attrs)
    }

    /// 检查的派生查询属性，缓存缺失时重新计算并回填到工作副本
    pub fn study_query_attributes(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        uid: &StudyUid,
    ) -> Result<StudyQueryAttributes> {
        let graph = tx.graph_mut();
        let study_id = graph.study_by_uid(uid)?.id;
        QueryAttributesCalculator::study(graph, study_id, &req.config.query)
    }

    pub fn series_query_attributes(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        uid: &SeriesUid,
    ) -> Result<SeriesQueryAttributes> {
        let graph = tx.graph_mut();
        let series_id = graph.series_by_uid(uid)?.id;
        QueryAttributesCalculator::series(graph, series_id, &req.config.query)
    }

    // ========== 合并 ==========

    /// 把一个源检查合并到目标检查
    pub fn merge(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        source: &StudyUid,
        target: &StudyUid,
        reason: Option<&Code>,
    ) -> Result<QcOperationContext> {
        let request = MergeRequest {
            sources: vec![source.clone()],
            target: target.clone(),
            study_attrs: Attributes::new(),
            series_attrs: Attributes::new(),
            reason: reason.cloned(),
        };
        self.merge_studies(tx, req, &request)
    }

    /// 把多个源检查合并到目标检查
    ///
    /// 源检查和目标检查必须解析到同一患者。只移动可见实例：没有被拒绝实例的源系列整体
    /// 重挂到目标检查；`series_attrs` 带 SeriesInstanceUID 时可见实例全部进入该系列
    /// （目标检查中已有或新建），否则仍留有被拒绝实例的源系列把可见实例移到新建系列。
    pub fn merge_studies(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        request: &MergeRequest,
    ) -> Result<QcOperationContext> {
        tx.atomically(|state| {
            if request.sources.is_empty() {
                return Err(PacsError::not_permitted("未指定源检查"));
            }
            let target = state.graph.study_by_uid(&request.target)?;
            let (target_id, target_owner) = (target.id, target.patient_id);
            let target_patient = MergePathResolver::resolve(&state.graph, target_owner)?.id;

            let mut sources = Vec::new();
            for uid in &request.sources {
                let source = state.graph.study_by_uid(uid)?;
                if source.id == target_id {
                    return Err(PacsError::not_permitted(format!("检查 {} 不能合并到自身", uid)));
                }
                if !MergePathResolver::same_patient(&state.graph, source.patient_id, target_owner)? {
                    warn!("Refused merge of study {} into {}: different patients", uid, request.target);
                    return Err(PacsError::not_permitted(format!(
                        "检查 {} 与目标检查 {} 不属于同一患者",
                        uid, request.target
                    )));
                }
                push_unique(&mut sources, source.id);
            }

            let mut changes = Changes::new(QcOperation::Merge, req);
            changes.context.target_study = Some(request.target.clone());
            changes.context.patients.push(state.graph.patient(target_patient)?.pid.clone());
            if let Some(reason) = &request.reason {
                changes.register_code(&mut state.graph, reason)?;
            }

            let first_source = state.graph.study(sources[0])?.attributes.clone();
            apply_study_override(&mut state.graph, &mut changes, target_id, &request.study_attrs, &first_source)?;

            let requested_series = request.series_attrs.contains(keywords::SERIES_INSTANCE_UID);
            let mut cache = HashMap::new();
            let mut touched_series = Vec::new();
            for source_id in &sources {
                for series_id in state.graph.series_of_study(*source_id) {
                    let all = state.graph.instances_of_series(series_id);
                    let mut movable = Vec::new();
                    for id in &all {
                        if qc_applicable(state, *id)? {
                            movable.push(*id);
                        }
                    }
                    if movable.is_empty() {
                        continue;
                    }

                    if requested_series || movable.len() != all.len() {
                        let target_series = target_series_for(
                            &mut state.graph,
                            &mut changes,
                            target_id,
                            series_id,
                            &request.series_attrs,
                            &req.config.uid.root,
                            &mut cache,
                        )?;
                        move_instances(&mut state.graph, &mut changes, &movable, target_series)?;
                        push_unique(&mut touched_series, series_id);
                    } else {
                        let mut befores = Vec::new();
                        for id in &movable {
                            befores.push(placement(&state.graph, *id)?);
                        }
                        state.graph.move_series(series_id, target_id)?;
                        apply_series_override(
                            &mut state.graph,
                            &mut changes,
                            series_id,
                            &request.series_attrs,
                            &Attributes::new(),
                        )?;
                        for (before, id) in befores.into_iter().zip(movable) {
                            let after = placement(&state.graph, id)?;
                            changes.record(before, after, false);
                        }
                        changes.context.moved_series.push(state.graph.series(series_id)?.series_uid.clone());
                    }
                }
            }

            let reaped = EmptinessReaper::reap_touched(&mut state.graph, &touched_series, &sources)?;
            changes.context.reaped.extend(reaped);
            Ok(changes.finish(state))
        })
    }

    // ========== 拆分 / 分段 ==========

    /// 把同一检查中的实例移到目标检查，目标检查不存在时在患者下创建
    pub fn split(&self, tx: &mut Transaction, req: &QcRequest<'_>, request: &SplitRequest) -> Result<QcOperationContext> {
        tx.atomically(|state| {
            let ids = qc_candidates(state, &request.instances)?;
            let source_study = single_source_study(&state.graph, &ids)?;
            let patient = authoritative_patient(&state.graph, &request.patient)?;
            check_source_patient(&state.graph, source_study, patient)?;
            if state.graph.study(source_study)?.study_uid == request.target {
                return Err(PacsError::not_permitted(format!("目标检查 {} 与源检查相同", request.target)));
            }

            let mut changes = Changes::new(QcOperation::Split, req);
            changes.context.target_study = Some(request.target.clone());
            changes.context.patients.push(state.graph.patient(patient)?.pid.clone());
            if let Some(reason) = &request.reason {
                changes.register_code(&mut state.graph, reason)?;
            }

            let (target_id, _) = prepare_target_study(
                &mut state.graph,
                &mut changes,
                &request.target,
                patient,
                &request.created_study_attrs,
            )?;

            let mut cache = HashMap::new();
            let mut touched_series = Vec::new();
            for id in &ids {
                let source_series = state.graph.instance(*id)?.series_id;
                let target_series = target_series_for(
                    &mut state.graph,
                    &mut changes,
                    target_id,
                    source_series,
                    &request.series_attrs,
                    &req.config.uid.root,
                    &mut cache,
                )?;
                move_instances(&mut state.graph, &mut changes, &[*id], target_series)?;
                push_unique(&mut touched_series, source_series);
            }

            let reaped = EmptinessReaper::reap_touched(&mut state.graph, &touched_series, &[source_study])?;
            changes.context.reaped.extend(reaped);
            Ok(changes.finish(state))
        })
    }

    /// 移动 `to_move`，并把 `to_clone` 克隆（新UID、共享存储位置）到同一目标检查
    ///
    /// 两组实例各自必须来自同一检查，且不能重叠。
    pub fn segment(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        request: &SegmentRequest,
    ) -> Result<QcOperationContext> {
        tx.atomically(|state| {
            if request.to_move.is_empty() && request.to_clone.is_empty() {
                return Err(PacsError::not_permitted("未指定要移动或克隆的实例"));
            }
            if let Some(uid) = request.to_move.iter().find(|uid| request.to_clone.contains(uid)) {
                return Err(PacsError::not_permitted(format!("实例 {} 不能同时移动和克隆", uid)));
            }

            let move_ids = if request.to_move.is_empty() {
                Vec::new()
            } else {
                qc_candidates(state, &request.to_move)?
            };
            let clone_ids = if request.to_clone.is_empty() {
                Vec::new()
            } else {
                qc_candidates(state, &request.to_clone)?
            };
            let move_study = match move_ids.is_empty() {
                true => None,
                false => Some(single_source_study(&state.graph, &move_ids)?),
            };
            let clone_study = match clone_ids.is_empty() {
                true => None,
                false => Some(single_source_study(&state.graph, &clone_ids)?),
            };

            let patient = authoritative_patient(&state.graph, &request.patient)?;
            for study in move_study.iter().chain(clone_study.iter()) {
                check_source_patient(&state.graph, *study, patient)?;
            }
            if let Some(study) = move_study {
                if state.graph.study(study)?.study_uid == request.target {
                    return Err(PacsError::not_permitted(format!("目标检查 {} 与源检查相同", request.target)));
                }
            }

            let mut changes = Changes::new(QcOperation::Segment, req);
            changes.context.target_study = Some(request.target.clone());
            changes.context.patients.push(state.graph.patient(patient)?.pid.clone());
            if let Some(reason) = &request.reason {
                changes.register_code(&mut state.graph, reason)?;
            }

            let source_study = move_study
                .or(clone_study)
                .ok_or_else(|| PacsError::Internal("分段缺少源检查".to_string()))?;
            let source_attrs = state.graph.study(source_study)?.attributes.clone();
            let (target_id, created) =
                prepare_target_study(&mut state.graph, &mut changes, &request.target, patient, &request.study_attrs)?;
            if !created {
                apply_study_override(&mut state.graph, &mut changes, target_id, &request.study_attrs, &source_attrs)?;
            }

            let mut cache = HashMap::new();
            let mut touched_series = Vec::new();
            for id in &move_ids {
                let source_series = state.graph.instance(*id)?.series_id;
                let target_series = target_series_for(
                    &mut state.graph,
                    &mut changes,
                    target_id,
                    source_series,
                    &request.series_attrs,
                    &req.config.uid.root,
                    &mut cache,
                )?;
                move_instances(&mut state.graph, &mut changes, &[*id], target_series)?;
                push_unique(&mut touched_series, source_series);
            }

            for id in &clone_ids {
                let source_series = state.graph.instance(*id)?.series_id;
                let target_series = target_series_for(
                    &mut state.graph,
                    &mut changes,
                    target_id,
                    source_series,
                    &request.series_attrs,
                    &req.config.uid.root,
                    &mut cache,
                )?;
                let before = placement(&state.graph, *id)?;
                let new_uid = SopInstanceUid::new(generate_dicom_uid_with_root(&req.config.uid.root));
                let clone_id = state.graph.clone_instance(*id, target_series, new_uid)?;
                let after = placement(&state.graph, clone_id)?;
                changes.record(before, after, true);
            }

            let move_studies: Vec<Uuid> = move_study.into_iter().collect();
            let reaped = EmptinessReaper::reap_touched(&mut state.graph, &touched_series, &move_studies)?;
            changes.context.reaped.extend(reaped);
            Ok(changes.finish(state))
        })
    }

    // ========== 拒绝 / 恢复 ==========

    /// 拒绝实例，未指定原因时使用配置的质控拒绝编码
    pub fn reject(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        uids: &[SopInstanceUid],
        reason: Option<&Code>,
    ) -> Result<QcOperationContext> {
        tx.atomically(|state| {
            let ids = locate_ids(&state.graph, uids)?;
            let code = match reason {
                Some(code) => code.clone(),
                None => req.config.rejection.qc_code()?,
            };

            let mut changes = Changes::new(QcOperation::Reject, req);
            let code_id = changes.register_code(&mut state.graph, &code)?;
            for id in RejectionLedger::reject(&mut state.graph, &ids, code_id)? {
                let at = placement(&state.graph, id)?;
                changes.context.rejected.push(at.uid.clone());
                changes.record_in_place(at);
            }
            Ok(changes.finish(state))
        })
    }

    pub fn restore(&self, tx: &mut Transaction, req: &QcRequest<'_>, uids: &[SopInstanceUid]) -> Result<QcOperationContext> {
        tx.atomically(|state| {
            let ids = locate_ids(&state.graph, uids)?;
            if let Some(id) = ids.iter().find(|id| state.is_marked_for_delete(**id)) {
                return Err(PacsError::not_permitted(format!("实例 {} 正在等待删除", id)));
            }

            let mut changes = Changes::new(QcOperation::Restore, req);
            for id in RejectionLedger::restore(&mut state.graph, &ids)? {
                let at = placement(&state.graph, id)?;
                changes.context.restored.push(at.uid.clone());
                changes.record_in_place(at);
            }
            Ok(changes.finish(state))
        })
    }

    // ========== 删除 ==========

    pub fn delete_instance(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        uid: &SopInstanceUid,
        reason: Option<&Code>,
    ) -> Result<QcOperationContext> {
        self.mark_for_delete(tx, req, DeleteScope::Instance(uid.clone()), reason)
    }

    pub fn delete_series(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        uid: &SeriesUid,
        reason: Option<&Code>,
    ) -> Result<QcOperationContext> {
        self.mark_for_delete(tx, req, DeleteScope::Series(uid.clone()), reason)
    }

    pub fn delete_study(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        uid: &StudyUid,
        reason: Option<&Code>,
    ) -> Result<QcOperationContext> {
        self.mark_for_delete(tx, req, DeleteScope::Study(uid.clone()), reason)
    }

    pub fn delete_patient(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        pid: &IdWithIssuer,
        reason: Option<&Code>,
    ) -> Result<QcOperationContext> {
        self.mark_for_delete(tx, req, DeleteScope::Patient(pid.clone()), reason)
    }

    /// 给范围内的实例挂上删除编码墓碑并登记删除请求，提交后分发
    fn mark_for_delete(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        scope: DeleteScope,
        reason: Option<&Code>,
    ) -> Result<QcOperationContext> {
        tx.atomically(|state| {
            let (in_scope, patient_id) = match &scope {
                DeleteScope::Instance(uid) => (vec![state.graph.instance_by_uid(uid)?.id], None),
                DeleteScope::Series(uid) => {
                    let series_id = state.graph.series_by_uid(uid)?.id;
                    (state.graph.instances_of_series(series_id), None)
                }
                DeleteScope::Study(uid) => {
                    let study_id = state.graph.study_by_uid(uid)?.id;
                    (state.graph.instances_of_study(study_id), None)
                }
                DeleteScope::Patient(pid) => {
                    let patient_id = authoritative_patient(&state.graph, pid)?;
                    (state.graph.instances_of_patient(patient_id), Some(patient_id))
                }
            };
            let scope_size = in_scope.len();
            let instance_ids: Vec<Uuid> = in_scope
                .into_iter()
                .filter(|id| !state.is_marked_for_delete(*id))
                .collect();
            if scope_size > 0 && instance_ids.is_empty() {
                debug!("All {} instances of {:?} already pending delete", scope_size, scope);
                return Ok(QcOperationContext::new(QcOperation::Delete, req.trigger));
            }
            let code = match reason {
                Some(code) => code.clone(),
                None => req.config.rejection.delete_code()?,
            };

            let mut changes = Changes::new(QcOperation::Delete, req);
            let code_id = changes.register_code(&mut state.graph, &code)?;
            let rejected = RejectionLedger::reject(&mut state.graph, &instance_ids, code_id)?;

            let mut request = DeleteRequest::new(scope.clone(), code_id, req.trigger);
            request.patient_id = patient_id;
            for id in &instance_ids {
                let at = placement(&state.graph, *id)?;
                request.instance_uids.push(at.uid.clone());
                changes.context.marked_for_delete.push(at.uid.clone());
                if rejected.contains(id) {
                    changes.context.rejected.push(at.uid.clone());
                }
                changes.record_in_place(at);
            }
            request.instances = instance_ids;
            if let Some(patient_id) = patient_id {
                changes.context.patients.push(state.graph.patient(patient_id)?.pid.clone());
            }
            changes.context.delete_request = Some(request.id);
            info!(
                "Marked {} instances for delete request {} ({:?})",
                request.instances.len(),
                request.id,
                request.scope
            );
            state.stage_delete(request);
            Ok(changes.finish(state))
        })
    }

    /// 删除分发器的完成回调：删除被标记的实例及不再被引用的存储位置，然后回收空容器
    pub fn complete_delete(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        request_id: Uuid,
    ) -> Result<QcOperationContext> {
        tx.atomically(|state| {
            let request = state.take_pending_delete(request_id)?;
            let mut changes = Changes::new(QcOperation::Delete, req);
            changes.context.delete_request = Some(request.id);
            let code = state.graph.code(request.reason_code)?;
            changes.context.rejection_code = Some(code.code.clone());
            changes.history.rejection_code = Some(code.id);

            let mut touched_series = Vec::new();
            let mut touched_studies = Vec::new();
            for id in &request.instances {
                let Ok(instance) = state.graph.instance(*id) else {
                    continue;
                };
                let series_id = instance.series_id;
                let at = placement(&state.graph, *id)?;
                let (_, orphaned) = state.graph.remove_instance(*id)?;
                debug!("Removed instance {} and {} orphaned locations", at.uid, orphaned.len());
                changes.context.deleted_instances.push(at.uid.clone());
                changes.record_in_place(at);
                push_unique(&mut touched_series, series_id);
            }

            match &request.scope {
                DeleteScope::Instance(_) => {}
                DeleteScope::Series(uid) => {
                    if let Some(series) = state.graph.find_series(uid) {
                        push_unique(&mut touched_series, series.id);
                    }
                }
                DeleteScope::Study(uid) => {
                    if let Some(study) = state.graph.find_study(uid) {
                        let study_id = study.id;
                        for series_id in state.graph.series_of_study(study_id) {
                            push_unique(&mut touched_series, series_id);
                        }
                        push_unique(&mut touched_studies, study_id);
                    }
                }
                DeleteScope::Patient(_) => {
                    if let Some(patient_id) = request.patient_id {
                        for study_id in state.graph.studies_of_patient(patient_id) {
                            for series_id in state.graph.series_of_study(study_id) {
                                push_unique(&mut touched_series, series_id);
                            }
                            push_unique(&mut touched_studies, study_id);
                        }
                    }
                }
            }

            let reaped = EmptinessReaper::reap_touched(&mut state.graph, &touched_series, &touched_studies)?;
            changes.context.reaped.extend(reaped);

            if let Some(patient_id) = request.patient_id {
                if removable_patient(&state.graph, patient_id) {
                    let patient = state.graph.remove_patient(patient_id)?;
                    info!("Removed patient {} after delete request {}", patient.pid, request.id);
                    changes.context.deleted_patients.push(patient.pid);
                }
            }
            Ok(changes.finish(state))
        })
    }

    /// 系列为空时删除并级联回收检查，返回是否发生了删除
    pub fn delete_series_if_empty(&self, tx: &mut Transaction, req: &QcRequest<'_>, uid: &SeriesUid) -> Result<bool> {
        Ok(self.reap_series_if_empty(tx, req, uid)?.is_some())
    }

    pub fn delete_study_if_empty(&self, tx: &mut Transaction, req: &QcRequest<'_>, uid: &StudyUid) -> Result<bool> {
        Ok(self.reap_study_if_empty(tx, req, uid)?.is_some())
    }

    pub fn delete_patient_if_empty(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        pid: &IdWithIssuer,
    ) -> Result<bool> {
        Ok(self.reap_patient_if_empty(tx, req, pid)?.is_some())
    }

    pub(crate) fn reap_series_if_empty(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        uid: &SeriesUid,
    ) -> Result<Option<QcOperationContext>> {
        tx.atomically(|state| {
            let series_id = state.graph.series_by_uid(uid)?.id;
            if !state.graph.instances_of_series(series_id).is_empty() {
                return Ok(None);
            }
            let mut changes = Changes::new(QcOperation::Delete, req);
            changes.context.reaped = EmptinessReaper::reap_series(&mut state.graph, series_id)?;
            Ok(Some(changes.finish(state)))
        })
    }

    pub(crate) fn reap_study_if_empty(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        uid: &StudyUid,
    ) -> Result<Option<QcOperationContext>> {
        tx.atomically(|state| {
            let study_id = state.graph.study_by_uid(uid)?.id;
            if !state.graph.series_of_study(study_id).is_empty() {
                return Ok(None);
            }
            let mut changes = Changes::new(QcOperation::Delete, req);
            changes.context.reaped = EmptinessReaper::reap_study(&mut state.graph, study_id)?;
            Ok(Some(changes.finish(state)))
        })
    }

    /// 按患者记录本身判断，不沿合并路径解析
    pub(crate) fn reap_patient_if_empty(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        pid: &IdWithIssuer,
    ) -> Result<Option<QcOperationContext>> {
        tx.atomically(|state| {
            let patient_id = find_patient_by_pid(&state.graph, pid)?.id;
            if !removable_patient(&state.graph, patient_id) {
                return Ok(None);
            }
            let mut changes = Changes::new(QcOperation::Delete, req);
            let patient = state.graph.remove_patient(patient_id)?;
            changes.context.deleted_patients.push(patient.pid);
            Ok(Some(changes.finish(state)))
        })
    }

    // ========== 属性更新 ==========

    /// 给范围内的实体打属性补丁，审计记录保存原值
    pub fn update_dicom_object(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        scope: &UpdateScope,
        attributes: &Attributes,
    ) -> Result<QcOperationContext> {
        tx.atomically(|state| {
            if attributes.is_empty() {
                return Err(PacsError::not_permitted("未提供要更新的属性"));
            }
            if let Some(keyword) = UID_KEYWORDS.iter().find(|k| attributes.contains(k)) {
                return Err(PacsError::not_permitted(format!("不能通过属性更新修改 {}", keyword)));
            }
            if matches!(scope, UpdateScope::Patient(_)) {
                if let Some(keyword) = PATIENT_IDENTITY.iter().find(|k| attributes.contains(k)) {
                    return Err(PacsError::not_permitted(format!("{} 只能通过患者ID更新修改", keyword)));
                }
            }

            let target = resolve_scope(state, scope)?;
            let mut next = scope_attributes(&state.graph, &target)?.clone();
            let prior = next.apply_patch(attributes);

            let mut changes = Changes::new(QcOperation::Update, req);
            if !prior.is_empty() {
                write_scope_attributes(&mut state.graph, &target, next)?;
                changes.context.updated_attributes = prior.keys().cloned().collect();
                changes.history.update = Some(UpdateRecord {
                    scope: scope.clone(),
                    prior,
                    applied: attributes.clone(),
                });
            }
            debug!("Updated {} attributes on {}", changes.context.updated_attributes.len(), scope);
            Ok(changes.finish(state))
        })
    }

    /// 按审计记录中的原值撤销一次属性更新
    pub fn revert_update(&self, tx: &mut Transaction, req: &QcRequest<'_>, history_id: Uuid) -> Result<QcOperationContext> {
        tx.atomically(|state| {
            let record = state
                .history
                .get(history_id)
                .ok_or_else(|| PacsError::not_found(format!("QC history {}", history_id)))?;
            let update = record
                .update
                .clone()
                .ok_or_else(|| PacsError::not_permitted(format!("审计记录 {} 不是属性更新", history_id)))?;
            if state.history.records().iter().any(|r| r.reverts == Some(history_id)) {
                return Err(PacsError::not_permitted(format!("属性更新 {} 已被撤销", history_id)));
            }

            let target = resolve_scope(state, &update.scope)?;
            let current = scope_attributes(&state.graph, &target)?.clone();
            let mut next = current.clone();
            next.revert_patch(&update.prior);

            let prior: BTreeMap<String, Option<String>> = update
                .prior
                .iter()
                .filter(|(keyword, value)| current.get(keyword) != value.as_deref())
                .map(|(keyword, _)| (keyword.clone(), current.get(keyword).map(str::to_string)))
                .collect();
            let applied: Attributes = update
                .prior
                .iter()
                .filter_map(|(keyword, value)| value.clone().map(|value| (keyword.clone(), value)))
                .collect();

            let mut changes = Changes::new(QcOperation::Update, req);
            changes.history.reverts = Some(history_id);
            if !prior.is_empty() {
                write_scope_attributes(&mut state.graph, &target, next)?;
                changes.context.updated_attributes = prior.keys().cloned().collect();
                changes.history.update = Some(UpdateRecord {
                    scope: update.scope.clone(),
                    prior,
                    applied,
                });
            }
            Ok(changes.finish(state))
        })
    }

    // ========== 患者身份 ==========

    /// 关联、解除关联、合并患者或更新患者ID
    pub fn patient_operation(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        request: &PatientOperationRequest,
    ) -> Result<QcOperationContext> {
        tx.atomically(|state| {
            let source = find_patient_by_attrs(&state.graph, &request.source)?;
            let source_id = source.id;
            let source_pid = source.pid.clone();
            let mut changes = Changes::new(QcOperation::PatientOperation, req);

            let (target_pid, moved_studies) = match request.command {
                PatientCommand::Link | PatientCommand::Unlink => {
                    let target_id = find_patient_by_attrs(&state.graph, &request.target)?.id;
                    let source = resolve_guarded(state, source_id)?;
                    let target = resolve_guarded(state, target_id)?;
                    let target_pid = state.graph.patient(target)?.pid.clone();
                    if source == target {
                        return Err(PacsError::not_permitted(format!(
                            "患者 {} 与 {} 是同一患者",
                            source_pid, target_pid
                        )));
                    }
                    let changed = match request.command {
                        PatientCommand::Link => self.identity.link(&mut state.graph, source, target)?,
                        _ => self.identity.unlink(&mut state.graph, source, target)?,
                    };
                    if changed {
                        changes.context.updated_patients.push(state.graph.patient(source)?.pid.clone());
                        changes.context.updated_patients.push(target_pid.clone());
                    }
                    (target_pid, Vec::new())
                }
                PatientCommand::Merge => {
                    if state.graph.patient(source_id)?.merged_into.is_some() {
                        return Err(PacsError::PatientMerged(source_pid.to_string()));
                    }
                    let target_id = find_patient_by_attrs(&state.graph, &request.target)?.id;
                    let target = resolve_guarded(state, target_id)?;
                    let target_pid = state.graph.patient(target)?.pid.clone();
                    if MergePathResolver::would_create_cycle(&state.graph, source_id, target)? {
                        warn!("Refused patient merge {} -> {}: circular merge", source_pid, target_pid);
                        return Err(PacsError::CircularMerge(format!("{} -> {}", source_pid, target_pid)));
                    }
                    let moved = self.identity.merge(&mut state.graph, source_id, target)?;
                    changes.context.updated_patients.push(source_pid.clone());
                    changes.context.moved_studies = moved.clone();
                    (target_pid, moved)
                }
                PatientCommand::UpdateId => {
                    let pid = IdWithIssuer::from_attributes(&request.target)
                        .ok_or_else(|| PacsError::not_permitted("目标属性缺少 PatientID"))?;
                    if pid != source_pid {
                        self.identity.update_id(&mut state.graph, source_id, &pid)?;
                        changes.context.updated_patients.push(pid.clone());
                    }
                    (pid, Vec::new())
                }
            };

            changes.context.patients = vec![source_pid.clone(), target_pid.clone()];
            changes.history.patient = Some(PatientRecord {
                command: request.command,
                source: source_pid,
                target: target_pid,
                moved_studies,
            });
            Ok(changes.finish(state))
        })
    }

    // ========== 替换对账 ==========

    /// 拒绝被外部替换的旧实例并记录到新实例的对应关系
    ///
    /// 旧实例已用同一编码拒绝且已有替换记录时跳过，全部跳过返回 None。
    /// 旧实例正在等待删除时返回可重试的 `Conflict`。
    pub fn replaced(
        &self,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
        instances: &BTreeMap<SopInstanceUid, SopInstanceUid>,
        reason: Option<&Code>,
    ) -> Result<Option<QcOperationContext>> {
        tx.atomically(|state| {
            let code = match reason {
                Some(code) => code.clone(),
                None => req.config.rejection.qc_code()?,
            };
            let mut resolved = Vec::new();
            for (old, new) in instances {
                resolved.push((state.graph.instance_by_uid(old)?.id, old, new));
            }

            let mut changes = Changes::new(QcOperation::Replaced, req);
            let code_id = changes.register_code(&mut state.graph, &code)?;
            let mut pending = Vec::new();
            for (id, old, new) in resolved {
                let same_code = state.graph.instance(id)?.rejection.as_ref().map(|r| r.code_id) == Some(code_id);
                if same_code && state.history.covers_replacement(old, code_id) {
                    debug!("Skipping already processed replacement {} -> {}", old, new);
                    continue;
                }
                if state.is_marked_for_delete(id) {
                    return Err(PacsError::Conflict(format!("实例 {} 正在等待删除", old)));
                }
                pending.push((id, old, new));
            }
            if pending.is_empty() {
                info!("All {} replacements already processed", instances.len());
                return Ok(None);
            }

            let ids: Vec<Uuid> = pending.iter().map(|(id, _, _)| *id).collect();
            let rejected = RejectionLedger::reject(&mut state.graph, &ids, code_id)?;
            for (id, old, new) in pending {
                let at = placement(&state.graph, id)?;
                if rejected.contains(&id) {
                    changes.context.rejected.push(old.clone());
                }
                changes.context.replaced.push(ReplacedInstance {
                    old: old.clone(),
                    new: new.clone(),
                });
                changes.history.instances.push(InstanceHistory {
                    old_uid: old.clone(),
                    new_uid: new.clone(),
                    old_series_uid: at.series.clone(),
                    new_series_uid: at.series,
                    old_study_uid: at.study.clone(),
                    new_study_uid: at.study,
                    cloned: false,
                });
            }
            Ok(Some(changes.finish(state)))
        })
    }
}

/// 一次操作累积的上下文和审计记录
struct Changes {
    context: QcOperationContext,
    history: QcUpdateHistory,
}

impl Changes {
    fn new(operation: QcOperation, req: &QcRequest<'_>) -> Self {
        Self {
            context: QcOperationContext::new(operation, req.trigger),
            history: QcUpdateHistory::new(operation, req.trigger),
        }
    }

    fn register_code(&mut self, graph: &mut EntityGraph, code: &Code) -> Result<Uuid> {
        let id = graph.find_or_create_code(code);
        self.context.rejection_code = Some(graph.code(id)?.code.clone());
        self.history.rejection_code = Some(id);
        Ok(id)
    }

    fn record(&mut self, before: Placement, after: Placement, cloned: bool) {
        if cloned {
            self.context.cloned.push(ClonedInstance {
                source: before.uid.clone(),
                clone: after.uid.clone(),
            });
        } else {
            self.context.moved.push(before.uid.clone());
        }
        self.history.instances.push(InstanceHistory {
            old_uid: before.uid,
            new_uid: after.uid,
            old_series_uid: before.series,
            new_series_uid: after.series,
            old_study_uid: before.study,
            new_study_uid: after.study,
            cloned,
        });
    }

    fn record_in_place(&mut self, at: Placement) {
        self.history.instances.push(InstanceHistory {
            old_uid: at.uid.clone(),
            new_uid: at.uid,
            old_series_uid: at.series.clone(),
            new_series_uid: at.series,
            old_study_uid: at.study.clone(),
            new_study_uid: at.study,
            cloned: false,
        });
    }

    /// 有变化时追加审计记录
    fn finish(mut self, state: &mut ArchiveState) -> QcOperationContext {
        if self.context.is_empty() {
            debug!("QC {} changed nothing", self.context.operation);
            return self.context;
        }
        self.history.target_study = self.context.target_study.clone();
        self.context.history_id = Some(state.history.append(self.history));
        info!(
            "QC {} ({}) applied: {} instances affected, {} series and {} studies reaped",
            self.context.operation,
            self.context.trigger,
            self.context.affected_instances(),
            self.context.reaped.series.len(),
            self.context.reaped.studies.len()
        );
        self.context
    }
}

/// 实例当前所在位置
struct Placement {
    uid: SopInstanceUid,
    series: SeriesUid,
    study: StudyUid,
}

fn placement(graph: &EntityGraph, instance_id: Uuid) -> Result<Placement> {
    let instance = graph.instance(instance_id)?;
    let series = graph.series(instance.series_id)?;
    let study = graph.study(series.study_id)?;
    Ok(Placement {
        uid: instance.sop_instance_uid.clone(),
        series: series.series_uid.clone(),
        study: study.study_uid.clone(),
    })
}

fn push_unique(ids: &mut Vec<Uuid>, id: Uuid) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

fn qc_applicable(state: &ArchiveState, instance_id: Uuid) -> Result<bool> {
    Ok(RejectionLedger::visible(state.graph.instance(instance_id)?) && !state.is_marked_for_delete(instance_id))
}

fn locate_ids(graph: &EntityGraph, uids: &[SopInstanceUid]) -> Result<Vec<Uuid>> {
    uids.iter().map(|uid| Ok(graph.instance_by_uid(uid)?.id)).collect()
}

/// 解析并校验拆分/分段的实例：非空、存在、可见且不在待删除中
fn qc_candidates(state: &ArchiveState, uids: &[SopInstanceUid]) -> Result<Vec<Uuid>> {
    if uids.is_empty() {
        return Err(PacsError::not_permitted("实例列表为空"));
    }
    let mut ids = Vec::new();
    let mut seen = BTreeSet::new();
    for uid in uids {
        let id = state.graph.instance_by_uid(uid)?.id;
        if !seen.insert(id) {
            continue;
        }
        if !qc_applicable(state, id)? {
            return Err(PacsError::not_permitted(format!("实例 {} 已被拒绝或正在等待删除", uid)));
        }
        ids.push(id);
    }
    Ok(ids)
}

fn single_source_study(graph: &EntityGraph, instance_ids: &[Uuid]) -> Result<Uuid> {
    let mut studies = BTreeSet::new();
    for id in instance_ids {
        studies.insert(graph.study_of_instance(*id)?.id);
    }
    match studies.len() {
        1 => studies
            .into_iter()
            .next()
            .ok_or_else(|| PacsError::Internal("源检查集合为空".to_string())),
        n => {
            warn!("Refused structural change: instances span {} studies", n);
            Err(PacsError::not_permitted(format!("实例分属 {} 个检查", n)))
        }
    }
}

fn find_patient_by_pid<'g>(graph: &'g EntityGraph, pid: &IdWithIssuer) -> Result<&'g Patient> {
    match graph.find_patients(pid).as_slice() {
        [] => Err(PacsError::not_found(format!("Patient {}", pid))),
        [patient] => Ok(*patient),
        _ => Err(PacsError::NonUniquePatient(pid.to_string())),
    }
}

fn find_patient_by_attrs<'g>(graph: &'g EntityGraph, attrs: &Attributes) -> Result<&'g Patient> {
    let pid = IdWithIssuer::from_attributes(attrs).ok_or_else(|| PacsError::not_permitted("缺少 PatientID"))?;
    find_patient_by_pid(graph, &pid)
}

fn authoritative_patient(graph: &EntityGraph, pid: &IdWithIssuer) -> Result<Uuid> {
    let patient = find_patient_by_pid(graph, pid)?;
    Ok(MergePathResolver::resolve(graph, patient.id)?.id)
}

fn check_source_patient(graph: &EntityGraph, study_id: Uuid, patient: Uuid) -> Result<()> {
    let study = graph.study(study_id)?;
    if MergePathResolver::resolve(graph, study.patient_id)?.id != patient {
        warn!("Refused structural change: study {} belongs to another patient", study.study_uid);
        return Err(PacsError::not_permitted(format!("检查 {} 不属于目标患者", study.study_uid)));
    }
    Ok(())
}

/// 解析权威患者，并登记合并路径上每个患者的读取版本
///
/// 并发事务改动路径上任一患者时本事务提交冲突，合并指针因此不会并发成环。
fn resolve_guarded(state: &mut ArchiveState, patient_id: Uuid) -> Result<Uuid> {
    let path = MergePathResolver::path(&state.graph, patient_id)?;
    for id in &path {
        state.guard_patient(*id);
    }
    path.last()
        .copied()
        .ok_or_else(|| PacsError::Internal(format!("患者 {} 的合并路径为空", patient_id)))
}

/// 患者没有检查、也没有其他患者合并到它时才可删除
fn removable_patient(graph: &EntityGraph, patient_id: Uuid) -> bool {
    graph.patient(patient_id).is_ok()
        && graph.studies_of_patient(patient_id).is_empty()
        && !graph.patients().any(|p| p.merged_into == Some(patient_id))
}

/// 查找目标检查，不存在时以 `created_attrs` 在患者下创建
fn prepare_target_study(
    graph: &mut EntityGraph,
    changes: &mut Changes,
    uid: &StudyUid,
    patient: Uuid,
    created_attrs: &Attributes,
) -> Result<(Uuid, bool)> {
    if let Some(study) = graph.find_study(uid) {
        let study_id = study.id;
        check_source_patient(graph, study_id, patient)?;
        return Ok((study_id, false));
    }
    let study_id = graph.create_study(patient, uid.clone(), created_attrs.without(STUDY_IDENTITY))?;
    changes.context.created_studies.push(uid.clone());
    Ok((study_id, true))
}

fn apply_study_override(
    graph: &mut EntityGraph,
    changes: &mut Changes,
    study_id: Uuid,
    supplied: &Attributes,
    source: &Attributes,
) -> Result<()> {
    let current = &graph.study(study_id)?.attributes;
    let merged = Attributes::merge_with_precedence(
        &supplied.without(STUDY_IDENTITY),
        Some(current),
        &source.without(STUDY_IDENTITY),
    );
    let mut next = current.clone();
    let prior = next.apply_patch(&merged);
    if prior.is_empty() {
        return Ok(());
    }
    graph.study_mut(study_id)?.attributes = next;
    graph.invalidate_study_aggregates(study_id)?;
    changes.context.updated_attributes.extend(prior.into_keys());
    Ok(())
}

fn apply_series_override(
    graph: &mut EntityGraph,
    changes: &mut Changes,
    series_id: Uuid,
    supplied: &Attributes,
    source: &Attributes,
) -> Result<()> {
    let current = &graph.series(series_id)?.attributes;
    let merged = Attributes::merge_with_precedence(
        &supplied.without(SERIES_IDENTITY),
        Some(current),
        &source.without(SERIES_IDENTITY),
    );
    let mut next = current.clone();
    let prior = next.apply_patch(&merged);
    if prior.is_empty() {
        return Ok(());
    }
    graph.series_mut(series_id)?.attributes = next;
    graph.invalidate_series_aggregates(series_id)?;
    changes.context.updated_attributes.extend(prior.into_keys());
    Ok(())
}

/// 拆分/分段的目标系列
///
/// `supplied` 带 SeriesInstanceUID 时全部实例进入该系列（目标检查中已有或新建），
/// 否则每个源系列在目标检查中对应一个新系列。
fn target_series_for(
    graph: &mut EntityGraph,
    changes: &mut Changes,
    target_study: Uuid,
    source_series: Uuid,
    supplied: &Attributes,
    uid_root: &str,
    cache: &mut HashMap<Uuid, Uuid>,
) -> Result<Uuid> {
    if let Some(id) = cache.get(&source_series) {
        return Ok(*id);
    }

    let source_attrs = graph.series(source_series)?.attributes.without(SERIES_IDENTITY);
    let (uid, existing) = match supplied.get(keywords::SERIES_INSTANCE_UID) {
        Some(uid) => {
            let uid = SeriesUid::new(uid);
            match graph.find_series(&uid).map(|s| (s.id, s.study_id)) {
                Some((id, study_id)) if study_id == target_study => (uid, Some(id)),
                Some(_) => {
                    return Err(PacsError::not_permitted(format!("系列 {} 属于其他检查", uid)));
                }
                None => (uid, None),
            }
        }
        None => (SeriesUid::new(generate_dicom_uid_with_root(uid_root)), None),
    };

    let id = match existing {
        Some(id) => {
            apply_series_override(graph, changes, id, supplied, &source_attrs)?;
            id
        }
        None => {
            let attrs = Attributes::merge_with_precedence(&supplied.without(SERIES_IDENTITY), None, &source_attrs);
            let id = graph.create_series(target_study, uid.clone(), attrs)?;
            changes.context.created_series.push(uid);
            id
        }
    };
    cache.insert(source_series, id);
    Ok(id)
}

fn move_instances(graph: &mut EntityGraph, changes: &mut Changes, ids: &[Uuid], target_series: Uuid) -> Result<()> {
    for id in ids {
        let before = placement(graph, *id)?;
        graph.move_instance(*id, target_series)?;
        let after = placement(graph, *id)?;
        changes.record(before, after, false);
    }
    Ok(())
}

/// 属性更新作用的实体
enum ScopeTarget {
    Patient(Uuid),
    Study(Uuid),
    Series(Uuid),
    Instance(Uuid),
}

fn resolve_scope(state: &ArchiveState, scope: &UpdateScope) -> Result<ScopeTarget> {
    let graph = &state.graph;
    Ok(match scope {
        UpdateScope::Patient(pid) => ScopeTarget::Patient(authoritative_patient(graph, pid)?),
        UpdateScope::Study(uid) => ScopeTarget::Study(graph.study_by_uid(uid)?.id),
        UpdateScope::Series(uid) => ScopeTarget::Series(graph.series_by_uid(uid)?.id),
        UpdateScope::Instance(uid) => {
            let id = graph.instance_by_uid(uid)?.id;
            if !qc_applicable(state, id)? {
                return Err(PacsError::not_permitted(format!("实例 {} 已被拒绝或正在等待删除", uid)));
            }
            ScopeTarget::Instance(id)
        }
    })
}

fn scope_attributes<'g>(graph: &'g EntityGraph, target: &ScopeTarget) -> Result<&'g Attributes> {
    Ok(match target {
        ScopeTarget::Patient(id) => &graph.patient(*id)?.attributes,
        ScopeTarget::Study(id) => &graph.study(*id)?.attributes,
        ScopeTarget::Series(id) => &graph.series(*id)?.attributes,
        ScopeTarget::Instance(id) => &graph.instance(*id)?.attributes,
    })
}

fn write_scope_attributes(graph: &mut EntityGraph, target: &ScopeTarget, attributes: Attributes) -> Result<()> {
    match target {
        ScopeTarget::Patient(id) => {
            graph.patient_mut(*id)?.attributes = attributes;
        }
        ScopeTarget::Study(id) => {
            graph.study_mut(*id)?.attributes = attributes;
            graph.invalidate_study_aggregates(*id)?;
        }
        ScopeTarget::Series(id) => {
            graph.series_mut(*id)?.attributes = attributes;
            graph.invalidate_series_aggregates(*id)?;
        }
        ScopeTarget::Instance(id) => {
            let instance = graph.instance_mut(*id)?;
            instance.attributes = attributes;
            let series_id = instance.series_id;
            graph.invalidate_series_aggregates(series_id)?;
        }
    }
    Ok(())
}
