//! 质控命令
//!
//! 每个引擎操作对应一个可序列化的命令，供批量回放和消息驱动的调用方使用。

use crate::context::{QcOperationContext, QcRequest};
use crate::engine::StructuralChangeEngine;
use crate::history::{PatientCommand, UpdateScope};
use crate::store::Transaction;
use pacs_core::{Attributes, Code, IdWithIssuer, Result, SeriesUid, SopInstanceUid, StudyUid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// 检查合并参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub sources: Vec<StudyUid>,
    pub target: StudyUid,
    #[serde(default)]
    pub study_attrs: Attributes,
    #[serde(default)]
    pub series_attrs: Attributes,
    #[serde(default)]
    pub reason: Option<Code>,
}

/// 拆分参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitRequest {
    pub instances: Vec<SopInstanceUid>,
    pub patient: IdWithIssuer,
    pub target: StudyUid,
    /// 仅在新建目标检查时使用
    #[serde(default)]
    pub created_study_attrs: Attributes,
    #[serde(default)]
    pub series_attrs: Attributes,
    #[serde(default)]
    pub reason: Option<Code>,
}

/// 分段参数：移动一组实例，克隆另一组实例到同一目标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRequest {
    #[serde(default)]
    pub to_move: Vec<SopInstanceUid>,
    #[serde(default)]
    pub to_clone: Vec<SopInstanceUid>,
    pub patient: IdWithIssuer,
    pub target: StudyUid,
    #[serde(default)]
    pub study_attrs: Attributes,
    #[serde(default)]
    pub series_attrs: Attributes,
    #[serde(default)]
    pub reason: Option<Code>,
}

/// 患者身份操作参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientOperationRequest {
    pub source: Attributes,
    pub target: Attributes,
    pub command: PatientCommand,
}

/// 质控命令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QcCommand {
    Merge(MergeRequest),
    Split(SplitRequest),
    Segment(SegmentRequest),
    Reject {
        instances: Vec<SopInstanceUid>,
        #[serde(default)]
        reason: Option<Code>,
    },
    Restore {
        instances: Vec<SopInstanceUid>,
    },
    DeleteInstance {
        uid: SopInstanceUid,
        #[serde(default)]
        reason: Option<Code>,
    },
    DeleteSeries {
        uid: SeriesUid,
        #[serde(default)]
        reason: Option<Code>,
    },
    DeleteStudy {
        uid: StudyUid,
        #[serde(default)]
        reason: Option<Code>,
    },
    DeletePatient {
        patient: IdWithIssuer,
        #[serde(default)]
        reason: Option<Code>,
    },
    CompleteDelete {
        request: Uuid,
    },
    DeleteSeriesIfEmpty {
        uid: SeriesUid,
    },
    DeleteStudyIfEmpty {
        uid: StudyUid,
    },
    DeletePatientIfEmpty {
        patient: IdWithIssuer,
    },
    Update {
        scope: UpdateScope,
        attributes: Attributes,
    },
    RevertUpdate {
        history: Uuid,
    },
    PatientOperation(PatientOperationRequest),
    Replaced {
        instances: BTreeMap<SopInstanceUid, SopInstanceUid>,
        #[serde(default)]
        reason: Option<Code>,
    },
}

impl QcCommand {
    pub fn name(&self) -> &'static str {
        match self {
            QcCommand::Merge(_) => "merge",
            QcCommand::Split(_) => "split",
            QcCommand::Segment(_) => "segment",
            QcCommand::Reject { .. } => "reject",
            QcCommand::Restore { .. } => "restore",
            QcCommand::DeleteInstance { .. } => "delete_instance",
            QcCommand::DeleteSeries { .. } => "delete_series",
            QcCommand::DeleteStudy { .. } => "delete_study",
            QcCommand::DeletePatient { .. } => "delete_patient",
            QcCommand::CompleteDelete { .. } => "complete_delete",
            QcCommand::DeleteSeriesIfEmpty { .. } => "delete_series_if_empty",
            QcCommand::DeleteStudyIfEmpty { .. } => "delete_study_if_empty",
            QcCommand::DeletePatientIfEmpty { .. } => "delete_patient_if_empty",
            QcCommand::Update { .. } => "update",
            QcCommand::RevertUpdate { .. } => "revert_update",
            QcCommand::PatientOperation(_) => "patient_operation",
            QcCommand::Replaced { .. } => "replaced",
        }
    }

    /// 在事务中执行命令
    ///
    /// `replaced` 全部跳过、`delete*IfEmpty` 未删除任何容器时返回 None。
    pub fn execute(
        &self,
        engine: &StructuralChangeEngine,
        tx: &mut Transaction,
        req: &QcRequest<'_>,
    ) -> Result<Option<QcOperationContext>> {
        let context = match self {
            QcCommand::Merge(merge) => engine.merge_studies(tx, req, merge)?,
            QcCommand::Split(split) => engine.split(tx, req, split)?,
            QcCommand::Segment(segment) => engine.segment(tx, req, segment)?,
            QcCommand::Reject { instances, reason } => engine.reject(tx, req, instances, reason.as_ref())?,
            QcCommand::Restore { instances } => engine.restore(tx, req, instances)?,
            QcCommand::DeleteInstance { uid, reason } => engine.delete_instance(tx, req, uid, reason.as_ref())?,
            QcCommand::DeleteSeries { uid, reason } => engine.delete_series(tx, req, uid, reason.as_ref())?,
            QcCommand::DeleteStudy { uid, reason } => engine.delete_study(tx, req, uid, reason.as_ref())?,
            QcCommand::DeletePatient { patient, reason } => {
                engine.delete_patient(tx, req, patient, reason.as_ref())?
            }
            QcCommand::CompleteDelete { request } => engine.complete_delete(tx, req, *request)?,
            QcCommand::DeleteSeriesIfEmpty { uid } => return engine.reap_series_if_empty(tx, req, uid),
            QcCommand::DeleteStudyIfEmpty { uid } => return engine.reap_study_if_empty(tx, req, uid),
            QcCommand::DeletePatientIfEmpty { patient } => return engine.reap_patient_if_empty(tx, req, patient),
            QcCommand::Update { scope, attributes } => engine.update_dicom_object(tx, req, scope, attributes)?,
            QcCommand::RevertUpdate { history } => engine.revert_update(tx, req, *history)?,
            QcCommand::PatientOperation(operation) => engine.patient_operation(tx, req, operation)?,
            QcCommand::Replaced { instances, reason } => return engine.replaced(tx, req, instances, reason.as_ref()),
        };
        Ok(Some(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_json_shape() {
        let json = r#"{
            "op": "reject",
            "instances": ["1.2.3.4"],
            "reason": {"value": "113037", "scheme": "DCM", "meaning": "Rejected for Patient Safety Reasons"}
        }"#;
        let command: QcCommand = serde_json::from_str(json).unwrap();
        assert_eq!(command.name(), "reject");
        match command {
            QcCommand::Reject { instances, reason } => {
                assert_eq!(instances, vec![SopInstanceUid::new("1.2.3.4")]);
                assert_eq!(reason.unwrap().value, "113037");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_merge_command_defaults() {
        let json = r#"{"op": "merge", "sources": ["1.2.1"], "target": "1.2.2"}"#;
        let command: QcCommand = serde_json::from_str(json).unwrap();
        match command {
            QcCommand::Merge(merge) => {
                assert!(merge.study_attrs.is_empty());
                assert!(merge.reason.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_replaced_command_uses_uid_map() {
        let json = r#"{"op": "replaced", "instances": {"1.2.3": "1.2.4"}}"#;
        let command: QcCommand = serde_json::from_str(json).unwrap();
        assert_eq!(command.name(), "replaced");
    }
}
