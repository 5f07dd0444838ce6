//! 质控变更审计记录
//!
//! 每个产生变化的结构变更操作追加一条 [`QcUpdateHistory`]，记录创建后不再修改。

use crate::context::AuditTrigger;
use chrono::{DateTime, Utc};
use pacs_core::{Attributes, IdWithIssuer, SeriesUid, SopInstanceUid, StudyUid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// 结构变更操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QcOperation {
    Merge,
    Split,
    Segment,
    Reject,
    Restore,
    Delete,
    Update,
    PatientOperation,
    Replaced,
}

impl fmt::Display for QcOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QcOperation::Merge => "merge",
            QcOperation::Split => "split",
            QcOperation::Segment => "segment",
            QcOperation::Reject => "reject",
            QcOperation::Restore => "restore",
            QcOperation::Delete => "delete",
            QcOperation::Update => "update",
            QcOperation::PatientOperation => "patient-operation",
            QcOperation::Replaced => "replaced",
        };
        f.write_str(name)
    }
}

/// 属性更新的作用对象
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", content = "id", rename_all = "lowercase")]
pub enum UpdateScope {
    Patient(IdWithIssuer),
    Study(StudyUid),
    Series(SeriesUid),
    Instance(SopInstanceUid),
}

impl fmt::Display for UpdateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateScope::Patient(pid) => write!(f, "patient {}", pid),
            UpdateScope::Study(uid) => write!(f, "study {}", uid),
            UpdateScope::Series(uid) => write!(f, "series {}", uid),
            UpdateScope::Instance(uid) => write!(f, "instance {}", uid),
        }
    }
}

/// 患者身份操作命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatientCommand {
    Link,
    Unlink,
    Merge,
    UpdateId,
}

/// 单个实例的变更记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHistory {
    pub old_uid: SopInstanceUid,
    pub new_uid: SopInstanceUid,
    pub old_series_uid: SeriesUid,
    pub new_series_uid: SeriesUid,
    pub old_study_uid: StudyUid,
    pub new_study_uid: StudyUid,
    /// 是否为克隆（原实例保留）
    #[serde(default)]
    pub cloned: bool,
}

/// 属性更新记录，保存原值以便撤销
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub scope: UpdateScope,
    /// 被修改关键字的原值，原先不存在的为 None
    pub prior: BTreeMap<String, Option<String>>,
    pub applied: Attributes,
}

/// 患者身份操作记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub command: PatientCommand,
    pub source: IdWithIssuer,
    pub target: IdWithIssuer,
    #[serde(default)]
    pub moved_studies: Vec<StudyUid>,
}

/// 质控变更审计记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcUpdateHistory {
    pub id: Uuid,
    pub operation: QcOperation,
    pub trigger: AuditTrigger,
    pub created_at: DateTime<Utc>,
    /// 拒绝原因编码ID
    #[serde(default)]
    pub rejection_code: Option<Uuid>,
    #[serde(default)]
    pub target_study: Option<StudyUid>,
    #[serde(default)]
    pub instances: Vec<InstanceHistory>,
    #[serde(default)]
    pub update: Option<UpdateRecord>,
    #[serde(default)]
    pub patient: Option<PatientRecord>,
    /// 被撤销的记录
    #[serde(default)]
    pub reverts: Option<Uuid>,
}

impl QcUpdateHistory {
    pub fn new(operation: QcOperation, trigger: AuditTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            trigger,
            created_at: Utc::now(),
            rejection_code: None,
            target_study: None,
            instances: Vec::new(),
            update: None,
            patient: None,
            reverts: None,
        }
    }
}

/// 只追加的审计日志
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryLog {
    records: Vec<QcUpdateHistory>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, record: QcUpdateHistory) -> Uuid {
        let id = record.id;
        self.records.push(record);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<&QcUpdateHistory> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn records(&self) -> &[QcUpdateHistory] {
        &self.records
    }

    /// 从第 `start` 条开始的记录
    pub fn since(&self, start: usize) -> &[QcUpdateHistory] {
        self.records.get(start..).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 是否已有记录用同一编码替换过该实例
    pub fn covers_replacement(&self, old_uid: &SopInstanceUid, code_id: Uuid) -> bool {
        self.records.iter().any(|record| {
            record.operation == QcOperation::Replaced
                && record.rejection_code == Some(code_id)
                && record.instances.iter().any(|entry| &entry.old_uid == old_uid)
        })
    }

    /// 涉及某实例的全部记录（按时间顺序）
    pub fn for_instance<'a>(&'a self, uid: &'a SopInstanceUid) -> impl Iterator<Item = &'a QcUpdateHistory> + 'a {
        self.records
            .iter()
            .filter(move |record| record.instances.iter().any(|e| &e.old_uid == uid || &e.new_uid == uid))
    }
}
