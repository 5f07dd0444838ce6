//! 操作上下文
//!
//! 每个结构变更操作返回一个 [`QcOperationContext`]，列出被创建、移动、克隆、
//! 拒绝、恢复和删除的全部实体标识，审计/事件消费方无需回查即可还原发生了什么。

use crate::config::QcConfig;
use crate::history::QcOperation;
use crate::reaper::ReapOutcome;
use chrono::{DateTime, Utc};
use pacs_core::{Code, IdWithIssuer, SeriesUid, SopInstanceUid, StudyUid};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 触发结构变更的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditTrigger {
    /// 用户交互式修正
    Interactive,
    /// REST 接口调用
    RestApi,
    /// HL7 消息驱动
    Hl7,
    /// Non-IOCM 自动对账
    NonIocm,
    /// 定时任务
    Scheduled,
}

impl fmt::Display for AuditTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditTrigger::Interactive => "interactive",
            AuditTrigger::RestApi => "rest-api",
            AuditTrigger::Hl7 => "hl7",
            AuditTrigger::NonIocm => "non-iocm",
            AuditTrigger::Scheduled => "scheduled",
        };
        f.write_str(name)
    }
}

/// 单次操作的调用参数：审计来源和配置快照
#[derive(Debug, Clone, Copy)]
pub struct QcRequest<'a> {
    pub trigger: AuditTrigger,
    pub config: &'a QcConfig,
}

impl<'a> QcRequest<'a> {
    pub fn new(trigger: AuditTrigger, config: &'a QcConfig) -> Self {
        Self { trigger, config }
    }
}

/// 克隆出的实例
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClonedInstance {
    pub source: SopInstanceUid,
    pub clone: SopInstanceUid,
}

/// 被替换的实例
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacedInstance {
    pub old: SopInstanceUid,
    pub new: SopInstanceUid,
}

/// 操作上下文
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcOperationContext {
    pub id: Uuid,
    pub operation: QcOperation,
    pub trigger: AuditTrigger,
    pub created_at: DateTime<Utc>,
    /// 对应的审计记录；无变化时为空
    pub history_id: Option<Uuid>,
    pub rejection_code: Option<Code>,
    pub target_study: Option<StudyUid>,
    pub patients: Vec<IdWithIssuer>,
    /// 身份被修改的患者（关联、合并、更新ID）
    pub updated_patients: Vec<IdWithIssuer>,
    /// 随患者合并迁移的检查
    pub moved_studies: Vec<StudyUid>,
    pub created_studies: Vec<StudyUid>,
    pub created_series: Vec<SeriesUid>,
    /// 整体重挂接的系列
    pub moved_series: Vec<SeriesUid>,
    pub moved: Vec<SopInstanceUid>,
    pub cloned: Vec<ClonedInstance>,
    pub rejected: Vec<SopInstanceUid>,
    pub restored: Vec<SopInstanceUid>,
    pub replaced: Vec<ReplacedInstance>,
    /// 已标记待删除、交给删除分发器的实例
    pub marked_for_delete: Vec<SopInstanceUid>,
    pub delete_request: Option<Uuid>,
    pub deleted_instances: Vec<SopInstanceUid>,
    pub deleted_patients: Vec<IdWithIssuer>,
    /// 被回收的空容器
    pub reaped: ReapOutcome,
    /// 被修改的属性关键字
    pub updated_attributes: Vec<String>,
}

impl QcOperationContext {
    pub fn new(operation: QcOperation, trigger: AuditTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            trigger,
            created_at: Utc::now(),
            history_id: None,
            rejection_code: None,
            target_study: None,
            patients: Vec::new(),
            updated_patients: Vec::new(),
            moved_studies: Vec::new(),
            created_studies: Vec::new(),
            created_series: Vec::new(),
            moved_series: Vec::new(),
            moved: Vec::new(),
            cloned: Vec::new(),
            rejected: Vec::new(),
            restored: Vec::new(),
            replaced: Vec::new(),
            marked_for_delete: Vec::new(),
            delete_request: None,
            deleted_instances: Vec::new(),
            deleted_patients: Vec::new(),
            reaped: ReapOutcome::default(),
            updated_attributes: Vec::new(),
        }
    }

    /// 没有任何实体受影响
    ///
    /// `patients` 只是描述，不计入。
    pub fn is_empty(&self) -> bool {
        self.updated_patients.is_empty()
            && self.moved_studies.is_empty()
            && self.created_studies.is_empty()
            && self.created_series.is_empty()
            && self.moved_series.is_empty()
            && self.moved.is_empty()
            && self.cloned.is_empty()
            && self.rejected.is_empty()
            && self.restored.is_empty()
            && self.replaced.is_empty()
            && self.marked_for_delete.is_empty()
            && self.delete_request.is_none()
            && self.deleted_instances.is_empty()
            && self.deleted_patients.is_empty()
            && self.reaped.is_empty()
            && self.updated_attributes.is_empty()
    }

    /// 受影响的实例数
    pub fn affected_instances(&self) -> usize {
        self.moved.len()
            + self.cloned.len()
            + self.rejected.len()
            + self.restored.len()
            + self.marked_for_delete.len()
            + self.deleted_instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_is_empty() {
        let mut context = QcOperationContext::new(QcOperation::Reject, AuditTrigger::Interactive);
        context.patients.push(IdWithIssuer::new("P001", None));
        assert!(context.is_empty());

        context.rejected.push(SopInstanceUid::new("1.2.3"));
        assert!(!context.is_empty());
        assert_eq!(context.affected_instances(), 1);
    }

    #[test]
    fn test_trigger_serializes_as_tag() {
        assert_eq!(serde_json::to_string(&AuditTrigger::NonIocm).unwrap(), "\"NON_IOCM\"");
        assert_eq!(AuditTrigger::RestApi.to_string(), "rest-api");
    }
}
