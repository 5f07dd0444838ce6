//! Non-IOCM 对账消费者
//!
//! 外部系统不经 IOCM 直接替换实例时，替换关系按检查登记为待处理任务，
//! 由检查级消息触发 `replaced`。消息至少投递一次，重复投递依赖 `replaced` 自身的幂等性。

use crate::config::QcConfig;
use crate::context::{AuditTrigger, QcRequest};
use crate::engine::StructuralChangeEngine;
use crate::store::ArchiveStore;
use chrono::{DateTime, Utc};
use pacs_core::{Code, PacsError, Result, SopInstanceUid, StudyUid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 检查级变更消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonIocmMessage {
    pub id: Uuid,
    pub study_uid: StudyUid,
    /// 从 1 开始的投递次数
    pub delivery_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl NonIocmMessage {
    pub fn new(study_uid: StudyUid) -> Self {
        Self {
            id: Uuid::new_v4(),
            study_uid,
            delivery_count: 1,
            timestamp: Utc::now(),
        }
    }

    /// 重新投递的同一消息
    pub fn redelivered(&self) -> Self {
        Self {
            delivery_count: self.delivery_count + 1,
            timestamp: Utc::now(),
            ..self.clone()
        }
    }
}

/// 消息处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// 已完成，`replaced` 为本次实际处理的替换数
    Processed { replaced: usize },
    /// 可重试失败，请重新投递
    Retry,
    /// 放弃并已清理待处理任务
    Discarded,
    /// 没有对应的待处理任务
    Ignored,
}

/// 消息处理器接口
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, message: &NonIocmMessage) -> Result<MessageOutcome>;

    fn name(&self) -> &str;
}

/// 某个检查等待对账的替换
#[derive(Debug, Clone, Default)]
struct PendingReplacement {
    instances: BTreeMap<SopInstanceUid, SopInstanceUid>,
    reason: Option<Code>,
}

/// Non-IOCM 变更请求者
pub struct NonIocmChangeRequestor {
    engine: Arc<StructuralChangeEngine>,
    store: ArchiveStore,
    config: Arc<QcConfig>,
    active: Mutex<HashMap<StudyUid, PendingReplacement>>,
}

impl NonIocmChangeRequestor {
    pub fn new(engine: Arc<StructuralChangeEngine>, store: ArchiveStore, config: Arc<QcConfig>) -> Self {
        Self {
            engine,
            store,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// 登记检查的替换关系，同一检查的多次登记合并
    pub async fn enqueue(
        &self,
        study_uid: StudyUid,
        instances: BTreeMap<SopInstanceUid, SopInstanceUid>,
        reason: Option<Code>,
    ) {
        let mut active = self.active.lock().await;
        let pending = active.entry(study_uid.clone()).or_default();
        pending.instances.extend(instances);
        if reason.is_some() {
            pending.reason = reason;
        }
        debug!("Queued {} replacements for study {}", pending.instances.len(), study_uid);
    }

    pub async fn is_pending(&self, study_uid: &StudyUid) -> bool {
        self.active.lock().await.contains_key(study_uid)
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// 失败后的处理：可重试且未超过投递上限时重试，否则清理
    fn failure_outcome(&self, error: &PacsError, delivery_count: u32) -> MessageOutcome {
        if error.is_retryable() && delivery_count <= self.config.noniocm.max_delivery_count {
            MessageOutcome::Retry
        } else {
            MessageOutcome::Discarded
        }
    }
}

#[async_trait::async_trait]
impl MessageHandler for NonIocmChangeRequestor {
    async fn handle_message(&self, message: &NonIocmMessage) -> Result<MessageOutcome> {
        let mut active = self.active.lock().await;
        let Some(pending) = active.get(&message.study_uid) else {
            debug!("No pending replacements for study {}", message.study_uid);
            return Ok(MessageOutcome::Ignored);
        };

        let req = QcRequest::new(AuditTrigger::NonIocm, &self.config);
        let mut tx = self.store.begin();
        let result = self
            .engine
            .replaced(&mut tx, &req, &pending.instances, pending.reason.as_ref())
            .and_then(|context| self.engine.commit(tx).map(|_| context));

        match result {
            Ok(context) => {
                active.remove(&message.study_uid);
                let replaced = context.map_or(0, |c| c.replaced.len());
                info!(
                    "Processed Non-IOCM change for study {}: {} replacements",
                    message.study_uid, replaced
                );
                Ok(MessageOutcome::Processed { replaced })
            }
            Err(e) => match self.failure_outcome(&e, message.delivery_count) {
                MessageOutcome::Retry => {
                    warn!(
                        "Non-IOCM change for study {} failed on delivery {}: {}",
                        message.study_uid, message.delivery_count, e
                    );
                    Ok(MessageOutcome::Retry)
                }
                outcome => {
                    active.remove(&message.study_uid);
                    error!(
                        "Discarded Non-IOCM change for study {} after {} deliveries: {}",
                        message.study_uid, message.delivery_count, e
                    );
                    Ok(outcome)
                }
            },
        }
    }

    fn name(&self) -> &str {
        "noniocm-change-requestor"
    }
}
