//! 异步删除分发
//!
//! 删除操作只给实例打上待删除标记并生成 [`DeleteRequest`]，事务提交后才交给
//! [`DeleteDispatcher`]。物理删除由外部工作者完成后回调 `complete_delete`。

use crate::context::{AuditTrigger, QcRequest};
use crate::config::QcConfig;
use crate::engine::StructuralChangeEngine;
use crate::store::ArchiveStore;
use chrono::{DateTime, Utc};
use pacs_core::{IdWithIssuer, PacsError, Result, SeriesUid, SopInstanceUid, StudyUid};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 删除范围
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", content = "id", rename_all = "lowercase")]
pub enum DeleteScope {
    Instance(SopInstanceUid),
    Series(SeriesUid),
    Study(StudyUid),
    Patient(IdWithIssuer),
}

/// 删除请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub id: Uuid,
    pub scope: DeleteScope,
    /// 被标记的实例
    pub instances: Vec<Uuid>,
    pub instance_uids: Vec<SopInstanceUid>,
    /// 患者级删除时完成后一并删除的患者
    #[serde(default)]
    pub patient_id: Option<Uuid>,
    pub reason_code: Uuid,
    pub trigger: AuditTrigger,
    pub requested_at: DateTime<Utc>,
}

impl DeleteRequest {
    pub fn new(scope: DeleteScope, reason_code: Uuid, trigger: AuditTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            instances: Vec::new(),
            instance_uids: Vec::new(),
            patient_id: None,
            reason_code,
            trigger,
            requested_at: Utc::now(),
        }
    }
}

/// 删除分发器接口
pub trait DeleteDispatcher: Send + Sync {
    /// 接收一个已提交的删除请求；完成情况通过 `complete_delete` 异步回报
    fn dispatch(&self, request: &DeleteRequest) -> Result<()>;
}

/// 基于 tokio 无界通道的分发器
#[derive(Debug)]
pub struct ChannelDeleteDispatcher {
    sender: Mutex<Option<mpsc::UnboundedSender<DeleteRequest>>>,
}

impl ChannelDeleteDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeleteRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Mutex::new(Some(sender)),
            },
            receiver,
        )
    }

    /// 关闭发送端；工作者处理完队列中剩余请求后退出
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

impl DeleteDispatcher for ChannelDeleteDispatcher {
    fn dispatch(&self, request: &DeleteRequest) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| PacsError::Internal("删除队列锁已损坏".to_string()))?;
        sender
            .as_ref()
            .ok_or_else(|| PacsError::Dispatch(format!("删除队列已关闭，请求 {}", request.id)))?
            .send(request.clone())
            .map_err(|_| PacsError::Dispatch(format!("删除队列已关闭，请求 {}", request.id)))?;
        debug!("Dispatched delete request {}", request.id);
        Ok(())
    }
}

/// 只记录请求的分发器
#[derive(Debug, Default)]
pub struct RecordingDeleteDispatcher {
    requests: Mutex<Vec<DeleteRequest>>,
}

impl RecordingDeleteDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<DeleteRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl DeleteDispatcher for RecordingDeleteDispatcher {
    fn dispatch(&self, request: &DeleteRequest) -> Result<()> {
        self.requests
            .lock()
            .map_err(|_| PacsError::Internal("删除请求记录锁已损坏".to_string()))?
            .push(request.clone());
        Ok(())
    }
}

/// 删除工作者：逐个完成通道中的删除请求，冲突时重试
///
/// 通道关闭后返回已完成的请求数。
pub async fn run_delete_worker(
    engine: Arc<StructuralChangeEngine>,
    store: ArchiveStore,
    config: Arc<QcConfig>,
    mut receiver: mpsc::UnboundedReceiver<DeleteRequest>,
) -> usize {
    const MAX_ATTEMPTS: usize = 3;
    let mut completed = 0;

    while let Some(request) = receiver.recv().await {
        let qc = QcRequest::new(request.trigger, &config);
        for attempt in 1..=MAX_ATTEMPTS {
            let mut tx = store.begin();
            let result = engine
                .complete_delete(&mut tx, &qc, request.id)
                .and_then(|context| engine.commit(tx).map(|_| context));
            match result {
                Ok(context) => {
                    info!(
                        "Completed delete request {}: {} instances removed",
                        request.id,
                        context.deleted_instances.len()
                    );
                    completed += 1;
                    break;
                }
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    warn!("Delete request {} attempt {}/{} failed: {}", request.id, attempt, MAX_ATTEMPTS, e);
                }
                Err(e) => {
                    error!("Delete request {} failed: {}", request.id, e);
                    break;
                }
            }
        }
    }
    completed
}
