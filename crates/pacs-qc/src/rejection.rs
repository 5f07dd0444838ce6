//! 拒绝台账（墓碑语义）
//!
//! 拒绝只给实例挂上引用原因编码的墓碑，不删除实例和存储位置；
//! 恢复时摘除墓碑即可完全还原。查询方通过 [`RejectionLedger::visible`] 过滤。

use crate::graph::EntityGraph;
use chrono::Utc;
use pacs_core::{CodeEntity, Instance, Rejection, Result};
use std::collections::BTreeSet;
use tracing::debug;
use uuid::Uuid;

/// 拒绝台账
pub struct RejectionLedger;

impl RejectionLedger {
    /// 可见性谓词：挂有墓碑的实例不可见
    pub fn visible(instance: &Instance) -> bool {
        instance.rejection.is_none()
    }

    /// 拒绝实例，返回状态发生变化的实例
    ///
    /// 已用同一编码拒绝的实例不变；用不同编码拒绝的实例替换为新编码。
    pub fn reject(graph: &mut EntityGraph, instance_ids: &[Uuid], code_id: Uuid) -> Result<Vec<Uuid>> {
        graph.code(code_id)?;
        for id in instance_ids {
            graph.instance(*id)?;
        }

        let mut affected = Vec::new();
        let mut seen = BTreeSet::new();
        for id in instance_ids {
            if !seen.insert(*id) {
                continue;
            }
            let current = graph.instance(*id)?.rejection.as_ref().map(|r| r.code_id);
            if current == Some(code_id) {
                continue;
            }

            let instance = graph.instance_mut(*id)?;
            instance.rejection = Some(Rejection {
                code_id,
                rejected_at: Utc::now(),
            });
            let series_id = instance.series_id;
            graph.invalidate_series_aggregates(series_id)?;
            debug!("Rejected instance {} with code {}", id, code_id);
            affected.push(*id);
        }
        Ok(affected)
    }

    /// 恢复实例，返回原先挂有墓碑的实例
    pub fn restore(graph: &mut EntityGraph, instance_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        for id in instance_ids {
            graph.instance(*id)?;
        }

        let mut affected = Vec::new();
        let mut seen = BTreeSet::new();
        for id in instance_ids {
            if !seen.insert(*id) || Self::visible(graph.instance(*id)?) {
                continue;
            }

            let instance = graph.instance_mut(*id)?;
            instance.rejection = None;
            let series_id = instance.series_id;
            graph.invalidate_series_aggregates(series_id)?;
            debug!("Restored instance {}", id);
            affected.push(*id);
        }
        Ok(affected)
    }

    /// 实例当前的拒绝原因编码
    pub fn rejection_code(graph: &EntityGraph, instance_id: Uuid) -> Result<Option<&CodeEntity>> {
        match &graph.instance(instance_id)?.rejection {
            Some(rejection) => Ok(Some(graph.code(rejection.code_id)?)),
            None => Ok(None),
        }
    }
}
