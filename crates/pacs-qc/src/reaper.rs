//! 空容器回收
//!
//! 系列/检查变空后删除并向上级联，到达仍有子项的容器或患者层级即停止。
//! 患者是否为空由调用方通过 `delete_patient_if_empty` 显式判断。

use crate::graph::EntityGraph;
use pacs_core::{Result, SeriesUid, StudyUid};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// 回收结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapOutcome {
    pub series: Vec<SeriesUid>,
    pub studies: Vec<StudyUid>,
}

impl ReapOutcome {
    pub fn is_empty(&self) -> bool {
        self.series.is_empty() && self.studies.is_empty()
    }

    pub fn extend(&mut self, other: ReapOutcome) {
        self.series.extend(other.series);
        self.studies.extend(other.studies);
    }
}

/// 空容器回收器
pub struct EmptinessReaper;

impl EmptinessReaper {
    /// 回收空系列，并级联回收其所属检查
    ///
    /// 已不存在的系列视为已回收。
    pub fn reap_series(graph: &mut EntityGraph, series_id: Uuid) -> Result<ReapOutcome> {
        let mut outcome = ReapOutcome::default();
        let study_id = match graph.series(series_id) {
            Ok(series) => series.study_id,
            Err(_) => return Ok(outcome),
        };
        if !graph.instances_of_series(series_id).is_empty() {
            return Ok(outcome);
        }

        let series = graph.remove_series(series_id)?;
        debug!("Reaped empty series {}", series.series_uid);
        outcome.series.push(series.series_uid);
        outcome.extend(Self::reap_study(graph, study_id)?);
        Ok(outcome)
    }

    /// 回收空检查，不会级联到患者
    pub fn reap_study(graph: &mut EntityGraph, study_id: Uuid) -> Result<ReapOutcome> {
        let mut outcome = ReapOutcome::default();
        if graph.study(study_id).is_err() || !graph.series_of_study(study_id).is_empty() {
            return Ok(outcome);
        }

        let study = graph.remove_study(study_id)?;
        debug!("Reaped empty study {}", study.study_uid);
        outcome.studies.push(study.study_uid);
        Ok(outcome)
    }

    /// 依次回收一次操作触及的全部系列和检查
    pub fn reap_touched(graph: &mut EntityGraph, series_ids: &[Uuid], study_ids: &[Uuid]) -> Result<ReapOutcome> {
        let mut outcome = ReapOutcome::default();
        for series_id in series_ids {
            outcome.extend(Self::reap_series(graph, *series_id)?);
        }
        for study_id in study_ids {
            outcome.extend(Self::reap_study(graph, *study_id)?);
        }
        Ok(outcome)
    }
}
