//! 派生查询属性
//!
//! 检查/系列的实例数、可见实例数、模态列表等缓存在实体上，
//! 成员变化时由实体图置空，读取时缺失则重新计算。

use crate::config::QueryConfig;
use crate::graph::EntityGraph;
use crate::rejection::RejectionLedger;
use pacs_core::{Result, SeriesQueryAttributes, StudyQueryAttributes};
use std::collections::BTreeSet;
use uuid::Uuid;

/// 查询属性计算器
pub struct QueryAttributesCalculator;

impl QueryAttributesCalculator {
    pub fn calculate_series(graph: &EntityGraph, series_id: Uuid, config: &QueryConfig) -> Result<SeriesQueryAttributes> {
        let series = graph.series(series_id)?;
        let mut attrs = SeriesQueryAttributes {
            view_id: config.view_id.clone(),
            last_update_time: Some(series.updated_at),
            ..Default::default()
        };

        for instance_id in graph.instances_of_series(series_id) {
            let instance = graph.instance(instance_id)?;
            let visible = RejectionLedger::visible(instance);
            if visible {
                attrs.number_of_visible_instances += 1;
            }
            if visible || !config.hide_rejected_instances {
                attrs.number_of_instances += 1;
                attrs.last_update_time = attrs.last_update_time.max(Some(instance.updated_at));
            }
        }
        Ok(attrs)
    }

    pub fn calculate_study(graph: &EntityGraph, study_id: Uuid, config: &QueryConfig) -> Result<StudyQueryAttributes> {
        let study = graph.study(study_id)?;
        let mut attrs = StudyQueryAttributes {
            view_id: config.view_id.clone(),
            last_update_time: Some(study.updated_at),
            ..Default::default()
        };

        for series_id in graph.series_of_study(study_id) {
            let series = graph.series(series_id)?;
            let mut counted = 0;
            let mut visible_in_series = 0;
            let mut sop_classes = BTreeSet::new();

            for instance_id in graph.instances_of_series(series_id) {
                let instance = graph.instance(instance_id)?;
                let visible = RejectionLedger::visible(instance);
                if visible {
                    visible_in_series += 1;
                }
                if visible || !config.hide_rejected_instances {
                    counted += 1;
                    sop_classes.insert(instance.sop_class_uid.clone());
                    attrs.last_update_time = attrs.last_update_time.max(Some(instance.updated_at));
                }
            }

            attrs.number_of_visible_instances += visible_in_series;
            if visible_in_series > 0 {
                attrs.number_of_visible_series += 1;
            }
            if counted > 0 || !config.hide_rejected_instances {
                attrs.number_of_instances += counted;
                attrs.number_of_series += 1;
                attrs.sop_classes_in_study.extend(sop_classes);
                if let Some(modality) = series.modality() {
                    attrs.modalities_in_study.insert(modality.to_string());
                }
            }
        }
        Ok(attrs)
    }

    /// 读取系列查询属性，缓存缺失或视图不同时重新计算并回填
    ///
    /// 回填缓存不递增版本号。
    pub fn series(graph: &mut EntityGraph, series_id: Uuid, config: &QueryConfig) -> Result<SeriesQueryAttributes> {
        if let Some(cached) = &graph.series(series_id)?.query_attributes {
            if cached.view_id == config.view_id {
                return Ok(cached.clone());
            }
        }

        let attrs = Self::calculate_series(graph, series_id, config)?;
        if let Some(series) = graph.series.get_mut(&series_id) {
            series.query_attributes = Some(attrs.clone());
        }
        Ok(attrs)
    }

    /// 读取检查查询属性，缓存缺失或视图不同时重新计算并回填
    pub fn study(graph: &mut EntityGraph, study_id: Uuid, config: &QueryConfig) -> Result<StudyQueryAttributes> {
        if let Some(cached) = &graph.study(study_id)?.query_attributes {
            if cached.view_id == config.view_id {
                return Ok(cached.clone());
            }
        }

        let attrs = Self::calculate_study(graph, study_id, config)?;
        if let Some(study) = graph.studies.get_mut(&study_id) {
            study.query_attributes = Some(attrs.clone());
        }
        Ok(attrs)
    }
}
