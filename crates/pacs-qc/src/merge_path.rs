//! 患者合并路径解析
//!
//! 沿 `merged_into` 指针迭代查找权威患者记录，用访问集合检测环路。

use crate::graph::EntityGraph;
use pacs_core::{PacsError, Patient, Result};
use std::collections::HashSet;
use uuid::Uuid;

/// 合并路径解析器
pub struct MergePathResolver;

impl MergePathResolver {
    /// 返回权威患者
    ///
    /// 重复访问同一患者时返回 `CircularMerge`，指针指向不存在的患者时返回 `NotFound`。
    pub fn resolve(graph: &EntityGraph, patient_id: Uuid) -> Result<&Patient> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        let mut current = graph.patient(patient_id)?;

        loop {
            if !visited.insert(current.id) {
                path.push(current.pid.to_string());
                return Err(PacsError::CircularMerge(path.join(" -> ")));
            }
            path.push(current.pid.to_string());

            match current.merged_into {
                Some(next) => {
                    current = graph
                        .patient(next)
                        .map_err(|_| PacsError::not_found(format!("合并目标患者 {} (来自 {})", next, current.pid)))?;
                }
                None => return Ok(current),
            }
        }
    }

    /// 合并路径（含起点和终点）的患者ID列表
    pub fn path(graph: &EntityGraph, patient_id: Uuid) -> Result<Vec<Uuid>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        let mut current = Some(patient_id);

        while let Some(id) = current {
            if !visited.insert(id) {
                return Err(PacsError::CircularMerge(format!("患者 {} 的合并路径存在环路", patient_id)));
            }
            path.push(id);
            current = graph.patient(id)?.merged_into;
        }
        Ok(path)
    }

    /// 新增 `source -> target` 合并指针是否会形成环路
    ///
    /// 只需检查 target 现有的合并路径是否经过 source。
    pub fn would_create_cycle(graph: &EntityGraph, source: Uuid, target: Uuid) -> Result<bool> {
        if source == target {
            return Ok(true);
        }
        Ok(Self::path(graph, target)?.contains(&source))
    }

    /// 两个患者是否解析到同一权威记录
    pub fn same_patient(graph: &EntityGraph, a: Uuid, b: Uuid) -> Result<bool> {
        Ok(Self::resolve(graph, a)?.id == Self::resolve(graph, b)?.id)
    }
}
