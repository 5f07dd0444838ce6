//! 患者身份服务
//!
//! 关联、解除关联、合并和更新患者ID。引擎负责解析合并路径并检测环路，
//! 具体的身份变更委托给 [`PatientIdentityService`]。

use crate::graph::EntityGraph;
use crate::merge_path::MergePathResolver;
use pacs_core::{keywords, IdWithIssuer, PacsError, Result, StudyUid};
use tracing::{debug, info};
use uuid::Uuid;

/// 患者身份服务接口
pub trait PatientIdentityService: Send + Sync {
    /// 关联两个患者，已关联时返回 false
    fn link(&self, graph: &mut EntityGraph, source: Uuid, target: Uuid) -> Result<bool>;

    /// 解除关联，原本未关联时返回 false
    fn unlink(&self, graph: &mut EntityGraph, source: Uuid, target: Uuid) -> Result<bool>;

    /// 把 source 合并到 target，返回被迁移的检查
    fn merge(&self, graph: &mut EntityGraph, source: Uuid, target: Uuid) -> Result<Vec<StudyUid>>;

    /// 更新患者ID，返回原ID
    fn update_id(&self, graph: &mut EntityGraph, patient: Uuid, pid: &IdWithIssuer) -> Result<IdWithIssuer>;
}

/// 直接操作实体图的患者身份服务
#[derive(Debug, Default, Clone, Copy)]
pub struct GraphPatientService;

impl PatientIdentityService for GraphPatientService {
    fn link(&self, graph: &mut EntityGraph, source: Uuid, target: Uuid) -> Result<bool> {
        if source == target {
            return Err(PacsError::not_permitted("患者不能与自身关联"));
        }
        graph.patient(target)?;
        if graph.patient(source)?.linked.contains(&target) {
            return Ok(false);
        }
        graph.patient_mut(source)?.linked.insert(target);
        graph.patient_mut(target)?.linked.insert(source);
        debug!("Linked patient {} with {}", source, target);
        Ok(true)
    }

    fn unlink(&self, graph: &mut EntityGraph, source: Uuid, target: Uuid) -> Result<bool> {
        graph.patient(target)?;
        if !graph.patient(source)?.linked.contains(&target) {
            return Ok(false);
        }
        graph.patient_mut(source)?.linked.remove(&target);
        graph.patient_mut(target)?.linked.remove(&source);
        debug!("Unlinked patient {} from {}", source, target);
        Ok(true)
    }

    fn merge(&self, graph: &mut EntityGraph, source: Uuid, target: Uuid) -> Result<Vec<StudyUid>> {
        let source_patient = graph.patient(source)?;
        if source_patient.merged_into.is_some() {
            return Err(PacsError::PatientMerged(source_patient.pid.to_string()));
        }
        if MergePathResolver::would_create_cycle(graph, source, target)? {
            return Err(PacsError::CircularMerge(format!(
                "{} -> {}",
                source_patient.pid,
                graph.patient(target)?.pid
            )));
        }

        let mut moved = Vec::new();
        for study_id in graph.studies_of_patient(source) {
            graph.move_study(study_id, target)?;
            moved.push(graph.study(study_id)?.study_uid.clone());
        }
        graph.patient_mut(source)?.merged_into = Some(target);
        info!("Merged patient {} into {} ({} studies)", source, target, moved.len());
        Ok(moved)
    }

    fn update_id(&self, graph: &mut EntityGraph, patient: Uuid, pid: &IdWithIssuer) -> Result<IdWithIssuer> {
        if graph.find_patients(pid).iter().any(|other| other.id != patient) {
            return Err(PacsError::NonUniquePatient(pid.to_string()));
        }

        let record = graph.patient_mut(patient)?;
        let prior = std::mem::replace(&mut record.pid, pid.clone());
        record.attributes.set(keywords::PATIENT_ID, pid.id.as_str());
        match pid.issuer.as_ref().and_then(|issuer| issuer.local_namespace_entity_id.as_deref()) {
            Some(issuer) => {
                record.attributes.set(keywords::ISSUER_OF_PATIENT_ID, issuer);
            }
            None => {
                record.attributes.remove(keywords::ISSUER_OF_PATIENT_ID);
            }
        }
        info!("Updated patient ID {} -> {}", prior, pid);
        Ok(prior)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_core::{Attributes, Issuer, Patient};

    fn patient(graph: &mut EntityGraph, id: &str) -> Uuid {
        graph
            .add_patient(Patient::new(IdWithIssuer::new(id, Some(Issuer::local("HOSP"))), Attributes::new()))
            .unwrap()
    }

    #[test]
    fn test_link_is_symmetric() {
        let mut graph = EntityGraph::new();
        let a = patient(&mut graph, "A");
        let b = patient(&mut graph, "B");
        let service = GraphPatientService;

        assert!(service.link(&mut graph, a, b).unwrap());
        assert!(!service.link(&mut graph, b, a).unwrap());
        assert!(graph.patient(b).unwrap().linked.contains(&a));

        assert!(service.unlink(&mut graph, b, a).unwrap());
        assert!(graph.patient(a).unwrap().linked.is_empty());
        assert!(!service.unlink(&mut graph, a, b).unwrap());
    }

    #[test]
    fn test_merge_moves_studies_and_sets_pointer() {
        let mut graph = EntityGraph::new();
        let a = patient(&mut graph, "A");
        let b = patient(&mut graph, "B");
        graph.create_study(a, StudyUid::new("1.2"), Attributes::new()).unwrap();
        let service = GraphPatientService;

        let moved = service.merge(&mut graph, a, b).unwrap();
        assert_eq!(moved, vec![StudyUid::new("1.2")]);
        assert_eq!(graph.patient(a).unwrap().merged_into, Some(b));
        assert_eq!(graph.studies_of_patient(b).len(), 1);

        assert!(matches!(service.merge(&mut graph, a, b), Err(PacsError::PatientMerged(_))));
        assert!(matches!(service.merge(&mut graph, b, a), Err(PacsError::CircularMerge(_))));
        assert_eq!(graph.patient(b).unwrap().merged_into, None);
    }

    #[test]
    fn test_update_id_requires_unique_identity() {
        let mut graph = EntityGraph::new();
        let a = patient(&mut graph, "A");
        patient(&mut graph, "B");
        let service = GraphPatientService;

        let taken = IdWithIssuer::new("B", Some(Issuer::local("HOSP")));
        assert!(matches!(service.update_id(&mut graph, a, &taken), Err(PacsError::NonUniquePatient(_))));

        let fresh = IdWithIssuer::new("C", Some(Issuer::local("HOSP")));
        let prior = service.update_id(&mut graph, a, &fresh).unwrap();
        assert_eq!(prior.id, "A");
        assert_eq!(graph.patient(a).unwrap().attributes.get(keywords::PATIENT_ID), Some("C"));
    }
}
