//! 实体图模型
//!
//! 保存患者/检查/系列/实例/存储位置/编码表及其父子索引，
//! 提供结构变更所需的重挂接、克隆和删除原语。

use pacs_core::{
    keywords, Attributes, Code, CodeEntity, Entity, IdWithIssuer, Instance, Location, PacsError,
    Patient, Result, Series, SeriesUid, SopInstanceUid, Study, StudyUid,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;
use uuid::Uuid;

/// 实体图
#[derive(Debug, Clone, Default)]
pub struct EntityGraph {
    pub(crate) patients: HashMap<Uuid, Patient>,
    pub(crate) studies: HashMap<Uuid, Study>,
    pub(crate) series: HashMap<Uuid, Series>,
    pub(crate) instances: HashMap<Uuid, Instance>,
    pub(crate) locations: HashMap<Uuid, Location>,
    pub(crate) codes: HashMap<Uuid, CodeEntity>,

    study_by_uid: HashMap<StudyUid, Uuid>,
    series_by_uid: HashMap<SeriesUid, Uuid>,
    instance_by_uid: HashMap<SopInstanceUid, Uuid>,
    patient_studies: HashMap<Uuid, BTreeSet<Uuid>>,
    study_series: HashMap<Uuid, BTreeSet<Uuid>>,
    series_instances: HashMap<Uuid, BTreeSet<Uuid>>,
    location_refs: HashMap<Uuid, BTreeSet<Uuid>>,
}

/// 实体图的可序列化快照
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub patients: Vec<Patient>,
    #[serde(default)]
    pub studies: Vec<Study>,
    #[serde(default)]
    pub series: Vec<Series>,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub codes: Vec<CodeEntity>,
}

/// 各表记录数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphCounts {
    pub patients: usize,
    pub studies: usize,
    pub series: usize,
    pub instances: usize,
    pub locations: usize,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从快照构建，校验引用完整性
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self> {
        let mut graph = Self::new();
        for code in snapshot.codes {
            graph.codes.insert(code.id, code);
        }
        for location in snapshot.locations {
            graph.add_location(location)?;
        }
        for patient in snapshot.patients {
            graph.add_patient(patient)?;
        }
        for study in snapshot.studies {
            graph.add_study(study)?;
        }
        for series in snapshot.series {
            graph.add_series(series)?;
        }
        for instance in snapshot.instances {
            graph.add_instance(instance)?;
        }
        Ok(graph)
    }

    /// 导出快照（按创建时间和UID排序，输出稳定）
    pub fn snapshot(&self) -> GraphSnapshot {
        let mut patients: Vec<Patient> = self.patients.values().cloned().collect();
        patients.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.pid.id.cmp(&b.pid.id)));
        let mut studies: Vec<Study> = self.studies.values().cloned().collect();
        studies.sort_by(|a, b| a.study_uid.cmp(&b.study_uid));
        let mut series: Vec<Series> = self.series.values().cloned().collect();
        series.sort_by(|a, b| a.series_uid.cmp(&b.series_uid));
        let mut instances: Vec<Instance> = self.instances.values().cloned().collect();
        instances.sort_by(|a, b| a.sop_instance_uid.cmp(&b.sop_instance_uid));
        let mut locations: Vec<Location> = self.locations.values().cloned().collect();
        locations.sort_by(|a, b| a.storage_path.cmp(&b.storage_path).then(a.id.cmp(&b.id)));
        let mut codes: Vec<CodeEntity> = self.codes.values().cloned().collect();
        codes.sort_by(|a, b| a.code.value.cmp(&b.code.value).then(a.id.cmp(&b.id)));

        GraphSnapshot {
            patients,
            studies,
            series,
            instances,
            locations,
            codes,
        }
    }

    pub fn counts(&self) -> GraphCounts {
        GraphCounts {
            patients: self.patients.len(),
            studies: self.studies.len(),
            series: self.series.len(),
            instances: self.instances.len(),
            locations: self.locations.len(),
        }
    }

    /// 根据表内容重建全部索引
    pub(crate) fn reindex(&mut self) {
        self.study_by_uid.clear();
        self.series_by_uid.clear();
        self.instance_by_uid.clear();
        self.patient_studies.clear();
        self.study_series.clear();
        self.series_instances.clear();
        self.location_refs.clear();

        for id in self.patients.keys() {
            self.patient_studies.insert(*id, BTreeSet::new());
        }
        for study in self.studies.values() {
            self.study_by_uid.insert(study.study_uid.clone(), study.id);
            self.patient_studies.entry(study.patient_id).or_default().insert(study.id);
            self.study_series.entry(study.id).or_default();
        }
        for series in self.series.values() {
            self.series_by_uid.insert(series.series_uid.clone(), series.id);
            self.study_series.entry(series.study_id).or_default().insert(series.id);
            self.series_instances.entry(series.id).or_default();
        }
        for instance in self.instances.values() {
            self.instance_by_uid.insert(instance.sop_instance_uid.clone(), instance.id);
            self.series_instances.entry(instance.series_id).or_default().insert(instance.id);
            for location_id in &instance.locations {
                self.location_refs.entry(*location_id).or_default().insert(instance.id);
            }
        }
    }

    // ========== 入库路径（外部协作方） ==========

    pub fn add_patient(&mut self, patient: Patient) -> Result<Uuid> {
        if self.patients.contains_key(&patient.id) {
            return Err(PacsError::not_permitted(format!("患者 {} 已存在", patient.id)));
        }
        let id = patient.id;
        self.patient_studies.entry(id).or_default();
        self.patients.insert(id, patient);
        Ok(id)
    }

    pub fn add_study(&mut self, study: Study) -> Result<Uuid> {
        if !self.patients.contains_key(&study.patient_id) {
            return Err(PacsError::not_found(format!("Patient {}", study.patient_id)));
        }
        if self.study_by_uid.contains_key(&study.study_uid) {
            return Err(PacsError::not_permitted(format!("检查 {} 已存在", study.study_uid)));
        }
        let id = study.id;
        self.study_by_uid.insert(study.study_uid.clone(), id);
        self.patient_studies.entry(study.patient_id).or_default().insert(id);
        self.study_series.entry(id).or_default();
        self.studies.insert(id, study);
        Ok(id)
    }

    pub fn add_series(&mut self, series: Series) -> Result<Uuid> {
        if !self.studies.contains_key(&series.study_id) {
            return Err(PacsError::not_found(format!("Study {}", series.study_id)));
        }
        if self.series_by_uid.contains_key(&series.series_uid) {
            return Err(PacsError::not_permitted(format!("系列 {} 已存在", series.series_uid)));
        }
        let id = series.id;
        self.series_by_uid.insert(series.series_uid.clone(), id);
        self.study_series.entry(series.study_id).or_default().insert(id);
        self.series_instances.entry(id).or_default();
        self.series.insert(id, series);
        Ok(id)
    }

    pub fn add_instance(&mut self, instance: Instance) -> Result<Uuid> {
        if !self.series.contains_key(&instance.series_id) {
            return Err(PacsError::not_found(format!("Series {}", instance.series_id)));
        }
        if self.instance_by_uid.contains_key(&instance.sop_instance_uid) {
            return Err(PacsError::not_permitted(format!(
                "实例 {} 已存在",
                instance.sop_instance_uid
            )));
        }
        if let Some(missing) = instance.locations.iter().find(|id| !self.locations.contains_key(id)) {
            return Err(PacsError::not_found(format!("Location {}", missing)));
        }
        let id = instance.id;
        self.instance_by_uid.insert(instance.sop_instance_uid.clone(), id);
        self.series_instances.entry(instance.series_id).or_default().insert(id);
        for location_id in &instance.locations {
            self.location_refs.entry(*location_id).or_default().insert(id);
        }
        self.instances.insert(id, instance);
        Ok(id)
    }

    pub fn add_location(&mut self, location: Location) -> Result<Uuid> {
        let id = location.id;
        self.location_refs.entry(id).or_default();
        self.locations.insert(id, location);
        Ok(id)
    }

    // ========== 查询 ==========

    pub fn patient(&self, id: Uuid) -> Result<&Patient> {
        self.patients.get(&id).ok_or_else(|| PacsError::not_found(format!("Patient {}", id)))
    }

    pub fn study(&self, id: Uuid) -> Result<&Study> {
        self.studies.get(&id).ok_or_else(|| PacsError::not_found(format!("Study {}", id)))
    }

    pub fn series(&self, id: Uuid) -> Result<&Series> {
        self.series.get(&id).ok_or_else(|| PacsError::not_found(format!("Series {}", id)))
    }

    pub fn instance(&self, id: Uuid) -> Result<&Instance> {
        self.instances.get(&id).ok_or_else(|| PacsError::not_found(format!("Instance {}", id)))
    }

    pub fn location(&self, id: Uuid) -> Result<&Location> {
        self.locations.get(&id).ok_or_else(|| PacsError::not_found(format!("Location {}", id)))
    }

    pub fn find_study(&self, uid: &StudyUid) -> Option<&Study> {
        self.study_by_uid.get(uid).and_then(|id| self.studies.get(id))
    }

    pub fn find_series(&self, uid: &SeriesUid) -> Option<&Series> {
        self.series_by_uid.get(uid).and_then(|id| self.series.get(id))
    }

    pub fn find_instance(&self, uid: &SopInstanceUid) -> Option<&Instance> {
        self.instance_by_uid.get(uid).and_then(|id| self.instances.get(id))
    }

    pub fn study_by_uid(&self, uid: &StudyUid) -> Result<&Study> {
        self.find_study(uid).ok_or_else(|| PacsError::not_found(format!("Study {}", uid)))
    }

    pub fn series_by_uid(&self, uid: &SeriesUid) -> Result<&Series> {
        self.find_series(uid).ok_or_else(|| PacsError::not_found(format!("Series {}", uid)))
    }

    pub fn instance_by_uid(&self, uid: &SopInstanceUid) -> Result<&Instance> {
        self.find_instance(uid).ok_or_else(|| PacsError::not_found(format!("Instance {}", uid)))
    }

    /// 按患者ID及签发机构查找患者（按创建时间排序）
    pub fn find_patients(&self, pid: &IdWithIssuer) -> Vec<&Patient> {
        let mut patients: Vec<&Patient> =
            self.patients.values().filter(|p| p.pid.matches(pid)).collect();
        patients.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        patients
    }

    pub fn patients(&self) -> impl Iterator<Item = &Patient> {
        self.patients.values()
    }

    pub fn studies_of_patient(&self, patient_id: Uuid) -> Vec<Uuid> {
        self.patient_studies
            .get(&patient_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn series_of_study(&self, study_id: Uuid) -> Vec<Uuid> {
        self.study_series
            .get(&study_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn instances_of_series(&self, series_id: Uuid) -> Vec<Uuid> {
        self.series_instances
            .get(&series_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn instances_of_study(&self, study_id: Uuid) -> Vec<Uuid> {
        self.series_of_study(study_id)
            .into_iter()
            .flat_map(|series_id| self.instances_of_series(series_id))
            .collect()
    }

    pub fn instances_of_patient(&self, patient_id: Uuid) -> Vec<Uuid> {
        self.studies_of_patient(patient_id)
            .into_iter()
            .flat_map(|study_id| self.instances_of_study(study_id))
            .collect()
    }

    /// 实例所属检查
    pub fn study_of_instance(&self, instance_id: Uuid) -> Result<&Study> {
        let instance = self.instance(instance_id)?;
        let series = self.series(instance.series_id)?;
        self.study(series.study_id)
    }

    // ========== 可变访问（自动递增版本号） ==========

    pub fn patient_mut(&mut self, id: Uuid) -> Result<&mut Patient> {
        let patient = self
            .patients
            .get_mut(&id)
            .ok_or_else(|| PacsError::not_found(format!("Patient {}", id)))?;
        patient.touch();
        Ok(patient)
    }

    pub fn study_mut(&mut self, id: Uuid) -> Result<&mut Study> {
        let study = self
            .studies
            .get_mut(&id)
            .ok_or_else(|| PacsError::not_found(format!("Study {}", id)))?;
        study.touch();
        Ok(study)
    }

    pub fn series_mut(&mut self, id: Uuid) -> Result<&mut Series> {
        let series = self
            .series
            .get_mut(&id)
            .ok_or_else(|| PacsError::not_found(format!("Series {}", id)))?;
        series.touch();
        Ok(series)
    }

    pub fn instance_mut(&mut self, id: Uuid) -> Result<&mut Instance> {
        let instance = self
            .instances
            .get_mut(&id)
            .ok_or_else(|| PacsError::not_found(format!("Instance {}", id)))?;
        instance.touch();
        Ok(instance)
    }

    // ========== 聚合失效 ==========

    /// 清除系列及其所属检查的派生查询属性
    pub fn invalidate_series_aggregates(&mut self, series_id: Uuid) -> Result<()> {
        let series = self.series_mut(series_id)?;
        series.query_attributes = None;
        let study_id = series.study_id;
        self.invalidate_study_aggregates(study_id)
    }

    pub fn invalidate_study_aggregates(&mut self, study_id: Uuid) -> Result<()> {
        let study = self.study_mut(study_id)?;
        study.query_attributes = None;
        Ok(())
    }

    // ========== 结构变更原语 ==========

    /// 在患者下创建检查
    pub fn create_study(&mut self, patient_id: Uuid, uid: StudyUid, attributes: Attributes) -> Result<Uuid> {
        let mut attributes = attributes;
        attributes.set(keywords::STUDY_INSTANCE_UID, uid.as_str());
        let id = self.add_study(Study::new(uid.clone(), patient_id, attributes))?;
        debug!("Created study {} for patient {}", uid, patient_id);
        Ok(id)
    }

    /// 在检查下创建系列
    pub fn create_series(&mut self, study_id: Uuid, uid: SeriesUid, attributes: Attributes) -> Result<Uuid> {
        let mut attributes = attributes;
        attributes.set(keywords::SERIES_INSTANCE_UID, uid.as_str());
        let id = self.add_series(Series::new(uid.clone(), study_id, attributes))?;
        self.invalidate_study_aggregates(study_id)?;
        debug!("Created series {} in study {}", uid, study_id);
        Ok(id)
    }

    /// 把实例从当前系列摘下并挂到目标系列，返回原系列
    pub fn move_instance(&mut self, instance_id: Uuid, target_series_id: Uuid) -> Result<Uuid> {
        let target = self.series(target_series_id)?;
        let target_series_uid = target.series_uid.clone();
        let target_study_uid = self.study(target.study_id)?.study_uid.clone();

        let instance = self.instance_mut(instance_id)?;
        let source_series_id = instance.series_id;
        if source_series_id == target_series_id {
            return Ok(source_series_id);
        }
        instance.series_id = target_series_id;
        if instance.attributes.contains(keywords::SERIES_INSTANCE_UID) {
            instance.attributes.set(keywords::SERIES_INSTANCE_UID, target_series_uid.as_str());
        }
        if instance.attributes.contains(keywords::STUDY_INSTANCE_UID) {
            instance.attributes.set(keywords::STUDY_INSTANCE_UID, target_study_uid.as_str());
        }

        if let Some(children) = self.series_instances.get_mut(&source_series_id) {
            children.remove(&instance_id);
        }
        self.series_instances.entry(target_series_id).or_default().insert(instance_id);

        self.invalidate_series_aggregates(source_series_id)?;
        self.invalidate_series_aggregates(target_series_id)?;
        debug!("Moved instance {} from series {} to {}", instance_id, source_series_id, target_series_id);
        Ok(source_series_id)
    }

    /// 把整个系列重挂到目标检查，返回原检查
    pub fn move_series(&mut self, series_id: Uuid, target_study_id: Uuid) -> Result<Uuid> {
        let target_study_uid = self.study(target_study_id)?.study_uid.clone();

        let series = self.series_mut(series_id)?;
        let source_study_id = series.study_id;
        if source_study_id == target_study_id {
            return Ok(source_study_id);
        }
        series.study_id = target_study_id;
        series.query_attributes = None;
        if series.attributes.contains(keywords::STUDY_INSTANCE_UID) {
            series.attributes.set(keywords::STUDY_INSTANCE_UID, target_study_uid.as_str());
        }

        if let Some(children) = self.study_series.get_mut(&source_study_id) {
            children.remove(&series_id);
        }
        self.study_series.entry(target_study_id).or_default().insert(series_id);

        for instance_id in self.instances_of_series(series_id) {
            let instance = self.instance_mut(instance_id)?;
            if instance.attributes.contains(keywords::STUDY_INSTANCE_UID) {
                instance.attributes.set(keywords::STUDY_INSTANCE_UID, target_study_uid.as_str());
            }
        }

        self.invalidate_study_aggregates(source_study_id)?;
        self.invalidate_study_aggregates(target_study_id)?;
        debug!("Moved series {} from study {} to {}", series_id, source_study_id, target_study_id);
        Ok(source_study_id)
    }

    /// 把检查重挂到目标患者，返回原患者
    pub fn move_study(&mut self, study_id: Uuid, target_patient_id: Uuid) -> Result<Uuid> {
        self.patient(target_patient_id)?;
        let study = self.study_mut(study_id)?;
        let source_patient_id = study.patient_id;
        if source_patient_id == target_patient_id {
            return Ok(source_patient_id);
        }
        study.patient_id = target_patient_id;
        study.query_attributes = None;

        if let Some(children) = self.patient_studies.get_mut(&source_patient_id) {
            children.remove(&study_id);
        }
        self.patient_studies.entry(target_patient_id).or_default().insert(study_id);

        self.patient_mut(source_patient_id)?;
        self.patient_mut(target_patient_id)?;
        debug!("Moved study {} from patient {} to {}", study_id, source_patient_id, target_patient_id);
        Ok(source_patient_id)
    }

    /// 克隆实例到目标系列：新SOP Instance UID，存储位置按引用共享
    pub fn clone_instance(
        &mut self,
        instance_id: Uuid,
        target_series_id: Uuid,
        new_uid: SopInstanceUid,
    ) -> Result<Uuid> {
        let target = self.series(target_series_id)?;
        let target_series_uid = target.series_uid.clone();
        let target_study_uid = self.study(target.study_id)?.study_uid.clone();
        let source = self.instance(instance_id)?;

        let mut attributes = source.attributes.clone();
        for (keyword, value) in [
            (keywords::SOP_INSTANCE_UID, new_uid.as_str()),
            (keywords::SERIES_INSTANCE_UID, target_series_uid.as_str()),
            (keywords::STUDY_INSTANCE_UID, target_study_uid.as_str()),
        ] {
            if attributes.contains(keyword) {
                attributes.set(keyword, value);
            }
        }

        let mut clone = Instance::new(new_uid, source.sop_class_uid.clone(), target_series_id, attributes);
        clone.instance_number = source.instance_number;
        clone.locations = source.locations.clone();

        let clone_id = self.add_instance(clone)?;
        self.invalidate_series_aggregates(target_series_id)?;
        debug!("Cloned instance {} into series {} as {}", instance_id, target_series_id, clone_id);
        Ok(clone_id)
    }

    /// 删除实例；不再被任何实例引用的存储位置一并删除
    pub fn remove_instance(&mut self, instance_id: Uuid) -> Result<(Instance, Vec<Location>)> {
        let instance = self
            .instances
            .remove(&instance_id)
            .ok_or_else(|| PacsError::not_found(format!("Instance {}", instance_id)))?;
        self.instance_by_uid.remove(&instance.sop_instance_uid);
        if let Some(children) = self.series_instances.get_mut(&instance.series_id) {
            children.remove(&instance_id);
        }

        let mut orphaned = Vec::new();
        for location_id in &instance.locations {
            let unreferenced = match self.location_refs.get_mut(location_id) {
                Some(refs) => {
                    refs.remove(&instance_id);
                    refs.is_empty()
                }
                None => true,
            };
            if unreferenced {
                self.location_refs.remove(location_id);
                if let Some(location) = self.locations.remove(location_id) {
                    orphaned.push(location);
                }
            }
        }

        self.invalidate_series_aggregates(instance.series_id)?;
        Ok((instance, orphaned))
    }

    /// 删除空系列
    pub fn remove_series(&mut self, series_id: Uuid) -> Result<Series> {
        self.series(series_id)?;
        if !self.instances_of_series(series_id).is_empty() {
            return Err(PacsError::not_permitted(format!("系列 {} 非空", series_id)));
        }
        let series = self
            .series
            .remove(&series_id)
            .ok_or_else(|| PacsError::not_found(format!("Series {}", series_id)))?;
        self.series_by_uid.remove(&series.series_uid);
        self.series_instances.remove(&series_id);
        if let Some(children) = self.study_series.get_mut(&series.study_id) {
            children.remove(&series_id);
        }
        self.invalidate_study_aggregates(series.study_id)?;
        Ok(series)
    }

    /// 删除空检查
    pub fn remove_study(&mut self, study_id: Uuid) -> Result<Study> {
        self.study(study_id)?;
        if !self.series_of_study(study_id).is_empty() {
            return Err(PacsError::not_permitted(format!("检查 {} 非空", study_id)));
        }
        let study = self
            .studies
            .remove(&study_id)
            .ok_or_else(|| PacsError::not_found(format!("Study {}", study_id)))?;
        self.study_by_uid.remove(&study.study_uid);
        self.study_series.remove(&study_id);
        if let Some(children) = self.patient_studies.get_mut(&study.patient_id) {
            children.remove(&study_id);
        }
        Ok(study)
    }

    /// 删除无检查的患者，并解除其他患者对它的关联
    pub fn remove_patient(&mut self, patient_id: Uuid) -> Result<Patient> {
        self.patient(patient_id)?;
        if !self.studies_of_patient(patient_id).is_empty() {
            return Err(PacsError::not_permitted(format!("患者 {} 仍有检查", patient_id)));
        }
        let patient = self
            .patients
            .remove(&patient_id)
            .ok_or_else(|| PacsError::not_found(format!("Patient {}", patient_id)))?;
        self.patient_studies.remove(&patient_id);
        for other in patient.linked.iter() {
            if let Ok(linked) = self.patient_mut(*other) {
                linked.linked.remove(&patient_id);
            }
        }
        Ok(patient)
    }

    // ========== 编码表 ==========

    pub fn find_code(&self, code: &Code) -> Option<&CodeEntity> {
        self.codes.values().find(|entity| entity.code.same_code(code))
    }

    /// 查找或登记编码，返回稳定的编码ID
    pub fn find_or_create_code(&mut self, code: &Code) -> Uuid {
        if let Some(existing) = self.find_code(code) {
            return existing.id;
        }
        let entity = CodeEntity {
            id: Uuid::new_v4(),
            code: code.clone(),
            version: 0,
        };
        let id = entity.id;
        self.codes.insert(id, entity);
        id
    }

    pub fn code(&self, id: Uuid) -> Result<&CodeEntity> {
        self.codes.get(&id).ok_or_else(|| PacsError::not_found(format!("Code {}", id)))
    }
}
