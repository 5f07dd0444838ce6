//! 核心数据模型定义
//!
//! 患者 → 检查 → 系列 → 实例 四级层次结构，以及存储位置、编码值和派生查询属性。

use crate::attributes::{keywords, Attributes};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// DICOM Study Instance UID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudyUid(String);

/// DICOM Series Instance UID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeriesUid(String);

/// DICOM SOP Instance UID，全局唯一
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SopInstanceUid(String);

impl StudyUid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl SeriesUid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl SopInstanceUid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudyUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SeriesUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for SopInstanceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StudyUid {
    fn from(uid: &str) -> Self {
        Self::new(uid)
    }
}

impl From<&str> for SeriesUid {
    fn from(uid: &str) -> Self {
        Self::new(uid)
    }
}

impl From<&str> for SopInstanceUid {
    fn from(uid: &str) -> Self {
        Self::new(uid)
    }
}

/// 患者ID签发机构
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Issuer {
    pub local_namespace_entity_id: Option<String>,
    pub universal_entity_id: Option<String>,
    pub universal_entity_id_type: Option<String>,
}

impl Issuer {
    pub fn local(entity_id: impl Into<String>) -> Self {
        Self {
            local_namespace_entity_id: Some(entity_id.into()),
            ..Default::default()
        }
    }

    /// 判断两个签发机构是否指同一机构
    ///
    /// 只有本地命名空间ID时按其比较，只有全局ID时按全局ID及类型比较，
    /// 两者都存在时任一匹配即可。
    pub fn matches(&self, other: &Issuer) -> bool {
        let local_match = match (&self.local_namespace_entity_id, &other.local_namespace_entity_id) {
            (Some(a), Some(b)) => Some(a == b),
            _ => None,
        };
        let universal_match = match (&self.universal_entity_id, &other.universal_entity_id) {
            (Some(a), Some(b)) => {
                Some(a == b && self.universal_entity_id_type == other.universal_entity_id_type)
            }
            _ => None,
        };

        match (local_match, universal_match) {
            (Some(l), Some(u)) => l || u,
            (Some(l), None) => l,
            (None, Some(u)) => u,
            (None, None) => false,
        }
    }
}

impl fmt::Display for Issuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}&{}&{}",
            self.local_namespace_entity_id.as_deref().unwrap_or(""),
            self.universal_entity_id.as_deref().unwrap_or(""),
            self.universal_entity_id_type.as_deref().unwrap_or("")
        )
    }
}

/// 带签发机构的患者ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdWithIssuer {
    pub id: String,
    pub issuer: Option<Issuer>,
}

impl IdWithIssuer {
    pub fn new(id: impl Into<String>, issuer: Option<Issuer>) -> Self {
        Self { id: id.into(), issuer }
    }

    /// 从患者属性中提取 PatientID / IssuerOfPatientID
    pub fn from_attributes(attrs: &Attributes) -> Option<Self> {
        let id = attrs.get(keywords::PATIENT_ID)?.trim();
        if id.is_empty() {
            return None;
        }

        let issuer = Issuer {
            local_namespace_entity_id: attrs.get(keywords::ISSUER_OF_PATIENT_ID).map(str::to_string),
            universal_entity_id: attrs.get(keywords::ISSUER_UNIVERSAL_ENTITY_ID).map(str::to_string),
            universal_entity_id_type: attrs
                .get(keywords::ISSUER_UNIVERSAL_ENTITY_ID_TYPE)
                .map(str::to_string),
        };
        let issuer = if issuer == Issuer::default() { None } else { Some(issuer) };

        Some(Self::new(id, issuer))
    }

    /// ID相同且签发机构兼容（任一方缺省签发机构时只比较ID）
    pub fn matches(&self, other: &IdWithIssuer) -> bool {
        if self.id != other.id {
            return false;
        }
        match (&self.issuer, &other.issuer) {
            (Some(a), Some(b)) => a.matches(b),
            _ => true,
        }
    }
}

impl fmt::Display for IdWithIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.issuer {
            Some(issuer) => write!(f, "{}^^^{}", self.id, issuer),
            None => f.write_str(&self.id),
        }
    }
}

/// 带乐观锁版本号的持久化实体
pub trait Entity {
    fn id(&self) -> Uuid;

    fn version(&self) -> u64;

    /// 标记实体已被修改
    fn touch(&mut self);
}

/// 患者
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub pid: IdWithIssuer,
    pub attributes: Attributes,
    /// 合并指向（弱引用，仅用于合并路径解析）
    #[serde(default)]
    pub merged_into: Option<Uuid>,
    /// 关联患者
    #[serde(default)]
    pub linked: BTreeSet<Uuid>,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Patient {
    pub fn new(pid: IdWithIssuer, attributes: Attributes) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            pid,
            attributes,
            merged_into: None,
            linked: BTreeSet::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 检查
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    pub id: Uuid,
    pub study_uid: StudyUid,
    pub patient_id: Uuid,
    pub attributes: Attributes,
    /// 派生查询属性缓存，成员变化时置空
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_attributes: Option<StudyQueryAttributes>,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Study {
    pub fn new(study_uid: StudyUid, patient_id: Uuid, attributes: Attributes) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            study_uid,
            patient_id,
            attributes,
            query_attributes: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn description(&self) -> Option<&str> {
        self.attributes.get(keywords::STUDY_DESCRIPTION)
    }

    pub fn accession_number(&self) -> Option<&str> {
        self.attributes.get(keywords::ACCESSION_NUMBER)
    }
}

/// 系列
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub id: Uuid,
    pub series_uid: SeriesUid,
    pub study_id: Uuid,
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_attributes: Option<SeriesQueryAttributes>,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Series {
    pub fn new(series_uid: SeriesUid, study_id: Uuid, attributes: Attributes) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            series_uid,
            study_id,
            attributes,
            query_attributes: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn modality(&self) -> Option<&str> {
        self.attributes.get(keywords::MODALITY)
    }
}

/// 拒绝墓碑：不删除实例及其存储位置，只引用拒绝原因编码
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub code_id: Uuid,
    pub rejected_at: DateTime<Utc>,
}

/// 影像实例
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub sop_instance_uid: SopInstanceUid,
    pub sop_class_uid: String,
    pub series_id: Uuid,
    pub instance_number: Option<i32>,
    pub attributes: Attributes,
    /// 存储位置（按引用共享，克隆实例不复制位置记录）
    #[serde(default)]
    pub locations: Vec<Uuid>,
    #[serde(default)]
    pub rejection: Option<Rejection>,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(
        sop_instance_uid: SopInstanceUid,
        sop_class_uid: impl Into<String>,
        series_id: Uuid,
        attributes: Attributes,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sop_instance_uid,
            sop_class_uid: sop_class_uid.into(),
            series_id,
            instance_number: None,
            attributes,
            locations: Vec::new(),
            rejection: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }
}

/// 物理存储位置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub storage_id: String,
    pub storage_path: String,
    pub transfer_syntax_uid: String,
    pub size: i64,
    pub digest: Option<String>,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Location {
    pub fn new(
        storage_id: impl Into<String>,
        storage_path: impl Into<String>,
        transfer_syntax_uid: impl Into<String>,
        size: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            storage_id: storage_id.into(),
            storage_path: storage_path.into(),
            transfer_syntax_uid: transfer_syntax_uid.into(),
            size,
            digest: None,
            version: 0,
            created_at: Utc::now(),
        }
    }
}

/// 编码值（拒绝原因、归档延迟原因等）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
    pub value: String,
    pub scheme: String,
    #[serde(default)]
    pub scheme_version: Option<String>,
    pub meaning: String,
}

impl Code {
    pub fn new(value: impl Into<String>, scheme: impl Into<String>, meaning: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            scheme: scheme.into(),
            scheme_version: None,
            meaning: meaning.into(),
        }
    }

    /// 去重键：编码值、编码方案及版本，不含含义文本
    pub fn same_code(&self, other: &Code) -> bool {
        self.value == other.value
            && self.scheme == other.scheme
            && self.scheme_version == other.scheme_version
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, \"{}\")", self.value, self.scheme, self.meaning)
    }
}

/// 已登记的编码
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeEntity {
    pub id: Uuid,
    pub code: Code,
    #[serde(default)]
    pub version: u64,
}

/// 检查级派生查询属性
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyQueryAttributes {
    pub view_id: String,
    pub number_of_instances: usize,
    pub number_of_series: usize,
    pub number_of_visible_instances: usize,
    pub number_of_visible_series: usize,
    pub modalities_in_study: BTreeSet<String>,
    pub sop_classes_in_study: BTreeSet<String>,
    pub last_update_time: Option<DateTime<Utc>>,
}

/// 系列级派生查询属性
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesQueryAttributes {
    pub view_id: String,
    pub number_of_instances: usize,
    pub number_of_visible_instances: usize,
    pub last_update_time: Option<DateTime<Utc>>,
}

impl Entity for Patient {
    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

impl Entity for Study {
    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

impl Entity for Series {
    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

impl Entity for Instance {
    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

impl Entity for Location {
    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn touch(&mut self) {
        self.version += 1;
    }
}

impl Entity for CodeEntity {
    fn id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn touch(&mut self) {
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issuer_matching() {
        let local = Issuer::local("HOSP_A");
        assert!(local.matches(&Issuer::local("HOSP_A")));
        assert!(!local.matches(&Issuer::local("HOSP_B")));

        let universal = Issuer {
            local_namespace_entity_id: None,
            universal_entity_id: Some("1.2.3.4".into()),
            universal_entity_id_type: Some("ISO".into()),
        };
        let both = Issuer {
            local_namespace_entity_id: Some("HOSP_X".into()),
            universal_entity_id: Some("1.2.3.4".into()),
            universal_entity_id_type: Some("ISO".into()),
        };
        assert!(both.matches(&universal));
        assert!(!local.matches(&universal));
    }

    #[test]
    fn test_id_with_issuer_from_attributes() {
        let attrs = Attributes::from([
            (keywords::PATIENT_ID, "P001"),
            (keywords::ISSUER_OF_PATIENT_ID, "HOSP_A"),
        ]);
        let pid = IdWithIssuer::from_attributes(&attrs).unwrap();
        assert_eq!(pid.id, "P001");
        assert!(pid.matches(&IdWithIssuer::new("P001", None)));
        assert!(!pid.matches(&IdWithIssuer::new("P001", Some(Issuer::local("HOSP_B")))));

        assert!(IdWithIssuer::from_attributes(&Attributes::new()).is_none());
    }

    #[test]
    fn test_code_dedup_key_ignores_meaning() {
        let a = Code::new("113001", "DCM", "Rejected for Quality Reasons");
        let b = Code::new("113001", "DCM", "Rejected (QC)");
        assert!(a.same_code(&b));
        assert!(!a.same_code(&Code::new("113039", "DCM", "Data Retention Policy Expired")));
    }
}
