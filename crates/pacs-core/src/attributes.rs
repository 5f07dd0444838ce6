//! 描述性属性集合
//!
//! 以DICOM关键字为键保存患者/检查/系列/实例的描述性属性，
//! 并提供结构变更时使用的属性覆盖规则。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 常用DICOM关键字
pub mod keywords {
    pub const PATIENT_ID: &str = "PatientID";
    pub const ISSUER_OF_PATIENT_ID: &str = "IssuerOfPatientID";
    pub const ISSUER_UNIVERSAL_ENTITY_ID: &str = "UniversalEntityID";
    pub const ISSUER_UNIVERSAL_ENTITY_ID_TYPE: &str = "UniversalEntityIDType";
    pub const PATIENT_NAME: &str = "PatientName";
    pub const PATIENT_SEX: &str = "PatientSex";
    pub const PATIENT_BIRTH_DATE: &str = "PatientBirthDate";
    pub const STUDY_INSTANCE_UID: &str = "StudyInstanceUID";
    pub const STUDY_DESCRIPTION: &str = "StudyDescription";
    pub const ACCESSION_NUMBER: &str = "AccessionNumber";
    pub const SERIES_INSTANCE_UID: &str = "SeriesInstanceUID";
    pub const SERIES_DESCRIPTION: &str = "SeriesDescription";
    pub const MODALITY: &str = "Modality";
    pub const SOP_INSTANCE_UID: &str = "SOPInstanceUID";
    pub const SOP_CLASS_UID: &str = "SOPClassUID";
}

/// 描述性属性
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, String>);

impl Attributes {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.0.get(keyword).map(String::as_str)
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.0.contains_key(keyword)
    }

    /// 设置属性，返回原值
    pub fn set(&mut self, keyword: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(keyword.into(), value.into())
    }

    pub fn remove(&mut self, keyword: &str) -> Option<String> {
        self.0.remove(keyword)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// 用另一组属性覆盖当前属性
    pub fn overlay(&mut self, other: &Attributes) {
        for (keyword, value) in other.iter() {
            self.0.insert(keyword.to_string(), value.to_string());
        }
    }

    /// 去掉用于标识实体的关键字
    pub fn without(&self, keywords: &[&str]) -> Attributes {
        Attributes(
            self.0
                .iter()
                .filter(|(k, _)| !keywords.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// 按覆盖规则合并属性
    ///
    /// 优先级：调用方显式提供的属性 > 目标容器已有属性 > 源容器属性。
    pub fn merge_with_precedence(
        supplied: &Attributes,
        target: Option<&Attributes>,
        source: &Attributes,
    ) -> Attributes {
        let mut merged = source.clone();
        if let Some(target) = target {
            merged.overlay(target);
        }
        merged.overlay(supplied);
        merged
    }

    /// 应用补丁，返回被修改关键字的原值（原先不存在的记为None）
    pub fn apply_patch(&mut self, patch: &Attributes) -> BTreeMap<String, Option<String>> {
        let mut prior = BTreeMap::new();
        for (keyword, value) in patch.iter() {
            let old = self.set(keyword, value);
            if old.as_deref() != Some(value) {
                prior.insert(keyword.to_string(), old);
            }
        }
        prior
    }

    /// 恢复 `apply_patch` 记录的原值
    pub fn revert_patch(&mut self, prior: &BTreeMap<String, Option<String>>) {
        for (keyword, value) in prior {
            match value {
                Some(value) => {
                    self.set(keyword.clone(), value.clone());
                }
                None => {
                    self.remove(keyword);
                }
            }
        }
    }
}

impl FromIterator<(String, String)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Attributes(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Attributes {
    fn from(pairs: [(&str, &str); N]) -> Self {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}
