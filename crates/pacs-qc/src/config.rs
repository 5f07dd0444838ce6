//! 质控引擎配置
//!
//! 从可选的配置文件和 `PACS_QC_*` 环境变量加载，以显式快照的形式随每次操作传入。

use config::{Config, Environment, File};
use pacs_core::utils::{is_valid_dicom_uid, MAX_UID_LENGTH, UUID_DERIVED_UID_ROOT};
use pacs_core::{Code, PacsError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// 质控引擎完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    /// 拒绝原因编码
    pub rejection: RejectionConfig,
    /// 派生查询属性
    pub query: QueryConfig,
    /// Non-IOCM 消息消费
    pub noniocm: NonIocmConfig,
    /// 新生成UID
    pub uid: UidConfig,
}

/// 拒绝原因编码配置，格式为 `值^编码方案^含义`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RejectionConfig {
    /// 质控操作默认使用的拒绝编码
    pub qc_rejection_code: String,
    /// 删除操作使用的拒绝编码
    pub delete_code: String,
}

impl Default for RejectionConfig {
    fn default() -> Self {
        Self {
            qc_rejection_code: "113001^DCM^Rejected for Quality Reasons".to_string(),
            delete_code: "113039^DCM^Data Retention Policy Expired".to_string(),
        }
    }
}

impl RejectionConfig {
    pub fn qc_code(&self) -> Result<Code> {
        parse_code(&self.qc_rejection_code)
    }

    pub fn delete_code(&self) -> Result<Code> {
        parse_code(&self.delete_code)
    }
}

/// 派生查询属性配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub view_id: String,
    /// 派生计数是否排除被拒绝的实例
    pub hide_rejected_instances: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            view_id: "hideRejected".to_string(),
            hide_rejected_instances: true,
        }
    }
}

/// Non-IOCM 消费配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NonIocmConfig {
    /// 超过该投递次数后放弃并清理待处理任务
    pub max_delivery_count: u32,
}

impl Default for NonIocmConfig {
    fn default() -> Self {
        Self { max_delivery_count: 3 }
    }
}

/// UID生成配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UidConfig {
    pub root: String,
}

impl Default for UidConfig {
    fn default() -> Self {
        Self {
            root: UUID_DERIVED_UID_ROOT.to_string(),
        }
    }
}

impl QcConfig {
    /// 加载配置：文件（可选） → 环境变量，例如 `PACS_QC_NONIOCM__MAX_DELIVERY_COUNT=5`
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("PACS_QC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| PacsError::Config(e.to_string()))?;

        let config: QcConfig = settings
            .try_deserialize()
            .map_err(|e| PacsError::Config(e.to_string()))?;
        config.validate()?;

        info!("QC configuration loaded from: {}", path.unwrap_or("<environment>"));
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.rejection.qc_code()?;
        self.rejection.delete_code()?;

        if self.query.view_id.trim().is_empty() {
            return Err(PacsError::Config("query.view_id 不能为空".to_string()));
        }
        if self.noniocm.max_delivery_count == 0 {
            return Err(PacsError::Config("noniocm.max_delivery_count 必须大于0".to_string()));
        }
        // 根之后至少还要留出时间戳和随机后缀
        if !is_valid_dicom_uid(&self.uid.root) || self.uid.root.len() > MAX_UID_LENGTH - 24 {
            return Err(PacsError::Config(format!("无效的UID根: {}", self.uid.root)));
        }
        Ok(())
    }
}

/// 解析 `值^编码方案^含义` 形式的编码
pub fn parse_code(value: &str) -> Result<Code> {
    let parts: Vec<&str> = value.split('^').map(str::trim).collect();
    match parts.as_slice() {
        [value, scheme, meaning] if !value.is_empty() && !scheme.is_empty() => {
            Ok(Code::new(*value, *scheme, *meaning))
        }
        _ => Err(PacsError::Config(format!("无效的编码: {}", value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = QcConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.noniocm.max_delivery_count, 3);
        assert_eq!(config.rejection.qc_code().unwrap().value, "113001");
        assert_eq!(config.rejection.delete_code().unwrap().value, "113039");
    }

    #[test]
    fn test_parse_code() {
        let code = parse_code("113037^DCM^Rejected for Patient Safety Reasons").unwrap();
        assert_eq!(code.scheme, "DCM");
        assert_eq!(code.meaning, "Rejected for Patient Safety Reasons");
        assert!(parse_code("113037^DCM").is_err());
        assert!(parse_code("^DCM^x").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("pacs-qc-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"noniocm": {"max_delivery_count": 5}, "query": {"hide_rejected_instances": false}}"#,
        )
        .unwrap();

        let config = QcConfig::load(path.to_str()).unwrap();
        assert_eq!(config.noniocm.max_delivery_count, 5);
        assert!(!config.query.hide_rejected_instances);
        assert_eq!(config.query.view_id, "hideRejected");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = QcConfig::default();
        config.noniocm.max_delivery_count = 0;
        assert!(matches!(config.validate(), Err(PacsError::Config(_))));

        let mut config = QcConfig::default();
        config.uid.root = "1..2".to_string();
        assert!(config.validate().is_err());
    }
}
