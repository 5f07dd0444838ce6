//! 通用工具函数

use chrono::Utc;
use uuid::Uuid;

/// 基于UUID派生的DICOM UID根 (PS3.5 B.2)
pub const UUID_DERIVED_UID_ROOT: &str = "2.25";

/// DICOM UID最大长度
pub const MAX_UID_LENGTH: usize = 64;

/// 生成唯一的DICOM标识符
pub fn generate_dicom_uid() -> String {
    format!("{}.{}", UUID_DERIVED_UID_ROOT, Uuid::new_v4().as_u128())
}

/// 在指定的企业根标识符下生成DICOM标识符
///
/// 根过长时退回到UUID派生形式，保证结果不超过64个字符。
pub fn generate_dicom_uid_with_root(root: &str) -> String {
    let root = root.trim_end_matches('.');
    if root.is_empty() || root == UUID_DERIVED_UID_ROOT {
        return generate_dicom_uid();
    }

    let suffix = format!(
        "{}.{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().as_u128() % 1_000_000_000
    );
    let uid = format!("{}.{}", root, suffix);
    if uid.len() <= MAX_UID_LENGTH {
        uid
    } else {
        generate_dicom_uid()
    }
}

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= MAX_UID_LENGTH
        && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !uid.starts_with('.')
        && !uid.ends_with('.')
        && !uid.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_dicom_uid() {
        let uid = generate_dicom_uid();
        assert!(is_valid_dicom_uid(&uid));
        assert!(uid.starts_with("2.25."));
        assert_ne!(uid, generate_dicom_uid());
    }

    #[test]
    fn test_generate_dicom_uid_with_root() {
        let uid = generate_dicom_uid_with_root("1.2.826.0.1.3680043.9.7382");
        assert!(is_valid_dicom_uid(&uid));
        assert!(uid.starts_with("1.2.826.0.1.3680043.9.7382."));

        let long_root = "1.2.3.4.5.6.7.8.9.10.11.12.13.14.15.16.17.18.19.20.21.22.23.24";
        assert!(is_valid_dicom_uid(&generate_dicom_uid_with_root(long_root)));
    }

    #[test]
    fn test_is_valid_dicom_uid() {
        assert!(is_valid_dicom_uid("1.2.840.10008.5.1.4.1.1.4"));
        assert!(!is_valid_dicom_uid(""));
        assert!(!is_valid_dicom_uid("invalid.uid.with.letters"));
        assert!(!is_valid_dicom_uid("1..2"));
    }
}
