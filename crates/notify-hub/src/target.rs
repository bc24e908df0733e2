//! Delivery targets.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const TARGET_TYPE_EMAIL: &str = "email";
pub const TARGET_TYPE_WEBHOOK: &str = "webhook";
pub const TARGET_TYPE_GROUP: &str = "group";

/// A single addressable recipient plus the platform that should handle it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Recipient kind, e.g. `email`, `webhook` or `group`.
    #[serde(rename = "type")]
    pub target_type: String,
    /// Address or identifier understood by the platform.
    pub value: String,
    /// Name of the registered platform that delivers to this target.
    pub platform: String,
}

/// Identity of a target, used to match results across retry rounds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub platform: String,
    pub target_type: String,
    pub value: String,
}

impl Target {
    pub fn new(
        target_type: impl Into<String>,
        value: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            target_type: target_type.into(),
            value: value.into(),
            platform: platform.into(),
        }
    }

    pub fn email(address: impl Into<String>, platform: impl Into<String>) -> Self {
        Self::new(TARGET_TYPE_EMAIL, address, platform)
    }

    pub fn webhook(url: impl Into<String>, platform: impl Into<String>) -> Self {
        Self::new(TARGET_TYPE_WEBHOOK, url, platform)
    }

    pub fn group(id: impl Into<String>, platform: impl Into<String>) -> Self {
        Self::new(TARGET_TYPE_GROUP, id, platform)
    }

    pub fn key(&self) -> TargetKey {
        TargetKey {
            platform: self.platform.clone(),
            target_type: self.target_type.clone(),
            value: self.value.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_type.trim().is_empty() {
            return Err(Error::invalid_target(self.to_string(), "target type is empty"));
        }
        if self.value.trim().is_empty() {
            return Err(Error::invalid_target(self.to_string(), "target value is empty"));
        }
        if self.platform.trim().is_empty() {
            return Err(Error::invalid_target(self.to_string(), "platform is empty"));
        }
        Ok(())
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.platform, self.target_type, self.value)
    }
}

/// Split targets into per-platform groups.
///
/// Groups appear in order of first occurrence and each group keeps the
/// submission order of its targets.
pub fn group_by_platform(targets: Vec<Target>) -> Vec<(String, Vec<Target>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<Target>)> = Vec::new();

    for target in targets {
        match index.get(&target.platform) {
            Some(&i) => groups[i].1.push(target),
            None => {
                index.insert(target.platform.clone(), groups.len());
                groups.push((target.platform.clone(), vec![target]));
            }
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(Target::email("a@example.com", "smtp").validate().is_ok());

        let err = Target::new("", "x", "smtp").validate().unwrap_err();
        assert!(matches!(err, Error::InvalidTarget { .. }));
        assert!(err.to_string().contains("target type is empty"));

        let err = Target::new("email", " ", "smtp").validate().unwrap_err();
        assert!(err.to_string().contains("target value is empty"));

        assert!(Target::new("email", "a@b", "").validate().is_err());
    }

    #[test]
    fn test_group_by_platform_keeps_order() {
        let targets = vec![
            Target::email("1", "a"),
            Target::email("2", "b"),
            Target::email("3", "a"),
            Target::email("4", "c"),
        ];

        let groups = group_by_platform(targets);
        let names: Vec<&str> = groups.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let a_values: Vec<&str> = groups[0].1.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(a_values, vec!["1", "3"]);
    }

    #[test]
    fn test_serde_uses_type_field() {
        let target = Target::webhook("https://example.com/hook", "hooks");
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json["type"], "webhook");
        assert_eq!(json["platform"], "hooks");
    }
}
