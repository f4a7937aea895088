use serde::{
    Deserialize,
    Serialize,
};

use crate::errors::BlkError;

/// A plan file: high-level storage requests the `plan` subcommand
/// translates into registered actions against a populated tree.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(alias = "requests", alias = "actions")]
    pub ops: Vec<PlanOp>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum PlanOp {
    /// Destroy whatever format is on the device.
    #[serde(rename = "wipe")]
    Wipe { device: String },

    /// Destroy the device itself (must be a leaf).
    #[serde(rename = "destroy")]
    Destroy { device: String },

    #[serde(rename = "createPartition")]
    CreatePartition {
        disk: String,

        /// Human byte string, e.g. "500M", "8 GiB".
        size: String,

        #[serde(alias = "fstype", alias = "filesystem")]
        fs: Option<String>,

        label: Option<String>,
    },

    #[serde(rename = "createFormat")]
    CreateFormat {
        device: String,

        #[serde(alias = "fstype", alias = "filesystem")]
        fs: String,

        label: Option<String>,
    },

    #[serde(rename = "resize")]
    Resize { device: String, size: String },
}

impl Plan {
    #[inline]
    pub fn from_yaml(plan_yaml: &str) -> Result<Self, BlkError> {
        serde_yaml::from_str(plan_yaml)
            .map_err(|err| BlkError::BadPlan(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan() {
        let yaml = r#"
ops:
  - op: wipe
    device: sdb
  - op: destroy
    device: sda3
  - op: createPartition
    disk: sda
    size: 8G
    fs: ext4
    label: scratch
  - op: resize
    device: sda2
    size: 20G
"#;

        let plan = Plan::from_yaml(yaml).expect("valid plan rejected");

        assert_eq!(plan.ops.len(), 4);
        assert_eq!(
            plan.ops[0],
            PlanOp::Wipe {
                device: "sdb".to_string(),
            },
        );
        assert_eq!(
            plan.ops[2],
            PlanOp::CreatePartition {
                disk: "sda".to_string(),
                size: "8G".to_string(),
                fs: Some("ext4".to_string()),
                label: Some("scratch".to_string()),
            },
        );
    }

    #[test]
    fn test_parse_plan_bad_op() {
        let result = Plan::from_yaml("ops:\n  - op: levitate\n    device: sda\n");

        assert!(matches!(result, Err(BlkError::BadPlan(_))));
    }
}
