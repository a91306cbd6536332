//! 설정 항목 정의 및 검증

use crate::tool::error::DbError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Datatype of a config item's value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int,
    String,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Bool => write!(f, "bool"),
            DataType::Int => write!(f, "int"),
            DataType::String => write!(f, "string"),
        }
    }
}

/// A named, typed setting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigItem {
    pub key: String,
    pub value: String,
    pub datatype: DataType,
    pub default_value: String,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub section: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<Uuid>,
}

impl ConfigItem {
    fn with_default(key: &str, datatype: DataType, default_value: String, section: &str) -> Self {
        Self {
            key: key.to_string(),
            value: default_value.clone(),
            datatype,
            default_value,
            min: None,
            max: None,
            section: section.to_string(),
            updated_at: None,
            updated_by: None,
        }
    }

    pub fn bool(key: &str, default_value: bool, section: &str) -> Self {
        Self::with_default(key, DataType::Bool, default_value.to_string(), section)
    }

    pub fn int(key: &str, default_value: i64, min: Option<i64>, max: Option<i64>, section: &str) -> Self {
        let mut item = Self::with_default(key, DataType::Int, default_value.to_string(), section);
        item.min = min;
        item.max = max;
        item
    }

    pub fn string(key: &str, default_value: &str, section: &str) -> Self {
        Self::with_default(key, DataType::String, default_value.to_string(), section)
    }

    /// Checks `value` against the datatype and bounds without mutating anything.
    pub fn validate_value(&self, value: &str) -> Result<(), DbError> {
        let invalid = |reason: String| DbError::InvalidConfigValue {
            key: self.key.clone(),
            reason,
        };

        match self.datatype {
            DataType::Bool => match value {
                "true" | "false" => Ok(()),
                _ => Err(invalid(format!("'{value}' is not a boolean"))),
            },
            DataType::Int => {
                let n: i64 = value
                    .parse()
                    .map_err(|_| invalid(format!("'{value}' is not an integer")))?;
                if let Some(min) = self.min {
                    if n < min {
                        return Err(invalid(format!("{n} is below the minimum {min}")));
                    }
                }
                if let Some(max) = self.max {
                    if n > max {
                        return Err(invalid(format!("{n} exceeds the maximum {max}")));
                    }
                }
                Ok(())
            }
            DataType::String => Ok(()),
        }
    }

    /// Whether the value equals the default, i.e. nothing needs persisting.
    pub fn is_default(&self) -> bool {
        self.value == self.default_value
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.datatype {
            DataType::Bool => self.value.parse().ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.datatype {
            DataType::Int => self.value.parse().ok(),
            _ => None,
        }
    }
}
