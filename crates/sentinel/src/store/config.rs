use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub db_type: DatabaseType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Sqlite,
    Memory,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: DatabaseType::Sqlite,
            sqlite_path: Some(PathBuf::from("data/sentinel.db")),
        }
    }
}

impl DatabaseConfig {
    pub fn memory() -> Self {
        Self {
            db_type: DatabaseType::Memory,
            sqlite_path: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_type == DatabaseType::Sqlite && self.sqlite_path.is_none() {
            return Err(Error::Config(
                "SQLite path is required for SQLite database type".to_string(),
            ));
        }
        Ok(())
    }
}
