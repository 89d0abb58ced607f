use std::sync::Arc;

use crate::store::{DatabaseConfig, DatabaseType, MemoryStore, RunStore, SqliteStore};

pub async fn create_store(config: &DatabaseConfig) -> crate::Result<Arc<dyn RunStore>> {
    match config.db_type {
        DatabaseType::Sqlite => {
            let path = config
                .sqlite_path
                .as_ref()
                .ok_or_else(|| crate::Error::Config("SQLite path not configured".into()))?
                .to_str()
                .ok_or_else(|| crate::Error::Config("SQLite path is not valid UTF-8".into()))?;
            Ok(Arc::new(SqliteStore::new(path).await?))
        }
        DatabaseType::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}
