//! Database connection and initialization.

pub use taskforge_core::db::DatabaseError;

taskforge_core::define_database!(TaskDatabase, "Task store migrations complete");

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = TaskDatabase::open_in_memory().await;
        assert!(db.is_ok());
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn open_on_disk_creates_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("tasks.db");
        TaskDatabase::open(&path).await.unwrap();
        assert!(path.exists());
    }
}
