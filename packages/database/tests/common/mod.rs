#![allow(dead_code)]

use std::sync::Arc;

use pretty_assertions::assert_eq;
use taskboard_database::{Database, DatabaseError, DatabaseValue};

pub async fn count(db: &dyn Database, table: &str) -> i64 {
    db.query(&format!("SELECT COUNT(*) AS n FROM {table}"), &[])
        .await
        .unwrap()
        .rows[0]
        .get("n")
        .and_then(|value| value.as_i64())
        .unwrap()
}

/// Behaviour every adapter shares.
///
/// `get_database` returns `None` when the backend is not available (for
/// example when no test server URL is configured), which skips the test.
/// The returned database has an empty `table` with an auto-increment `id`
/// and a unique `title` column.
pub trait IntegrationTestSuite {
    async fn get_database(&self, table: &str) -> Option<Arc<Box<dyn Database>>>;

    async fn test_insert_and_select(&self) {
        let table = "suite_insert_select";
        let Some(db) = self.get_database(table).await else {
            return;
        };
        let db = &**db;

        let inserted = db
            .query(
                &format!("INSERT INTO {table} (title) VALUES (?)"),
                &["Alice".into()],
            )
            .await
            .unwrap();
        assert_eq!(inserted.changes, 1);

        let selected = db
            .query(
                &format!("SELECT title FROM {table} WHERE title = ?"),
                &["Alice".into()],
            )
            .await
            .unwrap();
        assert_eq!(selected.changes, 0);
        assert_eq!(selected.rows.len(), 1);
        assert_eq!(
            selected.rows[0].get("title"),
            Some(DatabaseValue::String("Alice".to_string()))
        );
    }

    async fn test_update_changes(&self) {
        let table = "suite_update_changes";
        let Some(db) = self.get_database(table).await else {
            return;
        };
        let db = &**db;

        for title in ["a", "b", "c"] {
            db.query(
                &format!("INSERT INTO {table} (title) VALUES (?)"),
                &[title.into()],
            )
            .await
            .unwrap();
        }

        let deleted = db
            .query(
                &format!("DELETE FROM {table} WHERE title <> ?"),
                &["b".into()],
            )
            .await
            .unwrap();
        assert_eq!(deleted.changes, 2);
        assert_eq!(count(db, table).await, 1);
    }

    async fn test_unique_violation(&self) {
        let table = "suite_unique_violation";
        let Some(db) = self.get_database(table).await else {
            return;
        };
        let db = &**db;
        let sql = format!("INSERT INTO {table} (title) VALUES (?)");

        db.query(&sql, &["dup".into()]).await.unwrap();
        let err = db.query(&sql, &["dup".into()]).await.unwrap_err();

        assert!(
            matches!(err, DatabaseError::UniqueViolation(_)),
            "unexpected error: {err:?}"
        );
    }

    async fn test_transaction_commit(&self) {
        let table = "suite_tx_commit";
        let Some(db) = self.get_database(table).await else {
            return;
        };
        let db = &**db;

        let tx = db.begin_transaction().await.unwrap();
        tx.exec_raw(&format!("INSERT INTO {table} (title) VALUES ('committed')"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(count(db, table).await, 1);
    }

    async fn test_transaction_rollback(&self) {
        let table = "suite_tx_rollback";
        let Some(db) = self.get_database(table).await else {
            return;
        };
        let db = &**db;

        let tx = db.begin_transaction().await.unwrap();
        tx.query(
            &format!("INSERT INTO {table} (title) VALUES (?)"),
            &["temp".into()],
        )
        .await
        .unwrap();
        assert_eq!(count(&*tx, table).await, 1);
        tx.rollback().await.unwrap();

        assert_eq!(count(db, table).await, 0);
    }

    /// Only meaningful for pooled backends, where the transaction owns a
    /// separate session.
    async fn test_transaction_isolation(&self) {
        let table = "suite_tx_isolation";
        let Some(db) = self.get_database(table).await else {
            return;
        };
        let db = &**db;

        let tx = db.begin_transaction().await.unwrap();
        tx.query(
            &format!("INSERT INTO {table} (title) VALUES (?)"),
            &["pinned".into()],
        )
        .await
        .unwrap();

        assert_eq!(count(&*tx, table).await, 1);
        assert_eq!(count(db, table).await, 0);

        tx.commit().await.unwrap();
        assert_eq!(count(db, table).await, 1);
    }

    async fn test_nested_transaction_rejected(&self) {
        let table = "suite_nested_tx";
        let Some(db) = self.get_database(table).await else {
            return;
        };
        let db = &**db;

        let tx = db.begin_transaction().await.unwrap();
        let err = tx.begin_transaction().await.unwrap_err();
        assert!(matches!(err, DatabaseError::AlreadyInTransaction));
        tx.rollback().await.unwrap();
    }

    async fn test_named_parameters(&self) {
        let table = "suite_named_params";
        let Some(db) = self.get_database(table).await else {
            return;
        };
        let db = &**db;

        db.query_named(
            &format!("INSERT INTO {table} (title) VALUES (:title)"),
            &[("title", "named".into())],
        )
        .await
        .unwrap();

        let rows = db
            .query_named(
                &format!("SELECT title FROM {table} WHERE title = :title OR title = :title"),
                &[("title", "named".into())],
            )
            .await
            .unwrap()
            .rows;
        assert_eq!(rows.len(), 1);
    }

    async fn test_close(&self) {
        let table = "suite_close";
        let Some(db) = self.get_database(table).await else {
            return;
        };
        let db = &**db;

        db.close().await.unwrap();
        db.close().await.unwrap();

        let err = db.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Closed), "unexpected error: {err:?}");
    }
}
