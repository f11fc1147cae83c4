#![allow(dead_code)]

use pretty_assertions::assert_eq;
use taskboard_database::Database;
use taskboard_schema::{
    MigrationError, discovery::MigrationDirectory, ledger::MigrationLedger,
    runner::MigrationRunner,
};
use tempfile::TempDir;

/// A migrations directory plus a ledger and tables namespaced by `prefix`, so
/// suites sharing one server database do not collide.
pub struct Fixture {
    pub prefix: &'static str,
    pub db: Box<dyn Database>,
    dir: TempDir,
}

impl Fixture {
    pub async fn new(db: Box<dyn Database>, prefix: &'static str) -> Self {
        for table in ["users", "projects", "labels", "ledger"] {
            db.exec_raw(&format!("DROP TABLE IF EXISTS {prefix}_{table}"))
                .await
                .unwrap();
        }

        Self {
            prefix,
            db,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn write(&self, filename: &str, body: &str) {
        std::fs::write(self.dir.path().join(filename), body).unwrap();
    }

    pub fn users_sql(&self) -> String {
        format!(
            "CREATE TABLE {}_users (id INTEGER PRIMARY KEY, email VARCHAR(255) NOT NULL);\n",
            self.prefix
        )
    }

    pub fn projects_sql(&self) -> String {
        format!(
            "-- projects\nCREATE TABLE {}_projects (id INTEGER PRIMARY KEY, name VARCHAR(255) NOT NULL);\n",
            self.prefix
        )
    }

    pub fn ledger(&self) -> MigrationLedger {
        MigrationLedger::with_table_name(format!("{}_ledger", self.prefix)).unwrap()
    }

    pub fn runner(&self) -> MigrationRunner {
        MigrationRunner::new(MigrationDirectory::new(self.dir.path())).with_ledger(self.ledger())
    }

    pub async fn applied(&self) -> Vec<String> {
        self.ledger().get_applied(&*self.db).await.unwrap()
    }

    pub async fn table_exists(&self, table: &str) -> bool {
        self.db
            .query(
                &format!("SELECT 1 FROM {}_{table} WHERE 1 = 0", self.prefix),
                &[],
            )
            .await
            .is_ok()
    }

    pub async fn count(&self, table: &str) -> i64 {
        self.db
            .query(
                &format!("SELECT COUNT(*) AS n FROM {}_{table}", self.prefix),
                &[],
            )
            .await
            .unwrap()
            .rows[0]
            .get("n")
            .and_then(|value| value.as_i64())
            .unwrap()
    }
}

/// Runner behaviour every backend shares.
///
/// `get_database` returns `None` when the backend is not available, which
/// skips the test.
pub trait MigrationTestSuite {
    async fn get_database(&self) -> Option<Box<dyn Database>>;

    /// Whether DDL statements can be rolled back. MySQL commits them
    /// implicitly.
    fn transactional_ddl(&self) -> bool {
        true
    }

    async fn fixture(&self, prefix: &'static str) -> Option<Fixture> {
        Some(Fixture::new(self.get_database().await?, prefix).await)
    }

    async fn test_applies_in_order_once(&self) {
        let Some(fixture) = self.fixture("suite_order").await else {
            return;
        };
        fixture.write("002_projects.sql", &fixture.projects_sql());
        fixture.write("001_users.sql", &fixture.users_sql());
        let runner = fixture.runner();

        let applied = runner.run(&*fixture.db).await.unwrap();

        assert_eq!(applied, vec!["001_users.sql", "002_projects.sql"]);
        assert_eq!(fixture.applied().await, applied);
        assert!(fixture.table_exists("users").await);
        assert!(fixture.table_exists("projects").await);

        assert!(runner.run(&*fixture.db).await.unwrap().is_empty());
        assert_eq!(fixture.applied().await.len(), 2);
    }

    async fn test_skips_recorded_migrations(&self) {
        let Some(fixture) = self.fixture("suite_skip").await else {
            return;
        };
        fixture.write("001_users.sql", &fixture.users_sql());
        fixture.write("002_projects.sql", &fixture.projects_sql());
        let ledger = fixture.ledger();
        ledger.ensure_table(&*fixture.db).await.unwrap();
        ledger.record(&*fixture.db, "001_users.sql").await.unwrap();

        let applied = fixture.runner().run(&*fixture.db).await.unwrap();

        assert_eq!(applied, vec!["002_projects.sql"]);
        assert!(!fixture.table_exists("users").await);
        assert_eq!(
            fixture.applied().await,
            vec!["001_users.sql", "002_projects.sql"]
        );
    }

    async fn test_failed_migration_leaves_no_rows(&self) {
        let Some(fixture) = self.fixture("suite_fail_dml").await else {
            return;
        };
        let users = format!("{}_users", fixture.prefix);
        fixture.write("001_users.sql", &fixture.users_sql());
        fixture.write(
            "002_seed.sql",
            &format!(
                "INSERT INTO {users} (id, email) VALUES (1, 'a@example.com');\n\
                 INSERT INTO {users} (id, email) VALUES (2, NULL);\n"
            ),
        );

        let err = fixture.runner().run(&*fixture.db).await.unwrap_err();

        assert!(
            matches!(&err, MigrationError::StatementExecution { filename, index: 2, .. } if filename == "002_seed.sql"),
            "unexpected error: {err:?}"
        );
        assert_eq!(fixture.count("users").await, 0);
        assert_eq!(fixture.applied().await, vec!["001_users.sql"]);
    }

    async fn test_failed_migration_drops_created_table(&self) {
        if !self.transactional_ddl() {
            return;
        }
        let Some(fixture) = self.fixture("suite_fail_ddl").await else {
            return;
        };
        fixture.write("001_users.sql", &fixture.users_sql());
        fixture.write(
            "003_bad.sql",
            &format!(
                "CREATE TABLE {p}_labels (id INTEGER PRIMARY KEY);\n\
                 INSERT INTO {p}_users (id, email) VALUES (1, NULL);\n",
                p = fixture.prefix
            ),
        );

        let err = fixture.runner().run(&*fixture.db).await.unwrap_err();

        assert_eq!(err.filename(), Some("003_bad.sql"));
        assert!(!fixture.table_exists("labels").await);
        assert_eq!(fixture.applied().await, vec!["001_users.sql"]);
    }

    async fn test_rollback_is_ledger_only(&self) {
        let Some(fixture) = self.fixture("suite_rollback").await else {
            return;
        };
        fixture.write("001_users.sql", &fixture.users_sql());
        fixture.write("002_projects.sql", &fixture.projects_sql());
        let runner = fixture.runner();
        runner.run(&*fixture.db).await.unwrap();

        assert_eq!(
            runner.rollback_last(&*fixture.db).await.unwrap().as_deref(),
            Some("002_projects.sql")
        );
        assert_eq!(fixture.applied().await, vec!["001_users.sql"]);
        assert!(fixture.table_exists("projects").await);

        assert_eq!(
            runner.rollback_last(&*fixture.db).await.unwrap().as_deref(),
            Some("001_users.sql")
        );
        assert_eq!(runner.rollback_last(&*fixture.db).await.unwrap(), None);
        assert!(fixture.applied().await.is_empty());
    }

    async fn test_status_reads_ledger_rows(&self) {
        let Some(fixture) = self.fixture("suite_status").await else {
            return;
        };
        fixture.write("001_users.sql", &fixture.users_sql());
        fixture.write("002_projects.sql", &fixture.projects_sql());
        let runner = fixture.runner();
        runner.run(&*fixture.db).await.unwrap();

        let entries = fixture.ledger().entries(&*fixture.db).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].id < entries[1].id);

        let list = runner.list_migrations(&*fixture.db).await.unwrap();
        assert!(list.iter().all(|info| info.applied && info.executed_at.is_some()));
    }
}
