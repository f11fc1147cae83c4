use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new(files: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sqlite = dir.path().join("migrations").join("sqlite");
        std::fs::create_dir_all(&sqlite).unwrap();
        for (name, body) in files {
            std::fs::write(sqlite.join(name), body).unwrap();
        }
        Self { dir }
    }

    fn migrations_dir(&self) -> PathBuf {
        self.dir.path().join("migrations")
    }

    fn database_url(&self) -> String {
        format!("sqlite://{}", self.dir.path().join("board.db").display())
    }

    fn cmd(&self, args: &[&str]) -> assert_cmd::Command {
        let mut cmd = cargo_bin_cmd!("taskboard-migrate");
        cmd.env_remove("DATABASE_URL")
            .arg("--database-url")
            .arg(self.database_url())
            .arg("--migrations-dir")
            .arg(self.migrations_dir())
            .args(args);
        cmd
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

const USERS: &str = "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL);\n";
const PROJECTS: &str = "CREATE TABLE projects (id INTEGER PRIMARY KEY, name TEXT NOT NULL);\n";

#[test_log::test]
fn help_lists_commands() {
    cargo_bin_cmd!("taskboard-migrate")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "A CLI tool for managing database schema migrations",
        ))
        .stdout(predicate::str::contains("migrate"))
        .stdout(predicate::str::contains("rollback"))
        .stdout(predicate::str::contains("status"));
}

#[test_log::test]
fn migrate_help_lists_options() {
    cargo_bin_cmd!("taskboard-migrate")
        .args(["migrate", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--database-url"))
        .stdout(predicate::str::contains("--migrations-dir"))
        .stdout(predicate::str::contains("--up-to"))
        .stdout(predicate::str::contains("--steps"))
        .stdout(predicate::str::contains("--dry-run"));
}

#[test_log::test]
fn migrate_applies_pending_files() {
    let workspace = Workspace::new(&[("001_users.sql", USERS), ("002_projects.sql", PROJECTS)]);

    workspace
        .cmd(&["migrate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Applied 001_users.sql"))
        .stdout(predicate::str::contains("Applied 002_projects.sql"));

    workspace
        .cmd(&[])
        .assert()
        .success()
        .stdout(predicate::str::contains("No pending migrations"));
}

#[test_log::test]
fn failing_migration_exits_with_error() {
    let workspace = Workspace::new(&[
        ("001_users.sql", USERS),
        ("002_broken.sql", "CREATE TABLE broken (;\n"),
    ]);

    workspace
        .cmd(&["migrate"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("002_broken.sql"));

    workspace
        .cmd(&["status"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"applied\s+001_users\.sql").unwrap())
        .stdout(predicate::str::is_match(r"pending\s+002_broken\.sql").unwrap());
}

#[test_log::test]
fn steps_and_dry_run() {
    let workspace = Workspace::new(&[("001_users.sql", USERS), ("002_projects.sql", PROJECTS)]);

    workspace
        .cmd(&["migrate", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Would apply 001_users.sql"))
        .stdout(predicate::str::contains("Would apply 002_projects.sql"));

    workspace
        .cmd(&["migrate", "--steps", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Applied 001_users.sql"))
        .stdout(predicate::str::contains("002_projects.sql").not());
}

#[test_log::test]
fn rollback_removes_last_ledger_row() {
    let workspace = Workspace::new(&[("001_users.sql", USERS), ("002_projects.sql", PROJECTS)]);

    workspace.cmd(&["migrate"]).assert().success();

    workspace
        .cmd(&["rollback"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Rolled back 002_projects.sql"));

    workspace
        .cmd(&["status"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"pending\s+002_projects\.sql").unwrap());
}

#[test_log::test]
fn rollback_with_empty_ledger_succeeds() {
    let workspace = Workspace::new(&[]);

    workspace
        .cmd(&["rollback"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No migrations to roll back"));
}

#[test_log::test]
fn missing_migrations_directory_is_not_an_error() {
    let workspace = Workspace::new(&[]);
    std::fs::remove_dir_all(workspace.migrations_dir()).unwrap();

    workspace
        .cmd(&["migrate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No pending migrations"));
}

#[test_log::test]
fn unsupported_backend_fails() {
    cargo_bin_cmd!("taskboard-migrate")
        .args(["--database-url", "oracle://localhost/board", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("oracle"));
}

#[test_log::test]
fn invalid_table_name_fails() {
    let workspace = Workspace::new(&[("001_users.sql", USERS)]);

    workspace
        .cmd(&["--migration-table", "bad name", "migrate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("bad name"));
}

#[test_log::test]
fn reads_config_file() {
    let workspace = Workspace::new(&[("001_users.sql", USERS)]);
    let config = workspace.path().join("database.toml");
    std::fs::write(
        &config,
        format!(
            "backend = \"sqlite\"\npath = {:?}\n",
            workspace.path().join("board.db").display().to_string()
        ),
    )
    .unwrap();

    cargo_bin_cmd!("taskboard-migrate")
        .env_remove("DATABASE_URL")
        .arg("--config")
        .arg(&config)
        .arg("--migrations-dir")
        .arg(workspace.migrations_dir())
        .arg("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Applied 001_users.sql"));
}
