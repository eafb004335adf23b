//! Integration tests for the runner and orchestrator
//!
//! These tests run the public `run` entry point against file-backed SQLite
//! databases and real files in temp directories.

#[cfg(test)]
mod tests {
    use crate::{
        coordination::FileState,
        db::{DbSession, Ledger, LedgerStatus, Session, SqlValue, ledger::FileIdentity},
        runner::{Environment, RunArgs, RunResult, run},
    };
    use std::path::{Path, PathBuf};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    // ============ Test Helpers ============

    struct Workspace {
        dir: TempDir,
        database_url: String,
    }

    impl Workspace {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let database_url = format!("sqlite:{}", dir.path().join("loads.db").display());
            Self { dir, database_url }
        }

        fn path(&self, relative: &str) -> PathBuf {
            self.dir.path().join(relative)
        }

        fn write(&self, relative: &str, contents: &[u8]) -> PathBuf {
            let path = self.path(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, contents).unwrap();
            path
        }

        fn args(&self, manifest: &str) -> RunArgs {
            RunArgs {
                manifest: PathBuf::from(manifest),
                base_dir: self.dir.path().to_path_buf(),
                database_url: Some(self.database_url.clone()),
                environment: Environment::Dev,
                quiet: true,
                ..RunArgs::default()
            }
        }

        async fn run(&self, args: RunArgs) -> RunResult {
            run(args).await.unwrap()
        }

        async fn session(&self) -> DbSession {
            DbSession::connect(&self.database_url).await.unwrap()
        }

        async fn query(&self, sql: &str) -> Vec<Vec<Option<String>>> {
            let mut session = self.session().await;
            let rows = session.fetch_rows(sql, &[]).await.unwrap();
            session.close().await.unwrap();
            rows
        }

        async fn count(&self, table: &str) -> i64 {
            let rows = self
                .query(&format!("SELECT CAST(COUNT(*) AS TEXT) FROM \"{}\"", table))
                .await;
            rows[0][0].as_deref().unwrap().parse().unwrap()
        }

        async fn ledger_status(&self, path: &Path) -> Option<LedgerStatus> {
            let mut session = self.session().await;
            let record = Ledger::new("FILE_LOAD_LEDGER")
                .unwrap()
                .lookup(&mut session, &FileIdentity::of(path))
                .await
                .unwrap();
            session.close().await.unwrap();
            record.and_then(|r| r.status())
        }
    }

    /// Push the file's modification time into the future so the ledger sees a change
    fn touch_forward(path: &Path) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(10))
            .unwrap();
    }

    const ORDERS: &[u8] = b"order_id,customer,total\n1,Ann,10.5\n2,Bob,20\n3,Cy,7.25\n";

    // ============ End to End ============

    #[tokio::test]
    async fn test_run_loads_files_and_directories() {
        let ws = Workspace::new();
        ws.write("orders.csv", ORDERS);
        ws.write("vendors/a.txt", b"code|name\nA1|Acme Corp\nB2|Bolt\n");
        ws.write("vendors/b.csv", b"id,amount\n1,10\n2,20\n");
        ws.write("vendors/readme.md", b"not loaded\n");
        ws.write(
            "File_Locations.txt",
            b"path,table\norders.csv,\nvendors,\nnotes.pdf,\n",
        );

        let result = ws.run(ws.args("File_Locations.txt")).await;
        let summary = &result.summary;

        assert_eq!(result.environment, Environment::Dev);
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.invalid_entries, 1);
        assert_eq!(summary.discovered, 3);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.rows_loaded, 7);

        assert_eq!(ws.count("ORDERS").await, 3);
        assert_eq!(ws.count("A").await, 2);
        assert_eq!(ws.count("B").await, 2);

        let names = ws
            .query("SELECT \"NAME\" FROM \"A\" ORDER BY \"CODE\"")
            .await;
        assert_eq!(names[1][0].as_deref(), Some("Bolt"));

        // Every row carries the run timestamp
        let stamps = ws
            .query("SELECT DISTINCT \"LOAD_TIMESTAMP\" FROM \"ORDERS\"")
            .await;
        assert_eq!(stamps.len(), 1);
        assert_eq!(stamps[0][0], Some(result.stamp.sql_text()));

        assert_eq!(
            ws.ledger_status(&ws.path("vendors/b.csv")).await,
            Some(LedgerStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let ws = Workspace::new();
        ws.write("orders.csv", ORDERS);
        ws.write("File_Locations.txt", b"path\norders.csv\n");

        let first = ws.run(ws.args("File_Locations.txt")).await;
        assert_eq!(first.summary.succeeded, 1);
        let before = ws
            .query("SELECT \"LOAD_TIMESTAMP\" FROM \"ORDERS\" LIMIT 1")
            .await;

        let second = ws.run(ws.args("File_Locations.txt")).await;
        assert_eq!(second.summary.skipped, 1);
        assert_eq!(second.summary.succeeded, 0);
        assert_eq!(second.summary.reports[0].state, FileState::Skipped);

        assert_eq!(ws.count("ORDERS").await, 3);
        let after = ws
            .query("SELECT \"LOAD_TIMESTAMP\" FROM \"ORDERS\" LIMIT 1")
            .await;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_changed_file_replaces_table() {
        let ws = Workspace::new();
        let orders = ws.write("orders.csv", ORDERS);
        ws.write("File_Locations.txt", b"path\norders.csv\n");

        ws.run(ws.args("File_Locations.txt")).await;
        assert_eq!(ws.count("ORDERS").await, 3);

        std::fs::write(
            &orders,
            b"order_id,customer,total\n1,Ann,10.5\n2,Bob,20\n3,Cy,7.25\n4,Dee,1\n",
        )
        .unwrap();
        touch_forward(&orders);

        let second = ws.run(ws.args("File_Locations.txt")).await;
        assert_eq!(second.summary.succeeded, 1);
        assert_eq!(ws.count("ORDERS").await, 4);
    }

    #[tokio::test]
    async fn test_force_load_reloads_unchanged_file() {
        let ws = Workspace::new();
        ws.write("orders.csv", ORDERS);
        ws.write("File_Locations.txt", b"path\norders.csv\n");

        ws.run(ws.args("File_Locations.txt")).await;

        let forced = ws
            .run(RunArgs {
                force_load: true,
                ..ws.args("File_Locations.txt")
            })
            .await;
        assert_eq!(forced.summary.skipped, 0);
        assert_eq!(forced.summary.succeeded, 1);
        assert_eq!(ws.count("ORDERS").await, 3);
    }

    #[tokio::test]
    async fn test_downstream_completed_blocks_until_forced() {
        let ws = Workspace::new();
        let orders = ws.write("orders.csv", ORDERS);
        ws.write("File_Locations.txt", b"path\norders.csv\n");

        ws.run(ws.args("File_Locations.txt")).await;

        let mut session = ws.session().await;
        session
            .execute(
                "UPDATE \"FILE_LOAD_LEDGER\" SET \"STATUS_FLAG\" = ?1, \"DOWNSTREAM_TIMESTAMP\" = ?2",
                &[
                    SqlValue::text("DOWNSTREAM_COMPLETED"),
                    SqlValue::text("2030-01-01 00:00:00"),
                ],
            )
            .await
            .unwrap();
        session.close().await.unwrap();
        touch_forward(&orders);

        let blocked = ws.run(ws.args("File_Locations.txt")).await;
        assert_eq!(blocked.summary.skipped, 1);

        let forced = ws
            .run(RunArgs {
                force_load: true,
                ..ws.args("File_Locations.txt")
            })
            .await;
        assert_eq!(forced.summary.succeeded, 1);
        assert_eq!(
            ws.ledger_status(&orders).await,
            Some(LedgerStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_archive_moves_loaded_files() {
        let ws = Workspace::new();
        let orders = ws.write("orders.csv", ORDERS);
        let empty = ws.write("empty.csv", b"order_id,customer\n");
        ws.write("File_Locations.txt", b"path\norders.csv\nempty.csv\n");

        let result = ws
            .run(RunArgs {
                archive: true,
                ..ws.args("File_Locations.txt")
            })
            .await;
        assert_eq!(result.summary.succeeded, 1);
        assert_eq!(result.summary.failed, 1);

        let archived = ws.path(&format!("archive/orders_{}.csv", result.stamp.file_suffix()));
        assert!(!orders.exists());
        assert!(archived.exists());
        assert!(empty.exists());
        assert_eq!(
            ws.ledger_status(&empty).await,
            Some(LedgerStatus::Failed)
        );

        // The archived file is gone from its manifest location
        let again = ws.run(ws.args("File_Locations.txt")).await;
        assert_eq!(again.summary.invalid_entries, 1);
    }

    #[tokio::test]
    async fn test_json_manifest_with_overrides() {
        let ws = Workspace::new();
        ws.write(
            "legacy.txt",
            b"REPORT GENERATED 2024\n1;alpha;'x;y'\n2;beta;'z'\nTOTAL 2\n",
        );
        ws.write(
            "manifest.json",
            br#"[{"path": "legacy.txt", "table": "LEGACY_ROWS", "skip_rows": 1,
                 "skip_footer": 1, "has_header": false, "delimiter": ";",
                 "quote_char": "'"}]"#,
        );

        let result = ws.run(ws.args("manifest.json")).await;
        assert_eq!(result.summary.succeeded, 1);

        let rows = ws
            .query("SELECT \"COL001\", \"COL002\", \"COL003\" FROM \"LEGACY_ROWS\" ORDER BY \"COL001\"")
            .await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][2].as_deref(), Some("x;y"));
        assert_eq!(rows[1][1].as_deref(), Some("beta"));

        let ledger = ws
            .query(
                "SELECT \"DELIMITER\", \"QUOTE_CHAR\", CAST(\"ROW_COUNT\" AS TEXT), \
                 CAST(\"COLUMN_COUNT\" AS TEXT), \"TABLE_NAME\" FROM \"FILE_LOAD_LEDGER\"",
            )
            .await;
        assert_eq!(
            ledger[0],
            vec![
                Some(";".to_string()),
                Some("'".to_string()),
                Some("2".to_string()),
                Some("3".to_string()),
                Some("LEGACY_ROWS".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let ws = Workspace::new();
        ws.write("orders.csv", ORDERS);
        ws.write("File_Locations.txt", b"path\norders.csv\n");

        let result = ws
            .run(RunArgs {
                dry_run: true,
                ..ws.args("File_Locations.txt")
            })
            .await;
        assert!(result.summary.dry_run);
        assert_eq!(result.summary.reports[0].state, FileState::Pending);
        assert_eq!(result.summary.reports[0].table, "ORDERS");

        let tables = ws
            .query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'ORDERS'")
            .await;
        assert!(tables.is_empty());
        assert_eq!(ws.ledger_status(&ws.path("orders.csv")).await, None);
    }

    #[tokio::test]
    async fn test_missing_manifest_fails_run() {
        let ws = Workspace::new();
        let err = run(ws.args("File_Locations.txt")).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read manifest"));
    }
}
