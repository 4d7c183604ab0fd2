use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use s3_autosync::mysql::{CommandLine, DumpTool, MySqlJob, ToolOutput};
use s3_autosync::storage::MemoryObjectStore;
use s3_autosync::sync::Reconciler;
use s3_autosync::utils::config::{parse_job_config, MySqlConfig};
use s3_autosync::watch::{FolderEvent, FolderKind, WatchedFolder};
use s3_autosync::SyncError;

/// Fake `mysqldump`/`mysqlbinlog` with scripted exit codes
struct ScriptedTool {
    dump_exit_code: i32,
    failing_segment: Option<&'static str>,
    calls: Mutex<Vec<CommandLine>>,
}

impl ScriptedTool {
    fn new(dump_exit_code: i32) -> Self {
        Self {
            dump_exit_code,
            failing_segment: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn programs(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.program.clone()).collect()
    }
}

#[async_trait]
impl DumpTool for ScriptedTool {
    async fn run(&self, command: &CommandLine) -> s3_autosync::Result<ToolOutput> {
        self.calls.lock().push(command.clone());
        match command.program.as_str() {
            "mysqldump" if self.dump_exit_code == 0 => Ok(ToolOutput {
                exit_code: 0,
                stdout: b"-- live dump\n".to_vec(),
                stderr: Vec::new(),
            }),
            "mysqldump" => Ok(ToolOutput {
                exit_code: self.dump_exit_code,
                stdout: Vec::new(),
                stderr: b"Can't connect to MySQL server".to_vec(),
            }),
            "mysqlbinlog" => {
                let segment = Path::new(&command.args[2])
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if self.failing_segment == Some(segment.as_str()) {
                    return Ok(ToolOutput {
                        exit_code: 1,
                        stdout: Vec::new(),
                        stderr: b"corrupted event".to_vec(),
                    });
                }
                Ok(ToolOutput {
                    exit_code: 0,
                    stdout: format!("-- replay {}\n", segment).into_bytes(),
                    stderr: Vec::new(),
                })
            }
            other => Err(SyncError::tool(other, "unexpected program")),
        }
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    binlogs: std::path::PathBuf,
    dumps: std::path::PathBuf,
    config: MySqlConfig,
}

/// Bin-log dir with segments 1 and 3 on disk and 1, 2, 3 in the index
fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let binlogs = dir.path().join("mysql");
    let dumps = dir.path().join("dumps");
    std::fs::create_dir_all(&binlogs).unwrap();

    std::fs::write(binlogs.join("mariadb-bin.000001"), "segment one").unwrap();
    std::fs::write(binlogs.join("mariadb-bin.000003"), "segment three").unwrap();
    std::fs::write(
        binlogs.join("mariadb-bin.index"),
        "./mariadb-bin.000001\n./mariadb-bin.000002\n./mariadb-bin.000003\n",
    )
    .unwrap();

    let raw = format!(
        r#"
mysqlDb:
  shop:
    bin_logs:
      path: "{}"
      folder:
        whitelist_regex: ['mariadb-bin.*']
        s3:
          bucket_name: backups
          prefix_key: db
    dumps:
      path: "{}"
    hostname: db.internal
    username: backup
    password: secret
    database: shop
"#,
        binlogs.display(),
        dumps.display()
    );
    let config = parse_job_config(&raw).unwrap().mysql_db["shop"].clone();

    Fixture {
        _dir: dir,
        binlogs,
        dumps,
        config,
    }
}

#[tokio::test]
async fn live_dump_is_written_under_the_requested_name() {
    let fx = fixture();
    let tool = Arc::new(ScriptedTool::new(0));
    let job = MySqlJob::from_config("shop", &fx.config, tool.clone(), None).unwrap();

    let path = job.create_dump("manual.sql").await.unwrap();
    assert_eq!(path, fx.dumps.join("manual.sql"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "-- live dump\n");
    assert_eq!(tool.programs(), vec!["mysqldump"]);
}

#[tokio::test]
async fn failed_dump_falls_back_to_binlog_replay() {
    let fx = fixture();
    let tool = Arc::new(ScriptedTool::new(1));
    let job = MySqlJob::from_config("shop", &fx.config, tool.clone(), None).unwrap();

    let path = job.create_dump("manual.sql").await.unwrap();
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("from-binary-files_"));
    assert!(name.ends_with(".sql"));
    assert!(!fx.dumps.join("manual.sql").exists());

    // Segment 2 is listed but gone, so only 1 and 3 are replayed, in order
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "-- replay mariadb-bin.000001\n-- replay mariadb-bin.000003\n"
    );
    assert_eq!(tool.programs(), vec!["mysqldump", "mysqlbinlog", "mysqlbinlog"]);
}

#[tokio::test]
async fn replay_failure_on_existing_segment_fails_the_dump() {
    let fx = fixture();
    let tool = Arc::new(ScriptedTool {
        failing_segment: Some("mariadb-bin.000003"),
        ..ScriptedTool::new(1)
    });
    let job = MySqlJob::from_config("shop", &fx.config, tool, None).unwrap();

    let err = job.create_dump("manual.sql").await.unwrap_err();
    assert!(matches!(err, SyncError::ToolInvocation { .. }));

    let leftovers: Vec<_> = std::fs::read_dir(&fx.dumps).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn newest_index_file_is_used() {
    let fx = fixture();
    let nested = fx.binlogs.join("archive");
    std::fs::create_dir_all(&nested).unwrap();
    std::fs::write(nested.join("mariadb-bin.000007"), "seven").unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));
    std::fs::write(nested.join("old-bin.index"), "mariadb-bin.000007\n").unwrap();

    let job = MySqlJob::from_config("shop", &fx.config, Arc::new(ScriptedTool::new(1)), None).unwrap();
    assert_eq!(
        job.consolidator().find_index_file(),
        Some(nested.join("old-bin.index"))
    );
}

#[tokio::test]
async fn closed_segment_is_uploaded_and_dumped() {
    let fx = fixture();
    let store = Arc::new(MemoryObjectStore::new());
    let tool = Arc::new(ScriptedTool::new(0));
    let job = Arc::new(MySqlJob::from_config("shop", &fx.config, tool, None).unwrap());

    let dumps_config = fx.config.dumps_folder_config("shop");
    let dumps = Arc::new(
        WatchedFolder::new(
            job.dumps_path().to_path_buf(),
            &dumps_config,
            store.clone(),
            Reconciler::default(),
            FolderKind::Plain,
        )
        .unwrap(),
    );
    let binlogs = WatchedFolder::new(
        fx.binlogs.clone(),
        &fx.config.bin_logs.folder,
        store.clone(),
        Reconciler::default(),
        FolderKind::Binlog {
            job: job.clone(),
            dumps: dumps.clone(),
        },
    )
    .unwrap();

    // Admitted by the folder regex but not a segment
    binlogs
        .handle_event(FolderEvent::Closed(fx.binlogs.join("mariadb-bin.index")))
        .await;
    assert!(store.keys("backups").is_empty());

    binlogs
        .handle_event(FolderEvent::Closed(fx.binlogs.join("mariadb-bin.000003")))
        .await;

    let keys = store.keys("backups");
    assert!(keys.contains(&"db/mariadb-bin.000003".to_string()));
    let dump_key = keys
        .iter()
        .find(|k| k.starts_with("db/shop/dumps/mariadb-bin.000003-") && k.ends_with(".sql"))
        .expect("dump uploaded");
    assert_eq!(
        store.get("backups", dump_key).unwrap(),
        bytes::Bytes::from_static(b"-- live dump\n")
    );
    assert_eq!(dumps.len(), 1);
}
