use std::time::Duration;

use clap::Parser;
use holo_coordinator::node::JOURNAL_FILE;
use holo_coordinator::{run_node_with_shutdown, CoordinatorArgs};
use holo_txn::{EditLog, FileEditLog, JournalEntry, TxnStatus};

fn args(data_dir: &std::path::Path, extra: &[&str]) -> CoordinatorArgs {
    let mut argv = vec![
        "holo-coordinator".to_string(),
        "--node-id".to_string(),
        "1".to_string(),
        "--data-dir".to_string(),
        data_dir.display().to_string(),
        "--journal-sync".to_string(),
        "false".to_string(),
    ];
    argv.extend(extra.iter().map(|s| s.to_string()));
    CoordinatorArgs::try_parse_from(argv).expect("parse args")
}

async fn shutdown_after(delay: Duration) -> Result<(), std::io::Error> {
    tokio::time::sleep(delay).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn standalone_node_journals_demo_loads() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let data_dir = dir.path().join("node-1");
    let node_args = args(&data_dir, &["--standalone-workers", "3", "--demo-load"]);

    run_node_with_shutdown(node_args, shutdown_after(Duration::from_millis(1_500))).await?;

    let journal = FileEditLog::open(data_dir.join(JOURNAL_FILE), false)?;
    let entries = journal.load()?;
    let visible = entries
        .iter()
        .filter(|entry| {
            matches!(entry, JournalEntry::UpsertTransaction(txn) if txn.status == TxnStatus::Visible)
        })
        .count();
    assert!(visible >= 1, "no visible demo load in {} journal entries", entries.len());
    drop(journal);

    // A restart over the same journal replays it and shuts down cleanly.
    let node_args = args(&data_dir, &["--standalone-workers", "3"]);
    run_node_with_shutdown(node_args, shutdown_after(Duration::from_millis(100))).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn node_without_workers_starts_and_stops() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let node_args = args(dir.path(), &["--run-mode", "shared-data"]);
    run_node_with_shutdown(node_args, shutdown_after(Duration::from_millis(100))).await?;
    assert!(dir.path().join(JOURNAL_FILE).exists());
    Ok(())
}
