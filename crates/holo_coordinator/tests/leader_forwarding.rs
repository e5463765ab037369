mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{direct_config, olap_catalog, Harness, DB, TABLE};
use holo_coordinator::leader::{
    AbortRemoteTxnRequest, BeginRemoteTxnRequest, BeginRemoteTxnResponse, CommitRemoteTxnRequest,
    RemoteTxnResponse,
};
use holo_coordinator::{Coordinator, FinishTaskRequest, LeaderForwarder, LeaderState};
use holo_txn::txn::LoadJobSourceType;
use holo_txn::{StatusCode, TaskType, TxnError, TxnStatus};

/// Relays requests to another in-process coordinator.
struct InProcessForwarder {
    leader: Arc<Coordinator>,
    forwarded: AtomicUsize,
}

#[async_trait]
impl LeaderForwarder for InProcessForwarder {
    async fn begin_remote_txn(
        &self,
        req: BeginRemoteTxnRequest,
    ) -> anyhow::Result<BeginRemoteTxnResponse> {
        self.forwarded.fetch_add(1, Ordering::SeqCst);
        Ok(self.leader.service.begin_remote_txn(req).await)
    }

    async fn commit_remote_txn(
        &self,
        req: CommitRemoteTxnRequest,
    ) -> anyhow::Result<RemoteTxnResponse> {
        self.forwarded.fetch_add(1, Ordering::SeqCst);
        Ok(self.leader.service.commit_remote_txn(req).await)
    }

    async fn abort_remote_txn(
        &self,
        req: AbortRemoteTxnRequest,
    ) -> anyhow::Result<RemoteTxnResponse> {
        self.forwarded.fetch_add(1, Ordering::SeqCst);
        Ok(self.leader.service.abort_remote_txn(req).await)
    }
}

/// Every call fails as if the leader were unreachable.
struct BrokenForwarder;

#[async_trait]
impl LeaderForwarder for BrokenForwarder {
    async fn begin_remote_txn(
        &self,
        _req: BeginRemoteTxnRequest,
    ) -> anyhow::Result<BeginRemoteTxnResponse> {
        anyhow::bail!("connection refused")
    }

    async fn commit_remote_txn(
        &self,
        _req: CommitRemoteTxnRequest,
    ) -> anyhow::Result<RemoteTxnResponse> {
        anyhow::bail!("connection refused")
    }

    async fn abort_remote_txn(
        &self,
        _req: AbortRemoteTxnRequest,
    ) -> anyhow::Result<RemoteTxnResponse> {
        anyhow::bail!("connection refused")
    }
}

fn begin_request(label: &str) -> BeginRemoteTxnRequest {
    BeginRemoteTxnRequest {
        db_id: DB,
        table_ids: vec![TABLE],
        label: label.to_string(),
        request_id: None,
        source_type: LoadJobSourceType::Frontend,
        timeout_ms: 60_000,
        coordinator_host: "10.0.0.7".to_string(),
        use_combined_txn_log: false,
    }
}

fn follower(forwarder: Option<Arc<dyn LeaderForwarder>>) -> Harness {
    Harness::with_role(
        olap_catalog(),
        direct_config(),
        Arc::new(LeaderState::follower(Some("10.0.0.1:9010".to_string()))),
        forwarder,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_relays_begin_and_commit_to_leader() -> anyhow::Result<()> {
    let leader = Harness::start(olap_catalog(), direct_config());
    let forwarder = Arc::new(InProcessForwarder {
        leader: leader.coordinator.clone(),
        forwarded: AtomicUsize::new(0),
    });
    let follower = follower(Some(forwarder.clone()));

    let begin = follower
        .coordinator
        .service
        .begin_remote_txn(begin_request("remote-1"))
        .await;
    assert_eq!(begin.status, StatusCode::Ok, "{:?}", begin.error_msgs);
    assert_eq!(begin.txn_label, "remote-1");
    assert_eq!(leader.status(begin.txn_id), TxnStatus::Prepare);
    assert!(follower
        .coordinator
        .state_machine
        .get_transaction(DB, begin.txn_id)
        .is_none());

    let commit = follower
        .coordinator
        .service
        .commit_remote_txn(CommitRemoteTxnRequest {
            db_id: DB,
            txn_id: begin.txn_id,
            commit_infos: leader.commit_infos(&[TABLE]),
            fail_infos: Vec::new(),
            commit_timeout_ms: Some(5_000),
            attachment: None,
        })
        .await;
    assert_eq!(commit.status, StatusCode::Ok, "{:?}", commit.error_msgs);
    assert_eq!(leader.status(begin.txn_id), TxnStatus::Visible);
    assert_eq!(forwarder.forwarded.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forwarding_failures_become_internal_errors() -> anyhow::Result<()> {
    for forwarder in [None, Some(Arc::new(BrokenForwarder) as Arc<dyn LeaderForwarder>)] {
        let follower = follower(forwarder);
        let service = &follower.coordinator.service;

        let begin = service.begin_remote_txn(begin_request("remote-1")).await;
        assert_eq!(begin.status, StatusCode::InternalError);
        assert_eq!(begin.error_msgs, vec!["forward request to leader failed".to_string()]);

        let commit = service
            .commit_remote_txn(CommitRemoteTxnRequest {
                db_id: DB,
                txn_id: 1,
                commit_infos: Vec::new(),
                fail_infos: Vec::new(),
                commit_timeout_ms: None,
                attachment: None,
            })
            .await;
        assert_eq!(commit.status, StatusCode::InternalError);

        let abort = service
            .abort_remote_txn(AbortRemoteTxnRequest {
                db_id: DB,
                txn_id: 1,
                error_msg: "cancelled".to_string(),
            })
            .await;
        assert_eq!(abort.status, StatusCode::InternalError);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_rejects_task_reports() -> anyhow::Result<()> {
    let follower = follower(None);
    let result = follower
        .coordinator
        .completion
        .finish_task(FinishTaskRequest::new(1, TaskType::PublishVersion, 42));
    assert_eq!(result.status, StatusCode::LeaderTransferred);

    let orphan = Harness::with_role(
        olap_catalog(),
        direct_config(),
        Arc::new(LeaderState::follower(None)),
        None,
    );
    let result = orphan
        .coordinator
        .completion
        .finish_task(FinishTaskRequest::new(1, TaskType::PublishVersion, 42));
    assert_eq!(result.status, StatusCode::InternalError);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commit_times_out_but_stays_committed() -> anyhow::Result<()> {
    let leader = Harness::start(olap_catalog(), direct_config());
    for worker_id in 1..=3 {
        leader.fleet.hang_publish(worker_id, true);
    }
    let service = &leader.coordinator.service;
    let begin = service.begin_remote_txn(begin_request("remote-1")).await;
    assert_eq!(begin.status, StatusCode::Ok);

    let commit = service
        .commit_remote_txn(CommitRemoteTxnRequest {
            db_id: DB,
            txn_id: begin.txn_id,
            commit_infos: leader.commit_infos(&[TABLE]),
            fail_infos: Vec::new(),
            commit_timeout_ms: Some(200),
            attachment: None,
        })
        .await;
    assert_eq!(commit.status, StatusCode::Timeout);
    assert_eq!(commit.error_msgs, vec!["commit and publish txn timeout".to_string()]);
    assert_eq!(leader.status(begin.txn_id), TxnStatus::Committed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn begin_validates_labels() -> anyhow::Result<()> {
    let leader = Harness::new(olap_catalog(), direct_config());
    let service = &leader.coordinator.service;

    let missing = service.begin_remote_txn(begin_request("")).await;
    assert_eq!(missing.status, StatusCode::InternalError);
    assert_eq!(missing.error_msgs, vec!["missing label".to_string()]);

    let mut req = begin_request("remote-1");
    req.request_id = Some("req-1".to_string());
    let first = service.begin_remote_txn(req.clone()).await;
    assert_eq!(first.status, StatusCode::Ok);
    let retried = service.begin_remote_txn(req).await;
    assert_eq!(retried.status, StatusCode::Ok);
    assert_eq!(retried.txn_id, first.txn_id);

    let reused = service.begin_remote_txn(begin_request("remote-1")).await;
    assert_eq!(reused.status, StatusCode::InternalError);

    let mut unknown_db = begin_request("remote-2");
    unknown_db.db_id = 99;
    let resp = service.begin_remote_txn(unknown_db).await;
    assert_eq!(resp.status, StatusCode::NotFound);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_releases_visibility_waiters() -> anyhow::Result<()> {
    let leader = Harness::new(olap_catalog(), direct_config());
    let service = &leader.coordinator.service;
    let begin = service.begin_remote_txn(begin_request("remote-1")).await;
    assert_eq!(begin.status, StatusCode::Ok);

    let state_machine = leader.coordinator.state_machine.clone();
    let txn_id = begin.txn_id;
    let waiter = tokio::spawn(async move {
        state_machine
            .wait_transaction_visible(DB, txn_id, Some(std::time::Duration::from_secs(5)))
            .await
    });

    let abort = service
        .abort_remote_txn(AbortRemoteTxnRequest {
            db_id: DB,
            txn_id,
            error_msg: "load cancelled".to_string(),
        })
        .await;
    assert_eq!(abort.status, StatusCode::Ok);
    assert_eq!(leader.status(txn_id), TxnStatus::Aborted);

    match waiter.await? {
        Err(TxnError::TxnAborted { reason, .. }) => assert_eq!(reason, "load cancelled"),
        other => panic!("unexpected wait outcome: {other:?}"),
    }

    let missing = service
        .abort_remote_txn(AbortRemoteTxnRequest {
            db_id: DB,
            txn_id: txn_id + 100,
            error_msg: "load cancelled".to_string(),
        })
        .await;
    assert_eq!(missing.status, StatusCode::NotFound);
    Ok(())
}
