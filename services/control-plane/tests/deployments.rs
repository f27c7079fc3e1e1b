//! Deployment lifecycle, task delivery and node reports.

mod common;

use std::collections::BTreeMap;

use berth_control_plane::deploy::CancelOutcome;
use berth_control_plane::error::ErrorKind;
use berth_control_plane::model::{Application, PortOwner};
use berth_control_plane::store::{DeploymentStore, HierarchyStore, NodeStore};
use berth_events::{
    ApplicationStatus, CompletionReport, DeploySource, DeploymentStatus, NodeMessage,
    ProgressReport, TaskStatus, TaskType,
};
use berth_id::AppId;
use chrono::{Duration, Utc};
use common::{ram_ceiling, Harness};

async fn app_status(h: &Harness, app: &AppId) -> ApplicationStatus {
    h.store.get_application(app).await.unwrap().unwrap().status
}

#[tokio::test]
async fn create_without_node_fails_before_writing() {
    let h = Harness::new();
    let env = h.environment_tree().await;
    let app = h.application(env, None).await;

    let err = h.engine.orchestrator.create(&app.id, None, &h.ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);

    assert_eq!(app_status(&h, &app.id).await, ApplicationStatus::Stopped);
    assert!(h.engine.ports.ports_for_application(&app.id).await.unwrap().is_empty());
    assert!(h.push.sent().is_empty());
}

#[tokio::test]
async fn create_outside_the_tree_holds_no_port() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let app = h.application(berth_id::EnvId::new(), Some(node.id)).await;

    let err = h.engine.orchestrator.create(&app.id, None, &h.ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert!(h.engine.ports.ports_for_application(&app.id).await.unwrap().is_empty());
    assert!(h.engine.queue.fetch_pending(&node.id).await.unwrap().is_empty());
    assert_eq!(app_status(&h, &app.id).await, ApplicationStatus::Stopped);
}

#[tokio::test]
async fn create_on_deleted_node_fails_before_writing() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let env = h.environment_tree().await;
    let app = h.application(env, Some(node.id)).await;
    h.store.delete_node(&node.id).await.unwrap();

    let err = h.engine.orchestrator.create(&app.id, None, &h.ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert_eq!(app_status(&h, &app.id).await, ApplicationStatus::Stopped);
}

#[tokio::test]
async fn create_with_exhausted_node_fails_before_writing() {
    let h = Harness::new();
    let node = h.node("8000-8000").await;
    let env = h.environment_tree().await;
    let app = h.application(env, Some(node.id)).await;
    h.engine
        .ports
        .allocate(&node.id, PortOwner::Application(AppId::new()))
        .await
        .unwrap();

    let err = h.engine.orchestrator.create(&app.id, None, &h.ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Exhaustion);
    assert_eq!(app_status(&h, &app.id).await, ApplicationStatus::Stopped);
    assert!(h.store.get_application(&app.id).await.unwrap().unwrap().applied_limits.is_none());
}

#[tokio::test]
async fn create_queues_a_task_and_pushes_it() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    h.push.connect(node.id);
    let env = h.environment_tree().await;
    let app = h.application(env, Some(node.id)).await;

    let deployment = h.engine.orchestrator.create(&app.id, None, &h.ctx).await.unwrap();
    assert_eq!(deployment.status, DeploymentStatus::Queued);
    assert_eq!(deployment.commit_sha.as_deref(), Some("abc123"));
    assert_eq!(deployment.branch.as_deref(), Some("main"));

    let stored = h.store.get_application(&app.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ApplicationStatus::Deploying);
    let applied = stored.applied_limits.unwrap();
    assert_eq!(applied.ram_mb.amount(), Some(4096));

    let tasks = h.engine.queue.tasks_for_deployment(&deployment.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Pending);
    assert_eq!(tasks[0].task_type, TaskType::Deploy);

    let sent = h.push.sent();
    assert_eq!(sent.len(), 1);
    let NodeMessage::Task { task } = &sent[0].1 else {
        panic!("expected a task push, got {:?}", sent[0].1);
    };
    assert_eq!(task.id, tasks[0].id.to_string());
    let payload = task.deploy_payload().unwrap();
    assert_eq!(payload.task_id.as_deref(), Some(task.id.as_str()));
    assert_eq!(payload.ports, vec![8000]);
    assert_eq!(payload.resources.memory.as_deref(), Some("4g"));
}

#[tokio::test]
async fn override_commit_is_snapshotted() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let env = h.environment_tree().await;
    let app = h.application(env, Some(node.id)).await;

    let deployment = h
        .engine
        .orchestrator
        .create(&app.id, Some("fff999".to_string()), &h.ctx)
        .await
        .unwrap();
    assert_eq!(deployment.commit_sha.as_deref(), Some("fff999"));

    let tasks = h.engine.queue.fetch_pending(&node.id).await.unwrap();
    let payload = tasks[0].deploy_payload().unwrap();
    assert_eq!(payload.source.commit_sha(), Some("fff999"));
}

#[tokio::test]
async fn placeholders_resolve_in_the_payload() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let env = h.environment_tree().await;

    let mut app = Application::new(
        env,
        "api",
        DeploySource::Git {
            repository: "https://git.example.com/acme/api.git".to_string(),
            branch: "main".to_string(),
            commit_sha: Some("abc123".to_string()),
        },
    );
    app.node_id = Some(node.id);
    app.env_vars = BTreeMap::from([
        ("LISTEN".to_string(), "0.0.0.0:${PORT}".to_string()),
        ("REVISION".to_string(), "${COMMIT_SHA}".to_string()),
        ("SELF".to_string(), "${APP_ID}/${DEPLOYMENT_ID}".to_string()),
        ("UNKNOWN".to_string(), "${DATABASE_URL}".to_string()),
    ]);
    h.store.insert_application(&app).await.unwrap();

    let deployment = h.engine.orchestrator.create(&app.id, None, &h.ctx).await.unwrap();
    let tasks = h.engine.queue.fetch_pending(&node.id).await.unwrap();
    let env = tasks[0].deploy_payload().unwrap().env;

    assert_eq!(env["LISTEN"], "0.0.0.0:8000");
    assert_eq!(env["REVISION"], "abc123");
    assert_eq!(env["SELF"], format!("{}/{}", app.id, deployment.id));
    assert_eq!(env["UNKNOWN"], "${DATABASE_URL}");
}

#[tokio::test]
async fn sent_tasks_are_redelivered_until_acknowledged() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let env = h.environment_tree().await;
    let app = h.application(env, Some(node.id)).await;
    h.engine.orchestrator.create(&app.id, None, &h.ctx).await.unwrap();
    let queue = &h.engine.queue;
    let t0 = Utc::now();

    let first = queue.fetch_pending_at(&node.id, t0).await.unwrap();
    assert_eq!(first.len(), 1);

    let within_window = queue
        .fetch_pending_at(&node.id, t0 + Duration::seconds(5))
        .await
        .unwrap();
    assert!(within_window.is_empty());

    let redelivered = queue
        .fetch_pending_at(&node.id, t0 + Duration::seconds(11))
        .await
        .unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].id, first[0].id);

    queue.acknowledge(&node.id, &first[0].id).await.unwrap();
    // Acknowledging twice is harmless.
    queue.acknowledge(&node.id, &first[0].id).await.unwrap();

    let after_ack = queue
        .fetch_pending_at(&node.id, t0 + Duration::seconds(60))
        .await
        .unwrap();
    assert!(after_ack.is_empty());

    let err = queue.acknowledge(&node.id, "task_missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn tasks_are_only_delivered_to_their_node() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let other = h.node("9000-9009").await;
    let env = h.environment_tree().await;
    let app = h.application(env, Some(node.id)).await;
    h.engine.orchestrator.create(&app.id, None, &h.ctx).await.unwrap();

    assert!(h.engine.queue.fetch_pending(&other.id).await.unwrap().is_empty());
    let tasks = h.engine.queue.fetch_pending(&node.id).await.unwrap();
    assert_eq!(tasks.len(), 1);

    let err = h.engine.queue.acknowledge(&other.id, &tasks[0].id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn progress_moves_forward_only() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let env = h.environment_tree().await;
    let app = h.application(env, Some(node.id)).await;
    let deployment = h.engine.orchestrator.create(&app.id, None, &h.ctx).await.unwrap();
    let orchestrator = &h.engine.orchestrator;

    let building = orchestrator
        .report_progress(
            &deployment.id,
            &ProgressReport {
                status: DeploymentStatus::Building,
                logs: vec!["cloning".to_string()],
            },
        )
        .await
        .unwrap();
    assert_eq!(building.status, DeploymentStatus::Building);
    assert_eq!(building.logs, vec!["cloning"]);

    let deploying = orchestrator
        .report_progress(
            &deployment.id,
            &ProgressReport {
                status: DeploymentStatus::Deploying,
                logs: vec!["starting container".to_string()],
            },
        )
        .await
        .unwrap();
    assert_eq!(deploying.status, DeploymentStatus::Deploying);
    assert_eq!(deploying.logs, vec!["cloning", "starting container"]);

    let stale = orchestrator
        .report_progress(
            &deployment.id,
            &ProgressReport {
                status: DeploymentStatus::Building,
                logs: vec!["late line".to_string()],
            },
        )
        .await
        .unwrap();
    assert_eq!(stale.status, DeploymentStatus::Deploying);
    assert_eq!(stale.logs.len(), 2);

    let err = orchestrator
        .report_progress(
            &deployment.id,
            &ProgressReport {
                status: DeploymentStatus::Running,
                logs: Vec::new(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn completion_is_applied_once() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let env = h.environment_tree().await;
    let app = h.application(env, Some(node.id)).await;
    let deployment = h.engine.orchestrator.create(&app.id, None, &h.ctx).await.unwrap();
    let orchestrator = &h.engine.orchestrator;

    let running = orchestrator
        .report_completion(&deployment.id, &CompletionReport::succeeded("c-1"))
        .await
        .unwrap();
    assert_eq!(running.status, DeploymentStatus::Running);
    assert_eq!(running.container_id.as_deref(), Some("c-1"));
    assert!(running.finished_at.is_some());
    assert_eq!(app_status(&h, &app.id).await, ApplicationStatus::Running);

    let tasks = h.engine.queue.tasks_for_deployment(&deployment.id).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));

    let duplicate = orchestrator
        .report_completion(&deployment.id, &CompletionReport::failed("oom"))
        .await
        .unwrap();
    assert_eq!(duplicate, running);
    assert_eq!(app_status(&h, &app.id).await, ApplicationStatus::Running);
}

#[tokio::test]
async fn failed_completion_marks_application_failed() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let env = h.environment_tree().await;
    let app = h.application(env, Some(node.id)).await;
    let deployment = h.engine.orchestrator.create(&app.id, None, &h.ctx).await.unwrap();

    let failed = h
        .engine
        .orchestrator
        .report_completion(&deployment.id, &CompletionReport::failed("build failed"))
        .await
        .unwrap();
    assert_eq!(failed.status, DeploymentStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("build failed"));
    assert_eq!(app_status(&h, &app.id).await, ApplicationStatus::Failed);

    let tasks = h.engine.queue.tasks_for_deployment(&deployment.id).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Failed));
}

#[tokio::test]
async fn cancel_stops_in_progress_deployments_only() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    h.push.connect(node.id);
    let env = h.environment_tree().await;
    let app = h.application(env, Some(node.id)).await;
    let deployment = h.engine.orchestrator.create(&app.id, None, &h.ctx).await.unwrap();

    let outcome = h.engine.orchestrator.cancel(&deployment.id, &h.ctx).await.unwrap();
    let CancelOutcome::Cancelled(cancelled) = outcome else {
        panic!("expected the deployment to be cancelled");
    };
    assert_eq!(cancelled.status, DeploymentStatus::Cancelled);
    assert_eq!(app_status(&h, &app.id).await, ApplicationStatus::Stopped);

    let tasks = h.engine.queue.tasks_for_deployment(&deployment.id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].task_type, TaskType::Deploy);
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[1].task_type, TaskType::CancelDeployment);
    assert_eq!(tasks[1].status, TaskStatus::Pending);

    let sent = h.push.sent();
    assert!(sent.iter().any(|(_, message)| matches!(
        message,
        NodeMessage::Cancel { deployment_id } if *deployment_id == deployment.id
    )));

    let again = h.engine.orchestrator.cancel(&deployment.id, &h.ctx).await.unwrap();
    assert!(matches!(
        again,
        CancelOutcome::NotCancellable(ref current) if current.status == DeploymentStatus::Cancelled
    ));

    // A late completion does not resurrect it.
    let late = h
        .engine
        .orchestrator
        .report_completion(&deployment.id, &CompletionReport::succeeded("c-1"))
        .await
        .unwrap();
    assert_eq!(late.status, DeploymentStatus::Cancelled);
}

#[tokio::test]
async fn cancel_of_running_deployment_is_refused() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let env = h.environment_tree().await;
    let app = h.application(env, Some(node.id)).await;
    let deployment = h.engine.orchestrator.create(&app.id, None, &h.ctx).await.unwrap();
    h.engine
        .orchestrator
        .report_completion(&deployment.id, &CompletionReport::succeeded("c-1"))
        .await
        .unwrap();

    let outcome = h.engine.orchestrator.cancel(&deployment.id, &h.ctx).await.unwrap();
    assert!(matches!(outcome, CancelOutcome::NotCancellable(_)));
    assert_eq!(app_status(&h, &app.id).await, ApplicationStatus::Running);
}

#[tokio::test]
async fn cancel_of_failed_deployment_is_refused() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let env = h.environment_tree().await;
    let app = h.application(env, Some(node.id)).await;
    let deployment = h.engine.orchestrator.create(&app.id, None, &h.ctx).await.unwrap();
    h.engine
        .orchestrator
        .report_completion(&deployment.id, &CompletionReport::failed("build exited 1"))
        .await
        .unwrap();
    assert_eq!(app_status(&h, &app.id).await, ApplicationStatus::Failed);

    let outcome = h.engine.orchestrator.cancel(&deployment.id, &h.ctx).await.unwrap();
    let CancelOutcome::NotCancellable(current) = outcome else {
        panic!("failed deployment was cancelled");
    };
    assert_eq!(current.status, DeploymentStatus::Failed);
    assert_eq!(current.error.as_deref(), Some("build exited 1"));

    let stored = h.engine.orchestrator.get(&deployment.id).await.unwrap();
    assert_eq!(stored.status, DeploymentStatus::Failed);
    assert_eq!(app_status(&h, &app.id).await, ApplicationStatus::Failed);
}

#[tokio::test]
async fn rollback_redeploys_an_earlier_snapshot() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let env = h.environment_tree().await;
    let app = h.application(env, Some(node.id)).await;
    let orchestrator = &h.engine.orchestrator;

    let first = orchestrator.create(&app.id, None, &h.ctx).await.unwrap();
    orchestrator
        .report_completion(&first.id, &CompletionReport::succeeded("c-1"))
        .await
        .unwrap();
    let second = orchestrator
        .create(&app.id, Some("def456".to_string()), &h.ctx)
        .await
        .unwrap();
    orchestrator
        .report_completion(&second.id, &CompletionReport::succeeded("c-2"))
        .await
        .unwrap();

    let rollback = orchestrator.rollback(&first.id, &h.ctx).await.unwrap();
    assert_ne!(rollback.id, first.id);
    assert_eq!(rollback.commit_sha.as_deref(), Some("abc123"));
    assert_eq!(rollback.rollback_to_deployment_id, Some(first.id));
    assert_eq!(rollback.status, DeploymentStatus::Queued);

    // The target row is untouched.
    assert_eq!(orchestrator.get(&first.id).await.unwrap().status, DeploymentStatus::Running);

    let tasks = h.engine.queue.fetch_pending(&node.id).await.unwrap();
    let payload = tasks.last().unwrap().deploy_payload().unwrap();
    assert_eq!(payload.deployment_id, rollback.id);
    assert_eq!(payload.rollback_to_deployment_id, Some(first.id));
    // The application keeps its port across deployments.
    assert_eq!(payload.ports, vec![8000]);
}

#[tokio::test]
async fn limit_changes_redeploy_running_applications() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let user = h.user(ram_ceiling(2048)).await;
    let team = h.team(user, Default::default()).await;
    let project = h.project(team, Default::default()).await;
    let env = h.environment(project, Default::default()).await;
    let running = h.application(env, Some(node.id)).await;
    let unassigned = h.application(env, Some(node.id)).await;
    let orchestrator = &h.engine.orchestrator;

    for app in [&running, &unassigned] {
        let deployment = orchestrator.create(&app.id, None, &h.ctx).await.unwrap();
        orchestrator
            .report_completion(&deployment.id, &CompletionReport::succeeded("c"))
            .await
            .unwrap();
    }
    orchestrator.assign_node(&unassigned.id, None, &h.ctx).await.unwrap();

    let report = h
        .engine
        .cascade
        .update_user_ceilings(&user, &ram_ceiling(1024), &h.ctx)
        .await
        .unwrap();
    assert_eq!(report.changed_applications.len(), 2);

    let stats = orchestrator.redeploy_changed(&report, &h.ctx).await;
    assert_eq!(stats.redeployed, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.failed, 0);

    let applied = h
        .store
        .get_application(&running.id)
        .await
        .unwrap()
        .unwrap()
        .applied_limits
        .unwrap();
    assert_eq!(applied.ram_mb.amount(), Some(512));
    assert_eq!(app_status(&h, &running.id).await, ApplicationStatus::Deploying);
}

#[tokio::test]
async fn assigning_an_unknown_node_is_refused() {
    let h = Harness::new();
    let env = h.environment_tree().await;
    let app = h.application(env, None).await;

    let err = h
        .engine
        .orchestrator
        .assign_node(&app.id, Some(&berth_id::NodeId::new()), &h.ctx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);

    let err = h
        .engine
        .orchestrator
        .assign_node(&AppId::new(), None, &h.ctx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
