use super::registry::Registry;
use super::*;
use crate::cluster::{event_channel, ClusterInterface, MockCluster, YarnContainerId};
use crate::spec::ApplicationSpec;

fn app_id() -> ApplicationId {
    ApplicationId { cluster_timestamp: 1526134340424, seq: 1 }
}

fn parse(yaml: &str) -> ApplicationSpec {
    ApplicationSpec::from_yaml(yaml).unwrap()
}

async fn start(yaml: &str) -> (Arc<ApplicationMaster>, Arc<MockCluster>) {
    let _ = tracing_subscriber::fmt::try_init();
    let (sink, events) = event_channel();
    let cluster = MockCluster::new(app_id(), sink);
    let am = ApplicationMaster::start(
        app_id(),
        "tester",
        parse(yaml),
        Arc::clone(&cluster) as Arc<dyn ClusterInterface>,
        events,
    )
    .await
    .unwrap();
    (am, cluster)
}

async fn wait_until(what: &str, f: impl Fn() -> bool) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn states_of(am: &ApplicationMaster, service: &str) -> Vec<ContainerState> {
    am.container_snapshot(None, Some(vec![service.to_owned()]))
        .unwrap()
        .into_iter()
        .map(|c| c.state)
        .collect()
}

const ONE_SERVICE: &str = r#"
services:
  a:
    resources:
      memory: 128
      vcores: 1
    commands:
      - echo hi
"#;

#[tokio::test]
async fn single_service_runs_to_success() {
    let (am, cluster) = start(ONE_SERVICE).await;
    wait_until("container launch", || cluster.launched().len() == 1).await;
    wait_until("container running", || states_of(&am, "a") == [ContainerState::Running]).await;
    assert_eq!(am.report().state, ApplicationState::Running);

    assert!(cluster.registered().is_some());
    let (id, ctx) = cluster.launched().pop().unwrap();
    assert_eq!(ctx.commands, vec!["echo hi"]);
    cluster.complete(&id, 0, "");

    let (status, diagnostics) = am.wait_finished().await;
    assert_eq!(status, FinalStatus::Succeeded);
    assert!(diagnostics.is_empty());
    assert_eq!(states_of(&am, "a"), [ContainerState::Succeeded]);
    assert_eq!(cluster.unregistration().unwrap().0, FinalStatus::Succeeded);

    let report = am.report();
    assert_eq!(report.state, ApplicationState::Finished);
    assert_eq!(report.progress, 1.0);
    assert!(report.finish_time.is_some());
}

#[tokio::test]
async fn injected_environment_identifies_the_container() {
    let (am, cluster) = start(ONE_SERVICE).await;
    wait_until("container launch", || cluster.launched().len() == 1).await;
    let (id, ctx) = cluster.launched().pop().unwrap();
    assert_eq!(ctx.env["SKEIN_APPMASTER_ADDRESS"], am.address().to_string());
    assert_eq!(ctx.env["SKEIN_APPLICATION_ID"], am.app_id().to_string());
    assert_eq!(ctx.env["SKEIN_SERVICE"], "a");
    assert_eq!(ctx.env["SKEIN_INSTANCE"], "0");
    assert_eq!(ctx.env["SKEIN_CONTAINER_ID"], id.to_string());
}

#[tokio::test]
async fn dependent_service_waits_for_readiness_key() {
    let (am, cluster) = start(
        r#"
services:
  a:
    resources:
      memory: 128
      vcores: 1
    commands:
      - ./serve
  b:
    resources:
      memory: 256
      vcores: 1
    commands:
      - ./follow
    depends:
      - a
"#,
    )
    .await;

    wait_until("a launched", || cluster.launched().len() == 1).await;
    // b is dependency-blocked: no request may go out for it.
    assert_eq!(cluster.requests().len(), 1);
    assert_eq!(states_of(&am, "b"), [ContainerState::Waiting]);

    // The running container of `a` declares readiness by writing its own name.
    am.set_key("a".into(), "ready".into()).await.unwrap();

    wait_until("b launched", || cluster.launched().len() == 2).await;
    let (_, ctx) = cluster.launched().pop().unwrap();
    assert_eq!(ctx.env["SKEIN_SERVICE"], "b");
    wait_until("b running", || states_of(&am, "b") == [ContainerState::Running]).await;
}

#[tokio::test]
async fn failed_service_restarts_within_budget_then_fails_application() {
    let (am, cluster) = start(
        r#"
services:
  w:
    max_restarts: 2
    resources:
      memory: 128
      vcores: 1
    commands:
      - exit 1
"#,
    )
    .await;

    for round in 0..3 {
        wait_until("launch", || cluster.launched().len() == round + 1).await;
        let (id, _) = cluster.launched()[round].clone();
        cluster.complete(&id, 1, "exited badly");
    }

    let (status, diagnostics) = am.wait_finished().await;
    assert_eq!(status, FinalStatus::Failed);
    assert!(diagnostics.contains("`w`"), "diagnostics should name the service: {}", diagnostics);
    assert!(diagnostics.contains("status 1"));

    let failed = am.container_snapshot(Some(vec![ContainerState::Failed]), None).unwrap();
    assert_eq!(failed.len(), 3);
    // No fourth instance was created after the budget ran out.
    assert_eq!(am.container_snapshot(None, None).unwrap().len(), 3);
}

#[tokio::test]
async fn killed_containers_do_not_restart_or_count_as_failures() {
    let (am, cluster) = start(ONE_SERVICE).await;
    wait_until("launch", || cluster.launched().len() == 1).await;

    am.kill_instance("a", 0).await.unwrap();
    wait_until("killed", || states_of(&am, "a") == [ContainerState::Killed]).await;

    // Killing is user-intended: no replacement instance, no service failure.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(am.container_snapshot(None, None).unwrap().len(), 1);
    assert_eq!(am.report().state, ApplicationState::Running);

    // Idempotent on a terminal instance.
    am.kill_instance("a", 0).await.unwrap();
    assert_eq!(states_of(&am, "a"), [ContainerState::Killed]);
}

#[tokio::test]
async fn scale_up_creates_new_instances_and_scale_down_kills_highest_first() {
    let (am, cluster) = start(
        r#"
services:
  n:
    instances: 2
    resources:
      memory: 128
      vcores: 1
    commands:
      - ./work
"#,
    )
    .await;

    wait_until("initial launches", || cluster.launched().len() == 2).await;

    am.rescale("n", 4).await.unwrap();
    wait_until("scaled-up launches", || cluster.launched().len() == 4).await;
    wait_until("all running", || {
        states_of(&am, "n").iter().filter(|s| **s == ContainerState::Running).count() == 4
    })
    .await;

    am.rescale("n", 1).await.unwrap();
    wait_until("scaled down", || {
        am.container_snapshot(None, None).unwrap().iter().filter(|c| !c.state.is_terminal()).count() == 1
    })
    .await;
    let containers = am.container_snapshot(None, None).unwrap();
    let survivor = containers.iter().find(|c| !c.state.is_terminal()).unwrap();
    assert_eq!(survivor.instance, 0, "the highest-indexed instances are killed first");
    for instance in [1usize, 2, 3] {
        assert_eq!(containers[instance].state, ContainerState::Killed);
    }
}

#[tokio::test]
async fn scale_to_zero_then_back_recreates_fresh_instances() {
    let (am, cluster) = start(
        r#"
services:
  keeper:
    resources:
      memory: 64
      vcores: 1
    commands:
      - sleep infinity
  n:
    instances: 2
    resources:
      memory: 128
      vcores: 1
    commands:
      - ./work
"#,
    )
    .await;
    wait_until("initial launches", || cluster.launched().len() == 3).await;

    am.rescale("n", 0).await.unwrap();
    wait_until("all stopped", || {
        states_of(&am, "n") == [ContainerState::Killed, ContainerState::Killed]
    })
    .await;
    assert_eq!(am.report().state, ApplicationState::Running);

    am.rescale("n", 2).await.unwrap();
    wait_until("fresh instances", || cluster.launched().len() == 5).await;
    let states = states_of(&am, "n");
    assert_eq!(states.len(), 4);
    assert!(!states[2].is_terminal());
    assert!(!states[3].is_terminal());
}

#[tokio::test]
async fn scale_errors() {
    let (am, _cluster) = start(ONE_SERVICE).await;
    assert!(matches!(am.rescale("ghost", 2).await, Err(RpcError::NotFound(_))));

    am.request_shutdown(FinalStatus::Succeeded, String::new()).await.unwrap();
    assert!(matches!(am.rescale("a", 2).await, Err(RpcError::FailedPrecondition(_))));
}

#[tokio::test]
async fn unmatched_grant_is_released() {
    let (_am, cluster) = start(ONE_SERVICE).await;
    wait_until("launch", || cluster.launched().len() == 1).await;
    let id = cluster.inject_allocation(Resources::new(4096, 4));
    wait_until("release", || cluster.released().contains(&id)).await;
}

#[tokio::test]
async fn graceful_shutdown_kills_everything_and_unregisters() {
    let (am, cluster) = start(
        r#"
services:
  n:
    instances: 3
    resources:
      memory: 128
      vcores: 1
    commands:
      - ./work
"#,
    )
    .await;
    wait_until("running", || {
        states_of(&am, "n").iter().all(|s| *s == ContainerState::Running)
            && states_of(&am, "n").len() == 3
    })
    .await;

    am.request_shutdown(FinalStatus::Succeeded, String::new()).await.unwrap();
    let (status, _) = am.wait_finished().await;
    assert_eq!(status, FinalStatus::Succeeded);
    assert!(states_of(&am, "n").iter().all(|s| *s == ContainerState::Killed));
    assert_eq!(cluster.stopped().len(), 3);
    assert_eq!(cluster.unregistration().unwrap().0, FinalStatus::Succeeded);

    let report = am.report();
    assert_eq!(report.state, ApplicationState::Finished);
    assert_eq!(report.final_status, FinalStatus::Succeeded);
}

#[tokio::test]
async fn repeated_shutdown_is_idempotent_per_status() {
    let (am, _cluster) = start(ONE_SERVICE).await;
    am.request_shutdown(FinalStatus::Killed, "stop".into()).await.unwrap();
    // Same status again: no-op.
    am.request_shutdown(FinalStatus::Killed, "stop".into()).await.unwrap();
    assert_eq!(am.report().final_status, FinalStatus::Killed);
    // A different status is a precondition failure.
    assert!(matches!(
        am.request_shutdown(FinalStatus::Succeeded, String::new()).await,
        Err(RpcError::FailedPrecondition(_))
    ));
}

#[tokio::test]
async fn racing_shutdowns_agree_on_a_single_status() {
    let (am, _cluster) = start(ONE_SERVICE).await;
    let first = tokio::spawn({
        let am = Arc::clone(&am);
        async move { am.request_shutdown(FinalStatus::Succeeded, String::new()).await }
    });
    let second = tokio::spawn({
        let am = Arc::clone(&am);
        async move { am.request_shutdown(FinalStatus::Killed, "stop".into()).await }
    });
    let results = (first.await.unwrap(), second.await.unwrap());
    let final_status = am.report().final_status;
    match results {
        (Ok(()), Err(RpcError::FailedPrecondition(_))) => {
            assert_eq!(final_status, FinalStatus::Succeeded)
        }
        (Err(RpcError::FailedPrecondition(_)), Ok(())) => {
            assert_eq!(final_status, FinalStatus::Killed)
        }
        other => panic!("expected exactly one winner, got {:?}", other),
    }
}

#[tokio::test]
async fn cluster_shutdown_request_kills_the_application() {
    let (am, cluster) = start(ONE_SERVICE).await;
    wait_until("launch", || cluster.launched().len() == 1).await;
    cluster.request_shutdown();
    let (status, diagnostics) = am.wait_finished().await;
    assert_eq!(status, FinalStatus::Killed);
    assert!(diagnostics.contains("cluster"));
}

#[tokio::test]
async fn oversized_request_rejects_the_application() {
    let _ = tracing_subscriber::fmt::try_init();
    let (sink, events) = event_channel();
    let cluster = MockCluster::with_maximum(app_id(), sink, Resources::new(64, 1));
    let am = ApplicationMaster::start(
        app_id(),
        "tester",
        parse(ONE_SERVICE),
        Arc::clone(&cluster) as Arc<dyn ClusterInterface>,
        events,
    )
    .await
    .unwrap();

    let (status, diagnostics) = am.wait_finished().await;
    assert_eq!(status, FinalStatus::Failed);
    assert!(diagnostics.contains("exceeding the cluster maximum"));
    // Rejected atomically: nothing was ever requested.
    assert!(cluster.requests().is_empty());
}

#[tokio::test]
async fn zero_instance_services_complete_immediately() {
    let (am, cluster) = start(
        r#"
services:
  idle:
    instances: 0
    resources:
      memory: 128
      vcores: 1
    commands:
      - ./never
"#,
    )
    .await;
    let (status, _) = am.wait_finished().await;
    assert_eq!(status, FinalStatus::Succeeded);
    assert!(cluster.requests().is_empty());
    assert!(am.container_snapshot(None, None).unwrap().is_empty());
}

#[tokio::test]
async fn kv_keys_are_validated() {
    let (am, _cluster) = start(ONE_SERVICE).await;
    assert!(matches!(am.set_key(String::new(), "v".into()).await, Err(RpcError::InvalidArgument(_))));
    assert!(matches!(am.get_key("nul\0led"), Err(RpcError::InvalidArgument(_))));
    assert!(matches!(am.get_key("missing"), Err(RpcError::NotFound(_))));
}

#[test]
fn registry_guards_illegal_transitions() {
    let spec = parse(ONE_SERVICE);
    let mut registry = Registry::new(&spec);
    let instance = registry.create_instance("a");
    let yarn_id = YarnContainerId("container_1_0001_01_000001".into());

    // Launch ack before any allocation is bound is rejected.
    assert!(!registry.on_launched("a", instance));

    assert!(registry.bind_allocation("a", instance, yarn_id.clone()));
    // Double-bind is rejected.
    assert!(!registry.bind_allocation("a", instance, yarn_id.clone()));

    assert!(registry.on_launched("a", instance));
    assert!(registry.on_completed("a", instance, ContainerState::Succeeded));
    // Terminal instances ignore further events.
    assert!(!registry.on_completed("a", instance, ContainerState::Failed));
    assert_eq!(registry.service("a").unwrap().container(instance).unwrap().state, ContainerState::Succeeded);

    // Events for unknown instances are dropped, not panicked on.
    assert!(!registry.on_completed("a", 17, ContainerState::Failed));
    assert!(!registry.on_completed("ghost", 0, ContainerState::Failed));
}
