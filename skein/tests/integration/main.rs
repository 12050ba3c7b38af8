use skein::config::DaemonConfig;
use skein::daemon::{bind_daemon, connect_daemon, Daemon, DaemonRpcClient};
use skein::report::{ApplicationId, ApplicationReport, ApplicationState, ContainerState, FinalStatus};
use skein::rpc::connect_master;
use skein::ApplicationSpec;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;
use tarpc::context;

fn test_workdir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("skein-itest-{}-{}", std::process::id(), name))
}

async fn start_daemon(name: &str) -> DaemonRpcClient {
    let _ = tracing_subscriber::fmt::try_init();
    let config = DaemonConfig {
        addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
        workdir: test_workdir(name),
        ..DaemonConfig::default()
    };
    let addr = config.addr;
    let daemon = Daemon::new(config);
    let (bind_addr, _handle) = bind_daemon(daemon, addr).await.unwrap();
    connect_daemon(bind_addr).await.unwrap()
}

async fn await_terminal(client: &DaemonRpcClient, id: ApplicationId) -> ApplicationReport {
    for _ in 0..300 {
        let report = client.get_status(context::current(), id).await.unwrap().unwrap();
        if report.state.is_terminal() {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("application {} never reached a terminal state", id);
}

#[tokio::test]
async fn application_runs_to_completion() {
    let client = start_daemon("complete").await;
    let spec = ApplicationSpec::from_yaml(
        r#"
name: hello
services:
  echo:
    resources:
      memory: 32
      vcores: 1
    commands:
      - echo hello
"#,
    )
    .unwrap();

    let id = client.submit(context::current(), spec).await.unwrap().unwrap();
    let report = client.wait_for_start(context::current(), id).await.unwrap().unwrap();
    assert!(report.state >= ApplicationState::Running);
    assert_eq!(report.name, "hello");
    assert!(report.port > 0);

    let report = await_terminal(&client, id).await;
    assert_eq!(report.state, ApplicationState::Finished);
    assert_eq!(report.final_status, FinalStatus::Succeeded);
    assert_eq!(report.progress, 1.0);
    assert!(report.finish_time.is_some());
}

#[tokio::test]
async fn failing_application_names_the_service() {
    let client = start_daemon("failing").await;
    let spec = ApplicationSpec::from_yaml(
        r#"
services:
  broken:
    max_restarts: 1
    resources:
      memory: 32
      vcores: 1
    commands:
      - exit 3
"#,
    )
    .unwrap();

    let id = client.submit(context::current(), spec).await.unwrap().unwrap();
    let report = await_terminal(&client, id).await;
    assert_eq!(report.state, ApplicationState::Failed);
    assert_eq!(report.final_status, FinalStatus::Failed);
    assert!(report.diagnostics.contains("`broken`"), "diagnostics: {}", report.diagnostics);
    assert!(report.diagnostics.contains("status 3"), "diagnostics: {}", report.diagnostics);

    // The master rpc stays reachable for post-mortem queries.
    let master = connect_master(report.address().parse().unwrap()).await.unwrap();
    let failed = master
        .get_containers(context::current(), Some(vec![ContainerState::Failed]), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.len(), 2, "one initial failure and one restart");
}

#[tokio::test]
async fn killing_an_application_stops_its_containers() {
    let client = start_daemon("kill").await;
    let spec = ApplicationSpec::from_yaml(
        r#"
services:
  sleeper:
    resources:
      memory: 32
      vcores: 1
    commands:
      - sleep 30
"#,
    )
    .unwrap();

    let id = client.submit(context::current(), spec).await.unwrap().unwrap();
    client.wait_for_start(context::current(), id).await.unwrap().unwrap();
    client.kill(context::current(), id).await.unwrap().unwrap();

    let report = await_terminal(&client, id).await;
    assert_eq!(report.state, ApplicationState::Killed);
    assert_eq!(report.final_status, FinalStatus::Killed);

    let master = connect_master(report.address().parse().unwrap()).await.unwrap();
    let containers = master.get_containers(context::current(), None, None).await.unwrap().unwrap();
    assert!(containers.iter().all(|c| c.state == ContainerState::Killed));

    // Killing a dead application is a no-op.
    client.kill(context::current(), id).await.unwrap().unwrap();
}

#[tokio::test]
async fn localized_files_are_visible_to_commands() {
    let workdir = test_workdir("files-src");
    std::fs::create_dir_all(&workdir).unwrap();
    let payload = workdir.join("payload.txt");
    std::fs::write(&payload, "payload-contents\n").unwrap();

    let client = start_daemon("files").await;
    let spec = ApplicationSpec::from_yaml(&format!(
        r#"
services:
  reader:
    resources:
      memory: 32
      vcores: 1
    files:
      data.txt: {{ source: "file://{}" }}
    commands:
      - grep -q payload-contents data.txt
"#,
        payload.display()
    ))
    .unwrap();

    let id = client.submit(context::current(), spec).await.unwrap().unwrap();
    let report = await_terminal(&client, id).await;
    assert_eq!(report.final_status, FinalStatus::Succeeded, "diagnostics: {}", report.diagnostics);
}

#[tokio::test]
async fn master_kv_and_shutdown_reachable_while_running() {
    let client = start_daemon("kv").await;
    let spec = ApplicationSpec::from_yaml(
        r#"
services:
  sleeper:
    resources:
      memory: 32
      vcores: 1
    commands:
      - sleep 30
"#,
    )
    .unwrap();

    let id = client.submit(context::current(), spec).await.unwrap().unwrap();
    let report = client.wait_for_start(context::current(), id).await.unwrap().unwrap();

    let master = connect_master(report.address().parse().unwrap()).await.unwrap();
    master.kv_set(context::current(), "sleeper".into(), "ready".into()).await.unwrap().unwrap();
    assert_eq!(
        master.kv_get(context::current(), "sleeper".into(), false).await.unwrap().unwrap(),
        "ready"
    );

    master.shutdown(context::current(), FinalStatus::Succeeded).await.unwrap().unwrap();
    let report = await_terminal(&client, id).await;
    assert_eq!(report.state, ApplicationState::Finished);
    assert_eq!(report.final_status, FinalStatus::Succeeded);
}
