use std::{path::PathBuf, sync::Arc, time::Duration};

use offload_client::{
    Placement, RemoteWorkerEvent, SpawnRequest, WorkerError, WorkerPool,
};
use offload_node::{testing::ScriptedHost, NodeServer, RunningNode};
use offload_proto::WorkerEvent;
use tokio_stream::StreamExt;

async fn start_node(host: ScriptedHost) -> RunningNode {
    let server = NodeServer::builder()
        .credentials(offload_node::Credentials::new("u", "p"))
        .cache_dir(tempfile::tempdir().unwrap().into_path())
        .grace(Duration::from_millis(100))
        .host(Arc::new(host))
        .build();
    server.start(([127, 0, 0, 1], 0).into()).await.unwrap()
}

fn pool_for(nodes: &[&RunningNode], policy: Placement) -> WorkerPool {
    let mut builder = WorkerPool::builder().policy(policy);
    for node in nodes {
        builder = builder.node(format!("http://u:p@{}", node.addr()));
    }
    builder.build().unwrap()
}

struct Entrypoint {
    _dir: tempfile::TempDir,
    path: PathBuf,
}

fn entrypoint(source: &[u8]) -> Entrypoint {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("entry.js");
    std::fs::write(&path, source).unwrap();
    Entrypoint { _dir: dir, path }
}

#[tokio::test]
async fn lifecycle_events_arrive_in_order() {
    // S1: online, message("hi"), exit 0.
    let node = start_node(ScriptedHost::sequence(vec![
        WorkerEvent::Online(true),
        WorkerEvent::Message(b"hi".to_vec()),
        WorkerEvent::Exit(0),
    ]))
    .await;
    let pool = pool_for(&[&node], Placement::Incremental);
    let entry = entrypoint(b"postMessage('hi');");

    let mut worker = pool.spawn(&entry.path, SpawnRequest::new()).await.unwrap();
    let mut events = worker.events().unwrap();

    assert_eq!(events.recv().await, Some(RemoteWorkerEvent::Online));
    assert_eq!(
        events.recv().await,
        Some(RemoteWorkerEvent::Message(b"hi".to_vec()))
    );
    assert_eq!(events.recv().await, Some(RemoteWorkerEvent::Exit(0)));
    assert_eq!(worker.wait().await, Ok(0));
}

#[tokio::test]
async fn incremental_policy_rotates_across_nodes_in_registration_order() {
    // S2: three nodes, six spawns, n0 n1 n2 n0 n1 n2.
    let n0 = start_node(ScriptedHost::echo()).await;
    let n1 = start_node(ScriptedHost::echo()).await;
    let n2 = start_node(ScriptedHost::echo()).await;
    let pool = pool_for(&[&n0, &n1, &n2], Placement::Incremental);
    let entry = entrypoint(b"spin();");

    let expected: Vec<String> = [&n0, &n1, &n2, &n0, &n1, &n2]
        .iter()
        .map(|node| format!("http://{}/", node.addr()))
        .collect();

    let mut workers = Vec::new();
    let mut assigned = Vec::new();
    for _ in 0..6 {
        let worker = pool.spawn(&entry.path, SpawnRequest::new()).await.unwrap();
        assigned.push(worker.node_url().to_string());
        workers.push(worker);
    }
    assert_eq!(assigned, expected);

    for worker in &workers {
        worker.terminate().await.unwrap();
    }
}

#[tokio::test]
async fn posted_messages_are_echoed_back() {
    // S3: postMessage("ping") comes back as a message event.
    let node = start_node(ScriptedHost::echo()).await;
    let pool = pool_for(&[&node], Placement::Incremental);
    let entry = entrypoint(b"onMessage(echo);");

    let mut worker = pool.spawn(&entry.path, SpawnRequest::new()).await.unwrap();
    let mut events = worker.events().unwrap();
    assert_eq!(events.recv().await, Some(RemoteWorkerEvent::Online));

    worker.post_message(b"ping".to_vec()).unwrap();
    assert_eq!(
        events.recv().await,
        Some(RemoteWorkerEvent::Message(b"ping".to_vec()))
    );

    assert_eq!(worker.terminate().await, Ok(0));
}

#[tokio::test]
async fn stdin_without_opt_in_warns_and_delivers_nothing() {
    // S4: stdin flag off, writes are dropped client-side.
    let node = start_node(ScriptedHost::echo()).await;
    let pool = pool_for(&[&node], Placement::Incremental);
    let entry = entrypoint(b"mirrorStdin();");

    let mut worker = pool.spawn(&entry.path, SpawnRequest::new()).await.unwrap();
    let mut stdout = worker.stdout().unwrap();

    worker.write_stdin(b"x".to_vec()).unwrap();
    worker.write_stdin(b"x".to_vec()).unwrap();

    let nothing = tokio::time::timeout(Duration::from_millis(200), stdout.next()).await;
    assert!(nothing.is_err(), "stdin bytes must not reach the child");

    worker.terminate().await.unwrap();
}

#[tokio::test]
async fn stdin_with_opt_in_reaches_the_child() {
    let node = start_node(ScriptedHost::echo()).await;
    let pool = pool_for(&[&node], Placement::Incremental);
    let entry = entrypoint(b"mirrorStdin();");

    let mut worker = pool
        .spawn(&entry.path, SpawnRequest::new().stdin(true))
        .await
        .unwrap();
    let mut stdout = worker.stdout().unwrap();

    worker.write_stdin(b"line one\n".to_vec()).unwrap();
    let chunk = stdout.next().await.unwrap().unwrap();
    assert_eq!(&chunk[..], b"line one\n");

    worker.terminate().await.unwrap();
}

#[tokio::test]
async fn identical_entrypoints_reuse_the_cached_bundle() {
    // S5: the second spawn finds the bundle by fingerprint; both workers
    // still launch.
    let node = start_node(ScriptedHost::echo()).await;
    let pool = pool_for(&[&node], Placement::Incremental);
    let entry = entrypoint(b"sharedEntry();");

    let first = pool.spawn(&entry.path, SpawnRequest::new()).await.unwrap();
    let second = pool.spawn(&entry.path, SpawnRequest::new()).await.unwrap();
    assert_ne!(first.id(), second.id());

    first.terminate().await.unwrap();
    second.terminate().await.unwrap();
}

#[tokio::test]
async fn dropped_event_stream_surfaces_disconnect_error() {
    // S6: the node goes away mid-life; the handle sees a terminal error.
    let node = start_node(ScriptedHost::hang_after_online()).await;
    let pool = pool_for(&[&node], Placement::Incremental);
    let entry = entrypoint(b"hang();");

    let mut worker = pool.spawn(&entry.path, SpawnRequest::new()).await.unwrap();
    let mut events = worker.events().unwrap();
    assert_eq!(events.recv().await, Some(RemoteWorkerEvent::Online));

    node.shutdown();

    assert_eq!(
        events.recv().await,
        Some(RemoteWorkerEvent::Error(WorkerError::Disconnected))
    );
    assert_eq!(worker.wait().await, Err(WorkerError::Disconnected));
}

#[tokio::test]
async fn handle_calls_after_exit_fail_synchronously() {
    let node = start_node(ScriptedHost::echo()).await;
    let pool = pool_for(&[&node], Placement::Incremental);
    let entry = entrypoint(b"idle();");

    let worker = pool
        .spawn(&entry.path, SpawnRequest::new().stdin(true))
        .await
        .unwrap();
    assert_eq!(worker.terminate().await, Ok(0));

    assert_eq!(
        worker.post_message(b"late".to_vec()),
        Err(WorkerError::AfterExit)
    );
    assert_eq!(
        worker.write_stdin(b"late".to_vec()),
        Err(WorkerError::AfterExit)
    );
    assert_eq!(worker.terminate().await, Err(WorkerError::AfterExit));
}

#[tokio::test]
async fn faults_reconstruct_the_error_envelope() {
    let fault = offload_proto::FaultPayload {
        name: "RangeError".to_string(),
        message: "boom".to_string(),
        stack: Some("RangeError: boom\n    at entry.js:3".to_string()),
    };
    let node = start_node(ScriptedHost::sequence(vec![
        WorkerEvent::Online(true),
        WorkerEvent::Fault(fault.clone()),
    ]))
    .await;
    let pool = pool_for(&[&node], Placement::Incremental);
    let entry = entrypoint(b"throwSomething();");

    let mut worker = pool.spawn(&entry.path, SpawnRequest::new()).await.unwrap();
    let mut events = worker.events().unwrap();
    assert_eq!(events.recv().await, Some(RemoteWorkerEvent::Online));
    assert_eq!(
        events.recv().await,
        Some(RemoteWorkerEvent::Error(WorkerError::Fault(fault.clone())))
    );
    assert_eq!(worker.wait().await, Err(WorkerError::Fault(fault)));
}

#[tokio::test]
async fn stdout_and_stderr_keep_their_byte_order() {
    let node = start_node(ScriptedHost::sequence(vec![
        WorkerEvent::Online(true),
        WorkerEvent::Stdout(b"first ".to_vec()),
        WorkerEvent::Stderr(b"warn ".to_vec()),
        WorkerEvent::Stdout(b"second".to_vec()),
        WorkerEvent::Stderr(b"again".to_vec()),
        WorkerEvent::Exit(0),
    ]))
    .await;
    let pool = pool_for(&[&node], Placement::Incremental);
    let entry = entrypoint(b"print();");

    let mut worker = pool.spawn(&entry.path, SpawnRequest::new()).await.unwrap();
    let mut stdout = worker.stdout().unwrap();
    let mut stderr = worker.stderr().unwrap();
    assert_eq!(worker.wait().await, Ok(0));

    let mut out = Vec::new();
    while let Some(chunk) = stdout.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    let mut err = Vec::new();
    while let Some(chunk) = stderr.next().await {
        err.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(out, b"first second");
    assert_eq!(err, b"warn again");
}

#[tokio::test]
async fn dropping_the_handle_lets_the_node_reap_the_worker() {
    let node = start_node(ScriptedHost::echo()).await;
    let pool = pool_for(&[&node], Placement::Incremental);
    let entry = entrypoint(b"idle();");

    let worker = pool.spawn(&entry.path, SpawnRequest::new()).await.unwrap();
    let id = worker.id().to_string();
    drop(worker);

    // The event stream closes, the grace window passes with no reader,
    // and the node terminates and removes the worker.
    let http = reqwest::Client::new();
    let mut live = true;
    for _ in 0..100 {
        let listed: Vec<String> = http
            .get(format!("http://{}/workers", node.addr()))
            .basic_auth("u", Some("p"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        live = listed.contains(&id);
        if !live {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!live, "worker should be reaped after the grace window");
}

#[tokio::test]
async fn spawn_with_no_nodes_fails_fast() {
    let pool = WorkerPool::builder().build().unwrap();
    let entry = entrypoint(b"unused();");
    let error = pool
        .spawn(&entry.path, SpawnRequest::new())
        .await
        .unwrap_err();
    assert!(matches!(error, offload_client::SpawnError::NoNodeAvailable));
}
