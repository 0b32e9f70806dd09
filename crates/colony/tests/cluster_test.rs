//! Cluster-backed persistence and cross-node pub/sub tests, all running
//! against `MemoryCluster`. Two systems sharing one backend behave like a
//! two-node cluster.

use colony::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Opt-in runtime traces under `RUST_LOG=colony=debug`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn backend(node: &str) -> Arc<MemoryCluster> {
    Arc::new(MemoryCluster::new(ClusterConfig::new(
        node,
        "mem://test",
        "tests",
    )))
}

async fn connected_system(node: &str, cluster: Arc<MemoryCluster>) -> ProcessSystem {
    init_tracing();
    let system = ProcessSystem::new(SystemConfig {
        node_name: node.to_string(),
    });
    system.register_cluster(cluster);
    system.connect().await.unwrap();
    system
}

#[derive(Debug, Serialize, Deserialize)]
enum CounterMsg {
    Add(u64),
    Get,
}

fn spawn_counter(system: &ProcessSystem, name: &str, flags: ProcessFlags) -> ProcessId {
    system
        .spawn(
            name,
            flags,
            0u64,
            |count: u64, msg: CounterMsg, turn: &mut Turn| match msg {
                CounterMsg::Add(n) => Ok(count + n),
                CounterMsg::Get => {
                    turn.reply(&count)?;
                    Ok(count)
                }
            },
        )
        .unwrap()
}

#[tokio::test]
async fn test_connect_requires_registered_backend() {
    let system = ProcessSystem::default();
    assert!(matches!(
        system.connect().await,
        Err(ClusterError::NotConnected)
    ));
}

#[tokio::test]
async fn test_connect_surfaces_unreachable_store() {
    let cluster = backend("a");
    cluster.set_reachable(false);

    let system = ProcessSystem::default();
    system.register_cluster(cluster);
    assert!(matches!(
        system.connect().await,
        Err(ClusterError::Connection(_))
    ));
}

#[tokio::test]
async fn test_persistence_flags_degrade_without_cluster() {
    let system = ProcessSystem::default();
    let flags = ProcessFlags::PERSIST_INBOX.union(ProcessFlags::PERSISTENT_STATE);
    let pid = spawn_counter(&system, "counter", flags);

    system.tell(&pid, &CounterMsg::Add(2)).unwrap();
    let total: u64 = system
        .ask(&pid, &CounterMsg::Get, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(total, 2);
}

#[tokio::test]
async fn test_persistent_state_survives_restart() {
    let cluster = backend("a");
    let system = connected_system("a", cluster).await;

    let pid = spawn_counter(&system, "counter", ProcessFlags::PERSISTENT_STATE);
    system.tell(&pid, &CounterMsg::Add(3)).unwrap();
    system.tell(&pid, &CounterMsg::Add(4)).unwrap();

    // The reply resolves only after the state write committed.
    let total: u64 = system
        .ask(&pid, &CounterMsg::Get, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(total, 7);

    system.kill(&pid);
    wait_for("counter to terminate", || system.find(&pid).is_none()).await;

    let pid = spawn_counter(&system, "counter", ProcessFlags::PERSISTENT_STATE);
    let total: u64 = system
        .ask(&pid, &CounterMsg::Get, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(total, 7);
}

#[tokio::test]
async fn test_durable_inbox_replays_unprocessed_messages() {
    let cluster = backend("a");
    let system = connected_system("a", cluster).await;

    let log = Arc::new(Mutex::new(Vec::<u64>::new()));
    let spawn_recorder = |log: Arc<Mutex<Vec<u64>>>| {
        system
            .spawn(
                "recorder",
                ProcessFlags::PERSIST_INBOX,
                (),
                move |state: (), msg: u64, _turn: &mut Turn| {
                    log.lock().unwrap().push(msg);
                    Ok(state)
                },
            )
            .unwrap()
    };

    let pid = spawn_recorder(log.clone());
    for value in 0..3u64 {
        system.tell(&pid, &value).unwrap();
    }
    wait_for("live messages to process", || log.lock().unwrap().len() == 3).await;
    // Let the acks land before terminating.
    tokio::time::sleep(Duration::from_millis(50)).await;

    system.kill(&pid);
    wait_for("recorder to terminate", || system.find(&pid).is_none()).await;

    // Told while inactive: queued durably, not delivered anywhere yet.
    system.tell(&pid, &10u64).unwrap();
    system.tell(&pid, &11u64).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(log.lock().unwrap().len(), 3);

    // The restarted process drains the durable queue before live traffic.
    spawn_recorder(log.clone());
    wait_for("queued messages to replay", || {
        *log.lock().unwrap() == vec![0, 1, 2, 10, 11]
    })
    .await;
}

#[tokio::test]
async fn test_tell_to_never_spawned_process_waits_in_queue() {
    let cluster = backend("a");
    let system = connected_system("a", cluster).await;

    let pid = ProcessId::user().child("later").unwrap();
    system.tell(&pid, &5u64).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let log = Arc::new(Mutex::new(Vec::<u64>::new()));
    let sink = log.clone();
    system
        .spawn(
            "later",
            ProcessFlags::PERSIST_INBOX,
            (),
            move |state: (), msg: u64, _turn: &mut Turn| {
                sink.lock().unwrap().push(msg);
                Ok(state)
            },
        )
        .unwrap();

    wait_for("queued message to deliver", || *log.lock().unwrap() == vec![5]).await;
}

#[tokio::test]
async fn test_remote_publish_reaches_other_node_without_echo() {
    let cluster = backend("shared");
    let system_a = connected_system("a", cluster.clone()).await;
    let system_b = connected_system("b", cluster).await;

    let flags = ProcessFlags::REMOTE_PUBLISH.union(ProcessFlags::LISTEN_REMOTE_AND_LOCAL);
    let chan_a = spawn_counter(&system_a, "chan", flags);
    let chan_b = spawn_counter(&system_b, "chan", ProcessFlags::LISTEN_REMOTE_AND_LOCAL);
    assert_eq!(chan_a, chan_b);

    let seen_a = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen_b = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink_a = seen_a.clone();
    let sink_b = seen_b.clone();
    system_a.subscribe(&chan_a, move |msg: String| sink_a.lock().unwrap().push(msg));
    system_b.subscribe(&chan_b, move |msg: String| sink_b.lock().unwrap().push(msg));

    system_a.publish(&chan_a, &"hello".to_string()).unwrap();

    wait_for("remote subscriber to receive", || {
        *seen_b.lock().unwrap() == vec!["hello".to_string()]
    })
    .await;

    // The publishing node delivered locally exactly once; its own remote
    // listener dropped the echoed copy.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*seen_a.lock().unwrap(), vec!["hello".to_string()]);
}

#[tokio::test]
async fn test_listener_released_when_process_dies() {
    let cluster = backend("a");
    let system = connected_system("a", cluster.clone()).await;

    let pid = spawn_counter(&system, "chan", ProcessFlags::LISTEN_REMOTE_AND_LOCAL);
    let count = {
        let cluster = cluster.clone();
        let pid = pid.clone();
        move || cluster.subscriber_count(&pid)
    };
    wait_for("listener to subscribe", || count() == 1).await;

    // No message flows after the kill; the listener exits on its own.
    system.kill(&pid);
    wait_for("listener to unsubscribe", || count() == 0).await;
}

#[tokio::test]
async fn test_publish_without_remote_flag_stays_local() {
    let cluster = backend("shared");
    let system_a = connected_system("a", cluster.clone()).await;
    let system_b = connected_system("b", cluster).await;

    let chan_a = spawn_counter(&system_a, "chan", ProcessFlags::NONE);
    let chan_b = spawn_counter(&system_b, "chan", ProcessFlags::LISTEN_REMOTE_AND_LOCAL);

    let seen_b = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink_b = seen_b.clone();
    system_b.subscribe(&chan_b, move |msg: String| sink_b.lock().unwrap().push(msg));

    system_a.publish(&chan_a, &"local-only".to_string()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(seen_b.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let system = ProcessSystem::default();
    let pid = spawn_counter(&system, "chan", ProcessFlags::NONE);

    let seen = Arc::new(Mutex::new(Vec::<u64>::new()));
    let sink = seen.clone();
    let sub = system.subscribe(&pid, move |msg: u64| sink.lock().unwrap().push(msg));

    system.publish(&pid, &1u64).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![1]);

    system.unsubscribe(sub);
    system.publish(&pid, &2u64).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![1]);
}
