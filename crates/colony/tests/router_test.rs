//! Routing policy and worker pool maintenance tests.

use colony::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

type Log = Arc<Mutex<Vec<u64>>>;

fn spawn_recorder(system: &ProcessSystem, name: &str, log: Log) -> ProcessId {
    system
        .spawn(
            name,
            ProcessFlags::NONE,
            (),
            move |state: (), msg: u64, _turn: &mut Turn| {
                log.lock().unwrap().push(msg);
                Ok(state)
            },
        )
        .unwrap()
}

#[tokio::test]
async fn test_router_is_a_regular_process() {
    let system = ProcessSystem::default();
    let router = system
        .router(
            "pool",
            RouterPolicy::RoundRobin,
            Vec::new(),
            RouterOptions::default(),
        )
        .unwrap();

    assert_eq!(router.to_string(), "/root/user/pool");
    assert!(system.find(&router).is_some());
    assert!(system.children(&ProcessId::user()).contains(&router));
}

#[tokio::test]
async fn test_round_robin_takes_strict_turns() {
    let system = ProcessSystem::default();
    let logs: Vec<Log> = (0..3).map(|_| Log::default()).collect();
    let workers: Vec<ProcessId> = logs
        .iter()
        .enumerate()
        .map(|(i, log)| spawn_recorder(&system, &format!("w{i}"), log.clone()))
        .collect();

    let router = system
        .router(
            "pool",
            RouterPolicy::RoundRobin,
            workers,
            RouterOptions::default(),
        )
        .unwrap();

    for value in 0..6u64 {
        system.tell(&router, &value).unwrap();
    }

    wait_for("all messages to land", || {
        logs.iter().map(|log| log.lock().unwrap().len()).sum::<usize>() == 6
    })
    .await;

    for (i, log) in logs.iter().enumerate() {
        assert_eq!(*log.lock().unwrap(), vec![i as u64, i as u64 + 3]);
    }
}

#[tokio::test]
async fn test_broadcast_copies_to_every_worker() {
    let system = ProcessSystem::default();
    let logs: Vec<Log> = (0..3).map(|_| Log::default()).collect();
    let workers: Vec<ProcessId> = logs
        .iter()
        .enumerate()
        .map(|(i, log)| spawn_recorder(&system, &format!("w{i}"), log.clone()))
        .collect();

    let router = system
        .router(
            "pool",
            RouterPolicy::Broadcast,
            workers,
            RouterOptions::default(),
        )
        .unwrap();

    system.tell(&router, &7u64).unwrap();

    wait_for("broadcast to reach every worker", || {
        logs.iter().all(|log| *log.lock().unwrap() == vec![7])
    })
    .await;
}

#[tokio::test]
async fn test_ask_through_broadcast_is_no_reply() {
    let system = ProcessSystem::default();
    let log = Log::default();
    let worker = spawn_recorder(&system, "w0", log);
    let router = system
        .router(
            "pool",
            RouterPolicy::Broadcast,
            vec![worker],
            RouterOptions::default(),
        )
        .unwrap();

    let result: Result<u64, _> = system.ask(&router, &1u64, Duration::from_secs(1)).await;
    assert!(matches!(result, Err(ProcessError::NoReply)));
}

#[tokio::test]
async fn test_ask_through_round_robin_reaches_worker() {
    let system = ProcessSystem::default();
    let worker = system
        .spawn(
            "doubler",
            ProcessFlags::NONE,
            (),
            |state: (), msg: u64, turn: &mut Turn| {
                turn.reply(&(msg * 2))?;
                Ok(state)
            },
        )
        .unwrap();

    let router = system
        .router(
            "pool",
            RouterPolicy::RoundRobin,
            vec![worker],
            RouterOptions::default(),
        )
        .unwrap();

    let doubled: u64 = system.ask(&router, &21u64, Duration::from_secs(1)).await.unwrap();
    assert_eq!(doubled, 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_least_busy_avoids_deep_mailboxes() {
    let system = ProcessSystem::default();
    let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();

    // This worker parks on its first message, leaving its queue deep.
    let busy = system
        .spawn(
            "busy",
            ProcessFlags::NONE,
            (),
            move |state: (), _msg: u64, _turn: &mut Turn| {
                let _ = gate_rx.recv();
                Ok(state)
            },
        )
        .unwrap();

    let idle_log = Log::default();
    let idle = spawn_recorder(&system, "idle", idle_log.clone());

    for value in 0..4u64 {
        system.tell(&busy, &value).unwrap();
    }

    let router = system
        .router(
            "pool",
            RouterPolicy::LeastBusy,
            vec![busy, idle],
            RouterOptions::default(),
        )
        .unwrap();

    for value in 10..13u64 {
        system.tell(&router, &value).unwrap();
    }

    wait_for("idle worker to take the routed messages", || {
        *idle_log.lock().unwrap() == vec![10, 11, 12]
    })
    .await;

    drop(gate_tx);
}

#[tokio::test]
async fn test_random_single_worker_delivers() {
    let system = ProcessSystem::default();
    let log = Log::default();
    let worker = spawn_recorder(&system, "w0", log.clone());
    let router = system
        .router(
            "pool",
            RouterPolicy::Random,
            vec![worker],
            RouterOptions::default(),
        )
        .unwrap();

    for value in 0..3u64 {
        system.tell(&router, &value).unwrap();
    }
    wait_for("messages to land", || log.lock().unwrap().len() == 3).await;
}

#[tokio::test]
async fn test_terminated_worker_leaves_the_pool() {
    let system = ProcessSystem::default();
    let log_a = Log::default();
    let log_b = Log::default();
    let a = spawn_recorder(&system, "a", log_a.clone());
    let b = spawn_recorder(&system, "b", log_b.clone());

    let router = system
        .router(
            "pool",
            RouterPolicy::RoundRobin,
            vec![a.clone(), b],
            RouterOptions::default(),
        )
        .unwrap();

    system.kill(&a);
    wait_for("worker a to terminate", || system.find(&a).is_none()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    for value in 0..4u64 {
        system.tell(&router, &value).unwrap();
    }

    wait_for("worker b to take over the pool", || {
        *log_b.lock().unwrap() == vec![0, 1, 2, 3]
    })
    .await;
    assert!(log_a.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_kill_workers_on_terminate() {
    let system = ProcessSystem::default();
    let log = Log::default();
    let a = spawn_recorder(&system, "a", log.clone());
    let b = spawn_recorder(&system, "b", log);

    let router = system
        .router(
            "pool",
            RouterPolicy::RoundRobin,
            vec![a.clone(), b.clone()],
            RouterOptions {
                remove_worker_when_terminated: true,
                kill_workers_on_terminate: true,
            },
        )
        .unwrap();

    system.kill(&router);
    wait_for("router and workers to terminate", || {
        system.find(&router).is_none() && system.find(&a).is_none() && system.find(&b).is_none()
    })
    .await;
}

#[tokio::test]
async fn test_empty_pool_drops_and_answers_no_reply() {
    let system = ProcessSystem::default();
    let router = system
        .router(
            "pool",
            RouterPolicy::LeastBusy,
            Vec::new(),
            RouterOptions::default(),
        )
        .unwrap();

    system.tell(&router, &1u64).unwrap();
    let result: Result<u64, _> = system.ask(&router, &2u64, Duration::from_secs(1)).await;
    assert!(matches!(result, Err(ProcessError::NoReply)));
}
