//! Many workers against one master from separate threads.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use vecfarm_master::{Command, Master, MasterConfig, SessionState, Target};
use vecfarm_wire::{
    ArrayProto, ClientId, ConnectRequest, InstanceId, MasterRequest, Nonce, RequestCommand,
    ResponseCode, master_request::Payload, master_response,
};

const WORKERS: usize = 8;
const FRAMES_PER_WORKER: Nonce = 200;

fn request(
    kind: RequestCommand,
    client_id: ClientId,
    instance_id: InstanceId,
    payload: Option<Payload>,
) -> MasterRequest {
    MasterRequest {
        command: kind.into(),
        client_id,
        instance_id,
        payload,
    }
}

fn frame_payload(client_id: ClientId, nonce: Nonce) -> Payload {
    Payload::Frame(vecfarm_wire::Frame {
        observation: Some(ArrayProto {
            data: (client_id as i64 * 1000 + nonce).to_le_bytes().to_vec(),
            shape: vec![1],
            dtype: "int64".to_string(),
        }),
        reward: nonce as f64,
        done: nonce == FRAMES_PER_WORKER,
        info: Vec::new(),
        nonce,
    })
}

/// INITIALIZE + CONNECT, returning the assigned identity.
fn join(master: &Master) -> (ClientId, InstanceId) {
    let response = master.handle(request(RequestCommand::Initialize, 0, 0, None));
    let Some(master_response::Payload::Name(name)) = response.payload else {
        panic!("expected NameResponse");
    };
    let connect = Payload::Connect(ConnectRequest {
        spaces: name.client_id.to_le_bytes().to_vec(),
    });
    let response = master.handle(request(
        RequestCommand::Connect,
        name.client_id,
        name.instance_id,
        Some(connect),
    ));
    assert!(matches!(
        response.response(),
        ResponseCode::Ok | ResponseCode::OkEncourage
    ));
    (name.client_id, name.instance_id)
}

/// Stream every frame, retrying on WAIT. Returns the number of WAITs seen.
fn stream(master: &Master, client_id: ClientId, instance_id: InstanceId) -> usize {
    let mut waits = 0;
    let mut nonce = 1;
    while nonce <= FRAMES_PER_WORKER {
        let response = master.handle(request(
            RequestCommand::Frame,
            client_id,
            instance_id,
            Some(frame_payload(client_id, nonce)),
        ));
        match response.response() {
            ResponseCode::Ok | ResponseCode::OkEncourage => nonce += 1,
            ResponseCode::Wait => {
                waits += 1;
                thread::yield_now();
            }
            other => panic!("client {client_id} nonce {nonce}: unexpected {other:?}"),
        }
    }
    waits
}

/// Drain `expected` frames, grouping nonces by client.
fn collect(master: &Master, expected: usize) -> HashMap<ClientId, Vec<Nonce>> {
    let queue = master.ingestion_queue();
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut seen: HashMap<ClientId, Vec<Nonce>> = HashMap::new();
    let mut count = 0;

    while count < expected {
        assert!(Instant::now() < deadline, "timed out after {count} frames");
        if let Some((client_id, frame)) = queue.pop_timeout(Duration::from_millis(50)) {
            seen.entry(client_id).or_default().push(frame.nonce);
            count += 1;
        }
    }
    seen
}

#[test]
fn test_concurrent_workers_keep_per_client_order() {
    let config = MasterConfig {
        ingestion_capacity: 16,
        enqueue_wait_ms: 0,
        number_of_environments: WORKERS,
        ..Default::default()
    };
    let master = Arc::new(Master::new(config));

    let mut handles = vec![];
    for _ in 0..WORKERS {
        let master = Arc::clone(&master);
        handles.push(thread::spawn(move || {
            let (client_id, instance_id) = join(&master);
            stream(&master, client_id, instance_id);
            client_id
        }));
    }

    let expected = WORKERS * FRAMES_PER_WORKER as usize;
    let seen = collect(&master, expected);

    let mut client_ids: Vec<ClientId> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();
    client_ids.sort_unstable();
    client_ids.dedup();
    assert_eq!(client_ids.len(), WORKERS, "client ids must be unique");

    let in_order: Vec<Nonce> = (1..=FRAMES_PER_WORKER).collect();
    for client_id in &client_ids {
        assert_eq!(seen.get(client_id), Some(&in_order), "client {client_id}");
        assert_eq!(master.last_nonce(*client_id), Some(FRAMES_PER_WORKER));
        assert_eq!(
            master.spaces(*client_id),
            Some(client_id.to_le_bytes().to_vec())
        );
    }
    assert!(master.ingestion_queue().is_empty());
}

#[test]
fn test_misbehaving_worker_does_not_disturb_others() {
    let config = MasterConfig {
        number_of_environments: 4,
        ..Default::default()
    };
    let master = Arc::new(Master::new(config));
    let (rogue, rogue_instance) = join(&master);

    let mut handles = vec![];
    for _ in 0..3 {
        let master = Arc::clone(&master);
        handles.push(thread::spawn(move || {
            let (client_id, instance_id) = join(&master);
            stream(&master, client_id, instance_id);
            client_id
        }));
    }

    // Replays, wrong generation and illegal requests, all while others stream.
    let rogue_master = Arc::clone(&master);
    let rogue_handle = thread::spawn(move || {
        for _ in 0..200 {
            let replay = rogue_master.handle(request(
                RequestCommand::Frame,
                rogue,
                rogue_instance,
                Some(frame_payload(rogue, 5)),
            ));
            assert_eq!(replay.response(), ResponseCode::SoftError);

            let stale = rogue_master.handle(request(
                RequestCommand::Heartbeat,
                rogue,
                rogue_instance + 10_000,
                None,
            ));
            assert_eq!(stale.response(), ResponseCode::Reset);

            let again = rogue_master.handle(request(
                RequestCommand::Initialize,
                rogue,
                rogue_instance,
                None,
            ));
            assert_eq!(again.response(), ResponseCode::Error);
        }
    });

    let seen = collect(&master, 3 * FRAMES_PER_WORKER as usize);
    rogue_handle.join().unwrap();
    let in_order: Vec<Nonce> = (1..=FRAMES_PER_WORKER).collect();
    for handle in handles {
        let client_id = handle.join().unwrap();
        assert_eq!(seen.get(&client_id), Some(&in_order));
    }

    assert!(!seen.contains_key(&rogue));
    assert_eq!(master.last_nonce(rogue), Some(0));
    assert_eq!(master.session_count(), 4);
}

#[test]
fn test_broadcast_while_streaming() {
    let master = Arc::new(Master::new(MasterConfig::default()));
    let workers: Vec<(ClientId, InstanceId)> = (0..4).map(|_| join(&master)).collect();

    let submitter = {
        let master = Arc::clone(&master);
        thread::spawn(move || {
            for i in 0..100u8 {
                master
                    .submit(Target::All, Command::Step { actions: vec![i] })
                    .unwrap();
            }
        })
    };

    let mut handles = vec![];
    for (client_id, instance_id) in workers.clone() {
        let master = Arc::clone(&master);
        handles.push(thread::spawn(move || {
            let mut last_nonce = 0;
            for _ in 0..100 {
                let response =
                    master.handle(request(RequestCommand::Heartbeat, client_id, instance_id, None));
                assert_eq!(response.response(), ResponseCode::Ok);
                let command = response.last_command().unwrap();
                assert_eq!(command.instance_id, instance_id);
                last_nonce = command.nonce;
            }
            last_nonce
        }));
    }

    submitter.join().unwrap();
    for handle in handles {
        // No frames were sent, so every command expects nonce 1.
        assert_eq!(handle.join().unwrap(), 1);
    }
    assert_eq!(master.session_count(), workers.len());
}

/// Stream until the session goes away. Returns the number of accepted frames.
fn stream_until_gone(master: &Master, client_id: ClientId, instance_id: InstanceId) -> Nonce {
    let mut nonce = 1;
    loop {
        let response = master.handle(request(
            RequestCommand::Frame,
            client_id,
            instance_id,
            Some(frame_payload(client_id, nonce)),
        ));
        match response.response() {
            ResponseCode::Ok | ResponseCode::OkEncourage => nonce += 1,
            ResponseCode::Wait => thread::yield_now(),
            ResponseCode::Reset | ResponseCode::Error => return nonce - 1,
            other => panic!("nonce {nonce}: unexpected {other:?}"),
        }
    }
}

/// Stream from one thread while `interrupt` tears the session down from
/// another, then check the queue holds each accepted frame exactly once.
fn race_teardown(interrupt: impl FnOnce(&Master, ClientId, InstanceId) + Send + 'static) {
    let config = MasterConfig {
        ingestion_capacity: 100_000,
        ..Default::default()
    };
    let master = Arc::new(Master::new(config));
    let (client_id, instance_id) = join(&master);

    let streamer = {
        let master = Arc::clone(&master);
        thread::spawn(move || stream_until_gone(&master, client_id, instance_id))
    };
    let heartbeats = {
        let master = Arc::clone(&master);
        thread::spawn(move || loop {
            let response =
                master.handle(request(RequestCommand::Heartbeat, client_id, instance_id, None));
            match response.response() {
                ResponseCode::Ok | ResponseCode::OkEncourage => thread::yield_now(),
                ResponseCode::Reset | ResponseCode::Error => break,
                other => panic!("heartbeat: unexpected {other:?}"),
            }
        })
    };
    let interrupter = {
        let master = Arc::clone(&master);
        thread::spawn(move || {
            while master.last_nonce(client_id).unwrap_or(0) < 100 {
                thread::yield_now();
            }
            interrupt(&*master, client_id, instance_id);
        })
    };

    interrupter.join().unwrap();
    let accepted = streamer.join().unwrap();
    heartbeats.join().unwrap();

    let nonces: Vec<Nonce> = master
        .ingestion_queue()
        .drain(usize::MAX)
        .into_iter()
        .map(|(id, frame)| {
            assert_eq!(id, client_id);
            frame.nonce
        })
        .collect();
    assert!(accepted >= 100);
    assert_eq!(nonces, (1..=accepted).collect::<Vec<_>>());
    assert_eq!(master.session_count(), 0);
    assert_eq!(master.bound_environments(), 0);
}

#[test]
fn test_close_races_streaming_worker() {
    race_teardown(|master, client_id, instance_id| {
        let response = master.handle(request(RequestCommand::Close, client_id, instance_id, None));
        assert_eq!(response.response(), ResponseCode::Ok);
    });
}

#[test]
fn test_eviction_races_streaming_worker() {
    race_teardown(|master, _, _| {
        let config = master.config();
        let dead = Instant::now() + config.heartbeat_timeout() + config.eviction_grace();
        let report = master.sweep(dead + Duration::from_secs(1));
        assert_eq!(report.removed, 1);
    });
}

#[test]
fn test_eviction_mark_races_streaming_worker() {
    race_teardown(|master, _, _| {
        let marked = Instant::now() + master.config().heartbeat_timeout();
        let report = master.sweep(marked + Duration::from_secs(1));
        assert_eq!(report.marked, 1);
    });
}

#[test]
fn test_concurrent_registration_of_one_id_keeps_slots_consistent() {
    let config = MasterConfig {
        number_of_environments: 1,
        ..Default::default()
    };
    let master = Arc::new(Master::new(config));
    let (client_id, _) = join(&master);
    let running = Arc::new(AtomicBool::new(true));

    let mut handles = vec![];
    for _ in 0..4 {
        let master = Arc::clone(&master);
        handles.push(thread::spawn(move || {
            for _ in 0..500 {
                // Instance 0 is never issued: CONNECT only succeeds through
                // the reconnect path.
                master.handle(request(RequestCommand::Initialize, client_id, 0, None));
                let connect = Payload::Connect(ConnectRequest {
                    spaces: b"S".to_vec(),
                });
                master.handle(request(RequestCommand::Connect, client_id, 0, Some(connect)));
            }
        }));
    }
    let closer = {
        let master = Arc::clone(&master);
        let running = Arc::clone(&running);
        thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                master.close(client_id);
                thread::yield_now();
            }
        })
    };

    for handle in handles {
        handle.join().unwrap();
    }
    running.store(false, Ordering::Relaxed);
    closer.join().unwrap();

    let streaming = usize::from(master.session_state(client_id) == Some(SessionState::Streaming));
    assert_eq!(master.bound_environments(), streaming);
    assert!(master.session_count() <= 1);

    // After the id is released the farm's only slot is free again.
    master.close(client_id);
    assert_eq!(master.bound_environments(), 0);
    let (fresh, _) = join(&master);
    assert_eq!(master.environment_id(fresh), Some(0));
}
