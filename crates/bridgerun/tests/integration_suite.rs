//! End-to-end tests: bridges in separate contexts talking over channel
//! transports.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bridgewire::Body;
use bridgewire::SyncData;
use serde_json::Value;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use bridgerun::Args;
use bridgerun::Bridge;
use bridgerun::CallArg;
use bridgerun::Error;
use bridgerun::ModuleConfig;
use bridgerun::ModuleState;
use bridgerun::Peer;
use bridgerun::asset::FsAssets;
use bridgerun::channel::ChannelTransport;
use bridgerun::fanout::Fanout;
use bridgerun::fanout::FanoutSummary;
use bridgerun::fanout::TransportPool;
use bridgerun::fanout::WorkerId;
use bridgerun::transport;
use bridgerun::transport::Transport;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fixtures() -> FsAssets {
    FsAssets::new(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures"))
}

/// Links two bridges; returns (a's link to b, b's link to a).
fn connect(a: &Bridge, b: &Bridge) -> (Peer, Peer) {
    let (near, far) = ChannelTransport::pair();
    (a.attach(Arc::new(near)), b.attach(Arc::new(far)))
}

/// Waits for `cond` to hold, polling every few milliseconds.
async fn eventually(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

// --- Scenario: call queued until the module is ready ---

#[tokio::test]
async fn test_call_before_readiness_resolves() -> anyhow::Result<()> {
    init_tracing();
    let worker = Bridge::builder("worker")
        .host_module(ModuleConfig::new("add.wat"), fixtures())
        .build()?;
    let main = Bridge::builder("main").build()?;
    let (to_worker, _to_main) = connect(&main, &worker);

    let call = tokio::spawn(async move {
        to_worker
            .call("add", vec![json!(2).into(), json!(3).into()])
            .await
    });

    let gate = worker.gate().expect("worker hosts the module").clone();
    eventually(|| gate.queued() == 1).await;
    assert_eq!(gate.state(), ModuleState::Uninitialized);

    assert_eq!(worker.initialize().await?, vec!["add".to_string()]);
    assert_eq!(call.await??, json!(5));
    Ok(())
}

// --- Scenario: callback round trip ---

#[tokio::test]
async fn test_callback_round_trip() -> anyhow::Result<()> {
    init_tracing();
    let worker = Bridge::builder("worker")
        .capability("transform", |args: Args| async move {
            let text = args.str(0)?.to_string();
            let callback = args.callback(1)?;
            callback
                .invoke(vec![json!(text)])
                .await
                .map_err(|e| e.to_string())
        })
        .build()?;
    let main = Bridge::builder("main").build()?;
    let (to_worker, _to_main) = connect(&main, &worker);

    let upper = CallArg::func(|args: Args| async move {
        Ok::<Value, String>(json!(args.str(0)?.to_uppercase()))
    });
    let result = to_worker
        .call("transform", vec![json!("hello").into(), upper])
        .await?;

    assert_eq!(result, json!("HELLO"));
    assert!(main.callbacks().is_empty(), "leased callback outlived its call");
    Ok(())
}

#[tokio::test]
async fn test_durable_callback_outlives_call() -> anyhow::Result<()> {
    init_tracing();
    let stored: Arc<Mutex<Option<bridgerun::capability::RemoteCallback>>> = Arc::default();
    let slot = stored.clone();
    let worker = Bridge::builder("worker")
        .capability("subscribe", move |args: Args| {
            let slot = slot.clone();
            async move {
                *slot.lock().unwrap() = Some(args.callback(0)?);
                Ok::<Value, String>(Value::Null)
            }
        })
        .build()?;
    let main = Bridge::builder("main").build()?;
    let (to_worker, _to_main) = connect(&main, &worker);

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let listener = CallArg::durable(move |_args: Args| {
        let counter = counter.clone();
        async move { Ok::<Value, String>(json!(counter.fetch_add(1, Ordering::SeqCst) + 1)) }
    });
    to_worker.call("subscribe", vec![listener]).await?;
    assert_eq!(main.callbacks().len(), 1);

    let callback = stored.lock().unwrap().clone().expect("callback not stored");
    assert_eq!(callback.invoke(Vec::new()).await?, json!(1));
    assert_eq!(callback.invoke(Vec::new()).await?, json!(2));

    main.callbacks().revoke(callback.token());
    let err = callback.invoke(Vec::new()).await.unwrap_err();
    assert_eq!(err, Error::Remote(format!("Unknown function '{}'", callback.token())));
    Ok(())
}

// --- Scenario: unreachable module ---

#[tokio::test]
async fn test_unreachable_module_is_fetch_error() -> anyhow::Result<()> {
    init_tracing();
    let worker = Bridge::builder("worker")
        .host_module(ModuleConfig::new("missing/logic.wasm"), fixtures())
        .build()?;

    let err = worker.initialize().await.unwrap_err();
    assert!(matches!(err, Error::Fetch(bridgerun::asset::Error::NotFound(_))), "{}", err);
    assert!(matches!(worker.gate().unwrap().state(), ModuleState::Failed { .. }));
    Ok(())
}

// --- Routing ---

#[tokio::test]
async fn test_unknown_function_reported_to_caller() -> anyhow::Result<()> {
    init_tracing();
    let worker = Bridge::builder("worker").build()?;
    let main = Bridge::builder("main").build()?;
    let (to_worker, _to_main) = connect(&main, &worker);

    let err = to_worker.call("nope", Vec::new()).await.unwrap_err();
    assert_eq!(err, Error::Remote("Unknown function 'nope'".into()));
    Ok(())
}

#[tokio::test]
async fn test_capability_takes_precedence_over_module() -> anyhow::Result<()> {
    init_tracing();
    let worker = Bridge::builder("worker")
        .host_module(ModuleConfig::new("add.wat"), fixtures())
        .capability("add", |_args: Args| async { Ok::<Value, String>(json!("capability")) })
        .build()?;
    worker.initialize().await?;

    assert_eq!(worker.call_local("add", vec![json!(1), json!(2)]).await?, json!("capability"));
    Ok(())
}

#[tokio::test]
async fn test_notify_is_fire_and_forget() -> anyhow::Result<()> {
    init_tracing();
    let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
    let sink = seen.clone();
    let worker = Bridge::builder("worker")
        .capability("record", move |args: Args| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(args.value(0)?.clone());
                Ok::<Value, String>(Value::Null)
            }
        })
        .build()?;
    let main = Bridge::builder("main").build()?;
    let (to_worker, _to_main) = connect(&main, &worker);

    to_worker.notify("record", vec![json!({"event": "start"}).into()]).await?;
    assert!(main.pending().is_empty());

    eventually(|| seen.lock().unwrap().len() == 1).await;
    assert_eq!(seen.lock().unwrap()[0], json!({"event": "start"}));
    Ok(())
}

#[tokio::test]
async fn test_unknown_command_passes_through() -> anyhow::Result<()> {
    init_tracing();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let worker = Bridge::builder("worker")
        .passthrough(tx)
        .capability("ping", |_args: Args| async { Ok::<Value, String>(json!("pong")) })
        .build()?;
    let (near, far) = ChannelTransport::pair();
    let _to_main = worker.attach(Arc::new(near));

    let foreign = br#"{"cmd":"storage.put","timestamp":1,"payload":{"key":"a"}}"#.to_vec();
    far.send(&foreign).await?;
    far.send(b"definitely not json").await?;
    assert_eq!(rx.recv().await, Some(foreign));

    // The malformed message was dropped and the pump is still routing.
    let ping = bridgewire::Envelope::invoke(Some(9), "ping", Vec::new());
    far.send(&bridgewire::encode(&ping)?).await?;
    let reply = bridgewire::decode(&far.recv().await?.expect("channel closed"))?;
    assert_eq!(reply.header.correlation_id, Some(9));
    assert_eq!(reply.body, Body::Response(Ok(json!("pong"))));
    Ok(())
}

// --- Data sync ---

#[tokio::test]
async fn test_data_sync_triggers_initialization() -> anyhow::Result<()> {
    init_tracing();
    let worker = Bridge::builder("worker")
        .host_module(ModuleConfig::new("add.wat"), fixtures())
        .build()?;
    let main = Bridge::builder("main").build()?;
    let (to_worker, _to_main) = connect(&main, &worker);

    let data = SyncData {
        data: json!({"project": "demo"}),
        assets: BTreeMap::from([("add.wat".to_string(), "add.wat".to_string())]),
    };
    to_worker.sync(data.clone()).await?;
    assert_eq!(worker.data(), data);
    assert_eq!(worker.data_version(), 1);

    let names = worker.gate().unwrap().wait_ready().await?;
    assert_eq!(names, vec!["add".to_string()]);
    assert_eq!(to_worker.call("add", vec![json!(1).into(), json!(2).into()]).await?, json!(3));
    Ok(())
}

#[tokio::test]
async fn test_data_sync_without_module_asset_only_updates_store() -> anyhow::Result<()> {
    init_tracing();
    let worker = Bridge::builder("worker")
        .host_module(ModuleConfig::new("add.wat"), fixtures())
        .build()?;
    let main = Bridge::builder("main").build()?;
    let (to_worker, _to_main) = connect(&main, &worker);

    to_worker.push(SyncData { data: json!([1, 2, 3]), ..SyncData::default() }).await?;
    eventually(|| worker.data_version() == 1).await;

    assert_eq!(worker.data().data, json!([1, 2, 3]));
    assert_eq!(worker.gate().unwrap().state(), ModuleState::Uninitialized);
    Ok(())
}

#[tokio::test]
async fn test_data_sync_resolves_module_location() -> anyhow::Result<()> {
    init_tracing();
    let worker = Bridge::builder("worker")
        .host_module(ModuleConfig::new("logic.wasm"), fixtures())
        .build()?;
    let main = Bridge::builder("main").build()?;
    let (to_worker, _to_main) = connect(&main, &worker);

    to_worker
        .sync(SyncData {
            data: Value::Null,
            assets: BTreeMap::from([("logic.wasm".to_string(), "add.wat".to_string())]),
        })
        .await?;

    assert_eq!(worker.gate().unwrap().wait_ready().await?, vec!["add".to_string()]);
    assert_eq!(to_worker.call("add", vec![json!(4).into(), json!(5).into()]).await?, json!(9));
    Ok(())
}

/// Polls `current` on the worker's module until it reports `expected`.
async fn module_holds(worker: &Bridge, expected: Value) {
    let gate = worker.gate().unwrap().clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while gate.call("current", Args::default()).await.ok() != Some(expected.clone()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("module never received the synced data");
}

#[tokio::test]
async fn test_data_sync_forwards_data_to_module() -> anyhow::Result<()> {
    init_tracing();
    let config = ModuleConfig::new("logic.wasm").with_data_export("goLoadData");
    let worker = Bridge::builder("worker").host_module(config, fixtures()).build()?;
    let main = Bridge::builder("main").build()?;
    let (to_worker, _to_main) = connect(&main, &worker);
    let assets = BTreeMap::from([("logic.wasm".to_string(), "loader.wat".to_string())]);

    // First sync loads the module, then hands it the data.
    to_worker
        .sync(SyncData {
            data: json!(5),
            assets: assets.clone(),
        })
        .await?;
    worker.gate().unwrap().wait_ready().await?;
    module_holds(&worker, json!(5)).await;

    // Later syncs go straight to the ready module.
    to_worker.sync(SyncData { data: json!(9), assets }).await?;
    module_holds(&worker, json!(9)).await;
    assert_eq!(worker.data_version(), 2);
    Ok(())
}

// --- Fan-out ---

#[tokio::test]
async fn test_broadcast_isolates_worker_failures() -> anyhow::Result<()> {
    init_tracing();
    let main = Bridge::builder("main").build()?;
    let pool = Arc::new(TransportPool::new());

    let (first, first_far) = ChannelTransport::pair();
    let (dead, dead_far) = ChannelTransport::pair();
    let (third, third_far) = ChannelTransport::pair();
    drop(dead_far);

    pool.add_worker(WorkerId(1), Arc::new(first));
    pool.add_worker(WorkerId(2), Arc::new(dead));
    pool.add_worker(WorkerId(3), Arc::new(third));

    let fanout = Fanout::new(pool.clone(), &main);
    let summary = fanout.invoke_all("tick", vec![json!(1)]).await;
    assert_eq!(summary, FanoutSummary {
        success_count: 2,
        error_count: 1,
        total_workers: 3,
    });

    let a = bridgewire::decode(&first_far.recv().await?.expect("closed"))?;
    let c = bridgewire::decode(&third_far.recv().await?.expect("closed"))?;
    assert_eq!(a.header.target_index, Some(0));
    assert_eq!(c.header.target_index, Some(2));
    assert_ne!(a.header.sequence, c.header.sequence);
    assert_eq!(a.header.correlation_id, None);
    assert_eq!(a.body, c.body);

    assert!(pool.remove_worker(WorkerId(2)));
    let summary = fanout.invoke_all("tick", Vec::new()).await;
    assert_eq!(summary, FanoutSummary {
        success_count: 2,
        error_count: 0,
        total_workers: 2,
    });
    Ok(())
}

fn named_worker(name: &str) -> anyhow::Result<Bridge> {
    let reply = name.to_string();
    Ok(Bridge::builder(name)
        .capability("whoami", move |_args: Args| {
            let reply = reply.clone();
            async move { Ok::<Value, String>(json!(reply)) }
        })
        .build()?)
}

#[tokio::test]
async fn test_acknowledged_fanout() -> anyhow::Result<()> {
    init_tracing();
    let main = Bridge::builder("main").build()?;
    let pool = Arc::new(TransportPool::new());
    let workers = [named_worker("w1")?, named_worker("w3")?];

    let (near, far) = ChannelTransport::pair();
    pool.connect(&main, WorkerId(1), Arc::new(near));
    workers[0].attach(Arc::new(far));

    let (dead, dead_far) = ChannelTransport::pair();
    drop(dead_far);
    pool.add_worker(WorkerId(2), Arc::new(dead));

    let (near, far) = ChannelTransport::pair();
    pool.connect(&main, WorkerId(3), Arc::new(near));
    workers[1].attach(Arc::new(far));

    let fanout = Fanout::new(pool, &main);

    let call = fanout.call_all("whoami", Vec::new()).await;
    assert_eq!(call.summary, FanoutSummary {
        success_count: 2,
        error_count: 1,
        total_workers: 3,
    });
    let replies = call.join().await;
    let names: Vec<Value> = replies.into_iter().map(|(_, r)| r.expect("worker call failed")).collect();
    assert_eq!(names, vec![json!("w1"), json!("w3")]);
    assert!(main.pending().is_empty(), "failed send left a pending entry");

    let data = SyncData { data: json!({"level": 3}), ..SyncData::default() };
    let sync = fanout.sync_all(data.clone()).await;
    assert_eq!(sync.summary.success_count, 2);
    for (worker, ack) in sync.join().await {
        assert_eq!(ack?, Value::Null, "{} did not acknowledge", worker.id);
    }
    assert!(workers.iter().all(|w| w.data() == data));
    Ok(())
}

// --- Teardown and link loss ---

#[tokio::test]
async fn test_destroy_rejects_outstanding_calls() -> anyhow::Result<()> {
    init_tracing();
    let worker = Bridge::builder("worker")
        .capability("hang", |_args: Args| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<Value, String>(Value::Null)
        })
        .build()?;
    let main = Bridge::builder("main").build()?;
    let (to_worker, _to_main) = connect(&main, &worker);

    let waiting = {
        let to_worker = to_worker.clone();
        tokio::spawn(async move { to_worker.call("hang", Vec::new()).await })
    };
    eventually(|| main.pending().len() == 1).await;

    main.destroy();
    assert!(main.is_destroyed());
    assert_eq!(waiting.await?, Err(Error::BridgeDestroyed));
    assert_eq!(to_worker.call("hang", Vec::new()).await, Err(Error::BridgeDestroyed));
    assert_eq!(main.call_local("anything", Vec::new()).await, Err(Error::BridgeDestroyed));
    assert_eq!(main.links(), 0);
    Ok(())
}

#[tokio::test]
async fn test_link_loss_rejects_calls_on_that_link() -> anyhow::Result<()> {
    init_tracing();
    let main = Bridge::builder("main").build()?;
    let (near, far) = ChannelTransport::pair();
    let peer = main.attach(Arc::new(near));

    let waiting = {
        let peer = peer.clone();
        tokio::spawn(async move { peer.call("anything", Vec::new()).await })
    };
    eventually(|| main.pending().len() == 1).await;
    far.close();

    let err = waiting.await?.unwrap_err();
    assert!(matches!(err, Error::Transport(transport::Error::ConnectionLost(_))), "{}", err);
    eventually(|| main.links() == 0).await;
    drop(far);

    // Sending on the lost link now fails without leaving an entry behind.
    let err = peer.call("anything", Vec::new()).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "{}", err);
    assert!(main.pending().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_call_on_closed_link_fails_fast() -> anyhow::Result<()> {
    init_tracing();
    let main = Bridge::builder("main").build()?;
    let (near, far) = ChannelTransport::pair();
    let peer = main.attach(Arc::new(near));
    assert!(peer.is_alive());

    // The far end stops sending but keeps receiving, so sends still succeed.
    far.close();
    eventually(|| !peer.is_alive()).await;

    let outcome = tokio::time::timeout(Duration::from_secs(1), peer.call("anything", Vec::new())).await?;
    let err = outcome.unwrap_err();
    assert!(matches!(err, Error::Transport(transport::Error::ConnectionLost(_))), "{}", err);
    assert!(main.pending().is_empty());
    drop(far);
    Ok(())
}
