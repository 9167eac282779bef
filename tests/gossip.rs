use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use hashgraph::{Block, BlockEventAcl, Hashgraph, Inbound, MemoryNetwork, SyncAdapter, SyncConfig};

/// Polls `$check` until it holds, failing the test after roughly two seconds.
macro_rules! eventually {
    ($what:expr, $check:expr) => {{
        let mut satisfied = false;
        for _ in 0..200 {
            if $check {
                satisfied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(satisfied, "timed out waiting for {}", $what);
    }};
}

fn peer(network: &Arc<MemoryNetwork>, id: &str, config: SyncConfig) -> (SyncAdapter, UnboundedReceiver<Inbound>) {
    let (transport, inbox) = network.register(id);
    let hashgraph = Hashgraph::new(id, &config);
    (SyncAdapter::new(hashgraph, Arc::new(transport), config), inbox)
}

fn spawn_peer(network: &Arc<MemoryNetwork>, id: &str, config: SyncConfig) -> SyncAdapter {
    let (sync, inbox) = peer(network, id, config);
    tokio::spawn(sync.clone().run(inbox));
    sync
}

fn recorder(sync: &SyncAdapter) -> Arc<Mutex<Vec<Block>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    sync.handle_block(move |block| {
        log.lock().unwrap().push(block.clone());
        Ok(())
    });
    seen
}

#[tokio::test]
async fn subscriber_receives_later_appends() {
    let network = MemoryNetwork::new();
    let x = spawn_peer(&network, "peer-x", SyncConfig::default());
    let y = spawn_peer(&network, "peer-y", SyncConfig::default());
    let y_seen = recorder(&y);

    let root = x.create_graph(BlockEventAcl::default()).await.unwrap();
    let hello = x.append(&root.hash, "hello").await.unwrap();
    assert_eq!(hello.event.parents.iter().collect::<Vec<_>>(), vec![&root.hash]);

    // Y learns the topic out of band and pulls it.
    y.fetch("peer-x", vec![hello.hash.clone()]).await;
    eventually!("y to backfill the topic", y.hashgraph().contains(&hello.hash).await);
    assert_eq!(y.hashgraph().find_tip(&root.hash).await.unwrap(), vec![hello.hash.clone()]);

    let sub = y.subscribe(&root.hash).await.unwrap();
    assert_eq!(sub.event.parents.iter().collect::<Vec<_>>(), vec![&hello.hash]);
    eventually!("x to learn about the subscriber", x.hashgraph().contains(&sub.hash).await);
    assert!(x
        .hashgraph()
        .find_subscribers(&root.hash)
        .await
        .unwrap()
        .contains("peer-y"));

    let world = x.append(&root.hash, "world").await.unwrap();
    assert_eq!(world.event.parents.iter().collect::<Vec<_>>(), vec![&sub.hash]);
    eventually!("y to receive the append", y.hashgraph().contains(&world.hash).await);

    let data: Vec<String> = y_seen
        .lock()
        .unwrap()
        .iter()
        .map(|block| block.event.data.clone())
        .collect();
    assert_eq!(data, vec!["", "hello", "", "world"]);
}

#[tokio::test]
async fn concurrent_appends_fork_then_merge() {
    let network = MemoryNetwork::new();
    let x = spawn_peer(&network, "peer-x", SyncConfig::default());
    let (y, mut y_inbox) = peer(&network, "peer-y", SyncConfig::default());

    let root = x
        .create_graph(BlockEventAcl::new(vec![], vec!["peer-y".into()]))
        .await
        .unwrap();
    let announced = y_inbox.recv().await.expect("root is sent to the writer");
    y.handle_inbound(announced).await;
    assert!(y.hashgraph().contains(&root.hash).await);

    // Y's loop is not running yet, so neither peer has seen the other's append.
    let from_x = x.append(&root.hash, "from x").await.unwrap();
    let from_y = y.append(&root.hash, "from y").await.unwrap();
    assert_eq!(from_x.event.parents, from_y.event.parents);
    tokio::spawn(y.clone().run(y_inbox));

    eventually!(
        "both peers to see both branches",
        x.hashgraph().find_tip(&root.hash).await.unwrap().len() == 2
            && y.hashgraph().find_tip(&root.hash).await.unwrap().len() == 2
    );

    let join = x.append(&root.hash, "join").await.unwrap();
    assert_eq!(join.event.parents.len(), 2);
    eventually!(
        "y to converge on the join",
        y.hashgraph().find_tip(&root.hash).await.unwrap() == vec![join.hash.clone()]
    );
    assert_eq!(x.hashgraph().find_tip(&root.hash).await.unwrap(), vec![join.hash.clone()]);
}

#[tokio::test]
async fn late_joiner_backfills_missing_ancestors() {
    let config = SyncConfig::default()
        .with_sweep_interval(Duration::from_millis(20))
        .with_backfill_interval(Duration::from_millis(20));
    let network = MemoryNetwork::new();
    let x = spawn_peer(&network, "peer-x", config.clone());

    let root = x.create_graph(BlockEventAcl::default()).await.unwrap();
    let mut chain = Vec::new();
    for i in 0..5 {
        chain.push(x.append(&root.hash, format!("msg {i}")).await.unwrap());
    }
    let last = chain.last().cloned().unwrap();

    // Z only ever hears about the newest block, and only from X.
    let z = spawn_peer(&network, "peer-z", config);
    let z_seen = recorder(&z);
    z.fetch("peer-x", vec![last.hash.clone()]).await;

    eventually!(
        "z to backfill the whole chain",
        z.hashgraph().find_tip(&root.hash).await.ok() == Some(vec![last.hash.clone()])
    );
    assert_eq!(z.hashgraph().stats().await, (6, 0));
    assert_eq!(z.backfill_len().await, 0);

    let order: Vec<String> = z_seen
        .lock()
        .unwrap()
        .iter()
        .map(|block| block.event.data.clone())
        .collect();
    assert_eq!(order, vec!["", "msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
}
