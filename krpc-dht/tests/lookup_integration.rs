//! Iterative lookup and maintenance behavior across several real nodes on
//! loopback.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use krpc_dht::{Dht, DhtConfig, InfoHash};
use tokio::net::UdpSocket;

fn test_config() -> DhtConfig {
    DhtConfig {
        bind_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
        bootstrap_nodes: Vec::new(),
        maintenance_interval: Duration::from_secs(3600),
        ..DhtConfig::default()
    }
}

async fn start_node() -> Dht {
    Dht::start(test_config()).await.unwrap()
}

/// A bound socket that never answers; queries against it must burn their
/// whole retry budget.
async fn silent_addr() -> (UdpSocket, SocketAddrV4) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = match socket.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => panic!("expected an ipv4 address"),
    };
    (socket, addr)
}

#[tokio::test]
async fn find_node_bootstrap_walks_past_the_seed() {
    let a = start_node().await;
    let b = start_node().await;
    let c = start_node().await;

    // b can vouch for c; a only knows b's address
    b.ping(c.local_addr()).await.unwrap();

    let contacts = a
        .bootstrap_by_find_node(Some(vec![b.local_addr()]), Duration::from_secs(5))
        .await
        .unwrap();

    // c was reachable only through b's node list
    let ids: Vec<_> = contacts.iter().map(|contact| contact.id).collect();
    assert!(ids.contains(&b.local_id()));
    assert!(ids.contains(&c.local_id()));

    // both rounds produced verified responses, so both nodes are in the table
    assert_eq!(a.node_count().await.unwrap(), 2);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn get_peers_lookup_stops_at_the_first_peers_and_keeps_the_token() {
    let a = start_node().await;
    let b = start_node().await;
    let info_hash = InfoHash::new([0x11; 20]);

    // stock b with one peer for the info hash
    let reply = a.get_peers(b.local_addr(), info_hash).await.unwrap();
    a.announce_peer(
        b.local_addr(),
        info_hash,
        7777,
        reply.token.unwrap(),
        false,
    )
    .await
    .unwrap();

    let result = a
        .bootstrap_by_get_peers(info_hash, Some(vec![b.local_addr()]), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(
        result.peers,
        vec![SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7777)]
    );
    // the issuing node's token survives for a follow-up announce
    assert_eq!(result.tokens.len(), 1);
    let (issuer, token) = &result.tokens[0];
    assert_eq!(issuer.id, b.local_id());
    a.announce_peer(b.local_addr(), info_hash, 8888, token.clone(), false)
        .await
        .unwrap();

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn ping_bootstrap_keeps_only_responders() {
    let b = start_node().await;
    let (_quiet, dead) = silent_addr().await;

    let config = DhtConfig {
        bootstrap_nodes: vec![b.local_addr().to_string(), dead.to_string()],
        request_timeout: Duration::from_millis(100),
        request_attempts: 2,
        ..test_config()
    };
    let a = Dht::start(config).await.unwrap();

    let contacts = a.bootstrap_by_ping(Duration::from_secs(5)).await.unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].id, b.local_id());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn a_lookup_without_seeds_finishes_empty() {
    let dht = start_node().await;

    let contacts = tokio::time::timeout(
        Duration::from_secs(1),
        dht.bootstrap_by_find_node(Some(Vec::new()), Duration::from_secs(30)),
    )
    .await
    .expect("empty lookup should finish immediately, not wait for a deadline")
    .unwrap();
    assert!(contacts.is_empty());

    dht.shutdown().await.unwrap();
}

#[tokio::test]
async fn maintenance_warms_the_table_right_after_start() {
    let b = start_node().await;

    // a's only knowledge is its bootstrap list; the first maintenance round
    // fires at startup and should pull b in without any explicit call
    let config = DhtConfig {
        bootstrap_nodes: vec![b.local_addr().to_string()],
        ..test_config()
    };
    let a = Dht::start(config).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while a.node_count().await.unwrap() != 1 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("maintenance never admitted the bootstrap node");

    // the other side verified us with its own ping before admission
    tokio::time::timeout(Duration::from_secs(2), async {
        while b.node_count().await.unwrap() != 1 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("liveness ping never admitted the querier");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}
