//! Direct RPC behavior between real nodes on loopback, plus mock peers for
//! the failure paths the real implementation never exhibits.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use bytes::Bytes;
use krpc_dht::message::{KrpcMessage, Response};
use krpc_dht::{Dht, DhtConfig, DhtError, InfoHash, NodeId};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

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

fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => panic!("expected an ipv4 address"),
    }
}

/// A peer that swallows every datagram, forwarding copies for inspection.
async fn spawn_silent_peer() -> (SocketAddrV4, mpsc::UnboundedReceiver<Vec<u8>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = v4(socket.local_addr().unwrap());
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((len, _)) = socket.recv_from(&mut buf).await {
            if seen_tx.send(buf[..len].to_vec()).is_err() {
                return;
            }
        }
    });
    (addr, seen_rx)
}

/// A peer that stays silent until the `answer_after`th datagram, then sends
/// a valid ping response echoing the received transaction id.
async fn spawn_late_peer(answer_after: usize) -> (SocketAddrV4, mpsc::UnboundedReceiver<Vec<u8>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = v4(socket.local_addr().unwrap());
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let id = NodeId::random();

    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let mut received = 0;
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            received += 1;
            if seen_tx.send(buf[..len].to_vec()).is_err() {
                return;
            }
            if received == answer_after {
                let request = KrpcMessage::from_bytes(&buf[..len]).unwrap();
                let reply = KrpcMessage::response(request.tx_id, Response::with_id(id));
                socket.send_to(&reply.to_bytes(), from).await.unwrap();
            }
        }
    });
    (addr, seen_rx)
}

fn drain(seen: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut datagrams = Vec::new();
    while let Ok(datagram) = seen.try_recv() {
        datagrams.push(datagram);
    }
    datagrams
}

#[tokio::test]
async fn ping_admits_only_the_asking_side() {
    let a = start_node().await;
    let b = start_node().await;

    let contact = a.ping(b.local_addr()).await.unwrap();
    assert_eq!(contact.id, b.local_id());
    assert_eq!(contact.addr, b.local_addr());
    // b told us where it saw our ping coming from
    assert_eq!(contact.reported_ip, Some(a.local_addr()));

    // a verified b by the response; b only saw an unverified claim
    assert_eq!(a.node_count().await.unwrap(), 1);
    assert_eq!(b.node_count().await.unwrap(), 0);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn find_node_serves_contacts_the_responder_verified() {
    let a = start_node().await;
    let b = start_node().await;
    let c = start_node().await;

    // b verifies c, so c is the one contact b can vouch for
    b.ping(c.local_addr()).await.unwrap();

    let reply = a.find_node(b.local_addr(), c.local_id()).await.unwrap();
    assert_eq!(reply.responder.id, b.local_id());
    assert_eq!(reply.nodes.len(), 1);
    assert_eq!(reply.nodes[0].id, c.local_id());
    assert_eq!(reply.nodes[0].addr, c.local_addr());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn get_peers_announce_get_peers_round_trip() {
    let a = start_node().await;
    let b = start_node().await;
    let info_hash = InfoHash::new([0x5a; 20]);

    let empty = a.get_peers(b.local_addr(), info_hash).await.unwrap();
    assert!(empty.peers.is_empty());
    let token = empty.token.expect("get_peers always issues a token");

    // explicit port announce
    a.announce_peer(b.local_addr(), info_hash, 7777, token.clone(), false)
        .await
        .unwrap();
    let one = a.get_peers(b.local_addr(), info_hash).await.unwrap();
    assert_eq!(one.peers, vec![SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7777)]);

    // implied port: the stored peer uses our UDP source port, not the field
    a.announce_peer(b.local_addr(), info_hash, 1, token, true)
        .await
        .unwrap();
    let two = a.get_peers(b.local_addr(), info_hash).await.unwrap();
    assert_eq!(two.peers.len(), 2);
    assert!(two.peers.contains(&a.local_addr()));
    assert!(!two
        .peers
        .contains(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1)));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn fabricated_announce_tokens_are_rejected() {
    let a = start_node().await;
    let b = start_node().await;
    let info_hash = InfoHash::new([0x5b; 20]);

    let result = a
        .announce_peer(
            b.local_addr(),
            info_hash,
            7777,
            Bytes::from_static(b"deadbeef"),
            false,
        )
        .await;
    assert!(matches!(result, Err(DhtError::Remote { code: 203, .. })));

    // nothing was recorded
    let check = a.get_peers(b.local_addr(), info_hash).await.unwrap();
    assert!(check.peers.is_empty());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn a_silent_peer_costs_exactly_the_retry_budget() {
    let config = DhtConfig {
        request_timeout: Duration::from_millis(100),
        request_attempts: 3,
        ..test_config()
    };
    let dht = Dht::start(config).await.unwrap();
    let (peer, mut seen) = spawn_silent_peer().await;

    let result = tokio::time::timeout(Duration::from_secs(5), dht.ping(peer))
        .await
        .expect("retry budget never exhausted");
    assert!(matches!(result, Err(DhtError::Timeout)));

    let datagrams = drain(&mut seen);
    assert_eq!(datagrams.len(), 3);
    // retries resend the identical message, transaction id included
    assert_eq!(datagrams[0], datagrams[1]);
    assert_eq!(datagrams[1], datagrams[2]);

    dht.shutdown().await.unwrap();
}

#[tokio::test]
async fn an_answer_to_a_retry_ends_the_retrying() {
    let config = DhtConfig {
        request_timeout: Duration::from_millis(100),
        request_attempts: 3,
        ..test_config()
    };
    let dht = Dht::start(config).await.unwrap();
    let (peer, mut seen) = spawn_late_peer(2).await;

    let contact = tokio::time::timeout(Duration::from_secs(5), dht.ping(peer))
        .await
        .expect("second attempt never answered")
        .unwrap();
    assert_eq!(contact.addr, peer);

    // the answered transaction is spent; give a third send time to not happen
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(drain(&mut seen).len(), 2);

    dht.shutdown().await.unwrap();
}

#[tokio::test]
async fn identical_inflight_queries_are_rejected() {
    let config = DhtConfig {
        request_timeout: Duration::from_millis(100),
        request_attempts: 1,
        ..test_config()
    };
    let dht = Dht::start(config).await.unwrap();
    let (peer, _seen) = spawn_silent_peer().await;

    let first = dht.ping(peer);
    let second = dht.ping(peer);
    let (first, second) = tokio::join!(first, second);

    // the first one is on the wire (and will eventually time out); the
    // duplicate is refused immediately
    assert!(matches!(second, Err(DhtError::DuplicateQuery)));
    assert!(matches!(first, Err(DhtError::Timeout)));

    dht.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_cancels_pending_requests() {
    let dht = start_node().await;
    let (peer, _seen) = spawn_silent_peer().await;

    let pending = {
        let dht = dht.clone();
        tokio::spawn(async move { dht.ping(peer).await })
    };
    // let the request reach the node task before stopping it
    tokio::time::sleep(Duration::from_millis(100)).await;

    dht.shutdown().await.unwrap();
    let result = pending.await.unwrap();
    assert!(matches!(result, Err(DhtError::ShuttingDown)));

    // the stopped instance refuses further calls
    assert!(matches!(
        dht.ping(peer).await,
        Err(DhtError::ChannelClosed)
    ));
}
