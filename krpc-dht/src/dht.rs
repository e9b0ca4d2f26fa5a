//! The DHT node: public handle plus the actor that owns all state.
//!
//! The handle is a cheap clone around an mpsc sender. The actor task owns
//! the routing table, transaction table, lookups, peer store and token
//! secrets outright, so none of them needs a lock; everything reaches it as
//! a socket event, an API command or a timer tick.

use std::net::{SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::DhtConfig;
use crate::contact::Contact;
use crate::error::DhtError;
use crate::info_hash::InfoHash;
use crate::krpc_socket::{KrpcSocket, SocketEvent, SocketHandle};
use crate::lookup::{LookupId, LookupKind, LookupManager, LookupResult, LookupStep};
use crate::message::{
    CompactNodeInfo, DecodeError, ERR_PROTOCOL, KrpcError, KrpcMessage, MessageBody, Query,
    QueryKind, Response, TransactionId,
};
use crate::node_id::NodeId;
use crate::peer_store::PeerStore;
use crate::routing_table::RoutingTable;
use crate::token::TokenManager;
use crate::transaction::{RpcReply, Transaction, TransactionManager, TxOrigin};

/// Timer resolution for retries, lookup deadlines and token rotation.
const TICK_INTERVAL: Duration = Duration::from_millis(100);
/// Overall deadline for one background table refresh.
const MAINTENANCE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(60);
/// Peers handed out in a single get_peers response; the rest stay local.
const MAX_PEERS_PER_REPLY: usize = 100;
/// Remote announce tokens longer than this are junk we refuse to echo.
const MAX_ANNOUNCE_TOKEN_LEN: usize = 128;

const COMMAND_CAPACITY: usize = 64;

/// What a direct find_node RPC returns.
#[derive(Debug, Clone)]
pub struct FindNodeReply {
    pub responder: Contact,
    pub nodes: Vec<CompactNodeInfo>,
}

/// What a direct get_peers RPC returns. `peers` and `nodes` are mutually
/// exclusive on the wire; `token` is whatever the responder issued.
#[derive(Debug, Clone)]
pub struct GetPeersReply {
    pub responder: Contact,
    pub nodes: Vec<CompactNodeInfo>,
    pub peers: Vec<SocketAddrV4>,
    pub token: Option<Bytes>,
}

enum DhtCommand {
    Query {
        query: Query,
        dest: SocketAddrV4,
        resp: oneshot::Sender<Result<RpcReply, DhtError>>,
    },
    Lookup {
        kind: LookupKind,
        seeds: Option<Vec<SocketAddrV4>>,
        timeout: Duration,
        resp: oneshot::Sender<Result<LookupResult, DhtError>>,
    },
    NodeCount {
        resp: oneshot::Sender<usize>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Handle to a running DHT node. Cloning is cheap; every clone talks to the
/// same node task, and the node stops once `shutdown` is called or all
/// handles are dropped.
#[derive(Debug, Clone)]
pub struct Dht {
    command_tx: mpsc::Sender<DhtCommand>,
    local_id: NodeId,
    local_addr: SocketAddrV4,
}

impl Dht {
    /// Binds the UDP socket, resolves the bootstrap list and spawns the
    /// node. Failing to bind is the only fatal error.
    pub async fn start(config: DhtConfig) -> Result<Dht, DhtError> {
        let local_id = config.node_id.unwrap_or_else(NodeId::random);
        let (socket, socket_handle, socket_events) = KrpcSocket::bind(config.bind_addr).await?;
        let local_addr = socket_handle.local_addr();
        let bootstrap = resolve_bootstrap(&config.bootstrap_nodes).await;

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let actor = DhtActor {
            local_id,
            table: RoutingTable::new(local_id, config.bucket_size),
            transactions: TransactionManager::new(config.request_attempts, config.request_timeout),
            lookups: LookupManager::new(local_id),
            peers: PeerStore::new(
                config.max_stored_torrents,
                config.max_peers_per_torrent,
                config.peer_ttl,
            ),
            tokens: TokenManager::new(),
            socket: socket_handle,
            events: socket_events,
            commands: command_rx,
            bootstrap,
            maintenance_interval: config.maintenance_interval,
        };
        tokio::spawn(socket.run());
        tokio::spawn(actor.run());

        info!(%local_id, %local_addr, "dht node started");
        Ok(Dht {
            command_tx,
            local_id,
            local_addr,
        })
    }

    pub async fn ping(&self, addr: SocketAddrV4) -> Result<Contact, DhtError> {
        let reply = self.query(Query::Ping { id: self.local_id }, addr).await?;
        Ok(responder_contact(&reply.response, reply.from))
    }

    pub async fn find_node(
        &self,
        addr: SocketAddrV4,
        target: NodeId,
    ) -> Result<FindNodeReply, DhtError> {
        let query = Query::FindNode {
            id: self.local_id,
            target,
        };
        let reply = self.query(query, addr).await?;
        let responder = responder_contact(&reply.response, reply.from);
        Ok(FindNodeReply {
            responder,
            nodes: reply.response.nodes,
        })
    }

    pub async fn get_peers(
        &self,
        addr: SocketAddrV4,
        info_hash: InfoHash,
    ) -> Result<GetPeersReply, DhtError> {
        let query = Query::GetPeers {
            id: self.local_id,
            info_hash,
        };
        let reply = self.query(query, addr).await?;
        let responder = responder_contact(&reply.response, reply.from);
        Ok(GetPeersReply {
            responder,
            nodes: reply.response.nodes,
            peers: reply.response.values,
            token: reply.response.token,
        })
    }

    /// Announces us as a peer for `info_hash`. The token must come from a
    /// get_peers recently answered by the same node. With `implied_port`
    /// set, the responder stores our UDP source port and ignores `port`.
    pub async fn announce_peer(
        &self,
        addr: SocketAddrV4,
        info_hash: InfoHash,
        port: u16,
        token: Bytes,
        implied_port: bool,
    ) -> Result<Contact, DhtError> {
        if token.is_empty() || token.len() > MAX_ANNOUNCE_TOKEN_LEN {
            return Err(DhtError::InvalidMessage(format!(
                "announce token of {} bytes",
                token.len()
            )));
        }
        if port == 0 {
            return Err(DhtError::InvalidMessage(
                "announce port must be non-zero".into(),
            ));
        }
        let query = Query::AnnouncePeer {
            id: self.local_id,
            info_hash,
            port,
            token,
            implied_port,
        };
        let reply = self.query(query, addr).await?;
        Ok(responder_contact(&reply.response, reply.from))
    }

    /// Pings every configured bootstrap node. Responders come back as
    /// contacts and are admitted to the routing table.
    pub async fn bootstrap_by_ping(&self, timeout: Duration) -> Result<Vec<Contact>, DhtError> {
        let result = self.lookup(LookupKind::Ping, None, timeout).await?;
        Ok(result.contacts)
    }

    /// Iterative find_node towards our own id, warming the routing table.
    /// `seeds` defaults to the configured bootstrap nodes.
    pub async fn bootstrap_by_find_node(
        &self,
        seeds: Option<Vec<SocketAddrV4>>,
        timeout: Duration,
    ) -> Result<Vec<Contact>, DhtError> {
        let kind = LookupKind::FindNode {
            target: self.local_id,
        };
        let result = self.lookup(kind, seeds, timeout).await?;
        Ok(result.contacts)
    }

    /// Iterative get_peers for `info_hash`, stopping at the first node that
    /// hands out actual peers. The result keeps every token seen, for
    /// announcing afterwards.
    pub async fn bootstrap_by_get_peers(
        &self,
        info_hash: InfoHash,
        seeds: Option<Vec<SocketAddrV4>>,
        timeout: Duration,
    ) -> Result<LookupResult, DhtError> {
        self.lookup(LookupKind::GetPeers { info_hash }, seeds, timeout)
            .await
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    /// Number of contacts currently in the routing table.
    pub async fn node_count(&self) -> Result<usize, DhtError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.command_tx
            .send(DhtCommand::NodeCount { resp: resp_tx })
            .await
            .map_err(|_| DhtError::ChannelClosed)?;
        resp_rx.await.map_err(|_| DhtError::ChannelClosed)
    }

    /// Stops the node. Pending requests and running lookups resolve with
    /// `ShuttingDown`; maintenance stops; the socket closes.
    pub async fn shutdown(&self) -> Result<(), DhtError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.command_tx
            .send(DhtCommand::Shutdown { resp: resp_tx })
            .await
            .map_err(|_| DhtError::ChannelClosed)?;
        resp_rx.await.map_err(|_| DhtError::ChannelClosed)
    }

    async fn query(&self, query: Query, dest: SocketAddrV4) -> Result<RpcReply, DhtError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.command_tx
            .send(DhtCommand::Query {
                query,
                dest,
                resp: resp_tx,
            })
            .await
            .map_err(|_| DhtError::ChannelClosed)?;
        resp_rx.await.map_err(|_| DhtError::ChannelClosed)?
    }

    async fn lookup(
        &self,
        kind: LookupKind,
        seeds: Option<Vec<SocketAddrV4>>,
        timeout: Duration,
    ) -> Result<LookupResult, DhtError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.command_tx
            .send(DhtCommand::Lookup {
                kind,
                seeds,
                timeout,
                resp: resp_tx,
            })
            .await
            .map_err(|_| DhtError::ChannelClosed)?;
        resp_rx.await.map_err(|_| DhtError::ChannelClosed)?
    }
}

struct DhtActor {
    local_id: NodeId,
    table: RoutingTable,
    transactions: TransactionManager,
    lookups: LookupManager,
    peers: PeerStore,
    tokens: TokenManager,
    socket: SocketHandle,
    events: mpsc::Receiver<SocketEvent>,
    commands: mpsc::Receiver<DhtCommand>,
    /// Resolved bootstrap addresses, reused by every maintenance round.
    bootstrap: Vec<SocketAddrV4>,
    maintenance_interval: Duration,
}

impl DhtActor {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        // fires once right away, giving the table its first warm-up
        let mut maintenance = tokio::time::interval(self.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle_socket_event(event).await,
                        None => {
                            warn!("socket actor stopped, shutting the node down");
                            self.shutdown().await;
                            return;
                        }
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command).await {
                                return;
                            }
                        }
                        // every handle dropped
                        None => {
                            self.shutdown().await;
                            return;
                        }
                    }
                }
                now = tick.tick() => self.on_tick(now.into_std()).await,
                _ = maintenance.tick() => self.start_maintenance().await,
            }
        }
    }

    /// Returns false once the actor should stop.
    async fn handle_command(&mut self, command: DhtCommand) -> bool {
        match command {
            DhtCommand::Query { query, dest, resp } => {
                self.send_query(query, dest, TxOrigin::Api(resp)).await;
            }
            DhtCommand::Lookup {
                kind,
                seeds,
                timeout,
                resp,
            } => {
                let seeds = seeds.unwrap_or_else(|| self.bootstrap.clone());
                let id = self
                    .lookups
                    .start(kind, seeds, Instant::now() + timeout, Some(resp));
                self.pump_round(id).await;
            }
            DhtCommand::NodeCount { resp } => {
                let _ = resp.send(self.table.node_count());
            }
            DhtCommand::Shutdown { resp } => {
                self.shutdown().await;
                let _ = resp.send(());
                return false;
            }
        }
        true
    }

    async fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::MessageReceived { message, from } => match message.body {
                MessageBody::Query(query) => self.handle_query(message.tx_id, query, from).await,
                MessageBody::Response(response) => {
                    self.handle_response(message.tx_id, response, from).await;
                }
                MessageBody::Error(error) => {
                    self.handle_remote_error(message.tx_id, error, from).await;
                }
            },
            SocketEvent::DecodeError { error, from } => {
                self.handle_decode_error(error, from).await;
            }
            SocketEvent::SendError { message, to, error } => {
                self.handle_send_error(message, to, error).await;
            }
        }
    }

    async fn handle_response(
        &mut self,
        tx_id: TransactionId,
        response: Response,
        from: SocketAddrV4,
    ) {
        let Some(transaction) = self.take_matching_transaction(&tx_id, from).await else {
            return;
        };

        // answering is the one way into the routing table
        let responder = responder_contact(&response, from);
        self.table.insert(responder.clone());

        match transaction.origin {
            TxOrigin::Api(resp) => {
                let _ = resp.send(Ok(RpcReply { response, from }));
            }
            TxOrigin::Lookup(id) => {
                let step = self.lookups.note_response(id, responder, &response);
                self.drive_lookup(id, step).await;
            }
            TxOrigin::Detached => {
                debug!(%from, "liveness ping answered");
            }
        }
    }

    async fn handle_remote_error(
        &mut self,
        tx_id: TransactionId,
        error: KrpcError,
        from: SocketAddrV4,
    ) {
        let Some(transaction) = self.take_matching_transaction(&tx_id, from).await else {
            return;
        };
        debug!(%from, code = error.code, message = %error.message, "remote answered with an error");
        self.fail_transaction(
            transaction,
            DhtError::Remote {
                code: error.code,
                message: error.message,
            },
        )
        .await;
    }

    /// Pops the transaction an inbound answer resolves, enforcing that the
    /// answer came from the address the query went to. A mismatch fails the
    /// transaction rather than being quietly accepted.
    async fn take_matching_transaction(
        &mut self,
        tx_id: &TransactionId,
        from: SocketAddrV4,
    ) -> Option<Transaction> {
        let Some(id) = tx_id.as_u16() else {
            debug!(%from, ?tx_id, "dropping answer with a transaction id that is not ours");
            return None;
        };
        let Some(transaction) = self.transactions.resolve(id) else {
            debug!(%from, tx_id = id, "dropping unsolicited answer");
            return None;
        };
        if transaction.dest == from {
            return Some(transaction);
        }
        warn!(%from, expected = %transaction.dest, "answer from the wrong address");
        let dest = transaction.dest;
        self.fail_transaction(
            transaction,
            DhtError::ProtocolViolation(format!("answer from {from}, query went to {dest}")),
        )
        .await;
        None
    }

    async fn handle_query(&mut self, tx_id: TransactionId, query: Query, from: SocketAddrV4) {
        debug!(%from, query = query.name(), "inbound query");
        if !matches!(query, Query::Ping { .. }) {
            self.verify_sender(query.id(), from).await;
        }

        let mut response = Response::with_id(self.local_id);
        response.requester_ip = Some(from);

        match &query {
            Query::Ping { .. } => {}
            Query::FindNode { target, .. } => {
                response.nodes = self.closest_compact(target);
            }
            Query::GetPeers { info_hash, .. } => {
                let mut peers = self.peers.peers_for(info_hash);
                if peers.is_empty() {
                    response.nodes = self.closest_compact(&NodeId::from(info_hash));
                } else {
                    peers.truncate(MAX_PEERS_PER_REPLY);
                    response.values = peers;
                }
                response.token = Some(self.tokens.mint(from.ip()));
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
                ..
            } => {
                if !self.tokens.verify(from.ip(), token) {
                    warn!(%from, "announce with an invalid token");
                    self.reply(KrpcMessage::error(tx_id, ERR_PROTOCOL, "invalid token"), from)
                        .await;
                    return;
                }
                let peer_port = if *implied_port { from.port() } else { *port };
                self.peers
                    .announce(*info_hash, SocketAddrV4::new(*from.ip(), peer_port));
            }
        }
        self.reply(KrpcMessage::response(tx_id, response), from).await;
    }

    /// An id claimed inside a query is never trusted on its own: unless the
    /// claimed contact is already alive in our table, the sender gets an
    /// independent liveness ping and enters the table only by answering it.
    async fn verify_sender(&mut self, claimed_id: NodeId, from: SocketAddrV4) {
        if claimed_id == self.local_id {
            return;
        }
        if let Some(contact) = self.table.get(&claimed_id)
            && contact.addr == from
            && contact.is_alive()
        {
            return;
        }
        if self.transactions.is_pending(QueryKind::Ping, from) {
            return;
        }
        debug!(%from, %claimed_id, "pinging unverified sender");
        self.send_query(Query::Ping { id: self.local_id }, from, TxOrigin::Detached)
            .await;
    }

    async fn handle_decode_error(&mut self, error: DecodeError, from: SocketAddrV4) {
        match error {
            DecodeError::Malformed(reason) => {
                debug!(%from, %reason, "dropping malformed datagram");
            }
            DecodeError::UnknownQuery { name, .. } => {
                debug!(%from, %name, "ignoring unknown query");
            }
            DecodeError::Invalid { tx_id, reason } => {
                warn!(%from, %reason, "rejecting invalid query");
                self.reply(KrpcMessage::error(tx_id, ERR_PROTOCOL, reason), from)
                    .await;
            }
        }
    }

    async fn handle_send_error(
        &mut self,
        message: KrpcMessage,
        to: SocketAddrV4,
        error: std::io::Error,
    ) {
        warn!(%to, %error, "failed to send datagram");
        if !matches!(message.body, MessageBody::Query(_)) {
            return;
        }
        let Some(tx_id) = message.tx_id.as_u16() else {
            return;
        };
        let Some(transaction) = self.transactions.resolve(tx_id) else {
            return;
        };
        self.fail_transaction(transaction, DhtError::Send(error.to_string()))
            .await;
    }

    /// Ships an answer to an inbound message; a failed send surfaces as a
    /// socket event and is only logged.
    async fn reply(&mut self, message: KrpcMessage, to: SocketAddrV4) {
        let _ = self.socket.send(message, to).await;
    }

    /// Registers and ships a query; a rejected registration is delivered
    /// straight back to the origin.
    async fn send_query(&mut self, query: Query, dest: SocketAddrV4, origin: TxOrigin) {
        match self.transactions.register(query, dest, origin, Instant::now()) {
            Ok(message) => {
                // send failures come back as socket events
                let _ = self.socket.send(message, dest).await;
            }
            Err((TxOrigin::Api(resp), error)) => {
                let _ = resp.send(Err(error));
            }
            Err((TxOrigin::Lookup(id), error)) => {
                debug!(%dest, %error, "lookup skips target");
                let step = self.lookups.note_failure(id);
                self.drive_lookup(id, step).await;
            }
            Err((TxOrigin::Detached, _)) => {}
        }
    }

    /// Sends the next round of a lookup: one query per frontier address.
    async fn pump_round(&mut self, id: LookupId) {
        let Some((query, batch)) = self.lookups.take_round(id) else {
            return;
        };
        for dest in batch {
            let registered = self.transactions.register(
                query.clone(),
                dest,
                TxOrigin::Lookup(id),
                Instant::now(),
            );
            match registered {
                Ok(message) => {
                    self.lookups.note_sent(id);
                    let _ = self.socket.send(message, dest).await;
                }
                Err((_, error)) => {
                    debug!(%dest, %error, "lookup skips target");
                }
            }
        }
        // with nothing airborne the lookup is already over
        if self.lookups.round_status(id) == LookupStep::Finished {
            self.complete_lookup(id);
        }
    }

    async fn drive_lookup(&mut self, id: LookupId, step: LookupStep) {
        match step {
            LookupStep::Pending => {}
            LookupStep::NextRound => self.pump_round(id).await,
            LookupStep::Finished => self.complete_lookup(id),
        }
    }

    fn complete_lookup(&mut self, id: LookupId) {
        let Some(finished) = self.lookups.finish(id) else {
            return;
        };
        match finished.done {
            Some(resp) => {
                let _ = resp.send(Ok(finished.result));
            }
            None => {
                debug!(
                    contacts = finished.result.contacts.len(),
                    "maintenance round finished"
                );
            }
        }
    }

    async fn fail_transaction(&mut self, transaction: Transaction, error: DhtError) {
        if matches!(error, DhtError::Timeout | DhtError::Send(_)) {
            self.table.mark_bad_by_addr(transaction.dest);
        }
        match transaction.origin {
            TxOrigin::Api(resp) => {
                let _ = resp.send(Err(error));
            }
            TxOrigin::Lookup(id) => {
                let step = self.lookups.note_failure(id);
                self.drive_lookup(id, step).await;
            }
            TxOrigin::Detached => {
                debug!(dest = %transaction.dest, %error, "background query failed");
            }
        }
    }

    async fn on_tick(&mut self, now: Instant) {
        self.tokens.rotate_if_due();

        let sweep = self.transactions.sweep(now);
        for tx_id in sweep.retry {
            if let Some((message, dest)) = self.transactions.mark_resent(tx_id, now) {
                debug!(%dest, tx_id, "retrying request");
                let _ = self.socket.send(message, dest).await;
            }
        }
        for transaction in sweep.expired {
            debug!(
                dest = %transaction.dest,
                attempts = transaction.attempts,
                "request timed out"
            );
            self.fail_transaction(transaction, DhtError::Timeout).await;
        }

        for id in self.lookups.expired(now) {
            debug!(?id, "lookup hit its deadline");
            self.complete_lookup(id);
        }
    }

    /// Refreshes the table with a find_node convergence towards our own id,
    /// seeded by the bootstrap list plus everything currently in the table.
    async fn start_maintenance(&mut self) {
        if self.lookups.maintenance_running() {
            debug!("previous maintenance round still running, skipping");
            return;
        }
        let mut seeds = self.bootstrap.clone();
        seeds.extend(self.table.contacts().map(|contact| contact.addr));
        debug!(seeds = seeds.len(), "refreshing the routing table");
        let id = self.lookups.start(
            LookupKind::FindNode {
                target: self.local_id,
            },
            seeds,
            Instant::now() + MAINTENANCE_LOOKUP_TIMEOUT,
            None,
        );
        self.pump_round(id).await;
    }

    async fn shutdown(&mut self) {
        info!("dht node shutting down");
        for transaction in self.transactions.drain() {
            if let TxOrigin::Api(resp) = transaction.origin {
                let _ = resp.send(Err(DhtError::ShuttingDown));
            }
        }
        for finished in self.lookups.drain() {
            if let Some(resp) = finished.done {
                let _ = resp.send(Err(DhtError::ShuttingDown));
            }
        }
        self.socket.shutdown().await;
    }

    fn closest_compact(&self, target: &NodeId) -> Vec<CompactNodeInfo> {
        self.table
            .closest_nodes(target, self.table.bucket_size())
            .into_iter()
            .map(|contact| CompactNodeInfo {
                id: contact.id,
                addr: contact.addr,
            })
            .collect()
    }
}

/// The contact a response proves: alive at the source address, carrying
/// the external address it reported for us, if any.
fn responder_contact(response: &Response, from: SocketAddrV4) -> Contact {
    let mut contact = Contact::alive(response.id, from);
    contact.reported_ip = response.requester_ip;
    contact
}

/// Resolves the configured bootstrap hosts. Unresolvable entries are
/// skipped, as are IPv6 addresses.
async fn resolve_bootstrap(hosts: &[String]) -> Vec<SocketAddrV4> {
    let mut seeds = Vec::new();
    for host in hosts {
        match tokio::net::lookup_host(host.as_str()).await {
            Ok(addrs) => {
                seeds.extend(addrs.filter_map(|addr| match addr {
                    SocketAddr::V4(addr) => Some(addr),
                    SocketAddr::V6(_) => None,
                }));
            }
            Err(error) => {
                warn!(%host, %error, "failed to resolve bootstrap node, skipping");
            }
        }
    }
    seeds
}
