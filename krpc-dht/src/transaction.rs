//! Outbound request tracking.
//!
//! Every query we send gets a two-byte transaction id and a slot here until
//! a datagram with that id comes back or the retry budget runs out. Retries
//! resend the original message verbatim and double the wait each time; the
//! budget counts datagrams put on the wire, so a budget of 3 means at most
//! three sends of the same request.

use crate::error::DhtError;
use crate::lookup::LookupId;
use crate::message::{KrpcMessage, Query, QueryKind, Response, TransactionId};
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// A response paired with the address it arrived from.
#[derive(Debug)]
pub struct RpcReply {
    pub response: Response,
    pub from: SocketAddrV4,
}

/// Where a transaction's outcome is delivered.
#[derive(Debug)]
pub enum TxOrigin {
    /// A caller on the public API is blocked on this slot.
    Api(oneshot::Sender<Result<RpcReply, DhtError>>),
    /// Feeds an iterative lookup.
    Lookup(LookupId),
    /// Fire-and-forget, e.g. liveness pings before table admission.
    Detached,
}

#[derive(Debug)]
pub struct Transaction {
    pub dest: SocketAddrV4,
    pub kind: QueryKind,
    /// Retries put this exact message back on the wire, id included.
    pub message: KrpcMessage,
    pub origin: TxOrigin,
    /// Datagrams sent so far.
    pub attempts: u32,
    deadline: Instant,
    timeout: Duration,
}

/// Result of a timer sweep: ids to resend, and transactions whose budget is
/// spent (already removed from the table).
#[derive(Debug, Default)]
pub struct Sweep {
    pub retry: Vec<u16>,
    pub expired: Vec<Transaction>,
}

#[derive(Debug)]
pub struct TransactionManager {
    next_id: u16,
    max_attempts: u32,
    base_timeout: Duration,
    pending: HashMap<u16, Transaction>,
    in_flight: HashMap<(QueryKind, SocketAddrV4), u16>,
}

impl TransactionManager {
    pub fn new(max_attempts: u32, base_timeout: Duration) -> Self {
        TransactionManager {
            next_id: rand::random(),
            max_attempts: max_attempts.max(1),
            base_timeout,
            pending: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }

    pub fn is_pending(&self, kind: QueryKind, dest: SocketAddrV4) -> bool {
        self.in_flight.contains_key(&(kind, dest))
    }

    /// Allocates an id, records the transaction and hands back the message
    /// to put on the wire. The first send counts against the budget. A
    /// rejected registration returns the origin so the caller can still
    /// deliver the error.
    pub fn register(
        &mut self,
        query: Query,
        dest: SocketAddrV4,
        origin: TxOrigin,
        now: Instant,
    ) -> Result<KrpcMessage, (TxOrigin, DhtError)> {
        let kind = query.kind();
        if self.is_pending(kind, dest) {
            return Err((origin, DhtError::DuplicateQuery));
        }
        let tx_id = self.allocate_id();
        let message = KrpcMessage::query(TransactionId::from_u16(tx_id), query);
        self.in_flight.insert((kind, dest), tx_id);
        self.pending.insert(
            tx_id,
            Transaction {
                dest,
                kind,
                message: message.clone(),
                origin,
                attempts: 1,
                deadline: now + self.base_timeout,
                timeout: self.base_timeout,
            },
        );
        Ok(message)
    }

    fn allocate_id(&mut self) -> u16 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Removes the transaction and releases its dedup slot.
    pub fn resolve(&mut self, tx_id: u16) -> Option<Transaction> {
        let transaction = self.pending.remove(&tx_id)?;
        self.in_flight.remove(&(transaction.kind, transaction.dest));
        Some(transaction)
    }

    /// Finds transactions past their deadline. Ones with budget left are
    /// listed for resending; spent ones are removed and returned.
    pub fn sweep(&mut self, now: Instant) -> Sweep {
        let mut retry = Vec::new();
        let mut spent = Vec::new();
        for (id, transaction) in &self.pending {
            if now < transaction.deadline {
                continue;
            }
            if transaction.attempts < self.max_attempts {
                retry.push(*id);
            } else {
                spent.push(*id);
            }
        }
        let expired = spent.iter().filter_map(|id| self.resolve(*id)).collect();
        Sweep { retry, expired }
    }

    /// Doubles the timeout, restarts the clock and hands back the message
    /// and destination for its next trip.
    pub fn mark_resent(&mut self, tx_id: u16, now: Instant) -> Option<(KrpcMessage, SocketAddrV4)> {
        let transaction = self.pending.get_mut(&tx_id)?;
        transaction.attempts += 1;
        transaction.timeout *= 2;
        transaction.deadline = now + transaction.timeout;
        Some((transaction.message.clone(), transaction.dest))
    }

    /// Empties the table, e.g. so shutdown can fail every pending caller.
    pub fn drain(&mut self) -> Vec<Transaction> {
        self.in_flight.clear();
        self.pending.drain().map(|(_, transaction)| transaction).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
