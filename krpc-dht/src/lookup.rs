//! Iterative lookup state machines.
//!
//! A lookup runs in single-hop rounds. Each round queries every address in
//! the frontier; responses add their contacts to the result set and any
//! address we have not seen before to the next frontier. When a round
//! drains, the lookup either stops (result set did not grow, frontier is
//! empty) or launches the next round. A get_peers lookup additionally stops
//! at the first response carrying actual peers.
//!
//! Pings fit the same shape: their responses carry no nodes, so the
//! frontier never refills and the lookup ends after one round.
//!
//! The state machines are pure; the node task owns the clock and the
//! socket, and drives them through `take_round` / `note_*`.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::contact::Contact;
use crate::error::DhtError;
use crate::info_hash::InfoHash;
use crate::message::{Query, Response};
use crate::node_id::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LookupId(u64);

#[derive(Debug, Clone, Copy)]
pub enum LookupKind {
    Ping,
    FindNode { target: NodeId },
    GetPeers { info_hash: InfoHash },
}

/// What a finished lookup hands back. Contact order is unspecified.
#[derive(Debug, Default)]
pub struct LookupResult {
    pub contacts: Vec<Contact>,
    pub peers: Vec<SocketAddrV4>,
    /// Responders paired with the announce token they issued.
    pub tokens: Vec<(Contact, Bytes)>,
}

/// Where the lookup stands after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStep {
    /// Requests still in flight; nothing to do.
    Pending,
    /// Round drained and the frontier has fresh addresses.
    NextRound,
    /// Done; collect it with `finish`.
    Finished,
}

pub struct FinishedLookup {
    pub result: LookupResult,
    /// `None` for background maintenance, which nobody is waiting on.
    pub done: Option<oneshot::Sender<Result<LookupResult, DhtError>>>,
}

struct Lookup {
    kind: LookupKind,
    deadline: Instant,
    /// Addresses to query next round.
    frontier: Vec<SocketAddrV4>,
    /// Every address ever enqueued; nothing is queried twice.
    seen_addrs: HashSet<SocketAddrV4>,
    found: HashMap<NodeId, Contact>,
    peers: HashSet<SocketAddrV4>,
    tokens: Vec<(Contact, Bytes)>,
    in_flight: usize,
    /// Did the result set grow during the current round.
    grew: bool,
    done: Option<oneshot::Sender<Result<LookupResult, DhtError>>>,
}

impl Lookup {
    fn query(&self, local_id: NodeId) -> Query {
        match self.kind {
            LookupKind::Ping => Query::Ping { id: local_id },
            LookupKind::FindNode { target } => Query::FindNode {
                id: local_id,
                target,
            },
            LookupKind::GetPeers { info_hash } => Query::GetPeers {
                id: local_id,
                info_hash,
            },
        }
    }

    fn record_contact(&mut self, contact: Contact) {
        match self.found.entry(contact.id) {
            Entry::Vacant(slot) => {
                slot.insert(contact);
                self.grew = true;
            }
            Entry::Occupied(mut slot) => {
                // a live record beats a hearsay one, but it is not growth
                if contact.is_alive() {
                    slot.insert(contact);
                }
            }
        }
    }

    fn step(&self) -> LookupStep {
        if self.in_flight > 0 {
            return LookupStep::Pending;
        }
        if self.frontier.is_empty() || !self.grew {
            LookupStep::Finished
        } else {
            LookupStep::NextRound
        }
    }

    fn into_finished(self) -> FinishedLookup {
        let result = LookupResult {
            contacts: self.found.into_values().collect(),
            peers: self.peers.into_iter().collect(),
            tokens: self.tokens,
        };
        FinishedLookup {
            result,
            done: self.done,
        }
    }
}

pub struct LookupManager {
    local_id: NodeId,
    next_id: u64,
    lookups: HashMap<LookupId, Lookup>,
}

impl LookupManager {
    pub fn new(local_id: NodeId) -> Self {
        LookupManager {
            local_id,
            next_id: 0,
            lookups: HashMap::new(),
        }
    }

    pub fn start(
        &mut self,
        kind: LookupKind,
        seeds: Vec<SocketAddrV4>,
        deadline: Instant,
        done: Option<oneshot::Sender<Result<LookupResult, DhtError>>>,
    ) -> LookupId {
        let id = LookupId(self.next_id);
        self.next_id += 1;

        let mut lookup = Lookup {
            kind,
            deadline,
            frontier: Vec::new(),
            seen_addrs: HashSet::new(),
            found: HashMap::new(),
            peers: HashSet::new(),
            tokens: Vec::new(),
            in_flight: 0,
            grew: false,
            done,
        };
        for addr in seeds {
            if lookup.seen_addrs.insert(addr) {
                lookup.frontier.push(addr);
            }
        }
        self.lookups.insert(id, lookup);
        id
    }

    /// Drains the frontier for the next round and resets growth tracking.
    /// The caller reports each request it actually gets onto the wire with
    /// `note_sent`.
    pub fn take_round(&mut self, id: LookupId) -> Option<(Query, Vec<SocketAddrV4>)> {
        let lookup = self.lookups.get_mut(&id)?;
        lookup.grew = false;
        let batch = std::mem::take(&mut lookup.frontier);
        Some((lookup.query(self.local_id), batch))
    }

    pub fn note_sent(&mut self, id: LookupId) {
        if let Some(lookup) = self.lookups.get_mut(&id) {
            lookup.in_flight += 1;
        }
    }

    /// Feeds a response into the lookup. `responder` is the contact built
    /// from the response's id and source address.
    pub fn note_response(
        &mut self,
        id: LookupId,
        responder: Contact,
        response: &Response,
    ) -> LookupStep {
        let Some(lookup) = self.lookups.get_mut(&id) else {
            // lookup already completed, e.g. after an early exit
            return LookupStep::Pending;
        };
        lookup.in_flight = lookup.in_flight.saturating_sub(1);

        if let Some(token) = &response.token {
            lookup.tokens.push((responder.clone(), token.clone()));
        }
        lookup.record_contact(responder);
        for node in &response.nodes {
            lookup.record_contact(Contact::new(node.id, node.addr));
            if lookup.seen_addrs.insert(node.addr) {
                lookup.frontier.push(node.addr);
            }
        }

        if matches!(lookup.kind, LookupKind::GetPeers { .. }) && !response.values.is_empty() {
            lookup.peers.extend(response.values.iter().copied());
            return LookupStep::Finished;
        }
        lookup.step()
    }

    /// A request that timed out, errored or never got sent.
    pub fn note_failure(&mut self, id: LookupId) -> LookupStep {
        let Some(lookup) = self.lookups.get_mut(&id) else {
            return LookupStep::Pending;
        };
        lookup.in_flight = lookup.in_flight.saturating_sub(1);
        lookup.step()
    }

    /// Standing of the round, for after a round was pumped without any
    /// request making it out.
    pub fn round_status(&self, id: LookupId) -> LookupStep {
        self.lookups.get(&id).map_or(LookupStep::Pending, Lookup::step)
    }

    pub fn finish(&mut self, id: LookupId) -> Option<FinishedLookup> {
        Some(self.lookups.remove(&id)?.into_finished())
    }

    /// Lookups past their deadline; they complete with whatever they have.
    pub fn expired(&self, now: Instant) -> Vec<LookupId> {
        self.lookups
            .iter()
            .filter(|(_, lookup)| now >= lookup.deadline)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn maintenance_running(&self) -> bool {
        self.lookups.values().any(|lookup| lookup.done.is_none())
    }

    pub fn drain(&mut self) -> Vec<FinishedLookup> {
        self.lookups
            .drain()
            .map(|(_, lookup)| lookup.into_finished())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CompactNodeInfo;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn node_id(byte: u8) -> NodeId {
        NodeId::new([byte; 20])
    }

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 3), port)
    }

    fn manager() -> LookupManager {
        LookupManager::new(node_id(0xEE))
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    fn response_with_nodes(nodes: &[(u8, u16)]) -> Response {
        let mut response = Response::with_id(node_id(0));
        response.nodes = nodes
            .iter()
            .map(|(byte, port)| CompactNodeInfo {
                id: node_id(*byte),
                addr: addr(*port),
            })
            .collect();
        response
    }

    #[test]
    fn ping_round_ends_when_the_last_seed_answers() {
        let mut lookups = manager();
        let id = lookups.start(
            LookupKind::Ping,
            vec![addr(1), addr(2)],
            deadline(),
            None,
        );

        let (query, batch) = lookups.take_round(id).unwrap();
        assert!(matches!(query, Query::Ping { .. }));
        assert_eq!(batch, vec![addr(1), addr(2)]);
        lookups.note_sent(id);
        lookups.note_sent(id);

        let step = lookups.note_response(
            id,
            Contact::alive(node_id(1), addr(1)),
            &Response::with_id(node_id(1)),
        );
        assert_eq!(step, LookupStep::Pending);

        let step = lookups.note_response(
            id,
            Contact::alive(node_id(2), addr(2)),
            &Response::with_id(node_id(2)),
        );
        assert_eq!(step, LookupStep::Finished);

        let finished = lookups.finish(id).unwrap();
        assert_eq!(finished.result.contacts.len(), 2);
        assert!(finished.result.peers.is_empty());
    }

    #[test]
    fn frontier_expands_through_fresh_addresses_only() {
        let mut lookups = manager();
        let id = lookups.start(
            LookupKind::FindNode { target: node_id(0) },
            vec![addr(1)],
            deadline(),
            None,
        );

        let (_, batch) = lookups.take_round(id).unwrap();
        assert_eq!(batch, vec![addr(1)]);
        lookups.note_sent(id);

        // node 1 hands us node 2 and our own seed again
        let step = lookups.note_response(
            id,
            Contact::alive(node_id(1), addr(1)),
            &response_with_nodes(&[(2, 2), (1, 1)]),
        );
        assert_eq!(step, LookupStep::NextRound);

        let (query, batch) = lookups.take_round(id).unwrap();
        assert!(matches!(query, Query::FindNode { .. }));
        assert_eq!(batch, vec![addr(2)]);
        lookups.note_sent(id);

        // node 2 only knows nodes we already found: no growth, stop
        let step = lookups.note_response(
            id,
            Contact::alive(node_id(2), addr(2)),
            &response_with_nodes(&[(1, 1)]),
        );
        assert_eq!(step, LookupStep::Finished);

        let mut ids: Vec<u8> = lookups
            .finish(id)
            .unwrap()
            .result
            .contacts
            .iter()
            .map(|contact| contact.id.as_bytes()[0])
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn known_ids_at_new_addresses_are_not_growth() {
        let mut lookups = manager();
        let id = lookups.start(
            LookupKind::FindNode { target: node_id(0) },
            vec![addr(1)],
            deadline(),
            None,
        );
        lookups.take_round(id).unwrap();
        lookups.note_sent(id);
        let step = lookups.note_response(
            id,
            Contact::alive(node_id(1), addr(1)),
            &response_with_nodes(&[(2, 2)]),
        );
        assert_eq!(step, LookupStep::NextRound);

        lookups.take_round(id).unwrap();
        lookups.note_sent(id);
        // node 2 reports node 1 again, just at a new address: the frontier
        // refills but the result set is unchanged
        let step = lookups.note_response(
            id,
            Contact::alive(node_id(2), addr(2)),
            &response_with_nodes(&[(1, 99)]),
        );
        assert_eq!(step, LookupStep::Finished);
    }

    #[test]
    fn get_peers_stops_at_the_first_values_response() {
        let mut lookups = manager();
        let id = lookups.start(
            LookupKind::GetPeers {
                info_hash: InfoHash::new([9; 20]),
            },
            vec![addr(1), addr(2)],
            deadline(),
            None,
        );
        let (query, _) = lookups.take_round(id).unwrap();
        assert!(matches!(query, Query::GetPeers { .. }));
        lookups.note_sent(id);
        lookups.note_sent(id);

        let mut response = Response::with_id(node_id(1));
        response.values = vec![addr(7000), addr(7001)];
        response.token = Some(Bytes::from_static(b"tok"));

        // one request still in flight, but peers end the lookup
        let step = lookups.note_response(id, Contact::alive(node_id(1), addr(1)), &response);
        assert_eq!(step, LookupStep::Finished);

        let finished = lookups.finish(id).unwrap();
        let mut peers = finished.result.peers.clone();
        peers.sort();
        assert_eq!(peers, vec![addr(7000), addr(7001)]);
        assert_eq!(finished.result.tokens.len(), 1);
        assert_eq!(finished.result.tokens[0].0.id, node_id(1));
        assert_eq!(finished.result.tokens[0].1, Bytes::from_static(b"tok"));

        // the straggler routes to a finished lookup and is dropped
        let step = lookups.note_response(
            id,
            Contact::alive(node_id(2), addr(2)),
            &Response::with_id(node_id(2)),
        );
        assert_eq!(step, LookupStep::Pending);
    }

    #[test]
    fn failures_drain_the_round_too() {
        let mut lookups = manager();
        let id = lookups.start(
            LookupKind::FindNode { target: node_id(0) },
            vec![addr(1), addr(2)],
            deadline(),
            None,
        );
        lookups.take_round(id).unwrap();
        lookups.note_sent(id);
        lookups.note_sent(id);

        assert_eq!(lookups.note_failure(id), LookupStep::Pending);
        let step = lookups.note_response(
            id,
            Contact::alive(node_id(1), addr(1)),
            &Response::with_id(node_id(1)),
        );
        assert_eq!(step, LookupStep::Finished);
        assert_eq!(lookups.finish(id).unwrap().result.contacts.len(), 1);
    }

    #[test]
    fn a_round_that_never_leaves_the_ground_finishes_empty() {
        let mut lookups = manager();
        let id = lookups.start(LookupKind::Ping, Vec::new(), deadline(), None);
        let (_, batch) = lookups.take_round(id).unwrap();
        assert!(batch.is_empty());
        assert_eq!(lookups.round_status(id), LookupStep::Finished);
        assert!(lookups.finish(id).unwrap().result.contacts.is_empty());
    }

    #[test]
    fn deadlines_single_out_overdue_lookups() {
        let mut lookups = manager();
        let now = Instant::now();
        let overdue = lookups.start(LookupKind::Ping, vec![addr(1)], now, None);
        let fresh = lookups.start(
            LookupKind::Ping,
            vec![addr(2)],
            now + Duration::from_secs(60),
            None,
        );

        let expired = lookups.expired(now);
        assert_eq!(expired, vec![overdue]);
        assert!(lookups.finish(overdue).is_some());
        assert!(lookups.expired(now).is_empty());
        assert!(lookups.finish(fresh).is_some());
    }

    #[test]
    fn maintenance_is_a_lookup_nobody_waits_on() {
        let mut lookups = manager();
        assert!(!lookups.maintenance_running());
        let id = lookups.start(LookupKind::Ping, vec![addr(1)], deadline(), None);
        assert!(lookups.maintenance_running());

        let (done_tx, _done_rx) = oneshot::channel();
        let waited =
            lookups.start(LookupKind::Ping, vec![addr(2)], deadline(), Some(done_tx));
        lookups.finish(id).unwrap();
        assert!(!lookups.maintenance_running());

        let finished = lookups.finish(waited).unwrap();
        assert!(finished.done.is_some());
    }
}
