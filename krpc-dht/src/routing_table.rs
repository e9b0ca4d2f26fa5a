use crate::contact::{Contact, ContactStatus};
use crate::node_id::NodeId;
use std::net::SocketAddrV4;

/// Bucket capacity (K in Kademlia terms).
pub const DEFAULT_BUCKET_SIZE: usize = 8;

/// One bucket per possible shared-prefix length.
pub const NUM_BUCKETS: usize = 160;

/// Contacts ordered least-recently-seen first; refreshes move a contact to
/// the tail, so the head is always the eviction candidate.
#[derive(Debug, Default)]
struct Bucket {
    contacts: Vec<Contact>,
}

/// Kademlia routing table: 160 buckets indexed by the number of leading bits
/// a contact's id shares with ours. Bucket 0 holds the most distant half of
/// the id space, bucket 159 the nearest neighbors.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    bucket_size: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, bucket_size: usize) -> Self {
        let mut buckets = Vec::with_capacity(NUM_BUCKETS);
        buckets.resize_with(NUM_BUCKETS, Bucket::default);
        RoutingTable {
            local_id,
            bucket_size,
            buckets,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// `None` for the local id, which is never stored.
    fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        if *id == self.local_id {
            return None;
        }
        Some(self.local_id.shared_prefix_len(id))
    }

    /// Inserts or refreshes a contact. Returns whether the contact is in the
    /// table afterwards.
    ///
    /// A full bucket only accepts the newcomer by evicting a head that is no
    /// longer alive; an alive head wins and the newcomer is dropped.
    pub fn insert(&mut self, contact: Contact) -> bool {
        let Some(idx) = self.bucket_index(&contact.id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.contacts.iter().position(|c| c.id == contact.id) {
            let mut existing = bucket.contacts.remove(pos);
            existing.addr = contact.addr;
            existing.last_seen = contact.last_seen;
            existing.status = contact.status;
            if contact.reported_ip.is_some() {
                existing.reported_ip = contact.reported_ip;
            }
            bucket.contacts.push(existing);
            return true;
        }

        if bucket.contacts.len() < self.bucket_size {
            bucket.contacts.push(contact);
            return true;
        }

        if !bucket.contacts[0].is_alive() {
            bucket.contacts.remove(0);
            bucket.contacts.push(contact);
            return true;
        }

        false
    }

    pub fn get(&self, id: &NodeId) -> Option<&Contact> {
        let idx = self.bucket_index(id)?;
        self.buckets[idx].contacts.iter().find(|c| c.id == *id)
    }

    /// Marks a contact bad in place (it stays as an eviction candidate).
    pub fn mark_bad(&mut self, id: &NodeId) {
        if let Some(idx) = self.bucket_index(id)
            && let Some(contact) = self.buckets[idx]
                .contacts
                .iter_mut()
                .find(|c| c.id == *id)
        {
            contact.mark_bad();
        }
    }

    /// Marks whatever contact lives at `addr` bad, e.g. after a timeout,
    /// where only the address is known.
    pub fn mark_bad_by_addr(&mut self, addr: SocketAddrV4) {
        for bucket in &mut self.buckets {
            for contact in &mut bucket.contacts {
                if contact.addr == addr {
                    contact.mark_bad();
                }
            }
        }
    }

    /// Up to `count` contacts nearest to `target` across all buckets,
    /// nearest first. Bad contacts are skipped.
    pub fn closest_nodes(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut candidates: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts.iter())
            .filter(|c| c.status != ContactStatus::Bad)
            .cloned()
            .collect();
        candidates.sort_by_key(|c| c.id.distance(target));
        candidates.truncate(count);
        candidates
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.iter().flat_map(|b| b.contacts.iter())
    }
}
