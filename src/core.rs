//! Core Kademlia data structures: identifiers, contacts and the routing table.
//!
//! This module contains the transport-agnostic building blocks every other
//! module leans on:
//!
//! - **Identity**: [`NodeId`], a 160-bit identifier shared by nodes and keys
//! - **Distance Metrics**: [`NodeId::distance`] and [`distance_cmp`] for XOR ordering
//! - **Routing**: [`RoutingTable`], [`KBucket`] and [`Contact`] for peer management

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::time::{Duration, Instant};

use crate::error::DhtError;

// ============================================================================
// Identifiers
// ============================================================================

/// Length of an identifier in bytes.
pub const ID_LEN: usize = 20;

/// Length of an identifier in bits.
pub const ID_BITS: usize = ID_LEN * 8;

/// A 160-bit identifier for DHT nodes and stored keys.
///
/// The bytes are big-endian, so the derived ordering is the numeric ordering
/// of the underlying 160-bit value. XOR distances are themselves `NodeId`s,
/// which lets distance comparisons reuse the same ordering.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    /// The all-zero identifier (distance from any id to itself).
    pub const ZERO: NodeId = NodeId([0u8; ID_LEN]);

    /// The largest identifier, `2^160 - 1`.
    pub const MAX: NodeId = NodeId([0xff; ID_LEN]);

    /// Build an identifier from a byte slice of exactly [`ID_LEN`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != ID_LEN {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    /// Generate a uniformly random identifier.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Derive an identifier by hashing arbitrary bytes with SHA-1.
    ///
    /// ```
    /// use kademlia_dht::NodeId;
    ///
    /// let key = NodeId::digest(b"hello");
    /// assert_eq!(key, NodeId::digest(b"hello"));
    /// assert_eq!(key.to_hex(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
    /// ```
    pub fn digest(data: &[u8]) -> Self {
        let hash = Sha1::digest(data);
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(&hash);
        Self(out)
    }

    /// Parse a 40-character hexadecimal identifier.
    pub fn from_hex(s: &str) -> Result<Self, DhtError> {
        let bytes = hex::decode(s).map_err(|_| DhtError::InvalidNodeId)?;
        Self::from_bytes(&bytes)
    }

    /// Lowercase hexadecimal encoding, also used to name blob files.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Compute the XOR distance between two identifiers.
    ///
    /// # Properties
    /// - `a.distance(&a) == NodeId::ZERO`
    /// - `a.distance(&b) == b.distance(&a)`
    /// - `a.distance(&b) == NodeId::ZERO` only when `a == b`
    pub fn distance(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        NodeId(out)
    }

    /// Number of leading zero bits (160 for [`NodeId::ZERO`]).
    pub fn leading_zeros(&self) -> usize {
        for (idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    /// `self + 1`, or `None` when `self` is [`NodeId::MAX`].
    pub(crate) fn checked_successor(&self) -> Option<NodeId> {
        let mut out = self.0;
        for byte in out.iter_mut().rev() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                return Some(NodeId(out));
            }
        }
        None
    }

    /// `floor((low + high) / 2)` computed with a 161-bit intermediate sum.
    pub(crate) fn midpoint(low: &NodeId, high: &NodeId) -> NodeId {
        let mut sum = [0u8; ID_LEN];
        let mut carry = 0u16;
        for i in (0..ID_LEN).rev() {
            let s = low.0[i] as u16 + high.0[i] as u16 + carry;
            sum[i] = s as u8;
            carry = s >> 8;
        }

        let mut out = [0u8; ID_LEN];
        let mut incoming = carry as u8;
        for i in 0..ID_LEN {
            out[i] = (sum[i] >> 1) | (incoming << 7);
            incoming = sum[i] & 1;
        }
        NodeId(out)
    }

    /// Draw an identifier uniformly from the inclusive range `[low, high]`.
    ///
    /// Bits shared by `low` and `high` are fixed and the remaining bits are
    /// sampled; out-of-range draws are rejected. Bucket ranges are always
    /// aligned halves of the id space, so the first draw is accepted for them.
    pub(crate) fn random_in_range<R: Rng + ?Sized>(
        low: &NodeId,
        high: &NodeId,
        rng: &mut R,
    ) -> NodeId {
        let fixed_bits = low.distance(high).leading_zeros();
        loop {
            let mut noise = [0u8; ID_LEN];
            rng.fill(&mut noise[..]);

            let mut candidate = [0u8; ID_LEN];
            for i in 0..ID_LEN {
                let fixed_here = fixed_bits.saturating_sub(i * 8).min(8);
                let mask: u8 = match fixed_here {
                    0 => 0x00,
                    8 => 0xff,
                    n => !(0xffu8 >> n),
                };
                candidate[i] = (low.0[i] & mask) | (noise[i] & !mask);
            }

            let candidate = NodeId(candidate);
            if *low <= candidate && candidate <= *high {
                return candidate;
            }
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Compare `a` and `b` by their XOR distance to `relative_to`.
///
/// Returns `Ordering::Less` when `a` is closer. Ties only happen when
/// `a == b`, so this is a total order over distinct identifiers.
pub fn distance_cmp(a: &NodeId, b: &NodeId, relative_to: &NodeId) -> Ordering {
    a.distance(relative_to).cmp(&b.distance(relative_to))
}

// ============================================================================
// Contacts
// ============================================================================

/// A remote peer as known to the routing table.
///
/// Two contacts describe the same peer when their ids match; the address is
/// refreshed whenever the peer is seen again.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    /// XOR distance from this contact to `target`.
    pub fn distance_to(&self, target: &NodeId) -> NodeId {
        self.id.distance(target)
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", &self.id.to_hex()[..8], self.addr)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// K-Buckets
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of attempting to add or refresh a contact in a bucket.
#[derive(Debug)]
enum BucketTouchOutcome {
    /// Contact was newly inserted (bucket had space).
    Inserted,
    /// Existing contact was refreshed (moved to the most-recently-seen end).
    Refreshed,
    /// Bucket is full; the contact is handed back to the caller.
    Full(Contact),
}

/// A capacity-bounded list of contacts covering a contiguous slice of the
/// distance space measured from the table owner's id.
#[derive(Clone, Debug)]
pub struct KBucket {
    low: NodeId,
    high: NodeId,
    /// Contacts in recency order (oldest first, most recently seen last).
    contacts: Vec<Contact>,
    /// Overflow contacts seen while the bucket was full (most recent last).
    replacements: VecDeque<Contact>,
    last_updated: Instant,
    k: usize,
}

impl KBucket {
    fn new(low: NodeId, high: NodeId, k: usize) -> Self {
        Self {
            low,
            high,
            contacts: Vec::with_capacity(k),
            replacements: VecDeque::new(),
            last_updated: Instant::now(),
            k,
        }
    }

    /// Inclusive `(low, high)` bounds of the distance range covered.
    pub fn range(&self) -> (NodeId, NodeId) {
        (self.low, self.high)
    }

    pub fn covers(&self, distance: &NodeId) -> bool {
        self.low <= *distance && *distance <= self.high
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn replacements(&self) -> impl Iterator<Item = &Contact> {
        self.replacements.iter()
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.k
    }

    /// Least-recently seen contact.
    pub fn head(&self) -> Option<&Contact> {
        self.contacts.first()
    }

    /// Number of leading bits shared by every distance in the range.
    pub fn depth(&self) -> usize {
        self.low.distance(&self.high).leading_zeros()
    }

    fn touch_last_updated(&mut self) {
        self.last_updated = Instant::now();
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| &c.id == id)
    }

    /// Add or refresh a contact.
    ///
    /// - If the contact exists, its address is refreshed and it moves to the end
    /// - If the bucket has space, the contact is appended
    /// - If the bucket is full, the contact is returned untouched
    fn touch(&mut self, contact: Contact) -> BucketTouchOutcome {
        if let Some(pos) = self.position(&contact.id) {
            self.contacts.remove(pos);
            self.contacts.push(contact);
            self.touch_last_updated();
            return BucketTouchOutcome::Refreshed;
        }

        if self.contacts.len() < self.k {
            self.contacts.push(contact);
            self.touch_last_updated();
            BucketTouchOutcome::Inserted
        } else {
            BucketTouchOutcome::Full(contact)
        }
    }

    fn push_replacement(&mut self, contact: Contact) {
        self.replacements.retain(|c| c.id != contact.id);
        self.replacements.push_back(contact);
        while self.replacements.len() > self.k {
            self.replacements.pop_front();
        }
    }

    /// Remove a contact, promoting the most recent replacement into its slot.
    ///
    /// Returns true if the contact was one of the bucket's live contacts.
    fn remove(&mut self, id: &NodeId) -> bool {
        self.replacements.retain(|c| &c.id != id);
        let Some(pos) = self.position(id) else {
            return false;
        };
        self.contacts.remove(pos);
        if let Some(replacement) = self.replacements.pop_back() {
            self.contacts.push(replacement);
        }
        true
    }

    /// Split the range at its midpoint, distributing contacts by distance
    /// from `self_id`.
    fn split(self, self_id: &NodeId) -> (KBucket, KBucket) {
        let mid = NodeId::midpoint(&self.low, &self.high);
        let upper_low = mid.checked_successor().unwrap_or(NodeId::MAX);
        let mut lower = KBucket::new(self.low, mid, self.k);
        let mut upper = KBucket::new(upper_low, self.high, self.k);

        for contact in self.contacts {
            if lower.covers(&contact.distance_to(self_id)) {
                lower.contacts.push(contact);
            } else {
                upper.contacts.push(contact);
            }
        }
        for contact in self.replacements {
            if lower.covers(&contact.distance_to(self_id)) {
                lower.replacements.push_back(contact);
            } else {
                upper.replacements.push_back(contact);
            }
        }
        (lower, upper)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Table
// ─────────────────────────────────────────────────────────────────────────────

/// Result of [`RoutingTable::add_contact`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    /// The contact took a free slot.
    Inserted,
    /// The contact was already known and moved to the most-recently-seen end.
    Refreshed,
    /// The covering bucket is full and cannot split. The contact was parked in
    /// the bucket's replacement cache; `head` is the least-recently seen
    /// contact, which should be pinged to find out whether it is still alive.
    Full { head: Contact },
    /// The contact carries the table owner's own id.
    Ignored,
}

/// Kademlia routing table with lazily split buckets.
///
/// The buckets partition the full 160-bit distance space measured from the
/// owner's id, ordered by ascending distance. Only the bucket containing
/// distance zero (the owner itself) ever splits, which bounds the table to
/// `O(log N * k)` contacts.
#[derive(Debug)]
pub struct RoutingTable {
    self_id: NodeId,
    /// Maximum contacts per bucket.
    k: usize,
    /// Quiet period after which a bucket counts as lonely.
    staleness: Duration,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create a routing table with a single bucket covering the whole space.
    pub fn new(self_id: NodeId, k: usize, staleness: Duration) -> Self {
        Self {
            self_id,
            k,
            staleness,
            buckets: vec![KBucket::new(NodeId::ZERO, NodeId::MAX, k)],
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    /// Total number of live contacts across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }

    /// Index of the bucket whose range covers `distance(id, self_id)`.
    fn bucket_index(&self, id: &NodeId) -> usize {
        let distance = self.self_id.distance(id);
        // The last bucket always ends at NodeId::MAX, so this stays in bounds.
        self.buckets.partition_point(|b| b.high < distance)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        let idx = self.bucket_index(id);
        self.buckets[idx].position(id).is_some()
    }

    /// Whether `id` waits in a replacement cache behind a full bucket.
    pub fn is_replacement(&self, id: &NodeId) -> bool {
        let idx = self.bucket_index(id);
        self.buckets[idx].replacements.iter().any(|c| &c.id == id)
    }

    /// True iff no contact with this id is currently in the table.
    pub fn is_new_node(&self, contact: &Contact) -> bool {
        !self.contains(&contact.id)
    }

    /// Every live contact, bucket by bucket.
    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter().cloned())
            .collect()
    }

    fn can_split(&self, idx: usize) -> bool {
        let bucket = &self.buckets[idx];
        bucket.covers(&NodeId::ZERO) && bucket.low != bucket.high
    }

    fn split_bucket(&mut self, idx: usize) {
        let bucket = self.buckets.remove(idx);
        let (lower, upper) = bucket.split(&self.self_id);
        self.buckets.insert(idx, upper);
        self.buckets.insert(idx, lower);
    }

    /// Insert or refresh a contact in the bucket covering its distance.
    ///
    /// Full buckets that contain the owner's id split until the contact fits;
    /// other full buckets keep their existing contacts and park the newcomer
    /// in the replacement cache.
    pub fn add_contact(&mut self, contact: Contact) -> AddOutcome {
        if contact.id == self.self_id {
            return AddOutcome::Ignored;
        }

        let mut contact = contact;
        loop {
            let idx = self.bucket_index(&contact.id);
            match self.buckets[idx].touch(contact) {
                BucketTouchOutcome::Inserted => return AddOutcome::Inserted,
                BucketTouchOutcome::Refreshed => return AddOutcome::Refreshed,
                BucketTouchOutcome::Full(rejected) => {
                    if self.can_split(idx) {
                        self.split_bucket(idx);
                        contact = rejected;
                        continue;
                    }
                    let bucket = &mut self.buckets[idx];
                    bucket.push_replacement(rejected);
                    return match bucket.head() {
                        Some(head) => AddOutcome::Full { head: head.clone() },
                        // k == 0: nothing can ever be stored.
                        None => AddOutcome::Ignored,
                    };
                }
            }
        }
    }

    /// Remove a contact by id. Idempotent; returns true if it was present.
    pub fn remove_contact(&mut self, id: &NodeId) -> bool {
        let idx = self.bucket_index(id);
        self.buckets[idx].remove(id)
    }

    /// Return up to `count` contacts ordered by ascending distance to `target`,
    /// skipping `exclude`.
    ///
    /// This scans every bucket: the nearest contacts to an arbitrary target can
    /// sit in several buckets when the ideal one is sparse.
    pub fn find_neighbors(
        &self,
        target: &NodeId,
        exclude: Option<&NodeId>,
        count: usize,
    ) -> Vec<Contact> {
        let mut all: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts.iter())
            .filter(|c| Some(&c.id) != exclude)
            .cloned()
            .collect();

        all.sort_by(|a, b| distance_cmp(&a.id, &b.id, target));
        all.truncate(count);
        all
    }

    /// Buckets that have not been updated within the staleness threshold.
    pub fn lonely_buckets(&self) -> Vec<&KBucket> {
        let now = Instant::now();
        self.buckets
            .iter()
            .filter(|b| now.duration_since(b.last_updated) > self.staleness)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn id_with_first_byte(byte: u8) -> NodeId {
        let mut id = [0u8; ID_LEN];
        id[0] = byte;
        NodeId(id)
    }

    fn contact(id: NodeId, port: u16) -> Contact {
        Contact::new(id, SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn distance_is_symmetric_and_zero_only_for_equal_ids() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..64 {
            let a = NodeId(rng.gen());
            let b = NodeId(rng.gen());
            assert_eq!(a.distance(&b), b.distance(&a));
            assert_eq!(a.distance(&a), NodeId::ZERO);
            assert_eq!(a.distance(&b) == NodeId::ZERO, a == b);
        }
    }

    #[test]
    fn distance_cmp_orders_by_closeness_to_reference() {
        let target = id_with_first_byte(0x18);
        let near = id_with_first_byte(0x10);
        let far = id_with_first_byte(0x20);

        assert_eq!(distance_cmp(&near, &far, &target), Ordering::Less);
        assert_eq!(distance_cmp(&far, &near, &target), Ordering::Greater);
        assert_eq!(distance_cmp(&near, &near, &target), Ordering::Equal);
    }

    #[test]
    fn leading_zeros_counts_bits() {
        assert_eq!(NodeId::ZERO.leading_zeros(), ID_BITS);
        assert_eq!(NodeId::MAX.leading_zeros(), 0);

        let mut id = [0u8; ID_LEN];
        id[1] = 0b0001_0000;
        assert_eq!(NodeId(id).leading_zeros(), 11);
    }

    #[test]
    fn midpoint_splits_full_range_in_half() {
        let mid = NodeId::midpoint(&NodeId::ZERO, &NodeId::MAX);
        let mut expected = [0xff; ID_LEN];
        expected[0] = 0x7f;
        assert_eq!(mid, NodeId(expected));

        let upper = mid.checked_successor().expect("mid is below MAX");
        assert_eq!(upper, id_with_first_byte(0x80));
        assert_eq!(NodeId::MAX.checked_successor(), None);
    }

    #[test]
    fn random_in_range_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let low = id_with_first_byte(0x40);
        let mut high = [0xff; ID_LEN];
        high[0] = 0x7f;
        let high = NodeId(high);

        for _ in 0..256 {
            let id = NodeId::random_in_range(&low, &high, &mut rng);
            assert!(low <= id && id <= high);
        }
        assert_eq!(NodeId::random_in_range(&low, &low, &mut rng), low);
    }

    #[test]
    fn hex_round_trip_is_lowercase() {
        let id = NodeId::digest(b"key");
        let hex = id.to_hex();
        assert_eq!(hex, hex.to_lowercase());
        assert_eq!(NodeId::from_hex(&hex).expect("valid hex"), id);
        assert!(NodeId::from_hex("abcd").is_err());
    }

    #[test]
    fn full_owner_bucket_splits() {
        let mut table = RoutingTable::new(NodeId::ZERO, 2, Duration::from_secs(3600));
        table.add_contact(contact(id_with_first_byte(0x80), 1));
        table.add_contact(contact(id_with_first_byte(0xC0), 2));
        assert_eq!(table.buckets().len(), 1);

        let outcome = table.add_contact(contact(id_with_first_byte(0x10), 3));
        assert_eq!(outcome, AddOutcome::Inserted);
        assert_eq!(table.buckets().len(), 2);
        assert_eq!(table.buckets()[0].depth(), 1);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn full_far_bucket_parks_newcomer_as_replacement() {
        let mut table = RoutingTable::new(NodeId::ZERO, 2, Duration::from_secs(3600));
        let first = contact(id_with_first_byte(0x80), 1);
        table.add_contact(first.clone());
        table.add_contact(contact(id_with_first_byte(0xC0), 2));
        // Force a split so the upper half no longer holds the owner.
        table.add_contact(contact(id_with_first_byte(0x01), 3));

        let newcomer = contact(id_with_first_byte(0xA0), 4);
        let outcome = table.add_contact(newcomer.clone());
        assert_eq!(outcome, AddOutcome::Full { head: first.clone() });
        assert!(table.is_new_node(&newcomer));

        assert!(table.is_replacement(&newcomer.id));

        assert!(table.remove_contact(&first.id));
        assert!(!table.is_new_node(&newcomer), "replacement is promoted");
        assert!(!table.is_replacement(&newcomer.id));
        assert!(!table.remove_contact(&first.id));
    }

    #[test]
    fn refresh_moves_contact_to_tail_and_updates_address() {
        let mut table = RoutingTable::new(NodeId::ZERO, 4, Duration::from_secs(3600));
        let a = contact(id_with_first_byte(0x80), 1);
        let b = contact(id_with_first_byte(0x81), 2);
        table.add_contact(a.clone());
        table.add_contact(b);

        let moved = contact(a.id, 9999);
        assert_eq!(table.add_contact(moved.clone()), AddOutcome::Refreshed);
        let bucket = &table.buckets()[0];
        assert_eq!(bucket.contacts().last(), Some(&moved));
    }

    #[test]
    fn own_id_is_never_stored() {
        let self_id = id_with_first_byte(0x42);
        let mut table = RoutingTable::new(self_id, 4, Duration::from_secs(3600));
        assert_eq!(table.add_contact(contact(self_id, 1)), AddOutcome::Ignored);
        assert!(table.is_empty());
    }
}
