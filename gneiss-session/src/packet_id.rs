/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Packet identifier allocation.

Every QoS 1/2 PUBLISH, SUBSCRIBE, and UNSUBSCRIBE needs a non-zero 16-bit identifier that no
other in-flight exchange is using.  Identifiers are issued by a [`PacketIdProvider`] owned by
the session and returned to it when the exchange completes.
 */

use log::*;

const PACKET_ID_SPACE_SIZE: usize = 1 << 16;
const WORD_BITS: usize = 64;
const WORD_COUNT: usize = PACKET_ID_SPACE_SIZE / WORD_BITS;

/// Largest number of identifiers that can be issued at once
pub const MAXIMUM_ISSUED_PACKET_IDS: usize = PACKET_ID_SPACE_SIZE - 1;

/// Controls which packet identifier provider a session uses
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
#[non_exhaustive]
pub enum PacketIdPolicy {

    /// Always issue the smallest free identifier.  Keeps the issued set dense.
    #[default]
    SmallestFree,

    /// Walk forward through the identifier space, wrapping from 65535 back to 1 and skipping
    /// identifiers still in use.  Delays reuse of recently released identifiers.
    Sequential,
}

/// Issues and reclaims packet identifiers in [1, 65535].
///
/// An identifier is issued to at most one exchange at any instant.
pub trait PacketIdProvider : Send {

    /// Issues a free identifier, or returns None if all 65535 are issued.
    fn allocate(&mut self) -> Option<u16>;

    /// Marks a caller-chosen identifier issued.  Returns false if it is zero or already issued.
    fn register(&mut self, packet_id: u16) -> bool;

    /// Returns an identifier to the free set.  Releasing a free identifier is a no-op.
    fn deallocate(&mut self, packet_id: u16);

    /// Result of the most recent `allocate` call
    fn last_allocated(&self) -> Option<u16>;

    /// Frees every identifier
    fn clear(&mut self);

    /// Returns whether an identifier is currently issued
    fn is_allocated(&self, packet_id: u16) -> bool;

    /// Number of identifiers currently issued
    fn allocated_count(&self) -> usize;
}

/// Creates the provider selected by a packet id policy
pub fn create_packet_id_provider(policy: PacketIdPolicy) -> Box<dyn PacketIdProvider> {
    match policy {
        PacketIdPolicy::SmallestFree => { Box::new(UniquePacketIdProvider::new()) }
        PacketIdPolicy::Sequential => { Box::new(SequentialPacketIdProvider::new()) }
    }
}

// Bitmap over the full 16-bit space.  Bit 0 stays set so zero is never issued.
struct PacketIdSet {
    words: Vec<u64>,
    issued: usize,
}

impl PacketIdSet {
    fn new() -> Self {
        let mut set = PacketIdSet {
            words: vec![0; WORD_COUNT],
            issued: 0,
        };
        set.words[0] = 1;
        set
    }

    fn contains(&self, packet_id: u16) -> bool {
        let index = packet_id as usize;
        self.words[index / WORD_BITS] & (1u64 << (index % WORD_BITS)) != 0
    }

    fn insert(&mut self, packet_id: u16) -> bool {
        if packet_id == 0 || self.contains(packet_id) {
            return false;
        }

        let index = packet_id as usize;
        self.words[index / WORD_BITS] |= 1u64 << (index % WORD_BITS);
        self.issued += 1;
        true
    }

    fn remove(&mut self, packet_id: u16) -> bool {
        if packet_id == 0 || !self.contains(packet_id) {
            return false;
        }

        let index = packet_id as usize;
        self.words[index / WORD_BITS] &= !(1u64 << (index % WORD_BITS));
        self.issued -= 1;
        true
    }

    // smallest clear bit at or after word `start_word`
    fn first_free_from(&self, start_word: usize) -> Option<u16> {
        self.words.iter()
            .enumerate()
            .skip(start_word)
            .find(|(_, word)| **word != u64::MAX)
            .map(|(word_index, word)| (word_index * WORD_BITS + (!*word).trailing_zeros() as usize) as u16)
    }

    fn is_full(&self) -> bool {
        self.issued == MAXIMUM_ISSUED_PACKET_IDS
    }

    fn clear(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
        self.words[0] = 1;
        self.issued = 0;
    }
}

/// Packet id provider that always issues the smallest free identifier.
pub struct UniquePacketIdProvider {
    issued: PacketIdSet,

    // no free identifier exists in any word before this one
    search_hint: usize,

    last_allocated: Option<u16>,
}

impl UniquePacketIdProvider {

    /// Creates a provider with every identifier free
    pub fn new() -> Self {
        UniquePacketIdProvider {
            issued: PacketIdSet::new(),
            search_hint: 0,
            last_allocated: None,
        }
    }
}

impl Default for UniquePacketIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdProvider for UniquePacketIdProvider {
    fn allocate(&mut self) -> Option<u16> {
        let packet_id =
            if self.issued.is_full() {
                None
            } else {
                self.issued.first_free_from(self.search_hint)
            };

        if let Some(id) = packet_id {
            self.issued.insert(id);
            self.search_hint = id as usize / WORD_BITS;
        } else {
            debug!("UniquePacketIdProvider::allocate - packet id space exhausted");
        }

        self.last_allocated = packet_id;
        packet_id
    }

    fn register(&mut self, packet_id: u16) -> bool {
        self.issued.insert(packet_id)
    }

    fn deallocate(&mut self, packet_id: u16) {
        if self.issued.remove(packet_id) {
            self.search_hint = self.search_hint.min(packet_id as usize / WORD_BITS);
        }
    }

    fn last_allocated(&self) -> Option<u16> {
        self.last_allocated
    }

    fn clear(&mut self) {
        self.issued.clear();
        self.search_hint = 0;
    }

    fn is_allocated(&self, packet_id: u16) -> bool {
        packet_id != 0 && self.issued.contains(packet_id)
    }

    fn allocated_count(&self) -> usize {
        self.issued.issued
    }
}

/// Packet id provider that cycles through the identifier space.
pub struct SequentialPacketIdProvider {
    issued: PacketIdSet,
    next_id: u16,
    last_allocated: Option<u16>,
}

impl SequentialPacketIdProvider {

    /// Creates a provider whose first identifier is 1
    pub fn new() -> Self {
        SequentialPacketIdProvider {
            issued: PacketIdSet::new(),
            next_id: 1,
            last_allocated: None,
        }
    }

    fn advance(&mut self) {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
    }
}

impl Default for SequentialPacketIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdProvider for SequentialPacketIdProvider {
    fn allocate(&mut self) -> Option<u16> {
        let mut packet_id = None;
        if !self.issued.is_full() {
            while self.issued.contains(self.next_id) {
                self.advance();
            }

            packet_id = Some(self.next_id);
            self.issued.insert(self.next_id);
            self.advance();
        } else {
            debug!("SequentialPacketIdProvider::allocate - packet id space exhausted");
        }

        self.last_allocated = packet_id;
        packet_id
    }

    fn register(&mut self, packet_id: u16) -> bool {
        self.issued.insert(packet_id)
    }

    fn deallocate(&mut self, packet_id: u16) {
        self.issued.remove(packet_id);
    }

    fn last_allocated(&self) -> Option<u16> {
        self.last_allocated
    }

    fn clear(&mut self) {
        self.issued.clear();
        self.next_id = 1;
    }

    fn is_allocated(&self, packet_id: u16) -> bool {
        packet_id != 0 && self.issued.contains(packet_id)
    }

    fn allocated_count(&self) -> usize {
        self.issued.issued
    }
}
