//! Frame reassembly from reordered RTP packets
//!
//! Packets are held in a fixed-capacity ring addressed by their sequence
//! distance from the window head. A frame is emitted once every packet from
//! its partition head up to its partition tail (or up to the first packet of
//! the next timestamp) is present. Incomplete frames are never waited on by
//! wall clock: they are evicted when a newer packet would push the window past
//! its capacity, and each eviction is reported as a single [`FrameDrop`].

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use thiserror::Error;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer;

use crate::frame::{timestamp_delta, Frame};

/// Smallest usable window: one frame start plus one packet to detect its end
pub const MIN_CAPACITY: usize = 2;

/// Sequence distances at or beyond this are treated as behind the head
const HALF_SEQUENCE_SPACE: u16 = 0x8000;

/// Largest usable window. A wider one could never be pushed forward.
pub const MAX_CAPACITY: usize = HALF_SEQUENCE_SPACE as usize - 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("Reassembly window of {0} packets is too small (minimum {MIN_CAPACITY})")]
    CapacityTooSmall(usize),

    #[error("Reassembly window of {0} packets is too large (maximum {MAX_CAPACITY})")]
    CapacityTooLarge(usize),
}

/// A run of sequence numbers discarded without producing a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDrop {
    pub first_sequence: u16,
    pub last_sequence: u16,
    /// RTP timestamp of the discarded frame, if any of its packets arrived
    pub timestamp: Option<u32>,
}

impl FrameDrop {
    /// Number of sequence positions covered by the run
    pub fn sequence_count(&self) -> usize {
        self.last_sequence.wrapping_sub(self.first_sequence) as usize + 1
    }

    pub fn contains(&self, sequence: u16) -> bool {
        sequence.wrapping_sub(self.first_sequence) <= self.last_sequence.wrapping_sub(self.first_sequence)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    pub packets_pushed: u64,
    pub duplicate_packets: u64,
    pub late_packets: u64,
    /// Padding-only packets skipped between frames
    pub padding_packets: u64,
    pub frames_emitted: u64,
    pub frames_dropped: u64,
}

/// Rebuilds frames from one track's RTP packets
pub struct FrameReassembler<D> {
    depacketizer: D,
    clock_rate: u32,
    slots: Vec<Option<Packet>>,
    /// Ring index of the window head
    head_slot: usize,
    /// Sequence number stored at the window head
    head_sequence: u16,
    /// Sequence positions tracked from the head, occupied or not
    span: usize,
    initialized: bool,
    /// Set once anything at the head has been emitted or discarded
    consumed: bool,
    last_timestamp: Option<u32>,
    ready: VecDeque<Frame>,
    stats: ReassemblerStats,
}

impl<D: Depacketizer + Default> FrameReassembler<D> {
    pub fn new(depacketizer: D, capacity: usize, clock_rate: u32) -> Result<Self, ReassemblyError> {
        if capacity < MIN_CAPACITY {
            return Err(ReassemblyError::CapacityTooSmall(capacity));
        }
        if capacity > MAX_CAPACITY {
            return Err(ReassemblyError::CapacityTooLarge(capacity));
        }

        Ok(Self {
            depacketizer,
            clock_rate,
            slots: vec![None; capacity],
            head_slot: 0,
            head_sequence: 0,
            span: 0,
            initialized: false,
            consumed: false,
            last_timestamp: None,
            ready: VecDeque::new(),
            stats: ReassemblerStats::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn stats(&self) -> ReassemblerStats {
        self.stats
    }

    /// Number of packets currently held in the window
    pub fn buffered(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Insert a packet.
    ///
    /// Returns the frames this push discarded. Duplicates and packets behind
    /// the window are absorbed and return no drops.
    pub fn push(&mut self, packet: Packet) -> Vec<FrameDrop> {
        self.stats.packets_pushed += 1;
        let mut drops = Vec::new();
        let sequence = packet.header.sequence_number;

        if !self.initialized {
            self.initialized = true;
            self.head_sequence = sequence;
        }

        let distance = sequence.wrapping_sub(self.head_sequence);
        if distance >= HALF_SEQUENCE_SPACE {
            if !self.rewind_to(sequence) {
                self.stats.late_packets += 1;
                tracing::trace!("Ignoring late packet seq={} head={}", sequence, self.head_sequence);
                return drops;
            }
        } else if (distance as usize) < self.span {
            if self.packet_at(distance as usize).is_some() {
                self.stats.duplicate_packets += 1;
                tracing::trace!("Ignoring duplicate packet seq={}", sequence);
                return drops;
            }
        } else {
            self.make_room_for(sequence, &mut drops);
        }

        let offset = sequence.wrapping_sub(self.head_sequence) as usize;
        let index = self.slot_index(offset);
        self.slots[index] = Some(packet);
        self.span = self.span.max(offset + 1);

        self.assemble(&mut drops);
        drops
    }

    /// Next completed frame in sequence order
    pub fn pop(&mut self) -> Option<Frame> {
        self.ready.pop_front()
    }

    /// Drain everything at end of stream.
    ///
    /// A trailing frame that is contiguous up to the last buffered packet is
    /// emitted even without an end marker. Everything else still buffered is
    /// discarded without being reported.
    pub fn flush(&mut self) -> Vec<Frame> {
        let mut discarded = Vec::new();
        loop {
            self.assemble(&mut discarded);
            if self.span == 0 {
                break;
            }

            let trailing = match self.packet_at(0) {
                Some(head) if self.depacketizer.is_partition_head(&head.payload) => {
                    let timestamp = head.header.timestamp;
                    (0..self.span).all(|offset| {
                        self.packet_at(offset)
                            .is_some_and(|p| p.header.timestamp == timestamp)
                    })
                }
                _ => false,
            };

            if trailing {
                self.emit(self.span, &mut discarded);
            } else {
                discarded.push(self.discard_head_run());
            }
        }

        if !discarded.is_empty() {
            tracing::debug!("Discarded {} incomplete frame(s) at end of stream", discarded.len());
        }
        self.ready.drain(..).collect()
    }

    /// Move the head back for a packet that precedes it, which is only allowed
    /// before anything has left the window.
    fn rewind_to(&mut self, sequence: u16) -> bool {
        let back = self.head_sequence.wrapping_sub(sequence) as usize;
        if self.consumed || self.span + back > self.capacity() {
            return false;
        }

        let capacity = self.capacity();
        self.head_slot = (self.head_slot + capacity - back % capacity) % capacity;
        self.head_sequence = sequence;
        self.span += back;
        true
    }

    /// Evict from the head until `sequence` fits inside the window
    fn make_room_for(&mut self, sequence: u16, drops: &mut Vec<FrameDrop>) {
        while sequence.wrapping_sub(self.head_sequence) as usize >= self.capacity() {
            if self.span == 0 {
                // Nothing buffered: the skipped positions are one lost run
                let last = sequence.wrapping_sub(1);
                drops.push(self.record_drop(self.head_sequence, last, None));
                self.head_sequence = sequence;
                break;
            }

            drops.push(self.discard_head_run());
            self.assemble(drops);
        }
    }

    /// Emit every frame that is complete at the head
    fn assemble(&mut self, drops: &mut Vec<FrameDrop>) {
        while self.span > 0 {
            let Some(head) = self.packet_at(0) else {
                break;
            };

            if head.payload.is_empty() {
                // Padding between frames carries nothing to lose
                let seq = head.header.sequence_number;
                self.stats.padding_packets += 1;
                tracing::trace!("Skipping padding packet seq={}", seq);
                self.advance(1);
                continue;
            }

            if !self.depacketizer.is_partition_head(&head.payload) {
                if self.consumed {
                    // The start of this frame is gone for good
                    drops.push(self.discard_head_run());
                    continue;
                }
                // An earlier packet may still arrive and become the head
                break;
            }

            match self.frame_extent() {
                Some(len) => self.emit(len, drops),
                None => break,
            }
        }
    }

    /// Length of the complete frame at the head, if it is complete
    fn frame_extent(&self) -> Option<usize> {
        let timestamp = self.packet_at(0)?.header.timestamp;
        for offset in 0..self.span {
            let packet = self.packet_at(offset)?;
            if packet.header.timestamp != timestamp {
                return Some(offset);
            }
            if self
                .depacketizer
                .is_partition_tail(packet.header.marker, &packet.payload)
            {
                return Some(offset + 1);
            }
        }
        None
    }

    /// Depacketize the first `len` packets into a frame
    fn emit(&mut self, len: usize, drops: &mut Vec<FrameDrop>) {
        let first_sequence = self.head_sequence;
        let last_sequence = first_sequence.wrapping_add(len as u16 - 1);

        let mut data = BytesMut::new();
        let mut timestamp = 0;
        let mut failed = false;
        for offset in 0..len {
            let index = self.slot_index(offset);
            let Some(packet) = self.slots[index].take() else {
                continue;
            };
            timestamp = packet.header.timestamp;
            if failed || packet.payload.is_empty() {
                continue;
            }
            match self.depacketizer.depacketize(&packet.payload) {
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(e) => {
                    tracing::debug!("Failed to depacketize seq={}: {}", packet.header.sequence_number, e);
                    failed = true;
                }
            }
        }
        self.advance(len);
        self.consumed = true;
        // Fragment state never carries over into the next frame
        self.depacketizer = D::default();

        if failed || data.is_empty() {
            drops.push(self.record_drop(first_sequence, last_sequence, Some(timestamp)));
            return;
        }

        let duration = self
            .last_timestamp
            .map(|previous| timestamp_delta(timestamp.wrapping_sub(previous), self.clock_rate))
            .unwrap_or_default();
        self.last_timestamp = Some(timestamp);
        self.stats.frames_emitted += 1;

        self.ready.push_back(Frame {
            data: Bytes::from(data),
            timestamp,
            duration,
            first_sequence,
            last_sequence,
            packet_count: len,
        });
    }

    /// Discard the head slot and everything that continues the same frame
    fn discard_head_run(&mut self) -> FrameDrop {
        let first_sequence = self.head_sequence;
        let mut timestamp = self.packet_at(0).map(|p| p.header.timestamp);

        let mut len = 1;
        while len < self.span {
            match self.packet_at(len) {
                None => len += 1,
                Some(packet) => {
                    let same_frame = Some(packet.header.timestamp) == timestamp;
                    if !same_frame && self.depacketizer.is_partition_head(&packet.payload) {
                        break;
                    }
                    timestamp.get_or_insert(packet.header.timestamp);
                    len += 1;
                }
            }
        }

        self.advance(len);
        let last_sequence = first_sequence.wrapping_add(len as u16 - 1);
        self.record_drop(first_sequence, last_sequence, timestamp)
    }

    fn record_drop(&mut self, first_sequence: u16, last_sequence: u16, timestamp: Option<u32>) -> FrameDrop {
        self.stats.frames_dropped += 1;
        self.consumed = true;
        tracing::debug!(
            "Dropped incomplete frame seq={}..={} ts={:?}",
            first_sequence,
            last_sequence,
            timestamp
        );
        FrameDrop {
            first_sequence,
            last_sequence,
            timestamp,
        }
    }

    /// Clear `len` slots from the head and move the head past them
    fn advance(&mut self, len: usize) {
        for offset in 0..len.min(self.span) {
            let index = self.slot_index(offset);
            self.slots[index] = None;
        }
        self.head_slot = (self.head_slot + len) % self.capacity();
        self.head_sequence = self.head_sequence.wrapping_add(len as u16);
        self.span = self.span.saturating_sub(len);
    }

    fn slot_index(&self, offset: usize) -> usize {
        (self.head_slot + offset) % self.capacity()
    }

    fn packet_at(&self, offset: usize) -> Option<&Packet> {
        self.slots[self.slot_index(offset)].as_ref()
    }
}
