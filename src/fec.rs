//! Block-structured forward error correction over datagram frames.
//!
//! Every outbound datagram becomes a DATA shard; after `d` of them the
//! encoder emits `p` PARITY shards computed over the same block. The decoder
//! keeps a bounded, sequence-ordered window of shards and rebuilds missing
//! DATA shards as soon as any `d` of a block's `d + p` shards have arrived.
//!
//! # Shard Format
//!
//! ```text
//! ┌──────────┬─────────┬──────────┬─────────────────────────┐
//! │ seq (4B) │ type(2B)│ len (2B) │ original frame ...      │
//! └──────────┴─────────┴──────────┴─────────────────────────┘
//! ```
//!
//! `type` is DATA (0xF1) or PARITY (0xF2); `len` covers itself plus the
//! frame, so a recovered shard can be trimmed back to the original frame
//! even after zero-padding to the block's maximum shard size.

use std::sync::atomic::Ordering::Relaxed;

use crate::erasure::{Codec, ShardMut};
use crate::pool;
use crate::protocol::{seq_diff, MTU_LIMIT};
use crate::stats::stats;
use crate::Error;

/// Byte length of the shard sequence + type fields.
pub const FEC_HEADER_SIZE: usize = 6;
/// Header plus the 2-byte length prefix that fronts the payload.
pub const FEC_HEADER_SIZE_PLUS_2: usize = FEC_HEADER_SIZE + 2;
/// Shard type tag: original datagram bytes.
pub const TYPE_DATA: u16 = 0xF1;
/// Shard type tag: Reed-Solomon parity bytes.
pub const TYPE_PARITY: u16 = 0xF2;

/// Shard sequence number from a raw shard.
#[inline]
pub fn shard_seq(shard: &[u8]) -> u32 {
    u32::from_le_bytes([shard[0], shard[1], shard[2], shard[3]])
}

/// Shard type tag from a raw shard.
#[inline]
pub fn shard_flag(shard: &[u8]) -> u16 {
    u16::from_le_bytes([shard[4], shard[5]])
}

/// Groups outbound datagrams into blocks and derives parity shards.
pub struct FecEncoder {
    data_shards: usize,
    shard_size: usize,
    /// Sequence wrap point: the largest multiple of the block size below
    /// 2^32, so a wrapped sequence still lands on a block boundary.
    paws: u32,
    next: u32,
    /// Data shards collected toward the current block.
    shard_count: usize,
    /// Longest shard seen in the current block.
    max_size: usize,
    header_offset: usize,
    payload_offset: usize,
    shard_cache: Vec<Vec<u8>>,
    codec: Codec,
}

impl FecEncoder {
    /// Create an encoder writing shard headers at `offset` bytes into each
    /// datagram.
    pub fn new(data_shards: usize, parity_shards: usize, offset: usize) -> Result<Self, Error> {
        let codec = Codec::new(data_shards, parity_shards)?;
        let shard_size = data_shards + parity_shards;
        Ok(Self {
            data_shards,
            shard_size,
            paws: (u32::MAX / shard_size as u32 - 1) * shard_size as u32,
            next: 0,
            shard_count: 0,
            max_size: 0,
            header_offset: offset,
            payload_offset: offset + FEC_HEADER_SIZE,
            shard_cache: (0..shard_size)
                .map(|_| Vec::with_capacity(MTU_LIMIT))
                .collect(),
            codec,
        })
    }

    fn mark_data(&mut self, header: &mut [u8]) {
        header[0..4].copy_from_slice(&self.next.to_le_bytes());
        header[4..6].copy_from_slice(&TYPE_DATA.to_le_bytes());
        self.next = self.next.wrapping_add(1);
    }

    fn mark_parity(&mut self, header: &mut [u8]) {
        header[0..4].copy_from_slice(&self.next.to_le_bytes());
        header[4..6].copy_from_slice(&TYPE_PARITY.to_le_bytes());
        self.next = (self.next + 1) % self.paws;
    }

    /// Stamp `datagram` as the next DATA shard and, when it completes a
    /// block, return the parity shards to transmit after it.
    ///
    /// `datagram` must carry `payload_offset` spare bytes at the front: the
    /// shard header and length prefix are written in place.
    pub fn encode(&mut self, datagram: &mut [u8]) -> &[Vec<u8>] {
        let header_offset = self.header_offset;
        let payload_offset = self.payload_offset;

        self.mark_data(&mut datagram[header_offset..]);
        let body_len = (datagram.len() - payload_offset) as u16;
        datagram[payload_offset..payload_offset + 2].copy_from_slice(&body_len.to_le_bytes());

        let sz = datagram.len();
        let cache = &mut self.shard_cache[self.shard_count];
        cache.clear();
        cache.resize(sz, 0);
        cache[payload_offset..].copy_from_slice(&datagram[payload_offset..]);
        self.shard_count += 1;
        if sz > self.max_size {
            self.max_size = sz;
        }

        if self.shard_count < self.data_shards {
            return &[];
        }

        // Block complete: zero-pad everything to the longest shard and run
        // the codec over the payload regions.
        let max_size = self.max_size;
        for shard in self.shard_cache.iter_mut() {
            shard.resize(max_size, 0);
        }
        {
            let (data, parity) = self.shard_cache.split_at_mut(self.data_shards);
            let data_refs: Vec<&[u8]> = data.iter().map(|s| &s[payload_offset..]).collect();
            let mut parity_refs: Vec<&mut [u8]> = parity
                .iter_mut()
                .map(|s| &mut s[payload_offset..])
                .collect();
            // Geometry was validated at construction.
            let _ = self.codec.encode(&data_refs, &mut parity_refs);
        }
        for k in self.data_shards..self.shard_size {
            let mut shard = std::mem::take(&mut self.shard_cache[k]);
            self.mark_parity(&mut shard[header_offset..]);
            self.shard_cache[k] = shard;
        }

        self.shard_count = 0;
        self.max_size = 0;
        &self.shard_cache[self.data_shards..]
    }
}

/// Reassembles blocks from shards arriving in any order and recovers
/// missing DATA shards.
pub struct FecDecoder {
    rx_limit: usize,
    data_shards: usize,
    shard_size: usize,
    /// Receive window, sorted by shard sequence. Buffers come from the
    /// transmit pool and go back when their block resolves or they age out.
    rx: Vec<Vec<u8>>,
    codec: Codec,
}

impl FecDecoder {
    /// Create a decoder holding at most `rx_limit` shards.
    pub fn new(rx_limit: usize, data_shards: usize, parity_shards: usize) -> Result<Self, Error> {
        let codec = Codec::new(data_shards, parity_shards)?;
        let shard_size = data_shards + parity_shards;
        if rx_limit < shard_size {
            return Err(Error::InvalidParams);
        }
        Ok(Self {
            rx_limit,
            data_shards,
            shard_size,
            rx: Vec::new(),
            codec,
        })
    }

    /// Admit one shard; returns any frames recovered by this admission.
    ///
    /// Recovered frames begin with their 2-byte length prefix and sit in
    /// pool buffers the caller must release.
    pub fn decode(&mut self, shard: &[u8]) -> Vec<Vec<u8>> {
        if shard.len() <= FEC_HEADER_SIZE {
            return Vec::new();
        }
        let seq = shard_seq(shard);

        // Insert in sequence order, dropping duplicates.
        let mut insert_idx = 0;
        for i in (0..self.rx.len()).rev() {
            let other = shard_seq(&self.rx[i]);
            if other == seq {
                return Vec::new();
            }
            if seq_diff(seq, other) > 0 {
                insert_idx = i + 1;
                break;
            }
        }
        let mut copy = pool::get();
        copy.extend_from_slice(shard);
        self.rx.insert(insert_idx, copy);

        let shard_size = self.shard_size as u32;
        let block_begin = seq - seq % shard_size;
        let block_end = block_begin.wrapping_add(shard_size - 1);

        let search_begin = insert_idx.saturating_sub((seq % shard_size) as usize);
        let search_end = (search_begin + self.shard_size - 1).min(self.rx.len() - 1);

        let mut recovered = Vec::new();
        if search_end - search_begin + 1 >= self.data_shards {
            // Scan the block: which slots are present, who is first in the
            // window, and the longest payload to pad to.
            let mut num_shard = 0;
            let mut num_data = 0;
            let mut first = 0;
            let mut max_len = 0;
            for i in search_begin..=search_end {
                let sid = shard_seq(&self.rx[i]);
                if seq_diff(sid, block_end) > 0 {
                    break;
                }
                if seq_diff(sid, block_begin) < 0 {
                    continue;
                }
                if num_shard == 0 {
                    first = i;
                }
                num_shard += 1;
                if shard_flag(&self.rx[i]) == TYPE_DATA {
                    num_data += 1;
                }
                max_len = max_len.max(self.rx[i].len() - FEC_HEADER_SIZE);
            }

            if num_data == self.data_shards {
                self.free_range(first, num_shard);
            } else if num_shard >= self.data_shards {
                recovered = self.reconstruct_block(first, num_shard, max_len);
                self.free_range(first, num_shard);
            }
        }

        // Age out the oldest shard once over budget. A data shard evicted
        // here was never part of a completed block.
        if self.rx.len() > self.rx_limit {
            if shard_flag(&self.rx[0]) == TYPE_DATA {
                stats().fec_runt_shards.fetch_add(1, Relaxed);
            }
            pool::put(self.rx.remove(0));
        }
        recovered
    }

    /// Run the erasure codec over one block and collect the rebuilt DATA
    /// payloads.
    fn reconstruct_block(&mut self, first: usize, num_shard: usize, max_len: usize) -> Vec<Vec<u8>> {
        let shard_size = self.shard_size;
        let data_shards = self.data_shards;

        // Pad every present shard of the block to the common length.
        let mut present = vec![false; shard_size];
        for buf in self.rx[first..first + num_shard].iter_mut() {
            let slot = (shard_seq(buf) % shard_size as u32) as usize;
            present[slot] = true;
            buf.resize(FEC_HEADER_SIZE + max_len, 0);
        }

        // Pool buffers for the data slots to rebuild.
        let mut fresh: Vec<(usize, Vec<u8>)> = (0..data_shards)
            .filter(|&slot| !present[slot])
            .map(|slot| {
                let mut buf = pool::get();
                buf.resize(max_len, 0);
                (slot, buf)
            })
            .collect();

        let ok = {
            let mut rows: Vec<Option<ShardMut<'_>>> = (0..shard_size).map(|_| None).collect();
            for buf in self.rx[first..first + num_shard].iter_mut() {
                let slot = (shard_seq(buf) % shard_size as u32) as usize;
                rows[slot] = Some(ShardMut {
                    data: &mut buf[FEC_HEADER_SIZE..],
                    present: true,
                });
            }
            for (slot, buf) in fresh.iter_mut() {
                rows[*slot] = Some(ShardMut {
                    data: buf.as_mut_slice(),
                    present: false,
                });
            }
            self.codec.reconstruct(&mut rows).is_ok()
        };

        if ok {
            fresh.into_iter().map(|(_, buf)| buf).collect()
        } else {
            for (_, buf) in fresh {
                pool::put(buf);
            }
            Vec::new()
        }
    }

    /// Release a resolved span of the receive window back to the pool.
    fn free_range(&mut self, first: usize, n: usize) {
        for buf in self.rx.drain(first..first + n) {
            pool::put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: usize = 10;
    const P: usize = 3;

    /// Build a DATA shard stream through the encoder, collecting every
    /// shard (data and parity) as raw wire bytes.
    fn shard_stream(frames: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut enc = FecEncoder::new(D, P, 0).unwrap();
        let mut wire = Vec::new();
        for frame in frames {
            let mut dgram = vec![0u8; FEC_HEADER_SIZE_PLUS_2 + frame.len()];
            dgram[FEC_HEADER_SIZE_PLUS_2..].copy_from_slice(frame);
            let parity = enc.encode(&mut dgram);
            let parity: Vec<Vec<u8>> = parity.to_vec();
            wire.push(dgram);
            wire.extend(parity);
        }
        wire
    }

    fn frame_of(shard: &[u8]) -> Vec<u8> {
        let body = &shard[FEC_HEADER_SIZE..];
        let sz = u16::from_le_bytes([body[0], body[1]]) as usize;
        body[2..sz].to_vec()
    }

    #[test]
    fn encoder_emits_parity_per_block() {
        let frames: Vec<Vec<u8>> = (0..D).map(|i| vec![i as u8; 100]).collect();
        let wire = shard_stream(&frames);
        assert_eq!(wire.len(), D + P);
        for (i, shard) in wire.iter().enumerate() {
            assert_eq!(shard_seq(shard), i as u32);
            let expect = if i < D { TYPE_DATA } else { TYPE_PARITY };
            assert_eq!(shard_flag(shard), expect);
        }
    }

    #[test]
    fn length_prefix_covers_frame() {
        let frames = vec![vec![0xAB; 37]];
        let mut enc = FecEncoder::new(D, P, 0).unwrap();
        let mut dgram = vec![0u8; FEC_HEADER_SIZE_PLUS_2 + 37];
        dgram[FEC_HEADER_SIZE_PLUS_2..].copy_from_slice(&frames[0]);
        enc.encode(&mut dgram);
        assert_eq!(frame_of(&dgram), frames[0]);
    }

    #[test]
    fn decoder_passes_complete_blocks_through() {
        let frames: Vec<Vec<u8>> = (0..D).map(|i| vec![i as u8; 64]).collect();
        let wire = shard_stream(&frames);
        let mut dec = FecDecoder::new(3 * (D + P), D, P).unwrap();
        for shard in &wire {
            let recovered = dec.decode(shard);
            assert!(recovered.is_empty());
        }
        // The completed block was freed the moment the last DATA shard
        // arrived; only the late parity shards linger.
        assert_eq!(dec.rx.len(), P);
    }

    #[test]
    fn decoder_recovers_dropped_shards() {
        let frames: Vec<Vec<u8>> = (0..D)
            .map(|i| (0..80 + i).map(|b| (b * 3 + i) as u8).collect())
            .collect();
        let wire = shard_stream(&frames);

        // Drop DATA shards 5 and 9; everything else arrives.
        let mut dec = FecDecoder::new(3 * (D + P), D, P).unwrap();
        let mut recovered_frames = Vec::new();
        for (i, shard) in wire.iter().enumerate() {
            if i == 5 || i == 9 {
                continue;
            }
            for r in dec.decode(shard) {
                let sz = u16::from_le_bytes([r[0], r[1]]) as usize;
                recovered_frames.push(r[2..sz].to_vec());
                pool::put(r);
            }
        }
        assert_eq!(recovered_frames.len(), 2);
        assert_eq!(recovered_frames[0], frames[5]);
        assert_eq!(recovered_frames[1], frames[9]);
    }

    #[test]
    fn any_three_losses_recover() {
        let frames: Vec<Vec<u8>> = (0..D).map(|i| vec![(i * 7 + 1) as u8; 48]).collect();
        let wire = shard_stream(&frames);
        let n = wire.len();

        for a in 0..n {
            for b in (a + 1)..n {
                for c in (b + 1)..n {
                    let mut dec = FecDecoder::new(3 * (D + P), D, P).unwrap();
                    let mut delivered: Vec<Vec<u8>> = Vec::new();
                    for (i, shard) in wire.iter().enumerate() {
                        if i == a || i == b || i == c {
                            continue;
                        }
                        if i < D {
                            delivered.push(frames[i].clone());
                        }
                        for r in dec.decode(shard) {
                            let sz = u16::from_le_bytes([r[0], r[1]]) as usize;
                            delivered.push(r[2..sz].to_vec());
                            pool::put(r);
                        }
                    }
                    let mut sorted = delivered.clone();
                    sorted.sort();
                    let mut expect = frames.clone();
                    expect.sort();
                    assert_eq!(sorted, expect, "drops {:?}", (a, b, c));
                }
            }
        }
    }

    #[test]
    fn duplicate_shards_are_ignored() {
        let frames: Vec<Vec<u8>> = (0..D).map(|i| vec![i as u8; 32]).collect();
        let wire = shard_stream(&frames);
        let mut dec = FecDecoder::new(3 * (D + P), D, P).unwrap();
        dec.decode(&wire[0]);
        let window = dec.rx.len();
        dec.decode(&wire[0]);
        assert_eq!(dec.rx.len(), window);
    }

    #[test]
    fn late_parity_completes_the_block() {
        let frames: Vec<Vec<u8>> = (0..D).map(|i| vec![(i + 1) as u8; 56]).collect();
        let wire = shard_stream(&frames);

        // Shard 0 is lost; data 1..9 arrive, then the first parity shard
        // brings the block to D shards and triggers recovery.
        let mut dec = FecDecoder::new(3 * (D + P), D, P).unwrap();
        let mut recovered = Vec::new();
        for shard in wire[1..=D].iter() {
            for r in dec.decode(shard) {
                let sz = u16::from_le_bytes([r[0], r[1]]) as usize;
                recovered.push(r[2..sz].to_vec());
                pool::put(r);
            }
        }
        assert_eq!(recovered, vec![frames[0].clone()]);
    }

    #[test]
    fn window_evicts_oldest_over_limit() {
        let mut enc = FecEncoder::new(D, P, 0).unwrap();
        let mut dec = FecDecoder::new(D + P, D, P).unwrap();
        let runts_before = stats().snapshot().fec_runt_shards;
        // Admit one lone data shard from each of twenty distinct blocks so
        // no block can ever complete.
        for block in 0..20u32 {
            let mut dgram = vec![0u8; FEC_HEADER_SIZE_PLUS_2 + 8];
            enc.encode(&mut dgram);
            dgram[0..4].copy_from_slice(&(block * (D + P) as u32).to_le_bytes());
            dec.decode(&dgram);
        }
        assert_eq!(dec.rx.len(), D + P);
        let runts_after = stats().snapshot().fec_runt_shards;
        assert!(runts_after >= runts_before + 20 - (D + P) as u64);
    }
}
