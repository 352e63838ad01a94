//! # FEC Encoder/Decoder
//!
//! XOR-based `(N+1)` parity. Every group of `N` data frames gets one parity
//! frame whose payload is the XOR of the group's payloads (truncated to the
//! shortest member). A group recovers when at most one of its `N+1` slots
//! (`N` data + 1 parity) is missing; two or more missing discards the group.

use crate::error::TransportError;
use bytes::Bytes;
use std::collections::HashMap;

/// Buffers frames into fixed-size groups and emits one XOR parity payload
/// per full group. `group_id` increases strictly within a connection.
pub struct FecEncoder {
    n: u32,
    current_group_id: u32,
    buffered: Vec<(u32, Bytes)>, // (fec_index, payload)
}

impl FecEncoder {
    pub fn new(n: u32) -> Self {
        assert!(n > 0, "FEC redundancy ratio must be >= 1");
        FecEncoder {
            n,
            current_group_id: 0,
            buffered: Vec::with_capacity(n as usize),
        }
    }

    pub fn group_id(&self) -> u32 {
        self.current_group_id
    }

    /// Group size `N` this encoder was built with.
    pub fn n(&self) -> u32 {
        self.n
    }

    /// Position the next [`add_frame`](Self::add_frame) call will assign.
    pub fn next_index(&self) -> u32 {
        self.buffered.len() as u32
    }

    /// Buffer one data-frame payload tagged with its position in the group.
    /// Returns the parity payload (and the just-completed group's id) once
    /// the group reaches `N` members.
    pub fn add_frame(&mut self, payload: Bytes) -> Option<(u32, Bytes)> {
        let index = self.buffered.len() as u32;
        self.buffered.push((index, payload));
        if self.buffered.len() as u32 == self.n {
            Some(self.emit_parity())
        } else {
            None
        }
    }

    /// Emit a parity frame for whatever has been buffered so far, even if
    /// the group is not full (used when a message ends mid-group).
    pub fn flush(&mut self) -> Option<(u32, Bytes)> {
        if self.buffered.is_empty() {
            None
        } else {
            Some(self.emit_parity())
        }
    }

    fn emit_parity(&mut self) -> (u32, Bytes) {
        let min_len = self
            .buffered
            .iter()
            .map(|(_, p)| p.len())
            .min()
            .unwrap_or(0);
        let mut parity = vec![0u8; min_len];
        for (_, payload) in &self.buffered {
            for (i, byte) in parity.iter_mut().enumerate() {
                *byte ^= payload[i];
            }
        }
        let group_id = self.current_group_id;
        self.current_group_id += 1;
        self.buffered.clear();
        (group_id, Bytes::from(parity))
    }
}

struct GroupState {
    n: u32,
    data: HashMap<u32, Bytes>,
    parity: Option<Bytes>,
}

impl GroupState {
    fn missing_count(&self) -> u32 {
        let have = self.data.len() as u32 + self.parity.is_some() as u32;
        (self.n + 1).saturating_sub(have)
    }
}

/// Reassembles FEC groups keyed by `group_id` and recovers a single missing
/// slot by XOR-ing all received payloads together.
pub struct FecDecoder {
    groups: HashMap<u32, GroupState>,
    max_groups: usize,
}

impl FecDecoder {
    pub fn new(max_groups: usize) -> Self {
        FecDecoder {
            groups: HashMap::new(),
            max_groups,
        }
    }

    /// Feed a data-frame slot belonging to a FEC group.
    pub fn add_data(&mut self, group_id: u32, n: u32, fec_index: u32, payload: Bytes) {
        self.enforce_limit();
        let group = self.groups.entry(group_id).or_insert_with(|| GroupState {
            n,
            data: HashMap::new(),
            parity: None,
        });
        group.data.entry(fec_index).or_insert(payload);
    }

    /// Feed the parity slot (`fec_index == n`) belonging to a group.
    pub fn add_parity(&mut self, group_id: u32, n: u32, payload: Bytes) {
        self.enforce_limit();
        let group = self.groups.entry(group_id).or_insert_with(|| GroupState {
            n,
            data: HashMap::new(),
            parity: None,
        });
        if group.parity.is_none() {
            group.parity = Some(payload);
        }
    }

    /// Attempt to recover the missing slot of `group_id`. Returns
    /// `Ok(Some((fec_index, payload)))` if exactly one slot was missing and
    /// recovery succeeded, `Ok(None)` if the group is not yet eligible (too
    /// few slots received, or already complete), or
    /// `Err(FecUnrecoverable)` if two or more slots are missing.
    ///
    /// Recovery is best-effort: a data frame recovered here may later also
    /// arrive on the wire; the receive-side message deduplicates by
    /// sequence, so double-delivery is harmless at this layer.
    pub fn try_recover(&mut self, group_id: u32) -> Result<Option<(u32, Bytes)>, TransportError> {
        let group = match self.groups.get(&group_id) {
            Some(g) => g,
            None => return Ok(None),
        };
        let received = group.data.len() as u32 + group.parity.is_some() as u32;
        if received < group.n {
            return Ok(None);
        }
        let missing = group.missing_count();
        if missing == 0 {
            return Ok(None); // nothing to recover, group already complete
        }
        if missing > 1 {
            return Err(TransportError::FecUnrecoverable {
                group_id,
                missing,
                total: group.n + 1,
            });
        }

        // Exactly one missing slot in [0, n] (data indices 0..n, parity = n).
        let missing_index = (0..=group.n)
            .find(|&i| i == group.n && group.parity.is_none() || i < group.n && !group.data.contains_key(&i))
            .expect("exactly one missing slot must exist");

        let min_len = group
            .data
            .values()
            .map(|p| p.len())
            .chain(group.parity.as_ref().map(|p| p.len()))
            .min()
            .unwrap_or(0);

        let mut recovered = vec![0u8; min_len];
        for payload in group.data.values() {
            for (i, byte) in recovered.iter_mut().enumerate() {
                *byte ^= payload[i];
            }
        }
        if let Some(parity) = &group.parity {
            for (i, byte) in recovered.iter_mut().enumerate() {
                *byte ^= parity[i];
            }
        }

        Ok(Some((missing_index, Bytes::from(recovered))))
    }

    /// Force a verdict on `group_id` regardless of how many slots have
    /// arrived so far, and drop the group's state either way. Called when a
    /// connection decides a group will never receive more frames (the next
    /// group has started, or the connection is tearing down). Unlike
    /// [`Self::try_recover`], this can observe `missing > 1` and reports it
    /// as [`TransportError::FecUnrecoverable`] rather than silently waiting.
    pub fn expire_group(&mut self, group_id: u32) -> Result<Option<(u32, Bytes)>, TransportError> {
        let group = match self.groups.remove(&group_id) {
            Some(g) => g,
            None => return Ok(None),
        };
        let missing = group.missing_count();
        if missing == 0 {
            return Ok(None);
        }
        if missing > 1 {
            return Err(TransportError::FecUnrecoverable {
                group_id,
                missing,
                total: group.n + 1,
            });
        }
        let missing_index = (0..=group.n)
            .find(|&i| i == group.n && group.parity.is_none() || i < group.n && !group.data.contains_key(&i))
            .expect("exactly one missing slot must exist");
        let min_len = group
            .data
            .values()
            .map(|p| p.len())
            .chain(group.parity.as_ref().map(|p| p.len()))
            .min()
            .unwrap_or(0);
        let mut recovered = vec![0u8; min_len];
        for payload in group.data.values() {
            for (i, byte) in recovered.iter_mut().enumerate() {
                *byte ^= payload[i];
            }
        }
        if let Some(parity) = &group.parity {
            for (i, byte) in recovered.iter_mut().enumerate() {
                *byte ^= parity[i];
            }
        }
        Ok(Some((missing_index, Bytes::from(recovered))))
    }

    pub fn remove_group(&mut self, group_id: u32) {
        self.groups.remove(&group_id);
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn enforce_limit(&mut self) {
        while self.groups.len() >= self.max_groups {
            if let Some(&oldest) = self.groups.keys().min() {
                self.groups.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encoder_emits_parity_at_n() {
        let mut enc = FecEncoder::new(3);
        assert!(enc.add_frame(Bytes::from_static(b"aaa")).is_none());
        assert!(enc.add_frame(Bytes::from_static(b"bbb")).is_none());
        let (group_id, parity) = enc.add_frame(Bytes::from_static(b"ccc")).unwrap();
        assert_eq!(group_id, 0);
        assert_eq!(parity.len(), 3);
    }

    #[test]
    fn group_id_increases_strictly() {
        let mut enc = FecEncoder::new(2);
        enc.add_frame(Bytes::from_static(b"a1"));
        let (g0, _) = enc.add_frame(Bytes::from_static(b"a2")).unwrap();
        enc.add_frame(Bytes::from_static(b"b1"));
        let (g1, _) = enc.add_frame(Bytes::from_static(b"b2")).unwrap();
        assert!(g1 > g0);
    }

    #[test]
    fn recovers_single_missing_data_frame() {
        let n = 4u32;
        let payloads: Vec<Bytes> = (0..n)
            .map(|i| Bytes::from(vec![i as u8; 8]))
            .collect();
        let min_len = 8;
        let mut parity = vec![0u8; min_len];
        for p in &payloads {
            for (i, b) in parity.iter_mut().enumerate() {
                *b ^= p[i];
            }
        }

        let mut dec = FecDecoder::new(64);
        // Drop index 2, deliver the rest plus parity.
        for (i, p) in payloads.iter().enumerate() {
            if i == 2 {
                continue;
            }
            dec.add_data(0, n, i as u32, p.clone());
        }
        dec.add_parity(0, n, Bytes::from(parity));

        let (idx, recovered) = dec.try_recover(0).unwrap().expect("should recover");
        assert_eq!(idx, 2);
        assert_eq!(recovered, payloads[2]);
    }

    #[test]
    fn two_missing_slots_is_unrecoverable() {
        let n = 4u32;
        let mut dec = FecDecoder::new(64);
        dec.add_data(0, n, 0, Bytes::from_static(b"aaaa"));
        dec.add_data(0, n, 1, Bytes::from_static(b"bbbb"));
        // Only 2 of 5 slots present (missing indices 2, 3, and parity).
        let result = dec.try_recover(0);
        // Not yet eligible: received (2) < n (4).
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn two_missing_after_n_received_is_unrecoverable() {
        let n = 3u32;
        let mut dec = FecDecoder::new(64);
        // All N data frames present but parity never arrives, and one data
        // frame is also deliberately absent up front — simulate by only
        // inserting n-1 data frames then forcing eligibility via parity.
        dec.add_data(0, n, 0, Bytes::from_static(b"aaa"));
        dec.add_data(0, n, 1, Bytes::from_static(b"bbb"));
        dec.add_parity(0, n, Bytes::from_static(b"ccc"));
        // received = 2 data + 1 parity = 3 == n, missing = n+1-3 = 1: should recover, not error.
        let result = dec.try_recover(0).unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn mismatched_lengths_xor_over_minimum() {
        let mut dec = FecDecoder::new(64);
        let n = 2u32;
        dec.add_data(0, n, 0, Bytes::from_static(b"aaaa")); // len 4
        dec.add_parity(0, n, Bytes::from_static(b"zz")); // len 2, shorter
        let (idx, recovered) = dec.try_recover(0).unwrap().unwrap();
        assert_eq!(idx, 1);
        assert_eq!(recovered.len(), 2); // truncated to min length
    }

    #[test]
    fn complete_group_has_nothing_to_recover() {
        let n = 2u32;
        let mut dec = FecDecoder::new(64);
        dec.add_data(0, n, 0, Bytes::from_static(b"aa"));
        dec.add_data(0, n, 1, Bytes::from_static(b"bb"));
        dec.add_parity(0, n, Bytes::from_static(b"\0\0"));
        let result = dec.try_recover(0).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn expire_group_reports_unrecoverable_when_two_missing() {
        let n = 4u32;
        let mut dec = FecDecoder::new(64);
        dec.add_data(0, n, 0, Bytes::from_static(b"aaaa"));
        dec.add_data(0, n, 1, Bytes::from_static(b"bbbb"));
        // Only 2 of 5 slots ever arrived; connection gives up on the group.
        let result = dec.expire_group(0);
        assert!(matches!(
            result,
            Err(TransportError::FecUnrecoverable { missing: 2, .. })
        ));
        assert_eq!(dec.group_count(), 0); // dropped either way
    }

    #[test]
    fn expire_group_still_recovers_when_exactly_one_missing() {
        let n = 3u32;
        let mut dec = FecDecoder::new(64);
        dec.add_data(0, n, 0, Bytes::from_static(b"aaa"));
        dec.add_data(0, n, 1, Bytes::from_static(b"bbb"));
        dec.add_parity(0, n, Bytes::from_static(b"ccc"));
        let result = dec.expire_group(0).unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn enforces_generation_limit_by_evicting_oldest() {
        let mut dec = FecDecoder::new(2);
        dec.add_data(0, 4, 0, Bytes::from_static(b"a"));
        dec.add_data(1, 4, 0, Bytes::from_static(b"b"));
        dec.add_data(2, 4, 0, Bytes::from_static(b"c"));
        assert!(dec.group_count() <= 2);
    }

    proptest! {
        #[test]
        fn proptest_single_loss_recovers(n in 2u32..=8, missing_idx in 0u32..8, len in 1usize..64) {
            let missing_idx = missing_idx % n;
            let payloads: Vec<Bytes> = (0..n).map(|i| Bytes::from(vec![(i + 1) as u8; len])).collect();
            let mut parity = vec![0u8; len];
            for p in &payloads {
                for (i, b) in parity.iter_mut().enumerate() {
                    *b ^= p[i];
                }
            }
            let mut dec = FecDecoder::new(16);
            for (i, p) in payloads.iter().enumerate() {
                if i as u32 == missing_idx {
                    continue;
                }
                dec.add_data(0, n, i as u32, p.clone());
            }
            dec.add_parity(0, n, Bytes::from(parity));
            let (idx, recovered) = dec.try_recover(0).unwrap().unwrap();
            prop_assert_eq!(idx, missing_idx);
            prop_assert_eq!(recovered, payloads[missing_idx as usize]);
        }

        #[test]
        fn proptest_no_loss_no_recovery_needed(n in 2u32..=8, len in 1usize..32) {
            let payloads: Vec<Bytes> = (0..n).map(|i| Bytes::from(vec![i as u8; len])).collect();
            let mut parity = vec![0u8; len];
            for p in &payloads {
                for (i, b) in parity.iter_mut().enumerate() {
                    *b ^= p[i];
                }
            }
            let mut dec = FecDecoder::new(16);
            for (i, p) in payloads.iter().enumerate() {
                dec.add_data(0, n, i as u32, p.clone());
            }
            dec.add_parity(0, n, Bytes::from(parity));
            let result = dec.try_recover(0).unwrap();
            prop_assert!(result.is_none());
        }
    }
}
