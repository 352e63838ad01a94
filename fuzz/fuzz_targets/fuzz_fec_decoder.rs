#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use strata_quicdgram::fec::FecDecoder;

/// Fuzz the FEC group decoder with arbitrary slot/parity submissions. An
/// attacker controls every field an inbound FEC frame carries — group id,
/// slot index, and declared group size — so none of those combinations may
/// panic or leak memory across groups.
fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let group_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let mut decoder = FecDecoder::new(64);
    let mut offset = 4usize;
    while offset + 3 <= data.len() {
        let n = (data[offset] % 16) as u32 + 1;
        let slot = data[offset + 1] as u32;
        let payload_len = data[offset + 2] as usize;
        offset += 3;
        let end = (offset + payload_len).min(data.len());
        let payload = Bytes::copy_from_slice(&data[offset..end]);
        offset = end;
        if slot == n {
            decoder.add_parity(group_id, n, payload);
        } else {
            decoder.add_data(group_id, n, slot, payload);
        }
        let _ = decoder.try_recover(group_id);
    }
});
