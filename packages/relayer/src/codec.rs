//! Word-aligned encodings shared with the bridge contracts
//!
//! Every value is laid out in 32-byte big-endian words, the same way the
//! contracts' `abi.encode` does it. Integers occupy the low bytes of their
//! word; variable-length byte strings are a length word followed by the
//! data right-padded with zeros to a word boundary.

use std::collections::BTreeSet;

use tiny_keccak::{Hasher, Keccak};

use crate::error::DecodingError;
use crate::types::{
    ChainId, DepositRecord, EventOrigin, Hash32, ProposalKey, ProposalState, ProposalStatus,
    RawEvent, RelayerIdentity, ResourceId,
};

pub const WORD: usize = 32;

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// keccak256 over several slices without concatenating them first
pub fn keccak256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    for part in parts {
        hasher.update(part);
    }
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Convert bytes to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(WORD) * WORD
}

/// Sequential reader over 32-byte words
pub struct WordReader<'a> {
    data: &'a [u8],
    offset: usize,
    what: &'static str,
}

impl<'a> WordReader<'a> {
    pub fn new(what: &'static str, data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            what,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodingError> {
        if self.remaining() < len {
            return Err(DecodingError::Length {
                what: self.what,
                expected: self.offset + len,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    pub fn read_word(&mut self) -> Result<[u8; 32], DecodingError> {
        let mut word = [0u8; 32];
        word.copy_from_slice(self.take(WORD)?);
        Ok(word)
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodingError> {
        let word = self.read_word()?;
        if word[..24].iter().any(|b| *b != 0) {
            return Err(DecodingError::Overflow {
                what: self.what,
                target: "u64",
            });
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&word[24..]);
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodingError> {
        let value = self.read_u64()?;
        u32::try_from(value).map_err(|_| DecodingError::Overflow {
            what: self.what,
            target: "u32",
        })
    }

    pub fn read_u128(&mut self) -> Result<u128, DecodingError> {
        let word = self.read_word()?;
        if word[..16].iter().any(|b| *b != 0) {
            return Err(DecodingError::Overflow {
                what: self.what,
                target: "u128",
            });
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&word[16..]);
        Ok(u128::from_be_bytes(bytes))
    }

    /// Length word followed by right-padded data. Non-zero padding is rejected
    /// so that every byte string has exactly one encoding.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, DecodingError> {
        let len = self.read_u64()? as usize;
        if len > self.remaining() || padded_len(len) > self.remaining() {
            return Err(DecodingError::Length {
                what: self.what,
                expected: self.offset.saturating_add(len),
                actual: self.data.len(),
            });
        }
        let chunk = self.take(padded_len(len))?;
        if chunk[len..].iter().any(|b| *b != 0) {
            return Err(DecodingError::Invalid {
                what: self.what,
                reason: "non-zero padding".to_string(),
            });
        }
        Ok(chunk[..len].to_vec())
    }

    /// Fails if any bytes are left unread
    pub fn finish(self) -> Result<(), DecodingError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DecodingError::Length {
                what: self.what,
                expected: self.offset,
                actual: self.data.len(),
            })
        }
    }
}

/// Builder for word-aligned byte strings
#[derive(Default)]
pub struct WordWriter {
    buf: Vec<u8>,
}

impl WordWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn word(mut self, word: &[u8; 32]) -> Self {
        self.buf.extend_from_slice(word);
        self
    }

    pub fn u64(self, value: u64) -> Self {
        let mut word = [0u8; 32];
        word[24..].copy_from_slice(&value.to_be_bytes());
        self.word(&word)
    }

    pub fn u128(self, value: u128) -> Self {
        let mut word = [0u8; 32];
        word[16..].copy_from_slice(&value.to_be_bytes());
        self.word(&word)
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        self = self.u64(data.len() as u64);
        self.buf.extend_from_slice(data);
        self.buf.resize(self.buf.len() + padded_len(data.len()) - data.len(), 0);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Storage key of a proposal on the destination bridge:
/// keccak256(word(src) ‖ word(dst) ‖ word(nonce) ‖ resourceId)
pub fn proposal_storage_key(key: &ProposalKey) -> Hash32 {
    let data = WordWriter::new()
        .u64(key.source_chain_id.0)
        .u64(key.destination_chain_id.0)
        .u64(key.deposit_nonce)
        .word(key.resource_id.as_bytes())
        .finish();
    keccak256(&data)
}

/// Encode the data of a `Deposit` event:
/// word(destination) ‖ resourceId ‖ word(nonce) ‖ bytes(payload)
pub fn encode_deposit_event(
    destination: ChainId,
    resource_id: &ResourceId,
    nonce: u64,
    payload: &[u8],
) -> Vec<u8> {
    WordWriter::new()
        .u64(destination.0)
        .word(resource_id.as_bytes())
        .u64(nonce)
        .bytes(payload)
        .finish()
}

/// Decode a raw `Deposit` event observed on `source`
pub fn decode_deposit_event(
    source: ChainId,
    event: &RawEvent,
) -> Result<DepositRecord, DecodingError> {
    if !event.is_deposit() {
        return Err(DecodingError::Invalid {
            what: "deposit event",
            reason: format!("unexpected event kind {}", event.kind),
        });
    }

    let mut reader = WordReader::new("deposit event", &event.data);
    let destination = ChainId(reader.read_u64()?);
    let resource_id = ResourceId(reader.read_word()?);
    let deposit_nonce = reader.read_u64()?;
    let payload = reader.read_bytes()?;
    reader.finish()?;

    Ok(DepositRecord {
        source_chain_id: source,
        destination_chain_id: destination,
        resource_id,
        deposit_nonce,
        payload,
        origin: EventOrigin {
            block_height: event.block_height,
            block_hash: event.block_hash,
            event_index: event.event_index,
            tx_ref: event.tx_ref.clone(),
        },
    })
}

/// Encode a proposal state blob as returned by `query_state`:
/// word(status) ‖ word(votes) ‖ word(threshold) ‖ payloadHash ‖ word(n) ‖ n voter words
pub fn encode_proposal_state(state: &ProposalState) -> Vec<u8> {
    let mut writer = WordWriter::new()
        .u64(state.status.code() as u64)
        .u64(state.vote_count as u64)
        .u64(state.threshold as u64)
        .word(&state.payload_hash.unwrap_or([0u8; 32]))
        .u64(state.voters.len() as u64);
    for voter in &state.voters {
        writer = writer.word(&voter.0);
    }
    writer.finish()
}

/// Decode a proposal state blob. An empty blob means the proposal does not
/// exist yet and decodes to `Inactive` with the given fallback threshold.
pub fn decode_proposal_state(
    data: &[u8],
    fallback_threshold: u32,
) -> Result<ProposalState, DecodingError> {
    if data.is_empty() {
        return Ok(ProposalState::inactive(fallback_threshold));
    }

    let mut reader = WordReader::new("proposal state", data);
    let code = reader.read_u64()?;
    let status = ProposalStatus::from_code(code).ok_or_else(|| DecodingError::Invalid {
        what: "proposal state",
        reason: format!("unknown status code {}", code),
    })?;
    let vote_count = reader.read_u32()?;
    let threshold = reader.read_u32()?;
    let hash_word = reader.read_word()?;
    let payload_hash = if hash_word == [0u8; 32] {
        None
    } else {
        Some(hash_word)
    };

    let voter_count = reader.read_u64()? as usize;
    if voter_count.checked_mul(WORD) != Some(reader.remaining()) {
        return Err(DecodingError::Length {
            what: "proposal voters",
            expected: voter_count.saturating_mul(WORD),
            actual: reader.remaining(),
        });
    }
    let mut voters = BTreeSet::new();
    for _ in 0..voter_count {
        voters.insert(RelayerIdentity(reader.read_word()?));
    }
    reader.finish()?;

    if vote_count as usize > voters.len() {
        return Err(DecodingError::Invalid {
            what: "proposal state",
            reason: format!(
                "vote count {} exceeds {} distinct voters",
                vote_count,
                voters.len()
            ),
        });
    }

    Ok(ProposalState {
        status,
        vote_count,
        threshold,
        voters,
        payload_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ProposalKey {
        ProposalKey {
            source_chain_id: ChainId(0),
            destination_chain_id: ChainId(1),
            deposit_nonce: 42,
            resource_id: ResourceId([7u8; 32]),
        }
    }

    #[test]
    fn test_keccak256() {
        let result = keccak256(b"hello");
        assert_eq!(
            bytes32_to_hex(&result),
            "0x1c8aff950685c2ed4bc3174f3472287b56d9517b9c948127319a09a7a36deac8"
        );
        assert_eq!(keccak256_concat(&[b"hel", b"lo"]), result);
    }

    #[test]
    fn test_storage_key_depends_on_every_field() {
        let base = proposal_storage_key(&key());
        assert_eq!(base, proposal_storage_key(&key()));

        let mut other = key();
        other.deposit_nonce = 43;
        assert_ne!(base, proposal_storage_key(&other));

        let mut other = key();
        other.source_chain_id = ChainId(5);
        assert_ne!(base, proposal_storage_key(&other));

        let mut other = key();
        other.resource_id = ResourceId([8u8; 32]);
        assert_ne!(base, proposal_storage_key(&other));
    }

    #[test]
    fn test_decode_deposit_event() {
        let resource = ResourceId([7u8; 32]);
        let event = RawEvent {
            block_height: 100,
            block_hash: [1u8; 32],
            event_index: 3,
            tx_ref: "0xabc".to_string(),
            kind: RawEvent::DEPOSIT.to_string(),
            data: encode_deposit_event(ChainId(1), &resource, 42, b"payload"),
        };
        // 3 fixed words + length word + one padded data word
        assert_eq!(event.data.len(), 5 * WORD);

        let record = decode_deposit_event(ChainId(0), &event).unwrap();
        assert_eq!(record.proposal_key(), key());
        assert_eq!(record.payload, b"payload");
        assert_eq!(record.origin.block_height, 100);
        assert_eq!(record.origin.event_index, 3);
    }

    #[test]
    fn test_decode_deposit_event_rejects_garbage() {
        let mut event = RawEvent {
            block_height: 1,
            block_hash: [0u8; 32],
            event_index: 0,
            tx_ref: String::new(),
            kind: RawEvent::DEPOSIT.to_string(),
            data: vec![0u8; 40],
        };
        assert!(matches!(
            decode_deposit_event(ChainId(0), &event),
            Err(DecodingError::Length { .. })
        ));

        // Trailing bytes after the payload
        let mut data = encode_deposit_event(ChainId(1), &ResourceId([7u8; 32]), 1, b"x");
        data.extend_from_slice(&[0u8; 32]);
        event.data = data;
        assert!(decode_deposit_event(ChainId(0), &event).is_err());

        // Dirty padding
        let mut data = encode_deposit_event(ChainId(1), &ResourceId([7u8; 32]), 1, b"x");
        let last = data.len() - 1;
        data[last] = 0xff;
        event.data = data;
        assert!(matches!(
            decode_deposit_event(ChainId(0), &event),
            Err(DecodingError::Invalid { .. })
        ));

        // Destination that does not fit a u64
        let mut data = encode_deposit_event(ChainId(1), &ResourceId([7u8; 32]), 1, b"x");
        data[0] = 1;
        event.data = data;
        assert!(matches!(
            decode_deposit_event(ChainId(0), &event),
            Err(DecodingError::Overflow { .. })
        ));
    }

    #[test]
    fn test_decode_empty_state_is_inactive() {
        let state = decode_proposal_state(&[], 3).unwrap();
        assert_eq!(state.status, ProposalStatus::Inactive);
        assert_eq!(state.threshold, 3);
        assert!(state.voters.is_empty());
    }

    #[test]
    fn test_proposal_state_blob() {
        let mut state = ProposalState::inactive(2);
        state.status = ProposalStatus::Active;
        state.vote_count = 1;
        state.voters.insert(RelayerIdentity([9u8; 32]));
        state.payload_hash = Some([4u8; 32]);

        let decoded = decode_proposal_state(&encode_proposal_state(&state), 0).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_state_vote_count_bounded_by_voters() {
        let mut state = ProposalState::inactive(2);
        state.status = ProposalStatus::Active;
        state.vote_count = 2;
        state.voters.insert(RelayerIdentity([9u8; 32]));

        let err = decode_proposal_state(&encode_proposal_state(&state), 0).unwrap_err();
        assert!(matches!(err, DecodingError::Invalid { .. }));
    }

    #[test]
    fn test_state_unknown_status() {
        let data = WordWriter::new()
            .u64(9)
            .u64(0)
            .u64(1)
            .word(&[0u8; 32])
            .u64(0)
            .finish();
        assert!(decode_proposal_state(&data, 1).is_err());
    }
}
