//! Deposit → proposal canonicalization
//!
//! Two relayers that observe the same deposit must produce byte-identical
//! proposals, so the payload is parsed strictly against the layout of the
//! destination handler and re-encoded before hashing. Any input accepted here
//! has exactly one encoding.

use crate::codec::{self, WordReader, WordWriter};
use crate::error::DecodingError;
use crate::types::{
    ChainId, DepositRecord, HandlerKind, HandlerRef, ProposalKey, ProposalPayload,
    ResourceRegistry,
};

/// Largest recipient accepted in a transfer payload (bytes)
pub const MAX_RECIPIENT_LEN: usize = 64;

/// Decoded handler payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerPayload {
    Fungible {
        amount: [u8; 32],
        recipient: Vec<u8>,
    },
    NonFungible {
        token_id: [u8; 32],
        recipient: Vec<u8>,
        metadata: Vec<u8>,
    },
    Generic {
        metadata: Vec<u8>,
    },
}

impl HandlerPayload {
    pub fn decode(kind: HandlerKind, data: &[u8]) -> Result<Self, DecodingError> {
        let mut reader = WordReader::new("handler payload", data);
        let payload = match kind {
            HandlerKind::Fungible => {
                let amount = reader.read_word()?;
                let recipient = read_recipient(&mut reader)?;
                HandlerPayload::Fungible { amount, recipient }
            }
            HandlerKind::NonFungible => {
                let token_id = reader.read_word()?;
                let recipient = read_recipient(&mut reader)?;
                let metadata = reader.read_bytes()?;
                HandlerPayload::NonFungible {
                    token_id,
                    recipient,
                    metadata,
                }
            }
            HandlerKind::Generic => HandlerPayload::Generic {
                metadata: reader.read_bytes()?,
            },
        };
        reader.finish()?;
        Ok(payload)
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            HandlerPayload::Fungible { amount, recipient } => {
                WordWriter::new().word(amount).bytes(recipient).finish()
            }
            HandlerPayload::NonFungible {
                token_id,
                recipient,
                metadata,
            } => WordWriter::new()
                .word(token_id)
                .bytes(recipient)
                .bytes(metadata)
                .finish(),
            HandlerPayload::Generic { metadata } => WordWriter::new().bytes(metadata).finish(),
        }
    }

    /// Fungible payload with a u128 amount
    pub fn fungible(amount: u128, recipient: &[u8]) -> Self {
        let mut word = [0u8; 32];
        word[16..].copy_from_slice(&amount.to_be_bytes());
        HandlerPayload::Fungible {
            amount: word,
            recipient: recipient.to_vec(),
        }
    }
}

fn read_recipient(reader: &mut WordReader<'_>) -> Result<Vec<u8>, DecodingError> {
    let recipient = reader.read_bytes()?;
    if recipient.is_empty() || recipient.len() > MAX_RECIPIENT_LEN {
        return Err(DecodingError::Invalid {
            what: "recipient",
            reason: format!("length {} outside 1..={}", recipient.len(), MAX_RECIPIENT_LEN),
        });
    }
    Ok(recipient)
}

/// Builds proposals for one destination chain
#[derive(Debug, Clone)]
pub struct ProposalBuilder {
    chain_id: ChainId,
    registry: ResourceRegistry,
}

impl ProposalBuilder {
    pub fn new(chain_id: ChainId, registry: ResourceRegistry) -> Self {
        Self { chain_id, registry }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn handler(&self, key: &ProposalKey) -> Option<&HandlerRef> {
        self.registry.get(&key.resource_id)
    }

    /// Map a deposit to its proposal key and canonical payload.
    ///
    /// Pure: depends only on the record and the (immutable) registry.
    pub fn build(
        &self,
        record: &DepositRecord,
    ) -> Result<(ProposalKey, ProposalPayload), DecodingError> {
        if record.destination_chain_id != self.chain_id {
            return Err(DecodingError::Invalid {
                what: "deposit destination",
                reason: format!(
                    "deposit for chain {} routed to chain {}",
                    record.destination_chain_id, self.chain_id
                ),
            });
        }

        let handler =
            self.registry
                .get(&record.resource_id)
                .ok_or(DecodingError::UnknownResource {
                    resource: record.resource_id,
                    chain_id: self.chain_id,
                })?;

        let data = HandlerPayload::decode(handler.kind, &record.payload)?.encode();
        let hash = codec::keccak256_concat(&[&handler.address, &data]);

        Ok((record.proposal_key(), ProposalPayload { data, hash }))
    }
}
