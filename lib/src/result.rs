use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// First four bytes of `seal_bytes`, identifying the seal encoding.
pub const SEAL_MAGIC: [u8; 4] = *b"RZVM";

pub const SEAL_BYTES_LEN: usize = 260;
pub const JOURNAL_LEN: usize = 192;
/// `seal_bytes || journal || image_id || binding_value || nullifier_seed`.
pub const PRIVATE_WIRE_LEN: usize = SEAL_BYTES_LEN + JOURNAL_LEN + 32 + 32 + 32;
/// Upper bound on the opaque result payload of a public completion.
pub const MAX_RESULT_DATA_LEN: usize = 64;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("wire length mismatch: expected {expected}, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("seal magic mismatch: got {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("result data exceeds {MAX_RESULT_DATA_LEN} bytes: got {0}")]
    OversizedResultData(usize),
}

/// Public completion payload: a 32-byte proof hash plus an optional
/// opaque result blob of at most [`MAX_RESULT_DATA_LEN`] bytes.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
pub struct PublicResult {
    pub proof_hash: B256,
    pub result_data: Vec<u8>,
}

impl PublicResult {
    pub fn new(proof_hash: B256, result_data: Vec<u8>) -> Result<Self, WireError> {
        if result_data.len() > MAX_RESULT_DATA_LEN {
            return Err(WireError::OversizedResultData(result_data.len()));
        }
        Ok(Self {
            proof_hash,
            result_data,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.result_data.len());
        out.extend_from_slice(self.proof_hash.as_slice());
        out.extend_from_slice(&self.result_data);
        out
    }
}

/// Private completion payload, carried to the program byte-for-byte as
/// `seal_bytes:260 || journal:192 || image_id:32 || binding_value:32 ||
/// nullifier_seed:32`.
#[serde_as]
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
pub struct PrivateProofBundle {
    #[serde_as(as = "serde_with::Bytes")]
    pub seal_bytes: [u8; SEAL_BYTES_LEN],
    #[serde_as(as = "serde_with::Bytes")]
    pub journal: [u8; JOURNAL_LEN],
    pub image_id: B256,
    pub binding_value: B256,
    pub nullifier_seed: B256,
}

impl PrivateProofBundle {
    pub fn new(
        seal_bytes: [u8; SEAL_BYTES_LEN],
        journal: [u8; JOURNAL_LEN],
        image_id: B256,
        binding_value: B256,
        nullifier_seed: B256,
    ) -> Result<Self, WireError> {
        let bundle = Self {
            seal_bytes,
            journal,
            image_id,
            binding_value,
            nullifier_seed,
        };
        bundle.check_magic()?;
        Ok(bundle)
    }

    fn check_magic(&self) -> Result<(), WireError> {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&self.seal_bytes[..4]);
        if magic != SEAL_MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PRIVATE_WIRE_LEN);
        out.extend_from_slice(&self.seal_bytes);
        out.extend_from_slice(&self.journal);
        out.extend_from_slice(self.image_id.as_slice());
        out.extend_from_slice(self.binding_value.as_slice());
        out.extend_from_slice(self.nullifier_seed.as_slice());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != PRIVATE_WIRE_LEN {
            return Err(WireError::Length {
                expected: PRIVATE_WIRE_LEN,
                actual: bytes.len(),
            });
        }
        let mut seal_bytes = [0u8; SEAL_BYTES_LEN];
        seal_bytes.copy_from_slice(&bytes[..SEAL_BYTES_LEN]);
        let mut journal = [0u8; JOURNAL_LEN];
        let mut at = SEAL_BYTES_LEN;
        journal.copy_from_slice(&bytes[at..at + JOURNAL_LEN]);
        at += JOURNAL_LEN;
        let image_id = B256::from_slice(&bytes[at..at + 32]);
        at += 32;
        let binding_value = B256::from_slice(&bytes[at..at + 32]);
        at += 32;
        let nullifier_seed = B256::from_slice(&bytes[at..at + 32]);
        Self::new(seal_bytes, journal, image_id, binding_value, nullifier_seed)
    }
}

/// Outcome of a task handler: either a public result or a private proof
/// bundle. The variant decides which completion operation the scheduler
/// invokes; the `RZVM` magic inside `seal_bytes` stays a wire-level
/// discriminator for callers that interoperate without a type tag.
#[derive(PartialEq, Debug, Clone, Deserialize, Serialize, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
    Public(PublicResult),
    Private(Box<PrivateProofBundle>),
}

impl ExecutionResult {
    pub fn is_private(&self) -> bool {
        matches!(self, ExecutionResult::Private(_))
    }
}
