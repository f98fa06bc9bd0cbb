use std::time::Duration;

use prost::Message;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::part_set::MAX_BLOCK_SIZE_BYTES;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParamsError {
    #[error("block.max_bytes must be -1 or in (0, {MAX_BLOCK_SIZE_BYTES}], got {0}")]
    BlockMaxBytes(i64),
    #[error("block.max_gas must be >= -1, got {0}")]
    BlockMaxGas(i64),
    #[error("evidence.max_age_num_blocks must be positive, got {0}")]
    EvidenceMaxAge(i64),
    #[error("evidence.max_bytes {max_bytes} must not exceed block.max_bytes {block_max_bytes}")]
    EvidenceMaxBytes { max_bytes: i64, block_max_bytes: i64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockParams {
    /// -1 means the block size is only bounded by the maximum block size.
    pub max_bytes: i64,
    /// -1 means unlimited.
    pub max_gas: i64,
}

impl Default for BlockParams {
    fn default() -> Self {
        Self {
            max_bytes: 22_020_096,
            max_gas: -1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceParams {
    pub max_age_num_blocks: i64,
    pub max_age_duration: Duration,
    pub max_bytes: i64,
}

impl Default for EvidenceParams {
    fn default() -> Self {
        Self {
            max_age_num_blocks: 100_000,
            max_age_duration: Duration::from_secs(48 * 60 * 60),
            max_bytes: 1_048_576,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionParams {
    pub app: u64,
}

/// Consensus-critical parameters, fixed per height and changeable by the
/// application through `FinalizeBlock`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    #[serde(default)]
    pub block: BlockParams,
    #[serde(default)]
    pub evidence: EvidenceParams,
    #[serde(default)]
    pub version: VersionParams,
}

/// Partial update returned by the application. Unset sections are left as
/// they are.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsensusParamsUpdate {
    pub block: Option<BlockParams>,
    pub evidence: Option<EvidenceParams>,
    pub version: Option<VersionParams>,
}

impl ConsensusParams {
    pub fn validate_basic(&self) -> Result<(), ParamsError> {
        let max_bytes = self.block.max_bytes;
        if max_bytes == 0 || max_bytes < -1 || max_bytes > MAX_BLOCK_SIZE_BYTES {
            return Err(ParamsError::BlockMaxBytes(max_bytes));
        }
        if self.block.max_gas < -1 {
            return Err(ParamsError::BlockMaxGas(self.block.max_gas));
        }
        if self.evidence.max_age_num_blocks <= 0 {
            return Err(ParamsError::EvidenceMaxAge(self.evidence.max_age_num_blocks));
        }
        let block_max_bytes = if max_bytes == -1 {
            MAX_BLOCK_SIZE_BYTES
        } else {
            max_bytes
        };
        if self.evidence.max_bytes > block_max_bytes {
            return Err(ParamsError::EvidenceMaxBytes {
                max_bytes: self.evidence.max_bytes,
                block_max_bytes,
            });
        }
        Ok(())
    }

    /// Only the block size limits go into the hash committed to in headers.
    pub fn hash(&self) -> Vec<u8> {
        let hashed = p2p_proto::types::HashedParams {
            block_max_bytes: self.block.max_bytes,
            block_max_gas: self.block.max_gas,
        };
        Sha256::digest(hashed.encode_to_vec()).to_vec()
    }

    pub fn update(&self, update: &ConsensusParamsUpdate) -> Self {
        let mut params = self.clone();
        if let Some(block) = &update.block {
            params.block = block.clone();
        }
        if let Some(evidence) = &update.evidence {
            params.evidence = evidence.clone();
        }
        if let Some(version) = &update.version {
            params.version = version.clone();
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn default_params_are_valid() {
        assert_eq!(ConsensusParams::default().validate_basic(), Ok(()));
    }

    #[test]
    fn hash_covers_block_params_only() {
        let params = ConsensusParams::default();
        let mut other = params.clone();
        other.evidence.max_age_num_blocks = 1;
        assert_eq!(params.hash(), other.hash());
        other.block.max_gas = 10;
        assert_ne!(params.hash(), other.hash());
    }

    #[test]
    fn update_replaces_given_sections() {
        let params = ConsensusParams::default();
        let updated = params.update(&ConsensusParamsUpdate {
            block: Some(BlockParams {
                max_bytes: 1024,
                max_gas: 5,
            }),
            ..Default::default()
        });
        assert_eq!(updated.block.max_bytes, 1024);
        assert_eq!(updated.evidence, params.evidence);

        let mut invalid = updated;
        invalid.block.max_bytes = 0;
        assert_matches!(invalid.validate_basic(), Err(ParamsError::BlockMaxBytes(0)));
    }
}
