use std::fmt;
use std::time::SystemTime;

use prost::Message;
use sha2::{Digest, Sha256};

use crate::evidence::{EvidenceError, EvidenceList};
use crate::merkle::{self, HASH_SIZE};
use crate::part_set::{PartSet, MAX_BLOCK_PARTS_COUNT};
use crate::validator::ADDRESS_SIZE;
use crate::{fmt_hex, time, Tx};

/// Version of the block data structures and processing rules.
pub const BLOCK_PROTOCOL: u64 = 11;

pub const MAX_CHAIN_ID_LEN: usize = 50;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("wrong {field} hash size: {size}, expected {HASH_SIZE} or empty")]
    WrongHashSize { field: &'static str, size: usize },
    #[error("part set header total {0} exceeds the maximum of {MAX_BLOCK_PARTS_COUNT}")]
    TooManyParts(u32),
    #[error("part set header with zero total must have empty hash")]
    InconsistentPartSetHeader,
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("invalid commit: {0}")]
    InvalidCommit(String),
    #[error("{field} does not match block contents: expected {expected}, got {actual}")]
    HashMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },
    #[error("invalid block id flag {0}")]
    InvalidBlockIdFlag(i32),
    // Boxed: evidence errors hold vote errors, which hold block errors.
    #[error(transparent)]
    Evidence(Box<EvidenceError>),
    #[error("failed to decode block: {0}")]
    Decode(String),
}

impl From<EvidenceError> for BlockError {
    fn from(e: EvidenceError) -> Self {
        Self::Evidence(Box::new(e))
    }
}

fn validate_hash(field: &'static str, hash: &[u8]) -> Result<(), BlockError> {
    if !hash.is_empty() && hash.len() != HASH_SIZE {
        return Err(BlockError::WrongHashSize {
            field,
            size: hash.len(),
        });
    }
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: Vec<u8>,
}

impl PartSetHeader {
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_empty()
    }

    pub fn validate_basic(&self) -> Result<(), BlockError> {
        if self.total > MAX_BLOCK_PARTS_COUNT {
            return Err(BlockError::TooManyParts(self.total));
        }
        if self.total == 0 && !self.hash.is_empty() {
            return Err(BlockError::InconsistentPartSetHeader);
        }
        validate_hash("part set", &self.hash)
    }

    pub fn to_proto(&self) -> p2p_proto::types::PartSetHeader {
        p2p_proto::types::PartSetHeader {
            total: self.total,
            hash: self.hash.clone(),
        }
    }

    pub fn from_proto(proto: p2p_proto::types::PartSetHeader) -> Self {
        Self {
            total: proto.total,
            hash: proto.hash,
        }
    }
}

impl fmt::Display for PartSetHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hash = fmt_hex(&self.hash);
        write!(f, "{}:{}", self.total, &hash[..hash.len().min(12)])
    }
}

/// Identifies a block by its hash and the header of the part set it was
/// gossiped as. The zero value identifies "nil".
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub hash: Vec<u8>,
    pub part_set_header: PartSetHeader,
}

impl BlockId {
    pub fn new(hash: Vec<u8>, part_set_header: PartSetHeader) -> Self {
        Self {
            hash,
            part_set_header,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.hash.is_empty() && self.part_set_header.is_zero()
    }

    pub fn is_complete(&self) -> bool {
        self.hash.len() == HASH_SIZE
            && self.part_set_header.total > 0
            && self.part_set_header.hash.len() == HASH_SIZE
    }

    pub fn validate_basic(&self) -> Result<(), BlockError> {
        validate_hash("block", &self.hash)?;
        self.part_set_header.validate_basic()
    }

    pub fn to_proto(&self) -> p2p_proto::types::BlockId {
        p2p_proto::types::BlockId {
            hash: self.hash.clone(),
            part_set_header: Some(self.part_set_header.to_proto()),
        }
    }

    pub fn from_proto(proto: Option<p2p_proto::types::BlockId>) -> Self {
        match proto {
            Some(proto) => Self {
                hash: proto.hash,
                part_set_header: proto
                    .part_set_header
                    .map(PartSetHeader::from_proto)
                    .unwrap_or_default(),
            },
            None => Self::default(),
        }
    }

    pub fn to_canonical(&self) -> Option<p2p_proto::types::CanonicalBlockId> {
        if self.is_nil() {
            return None;
        }
        Some(p2p_proto::types::CanonicalBlockId {
            hash: self.hash.clone(),
            part_set_header: Some(p2p_proto::types::CanonicalPartSetHeader {
                total: self.part_set_header.total,
                hash: self.part_set_header.hash.clone(),
            }),
        })
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            return f.write_str("nil");
        }
        let hash = fmt_hex(&self.hash);
        write!(f, "{}:{}", &hash[..hash.len().min(12)], self.part_set_header)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Version {
    pub block: u64,
    pub app: u64,
}

impl Default for Version {
    fn default() -> Self {
        Self {
            block: BLOCK_PROTOCOL,
            app: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: Version,
    pub chain_id: String,
    pub height: i64,
    pub time: SystemTime,
    pub last_block_id: BlockId,
    pub last_commit_hash: Vec<u8>,
    pub data_hash: Vec<u8>,
    pub validators_hash: Vec<u8>,
    pub next_validators_hash: Vec<u8>,
    pub consensus_hash: Vec<u8>,
    pub app_hash: Vec<u8>,
    pub last_results_hash: Vec<u8>,
    pub evidence_hash: Vec<u8>,
    pub proposer_address: Vec<u8>,
}

impl Header {
    /// Merkle root of the encoded header fields. Empty until the validator
    /// set hash is filled in, since such a header cannot be committed to.
    pub fn hash(&self) -> Vec<u8> {
        if self.validators_hash.is_empty() {
            return Vec::new();
        }
        let version = p2p_proto::types::ConsensusVersion {
            block: self.version.block,
            app: self.version.app,
        };
        let fields: Vec<Vec<u8>> = vec![
            version.encode_to_vec(),
            self.chain_id.as_bytes().to_vec(),
            self.height.to_be_bytes().to_vec(),
            time::to_proto(self.time).encode_to_vec(),
            self.last_block_id.to_proto().encode_to_vec(),
            self.last_commit_hash.clone(),
            self.data_hash.clone(),
            self.validators_hash.clone(),
            self.next_validators_hash.clone(),
            self.consensus_hash.clone(),
            self.app_hash.clone(),
            self.last_results_hash.clone(),
            self.evidence_hash.clone(),
            self.proposer_address.clone(),
        ];
        merkle::hash_from_byte_slices(&fields)
    }

    pub fn validate_basic(&self) -> Result<(), BlockError> {
        if self.version.block != BLOCK_PROTOCOL {
            return Err(BlockError::InvalidHeader(format!(
                "block protocol is {}, expected {BLOCK_PROTOCOL}",
                self.version.block
            )));
        }
        if self.chain_id.len() > MAX_CHAIN_ID_LEN {
            return Err(BlockError::InvalidHeader(format!(
                "chain id is too long, max {MAX_CHAIN_ID_LEN}"
            )));
        }
        if self.height <= 0 {
            return Err(BlockError::InvalidHeader(format!(
                "non-positive height {}",
                self.height
            )));
        }
        self.last_block_id.validate_basic()?;
        validate_hash("last commit", &self.last_commit_hash)?;
        validate_hash("data", &self.data_hash)?;
        validate_hash("evidence", &self.evidence_hash)?;
        validate_hash("next validators", &self.next_validators_hash)?;
        validate_hash("consensus", &self.consensus_hash)?;
        validate_hash("last results", &self.last_results_hash)?;
        if self.validators_hash.len() != HASH_SIZE {
            return Err(BlockError::WrongHashSize {
                field: "validators",
                size: self.validators_hash.len(),
            });
        }
        if self.proposer_address.len() != ADDRESS_SIZE {
            return Err(BlockError::InvalidHeader(format!(
                "proposer address has {} bytes, expected {ADDRESS_SIZE}",
                self.proposer_address.len()
            )));
        }
        Ok(())
    }

    pub fn to_proto(&self) -> p2p_proto::types::Header {
        p2p_proto::types::Header {
            version: Some(p2p_proto::types::ConsensusVersion {
                block: self.version.block,
                app: self.version.app,
            }),
            chain_id: self.chain_id.clone(),
            height: self.height,
            time: Some(time::to_proto(self.time)),
            last_block_id: Some(self.last_block_id.to_proto()),
            last_commit_hash: self.last_commit_hash.clone(),
            data_hash: self.data_hash.clone(),
            validators_hash: self.validators_hash.clone(),
            next_validators_hash: self.next_validators_hash.clone(),
            consensus_hash: self.consensus_hash.clone(),
            app_hash: self.app_hash.clone(),
            last_results_hash: self.last_results_hash.clone(),
            evidence_hash: self.evidence_hash.clone(),
            proposer_address: self.proposer_address.clone(),
        }
    }

    pub fn from_proto(proto: p2p_proto::types::Header) -> Self {
        let version = proto.version.unwrap_or_default();
        Self {
            version: Version {
                block: version.block,
                app: version.app,
            },
            chain_id: proto.chain_id,
            height: proto.height,
            time: time::from_proto(proto.time.as_ref()),
            last_block_id: BlockId::from_proto(proto.last_block_id),
            last_commit_hash: proto.last_commit_hash,
            data_hash: proto.data_hash,
            validators_hash: proto.validators_hash,
            next_validators_hash: proto.next_validators_hash,
            consensus_hash: proto.consensus_hash,
            app_hash: proto.app_hash,
            last_results_hash: proto.last_results_hash,
            evidence_hash: proto.evidence_hash,
            proposer_address: proto.proposer_address,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Data {
    pub txs: Vec<Tx>,
}

impl Data {
    pub fn hash(&self) -> Vec<u8> {
        let tx_hashes: Vec<Vec<u8>> = self
            .txs
            .iter()
            .map(|tx| Sha256::digest(tx).to_vec())
            .collect();
        merkle::hash_from_byte_slices(&tx_hashes)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockIdFlag {
    Absent,
    Commit,
    Nil,
}

impl BlockIdFlag {
    fn to_proto(self) -> p2p_proto::types::BlockIdFlag {
        match self {
            BlockIdFlag::Absent => p2p_proto::types::BlockIdFlag::Absent,
            BlockIdFlag::Commit => p2p_proto::types::BlockIdFlag::Commit,
            BlockIdFlag::Nil => p2p_proto::types::BlockIdFlag::Nil,
        }
    }

    fn from_proto(value: i32) -> Result<Self, BlockError> {
        match p2p_proto::types::BlockIdFlag::try_from(value) {
            Ok(p2p_proto::types::BlockIdFlag::Absent) => Ok(BlockIdFlag::Absent),
            Ok(p2p_proto::types::BlockIdFlag::Commit) => Ok(BlockIdFlag::Commit),
            Ok(p2p_proto::types::BlockIdFlag::Nil) => Ok(BlockIdFlag::Nil),
            _ => Err(BlockError::InvalidBlockIdFlag(value)),
        }
    }
}

/// One validator's entry in a commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitSig {
    pub block_id_flag: BlockIdFlag,
    pub validator_address: Vec<u8>,
    pub timestamp: SystemTime,
    pub signature: Vec<u8>,
}

impl CommitSig {
    pub fn absent() -> Self {
        Self {
            block_id_flag: BlockIdFlag::Absent,
            validator_address: Vec::new(),
            timestamp: SystemTime::UNIX_EPOCH,
            signature: Vec::new(),
        }
    }

    pub fn is_absent(&self) -> bool {
        self.block_id_flag == BlockIdFlag::Absent
    }

    /// The block this signature is for, given the block the commit is for.
    pub fn block_id(&self, commit_block_id: &BlockId) -> BlockId {
        match self.block_id_flag {
            BlockIdFlag::Commit => commit_block_id.clone(),
            BlockIdFlag::Absent | BlockIdFlag::Nil => BlockId::default(),
        }
    }

    pub fn validate_basic(&self) -> Result<(), BlockError> {
        match self.block_id_flag {
            BlockIdFlag::Absent => {
                if !self.validator_address.is_empty() || !self.signature.is_empty() {
                    return Err(BlockError::InvalidCommit(
                        "absent signature carries data".into(),
                    ));
                }
            }
            BlockIdFlag::Commit | BlockIdFlag::Nil => {
                if self.validator_address.len() != ADDRESS_SIZE {
                    return Err(BlockError::InvalidCommit(format!(
                        "validator address has {} bytes",
                        self.validator_address.len()
                    )));
                }
                if self.signature.is_empty() || self.signature.len() > 64 {
                    return Err(BlockError::InvalidCommit(format!(
                        "signature has {} bytes",
                        self.signature.len()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn to_proto(&self) -> p2p_proto::types::CommitSig {
        p2p_proto::types::CommitSig {
            block_id_flag: self.block_id_flag.to_proto() as i32,
            validator_address: self.validator_address.clone(),
            timestamp: Some(time::to_proto(self.timestamp)),
            signature: self.signature.clone(),
        }
    }

    pub fn from_proto(proto: p2p_proto::types::CommitSig) -> Result<Self, BlockError> {
        Ok(Self {
            block_id_flag: BlockIdFlag::from_proto(proto.block_id_flag)?,
            validator_address: proto.validator_address,
            timestamp: time::from_proto(proto.timestamp.as_ref()),
            signature: proto.signature,
        })
    }
}

/// +2/3 precommits for a block, one entry per validator of the height.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Commit {
    pub height: i64,
    pub round: i32,
    pub block_id: BlockId,
    pub signatures: Vec<CommitSig>,
}

impl Commit {
    pub fn size(&self) -> usize {
        self.signatures.len()
    }

    pub fn hash(&self) -> Vec<u8> {
        let sigs: Vec<Vec<u8>> = self
            .signatures
            .iter()
            .map(|sig| sig.to_proto().encode_to_vec())
            .collect();
        merkle::hash_from_byte_slices(&sigs)
    }

    pub fn validate_basic(&self) -> Result<(), BlockError> {
        if self.height < 0 {
            return Err(BlockError::InvalidCommit("negative height".into()));
        }
        if self.round < 0 {
            return Err(BlockError::InvalidCommit("negative round".into()));
        }
        if self.height >= 1 {
            if self.block_id.is_nil() {
                return Err(BlockError::InvalidCommit("commit cannot be for nil block".into()));
            }
            if self.signatures.is_empty() {
                return Err(BlockError::InvalidCommit("no signatures".into()));
            }
            for sig in &self.signatures {
                sig.validate_basic()?;
            }
        }
        self.block_id.validate_basic()
    }

    pub fn to_proto(&self) -> p2p_proto::types::Commit {
        p2p_proto::types::Commit {
            height: self.height,
            round: self.round,
            block_id: Some(self.block_id.to_proto()),
            signatures: self.signatures.iter().map(CommitSig::to_proto).collect(),
        }
    }

    pub fn from_proto(proto: p2p_proto::types::Commit) -> Result<Self, BlockError> {
        Ok(Self {
            height: proto.height,
            round: proto.round,
            block_id: BlockId::from_proto(proto.block_id),
            signatures: proto
                .signatures
                .into_iter()
                .map(CommitSig::from_proto)
                .collect::<Result<_, _>>()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub data: Data,
    pub evidence: EvidenceList,
    pub last_commit: Commit,
}

impl Block {
    /// Fills in the header hashes that are derived from the block contents.
    pub fn fill_header(&mut self) {
        self.header.last_commit_hash = self.last_commit.hash();
        self.header.data_hash = self.data.hash();
        self.header.evidence_hash = self.evidence.hash();
    }

    pub fn hash(&self) -> Vec<u8> {
        self.header.hash()
    }

    pub fn hashes_to(&self, hash: &[u8]) -> bool {
        !hash.is_empty() && self.hash() == hash
    }

    pub fn height(&self) -> i64 {
        self.header.height
    }

    pub fn make_part_set(&self, part_size: u32) -> PartSet {
        PartSet::from_data(&self.to_bytes(), part_size)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_proto().encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlockError> {
        let proto = p2p_proto::types::Block::decode(bytes)
            .map_err(|e| BlockError::Decode(e.to_string()))?;
        Self::from_proto(proto)
    }

    pub fn validate_basic(&self) -> Result<(), BlockError> {
        self.header.validate_basic()?;
        self.last_commit.validate_basic()?;

        let last_commit_hash = self.last_commit.hash();
        if self.header.last_commit_hash != last_commit_hash {
            return Err(BlockError::HashMismatch {
                field: "last commit hash",
                expected: fmt_hex(&last_commit_hash),
                actual: fmt_hex(&self.header.last_commit_hash),
            });
        }
        let data_hash = self.data.hash();
        if self.header.data_hash != data_hash {
            return Err(BlockError::HashMismatch {
                field: "data hash",
                expected: fmt_hex(&data_hash),
                actual: fmt_hex(&self.header.data_hash),
            });
        }
        for evidence in &self.evidence.0 {
            evidence.validate_basic()?;
        }
        let evidence_hash = self.evidence.hash();
        if self.header.evidence_hash != evidence_hash {
            return Err(BlockError::HashMismatch {
                field: "evidence hash",
                expected: fmt_hex(&evidence_hash),
                actual: fmt_hex(&self.header.evidence_hash),
            });
        }
        Ok(())
    }

    pub fn to_proto(&self) -> p2p_proto::types::Block {
        p2p_proto::types::Block {
            header: Some(self.header.to_proto()),
            data: Some(p2p_proto::types::Data {
                txs: self.data.txs.clone(),
            }),
            evidence: Some(self.evidence.to_proto()),
            last_commit: Some(self.last_commit.to_proto()),
        }
    }

    pub fn from_proto(proto: p2p_proto::types::Block) -> Result<Self, BlockError> {
        let header = proto.header.ok_or(BlockError::MissingField("header"))?;
        Ok(Self {
            header: Header::from_proto(header),
            data: Data {
                txs: proto.data.map(|data| data.txs).unwrap_or_default(),
            },
            evidence: EvidenceList::from_proto(proto.evidence.unwrap_or_default())?,
            last_commit: match proto.last_commit {
                Some(commit) => Commit::from_proto(commit)?,
                None => Commit::default(),
            },
        })
    }
}

/// What the block store keeps about a block besides its parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockMeta {
    pub block_id: BlockId,
    pub block_size: usize,
    pub header: Header,
    pub num_txs: usize,
}

impl BlockMeta {
    pub fn new(block: &Block, parts: &PartSet) -> Self {
        Self {
            block_id: BlockId::new(block.hash(), parts.header()),
            block_size: parts.byte_size(),
            header: block.header.clone(),
            num_txs: block.data.txs.len(),
        }
    }
}
