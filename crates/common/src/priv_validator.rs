//! Signers for votes and proposals.
//!
//! [`FilePrivValidator`] persists the last height, round and step it signed
//! for and refuses to sign anything that would regress or conflict with it,
//! so a restarted validator cannot double sign.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ed25519_consensus::SigningKey;
use parking_lot::Mutex;
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::proposal::Proposal;
use crate::validator::PublicKey;
use crate::vote::{Vote, VoteType};
use crate::{fmt_hex, time};

const STEP_PROPOSE: i8 = 1;
const STEP_PREVOTE: i8 = 2;
const STEP_PRECOMMIT: i8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("height regression: last signed {last}, asked to sign {height}")]
    HeightRegression { last: i64, height: i64 },
    #[error("round regression at height {height}: last signed {last}, asked to sign {round}")]
    RoundRegression { height: i64, last: i32, round: i32 },
    #[error("step regression at {height}/{round}: last signed {last}, asked to sign {step}")]
    StepRegression {
        height: i64,
        round: i32,
        last: i8,
        step: i8,
    },
    #[error("conflicting data at {height}/{round}/{step}")]
    Conflict { height: i64, round: i32, step: i8 },
    #[error("no sign bytes recorded for the last signed step")]
    MissingSignBytes,
    #[error("signing is disabled")]
    Disabled,
    #[error("failed to access signer file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed signer file {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("malformed private key")]
    MalformedKey,
}

/// Signs votes and proposals for one validator key.
pub trait PrivValidator: Send + Sync {
    fn pub_key(&self) -> PublicKey;

    /// Fills in `vote.signature`, and possibly adjusts `vote.timestamp` when
    /// re-signing an identical vote.
    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError>;

    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignerError>;
}

/// An in-memory signer without double-sign protection.
pub struct MockPrivValidator {
    key: SigningKey,
    break_proposal_signing: bool,
    break_vote_signing: bool,
}

impl MockPrivValidator {
    pub fn new(key: SigningKey) -> Self {
        Self {
            key,
            break_proposal_signing: false,
            break_vote_signing: false,
        }
    }

    pub fn random() -> Self {
        Self::new(SigningKey::new(rand::thread_rng()))
    }

    /// Makes every subsequent signing call fail.
    pub fn with_broken_signing(mut self, proposals: bool, votes: bool) -> Self {
        self.break_proposal_signing = proposals;
        self.break_vote_signing = votes;
        self
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.key
    }
}

impl PrivValidator for MockPrivValidator {
    fn pub_key(&self) -> PublicKey {
        self.key.verification_key().into()
    }

    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError> {
        if self.break_vote_signing {
            return Err(SignerError::Disabled);
        }
        vote.signature = self.key.sign(&vote.sign_bytes(chain_id)).to_bytes().to_vec();
        Ok(())
    }

    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignerError> {
        if self.break_proposal_signing {
            return Err(SignerError::Disabled);
        }
        proposal.signature = self
            .key
            .sign(&proposal.sign_bytes(chain_id))
            .to_bytes()
            .to_vec();
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    #[serde(with = "hex::serde")]
    address: Vec<u8>,
    pub_key: PublicKey,
    #[serde(with = "hex::serde")]
    priv_key: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LastSignState {
    height: i64,
    round: i32,
    step: i8,
    #[serde(with = "hex::serde")]
    signature: Vec<u8>,
    #[serde(with = "hex::serde")]
    sign_bytes: Vec<u8>,
}

impl LastSignState {
    /// Returns `true` if the request is for exactly the last signed step.
    fn check_hrs(&self, height: i64, round: i32, step: i8) -> Result<bool, SignerError> {
        if self.height > height {
            return Err(SignerError::HeightRegression {
                last: self.height,
                height,
            });
        }
        if self.height < height {
            return Ok(false);
        }
        if self.round > round {
            return Err(SignerError::RoundRegression {
                height,
                last: self.round,
                round,
            });
        }
        if self.round < round {
            return Ok(false);
        }
        if self.step > step {
            return Err(SignerError::StepRegression {
                height,
                round,
                last: self.step,
                step,
            });
        }
        if self.step < step {
            return Ok(false);
        }
        if self.sign_bytes.is_empty() {
            return Err(SignerError::MissingSignBytes);
        }
        Ok(true)
    }
}

/// A signer backed by a key file and a last-sign-state file.
pub struct FilePrivValidator {
    key: SigningKey,
    state_path: PathBuf,
    last_sign_state: Mutex<LastSignState>,
}

impl FilePrivValidator {
    /// Loads the key and state files, generating a new key and an empty
    /// state if they do not exist.
    pub fn load_or_generate(key_path: &Path, state_path: &Path) -> Result<Self, SignerError> {
        let key = if key_path.exists() {
            let file: KeyFile = read_json(key_path)?;
            let bytes: [u8; 32] = file
                .priv_key
                .try_into()
                .map_err(|_| SignerError::MalformedKey)?;
            SigningKey::from(bytes)
        } else {
            let key = SigningKey::new(rand::thread_rng());
            let pub_key = PublicKey::from(key.verification_key());
            write_json(
                key_path,
                &KeyFile {
                    address: pub_key.address(),
                    pub_key,
                    priv_key: key.to_bytes().to_vec(),
                },
            )?;
            tracing::info!(path = %key_path.display(), address = %fmt_hex(&pub_key.address()), "Generated validator key");
            key
        };

        let last_sign_state = if state_path.exists() {
            read_json(state_path)?
        } else {
            let state = LastSignState::default();
            write_json(state_path, &state)?;
            state
        };

        Ok(Self {
            key,
            state_path: state_path.to_path_buf(),
            last_sign_state: Mutex::new(last_sign_state),
        })
    }

    pub fn from_key(key: SigningKey, state_path: &Path) -> Result<Self, SignerError> {
        let last_sign_state = if state_path.exists() {
            read_json(state_path)?
        } else {
            LastSignState::default()
        };
        Ok(Self {
            key,
            state_path: state_path.to_path_buf(),
            last_sign_state: Mutex::new(last_sign_state),
        })
    }

    fn sign(
        &self,
        height: i64,
        round: i32,
        step: i8,
        sign_bytes: Vec<u8>,
        differ_only_by_timestamp: impl FnOnce(&[u8]) -> Option<SystemTime>,
    ) -> Result<(Vec<u8>, Option<SystemTime>), SignerError> {
        let mut lss = self.last_sign_state.lock();
        if lss.check_hrs(height, round, step)? {
            if lss.sign_bytes == sign_bytes {
                return Ok((lss.signature.clone(), None));
            }
            if let Some(timestamp) = differ_only_by_timestamp(&lss.sign_bytes) {
                return Ok((lss.signature.clone(), Some(timestamp)));
            }
            return Err(SignerError::Conflict {
                height,
                round,
                step,
            });
        }

        let signature = self.key.sign(&sign_bytes).to_bytes().to_vec();
        let next = LastSignState {
            height,
            round,
            step,
            signature: signature.clone(),
            sign_bytes,
        };
        write_json(&self.state_path, &next)?;
        *lss = next;
        Ok((signature, None))
    }
}

impl PrivValidator for FilePrivValidator {
    fn pub_key(&self) -> PublicKey {
        self.key.verification_key().into()
    }

    fn sign_vote(&self, chain_id: &str, vote: &mut Vote) -> Result<(), SignerError> {
        let step = match vote.vote_type {
            VoteType::Prevote => STEP_PREVOTE,
            VoteType::Precommit => STEP_PRECOMMIT,
        };
        let sign_bytes = vote.sign_bytes(chain_id);
        let new_bytes = sign_bytes.clone();
        let (signature, timestamp) = self.sign(vote.height, vote.round, step, sign_bytes, |last| {
            let mut last = p2p_proto::types::CanonicalVote::decode_length_delimited(last).ok()?;
            let mut new = p2p_proto::types::CanonicalVote::decode_length_delimited(new_bytes.as_slice()).ok()?;
            let timestamp = last.timestamp.take();
            new.timestamp = None;
            (last == new).then(|| time::from_proto(timestamp.as_ref()))
        })?;
        if let Some(timestamp) = timestamp {
            vote.timestamp = timestamp;
        }
        vote.signature = signature;
        Ok(())
    }

    fn sign_proposal(&self, chain_id: &str, proposal: &mut Proposal) -> Result<(), SignerError> {
        let sign_bytes = proposal.sign_bytes(chain_id);
        let new_bytes = sign_bytes.clone();
        let (signature, timestamp) = self.sign(
            proposal.height,
            proposal.round,
            STEP_PROPOSE,
            sign_bytes,
            |last| {
                let mut last = p2p_proto::types::CanonicalProposal::decode_length_delimited(last).ok()?;
                let mut new =
                    p2p_proto::types::CanonicalProposal::decode_length_delimited(new_bytes.as_slice()).ok()?;
                let timestamp = last.timestamp.take();
                new.timestamp = None;
                (last == new).then(|| time::from_proto(timestamp.as_ref()))
            },
        )?;
        if let Some(timestamp) = timestamp {
            proposal.timestamp = timestamp;
        }
        proposal.signature = signature;
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, SignerError> {
    let bytes = std::fs::read(path).map_err(|source| SignerError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| SignerError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes through a temporary file and a rename so a crash never leaves a
/// half-written file behind.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), SignerError> {
    let json = serde_json::to_vec_pretty(value).map_err(|source| SignerError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("tmp");
    let io_err = |source| SignerError::Io {
        path: path.to_path_buf(),
        source,
    };
    std::fs::write(&tmp, json).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::block::{BlockId, PartSetHeader};

    fn vote(height: i64, round: i32, vote_type: VoteType, block: u8) -> Vote {
        Vote {
            vote_type,
            height,
            round,
            block_id: BlockId::new(
                vec![block; 32],
                PartSetHeader {
                    total: 1,
                    hash: vec![block; 32],
                },
            ),
            timestamp: time::now(),
            validator_address: vec![0; 20],
            validator_index: 0,
            signature: Vec::new(),
        }
    }

    #[test]
    fn refuses_to_double_sign() {
        let dir = tempfile::tempdir().unwrap();
        let signer = FilePrivValidator::load_or_generate(
            &dir.path().join("key.json"),
            &dir.path().join("state.json"),
        )
        .unwrap();

        let mut first = vote(5, 0, VoteType::Prevote, 1);
        signer.sign_vote("chain", &mut first).unwrap();
        assert_eq!(first.signature.len(), 64);

        let mut conflicting = vote(5, 0, VoteType::Prevote, 2);
        assert_matches!(
            signer.sign_vote("chain", &mut conflicting),
            Err(SignerError::Conflict { height: 5, .. })
        );

        let mut regression = vote(4, 0, VoteType::Precommit, 1);
        assert_matches!(
            signer.sign_vote("chain", &mut regression),
            Err(SignerError::HeightRegression { last: 5, height: 4 })
        );

        let mut precommit = vote(5, 0, VoteType::Precommit, 1);
        signer.sign_vote("chain", &mut precommit).unwrap();
    }

    #[test]
    fn re_signing_with_new_timestamp_reuses_signature() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        let signer =
            FilePrivValidator::load_or_generate(&dir.path().join("key.json"), &state_path).unwrap();

        let mut first = vote(3, 1, VoteType::Precommit, 1);
        signer.sign_vote("chain", &mut first).unwrap();

        let mut again = first.clone();
        again.timestamp += Duration::from_secs(1);
        signer.sign_vote("chain", &mut again).unwrap();
        assert_eq!(again.signature, first.signature);
        assert_eq!(again.timestamp, first.timestamp);

        // The state survives a restart.
        drop(signer);
        let signer =
            FilePrivValidator::load_or_generate(&dir.path().join("key.json"), &state_path).unwrap();
        let mut conflicting = vote(3, 1, VoteType::Precommit, 2);
        assert_matches!(
            signer.sign_vote("chain", &mut conflicting),
            Err(SignerError::Conflict { .. })
        );
    }

    #[test]
    fn mock_signatures_verify() {
        let signer = MockPrivValidator::new(SigningKey::from([3; 32]));
        let mut v = vote(1, 0, VoteType::Prevote, 1);
        v.validator_address = signer.pub_key().address();
        signer.sign_vote("chain", &mut v).unwrap();
        v.verify("chain", &signer.pub_key()).unwrap();

        let broken = MockPrivValidator::new(SigningKey::from([3; 32])).with_broken_signing(false, true);
        assert_matches!(broken.sign_vote("chain", &mut v), Err(SignerError::Disabled));
    }
}
