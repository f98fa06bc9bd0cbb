use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::block::MAX_CHAIN_ID_LEN;
use crate::params::{ConsensusParams, ParamsError};
use crate::validator::{PublicKey, Validator, ValidatorSet, ValidatorSetError};
use crate::{fmt_hex, time};

#[derive(Debug, thiserror::Error)]
pub enum GenesisError {
    #[error("failed to read genesis file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse genesis file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid genesis: {0}")]
    Invalid(String),
    #[error("invalid consensus params in genesis: {0}")]
    Params(#[from] ParamsError),
    #[error("invalid validators in genesis: {0}")]
    Validators(#[from] ValidatorSetError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    #[serde(default, with = "hex_bytes")]
    pub address: Vec<u8>,
    pub pub_key: PublicKey,
    pub power: i64,
    #[serde(default)]
    pub name: String,
}

/// The initial conditions of a chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenesisDoc {
    pub genesis_time: SystemTime,
    pub chain_id: String,
    #[serde(default = "default_initial_height")]
    pub initial_height: i64,
    #[serde(default)]
    pub consensus_params: ConsensusParams,
    #[serde(default)]
    pub validators: Vec<GenesisValidator>,
    #[serde(default, with = "hex_bytes")]
    pub app_hash: Vec<u8>,
    #[serde(default)]
    pub app_state: serde_json::Value,
}

fn default_initial_height() -> i64 {
    1
}

impl GenesisDoc {
    pub fn load(path: &Path) -> Result<Self, GenesisError> {
        let bytes = std::fs::read(path)?;
        let mut doc: GenesisDoc = serde_json::from_slice(&bytes)?;
        doc.validate_and_complete()?;
        Ok(doc)
    }

    pub fn save(&self, path: &Path) -> Result<(), GenesisError> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Checks the document and fills in defaults: the initial height,
    /// validator addresses and a missing genesis time.
    pub fn validate_and_complete(&mut self) -> Result<(), GenesisError> {
        if self.chain_id.is_empty() {
            return Err(GenesisError::Invalid("chain_id is empty".into()));
        }
        if self.chain_id.len() > MAX_CHAIN_ID_LEN {
            return Err(GenesisError::Invalid(format!(
                "chain_id is longer than {MAX_CHAIN_ID_LEN} characters"
            )));
        }
        if self.initial_height < 0 {
            return Err(GenesisError::Invalid(format!(
                "initial_height cannot be negative, got {}",
                self.initial_height
            )));
        }
        if self.initial_height == 0 {
            self.initial_height = 1;
        }
        self.consensus_params.validate_basic()?;

        for (i, v) in self.validators.iter_mut().enumerate() {
            if v.power == 0 {
                return Err(GenesisError::Invalid(format!(
                    "validator {i} has no voting power"
                )));
            }
            let address = v.pub_key.address();
            if !v.address.is_empty() && v.address != address {
                return Err(GenesisError::Invalid(format!(
                    "validator {i} has address {} but its key derives {}",
                    fmt_hex(&v.address),
                    fmt_hex(&address)
                )));
            }
            v.address = address;
        }

        if self.genesis_time == SystemTime::UNIX_EPOCH {
            self.genesis_time = time::now();
        }
        Ok(())
    }

    pub fn validator_set(&self) -> Result<ValidatorSet, GenesisError> {
        let validators = self
            .validators
            .iter()
            .map(|v| Validator::new(v.pub_key, v.power))
            .collect();
        Ok(ValidatorSet::new(validators)?)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn genesis() -> GenesisDoc {
        let key = ed25519_consensus::SigningKey::from([1; 32]);
        GenesisDoc {
            genesis_time: SystemTime::UNIX_EPOCH,
            chain_id: "test-chain".into(),
            initial_height: 0,
            consensus_params: ConsensusParams::default(),
            validators: vec![GenesisValidator {
                address: Vec::new(),
                pub_key: key.verification_key().into(),
                power: 10,
                name: "alice".into(),
            }],
            app_hash: Vec::new(),
            app_state: serde_json::Value::Null,
        }
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genesis.json");
        let mut doc = genesis();
        doc.validate_and_complete().unwrap();
        doc.save(&path).unwrap();

        let loaded = GenesisDoc::load(&path).unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(loaded.initial_height, 1);
        assert_eq!(loaded.validators[0].address, doc.validators[0].pub_key.address());
        assert_eq!(loaded.validator_set().unwrap().size(), 1);
    }

    #[test]
    fn invalid_documents_are_rejected() {
        let mut doc = genesis();
        doc.chain_id.clear();
        assert_matches!(doc.validate_and_complete(), Err(GenesisError::Invalid(_)));

        let mut doc = genesis();
        doc.validators[0].power = 0;
        assert_matches!(doc.validate_and_complete(), Err(GenesisError::Invalid(_)));

        let mut doc = genesis();
        doc.validators[0].address = vec![0; 20];
        assert_matches!(doc.validate_and_complete(), Err(GenesisError::Invalid(_)));
    }
}
