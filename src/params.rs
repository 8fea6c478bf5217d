//! Versioned global parameter registry.
//!
//! Parameters are loaded once at startup from a JSON document with a
//! top-level `versions` array. Each version activates at a height and
//! stays active until the next version's activation height. The version
//! active at height `h` is the one with the greatest activation height
//! not above `h`; asking for a height below the earliest activation
//! fails.

use std::path::Path;

use bitcoin::secp256k1::PublicKey;
use bitcoin::Network;
use bitcoin::XOnlyPublicKey;
use serde::Deserialize;

use crate::error::Error;

/// Length of the commitment tag prefix in bytes.
pub const TAG_LEN: usize = 4;

/// One version of the protocol parameters. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct GlobalParams {
    /// Version number of this parameter set.
    pub version: u32,
    /// First height at which this version is active.
    pub activation_height: u64,
    /// 4-byte tag prefixing every staking commitment.
    pub tag: [u8; TAG_LEN],
    /// The covenant committee public keys.
    pub covenant_pks: Vec<PublicKey>,
    /// Number of covenant signatures required on a covenant path.
    pub covenant_quorum: u32,
    /// Minimum staking value in satoshis.
    pub min_staking_amount: u64,
    /// Maximum staking value in satoshis.
    pub max_staking_amount: u64,
    /// Minimum staking time in blocks.
    pub min_staking_time: u16,
    /// Maximum staking time in blocks.
    pub max_staking_time: u16,
    /// Depth at which a block is treated as confirmed.
    pub confirmation_depth: u16,
    /// Timelock on the unbonding output in blocks.
    pub unbonding_time: u16,
    /// Fee deducted from the staking value by an unbonding transaction.
    pub unbonding_fee: u64,
    /// Aggregate cap on confirmed staked value.
    pub staking_cap: u64,
    /// The Bitcoin network these parameters apply to.
    pub network: Network,
}

impl GlobalParams {
    /// The covenant keys in x-only form, as they appear in scripts.
    pub fn covenant_x_only_pks(&self) -> Vec<XOnlyPublicKey> {
        self.covenant_pks
            .iter()
            .map(|pk| pk.x_only_public_key().0)
            .collect()
    }
}

/// All parameter versions, ordered by activation height.
#[derive(Debug, Clone)]
pub struct ParamsVersions {
    versions: Vec<GlobalParams>,
}

impl ParamsVersions {
    /// Build a registry from already-validated versions.
    ///
    /// Versions must be non-empty with strictly increasing version
    /// numbers and activation heights.
    pub fn new(versions: Vec<GlobalParams>) -> Result<Self, Error> {
        if versions.is_empty() {
            return Err(Error::ParamsValidation(
                "at least one parameter version is required".to_string(),
            ));
        }
        for pair in versions.windows(2) {
            if pair[1].version <= pair[0].version {
                return Err(Error::ParamsValidation(format!(
                    "version numbers must be strictly increasing, got {} after {}",
                    pair[1].version, pair[0].version
                )));
            }
            if pair[1].activation_height <= pair[0].activation_height {
                return Err(Error::ParamsValidation(format!(
                    "activation heights must be strictly increasing, got {} after {}",
                    pair[1].activation_height, pair[0].activation_height
                )));
            }
        }
        for params in &versions {
            validate_version(params)?;
        }
        Ok(Self { versions })
    }

    /// The parameters active at the given height.
    pub fn params_at(&self, height: u64) -> Result<&GlobalParams, Error> {
        self.versions
            .iter()
            .rev()
            .find(|p| p.activation_height <= height)
            .ok_or(Error::NoParamsForHeight(height))
    }

    /// The registry-level activation height: the earliest version's.
    pub fn activation_height(&self) -> u64 {
        // `new` guarantees at least one version, sorted ascending.
        self.versions
            .first()
            .map(|p| p.activation_height)
            .unwrap_or_default()
    }

    /// The confirmation depth the chain follower should use: the maximum
    /// across versions, so the window is wide enough for all of them.
    pub fn confirmation_depth(&self) -> u16 {
        self.versions
            .iter()
            .map(|p| p.confirmation_depth)
            .max()
            .unwrap_or(1)
            .max(1)
    }

    /// All versions, ascending by activation height.
    pub fn versions(&self) -> &[GlobalParams] {
        &self.versions
    }
}

fn validate_version(params: &GlobalParams) -> Result<(), Error> {
    if params.covenant_pks.is_empty() {
        return Err(Error::ParamsValidation(format!(
            "version {} has no covenant keys",
            params.version
        )));
    }
    let quorum = params.covenant_quorum;
    if quorum == 0 || quorum as usize > params.covenant_pks.len() {
        return Err(Error::ParamsValidation(format!(
            "version {} has covenant quorum {} for {} keys",
            params.version,
            quorum,
            params.covenant_pks.len()
        )));
    }
    if params.min_staking_amount > params.max_staking_amount {
        return Err(Error::ParamsValidation(format!(
            "version {} has min staking amount above the max",
            params.version
        )));
    }
    if params.min_staking_time > params.max_staking_time {
        return Err(Error::ParamsValidation(format!(
            "version {} has min staking time above the max",
            params.version
        )));
    }
    if params.confirmation_depth == 0 {
        return Err(Error::ParamsValidation(format!(
            "version {} has a zero confirmation depth",
            params.version
        )));
    }
    Ok(())
}

/// Load and validate the parameters file.
///
/// The network is not part of the file; it comes from the node
/// configuration and is stamped onto every version.
pub fn load_params(path: &Path, network: Network) -> Result<ParamsVersions, Error> {
    let contents = std::fs::read_to_string(path)?;
    parse_params(&contents, network)
}

/// Parse and validate a parameters JSON document.
pub fn parse_params(contents: &str, network: Network) -> Result<ParamsVersions, Error> {
    let raw: RawParamsFile = serde_json::from_str(contents)?;
    let versions = raw
        .versions
        .into_iter()
        .map(|v| v.into_params(network))
        .collect::<Result<Vec<_>, _>>()?;
    ParamsVersions::new(versions)
}

#[derive(Debug, Deserialize)]
struct RawParamsFile {
    versions: Vec<RawParamsVersion>,
}

#[derive(Debug, Deserialize)]
struct RawParamsVersion {
    version: u32,
    activation_height: u64,
    tag: String,
    covenant_pks: Vec<String>,
    covenant_quorum: u32,
    min_staking_amount: u64,
    max_staking_amount: u64,
    min_staking_time: u16,
    max_staking_time: u16,
    confirmation_depth: u16,
    unbonding_time: u16,
    unbonding_fee: u64,
    staking_cap: u64,
}

impl RawParamsVersion {
    fn into_params(self, network: Network) -> Result<GlobalParams, Error> {
        let tag_bytes = hex::decode(&self.tag)?;
        let tag: [u8; TAG_LEN] = tag_bytes.as_slice().try_into().map_err(|_| {
            Error::ParamsValidation(format!(
                "version {} tag must be {} bytes, got {}",
                self.version,
                TAG_LEN,
                tag_bytes.len()
            ))
        })?;

        let covenant_pks = self
            .covenant_pks
            .iter()
            .map(|pk_hex| {
                let bytes = hex::decode(pk_hex)?;
                PublicKey::from_slice(&bytes).map_err(Error::from)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(GlobalParams {
            version: self.version,
            activation_height: self.activation_height,
            tag,
            covenant_pks,
            covenant_quorum: self.covenant_quorum,
            min_staking_amount: self.min_staking_amount,
            max_staking_amount: self.max_staking_amount,
            min_staking_time: self.min_staking_time,
            max_staking_time: self.max_staking_time,
            confirmation_depth: self.confirmation_depth,
            unbonding_time: self.unbonding_time,
            unbonding_fee: self.unbonding_fee,
            staking_cap: self.staking_cap,
            network,
        })
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;

    use super::*;
    use crate::testing::keys;

    fn params_json(versions: &[(u32, u64)]) -> String {
        let mut rng = rand::rngs::StdRng::seed_from_u64(99);
        let pks: Vec<String> = (0..3)
            .map(|_| hex::encode(keys::random_public_key(&mut rng).serialize()))
            .collect();

        let versions_json: Vec<String> = versions
            .iter()
            .map(|(version, activation)| {
                format!(
                    r#"{{
                        "version": {version},
                        "activation_height": {activation},
                        "tag": "62627434",
                        "covenant_pks": ["{}", "{}", "{}"],
                        "covenant_quorum": 2,
                        "min_staking_amount": 10000,
                        "max_staking_amount": 10000000,
                        "min_staking_time": 100,
                        "max_staking_time": 60000,
                        "confirmation_depth": 10,
                        "unbonding_time": 1000,
                        "unbonding_fee": 500,
                        "staking_cap": 100000000
                    }}"#,
                    pks[0], pks[1], pks[2]
                )
            })
            .collect();

        format!(r#"{{"versions": [{}]}}"#, versions_json.join(","))
    }

    #[test]
    fn parses_a_well_formed_file() {
        let registry =
            parse_params(&params_json(&[(0, 100), (1, 200)]), Network::Regtest).expect("parse");
        assert_eq!(registry.versions().len(), 2);
        assert_eq!(registry.activation_height(), 100);
        assert_eq!(registry.confirmation_depth(), 10);
        assert_eq!(registry.versions()[0].tag, *b"bbt4");
    }

    #[test]
    fn selects_the_version_active_at_a_height() {
        let registry =
            parse_params(&params_json(&[(0, 100), (1, 200)]), Network::Regtest).expect("parse");

        // Below the earliest activation there is no active version.
        assert!(matches!(
            registry.params_at(99),
            Err(Error::NoParamsForHeight(99))
        ));
        // The activation boundary belongs to the newly activated version.
        assert_eq!(registry.params_at(100).expect("active").version, 0);
        assert_eq!(registry.params_at(199).expect("active").version, 0);
        assert_eq!(registry.params_at(200).expect("active").version, 1);
        assert_eq!(registry.params_at(100_000).expect("active").version, 1);
    }

    #[test]
    fn rejects_non_increasing_activation_heights() {
        let err = parse_params(&params_json(&[(0, 200), (1, 200)]), Network::Regtest)
            .expect_err("equal activation heights must fail");
        assert!(matches!(err, Error::ParamsValidation(_)));
    }

    #[test]
    fn rejects_non_increasing_version_numbers() {
        let err = parse_params(&params_json(&[(1, 100), (1, 200)]), Network::Regtest)
            .expect_err("equal version numbers must fail");
        assert!(matches!(err, Error::ParamsValidation(_)));
    }

    #[test]
    fn rejects_a_tag_of_the_wrong_length() {
        let json = params_json(&[(0, 100)]).replace("62627434", "6262");
        let err = parse_params(&json, Network::Regtest).expect_err("short tag must fail");
        assert!(matches!(err, Error::ParamsValidation(_)));
    }

    #[test]
    fn rejects_an_unsatisfiable_quorum() {
        let json = params_json(&[(0, 100)]).replace(r#""covenant_quorum": 2"#, r#""covenant_quorum": 4"#);
        let err = parse_params(&json, Network::Regtest).expect_err("quorum above key count");
        assert!(matches!(err, Error::ParamsValidation(_)));
    }
}
