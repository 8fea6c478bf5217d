//! Staking protocol test data.
//!
//! Transactions are synthesized through the same script reconstruction
//! the classifier checks against, so generated staking and unbonding
//! transactions are recognized byte-for-byte.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::SECP256K1;
use bitcoin::transaction::Version;
use bitcoin::Amount;
use bitcoin::Network;
use bitcoin::OutPoint;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::Transaction;
use bitcoin::TxIn;
use bitcoin::TxOut;
use bitcoin::Txid;
use bitcoin::Witness;
use bitcoin::XOnlyPublicKey;

use crate::error::Error;
use crate::params::GlobalParams;
use crate::params::ParamsVersions;
use crate::staking;
use crate::storage::model::StakingRecord;
use crate::testing::keys;

/// The protocol data behind one generated staking transaction.
#[derive(Debug, Clone, Copy)]
pub struct TestStakingData {
    /// The staker's x-only public key.
    pub staker_pk: XOnlyPublicKey,
    /// The finality provider's x-only public key.
    pub finality_provider_pk: XOnlyPublicKey,
    /// The committed staking time in blocks.
    pub staking_time: u16,
    /// The staking value in satoshis.
    pub staking_value: u64,
}

/// A parameter version suitable for most tests: activates at height 100
/// with a three-key covenant committee and a quorum of two.
pub fn test_params<R: rand::Rng + ?Sized>(rng: &mut R) -> GlobalParams {
    GlobalParams {
        version: 0,
        activation_height: 100,
        tag: *b"bbt4",
        covenant_pks: (0..3).map(|_| keys::random_public_key(rng)).collect(),
        covenant_quorum: 2,
        min_staking_amount: 10_000,
        max_staking_amount: 10_000_000,
        min_staking_time: 100,
        max_staking_time: 60_000,
        confirmation_depth: 10,
        unbonding_time: 1_000,
        unbonding_fee: 500,
        staking_cap: 100_000_000,
        network: Network::Regtest,
    }
}

/// Wrap a single parameter version into a registry.
pub fn registry(params: GlobalParams) -> ParamsVersions {
    ParamsVersions::new(vec![params]).expect("test params are valid")
}

/// Random staking data within the bounds of `params`.
pub fn random_staking_data<R: rand::Rng + ?Sized>(
    rng: &mut R,
    params: &GlobalParams,
) -> TestStakingData {
    TestStakingData {
        staker_pk: keys::random_x_only_key(rng),
        finality_provider_pk: keys::random_x_only_key(rng),
        staking_time: rng.gen_range(params.min_staking_time..=params.max_staking_time),
        staking_value: rng.gen_range(params.min_staking_amount..=params.max_staking_amount),
    }
}

/// Build a staking transaction for `data`: the Taproot staking output at
/// index 0, the tagged OP_RETURN commitment at index 1.
pub fn build_staking_tx(
    params: &GlobalParams,
    data: &TestStakingData,
) -> Result<Transaction, Error> {
    let staking_output = staking::build_staking_output(
        &data.staker_pk,
        &data.finality_provider_pk,
        &params.covenant_x_only_pks(),
        params.covenant_quorum,
        data.staking_time,
        data.staking_value,
    )?;
    let commitment = TxOut {
        value: Amount::ZERO,
        script_pubkey: staking::op_return_script(
            &params.tag,
            &data.staker_pk,
            &data.finality_provider_pk,
            data.staking_time,
        ),
    };

    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        // The funding input is irrelevant to classification; derive it
        // from the staker key so distinct stakers never collide.
        input: vec![input_spending(OutPoint {
            txid: Txid::from_byte_array(data.staker_pk.serialize()),
            vout: 0,
        })],
        output: vec![staking_output, commitment],
    })
}

/// Build the valid unbonding transaction for a stored staking record.
pub fn build_unbonding_tx(
    params: &GlobalParams,
    record: &StakingRecord,
) -> Result<Transaction, Error> {
    let value = record.staking_value.saturating_sub(params.unbonding_fee);
    let output = staking::build_unbonding_output(
        &record.staker_pk,
        &record.finality_provider_pk,
        &params.covenant_x_only_pks(),
        params.covenant_quorum,
        params.unbonding_time,
        value,
    )?;

    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![input_spending(OutPoint {
            txid: record.txid,
            vout: record.staking_output_index,
        })],
        output: vec![output],
    })
}

/// Build a transaction spending `outpoint` to a fresh key, i.e. anything
/// but the unbonding path.
pub fn build_withdraw_tx<R: rand::Rng + ?Sized>(rng: &mut R, outpoint: OutPoint) -> Transaction {
    let recipient = keys::random_x_only_key(rng);
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![input_spending(outpoint)],
        output: vec![TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: ScriptBuf::new_p2tr(SECP256K1, recipient, None),
        }],
    }
}

/// A random transaction hash.
pub fn random_txid<R: rand::Rng + ?Sized>(rng: &mut R) -> Txid {
    let mut bytes = [0u8; 32];
    rng.fill_bytes(&mut bytes);
    Txid::from_byte_array(bytes)
}

/// A staking record with random identities at the given height.
pub fn random_staking_record<R: rand::Rng + ?Sized>(
    rng: &mut R,
    inclusion_height: u64,
) -> StakingRecord {
    StakingRecord {
        txid: random_txid(rng),
        staking_output_index: 0,
        inclusion_height,
        staker_pk: keys::random_x_only_key(rng),
        staking_time: 1_000,
        finality_provider_pk: keys::random_x_only_key(rng),
        staking_value: 50_000,
        is_overflow: false,
    }
}

fn input_spending(outpoint: OutPoint) -> TxIn {
    TxIn {
        previous_output: outpoint,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::ZERO,
        witness: Witness::new(),
    }
}
