//! Staking script reconstruction and commitment parsing.
//!
//! A staking transaction commits to its protocol data twice: once in an
//! `OP_RETURN` output carrying a tag-prefixed record, and once in a
//! Taproot output whose script tree encodes the protocol's spend rules.
//! This module rebuilds the expected Taproot outputs from first
//! principles so that classification can compare byte-for-byte against
//! what is on chain.
//!
//! The staking output commits to three script paths:
//!
//! 1. timelock: the staker alone, after the staking time has passed,
//! 2. unbonding: the staker together with a covenant quorum,
//! 3. slashing: the staker, the finality provider and a covenant quorum.
//!
//! The unbonding output keeps the timelock path (with the unbonding time)
//! and the slashing path. Both outputs use an unspendable internal key,
//! so the script paths are the only way to spend them.

use bitcoin::opcodes::all::OP_CHECKSIG;
use bitcoin::opcodes::all::OP_CHECKSIGADD;
use bitcoin::opcodes::all::OP_CHECKSIGVERIFY;
use bitcoin::opcodes::all::OP_CSV;
use bitcoin::opcodes::all::OP_NUMEQUAL;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::script::Builder;
use bitcoin::script::Instruction;
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::SECP256K1;
use bitcoin::taproot::TaprootBuilder;
use bitcoin::Amount;
use bitcoin::Script;
use bitcoin::ScriptBuf;
use bitcoin::Transaction;
use bitcoin::TxOut;
use bitcoin::XOnlyPublicKey;

use crate::error::Error;
use crate::params::GlobalParams;
use crate::params::TAG_LEN;

/// The only commitment version this indexer understands.
pub const COMMITMENT_VERSION: u8 = 0;

/// Length of the OP_RETURN payload: tag, version byte, two x-only keys
/// and a big-endian staking time.
pub const OP_RETURN_PAYLOAD_LEN: usize = TAG_LEN + 1 + 32 + 32 + 2;

/// The BIP-341 "nothing up my sleeve" point. Taking it as the internal
/// key makes the key path provably unspendable.
const UNSPENDABLE_INTERNAL_KEY: [u8; 32] = [
    0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9, 0x7a,
    0x5e, 0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce, 0x80,
    0x3a, 0xc0,
];

/// The decoded OP_RETURN commitment of a staking transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpReturnData {
    /// Commitment format version.
    pub version: u8,
    /// The staker's x-only public key.
    pub staker_pk: XOnlyPublicKey,
    /// The finality provider's x-only public key.
    pub finality_provider_pk: XOnlyPublicKey,
    /// The staking time in blocks.
    pub staking_time: u16,
}

/// A fully recognized staking transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedStakingTx {
    /// Index of the Taproot staking output within the transaction.
    pub staking_output_index: u32,
    /// Value of the staking output in satoshis.
    pub staking_value: u64,
    /// The staker's x-only public key.
    pub staker_pk: XOnlyPublicKey,
    /// The finality provider's x-only public key.
    pub finality_provider_pk: XOnlyPublicKey,
    /// The staking time in blocks.
    pub staking_time: u16,
}

/// Try to recognize `tx` as a staking transaction under `params`.
///
/// Returns `Ok(None)` when the transaction carries no tagged commitment,
/// the commitment does not decode, or no output matches the
/// reconstructed staking script. Script reconstruction failures are
/// parameter errors and propagate.
pub fn try_parse_staking_tx(
    tx: &Transaction,
    params: &GlobalParams,
) -> Result<Option<ParsedStakingTx>, Error> {
    let Some(data) = extract_op_return_data(tx, &params.tag) else {
        return Ok(None);
    };

    let expected_script = build_staking_script_pubkey(
        &data.staker_pk,
        &data.finality_provider_pk,
        &params.covenant_x_only_pks(),
        params.covenant_quorum,
        data.staking_time,
    )?;

    let staking_output = tx
        .output
        .iter()
        .enumerate()
        .filter(|(_, out)| !out.script_pubkey.is_op_return())
        .find(|(_, out)| out.script_pubkey == expected_script);

    let Some((index, output)) = staking_output else {
        return Ok(None);
    };

    Ok(Some(ParsedStakingTx {
        staking_output_index: index as u32,
        staking_value: output.value.to_sat(),
        staker_pk: data.staker_pk,
        finality_provider_pk: data.finality_provider_pk,
        staking_time: data.staking_time,
    }))
}

/// Decode the commitment from the first tag-prefixed OP_RETURN output.
///
/// Later OP_RETURN outputs are never considered, even when the first one
/// fails to decode.
pub fn extract_op_return_data(tx: &Transaction, tag: &[u8; TAG_LEN]) -> Option<OpReturnData> {
    let payload = tx
        .output
        .iter()
        .filter_map(|out| op_return_payload(&out.script_pubkey))
        .find(|payload| payload.len() >= TAG_LEN && &payload[..TAG_LEN] == tag)?;

    decode_commitment(payload)
}

/// The single pushed payload of an `OP_RETURN <data>` script.
fn op_return_payload(script: &Script) -> Option<&[u8]> {
    let mut instructions = script.instructions();
    let first = instructions.next()?.ok()?;
    let second = instructions.next()?.ok()?;
    if instructions.next().is_some() {
        return None;
    }
    match (first, second) {
        (Instruction::Op(op), Instruction::PushBytes(push)) if op == OP_RETURN => {
            Some(push.as_bytes())
        }
        _ => None,
    }
}

fn decode_commitment(payload: &[u8]) -> Option<OpReturnData> {
    if payload.len() != OP_RETURN_PAYLOAD_LEN {
        return None;
    }
    let version = payload[TAG_LEN];
    if version != COMMITMENT_VERSION {
        return None;
    }
    let staker_pk = XOnlyPublicKey::from_slice(&payload[TAG_LEN + 1..TAG_LEN + 33]).ok()?;
    let finality_provider_pk =
        XOnlyPublicKey::from_slice(&payload[TAG_LEN + 33..TAG_LEN + 65]).ok()?;
    let staking_time =
        u16::from_be_bytes([payload[TAG_LEN + 65], payload[TAG_LEN + 66]]);

    Some(OpReturnData {
        version,
        staker_pk,
        finality_provider_pk,
        staking_time,
    })
}

/// Build the OP_RETURN commitment script for a staking transaction.
pub fn op_return_script(
    tag: &[u8; TAG_LEN],
    staker_pk: &XOnlyPublicKey,
    finality_provider_pk: &XOnlyPublicKey,
    staking_time: u16,
) -> ScriptBuf {
    let mut payload = Vec::with_capacity(OP_RETURN_PAYLOAD_LEN);
    payload.extend_from_slice(tag);
    payload.push(COMMITMENT_VERSION);
    payload.extend_from_slice(&staker_pk.serialize());
    payload.extend_from_slice(&finality_provider_pk.serialize());
    payload.extend_from_slice(&staking_time.to_be_bytes());

    let push = PushBytesBuf::try_from(payload)
        .expect("a 71-byte commitment payload is a valid script push");
    ScriptBuf::new_op_return(push)
}

/// Build the expected staking output script.
pub fn build_staking_script_pubkey(
    staker_pk: &XOnlyPublicKey,
    finality_provider_pk: &XOnlyPublicKey,
    covenant_pks: &[XOnlyPublicKey],
    covenant_quorum: u32,
    staking_time: u16,
) -> Result<ScriptBuf, Error> {
    let leaves = vec![
        timelock_script(staker_pk, staking_time),
        unbonding_path_script(staker_pk, covenant_pks, covenant_quorum)?,
        slashing_path_script(staker_pk, finality_provider_pk, covenant_pks, covenant_quorum)?,
    ];
    taproot_script_pubkey(leaves)
}

/// Build the expected staking output (value + script).
pub fn build_staking_output(
    staker_pk: &XOnlyPublicKey,
    finality_provider_pk: &XOnlyPublicKey,
    covenant_pks: &[XOnlyPublicKey],
    covenant_quorum: u32,
    staking_time: u16,
    value: u64,
) -> Result<TxOut, Error> {
    Ok(TxOut {
        value: Amount::from_sat(value),
        script_pubkey: build_staking_script_pubkey(
            staker_pk,
            finality_provider_pk,
            covenant_pks,
            covenant_quorum,
            staking_time,
        )?,
    })
}

/// Build the expected unbonding output script.
pub fn build_unbonding_script_pubkey(
    staker_pk: &XOnlyPublicKey,
    finality_provider_pk: &XOnlyPublicKey,
    covenant_pks: &[XOnlyPublicKey],
    covenant_quorum: u32,
    unbonding_time: u16,
) -> Result<ScriptBuf, Error> {
    let leaves = vec![
        timelock_script(staker_pk, unbonding_time),
        slashing_path_script(staker_pk, finality_provider_pk, covenant_pks, covenant_quorum)?,
    ];
    taproot_script_pubkey(leaves)
}

/// Build the expected unbonding output (value + script).
pub fn build_unbonding_output(
    staker_pk: &XOnlyPublicKey,
    finality_provider_pk: &XOnlyPublicKey,
    covenant_pks: &[XOnlyPublicKey],
    covenant_quorum: u32,
    unbonding_time: u16,
    value: u64,
) -> Result<TxOut, Error> {
    Ok(TxOut {
        value: Amount::from_sat(value),
        script_pubkey: build_unbonding_script_pubkey(
            staker_pk,
            finality_provider_pk,
            covenant_pks,
            covenant_quorum,
            unbonding_time,
        )?,
    })
}

/// `<staker> OP_CHECKSIGVERIFY <blocks> OP_CSV`
fn timelock_script(staker_pk: &XOnlyPublicKey, timelock: u16) -> ScriptBuf {
    Builder::new()
        .push_x_only_key(staker_pk)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_int(i64::from(timelock))
        .push_opcode(OP_CSV)
        .into_script()
}

/// `<staker> OP_CHECKSIGVERIFY <covenant quorum check>`
fn unbonding_path_script(
    staker_pk: &XOnlyPublicKey,
    covenant_pks: &[XOnlyPublicKey],
    covenant_quorum: u32,
) -> Result<ScriptBuf, Error> {
    let builder = Builder::new()
        .push_x_only_key(staker_pk)
        .push_opcode(OP_CHECKSIGVERIFY);
    covenant_quorum_script(builder, covenant_pks, covenant_quorum)
}

/// `<staker> OP_CHECKSIGVERIFY <fp> OP_CHECKSIGVERIFY <covenant quorum check>`
fn slashing_path_script(
    staker_pk: &XOnlyPublicKey,
    finality_provider_pk: &XOnlyPublicKey,
    covenant_pks: &[XOnlyPublicKey],
    covenant_quorum: u32,
) -> Result<ScriptBuf, Error> {
    let builder = Builder::new()
        .push_x_only_key(staker_pk)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_x_only_key(finality_provider_pk)
        .push_opcode(OP_CHECKSIGVERIFY);
    covenant_quorum_script(builder, covenant_pks, covenant_quorum)
}

/// Append a `quorum`-of-`covenant_pks` check to `builder`.
///
/// Keys are committed in lexicographic order of their serialization, so
/// the script is independent of the order the parameters list them in.
fn covenant_quorum_script(
    builder: Builder,
    covenant_pks: &[XOnlyPublicKey],
    covenant_quorum: u32,
) -> Result<ScriptBuf, Error> {
    if covenant_pks.is_empty() {
        return Err(Error::InvalidGlobalParameters("empty covenant key set"));
    }
    if covenant_quorum == 0 || covenant_quorum as usize > covenant_pks.len() {
        return Err(Error::InvalidGlobalParameters(
            "covenant quorum outside the key-set size",
        ));
    }

    let mut keys = covenant_pks.to_vec();
    keys.sort_by_key(|key| key.serialize());

    if let [single] = keys.as_slice() {
        return Ok(builder.push_x_only_key(single).push_opcode(OP_CHECKSIG).into_script());
    }

    let mut builder = builder;
    for (i, key) in keys.iter().enumerate() {
        builder = builder.push_x_only_key(key);
        builder = if i == 0 {
            builder.push_opcode(OP_CHECKSIG)
        } else {
            builder.push_opcode(OP_CHECKSIGADD)
        };
    }
    Ok(builder
        .push_int(i64::from(covenant_quorum))
        .push_opcode(OP_NUMEQUAL)
        .into_script())
}

/// Commit the leaf scripts into a P2TR script with an unspendable
/// internal key.
fn taproot_script_pubkey(leaves: Vec<ScriptBuf>) -> Result<ScriptBuf, Error> {
    let depths: &[u8] = match leaves.len() {
        2 => &[1, 1],
        3 => &[1, 2, 2],
        _ => return Err(Error::InvalidGlobalParameters("unsupported taproot leaf count")),
    };

    let internal_key = unspendable_internal_key();
    let mut builder = TaprootBuilder::new();
    for (script, depth) in leaves.into_iter().zip(depths) {
        builder = builder
            .add_leaf(*depth, script)
            .map_err(|_| Error::InvalidGlobalParameters("taproot tree construction failed"))?;
    }
    let spend_info = builder
        .finalize(SECP256K1, internal_key)
        .map_err(|_| Error::InvalidGlobalParameters("incomplete taproot tree"))?;

    Ok(ScriptBuf::new_p2tr(
        SECP256K1,
        internal_key,
        spend_info.merkle_root(),
    ))
}

fn unspendable_internal_key() -> XOnlyPublicKey {
    XOnlyPublicKey::from_slice(&UNSPENDABLE_INTERNAL_KEY)
        .expect("the hard-coded NUMS point is a valid x-only key")
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;

    use super::*;
    use crate::testing::datagen;
    use crate::testing::keys;

    #[test]
    fn parses_a_staking_tx_built_from_the_same_reconstruction() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(10);
        let params = datagen::test_params(&mut rng);
        let data = datagen::random_staking_data(&mut rng, &params);
        let tx = datagen::build_staking_tx(&params, &data).expect("build staking tx");

        let parsed = try_parse_staking_tx(&tx, &params)
            .expect("valid params")
            .expect("must parse as staking");
        assert_eq!(parsed.staking_output_index, 0);
        assert_eq!(parsed.staking_value, data.staking_value);
        assert_eq!(parsed.staker_pk, data.staker_pk);
        assert_eq!(parsed.finality_provider_pk, data.finality_provider_pk);
        assert_eq!(parsed.staking_time, data.staking_time);
    }

    #[test]
    fn rejects_a_tx_without_the_tag() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let params = datagen::test_params(&mut rng);
        let data = datagen::random_staking_data(&mut rng, &params);
        let mut tx = datagen::build_staking_tx(&params, &data).expect("build staking tx");

        // Swap the commitment for one under a different tag.
        tx.output[1].script_pubkey = op_return_script(
            b"none",
            &data.staker_pk,
            &data.finality_provider_pk,
            data.staking_time,
        );
        assert!(try_parse_staking_tx(&tx, &params).expect("valid params").is_none());
    }

    #[test]
    fn rejects_a_commitment_with_an_unknown_version() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(12);
        let params = datagen::test_params(&mut rng);
        let data = datagen::random_staking_data(&mut rng, &params);
        let mut tx = datagen::build_staking_tx(&params, &data).expect("build staking tx");

        let mut raw = tx.output[1].script_pubkey.to_bytes();
        // Byte 0 is OP_RETURN, byte 1 the push length; the version byte
        // sits right after the tag.
        raw[2 + TAG_LEN] = 1;
        tx.output[1].script_pubkey = ScriptBuf::from_bytes(raw);

        assert!(try_parse_staking_tx(&tx, &params).expect("valid params").is_none());
    }

    #[test]
    fn rejects_a_short_payload() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(13);
        let params = datagen::test_params(&mut rng);
        let data = datagen::random_staking_data(&mut rng, &params);
        let mut tx = datagen::build_staking_tx(&params, &data).expect("build staking tx");

        let mut payload = params.tag.to_vec();
        payload.push(COMMITMENT_VERSION);
        payload.extend_from_slice(&data.staker_pk.serialize());
        let push = PushBytesBuf::try_from(payload).expect("short payload still pushes");
        tx.output[1].script_pubkey = ScriptBuf::new_op_return(push);

        assert!(try_parse_staking_tx(&tx, &params).expect("valid params").is_none());
    }

    #[test]
    fn rejects_a_tx_whose_outputs_do_not_match_the_commitment() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(14);
        let params = datagen::test_params(&mut rng);
        let data = datagen::random_staking_data(&mut rng, &params);
        let mut tx = datagen::build_staking_tx(&params, &data).expect("build staking tx");

        // Commit to a different staker than the Taproot output encodes.
        let other = keys::random_x_only_key(&mut rng);
        tx.output[1].script_pubkey = op_return_script(
            &params.tag,
            &other,
            &data.finality_provider_pk,
            data.staking_time,
        );
        assert!(try_parse_staking_tx(&tx, &params).expect("valid params").is_none());
    }

    #[test]
    fn the_first_tagged_op_return_wins() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(15);
        let params = datagen::test_params(&mut rng);
        let data = datagen::random_staking_data(&mut rng, &params);
        let mut tx = datagen::build_staking_tx(&params, &data).expect("build staking tx");

        // Prepend a second tagged commitment for different keys. It comes
        // first in output order, decodes fine, but no output matches its
        // reconstruction, so the whole transaction is not staking.
        let other = keys::random_x_only_key(&mut rng);
        let decoy = TxOut {
            value: Amount::ZERO,
            script_pubkey: op_return_script(
                &params.tag,
                &other,
                &data.finality_provider_pk,
                data.staking_time,
            ),
        };
        tx.output.insert(0, decoy);

        assert!(try_parse_staking_tx(&tx, &params).expect("valid params").is_none());
    }

    #[test]
    fn staking_and_unbonding_scripts_differ() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(16);
        let params = datagen::test_params(&mut rng);
        let data = datagen::random_staking_data(&mut rng, &params);
        let covenants = params.covenant_x_only_pks();

        let staking = build_staking_script_pubkey(
            &data.staker_pk,
            &data.finality_provider_pk,
            &covenants,
            params.covenant_quorum,
            data.staking_time,
        )
        .expect("staking script");
        let unbonding = build_unbonding_script_pubkey(
            &data.staker_pk,
            &data.finality_provider_pk,
            &covenants,
            params.covenant_quorum,
            params.unbonding_time,
        )
        .expect("unbonding script");

        assert_ne!(staking, unbonding);
        assert!(staking.is_p2tr());
        assert!(unbonding.is_p2tr());
    }

    #[test]
    fn covenant_key_order_does_not_change_the_script() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(17);
        let params = datagen::test_params(&mut rng);
        let data = datagen::random_staking_data(&mut rng, &params);
        let mut covenants = params.covenant_x_only_pks();

        let forward = build_staking_script_pubkey(
            &data.staker_pk,
            &data.finality_provider_pk,
            &covenants,
            params.covenant_quorum,
            data.staking_time,
        )
        .expect("staking script");
        covenants.reverse();
        let reversed = build_staking_script_pubkey(
            &data.staker_pk,
            &data.finality_provider_pk,
            &covenants,
            params.covenant_quorum,
            data.staking_time,
        )
        .expect("staking script");

        assert_eq!(forward, reversed);
    }

    #[test]
    fn a_zero_quorum_is_a_parameter_error() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(18);
        let params = datagen::test_params(&mut rng);
        let data = datagen::random_staking_data(&mut rng, &params);

        let err = build_staking_script_pubkey(
            &data.staker_pk,
            &data.finality_provider_pk,
            &params.covenant_x_only_pks(),
            0,
            data.staking_time,
        )
        .expect_err("zero quorum must fail");
        assert!(matches!(err, Error::InvalidGlobalParameters(_)));
    }
}
