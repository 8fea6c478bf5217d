//! Record types persisted by the indexer and their binary codec.
//!
//! Values are encoded as a sequence of tag-length-value fields. The
//! codec is strict: every field must be present exactly once and unknown
//! tags are treated as corruption.

use bitcoin::hashes::Hash as _;
use bitcoin::Txid;
use bitcoin::XOnlyPublicKey;
use serde::Serialize;

use crate::error::Error;

/// A staking transaction accepted by the indexer. Immutable once written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StakingRecord {
    /// Hash of the staking transaction.
    pub txid: Txid,
    /// Index of the Taproot staking output.
    pub staking_output_index: u32,
    /// Height of the block that included the transaction.
    pub inclusion_height: u64,
    /// The staker's x-only public key.
    pub staker_pk: XOnlyPublicKey,
    /// The committed staking time in blocks.
    pub staking_time: u16,
    /// The finality provider's x-only public key.
    pub finality_provider_pk: XOnlyPublicKey,
    /// The staking value in satoshis.
    pub staking_value: u64,
    /// Whether accepting this stake pushed the aggregate over the cap.
    /// Overflow stakes are recorded but excluded from the confirmed TVL.
    pub is_overflow: bool,
}

/// An unbonding transaction spending a known staking output. Immutable
/// once written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnbondingRecord {
    /// Hash of the unbonding transaction.
    pub txid: Txid,
    /// Hash of the staking transaction it spends.
    pub staking_txid: Txid,
}

/// Everything the engine persists for one confirmed block, committed
/// atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockCommit {
    /// Height of the block; becomes the last processed height.
    pub height: u64,
    /// The confirmed TVL after this block.
    pub confirmed_tvl: u64,
    /// Staking records produced by this block.
    pub staking: Vec<StakingRecord>,
    /// Unbonding records produced by this block.
    pub unbonding: Vec<UnbondingRecord>,
}

const TAG_TXID: u8 = 1;
const TAG_OUTPUT_INDEX: u8 = 2;
const TAG_INCLUSION_HEIGHT: u8 = 3;
const TAG_STAKER_PK: u8 = 4;
const TAG_STAKING_TIME: u8 = 5;
const TAG_FP_PK: u8 = 6;
const TAG_STAKING_VALUE: u8 = 7;
const TAG_IS_OVERFLOW: u8 = 8;
const TAG_STAKING_TXID: u8 = 2;

impl StakingRecord {
    /// Serialize the record into its tag-length-value form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        put_field(&mut buf, TAG_TXID, &self.txid.to_byte_array());
        put_field(&mut buf, TAG_OUTPUT_INDEX, &self.staking_output_index.to_be_bytes());
        put_field(&mut buf, TAG_INCLUSION_HEIGHT, &self.inclusion_height.to_be_bytes());
        put_field(&mut buf, TAG_STAKER_PK, &self.staker_pk.serialize());
        put_field(&mut buf, TAG_STAKING_TIME, &self.staking_time.to_be_bytes());
        put_field(&mut buf, TAG_FP_PK, &self.finality_provider_pk.serialize());
        put_field(&mut buf, TAG_STAKING_VALUE, &self.staking_value.to_be_bytes());
        put_field(&mut buf, TAG_IS_OVERFLOW, &[self.is_overflow as u8]);
        buf
    }

    /// Decode a record previously produced by [`StakingRecord::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut txid = None;
        let mut staking_output_index = None;
        let mut inclusion_height = None;
        let mut staker_pk = None;
        let mut staking_time = None;
        let mut finality_provider_pk = None;
        let mut staking_value = None;
        let mut is_overflow = None;

        for_each_field(bytes, |tag, value| {
            match tag {
                TAG_TXID => txid = Some(decode_txid(value)?),
                TAG_OUTPUT_INDEX => {
                    staking_output_index = Some(u32::from_be_bytes(fixed(value)?))
                }
                TAG_INCLUSION_HEIGHT => {
                    inclusion_height = Some(u64::from_be_bytes(fixed(value)?))
                }
                TAG_STAKER_PK => staker_pk = Some(decode_x_only(value)?),
                TAG_STAKING_TIME => staking_time = Some(u16::from_be_bytes(fixed(value)?)),
                TAG_FP_PK => finality_provider_pk = Some(decode_x_only(value)?),
                TAG_STAKING_VALUE => staking_value = Some(u64::from_be_bytes(fixed(value)?)),
                TAG_IS_OVERFLOW => {
                    let [flag] = fixed::<1>(value)?;
                    is_overflow = Some(flag != 0);
                }
                other => {
                    return Err(Error::StoreCorruption(format!(
                        "unknown staking record field tag {other}"
                    )))
                }
            }
            Ok(())
        })?;

        Ok(Self {
            txid: require(txid, "txid")?,
            staking_output_index: require(staking_output_index, "staking output index")?,
            inclusion_height: require(inclusion_height, "inclusion height")?,
            staker_pk: require(staker_pk, "staker public key")?,
            staking_time: require(staking_time, "staking time")?,
            finality_provider_pk: require(finality_provider_pk, "finality provider key")?,
            staking_value: require(staking_value, "staking value")?,
            is_overflow: require(is_overflow, "overflow flag")?,
        })
    }
}

impl UnbondingRecord {
    /// Serialize the record into its tag-length-value form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(72);
        put_field(&mut buf, TAG_TXID, &self.txid.to_byte_array());
        put_field(&mut buf, TAG_STAKING_TXID, &self.staking_txid.to_byte_array());
        buf
    }

    /// Decode a record previously produced by [`UnbondingRecord::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut txid = None;
        let mut staking_txid = None;

        for_each_field(bytes, |tag, value| {
            match tag {
                TAG_TXID => txid = Some(decode_txid(value)?),
                TAG_STAKING_TXID => staking_txid = Some(decode_txid(value)?),
                other => {
                    return Err(Error::StoreCorruption(format!(
                        "unknown unbonding record field tag {other}"
                    )))
                }
            }
            Ok(())
        })?;

        Ok(Self {
            txid: require(txid, "txid")?,
            staking_txid: require(staking_txid, "staking txid")?,
        })
    }
}

/// Encode a meta-table counter.
pub fn encode_u64(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

/// Decode a meta-table counter.
pub fn decode_u64(bytes: &[u8]) -> Result<u64, Error> {
    Ok(u64::from_be_bytes(fixed(bytes)?))
}

fn put_field(buf: &mut Vec<u8>, tag: u8, value: &[u8]) {
    buf.push(tag);
    buf.push(value.len() as u8);
    buf.extend_from_slice(value);
}

fn for_each_field(
    mut bytes: &[u8],
    mut f: impl FnMut(u8, &[u8]) -> Result<(), Error>,
) -> Result<(), Error> {
    while !bytes.is_empty() {
        if bytes.len() < 2 {
            return Err(Error::StoreCorruption("truncated field header".to_string()));
        }
        let tag = bytes[0];
        let len = bytes[1] as usize;
        if bytes.len() < 2 + len {
            return Err(Error::StoreCorruption(format!(
                "field {tag} claims {len} bytes but only {} remain",
                bytes.len() - 2
            )));
        }
        f(tag, &bytes[2..2 + len])?;
        bytes = &bytes[2 + len..];
    }
    Ok(())
}

fn fixed<const N: usize>(value: &[u8]) -> Result<[u8; N], Error> {
    value.try_into().map_err(|_| {
        Error::StoreCorruption(format!("expected a {N}-byte field, got {}", value.len()))
    })
}

fn decode_txid(value: &[u8]) -> Result<Txid, Error> {
    Ok(Txid::from_byte_array(fixed(value)?))
}

fn decode_x_only(value: &[u8]) -> Result<XOnlyPublicKey, Error> {
    XOnlyPublicKey::from_slice(value)
        .map_err(|err| Error::StoreCorruption(format!("invalid stored public key: {err}")))
}

fn require<T>(value: Option<T>, what: &str) -> Result<T, Error> {
    value.ok_or_else(|| Error::StoreCorruption(format!("missing {what} field")))
}
