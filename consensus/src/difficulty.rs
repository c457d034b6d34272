//! Difficulty Schedule for Plumecoin
//!
//! Targets travel in the compact `bits` encoding. Retargeting runs every
//! block over three window scales; each scale proposes a target scaled by
//! its observed timespan, and the median proposal wins. Proof-of-work and
//! proof-of-stake difficulties are tracked independently: the caller feeds
//! only headers of the matching proof type.

use num_bigint::BigUint;
use num_traits::{One, Zero};

use plumecoin_core::Hash;

use crate::checks::CheckError;
use crate::ConsensusParams;

/// The three retarget window lengths, in blocks
pub const RETARGET_SCALES: [usize; 3] = [9, 36, 144];

/// Per-boundary smoothing window for timespan endpoints
const BOUNDARY_MEDIAN: usize = 3;

/// Decode compact bits into a 256-bit target.
///
/// Returns `None` for the negative flag, zero mantissa, or overflow past
/// 256 bits.
pub fn bits_to_target(bits: u32) -> Option<BigUint> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 || mantissa == 0 {
        return None;
    }
    let target = if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigUint::from(mantissa) << (8 * (exponent - 3))
    };
    if target.bits() > 256 {
        return None;
    }
    if target.is_zero() {
        return None;
    }
    Some(target)
}

/// Encode a target into compact bits
pub fn target_to_bits(target: &BigUint) -> u32 {
    if target.is_zero() {
        return 0;
    }
    let bytes = target.to_bytes_be();
    let mut exponent = bytes.len();
    let mut mantissa: u32 = 0;
    for (i, byte) in bytes.iter().take(3).enumerate() {
        mantissa |= (*byte as u32) << (8 * (2 - i));
    }
    // The sign bit of the mantissa is reserved; shift into a longer
    // exponent when it would be set.
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        exponent += 1;
    }
    ((exponent as u32) << 24) | mantissa
}

/// Interpret a hash as a big-endian 256-bit integer
pub fn hash_to_uint(hash: &Hash) -> BigUint {
    BigUint::from_bytes_be(hash)
}

/// Work contributed by a block at the given compact target:
/// `2^256 / (target + 1)`
pub fn block_proof(bits: u32) -> BigUint {
    let target = match bits_to_target(bits) {
        Some(t) => t,
        None => return BigUint::zero(),
    };
    let numerator: BigUint = BigUint::one() << 256usize;
    numerator / (target + BigUint::one())
}

/// Verify that a header hash meets its claimed compact target and the
/// claimed target is within the limit
pub fn check_proof_of_work(hash: &Hash, bits: u32, limit_bits: u32) -> Result<(), CheckError> {
    let target = bits_to_target(bits).ok_or(CheckError::BadTargetEncoding)?;
    let limit = bits_to_target(limit_bits).ok_or(CheckError::BadTargetEncoding)?;
    if target > limit {
        return Err(CheckError::TargetAboveLimit);
    }
    if hash_to_uint(hash) > target {
        return Err(CheckError::HighHash);
    }
    Ok(())
}

/// Compute the required compact target for the next block.
///
/// `headers` holds `(timestamp, bits)` of recent blocks of the same proof
/// type, oldest first. With fewer than `BOUNDARY_MEDIAN + 1` headers the
/// limit target is required.
pub fn next_work_required(params: &ConsensusParams, headers: &[(u32, u32)], pos: bool) -> u32 {
    let limit_bits = if pos {
        params.pos_limit_bits
    } else {
        params.pow_limit_bits
    };
    if headers.len() <= BOUNDARY_MEDIAN {
        return limit_bits;
    }
    let limit = match bits_to_target(limit_bits) {
        Some(limit) => limit,
        None => return limit_bits,
    };
    let last_bits = headers[headers.len() - 1].1;
    let last_target = match bits_to_target(last_bits) {
        Some(t) => t,
        None => return limit_bits,
    };

    let mut proposals: Vec<BigUint> = Vec::with_capacity(RETARGET_SCALES.len());
    for &scale in &RETARGET_SCALES {
        if let Some(proposal) = scale_proposal(params, headers, &last_target, scale) {
            proposals.push(proposal);
        }
    }
    if proposals.is_empty() {
        return last_bits;
    }
    proposals.sort();
    let mut chosen = proposals.swap_remove(proposals.len() / 2);
    log::debug!(
        "retarget: {} scale proposals, last bits {:08x}",
        RETARGET_SCALES.len(),
        last_bits
    );
    if chosen > limit {
        chosen = limit;
    }
    if chosen.is_zero() {
        chosen = BigUint::one();
    }
    target_to_bits(&chosen)
}

/// One scale's proposed target: last target scaled by the observed/ideal
/// timespan ratio, with the timespan clamped to a factor of three either way
fn scale_proposal(
    params: &ConsensusParams,
    headers: &[(u32, u32)],
    last_target: &BigUint,
    scale: usize,
) -> Option<BigUint> {
    if headers.len() < scale + BOUNDARY_MEDIAN {
        return None;
    }
    let end = boundary_median(&headers[headers.len() - BOUNDARY_MEDIAN..]);
    let start_idx = headers.len() - scale - BOUNDARY_MEDIAN;
    let start = boundary_median(&headers[start_idx..start_idx + BOUNDARY_MEDIAN]);
    let ideal = (scale as i64) * params.target_spacing as i64;
    let mut timespan = end as i64 - start as i64;
    timespan = timespan.clamp(ideal / 3, ideal * 3);
    Some(last_target * BigUint::from(timespan as u64) / BigUint::from(ideal as u64))
}

fn boundary_median(window: &[(u32, u32)]) -> u32 {
    let mut times: Vec<u32> = window.iter().map(|(t, _)| *t).collect();
    times.sort_unstable();
    times[times.len() / 2]
}
