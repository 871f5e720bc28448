//! Staged cluster-response buffer.
//!
//! A compute device hands its result back as one flat buffer of the input
//! element type (`f32`), in this fixed order:
//!
//! ```text
//! [N] [membership_0 .. membership_{N-1}] [K*F] [centre_0 .. centre_{K*F-1}]
//! ```
//!
//! `N` is the number of input rows, `K` the chosen cluster count and `F` the
//! feature count. Both markers are element counts of the section that
//! follows, stored as `f32` like everything else, so they are exact only up
//! to 2^24 elements per section. Encoding refuses longer sections.

use std::fmt;

/// Largest section length an `f32` marker can represent exactly.
pub const MAX_SECTION_LEN: usize = 1 << f32::MANTISSA_DIGITS;

/// Decoded response.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterResponse {
    /// Cluster index per input row.
    pub membership: Vec<i32>,
    /// Row-major cluster centres, `K * F` values.
    pub centres: Vec<f32>,
}

/// A buffer that does not follow the response layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseError {
    /// The buffer ends before the section a marker announces.
    Truncated {
        /// Elements needed.
        needed: usize,
        /// Elements present.
        have: usize,
    },
    /// A marker is negative, fractional or not finite.
    BadMarker(usize),
    /// A section is too long for its marker to be exact.
    SectionTooLong {
        /// Element index of the marker.
        at: usize,
        /// Section length.
        len: usize,
    },
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, have } => {
                write!(f, "response truncated: need {needed} elements, have {have}")
            }
            Self::BadMarker(at) => write!(f, "invalid section marker at element {at}"),
            Self::SectionTooLong { at, len } => write!(
                f,
                "section at element {at} holds {len} elements, at most {MAX_SECTION_LEN} encodable"
            ),
        }
    }
}

impl std::error::Error for ResponseError {}

/// Number of elements [`encode_into`] writes.
#[must_use]
pub const fn encoded_len(points: usize, centre_values: usize) -> usize {
    2 + points + centre_values
}

/// Encode membership and centres into `out`, returning elements written.
///
/// # Errors
///
/// Returns [`ResponseError::Truncated`] if `out` is too small, or
/// [`ResponseError::SectionTooLong`] if a section exceeds [`MAX_SECTION_LEN`].
#[allow(clippy::cast_precision_loss)]
pub fn encode_into(
    membership: &[i32],
    centres: &[f32],
    out: &mut [f32],
) -> Result<usize, ResponseError> {
    let n = membership.len();
    let n_marker = marker(0, n)?;
    let k_marker = marker(n + 1, centres.len())?;
    let needed = encoded_len(n, centres.len());
    if out.len() < needed {
        return Err(ResponseError::Truncated {
            needed,
            have: out.len(),
        });
    }

    out[0] = n_marker;
    for (slot, &m) in out[1..=n].iter_mut().zip(membership) {
        *slot = m as f32;
    }
    out[n + 1] = k_marker;
    out[n + 2..needed].copy_from_slice(centres);
    Ok(needed)
}

/// Encode into a freshly allocated buffer.
///
/// # Errors
///
/// Returns [`ResponseError::SectionTooLong`] if a section exceeds
/// [`MAX_SECTION_LEN`].
pub fn encode(membership: &[i32], centres: &[f32]) -> Result<Vec<f32>, ResponseError> {
    let mut out = vec![0.0; encoded_len(membership.len(), centres.len())];
    encode_into(membership, centres, &mut out)?;
    Ok(out)
}

#[allow(clippy::cast_precision_loss)]
fn marker(at: usize, len: usize) -> Result<f32, ResponseError> {
    if len > MAX_SECTION_LEN {
        return Err(ResponseError::SectionTooLong { at, len });
    }
    Ok(len as f32)
}

/// Decode a response buffer. Trailing elements are ignored.
///
/// # Errors
///
/// Returns [`ResponseError`] if a marker is invalid or a section is cut short.
pub fn decode(buf: &[f32]) -> Result<ClusterResponse, ResponseError> {
    let n = read_marker(buf, 0)?;
    let centre_marker = 1 + n;
    let k = read_marker(buf, centre_marker)?;
    let end = centre_marker + 1 + k;
    if buf.len() < end {
        return Err(ResponseError::Truncated {
            needed: end,
            have: buf.len(),
        });
    }

    #[allow(clippy::cast_possible_truncation)]
    let membership = buf[1..centre_marker].iter().map(|&m| m as i32).collect();
    let centres = buf[centre_marker + 1..end].to_vec();
    Ok(ClusterResponse {
        membership,
        centres,
    })
}

fn read_marker(buf: &[f32], at: usize) -> Result<usize, ResponseError> {
    let raw = *buf.get(at).ok_or(ResponseError::Truncated {
        needed: at + 1,
        have: buf.len(),
    })?;
    #[allow(clippy::cast_precision_loss)]
    let valid = raw.is_finite() && raw >= 0.0 && raw.fract() == 0.0 && raw <= MAX_SECTION_LEN as f32;
    if !valid {
        return Err(ResponseError::BadMarker(at));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(raw as usize)
}
