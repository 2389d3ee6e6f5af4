//! Two-phase buffer negotiation.
//!
//! Every variable-length output is a handshake: the caller declares a
//! capacity, the callee either fills it or answers "too small" together
//! with the length it actually needs, and the caller retries once.
//!
//! ```text
//!   caller ── capacity=4 ──▶ callee      (result is 16 bytes)
//!   caller ◀── TooSmall[16] ─ callee
//!   caller ── capacity=16 ─▶ callee
//!   caller ◀── Complete(16) ─ callee
//! ```
//!
//! Server-side operations build their answer with [`fit`] / [`fit_pair`],
//! so the corrected length can never be left out. Clients drive the retry
//! with [`retry_once`].

use heapless::Vec as HVec;

use crate::error::Status;

/// Largest capacity the co-processor accepts (lengths are 16-bit there).
pub const MAX_BUFFER_LEN: u32 = 0xFFFF;

/// Corrected lengths, one per variable-length output of an operation.
pub type Lengths = HVec<u32, 2>;

/// Outcome of an operation with negotiated outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiated<T> {
    Complete(T),
    /// Declared capacity was too small; carries the required length(s).
    TooSmall(Lengths),
}

impl<T> Negotiated<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Negotiated<U> {
        match self {
            Self::Complete(v) => Negotiated::Complete(f(v)),
            Self::TooSmall(l) => Negotiated::TooSmall(l),
        }
    }

    pub fn complete(self) -> Option<T> {
        match self {
            Self::Complete(v) => Some(v),
            Self::TooSmall(_) => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

/// Build a single-entry length list.
pub fn lengths(required: &[u32]) -> Lengths {
    let mut out = Lengths::new();
    for &len in required.iter().take(out.capacity()) {
        let _ = out.push(len);
    }
    out
}

/// Return `data` if it fits in `capacity`, else its required length.
pub fn fit(data: Vec<u8>, capacity: u32) -> Negotiated<Vec<u8>> {
    if data.len() > capacity as usize {
        Negotiated::TooSmall(lengths(&[data.len() as u32]))
    } else {
        Negotiated::Complete(data)
    }
}

/// Two outputs negotiated together: if either does not fit, both
/// required lengths are reported so one retry suffices.
///
/// A zero `second_capacity` means the second output was not requested;
/// it is then dropped rather than negotiated.
pub fn fit_pair(
    first: Vec<u8>,
    first_capacity: u32,
    second: Vec<u8>,
    second_capacity: u32,
) -> Negotiated<(Vec<u8>, Vec<u8>)> {
    let second = if second_capacity == 0 { Vec::new() } else { second };
    let first_fits = first.len() <= first_capacity as usize;
    let second_fits = second.len() <= second_capacity as usize;

    if first_fits && second_fits {
        Negotiated::Complete((first, second))
    } else {
        Negotiated::TooSmall(lengths(&[first.len() as u32, second.len() as u32]))
    }
}

/// Validate a declared capacity.
///
/// Mandatory capacities must be strictly positive; optional ones may be
/// zero ("not wanted"). Both are bounded by [`MAX_BUFFER_LEN`].
pub fn check_capacity(capacity: u32, mandatory: bool) -> Result<(), Status> {
    if mandatory && capacity == 0 {
        return Err(Status::InvalidInput);
    }
    if capacity > MAX_BUFFER_LEN {
        return Err(Status::InvalidInput);
    }
    Ok(())
}

/// Merge corrected lengths into the previous request capacities.
///
/// Entries the callee did not correct keep their original value; a
/// corrected value never shrinks a capacity.
pub fn corrected(previous: &Lengths, required: &Lengths) -> Lengths {
    let mut out = Lengths::new();
    for (i, &prev) in previous.iter().enumerate() {
        let next = required.get(i).map_or(prev, |&r| r.max(prev));
        let _ = out.push(next);
    }
    out
}

/// Call, and on "too small" call exactly once more with the corrected
/// capacities. Whatever the second call returns is final.
pub fn retry_once<T, E>(
    initial: Lengths,
    mut call: impl FnMut(&Lengths) -> Result<Negotiated<T>, E>,
) -> Result<Negotiated<T>, E> {
    match call(&initial)? {
        Negotiated::TooSmall(required) => {
            let next = corrected(&initial, &required);
            log::debug!("negotiate: retry with {:?} (was {:?})", next, initial);
            call(&next)
        }
        done @ Negotiated::Complete(_) => Ok(done),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_reports_true_length() {
        assert_eq!(fit(vec![0; 16], 4), Negotiated::TooSmall(lengths(&[16])));
        assert_eq!(fit(vec![7; 16], 16), Negotiated::Complete(vec![7; 16]));
        assert_eq!(fit(Vec::new(), 0), Negotiated::Complete(Vec::new()));
    }

    #[test]
    fn fit_pair_reports_both_lengths() {
        let r = fit_pair(vec![1; 8], 8, vec![2; 20], 4);
        assert_eq!(r, Negotiated::TooSmall(lengths(&[8, 20])));

        let r = fit_pair(vec![1; 8], 8, vec![2; 20], 0);
        assert_eq!(r, Negotiated::Complete((vec![1; 8], Vec::new())));
    }

    #[test]
    fn capacity_rules() {
        assert_eq!(check_capacity(0, true), Err(Status::InvalidInput));
        assert_eq!(check_capacity(0, false), Ok(()));
        assert_eq!(check_capacity(MAX_BUFFER_LEN, true), Ok(()));
        assert_eq!(check_capacity(MAX_BUFFER_LEN + 1, false), Err(Status::InvalidInput));
    }

    #[test]
    fn retry_once_uses_corrected_length() {
        let truth = vec![9u8; 16];
        let mut calls = Vec::new();
        let out = retry_once::<_, Status>(lengths(&[4]), |caps| {
            calls.push(caps[0]);
            Ok(fit(truth.clone(), caps[0]))
        })
        .unwrap();
        assert_eq!(out, Negotiated::Complete(truth));
        assert_eq!(calls, vec![4, 16]);
    }

    #[test]
    fn retry_once_never_loops() {
        let mut n = 0;
        let out = retry_once::<Vec<u8>, Status>(lengths(&[1]), |_| {
            n += 1;
            Ok(Negotiated::TooSmall(lengths(&[100])))
        })
        .unwrap();
        assert!(!out.is_complete());
        assert_eq!(n, 2);
    }

    #[test]
    fn corrected_keeps_uncorrected_entries() {
        let prev = lengths(&[4, 32]);
        let next = corrected(&prev, &lengths(&[10]));
        assert_eq!(next.as_slice(), &[10, 32]);
    }
}
