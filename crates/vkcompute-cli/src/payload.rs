//! Input generation and output checking for the sum kernel.

/// First element whose output is not twice its input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "invalid value for [{index}]: got {actual}, expected {expected} ({mismatches} mismatches total)"
)]
pub struct VerificationError {
    pub index: usize,
    pub actual: i32,
    pub expected: i32,
    pub mismatches: usize,
}

/// `0, 1, 2, ..` as `i32`, wrapping past `i32::MAX`.
pub fn generate_payload(elements: usize) -> Vec<i32> {
    (0..elements).map(|i| i as i32).collect()
}

/// Check `output[i] == input[i] + input[i]` with the kernel's wrapping
/// integer addition.
pub fn verify_doubled(input: &[i32], output: &[i32]) -> Result<(), VerificationError> {
    if input.len() != output.len() {
        return Err(VerificationError {
            index: input.len().min(output.len()),
            actual: 0,
            expected: 0,
            mismatches: input.len().abs_diff(output.len()),
        });
    }
    let mut bad = input
        .iter()
        .zip(output)
        .enumerate()
        .filter(|(_, (a, b))| a.wrapping_add(**a) != **b);
    match bad.next() {
        None => Ok(()),
        Some((index, (a, b))) => Err(VerificationError {
            index,
            actual: *b,
            expected: a.wrapping_add(*a),
            mismatches: 1 + bad.count(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn payload_counts_up() {
        assert_eq!(generate_payload(4), vec![0, 1, 2, 3]);
        assert!(generate_payload(0).is_empty());
    }

    #[test]
    fn reports_first_mismatch() {
        let input = generate_payload(4);
        let err = verify_doubled(&input, &[0, 2, 5, 7]).unwrap_err();
        assert_eq!(err.index, 2);
        assert_eq!(err.actual, 5);
        assert_eq!(err.expected, 4);
        assert_eq!(err.mismatches, 2);
        assert!(err.to_string().starts_with("invalid value for [2]: got 5, expected 4"));
    }

    #[test]
    fn length_mismatch_is_an_error() {
        let err = verify_doubled(&[1, 2, 3], &[2, 4]).unwrap_err();
        assert_eq!(err.index, 2);
        assert_eq!(err.mismatches, 1);
    }

    proptest! {
        #[test]
        fn prop_doubled_output_verifies(input in prop::collection::vec(any::<i32>(), 0..512)) {
            let output: Vec<i32> = input.iter().map(|v| v.wrapping_add(*v)).collect();
            prop_assert!(verify_doubled(&input, &output).is_ok());
        }

        #[test]
        fn prop_any_flip_is_caught(
            input in prop::collection::vec(any::<i32>(), 1..256),
            pick in any::<prop::sample::Index>(),
        ) {
            let mut output: Vec<i32> = input.iter().map(|v| v.wrapping_add(*v)).collect();
            let i = pick.index(output.len());
            output[i] ^= 1;
            let err = verify_doubled(&input, &output).unwrap_err();
            prop_assert_eq!(err.index, i);
        }
    }
}
