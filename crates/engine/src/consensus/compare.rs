//! Result agreement between redundant executions.

use relay_core::{Job, JobStatus, TaskError, TaskType};

/// What a worker handed back: a result digest or an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<'a> {
    Score(&'a [u8]),
    Error(TaskError),
}

impl<'a> Outcome<'a> {
    pub fn of(job: &'a Job) -> Option<Outcome<'a>> {
        match job.status {
            JobStatus::ScoreReady => job.score.as_deref().map(Outcome::Score),
            JobStatus::ErrorReported => job.task_error.map(Outcome::Error),
            _ => None,
        }
    }
}

/// Number of differing bits. `None` when the digests differ in length.
pub fn hamming_distance(a: &[u8], b: &[u8]) -> Option<u32> {
    if a.len() != b.len() {
        return None;
    }
    Some(a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum())
}

pub fn agree(task_type: TaskType, a: Outcome<'_>, b: Outcome<'_>, threshold: u32) -> bool {
    match (a, b) {
        (Outcome::Error(x), Outcome::Error(y)) => x == y,
        (Outcome::Score(x), Outcome::Score(y)) => {
            if task_type.compares_by_distance() {
                hamming_distance(x, y).is_some_and(|d| d < threshold)
            } else {
                x == y
            }
        }
        _ => false,
    }
}

/// For each outcome, whether it agrees with at least one other.
pub fn validity(task_type: TaskType, outcomes: &[Outcome<'_>], threshold: u32) -> Vec<bool> {
    (0..outcomes.len())
        .map(|i| {
            (0..outcomes.len())
                .any(|j| i != j && agree(task_type, outcomes[i], outcomes[j], threshold))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hamming() {
        assert_eq!(hamming_distance(&[0b1010], &[0b0101]), Some(4));
        assert_eq!(hamming_distance(&[0xFF, 0x00], &[0xFF, 0x00]), Some(0));
        assert_eq!(hamming_distance(&[0xFF], &[0xFF, 0x00]), None);
    }

    #[test]
    fn images_agree_below_threshold() {
        let a = [0u8; 8];
        let mut b = [0u8; 8];
        b[0] = 0b1111; // 4 bits
        assert!(agree(TaskType::Image, Outcome::Score(&a), Outcome::Score(&b), 5));
        b[1] = 0b1; // 5 bits
        assert!(!agree(TaskType::Image, Outcome::Score(&a), Outcome::Score(&b), 5));
    }

    #[test]
    fn text_requires_equality() {
        let a = b"hello".as_slice();
        let b = b"hellp".as_slice();
        assert!(agree(TaskType::TextGeneration, Outcome::Score(a), Outcome::Score(a), 5));
        assert!(!agree(TaskType::TextGeneration, Outcome::Score(a), Outcome::Score(b), 5));
    }

    #[test]
    fn errors_agree_only_with_errors() {
        let e = Outcome::Error(TaskError::ParametersValidationFailed);
        assert!(agree(TaskType::Image, e, e, 5));
        assert!(!agree(TaskType::Image, e, Outcome::Score(&[0]), 5));
    }

    #[test]
    fn validity_needs_one_peer() {
        let a = [0u8; 4];
        let c = [0xFFu8; 4];
        let outcomes = [Outcome::Score(&a), Outcome::Score(&a), Outcome::Score(&c)];
        assert_eq!(validity(TaskType::Image, &outcomes, 5), vec![true, true, false]);

        let all_different = [Outcome::Score(b"x"), Outcome::Score(b"y"), Outcome::Score(b"z")];
        assert_eq!(
            validity(TaskType::TextGeneration, &all_different, 5),
            vec![false, false, false]
        );
    }
}
