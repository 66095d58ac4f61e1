//! The minimal concrete chunk-producing value backing `Output`/`Run` steps.
//!
//! Deliberately the simplest thing that satisfies the interpreter's contract: an owned buffer of
//! emitted values terminating in a result, not a fused or lazy pull implementation.

use pullrt_scope::Error;

/// An owned, finite buffer of `O` values terminating in a result `R`.
#[derive(Clone, Debug)]
pub struct Segment<O, R> {
    values: Vec<O>,
    result: R,
}

/// Outcome of [`Segment::split_at`].
pub enum SplitResult<O, R> {
    /// The whole segment fit within the step budget: every value plus the terminal result.
    Done(Vec<O>, R),
    /// The budget ran out first: the emitted prefix, plus a remainder segment carrying the rest.
    NotDone(Vec<O>, Segment<O, R>),
}

impl<O, R> Segment<O, R> {
    /// Wraps `values` terminating in `result`.
    pub fn new(values: Vec<O>, result: R) -> Self {
        Segment { values, result }
    }

    /// A segment with no values, terminating immediately in `result`.
    pub fn pure(result: R) -> Self {
        Segment {
            values: Vec::new(),
            result,
        }
    }

    /// Number of values buffered.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Decomposes this segment into its raw values and terminal result.
    pub fn into_parts(self) -> (Vec<O>, R) {
        (self.values, self.result)
    }

    /// Maps this segment's terminal result, keeping its values untouched. Used by [`crate::run`]
    /// to box a `Run` step's result so `Step::Run` can stay non-generic over `R`.
    pub fn map_result<R2>(self, f: impl FnOnce(R) -> R2) -> Segment<O, R2> {
        Segment {
            values: self.values,
            result: f(self.result),
        }
    }

    /// Folds every value into `acc` with `g`, then returns `(acc, result)`. `g`'s errors are
    /// surfaced to the caller, which feeds them to the interpreter's continuation rather than
    /// treating them as fatal.
    pub fn fold<B>(self, mut acc: B, mut g: impl FnMut(B, O) -> Result<B, Error>) -> Result<(B, R), Error> {
        for value in self.values {
            acc = g(acc, value)?;
        }
        Ok((acc, self.result))
    }

    /// Splits off at most `n` values, doing at most `max_steps` units of work. Since this segment
    /// is a plain `Vec`, "work" is just the number of values copied, so the split either consumes
    /// the whole segment (if `n >= len` and `len <= max_steps`) or stops at `min(n, max_steps)`.
    pub fn split_at(mut self, n: usize, max_steps: usize) -> SplitResult<O, R> {
        let take = n.min(max_steps).min(self.values.len());
        if take == self.values.len() {
            SplitResult::Done(self.values, self.result)
        } else {
            let remainder_values = self.values.split_off(take);
            let prefix = self.values;
            SplitResult::NotDone(
                prefix,
                Segment {
                    values: remainder_values,
                    result: self.result,
                },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_sums_values_and_returns_result() {
        let seg = Segment::new(vec![1, 2, 3], "done");
        let (sum, result) = seg.fold(0, |acc, v| Ok(acc + v)).unwrap();
        assert_eq!(sum, 6);
        assert_eq!(result, "done");
    }

    #[test]
    fn fold_surfaces_combiner_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("bad value")]
        struct Bad;

        let seg = Segment::new(vec![1, 2], "done");
        let err = seg
            .fold(0, |_, v| if v == 2 { Err(Error::user(Bad)) } else { Ok(v) })
            .unwrap_err();
        assert!(matches!(err, Error::User(_)));
    }

    #[test]
    fn split_at_within_budget_is_done() {
        let seg = Segment::new(vec![1, 2, 3], "r");
        match seg.split_at(10, 10) {
            SplitResult::Done(values, result) => {
                assert_eq!(values, vec![1, 2, 3]);
                assert_eq!(result, "r");
            }
            SplitResult::NotDone(..) => panic!("expected Done"),
        }
    }

    #[test]
    fn split_at_over_budget_returns_remainder() {
        let seg = Segment::new(vec![1, 2, 3, 4], "r");
        match seg.split_at(4, 2) {
            SplitResult::NotDone(prefix, remainder) => {
                assert_eq!(prefix, vec![1, 2]);
                assert_eq!(remainder.len(), 2);
            }
            SplitResult::Done(..) => panic!("expected NotDone"),
        }
    }
}
