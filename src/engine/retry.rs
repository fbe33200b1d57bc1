//! Retry loop for optimistic branch updates.

use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::{BranchName, StorageError};

/// true if `err` means a compare-and-swap lost to another writer
pub(crate) fn is_cas_failure(err: &Error) -> bool {
    matches!(err, Error::Storage(StorageError::PredicateFailed { .. }))
}

/// Run `attempt` until it does not lose a branch compare-and-swap.
///
/// Each attempt must re-read the branch it updates. After `max_tries`
/// losses the update fails with [`Error::TooManyTries`].
pub(crate) fn retry_branch_update<T>(
    branch: &BranchName,
    max_tries: usize,
    mut attempt: impl FnMut(usize) -> Result<T>,
) -> Result<T> {
    let tries = max_tries.max(1);
    for n in 1..=tries {
        match attempt(n) {
            Err(e) if is_cas_failure(&e) => {
                debug!(branch = %branch, attempt = n, "branch changed concurrently, retrying");
            }
            other => return other,
        }
    }
    Err(Error::TooManyTries {
        branch: branch.to_string(),
        attempts: tries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lost() -> Error {
        Error::Storage(StorageError::PredicateFailed {
            partition: "repo/r".into(),
            key: "branches/main".into(),
        })
    }

    #[test]
    fn test_succeeds_after_losses() {
        let result = retry_branch_update(&BranchName::main(), 5, |n| if n < 3 { Err(lost()) } else { Ok(n) });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_gives_up() {
        let mut calls = 0;
        let err = retry_branch_update(&BranchName::main(), 4, |_| -> Result<()> {
            calls += 1;
            Err(lost())
        })
        .unwrap_err();
        assert_eq!(calls, 4);
        assert!(matches!(err, Error::TooManyTries { attempts: 4, .. }));
    }

    #[test]
    fn test_other_errors_are_not_retried() {
        let mut calls = 0;
        let err = retry_branch_update(&BranchName::main(), 4, |_| -> Result<()> {
            calls += 1;
            Err(Error::NoChanges)
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, Error::NoChanges));
    }
}
