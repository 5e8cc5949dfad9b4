use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// In-process mutual exclusion keyed by lab id.
///
/// A lab is claimed for the whole lifetime of a deploy or destroy; the claim is released
/// when its [`LabClaim`] is dropped, whichever way the pipeline ends.
#[derive(Debug, Clone, Default)]
pub struct LabLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LabLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `lab_id`, or `None` if it is already claimed.
    pub fn try_claim(&self, lab_id: &str) -> Option<LabClaim> {
        if self.lock().insert(lab_id.to_string()) {
            Some(LabClaim {
                locks: self.clone(),
                lab_id: lab_id.to_string(),
            })
        } else {
            None
        }
    }

    pub fn is_claimed(&self, lab_id: &str) -> bool {
        self.lock().contains(lab_id)
    }
}

#[derive(Debug)]
pub struct LabClaim {
    locks: LabLocks,
    lab_id: String,
}

impl Drop for LabClaim {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.lab_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let locks = LabLocks::new();
        let claim = locks.try_claim("lab-1").unwrap();
        assert!(locks.try_claim("lab-1").is_none());
        assert!(locks.try_claim("lab-2").is_some());
        assert!(locks.is_claimed("lab-1"));

        drop(claim);
        assert!(!locks.is_claimed("lab-1"));
        assert!(locks.try_claim("lab-1").is_some());
    }
}
