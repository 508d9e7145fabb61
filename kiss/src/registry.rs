//! Process-wide guard so two transport instances can't race on the same device path.

use lazy_static::lazy_static;
use std::collections::HashSet;
use std::sync::Mutex;

lazy_static! {
    static ref CLAIMED_PATHS: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
}

/// Attempts to claim `path` for exclusive use. Returns `true` if this caller now owns it.
pub fn claim(path: &str) -> bool {
    CLAIMED_PATHS.lock().unwrap().insert(path.to_string())
}

/// Releases a previously claimed path. No-op if it wasn't claimed.
pub fn release(path: &str) {
    CLAIMED_PATHS.lock().unwrap().remove(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_on_same_path_is_refused() {
        let path = "/dev/test-kiss-registry-0";
        assert!(claim(path));
        assert!(!claim(path));
        release(path);
        assert!(claim(path));
        release(path);
    }
}
