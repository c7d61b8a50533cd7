use std::collections::HashSet;

use crate::core::ArcStr;

/// Named resources currently held by running work items.
#[derive(Debug, Default)]
pub(crate) struct ResourceTokens {
    held: HashSet<ArcStr>,
}

impl ResourceTokens {
    /// Takes every group or none of them.
    pub(crate) fn try_acquire(&mut self, groups: &[ArcStr]) -> bool {
        if groups.iter().any(|group| self.held.contains(group)) {
            return false;
        }
        self.held.extend(groups.iter().cloned());
        true
    }

    pub(crate) fn release(&mut self, groups: &[ArcStr]) {
        for group in groups {
            self.held.remove(group);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(names: &[&str]) -> Vec<ArcStr> {
        names.iter().map(|&n| ArcStr::from(n)).collect()
    }

    #[test]
    fn test_all_or_nothing() {
        let mut tokens = ResourceTokens::default();
        let db = groups(&["db"]);
        let both = groups(&["db", "net"]);
        let net = groups(&["net"]);

        assert!(tokens.try_acquire(&db));
        assert!(!tokens.try_acquire(&both));
        assert!(tokens.try_acquire(&net));

        tokens.release(&db);
        tokens.release(&net);
        assert!(tokens.try_acquire(&both));
    }

    #[test]
    fn test_no_groups_always_acquires() {
        let mut tokens = ResourceTokens::default();
        assert!(tokens.try_acquire(&[]));
        assert!(tokens.try_acquire(&[]));
    }
}
