use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Ordered task/schedule priority. `P0` is highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Priority::P0, Priority::P1, Priority::P2, Priority::P3];

    /// All priorities at or above (numerically ≤ rank of) this one, i.e. this
    /// priority and everything more urgent.
    pub fn and_higher(self) -> BTreeSet<Priority> {
        Self::ALL.iter().copied().filter(|p| *p <= self).collect()
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_p0_highest() {
        assert!(Priority::P0 < Priority::P1);
        assert!(Priority::P1 < Priority::P2);
        assert!(Priority::P2 < Priority::P3);
    }

    #[test]
    fn and_higher_includes_self() {
        let set = Priority::P1.and_higher();
        assert!(set.contains(&Priority::P0));
        assert!(set.contains(&Priority::P1));
        assert!(!set.contains(&Priority::P2));
    }
}
