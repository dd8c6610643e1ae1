//! Vector timestamps identifying a [`crate::task::Task`] within its Job hierarchy.

use std::fmt;

/// A lexicographically-ordered sequence of induction values.
///
/// A root task (spawned directly by the main thread) carries a single-entry
/// timestamp holding its own induction value. A nested task inherits its
/// parent's timestamp and appends its own induction value, so a task three
/// loops deep carries a three-entry timestamp. Two distinct live tasks
/// within the same job never compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Vec<i64>);

impl Timestamp {
    /// A root timestamp for a task with no parent.
    pub fn root(indvar: i64) -> Self {
        Timestamp(vec![indvar])
    }

    /// Extend `self` (the parent's timestamp) with a child's induction value.
    pub fn child(&self, indvar: i64) -> Self {
        let mut entries = self.0.clone();
        entries.push(indvar);
        Timestamp(entries)
    }

    pub fn entries(&self) -> &[i64] {
        &self.0
    }

    /// The induction value this timestamp was most recently extended with.
    pub fn indvar(&self) -> i64 {
        *self.0.last().expect("timestamp is never empty")
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_single_entry() {
        let t = Timestamp::root(5);
        assert_eq!(t.entries(), &[5]);
    }

    #[test]
    fn child_appends() {
        let root = Timestamp::root(1);
        let child = root.child(2);
        assert_eq!(child.entries(), &[1, 2]);
        let grandchild = child.child(3);
        assert_eq!(grandchild.entries(), &[1, 2, 3]);
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = Timestamp::root(1);
        let b = Timestamp::root(2);
        assert!(a < b);

        let a_child = a.child(100);
        // [1,100] vs [2]: first entry decides regardless of length.
        assert!(a_child < b);

        let a0 = a.child(0);
        let a1 = a.child(1);
        assert!(a0 < a1);
    }

    #[test]
    fn distinct_timestamps_never_equal_within_a_lineage() {
        let root = Timestamp::root(0);
        let siblings: Vec<_> = (0..10).map(|i| root.child(i)).collect();
        for (i, a) in siblings.iter().enumerate() {
            for (j, b) in siblings.iter().enumerate() {
                assert_eq!(i == j, a == b);
            }
        }
    }
}
