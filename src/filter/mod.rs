pub mod bloom;

/// A `FilterPolicy` summarizes a set of keys into a compact byte string and
/// answers approximate membership queries against it. A negative answer is
/// authoritative; a positive answer may be a false positive.
pub trait FilterPolicy: Send + Sync {
    /// Returns the name of this policy. Note that if the filter encoding
    /// changes in an incompatible way, the name returned by this method
    /// must be changed. Otherwise, old incompatible filters may be
    /// passed to methods of this type.
    fn name(&self) -> &str;

    /// Builds a filter summarizing `keys`.
    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8>;

    /// Whether `key` may be present in the set `filter` was built from.
    fn key_may_match(&self, filter: &[u8], key: &[u8]) -> bool;
}
