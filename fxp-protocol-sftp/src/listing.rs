use fxp_common::ClientConfig;
use tracing::*;

use crate::server::Name;

/// Collects directory entries for output sorted by file name.
///
/// Names are held back until [`finish`](Self::finish) unless the memory
/// they take would exceed the configured cap, in which case everything
/// collected so far is released and the rest of the listing streams
/// through unsorted.
#[derive(Debug)]
pub struct DirectoryListing {
    names: Vec<Name>,
    total_memory: usize,
    max_memory: usize,
    sorting: bool,
}

impl DirectoryListing {
    pub fn new(max_memory: usize) -> Self {
        Self {
            names: Vec::new(),
            total_memory: 0,
            max_memory,
            sorting: true,
        }
    }

    /// A listing capped at the client's `max_names_memory`.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.max_names_memory)
    }

    pub fn is_sorting(&self) -> bool {
        self.sorting
    }

    /// Adds a name, returning whatever is ready to be output now.
    pub fn feed(&mut self, name: Name) -> Vec<Name> {
        if !self.sorting {
            return vec![name];
        }

        let this_name_memory =
            std::mem::size_of::<Name>() + name.raw_filename.len() + name.longname.len();
        if self.max_memory.saturating_sub(self.total_memory) < this_name_memory {
            warn!(
                collected = self.names.len(),
                "Too many files to sort; switching to unsorted output"
            );
            self.sorting = false;
            self.total_memory = 0;
            let mut ready = std::mem::take(&mut self.names);
            ready.push(name);
            return ready;
        }

        self.total_memory += this_name_memory;
        self.names.push(name);
        Vec::new()
    }

    /// Returns the held-back names, sorted.
    pub fn finish(mut self) -> Vec<Name> {
        self.names
            .sort_by(|a, b| a.raw_filename.cmp(&b.raw_filename));
        self.names
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::attrs::FileAttributes;

    fn name(filename: &str) -> Name {
        Name::new(filename, FileAttributes::default())
    }

    #[test]
    fn test_sorted_output() {
        let mut listing = DirectoryListing::new(8 << 20);
        for filename in ["zeta", "Alpha", "beta"] {
            assert!(listing.feed(name(filename)).is_empty());
        }
        let sorted: Vec<_> = listing
            .finish()
            .into_iter()
            .map(|n| n.filename)
            .collect();
        assert_eq!(sorted, vec!["Alpha", "beta", "zeta"]);
    }

    #[test]
    fn test_from_config() {
        let config = ClientConfig {
            max_names_memory: std::mem::size_of::<Name>() + 1,
            ..Default::default()
        };
        let mut listing = DirectoryListing::from_config(&config);
        assert!(listing.feed(name("b")).is_empty());
        assert_eq!(listing.feed(name("a")).len(), 2);
        assert!(!listing.is_sorting());

        let mut listing = DirectoryListing::from_config(&ClientConfig::default());
        for filename in ["y", "x"] {
            assert!(listing.feed(name(filename)).is_empty());
        }
        assert_eq!(listing.finish()[0].filename, "x");
    }

    #[test]
    fn test_sorts_on_raw_bytes() {
        let mut listing = DirectoryListing::new(8 << 20);
        for raw in [&b"caf\xe9"[..], &b"caf\xc3"[..]] {
            let name = Name::from_raw(Bytes::from_static(raw), String::new(), FileAttributes::default());
            listing.feed(name);
        }
        let sorted = listing.finish();
        assert_eq!(&sorted[0].raw_filename[..], b"caf\xc3");
        assert_eq!(&sorted[1].raw_filename[..], b"caf\xe9");
    }

    #[test]
    fn test_falls_back_to_unsorted() {
        let per_name = std::mem::size_of::<Name>() + 1;
        let mut listing = DirectoryListing::new(per_name * 2);

        assert!(listing.feed(name("c")).is_empty());
        assert!(listing.feed(name("b")).is_empty());
        let released: Vec<_> = listing
            .feed(name("a"))
            .into_iter()
            .map(|n| n.filename)
            .collect();
        assert_eq!(released, vec!["c", "b", "a"]);
        assert!(!listing.is_sorting());

        assert_eq!(listing.feed(name("d")).len(), 1);
        assert!(listing.finish().is_empty());
    }
}
