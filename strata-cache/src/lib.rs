pub mod store;

pub use store::{
    AltCandidate, Alternate, CacheLookup, CacheStore, CacheVerdict, CacheWriteError, WriteHandle,
};
