//! Constants shared across the engine.

/// Application name, used for platform directories and environment variable prefixes.
pub const APP_NAME: &str = "grog";

/// Sentinel key written last into a target's cache directory.
///
/// Its presence marks a completed cache write, which also lets targets without
/// declared outputs register a successful run.
pub const CACHE_EXISTS_KEY: &str = "__grog_exists__";

/// Cache path under which content-addressed blobs are stored.
pub const CAS_PATH: &str = "cas";

/// Infix between a target name and its change hash in cache paths.
pub const CACHE_PATH_INFIX: &str = "_cache_";

/// Length of the workspace prefix derived from the workspace root hash.
pub const WORKSPACE_PREFIX_LEN: usize = 16;

/// Separator between the definition hash and the input content hash.
pub const CHANGE_HASH_SEPARATOR: char = '_';
