//! bioetl-determinism — Makes every artifact a pure function of its inputs.
//!
//! Same input rows and config ⇒ byte-identical dataset, quality report and
//! manifest. The pieces, in the order a write applies them:
//!
//! 1. [`canonical`]: trim, case-normalize identifiers, fixed float rendering
//! 2. [`sort`]: stable sort on configured keys with explicit null placement
//! 3. [`hash`]: `hash_row` / `hash_business_key` (SHA-256)
//! 4. [`columns`]: fixed column order, fatal on drift
//! 5. [`atomic`]: temp file, fsync, rename
//! 6. [`writer`]: the CSV/YAML/JSON artifact set

pub mod atomic;
pub mod canonical;
pub mod columns;
pub mod config;
pub mod error;
pub mod hash;
pub mod sort;
pub mod writer;

pub use atomic::{atomic_write, atomic_write_all};
pub use canonical::{render, Canonicalizer};
pub use columns::check_column_order;
pub use config::{CaseRule, DeterminismConfig, IdentifierColumn, NullPosition};
pub use error::{DeterminismError, Result};
pub use hash::{attach_hashes, hash_business_key, hash_row};
pub use sort::stable_sort;
pub use writer::{Artifact, ArtifactKind, ArtifactWriter, MetaInputs, RunManifest, Table, WriteOutcome};
