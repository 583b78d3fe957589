//! bioetl-common — Value, record and run types shared by every bioetl crate.

pub mod error;
pub mod value;
pub mod record;
pub mod run;
pub mod clock;
pub mod digest;

// Re-export commonly used types
pub use error::{BioetlError, Result};
pub use value::{Value, ValueKind};
pub use record::{FallbackMetadata, Record, META_COLUMNS};
pub use run::Run;
pub use clock::{Clock, ManualClock, SystemClock};
pub use digest::{canonical_json, sha256_hex};
