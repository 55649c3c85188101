//! Identity and naming: change ids, ref names and commit trailers.

pub mod change_id;
pub mod refs;
pub mod trailers;

pub use change_id::ChangeId;
pub use refs::RefKind;
pub use trailers::{CommitMessage, Trailer};
