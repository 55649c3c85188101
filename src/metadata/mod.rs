//! Side metadata stored in git notes: suggestions, CI attestations and
//! per-change records.

pub mod attestations;
pub mod change;
pub mod suggestions;

pub use attestations::{Attestation, AttestationInput, AttestationStore, AttestationView};
pub use change::{ChangeCheckpoint, ChangeIdNote, ChangeMeta, ChangeMetaStore, PromoteEvent};
pub use suggestions::{NewSuggestion, Suggestion, SuggestionStatus, SuggestionStore};
