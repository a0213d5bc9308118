//! Concrete migration participants.

mod label_index;
mod record_store;

pub use label_index::LabelIndexParticipant;
pub use record_store::RecordStoreParticipant;
