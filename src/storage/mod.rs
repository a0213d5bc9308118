//! On-disk store files: headers, record codecs, and the open store handle.

mod graph;
/// Versioned header shared by every store file.
pub mod header;
/// Label → node postings.
pub mod label_index;
/// Directory layout of a database.
pub mod layout;
/// Generation-specific record codecs.
pub mod record;
/// Streaming access to fixed-width record files.
pub mod record_file;

pub use graph::{read_graph, write_store, GraphData, Store};
pub use header::{
    read_header, StoreHeader, StoreVersion, CURRENT_GENERATION, FORMAT_NAME, HEADER_LEN,
    LEGACY_GENERATION,
};
pub use label_index::{read_label_index, write_label_index, LabelIndex};
pub use layout::{DatabaseLayout, StoreFile};
pub use record::{record_size, EdgeRecord, MetaRecord, NodeRecord, PropRecord, Record};
pub use record_file::{read_records, write_records, RecordFile, RecordWriter};
