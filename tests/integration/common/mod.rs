#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;

use sombra_upgrade::{
    config::KernelConfig,
    primitives::txlog::TxLog,
    storage::{read_header, write_store, DatabaseLayout, GraphData, StoreVersion},
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// A generation-1 store whose log ends with a checkpoint.
pub fn legacy_db(root: &Path, name: &str, nodes: u64) -> (DatabaseLayout, GraphData) {
    let layout = DatabaseLayout::new(root.join(name));
    let graph = GraphData::sample(nodes);
    write_store(&layout, &StoreVersion::legacy(), &graph).expect("write legacy store");
    let log = TxLog::open(layout.txlog_dir()).expect("open txlog");
    log.append_transaction(b"seed").expect("log seed");
    log.checkpoint().expect("checkpoint");
    (layout, graph)
}

/// Leaves a committed transaction after the last checkpoint, as a crash would.
pub fn leave_unclean(layout: &DatabaseLayout) {
    let log = TxLog::open(layout.txlog_dir()).expect("open txlog");
    log.append_transaction(b"in flight").expect("log transaction");
}

pub fn config(allow_upgrade: bool) -> KernelConfig {
    let mut config = KernelConfig::default();
    config.allow_upgrade = allow_upgrade;
    config.migration.index_population_batch = 32;
    config
}

/// Version of every present store file.
pub fn file_versions(layout: &DatabaseLayout) -> Vec<StoreVersion> {
    layout
        .present_store_files()
        .into_iter()
        .map(|file| {
            read_header(&layout.store_file(file))
                .expect("read header")
                .version
        })
        .collect()
}

pub fn all_at(layout: &DatabaseLayout, version: &StoreVersion) -> bool {
    let versions = file_versions(layout);
    !versions.is_empty() && versions.iter().all(|v| v == version)
}
