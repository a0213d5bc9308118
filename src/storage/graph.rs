use std::fs;

use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, info};

use crate::primitives::lock::StoreLock;
use crate::primitives::txlog::TxLog;
use crate::storage::header::{read_header, StoreVersion};
use crate::storage::label_index::{write_label_index, LabelIndex};
use crate::storage::layout::{DatabaseLayout, StoreFile};
use crate::storage::record::{EdgeRecord, MetaRecord, NodeRecord, PropRecord};
use crate::storage::record_file::{read_records, write_records};
use crate::types::{LabelId, Lsn, NodeId, Result, SombraError, TypeId};

/// Full contents of a store, independent of its on-disk generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraphData {
    /// Store metadata.
    pub meta: MetaRecord,
    /// Node slots, indexed by id.
    pub nodes: Vec<NodeRecord>,
    /// Relationship slots.
    pub edges: Vec<EdgeRecord>,
    /// Property slots.
    pub props: Vec<PropRecord>,
    /// Whether a label index accompanies the node store.
    pub with_label_index: bool,
}

impl GraphData {
    /// An empty graph with a fresh random store id.
    pub fn empty() -> Self {
        Self {
            meta: MetaRecord {
                store_id: OsRng.next_u64(),
                last_committed_tx: 0,
            },
            nodes: Vec::new(),
            edges: Vec::new(),
            props: Vec::new(),
            with_label_index: true,
        }
    }

    /// A deterministic chain of `nodes` nodes linked by relationships, each
    /// node owning a two-property chain. Fits generation 1 for up to 255
    /// labels' worth of small ids.
    pub fn sample(nodes: u64) -> Self {
        let mut graph = Self::empty();
        graph.meta.last_committed_tx = nodes;
        for i in 0..nodes {
            let degree = u64::from(i > 0) + u64::from(i + 1 < nodes);
            graph.nodes.push(NodeRecord {
                in_use: true,
                label: LabelId((i % 4) as u32),
                first_prop: Some(2 * i),
                degree,
            });
            graph.props.push(PropRecord {
                in_use: true,
                key: 1 + (i % 5) as u32,
                value: i as i64 * 7 - 3,
                next: Some(2 * i + 1),
            });
            graph.props.push(PropRecord {
                in_use: true,
                key: 9,
                value: -(i as i64),
                next: None,
            });
            if i + 1 < nodes {
                graph.edges.push(EdgeRecord {
                    in_use: true,
                    ty: TypeId(1 + (i % 2) as u32),
                    src: NodeId(i),
                    dst: NodeId(i + 1),
                });
            }
        }
        graph
    }

    /// Label postings derived from the node store.
    pub fn label_index(&self) -> LabelIndex {
        LabelIndex::from_nodes(0, &self.nodes)
    }
}

/// Writes every store file of `graph` into `layout` in `version`.
///
/// The transaction log is left untouched.
pub fn write_store(layout: &DatabaseLayout, version: &StoreVersion, graph: &GraphData) -> Result<()> {
    fs::create_dir_all(layout.dir())?;
    write_records(
        &layout.store_file(StoreFile::Nodes),
        version.clone(),
        &graph.nodes,
    )?;
    write_records(
        &layout.store_file(StoreFile::Edges),
        version.clone(),
        &graph.edges,
    )?;
    write_records(
        &layout.store_file(StoreFile::Props),
        version.clone(),
        &graph.props,
    )?;
    if graph.with_label_index {
        write_label_index(
            &layout.store_file(StoreFile::LabelIndex),
            version.clone(),
            &graph.label_index(),
        )?;
    }
    write_records(
        &layout.store_file(StoreFile::Meta),
        version.clone(),
        std::slice::from_ref(&graph.meta),
    )?;
    debug!(
        dir = %layout.dir().display(),
        version = %version,
        nodes = graph.nodes.len(),
        edges = graph.edges.len(),
        "storage.write_store"
    );
    Ok(())
}

/// Reads every store file of `layout`, whatever generation each is in.
pub fn read_graph(layout: &DatabaseLayout) -> Result<GraphData> {
    let (_, metas) = read_records::<MetaRecord>(&layout.store_file(StoreFile::Meta))?;
    let meta = match metas.as_slice() {
        [meta] => meta.clone(),
        _ => return Err(SombraError::Corruption("meta store must hold exactly one record")),
    };
    let (_, nodes) = read_records::<NodeRecord>(&layout.store_file(StoreFile::Nodes))?;
    let (_, edges) = read_records::<EdgeRecord>(&layout.store_file(StoreFile::Edges))?;
    let (_, props) = read_records::<PropRecord>(&layout.store_file(StoreFile::Props))?;
    Ok(GraphData {
        meta,
        nodes,
        edges,
        props,
        with_label_index: layout.store_file(StoreFile::LabelIndex).exists(),
    })
}

/// An open store in the current format.
///
/// Holds the store lock for its whole lifetime. Dropping a store without
/// calling [`Store::close`] leaves the log without a closing checkpoint, the
/// same state a crash would leave behind.
pub struct Store {
    layout: DatabaseLayout,
    version: StoreVersion,
    meta: Mutex<MetaRecord>,
    txlog: TxLog,
    _lock: StoreLock,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("dir", &self.layout.dir())
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Creates a new current-format store populated with `graph` and a clean log.
    pub fn create(layout: &DatabaseLayout, graph: &GraphData) -> Result<Self> {
        if layout.has_store() {
            return Err(SombraError::InvalidOwned(format!(
                "{} already holds a store",
                layout.dir().display()
            )));
        }
        fs::create_dir_all(layout.dir())?;
        let lock = StoreLock::try_acquire(layout.lock_file())?;
        let version = StoreVersion::current();
        write_store(layout, &version, graph)?;
        let txlog = TxLog::open(layout.txlog_dir())?;
        txlog.checkpoint()?;
        info!(dir = %layout.dir().display(), version = %version, "storage.store.create");
        Ok(Self {
            layout: layout.clone(),
            version,
            meta: Mutex::new(graph.meta.clone()),
            txlog,
            _lock: lock,
        })
    }

    /// Opens an existing store, taking its lock.
    pub fn open(layout: &DatabaseLayout) -> Result<Self> {
        let lock = StoreLock::try_acquire(layout.lock_file())?;
        Self::open_with_lock(layout, lock)
    }

    /// Opens an existing store under a lock the caller already holds.
    ///
    /// Every present store file must be in the current format.
    pub fn open_with_lock(layout: &DatabaseLayout, lock: StoreLock) -> Result<Self> {
        let version = StoreVersion::current();
        for file in StoreFile::ALL {
            let path = layout.store_file(file);
            if !path.exists() {
                if file.is_optional() {
                    continue;
                }
                return Err(SombraError::CorruptionOwned(format!(
                    "missing store file {}",
                    path.display()
                )));
            }
            let header = read_header(&path)?;
            if header.version != version {
                return Err(SombraError::InvalidOwned(format!(
                    "{file} is in format {}, this build opens {version}",
                    header.version
                )));
            }
        }
        let (_, metas) = read_records::<MetaRecord>(&layout.store_file(StoreFile::Meta))?;
        let meta = metas
            .into_iter()
            .next()
            .ok_or(SombraError::Corruption("meta store is empty"))?;
        let txlog = TxLog::open(layout.txlog_dir())?;
        info!(
            dir = %layout.dir().display(),
            version = %version,
            last_tx = meta.last_committed_tx,
            "storage.store.open"
        );
        Ok(Self {
            layout: layout.clone(),
            version,
            meta: Mutex::new(meta),
            txlog,
            _lock: lock,
        })
    }

    /// Store directory layout.
    pub fn layout(&self) -> &DatabaseLayout {
        &self.layout
    }

    /// Format of the open store.
    pub fn version(&self) -> &StoreVersion {
        &self.version
    }

    /// Snapshot of the metadata record.
    pub fn meta(&self) -> MetaRecord {
        self.meta.lock().clone()
    }

    /// Reads the store's current contents.
    pub fn read_graph(&self) -> Result<GraphData> {
        read_graph(&self.layout)
    }

    /// Durably logs one transaction.
    pub fn log_transaction(&self, command: &[u8]) -> Result<Lsn> {
        let lsn = self.txlog.append_transaction(command)?;
        self.meta.lock().last_committed_tx += 1;
        Ok(lsn)
    }

    /// Persists the metadata and ends the log with a checkpoint.
    pub fn close(&self) -> Result<Lsn> {
        let meta = self.meta();
        write_records(
            &self.layout.store_file(StoreFile::Meta),
            self.version.clone(),
            std::slice::from_ref(&meta),
        )?;
        let lsn = self.txlog.checkpoint()?;
        info!(
            dir = %self.layout.dir().display(),
            checkpoint = lsn.0,
            "storage.store.close"
        );
        Ok(lsn)
    }

    /// Transaction log of this store.
    pub fn txlog(&self) -> &TxLog {
        &self.txlog
    }
}
