//! Fixed-width record codecs for each supported generation.
//!
//! Generation 1 packs records into 12 little-endian bytes with 32-bit ids and
//! 8-bit label/type/key tokens. Generation 2 widens every field and switches to
//! big-endian, giving 24-byte records. Record pointers are stored as `id + 1`
//! so that zero means "none".

use std::fmt::Debug;

use crate::storage::header::{CURRENT_GENERATION, LEGACY_GENERATION};
use crate::storage::layout::StoreFile;
use crate::types::{LabelId, NodeId, Result, SombraError, TypeId};

/// Record width of generation 1 stores.
pub const LEGACY_RECORD_SIZE: usize = 12;
/// Record width of generation 2 stores.
pub const CURRENT_RECORD_SIZE: usize = 24;

const FLAG_IN_USE: u8 = 0x01;

/// A fixed-width record stored in one of the record files.
pub trait Record: Sized + Clone + Debug + Send + Sync + 'static {
    /// Store file holding records of this type.
    const FILE: StoreFile;

    /// Encodes into `buf`, which is exactly [`record_size`] bytes.
    fn encode(&self, generation: u16, buf: &mut [u8]) -> Result<()>;

    /// Decodes from `buf`, which is exactly [`record_size`] bytes.
    fn decode(generation: u16, buf: &[u8]) -> Result<Self>;
}

/// Width of one record in the given generation.
pub fn record_size(generation: u16) -> Result<usize> {
    match generation {
        LEGACY_GENERATION => Ok(LEGACY_RECORD_SIZE),
        CURRENT_GENERATION => Ok(CURRENT_RECORD_SIZE),
        other => Err(SombraError::InvalidOwned(format!(
            "no record codec for generation {other}"
        ))),
    }
}

/// Store-wide metadata, always a single record.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MetaRecord {
    /// Random identity assigned when the store was created.
    pub store_id: u64,
    /// Highest transaction id applied to the store files.
    pub last_committed_tx: u64,
}

/// A node slot.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct NodeRecord {
    /// Whether the slot holds a live node.
    pub in_use: bool,
    /// Single label, `LabelId(0)` when unlabeled.
    pub label: LabelId,
    /// Head of the node's property chain.
    pub first_prop: Option<u64>,
    /// Number of relationship endpoints touching this node.
    pub degree: u64,
}

/// A relationship slot.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct EdgeRecord {
    /// Whether the slot holds a live relationship.
    pub in_use: bool,
    /// Relationship type.
    pub ty: TypeId,
    /// Start node.
    pub src: NodeId,
    /// End node.
    pub dst: NodeId,
}

/// One link of a property chain.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PropRecord {
    /// Whether the slot holds a live property.
    pub in_use: bool,
    /// Property key token.
    pub key: u32,
    /// Integer value.
    pub value: i64,
    /// Next property in the chain.
    pub next: Option<u64>,
}

impl Record for MetaRecord {
    const FILE: StoreFile = StoreFile::Meta;

    fn encode(&self, generation: u16, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        match generation {
            LEGACY_GENERATION => {
                buf[0..8].copy_from_slice(&self.store_id.to_le_bytes());
                buf[8..12].copy_from_slice(&narrow_u32(self.last_committed_tx, "tx id")?.to_le_bytes());
            }
            CURRENT_GENERATION => {
                buf[0..8].copy_from_slice(&self.store_id.to_be_bytes());
                buf[8..16].copy_from_slice(&self.last_committed_tx.to_be_bytes());
            }
            other => return Err(unsupported(other)),
        }
        Ok(())
    }

    fn decode(generation: u16, buf: &[u8]) -> Result<Self> {
        match generation {
            LEGACY_GENERATION => Ok(Self {
                store_id: le_u64(buf, 0),
                last_committed_tx: u64::from(le_u32(buf, 8)),
            }),
            CURRENT_GENERATION => {
                ensure_zero(&buf[16..24])?;
                Ok(Self {
                    store_id: be_u64(buf, 0),
                    last_committed_tx: be_u64(buf, 8),
                })
            }
            other => Err(unsupported(other)),
        }
    }
}

impl Record for NodeRecord {
    const FILE: StoreFile = StoreFile::Nodes;

    fn encode(&self, generation: u16, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        buf[0] = flags(self.in_use);
        let first_prop = encode_ptr(self.first_prop)?;
        match generation {
            LEGACY_GENERATION => {
                buf[1] = narrow_u8(self.label.0, "label")?;
                buf[4..8].copy_from_slice(&narrow_u32(first_prop, "property pointer")?.to_le_bytes());
                buf[8..12].copy_from_slice(&narrow_u32(self.degree, "degree")?.to_le_bytes());
            }
            CURRENT_GENERATION => {
                buf[4..8].copy_from_slice(&self.label.0.to_be_bytes());
                buf[8..16].copy_from_slice(&first_prop.to_be_bytes());
                buf[16..24].copy_from_slice(&self.degree.to_be_bytes());
            }
            other => return Err(unsupported(other)),
        }
        Ok(())
    }

    fn decode(generation: u16, buf: &[u8]) -> Result<Self> {
        let in_use = parse_flags(buf[0])?;
        match generation {
            LEGACY_GENERATION => {
                ensure_zero(&buf[2..4])?;
                Ok(Self {
                    in_use,
                    label: LabelId(u32::from(buf[1])),
                    first_prop: decode_ptr(u64::from(le_u32(buf, 4))),
                    degree: u64::from(le_u32(buf, 8)),
                })
            }
            CURRENT_GENERATION => {
                ensure_zero(&buf[1..4])?;
                Ok(Self {
                    in_use,
                    label: LabelId(be_u32(buf, 4)),
                    first_prop: decode_ptr(be_u64(buf, 8)),
                    degree: be_u64(buf, 16),
                })
            }
            other => Err(unsupported(other)),
        }
    }
}

impl Record for EdgeRecord {
    const FILE: StoreFile = StoreFile::Edges;

    fn encode(&self, generation: u16, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        buf[0] = flags(self.in_use);
        match generation {
            LEGACY_GENERATION => {
                buf[1] = narrow_u8(self.ty.0, "relationship type")?;
                buf[4..8].copy_from_slice(&narrow_u32(self.src.0, "start node")?.to_le_bytes());
                buf[8..12].copy_from_slice(&narrow_u32(self.dst.0, "end node")?.to_le_bytes());
            }
            CURRENT_GENERATION => {
                buf[4..8].copy_from_slice(&self.ty.0.to_be_bytes());
                buf[8..16].copy_from_slice(&self.src.0.to_be_bytes());
                buf[16..24].copy_from_slice(&self.dst.0.to_be_bytes());
            }
            other => return Err(unsupported(other)),
        }
        Ok(())
    }

    fn decode(generation: u16, buf: &[u8]) -> Result<Self> {
        let in_use = parse_flags(buf[0])?;
        match generation {
            LEGACY_GENERATION => {
                ensure_zero(&buf[2..4])?;
                Ok(Self {
                    in_use,
                    ty: TypeId(u32::from(buf[1])),
                    src: NodeId(u64::from(le_u32(buf, 4))),
                    dst: NodeId(u64::from(le_u32(buf, 8))),
                })
            }
            CURRENT_GENERATION => {
                ensure_zero(&buf[1..4])?;
                Ok(Self {
                    in_use,
                    ty: TypeId(be_u32(buf, 4)),
                    src: NodeId(be_u64(buf, 8)),
                    dst: NodeId(be_u64(buf, 16)),
                })
            }
            other => Err(unsupported(other)),
        }
    }
}

impl Record for PropRecord {
    const FILE: StoreFile = StoreFile::Props;

    fn encode(&self, generation: u16, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        buf[0] = flags(self.in_use);
        let next = encode_ptr(self.next)?;
        match generation {
            LEGACY_GENERATION => {
                buf[1] = narrow_u8(self.key, "property key")?;
                let value = i32::try_from(self.value).map_err(|_| {
                    SombraError::InvalidOwned(format!(
                        "property value {} does not fit a generation 1 record",
                        self.value
                    ))
                })?;
                buf[4..8].copy_from_slice(&value.to_le_bytes());
                buf[8..12].copy_from_slice(&narrow_u32(next, "property pointer")?.to_le_bytes());
            }
            CURRENT_GENERATION => {
                buf[4..8].copy_from_slice(&self.key.to_be_bytes());
                buf[8..16].copy_from_slice(&self.value.to_be_bytes());
                buf[16..24].copy_from_slice(&next.to_be_bytes());
            }
            other => return Err(unsupported(other)),
        }
        Ok(())
    }

    fn decode(generation: u16, buf: &[u8]) -> Result<Self> {
        let in_use = parse_flags(buf[0])?;
        match generation {
            LEGACY_GENERATION => {
                ensure_zero(&buf[2..4])?;
                Ok(Self {
                    in_use,
                    key: u32::from(buf[1]),
                    value: i64::from(le_u32(buf, 4) as i32),
                    next: decode_ptr(u64::from(le_u32(buf, 8))),
                })
            }
            CURRENT_GENERATION => {
                ensure_zero(&buf[1..4])?;
                Ok(Self {
                    in_use,
                    key: be_u32(buf, 4),
                    value: be_u64(buf, 8) as i64,
                    next: decode_ptr(be_u64(buf, 16)),
                })
            }
            other => Err(unsupported(other)),
        }
    }
}

fn flags(in_use: bool) -> u8 {
    if in_use {
        FLAG_IN_USE
    } else {
        0
    }
}

fn parse_flags(raw: u8) -> Result<bool> {
    if raw & !FLAG_IN_USE != 0 {
        return Err(SombraError::Corruption("record flags carry unknown bits"));
    }
    Ok(raw & FLAG_IN_USE != 0)
}

fn encode_ptr(ptr: Option<u64>) -> Result<u64> {
    match ptr {
        None => Ok(0),
        Some(id) => id
            .checked_add(1)
            .ok_or(SombraError::Invalid("record pointer overflows")),
    }
}

fn decode_ptr(raw: u64) -> Option<u64> {
    raw.checked_sub(1)
}

fn narrow_u8(value: u32, what: &str) -> Result<u8> {
    u8::try_from(value).map_err(|_| {
        SombraError::InvalidOwned(format!(
            "{what} {value} does not fit a generation 1 record"
        ))
    })
}

fn narrow_u32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        SombraError::InvalidOwned(format!(
            "{what} {value} does not fit a generation 1 record"
        ))
    })
}

fn ensure_zero(reserved: &[u8]) -> Result<()> {
    if reserved.iter().any(|b| *b != 0) {
        return Err(SombraError::Corruption("reserved record bytes are not zero"));
    }
    Ok(())
}

fn unsupported(generation: u16) -> SombraError {
    SombraError::InvalidOwned(format!("no record codec for generation {generation}"))
}

fn le_u32(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(raw)
}

fn le_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(raw)
}

fn be_u32(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_be_bytes(raw)
}

fn be_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn convert<R: Record + PartialEq>(record: &R) -> Result<R> {
        let mut legacy = [0u8; LEGACY_RECORD_SIZE];
        record.encode(LEGACY_GENERATION, &mut legacy)?;
        let decoded = R::decode(LEGACY_GENERATION, &legacy)?;
        let mut current = [0u8; CURRENT_RECORD_SIZE];
        decoded.encode(CURRENT_GENERATION, &mut current)?;
        R::decode(CURRENT_GENERATION, &current)
    }

    #[test]
    fn legacy_node_layout_is_little_endian() -> Result<()> {
        let node = NodeRecord {
            in_use: true,
            label: LabelId(7),
            first_prop: Some(0),
            degree: 0x0102,
        };
        let mut buf = [0u8; LEGACY_RECORD_SIZE];
        node.encode(LEGACY_GENERATION, &mut buf)?;
        assert_eq!(buf, [1, 7, 0, 0, 1, 0, 0, 0, 0x02, 0x01, 0, 0]);
        Ok(())
    }

    #[test]
    fn legacy_rejects_values_that_do_not_fit() {
        let edge = EdgeRecord {
            in_use: true,
            ty: TypeId(1),
            src: NodeId(u64::from(u32::MAX) + 1),
            dst: NodeId(0),
        };
        let mut buf = [0u8; LEGACY_RECORD_SIZE];
        assert!(matches!(
            edge.encode(LEGACY_GENERATION, &mut buf),
            Err(SombraError::InvalidOwned(_))
        ));
    }

    #[test]
    fn unknown_flag_bits_are_corruption() {
        let mut buf = [0u8; CURRENT_RECORD_SIZE];
        buf[0] = 0x80;
        assert!(NodeRecord::decode(CURRENT_GENERATION, &buf).is_err());
    }

    #[test]
    fn negative_property_values_survive_widening() -> Result<()> {
        let prop = PropRecord {
            in_use: true,
            key: 3,
            value: -42,
            next: None,
        };
        assert_eq!(convert(&prop)?, prop);
        Ok(())
    }

    proptest! {
        #[test]
        fn widening_preserves_legacy_representable_nodes(
            in_use in any::<bool>(),
            label in 0u32..=255,
            first_prop in proptest::option::of(0u64..u64::from(u32::MAX)),
            degree in 0u64..=u64::from(u32::MAX),
        ) {
            let node = NodeRecord { in_use, label: LabelId(label), first_prop, degree };
            prop_assert_eq!(convert(&node).unwrap(), node);
        }
    }
}
