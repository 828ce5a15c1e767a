//! Type-descriptor decoding (spec §4.2) and the process-wide descriptor
//! cache (spec §3 invariants, §9 "process-wide descriptor cache").
//!
//! A descriptor blob is a flat sequence of sub-descriptors; each one may
//! reference an earlier sub-descriptor by its position in that same blob.
//! We decode the flat sequence first (so positional references always
//! resolve to something already built) and the last entry is the root of
//! the tree, exactly as the server emits it.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::Error;
use crate::protocol::buffer::BufferReader;
use crate::protocol::{ProtocolVersion, V2_0};

pub type DescriptorId = uuid::Uuid;

/// Declared cardinality of an object/input field (spec §3: "Object
/// (ordered named fields with cardinality flags)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCardinality {
    One,
    AtMostOne,
    Many,
    AtLeastOne,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectField {
    pub name: String,
    pub type_desc: Arc<Descriptor>,
    pub cardinality: FieldCardinality,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedTupleField {
    pub name: String,
    pub type_desc: Arc<Descriptor>,
}

/// How a v2 `Compound` descriptor's components combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundOp {
    Union,
    Intersection,
}

/// A tagged sum describing a value's wire type (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    Set {
        id: DescriptorId,
        element_type: Arc<Descriptor>,
    },
    Object {
        id: DescriptorId,
        fields: Vec<ObjectField>,
    },
    Scalar {
        id: DescriptorId,
        name: Option<String>,
        base_type: Option<Arc<Descriptor>>,
    },
    Tuple {
        id: DescriptorId,
        elements: Vec<Arc<Descriptor>>,
    },
    NamedTuple {
        id: DescriptorId,
        fields: Vec<NamedTupleField>,
    },
    Array {
        id: DescriptorId,
        element_type: Arc<Descriptor>,
    },
    Enum {
        id: DescriptorId,
        members: Vec<String>,
    },
    /// Describes the arguments of a query (spec §3: "Input (for
    /// arguments)").
    Input {
        id: DescriptorId,
        fields: Vec<ObjectField>,
    },
    Range {
        id: DescriptorId,
        element_type: Arc<Descriptor>,
    },
    /// v2-only: an object type descriptor carrying schema metadata.
    ObjectType {
        id: DescriptorId,
        name: String,
        schema_defined: bool,
        ancestors: Vec<DescriptorId>,
    },
    /// v2-only: a union/intersection of other descriptors.
    Compound {
        id: DescriptorId,
        op: CompoundOp,
        components: Vec<Arc<Descriptor>>,
    },
}

impl Descriptor {
    pub fn id(&self) -> DescriptorId {
        match self {
            Descriptor::Set { id, .. }
            | Descriptor::Object { id, .. }
            | Descriptor::Scalar { id, .. }
            | Descriptor::Tuple { id, .. }
            | Descriptor::NamedTuple { id, .. }
            | Descriptor::Array { id, .. }
            | Descriptor::Enum { id, .. }
            | Descriptor::Input { id, .. }
            | Descriptor::Range { id, .. }
            | Descriptor::ObjectType { id, .. }
            | Descriptor::Compound { id, .. } => *id,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Set = 0,
    Object = 1,
    Scalar = 2,
    BaseScalar = 3,
    Tuple = 4,
    NamedTuple = 5,
    Array = 6,
    Enum = 7,
    Input = 8,
    Range = 9,
    ObjectType = 10,
    Compound = 11,
}

impl Tag {
    fn from_u8(v: u8) -> Result<Self, Error> {
        Ok(match v {
            0 => Tag::Set,
            1 => Tag::Object,
            2 => Tag::Scalar,
            3 => Tag::BaseScalar,
            4 => Tag::Tuple,
            5 => Tag::NamedTuple,
            6 => Tag::Array,
            7 => Tag::Enum,
            8 => Tag::Input,
            9 => Tag::Range,
            10 => Tag::ObjectType,
            11 => Tag::Compound,
            other => {
                return Err(Error::BinaryProtocol(format!(
                    "unknown descriptor type tag {other}"
                )))
            }
        })
    }

    fn is_v2_only(&self) -> bool {
        matches!(self, Tag::ObjectType | Tag::Compound)
    }
}

fn field_cardinality(flags: u8) -> FieldCardinality {
    match flags & 0b11 {
        0 => FieldCardinality::One,
        1 => FieldCardinality::AtMostOne,
        2 => FieldCardinality::Many,
        _ => FieldCardinality::AtLeastOne,
    }
}

/// Decodes a full descriptor blob into a flat list (position = index),
/// resolving positional references into an owned tree as it goes. The
/// root of the tree is the last entry decoded.
fn decode_inner(
    data: &[u8],
    version: ProtocolVersion,
    allow_v2: bool,
) -> Result<Vec<Arc<Descriptor>>, Error> {
    let mut r = BufferReader::new(data);
    let mut items: Vec<Arc<Descriptor>> = Vec::new();

    while !r.is_empty() {
        let tag = Tag::from_u8(r.pop_u8()?)?;
        if tag.is_v2_only() && !allow_v2 {
            return Err(Error::BinaryProtocol(format!(
                "descriptor tag {tag:?} requires protocol >= {V2_0}, got {version}"
            )));
        }

        let id = r.pop_uuid()?;
        let desc = decode_one(tag, id, &mut r, &items)?;
        items.push(Arc::new(desc));
    }

    if items.is_empty() {
        return Err(Error::BinaryProtocol("empty descriptor blob".into()));
    }

    Ok(items)
}

fn resolve(items: &[Arc<Descriptor>], pos: u16) -> Result<Arc<Descriptor>, Error> {
    items
        .get(pos as usize)
        .cloned()
        .ok_or_else(|| Error::BinaryProtocol(format!("descriptor position {pos} out of range")))
}

fn decode_one(
    tag: Tag,
    id: DescriptorId,
    r: &mut BufferReader<'_>,
    items: &[Arc<Descriptor>],
) -> Result<Descriptor, Error> {
    Ok(match tag {
        Tag::Set => Descriptor::Set {
            id,
            element_type: resolve(items, r.pop_u16()?)?,
        },
        Tag::Array => Descriptor::Array {
            id,
            element_type: resolve(items, r.pop_u16()?)?,
        },
        Tag::Range => Descriptor::Range {
            id,
            element_type: resolve(items, r.pop_u16()?)?,
        },
        Tag::BaseScalar => Descriptor::Scalar {
            id,
            name: None,
            base_type: None,
        },
        Tag::Scalar => {
            let name = r.pop_string()?.to_owned();
            let has_base = r.pop_bool()?;
            let base_type = if has_base {
                Some(resolve(items, r.pop_u16()?)?)
            } else {
                None
            };
            Descriptor::Scalar {
                id,
                name: Some(name),
                base_type,
            }
        }
        Tag::Tuple => {
            let n = r.pop_u16()?;
            let mut elements = Vec::with_capacity(n as usize);
            for _ in 0..n {
                elements.push(resolve(items, r.pop_u16()?)?);
            }
            Descriptor::Tuple { id, elements }
        }
        Tag::NamedTuple => {
            let n = r.pop_u16()?;
            let mut fields = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let name = r.pop_string()?.to_owned();
                let type_desc = resolve(items, r.pop_u16()?)?;
                fields.push(NamedTupleField { name, type_desc });
            }
            Descriptor::NamedTuple { id, fields }
        }
        Tag::Object | Tag::Input => {
            let n = r.pop_u16()?;
            let mut fields = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let flags = r.pop_u8()?;
                let name = r.pop_string()?.to_owned();
                let type_desc = resolve(items, r.pop_u16()?)?;
                fields.push(ObjectField {
                    name,
                    type_desc,
                    cardinality: field_cardinality(flags),
                });
            }
            if tag == Tag::Object {
                Descriptor::Object { id, fields }
            } else {
                Descriptor::Input { id, fields }
            }
        }
        Tag::Enum => {
            let n = r.pop_u16()?;
            let mut members = Vec::with_capacity(n as usize);
            for _ in 0..n {
                members.push(r.pop_string()?.to_owned());
            }
            Descriptor::Enum { id, members }
        }
        Tag::ObjectType => {
            let name = r.pop_string()?.to_owned();
            let schema_defined = r.pop_bool()?;
            let n = r.pop_u16()?;
            let mut ancestors = Vec::with_capacity(n as usize);
            for _ in 0..n {
                ancestors.push(r.pop_uuid()?);
            }
            Descriptor::ObjectType {
                id,
                name,
                schema_defined,
                ancestors,
            }
        }
        Tag::Compound => {
            let op = if r.pop_u8()? == 0 {
                CompoundOp::Union
            } else {
                CompoundOp::Intersection
            };
            let n = r.pop_u16()?;
            let mut components = Vec::with_capacity(n as usize);
            for _ in 0..n {
                components.push(resolve(items, r.pop_u16()?)?);
            }
            Descriptor::Compound {
                id,
                op,
                components,
            }
        }
    })
}

/// Decodes a descriptor blob from a pre-2.0 server. Returns the root
/// descriptor (the last one in the blob).
pub fn decode_v1(data: &[u8], version: ProtocolVersion) -> Result<Arc<Descriptor>, Error> {
    let items = decode_inner(data, version, false)?;
    Ok(items.last().unwrap().clone())
}

/// Decodes a descriptor blob from a 2.0+ server, allowing the v2-only
/// `ObjectType`/`Compound` variants.
pub fn decode_v2(data: &[u8], version: ProtocolVersion) -> Result<Arc<Descriptor>, Error> {
    let items = decode_inner(data, version, true)?;
    Ok(items.last().unwrap().clone())
}

/// Decodes using the entry point appropriate for `version` (spec §4.2).
pub fn decode(data: &[u8], version: ProtocolVersion) -> Result<Arc<Descriptor>, Error> {
    if version.at_least(V2_0) {
        decode_v2(data, version)
    } else {
        decode_v1(data, version)
    }
}

/// Process-wide (or per-client, if constructed directly rather than via
/// [`DescriptorCache::global`]) cache of decoded descriptors, keyed by id.
/// Read-mostly; writers only occur on first encounter of a new id (spec
/// §5).
#[derive(Debug, Default)]
pub struct DescriptorCache {
    inner: RwLock<HashMap<DescriptorId, Arc<Descriptor>>>,
}

impl DescriptorCache {
    pub fn new() -> Arc<Self> {
        Arc::new(DescriptorCache::default())
    }

    /// A lazily-initialized, process-wide singleton. Prefer
    /// [`DescriptorCache::new`] and threading an explicit handle through a
    /// client constructor when isolation matters, e.g. in tests (spec §9).
    pub fn global() -> &'static Arc<DescriptorCache> {
        static GLOBAL: OnceLock<Arc<DescriptorCache>> = OnceLock::new();
        GLOBAL.get_or_init(DescriptorCache::new)
    }

    pub fn get(&self, id: DescriptorId) -> Option<Arc<Descriptor>> {
        self.inner.read().unwrap().get(&id).cloned()
    }

    pub fn contains(&self, id: DescriptorId) -> bool {
        self.inner.read().unwrap().contains_key(&id)
    }

    /// Decodes `data` if `id` isn't already cached, interning every
    /// sub-descriptor encountered along the way. A cache hit on the root
    /// id short-circuits the decode entirely (spec §4.2).
    pub fn decode_and_intern(
        &self,
        id: DescriptorId,
        data: &[u8],
        version: ProtocolVersion,
    ) -> Result<Arc<Descriptor>, Error> {
        if let Some(cached) = self.get(id) {
            return Ok(cached);
        }

        let items = decode_inner(data, version, version.at_least(V2_0))?;
        let root = items.last().unwrap().clone();

        if root.id() != id {
            return Err(Error::BinaryProtocol(format!(
                "descriptor id mismatch: header said {id}, decoded root is {}",
                root.id()
            )));
        }

        let mut guard = self.inner.write().unwrap();
        for item in items {
            guard.entry(item.id()).or_insert(item);
        }

        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::buffer::BufferWriter;
    use uuid::Uuid;

    fn encode_base_scalar(id: Uuid) -> Vec<u8> {
        let mut w = BufferWriter::new();
        w.write_u8(Tag::BaseScalar as u8);
        w.write_uuid(&id);
        w.finish().to_vec()
    }

    fn encode_array(array_id: Uuid, element_pos: u16, element: Vec<u8>) -> Vec<u8> {
        let mut w = BufferWriter::new();
        w.write_bytes(&element);
        w.write_u8(Tag::Array as u8);
        w.write_uuid(&array_id);
        w.write_u16(element_pos);
        w.finish().to_vec()
    }

    #[test]
    fn decodes_base_scalar() {
        let id = Uuid::new_v4();
        let blob = encode_base_scalar(id);
        let desc = decode_v1(&blob, V2_0).unwrap();
        assert_eq!(desc.id(), id);
        assert!(matches!(*desc, Descriptor::Scalar { base_type: None, name: None, .. }));
    }

    #[test]
    fn decodes_array_of_scalar_by_position() {
        let scalar_id = Uuid::new_v4();
        let array_id = Uuid::new_v4();
        let blob = encode_array(array_id, 0, encode_base_scalar(scalar_id));

        let desc = decode_v2(&blob, V2_0).unwrap();
        match &*desc {
            Descriptor::Array { id, element_type } => {
                assert_eq!(*id, array_id);
                assert_eq!(element_type.id(), scalar_id);
            }
            other => panic!("expected Array, got {other:?}"),
        }
    }

    #[test]
    fn v2_only_tag_rejected_pre_2_0() {
        let mut w = BufferWriter::new();
        w.write_u8(Tag::ObjectType as u8);
        w.write_uuid(&Uuid::new_v4());
        w.write_string("default::Foo");
        w.write_bool(true);
        w.write_u16(0);
        let blob = w.finish();

        let err = decode_v1(&blob, V0_X_FOR_TEST).unwrap_err();
        assert!(matches!(err, Error::BinaryProtocol(_)));
    }

    const V0_X_FOR_TEST: ProtocolVersion = super::super::V0_X;

    #[test]
    fn cache_hit_short_circuits_decode() {
        let cache = DescriptorCache::new();
        let id = Uuid::new_v4();
        let blob = encode_base_scalar(id);

        let first = cache.decode_and_intern(id, &blob, V2_0).unwrap();
        assert_eq!(first.id(), id);
        assert!(cache.contains(id));

        // Garbage input would fail to decode, but the cache hit means we
        // never try.
        let second = cache.decode_and_intern(id, b"not a real blob", V2_0).unwrap();
        assert_eq!(second.id(), id);
    }

    #[test]
    fn mismatched_root_id_is_rejected() {
        let cache = DescriptorCache::new();
        let real_id = Uuid::new_v4();
        let claimed_id = Uuid::new_v4();
        let blob = encode_base_scalar(real_id);

        let err = cache.decode_and_intern(claimed_id, &blob, V2_0).unwrap_err();
        assert!(matches!(err, Error::BinaryProtocol(_)));
    }
}
