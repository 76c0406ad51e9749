//! Offline facility/event descriptors (§3), minus the `.event` file parser.
//!
//! The upstream parser/codegen tool that turns a `.event` file into this
//! model stays excluded (§1); what's here is the in-memory type model it
//! would otherwise produce, plus a single built-in facility so a trace can
//! be decoded end to end in tests without that external tool.

use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

/// Size code for integer-like leaf types, per §3's `{0..6}` enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizeCode {
    Bits8,
    Bits16,
    Bits32,
    Bits64,
    Short,
    Int,
    Long,
}

impl SizeCode {
    /// Byte width this size code occupies on the host, per C's `short`/`int`/`long`.
    pub fn byte_len(self) -> usize {
        match self {
            SizeCode::Bits8 => 1,
            SizeCode::Bits16 => 2,
            SizeCode::Bits32 => 4,
            SizeCode::Bits64 => 8,
            SizeCode::Short => 2,
            SizeCode::Int => 4,
            SizeCode::Long => 8,
        }
    }
}

/// A tagged variant over the type shapes an event field can take (§3).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeDescriptor {
    Int(SizeCode),
    Uint(SizeCode),
    Float(SizeCode),
    String,
    Enum(SizeCode, Vec<String>),
    Array(Box<TypeDescriptor>, usize),
    Sequence(SizeCode, Box<TypeDescriptor>),
    Struct(Vec<(String, TypeDescriptor)>),
    /// Resolved against a [`Dictionary`] at encode/decode time.
    Named(String),
}

/// Resolves [`TypeDescriptor::Named`] references by name.
#[derive(Clone, Debug, Default)]
pub struct Dictionary {
    types: BTreeMap<String, TypeDescriptor>,
}

impl Dictionary {
    pub fn new() -> Self {
        Dictionary::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, ty: TypeDescriptor) {
        self.types.insert(name.into(), ty);
    }

    pub fn resolve<'a>(&'a self, ty: &'a TypeDescriptor) -> Option<&'a TypeDescriptor> {
        match ty {
            TypeDescriptor::Named(name) => self.types.get(name),
            other => Some(other),
        }
    }
}

/// A runtime value written against a [`TypeDescriptor`].
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Seq(Vec<FieldValue>),
    Struct(Vec<(String, FieldValue)>),
}

impl TypeDescriptor {
    /// Writes `value` into `out` per this descriptor's shape, resolving
    /// `Named` references against `dict`. Panics on a type/value mismatch;
    /// callers are expected to have validated the value against the
    /// descriptor beforehand (there is no wire-level tag to recover from).
    pub fn encode(&self, value: &FieldValue, dict: &Dictionary, out: &mut Vec<u8>) {
        match (self, value) {
            (TypeDescriptor::Int(size), FieldValue::Int(v)) => encode_uint(*size, *v as u64, out),
            (TypeDescriptor::Uint(size), FieldValue::Uint(v)) => encode_uint(*size, *v, out),
            (TypeDescriptor::Enum(size, _variants), FieldValue::Uint(v)) => encode_uint(*size, *v, out),
            (TypeDescriptor::Float(SizeCode::Bits64), FieldValue::Float(v)) => {
                out.extend_from_slice(&v.to_le_bytes())
            }
            (TypeDescriptor::Float(_), FieldValue::Float(v)) => {
                out.extend_from_slice(&(*v as f32).to_le_bytes())
            }
            (TypeDescriptor::String, FieldValue::String(s)) => {
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            (TypeDescriptor::Array(elem, len), FieldValue::Seq(items)) => {
                assert_eq!(items.len(), *len, "array length mismatch");
                for item in items {
                    elem.encode(item, dict, out);
                }
            }
            (TypeDescriptor::Sequence(size, elem), FieldValue::Seq(items)) => {
                encode_uint(*size, items.len() as u64, out);
                for item in items {
                    elem.encode(item, dict, out);
                }
            }
            (TypeDescriptor::Struct(fields), FieldValue::Struct(values)) => {
                for (name, ty) in fields {
                    let v = values
                        .iter()
                        .find(|(n, _)| n == name)
                        .map(|(_, v)| v)
                        .unwrap_or_else(|| panic!("missing struct field {:?}", name));
                    ty.encode(v, dict, out);
                }
            }
            (TypeDescriptor::Named(name), _) => {
                let resolved = dict
                    .resolve(self)
                    .unwrap_or_else(|| panic!("unresolved named type {:?}", name));
                resolved.encode(value, dict, out);
            }
            (ty, v) => panic!("type/value mismatch encoding a field: {:?} vs {:?}", ty, v),
        }
    }
}

fn encode_uint(size: SizeCode, v: u64, out: &mut Vec<u8>) {
    let len = size.byte_len();
    out.extend_from_slice(&v.to_le_bytes()[..len]);
}

/// One event definition within a [`Facility`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub id: u8,
    pub fields: Vec<(String, TypeDescriptor)>,
}

/// An ordered list of event definitions plus the named types they reference.
#[derive(Clone, Debug)]
pub struct Facility {
    pub name: String,
    pub id: u8,
    pub events: Vec<Event>,
    pub dictionary: Dictionary,
}

impl Facility {
    pub fn event_by_id(&self, id: u8) -> Option<&Event> {
        self.events.iter().find(|e| e.id == id)
    }

    /// Minimal always-present facility, so tests can exercise the pipeline
    /// end to end without the external `.event` codegen tool (§1).
    ///
    /// Intentionally carries no heartbeat event; §9 places heartbeats out of
    /// the core entirely.
    pub fn core() -> Self {
        Facility {
            name: "core".to_string(),
            id: 0,
            events: vec![
                Event {
                    name: "entry".to_string(),
                    id: 0,
                    fields: vec![("ip".to_string(), TypeDescriptor::Uint(SizeCode::Long))],
                },
                Event {
                    name: "exit".to_string(),
                    id: 1,
                    fields: vec![],
                },
            ],
            dictionary: Dictionary::new(),
        }
    }
}

/// Registry of facilities keyed by the `facility_id` on the wire.
#[derive(Clone, Debug, Default)]
pub struct FacilityRegistry {
    facilities: BTreeMap<u8, Facility>,
}

impl FacilityRegistry {
    pub fn new() -> Self {
        FacilityRegistry::default()
    }

    pub fn with_core() -> Self {
        let mut reg = FacilityRegistry::new();
        reg.register(Facility::core());
        reg
    }

    pub fn register(&mut self, facility: Facility) {
        self.facilities.insert(facility.id, facility);
    }

    pub fn get(&self, id: u8) -> Option<&Facility> {
        self.facilities.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_facility_has_no_heartbeat() {
        let core = Facility::core();
        assert!(core.events.iter().all(|e| e.name != "heartbeat"));
    }

    #[test]
    fn dictionary_resolves_named_types() {
        let mut dict = Dictionary::new();
        dict.insert("pid_t", TypeDescriptor::Int(SizeCode::Int));
        let named = TypeDescriptor::Named("pid_t".to_string());
        assert_eq!(dict.resolve(&named), Some(&TypeDescriptor::Int(SizeCode::Int)));
        assert_eq!(
            dict.resolve(&TypeDescriptor::Named("missing".to_string())),
            None
        );
    }

    #[test]
    fn registry_looks_up_by_wire_id() {
        let reg = FacilityRegistry::with_core();
        let core = reg.get(0).expect("core facility registered");
        assert_eq!(core.event_by_id(0).unwrap().name, "entry");
    }

    #[test]
    fn encodes_core_entry_event_fields() {
        let core = Facility::core();
        let entry = core.event_by_id(0).unwrap();
        let (_, ty) = &entry.fields[0];
        let mut out = Vec::new();
        ty.encode(&FieldValue::Uint(0x1234), &core.dictionary, &mut out);
        assert_eq!(out, 0x1234u64.to_le_bytes());
    }

    #[test]
    fn encodes_sequence_with_length_prefix() {
        let ty = TypeDescriptor::Sequence(SizeCode::Bits8, Box::new(TypeDescriptor::Uint(SizeCode::Bits8)));
        let value = FieldValue::Seq(vec![FieldValue::Uint(1), FieldValue::Uint(2), FieldValue::Uint(3)]);
        let mut out = Vec::new();
        ty.encode(&value, &Dictionary::new(), &mut out);
        assert_eq!(out, vec![3, 1, 2, 3]);
    }
}
