use crate::{
    namespace::NodeHandle,
    op_region::OpRegion,
    opcode::Opcode,
    pool::ObjectPool,
    state::{self, GenericState, StatePayload},
    table::{OwnerId, TableIndex},
    AmlError,
};
use alloc::{string::String, sync::Arc, vec::Vec};
use bit_field::BitField;
use core::fmt;
use spinning_top::{Spinlock, SpinlockGuard};

pub type NativeMethodFn = dyn Fn(&[ObjectRef]) -> Result<ObjectRef, AmlError> + Send + Sync;

#[derive(Clone)]
pub enum Object {
    Uninitialized,
    Integer(u64),
    String(String),
    /// A buffer's contents. `deferred` is set until the buffer has been realized.
    Buffer { data: Vec<u8>, deferred: Option<Deferred> },
    /// A package's elements. `deferred` is set until the package has been realized.
    Package { elements: Vec<ObjectRef>, deferred: Option<Deferred> },
    Region(OpRegion),
    Mutex { sync_level: u8 },
    Event { pending: u64 },
    PowerResource { system_level: u8, resource_order: u16 },
    Processor { proc_id: u8, pblk_address: u32, pblk_length: u8 },
    Method(Method),
    NativeMethod { f: Arc<NativeMethodFn>, flags: MethodFlags },
    BufferField { buffer: ObjectRef, bit_index: usize, bit_length: usize },
    FieldUnit(FieldUnit),
    Reference { kind: ReferenceKind, target: ReferenceTarget },
    Debug,
}

impl Object {
    pub fn typ(&self) -> ObjectType {
        match self {
            Object::Uninitialized => ObjectType::Any,
            Object::Integer(_) => ObjectType::Integer,
            Object::String(_) => ObjectType::String,
            Object::Buffer { .. } => ObjectType::Buffer,
            Object::Package { .. } => ObjectType::Package,
            Object::Region(_) => ObjectType::Region,
            Object::Mutex { .. } => ObjectType::Mutex,
            Object::Event { .. } => ObjectType::Event,
            Object::PowerResource { .. } => ObjectType::Power,
            Object::Processor { .. } => ObjectType::Processor,
            Object::Method(_) | Object::NativeMethod { .. } => ObjectType::Method,
            Object::BufferField { .. } => ObjectType::BufferField,
            Object::FieldUnit(unit) => match unit.kind {
                FieldUnitKind::Normal { .. } => ObjectType::RegionField,
                FieldUnitKind::Bank { .. } => ObjectType::BankField,
                FieldUnitKind::Index { .. } => ObjectType::IndexField,
            },
            Object::Reference { .. } => ObjectType::LocalReference,
            Object::Debug => ObjectType::Debug,
        }
    }

    /// Whether any embedded description of this object's contents has been expanded. Only buffers, packages
    /// and regions are ever unrealized.
    pub fn is_realized(&self) -> bool {
        match self {
            Object::Buffer { deferred, .. } | Object::Package { deferred, .. } => deferred.is_none(),
            Object::Region(region) => region.deferred.is_none(),
            _ => true,
        }
    }

    pub fn as_integer(&self) -> Result<u64, AmlError> {
        match self {
            Object::Integer(value) => Ok(*value),
            /*
             * Implicit conversion of a buffer takes its first eight bytes as a little-endian integer, and of a
             * string reads it as hexadecimal (with or without a leading `0x`).
             */
            Object::Buffer { data, deferred: None } => {
                Ok(data.iter().take(8).enumerate().fold(0, |value, (i, &byte)| value | (byte as u64) << (i * 8)))
            }
            Object::String(string) => {
                let digits = string.trim_start_matches("0x").trim_start_matches("0X");
                let digits = digits.split(|c: char| !c.is_ascii_hexdigit()).next().unwrap_or("");
                u64::from_str_radix(digits, 16).or(Ok(0))
            }
            other => Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Integer, got: other.typ() }),
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Uninitialized => write!(f, "[Uninitialized]"),
            Object::Integer(value) => write!(f, "Integer({:#x})", value),
            Object::String(value) => write!(f, "String({:?})", value),
            Object::Buffer { deferred: Some(_), .. } => write!(f, "Buffer(unrealized)"),
            Object::Buffer { data, .. } => write!(f, "Buffer({:x?})", data),
            Object::Package { deferred: Some(_), .. } => write!(f, "Package(unrealized)"),
            Object::Package { elements, .. } => f.debug_list().entries(elements.iter()).finish(),
            Object::Region(region) => write!(f, "{:?}", region),
            Object::Mutex { sync_level } => write!(f, "Mutex(sync_level = {})", sync_level),
            Object::Event { .. } => write!(f, "Event"),
            Object::PowerResource { system_level, resource_order } => {
                write!(f, "PowerResource(system_level = {}, resource_order = {})", system_level, resource_order)
            }
            Object::Processor { proc_id, .. } => write!(f, "Processor({})", proc_id),
            Object::Method(method) => write!(f, "Method({:?}, {:?})", method.flags, method.code),
            Object::NativeMethod { flags, .. } => write!(f, "NativeMethod({:?})", flags),
            Object::BufferField { bit_index, bit_length, .. } => {
                write!(f, "BufferField {{ bit_index: {}, bit_length: {} }}", bit_index, bit_length)
            }
            Object::FieldUnit(unit) => write!(f, "{:?}", unit),
            Object::Reference { kind, target } => write!(f, "Reference({:?} -> {:?})", kind, target),
            Object::Debug => write!(f, "Debug"),
        }
    }
}

/// A counted handle to an operand object. Cloning the handle takes a new reference; the object is freed when
/// the last handle is dropped.
#[derive(Clone)]
pub struct ObjectRef(Arc<Spinlock<Object>>);

impl ObjectRef {
    pub fn new(object: Object) -> ObjectRef {
        ObjectRef(Arc::new(Spinlock::new(object)))
    }

    pub fn lock(&self) -> SpinlockGuard<'_, Object> {
        self.0.lock()
    }

    pub fn typ(&self) -> ObjectType {
        self.lock().typ()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_realized(&self) -> bool {
        self.lock().is_realized()
    }

    pub fn to_integer(&self) -> Result<u64, AmlError> {
        self.lock().as_integer()
    }

    /// Produce a new object holding a copy of this one's value. Package elements are shared, not copied: use
    /// [`copy_package`] for a deep copy.
    pub fn copy_value(&self) -> ObjectRef {
        ObjectRef::new(self.lock().clone())
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_lock() {
            Some(object) => write!(f, "{:?}", *object),
            None => write!(f, "[locked]"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjectType {
    Any,
    Integer,
    String,
    Buffer,
    Package,
    Device,
    Event,
    Method,
    Mutex,
    Region,
    Power,
    Processor,
    Thermal,
    BufferField,
    RegionField,
    BankField,
    IndexField,
    LocalReference,
    Alias,
    MethodAlias,
    Debug,
}

/// A range of AML bytecode, kept alive by a shared handle to the table it came from.
#[derive(Clone)]
pub struct AmlSpan {
    pub aml: Arc<[u8]>,
    pub start: usize,
    pub end: usize,
}

impl AmlSpan {
    pub fn bytes(&self) -> &[u8] {
        &self.aml[self.start..self.end]
    }
}

impl fmt::Debug for AmlSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AML[{:#x}..{:#x}]", self.start, self.end)
    }
}

/// The AML describing an object's contents, kept so the object can be realized later. It is re-parsed in
/// `scope` with a root op of `opcode`.
#[derive(Clone, Debug)]
pub struct Deferred {
    pub span: AmlSpan,
    pub scope: NodeHandle,
    pub opcode: Opcode,
}

#[derive(Clone, Debug)]
pub struct Method {
    pub code: AmlSpan,
    pub flags: MethodFlags,
    pub owner_id: OwnerId,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReferenceKind {
    /// A handle to a loaded table.
    Table,
    RefOf,
    Index,
    /// A name in a package's element list.
    Name,
}

#[derive(Clone, Debug)]
pub enum ReferenceTarget {
    Node(NodeHandle),
    Element { object: ObjectRef, index: usize },
    Object(ObjectRef),
    Table(TableIndex),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MethodFlags(pub u8);

impl MethodFlags {
    pub fn with_arg_count(arg_count: u8) -> MethodFlags {
        let mut flags = 0;
        flags.set_bits(0..3, arg_count);
        MethodFlags(flags)
    }

    pub fn arg_count(&self) -> usize {
        self.0.get_bits(0..3) as usize
    }

    pub fn serialize(&self) -> bool {
        self.0.get_bit(3)
    }

    pub fn sync_level(&self) -> u8 {
        self.0.get_bits(4..8)
    }
}

#[derive(Clone, Debug)]
pub struct FieldUnit {
    pub kind: FieldUnitKind,
    pub flags: FieldFlags,
    pub bit_index: usize,
    pub bit_length: usize,
}

#[derive(Clone, Debug)]
pub enum FieldUnitKind {
    Normal { region: NodeHandle },
    /// Accessing the field first writes `bank_value` to the `bank` field.
    Bank { region: NodeHandle, bank: NodeHandle, bank_value: u64 },
    /// Fields of this kind are accessed by writing the byte offset to the `index` field, then accessing `data`.
    Index { index: NodeHandle, data: NodeHandle },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldAccessType {
    Any,
    Byte,
    Word,
    DWord,
    QWord,
    Buffer,
}

impl FieldAccessType {
    /// The width in bits of each access made to the underlying region.
    pub fn width(&self) -> usize {
        match self {
            FieldAccessType::Any | FieldAccessType::Byte | FieldAccessType::Buffer => 8,
            FieldAccessType::Word => 16,
            FieldAccessType::DWord => 32,
            FieldAccessType::QWord => 64,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldUpdateRule {
    Preserve,
    WriteAsOnes,
    WriteAsZeros,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FieldFlags(pub u8);

impl FieldFlags {
    pub fn access_type(&self) -> Result<FieldAccessType, AmlError> {
        match self.0.get_bits(0..4) {
            0 => Ok(FieldAccessType::Any),
            1 => Ok(FieldAccessType::Byte),
            2 => Ok(FieldAccessType::Word),
            3 => Ok(FieldAccessType::DWord),
            4 => Ok(FieldAccessType::QWord),
            5 => Ok(FieldAccessType::Buffer),
            _ => Err(AmlError::InvalidFieldFlags),
        }
    }

    pub fn with_access_type(self, access_type: u8) -> FieldFlags {
        let mut flags = self.0;
        flags.set_bits(0..4, access_type.get_bits(0..4));
        FieldFlags(flags)
    }

    pub fn lock_rule(&self) -> bool {
        self.0.get_bit(4)
    }

    pub fn update_rule(&self) -> Result<FieldUpdateRule, AmlError> {
        match self.0.get_bits(5..7) {
            0 => Ok(FieldUpdateRule::Preserve),
            1 => Ok(FieldUpdateRule::WriteAsOnes),
            2 => Ok(FieldUpdateRule::WriteAsZeros),
            _ => Err(AmlError::InvalidFieldFlags),
        }
    }
}

/// Drop a reference to an object tree. If this was the last reference to a package, its elements are released
/// in turn. This is done iteratively with `UpdateRef` state frames, so deeply nested packages cannot exhaust the
/// stack.
pub fn release_object_tree(states: &ObjectPool<GenericState>, object: ObjectRef) {
    let mut stack = None;
    state::push_state(&mut stack, states.create_update_state(object));

    while let Some(mut frame) = state::pop_state(&mut stack) {
        if let StatePayload::UpdateRef(ref mut update) = frame.payload {
            if let Some(object) = update.object.take() {
                /*
                 * Only when we hold the last reference can the elements be taken out. Otherwise someone else is
                 * still using the package and dropping our handle is all there is to do.
                 */
                if object.ref_count() == 1 {
                    let elements = match *object.lock() {
                        Object::Package { ref mut elements, .. } => core::mem::take(elements),
                        _ => Vec::new(),
                    };
                    for element in elements {
                        state::push_state(&mut stack, states.create_update_state(element));
                    }
                }
            }
        }
        states.delete_state(Some(frame));
    }
}

/// Deep-copy a package, including any packages nested within it. The walk over the source is iterative, using a
/// `PackageWalk` state frame for each level of nesting.
pub fn copy_package(states: &ObjectPool<GenericState>, source: &ObjectRef) -> Result<ObjectRef, AmlError> {
    let target = ObjectRef::new(Object::Package { elements: Vec::new(), deferred: None });
    let mut stack = None;
    state::push_state(&mut stack, states.create_package_state(source.clone(), target.clone()));

    let result = loop {
        let next = match state::peek_state_mut(&mut stack).map(|frame| &mut frame.payload) {
            Some(StatePayload::PackageWalk(walk)) => {
                let element = match *walk.source.lock() {
                    Object::Package { ref elements, deferred: None } => elements.get(walk.index).cloned(),
                    Object::Package { deferred: Some(_), .. } => break Err(AmlError::UninitializedNode),
                    ref other => {
                        break Err(AmlError::ObjectNotOfExpectedType {
                            expected: ObjectType::Package,
                            got: other.typ(),
                        })
                    }
                };
                walk.index += 1;
                element.map(|element| (element, walk.target.clone()))
            }
            Some(_) => break Err(AmlError::BadParameter),
            None => break Ok(target),
        };

        match next {
            Some((element, parent)) => {
                let copy = if element.typ() == ObjectType::Package {
                    let nested = ObjectRef::new(Object::Package { elements: Vec::new(), deferred: None });
                    state::push_state(&mut stack, states.create_package_state(element, nested.clone()));
                    nested
                } else {
                    element.copy_value()
                };

                if let Object::Package { ref mut elements, .. } = *parent.lock() {
                    elements.push(copy);
                }
            }
            None => {
                let finished = state::pop_state(&mut stack);
                states.delete_state(finished);
            }
        }
    };

    while let Some(frame) = state::pop_state(&mut stack) {
        states.delete_state(Some(frame));
    }
    result
}

/// Copy an arbitrary bit range of `src` to an arbitrary bit range of `dst`. Bits past the end of `src` read as
/// zero, which zero-extends short sources.
pub(crate) fn copy_bits(src: &[u8], src_index: usize, dst: &mut [u8], dst_index: usize, length: usize) {
    // Bits past the end of `dst` are dropped
    let length = length.min((dst.len() * 8).saturating_sub(dst_index));
    for i in 0..length {
        let (src_bit, dst_bit) = (src_index + i, dst_index + i);
        let value = src.get(src_bit / 8).map_or(false, |byte| byte.get_bit(src_bit % 8));
        if let Some(byte) = dst.get_mut(dst_bit / 8) {
            byte.set_bit(dst_bit % 8, value);
        }
    }
}

/// Allocate `length` zeroed bytes, failing with `NoMemory` rather than aborting.
pub(crate) fn zeroed_bytes(length: usize) -> Result<Vec<u8>, AmlError> {
    let mut bytes = Vec::new();
    bytes.try_reserve_exact(length).map_err(|_| AmlError::NoMemory)?;
    bytes.resize(length, 0);
    Ok(bytes)
}

#[inline]
pub(crate) fn align_down(value: usize, align: usize) -> usize {
    if align == 0 {
        value
    } else {
        value - value % align
    }
}
