use crate::{
    namespace::{AmlName, NameSeg, NodeHandle},
    object::ObjectRef,
    opcode::{OpClass, Opcode},
    pool::{Descriptor, ObjectPool, PoolStats, Poolable},
    AmlError,
};
use alloc::{boxed::Box, string::String, vec::Vec};
use core::ops::Range;
use log::trace;
use spinning_top::Spinlock;

/// An argument collected by an op while it is being parsed.
#[derive(Clone, Debug)]
pub enum OpArg {
    Integer(u64),
    String(String),
    Name(AmlName),
    /// A range of the AML stream, for byte lists and field lists.
    Bytes(Range<usize>),
    Object(ObjectRef),
    Node(NodeHandle),
    Local(u8),
    Arg(u8),
    Debug,
    /// An omitted target, or the result of an op that produces no value.
    Null,
}

/// A node of the parse tree: one op, and the arguments it has collected so far.
#[derive(Debug)]
pub struct ParseOp {
    pub descriptor: Descriptor,
    pub opcode: Opcode,
    /// Fixed when the op is allocated, and decides which pool the op is returned to.
    pub class: OpClass,
    pub aml_offset: usize,
    /// The offset of the innermost `Scope` op allocated before this one.
    pub scope_offset: Option<usize>,
    name: Option<NameSeg>,
    pub args: Vec<OpArg>,
    /// End of the op's package, if it has a `PkgLength`.
    pub pkg_end: Option<usize>,
    /// Offset of the first argument after the `PkgLength`. `While` rewinds to here to re-evaluate its predicate.
    pub args_start: usize,
    /// The namespace node the op declared or opened.
    pub node: Option<NodeHandle>,
    /// Whether the op pushed a namespace scope that must be popped when it completes.
    pub scope_pushed: bool,
    /// Start of the range to capture for deferred realization.
    pub deferred_start: Option<usize>,
}

impl ParseOp {
    pub fn name(&self) -> Option<NameSeg> {
        match self.class {
            OpClass::Generic => None,
            _ => self.name,
        }
    }

    /// Record the name of the object this op declares. Generic ops carry no name, so this does nothing for them.
    pub fn set_name(&mut self, name: NameSeg) {
        if self.class != OpClass::Generic {
            self.name = Some(name);
        }
    }

    pub fn name_arg(&self, index: usize) -> Result<&AmlName, AmlError> {
        match self.args.get(index) {
            Some(OpArg::Name(name)) => Ok(name),
            _ => Err(AmlError::BadParameter),
        }
    }

    /// Get an argument that was decoded inline as an integer.
    pub fn integer_arg(&self, index: usize) -> Result<u64, AmlError> {
        match self.args.get(index) {
            Some(OpArg::Integer(value)) => Ok(*value),
            _ => Err(AmlError::BadParameter),
        }
    }

    pub fn bytes_arg(&self, index: usize) -> Result<Range<usize>, AmlError> {
        match self.args.get(index) {
            Some(OpArg::Bytes(range)) => Ok(range.clone()),
            _ => Err(AmlError::BadParameter),
        }
    }

    pub fn arg(&self, index: usize) -> Result<&OpArg, AmlError> {
        self.args.get(index).ok_or(AmlError::BadParameter)
    }
}

impl Poolable for ParseOp {
    fn zeroed() -> Self {
        ParseOp {
            descriptor: Descriptor::Active,
            opcode: Opcode::Noop,
            class: OpClass::Generic,
            aml_offset: 0,
            scope_offset: None,
            name: None,
            args: Vec::new(),
            pkg_end: None,
            args_start: 0,
            node: None,
            scope_pushed: false,
            deferred_start: None,
        }
    }

    fn mark_cached(&mut self) {
        *self = ParseOp::zeroed();
        self.descriptor = Descriptor::Cached;
        self.aml_offset = usize::MAX;
    }

    fn is_cached(&self) -> bool {
        self.descriptor == Descriptor::Cached
    }
}

/// Allocates parse ops. Generic and byte-list ops come from a small pool of their own; ops that declare names or
/// capture deferred contents come from the extended pool.
pub struct OpCache {
    generic: ObjectPool<ParseOp>,
    extended: ObjectPool<ParseOp>,
    current_scope: Spinlock<Option<usize>>,
}

impl OpCache {
    pub fn new(generic_depth: usize, extended_depth: usize) -> OpCache {
        OpCache {
            generic: ObjectPool::new("parse ops", generic_depth),
            extended: ObjectPool::new("extended parse ops", extended_depth),
            current_scope: Spinlock::new(None),
        }
    }

    fn pool(&self, class: OpClass) -> &ObjectPool<ParseOp> {
        match class {
            OpClass::Generic | OpClass::ByteList => &self.generic,
            OpClass::Deferred | OpClass::NamedObject => &self.extended,
        }
    }

    pub fn alloc(&self, opcode: Opcode, aml_offset: usize) -> Box<ParseOp> {
        let class = opcode.info().class;
        let mut op = self.pool(class).acquire();
        op.opcode = opcode;
        op.class = class;
        op.aml_offset = aml_offset;

        let mut current_scope = self.current_scope.lock();
        if opcode == Opcode::Scope {
            *current_scope = Some(aml_offset);
        }
        op.scope_offset = *current_scope;
        drop(current_scope);

        trace!("Allocated op {:?} ({:?}) at {:#x}", opcode, class, aml_offset);
        op
    }

    pub fn free(&self, op: Box<ParseOp>) {
        self.pool(op.class).release(op);
    }

    pub fn current_scope(&self) -> Option<usize> {
        *self.current_scope.lock()
    }

    pub fn stats(&self) -> (PoolStats, PoolStats) {
        (self.generic.stats(), self.extended.stats())
    }

    pub fn purge(&self) {
        self.generic.purge();
        self.extended.purge();
    }
}
