//! The opcode loop.
//!
//! Every op is decoded, has its arguments collected, and is executed from the one loop in `run_walk`. Nested
//! arguments are tracked on the parser scope stack rather than with recursion, so pathological nesting of
//! expressions can't exhaust the stack. Only method invocation and the realization of deferred objects start a
//! new walk.

use crate::{
    namespace::{AmlName, NameComponent, NodeHandle},
    object::{
        release_object_tree,
        zeroed_bytes,
        AmlSpan,
        Deferred,
        FieldFlags,
        FieldUnit,
        FieldUnitKind,
        Method,
        MethodFlags,
        NativeMethodFn,
        Object,
        ObjectRef,
        ObjectType,
        ReferenceKind,
        ReferenceTarget,
    },
    op::{OpArg, ParseOp},
    op_region::{OpRegion, RegionSpace},
    opcode::{ArgCount, ArgList, ArgType, Opcode},
    parser::ParserState,
    resolve::{resolve_node_to_value, NodeInfo, ResolveContext, Resolved},
    state::ControlKind,
    table::OwnerId,
    walk::{PassNumber, PendingControl, WalkState},
    AmlError,
    Interpreter,
};
use alloc::{string::String, sync::Arc, vec::Vec};
use core::cmp::Ordering;
use log::{error, info, trace, warn};

/// The value of the `Revision` op.
const INTERPRETER_REVISION: u64 = 1;

const ONES: u64 = u64::MAX;

enum Callee {
    Aml(Method),
    Native(Arc<NativeMethodFn>, MethodFlags),
}

impl Interpreter {
    /// Run a walk until its root scope is complete or it returns.
    pub(crate) fn run_walk(&self, walk: &mut WalkState) -> Result<(), AmlError> {
        loop {
            if let Some(pending) = walk.pending.take() {
                match pending {
                    PendingControl::Return => return Ok(()),
                    PendingControl::Break | PendingControl::Continue => self.unwind_to_loop(walk, pending)?,
                }
                continue;
            }

            if walk.parser.has_completed_scope() {
                if walk.parser.is_root_scope() {
                    return Ok(());
                }
                if self.restart_loop(walk)? {
                    continue;
                }

                let (op, _) = walk.parser.pop_scope(&self.caches.state).ok_or(AmlError::StackUnderflow)?;
                let result = self.complete_op(walk, op)?;
                self.deliver(walk, result)?;
                continue;
            }

            let arg_type = walk.parser.current_arg_type().ok_or(AmlError::BadParameter)?;
            if arg_type.is_inline() {
                self.parse_inline_arg(walk, arg_type)?;
            } else if arg_type == ArgType::ByteList {
                let bytes = walk.parser.cursor..walk.parser.pkg_end;
                walk.parser.cursor = walk.parser.pkg_end;
                self.deliver(walk, OpArg::Bytes(bytes))?;
            } else {
                self.begin_op(walk, arg_type)?;
            }
        }
    }

    fn parse_inline_arg(&self, walk: &mut WalkState, arg_type: ArgType) -> Result<(), AmlError> {
        let parser = &mut walk.parser;
        let arg = match arg_type {
            ArgType::ByteData => OpArg::Integer(parser.next()? as u64),
            ArgType::WordData => OpArg::Integer(parser.next_u16()? as u64),
            ArgType::DWordData => OpArg::Integer(parser.next_u32()? as u64),
            ArgType::QWordData => OpArg::Integer(parser.next_u64()?),
            ArgType::CharList => OpArg::String(parser.string()?),
            ArgType::NameString => {
                let name = parser.namestring()?;
                if let (Some(NameComponent::Segment(seg)), Some(op)) =
                    (name.components().last(), parser.current_op_mut())
                {
                    op.set_name(*seg);
                }
                OpArg::Name(name)
            }
            ArgType::PkgLength => {
                let end = parser.pkglength()?;
                parser.set_package_end(end);
                let cursor = parser.cursor;
                if let Some(op) = parser.current_op_mut() {
                    op.pkg_end = Some(end);
                    op.args_start = cursor;
                }
                parser.advance_arg();
                return self.on_arg_advanced(walk);
            }
            ArgType::FieldList => {
                let list = parser.cursor..parser.pkg_end;
                parser.cursor = parser.pkg_end;
                OpArg::Bytes(list)
            }
            _ => return Err(AmlError::BadParameter),
        };
        self.push_arg(walk, arg)
    }

    fn push_arg(&self, walk: &mut WalkState, arg: OpArg) -> Result<(), AmlError> {
        walk.parser.current_op_mut().ok_or(AmlError::BadParameter)?.args.push(arg);
        walk.parser.advance_arg();
        self.on_arg_advanced(walk)
    }

    /// Hand the result of an op to the op it is an argument of.
    fn deliver(&self, walk: &mut WalkState, result: OpArg) -> Result<(), AmlError> {
        match walk.parser.current_arg_type() {
            None | Some(ArgType::TermList) => Ok(()),
            Some(ArgType::ElementList) => {
                walk.parser.current_op_mut().ok_or(AmlError::BadParameter)?.args.push(result);
                Ok(())
            }
            Some(_) => self.push_arg(walk, result),
        }
    }

    fn on_arg_advanced(&self, walk: &mut WalkState) -> Result<(), AmlError> {
        if walk.parser.is_root_scope() {
            return Ok(());
        }
        let cursor = walk.parser.cursor;
        let next = walk.parser.current_arg_type();
        let opcode = match walk.parser.current_op_mut() {
            Some(op) => {
                // Everything after the name and space of a region may need evaluating again later
                if op.opcode == Opcode::OpRegion && op.args.len() == 2 {
                    op.deferred_start = Some(cursor);
                }
                op.opcode
            }
            None => return Ok(()),
        };

        if next == Some(ArgType::TermList) {
            match opcode {
                _ if opcode.is_namespace_scope() => self.open_scope(walk)?,
                Opcode::Method => self.declare_method(walk)?,
                Opcode::If | Opcode::While => self.evaluate_predicate(walk)?,
                _ => (),
            }
        }
        Ok(())
    }

    fn begin_op(&self, walk: &mut WalkState, arg_type: ArgType) -> Result<(), AmlError> {
        let if_result = walk.if_result.take();
        let offset = walk.parser.cursor;

        if arg_type == ArgType::Target && walk.parser.peek()? == 0x00 {
            walk.parser.cursor += 1;
            return self.deliver(walk, OpArg::Null);
        }

        let opcode = walk.parser.opcode()?;
        trace!("{:#06x}: {:?}", offset, opcode);

        match opcode {
            Opcode::NamePath => return self.begin_name(walk, arg_type, offset),
            Opcode::Local(local) => return self.deliver(walk, OpArg::Local(local)),
            Opcode::Arg(arg) => return self.deliver(walk, OpArg::Arg(arg)),
            Opcode::Debug => return self.deliver(walk, OpArg::Debug),
            Opcode::Buffer | Opcode::Package | Opcode::VarPackage if walk.defer_objects => {
                return self.defer_object(walk, opcode);
            }
            Opcode::If | Opcode::While | Opcode::Else if walk.pass == PassNumber::Declare => {
                self.skip_package(walk)?;
                return self.deliver(walk, OpArg::Null);
            }
            Opcode::Else if if_result != Some(false) => {
                if if_result.is_none() {
                    warn!("Else at {:#x} does not follow an If. Skipping it.", offset);
                }
                self.skip_package(walk)?;
                return self.deliver(walk, OpArg::Null);
            }
            _ => (),
        }

        let op = self.caches.ops.alloc(opcode, offset);
        let args = opcode.info().args;
        if args.is_empty() {
            let result = self.complete_op(walk, op)?;
            return self.deliver(walk, result);
        }

        walk.parser.push_scope(op, ArgList::new(args), ArgCount::Fixed(args.len()), &self.caches.state);
        Ok(())
    }

    fn begin_name(&self, walk: &mut WalkState, arg_type: ArgType, offset: usize) -> Result<(), AmlError> {
        let name = walk.parser.namestring()?;
        if arg_type == ArgType::ElementList {
            return self.deliver(walk, OpArg::Name(name));
        }

        let scope = walk.current_scope_node();
        let found = self.namespace.lock().search(&name, scope);
        let node = match found {
            Ok(node) => node,
            // Forward references are resolved in a later pass
            Err(AmlError::NotFound(_)) if walk.pass == PassNumber::Declare => {
                return self.deliver(walk, OpArg::Name(name));
            }
            Err(AmlError::NotFound(_))
                if walk.parser.current_op().map(|op| op.opcode) == Some(Opcode::CondRefOf) =>
            {
                return self.deliver(walk, OpArg::Name(name));
            }
            Err(err) => return Err(err),
        };

        if matches!(arg_type, ArgType::TermArg | ArgType::TermList) {
            if let Some(arg_count) = self.method_arg_count(node)? {
                let mut op = self.caches.ops.alloc(Opcode::MethodCall, offset);
                op.args.push(OpArg::Node(node));
                if arg_count == 0 {
                    let result = self.complete_op(walk, op)?;
                    return self.deliver(walk, result);
                }
                walk.parser.push_scope(
                    op,
                    ArgList::repeat(ArgType::TermArg, arg_count),
                    ArgCount::Fixed(arg_count),
                    &self.caches.state,
                );
                return Ok(());
            }
        }

        self.deliver(walk, OpArg::Node(node))
    }

    fn skip_package(&self, walk: &mut WalkState) -> Result<(), AmlError> {
        let end = walk.parser.pkglength()?;
        walk.parser.cursor = end;
        Ok(())
    }

    /// Capture the contents of a buffer or package, to be expanded the first time it is used.
    fn defer_object(&self, walk: &mut WalkState, opcode: Opcode) -> Result<(), AmlError> {
        let end = walk.parser.pkglength()?;
        let deferred = Some(Deferred {
            span: AmlSpan { aml: walk.parser.aml.clone(), start: walk.parser.cursor, end },
            scope: walk.current_scope_node(),
            opcode,
        });
        walk.parser.cursor = end;

        let object = match opcode {
            Opcode::Buffer => Object::Buffer { data: Vec::new(), deferred },
            _ => Object::Package { elements: Vec::new(), deferred },
        };
        self.deliver(walk, OpArg::Object(ObjectRef::new(object)))
    }

    fn complete_op(&self, walk: &mut WalkState, op: alloc::boxed::Box<ParseOp>) -> Result<OpArg, AmlError> {
        let result = self.execute_op(walk, &op);
        let cleanup = self.finish_op(walk, &op);
        self.caches.ops.free(op);

        let result = result?;
        cleanup?;
        Ok(result)
    }

    /// Undo the scope and control state an op pushed. Runs whether or not the op executed successfully.
    fn finish_op(&self, walk: &mut WalkState, op: &ParseOp) -> Result<(), AmlError> {
        if op.scope_pushed {
            walk.pop_scope(&self.caches.state)?;
        }
        if matches!(op.opcode, Opcode::If | Opcode::While)
            && walk.control().map_or(false, |control| control.op_offset == op.aml_offset)
        {
            walk.pop_control(&self.caches.state);
        }
        Ok(())
    }

    /// Begin the next iteration of a `While` whose body has just finished. Returns `false` if the scope on top is
    /// not a loop that should run again.
    fn restart_loop(&self, walk: &mut WalkState) -> Result<bool, AmlError> {
        let (offset, args_start) = match walk.parser.current_op() {
            Some(op) if op.opcode == Opcode::While => (op.aml_offset, op.args_start),
            _ => return Ok(false),
        };

        let max_iterations = self.config.max_while_iterations;
        match walk.control_mut() {
            Some(control) if control.kind == ControlKind::While && control.op_offset == offset && control.predicate => {
                control.iterations += 1;
                if control.iterations >= max_iterations {
                    return Err(AmlError::LoopLimitExceeded);
                }
            }
            _ => return Ok(false),
        }

        walk.parser.cursor = args_start;
        if let Some(op) = walk.parser.current_op_mut() {
            op.args.clear();
        }
        walk.parser.reset_args(ArgList::new(&[ArgType::TermArg, ArgType::TermList]), ArgCount::Fixed(2));
        Ok(true)
    }

    fn unwind_to_loop(&self, walk: &mut WalkState, pending: PendingControl) -> Result<(), AmlError> {
        loop {
            if walk.parser.current_op().map(|op| op.opcode) == Some(Opcode::While) {
                break;
            }
            if walk.parser.is_root_scope() {
                return Err(AmlError::BreakOutsideLoop);
            }

            let (op, _) = walk.parser.pop_scope(&self.caches.state).ok_or(AmlError::StackUnderflow)?;
            let cleanup = self.finish_op(walk, &op);
            self.caches.ops.free(op);
            cleanup?;
        }

        let pkg_end = walk.parser.current_op().and_then(|op| op.pkg_end).unwrap_or(walk.parser.pkg_end);
        if pending == PendingControl::Break {
            if let Some(control) = walk.control_mut() {
                control.predicate = false;
            }
        }
        walk.parser.cursor = pkg_end;
        Ok(())
    }

    fn evaluate_predicate(&self, walk: &mut WalkState) -> Result<(), AmlError> {
        let (opcode, offset, args_start, pkg_end, predicate) = {
            let op = walk.parser.current_op().ok_or(AmlError::BadParameter)?;
            (op.opcode, op.aml_offset, op.args_start, op.pkg_end.unwrap_or(walk.parser.pkg_end), op.arg(0)?.clone())
        };
        let predicate = self.operand(walk, &predicate)?.to_integer()? != 0;

        let kind = if opcode == Opcode::While { ControlKind::While } else { ControlKind::If };
        match walk.control_mut() {
            Some(control) if kind == ControlKind::While && control.op_offset == offset => {
                control.predicate = predicate;
            }
            _ => {
                let control = self.caches.state.create_control_state(kind, offset, predicate, args_start, pkg_end);
                walk.push_control(control)
            }
        }

        if !predicate {
            walk.parser.cursor = pkg_end;
        }
        Ok(())
    }

    /*
     * Declarations
     */

    fn declare(&self, walk: &WalkState, name: &AmlName, typ: ObjectType) -> Result<NodeHandle, AmlError> {
        let scope = walk.current_scope_node();
        let mut namespace = self.namespace.lock();
        let (parent, seg) = namespace.resolve_declaration(name, scope)?;

        if walk.pass == PassNumber::Resolve {
            if let Some(existing) = namespace.child(parent, seg) {
                if namespace.get(existing)?.owner_id == walk.owner_id {
                    return Ok(existing);
                }
            }
        }

        namespace.add_node(parent, seg, typ, walk.owner_id)
    }

    /// Attach an object to a declared node. When revisiting a table, an object the first pass attached is kept
    /// unless it still needs realizing.
    fn attach(&self, walk: &WalkState, node: NodeHandle, object: ObjectRef) -> Result<(), AmlError> {
        if walk.pass == PassNumber::Resolve {
            let existing = self.namespace.lock().get(node)?.object.clone();
            if existing.map_or(false, |existing| existing.is_realized()) {
                return Ok(());
            }
        }
        self.namespace.lock().attach_object(node, object)
    }

    fn open_scope(&self, walk: &mut WalkState) -> Result<(), AmlError> {
        let (opcode, name) = {
            let op = walk.parser.current_op().ok_or(AmlError::BadParameter)?;
            (op.opcode, op.name_arg(0)?.clone())
        };

        let node = match opcode {
            Opcode::Scope => {
                let scope = walk.current_scope_node();
                let found = self.namespace.lock().search(&name, scope);
                found?
            }
            Opcode::Device => self.declare(walk, &name, ObjectType::Device)?,
            Opcode::ThermalZone => self.declare(walk, &name, ObjectType::Thermal)?,
            Opcode::Processor => {
                let node = self.declare(walk, &name, ObjectType::Processor)?;
                let processor = {
                    let op = walk.parser.current_op().ok_or(AmlError::BadParameter)?;
                    Object::Processor {
                        proc_id: op.integer_arg(1)? as u8,
                        pblk_address: op.integer_arg(2)? as u32,
                        pblk_length: op.integer_arg(3)? as u8,
                    }
                };
                self.attach(walk, node, ObjectRef::new(processor))?;
                node
            }
            Opcode::PowerRes => {
                let node = self.declare(walk, &name, ObjectType::Power)?;
                let power = {
                    let op = walk.parser.current_op().ok_or(AmlError::BadParameter)?;
                    Object::PowerResource {
                        system_level: op.integer_arg(1)? as u8,
                        resource_order: op.integer_arg(2)? as u16,
                    }
                };
                self.attach(walk, node, ObjectRef::new(power))?;
                node
            }
            _ => return Err(AmlError::BadParameter),
        };

        let typ = self.namespace.lock().get(node)?.typ;
        walk.push_scope(Some(node), typ, &self.caches.state)?;
        if let Some(op) = walk.parser.current_op_mut() {
            op.node = Some(node);
            op.scope_pushed = true;
        }
        Ok(())
    }

    /// Declare a method and attach its code. The body is skipped: it is only parsed when the method is invoked.
    fn declare_method(&self, walk: &mut WalkState) -> Result<(), AmlError> {
        let (name, flags, end) = {
            let op = walk.parser.current_op().ok_or(AmlError::BadParameter)?;
            (op.name_arg(0)?.clone(), op.integer_arg(1)? as u8, op.pkg_end.unwrap_or(walk.parser.pkg_end))
        };

        let node = self.declare(walk, &name, ObjectType::Method)?;
        let method = Method {
            code: AmlSpan { aml: walk.parser.aml.clone(), start: walk.parser.cursor, end },
            flags: MethodFlags(flags),
            owner_id: walk.owner_id,
        };
        self.attach(walk, node, ObjectRef::new(Object::Method(method)))?;

        walk.parser.cursor = end;
        if let Some(op) = walk.parser.current_op_mut() {
            op.node = Some(node);
        }
        Ok(())
    }

    fn declare_alias(&self, walk: &WalkState, op: &ParseOp) -> Result<(), AmlError> {
        let source = op.name_arg(0)?;
        let alias = op.name_arg(1)?;

        let found = self.namespace.lock().search(source, walk.current_scope_node());
        let target = match found {
            Ok(target) => Some(target),
            Err(AmlError::NotFound(_)) if walk.pass == PassNumber::Declare => None,
            Err(err) => return Err(err),
        };

        let typ = match target {
            Some(target) if self.namespace.lock().get(target)?.typ == ObjectType::Method => ObjectType::MethodAlias,
            _ => ObjectType::Alias,
        };
        let node = self.declare(walk, alias, typ)?;

        let mut namespace = self.namespace.lock();
        let node = namespace.get_mut(node)?;
        if target.is_some() {
            node.target = target;
            node.typ = typ;
        }
        Ok(())
    }

    fn declare_region(&self, walk: &WalkState, op: &ParseOp) -> Result<(), AmlError> {
        let name = op.name_arg(0)?;
        let space = RegionSpace::from(op.integer_arg(1)? as u8);
        let parent_device = walk.current_scope_node();

        let region = if walk.pass == PassNumber::Declare {
            let start = op.deferred_start.ok_or(AmlError::BadParameter)?;
            OpRegion {
                space,
                base: 0,
                length: 0,
                parent_device,
                deferred: Some(Deferred {
                    span: AmlSpan { aml: walk.parser.aml.clone(), start, end: walk.parser.cursor },
                    scope: parent_device,
                    opcode: Opcode::OpRegion,
                }),
            }
        } else {
            let base = self.operand(walk, op.arg(2)?)?.to_integer()?;
            let length = self.operand(walk, op.arg(3)?)?.to_integer()?;
            OpRegion { space, base, length, parent_device, deferred: None }
        };

        let node = self.declare(walk, name, ObjectType::Region)?;
        self.attach(walk, node, ObjectRef::new(Object::Region(region)))
    }

    /// Declare the field units of a `Field`, `IndexField` or `BankField`. In the declaration pass, only the
    /// nodes are created.
    fn declare_fields(&self, walk: &WalkState, op: &ParseOp) -> Result<(), AmlError> {
        let search = |i: usize| {
            let name = op.name_arg(i)?;
            self.namespace.lock().search(name, walk.current_scope_node())
        };
        let resolving = walk.pass != PassNumber::Declare;

        let (typ, kind, flags_index) = match op.opcode {
            Opcode::Field => {
                let kind = if resolving { Some(FieldUnitKind::Normal { region: search(0)? }) } else { None };
                (ObjectType::RegionField, kind, 1)
            }
            Opcode::IndexField => {
                let kind =
                    if resolving { Some(FieldUnitKind::Index { index: search(0)?, data: search(1)? }) } else { None };
                (ObjectType::IndexField, kind, 2)
            }
            Opcode::BankField => {
                let kind = if resolving {
                    let bank_value = self.operand(walk, op.arg(2)?)?.to_integer()?;
                    Some(FieldUnitKind::Bank { region: search(0)?, bank: search(1)?, bank_value })
                } else {
                    None
                };
                (ObjectType::BankField, kind, 3)
            }
            _ => return Err(AmlError::BadParameter),
        };

        let mut flags = FieldFlags(op.integer_arg(flags_index)? as u8);
        let list = op.bytes_arg(flags_index + 1)?;
        let mut list = ParserState::new(walk.parser.aml.clone(), list.start, list.end);
        let mut bit_offset = 0;

        while list.cursor < list.aml_end {
            match list.peek()? {
                // ReservedField
                0x00 => {
                    list.cursor += 1;
                    bit_offset += list.raw_pkglength()?;
                }
                // AccessField
                0x01 => {
                    list.cursor += 1;
                    let access_type = list.next()?;
                    let _access_attrib = list.next()?;
                    flags = flags.with_access_type(access_type);
                }
                // ConnectField
                0x02 => {
                    list.cursor += 1;
                    let connection = list.namestring()?;
                    warn!("Ignoring connection {} of field list", connection);
                }
                // ExtendedAccessField
                0x03 => {
                    list.cursor += 1;
                    let access_type = list.next()?;
                    let _access_attrib = list.next()?;
                    let _access_length = list.next()?;
                    flags = flags.with_access_type(access_type);
                }
                _ => {
                    let seg = list.name_seg()?;
                    let bit_length = list.raw_pkglength()?;
                    let node = self.declare(walk, &AmlName::from_name_seg(seg), typ)?;
                    if let Some(ref kind) = kind {
                        let unit = FieldUnit { kind: kind.clone(), flags, bit_index: bit_offset, bit_length };
                        self.attach(walk, node, ObjectRef::new(Object::FieldUnit(unit)))?;
                    }
                    bit_offset += bit_length;
                }
            }
        }
        Ok(())
    }

    fn create_buffer_field(&self, walk: &WalkState, op: &ParseOp) -> Result<(), AmlError> {
        let name_index = if op.opcode == Opcode::CreateField { 3 } else { 2 };
        let name = op.name_arg(name_index)?;
        let node = self.declare(walk, name, ObjectType::BufferField)?;
        if walk.pass == PassNumber::Declare {
            return Ok(());
        }

        let buffer = self.operand(walk, op.arg(0)?)?;
        if buffer.typ() != ObjectType::Buffer {
            return Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Buffer, got: buffer.typ() });
        }
        let index = field_position(self.operand(walk, op.arg(1)?)?.to_integer()?)?;
        let byte_field = |bit_length: usize| {
            index.checked_mul(8).map(|bit_index| (bit_index, bit_length)).ok_or(AmlError::BufferFieldOutOfRange)
        };

        let (bit_index, bit_length) = match op.opcode {
            Opcode::CreateBitField => (index, 1),
            Opcode::CreateByteField => byte_field(8)?,
            Opcode::CreateWordField => byte_field(16)?,
            Opcode::CreateDWordField => byte_field(32)?,
            Opcode::CreateQWordField => byte_field(64)?,
            _ => (index, field_position(self.operand(walk, op.arg(2)?)?.to_integer()?)?),
        };
        if bit_index.checked_add(bit_length).is_none() {
            return Err(AmlError::BufferFieldOutOfRange);
        }

        self.attach(walk, node, ObjectRef::new(Object::BufferField { buffer, bit_index, bit_length }))
    }

    /*
     * Execution
     */

    fn execute_op(&self, walk: &mut WalkState, op: &ParseOp) -> Result<OpArg, AmlError> {
        if walk.pass == PassNumber::Declare && !is_declaration(op.opcode) {
            return Ok(OpArg::Null);
        }

        match op.opcode {
            Opcode::Zero => Ok(integer(0)),
            Opcode::One => Ok(integer(1)),
            Opcode::Ones => Ok(integer(ONES)),
            Opcode::Revision => Ok(integer(INTERPRETER_REVISION)),
            Opcode::BytePrefix | Opcode::WordPrefix | Opcode::DWordPrefix | Opcode::QWordPrefix => {
                Ok(integer(op.integer_arg(0)?))
            }
            Opcode::StringPrefix => match op.arg(0)? {
                OpArg::String(string) => Ok(OpArg::Object(ObjectRef::new(Object::String(string.clone())))),
                _ => Err(AmlError::BadParameter),
            },
            Opcode::Buffer => Ok(OpArg::Object(self.build_buffer(walk, op)?)),
            Opcode::Package | Opcode::VarPackage => Ok(OpArg::Object(self.build_package(walk, op)?)),

            Opcode::Name => {
                let node = self.declare(walk, op.name_arg(0)?, ObjectType::Any)?;
                if walk.pass != PassNumber::Declare {
                    let value = self.data_object(walk, op.arg(1)?)?;
                    self.attach(walk, node, value)?;
                }
                Ok(OpArg::Null)
            }
            Opcode::Alias => self.declare_alias(walk, op).map(|_| OpArg::Null),
            Opcode::Mutex => {
                let node = self.declare(walk, op.name_arg(0)?, ObjectType::Mutex)?;
                let sync_level = (op.integer_arg(1)? & 0xf) as u8;
                self.attach(walk, node, ObjectRef::new(Object::Mutex { sync_level }))?;
                Ok(OpArg::Null)
            }
            Opcode::Event => {
                let node = self.declare(walk, op.name_arg(0)?, ObjectType::Event)?;
                self.attach(walk, node, ObjectRef::new(Object::Event { pending: 0 }))?;
                Ok(OpArg::Null)
            }
            Opcode::OpRegion => self.declare_region(walk, op).map(|_| OpArg::Null),
            Opcode::Field | Opcode::IndexField | Opcode::BankField => {
                self.declare_fields(walk, op).map(|_| OpArg::Null)
            }
            Opcode::CreateBitField
            | Opcode::CreateByteField
            | Opcode::CreateWordField
            | Opcode::CreateDWordField
            | Opcode::CreateQWordField
            | Opcode::CreateField => self.create_buffer_field(walk, op).map(|_| OpArg::Null),

            // These have done their work by the time they complete
            Opcode::Scope
            | Opcode::Device
            | Opcode::Processor
            | Opcode::PowerRes
            | Opcode::ThermalZone
            | Opcode::Method
            | Opcode::External
            | Opcode::Else
            | Opcode::While
            | Opcode::Noop => Ok(OpArg::Null),

            Opcode::If => {
                walk.if_result = walk
                    .control()
                    .filter(|control| control.op_offset == op.aml_offset)
                    .map(|control| control.predicate);
                Ok(OpArg::Null)
            }
            Opcode::Break => {
                walk.pending = Some(PendingControl::Break);
                Ok(OpArg::Null)
            }
            Opcode::Continue => {
                walk.pending = Some(PendingControl::Continue);
                Ok(OpArg::Null)
            }
            Opcode::Return => {
                let value = self.operand(walk, op.arg(0)?)?;
                walk.return_value = Some(value);
                walk.pending = Some(PendingControl::Return);
                Ok(OpArg::Null)
            }

            Opcode::MethodCall => {
                let node = match op.arg(0)? {
                    OpArg::Node(node) => *node,
                    _ => return Err(AmlError::BadParameter),
                };
                let args =
                    op.args[1..].iter().map(|arg| self.operand(walk, arg)).collect::<Result<Vec<_>, AmlError>>()?;
                let result = self.invoke_method(node, args, walk.method_nesting_depth + 1)?;
                Ok(OpArg::Object(result))
            }

            Opcode::Store => {
                let value = self.operand(walk, op.arg(0)?)?;
                self.store(walk, value.clone(), op.arg(1)?)?;
                Ok(OpArg::Object(value))
            }
            Opcode::CopyObject => {
                let value = self.operand(walk, op.arg(0)?)?;
                match op.arg(1)? {
                    OpArg::Node(node) => self.namespace.lock().attach_object(*node, value.copy_value())?,
                    target => self.store(walk, value.clone(), target)?,
                }
                Ok(OpArg::Object(value))
            }

            Opcode::Add
            | Opcode::Subtract
            | Opcode::Multiply
            | Opcode::And
            | Opcode::Nand
            | Opcode::Or
            | Opcode::Nor
            | Opcode::Xor
            | Opcode::Mod
            | Opcode::ShiftLeft
            | Opcode::ShiftRight => {
                let left = self.operand(walk, op.arg(0)?)?.to_integer()?;
                let right = self.operand(walk, op.arg(1)?)?.to_integer()?;
                let result = match op.opcode {
                    Opcode::Add => left.wrapping_add(right),
                    Opcode::Subtract => left.wrapping_sub(right),
                    Opcode::Multiply => left.wrapping_mul(right),
                    Opcode::And => left & right,
                    Opcode::Nand => !(left & right),
                    Opcode::Or => left | right,
                    Opcode::Nor => !(left | right),
                    Opcode::Xor => left ^ right,
                    Opcode::Mod => left.checked_rem(right).ok_or(AmlError::DivideByZero)?,
                    Opcode::ShiftLeft => {
                        if right >= 64 {
                            0
                        } else {
                            left << right
                        }
                    }
                    _ => {
                        if right >= 64 {
                            0
                        } else {
                            left >> right
                        }
                    }
                };
                self.store_result(walk, result, op.arg(2)?)
            }
            Opcode::Divide => {
                let dividend = self.operand(walk, op.arg(0)?)?.to_integer()?;
                let divisor = self.operand(walk, op.arg(1)?)?.to_integer()?;
                let quotient = dividend.checked_div(divisor).ok_or(AmlError::DivideByZero)?;
                self.store_result(walk, dividend % divisor, op.arg(2)?)?;
                self.store_result(walk, quotient, op.arg(3)?)
            }
            Opcode::Not | Opcode::FindSetLeftBit | Opcode::FindSetRightBit => {
                let operand = self.operand(walk, op.arg(0)?)?.to_integer()?;
                let result = match op.opcode {
                    Opcode::Not => !operand,
                    _ if operand == 0 => 0,
                    Opcode::FindSetLeftBit => 64 - operand.leading_zeros() as u64,
                    _ => operand.trailing_zeros() as u64 + 1,
                };
                self.store_result(walk, result, op.arg(1)?)
            }
            Opcode::Increment | Opcode::Decrement => {
                let target = op.arg(0)?;
                let value = self.operand(walk, target)?.to_integer()?;
                let result =
                    if op.opcode == Opcode::Increment { value.wrapping_add(1) } else { value.wrapping_sub(1) };
                self.store_result(walk, result, target)
            }

            Opcode::LAnd | Opcode::LOr => {
                let left = self.operand(walk, op.arg(0)?)?.to_integer()? != 0;
                let right = self.operand(walk, op.arg(1)?)?.to_integer()? != 0;
                let result = if op.opcode == Opcode::LAnd { left && right } else { left || right };
                Ok(boolean(result))
            }
            Opcode::LNot => Ok(boolean(self.operand(walk, op.arg(0)?)?.to_integer()? == 0)),
            Opcode::LEqual
            | Opcode::LNotEqual
            | Opcode::LGreater
            | Opcode::LGreaterEqual
            | Opcode::LLess
            | Opcode::LLessEqual => {
                let left = self.operand(walk, op.arg(0)?)?;
                let right = self.operand(walk, op.arg(1)?)?;
                let ordering = compare(&left, &right)?;
                Ok(boolean(match op.opcode {
                    Opcode::LEqual => ordering == Ordering::Equal,
                    Opcode::LNotEqual => ordering != Ordering::Equal,
                    Opcode::LGreater => ordering == Ordering::Greater,
                    Opcode::LGreaterEqual => ordering != Ordering::Less,
                    Opcode::LLess => ordering == Ordering::Less,
                    _ => ordering != Ordering::Greater,
                }))
            }

            Opcode::RefOf => {
                let target = self.reference_target(walk, op.arg(0)?)?;
                Ok(OpArg::Object(ObjectRef::new(Object::Reference { kind: ReferenceKind::RefOf, target })))
            }
            Opcode::CondRefOf => {
                if let OpArg::Name(_) = op.arg(0)? {
                    return Ok(boolean(false));
                }
                let target = self.reference_target(walk, op.arg(0)?)?;
                let reference = ObjectRef::new(Object::Reference { kind: ReferenceKind::RefOf, target });
                self.store(walk, reference, op.arg(1)?)?;
                Ok(boolean(true))
            }
            Opcode::DerefOf => {
                let reference = self.operand(walk, op.arg(0)?)?;
                Ok(OpArg::Object(self.dereference(walk, &reference)?))
            }
            Opcode::Index => {
                let object = self.operand(walk, op.arg(0)?)?;
                let index = self.operand(walk, op.arg(1)?)?.to_integer()? as usize;
                if index >= length_of(&object)? {
                    return Err(AmlError::BadParameter);
                }

                let reference = ObjectRef::new(Object::Reference {
                    kind: ReferenceKind::Index,
                    target: ReferenceTarget::Element { object, index },
                });
                self.store(walk, reference.clone(), op.arg(2)?)?;
                Ok(OpArg::Object(reference))
            }
            Opcode::SizeOf => {
                let object = self.operand(walk, op.arg(0)?)?;
                Ok(integer(length_of(&object)? as u64))
            }

            Opcode::Notify => {
                let value = self.operand(walk, op.arg(1)?)?.to_integer()?;
                info!("Notify({:?}, {:#x})", op.arg(0)?, value);
                Ok(OpArg::Null)
            }
            Opcode::Stall => {
                let microseconds = self.operand(walk, op.arg(0)?)?.to_integer()?;
                self.handler.stall(microseconds);
                Ok(OpArg::Null)
            }
            Opcode::Sleep => {
                let milliseconds = self.operand(walk, op.arg(0)?)?.to_integer()?;
                self.handler.sleep(milliseconds);
                Ok(OpArg::Null)
            }
            Opcode::Fatal => {
                let fatal_type = self.operand(walk, op.arg(0)?)?.to_integer()? as u8;
                let fatal_code = self.operand(walk, op.arg(1)?)?.to_integer()? as u32;
                let fatal_arg = self.operand(walk, op.arg(2)?)?.to_integer()?;
                error!("Fatal error from AML: type={:#x}, code={:#x}, arg={:#x}", fatal_type, fatal_code, fatal_arg);
                self.handler.handle_fatal_error(fatal_type, fatal_code, fatal_arg);
                Ok(OpArg::Null)
            }

            opcode => Err(AmlError::UnimplementedOpcode(opcode)),
        }
    }

    /// Turn an argument into the object it stands for. Names are resolved, and deferred objects are realized.
    pub(crate) fn operand(&self, walk: &WalkState, arg: &OpArg) -> Result<ObjectRef, AmlError> {
        let object = match arg {
            OpArg::Integer(value) => ObjectRef::new(Object::Integer(*value)),
            OpArg::String(string) => ObjectRef::new(Object::String(string.clone())),
            OpArg::Object(object) => object.clone(),
            OpArg::Node(node) => self.node_value(*node)?,
            OpArg::Local(local) => walk
                .locals
                .get(*local as usize)
                .cloned()
                .flatten()
                .ok_or(AmlError::UninitializedLocal(*local))?,
            OpArg::Arg(arg) => {
                walk.args.get(*arg as usize).cloned().flatten().ok_or(AmlError::UninitializedArg(*arg))?
            }
            OpArg::Name(name) => {
                if walk.pass == PassNumber::Declare {
                    return Ok(ObjectRef::new(Object::Uninitialized));
                }
                let found = self.namespace.lock().search(name, walk.current_scope_node());
                self.node_value(found?)?
            }
            OpArg::Debug => ObjectRef::new(Object::Debug),
            OpArg::Null => ObjectRef::new(Object::Uninitialized),
            OpArg::Bytes(_) => return Err(AmlError::BadParameter),
        };

        if !object.is_realized() {
            self.realize(&object)?;
        }
        Ok(object)
    }

    fn node_value(&self, node: NodeHandle) -> Result<ObjectRef, AmlError> {
        match resolve_node_to_value(self, node)? {
            Resolved::Object(object) => Ok(object),
            Resolved::Node(node) => {
                Ok(ObjectRef::new(Object::Reference { kind: ReferenceKind::Name, target: ReferenceTarget::Node(node) }))
            }
        }
    }

    /// The object a `Name` binds. Constant data is used as it is, and anything else is copied.
    fn data_object(&self, walk: &WalkState, arg: &OpArg) -> Result<ObjectRef, AmlError> {
        match arg {
            OpArg::Object(object) => Ok(object.clone()),
            other => Ok(self.operand(walk, other)?.copy_value()),
        }
    }

    fn store_result(&self, walk: &mut WalkState, value: u64, target: &OpArg) -> Result<OpArg, AmlError> {
        let result = ObjectRef::new(Object::Integer(value));
        self.store(walk, result.clone(), target)?;
        Ok(OpArg::Object(result))
    }

    fn store(&self, walk: &mut WalkState, value: ObjectRef, target: &OpArg) -> Result<(), AmlError> {
        match target {
            OpArg::Null => Ok(()),
            OpArg::Local(local) => {
                let slot = walk.locals.get_mut(*local as usize).ok_or(AmlError::BadParameter)?;
                *slot = Some(value.copy_value());
                Ok(())
            }
            OpArg::Arg(arg) => {
                let current = walk.args.get(*arg as usize).ok_or(AmlError::BadParameter)?.clone();
                // Arguments passed by reference are stored through
                if let Some(current) = current {
                    if matches!(*current.lock(), Object::Reference { kind: ReferenceKind::RefOf, .. }) {
                        return self.store_through(walk, &current, value);
                    }
                }
                if let Some(slot) = walk.args.get_mut(*arg as usize) {
                    *slot = Some(value.copy_value());
                }
                Ok(())
            }
            OpArg::Debug => {
                info!("[AML Debug] {:?}", value);
                Ok(())
            }
            OpArg::Node(node) => self.store_to_node(walk, *node, value),
            OpArg::Object(reference) => self.store_through(walk, reference, value),
            OpArg::Name(name) => {
                if walk.pass == PassNumber::Declare {
                    return Ok(());
                }
                let found = self.namespace.lock().search(name, walk.current_scope_node());
                self.store_to_node(walk, found?, value)
            }
            OpArg::Integer(_) | OpArg::String(_) | OpArg::Bytes(_) => Err(AmlError::BadParameter),
        }
    }

    /// Store to a named object. The value is converted to the type of the object already there, which keeps the
    /// node's type unchanged.
    fn store_to_node(&self, walk: &mut WalkState, node: NodeHandle, value: ObjectRef) -> Result<(), AmlError> {
        let (typ, object) = {
            let namespace = self.namespace.lock();
            let node = namespace.get(node)?;
            (node.typ, node.object.clone())
        };

        match (typ, object) {
            (
                ObjectType::BufferField | ObjectType::RegionField | ObjectType::BankField | ObjectType::IndexField,
                Some(field),
            ) => {
                self.write_field(&field, value)
            }
            (ObjectType::Integer, Some(object)) => {
                let value = value.to_integer()?;
                *object.lock() = Object::Integer(value);
                Ok(())
            }
            (ObjectType::String, Some(object)) => {
                let value = to_string(&value)?;
                *object.lock() = Object::String(value);
                Ok(())
            }
            (ObjectType::Buffer, Some(object)) => {
                let value = to_buffer(&value)?;
                *object.lock() = Object::Buffer { data: value, deferred: None };
                Ok(())
            }
            (ObjectType::Package, Some(object)) => {
                let copy = crate::object::copy_package(&self.caches.state, &value)?;
                let elements = match *copy.lock() {
                    Object::Package { ref mut elements, .. } => core::mem::take(elements),
                    _ => Vec::new(),
                };
                *object.lock() = Object::Package { elements, deferred: None };
                Ok(())
            }
            (ObjectType::LocalReference, Some(object)) => self.store_through(walk, &object, value),
            _ => self.namespace.lock().attach_object(node, value.copy_value()),
        }
    }

    fn store_through(&self, walk: &mut WalkState, reference: &ObjectRef, value: ObjectRef) -> Result<(), AmlError> {
        let target = match *reference.lock() {
            Object::Reference { ref target, .. } => target.clone(),
            ref other => {
                return Err(AmlError::OperandTypeError { declared: ObjectType::LocalReference, actual: other.typ() })
            }
        };

        match target {
            ReferenceTarget::Node(node) => self.store_to_node(walk, node, value),
            ReferenceTarget::Element { object, index } => {
                let byte = value.to_integer();
                let copy = value.copy_value();
                let mut object = object.lock();
                match *object {
                    Object::Package { ref mut elements, .. } => {
                        *elements.get_mut(index).ok_or(AmlError::BadParameter)? = copy;
                    }
                    Object::Buffer { ref mut data, .. } => {
                        *data.get_mut(index).ok_or(AmlError::BadParameter)? = byte? as u8;
                    }
                    ref other => {
                        return Err(AmlError::ObjectNotOfExpectedType {
                            expected: ObjectType::Package,
                            got: other.typ(),
                        })
                    }
                }
                Ok(())
            }
            ReferenceTarget::Object(object) => {
                let value = value.lock().clone();
                *object.lock() = value;
                Ok(())
            }
            ReferenceTarget::Table(_) => Err(AmlError::BadParameter),
        }
    }

    fn reference_target(&self, walk: &WalkState, arg: &OpArg) -> Result<ReferenceTarget, AmlError> {
        match arg {
            OpArg::Node(node) => Ok(ReferenceTarget::Node(*node)),
            OpArg::Object(object) => Ok(ReferenceTarget::Object(object.clone())),
            OpArg::Local(_) | OpArg::Arg(_) => Ok(ReferenceTarget::Object(self.operand(walk, arg)?)),
            _ => Err(AmlError::BadParameter),
        }
    }

    fn dereference(&self, walk: &WalkState, reference: &ObjectRef) -> Result<ObjectRef, AmlError> {
        let object = reference.lock().clone();
        match object {
            Object::Reference { target: ReferenceTarget::Node(node), .. } => self.operand(walk, &OpArg::Node(node)),
            Object::Reference { target: ReferenceTarget::Object(object), .. } => Ok(object),
            Object::Reference { target: ReferenceTarget::Element { object, index }, .. } => {
                let element = match *object.lock() {
                    Object::Package { ref elements, .. } => elements.get(index).cloned(),
                    Object::Buffer { ref data, .. } => {
                        data.get(index).map(|&byte| ObjectRef::new(Object::Integer(byte as u64)))
                    }
                    _ => None,
                };
                let element = element.ok_or(AmlError::BadParameter)?;
                if !element.is_realized() {
                    self.realize(&element)?;
                }
                Ok(element)
            }
            // A string names the object to dereference
            Object::String(path) => {
                let name = path.parse::<AmlName>()?;
                self.operand(walk, &OpArg::Name(name))
            }
            other => Err(AmlError::OperandTypeError { declared: ObjectType::LocalReference, actual: other.typ() }),
        }
    }

    /*
     * Data objects
     */

    fn build_buffer(&self, walk: &WalkState, op: &ParseOp) -> Result<ObjectRef, AmlError> {
        let size = allocation_size(self.operand(walk, op.arg(0)?)?.to_integer()?)?;
        let bytes = walk.parser.aml.get(op.bytes_arg(1)?).ok_or(AmlError::RunOutOfStream)?;

        let mut data = zeroed_bytes(size.max(bytes.len()))?;
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(ObjectRef::new(Object::Buffer { data, deferred: None }))
    }

    fn build_package(&self, walk: &WalkState, op: &ParseOp) -> Result<ObjectRef, AmlError> {
        let count = match op.opcode {
            Opcode::VarPackage => allocation_size(self.operand(walk, op.arg(0)?)?.to_integer()?)?,
            _ => op.integer_arg(0)? as usize,
        };

        let given = op.args.len().saturating_sub(1);
        if given > count {
            warn!("Package has {} elements, but its size is {}. Dropping the elements past the end.", given, count);
        }

        let mut elements = Vec::new();
        elements.try_reserve_exact(count).map_err(|_| AmlError::NoMemory)?;
        for arg in op.args.iter().skip(1).take(count) {
            let element = match arg {
                OpArg::Name(name) => self.named_element(walk, name),
                other => self.operand(walk, other)?,
            };
            elements.push(element);
        }
        // Elements that aren't given are each a distinct uninitialized object
        elements.resize_with(count, || ObjectRef::new(Object::Uninitialized));

        Ok(ObjectRef::new(Object::Package { elements, deferred: None }))
    }

    /// Names in a package refer to the object they name, which doesn't have to exist yet.
    fn named_element(&self, walk: &WalkState, name: &AmlName) -> ObjectRef {
        let found = self.namespace.lock().search(name, walk.current_scope_node());
        match found {
            Ok(node) => {
                ObjectRef::new(Object::Reference { kind: ReferenceKind::Name, target: ReferenceTarget::Node(node) })
            }
            Err(_) => {
                warn!("Package element {} does not exist. Leaving it uninitialized.", name);
                ObjectRef::new(Object::Uninitialized)
            }
        }
    }

    /// Realize a deferred buffer, package or region in place. Does nothing if the object has been realized.
    pub(crate) fn realize(&self, object: &ObjectRef) -> Result<(), AmlError> {
        let deferred = match *object.lock() {
            Object::Buffer { deferred: Some(ref deferred), .. }
            | Object::Package { deferred: Some(ref deferred), .. } => deferred.clone(),
            Object::Region(OpRegion { deferred: Some(ref deferred), .. }) => deferred.clone(),
            _ => return Ok(()),
        };
        trace!("Realizing {:?} from {:?}", deferred.opcode, deferred.span);

        if deferred.opcode == Opcode::OpRegion {
            let (base, length) = self.run_deferred(&deferred, |interpreter, walk, op| {
                let base = interpreter.operand(walk, op.arg(0)?)?.to_integer()?;
                let length = interpreter.operand(walk, op.arg(1)?)?.to_integer()?;
                Ok((base, length))
            })?;
            if let Object::Region(ref mut region) = *object.lock() {
                region.base = base;
                region.length = length;
                region.deferred = None;
            }
        } else {
            let realized = self.run_deferred(&deferred, |interpreter, walk, op| match op.opcode {
                Opcode::Buffer => interpreter.build_buffer(walk, op),
                _ => interpreter.build_package(walk, op),
            })?;
            let value = core::mem::replace(&mut *realized.lock(), Object::Uninitialized);
            *object.lock() = value;
        }
        Ok(())
    }

    /// Re-parse the contents of a deferred object with a root op of its opcode, and build the result from the
    /// root op once its arguments have been collected.
    fn run_deferred<T, F>(&self, deferred: &Deferred, build: F) -> Result<T, AmlError>
    where
        F: FnOnce(&Self, &mut WalkState, &ParseOp) -> Result<T, AmlError>,
    {
        let span = &deferred.span;
        let parser = ParserState::new(span.aml.clone(), span.start, span.end);
        let mut walk = WalkState::new(parser, PassNumber::Single, OwnerId::ROOT);
        walk.parser.init_scope(self.caches.ops.alloc(deferred.opcode, span.start), &self.caches.state);

        let result = self.drive_deferred(&mut walk, deferred.scope, build);
        walk.delete(&self.caches);
        result
    }

    fn drive_deferred<T, F>(&self, walk: &mut WalkState, scope: NodeHandle, build: F) -> Result<T, AmlError>
    where
        F: FnOnce(&Self, &mut WalkState, &ParseOp) -> Result<T, AmlError>,
    {
        walk.push_scope(Some(scope), ObjectType::Any, &self.caches.state)?;
        self.run_walk(walk)?;

        let op = walk.parser.take_root_op().ok_or(AmlError::BadParameter)?;
        let result = build(self, walk, &op);
        self.caches.ops.free(op);
        result
    }

    /*
     * Methods
     */

    /// The number of arguments a node takes, if it is a method.
    fn method_arg_count(&self, node: NodeHandle) -> Result<Option<usize>, AmlError> {
        let object = match self.namespace.lock().get(node)?.object.clone() {
            Some(object) => object,
            None => return Ok(None),
        };
        let arg_count = match *object.lock() {
            Object::Method(ref method) => Some(method.flags.arg_count()),
            Object::NativeMethod { flags, .. } => Some(flags.arg_count()),
            _ => None,
        };
        Ok(arg_count)
    }

    pub(crate) fn node_object(&self, node: NodeHandle) -> Result<ObjectRef, AmlError> {
        self.namespace.lock().get(node)?.object.clone().ok_or(AmlError::UninitializedNode)
    }

    /// Invoke the method at `node` if it is one, or otherwise resolve the node to its value.
    pub(crate) fn evaluate_node(
        &self,
        node: NodeHandle,
        args: Vec<ObjectRef>,
        depth: usize,
    ) -> Result<ObjectRef, AmlError> {
        if self.method_arg_count(node)?.is_some() {
            return self.invoke_method(node, args, depth);
        }
        if !args.is_empty() {
            return Err(AmlError::MethodArgCountIncorrect);
        }
        self.node_value(node)
    }

    /// Run a method. Objects the method creates are owned by an owner id of their own, and are removed from the
    /// namespace when it returns.
    pub(crate) fn invoke_method(
        &self,
        node: NodeHandle,
        args: Vec<ObjectRef>,
        depth: usize,
    ) -> Result<ObjectRef, AmlError> {
        if depth > self.config.max_method_nesting {
            return Err(AmlError::MethodNestingTooDeep);
        }

        let object = self.node_object(node)?;
        let callee = match *object.lock() {
            Object::Method(ref method) => Callee::Aml(method.clone()),
            Object::NativeMethod { ref f, flags } => Callee::Native(f.clone(), flags),
            ref other => return Err(AmlError::OperandTypeError { declared: ObjectType::Method, actual: other.typ() }),
        };

        let method = match callee {
            Callee::Native(f, flags) => {
                if args.len() != flags.arg_count() {
                    return Err(AmlError::MethodArgCountIncorrect);
                }
                return f(&args);
            }
            Callee::Aml(method) => method,
        };
        if args.len() != method.flags.arg_count() {
            return Err(AmlError::MethodArgCountIncorrect);
        }

        let owner_id = self.tables.lock().allocate_transient_owner()?;
        trace!("Invoking method {:?} at depth {} with owner {:?}", node, depth, owner_id);

        let parser = ParserState::new(method.code.aml.clone(), method.code.start, method.code.end);
        let mut walk = WalkState::new(parser, PassNumber::Single, owner_id);
        walk.method_node = Some(node);
        walk.method_nesting_depth = depth;
        for (slot, arg) in walk.args.iter_mut().zip(args) {
            *slot = Some(arg);
        }
        walk.attach_thread(self.handler.thread_id(), &self.caches.state);
        walk.parser.init_scope(self.caches.ops.alloc(Opcode::Method, method.code.start), &self.caches.state);

        let result = match walk.push_scope(Some(node), ObjectType::Method, &self.caches.state) {
            Ok(()) => self.run_walk(&mut walk),
            Err(err) => Err(err),
        };
        let return_value = walk.return_value.take();
        walk.delete(&self.caches);
        self.release_owner(owner_id);

        result?;
        Ok(return_value.unwrap_or_else(|| ObjectRef::new(Object::Uninitialized)))
    }

    /// Remove the objects created by a method invocation, and free its owner id.
    fn release_owner(&self, owner_id: OwnerId) {
        let detached = self.namespace.lock().delete_owner(owner_id);
        for object in detached {
            release_object_tree(&self.caches.state, object);
        }
        self.tables.lock().release_transient_owner(owner_id);
    }
}

impl ResolveContext for Interpreter {
    fn node_info(&self, node: NodeHandle) -> Result<NodeInfo, AmlError> {
        let namespace = self.namespace.lock();
        let node = namespace.get(node)?;
        Ok(NodeInfo { typ: node.typ, flags: node.flags, object: node.object.clone(), target: node.target })
    }

    fn realize_package(&self, package: &ObjectRef) -> Result<(), AmlError> {
        self.realize(package)
    }

    fn realize_buffer(&self, buffer: &ObjectRef) -> Result<(), AmlError> {
        self.realize(buffer)
    }

    fn read_field(&self, field: &ObjectRef) -> Result<ObjectRef, AmlError> {
        Interpreter::read_field(self, field)
    }
}

/// Ops that still take effect in the declaration pass.
fn is_declaration(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::Name
            | Opcode::Alias
            | Opcode::Scope
            | Opcode::Device
            | Opcode::Processor
            | Opcode::PowerRes
            | Opcode::ThermalZone
            | Opcode::Method
            | Opcode::Mutex
            | Opcode::Event
            | Opcode::OpRegion
            | Opcode::Field
            | Opcode::IndexField
            | Opcode::BankField
            | Opcode::CreateBitField
            | Opcode::CreateByteField
            | Opcode::CreateWordField
            | Opcode::CreateDWordField
            | Opcode::CreateQWordField
            | Opcode::CreateField
            | Opcode::External
    )
}

fn integer(value: u64) -> OpArg {
    OpArg::Object(ObjectRef::new(Object::Integer(value)))
}

fn boolean(value: bool) -> OpArg {
    integer(if value { ONES } else { 0 })
}

/// The size of a buffer or package, which comes from the AML and so can be larger than anything that could be
/// allocated.
fn allocation_size(size: u64) -> Result<usize, AmlError> {
    usize::try_from(size).map_err(|_| AmlError::NoMemory)
}

fn field_position(value: u64) -> Result<usize, AmlError> {
    usize::try_from(value).map_err(|_| AmlError::BufferFieldOutOfRange)
}

fn length_of(object: &ObjectRef) -> Result<usize, AmlError> {
    match *object.lock() {
        Object::Buffer { ref data, .. } => Ok(data.len()),
        Object::String(ref string) => Ok(string.len()),
        Object::Package { ref elements, .. } => Ok(elements.len()),
        ref other => Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Package, got: other.typ() }),
    }
}

/// Compare two operands. Strings and buffers compare by their contents, and anything else as integers.
fn compare(left: &ObjectRef, right: &ObjectRef) -> Result<Ordering, AmlError> {
    let left = left.lock().clone();
    let right = right.lock().clone();
    match (&left, &right) {
        (Object::String(left), Object::String(right)) => Ok(left.cmp(right)),
        (Object::Buffer { data: left, .. }, Object::Buffer { data: right, .. }) => Ok(left.cmp(right)),
        _ => Ok(left.as_integer()?.cmp(&right.as_integer()?)),
    }
}

fn to_string(value: &ObjectRef) -> Result<String, AmlError> {
    match *value.lock() {
        Object::String(ref string) => Ok(string.clone()),
        Object::Integer(value) => Ok(alloc::format!("{:016X}", value)),
        Object::Buffer { ref data, .. } => {
            Ok(data.iter().take_while(|&&byte| byte != 0).map(|&byte| byte as char).collect())
        }
        ref other => Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::String, got: other.typ() }),
    }
}

fn to_buffer(value: &ObjectRef) -> Result<Vec<u8>, AmlError> {
    match *value.lock() {
        Object::Buffer { ref data, .. } => Ok(data.clone()),
        Object::Integer(value) => Ok(value.to_le_bytes().to_vec()),
        Object::String(ref string) => Ok(string.as_bytes().to_vec()),
        ref other => Err(AmlError::ObjectNotOfExpectedType { expected: ObjectType::Buffer, got: other.typ() }),
    }
}
