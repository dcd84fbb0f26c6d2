use crate::{
    namespace::{self, AmlName, NameComponent, NameSeg},
    op::{OpCache, ParseOp},
    opcode::{ArgCount, ArgList, ArgType, Opcode},
    pool::ObjectPool,
    state::{self, GenericState, ParserScope, StateList, StatePayload},
    AmlError,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use bit_field::BitField;
use byteorder::{ByteOrder, LittleEndian};

const NULL_NAME: u8 = 0x00;
const DUAL_NAME_PREFIX: u8 = 0x2e;
const MULTI_NAME_PREFIX: u8 = 0x2f;
const ROOT_CHAR: u8 = b'\\';
const PARENT_PREFIX_CHAR: u8 = b'^';
const EXT_OP_PREFIX: u8 = 0x5b;
const LNOT_OP: u8 = 0x92;

/// What the parent of a popped parser scope was waiting for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ScopeInfo {
    pub opcode: Opcode,
    pub remaining: ArgList,
    pub count: ArgCount,
}

/// A cursor over a range of AML, with the stack of ops whose arguments are being parsed.
pub struct ParserState {
    pub aml: Arc<[u8]>,
    pub aml_start: usize,
    pub aml_end: usize,
    pub cursor: usize,
    /// End of the innermost package being parsed.
    pub pkg_end: usize,
    scope: StateList,
}

impl ParserState {
    pub fn new(aml: Arc<[u8]>, start: usize, end: usize) -> ParserState {
        let end = end.min(aml.len());
        ParserState { aml, aml_start: start, aml_end: end, cursor: start, pkg_end: end, scope: None }
    }

    /*
     * Scope stack
     */

    /// Create the bottom scope of the stack, for `root_op`, covering the whole range of AML. A root with a fixed
    /// argument list completes when its count runs out, so a trailing empty `ByteList` is still delivered.
    pub fn init_scope(&mut self, root_op: Box<ParseOp>, states: &ObjectPool<GenericState>) {
        let args = root_op.opcode.root_args();
        let (arg_count, arg_end) = match args.first() {
            Some(arg) if arg.is_variable() => (ArgCount::Variable, self.aml_end),
            _ => (ArgCount::Fixed(args.len()), usize::MAX),
        };
        self.pkg_end = self.aml_end;
        let state = states.create_parser_scope(root_op, ArgList::new(args), arg_count, arg_end, self.aml_end);
        state::push_state(&mut self.scope, state);
    }

    /// Start parsing the arguments of `op`.
    pub fn push_scope(
        &mut self,
        op: Box<ParseOp>,
        remaining: ArgList,
        count: ArgCount,
        states: &ObjectPool<GenericState>,
    ) {
        let arg_end = match count {
            ArgCount::Variable => self.pkg_end,
            ArgCount::Fixed(_) => usize::MAX,
        };
        let state = states.create_parser_scope(op, remaining, count, arg_end, self.pkg_end);
        state::push_state(&mut self.scope, state);
    }

    /// Pop the top scope, returning its op and the state of the scope that is now on top. Returns `None`, and
    /// leaves the stack alone, if only the root scope is left.
    pub fn pop_scope(&mut self, states: &ObjectPool<GenericState>) -> Option<(Box<ParseOp>, ScopeInfo)> {
        if self.is_root_scope() {
            return None;
        }

        let mut popped = state::pop_state(&mut self.scope)?;
        let op = match popped.payload {
            StatePayload::ParserScope(ref mut scope) => scope.op.take(),
            _ => None,
        };
        states.delete_state(Some(popped));

        let (info, pkg_end) = {
            let parent = self.current_scope()?;
            let info = ScopeInfo {
                opcode: parent.op.as_ref().map_or(Opcode::Scope, |op| op.opcode),
                remaining: parent.arg_list,
                count: parent.arg_count,
            };
            (info, parent.pkg_end)
        };
        self.pkg_end = pkg_end;
        Some((op?, info))
    }

    pub fn current_scope(&self) -> Option<&ParserScope> {
        match state::peek_state(&self.scope).map(|state| &state.payload) {
            Some(StatePayload::ParserScope(scope)) => Some(scope),
            _ => None,
        }
    }

    pub fn current_scope_mut(&mut self) -> Option<&mut ParserScope> {
        match state::peek_state_mut(&mut self.scope).map(|state| &mut state.payload) {
            Some(StatePayload::ParserScope(scope)) => Some(scope),
            _ => None,
        }
    }

    pub fn current_op(&self) -> Option<&ParseOp> {
        self.current_scope().and_then(|scope| scope.op.as_deref())
    }

    pub fn current_op_mut(&mut self) -> Option<&mut ParseOp> {
        self.current_scope_mut().and_then(|scope| scope.op.as_deref_mut())
    }

    /// The type of the next argument the current op is waiting for.
    pub fn current_arg_type(&self) -> Option<ArgType> {
        self.current_scope().and_then(|scope| scope.arg_list.peek())
    }

    pub fn has_completed_scope(&self) -> bool {
        self.current_scope().map_or(true, |scope| scope.is_complete(self.cursor))
    }

    pub fn is_root_scope(&self) -> bool {
        state::iter_states(&self.scope).nth(1).is_none()
    }

    pub fn scope_depth(&self) -> usize {
        state::iter_states(&self.scope).count()
    }

    /// Move past the current argument of the top scope. Once only a variable-length list is left, the scope runs
    /// to the end of its package.
    pub fn advance_arg(&mut self) {
        if let Some(scope) = self.current_scope_mut() {
            if let ArgCount::Fixed(count) = scope.arg_count {
                scope.arg_list = scope.arg_list.advance();
                scope.arg_count = ArgCount::Fixed(count.saturating_sub(1));

                if scope.arg_list.peek().map_or(false, |arg| arg.is_variable()) {
                    scope.arg_count = ArgCount::Variable;
                    scope.arg_end = scope.pkg_end;
                }
            }
        }
    }

    /// Replace the arguments the top scope is waiting for. Used to rewind a `While` loop to its predicate.
    pub fn reset_args(&mut self, remaining: ArgList, count: ArgCount) {
        if let Some(scope) = self.current_scope_mut() {
            scope.arg_list = remaining;
            scope.arg_count = count;
            scope.arg_end = usize::MAX;
        }
    }

    /// Set the package end of the top scope, once its `PkgLength` has been decoded.
    pub fn set_package_end(&mut self, end: usize) {
        self.pkg_end = end;
        if let Some(scope) = self.current_scope_mut() {
            scope.pkg_end = end;
        }
    }

    /// Take the root op back out of the stack, once it has been fully parsed.
    pub fn take_root_op(&mut self) -> Option<Box<ParseOp>> {
        if self.scope.is_none() || !self.is_root_scope() {
            return None;
        }
        self.current_scope_mut().and_then(|scope| scope.op.take())
    }

    /// Delete every scope, freeing the ops they hold. Used when a parse is abandoned.
    pub fn cleanup_scope(&mut self, ops: &OpCache, states: &ObjectPool<GenericState>) {
        while let Some(mut popped) = state::pop_state(&mut self.scope) {
            if let StatePayload::ParserScope(ref mut scope) = popped.payload {
                if let Some(op) = scope.op.take() {
                    ops.free(op);
                }
            }
            states.delete_state(Some(popped));
        }
    }

    /*
     * Stream
     */

    pub fn next(&mut self) -> Result<u8, AmlError> {
        let byte = self.peek()?;
        self.cursor += 1;
        Ok(byte)
    }

    pub fn peek(&self) -> Result<u8, AmlError> {
        if self.cursor >= self.aml_end {
            return Err(AmlError::RunOutOfStream);
        }
        Ok(self.aml[self.cursor])
    }

    fn take(&mut self, length: usize) -> Result<&[u8], AmlError> {
        let end = self.cursor.checked_add(length).ok_or(AmlError::RunOutOfStream)?;
        if end > self.aml_end {
            return Err(AmlError::RunOutOfStream);
        }
        let start = self.cursor;
        self.cursor = end;
        Ok(&self.aml[start..end])
    }

    pub fn next_u16(&mut self) -> Result<u16, AmlError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn next_u32(&mut self) -> Result<u32, AmlError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn next_u64(&mut self) -> Result<u64, AmlError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    /// Decode a `PkgLength`. The encoded length counts from the first byte of the `PkgLength` itself, and the end
    /// of the package it describes must lie within the enclosing package.
    pub fn pkglength(&mut self) -> Result<usize, AmlError> {
        let start = self.cursor;
        let length = self.raw_pkglength()?;
        let end = start.checked_add(length).ok_or(AmlError::InvalidPkgLength)?;

        if end > self.pkg_end || end < self.cursor {
            return Err(AmlError::InvalidPkgLength);
        }
        Ok(end)
    }

    /// Decode the value of a `PkgLength` encoding, without interpreting it as the extent of a package. Field lists
    /// use this encoding for bit lengths.
    pub fn raw_pkglength(&mut self) -> Result<usize, AmlError> {
        let lead_byte = self.next()?;
        let byte_count = lead_byte.get_bits(6..8);

        if byte_count == 0 {
            Ok(lead_byte.get_bits(0..6) as usize)
        } else {
            let mut length = lead_byte.get_bits(0..4) as usize;
            for i in 0..byte_count {
                length |= (self.next()? as usize) << (4 + i * 8);
            }
            Ok(length)
        }
    }

    /// Decode a null-terminated ASCII string.
    pub fn string(&mut self) -> Result<alloc::string::String, AmlError> {
        let mut bytes = Vec::new();
        loop {
            match self.next()? {
                0x00 => break,
                byte => bytes.push(byte),
            }
        }
        alloc::string::String::from_utf8(bytes).map_err(|_| AmlError::InvalidName(None))
    }

    pub fn is_name_start(byte: u8) -> bool {
        namespace::is_lead_name_char(byte)
            || byte == ROOT_CHAR
            || byte == PARENT_PREFIX_CHAR
            || byte == DUAL_NAME_PREFIX
            || byte == MULTI_NAME_PREFIX
    }

    pub fn namestring(&mut self) -> Result<AmlName, AmlError> {
        let mut components = Vec::new();

        match self.peek()? {
            ROOT_CHAR => {
                self.cursor += 1;
                components.push(NameComponent::Root);
            }
            PARENT_PREFIX_CHAR => {
                while self.peek()? == PARENT_PREFIX_CHAR {
                    self.cursor += 1;
                    components.push(NameComponent::Prefix);
                }
            }
            _ => (),
        }

        match self.next()? {
            NULL_NAME => (),
            DUAL_NAME_PREFIX => {
                for _ in 0..2 {
                    components.push(NameComponent::Segment(self.name_seg()?));
                }
            }
            MULTI_NAME_PREFIX => {
                let count = self.next()?;
                for _ in 0..count {
                    components.push(NameComponent::Segment(self.name_seg()?));
                }
            }
            first if namespace::is_lead_name_char(first) => {
                self.cursor -= 1;
                components.push(NameComponent::Segment(self.name_seg()?));
            }
            _ => return Err(AmlError::InvalidName(None)),
        }

        Ok(AmlName::from_components(components))
    }

    pub fn name_seg(&mut self) -> Result<NameSeg, AmlError> {
        let bytes = self.take(4)?;
        NameSeg::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Decode the next opcode. If a name starts here, `NamePath` is returned and the name is left in the stream.
    pub fn opcode(&mut self) -> Result<Opcode, AmlError> {
        let first = self.peek()?;
        if Self::is_name_start(first) {
            return Ok(Opcode::NamePath);
        }
        self.cursor += 1;

        Ok(match first {
            0x00 => Opcode::Zero,
            0x01 => Opcode::One,
            0x06 => Opcode::Alias,
            0x08 => Opcode::Name,
            0x0a => Opcode::BytePrefix,
            0x0b => Opcode::WordPrefix,
            0x0c => Opcode::DWordPrefix,
            0x0d => Opcode::StringPrefix,
            0x0e => Opcode::QWordPrefix,
            0x10 => Opcode::Scope,
            0x11 => Opcode::Buffer,
            0x12 => Opcode::Package,
            0x13 => Opcode::VarPackage,
            0x14 => Opcode::Method,
            0x15 => Opcode::External,
            0x60..=0x67 => Opcode::Local(first - 0x60),
            0x68..=0x6e => Opcode::Arg(first - 0x68),
            0x70 => Opcode::Store,
            0x71 => Opcode::RefOf,
            0x72 => Opcode::Add,
            0x73 => Opcode::Concat,
            0x74 => Opcode::Subtract,
            0x75 => Opcode::Increment,
            0x76 => Opcode::Decrement,
            0x77 => Opcode::Multiply,
            0x78 => Opcode::Divide,
            0x79 => Opcode::ShiftLeft,
            0x7a => Opcode::ShiftRight,
            0x7b => Opcode::And,
            0x7c => Opcode::Nand,
            0x7d => Opcode::Or,
            0x7e => Opcode::Nor,
            0x7f => Opcode::Xor,
            0x80 => Opcode::Not,
            0x81 => Opcode::FindSetLeftBit,
            0x82 => Opcode::FindSetRightBit,
            0x83 => Opcode::DerefOf,
            0x84 => Opcode::ConcatRes,
            0x85 => Opcode::Mod,
            0x86 => Opcode::Notify,
            0x87 => Opcode::SizeOf,
            0x88 => Opcode::Index,
            0x89 => Opcode::Match,
            0x8a => Opcode::CreateDWordField,
            0x8b => Opcode::CreateWordField,
            0x8c => Opcode::CreateByteField,
            0x8d => Opcode::CreateBitField,
            0x8e => Opcode::ObjectType,
            0x8f => Opcode::CreateQWordField,
            0x90 => Opcode::LAnd,
            0x91 => Opcode::LOr,
            /*
             * `0x92` is a bit strange. It can be an opcode in its own right (`LNotOp`), but when followed by
             * `0x93..=0x95`, it instead serves as a negating prefix to encode `LNotEqualOp`, `LLessEqualOp`, and
             * `LGreaterEqualOp`.
             */
            LNOT_OP => match self.peek() {
                Ok(0x93) => {
                    self.cursor += 1;
                    Opcode::LNotEqual
                }
                Ok(0x94) => {
                    self.cursor += 1;
                    Opcode::LLessEqual
                }
                Ok(0x95) => {
                    self.cursor += 1;
                    Opcode::LGreaterEqual
                }
                _ => Opcode::LNot,
            },
            0x93 => Opcode::LEqual,
            0x94 => Opcode::LGreater,
            0x95 => Opcode::LLess,
            0x96 => Opcode::ToBuffer,
            0x97 => Opcode::ToDecimalString,
            0x98 => Opcode::ToHexString,
            0x99 => Opcode::ToInteger,
            0x9c => Opcode::ToString,
            0x9d => Opcode::CopyObject,
            0x9e => Opcode::Mid,
            0x9f => Opcode::Continue,
            0xa0 => Opcode::If,
            0xa1 => Opcode::Else,
            0xa2 => Opcode::While,
            0xa3 => Opcode::Noop,
            0xa4 => Opcode::Return,
            0xa5 => Opcode::Break,
            0xcc => Opcode::Breakpoint,
            0xff => Opcode::Ones,

            EXT_OP_PREFIX => {
                let ext = self.next()?;
                match ext {
                    0x01 => Opcode::Mutex,
                    0x02 => Opcode::Event,
                    0x12 => Opcode::CondRefOf,
                    0x13 => Opcode::CreateField,
                    0x1f => Opcode::LoadTable,
                    0x20 => Opcode::Load,
                    0x21 => Opcode::Stall,
                    0x22 => Opcode::Sleep,
                    0x23 => Opcode::Acquire,
                    0x24 => Opcode::Signal,
                    0x25 => Opcode::Wait,
                    0x26 => Opcode::Reset,
                    0x27 => Opcode::Release,
                    0x28 => Opcode::FromBCD,
                    0x29 => Opcode::ToBCD,
                    0x2a => Opcode::Unload,
                    0x30 => Opcode::Revision,
                    0x31 => Opcode::Debug,
                    0x32 => Opcode::Fatal,
                    0x33 => Opcode::Timer,
                    0x80 => Opcode::OpRegion,
                    0x81 => Opcode::Field,
                    0x82 => Opcode::Device,
                    0x83 => Opcode::Processor,
                    0x84 => Opcode::PowerRes,
                    0x85 => Opcode::ThermalZone,
                    0x86 => Opcode::IndexField,
                    0x87 => Opcode::BankField,
                    0x88 => Opcode::DataRegion,
                    _ => return Err(AmlError::IllegalOpcode((EXT_OP_PREFIX as u16) << 8 | ext as u16)),
                }
            }

            _ => return Err(AmlError::IllegalOpcode(first as u16)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::str::FromStr;

    fn parser(bytes: &[u8]) -> ParserState {
        ParserState::new(Arc::from(bytes), 0, bytes.len())
    }

    #[test]
    fn names() {
        assert_eq!(parser(b"\\\x2eABC_DEF_").namestring(), Ok(AmlName::from_str("\\ABC.DEF").unwrap()));
        assert_eq!(parser(b"^^FOO_").namestring(), Ok(AmlName::from_str("^^FOO").unwrap()));
        assert_eq!(
            parser(b"\x2f\x03_SB_PCI0LPCB").namestring(),
            Ok(AmlName::from_str("_SB.PCI0.LPCB").unwrap())
        );
        assert_eq!(parser(b"\\\x00").namestring(), Ok(AmlName::root()));
        assert_eq!(parser(b"\x00").namestring(), Ok(AmlName::null()));
        assert_eq!(parser(b"AB").namestring(), Err(AmlError::RunOutOfStream));
        assert_eq!(parser(b"\\1").namestring(), Err(AmlError::InvalidName(None)));

        // The name ends at the end of its last segment
        let mut stream = parser(b"FOO_\x0a");
        stream.namestring().unwrap();
        assert_eq!(stream.cursor, 4);
    }

    #[test]
    fn pkglength_encodings() {
        assert_eq!(parser(&[0x05, 0, 0, 0, 0]).pkglength(), Ok(5));
        // Two bytes: 0x4 | 0x12 << 4
        let mut long = alloc::vec![0x44, 0x12];
        long.resize(0x124, 0);
        assert_eq!(parser(&long).pkglength(), Ok(0x124));
        assert_eq!(parser(&[0x44, 0x12]).raw_pkglength(), Ok(0x124));
        // Packages may not run past their enclosing package
        assert_eq!(parser(&[0x08, 0x00]).pkglength(), Err(AmlError::InvalidPkgLength));
    }

    #[test]
    fn opcodes() {
        assert_eq!(parser(&[0x92, 0x93]).opcode(), Ok(Opcode::LNotEqual));
        assert_eq!(parser(&[0x92, 0x0a]).opcode(), Ok(Opcode::LNot));
        assert_eq!(parser(&[0x5b, 0x82]).opcode(), Ok(Opcode::Device));
        assert_eq!(parser(&[0x63]).opcode(), Ok(Opcode::Local(3)));
        assert_eq!(parser(&[0x5b, 0xff]).opcode(), Err(AmlError::IllegalOpcode(0x5bff)));
        assert_eq!(parser(&[0x02]).opcode(), Err(AmlError::IllegalOpcode(0x02)));

        let mut stream = parser(b"FOO_");
        assert_eq!(stream.opcode(), Ok(Opcode::NamePath));
        assert_eq!(stream.cursor, 0);
    }

    #[test]
    fn immediates() {
        let mut stream = parser(&[0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0x01]);
        assert_eq!(stream.next_u16(), Ok(0x1234));
        assert_eq!(stream.next_u32(), Ok(0x1234_5678));
        assert_eq!(stream.next_u16(), Err(AmlError::RunOutOfStream));
        assert_eq!(stream.next(), Ok(0x01));
    }

    fn op(cache: &OpCache, opcode: Opcode) -> Box<ParseOp> {
        cache.alloc(opcode, 0)
    }

    #[test]
    fn nested_scopes_restore_their_parents() {
        let states = ObjectPool::new("state", 8);
        let ops = OpCache::new(8, 8);
        let mut stream = parser(&[0; 16]);

        stream.init_scope(op(&ops, Opcode::Scope), &states);
        assert!(stream.is_root_scope());

        let a = ArgList::new(&[ArgType::TermArg, ArgType::TermArg]);
        stream.push_scope(op(&ops, Opcode::Add), a, ArgCount::Fixed(2), &states);
        let b = ArgList::new(&[ArgType::TermArg]);
        stream.push_scope(op(&ops, Opcode::Not), b, ArgCount::Fixed(1), &states);
        assert_eq!(stream.scope_depth(), 3);

        let (popped, info) = stream.pop_scope(&states).unwrap();
        assert_eq!(popped.opcode, Opcode::Not);
        assert_eq!(info, ScopeInfo { opcode: Opcode::Add, remaining: a, count: ArgCount::Fixed(2) });
        ops.free(popped);

        let (popped, info) = stream.pop_scope(&states).unwrap();
        assert_eq!(popped.opcode, Opcode::Add);
        assert_eq!(info.opcode, Opcode::Scope);
        assert_eq!(info.count, ArgCount::Variable);
        ops.free(popped);

        assert!(stream.pop_scope(&states).is_none());
        assert_eq!(stream.scope_depth(), 1);
        stream.cleanup_scope(&ops, &states);
        assert_eq!(stream.scope_depth(), 0);
    }

    #[test]
    fn push_then_pop_is_identity() {
        let states = ObjectPool::new("state", 8);
        let ops = OpCache::new(8, 8);
        let mut stream = parser(&[0; 16]);
        stream.init_scope(op(&ops, Opcode::Scope), &states);
        stream.pkg_end = 12;

        let list = ArgList::new(&[ArgType::TermList]);
        stream.push_scope(op(&ops, Opcode::While), list, ArgCount::Variable, &states);
        assert_eq!(stream.current_scope().unwrap().arg_end, 12);
        stream.set_package_end(8);

        let (popped, info) = stream.pop_scope(&states).unwrap();
        assert_eq!(popped.opcode, Opcode::While);
        assert_eq!(info.opcode, Opcode::Scope);
        assert_eq!(stream.current_scope().unwrap().pkg_end, 16);
        assert_eq!(stream.pkg_end, 16);
        assert_eq!(stream.scope_depth(), 1);
        ops.free(popped);
    }

    #[test]
    fn scope_completion() {
        let states = ObjectPool::new("state", 8);
        let ops = OpCache::new(8, 8);
        let mut stream = parser(&[0; 16]);
        stream.init_scope(op(&ops, Opcode::Scope), &states);

        // A scope with no arguments left is complete wherever the cursor is
        stream.push_scope(op(&ops, Opcode::Add), ArgList::EMPTY, ArgCount::Fixed(0), &states);
        assert!(stream.has_completed_scope());
        ops.free(stream.pop_scope(&states).unwrap().0);

        // A variable list completes when the cursor reaches its end
        stream.pkg_end = 4;
        stream.push_scope(op(&ops, Opcode::If), ArgList::new(&[ArgType::TermList]), ArgCount::Variable, &states);
        assert!(!stream.has_completed_scope());
        stream.cursor = 4;
        assert!(stream.has_completed_scope());
        ops.free(stream.pop_scope(&states).unwrap().0);
    }

    #[test]
    fn advancing_onto_a_term_list_bounds_the_scope() {
        let states = ObjectPool::new("state", 8);
        let ops = OpCache::new(8, 8);
        let mut stream = parser(&[0; 16]);
        stream.init_scope(op(&ops, Opcode::Scope), &states);

        let list = ArgList::new(&[ArgType::PkgLength, ArgType::TermArg, ArgType::TermList]);
        stream.push_scope(op(&ops, Opcode::If), list, ArgCount::Fixed(3), &states);
        stream.set_package_end(10);
        stream.advance_arg();
        assert_eq!(stream.current_arg_type(), Some(ArgType::TermArg));
        assert_eq!(stream.current_scope().unwrap().arg_end, usize::MAX);

        stream.advance_arg();
        assert_eq!(stream.current_arg_type(), Some(ArgType::TermList));
        assert_eq!(stream.current_scope().unwrap().arg_count, ArgCount::Variable);
        assert_eq!(stream.current_scope().unwrap().arg_end, 10);
        stream.cleanup_scope(&ops, &states);
    }

    #[test]
    fn fixed_root_waits_for_its_last_argument() {
        let states = ObjectPool::new("state", 8);
        let ops = OpCache::new(8, 8);
        let mut stream = parser(&[0x0a, 0x10]);
        stream.init_scope(op(&ops, Opcode::Buffer), &states);
        stream.cursor = 2;

        // The size has been read and the cursor is at the end, but the empty byte list is still owed
        stream.advance_arg();
        assert_eq!(stream.current_arg_type(), Some(ArgType::ByteList));
        assert!(!stream.has_completed_scope());

        stream.advance_arg();
        assert!(stream.has_completed_scope());
        assert_eq!(stream.take_root_op().map(|op| op.opcode), Some(Opcode::Buffer));
        stream.cleanup_scope(&ops, &states);
    }
}
