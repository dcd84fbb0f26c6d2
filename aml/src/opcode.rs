use bit_field::BitField;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
    Zero,
    One,
    Alias,
    Name,
    BytePrefix,
    WordPrefix,
    DWordPrefix,
    StringPrefix,
    QWordPrefix,
    Scope,
    Buffer,
    Package,
    VarPackage,
    Method,
    External,
    Local(u8),
    Arg(u8),
    Store,
    RefOf,
    Add,
    Concat,
    Subtract,
    Increment,
    Decrement,
    Multiply,
    Divide,
    ShiftLeft,
    ShiftRight,
    And,
    Nand,
    Or,
    Nor,
    Xor,
    Not,
    FindSetLeftBit,
    FindSetRightBit,
    DerefOf,
    ConcatRes,
    Mod,
    Notify,
    SizeOf,
    Index,
    Match,
    CreateDWordField,
    CreateWordField,
    CreateByteField,
    CreateBitField,
    ObjectType,
    CreateQWordField,
    LAnd,
    LOr,
    LNot,
    LNotEqual,
    LLessEqual,
    LGreaterEqual,
    LEqual,
    LGreater,
    LLess,
    ToBuffer,
    ToDecimalString,
    ToHexString,
    ToInteger,
    ToString,
    CopyObject,
    Mid,
    Continue,
    If,
    Else,
    While,
    Noop,
    Return,
    Break,
    Breakpoint,
    Ones,

    /*
     * Extended opcodes
     */
    Mutex,
    Event,
    CondRefOf,
    CreateField,
    LoadTable,
    Load,
    Stall,
    Sleep,
    Acquire,
    Signal,
    Wait,
    Reset,
    Release,
    FromBCD,
    ToBCD,
    Unload,
    Revision,
    Debug,
    Fatal,
    Timer,
    OpRegion,
    Field,
    Device,
    Processor,
    PowerRes,
    ThermalZone,
    IndexField,
    BankField,
    DataRegion,

    /*
     * Ops with no encoding of their own. `NamePath` is produced by the decoder when a name starts where an
     * opcode was expected, and becomes `MethodCall` if the name refers to a method. `ByteList` holds the raw
     * bytes of a buffer.
     */
    NamePath,
    MethodCall,
    ByteList,
}

/// Decides which allocation pool serves an op, and what extra state it carries.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpClass {
    Generic,
    /// Ops whose contents may be captured and re-parsed later.
    Deferred,
    /// Ops that declare a named object.
    NamedObject,
    ByteList,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ArgType {
    ByteData = 1,
    WordData,
    DWordData,
    QWordData,
    CharList,
    NameString,
    PkgLength,
    ByteList,
    FieldList,
    TermArg,
    Target,
    SuperName,
    SimpleName,
    DataRefObject,
    TermList,
    ElementList,
}

impl ArgType {
    fn from_bits(bits: u8) -> Option<ArgType> {
        use ArgType::*;
        const TYPES: [ArgType; 16] = [
            ByteData,
            WordData,
            DWordData,
            QWordData,
            CharList,
            NameString,
            PkgLength,
            ByteList,
            FieldList,
            TermArg,
            Target,
            SuperName,
            SimpleName,
            DataRefObject,
            TermList,
            ElementList,
        ];
        TYPES.get((bits as usize).checked_sub(1)?).copied()
    }

    /// Arguments of these types are decoded directly from the stream, rather than being ops of their own.
    pub fn is_inline(&self) -> bool {
        matches!(
            self,
            ArgType::ByteData
                | ArgType::WordData
                | ArgType::DWordData
                | ArgType::QWordData
                | ArgType::CharList
                | ArgType::NameString
                | ArgType::PkgLength
                | ArgType::FieldList
        )
    }

    /// Arguments of these types are a list of any number of ops, running to the end of the enclosing package.
    pub fn is_variable(&self) -> bool {
        matches!(self, ArgType::TermList | ArgType::ElementList)
    }
}

/// A list of argument types, packed five bits to a type. Used to track the arguments an op is still waiting for.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ArgList(u64);

impl ArgList {
    pub const EMPTY: ArgList = ArgList(0);
    pub const MAX_LEN: usize = 12;
    const BITS_PER_ARG: usize = 5;

    pub fn new(args: &[ArgType]) -> ArgList {
        let mut packed = 0u64;
        for (i, &arg) in args.iter().take(Self::MAX_LEN).enumerate() {
            packed.set_bits((i * Self::BITS_PER_ARG)..((i + 1) * Self::BITS_PER_ARG), arg as u64);
        }
        ArgList(packed)
    }

    pub fn repeat(arg: ArgType, count: usize) -> ArgList {
        let mut packed = 0u64;
        for i in 0..count.min(Self::MAX_LEN) {
            packed.set_bits((i * Self::BITS_PER_ARG)..((i + 1) * Self::BITS_PER_ARG), arg as u64);
        }
        ArgList(packed)
    }

    pub fn peek(&self) -> Option<ArgType> {
        ArgType::from_bits(self.0.get_bits(0..Self::BITS_PER_ARG) as u8)
    }

    pub fn advance(self) -> ArgList {
        ArgList(self.0 >> Self::BITS_PER_ARG)
    }

    pub fn len(&self) -> usize {
        let mut list = *self;
        let mut len = 0;
        while list.peek().is_some() {
            len += 1;
            list = list.advance();
        }
        len
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Debug for ArgList {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut list = f.debug_list();
        let mut remaining = *self;
        while let Some(arg) = remaining.peek() {
            list.entry(&arg);
            remaining = remaining.advance();
        }
        list.finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArgCount {
    Fixed(usize),
    Variable,
}

#[derive(Clone, Copy, Debug)]
pub struct OpInfo {
    pub class: OpClass,
    pub args: &'static [ArgType],
}

impl Opcode {
    pub fn info(&self) -> OpInfo {
        use ArgType as A;
        use OpClass as C;

        let (class, args): (OpClass, &'static [ArgType]) = match self {
            Opcode::Zero | Opcode::One | Opcode::Ones | Opcode::Revision | Opcode::Debug | Opcode::Timer => {
                (C::Generic, &[])
            }
            Opcode::Local(_) | Opcode::Arg(_) => (C::Generic, &[]),
            Opcode::Continue | Opcode::Noop | Opcode::Break | Opcode::Breakpoint => (C::Generic, &[]),
            Opcode::BytePrefix => (C::Generic, &[A::ByteData]),
            Opcode::WordPrefix => (C::Generic, &[A::WordData]),
            Opcode::DWordPrefix => (C::Generic, &[A::DWordData]),
            Opcode::QWordPrefix => (C::Generic, &[A::QWordData]),
            Opcode::StringPrefix => (C::Generic, &[A::CharList]),

            Opcode::Alias => (C::NamedObject, &[A::NameString, A::NameString]),
            Opcode::Name => (C::NamedObject, &[A::NameString, A::DataRefObject]),
            Opcode::Scope => (C::NamedObject, &[A::PkgLength, A::NameString, A::TermList]),
            Opcode::Device => (C::NamedObject, &[A::PkgLength, A::NameString, A::TermList]),
            Opcode::ThermalZone => (C::NamedObject, &[A::PkgLength, A::NameString, A::TermList]),
            Opcode::Processor => (
                C::NamedObject,
                &[A::PkgLength, A::NameString, A::ByteData, A::DWordData, A::ByteData, A::TermList],
            ),
            Opcode::PowerRes => (C::NamedObject, &[A::PkgLength, A::NameString, A::ByteData, A::WordData, A::TermList]),
            Opcode::Mutex => (C::NamedObject, &[A::NameString, A::ByteData]),
            Opcode::Event => (C::NamedObject, &[A::NameString]),
            Opcode::External => (C::NamedObject, &[A::NameString, A::ByteData, A::ByteData]),

            Opcode::Method => (C::Deferred, &[A::PkgLength, A::NameString, A::ByteData, A::TermList]),
            Opcode::Buffer => (C::Deferred, &[A::PkgLength, A::TermArg, A::ByteList]),
            Opcode::Package => (C::Deferred, &[A::PkgLength, A::ByteData, A::ElementList]),
            Opcode::VarPackage => (C::Deferred, &[A::PkgLength, A::TermArg, A::ElementList]),
            Opcode::OpRegion => (C::Deferred, &[A::NameString, A::ByteData, A::TermArg, A::TermArg]),
            Opcode::DataRegion => (C::Deferred, &[A::NameString, A::TermArg, A::TermArg, A::TermArg]),
            Opcode::BankField => (
                C::Deferred,
                &[A::PkgLength, A::NameString, A::NameString, A::TermArg, A::ByteData, A::FieldList],
            ),
            Opcode::CreateDWordField
            | Opcode::CreateWordField
            | Opcode::CreateByteField
            | Opcode::CreateBitField
            | Opcode::CreateQWordField => (C::Deferred, &[A::TermArg, A::TermArg, A::NameString]),
            Opcode::CreateField => (C::Deferred, &[A::TermArg, A::TermArg, A::TermArg, A::NameString]),

            Opcode::Field => (C::Generic, &[A::PkgLength, A::NameString, A::ByteData, A::FieldList]),
            Opcode::IndexField => {
                (C::Generic, &[A::PkgLength, A::NameString, A::NameString, A::ByteData, A::FieldList])
            }

            Opcode::Store => (C::Generic, &[A::TermArg, A::SuperName]),
            Opcode::CopyObject => (C::Generic, &[A::TermArg, A::SimpleName]),
            Opcode::RefOf | Opcode::Increment | Opcode::Decrement | Opcode::SizeOf | Opcode::ObjectType => {
                (C::Generic, &[A::SuperName])
            }
            Opcode::CondRefOf => (C::Generic, &[A::SuperName, A::Target]),
            Opcode::Add
            | Opcode::Concat
            | Opcode::Subtract
            | Opcode::Multiply
            | Opcode::ShiftLeft
            | Opcode::ShiftRight
            | Opcode::And
            | Opcode::Nand
            | Opcode::Or
            | Opcode::Nor
            | Opcode::Xor
            | Opcode::ConcatRes
            | Opcode::Mod
            | Opcode::Index => (C::Generic, &[A::TermArg, A::TermArg, A::Target]),
            Opcode::Divide => (C::Generic, &[A::TermArg, A::TermArg, A::Target, A::Target]),
            Opcode::Not
            | Opcode::FindSetLeftBit
            | Opcode::FindSetRightBit
            | Opcode::ToBuffer
            | Opcode::ToDecimalString
            | Opcode::ToHexString
            | Opcode::ToInteger
            | Opcode::FromBCD
            | Opcode::ToBCD => (C::Generic, &[A::TermArg, A::Target]),
            Opcode::ToString => (C::Generic, &[A::TermArg, A::TermArg, A::Target]),
            Opcode::Mid => (C::Generic, &[A::TermArg, A::TermArg, A::TermArg, A::Target]),
            Opcode::DerefOf | Opcode::Return | Opcode::Stall | Opcode::Sleep | Opcode::LNot => {
                (C::Generic, &[A::TermArg])
            }
            Opcode::Notify => (C::Generic, &[A::SuperName, A::TermArg]),
            Opcode::Match => {
                (C::Generic, &[A::TermArg, A::ByteData, A::TermArg, A::ByteData, A::TermArg, A::TermArg])
            }
            Opcode::LAnd
            | Opcode::LOr
            | Opcode::LNotEqual
            | Opcode::LLessEqual
            | Opcode::LGreaterEqual
            | Opcode::LEqual
            | Opcode::LGreater
            | Opcode::LLess => (C::Generic, &[A::TermArg, A::TermArg]),

            Opcode::If | Opcode::While => (C::Generic, &[A::PkgLength, A::TermArg, A::TermList]),
            Opcode::Else => (C::Generic, &[A::PkgLength, A::TermList]),

            Opcode::LoadTable => {
                (C::Generic, &[A::TermArg, A::TermArg, A::TermArg, A::TermArg, A::TermArg, A::TermArg])
            }
            Opcode::Load => (C::Generic, &[A::NameString, A::Target]),
            Opcode::Unload | Opcode::Signal | Opcode::Reset | Opcode::Release => (C::Generic, &[A::SuperName]),
            Opcode::Acquire => (C::Generic, &[A::SuperName, A::WordData]),
            Opcode::Wait => (C::Generic, &[A::SuperName, A::TermArg]),
            Opcode::Fatal => (C::Generic, &[A::ByteData, A::DWordData, A::TermArg]),

            // The arguments of a method call depend on the method, and are supplied when it is resolved
            Opcode::NamePath | Opcode::MethodCall => (C::Generic, &[]),
            Opcode::ByteList => (C::ByteList, &[]),
        };

        OpInfo { class, args }
    }

    /// The arguments of a root op, used to re-parse the contents of an object captured by a deferred op. The
    /// package length and name that precede them are not part of the captured range.
    pub fn root_args(&self) -> &'static [ArgType] {
        match self {
            Opcode::Buffer => &[ArgType::TermArg, ArgType::ByteList],
            Opcode::Package => &[ArgType::ByteData, ArgType::ElementList],
            Opcode::VarPackage => &[ArgType::TermArg, ArgType::ElementList],
            Opcode::OpRegion => &[ArgType::TermArg, ArgType::TermArg],
            _ => &[ArgType::TermList],
        }
    }

    /// Ops that open a new scope in the namespace for the contents of their `TermList`.
    pub fn is_namespace_scope(&self) -> bool {
        matches!(self, Opcode::Scope | Opcode::Device | Opcode::Processor | Opcode::PowerRes | Opcode::ThermalZone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_list_packing() {
        let list = ArgList::new(&[ArgType::PkgLength, ArgType::NameString, ArgType::TermList]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.peek(), Some(ArgType::PkgLength));
        let list = list.advance();
        assert_eq!(list.peek(), Some(ArgType::NameString));
        let list = list.advance().advance();
        assert_eq!(list.peek(), None);
        assert!(list.is_empty());
        assert_eq!(ArgList::EMPTY.len(), 0);
    }

    #[test]
    fn arg_list_repeat() {
        let list = ArgList::repeat(ArgType::TermArg, 7);
        assert_eq!(list.len(), 7);
        assert_eq!(list.advance().advance().peek(), Some(ArgType::TermArg));
        assert_eq!(ArgList::repeat(ArgType::TermArg, 0), ArgList::EMPTY);
    }

    #[test]
    fn every_arg_type_survives_packing() {
        for bits in 1..=16u8 {
            let arg = ArgType::from_bits(bits).unwrap();
            assert_eq!(ArgList::new(&[ArgType::TermArg, arg]).advance().peek(), Some(arg));
        }
        assert_eq!(ArgType::from_bits(0), None);
        assert_eq!(ArgType::from_bits(17), None);
    }

    #[test]
    fn op_classes() {
        assert_eq!(Opcode::Add.info().class, OpClass::Generic);
        assert_eq!(Opcode::Package.info().class, OpClass::Deferred);
        assert_eq!(Opcode::Device.info().class, OpClass::NamedObject);
        assert_eq!(Opcode::ByteList.info().class, OpClass::ByteList);
        assert!(Opcode::Processor.is_namespace_scope());
        assert!(!Opcode::Method.is_namespace_scope());
        assert_eq!(Opcode::Scope.root_args(), &[ArgType::TermList]);
    }
}
