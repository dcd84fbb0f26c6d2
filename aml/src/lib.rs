//! `aml_exec` is the execution core of an AML interpreter. It loads the definition blocks of an ACPI system (the
//! DSDT and SSDTs) into a namespace, running the module-level code of each table as it is parsed, and evaluates
//! the objects and methods found there.
//!
//! The library needs access to the platform, which is provided by implementing the [`Handler`] trait. Tables are
//! first installed with [`Interpreter::install_table`], and then loaded into the namespace with
//! [`Interpreter::load_table`]:
//!
//! ```ignore
//! let interpreter = Interpreter::new(MyHandler);
//! let dsdt = interpreter.install_table(dsdt_bytes)?;
//! interpreter.load_table(dsdt, None)?;
//! let sta = interpreter.evaluate(&AmlName::from_str("\\_SB.PCI0._STA")?, Vec::new())?;
//! ```
//!
//! A table either loads completely, or leaves no trace in the namespace: a failure part of the way through removes
//! every node the table had declared.

#![no_std]

#[cfg(test)]
extern crate std;

extern crate alloc;

pub mod lock;
pub mod namespace;
pub mod object;
pub mod op;
pub mod op_region;
pub mod opcode;
pub mod parser;
pub mod pool;
pub mod resolve;
pub mod state;
pub mod table;
pub mod walk;

mod exec;
#[cfg(test)]
mod test_utils;

use alloc::{boxed::Box, vec::Vec};
use lock::InterpreterLock;
use log::{debug, trace, warn};
use namespace::{AmlName, Namespace, NodeHandle};
use object::{release_object_tree, ObjectRef, ObjectType};
use op::OpCache;
use opcode::Opcode;
use parser::ParserState;
use pool::ObjectPool;
use resolve::{resolve_node_to_value, Resolved};
use spinning_top::Spinlock;
use state::GenericState;
use table::{OwnerId, TableIndex, TableList};
use walk::{PassNumber, WalkState};

/// Tunables of the interpreter. The defaults suit any firmware we have seen.
#[derive(Clone, Copy, Debug)]
pub struct InterpreterConfig {
    /// How many free state frames are kept for reuse.
    pub state_cache_depth: usize,
    pub generic_op_cache_depth: usize,
    pub extended_op_cache_depth: usize,
    /// A `While` loop that runs this many times is assumed to be stuck, and is aborted.
    pub max_while_iterations: usize,
    pub max_method_nesting: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        InterpreterConfig {
            state_cache_depth: 96,
            generic_op_cache_depth: 96,
            extended_op_cache_depth: 96,
            max_while_iterations: 0xffff,
            max_method_nesting: 32,
        }
    }
}

/// The pools that state frames and parse ops are allocated from.
pub struct Caches {
    pub state: ObjectPool<GenericState>,
    pub ops: OpCache,
}

impl Caches {
    pub fn new(config: &InterpreterConfig) -> Caches {
        Caches {
            state: ObjectPool::new("state frames", config.state_cache_depth),
            ops: OpCache::new(config.generic_op_cache_depth, config.extended_op_cache_depth),
        }
    }
}

pub struct Interpreter {
    handler: Box<dyn Handler>,
    pub namespace: Spinlock<Namespace>,
    tables: Spinlock<TableList>,
    caches: Caches,
    lock: InterpreterLock,
    config: InterpreterConfig,
}

impl Interpreter {
    pub fn new<H>(handler: H) -> Interpreter
    where
        H: Handler + 'static,
    {
        Interpreter::with_config(handler, InterpreterConfig::default())
    }

    pub fn with_config<H>(handler: H, config: InterpreterConfig) -> Interpreter
    where
        H: Handler + 'static,
    {
        Interpreter {
            handler: Box::new(handler),
            namespace: Spinlock::new(Namespace::new()),
            tables: Spinlock::new(TableList::new()),
            caches: Caches::new(&config),
            lock: InterpreterLock::new(),
            config,
        }
    }

    /// Validate the header of a table and keep its AML for loading. `table` is the whole table, including its
    /// header.
    pub fn install_table(&self, table: &[u8]) -> Result<TableIndex, AmlError> {
        self.tables.lock().install(table)
    }

    pub fn is_loaded(&self, index: TableIndex) -> bool {
        self.tables.lock().is_loaded(index)
    }

    pub fn owner_id(&self, index: TableIndex) -> Result<OwnerId, AmlError> {
        self.tables.lock().get_owner_id(index)
    }

    /// Load an installed table into the namespace, executing its module-level code in place. Names with no
    /// prefix are declared relative to `start_node` (the root if `None`).
    pub fn load_table(&self, index: TableIndex, start_node: Option<NodeHandle>) -> Result<(), AmlError> {
        self.load(index, start_node, &[PassNumber::Single])
    }

    /// Load an installed table in two passes: all of its names are declared first, and objects are attached and
    /// module-level code run afterwards. This lets module-level code refer to methods declared later in the table,
    /// but differs from how other interpreters load tables, and so risks running firmware in ways it was not
    /// tested against.
    pub fn load_table_staged(&self, index: TableIndex, start_node: Option<NodeHandle>) -> Result<(), AmlError> {
        self.load(index, start_node, &[PassNumber::Declare, PassNumber::Resolve])
    }

    fn load(&self, index: TableIndex, start_node: Option<NodeHandle>, passes: &[PassNumber]) -> Result<(), AmlError> {
        let _guard = self.lock.enter(self.handler.thread_id());

        if self.tables.lock().is_loaded(index) {
            return Err(AmlError::AlreadyExists);
        }
        let owner_id = self.tables.lock().allocate_owner_id(index)?;
        debug!("Loading table {:?} with owner {:?}", index, owner_id);

        for &pass in passes {
            if let Err(err) = self.one_complete_parse(pass, index, start_node) {
                debug!("Loading table {:?} failed in {:?} pass: {:?}. Rolling back.", index, pass, err);
                self.rollback(index, owner_id);
                return Err(err);
            }
        }

        self.tables.lock().set_loaded(index, true)?;
        debug!("Table {:?} parsed. Initializing its objects.", index);
        // Objects that can't be realized stay deferred, and report the error when they are used
        if let Err(err) = self.initialize_objects(owner_id) {
            warn!("Not every object of table {:?} could be initialized: {:?}", index, err);
        }
        Ok(())
    }

    /// Run one pass over a table. The whole table is treated as the body of a method, so module-level code runs
    /// where it is found.
    pub fn one_complete_parse(
        &self,
        pass: PassNumber,
        index: TableIndex,
        start_node: Option<NodeHandle>,
    ) -> Result<(), AmlError> {
        let _guard = self.lock.enter(self.handler.thread_id());
        let (aml, owner_id) = {
            let tables = self.tables.lock();
            (tables.get_table(index)?.aml.clone(), tables.get_owner_id(index)?)
        };
        let start = match start_node {
            Some(node) => Some((node, self.namespace.lock().get(node)?.typ)),
            None => None,
        };
        trace!("{:?} pass over table {:?} ({} bytes of AML)", pass, index, aml.len());

        let length = aml.len();
        let mut walk = WalkState::new(ParserState::new(aml, 0, length), pass, owner_id);
        walk.defer_objects = true;
        walk.parser.init_scope(self.caches.ops.alloc(Opcode::Scope, 0), &self.caches.state);
        walk.attach_thread(self.handler.thread_id(), &self.caches.state);

        let result = match start {
            Some((node, typ)) => walk.push_scope(Some(node), typ, &self.caches.state),
            None => Ok(()),
        };
        let result = result.and_then(|()| self.run_walk(&mut walk));
        walk.delete(&self.caches);
        result
    }

    /// Remove every node a table declared, and free its owner id.
    fn rollback(&self, index: TableIndex, owner_id: OwnerId) {
        let detached = self.namespace.lock().delete_owner(owner_id);
        for object in detached {
            release_object_tree(&self.caches.state, object);
        }
        // The table was just checked to exist, so releasing its owner can't fail
        let _ = self.tables.lock().release_owner_id(index);
    }

    /// Remove a loaded table's objects from the namespace.
    pub fn unload_table(&self, index: TableIndex) -> Result<(), AmlError> {
        let _guard = self.lock.enter(self.handler.thread_id());
        if !self.tables.lock().is_loaded(index) {
            return Err(AmlError::BadParameter);
        }

        let owner_id = self.tables.lock().get_owner_id(index)?;
        debug!("Unloading table {:?} (owner {:?})", index, owner_id);
        self.rollback(index, owner_id);
        self.tables.lock().set_loaded(index, false)
    }

    /// Realize every deferred object attached to a node of `owner_id`. An object that fails to realize is left
    /// deferred, and the rest are still realized. Returns the first error.
    pub fn initialize_objects(&self, owner_id: OwnerId) -> Result<(), AmlError> {
        let _guard = self.lock.enter(self.handler.thread_id());
        let nodes = self.namespace.lock().nodes_owned_by(owner_id);
        let mut realized = 0;
        let mut first_error = None;

        for node in nodes {
            let object = self.namespace.lock().get(node)?.object.clone();
            if let Some(object) = object {
                if !object.is_realized() {
                    match self.realize(&object) {
                        Ok(()) => realized += 1,
                        Err(err) => {
                            warn!("Failed to initialize {:?}: {:?}", node, err);
                            first_error.get_or_insert(err);
                        }
                    }
                }
            }
        }

        debug!("Realized {} deferred objects of owner {:?}", realized, owner_id);
        first_error.map_or(Ok(()), Err)
    }

    /// Find the object at `path`, without invoking it if it is a method.
    pub fn resolve_path(&self, path: &AmlName) -> Result<Resolved, AmlError> {
        let _guard = self.lock.enter(self.handler.thread_id());
        let node = self.namespace.lock().search(path, NodeHandle::ROOT)?;
        resolve_node_to_value(self, node)
    }

    /// Evaluate the object at `path`. Methods are invoked with `args`, and any other object resolves to its value.
    pub fn evaluate(&self, path: &AmlName, args: Vec<ObjectRef>) -> Result<ObjectRef, AmlError> {
        let _guard = self.lock.enter(self.handler.thread_id());
        let node = self.namespace.lock().search(path, NodeHandle::ROOT)?;
        trace!("Evaluating {} with {} arguments", path, args.len());
        self.evaluate_node(node, args, 0)
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }
}

/// This trait represents the interface from the `Interpreter` to the hosting kernel, and allows
/// AML to interact with the underlying hardware.
pub trait Handler: Send + Sync {
    fn read_u8(&self, address: usize) -> u8;
    fn read_u16(&self, address: usize) -> u16;
    fn read_u32(&self, address: usize) -> u32;
    fn read_u64(&self, address: usize) -> u64;

    fn write_u8(&self, address: usize, value: u8);
    fn write_u16(&self, address: usize, value: u16);
    fn write_u32(&self, address: usize, value: u32);
    fn write_u64(&self, address: usize, value: u64);

    fn read_io_u8(&self, port: u16) -> u8;
    fn read_io_u16(&self, port: u16) -> u16;
    fn read_io_u32(&self, port: u16) -> u32;

    fn write_io_u8(&self, port: u16, value: u8);
    fn write_io_u16(&self, port: u16, value: u16);
    fn write_io_u32(&self, port: u16, value: u32);

    fn read_pci_u8(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16) -> u8;
    fn read_pci_u16(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16) -> u16;
    fn read_pci_u32(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16) -> u32;

    fn write_pci_u8(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16, value: u8);
    fn write_pci_u16(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16, value: u16);
    fn write_pci_u32(&self, segment: u16, bus: u8, device: u8, function: u8, offset: u16, value: u32);

    /// Stall for at least the given number of **microseconds**. An implementation should not relinquish control of
    /// the processor during the stall, and for this reason, firmwares should not stall for periods of more than
    /// 100 microseconds.
    fn stall(&self, microseconds: u64);

    /// Sleep for at least the given number of **milliseconds**. An implementation may round to the closest sleep
    /// time supported, and should relinquish the processor.
    fn sleep(&self, milliseconds: u64);

    /// An identifier of the thread that is calling into the interpreter. The interpreter lock lets a caller in
    /// whenever this matches the thread that holds it, so it must differ between any two threads that can call
    /// into the interpreter at the same time. A kernel that only ever runs AML on one thread can return a constant.
    fn thread_id(&self) -> u64;

    fn handle_fatal_error(&self, fatal_type: u8, fatal_code: u32, fatal_arg: u64) {
        panic!(
            "Fatal error while executing AML (DefFatal). fatal_type = {:?}, fatal_code = {:?}, fatal_arg = {:?}",
            fatal_type, fatal_code, fatal_arg
        );
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum AmlError {
    /*
     * Status codes of the loading pipeline.
     */
    /// An allocation sized by the AML (a buffer, a package or a field value) could not be made.
    NoMemory,
    BadParameter,
    AlreadyExists,
    NotFound(AmlName),
    StackUnderflow,
    UninitializedNode,
    /// A node's attached object is not of the type declared for the node, or is of a type that can't be used as a
    /// value.
    OperandTypeError {
        declared: ObjectType,
        actual: ObjectType,
    },
    BadHeader,
    /// Produced by a `Handler` whose hardware didn't respond in time.
    Timeout,
    NoHardwareResponse,
    Error,

    /*
     * Errors produced decoding the AML stream.
     */
    RunOutOfStream,
    IllegalOpcode(u16),
    InvalidNameSeg,
    InvalidName(Option<AmlName>),
    InvalidNormalizedName(AmlName),
    RootHasNoParent,
    EmptyNamesAreInvalid,
    NameCollision(AmlName),
    InvalidPkgLength,
    InvalidFieldFlags,

    /*
     * Errors produced executing AML.
     */
    UnimplementedOpcode(Opcode),
    MethodArgCountIncorrect,
    MethodNestingTooDeep,
    LoopLimitExceeded,
    BreakOutsideLoop,
    UninitializedLocal(u8),
    UninitializedArg(u8),
    DivideByZero,
    /// A buffer field's position or length doesn't fit in the address space.
    BufferFieldOutOfRange,
    ObjectNotOfExpectedType {
        expected: ObjectType,
        got: ObjectType,
    },

    OwnerIdExhausted,
    InvalidTableIndex,
    UnsupportedRegionSpace,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{object::Object, test_utils::*};
    use alloc::{string::ToString, vec};
    use core::str::FromStr;

    fn name(path: &str) -> AmlName {
        AmlName::from_str(path).unwrap()
    }

    fn integer(value: u64) -> ObjectRef {
        ObjectRef::new(Object::Integer(value))
    }

    fn load(interpreter: &Interpreter, body: &[u8]) -> Result<TableIndex, AmlError> {
        let index = interpreter.install_table(&make_table(b"DSDT", body)).unwrap();
        interpreter.load_table(index, None).map(|()| index)
    }

    fn evaluate_integer(interpreter: &Interpreter, path: &str, args: Vec<ObjectRef>) -> u64 {
        interpreter.evaluate(&name(path), args).unwrap().to_integer().unwrap()
    }

    #[test]
    fn device_sta_of_fourth_table() {
        init_logger();
        let interpreter = Interpreter::new(TestHandler::new());
        for _ in 0..3 {
            interpreter.install_table(&make_table(b"SSDT", &[])).unwrap();
        }
        let index = interpreter
            .install_table(&make_table(
                b"DSDT",
                &[0x5b, 0x82, 0x0c, 0x44, 0x45, 0x56, 0x30, 0x08, 0x5f, 0x53, 0x54, 0x41, 0x0a, 0x0f],
            ))
            .unwrap();
        assert_eq!(index, TableIndex(3));

        interpreter.load_table(index, Some(NodeHandle::ROOT)).unwrap();
        assert!(interpreter.is_loaded(index));
        match interpreter.resolve_path(&name("\\DEV0._STA")).unwrap() {
            Resolved::Object(object) => assert_eq!(object.to_integer(), Ok(0x0f)),
            Resolved::Node(node) => panic!("resolved to node {:?}", node),
        }

        let owner_id = interpreter.owner_id(index).unwrap();
        assert_eq!(interpreter.namespace.lock().owner_node_count(owner_id), 2);
        assert!(matches!(interpreter.resolve_path(&name("\\DEV0")), Ok(Resolved::Node(_))));
    }

    #[test]
    fn loading_twice_changes_nothing() {
        let interpreter = Interpreter::new(TestHandler::new());
        let index = load(&interpreter, &name_integer(b"FOO_", 3)).unwrap();
        let owner_id = interpreter.owner_id(index).unwrap();

        assert_eq!(interpreter.load_table(index, None), Err(AmlError::AlreadyExists));
        assert_eq!(interpreter.owner_id(index), Ok(owner_id));
        assert_eq!(interpreter.namespace.lock().owner_node_count(owner_id), 1);
        assert_eq!(evaluate_integer(&interpreter, "\\FOO", vec![]), 3);
    }

    #[test]
    fn failed_load_is_rolled_back() {
        init_logger();
        let interpreter = Interpreter::new(TestHandler::new());
        let mut body = device(b"DEV1", &name_integer(b"_UID", 1));
        body.extend(name_integer(b"DEV1", 2));

        let index = interpreter.install_table(&make_table(b"SSDT", &body)).unwrap();
        assert_eq!(interpreter.load_table(index, None), Err(AmlError::NameCollision(name("\\DEV1"))));
        assert!(!interpreter.is_loaded(index));
        assert_eq!(interpreter.owner_id(index), Err(AmlError::BadParameter));
        // The only owner id handed out so far was the failed table's
        assert_eq!(interpreter.namespace.lock().owner_node_count(OwnerId(1)), 0);
        assert!(matches!(interpreter.resolve_path(&name("\\DEV1._UID")), Err(AmlError::NotFound(_))));

        // Nothing of the failed table is left to collide with
        load(&interpreter, &device(b"DEV1", &[])).unwrap();
    }

    #[test]
    fn methods_take_arguments() {
        let interpreter = Interpreter::new(TestHandler::new());
        // Method(ADD1, 1) { Return(Add(Arg0, One)) }
        load(&interpreter, &method(b"ADD1", 1, &[0xa4, 0x72, 0x68, 0x01, 0x00])).unwrap();

        assert_eq!(evaluate_integer(&interpreter, "\\ADD1", vec![integer(41)]), 42);
        assert_eq!(interpreter.evaluate(&name("\\ADD1"), vec![]).err(), Some(AmlError::MethodArgCountIncorrect));
        assert_eq!(
            interpreter.evaluate(&name("\\_OSI"), vec![ObjectRef::new(Object::String("Windows 2015".to_string()))])
                .unwrap()
                .to_integer(),
            Ok(u64::MAX)
        );
    }

    #[test]
    fn while_loops() {
        let interpreter = Interpreter::new(TestHandler::new());
        let mut body = vec![0x70, 0x00, 0x60]; // Store(Zero, Local0)
        // While (LLess(Local0, 5)) { Increment(Local0) }
        body.extend(while_op(&[0x95, 0x60, 0x0a, 0x05], &[0x75, 0x60]));
        body.extend([0xa4, 0x60]); // Return(Local0)
        load(&interpreter, &method(b"CNT_", 0, &body)).unwrap();

        assert_eq!(evaluate_integer(&interpreter, "\\CNT", vec![]), 5);
    }

    #[test]
    fn break_leaves_the_loop() {
        let interpreter = Interpreter::new(TestHandler::new());
        let mut body = vec![0x70, 0x00, 0x60];
        // While (One) { Increment(Local0); If (LEqual(Local0, 3)) { Break } }
        let mut loop_body = vec![0x75, 0x60];
        loop_body.extend(if_op(&[0x93, 0x60, 0x0a, 0x03], &[0xa5]));
        body.extend(while_op(&[0x01], &loop_body));
        body.extend([0xa4, 0x60]);
        load(&interpreter, &method(b"BRK_", 0, &body)).unwrap();

        assert_eq!(evaluate_integer(&interpreter, "\\BRK", vec![]), 3);
    }

    #[test]
    fn continue_skips_the_rest_of_the_body() {
        let interpreter = Interpreter::new(TestHandler::new());
        // Local0 counts iterations, Local1 counts the ones that didn't continue
        let mut body = vec![0x70, 0x00, 0x60, 0x70, 0x00, 0x61];
        let mut loop_body = vec![0x75, 0x60];
        loop_body.extend(if_op(&[0x95, 0x60, 0x0a, 0x03], &[0x9f]));
        loop_body.extend([0x75, 0x61]);
        body.extend(while_op(&[0x95, 0x60, 0x0a, 0x05], &loop_body));
        body.extend([0xa4, 0x61]);
        load(&interpreter, &method(b"CNT_", 0, &body)).unwrap();

        // Iterations 3, 4 and 5 reach Increment(Local1)
        assert_eq!(evaluate_integer(&interpreter, "\\CNT", vec![]), 3);
    }

    #[test]
    fn break_outside_a_loop() {
        let interpreter = Interpreter::new(TestHandler::new());
        load(&interpreter, &method(b"BAD_", 0, &[0xa5])).unwrap();
        assert_eq!(interpreter.evaluate(&name("\\BAD"), vec![]).err(), Some(AmlError::BreakOutsideLoop));
    }

    #[test]
    fn stuck_loops_are_aborted() {
        let config = InterpreterConfig { max_while_iterations: 10, ..Default::default() };
        let interpreter = Interpreter::with_config(TestHandler::new(), config);
        load(&interpreter, &method(b"SPIN", 0, &while_op(&[0x01], &[]))).unwrap();
        assert_eq!(interpreter.evaluate(&name("\\SPIN"), vec![]).err(), Some(AmlError::LoopLimitExceeded));
    }

    #[test]
    fn if_and_else() {
        let interpreter = Interpreter::new(TestHandler::new());
        // If (LEqual(Arg0, One)) { Return(10) } Else { Return(11) }
        let mut body = if_op(&[0x93, 0x68, 0x01], &[0xa4, 0x0a, 0x0a]);
        body.extend(else_op(&[0xa4, 0x0a, 0x0b]));
        load(&interpreter, &method(b"TST_", 1, &body)).unwrap();

        assert_eq!(evaluate_integer(&interpreter, "\\TST", vec![integer(1)]), 10);
        assert_eq!(evaluate_integer(&interpreter, "\\TST", vec![integer(2)]), 11);
    }

    #[test]
    fn recursion_is_bounded() {
        let interpreter = Interpreter::new(TestHandler::new());
        load(&interpreter, &method(b"REC_", 0, b"REC_")).unwrap();
        assert_eq!(interpreter.evaluate(&name("\\REC"), vec![]).err(), Some(AmlError::MethodNestingTooDeep));
    }

    #[test]
    fn packages_are_realized_with_padding() {
        init_logger();
        let interpreter = Interpreter::new(TestHandler::new());
        // Name(PKG, Package(3) { One, 0x02 })
        let mut body = name_op(b"PKG_", &package(3, &[0x01, 0x0a, 0x02]));
        // Name(REF, Package() { \_SB, NOPE })
        body.extend(name_op(b"REF_", &package(2, b"_SB_NOPE")));
        // Method(SND) { Return(DerefOf(Index(PKG, One))) }
        body.extend(method(b"SND_", 0, &[0xa4, 0x83, 0x88, b'P', b'K', b'G', b'_', 0x01, 0x00]));
        load(&interpreter, &body).unwrap();

        let package = interpreter.evaluate(&name("\\PKG"), vec![]).unwrap();
        match *package.lock() {
            Object::Package { ref elements, deferred: None } => {
                assert_eq!(elements.len(), 3);
                assert_eq!(elements[0].to_integer(), Ok(1));
                assert_eq!(elements[1].to_integer(), Ok(2));
                assert_eq!(elements[2].typ(), ObjectType::Any);
            }
            ref other => panic!("PKG is {:?}", other),
        }
        assert_eq!(evaluate_integer(&interpreter, "\\SND", vec![]), 2);

        let references = interpreter.evaluate(&name("\\REF"), vec![]).unwrap();
        let sb = interpreter.namespace.lock().search(&name("\\_SB"), NodeHandle::ROOT).unwrap();
        match *references.lock() {
            Object::Package { ref elements, .. } => {
                assert!(matches!(
                    *elements[0].lock(),
                    Object::Reference { target: object::ReferenceTarget::Node(node), .. } if node == sb
                ));
                assert!(matches!(*elements[1].lock(), Object::Uninitialized));
            }
            ref other => panic!("REF is {:?}", other),
        };
    }

    #[test]
    fn buffers_and_buffer_fields() {
        let interpreter = Interpreter::new(TestHandler::new());
        // Name(BUF, Buffer(4) { 0x01, 0x02 })
        let mut body = name_op(b"BUF_", &buffer(&[0x0a, 0x04], &[0x01, 0x02]));
        // Method(RBF) { CreateByteField(BUF, One, BYT1); Return(BYT1) }
        let mut method_body = vec![0x8c];
        method_body.extend(b"BUF_");
        method_body.push(0x01);
        method_body.extend(b"BYT1");
        method_body.push(0xa4);
        method_body.extend(b"BYT1");
        body.extend(method(b"RBF_", 0, &method_body));
        load(&interpreter, &body).unwrap();

        let buffer = interpreter.evaluate(&name("\\BUF"), vec![]).unwrap();
        assert!(matches!(*buffer.lock(), Object::Buffer { ref data, deferred: None } if data == &[1, 2, 0, 0]));
        assert_eq!(evaluate_integer(&interpreter, "\\RBF", vec![]), 2);
    }

    #[test]
    fn buffers_without_initializers() {
        let interpreter = Interpreter::new(TestHandler::new());
        // Name(BUF, Buffer(0x10) {})
        let mut body = name_op(b"BUF_", &buffer(&[0x0a, 0x10], &[]));
        // Method(LOC) { Return(Buffer(2) {}) }
        let mut method_body = vec![0xa4];
        method_body.extend(buffer(&[0x0a, 0x02], &[]));
        body.extend(method(b"LOC_", 0, &method_body));
        load(&interpreter, &body).unwrap();

        let buffer = interpreter.evaluate(&name("\\BUF"), vec![]).unwrap();
        assert!(matches!(*buffer.lock(), Object::Buffer { ref data, deferred: None } if data == &[0; 16]));
        let local = interpreter.evaluate(&name("\\LOC"), vec![]).unwrap();
        assert!(matches!(*local.lock(), Object::Buffer { ref data, .. } if data == &[0, 0]));
    }

    #[test]
    fn oversized_objects_fail_to_realize() {
        init_logger();
        let interpreter = Interpreter::new(TestHandler::new());
        // Name(PKG, VarPackage(Ones) {}); Name(BUF, Buffer(Ones) {}); Name(INT, 3)
        let mut body = name_op(b"PKG_", &var_package(&[0xff], &[]));
        body.extend(name_op(b"BUF_", &buffer(&[0xff], &[])));
        body.extend(name_integer(b"INT_", 3));
        let index = load(&interpreter, &body).unwrap();

        // The rest of the table is still usable
        assert!(interpreter.is_loaded(index));
        assert_eq!(evaluate_integer(&interpreter, "\\INT", vec![]), 3);
        assert_eq!(interpreter.evaluate(&name("\\PKG"), vec![]).err(), Some(AmlError::NoMemory));
        assert_eq!(interpreter.evaluate(&name("\\BUF"), vec![]).err(), Some(AmlError::NoMemory));

        let owner_id = interpreter.owner_id(index).unwrap();
        assert_eq!(interpreter.initialize_objects(owner_id), Err(AmlError::NoMemory));
    }

    #[test]
    fn buffer_fields_must_fit() {
        let interpreter = Interpreter::new(TestHandler::new());
        // Name(BUF, Buffer(4) {}); CreateByteField(BUF, Ones, BYT1)
        let mut body = name_op(b"BUF_", &buffer(&[0x0a, 0x04], &[]));
        body.push(0x8c);
        body.extend(b"BUF_");
        body.push(0xff);
        body.extend(b"BYT1");
        assert_eq!(load(&interpreter, &body).err(), Some(AmlError::BufferFieldOutOfRange));
        assert!(matches!(interpreter.resolve_path(&name("\\BUF")), Err(AmlError::NotFound(_))));

        let mut body = name_op(b"BUF_", &buffer(&[0x0a, 0x04], &[]));
        // Method(WRAP) { CreateField(BUF, One, Ones, FLD0) }
        let mut wrapping = vec![0x5b, 0x13];
        wrapping.extend(b"BUF_");
        wrapping.extend([0x01, 0xff]);
        wrapping.extend(b"FLD0");
        body.extend(method(b"WRAP", 0, &wrapping));
        // Method(HUGE) { CreateField(BUF, Zero, Ones, FLD1); Return(FLD1) }
        let mut huge = vec![0x5b, 0x13];
        huge.extend(b"BUF_");
        huge.extend([0x00, 0xff]);
        huge.extend(b"FLD1");
        huge.push(0xa4);
        huge.extend(b"FLD1");
        body.extend(method(b"HUGE", 0, &huge));
        load(&interpreter, &body).unwrap();

        assert_eq!(interpreter.evaluate(&name("\\WRAP"), vec![]).err(), Some(AmlError::BufferFieldOutOfRange));
        assert_eq!(interpreter.evaluate(&name("\\HUGE"), vec![]).err(), Some(AmlError::NoMemory));
    }

    #[test]
    fn loading_under_a_start_node() {
        let interpreter = Interpreter::new(TestHandler::new());
        let sb = interpreter.namespace.lock().search(&name("\\_SB"), NodeHandle::ROOT).unwrap();
        let children = interpreter.namespace.lock().get(sb).unwrap().children.len();

        let index = interpreter
            .install_table(&make_table(b"SSDT", &device(b"DEV0", &name_integer(b"_STA", 0x0f))))
            .unwrap();
        interpreter.load_table(index, Some(sb)).unwrap();
        assert_eq!(evaluate_integer(&interpreter, "\\_SB.DEV0._STA", vec![]), 0x0f);
        assert!(matches!(interpreter.resolve_path(&name("\\DEV0")), Err(AmlError::NotFound(_))));

        // Device(DEV1) {}; Name(DEV1, 2)
        let mut body = device(b"DEV1", &[]);
        body.extend(name_integer(b"DEV1", 2));
        let index = interpreter.install_table(&make_table(b"SSDT", &body)).unwrap();
        assert_eq!(interpreter.load_table(index, Some(sb)).err(), Some(AmlError::NameCollision(name("\\_SB.DEV1"))));
        assert!(matches!(interpreter.resolve_path(&name("\\_SB.DEV1")), Err(AmlError::NotFound(_))));
        assert_eq!(interpreter.namespace.lock().get(sb).unwrap().children.len(), children + 1);
    }

    #[test]
    fn staged_loading_allows_forward_references() {
        // Name(RES, Zero); Store(FOO, RES); Method(FOO) { Return(7) }
        let mut body = name_op(b"RES_", &[0x00]);
        body.push(0x70);
        body.extend(b"FOO_RES_");
        body.extend(method(b"FOO_", 0, &[0xa4, 0x0a, 0x07]));
        let table = make_table(b"DSDT", &body);

        let single = Interpreter::new(TestHandler::new());
        let index = single.install_table(&table).unwrap();
        assert!(matches!(single.load_table(index, None), Err(AmlError::NotFound(_))));
        assert!(matches!(single.resolve_path(&name("\\RES")), Err(AmlError::NotFound(_))));

        let staged = Interpreter::new(TestHandler::new());
        let index = staged.install_table(&table).unwrap();
        staged.load_table_staged(index, None).unwrap();
        assert_eq!(evaluate_integer(&staged, "\\RES", vec![]), 7);
        let owner_id = staged.owner_id(index).unwrap();
        assert_eq!(staged.namespace.lock().owner_node_count(owner_id), 2);
    }

    #[test]
    fn region_fields_reach_the_handler() {
        let handler = TestHandler::new();
        handler.poke(0x1001, &[0x34, 0x12]);
        let interpreter = Interpreter::new(handler.clone());

        // OperationRegion(MEM, SystemMemory, 0x1000, 0x10)
        let mut body = vec![0x5b, 0x80, b'M', b'E', b'M', b'_', 0x00, 0x0b, 0x00, 0x10, 0x0a, 0x10];
        // Field(MEM, ByteAcc, NoLock, Preserve) { Offset(1), FLD1, 16 }
        let mut field = b"MEM_".to_vec();
        field.extend([0x01, 0x00, 0x08]);
        field.extend(b"FLD1");
        field.push(0x10);
        body.extend([0x5b, 0x81]);
        body.extend(pkg(&field));
        // Method(WRF) { Store(0x5678, FLD1) }
        let mut store = vec![0x70, 0x0b, 0x78, 0x56];
        store.extend(b"FLD1");
        body.extend(method(b"WRF_", 0, &store));
        load(&interpreter, &body).unwrap();

        assert_eq!(evaluate_integer(&interpreter, "\\FLD1", vec![]), 0x1234);
        interpreter.evaluate(&name("\\WRF"), vec![]).unwrap();
        assert_eq!(handler.peek(0x1001), 0x78);
        assert_eq!(handler.peek(0x1002), 0x56);
        assert_eq!(handler.peek(0x1003), 0x00);
    }

    #[test]
    fn unloading() {
        let interpreter = Interpreter::new(TestHandler::new());
        let index = load(&interpreter, &device(b"DEV0", &name_integer(b"_STA", 0x0f))).unwrap();
        interpreter.unload_table(index).unwrap();

        assert!(!interpreter.is_loaded(index));
        assert!(matches!(interpreter.resolve_path(&name("\\DEV0")), Err(AmlError::NotFound(_))));
        assert_eq!(interpreter.unload_table(index), Err(AmlError::BadParameter));
        interpreter.load_table(index, None).unwrap();
        assert_eq!(evaluate_integer(&interpreter, "\\DEV0._STA", vec![]), 0x0f);
    }

    #[test]
    fn method_objects_are_swept() {
        let interpreter = Interpreter::new(TestHandler::new());
        // Method(MKN) { Name(TMP, One); Return(TMP) }
        let mut body = name_op(b"TMP_", &[0x01]);
        body.push(0xa4);
        body.extend(b"TMP_");
        load(&interpreter, &method(b"MKN_", 0, &body)).unwrap();

        assert_eq!(evaluate_integer(&interpreter, "\\MKN", vec![]), 1);
        assert!(matches!(interpreter.resolve_path(&name("\\MKN.TMP")), Err(AmlError::NotFound(_))));
        // Running it again doesn't collide with the first run's objects
        assert_eq!(evaluate_integer(&interpreter, "\\MKN", vec![]), 1);
    }

    #[test]
    fn module_level_code_runs_in_place() {
        let interpreter = Interpreter::new(TestHandler::new());
        // Name(VAL, 5); If (LEqual(VAL, 5)) { Store(Multiply(VAL, 3), VAL) }
        let mut body = name_integer(b"VAL_", 5);
        let mut predicate = vec![0x93];
        predicate.extend(b"VAL_");
        predicate.extend([0x0a, 0x05]);
        let mut store = vec![0x70, 0x77];
        store.extend(b"VAL_");
        store.extend([0x0a, 0x03, 0x00]);
        store.extend(b"VAL_");
        body.extend(if_op(&predicate, &store));
        load(&interpreter, &body).unwrap();

        assert_eq!(evaluate_integer(&interpreter, "\\VAL", vec![]), 15);
    }

    #[test]
    fn unimplemented_ops_fail_when_run() {
        let interpreter = Interpreter::new(TestHandler::new());
        // Method(TMR) { Return(Timer) }
        load(&interpreter, &method(b"TMR_", 0, &[0xa4, 0x5b, 0x33])).unwrap();
        assert_eq!(
            interpreter.evaluate(&name("\\TMR"), vec![]).err(),
            Some(AmlError::UnimplementedOpcode(Opcode::Timer))
        );
    }

    #[test]
    fn divide_by_zero() {
        let interpreter = Interpreter::new(TestHandler::new());
        // Method(DIV, 1) { Divide(10, Arg0, Local0, Local1); Return(Local1) }
        load(&interpreter, &method(b"DIV_", 1, &[0x78, 0x0a, 0x0a, 0x68, 0x60, 0x61, 0xa4, 0x61])).unwrap();
        assert_eq!(evaluate_integer(&interpreter, "\\DIV", vec![integer(3)]), 3);
        assert_eq!(interpreter.evaluate(&name("\\DIV"), vec![integer(0)]).err(), Some(AmlError::DivideByZero));
    }
}
