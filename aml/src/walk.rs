use crate::{
    namespace::NodeHandle,
    object::{ObjectRef, ObjectType},
    parser::ParserState,
    pool::ObjectPool,
    state::{self, ControlState, GenericState, ScopeState, StateList, StatePayload},
    table::OwnerId,
    AmlError,
    Caches,
};
use log::{trace, warn};

pub const MAX_ARGS: usize = 7;
pub const MAX_LOCALS: usize = 8;

/// Which parts of a table a walk acts on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PassNumber {
    /// Create namespace nodes, and the objects that are fully described by their declaration. Nothing is
    /// executed.
    Declare,
    /// Revisit a table that has been through `Declare`: attach the remaining objects, and run module-level code.
    Resolve,
    /// Declare and execute together, in one pass over the table.
    Single,
}

/// Control flow that takes effect once the op that requested it has completed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PendingControl {
    Break,
    Continue,
    Return,
}

/// The state of one table load or method invocation.
pub struct WalkState {
    pub parser: ParserState,
    scope_info: StateList,
    scope_depth: usize,
    control_state: StateList,
    thread: StateList,
    pub pass: PassNumber,
    pub owner_id: OwnerId,
    /// The method being run, or `None` for a walk over a table or a deferred object.
    pub method_node: Option<NodeHandle>,
    pub method_nesting_depth: usize,
    pub args: [Option<ObjectRef>; MAX_ARGS],
    pub locals: [Option<ObjectRef>; MAX_LOCALS],
    pub return_value: Option<ObjectRef>,
    pub pending: Option<PendingControl>,
    /// The predicate of the `If` that completed most recently, for a following `Else` to consult.
    pub if_result: Option<bool>,
    /// Whether buffers and packages are captured for later realization instead of being built in place.
    pub defer_objects: bool,
}

impl WalkState {
    pub fn new(parser: ParserState, pass: PassNumber, owner_id: OwnerId) -> WalkState {
        WalkState {
            parser,
            scope_info: None,
            scope_depth: 0,
            control_state: None,
            thread: None,
            pass,
            owner_id,
            method_node: None,
            method_nesting_depth: 0,
            args: Default::default(),
            locals: Default::default(),
            return_value: None,
            pending: None,
            if_result: None,
            defer_objects: false,
        }
    }

    /// Make `node` the scope that names are resolved in, until a matching `pop_scope`.
    pub fn push_scope(
        &mut self,
        node: Option<NodeHandle>,
        typ: ObjectType,
        states: &ObjectPool<GenericState>,
    ) -> Result<(), AmlError> {
        let node = node.ok_or(AmlError::BadParameter)?;

        if !is_scope_type(typ) {
            warn!("Pushing namespace scope {:?} of type {:?}, which can't contain objects", node, typ);
        }

        state::push_state(&mut self.scope_info, states.create_scope_state(node, typ));
        self.scope_depth += 1;
        trace!("Pushed scope {:?} ({:?}), depth {}", node, typ, self.scope_depth);
        Ok(())
    }

    pub fn pop_scope(&mut self, states: &ObjectPool<GenericState>) -> Result<ScopeState, AmlError> {
        let frame = state::pop_state(&mut self.scope_info).ok_or(AmlError::StackUnderflow)?;
        let scope = match frame.payload {
            StatePayload::NamespaceScope(scope) => Some(scope),
            _ => None,
        };
        states.delete_state(Some(frame));

        let scope = scope.ok_or(AmlError::BadParameter)?;
        self.scope_depth -= 1;
        trace!("Popped scope {:?}, depth {}", scope.node, self.scope_depth);
        Ok(scope)
    }

    pub fn clear_scopes(&mut self, states: &ObjectPool<GenericState>) {
        states.delete_list(&mut self.scope_info);
        self.scope_depth = 0;
    }

    pub fn scope_depth(&self) -> usize {
        self.scope_depth
    }

    /// The node that names are currently resolved relative to. This is the root if no scope has been pushed.
    pub fn current_scope_node(&self) -> NodeHandle {
        match state::peek_state(&self.scope_info).map(|frame| &frame.payload) {
            Some(StatePayload::NamespaceScope(scope)) => scope.node,
            _ => NodeHandle::ROOT,
        }
    }

    pub fn push_control(&mut self, frame: alloc::boxed::Box<GenericState>) {
        state::push_state(&mut self.control_state, frame);
    }

    pub fn pop_control(&mut self, states: &ObjectPool<GenericState>) -> Option<ControlState> {
        let frame = state::pop_state(&mut self.control_state)?;
        let control = match frame.payload {
            StatePayload::Control(control) => Some(control),
            _ => None,
        };
        states.delete_state(Some(frame));
        control
    }

    pub fn control(&self) -> Option<&ControlState> {
        match state::peek_state(&self.control_state).map(|frame| &frame.payload) {
            Some(StatePayload::Control(control)) => Some(control),
            _ => None,
        }
    }

    pub fn control_mut(&mut self) -> Option<&mut ControlState> {
        match state::peek_state_mut(&mut self.control_state).map(|frame| &mut frame.payload) {
            Some(StatePayload::Control(control)) => Some(control),
            _ => None,
        }
    }

    /// Record the thread this walk runs on. A walk has at most one thread frame.
    pub fn attach_thread(&mut self, thread_id: u64, states: &ObjectPool<GenericState>) {
        states.delete_list(&mut self.thread);
        state::push_state(&mut self.thread, states.create_thread_state(thread_id, self.method_nesting_depth));
    }

    pub fn thread_id(&self) -> Option<u64> {
        match state::peek_state(&self.thread).map(|frame| &frame.payload) {
            Some(StatePayload::Thread(thread)) => Some(thread.thread_id),
            _ => None,
        }
    }

    /// Tear down the walk, returning every frame and parse op it still holds to the caches.
    pub fn delete(&mut self, caches: &Caches) {
        self.parser.cleanup_scope(&caches.ops, &caches.state);
        self.clear_scopes(&caches.state);
        caches.state.delete_list(&mut self.control_state);
        caches.state.delete_list(&mut self.thread);

        self.args = Default::default();
        self.locals = Default::default();
    }
}

/// Types of node that can contain other objects. Any other type can still be pushed as a scope, with a warning.
fn is_scope_type(typ: ObjectType) -> bool {
    matches!(
        typ,
        ObjectType::Any
            | ObjectType::Device
            | ObjectType::Power
            | ObjectType::Processor
            | ObjectType::Thermal
            | ObjectType::Method
    )
}
