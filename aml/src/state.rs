//! Generic state frames.
//!
//! Everything the interpreter tracks per walk is kept as a stack of `GenericState` frames: parser scopes,
//! namespace scopes, the thread a method runs on, and the bookkeeping of iterative object-tree walks and control
//! flow. Frames come from an [`ObjectPool`] and are linked into singly-linked stacks through `next`. The stack
//! operations never touch the pool: creating and deleting frames is the caller's job.

use crate::{
    namespace::NodeHandle,
    object::{ObjectRef, ObjectType},
    op::ParseOp,
    opcode::{ArgCount, ArgList},
    pool::{Descriptor, ObjectPool, Poolable},
};
use alloc::boxed::Box;

pub type StateList = Option<Box<GenericState>>;

#[derive(Debug)]
pub struct GenericState {
    pub descriptor: Descriptor,
    next: StateList,
    pub payload: StatePayload,
}

#[derive(Debug, Default)]
pub enum StatePayload {
    #[default]
    Empty,
    ParserScope(ParserScope),
    NamespaceScope(ScopeState),
    Thread(ThreadState),
    UpdateRef(UpdateState),
    PackageWalk(PackageState),
    Control(ControlState),
}

#[derive(Debug)]
pub struct ParserScope {
    /// The op whose arguments are being parsed.
    pub op: Option<Box<ParseOp>>,
    pub arg_list: ArgList,
    pub arg_count: ArgCount,
    /// The cursor position at which this scope's arguments end.
    pub arg_end: usize,
    pub pkg_end: usize,
}

impl ParserScope {
    pub fn is_complete(&self, cursor: usize) -> bool {
        cursor >= self.arg_end || self.arg_count == ArgCount::Fixed(0)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ScopeState {
    pub node: NodeHandle,
    pub typ: ObjectType,
}

#[derive(Clone, Copy, Debug)]
pub struct ThreadState {
    /// Never zero, so that zero can mean "no thread".
    pub thread_id: u64,
    pub nesting_depth: usize,
}

#[derive(Debug)]
pub struct UpdateState {
    pub object: Option<ObjectRef>,
}

#[derive(Debug)]
pub struct PackageState {
    pub source: ObjectRef,
    pub target: ObjectRef,
    /// Index of the next element of `source` to visit.
    pub index: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ControlKind {
    If,
    While,
}

#[derive(Clone, Copy, Debug)]
pub struct ControlState {
    pub kind: ControlKind,
    /// Offset of the `If` or `While` op this frame belongs to.
    pub op_offset: usize,
    pub predicate: bool,
    /// Where a `While` loop jumps back to in order to re-evaluate its predicate.
    pub loop_start: usize,
    pub pkg_end: usize,
    pub iterations: usize,
}

impl Poolable for GenericState {
    fn zeroed() -> Self {
        GenericState { descriptor: Descriptor::Active, next: None, payload: StatePayload::Empty }
    }

    fn mark_cached(&mut self) {
        self.descriptor = Descriptor::Cached;
        self.next = None;
        self.payload = StatePayload::Empty;
    }

    fn is_cached(&self) -> bool {
        self.descriptor == Descriptor::Cached
    }
}

pub fn push_state(list: &mut StateList, mut state: Box<GenericState>) {
    state.next = list.take();
    *list = Some(state);
}

pub fn pop_state(list: &mut StateList) -> Option<Box<GenericState>> {
    let mut state = list.take()?;
    *list = state.next.take();
    Some(state)
}

pub fn peek_state(list: &StateList) -> Option<&GenericState> {
    list.as_deref()
}

pub fn peek_state_mut(list: &mut StateList) -> Option<&mut GenericState> {
    list.as_deref_mut()
}

/// Iterate over a stack of frames, from the top down.
pub fn iter_states(list: &StateList) -> impl Iterator<Item = &GenericState> {
    core::iter::successors(list.as_deref(), |state| state.next.as_deref())
}

/// The identity recorded for a thread. A platform that reports thread id zero gets a fixed sentinel instead.
pub fn thread_identity(thread_id: u64) -> u64 {
    if thread_id == 0 {
        u64::MAX
    } else {
        thread_id
    }
}

impl ObjectPool<GenericState> {
    fn create(&self, payload: StatePayload) -> Box<GenericState> {
        let mut state = self.acquire();
        state.payload = payload;
        state
    }

    pub fn create_parser_scope(
        &self,
        op: Box<ParseOp>,
        arg_list: ArgList,
        arg_count: ArgCount,
        arg_end: usize,
        pkg_end: usize,
    ) -> Box<GenericState> {
        self.create(StatePayload::ParserScope(ParserScope { op: Some(op), arg_list, arg_count, arg_end, pkg_end }))
    }

    pub fn create_scope_state(&self, node: NodeHandle, typ: ObjectType) -> Box<GenericState> {
        self.create(StatePayload::NamespaceScope(ScopeState { node, typ }))
    }

    pub fn create_thread_state(&self, thread_id: u64, nesting_depth: usize) -> Box<GenericState> {
        self.create(StatePayload::Thread(ThreadState { thread_id: thread_identity(thread_id), nesting_depth }))
    }

    pub fn create_update_state(&self, object: ObjectRef) -> Box<GenericState> {
        self.create(StatePayload::UpdateRef(UpdateState { object: Some(object) }))
    }

    pub fn create_package_state(&self, source: ObjectRef, target: ObjectRef) -> Box<GenericState> {
        self.create(StatePayload::PackageWalk(PackageState { source, target, index: 0 }))
    }

    pub fn create_control_state(
        &self,
        kind: ControlKind,
        op_offset: usize,
        predicate: bool,
        loop_start: usize,
        pkg_end: usize,
    ) -> Box<GenericState> {
        self.create(StatePayload::Control(ControlState {
            kind,
            op_offset,
            predicate,
            loop_start,
            pkg_end,
            iterations: 0,
        }))
    }

    /// Return a frame to the pool. Deleting no frame is fine, and does nothing.
    pub fn delete_state(&self, state: Option<Box<GenericState>>) {
        if let Some(state) = state {
            self.release(state);
        }
    }

    /// Delete every frame on a stack.
    pub fn delete_list(&self, list: &mut StateList) {
        while let Some(state) = pop_state(list) {
            self.release(state);
        }
    }
}
