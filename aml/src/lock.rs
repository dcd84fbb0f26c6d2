use core::hint::spin_loop;
use log::trace;
use spinning_top::Spinlock;

struct LockState {
    owner: Option<u64>,
    depth: usize,
}

/// The interpreter lock. It must be held around any execution of AML or walk of the namespace. A thread that
/// already holds it can enter again, so a method can be run from inside another one.
pub struct InterpreterLock {
    state: Spinlock<LockState>,
}

impl InterpreterLock {
    pub fn new() -> InterpreterLock {
        InterpreterLock { state: Spinlock::new(LockState { owner: None, depth: 0 }) }
    }

    /// Enter the interpreter on `thread`, spinning until no other thread holds it.
    pub fn enter(&self, thread: u64) -> ExecutionGuard<'_> {
        loop {
            {
                let mut state = self.state.lock();
                match state.owner {
                    None => {
                        state.owner = Some(thread);
                        state.depth = 1;
                        break;
                    }
                    Some(owner) if owner == thread => {
                        state.depth += 1;
                        break;
                    }
                    Some(_) => (),
                }
            }
            spin_loop();
        }

        trace!("Entered interpreter on thread {:#x}", thread);
        ExecutionGuard { lock: self }
    }

    fn exit(&self) {
        let mut state = self.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
        }
    }

    /// How many times the lock is currently held by its owner.
    pub fn depth(&self) -> usize {
        self.state.lock().depth
    }
}

impl Default for InterpreterLock {
    fn default() -> Self {
        InterpreterLock::new()
    }
}

/// Exits the interpreter when dropped.
#[must_use]
pub struct ExecutionGuard<'a> {
    lock: &'a InterpreterLock,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.lock.exit();
    }
}
