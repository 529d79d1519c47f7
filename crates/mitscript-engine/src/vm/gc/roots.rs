//! GC root set
//!
//! The roots are exactly the live call frames: the interpreter pushes a
//! frame when a call begins and pops it on return, and the JIT call helper
//! does the same around each native activation. Everything else reachable is
//! found by tracing from these frames.

use crate::vm::object::ObjRef;

/// Stack of live frames, bottom first. Index 0 is the global frame.
#[derive(Default)]
pub struct RootSet {
    frames: Vec<ObjRef>,
}

impl RootSet {
    pub fn new() -> RootSet {
        RootSet::default()
    }

    pub fn push(&mut self, frame: ObjRef) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<ObjRef> {
        self.frames.pop()
    }

    pub fn top(&self) -> Option<ObjRef> {
        self.frames.last().copied()
    }

    /// The global frame, once installed.
    pub fn bottom(&self) -> Option<ObjRef> {
        self.frames.first().copied()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.frames.iter().copied()
    }
}
