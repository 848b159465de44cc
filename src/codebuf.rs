//! Code buffer manager: executable memory arenas, emergency enlargement,
//! proxies, and deferred release (`spec.md` §4.11).
//!
//! A `CodeBuffer`'s backing bytes are modeled here as a plain `Vec<u8>`;
//! mapping them executable is the host's concern (`spec.md` §1 Non-goals
//! "Allocator of code pages (assumed mmap-able executable memory with
//! standard lifetime)") and belongs to an `Isa` backend
//! (`crate::isa`), not to this module.

use crate::entities::CodeBufferRef;
use crate::settings::Settings;
use cranelift_entity::PrimaryMap;
use log::{debug, trace};

/// One executable (conceptually) arena and the cursor writing into it.
#[derive(Debug)]
pub struct CodeBuffer {
    data: Vec<u8>,
    cursor: usize,
    /// Set while native code inside this buffer may currently be
    /// executing (e.g. a dispatcher stub called back into the compiler
    /// from within it); such buffers must not be reused or freed
    /// (`spec.md` §5 "Runtime code execution").
    locked: bool,
}

impl CodeBuffer {
    fn new(capacity: usize) -> Self {
        CodeBuffer {
            data: vec![0u8; capacity],
            cursor: 0,
            locked: false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn write(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.remaining(), "caller must check remaining() first");
        self.data[self.cursor..self.cursor + bytes.len()].copy_from_slice(bytes);
        self.cursor += bytes.len();
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.cursor]
    }
}

/// Writes whatever jump encoding an `emergency_enlarge`/`proxy` needs;
/// left to an `Isa` implementation (`crate::isa`).
pub trait JumpSink {
    /// Encode an unconditional jump to `target`'s entry and return the
    /// bytes to append to the buffer currently being enlarged.
    fn encode_jump(&self, target: CodeBufferRef) -> Vec<u8>;
}

/// Owns every `CodeBuffer` for one `Compiler`.
pub struct CodeBufferManager {
    buffers: PrimaryMap<CodeBufferRef, CodeBuffer>,
    slab_size_bytes: usize,
    buffer_margin_bytes: usize,
    /// Buffers that have logically been freed but may still be executing
    /// on some thread's native stack; drained at the next
    /// `Compiler::safe_point` (`spec.md` §4.11 last bullet).
    deferred_release: Vec<CodeBufferRef>,
}

impl CodeBufferManager {
    pub fn new(settings: &Settings) -> Self {
        CodeBufferManager {
            buffers: PrimaryMap::new(),
            slab_size_bytes: settings.slab_size_bytes,
            buffer_margin_bytes: settings.buffer_margin_bytes,
            deferred_release: Vec::new(),
        }
    }

    /// Reserve a fresh slab (`spec.md` §4.11 "Reserve a large executable
    /// arena").
    pub fn new_slab(&mut self) -> CodeBufferRef {
        let r = self.buffers.push(CodeBuffer::new(self.slab_size_bytes));
        trace!("reserved code slab {r} ({} bytes)", self.slab_size_bytes);
        r
    }

    pub fn get(&self, r: CodeBufferRef) -> &CodeBuffer {
        &self.buffers[r]
    }

    pub fn get_mut(&mut self, r: CodeBufferRef) -> &mut CodeBuffer {
        &mut self.buffers[r]
    }

    /// `true` if `r` has fallen below its configured margin and needs
    /// `emergency_enlarge` before the next emission
    /// (`spec.md` §8 "A buffer whose remaining capacity is below
    /// `BUFFER_MARGIN` triggers emergency enlargement").
    pub fn needs_enlarge(&self, r: CodeBufferRef) -> bool {
        self.buffers[r].remaining() < self.buffer_margin_bytes
    }

    /// Write a jump at `r`'s current cursor, reserve a fresh buffer, and
    /// return it so the caller resumes emission there
    /// (`spec.md` §4.11 "emergency_enlarge").
    pub fn emergency_enlarge(&mut self, r: CodeBufferRef, sink: &dyn JumpSink) -> CodeBufferRef {
        let fresh = self.new_slab();
        let jump = sink.encode_jump(fresh);
        debug!("emergency_enlarge: buffer {r} exhausted, continuing in {fresh}");
        self.buffers[r].write(&jump);
        fresh
    }

    /// Trim `r` to its actually-used size now that compilation into it
    /// has finished (`spec.md` §4.11 "shrink").
    pub fn shrink(&mut self, r: CodeBufferRef) {
        let buf = &mut self.buffers[r];
        buf.data.truncate(buf.cursor);
    }

    /// Create a small stub buffer that does nothing but jump to
    /// `target` (`spec.md` §4.11 "proxy creates a small stub buffer
    /// referring to an existing code target").
    pub fn proxy(&mut self, target: CodeBufferRef, sink: &dyn JumpSink) -> CodeBufferRef {
        let jump = sink.encode_jump(target);
        let stub = self.buffers.push(CodeBuffer::new(jump.len()));
        self.buffers[stub].write(&jump);
        stub
    }

    pub fn set_locked(&mut self, r: CodeBufferRef, locked: bool) {
        self.buffers[r].locked = locked;
    }

    /// Queue `r` for release once no thread could still be executing
    /// inside it.
    pub fn free(&mut self, r: CodeBufferRef) {
        self.deferred_release.push(r);
    }

    /// Drain the deferred-release queue, actually dropping every buffer
    /// that is not currently locked. Buffers still locked are carried
    /// over to the next safe point (`spec.md` §5 "the compiler must
    /// detect locked buffers... and refuse to reuse or free them").
    pub fn safe_point(&mut self) -> usize {
        let mut released = 0;
        self.deferred_release.retain(|&r| {
            if self.buffers[r].locked {
                true
            } else {
                released += 1;
                false
            }
        });
        released
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred_release.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedJump(Vec<u8>);
    impl JumpSink for FixedJump {
        fn encode_jump(&self, _target: CodeBufferRef) -> Vec<u8> {
            self.0.clone()
        }
    }

    #[test]
    fn needs_enlarge_trips_below_margin() {
        let settings = Settings::builder().slab_size_bytes(16).buffer_margin_bytes(8).finish();
        let mut mgr = CodeBufferManager::new(&settings);
        let r = mgr.new_slab();
        assert!(!mgr.needs_enlarge(r));
        mgr.get_mut(r).write(&[0u8; 10]);
        assert!(mgr.needs_enlarge(r));
    }

    #[test]
    fn emergency_enlarge_writes_jump_and_returns_fresh_buffer() {
        let settings = Settings::builder().slab_size_bytes(16).finish();
        let mut mgr = CodeBufferManager::new(&settings);
        let r = mgr.new_slab();
        let sink = FixedJump(vec![0xe9, 0x00, 0x00, 0x00, 0x00]);
        let fresh = mgr.emergency_enlarge(r, &sink);
        assert_ne!(r, fresh);
        assert_eq!(mgr.get(r).cursor(), 5);
    }

    #[test]
    fn safe_point_releases_unlocked_buffers_only() {
        let settings = Settings::default();
        let mut mgr = CodeBufferManager::new(&settings);
        let a = mgr.new_slab();
        let b = mgr.new_slab();
        mgr.set_locked(b, true);
        mgr.free(a);
        mgr.free(b);
        let released = mgr.safe_point();
        assert_eq!(released, 1);
        assert_eq!(mgr.deferred_count(), 1);
    }

    #[test]
    fn shrink_truncates_to_used_size() {
        let settings = Settings::builder().slab_size_bytes(64).finish();
        let mut mgr = CodeBufferManager::new(&settings);
        let r = mgr.new_slab();
        mgr.get_mut(r).write(&[1, 2, 3]);
        mgr.shrink(r);
        assert_eq!(mgr.get(r).bytes().len(), 3);
    }
}
