use tracing::warn;

/// Causality identity of one callback invocation
///
/// `trigger_async_id` is the id of whoever scheduled the invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AsyncContext {
    pub async_id: u64,
    pub trigger_async_id: u64,
}

impl AsyncContext {
    /// Untracked invocation
    pub const ROOT: AsyncContext = AsyncContext {
        async_id: 0,
        trigger_async_id: 0,
    };

    /// Process bootstrap
    pub const BOOTSTRAP: AsyncContext = AsyncContext {
        async_id: 1,
        trigger_async_id: 0,
    };

    pub fn new(async_id: u64, trigger_async_id: u64) -> Self {
        Self {
            async_id,
            trigger_async_id,
        }
    }

    pub fn is_root(&self) -> bool {
        self.async_id == 0
    }
}

/// Tracing hook invoked around every tracked callback
pub trait CausalityObserver {
    fn before(&self, context: AsyncContext);
    fn after(&self, context: AsyncContext);
}

/// The stack of active callback frames for one runtime context
///
/// Frames are pushed when a scope is entered and popped when it closes.
/// A failed scope never pops its frame, so a frame can outlive its scope
/// until an enclosing scope closes or the next top-level entry resets the
/// stack.
#[derive(Debug)]
pub struct CausalityStack {
    frames: Vec<AsyncContext>,
    // Id 1 is reserved for bootstrap, so the first generated id is 2
    next_async_id: u64,
}

impl CausalityStack {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            next_async_id: 1,
        }
    }

    /// Allocate a fresh async id
    pub fn new_async_id(&mut self) -> u64 {
        self.next_async_id += 1;
        self.next_async_id
    }

    /// Push a frame, returning its index
    pub fn push(&mut self, context: AsyncContext) -> usize {
        self.frames.push(context);
        self.frames.len() - 1
    }

    /// Pop the frame at `index`, which must carry `async_id`
    ///
    /// Frames above `index` belong to children that failed without closing
    /// and are discarded. Returns false if the frame at `index` is not the
    /// expected one, in which case the stack is left untouched.
    pub fn pop(&mut self, index: usize, async_id: u64) -> bool {
        match self.frames.get(index) {
            Some(frame) if frame.async_id == async_id => {}
            other => {
                warn!(
                    target: "scope",
                    "Causality stack mismatch at depth {}: expected id {}, found {:?}",
                    index,
                    async_id,
                    other.map(|f| f.async_id)
                );
                return false;
            }
        }

        let stale = self.frames.len() - index - 1;
        if stale > 0 {
            warn!(
                target: "scope",
                "Discarding {} stale causality frames above id {}",
                stale,
                async_id
            );
        }
        self.frames.truncate(index);
        true
    }

    /// Async id of the innermost active frame, `0` when idle
    pub fn execution_async_id(&self) -> u64 {
        self.frames.last().map(|f| f.async_id).unwrap_or(0)
    }

    /// Trigger id of the innermost active frame, `0` when idle
    pub fn trigger_async_id(&self) -> u64 {
        self.frames.last().map(|f| f.trigger_async_id).unwrap_or(0)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[AsyncContext] {
        &self.frames
    }

    /// Keep only the outermost `depth` frames
    pub fn truncate(&mut self, depth: usize) {
        self.frames.truncate(depth);
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

impl Default for CausalityStack {
    fn default() -> Self {
        Self::new()
    }
}
