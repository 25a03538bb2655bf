//! Buffer for remote connectivity candidates that arrive before the session
//! can apply them.
//!
//! Candidates are held until the initial negotiation completes (the remote
//! description exists and, on the callee side, the answer went out). The
//! buffer is drained exactly once; from then on candidates pass straight
//! through.

use super::signaling::IceCandidateInit;

#[derive(Debug)]
enum BufferState {
    Holding(Vec<IceCandidateInit>),
    Open,
}

#[derive(Debug)]
pub struct CandidateBuffer {
    state: BufferState,
}

impl Default for CandidateBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self {
            state: BufferState::Holding(Vec::new()),
        }
    }

    /// True once [`drain`](Self::drain) has run.
    pub fn is_open(&self) -> bool {
        matches!(self.state, BufferState::Open)
    }

    pub fn pending(&self) -> usize {
        match &self.state {
            BufferState::Holding(queue) => queue.len(),
            BufferState::Open => 0,
        }
    }

    /// Offer a remote candidate. Returns it back if it should be applied now,
    /// or `None` if it was queued.
    pub fn offer(&mut self, candidate: IceCandidateInit) -> Option<IceCandidateInit> {
        match &mut self.state {
            BufferState::Holding(queue) => {
                queue.push(candidate);
                tracing::debug!("Buffered remote candidate ({} pending)", queue.len());
                None
            }
            BufferState::Open => Some(candidate),
        }
    }

    /// Take every queued candidate in arrival order and open the buffer.
    /// Later calls return nothing.
    pub fn drain(&mut self) -> Vec<IceCandidateInit> {
        match std::mem::replace(&mut self.state, BufferState::Open) {
            BufferState::Holding(queue) => queue,
            BufferState::Open => Vec::new(),
        }
    }
}
