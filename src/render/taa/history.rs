//! Double-buffered history for temporal accumulation
//!
//! Two equally sized buffers; one is read (last resolved frame), the other is
//! written by the current resolve. The roles swap after every blend.

use crate::render::backend::Extent;

/// Ping-pong pair of history buffers
pub struct HistoryPair<H> {
    buffers: [H; 2],
    extent: Extent,
    /// Buffer holding the last resolved frame; `None` until seeded
    read: Option<usize>,
    /// Buffer written by the most recent resolve
    last_written: Option<usize>,
}

impl<H> HistoryPair<H> {
    /// Wrap two freshly allocated buffers; the pair starts unseeded
    pub fn new(buffers: [H; 2], extent: Extent) -> Self {
        Self {
            buffers,
            extent,
            read: None,
            last_written: None,
        }
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Whether a frame has been seeded or blended into the pair
    pub fn is_initialized(&self) -> bool {
        self.read.is_some()
    }

    pub fn read_index(&self) -> Option<usize> {
        self.read
    }

    /// Always the opposite of the read index
    pub fn write_index(&self) -> Option<usize> {
        self.read.map(|read| 1 - read)
    }

    /// Buffer written by the most recent seed or resolve
    pub fn last_written(&self) -> Option<usize> {
        self.last_written
    }

    /// Buffer 0, the target of the first-frame seed copy
    pub fn seed_target(&mut self) -> &mut H {
        &mut self.buffers[0]
    }

    /// Record that buffer 0 now holds an unblended frame
    pub fn mark_seeded(&mut self) {
        self.read = Some(0);
        self.last_written = Some(0);
    }

    /// Borrow the read buffer and the write buffer at the same time
    pub fn read_write(&mut self) -> Option<(&H, &mut H)> {
        let read = self.read?;
        let (first, second) = self.buffers.split_at_mut(1);
        if read == 0 {
            Some((&first[0], &mut second[0]))
        } else {
            Some((&second[0], &mut first[0]))
        }
    }

    /// The write buffer becomes next frame's read buffer
    pub fn swap(&mut self) {
        if let Some(write) = self.write_index() {
            self.read = Some(write);
            self.last_written = Some(write);
        }
    }

    /// Forget the contents; the next resolve reseeds
    pub fn invalidate(&mut self) {
        self.read = None;
        self.last_written = None;
    }

    pub fn get(&self, index: usize) -> &H {
        &self.buffers[index]
    }

    /// Hand both buffers back for release
    pub fn into_buffers(self) -> [H; 2] {
        self.buffers
    }
}
