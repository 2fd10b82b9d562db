// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Chunks: guest-visible virtual memory regions with managed commit.
//!
//! A chunk owns a reserved range `[base, base+max_size)` of guest address
//! space and tracks which part is actually committed. The three variants
//! differ only in the shape of the committed set: a normal chunk grows from
//! the bottom, a double-ended chunk is a movable window, and a disconnected
//! chunk commits arbitrary pages. Actual backing memory is the address-space
//! collaborator's problem; the chunk tells it which pages come and go.

use crate::umem::{AddressSpace, GuestAddr};

pub const PAGE_SIZE: u32 = 0x1000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkKind {
    Normal,
    DoubleEnded,
    Disconnected,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkAttrib {
    None,
    /// Unnamed global chunk; reachable only through handles.
    Anonymous,
}

#[derive(Debug)]
pub struct Chunk {
    base: GuestAddr,
    max_size: u32,
    kind: ChunkKind,
    pub attrib: ChunkAttrib,
    /// Committed window, as byte offsets. Normal chunks keep `bottom == 0`.
    bottom: u32,
    top: u32,
    /// Page commit map; only meaningful for disconnected chunks.
    pages: Vec<bool>,
}

fn round_up(v: u32) -> u32 {
    v.next_multiple_of(PAGE_SIZE)
}

impl Chunk {
    /// Builds the chunk and commits its initial window.
    pub fn new(
        aspace: &mut dyn AddressSpace,
        base: GuestAddr,
        kind: ChunkKind,
        attrib: ChunkAttrib,
        initial_bottom: u32,
        initial_top: u32,
        max_size: u32,
    ) -> Self {
        let mut chunk = Self {
            base,
            max_size,
            kind,
            attrib,
            bottom: 0,
            top: 0,
            pages: vec![false; (round_up(max_size) / PAGE_SIZE) as usize],
        };
        match kind {
            ChunkKind::Normal => {
                let _ = chunk.adjust(aspace, initial_top);
            }
            ChunkKind::DoubleEnded => {
                let _ = chunk.adjust_de(aspace, initial_bottom, initial_top);
            }
            ChunkKind::Disconnected => {}
        }
        chunk
    }

    pub fn base(&self) -> GuestAddr {
        self.base
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn kind(&self) -> ChunkKind {
        self.kind
    }

    pub fn bottom(&self) -> u32 {
        self.bottom
    }

    pub fn top(&self) -> u32 {
        self.top
    }

    /// Grows or shrinks a bottom-grown chunk to `new_top`.
    pub fn adjust(&mut self, aspace: &mut dyn AddressSpace, new_top: u32) -> bool {
        if self.kind == ChunkKind::Disconnected || new_top > self.max_size {
            return false;
        }
        let old = round_up(self.top);
        let new = round_up(new_top);
        if new > old {
            if !aspace.commit(self.base + old, new - old) {
                return false;
            }
        } else if new < old {
            aspace.decommit(self.base + new, old - new);
        }
        self.top = new_top;
        true
    }

    /// Moves the committed window of a double-ended chunk.
    pub fn adjust_de(
        &mut self,
        aspace: &mut dyn AddressSpace,
        bottom: u32,
        top: u32,
    ) -> bool {
        if self.kind != ChunkKind::DoubleEnded
            || bottom > top
            || top > self.max_size
        {
            return false;
        }
        // Commit the new window before releasing the old one, so overlap
        // survives the move.
        let (new_lo, new_hi) = (round_up(bottom), round_up(top));
        if new_hi > new_lo
            && !aspace.commit(self.base + new_lo, new_hi - new_lo)
        {
            return false;
        }
        let (old_lo, old_hi) = (round_up(self.bottom), round_up(self.top));
        if old_hi > old_lo {
            if old_lo < new_lo {
                aspace.decommit(
                    self.base + old_lo,
                    new_lo.min(old_hi) - old_lo,
                );
            }
            if old_hi > new_hi {
                aspace.decommit(
                    self.base + new_hi.max(old_lo),
                    old_hi - new_hi.max(old_lo),
                );
            }
        }
        self.bottom = bottom;
        self.top = top;
        true
    }

    fn page_span(&self, offset: u32, size: u32) -> Option<(usize, usize)> {
        let end = offset.checked_add(size)?;
        if end > self.max_size || size == 0 {
            return None;
        }
        let first = (offset / PAGE_SIZE) as usize;
        let last = (round_up(end) / PAGE_SIZE) as usize;
        Some((first, last))
    }

    /// Commits pages covering `[offset, offset+size)` of a disconnected
    /// chunk.
    pub fn commit(
        &mut self,
        aspace: &mut dyn AddressSpace,
        offset: u32,
        size: u32,
    ) -> bool {
        if self.kind != ChunkKind::Disconnected {
            return false;
        }
        let Some((first, last)) = self.page_span(offset, size) else {
            return false;
        };
        if !aspace.commit(
            self.base + first as u32 * PAGE_SIZE,
            (last - first) as u32 * PAGE_SIZE,
        ) {
            return false;
        }
        self.pages[first..last].fill(true);
        true
    }

    /// Releases pages covering `[offset, offset+size)` of a disconnected
    /// chunk.
    pub fn decommit(
        &mut self,
        aspace: &mut dyn AddressSpace,
        offset: u32,
        size: u32,
    ) -> bool {
        if self.kind != ChunkKind::Disconnected {
            return false;
        }
        let Some((first, last)) = self.page_span(offset, size) else {
            return false;
        };
        aspace.decommit(
            self.base + first as u32 * PAGE_SIZE,
            (last - first) as u32 * PAGE_SIZE,
        );
        self.pages[first..last].fill(false);
        true
    }

    /// Commits the lowest free run of `size` bytes and returns its offset.
    pub fn allocate(
        &mut self,
        aspace: &mut dyn AddressSpace,
        size: u32,
    ) -> Option<u32> {
        if self.kind != ChunkKind::Disconnected || size == 0 {
            return None;
        }
        let want = (round_up(size) / PAGE_SIZE) as usize;
        let mut run = 0;
        for (i, &used) in self.pages.iter().enumerate() {
            run = if used { 0 } else { run + 1 };
            if run == want {
                let first = i + 1 - want;
                let offset = first as u32 * PAGE_SIZE;
                if !self.commit(aspace, offset, size) {
                    return None;
                }
                return Some(offset);
            }
        }
        None
    }

    /// Whether `[offset, offset+size)` is currently committed.
    pub fn is_committed(&self, offset: u32, size: u32) -> bool {
        let Some(end) = offset.checked_add(size) else {
            return false;
        };
        if end > self.max_size {
            return false;
        }
        match self.kind {
            ChunkKind::Normal => end <= self.top,
            ChunkKind::DoubleEnded => offset >= self.bottom && end <= self.top,
            ChunkKind::Disconnected => {
                let first = (offset / PAGE_SIZE) as usize;
                let last = (round_up(end) / PAGE_SIZE) as usize;
                self.pages[first..last].iter().all(|&p| p)
            }
        }
    }
}
