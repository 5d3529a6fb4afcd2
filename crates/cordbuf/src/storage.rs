// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::VecDeque;

use crate::BlockRef;

// Initial capacity of the ring once a buffer outgrows the inline slots.
const HEAP_INITIAL_CAPACITY: usize = 8;

/// The ordered sequence of block references behind a buffer.
///
/// Most buffers hold one or two fragments, which fit inline without any allocation. Longer
/// sequences move to a growable ring buffer that supports cheap pushes and pops at both ends.
#[derive(Clone, Debug)]
pub(crate) enum RefQueue {
    /// Occupied slots always form a prefix: the second slot is only used when the first is.
    Inline([Option<BlockRef>; 2]),
    Heap(VecDeque<BlockRef>),
}

impl RefQueue {
    pub(crate) const fn new() -> Self {
        Self::Inline([None, None])
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Inline([None, _]) => 0,
            Self::Inline([Some(_), None]) => 1,
            Self::Inline([Some(_), Some(_)]) => 2,
            Self::Heap(refs) => refs.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn get(&self, index: usize) -> Option<&BlockRef> {
        match self {
            Self::Inline(slots) => slots.get(index).and_then(Option::as_ref),
            Self::Heap(refs) => refs.get(index),
        }
    }

    pub(crate) fn front(&self) -> Option<&BlockRef> {
        self.get(0)
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut BlockRef> {
        match self {
            Self::Inline([first, _]) => first.as_mut(),
            Self::Heap(refs) => refs.front_mut(),
        }
    }

    pub(crate) fn back(&self) -> Option<&BlockRef> {
        match self {
            Self::Inline([first, second]) => second.as_ref().or(first.as_ref()),
            Self::Heap(refs) => refs.back(),
        }
    }

    pub(crate) fn back_mut(&mut self) -> Option<&mut BlockRef> {
        match self {
            Self::Inline([first, second]) => second.as_mut().or(first.as_mut()),
            Self::Heap(refs) => refs.back_mut(),
        }
    }

    pub(crate) fn push_back(&mut self, block_ref: BlockRef) {
        match self {
            Self::Inline([first @ None, _]) => *first = Some(block_ref),
            Self::Inline([Some(_), second @ None]) => *second = Some(block_ref),
            Self::Inline(_) => {
                let mut refs = self.spill();
                refs.push_back(block_ref);
                *self = Self::Heap(refs);
            }
            Self::Heap(refs) => refs.push_back(block_ref),
        }
    }

    pub(crate) fn push_front(&mut self, block_ref: BlockRef) {
        match self {
            Self::Inline([first @ None, _]) => *first = Some(block_ref),
            Self::Inline([first @ Some(_), second @ None]) => {
                *second = first.take();
                *first = Some(block_ref);
            }
            Self::Inline(_) => {
                let mut refs = self.spill();
                refs.push_front(block_ref);
                *self = Self::Heap(refs);
            }
            Self::Heap(refs) => refs.push_front(block_ref),
        }
    }

    pub(crate) fn pop_front(&mut self) -> Option<BlockRef> {
        match self {
            Self::Inline([first, second]) => {
                let popped = first.take();
                *first = second.take();
                popped
            }
            Self::Heap(refs) => refs.pop_front(),
        }
    }

    pub(crate) fn pop_back(&mut self) -> Option<BlockRef> {
        match self {
            Self::Inline([first, second]) => second.take().or_else(|| first.take()),
            Self::Heap(refs) => refs.pop_back(),
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::new();
    }

    pub(crate) fn iter(&self) -> impl DoubleEndedIterator<Item = &BlockRef> {
        let (inline, heap) = match self {
            Self::Inline(slots) => (Some(slots.iter().flatten()), None),
            Self::Heap(refs) => (None, Some(refs.iter())),
        };

        inline.into_iter().flatten().chain(heap.into_iter().flatten())
    }

    // Moves the inline slots out into a ring buffer with room to grow.
    fn spill(&mut self) -> VecDeque<BlockRef> {
        let mut refs = VecDeque::with_capacity(HEAP_INITIAL_CAPACITY);

        if let Self::Inline(slots) = self {
            refs.extend(slots.iter_mut().filter_map(Option::take));
        }

        refs
    }
}

impl Default for RefQueue {
    fn default() -> Self {
        Self::new()
    }
}
