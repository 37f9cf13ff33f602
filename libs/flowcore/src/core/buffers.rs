// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Tuple buffers exchanged between sources and pipeline stages.
//!
//! A [`TupleBuffer`] is immutable once emitted and cheap to clone, so one
//! buffer can be handed to every successor of a pipeline without copying.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::ids::OriginId;

/// Immutable payload plus the number of tuples it holds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TupleBuffer {
    data: Bytes,
    number_of_tuples: u64,
    origin_id: OriginId,
    sequence_number: u64,
}

impl TupleBuffer {
    pub fn new(data: Bytes, number_of_tuples: u64) -> Self {
        Self {
            data,
            number_of_tuples,
            origin_id: OriginId::default(),
            sequence_number: 0,
        }
    }

    /// Freeze a filled writable buffer.
    pub fn from_mut(data: BytesMut, number_of_tuples: u64) -> Self {
        Self::new(data.freeze(), number_of_tuples)
    }

    pub fn with_origin(mut self, origin_id: OriginId, sequence_number: u64) -> Self {
        self.origin_id = origin_id;
        self.sequence_number = sequence_number;
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn number_of_tuples(&self) -> u64 {
        self.number_of_tuples
    }

    pub fn origin_id(&self) -> OriginId {
        self.origin_id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Hands out writable buffers to stages and sources.
pub trait BufferProvider: Send + Sync {
    /// Allocate a zeroed buffer of [`buffer_size`](Self::buffer_size) bytes.
    fn allocate(&self) -> BytesMut;

    fn buffer_size(&self) -> usize;

    /// Buffers handed out so far.
    fn allocated(&self) -> u64;
}

/// Heap-backed provider with a fixed buffer size.
#[derive(Debug)]
pub struct HeapBufferProvider {
    buffer_size: usize,
    allocated: AtomicU64,
}

impl HeapBufferProvider {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            allocated: AtomicU64::new(0),
        }
    }
}

impl Default for HeapBufferProvider {
    fn default() -> Self {
        Self::new(8192)
    }
}

impl BufferProvider for HeapBufferProvider {
    fn allocate(&self) -> BytesMut {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        BytesMut::zeroed(self.buffer_size)
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }
}
