//! Linked scatter/gather buffer.
//!
//! A chain of reference-counted segments that external collaborators
//! (protocol engines, proxies) fill without copying and hand to
//! `TcpSocket::send_chain`, which gathers the segments into one vectored
//! write.

use std::collections::VecDeque;

use bytes::Bytes;

#[derive(Default)]
pub struct BufferChain {
    segments: VecDeque<Bytes>,
    len: usize,
}

impl BufferChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a segment to the tail of the chain. Empty segments are
    /// dropped.
    pub fn append(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.len += data.len();
        self.segments.push_back(data);
    }

    /// Total bytes across all segments.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read pointer: the head segment's unread bytes.
    pub fn first(&self) -> Option<&[u8]> {
        self.segments.front().map(|b| b.as_ref())
    }

    /// Iterate the chain's segments in order.
    pub fn slices(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(|b| b.as_ref())
    }

    /// Consume `n` bytes from the head of the chain, crossing segment
    /// boundaries as needed. Consuming more than `len()` drains the chain.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.segments.front_mut() else {
                return;
            };
            if n < front.len() {
                let _ = front.split_to(n);
                self.len -= n;
                return;
            }
            n -= front.len();
            self.len -= front.len();
            self.segments.pop_front();
        }
    }

    /// Copy the whole chain into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for s in self.slices() {
            out.extend_from_slice(s);
        }
        out
    }
}
