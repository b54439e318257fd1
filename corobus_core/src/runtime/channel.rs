use std::collections::VecDeque;

use super::wait_queue::WaitQueue;

/// One bounded FIFO buffer plus the tasks waiting on it.
///
/// The channel only manipulates its buffer and queues; resolving handles,
/// error reporting and waking policy live in [`Bus`](crate::Bus).
#[derive(Debug)]
pub struct Channel<T> {
    capacity: usize,
    generation: u64,
    buffer: VecDeque<T>,
    senders: WaitQueue<T>,
    receivers: WaitQueue<T>,
}

impl<T> Channel<T> {
    pub fn new(capacity: usize, generation: u64) -> Self {
        Self {
            capacity,
            generation,
            buffer: VecDeque::with_capacity(capacity),
            senders: WaitQueue::new(),
            receivers: WaitQueue::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.capacity
    }

    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    /// Capacity 0: nothing is ever buffered, values only move by handoff.
    pub fn is_rendezvous(&self) -> bool {
        self.capacity == 0
    }

    /// Tasks waiting for the buffer to have room.
    pub fn senders(&self) -> &WaitQueue<T> {
        &self.senders
    }

    /// Tasks waiting for the buffer to have a value.
    pub fn receivers(&self) -> &WaitQueue<T> {
        &self.receivers
    }

    /// Appends at the tail unless the buffer is full.
    pub fn try_push(&mut self, value: T) -> Result<(), T> {
        if self.is_full() {
            return Err(value);
        }
        self.buffer.push_back(value);
        Ok(())
    }

    pub fn try_pop(&mut self) -> Option<T> {
        self.buffer.pop_front()
    }

    /// Appends as many of `values` as fit, in order. Returns the count.
    pub fn push_many(&mut self, values: &[T]) -> usize
    where
        T: Clone,
    {
        let count = self.free_space().min(values.len());
        self.buffer.extend(values[..count].iter().cloned());
        count
    }

    /// Pops up to `max` values from the head.
    pub fn pop_many(&mut self, max: usize) -> Vec<T> {
        let count = self.buffer.len().min(max);
        self.buffer.drain(..count).collect()
    }

    /// Rendezvous only: gives `value` straight to the first parked receiver.
    pub fn hand_off(&mut self, value: T) -> Result<(), T> {
        if !self.is_rendezvous() {
            return Err(value);
        }
        self.receivers.deliver_first(value)
    }

    /// Rendezvous only: takes the value of the first sender parked with one.
    pub fn take_offer(&mut self) -> Option<T> {
        if !self.is_rendezvous() {
            return None;
        }
        self.senders.take_first_offer()
    }

    /// Whether a blocking send would complete right now, either into the
    /// buffer or by handoff to a parked receiver.
    pub fn can_accept(&self) -> bool {
        !self.is_full() || (self.is_rendezvous() && !self.receivers.is_empty())
    }

    /// Wakes every parked sender and receiver. Returns how many were woken.
    pub fn wake_all(&self) -> usize {
        self.senders.wake_all() + self.receivers.wake_all()
    }
}
