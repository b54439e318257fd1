// Registry of bounded channels shared by cooperatively scheduled tasks.
//
// Everything here runs on one thread. Mutations happen between suspension
// points, so RefCell borrows are never held across an await and no lock is
// needed. Blocking operations are async: parking on a wait queue returns
// Pending to the executor, and a wake makes the task ready again.

use std::cell::{Cell, RefCell};

use crate::config::BusConfig;
use crate::error::{BusError, BusResult};
use crate::telemetry::BusStats;

use super::channel::Channel;
use super::channel_handle::ChannelHandle;
use super::wait_queue::{Parcel, Parked};

type Slots<T> = Vec<Option<Channel<T>>>;

enum SendStep<T> {
    Delivered,
    Parked(Parked<T>),
}

enum RecvStep<T> {
    Taken(T),
    Parked(Parked<T>),
}

enum BroadcastStall {
    NoChannel,
    Full(ChannelHandle, u64),
}

fn lookup<T>(
    slots: &Slots<T>,
    handle: ChannelHandle,
    generation: Option<u64>,
) -> Option<&Channel<T>> {
    slots
        .get(handle.id)?
        .as_ref()
        .filter(|channel| generation.map_or(true, |g| channel.generation() == g))
}

fn lookup_mut<T>(
    slots: &mut Slots<T>,
    handle: ChannelHandle,
    generation: Option<u64>,
) -> Option<&mut Channel<T>> {
    slots
        .get_mut(handle.id)?
        .as_mut()
        .filter(|channel| generation.map_or(true, |g| channel.generation() == g))
}

/// A registry of bounded channels addressed by small integer handles.
///
/// Share it between tasks with `Rc<Bus<T>>`. Non-blocking operations
/// (`try_*`) return immediately; blocking operations are `async` and suspend
/// the calling task on the channel's wait queue until they can finish or
/// the channel is closed.
///
/// Every failure is returned as a [`BusError`] and also recorded in the
/// scheduler-wide slot read by [`last_error`](crate::last_error).
#[derive(Debug)]
pub struct Bus<T = u32> {
    config: BusConfig,
    channels: RefCell<Slots<T>>,
    next_generation: Cell<u64>,
    stats: RefCell<BusStats>,
}

impl<T> Default for Bus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Bus<T> {
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self {
            channels: RefCell::new(Vec::with_capacity(config.initial_slots)),
            next_generation: Cell::new(0),
            stats: RefCell::new(BusStats::default()),
            config,
        }
    }

    pub fn stats(&self) -> BusStats {
        self.stats.borrow().clone()
    }

    fn note(&self, update: impl FnOnce(&mut BusStats)) {
        if self.config.telemetry {
            update(&mut self.stats.borrow_mut());
        }
    }

    fn fail(&self, err: BusError) -> BusError {
        self.note(|stats| stats.record_error(err));
        err.raise()
    }

    fn ensure(&self, enabled: bool) -> BusResult<()> {
        if enabled {
            Ok(())
        } else {
            Err(self.fail(BusError::NotImplemented))
        }
    }

    // === Lifecycle ===

    /// Opens a channel holding at most `capacity` values and returns its
    /// handle. The lowest free slot is reused before the registry grows.
    ///
    /// Capacity 0 makes a rendezvous channel: non-blocking operations on it
    /// always report `WouldBlock`, and blocking ones complete only when a
    /// complementary blocking call is waiting.
    pub fn open(&self, capacity: usize) -> ChannelHandle {
        let generation = self.next_generation.get();
        self.next_generation.set(generation + 1);
        let channel = Channel::new(capacity, generation);

        let id = {
            let mut channels = self.channels.borrow_mut();
            match channels.iter().position(Option::is_none) {
                Some(id) => {
                    channels[id] = Some(channel);
                    id
                }
                None => {
                    channels.push(Some(channel));
                    channels.len() - 1
                }
            }
        };

        self.note(|stats| stats.channels_opened += 1);
        log::debug!("open: channel #{id} capacity={capacity} generation={generation}");
        ChannelHandle::new(id)
    }

    /// Closes the channel, waking every task parked on it. Those tasks
    /// return `NoChannel`. Buffered values are dropped. Unknown handles are
    /// ignored.
    pub fn close(&self, handle: ChannelHandle) {
        let channel = match self.channels.borrow_mut().get_mut(handle.id) {
            Some(slot) => slot.take(),
            None => None,
        };
        let Some(channel) = channel else {
            return;
        };

        // The slot is already free, so every woken retry fails its lookup.
        let woken = channel.wake_all();
        self.note(|stats| {
            stats.channels_closed += 1;
            stats.wakeups += woken as u64;
        });
        log::debug!(
            "close: channel {handle} woke {woken} waiters, discarded {} values",
            channel.len()
        );
    }

    /// Closes every channel and releases the registry. Calling it again, or
    /// after closing some handles by hand, is harmless.
    pub fn delete(&self) {
        let slots = self.channels.borrow().len();
        for id in 0..slots {
            self.close(ChannelHandle::new(id));
        }

        let mut channels = self.channels.borrow_mut();
        channels.clear();
        channels.shrink_to_fit();
        if slots > 0 {
            log::debug!("delete: released {slots} slots");
        }
    }

    // === Inspection ===

    fn with_channel<R>(&self, handle: ChannelHandle, f: impl FnOnce(&Channel<T>) -> R) -> Option<R> {
        lookup(&self.channels.borrow(), handle, None).map(f)
    }

    pub fn is_open(&self, handle: ChannelHandle) -> bool {
        self.with_channel(handle, |_| ()).is_some()
    }

    pub fn capacity(&self, handle: ChannelHandle) -> Option<usize> {
        self.with_channel(handle, Channel::capacity)
    }

    /// Number of values buffered in the channel.
    pub fn len(&self, handle: ChannelHandle) -> Option<usize> {
        self.with_channel(handle, Channel::len)
    }

    pub fn waiting_senders(&self, handle: ChannelHandle) -> Option<usize> {
        self.with_channel(handle, |channel| channel.senders().len())
    }

    pub fn waiting_receivers(&self, handle: ChannelHandle) -> Option<usize> {
        self.with_channel(handle, |channel| channel.receivers().len())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.borrow().iter().flatten().count()
    }

    pub fn handles(&self) -> Vec<ChannelHandle> {
        self.channels
            .borrow()
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(id, _)| ChannelHandle::new(id))
            .collect()
    }

    fn generation_of(&self, handle: ChannelHandle) -> BusResult<u64> {
        let generation = lookup(&self.channels.borrow(), handle, None).map(Channel::generation);
        generation.ok_or_else(|| self.fail(BusError::NoChannel))
    }

    // === Single values ===

    /// Appends `value` to the channel without blocking and wakes the first
    /// parked receiver.
    ///
    /// # Errors
    ///
    /// * `NoChannel` if the handle is not open
    /// * `WouldBlock` if the buffer is full (always, for capacity 0)
    pub fn try_send(&self, handle: ChannelHandle, value: T) -> BusResult<()> {
        self.push(handle, None, value).map_err(|(err, _)| err)
    }

    /// Takes the head of the channel without blocking and wakes the first
    /// parked sender.
    ///
    /// # Errors
    ///
    /// * `NoChannel` if the handle is not open
    /// * `WouldBlock` if the buffer is empty (always, for capacity 0)
    pub fn try_recv(&self, handle: ChannelHandle) -> BusResult<T> {
        self.pop(handle, None)
    }

    /// Sends `value`, suspending the calling task while the channel is full.
    ///
    /// A wakeup is only a hint, so the send is retried after every resume and
    /// may park again. The channel is pinned when the call starts: if it is
    /// closed, even if the handle is reopened meanwhile, the call fails.
    ///
    /// # Errors
    ///
    /// * `NoChannel` if the channel is not open or closes while waiting
    pub async fn send(&self, handle: ChannelHandle, value: T) -> BusResult<()> {
        let generation = self.generation_of(handle)?;
        let mut value = value;
        loop {
            value = match self.push(handle, Some(generation), value) {
                Ok(()) => return Ok(()),
                Err((BusError::WouldBlock, value)) => value,
                Err((err, _)) => return Err(err),
            };

            let parked = match self.park_sender(handle, generation, value)? {
                SendStep::Delivered => return Ok(()),
                SendStep::Parked(parked) => parked,
            };

            value = match parked.await {
                Parcel::Taken => return Ok(()),
                Parcel::Offered(value) => value,
                Parcel::Empty | Parcel::Delivered(_) => {
                    unreachable!("sender parcels only ever hold an offer")
                }
            };
            log::trace!("send: retrying on channel {handle}");
        }
    }

    /// Receives the head of the channel, suspending the calling task while
    /// it is empty.
    ///
    /// # Errors
    ///
    /// * `NoChannel` if the channel is not open or closes while waiting
    pub async fn recv(&self, handle: ChannelHandle) -> BusResult<T> {
        let generation = self.generation_of(handle)?;
        loop {
            match self.pop(handle, Some(generation)) {
                Err(BusError::WouldBlock) => {}
                result => return result,
            }

            let parked = match self.park_receiver(handle, generation)? {
                RecvStep::Taken(value) => return Ok(value),
                RecvStep::Parked(parked) => parked,
            };

            if let Parcel::Delivered(value) = parked.await {
                return Ok(value);
            }
            log::trace!("recv: retrying on channel {handle}");
        }
    }

    fn push(
        &self,
        handle: ChannelHandle,
        generation: Option<u64>,
        value: T,
    ) -> Result<(), (BusError, T)> {
        let woke = {
            let mut channels = self.channels.borrow_mut();
            let Some(channel) = lookup_mut(&mut channels, handle, generation) else {
                return Err((self.fail(BusError::NoChannel), value));
            };
            if let Err(value) = channel.try_push(value) {
                return Err((self.fail(BusError::WouldBlock), value));
            }
            channel.receivers().wake_first()
        };

        self.note(|stats| {
            stats.values_sent += 1;
            stats.wakeups += u64::from(woke);
        });
        Ok(())
    }

    fn pop(&self, handle: ChannelHandle, generation: Option<u64>) -> BusResult<T> {
        let (value, woke) = {
            let mut channels = self.channels.borrow_mut();
            let channel = lookup_mut(&mut channels, handle, generation)
                .ok_or_else(|| self.fail(BusError::NoChannel))?;
            let value = channel
                .try_pop()
                .ok_or_else(|| self.fail(BusError::WouldBlock))?;
            (value, channel.senders().wake_first())
        };

        self.note(|stats| {
            stats.values_received += 1;
            stats.wakeups += u64::from(woke);
        });
        Ok(value)
    }

    /// Called after a failed push: hands the value to a parked rendezvous
    /// receiver, or parks the sender with the value on offer.
    fn park_sender(
        &self,
        handle: ChannelHandle,
        generation: u64,
        value: T,
    ) -> BusResult<SendStep<T>> {
        let mut channels = self.channels.borrow_mut();
        let channel = lookup_mut(&mut channels, handle, Some(generation))
            .ok_or_else(|| self.fail(BusError::NoChannel))?;

        match channel.hand_off(value) {
            Ok(()) => {
                drop(channels);
                self.note(|stats| {
                    stats.values_sent += 1;
                    stats.wakeups += 1;
                });
                log::trace!("send: handed off on channel {handle}");
                Ok(SendStep::Delivered)
            }
            Err(value) => {
                let parked = channel.senders().park(Parcel::Offered(value));
                drop(channels);
                self.note(|stats| stats.suspensions += 1);
                log::trace!("send: parked on channel {handle}");
                Ok(SendStep::Parked(parked))
            }
        }
    }

    /// Called after a failed pop: takes a value offered by a parked
    /// rendezvous sender, or parks the receiver.
    fn park_receiver(&self, handle: ChannelHandle, generation: u64) -> BusResult<RecvStep<T>> {
        let mut channels = self.channels.borrow_mut();
        let channel = lookup_mut(&mut channels, handle, Some(generation))
            .ok_or_else(|| self.fail(BusError::NoChannel))?;

        if let Some(value) = channel.take_offer() {
            drop(channels);
            self.note(|stats| {
                stats.values_received += 1;
                stats.wakeups += 1;
            });
            log::trace!("recv: took offer on channel {handle}");
            return Ok(RecvStep::Taken(value));
        }

        // A receiver waiting on a rendezvous channel is room for a parked
        // broadcaster, which has no offer to take. A broadcaster that then
        // stalls elsewhere passes this wakeup on (see `pass_on_wakeup`).
        let woke = channel.is_rendezvous() && channel.senders().wake_first();
        let parked = channel.receivers().park(Parcel::Empty);
        drop(channels);

        self.note(|stats| {
            stats.suspensions += 1;
            stats.wakeups += u64::from(woke);
        });
        log::trace!("recv: parked on channel {handle}");
        Ok(RecvStep::Parked(parked))
    }

    // === Batches ===

    /// Sends the longest prefix of `values` that fits, at least one value,
    /// and returns how many were sent. An empty slice sends nothing.
    ///
    /// # Errors
    ///
    /// * `NotImplemented` if batches are disabled in the config
    /// * `NoChannel` if the handle is not open
    /// * `WouldBlock` if the buffer is full
    pub fn try_send_v(&self, handle: ChannelHandle, values: &[T]) -> BusResult<usize>
    where
        T: Clone,
    {
        self.ensure(self.config.batch)?;
        self.push_many(handle, None, values)
    }

    /// Like [`try_send_v`](Self::try_send_v) but waits until at least one
    /// value can be sent.
    ///
    /// # Errors
    ///
    /// * `NotImplemented` if batches are disabled in the config
    /// * `NoChannel` if the channel is not open or closes while waiting
    pub async fn send_v(&self, handle: ChannelHandle, values: &[T]) -> BusResult<usize>
    where
        T: Clone,
    {
        self.ensure(self.config.batch)?;
        let generation = self.generation_of(handle)?;
        loop {
            match self.push_many(handle, Some(generation), values) {
                Err(BusError::WouldBlock) => {}
                result => return result,
            }

            let Some(head) = values.first() else {
                return Ok(0);
            };
            // Only a rendezvous receiver can take the head from the offer.
            let parked = match self.park_sender(handle, generation, head.clone())? {
                SendStep::Delivered => return Ok(1),
                SendStep::Parked(parked) => parked,
            };
            if let Parcel::Taken = parked.await {
                return Ok(1);
            }
        }
    }

    /// Receives up to `max` values, at least one.
    ///
    /// # Errors
    ///
    /// * `NotImplemented` if batches are disabled in the config
    /// * `NoChannel` if the handle is not open
    /// * `WouldBlock` if the buffer is empty
    pub fn try_recv_v(&self, handle: ChannelHandle, max: usize) -> BusResult<Vec<T>> {
        self.ensure(self.config.batch)?;
        self.pop_many(handle, None, max)
    }

    /// Like [`try_recv_v`](Self::try_recv_v) but waits until at least one
    /// value is available.
    ///
    /// # Errors
    ///
    /// * `NotImplemented` if batches are disabled in the config
    /// * `NoChannel` if the channel is not open or closes while waiting
    pub async fn recv_v(&self, handle: ChannelHandle, max: usize) -> BusResult<Vec<T>> {
        self.ensure(self.config.batch)?;
        let generation = self.generation_of(handle)?;
        loop {
            match self.pop_many(handle, Some(generation), max) {
                Err(BusError::WouldBlock) => {}
                result => return result,
            }

            let parked = match self.park_receiver(handle, generation)? {
                RecvStep::Taken(value) => return Ok(vec![value]),
                RecvStep::Parked(parked) => parked,
            };
            if let Parcel::Delivered(value) = parked.await {
                return Ok(vec![value]);
            }
        }
    }

    fn push_many(
        &self,
        handle: ChannelHandle,
        generation: Option<u64>,
        values: &[T],
    ) -> BusResult<usize>
    where
        T: Clone,
    {
        let (count, woke) = {
            let mut channels = self.channels.borrow_mut();
            let channel = lookup_mut(&mut channels, handle, generation)
                .ok_or_else(|| self.fail(BusError::NoChannel))?;
            if values.is_empty() {
                return Ok(0);
            }

            let count = channel.push_many(values);
            if count == 0 {
                return Err(self.fail(BusError::WouldBlock));
            }

            let mut woke = 0;
            while woke < count && channel.receivers().wake_first() {
                woke += 1;
            }
            (count, woke)
        };

        self.note(|stats| {
            stats.values_sent += count as u64;
            stats.wakeups += woke as u64;
        });
        Ok(count)
    }

    fn pop_many(
        &self,
        handle: ChannelHandle,
        generation: Option<u64>,
        max: usize,
    ) -> BusResult<Vec<T>> {
        let (values, woke) = {
            let mut channels = self.channels.borrow_mut();
            let channel = lookup_mut(&mut channels, handle, generation)
                .ok_or_else(|| self.fail(BusError::NoChannel))?;
            if max == 0 {
                return Ok(Vec::new());
            }

            let values = channel.pop_many(max);
            if values.is_empty() {
                return Err(self.fail(BusError::WouldBlock));
            }

            let mut woke = 0;
            while woke < values.len() && channel.senders().wake_first() {
                woke += 1;
            }
            (values, woke)
        };

        self.note(|stats| {
            stats.values_received += values.len() as u64;
            stats.wakeups += woke as u64;
        });
        Ok(values)
    }

    // === Broadcast ===

    /// Sends a copy of `value` to every open channel, or to none of them.
    ///
    /// # Errors
    ///
    /// * `NotImplemented` if broadcast is disabled in the config
    /// * `NoChannel` if no channel is open
    /// * `WouldBlock` if any open channel is full; nothing is sent then
    pub fn try_broadcast(&self, value: T) -> BusResult<()>
    where
        T: Clone,
    {
        self.ensure(self.config.broadcast)?;
        self.broadcast_once(&value, false).map_err(|stall| match stall {
            BroadcastStall::NoChannel => self.fail(BusError::NoChannel),
            BroadcastStall::Full(..) => self.fail(BusError::WouldBlock),
        })
    }

    /// Like [`try_broadcast`](Self::try_broadcast) but waits, parked on the
    /// first channel that cannot accept, until every open channel can.
    /// Rendezvous channels accept when a receiver is waiting on them.
    ///
    /// # Errors
    ///
    /// * `NotImplemented` if broadcast is disabled in the config
    /// * `NoChannel` if no channel is open, including after the channels
    ///   it was waiting on were closed
    pub async fn broadcast(&self, value: T) -> BusResult<()>
    where
        T: Clone,
    {
        self.ensure(self.config.broadcast)?;
        let mut parked_on: Option<(ChannelHandle, u64)> = None;
        loop {
            let outcome = self.broadcast_once(&value, true);

            // The wakeup that resumed us was meant for the channel we were
            // parked on. Unless we are going back to wait there, the next
            // sender on that channel gets it.
            if let Some((previous, previous_generation)) = parked_on.take() {
                let same_channel = matches!(
                    outcome,
                    Err(BroadcastStall::Full(handle, generation))
                        if handle == previous && generation == previous_generation
                );
                if !same_channel {
                    self.pass_on_wakeup(previous, previous_generation);
                }
            }

            let (handle, generation) = match outcome {
                Ok(()) => return Ok(()),
                Err(BroadcastStall::NoChannel) => return Err(self.fail(BusError::NoChannel)),
                Err(BroadcastStall::Full(handle, generation)) => (handle, generation),
            };

            let parked = match lookup(&self.channels.borrow(), handle, Some(generation)) {
                Some(channel) => channel.senders().park(Parcel::Empty),
                None => continue,
            };
            self.note(|stats| stats.suspensions += 1);
            log::trace!("broadcast: parked on channel {handle}");
            parked.await;
            parked_on = Some((handle, generation));
        }
    }

    /// Wakes the next sender parked on the channel if it can still take a
    /// value. Covers both a freed buffer slot and a waiting rendezvous
    /// receiver.
    fn pass_on_wakeup(&self, handle: ChannelHandle, generation: u64) {
        let woke = lookup(&self.channels.borrow(), handle, Some(generation))
            .is_some_and(|channel| channel.can_accept() && channel.senders().wake_first());
        if woke {
            self.note(|stats| stats.wakeups += 1);
            log::trace!("broadcast: passed wakeup on channel {handle}");
        }
    }

    // Checks every open channel before touching any of them. Nothing
    // suspends between the check and the pushes, so no other task can
    // observe a partial broadcast.
    fn broadcast_once(&self, value: &T, handoff: bool) -> Result<(), BroadcastStall>
    where
        T: Clone,
    {
        let (sent, woke) = {
            let mut channels = self.channels.borrow_mut();
            let mut open = 0;
            for (id, slot) in channels.iter().enumerate() {
                let Some(channel) = slot else {
                    continue;
                };
                open += 1;
                let ready = if handoff {
                    channel.can_accept()
                } else {
                    !channel.is_full()
                };
                if !ready {
                    return Err(BroadcastStall::Full(
                        ChannelHandle::new(id),
                        channel.generation(),
                    ));
                }
            }
            if open == 0 {
                return Err(BroadcastStall::NoChannel);
            }

            let mut woke = 0;
            for channel in channels.iter_mut().flatten() {
                match channel.try_push(value.clone()) {
                    Ok(()) => woke += usize::from(channel.receivers().wake_first()),
                    // A receiver is parked here, checked above.
                    Err(value) => woke += usize::from(channel.hand_off(value).is_ok()),
                }
            }
            (open, woke)
        };

        self.note(|stats| {
            stats.values_sent += sent as u64;
            stats.wakeups += woke as u64;
        });
        log::trace!("broadcast: sent to {sent} channels");
        Ok(())
    }
}

impl<T> Drop for Bus<T> {
    fn drop(&mut self) {
        self.delete();
    }
}
