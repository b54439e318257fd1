use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// What a parked task leaves on its wait entry and what it finds there when
/// it resumes.
///
/// Receivers park with `Empty` and may come back with `Delivered`. Senders
/// park with `Offered` and come back with `Taken` when a rendezvous receiver
/// took the value, or with the same `Offered` value when they were only
/// woken and have to retry.
#[derive(Debug, PartialEq, Eq)]
pub enum Parcel<T> {
    Empty,
    Offered(T),
    Delivered(T),
    Taken,
}

type ParcelSlot<T> = Rc<RefCell<Parcel<T>>>;

struct WaitEntry<T> {
    key: u64,
    // None until the parked future is first polled.
    waker: Option<Waker>,
    parcel: ParcelSlot<T>,
}

struct WaitQueueInner<T> {
    entries: VecDeque<WaitEntry<T>>,
    next_key: u64,
}

/// FIFO queue of tasks suspended for the same reason.
///
/// Entries reference tasks by their [`Waker`] only; the queue never owns a
/// task. Cloning the queue shares it, which is how a parked task keeps
/// access to its entry after the owning channel is gone.
pub struct WaitQueue<T> {
    inner: Rc<RefCell<WaitQueueInner<T>>>,
}

impl<T> Clone for WaitQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for WaitQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        let keys: Vec<u64> = inner.entries.iter().map(|entry| entry.key).collect();
        f.debug_struct("WaitQueue").field("waiting", &keys).finish()
    }
}

impl<T> WaitQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(WaitQueueInner {
                entries: VecDeque::new(),
                next_key: 0,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().entries.is_empty()
    }

    /// Enqueues the calling task at the tail. The task suspends when the
    /// returned future is awaited and resumes once it has been woken.
    pub fn park(&self, parcel: Parcel<T>) -> Parked<T> {
        let parcel = Rc::new(RefCell::new(parcel));
        let key = {
            let mut inner = self.inner.borrow_mut();
            let key = inner.next_key;
            inner.next_key += 1;
            inner.entries.push_back(WaitEntry {
                key,
                waker: None,
                parcel: parcel.clone(),
            });
            key
        };
        log::trace!("park: entry {key} queued");

        Parked {
            queue: self.clone(),
            key,
            parcel,
            resumed: false,
        }
    }

    /// Dequeues the first entry and makes its task ready. Returns false when
    /// nobody was waiting.
    pub fn wake_first(&self) -> bool {
        let entry = self.inner.borrow_mut().entries.pop_front();
        match entry {
            Some(entry) => {
                Self::resume(entry);
                true
            }
            None => false,
        }
    }

    /// Dequeues and wakes every entry. Returns how many were woken.
    pub fn wake_all(&self) -> usize {
        let entries = mem::take(&mut self.inner.borrow_mut().entries);
        let count = entries.len();
        entries.into_iter().for_each(Self::resume);
        count
    }

    /// Takes the value offered by the first sender that has one, marks that
    /// sender's parcel `Taken` and wakes it.
    pub(crate) fn take_first_offer(&self) -> Option<T> {
        let (entry, value) = {
            let mut inner = self.inner.borrow_mut();
            let position = inner
                .entries
                .iter()
                .position(|entry| matches!(*entry.parcel.borrow(), Parcel::Offered(_)))?;
            let entry = inner.entries.remove(position)?;
            let value = match mem::replace(&mut *entry.parcel.borrow_mut(), Parcel::Taken) {
                Parcel::Offered(value) => value,
                _ => unreachable!("entry was selected for its offer"),
            };
            (entry, value)
        };
        Self::resume(entry);
        Some(value)
    }

    /// Gives `value` to the first entry still waiting with an empty parcel
    /// and wakes it. Hands the value back when there is no such entry.
    pub(crate) fn deliver_first(&self, value: T) -> Result<(), T> {
        let entry = {
            let mut inner = self.inner.borrow_mut();
            let position = inner
                .entries
                .iter()
                .position(|entry| matches!(*entry.parcel.borrow(), Parcel::Empty));
            match position.and_then(|position| inner.entries.remove(position)) {
                Some(entry) => entry,
                None => return Err(value),
            }
        };
        *entry.parcel.borrow_mut() = Parcel::Delivered(value);
        Self::resume(entry);
        Ok(())
    }

    fn resume(entry: WaitEntry<T>) {
        log::trace!("wake: entry {}", entry.key);
        if let Some(waker) = entry.waker {
            waker.wake();
        }
    }

    /// Refreshes the waker of a queued entry. False means the entry is gone,
    /// i.e. the task has been woken.
    fn register_waker(&self, key: u64, waker: &Waker) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.entries.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => {
                match &entry.waker {
                    Some(current) if current.will_wake(waker) => {}
                    _ => entry.waker = Some(waker.clone()),
                }
                true
            }
            None => false,
        }
    }

    fn remove(&self, key: u64) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.entries.iter().position(|entry| entry.key == key) {
            Some(position) => {
                inner.entries.remove(position);
                true
            }
            None => false,
        }
    }
}

/// A task parked on a [`WaitQueue`]. Resolves to the entry's parcel once the
/// entry has been woken.
///
/// Being woken is only a hint: callers retry their operation unless the
/// parcel says the transfer already happened.
#[must_use = "a parked task only suspends when awaited"]
pub struct Parked<T> {
    queue: WaitQueue<T>,
    key: u64,
    parcel: ParcelSlot<T>,
    resumed: bool,
}

impl<T> Future for Parked<T> {
    type Output = Parcel<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.resumed && this.queue.register_waker(this.key, cx.waker()) {
            return Poll::Pending;
        }
        this.resumed = true;
        Poll::Ready(mem::replace(&mut *this.parcel.borrow_mut(), Parcel::Empty))
    }
}

impl<T> Drop for Parked<T> {
    fn drop(&mut self) {
        if self.resumed || self.queue.remove(self.key) {
            return;
        }

        // Woken but never resumed. Pass the wakeup on so it is not lost.
        let delivered = matches!(*self.parcel.borrow(), Parcel::Delivered(_));
        if delivered {
            log::warn!(
                "parked entry {} dropped after a value was delivered to it, value discarded",
                self.key
            );
        } else if !matches!(*self.parcel.borrow(), Parcel::Taken) {
            self.queue.wake_first();
        }
    }
}
