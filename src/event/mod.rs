//! Deferred-completion primitives consumed by the operation graph.
//!
//! The graph core never blocks inside a lifecycle stage; it subscribes
//! callbacks on [`Event`]s and advances the pipeline when they fire. The
//! primitives here are the in-process realization of that contract:
//!
//! - [`Event`]: one-shot, awaitable, may carry poison
//! - [`UserEvent`]: an event the owner triggers explicitly
//! - [`Reservation`]: mutual exclusion with FIFO waiters
//! - [`Future`]: a single-assignment value cell
//! - [`FutureMap`]: per-point futures aggregated across a domain
//! - [`DynamicCollective`]: a value cell that completes after a fixed
//!   number of arrivals
//!
//! Poison marks an event whose producer was quashed; it propagates through
//! [`Event::merge`] and future ready-events so downstream consumers can
//! observe the failure without a side channel.

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::types::DomainPoint;

type Callback = Box<dyn FnOnce(bool) + Send>;

#[derive(Default)]
struct EventState {
    fired: bool,
    poisoned: bool,
    callbacks: Vec<Callback>,
}

struct EventInner {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl EventInner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EventState::default()),
            cond: Condvar::new(),
        })
    }

    fn fire(&self, poison: bool) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.fired {
                debug_assert!(false, "event fired twice");
                return;
            }
            state.fired = true;
            state.poisoned = poison;
            std::mem::take(&mut state.callbacks)
        };
        self.cond.notify_all();
        // Callbacks run outside the lock so they may re-enter the event
        // system freely.
        for cb in callbacks {
            cb(poison);
        }
    }
}

/// A one-shot completion event.
///
/// Cloning an event clones the handle, not the state: all clones observe
/// the same single firing. An event constructed with [`Event::completed`]
/// has already fired without poison.
#[derive(Clone)]
pub struct Event {
    inner: Option<Arc<EventInner>>,
}

impl Event {
    /// Returns an event that has already triggered, without poison.
    #[must_use]
    pub const fn completed() -> Self {
        Self { inner: None }
    }

    /// Returns true if the event has fired.
    #[must_use]
    pub fn has_triggered(&self) -> bool {
        match &self.inner {
            None => true,
            Some(inner) => inner.state.lock().fired,
        }
    }

    /// Returns true if the event fired with poison.
    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        match &self.inner {
            None => false,
            Some(inner) => {
                let state = inner.state.lock();
                state.fired && state.poisoned
            }
        }
    }

    /// Blocks until the event fires; returns true if it fired poisoned.
    pub fn wait(&self) -> bool {
        match &self.inner {
            None => false,
            Some(inner) => {
                let mut state = inner.state.lock();
                while !state.fired {
                    inner.cond.wait(&mut state);
                }
                state.poisoned
            }
        }
    }

    /// Runs `callback` when the event fires (immediately if it already
    /// has). The callback receives the poison flag.
    pub fn subscribe(&self, callback: impl FnOnce(bool) + Send + 'static) {
        match &self.inner {
            None => callback(false),
            Some(inner) => {
                let run_now = {
                    let mut state = inner.state.lock();
                    if state.fired {
                        Some(state.poisoned)
                    } else {
                        state.callbacks.push(Box::new(callback));
                        return;
                    }
                };
                if let Some(poison) = run_now {
                    callback(poison);
                }
            }
        }
    }

    /// Returns an event that fires once every input has fired; poisoned if
    /// any input was poisoned. An empty input set yields a completed event.
    #[must_use]
    pub fn merge<I: IntoIterator<Item = Event>>(events: I) -> Event {
        let pending: SmallVec<[Event; 8]> = events
            .into_iter()
            .filter(|e| e.inner.is_some())
            .collect();
        if pending.is_empty() {
            return Event::completed();
        }
        let result = UserEvent::new();
        let remaining = Arc::new(Mutex::new((pending.len(), false)));
        for event in pending {
            let remaining = Arc::clone(&remaining);
            let result = result.clone();
            event.subscribe(move |poison| {
                let fire = {
                    let mut guard = remaining.lock();
                    guard.0 -= 1;
                    guard.1 |= poison;
                    (guard.0 == 0).then_some(guard.1)
                };
                if let Some(poisoned) = fire {
                    if poisoned {
                        result.trigger_poisoned();
                    } else {
                        result.trigger();
                    }
                }
            });
        }
        result.event()
    }
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.inner {
            None => f.write_str("Event(completed)"),
            Some(inner) => {
                let state = inner.state.lock();
                write!(
                    f,
                    "Event(fired={}, poisoned={})",
                    state.fired, state.poisoned
                )
            }
        }
    }
}

/// A user-settable event.
///
/// The holder triggers it exactly once, normally or with poison.
#[derive(Clone)]
pub struct UserEvent {
    inner: Arc<EventInner>,
}

impl UserEvent {
    /// Creates a fresh, untriggered user event.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: EventInner::new(),
        }
    }

    /// Returns the awaitable side of this event.
    #[must_use]
    pub fn event(&self) -> Event {
        Event {
            inner: Some(Arc::clone(&self.inner)),
        }
    }

    /// Returns true if the event has fired.
    #[must_use]
    pub fn has_triggered(&self) -> bool {
        self.inner.state.lock().fired
    }

    /// Fires the event.
    pub fn trigger(&self) {
        self.inner.fire(false);
    }

    /// Fires the event with the poison marker set.
    pub fn trigger_poisoned(&self) {
        self.inner.fire(true);
    }
}

impl Default for UserEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for UserEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "User{:?}", self.event())
    }
}

#[derive(Default)]
struct ReservationState {
    held: bool,
    waiters: VecDeque<UserEvent>,
}

/// Mutual exclusion with a FIFO waiter list.
///
/// `acquire` returns an event that fires when the caller holds the
/// reservation; `release` grants the next waiter in order.
#[derive(Clone, Default)]
pub struct Reservation {
    state: Arc<Mutex<ReservationState>>,
}

impl Reservation {
    /// Creates an unheld reservation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the reservation. The returned event fires when granted.
    #[must_use]
    pub fn acquire(&self) -> Event {
        let mut state = self.state.lock();
        if state.held {
            let grant = UserEvent::new();
            let event = grant.event();
            state.waiters.push_back(grant);
            event
        } else {
            state.held = true;
            Event::completed()
        }
    }

    /// Releases the reservation, granting the next waiter if any.
    pub fn release(&self) {
        let next = {
            let mut state = self.state.lock();
            debug_assert!(state.held, "release without acquire");
            match state.waiters.pop_front() {
                Some(grant) => Some(grant),
                None => {
                    state.held = false;
                    None
                }
            }
        };
        if let Some(grant) = next {
            grant.trigger();
        }
    }
}

impl core::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "Reservation(held={}, waiters={})",
            state.held,
            state.waiters.len()
        )
    }
}

#[derive(Default)]
struct FutureState {
    value: Option<Arc<[u8]>>,
    failed: bool,
}

struct FutureInner {
    state: Mutex<FutureState>,
    ready: UserEvent,
}

/// A single-assignment value cell.
///
/// The producer sets the result (or a failure) exactly once; consumers
/// observe the ready event and then read the value.
#[derive(Clone)]
pub struct Future {
    inner: Arc<FutureInner>,
}

impl Future {
    /// Creates an unresolved future.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FutureInner {
                state: Mutex::new(FutureState::default()),
                ready: UserEvent::new(),
            }),
        }
    }

    /// Creates a future already resolved to `value`.
    #[must_use]
    pub fn resolved(value: &[u8]) -> Self {
        let future = Self::new();
        future.set_result(value);
        future
    }

    /// The event that fires when the future resolves. Poisoned on failure.
    #[must_use]
    pub fn ready_event(&self) -> Event {
        self.inner.ready.event()
    }

    /// Returns true if the future has resolved (value or failure).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.has_triggered()
    }

    /// Assigns the result value. Must be called at most once.
    pub fn set_result(&self, value: &[u8]) {
        {
            let mut state = self.inner.state.lock();
            debug_assert!(
                state.value.is_none() && !state.failed,
                "future assigned twice"
            );
            state.value = Some(Arc::from(value));
        }
        self.inner.ready.trigger();
    }

    /// Marks the future failed; the ready event fires poisoned.
    pub fn set_failed(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.value.is_some() || state.failed {
                return;
            }
            state.failed = true;
        }
        self.inner.ready.trigger_poisoned();
    }

    /// Returns the resolved value, if the future resolved successfully.
    #[must_use]
    pub fn get(&self) -> Option<Arc<[u8]>> {
        self.inner.state.lock().value.clone()
    }

    /// Returns true if the future resolved as a failure.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.inner.state.lock().failed
    }

    /// Interprets the resolved value as a boolean: any non-zero first byte
    /// is true; an empty or missing value is false.
    #[must_use]
    pub fn get_bool(&self) -> bool {
        self.get().is_some_and(|v| v.first().is_some_and(|b| *b != 0))
    }
}

impl Default for Future {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Future {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.inner.state.lock();
        write!(
            f,
            "Future(ready={}, failed={})",
            state.value.is_some() || state.failed,
            state.failed
        )
    }
}

/// Per-point futures aggregated across a domain.
///
/// Produced by must-epoch launches: one future per member point, plus a
/// completion event for the whole map.
#[derive(Clone)]
pub struct FutureMap {
    futures: Arc<Mutex<BTreeMap<DomainPoint, Future>>>,
    completion: Event,
}

impl FutureMap {
    /// Creates a future map whose overall completion is `completion`.
    #[must_use]
    pub fn new(completion: Event) -> Self {
        Self {
            futures: Arc::new(Mutex::new(BTreeMap::new())),
            completion,
        }
    }

    /// Returns the future for `point`, creating it on first request.
    #[must_use]
    pub fn get_future(&self, point: DomainPoint) -> Future {
        self.futures
            .lock()
            .entry(point)
            .or_insert_with(Future::new)
            .clone()
    }

    /// The event that fires when every member has completed.
    #[must_use]
    pub fn completion_event(&self) -> Event {
        self.completion.clone()
    }

    /// Blocks until the whole map completes; returns the poison flag.
    pub fn wait_all_results(&self) -> bool {
        self.completion.wait()
    }

    /// Number of points with a materialized future.
    #[must_use]
    pub fn len(&self) -> usize {
        self.futures.lock().len()
    }

    /// Returns true if no future has been requested or set yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.futures.lock().is_empty()
    }
}

impl core::fmt::Debug for FutureMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FutureMap(len={})", self.len())
    }
}

struct CollectiveState {
    remaining: u64,
    sum: i64,
}

/// A value cell that completes after a fixed number of arrivals.
///
/// Contributions are summed; the ready event fires when the arrival count
/// reaches zero.
#[derive(Clone)]
pub struct DynamicCollective {
    state: Arc<Mutex<CollectiveState>>,
    ready: UserEvent,
}

impl DynamicCollective {
    /// Creates a collective expecting `arrivals` contributions.
    #[must_use]
    pub fn new(arrivals: u64) -> Self {
        let ready = UserEvent::new();
        if arrivals == 0 {
            ready.trigger();
        }
        Self {
            state: Arc::new(Mutex::new(CollectiveState {
                remaining: arrivals,
                sum: 0,
            })),
            ready,
        }
    }

    /// Contributes one arrival with the given value.
    pub fn arrive(&self, value: i64) {
        let fire = {
            let mut state = self.state.lock();
            debug_assert!(state.remaining > 0, "arrival after completion");
            if state.remaining == 0 {
                return;
            }
            state.sum += value;
            state.remaining -= 1;
            state.remaining == 0
        };
        if fire {
            self.ready.trigger();
        }
    }

    /// The event that fires once all arrivals are in.
    #[must_use]
    pub fn ready_event(&self) -> Event {
        self.ready.event()
    }

    /// The summed value; meaningful once the ready event has fired.
    #[must_use]
    pub fn value(&self) -> i64 {
        self.state.lock().sum
    }
}

impl core::fmt::Debug for DynamicCollective {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "DynamicCollective(remaining={}, sum={})",
            state.remaining, state.sum
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn completed_event_is_triggered() {
        let event = Event::completed();
        assert!(event.has_triggered());
        assert!(!event.is_poisoned());
        assert!(!event.wait());
    }

    #[test]
    fn user_event_fires_once() {
        let user = UserEvent::new();
        let event = user.event();
        assert!(!event.has_triggered());
        user.trigger();
        assert!(event.has_triggered());
        assert!(!event.is_poisoned());
    }

    #[test]
    fn poison_is_observable() {
        let user = UserEvent::new();
        let event = user.event();
        user.trigger_poisoned();
        assert!(event.has_triggered());
        assert!(event.is_poisoned());
        assert!(event.wait());
    }

    #[test]
    fn subscribe_before_and_after_fire() {
        let user = UserEvent::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        user.event().subscribe(move |poison| {
            assert!(!poison);
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);

        user.trigger();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = Arc::clone(&count);
        user.event().subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn merge_waits_for_all() {
        let a = UserEvent::new();
        let b = UserEvent::new();
        let merged = Event::merge([a.event(), b.event()]);
        assert!(!merged.has_triggered());
        a.trigger();
        assert!(!merged.has_triggered());
        b.trigger();
        assert!(merged.has_triggered());
        assert!(!merged.is_poisoned());
    }

    #[test]
    fn merge_propagates_poison() {
        let a = UserEvent::new();
        let b = UserEvent::new();
        let merged = Event::merge([a.event(), b.event()]);
        a.trigger_poisoned();
        b.trigger();
        assert!(merged.is_poisoned());
    }

    #[test]
    fn merge_of_nothing_is_completed() {
        let merged = Event::merge(std::iter::empty());
        assert!(merged.has_triggered());
    }

    #[test]
    fn reservation_grants_in_fifo_order() {
        let res = Reservation::new();
        let first = res.acquire();
        assert!(first.has_triggered());

        let second = res.acquire();
        let third = res.acquire();
        assert!(!second.has_triggered());
        assert!(!third.has_triggered());

        res.release();
        assert!(second.has_triggered());
        assert!(!third.has_triggered());

        res.release();
        assert!(third.has_triggered());
        res.release();

        // Fully released; a fresh acquire is immediate.
        assert!(res.acquire().has_triggered());
    }

    #[test]
    fn future_single_assignment() {
        let future = Future::new();
        assert!(!future.is_ready());
        future.set_result(&[1, 2, 3]);
        assert!(future.is_ready());
        assert_eq!(future.get().unwrap().as_ref(), &[1, 2, 3]);
        assert!(!future.ready_event().is_poisoned());
    }

    #[test]
    fn future_failure_poisons_ready_event() {
        let future = Future::new();
        future.set_failed();
        assert!(future.is_ready());
        assert!(future.is_failed());
        assert!(future.get().is_none());
        assert!(future.ready_event().is_poisoned());
    }

    #[test]
    fn future_bool_interpretation() {
        assert!(Future::resolved(&[1]).get_bool());
        assert!(!Future::resolved(&[0]).get_bool());
        assert!(!Future::resolved(&[]).get_bool());
        assert!(!Future::new().get_bool());
    }

    #[test]
    fn future_map_creates_lazily() {
        let done = UserEvent::new();
        let map = FutureMap::new(done.event());
        assert!(map.is_empty());
        let f1 = map.get_future(DomainPoint::one_dim(0));
        let f2 = map.get_future(DomainPoint::one_dim(0));
        f1.set_result(&[9]);
        assert_eq!(f2.get().unwrap().as_ref(), &[9]);
        assert_eq!(map.len(), 1);
        done.trigger();
        assert!(!map.wait_all_results());
    }

    #[test]
    fn collective_sums_arrivals() {
        let dc = DynamicCollective::new(3);
        assert!(!dc.ready_event().has_triggered());
        dc.arrive(5);
        dc.arrive(-2);
        assert!(!dc.ready_event().has_triggered());
        dc.arrive(4);
        assert!(dc.ready_event().has_triggered());
        assert_eq!(dc.value(), 7);
    }

    #[test]
    fn collective_with_zero_arrivals_is_ready() {
        let dc = DynamicCollective::new(0);
        assert!(dc.ready_event().has_triggered());
        assert_eq!(dc.value(), 0);
    }
}
