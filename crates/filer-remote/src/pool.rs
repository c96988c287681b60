// A bounded pool of reusable resources.
//
// Resources are created lazily up to `max_size`, validated when they are
// taken from the free list (never when they are put back), and handed
// directly to waiting callers on release. The pool state lives behind a
// plain mutex that is never held across an await point.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// The capability hooks a pool needs to manage one kind of resource
#[async_trait]
pub trait ResourceManager: Send + Sync {
    type Resource: Send;

    /// Establish a brand new resource
    async fn create(&self) -> Result<Self::Resource>;

    /// Whether an idle resource is still usable
    async fn validate(&self, resource: &Self::Resource) -> bool;

    /// Tear a resource down. Must not fail; errors are logged by the manager.
    async fn destroy(&self, resource: Self::Resource);

    /// Human readable name of whatever the resources connect to
    fn describe(&self) -> String {
        "resource".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: usize,
    /// How long `acquire` may wait for a saturated pool. `None` waits forever.
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// A point-in-time view of pool accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Live resources, idle or checked out
    pub current_size: usize,
    pub max_size: usize,
    pub idle: usize,
    /// Slots reserved by creations still in flight
    pub creating: usize,
    pub waiting: usize,
}

/// What a parked caller is woken up with
enum Handoff<R> {
    /// A released resource, still counted in `current_size`
    Resource(R),
    /// A reserved slot (already counted in `creating`) to create into
    Slot,
}

struct PoolState<R> {
    // LIFO: the most recently released resource is reused first
    free: Vec<R>,
    current_size: usize,
    creating: usize,
    waiters: VecDeque<oneshot::Sender<Handoff<R>>>,
}

impl<R> PoolState<R> {
    fn has_capacity(&self, max_size: usize) -> bool {
        self.current_size + self.creating < max_size
    }

    /// Give `handoff` to the oldest waiter still listening
    fn hand_off(&mut self, mut handoff: Handoff<R>) -> std::result::Result<(), Handoff<R>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(handoff) {
                Ok(()) => return Ok(()),
                Err(returned) => handoff = returned,
            }
        }
        Err(handoff)
    }

    fn put_back(&mut self, resource: R) {
        if let Err(Handoff::Resource(resource)) = self.hand_off(Handoff::Resource(resource)) {
            self.free.push(resource);
        }
    }

    /// A reserved slot is no longer needed by its holder
    fn give_up_slot(&mut self) {
        if self.hand_off(Handoff::Slot).is_err() {
            self.creating -= 1;
        }
    }

    /// A live resource went away, freeing its slot
    fn forget_resource(&mut self) {
        self.current_size = self.current_size.saturating_sub(1);
        self.creating += 1;
        self.give_up_slot();
    }

    fn restore(&mut self, handoff: Handoff<R>) {
        match handoff {
            Handoff::Resource(resource) => self.put_back(resource),
            Handoff::Slot => self.give_up_slot(),
        }
    }
}

enum Checkout<R> {
    Reuse(R),
    Create,
    Wait(oneshot::Receiver<Handoff<R>>),
}

/// Returns a handoff that arrived after its waiter stopped listening, so
/// timed out or cancelled acquires never leak a resource or a slot.
struct Waiter<'a, R> {
    rx: oneshot::Receiver<Handoff<R>>,
    state: &'a Mutex<PoolState<R>>,
}

impl<R> Drop for Waiter<'_, R> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(handoff) = self.rx.try_recv() {
            lock(self.state).restore(handoff);
        }
    }
}

enum Held {
    Resource,
    Slot,
}

/// Accounting owned by an acquire in progress. If the acquire is dropped
/// before settling, the resource or slot it held is returned to the pool.
struct Pending<'a, R> {
    state: &'a Mutex<PoolState<R>>,
    held: Option<Held>,
}

impl<'a, R> Pending<'a, R> {
    fn new(state: &'a Mutex<PoolState<R>>, held: Held) -> Self {
        Self {
            state,
            held: Some(held),
        }
    }

    fn settle(&mut self) {
        self.held = None;
    }
}

impl<R> Drop for Pending<'_, R> {
    fn drop(&mut self) {
        match self.held.take() {
            Some(Held::Resource) => lock(self.state).forget_resource(),
            Some(Held::Slot) => lock(self.state).give_up_slot(),
            None => {}
        }
    }
}

fn lock<R>(state: &Mutex<PoolState<R>>) -> MutexGuard<'_, PoolState<R>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Pool<M: ResourceManager> {
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Resource>>,
}

impl<M: ResourceManager> Pool<M> {
    pub fn new(manager: M, config: PoolConfig) -> Result<Self> {
        if config.max_size == 0 {
            return Err(Error::InvalidConfig(
                "Pool max size must be at least 1".to_string(),
            ));
        }

        Ok(Pool {
            manager,
            config,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                current_size: 0,
                creating: 0,
                waiters: VecDeque::new(),
            }),
        })
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn status(&self) -> PoolStatus {
        let state = lock(&self.state);
        PoolStatus {
            current_size: state.current_size,
            max_size: self.config.max_size,
            idle: state.free.len(),
            creating: state.creating,
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
        }
    }

    /// Take a resource out of the pool.
    ///
    /// Reuses the most recently released idle resource if it still validates,
    /// creates a new one while under `max_size`, and otherwise waits for a
    /// holder to release or evict one, for at most the configured acquire
    /// timeout.
    pub async fn acquire(&self) -> Result<M::Resource> {
        let checkout = {
            let mut state = lock(&self.state);
            if let Some(resource) = state.free.pop() {
                Checkout::Reuse(resource)
            } else if state.has_capacity(self.config.max_size) {
                state.creating += 1;
                Checkout::Create
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Checkout::Wait(rx)
            }
        };

        let candidate = match checkout {
            Checkout::Reuse(resource) => resource,
            Checkout::Create => return self.create_reserved().await,
            Checkout::Wait(rx) => match self.wait(rx).await? {
                Handoff::Resource(resource) => resource,
                Handoff::Slot => return self.create_reserved().await,
            },
        };

        let mut pending = Pending::new(&self.state, Held::Resource);
        if self.manager.validate(&candidate).await {
            pending.settle();
            return Ok(candidate);
        }

        tracing::debug!(
            "Discarding dead connection to {}",
            self.manager.describe()
        );
        self.manager.destroy(candidate).await;
        pending.settle();
        {
            // Keep the dead resource's slot for its replacement
            let mut state = lock(&self.state);
            state.current_size -= 1;
            state.creating += 1;
        }
        self.create_reserved().await
    }

    /// Return a checked out resource for reuse. It is validated lazily on the
    /// next `acquire`, not here.
    pub fn release(&self, resource: M::Resource) {
        lock(&self.state).put_back(resource);
    }

    /// Destroy a checked out resource the caller found unusable and free its
    /// slot.
    pub async fn evict(&self, resource: M::Resource) {
        self.manager.destroy(resource).await;
        lock(&self.state).forget_resource();
    }

    /// Destroy every idle resource. Checked out resources are unaffected.
    pub async fn close(&self) {
        let idle = {
            let mut state = lock(&self.state);
            let idle = std::mem::take(&mut state.free);
            state.current_size -= idle.len();
            idle
        };

        for resource in idle {
            self.manager.destroy(resource).await;
        }

        // Any waiter can now create into the freed capacity
        let mut state = lock(&self.state);
        while state.has_capacity(self.config.max_size) {
            state.creating += 1;
            if state.hand_off(Handoff::Slot).is_err() {
                state.creating -= 1;
                break;
            }
        }
    }

    async fn create_reserved(&self) -> Result<M::Resource> {
        let mut pending = Pending::new(&self.state, Held::Slot);
        let created = self.manager.create().await;
        pending.settle();

        let mut state = lock(&self.state);
        match created {
            Ok(resource) => {
                state.creating -= 1;
                state.current_size += 1;
                Ok(resource)
            }
            Err(e) => {
                state.give_up_slot();
                Err(e)
            }
        }
    }

    async fn wait(&self, rx: oneshot::Receiver<Handoff<M::Resource>>) -> Result<Handoff<M::Resource>> {
        tracing::debug!(
            "Pool for {} is saturated, waiting for a free connection",
            self.manager.describe()
        );

        let mut waiter = Waiter {
            rx,
            state: &self.state,
        };

        let received = match self.config.acquire_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut waiter.rx).await {
                Ok(received) => received,
                Err(_) => {
                    return Err(Error::AcquireTimeout {
                        endpoint: self.manager.describe(),
                        waited: limit,
                    })
                }
            },
            None => (&mut waiter.rx).await,
        };

        // The sender lives in the pool state, which outlives this borrow
        received.map_err(|_| Error::InvalidConfig("Pool waiter dropped".to_string()))
    }
}
