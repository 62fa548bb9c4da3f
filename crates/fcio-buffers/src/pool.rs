use crate::area::DmaArea;
use crate::backend::{AreaLayout, ExchangeBackend, Generation, ReuseHold, ReuseHolds, SglPost, SglRegistrar};
use crate::tags::{ExchangeTag, TagAllocator};
use anyhow::{Context, Result};
use fcio_proto::{PortId, ProtoError, SgEntry};
use metrics::gauge;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Ownership state of a provisioned exchange buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Free,
    InUse,
    /// Quarantined until the adapter confirms the exchange is closed.
    Busy,
}

impl SlotState {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotState::Free => "free",
            SlotState::InUse => "in_use",
            SlotState::Busy => "busy",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to an acquired buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExchangeRef {
    index: usize,
    tag: ExchangeTag,
}

impl ExchangeRef {
    pub fn index(self) -> usize {
        self.index
    }

    pub fn tag(self) -> ExchangeTag {
        self.tag
    }
}

/// One exchange buffer: the DMA area plus whatever request is bound to it.
pub struct Exchange<B> {
    tag: ExchangeTag,
    area: DmaArea,
    layout: AreaLayout,
    entries: Vec<SgEntry>,
    registered: bool,
    pub binding: Option<B>,
}

impl<B> Exchange<B> {
    fn new(tag: ExchangeTag, area: DmaArea, layout: AreaLayout) -> Self {
        Self {
            tag,
            area,
            layout,
            entries: Vec::new(),
            registered: false,
            binding: None,
        }
    }

    pub fn tag(&self) -> ExchangeTag {
        self.tag
    }

    pub fn layout(&self) -> &AreaLayout {
        &self.layout
    }

    pub fn cmnd_addr(&self) -> u64 {
        self.area.bus_addr() + self.layout.cmnd.start as u64
    }

    pub fn rsp_addr(&self) -> u64 {
        self.area.bus_addr() + self.layout.rsp.start as u64
    }

    pub fn table_addr(&self) -> u64 {
        self.area.bus_addr() + self.layout.table.start as u64
    }

    pub fn cmnd(&self) -> &[u8] {
        &self.area.as_slice()[self.layout.cmnd.clone()]
    }

    pub fn cmnd_mut(&mut self) -> &mut [u8] {
        let range = self.layout.cmnd.clone();
        &mut self.area.as_mut_slice()[range]
    }

    pub fn rsp(&self) -> &[u8] {
        &self.area.as_slice()[self.layout.rsp.clone()]
    }

    pub fn rsp_mut(&mut self) -> &mut [u8] {
        let range = self.layout.rsp.clone();
        &mut self.area.as_mut_slice()[range]
    }

    pub fn table(&self) -> &[u8] {
        &self.area.as_slice()[self.layout.table.clone()]
    }

    /// Entries most recently written into the table.
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }
}

/// A buffer slot: the exchange behind its own lock, plus the condition used
/// to wake threads waiting for the exchange to resolve.
pub struct ExchangeSlot<B> {
    exchange: Mutex<Exchange<B>>,
    resolved: Condvar,
}

impl<B> ExchangeSlot<B> {
    fn new(exchange: Exchange<B>) -> Self {
        Self {
            exchange: Mutex::new(exchange),
            resolved: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Exchange<B>> {
        self.exchange.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release `guard` and wait up to `timeout` for [`Self::notify`].
    pub fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, Exchange<B>>,
        timeout: Duration,
    ) -> MutexGuard<'a, Exchange<B>> {
        match self.resolved.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// Wake every waiter. Must not be called with the slot locked; taking
    /// the lock here orders the wakeup after any waiter's last check.
    pub fn notify(&self) {
        let _guard = self.lock();
        self.resolved.notify_all();
    }
}

/// Counts by state, for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub capacity: usize,
    pub provisioned: usize,
    pub free: usize,
    pub in_use: usize,
    pub busy: usize,
    pub held: usize,
    pub alloc_failures: u64,
}

struct PoolInner {
    states: Vec<Option<SlotState>>,
    free: VecDeque<usize>,
    holds: ReuseHolds,
    alloc_failures: u64,
    provisioned: usize,
}

/// Arena of exchange buffers indexed by tag.
///
/// The pool lock covers the state table and the free list only; it is never
/// held while a slot lock is taken or while the adapter is called.
pub struct ExchangePool<B> {
    backend: Box<dyn ExchangeBackend>,
    tags: TagAllocator,
    layout: AreaLayout,
    slots: Box<[OnceLock<ExchangeSlot<B>>]>,
    inner: Mutex<PoolInner>,
    reuse_hold: Duration,
}

impl<B> ExchangePool<B> {
    pub fn new(
        backend: Box<dyn ExchangeBackend>,
        capacity: u16,
        max_segments: usize,
        reuse_hold: Duration,
    ) -> Self {
        let tags = TagAllocator::new(backend.tag_base(), capacity);
        let capacity = tags.capacity();
        let layout = backend.layout(max_segments);
        let slots = (0..capacity)
            .map(|_| OnceLock::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            backend,
            tags,
            layout,
            slots,
            inner: Mutex::new(PoolInner {
                states: vec![None; capacity],
                free: VecDeque::with_capacity(capacity),
                holds: ReuseHolds::new(),
                alloc_failures: 0,
                provisioned: 0,
            }),
            reuse_hold,
        }
    }

    pub fn backend(&self) -> &dyn ExchangeBackend {
        self.backend.as_ref()
    }

    pub fn generation(&self) -> Generation {
        self.backend.generation()
    }

    pub fn layout(&self) -> &AreaLayout {
        &self.layout
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Grow the pool by up to `count` buffers, registering them with the
    /// adapter when the generation requires it. Buffers whose registration
    /// fails are kept but start out Busy.
    pub fn provision(&self, count: usize, registrar: &dyn SglRegistrar) -> Result<usize> {
        let mut added = Vec::with_capacity(count);
        for _ in 0..count {
            let Some(tag) = self.tags.allocate_tag() else {
                debug!("exchange tags exhausted");
                break;
            };
            let index = self
                .tags
                .index_of(tag)
                .context("allocated tag outside pool window")?;
            if self.slots[index].get().is_none() {
                let area = match DmaArea::new(self.layout.total) {
                    Ok(area) => area,
                    Err(err) => {
                        warn!(%tag, error = %err, "exchange area allocation failed");
                        self.tags.retire_tag(tag)?;
                        break;
                    }
                };
                let slot = ExchangeSlot::new(Exchange::new(tag, area, self.layout.clone()));
                let _ = self.slots[index].set(slot);
            }
            added.push(index);
        }
        if added.is_empty() {
            return Ok(0);
        }
        added.sort_unstable();

        let failed = self.register(&added, registrar);
        let mut inner = self.lock();
        for &index in &added {
            if failed.binary_search(&index).is_ok() {
                inner.states[index] = Some(SlotState::Busy);
            } else {
                inner.states[index] = Some(SlotState::Free);
                inner.free.push_back(index);
            }
        }
        inner.provisioned += added.len();
        let provisioned = inner.provisioned;
        drop(inner);

        gauge!("fcio_pool_provisioned").set(provisioned as f64);
        info!(
            added = added.len(),
            busy = failed.len(),
            provisioned,
            generation = %self.backend.generation(),
            "provisioned exchange buffers"
        );
        Ok(added.len())
    }

    /// Post registrations for `indices` (sorted) and return the sorted
    /// indices whose block failed.
    fn register(&self, indices: &[usize], registrar: &dyn SglRegistrar) -> Vec<usize> {
        let Some(block) = self.backend.registration_block() else {
            return Vec::new();
        };
        let mut failed = Vec::new();
        // Only consecutive tags can share one post.
        for run in indices.chunk_by(|a, b| *b == *a + 1) {
            for chunk in run.chunks(block) {
                let posts: Vec<SglPost> = chunk
                    .iter()
                    .filter_map(|&index| {
                        let slot = self.slots[index].get()?;
                        let exchange = slot.lock();
                        Some(SglPost {
                            tag: exchange.tag(),
                            table_addr: exchange.table_addr(),
                            table_len: exchange.layout().table.len(),
                        })
                    })
                    .collect();
                let ok = match registrar.post_sgl_block(&posts) {
                    Ok(()) => true,
                    Err(err) => {
                        let first = posts.first().map(|post| post.tag.0).unwrap_or_default();
                        warn!(
                            first,
                            count = posts.len(),
                            error = %err,
                            "sgl block registration failed"
                        );
                        false
                    }
                };
                for &index in chunk {
                    if let Some(slot) = self.slots[index].get() {
                        slot.lock().registered = ok;
                    }
                }
                if !ok {
                    failed.extend_from_slice(chunk);
                }
            }
        }
        failed
    }

    /// Take a Free buffer for `target`. `None` means the pool is empty for
    /// this target; the caller applies backpressure.
    pub fn acquire(&self, target: PortId) -> Option<ExchangeRef> {
        let now = Instant::now();
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(position) = self
            .backend
            .pick_free(&inner.free, &inner.holds, target, now)
        else {
            inner.alloc_failures += 1;
            return None;
        };
        let index = inner.free.remove(position)?;
        if inner.holds.get(&index).is_some_and(|hold| now >= hold.until) {
            inner.holds.remove(&index);
        }
        inner.states[index] = Some(SlotState::InUse);
        drop(guard);
        let tag = self.tags.tag_at(index)?;
        Some(ExchangeRef { index, tag })
    }

    /// Return an InUse buffer after completion. The backend decides whether
    /// an exchange the adapter still reports busy is quarantined instead.
    pub fn release(&self, exchange: ExchangeRef, exchange_busy: bool) -> Option<SlotState> {
        let next = self.backend.release_state(exchange_busy);
        self.transition(exchange.index, SlotState::InUse, next, None)
    }

    /// InUse to Busy: the exchange was cancelled but the adapter has not
    /// confirmed it closed.
    pub fn quarantine(&self, exchange: ExchangeRef) -> bool {
        self.transition(exchange.index, SlotState::InUse, SlotState::Busy, None)
            .is_some()
    }

    /// Busy to Free after the adapter confirms the exchange closed. On
    /// backends that track reuse, `aborted_for` keeps the tag away from that
    /// target for the configured hold.
    pub fn confirm(&self, tag: ExchangeTag, aborted_for: Option<PortId>) -> bool {
        let Some(index) = self.tags.index_of(tag) else {
            return false;
        };
        let hold = aborted_for
            .filter(|_| self.backend.holds_reuse())
            .map(|target| ReuseHold {
                target,
                until: Instant::now() + self.reuse_hold,
            });
        self.transition(index, SlotState::Busy, SlotState::Free, hold)
            .is_some()
    }

    fn transition(
        &self,
        index: usize,
        from: SlotState,
        to: SlotState,
        hold: Option<ReuseHold>,
    ) -> Option<SlotState> {
        let mut inner = self.lock();
        let current = inner.states.get(index).copied().flatten();
        if current != Some(from) {
            drop(inner);
            trace!(index, ?current, %from, %to, "exchange state transition rejected");
            return None;
        }
        inner.states[index] = Some(to);
        if to == SlotState::Free {
            inner.free.push_back(index);
        }
        if let Some(hold) = hold {
            inner.holds.insert(index, hold);
        }
        Some(to)
    }

    /// Re-register every buffer not currently InUse, for use after an adapter
    /// reset. Buffers whose registration fails remain Busy. Returns the
    /// number of failures.
    pub fn repost_all(&self, registrar: &dyn SglRegistrar) -> usize {
        let parked: Vec<usize> = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            inner.free.clear();
            inner.holds.clear();
            inner
                .states
                .iter_mut()
                .enumerate()
                .filter_map(|(index, state)| match state {
                    Some(SlotState::Free | SlotState::Busy) => {
                        *state = Some(SlotState::Busy);
                        Some(index)
                    }
                    _ => None,
                })
                .collect()
        };
        let failed = self.register(&parked, registrar);
        let mut inner = self.lock();
        for &index in &parked {
            if failed.binary_search(&index).is_err()
                && inner.states[index] == Some(SlotState::Busy)
            {
                inner.states[index] = Some(SlotState::Free);
                inner.free.push_back(index);
            }
        }
        drop(inner);
        info!(
            reposted = parked.len() - failed.len(),
            failed = failed.len(),
            "reposted exchange buffers"
        );
        failed.len()
    }

    /// Retire every Free buffer's tag. Returns the number of buffers that
    /// were still InUse or Busy.
    pub fn teardown(&self) -> usize {
        let (retired, stranded) = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let retired: Vec<usize> = inner.free.drain(..).collect();
            for &index in &retired {
                inner.states[index] = None;
            }
            inner.provisioned -= retired.len();
            inner.holds.clear();
            let stranded = inner.states.iter().filter(|state| state.is_some()).count();
            (retired, stranded)
        };
        for index in retired {
            if let Some(tag) = self.tags.tag_at(index) {
                if let Err(err) = self.tags.retire_tag(tag) {
                    warn!(%tag, error = %err, "failed to retire exchange tag");
                }
            }
        }
        if stranded > 0 {
            warn!(stranded, "exchange buffers outstanding at teardown");
        }
        gauge!("fcio_pool_provisioned").set(stranded as f64);
        stranded
    }

    pub fn slot(&self, tag: ExchangeTag) -> Option<&ExchangeSlot<B>> {
        let index = self.tags.index_of(tag)?;
        self.slots[index].get()
    }

    pub fn slot_at(&self, exchange: ExchangeRef) -> Option<&ExchangeSlot<B>> {
        self.slots.get(exchange.index)?.get()
    }

    pub fn exchange_ref(&self, tag: ExchangeTag) -> Option<ExchangeRef> {
        let index = self.tags.index_of(tag)?;
        Some(ExchangeRef { index, tag })
    }

    pub fn state(&self, tag: ExchangeTag) -> Option<SlotState> {
        let index = self.tags.index_of(tag)?;
        self.lock().states[index]
    }

    /// Every buffer currently InUse.
    pub fn in_use(&self) -> Vec<ExchangeRef> {
        let inner = self.lock();
        inner
            .states
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == Some(SlotState::InUse))
            .filter_map(|(index, _)| {
                let tag = self.tags.tag_at(index)?;
                Some(ExchangeRef { index, tag })
            })
            .collect()
    }

    /// Encode `entries` into the exchange's table using this pool's backend.
    pub fn write_table(
        &self,
        exchange: &mut Exchange<B>,
        entries: Vec<SgEntry>,
        inbound: bool,
    ) -> std::result::Result<(), ProtoError> {
        let range = exchange.layout.table.clone();
        let table = &mut exchange.area.as_mut_slice()[range];
        table.fill(0);
        self.backend.write_table(table, &entries, inbound)?;
        exchange.entries = entries;
        Ok(())
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let now = Instant::now();
        let inner = self.lock();
        let mut snapshot = PoolSnapshot {
            capacity: self.slots.len(),
            provisioned: inner.provisioned,
            alloc_failures: inner.alloc_failures,
            held: inner.holds.values().filter(|hold| now < hold.until).count(),
            ..PoolSnapshot::default()
        };
        for state in inner.states.iter().flatten() {
            match state {
                SlotState::Free => snapshot.free += 1,
                SlotState::InUse => snapshot.in_use += 1,
                SlotState::Busy => snapshot.busy += 1,
            }
        }
        snapshot
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
