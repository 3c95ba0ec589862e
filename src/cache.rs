//! Framebuffer cache and eviction
//!
//! Every layer owns a bucket of framebuffers, newest first, looked up by
//! [`BufferIdentity`]. Secure buffers live in a separate set of buckets so
//! they can be flushed wholesale as soon as a frame carries no protected
//! content.
//!
//! Eviction is deliberately coarse: a bucket that would exceed its per-layer
//! cap is emptied in one go, and when too many layers are cached the next
//! [`flip`](FramebufferCache::flip) drops every layer that did not take part
//! in the frame. Evicted framebuffers are queued on the reclaim list and
//! destroyed by the [`AsyncReclaimer`].
//!
//! A framebuffer dropped by a cap breach or a layer cleanup may still be
//! scanned out, so it waits on a separate list that only `flip` moves onto
//! the reclaim list. The reclaimer never sees it before the frame replacing
//! it has been committed.
//!
//! ```text
//!  get_or_create ──► buckets ──┬─ cap breach / cleanup ──► awaiting flip ──┐ flip
//!                              │                                           ▼
//!                              └─ uncache / shrink / secure flush ──► reclaim list
//!                                                                          │ Condvar
//!                                                                          ▼
//!                                                            fb-reclaimer ──► RMFB
//! ```

use crate::config::CacheLimits;
use crate::framebuffer::{BufferIdentity, CachedFramebuffer, LayerId};
use crate::kms::KmsDevice;
use crate::reclaim::AsyncReclaimer;
use crate::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

type Buckets = HashMap<LayerId, VecDeque<CachedFramebuffer>>;

/// One class of buckets (secure or not) and its shrink bookkeeping
#[derive(Default)]
struct BucketSet {
    buckets: Buckets,
    in_use: HashSet<LayerId>,
    shrink_pending: bool,
}

impl BucketSet {
    fn buffer_count(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }

    fn find(&self, owner: LayerId, identity: &BufferIdentity) -> Option<u32> {
        self.buckets
            .get(&owner)?
            .iter()
            .find(|fb| fb.identity() == identity)
            .map(CachedFramebuffer::id)
    }

    fn mark_in_use(&mut self, owner: LayerId) {
        if self.shrink_pending {
            self.in_use.insert(owner);
        }
    }

    /// Move every bucket of an owner not used this frame to `reclaim`
    fn evict_unused(&mut self, reclaim: &mut VecDeque<CachedFramebuffer>) {
        if self.shrink_pending {
            let in_use = &self.in_use;
            let unused: Vec<LayerId> = self
                .buckets
                .keys()
                .filter(|owner| !in_use.contains(owner))
                .copied()
                .collect();
            for owner in unused {
                if let Some(bucket) = self.buckets.remove(&owner) {
                    debug!("Evicting {} framebuffers of unused layer {:?}", bucket.len(), owner);
                    reclaim.extend(bucket);
                }
            }
            self.shrink_pending = false;
        }
        self.in_use.clear();
    }

    fn drain_all(&mut self, reclaim: &mut VecDeque<CachedFramebuffer>) {
        for (_, bucket) in self.buckets.drain() {
            reclaim.extend(bucket);
        }
        self.in_use.clear();
    }
}

/// Everything guarded by the cache mutex
#[derive(Default)]
pub(crate) struct CacheState {
    plain: BucketSet,
    secure: BucketSet,
    /// Framebuffers without an owner built for the frame in progress
    untracked: Vec<CachedFramebuffer>,
    /// Untracked framebuffers of the frame currently on screen
    displayed_untracked: Vec<CachedFramebuffer>,
    /// Dropped from a bucket but possibly still on screen
    awaiting_flip: Vec<CachedFramebuffer>,
    pub(crate) reclaim: VecDeque<CachedFramebuffer>,
    pub(crate) shutdown: bool,
}

impl CacheState {
    fn set(&mut self, secure: bool) -> &mut BucketSet {
        if secure {
            &mut self.secure
        } else {
            &mut self.plain
        }
    }
}

/// Cache state plus the condition variable the reclaimer sleeps on
#[derive(Default)]
pub(crate) struct CacheShared {
    state: Mutex<CacheState>,
    pub(crate) wake: Condvar,
}

impl CacheShared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Snapshot of cache occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub layers: usize,
    pub secure_layers: usize,
    pub buffers: usize,
    pub secure_buffers: usize,
    pub untracked: usize,
    /// Waiting for the next flip before they can be reclaimed
    pub awaiting_flip: usize,
    pub pending_reclaim: usize,
    pub shrink_pending: bool,
}

pub struct FramebufferCache {
    device: Arc<dyn KmsDevice>,
    limits: CacheLimits,
    shared: Arc<CacheShared>,
    reclaimer: AsyncReclaimer,
}

impl FramebufferCache {
    pub fn new(device: Arc<dyn KmsDevice>, limits: CacheLimits) -> Result<Self> {
        let shared = Arc::new(CacheShared::default());
        let reclaimer = AsyncReclaimer::spawn(Arc::clone(&shared))?;
        info!(
            "Framebuffer cache: {} layers x {} buffers, {} secure layers x {} buffers",
            limits.max_cached_layers,
            limits.max_buffers_per_layer,
            limits.max_cached_secure_layers,
            limits.max_secure_buffers_per_layer
        );
        Ok(Self {
            device,
            limits,
            shared,
            reclaimer,
        })
    }

    fn per_layer_cap(&self, secure: bool) -> usize {
        if secure {
            self.limits.max_secure_buffers_per_layer
        } else {
            self.limits.max_buffers_per_layer
        }
    }

    fn signal(&self) {
        self.shared.wake.notify_one();
    }

    /// Framebuffer id for `identity` owned by `owner`, calling `build` to
    /// create it on a miss
    ///
    /// `build` runs without the cache lock held and is called at most once
    /// per cached `(owner, identity)`. Its error is returned as is and leaves
    /// the cache untouched. With no owner the framebuffer is built every time
    /// and kept only until the frame after it has been displayed.
    pub fn get_or_create<F>(&self, owner: Option<LayerId>, identity: BufferIdentity, build: F) -> Result<u32>
    where
        F: FnOnce() -> Result<u32>,
    {
        let Some(owner) = owner else {
            let fb_id = build()?;
            let fb = CachedFramebuffer::new(Arc::clone(&self.device), fb_id, identity);
            self.shared.lock().untracked.push(fb);
            trace!("Built untracked framebuffer {}", fb_id);
            return Ok(fb_id);
        };

        let secure = identity.is_secure();
        {
            let mut state = self.shared.lock();
            let set = state.set(secure);
            if let Some(fb_id) = set.find(owner, &identity) {
                set.mark_in_use(owner);
                return Ok(fb_id);
            }
        }

        let fb_id = build()?;
        let fb = CachedFramebuffer::new(Arc::clone(&self.device), fb_id, identity);
        let cap = self.per_layer_cap(secure);

        let mut state = self.shared.lock();
        let CacheState {
            plain,
            secure: secure_set,
            awaiting_flip,
            reclaim,
            ..
        } = &mut *state;
        let set = if secure { secure_set } else { plain };
        set.mark_in_use(owner);

        // Another caller may have cached the same buffer while we were building
        if let Some(existing) = set.find(owner, fb.identity()) {
            debug!(
                "Framebuffer {} for layer {:?} raced with {}, dropping it",
                fb_id, owner, existing
            );
            reclaim.push_back(fb);
            drop(state);
            self.signal();
            return Ok(existing);
        }

        let bucket = set.buckets.entry(owner).or_default();
        if bucket.len() >= cap {
            warn!(
                "Layer {:?} reached {} cached framebuffers, dropping its bucket",
                owner,
                bucket.len()
            );
            awaiting_flip.extend(bucket.drain(..));
        }
        bucket.push_front(fb);
        trace!("Cached framebuffer {} for layer {:?}", fb_id, owner);
        Ok(fb_id)
    }

    /// Queue every framebuffer of a destroyed layer for destruction after
    /// the next flip
    pub fn cleanup(&self, owner: LayerId) {
        let mut state = self.shared.lock();
        let CacheState {
            plain,
            secure,
            awaiting_flip,
            ..
        } = &mut *state;
        for set in [plain, secure] {
            set.in_use.remove(&owner);
            if let Some(bucket) = set.buckets.remove(&owner) {
                debug!("Layer {:?} destroyed, releasing {} framebuffers", owner, bucket.len());
                awaiting_flip.extend(bucket);
            }
        }
    }

    /// Queue the given buffers of `owner` for destruction, leaving the rest
    /// of its bucket alone
    pub fn uncache_buffers(&self, owner: LayerId, identities: &[BufferIdentity]) {
        let moved = {
            let mut state = self.shared.lock();
            let CacheState { plain, secure, reclaim, .. } = &mut *state;
            let before = reclaim.len();
            for set in [plain, secure] {
                let Some(bucket) = set.buckets.get_mut(&owner) else {
                    continue;
                };
                let mut kept = VecDeque::with_capacity(bucket.len());
                for fb in bucket.drain(..) {
                    if identities.contains(fb.identity()) {
                        reclaim.push_back(fb);
                    } else {
                        kept.push_back(fb);
                    }
                }
                *bucket = kept;
            }
            reclaim.len() - before
        };

        if moved > 0 {
            debug!("Uncached {} framebuffers of layer {:?}", moved, owner);
            self.signal();
        }
    }

    /// Schedule a shrink when more layers are cached than allowed. Eviction
    /// itself happens on the next [`flip`](Self::flip).
    pub fn check_shrink(&self) {
        let mut state = self.shared.lock();
        if state.plain.buckets.len() > self.limits.max_cached_layers {
            if !state.plain.shrink_pending {
                info!("{} layers cached, shrinking on next flip", state.plain.buckets.len());
            }
            state.plain.shrink_pending = true;
        }
        if state.secure.buckets.len() > self.limits.max_cached_secure_layers {
            if !state.secure.shrink_pending {
                info!(
                    "{} secure layers cached, shrinking on next flip",
                    state.secure.buckets.len()
                );
            }
            state.secure.shrink_pending = true;
        }
    }

    /// Called once per committed frame
    pub fn flip(&self, has_secure_content: bool) {
        let need_cleanup = {
            let mut state = self.shared.lock();
            let CacheState {
                plain,
                secure,
                untracked,
                displayed_untracked,
                awaiting_flip,
                reclaim,
                ..
            } = &mut *state;

            reclaim.extend(awaiting_flip.drain(..));
            plain.evict_unused(reclaim);
            secure.evict_unused(reclaim);
            if !has_secure_content && !secure.buckets.is_empty() {
                debug!("No secure content, flushing {} secure framebuffers", secure.buffer_count());
                secure.drain_all(reclaim);
            }

            reclaim.extend(displayed_untracked.drain(..));
            std::mem::swap(displayed_untracked, untracked);

            !reclaim.is_empty()
        };

        if need_cleanup {
            self.signal();
        }
    }

    /// Queue every cached framebuffer for destruction
    pub fn release_all(&self) {
        {
            let mut state = self.shared.lock();
            let CacheState {
                plain,
                secure,
                untracked,
                displayed_untracked,
                awaiting_flip,
                reclaim,
                ..
            } = &mut *state;
            plain.drain_all(reclaim);
            secure.drain_all(reclaim);
            reclaim.extend(awaiting_flip.drain(..));
            reclaim.extend(untracked.drain(..));
            reclaim.extend(displayed_untracked.drain(..));
            warn!("Released all cached framebuffers ({} queued)", reclaim.len());
        }
        self.signal();
    }

    /// Queue every secure framebuffer for destruction
    pub fn destroy_all_secure_buffers(&self) {
        let moved = {
            let mut state = self.shared.lock();
            let CacheState { secure, reclaim, .. } = &mut *state;
            let before = reclaim.len();
            secure.drain_all(reclaim);
            reclaim.len() - before
        };
        if moved > 0 {
            self.signal();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.shared.lock();
        CacheStats {
            layers: state.plain.buckets.len(),
            secure_layers: state.secure.buckets.len(),
            buffers: state.plain.buffer_count(),
            secure_buffers: state.secure.buffer_count(),
            untracked: state.untracked.len() + state.displayed_untracked.len(),
            awaiting_flip: state.awaiting_flip.len(),
            pending_reclaim: state.reclaim.len(),
            shrink_pending: state.plain.shrink_pending || state.secure.shrink_pending,
        }
    }

    /// Framebuffers per owner, for dumps
    pub fn bucket_len(&self, owner: LayerId, secure: bool) -> usize {
        let mut state = self.shared.lock();
        state.set(secure).buckets.get(&owner).map_or(0, VecDeque::len)
    }
}

impl Drop for FramebufferCache {
    fn drop(&mut self) {
        self.reclaimer.shutdown();
        let stats = self.stats();
        debug!(
            "Dropping framebuffer cache: {} buffers, {} secure, {} queued",
            stats.buffers, stats.secure_buffers, stats.pending_reclaim
        );
        // Remaining framebuffers are destroyed with `shared`
    }
}
