//! # Socket Pool
//!
//! Purpose: Reuse TCP connections across calls while keeping concurrent
//! callers from ever observing each other's response bytes.
//!
//! ## Design Principles
//! 1. **Per-Caller Lease**: A lease is keyed by caller identity and
//!    reference-counted, so nested calls from the same caller reuse one
//!    connection instead of deadlocking or cross-talking.
//! 2. **Stalest-First Reclaim**: Idle sockets sit in a min-heap ordered by
//!    release time, so `close_idle` always reaps the longest-unused first.
//! 3. **Minimal Locking**: The pool mutex is held only while moving sockets
//!    between the in-use map and the free heap, never during I/O.
//! 4. **Fail Fast**: A socket a transport error has already closed is
//!    discarded on release instead of being pooled for reuse.
//!
//! An engine that opts out of sharing (`connection_pool: false`) does not
//! go through any of the above: [`SocketPool::new_thread_local`] builds a
//! pool that hands each calling thread the same persistent socket on every
//! checkout and never lets it cross over to another thread.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::sock::{FramedSocket, SocketOptions};

thread_local! {
    /// Per-thread sockets for pools built with [`SocketPool::new_thread_local`],
    /// keyed by the owning pool's identity so that several such pools (e.g.
    /// one per engine instance) sharing a thread don't collide.
    static THREAD_LOCAL_SOCKETS: RefCell<HashMap<usize, Arc<Mutex<FramedSocket>>>> =
        RefCell::new(HashMap::new());
}

/// Opaque identifier distinguishing concurrent users of a pool.
///
/// A thread is the default source (see [`CallerId::thread_current`]); an
/// embedder running its own scheduler (e.g. an async runtime) can mint its
/// own ids as long as they are stable for the duration of one caller's work
/// and distinct across callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerId(std::thread::ThreadId);

impl CallerId {
    /// The identity of the calling OS thread.
    pub fn thread_current() -> CallerId {
        CallerId(std::thread::current().id())
    }
}

/// Configuration for a [`SocketPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub addr: SocketAddr,
    pub nodelay: bool,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
}

impl PoolConfig {
    fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            addr: self.addr,
            nodelay: self.nodelay,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            connect_timeout: self.connect_timeout,
        }
    }
}

struct LeaseEntry {
    sock: Arc<Mutex<FramedSocket>>,
    leases: usize,
}

/// An idle socket, ordered so the stalest entry sorts to the top of the
/// pool's min-heap (`Ord` is inverted relative to `released_at` so
/// `BinaryHeap`, a max-heap, pops the smallest timestamp first).
struct FreeEntry {
    released_at: Instant,
    seq: u64,
    sock: Arc<Mutex<FramedSocket>>,
}

impl PartialEq for FreeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.released_at == other.released_at && self.seq == other.seq
    }
}
impl Eq for FreeEntry {}

impl PartialOrd for FreeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FreeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .released_at
            .cmp(&self.released_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolState {
    in_use: HashMap<CallerId, LeaseEntry>,
    free: BinaryHeap<FreeEntry>,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    seq: AtomicU64,
    /// `false` means this pool bypasses `state` entirely and hands out
    /// thread-local sockets instead; see [`SocketPool::new_thread_local`].
    shared: bool,
}

/// Per-caller socket pool. Cheaply `Clone`-able; every clone shares
/// the same underlying state.
#[derive(Clone)]
pub struct SocketPool {
    inner: Arc<PoolInner>,
}

impl SocketPool {
    pub fn new(config: PoolConfig) -> SocketPool {
        SocketPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState {
                    in_use: HashMap::new(),
                    free: BinaryHeap::new(),
                }),
                seq: AtomicU64::new(0),
                shared: true,
            }),
        }
    }

    /// Builds a pool that never shares a socket across threads: each calling
    /// thread gets the same persistent connection back on every checkout,
    /// stored in thread-local storage rather than this pool's own state.
    /// Used when an engine is configured with `connection_pool: false`.
    pub fn new_thread_local(config: PoolConfig) -> SocketPool {
        SocketPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState {
                    in_use: HashMap::new(),
                    free: BinaryHeap::new(),
                }),
                seq: AtomicU64::new(0),
                shared: false,
            }),
        }
    }

    /// Identity of this pool's instance, used to key the thread-local socket
    /// map so that several thread-local pools sharing a thread don't collide.
    fn thread_local_key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Leases a socket to `caller`. If `caller` already holds an open lease
    /// (a nested call from the same caller identity), the existing
    /// connection is reused and the lease is reference-counted; otherwise the
    /// stalest idle socket is reused or a fresh connection is opened.
    ///
    /// For a thread-local pool, `caller` is ignored (it is always the
    /// current thread) and the calling thread's single persistent socket is
    /// returned instead, connecting it lazily on first use.
    pub fn checkout(&self, caller: CallerId) -> crate::error::Result<PooledSocket> {
        if !self.inner.shared {
            return self.checkout_thread_local();
        }

        let mut state = self.inner.state.lock().expect("pool mutex poisoned");

        if let Some(entry) = state.in_use.get_mut(&caller) {
            entry.leases += 1;
            tracing::trace!(?caller, "reentrant pool checkout");
            return Ok(PooledSocket {
                pool: self.clone(),
                caller,
                sock: Some(entry.sock.clone()),
            });
        }

        let sock = match state.free.pop() {
            Some(entry) => entry.sock,
            None => {
                drop(state);
                let opts = self.inner.config.socket_options();
                let sock = Arc::new(Mutex::new(FramedSocket::connect(&opts)?));
                state = self.inner.state.lock().expect("pool mutex poisoned");
                sock
            }
        };

        state
            .in_use
            .insert(caller, LeaseEntry { sock: sock.clone(), leases: 1 });
        tracing::trace!(?caller, "pool checkout");
        Ok(PooledSocket {
            pool: self.clone(),
            caller,
            sock: Some(sock),
        })
    }

    fn checkout_thread_local(&self) -> crate::error::Result<PooledSocket> {
        let key = self.thread_local_key();
        let sock = THREAD_LOCAL_SOCKETS.with(|cell| -> crate::error::Result<_> {
            let mut map = cell.borrow_mut();
            if let Some(existing) = map.get(&key) {
                let closed = existing.lock().expect("socket mutex poisoned").is_closed();
                if !closed {
                    return Ok(existing.clone());
                }
            }
            let opts = self.inner.config.socket_options();
            let sock = Arc::new(Mutex::new(FramedSocket::connect(&opts)?));
            map.insert(key, sock.clone());
            Ok(sock)
        })?;
        tracing::trace!("thread-local socket checkout");
        Ok(PooledSocket {
            pool: self.clone(),
            caller: CallerId::thread_current(),
            sock: Some(sock),
        })
    }

    /// Closes and discards the caller's leased socket without returning it
    /// to the free list. On a thread-local pool this closes the calling
    /// thread's own persistent socket, ignoring `caller`.
    pub fn close(&self, caller: CallerId) {
        if !self.inner.shared {
            self.close_thread_local();
            return;
        }
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        if let Some(entry) = state.in_use.remove(&caller) {
            entry.sock.lock().expect("socket mutex poisoned").close();
        }
    }

    /// Pops and closes idle sockets whose release timestamp is older than
    /// `now - cutoff`, stopping at the first socket released more recently.
    /// Returns the number of sockets closed. A thread-local pool has no idle
    /// list to reap (its one socket stays checked out indefinitely) and
    /// always returns 0.
    pub fn close_idle(&self, cutoff: Duration) -> usize {
        if !self.inner.shared {
            return 0;
        }
        let now = Instant::now();
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        let mut closed = 0;
        while let Some(top) = state.free.peek() {
            if now.saturating_duration_since(top.released_at) < cutoff {
                break;
            }
            let entry = state.free.pop().expect("peeked above");
            entry.sock.lock().expect("socket mutex poisoned").close();
            closed += 1;
        }
        tracing::debug!(closed, "pool idle reap");
        closed
    }

    /// Closes every socket, in-use and free, and clears both collections.
    /// On a thread-local pool this can only reach the calling thread's own
    /// socket, since thread-local storage isn't visible across threads.
    pub fn close_all(&self) {
        if !self.inner.shared {
            self.close_thread_local();
            return;
        }
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        for (_, entry) in state.in_use.drain() {
            entry.sock.lock().expect("socket mutex poisoned").close();
        }
        for entry in state.free.drain() {
            entry.sock.lock().expect("socket mutex poisoned").close();
        }
    }

    fn close_thread_local(&self) {
        let key = self.thread_local_key();
        THREAD_LOCAL_SOCKETS.with(|cell| {
            if let Some(sock) = cell.borrow_mut().remove(&key) {
                sock.lock().expect("socket mutex poisoned").close();
            }
        });
    }

    /// Current `(in_use, free)` counts; exposed for tests and diagnostics.
    /// Always `(0, 0)` for a thread-local pool, since it never populates
    /// either collection.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.inner.state.lock().expect("pool mutex poisoned");
        (state.in_use.len(), state.free.len())
    }

    fn next_seq(&self) -> u64 {
        self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    fn release(&self, caller: CallerId) {
        if !self.inner.shared {
            // The thread-local socket stays in TLS for reuse; there is
            // nothing to move between in_use and free here.
            return;
        }
        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
        let Some(entry) = state.in_use.get_mut(&caller) else {
            return;
        };
        entry.leases -= 1;
        if entry.leases > 0 {
            return;
        }
        let entry = state.in_use.remove(&caller).expect("checked above");
        let closed = entry.sock.lock().expect("socket mutex poisoned").is_closed();
        if closed {
            tracing::warn!(?caller, "discarding failed socket instead of pooling it");
            return;
        }
        let seq = self.next_seq();
        state.free.push(FreeEntry {
            released_at: Instant::now(),
            seq,
            sock: entry.sock,
        });
    }
}

/// RAII lease handle returned by [`SocketPool::checkout`].
///
/// On drop, the underlying socket is returned to the pool's free list if
/// still open, or discarded if a transport failure closed it, driven by the
/// socket's own `is_closed()` rather than a side flag the caller has to
/// remember to set.
pub struct PooledSocket {
    pool: SocketPool,
    caller: CallerId,
    sock: Option<Arc<Mutex<FramedSocket>>>,
}

impl PooledSocket {
    /// Runs `f` against the leased socket. The pool's own mutex is never
    /// held during this call; only the per-connection mutex is, and only for
    /// the duration of `f`.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut FramedSocket) -> R,
    {
        let sock = self.sock.as_ref().expect("socket present until drop");
        let mut guard = sock.lock().expect("socket mutex poisoned");
        f(&mut guard)
    }
}

impl Drop for PooledSocket {
    fn drop(&mut self) {
        if self.sock.take().is_some() {
            self.pool.release(self.caller);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn echo_server() -> (SocketAddr, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream: TcpStream = match stream {
                    Ok(s) => s,
                    Err(_) => break,
                };
                thread::spawn(move || {
                    let mut buf = [0u8; 1];
                    use std::io::{Read, Write};
                    while stream.read_exact(&mut buf).is_ok() {
                        if stream.write_all(&buf).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (addr, handle)
    }

    fn config(addr: SocketAddr) -> PoolConfig {
        PoolConfig {
            addr,
            nodelay: true,
            read_timeout: Some(Duration::from_secs(2)),
            write_timeout: Some(Duration::from_secs(2)),
            connect_timeout: Some(Duration::from_secs(2)),
        }
    }

    #[test]
    fn checkout_then_drop_moves_socket_to_free() {
        let (addr, _server) = echo_server();
        let pool = SocketPool::new(config(addr));
        let caller = CallerId::thread_current();

        {
            let _leased = pool.checkout(caller).unwrap();
            assert_eq!(pool.counts(), (1, 0));
        }
        assert_eq!(pool.counts(), (0, 1));
    }

    #[test]
    fn reentrant_checkout_reuses_the_same_lease() {
        let (addr, _server) = echo_server();
        let pool = SocketPool::new(config(addr));
        let caller = CallerId::thread_current();

        let outer = pool.checkout(caller).unwrap();
        assert_eq!(pool.counts(), (1, 0));
        let inner = pool.checkout(caller).unwrap();
        assert_eq!(pool.counts(), (1, 0));
        drop(inner);
        assert_eq!(pool.counts(), (1, 0));
        drop(outer);
        assert_eq!(pool.counts(), (0, 1));
    }

    #[test]
    fn distinct_callers_get_distinct_leases() {
        let (addr, _server) = echo_server();
        let pool = SocketPool::new(config(addr));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let caller = CallerId::thread_current();
                    let leased = pool.checkout(caller).unwrap();
                    leased.with(|sock| {
                        sock.send_all(b"x").unwrap();
                        let echoed = sock.recv_exact(1).unwrap();
                        assert_eq!(echoed, b"x");
                    });
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        let (in_use, free) = pool.counts();
        assert_eq!(in_use, 0);
        assert_eq!(free, 4);
    }

    #[test]
    fn failed_socket_is_discarded_not_pooled() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let pool = SocketPool::new(config(addr));
        let caller = CallerId::thread_current();
        {
            let leased = pool.checkout(caller).unwrap();
            let err = leased.with(|sock| sock.recv_exact(1).unwrap_err());
            assert!(matches!(err, Error::ConnectionClosed));
        }
        assert_eq!(pool.counts(), (0, 0));
        server.join().unwrap();
    }

    #[test]
    fn close_idle_reaps_only_stale_entries() {
        let (addr, _server) = echo_server();
        let pool = SocketPool::new(config(addr));

        for _ in 0..3 {
            let caller = CallerId::thread_current();
            drop(pool.checkout(caller).unwrap());
        }
        // All three leases came from the same (test) thread id, so they
        // collapsed into a single pooled connection via reentrant reuse.
        assert_eq!(pool.counts(), (0, 1));

        assert_eq!(pool.close_idle(Duration::from_secs(3600)), 0);
        assert_eq!(pool.counts(), (0, 1));
        assert_eq!(pool.close_idle(Duration::from_secs(0)), 1);
        assert_eq!(pool.counts(), (0, 0));
    }

    #[test]
    fn close_all_clears_in_use_and_free() {
        let (addr, _server) = echo_server();
        let pool = SocketPool::new(config(addr));
        let caller = CallerId::thread_current();
        let leased = pool.checkout(caller).unwrap();
        pool.close_all();
        drop(leased);
        // the lease's drop still runs release(), but the socket it points at
        // is already closed, so it is discarded rather than re-pooled.
        assert_eq!(pool.counts(), (0, 0));
    }

    #[test]
    fn close_discards_without_pooling() {
        let (addr, _server) = echo_server();
        let pool = SocketPool::new(config(addr));
        let caller = CallerId::thread_current();
        let leased = pool.checkout(caller).unwrap();
        pool.close(caller);
        drop(leased);
        assert_eq!(pool.counts(), (0, 0));
    }

    #[test]
    fn thread_local_pool_never_populates_shared_state() {
        let (addr, _server) = echo_server();
        let pool = SocketPool::new_thread_local(config(addr));
        let caller = CallerId::thread_current();
        let leased = pool.checkout(caller).unwrap();
        leased.with(|sock| {
            sock.send_all(b"x").unwrap();
            assert_eq!(sock.recv_exact(1).unwrap(), b"x");
        });
        assert_eq!(pool.counts(), (0, 0));
        drop(leased);
        assert_eq!(pool.counts(), (0, 0));
    }

    #[test]
    fn thread_local_pool_reuses_the_same_socket_on_one_thread() {
        let (addr, _server) = echo_server();
        let pool = SocketPool::new_thread_local(config(addr));
        let caller = CallerId::thread_current();

        let first = pool.checkout(caller).unwrap();
        let first_ptr = first.with(|sock| sock as *const FramedSocket as usize);
        drop(first);

        let second = pool.checkout(caller).unwrap();
        let second_ptr = second.with(|sock| sock as *const FramedSocket as usize);
        drop(second);

        assert_eq!(first_ptr, second_ptr);
    }

    #[test]
    fn thread_local_pool_gives_distinct_threads_distinct_sockets() {
        let (addr, _server) = echo_server();
        let pool = SocketPool::new_thread_local(config(addr));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let caller = CallerId::thread_current();
                    let leased = pool.checkout(caller).unwrap();
                    leased.with(|sock| {
                        sock.send_all(b"x").unwrap();
                        assert_eq!(sock.recv_exact(1).unwrap(), b"x");
                    });
                    // Reusing the pool from the same thread must hand back
                    // the identical socket rather than opening a second one.
                    let again = pool.checkout(caller).unwrap();
                    again.with(|sock| sock as *const FramedSocket as usize)
                })
            })
            .collect();

        let ptrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let mut unique = ptrs.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), ptrs.len(), "each thread must get its own socket");
    }
}
