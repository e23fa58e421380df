use crate::Resolver;
use anyhow::Context;
use parking_lot::Mutex;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    addr: SocketAddr,
    eol: Instant,
    generation: u64,
}

struct PoolState {
    entries: Vec<Entry>,
    generation: u64,
    ttl: Duration,
}

impl PoolState {
    fn fold(&mut self, addr: SocketAddr, now: Instant) {
        let generation = self.generation;
        if let Some(entry) = self.entries.iter_mut().find(|e| e.addr == addr) {
            entry.eol = now + self.ttl;
            entry.generation = generation;
            return;
        }
        self.entries.push(Entry {
            addr,
            eol: now + self.ttl,
            generation,
        });
    }

    /// End the current generation: bump the counter and drop entries that
    /// are both stale (older than the previous generation) and expired.
    fn commit(&mut self, now: Instant) {
        self.generation += 1;
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        let generation = self.generation;
        self.entries.retain(|e| {
            e.generation == generation
                || e.generation == generation.wrapping_sub(1)
                || e.eol > now
        });
    }
}

/// A self-refreshing pool of server addresses.
///
/// Created with one blocking resolution (creation fails if the target has
/// no addresses); thereafter a background task re-resolves every `freq`
/// and folds each pass in as a new generation.
#[derive(Clone)]
pub struct ServerPool {
    state: Arc<Mutex<PoolState>>,
    _refresh: Arc<AbortOnDrop>,
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl ServerPool {
    pub async fn spawn(
        resolver: Arc<dyn Resolver>,
        target: &str,
        freq: Duration,
        ttl: Duration,
    ) -> anyhow::Result<Self> {
        let addrs = resolver
            .resolve(target)
            .await
            .with_context(|| format!("initial lookup of {target}"))?;
        anyhow::ensure!(!addrs.is_empty(), "no addresses found for {target}");

        let now = Instant::now();
        let mut state = PoolState {
            entries: Vec::new(),
            generation: 0,
            ttl,
        };
        for addr in addrs {
            state.fold(addr, now);
        }
        state.generation = 1;

        let state = Arc::new(Mutex::new(state));
        let refresh = tokio::spawn(refresh_loop(
            state.clone(),
            resolver,
            target.to_string(),
            freq,
        ));

        Ok(Self {
            state,
            _refresh: Arc::new(AbortOnDrop(refresh)),
        })
    }

    /// Pick an address uniformly at random from the live set.
    pub fn pick(&self) -> SocketAddr {
        let mut state = self.state.lock();
        state.prune(Instant::now());
        assert!(!state.entries.is_empty());
        let i = rand::thread_rng().gen_range(0..state.entries.len());
        state.entries[i].addr
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn refresh_loop(
    state: Arc<Mutex<PoolState>>,
    resolver: Arc<dyn Resolver>,
    target: String,
    freq: Duration,
) {
    loop {
        tokio::time::sleep(freq).await;
        match resolver.resolve(&target).await {
            Ok(addrs) => {
                let now = Instant::now();
                let mut state = state.lock();
                for addr in addrs {
                    state.fold(addr, now);
                }
                state.commit(now);
            }
            Err(err) => {
                // Temporary lookup failures must not shrink the pool; the
                // generation does not advance, so existing entries stay.
                tracing::debug!("lookup of {target} failed: {err:#}");
            }
        }
    }
}
