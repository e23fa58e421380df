use crate::{HttpClient, HttpResponse};
use request_log::RequestLog;
use server_pool::ServerPool;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// A queued request moves between three states:
/// 1. Waiting to be sent -- no attempt timer, no HTTP attempt.
/// 2. In flight -- attempt timer and HTTP attempt both active.
/// 3. Cooling off -- the attempt failed retryably but its timer has not
///    elapsed yet, so it may not be re-sent.
///
/// The scheduler always takes the first entry in `(parked, prio, seq)`
/// order, so in-flight and cooling requests sort behind everything that
/// is eligible to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    parked: bool,
    prio: i32,
    seq: u64,
}

struct Pending {
    prio: i32,
    op: &'static str,
    body: String,
    maxrlen: usize,
    logstr: Option<String>,
    reply: oneshot::Sender<HttpResponse>,
    ntries: u32,
    attempt: u32,
    t_start: Instant,
    target: Option<SocketAddr>,
    http_task: Option<tokio::task::JoinHandle<()>>,
    http_active: bool,
    timer_parked: bool,
}

enum Event {
    Enqueue {
        prio: i32,
        op: &'static str,
        body: String,
        maxrlen: usize,
        logstr: Option<String>,
        reply: oneshot::Sender<HttpResponse>,
    },
    SetCapacity(u32),
    SetLog(RequestLog),
    Flush,
    TimedOut {
        seq: u64,
        attempt: u32,
    },
    HttpDone {
        seq: u64,
        attempt: u32,
        response: Option<HttpResponse>,
    },
    Refill,
    #[cfg(test)]
    Inspect(oneshot::Sender<Snapshot>),
}

#[cfg(test)]
#[derive(Debug)]
struct Snapshot {
    bucket_cap: f64,
    mu_capperreq: f64,
    spercap: f64,
    maxburst_cap: f64,
    inflight: usize,
    queued: usize,
}

/// Handle to a running request queue. Cheap to clone; the queue dies when
/// the last handle is dropped, flushing any remaining work.
#[derive(Clone)]
pub struct RequestQueue {
    events: flume::Sender<Event>,
    _actor: Arc<AbortOnDrop>,
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl RequestQueue {
    pub fn new(pool: ServerPool, client: Arc<dyn HttpClient>) -> Self {
        let (events, events_rx) = flume::unbounded();
        let actor = Actor::new(pool, client, events.clone());
        let task = tokio::spawn(actor.run(events_rx));
        Self {
            events,
            _actor: Arc::new(AbortOnDrop(task)),
        }
    }

    /// Queue a request. The receiver resolves with the terminal HTTP
    /// response; it errors if the queue is flushed or dropped first.
    /// Transient failures (connection errors, 5xx, throttling) are
    /// retried internally and never surface here.
    pub fn enqueue(
        &self,
        prio: i32,
        op: &'static str,
        body: String,
        maxrlen: usize,
        logstr: Option<String>,
    ) -> oneshot::Receiver<HttpResponse> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Enqueue {
                prio,
                op,
                body,
                maxrlen,
                logstr,
                reply,
            })
            .ok();
        rx
    }

    /// Set the provisioned capacity in units per second; 0 disables rate
    /// limiting.
    pub fn set_capacity(&self, capacity: u32) {
        self.events.send(Event::SetCapacity(capacity)).ok();
    }

    /// Log every completed attempt to `log`.
    pub fn set_log(&self, log: RequestLog) {
        self.events.send(Event::SetLog(log)).ok();
    }

    /// Drop all queued requests and cancel in-flight attempts. No reply
    /// channels are resolved.
    pub fn flush(&self) {
        self.events.send(Event::Flush).ok();
    }

    #[cfg(test)]
    async fn snapshot(&self) -> Snapshot {
        let (tx, rx) = oneshot::channel();
        self.events.send(Event::Inspect(tx)).ok();
        rx.await.unwrap()
    }
}

struct Actor {
    pool: ServerPool,
    client: Arc<dyn HttpClient>,
    events: flume::Sender<Event>,

    /// Rolling mean of capacity units consumed per request.
    mu_capperreq: f64,
    /// Modelled token bucket. Starts at 300 seconds of 50k units/s: an
    /// effectively unlimited burst until the first throttle is seen.
    bucket_cap: f64,
    /// Seconds for one capacity unit to accumulate; 0 = unlimited.
    spercap: f64,
    maxburst_cap: f64,

    /// Request latency mean and mean deviation, maintained the way TCP
    /// estimates RTT.
    tmu: f64,
    tmud: f64,

    inflight: usize,
    next_seq: u64,
    requests: HashMap<u64, Pending>,
    order: BTreeSet<OrderKey>,
    log: Option<RequestLog>,
    refill_pending: bool,
}

impl Actor {
    fn new(pool: ServerPool, client: Arc<dyn HttpClient>, events: flume::Sender<Event>) -> Self {
        let mut actor = Self {
            pool,
            client,
            events,
            mu_capperreq: 1.0,
            bucket_cap: 300.0 * 50000.0,
            spercap: 0.0,
            maxburst_cap: 500.0,
            tmu: 1.0,
            tmud: 0.25,
            inflight: 0,
            next_seq: 0,
            requests: HashMap::new(),
            order: BTreeSet::new(),
            log: None,
            refill_pending: false,
        };
        actor.set_capacity(0);
        actor
    }

    async fn run(mut self, events: flume::Receiver<Event>) {
        while let Ok(event) = events.recv_async().await {
            self.handle(event);
            // Coalesce everything already queued before running the
            // scheduler, so a burst of enqueues is prioritized as a
            // whole rather than first-come-first-sent.
            while let Ok(event) = events.try_recv() {
                self.handle(event);
            }
            self.run_queue();
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Enqueue {
                prio,
                op,
                body,
                maxrlen,
                logstr,
                reply,
            } => {
                let seq = self.next_seq;
                self.next_seq += 1;
                let pending = Pending {
                    prio,
                    op,
                    body,
                    maxrlen,
                    logstr,
                    reply,
                    ntries: 0,
                    attempt: 0,
                    t_start: Instant::now(),
                    target: None,
                    http_task: None,
                    http_active: false,
                    timer_parked: false,
                };
                self.order.insert(OrderKey {
                    parked: false,
                    prio,
                    seq,
                });
                self.requests.insert(seq, pending);
            }
            Event::SetCapacity(capacity) => self.set_capacity(capacity),
            Event::SetLog(log) => self.log = Some(log),
            Event::Flush => self.flush(),
            Event::TimedOut { seq, attempt } => self.handle_timeout(seq, attempt),
            Event::HttpDone {
                seq,
                attempt,
                response,
            } => self.handle_http_done(seq, attempt, response),
            Event::Refill => {
                self.refill_pending = false;
                self.bucket_cap += 1.0;
            }
            #[cfg(test)]
            Event::Inspect(tx) => {
                tx.send(Snapshot {
                    bucket_cap: self.bucket_cap,
                    mu_capperreq: self.mu_capperreq,
                    spercap: self.spercap,
                    maxburst_cap: self.maxburst_cap,
                    inflight: self.inflight,
                    queued: self.requests.len(),
                })
                .ok();
            }
        }
    }

    fn set_capacity(&mut self, capacity: u32) {
        self.spercap = if capacity > 0 {
            1.0 / capacity as f64
        } else {
            0.0
        };
        // Allow up to 5 seconds of provisioned capacity in flight at
        // once, capped at 500 requests to bound open connections.
        self.maxburst_cap = if capacity > 0 && capacity < 100 {
            capacity as f64 * 5.0
        } else {
            500.0
        };
    }

    fn flush(&mut self) {
        for (_, pending) in self.requests.drain() {
            if pending.http_active {
                self.inflight -= 1;
            }
            if let Some(task) = pending.http_task {
                task.abort();
            }
            // Dropping `pending.reply` cancels the upstream waiter.
        }
        self.order.clear();
    }

    /// The attempt timer fired. If the HTTP attempt is still running it
    /// is abandoned; either way the request becomes eligible to send
    /// again, with its backoff doubled by the bumped try count.
    fn handle_timeout(&mut self, seq: u64, attempt: u32) {
        let Some(pending) = self.requests.get_mut(&seq) else {
            return;
        };
        if pending.attempt != attempt || !pending.timer_parked {
            return;
        }

        if pending.http_active {
            if let Some(task) = pending.http_task.take() {
                task.abort();
            }
            pending.http_active = false;
            self.inflight -= 1;
            if let Some(log) = &self.log {
                log_attempt(log, pending, None, 0.0);
            }
            pending.target = None;
        }

        self.order.remove(&OrderKey {
            parked: true,
            prio: pending.prio,
            seq,
        });
        pending.timer_parked = false;
        self.order.insert(OrderKey {
            parked: false,
            prio: pending.prio,
            seq,
        });
    }

    fn handle_http_done(&mut self, seq: u64, attempt: u32, response: Option<HttpResponse>) {
        let Some(pending) = self.requests.get_mut(&seq) else {
            return;
        };
        if pending.attempt != attempt || !pending.http_active {
            return;
        }

        // Measure consumption before anything else so throttled capacity
        // still feeds the rolling average.
        let mut capacity = 0.0;
        if let Some(body) = response.as_ref().and_then(|r| r.bytes()) {
            capacity = extract_capacity(body);
            if capacity != 0.0 {
                self.mu_capperreq += (capacity - self.mu_capperreq) * 0.01;
                self.bucket_cap = (self.bucket_cap - capacity).max(0.0);
            }
        }

        let treq = pending.t_start.elapsed().as_secs_f64();

        if let Some(log) = &self.log {
            log_attempt(log, pending, response.as_ref(), capacity);
        }

        pending.http_active = false;
        pending.http_task = None;
        pending.target = None;
        self.inflight -= 1;

        let throttled = response.as_ref().is_some_and(is_throttle);
        if throttled {
            // Out of provisioned throughput: empty the modelled bucket so
            // nothing is sent until refill ticks put tokens back. The
            // request stays queued, cooling off behind its timer.
            self.bucket_cap = 0.0;
            return;
        }

        match response {
            Some(response) if response.status < 500 => {
                // Terminal: anything which is not an internal DynamoDB
                // error or throttling goes back upstream.
                let pending = self.requests.remove(&seq).unwrap();
                self.order.remove(&OrderKey {
                    parked: true,
                    prio: pending.prio,
                    seq,
                });

                // Update the latency estimators. Unlike TCP we update on
                // retried requests too, since we know which attempt this
                // response answers.
                self.tmu += (treq - self.tmu) * 0.125;
                self.tmud += ((treq - self.tmu).abs() - self.tmud) * 0.25;

                pending.reply.send(response).ok();
            }
            // 5xx or connection failure: leave the request queued and
            // cooling off; it becomes sendable when its timer fires.
            _ => {}
        }
    }

    fn run_queue(&mut self) {
        loop {
            let load = self.inflight as f64 * self.mu_capperreq;
            if load >= self.maxburst_cap {
                break;
            }
            if self.spercap > 0.0 && load >= self.bucket_cap {
                break;
            }
            let Some(&key) = self.order.first() else {
                break;
            };
            if key.parked {
                // Only in-flight or cooling-off requests remain.
                break;
            }
            self.send_request(key);
        }

        // (Re)start the token accumulation timer, unless rate limiting is
        // off or the bucket already holds 300 seconds of capacity.
        if self.spercap > 0.0
            && !self.refill_pending
            && self.bucket_cap * self.spercap < 300.0
        {
            self.refill_pending = true;
            let events = self.events.clone();
            let delay = Duration::from_secs_f64(self.spercap);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                events.send(Event::Refill).ok();
            });
        }
    }

    fn send_request(&mut self, key: OrderKey) {
        let events = self.events.clone();
        let client = self.client.clone();
        let addr = self.pool.pick();
        let seq = key.seq;

        let pending = self.requests.get_mut(&seq).expect("ordered key has entry");
        pending.target = Some(addr);
        pending.t_start = Instant::now();

        // Timeout starts at 1.5x the mean latency plus four mean
        // deviations and doubles per retry up to 15 seconds. The 1.5
        // factor (vs TCP's 1.0) absorbs the extra RTT that a single lost
        // segment costs when tunneling TCP over TCP.
        let timeo = if pending.ntries < 20 {
            ((self.tmu * 1.5 + self.tmud * 4.0) * (1u32 << pending.ntries) as f64).min(15.0)
        } else {
            15.0
        };
        pending.ntries += 1;
        pending.attempt += 1;
        let attempt = pending.attempt;

        {
            let events = events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(timeo)).await;
                events.send(Event::TimedOut { seq, attempt }).ok();
            });
        }
        pending.timer_parked = true;

        let op = pending.op;
        let body = pending.body.clone();
        let maxrlen = pending.maxrlen;
        pending.http_task = Some(tokio::spawn(async move {
            let response = client.request(addr, op, body.as_bytes(), maxrlen).await;
            events
                .send(Event::HttpDone {
                    seq,
                    attempt,
                    response,
                })
                .ok();
        }));
        pending.http_active = true;
        self.inflight += 1;

        self.order.remove(&OrderKey {
            parked: false,
            prio: key.prio,
            seq,
        });
        self.order.insert(OrderKey {
            parked: true,
            prio: key.prio,
            seq,
        });
    }
}

/// HTTP 400 whose body mentions ProvisionedThroughputExceededException.
/// The SDKs parse the `__type` field and split on '#'; a substring scan
/// catches everything they catch, and a false positive merely pauses
/// bursting.
fn is_throttle(response: &HttpResponse) -> bool {
    if response.status != 400 {
        return false;
    }
    response.bytes().is_some_and(|body| {
        memchr::memmem::find(body, b"#ProvisionedThroughputExceededException").is_some()
    })
}

/// Pull `ConsumedCapacity.CapacityUnits` out of a response body. Returns
/// 0 when the field is absent, unparseable, or out of the range DynamoDB
/// is specified to return.
fn extract_capacity(body: &[u8]) -> f64 {
    let Ok(v) = serde_json::from_slice::<serde_json::Value>(body) else {
        return 0.0;
    };
    let Some(c) = v
        .get("ConsumedCapacity")
        .and_then(|c| c.get("CapacityUnits"))
        .and_then(|c| c.as_f64())
    else {
        return 0.0;
    };
    if !(0.0..=400.0).contains(&c) {
        tracing::warn!("invalid DynamoDB CapacityUnits returned: {c}");
        return 0.0;
    }
    c
}

fn log_attempt(log: &RequestLog, pending: &Pending, response: Option<&HttpResponse>, capacity: f64) {
    let (status, bodylen) = match response {
        Some(response) => (response.status, response.body_len()),
        None => (0, 0),
    };
    let peer = match pending.target {
        Some(addr) => addr.to_string(),
        None => String::new(),
    };
    log.write_line(&format!(
        "|{}|{}|{}|{}|{}|{}|{:.6}",
        pending.op,
        pending.logstr.as_deref().unwrap_or(""),
        status,
        peer,
        pending.t_start.elapsed().as_micros(),
        bodylen,
        capacity,
    ));
}
