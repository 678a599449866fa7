use crate::background::BackgroundFetcher;
use crate::connection::{NetConnector, handle_connection, pump_background_fetch};
use crate::resolver::Resolver;
use crate::server_session::SessionPool;
use crate::txn::ProcessCtx;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use strata_cache::CacheStore;
use strata_core::{ProxyConfig, RecordsStore};
use strata_hooks::UserArgRegistry;
use strata_io::{Reactor, StekStore};
use tracing::{error, info};

/// Shared state across all worker threads. Workers read configuration via
/// atomic loads; the admin plane swaps it on reload.
pub struct SharedState {
    pub config: Arc<ArcSwap<ProxyConfig>>,
    pub records: Arc<RecordsStore>,
    pub drain: Arc<AtomicBool>,
    pub shutdown: Arc<AtomicBool>,
    pub stek: Arc<StekStore>,
    pub user_args: Arc<UserArgRegistry>,
    pub single_flight: Arc<DashMap<String, ()>>,
    session_seq: AtomicU64,
}

impl SharedState {
    pub fn new(config: ProxyConfig, stek: StekStore) -> Arc<Self> {
        let records = Arc::new(RecordsStore::from_config(&config));
        Arc::new(Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            records,
            drain: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            stek: Arc::new(stek),
            user_args: Arc::new(UserArgRegistry::new()),
            single_flight: Arc::new(DashMap::new()),
            session_seq: AtomicU64::new(0),
        })
    }

    pub fn next_session_id(&self) -> u64 {
        self.session_seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Build the per-worker process context: reactor-bound collaborators are
/// created fresh per thread (shared-nothing data plane), process-wide
/// pieces are handles into `SharedState`.
pub fn build_process_ctx(
    rx: &mut Reactor,
    shared: &SharedState,
    reactor: Rc<RefCell<Reactor>>,
) -> Rc<ProcessCtx> {
    let config = shared.config.load_full();
    let pool = Rc::new(RefCell::new(SessionPool::new(
        config.proxy.keepalive_pool_size,
        config.proxy.keep_alive_no_activity_ms,
    )));
    let pool_cont = rx.register_cont(pool.clone());
    pool.borrow_mut().set_cont(pool_cont);
    Rc::new(ProcessCtx {
        config,
        global_hooks: Rc::new(RefCell::new(strata_hooks::HookList::new())),
        cache: Rc::new(RefCell::new(CacheStore::new(
            shared.config.load().cache.clone(),
        ))),
        pool,
        resolver: Rc::new(Resolver::new()),
        connector: Rc::new(RefCell::new(NetConnector::new(reactor))),
        user_args: Arc::clone(&shared.user_args),
        stek: Arc::clone(&shared.stek),
        background: Rc::new(RefCell::new(BackgroundFetcher::new(Arc::clone(
            &shared.single_flight,
        )))),
        drain: Arc::clone(&shared.drain),
    })
}

/// Spawn monoio worker threads, one per core. Each runs an independent
/// runtime, listener, reactor, cache, and session pool.
pub fn spawn_workers(shared: Arc<SharedState>, num_workers: usize) -> Vec<std::thread::JoinHandle<()>> {
    let listen_addr = shared.config.load().proxy.http_addr.clone();
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let shared = Arc::clone(&shared);
        let addr = listen_addr.clone();

        let handle = std::thread::Builder::new()
            .name(format!("strata-worker-{worker_id}"))
            .spawn(move || {
                let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                    .enable_all()
                    .build()
                    .expect("Failed to build monoio runtime");
                rt.block_on(worker_loop(worker_id, shared, addr));
            })
            .expect("Failed to spawn worker thread");
        handles.push(handle);
    }

    info!(workers = num_workers, addr = %listen_addr, "Workers spawned");
    handles
}

/// Build the synthetic no-cache GET used for a scheduled revalidation.
fn revalidation_request(url: &str) -> Option<strata_core::http::RequestHeader> {
    let rest = url.strip_prefix("http://").or_else(|| url.strip_prefix("https://"))?;
    let (host, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let mut req = strata_core::http::RequestHeader::new(::http::Method::GET, path);
    req.fields.set("host", host);
    req.fields.set("cache-control", "no-cache");
    Some(req)
}

async fn worker_loop(worker_id: usize, shared: Arc<SharedState>, addr: String) {
    use monoio::net::TcpListener;

    let listener = TcpListener::bind(&addr).unwrap_or_else(|e| {
        panic!("Worker {worker_id} failed to bind to {addr}: {e}");
    });
    info!(worker = worker_id, addr = %addr, "Worker listening");

    let reactor = Rc::new(RefCell::new(Reactor::new()));
    let process = {
        let mut rx = reactor.borrow_mut();
        build_process_ctx(&mut rx, &shared, Rc::clone(&reactor))
    };

    // Timer pump: the reactor clock is virtual and advances off wall time.
    {
        let reactor = Rc::clone(&reactor);
        let shared = Arc::clone(&shared);
        monoio::spawn(async move {
            let tick = std::time::Duration::from_millis(50);
            loop {
                monoio::time::sleep(tick).await;
                {
                    let mut rx = reactor.borrow_mut();
                    rx.advance(tick.as_millis() as u64);
                    rx.run();
                }
                if shared.shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
        });
    }

    // Background fetch pump: drain plugin-scheduled refetches and due
    // cache revalidations into synthetic transactions.
    {
        let reactor = Rc::clone(&reactor);
        let process = Rc::clone(&process);
        let shared = Arc::clone(&shared);
        monoio::spawn(async move {
            let tick = std::time::Duration::from_millis(200);
            loop {
                monoio::time::sleep(tick).await;
                {
                    let now = reactor.borrow().now_ms();
                    let due = process.cache.borrow_mut().take_due_updates(now);
                    for url in due {
                        if let Some(req) = revalidation_request(&url) {
                            process.background.borrow_mut().schedule(&req);
                        }
                    }
                }
                let pending = process.background.borrow_mut().take_pending();
                for request in pending {
                    let reactor = Rc::clone(&reactor);
                    let process = Rc::clone(&process);
                    let ssn_id = shared.next_session_id();
                    monoio::spawn(pump_background_fetch(reactor, process, request, ssn_id));
                }
                if shared.shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
        });
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                if shared.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if shared.drain.load(Ordering::Relaxed) {
                    // Draining: refuse new sessions; in-flight ones finish.
                    drop(stream);
                    continue;
                }
                let _ = stream.set_nodelay(true);
                let reactor = Rc::clone(&reactor);
                let process = Rc::clone(&process);
                let ssn_id = shared.next_session_id();
                monoio::spawn(async move {
                    if let Err(e) =
                        handle_connection(stream, peer_addr, reactor, process, ssn_id).await
                    {
                        tracing::debug!(error = %e, "Connection closed");
                    }
                });
            }
            Err(e) => {
                error!(worker = worker_id, error = %e, "Accept error");
            }
        }
    }
}
