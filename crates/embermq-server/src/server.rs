//! Accept loop: binds the listener, spreads new sockets across the
//! worker pool round-robin, and drives periodic state saves.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use log::{error, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use crate::config::Config;
use crate::store::{Store, StoreHandle};
use crate::worker::{Worker, WorkerMsg};

const LISTENER: Token = Token(0);

/// Control channel capacity per worker.
const CHANNEL_CAPACITY: usize = 4096;

/// How often persisted state is written while running.
const SAVE_INTERVAL: Duration = Duration::from_secs(300);

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    worker_senders: Vec<Sender<WorkerMsg>>,
    worker_threads: Vec<JoinHandle<()>>,
    next_worker: usize,
    store: StoreHandle,
    config: Arc<Config>,
    last_save: Instant,
}

impl Server {
    pub fn new(num_workers: usize, config: Arc<Config>) -> io::Result<Self> {
        let store: StoreHandle = Arc::new(Store::new());

        if config.persistence.enabled {
            std::fs::create_dir_all(&config.persistence.dir)?;
            if let Err(e) = store.load_state(&config.persistence.dir, Instant::now()) {
                // A bad state file must not keep the broker down.
                error!("failed to load persisted state: {}", e);
            }
        }

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(config.server.bind)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        info!("embermq listening on {}", config.server.bind);

        let mut worker_senders = Vec::with_capacity(num_workers);
        let mut worker_threads = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let (tx, rx) = bounded(CHANNEL_CAPACITY);
            worker_senders.push(tx);

            let mut worker = Worker::new(id, store.clone(), rx, config.clone())?;
            let handle = thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || {
                    if let Err(e) = worker.run() {
                        error!("worker {} exited with error: {}", id, e);
                    }
                })?;
            worker_threads.push(handle);
        }

        Ok(Self {
            poll,
            listener,
            worker_senders,
            worker_threads,
            next_worker: 0,
            store,
            config,
            last_save: Instant::now(),
        })
    }

    /// Blocking accept loop.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(64);
        loop {
            self.poll.poll(&mut events, Some(Duration::from_secs(1)))?;

            for event in events.iter() {
                if event.token() == LISTENER {
                    self.accept_pending();
                }
            }

            self.maybe_save_state();
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let sender = &self.worker_senders[self.next_worker];
                    self.next_worker = (self.next_worker + 1) % self.worker_senders.len();
                    if sender
                        .send(WorkerMsg::NewConnection { stream, addr })
                        .is_err()
                    {
                        warn!("worker channel closed, dropping connection from {}", addr);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn maybe_save_state(&mut self) {
        if !self.config.persistence.enabled {
            return;
        }
        if self.last_save.elapsed() < SAVE_INTERVAL {
            return;
        }
        self.last_save = Instant::now();
        if let Err(e) = self.store.save_state(&self.config.persistence.dir) {
            error!("periodic state save failed: {}", e);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for sender in &self.worker_senders {
            let _ = sender.send(WorkerMsg::Shutdown);
        }
        for handle in self.worker_threads.drain(..) {
            let _ = handle.join();
        }
        if self.config.persistence.enabled {
            if let Err(e) = self.store.save_state(&self.config.persistence.dir) {
                error!("state save on shutdown failed: {}", e);
            }
        }
    }
}
