#![allow(dead_code)]

//! Shared helpers for cache integration tests.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use apiconn::{BoxError, CancellationToken, Dialed, EndpointInfo, RawConnection};

/// Health and close state of a [`MockConnection`], observable by the test.
#[derive(Debug, Default)]
pub struct MockState {
    pub broken: AtomicBool,
    pub closes: AtomicUsize,
    pub panic_on_health_check: AtomicBool,
}

impl MockState {
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn break_connection(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockConnection {
    pub serial: usize,
    pub state: Arc<MockState>,
}

impl RawConnection for MockConnection {
    fn is_broken(&self) -> bool {
        if self.state.panic_on_health_check.swap(false, Ordering::SeqCst) {
            panic!("health check exploded");
        }
        self.state.broken.load(Ordering::SeqCst)
    }

    fn close(&self) -> io::Result<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub type DialFuture = Pin<Box<dyn Future<Output = Result<Dialed<MockConnection>, BoxError>> + Send>>;

/// Hands out numbered mock connections and remembers their state.
#[derive(Debug, Clone, Default)]
pub struct MockDialer {
    dials: Arc<AtomicUsize>,
    states: Arc<std::sync::Mutex<Vec<Arc<MockState>>>>,
    delay: Duration,
}

impl MockDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// State of the `serial`-th dialed connection (1-based).
    pub fn state(&self, serial: usize) -> Arc<MockState> {
        Arc::clone(&self.states.lock().unwrap()[serial - 1])
    }

    pub fn dial(&self) -> impl FnOnce(CancellationToken) -> DialFuture + Send + 'static {
        let dials = Arc::clone(&self.dials);
        let states = Arc::clone(&self.states);
        let delay = self.delay;
        move |_token: CancellationToken| -> DialFuture {
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let state = Arc::new(MockState::default());
                let serial = {
                    let mut states = states.lock().unwrap();
                    states.push(Arc::clone(&state));
                    states.len()
                };
                dials.fetch_add(1, Ordering::SeqCst);
                let info = EndpointInfo::with_addresses([format!("mock:{serial}")]);
                Ok(Dialed::new(MockConnection { serial, state }, info))
            })
        }
    }
}
