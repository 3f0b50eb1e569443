//! Shared test utilities for cache module tests.
//!
//! Provides a fake raw connection whose health and close behaviour tests can
//! steer, and a dialer that counts how often it actually ran.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::connection::{Dialed, EndpointInfo, RawConnection};
use crate::error::BoxError;

/// Observable state of a [`FakeConnection`], kept by the test after the
/// connection itself moved into the cache.
#[derive(Debug, Default)]
pub(crate) struct FakeControl {
    broken: AtomicBool,
    closes: AtomicUsize,
    fail_close: AtomicBool,
}

impl FakeControl {
    pub(crate) fn break_connection(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub(crate) struct FakeConnection {
    pub(crate) id: usize,
    control: Arc<FakeControl>,
}

impl FakeConnection {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            control: Arc::new(FakeControl::default()),
        }
    }

    pub(crate) fn control(&self) -> Arc<FakeControl> {
        Arc::clone(&self.control)
    }
}

impl RawConnection for FakeConnection {
    fn is_broken(&self) -> bool {
        self.control.broken.load(Ordering::SeqCst)
    }

    fn close(&self) -> io::Result<()> {
        self.control.closes.fetch_add(1, Ordering::SeqCst);
        self.control.broken.store(true, Ordering::SeqCst);
        if self.control.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::other("fake close failure"));
        }
        Ok(())
    }
}

/// Wrap a fake connection as a dial result.
pub(crate) fn dialed(conn: FakeConnection) -> Dialed<FakeConnection> {
    let info = EndpointInfo::with_addresses([format!("fake:{}", conn.id)]);
    Dialed::new(conn, info)
}

pub(crate) type FakeDial =
    Pin<Box<dyn Future<Output = Result<Dialed<FakeConnection>, BoxError>> + Send>>;

/// A dialer that counts invocations and hands out fresh fake connections.
#[derive(Debug, Clone, Default)]
pub(crate) struct CountingDialer {
    calls: Arc<AtomicUsize>,
    delay: Duration,
    fail: bool,
}

impl CountingDialer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// A one-shot dial function for `Cache::acquire`.
    ///
    /// The connection id is the 1-based invocation number.
    pub(crate) fn dial(&self) -> impl FnOnce(CancellationToken) -> FakeDial + Send + 'static {
        let calls = Arc::clone(&self.calls);
        let delay = self.delay;
        let fail = self.fail;
        move |_token: CancellationToken| -> FakeDial {
            Box::pin(async move {
                let id = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if fail {
                    return Err(BoxError::from("connection refused"));
                }
                Ok(dialed(FakeConnection::new(id)))
            })
        }
    }
}
