//! Local port allocation for receiver endpoints
//!
//! Probing only proves a port was free at that instant; another process can
//! still take it before the receiver binds. [`PortAllocator`] leases ports so
//! that at least sessions of this bridge never collide with each other.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use crate::error::SessionError;

/// Probe whether a listening socket can be bound on `port` and released again
pub async fn is_port_available(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    match tokio::time::timeout(timeout, TcpListener::bind(addr)).await {
        Ok(Ok(listener)) => {
            drop(listener);
            true
        }
        _ => false,
    }
}

/// First available port in `[start, start + max_tries)`
pub async fn find_available_port(
    start: u16,
    max_tries: u16,
    timeout: Duration,
) -> Result<u16, SessionError> {
    find_port_excluding(start, max_tries, timeout, |_| false).await
}

async fn find_port_excluding<F>(
    start: u16,
    max_tries: u16,
    timeout: Duration,
    skip: F,
) -> Result<u16, SessionError>
where
    F: Fn(u16) -> bool,
{
    for offset in 0..max_tries {
        let Some(port) = start.checked_add(offset) else {
            break;
        };
        if skip(port) {
            continue;
        }
        if is_port_available(port, timeout).await {
            return Ok(port);
        }
    }
    Err(SessionError::NoPortAvailable {
        start,
        attempts: max_tries,
    })
}

/// Hands out ports that no live session of this bridge holds
#[derive(Debug, Clone)]
pub struct PortAllocator {
    start: u16,
    max_tries: u16,
    probe_timeout: Duration,
    leased: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new(start: u16, max_tries: u16, probe_timeout: Duration) -> Self {
        Self {
            start,
            max_tries,
            probe_timeout,
            leased: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Probe for a free port and lease it to the caller
    pub async fn allocate(&self) -> Result<PortLease, SessionError> {
        loop {
            let leased = self.leased.clone();
            let port = find_port_excluding(self.start, self.max_tries, self.probe_timeout, |p| {
                leased.lock().contains(&p)
            })
            .await?;

            // Another session may have leased it while we were probing
            if self.leased.lock().insert(port) {
                tracing::debug!("Leased port {}", port);
                return Ok(PortLease {
                    port,
                    leased: Some(self.leased.clone()),
                });
            }
        }
    }

    pub fn leased_count(&self) -> usize {
        self.leased.lock().len()
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.leased.lock().contains(&port)
    }
}

/// A port held by one session; returned to the allocator exactly once
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    leased: Option<Arc<Mutex<HashSet<u16>>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_released(&self) -> bool {
        self.leased.is_none()
    }

    /// Return the port. Returns `true` only on the call that released it.
    pub fn release(&mut self) -> bool {
        match self.leased.take() {
            Some(leased) => {
                leased.lock().remove(&self.port);
                tracing::debug!("Released port {}", self.port);
                true
            }
            None => false,
        }
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.release();
    }
}
