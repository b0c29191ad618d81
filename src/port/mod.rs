//! 포트 할당기: 예약된 포트 집합을 관리하고 사용 가능한 TCP 포트를 찾습니다.
//!
//! Availability is a bind-then-release probe. Nothing holds the port between
//! the probe and the moment the child process binds it, so another process can
//! still grab it in that window.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Mutex, MutexGuard};

use socket2::{Domain, Socket, Type};

use crate::manifest::ToolDescriptor;

/// Ports at or below this value are never handed out.
pub const PRIVILEGED_PORT_MAX: u16 = 1024;

pub const DEFAULT_RANGE_MIN: u16 = 10_000;
pub const DEFAULT_RANGE_MAX: u16 = 20_000;

/// Finds free ports and remembers which ones have been handed out.
pub struct PortAllocator {
    reserved: Mutex<BTreeSet<u16>>,
    default_range: (u16, u16),
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_RANGE_MIN, DEFAULT_RANGE_MAX)
    }
}

impl PortAllocator {
    /// `default_min..=default_max` is the fallback range used for tools that
    /// declare no usable port of their own.
    pub fn new(default_min: u16, default_max: u16) -> Self {
        Self {
            reserved: Mutex::new(BTreeSet::new()),
            default_range: (default_min, default_max),
        }
    }

    pub fn default_range(&self) -> (u16, u16) {
        self.default_range
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        // 예약 집합은 단순 정수 집합이라 poison 이후에도 그대로 사용 가능
        self.reserved.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Probe whether `port` can be bound on all interfaces right now.
    ///
    /// The listener is dropped before returning. Privileged ports always
    /// report `false`.
    pub fn is_available(port: u16) -> bool {
        if port <= PRIVILEGED_PORT_MAX {
            return false;
        }
        probe_bind(port)
    }

    /// Scan `min..=max` in ascending order and reserve the first port that is
    /// both bindable and not already reserved.
    pub fn find_available(&self, min: u16, max: u16) -> Option<u16> {
        if min > max {
            return None;
        }
        let mut reserved = self.lock();
        let found = (min..=max)
            .filter(|port| !reserved.contains(port))
            .find(|&port| Self::is_available(port))?;
        reserved.insert(found);
        tracing::debug!("Reserved port {} from range {}-{}", found, min, max);
        Some(found)
    }

    pub fn reserve(&self, port: u16) {
        if self.lock().insert(port) {
            tracing::debug!("Reserved port {}", port);
        }
    }

    /// Releasing a port that isn't reserved is a no-op.
    pub fn release(&self, port: u16) {
        if self.lock().remove(&port) {
            tracing::debug!("Released port {}", port);
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    pub fn reserved(&self) -> Vec<u16> {
        self.lock().iter().copied().collect()
    }

    /// Pick (and reserve) the port a tool should run on.
    ///
    /// A fixed port is used when it is free; otherwise the default range is
    /// scanned. A declared range is scanned as-is.
    pub fn resolve_port_for(&self, descriptor: &ToolDescriptor) -> Option<u16> {
        let start = &descriptor.start;
        if let Some(port) = start.port {
            {
                let mut reserved = self.lock();
                if !reserved.contains(&port) && Self::is_available(port) {
                    reserved.insert(port);
                    return Some(port);
                }
            }
            tracing::warn!(
                "Fixed port {} for '{}' is unavailable, falling back to default range",
                port,
                descriptor.id
            );
            let (min, max) = self.default_range;
            return self.find_available(min, max);
        }

        if let Some(range) = &start.port_range {
            return self.find_available(range.min, range.max);
        }

        let (min, max) = self.default_range;
        self.find_available(min, max)
    }
}

fn probe_bind(port: u16) -> bool {
    let socket = match Socket::new(Domain::IPV4, Type::STREAM, None) {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!("Could not create probe socket: {}", e);
            return false;
        }
    };
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into()).is_ok() && socket.listen(1).is_ok()
}
