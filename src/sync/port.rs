//! Synchronous rendezvous ports.

use log::trace;

use crate::sync::condition::CondId;
use crate::sync::lock::LockId;
use crate::{alloc_slot, Kernel};

/// Handle to a kernel port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortId(pub(crate) usize);

/// A single-slot synchronous channel for one integer message.
///
/// A transfer needs exactly one sender paired with exactly one receiver: a
/// send without a receiver blocks, and vice versa, and an unread message is
/// never overwritten. The matched counter updates across the two sides —
/// send consumes a receiver, receive consumes a sender — are what enforce
/// the pairing.
pub(crate) struct Port {
    pub(crate) name: String,
    pub(crate) lock: LockId,
    pub(crate) send_cond: CondId,
    pub(crate) recv_cond: CondId,
    /// Threads currently blocked inside `send` / `receive`.
    pub(crate) senders: usize,
    pub(crate) receivers: usize,
    pub(crate) buffer: i32,
    pub(crate) empty: bool,
}

impl Kernel {
    /// Create a port.
    pub fn port_create(&self, name: &str) -> PortId {
        let lock = self.lock_create(&format!("{name} lock"));
        let send_cond = self.condition_create(&format!("{name} send condition"), lock);
        let recv_cond = self.condition_create(&format!("{name} receive condition"), lock);
        let port = Port {
            name: name.to_string(),
            lock,
            send_cond,
            recv_cond,
            senders: 0,
            receivers: 0,
            buffer: 0,
            empty: true,
        };
        PortId(alloc_slot(&mut self.core().ports, port))
    }

    /// Destroy a port and the lock and conditions it owns. For the port a
    /// joinable thread carries, only the joiner may do this, after its
    /// receive has returned — by then the child can no longer be touching
    /// the port.
    pub fn port_destroy(&self, id: PortId) {
        let port = {
            let mut core = self.core();
            core.ports[id.0]
                .take()
                .unwrap_or_else(|| panic!("port {} already destroyed", id.0))
        };
        assert!(
            port.senders == 0 && port.receivers == 0,
            "destroying port \"{}\" with blocked threads",
            port.name
        );
        self.condition_destroy(port.send_cond);
        self.condition_destroy(port.recv_cond);
        self.lock_destroy(port.lock);
    }

    /// Send `message`, blocking until a receiver has arrived and the buffer
    /// is free.
    pub fn port_send(&self, id: PortId, message: i32) {
        let (lock, send_cond, recv_cond) = {
            let core = self.core();
            let port = core.port(id);
            (port.lock, port.send_cond, port.recv_cond)
        };

        self.lock_acquire(lock);
        self.core().port_mut(id).senders += 1;
        loop {
            let deliverable = {
                let core = self.core();
                let port = core.port(id);
                port.receivers > 0 && port.empty
            };
            if deliverable {
                break;
            }
            self.condition_wait(send_cond);
        }
        {
            let mut core = self.core();
            let port = core.port_mut(id);
            port.receivers -= 1;
            port.buffer = message;
            port.empty = false;
            trace!("deposited {message} in port \"{}\"", port.name);
        }
        self.condition_signal(recv_cond);
        self.lock_release(lock);
    }

    /// Receive a message, blocking until a sender has deposited one.
    pub fn port_receive(&self, id: PortId) -> i32 {
        let (lock, send_cond, recv_cond) = {
            let core = self.core();
            let port = core.port(id);
            (port.lock, port.send_cond, port.recv_cond)
        };

        self.lock_acquire(lock);
        self.core().port_mut(id).receivers += 1;
        // Let a sender already waiting for a receiver race to deposit.
        self.condition_signal(send_cond);
        loop {
            let readable = {
                let core = self.core();
                let port = core.port(id);
                port.senders > 0 && !port.empty
            };
            if readable {
                break;
            }
            self.condition_wait(recv_cond);
        }
        let message = {
            let mut core = self.core();
            let port = core.port_mut(id);
            port.senders -= 1;
            let message = port.buffer;
            port.empty = true;
            trace!("collected {message} from port \"{}\"", port.name);
            message
        };
        self.condition_signal(send_cond);
        self.lock_release(lock);
        message
    }
}

#[cfg(test)]
mod tests {
    use crate::Kernel;

    #[test]
    fn receiver_first_rendezvous() {
        let kernel = Kernel::new();
        let port = kernel.port_create("p");
        let child = kernel.fork_joinable("receiver", 1, {
            let kernel = kernel.clone();
            move || {
                let msg = kernel.port_receive(port);
                assert_eq!(msg, 7);
            }
        });
        kernel.yield_now(); // child blocks in receive
        kernel.port_send(port, 7);
        assert_eq!(kernel.join(child), 0);
        kernel.port_destroy(port);
    }

    #[test]
    fn sender_first_rendezvous() {
        let kernel = Kernel::new();
        let port = kernel.port_create("p");
        let child = kernel.fork_joinable("sender", 1, {
            let kernel = kernel.clone();
            move || kernel.port_send(port, 41)
        });
        kernel.yield_now(); // child blocks in send
        assert_eq!(kernel.port_receive(port), 41);
        assert_eq!(kernel.join(child), 0);
        kernel.port_destroy(port);
    }

    #[test]
    fn back_to_back_messages_are_not_overwritten() {
        let kernel = Kernel::new();
        let port = kernel.port_create("p");
        let child = kernel.fork_joinable("sender", 1, {
            let kernel = kernel.clone();
            move || {
                kernel.port_send(port, 1);
                kernel.port_send(port, 2);
            }
        });
        kernel.yield_now();
        assert_eq!(kernel.port_receive(port), 1);
        assert_eq!(kernel.port_receive(port), 2);
        assert_eq!(kernel.join(child), 0);
        kernel.port_destroy(port);
    }
}
