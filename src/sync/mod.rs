//! Synchronization primitives.
//!
//! Four kinds, each built on the one below it: counting semaphores at the
//! bottom, mutex locks on a binary semaphore, Mesa condition variables on
//! private one-shot semaphores, and synchronous rendezvous ports on a lock
//! plus two conditions.
//!
//! Atomicity inside every primitive comes from masking interrupts, never
//! from another lock: a blocking lock inside a primitive would recursively
//! invoke the scheduler. Because several of these routines are entered with
//! interrupts already off (`Semaphore::v` for one), they restore the prior
//! interrupt level on exit instead of unconditionally enabling.

pub mod condition;
pub mod lock;
pub mod port;
pub mod semaphore;
