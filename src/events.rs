//! Named publish points fired after state transitions.
//!
//! Listeners are synchronous and run inside the surrounding write
//! transaction: a listener that panics or blocks stalls the transaction, and
//! a serialization retry re-runs every listener of the retried attempt.
//! Listeners should therefore be cheap and idempotent (collect, log, enqueue)
//! and leave real side effects to after-commit machinery of the caller.

use std::sync::RwLock;

use uuid::Uuid;

use crate::model::{Allocation, Reservation, ReservedSlot};
use crate::observability;

struct Hook<A: ?Sized> {
    name: &'static str,
    listeners: RwLock<Vec<Box<dyn Fn(&A) + Send + Sync>>>,
}

impl<A: ?Sized> Hook<A> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: RwLock::new(Vec::new()),
        }
    }

    fn append(&self, listener: Box<dyn Fn(&A) + Send + Sync>) {
        self.listeners.write().expect("event hook lock").push(listener);
    }

    fn emit(&self, arg: &A) {
        let listeners = self.listeners.read().expect("event hook lock");
        if listeners.is_empty() {
            return;
        }
        metrics::counter!(observability::EVENTS_EMITTED_TOTAL, "hook" => self.name)
            .increment(1);
        for listener in listeners.iter() {
            listener(arg);
        }
    }
}

/// Per-context event hooks. Obtained via [`crate::Context::hooks`].
pub struct EventHooks {
    allocations_added: Hook<[Allocation]>,
    reservations_made: Hook<[Reservation]>,
    reservations_approved: Hook<[Reservation]>,
    reservations_denied: Hook<[Reservation]>,
    reservations_removed: Hook<[Reservation]>,
    reservations_confirmed: Hook<(Vec<Reservation>, Uuid)>,
    slots_reserved: Hook<[ReservedSlot]>,
    slots_released: Hook<[ReservedSlot]>,
}

impl Default for EventHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHooks {
    pub fn new() -> Self {
        Self {
            allocations_added: Hook::new("allocations_added"),
            reservations_made: Hook::new("reservations_made"),
            reservations_approved: Hook::new("reservations_approved"),
            reservations_denied: Hook::new("reservations_denied"),
            reservations_removed: Hook::new("reservations_removed"),
            reservations_confirmed: Hook::new("reservations_confirmed"),
            slots_reserved: Hook::new("reserved_slots_reserved"),
            slots_released: Hook::new("reserved_slots_released"),
        }
    }

    pub fn on_allocations_added(&self, f: impl Fn(&[Allocation]) + Send + Sync + 'static) {
        self.allocations_added.append(Box::new(f));
    }

    pub fn on_reservations_made(&self, f: impl Fn(&[Reservation]) + Send + Sync + 'static) {
        self.reservations_made.append(Box::new(f));
    }

    pub fn on_reservations_approved(&self, f: impl Fn(&[Reservation]) + Send + Sync + 'static) {
        self.reservations_approved.append(Box::new(f));
    }

    pub fn on_reservations_denied(&self, f: impl Fn(&[Reservation]) + Send + Sync + 'static) {
        self.reservations_denied.append(Box::new(f));
    }

    pub fn on_reservations_removed(&self, f: impl Fn(&[Reservation]) + Send + Sync + 'static) {
        self.reservations_removed.append(Box::new(f));
    }

    /// Fired when a session cart is confirmed; the payload carries the
    /// confirmed reservations and the session id.
    pub fn on_reservations_confirmed(
        &self,
        f: impl Fn(&(Vec<Reservation>, Uuid)) + Send + Sync + 'static,
    ) {
        self.reservations_confirmed.append(Box::new(f));
    }

    pub fn on_reserved_slots_reserved(&self, f: impl Fn(&[ReservedSlot]) + Send + Sync + 'static) {
        self.slots_reserved.append(Box::new(f));
    }

    pub fn on_reserved_slots_released(&self, f: impl Fn(&[ReservedSlot]) + Send + Sync + 'static) {
        self.slots_released.append(Box::new(f));
    }

    pub(crate) fn emit_allocations_added(&self, allocations: &[Allocation]) {
        self.allocations_added.emit(allocations);
    }

    pub(crate) fn emit_reservations_made(&self, reservations: &[Reservation]) {
        self.reservations_made.emit(reservations);
    }

    pub(crate) fn emit_reservations_approved(&self, reservations: &[Reservation]) {
        self.reservations_approved.emit(reservations);
    }

    pub(crate) fn emit_reservations_denied(&self, reservations: &[Reservation]) {
        self.reservations_denied.emit(reservations);
    }

    pub(crate) fn emit_reservations_removed(&self, reservations: &[Reservation]) {
        self.reservations_removed.emit(reservations);
    }

    pub(crate) fn emit_reservations_confirmed(
        &self,
        reservations: Vec<Reservation>,
        session_id: Uuid,
    ) {
        self.reservations_confirmed.emit(&(reservations, session_id));
    }

    pub(crate) fn emit_reserved_slots_reserved(&self, slots: &[ReservedSlot]) {
        self.slots_reserved.emit(slots);
    }

    pub(crate) fn emit_reserved_slots_released(&self, slots: &[ReservedSlot]) {
        self.slots_released.emit(slots);
    }
}
