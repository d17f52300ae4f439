/*
    Lorraine
    https://github.com/lorraine-emu/lorraine

    Copyright 2022-2025 The Lorraine contributors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    agnus::scheduler.rs

    The event scheduler. The set of scheduled subsystems is small and
    fixed, so events live in a flat slot array (a wheel) rather than a
    heap. Each slot holds at most the single next due event of its owner.
    Events due at the same cycle fire in slot-index order.

*/

use crate::Cycle;

/// Trigger value of an idle slot.
pub const NEVER: Cycle = Cycle::MAX;

/// Slot indices. The order is part of the contract: same-cycle events are
/// serviced lowest index first.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Slot {
    CiaA = 0,
    CiaB,
    Disk,
    Copper,
    Blitter,
    Audio0,
    Audio1,
    Audio2,
    Audio3,
    Inspect,
    Secondary,
}

pub const SLOT_COUNT: usize = 11;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum EventId {
    #[default]
    None,
    // Copper slot
    CopRequestDma,
    CopFetch,
    CopWakeup,
    // Blitter slot
    BltCopySlow,
    BltCopyFake,
    BltLineFake,
    // Disk slot
    DskRotate,
    // Audio slots
    AudSample,
    // Inspection slot
    InsStatus,
    // CIA slots
    CiaExecute,
    CiaWakeup,
}

#[derive(Copy, Clone, Debug)]
pub struct EventSlot {
    pub trigger: Cycle,
    pub id: EventId,
    pub data: i64,
}

impl Default for EventSlot {
    fn default() -> Self {
        Self {
            trigger: NEVER,
            id: EventId::None,
            data: 0,
        }
    }
}

pub struct Scheduler {
    slots: [EventSlot; SLOT_COUNT],
    // Earliest trigger over all slots. Maintained on every mutation so the
    // per-cycle check is a single comparison.
    next_trigger: Cycle,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            slots: [EventSlot::default(); SLOT_COUNT],
            next_trigger: NEVER,
        }
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }

    #[inline]
    pub fn next_trigger(&self) -> Cycle {
        self.next_trigger
    }

    #[inline]
    pub fn is_due(&self, clock: Cycle) -> bool {
        clock >= self.next_trigger
    }

    #[inline]
    pub fn slot(&self, slot: Slot) -> &EventSlot {
        &self.slots[slot as usize]
    }

    #[inline]
    pub fn has_event(&self, slot: Slot) -> bool {
        self.slots[slot as usize].id != EventId::None
    }

    pub fn schedule_abs(&mut self, slot: Slot, cycle: Cycle, id: EventId) {
        self.schedule_abs_data(slot, cycle, id, 0);
    }

    pub fn schedule_abs_data(&mut self, slot: Slot, cycle: Cycle, id: EventId, data: i64) {
        debug_assert!(id != EventId::None);
        let s = &mut self.slots[slot as usize];
        s.trigger = cycle;
        s.id = id;
        s.data = data;
        if cycle < self.next_trigger {
            self.next_trigger = cycle;
        }
    }

    pub fn schedule_rel(&mut self, slot: Slot, now: Cycle, delta: Cycle, id: EventId) {
        self.schedule_abs(slot, now + delta, id);
    }

    /// Move an already scheduled event without changing its id.
    pub fn reschedule_abs(&mut self, slot: Slot, cycle: Cycle) {
        let s = &mut self.slots[slot as usize];
        debug_assert!(s.id != EventId::None);
        s.trigger = cycle;
        if cycle < self.next_trigger {
            self.next_trigger = cycle;
        } else {
            self.recompute_next_trigger();
        }
    }

    pub fn cancel(&mut self, slot: Slot) {
        let s = &mut self.slots[slot as usize];
        s.trigger = NEVER;
        s.id = EventId::None;
        s.data = 0;
        self.recompute_next_trigger();
    }

    /// Take the due event out of a slot, leaving it idle. The handler is
    /// expected to reschedule or leave the slot empty.
    pub fn take_due(&mut self, slot: Slot, clock: Cycle) -> Option<EventSlot> {
        let s = &mut self.slots[slot as usize];
        if s.id != EventId::None && s.trigger <= clock {
            let event = *s;
            s.trigger = NEVER;
            s.id = EventId::None;
            s.data = 0;
            Some(event)
        } else {
            None
        }
    }

    /// Called after all due slots of a cycle have been serviced.
    pub fn recompute_next_trigger(&mut self) {
        let mut next = NEVER;
        for s in self.slots.iter() {
            if s.trigger < next {
                next = s.trigger;
            }
        }
        self.next_trigger = next;
    }

    pub fn save_items(&self, w: &mut crate::snapshot::SnapshotWriter) {
        for s in self.slots.iter() {
            w.put_i64(s.trigger);
            w.put_u16(s.id as u16);
            w.put_i64(s.data);
        }
    }

    pub fn load_items(&mut self, r: &mut crate::snapshot::SnapshotReader) -> Result<(), crate::error::SnapshotError> {
        for s in self.slots.iter_mut() {
            s.trigger = r.take_i64()?;
            s.id = event_id_from_u16(r.take_u16()?);
            s.data = r.take_i64()?;
        }
        self.recompute_next_trigger();
        Ok(())
    }
}

fn event_id_from_u16(raw: u16) -> EventId {
    use EventId::*;
    match raw {
        1 => CopRequestDma,
        2 => CopFetch,
        3 => CopWakeup,
        4 => BltCopySlow,
        5 => BltCopyFake,
        6 => BltLineFake,
        7 => DskRotate,
        8 => AudSample,
        9 => InsStatus,
        10 => CiaExecute,
        11 => CiaWakeup,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_updates_primary_trigger() {
        let mut sched = Scheduler::new();
        assert_eq!(sched.next_trigger(), NEVER);

        sched.schedule_abs(Slot::Blitter, 100, EventId::BltCopySlow);
        assert_eq!(sched.next_trigger(), 100);

        sched.schedule_abs(Slot::Copper, 50, EventId::CopFetch);
        assert_eq!(sched.next_trigger(), 50);

        // A later event in another slot must not move the primary trigger
        sched.schedule_abs(Slot::Disk, 200, EventId::DskRotate);
        assert_eq!(sched.next_trigger(), 50);
    }

    #[test]
    fn take_due_respects_trigger_cycle() {
        let mut sched = Scheduler::new();
        sched.schedule_abs(Slot::Copper, 10, EventId::CopFetch);

        assert!(sched.take_due(Slot::Copper, 9).is_none());
        let event = sched.take_due(Slot::Copper, 10).unwrap();
        assert_eq!(event.id, EventId::CopFetch);
        assert!(!sched.has_event(Slot::Copper));
    }

    #[test]
    fn cancel_clears_slot_and_recomputes() {
        let mut sched = Scheduler::new();
        sched.schedule_abs(Slot::Copper, 10, EventId::CopFetch);
        sched.schedule_abs(Slot::Blitter, 20, EventId::BltCopySlow);

        sched.cancel(Slot::Copper);
        assert_eq!(sched.next_trigger(), 20);

        sched.cancel(Slot::Blitter);
        assert_eq!(sched.next_trigger(), NEVER);
    }

    #[test]
    fn same_cycle_events_fire_in_slot_order() {
        let mut sched = Scheduler::new();
        sched.schedule_abs(Slot::Blitter, 5, EventId::BltCopySlow);
        sched.schedule_abs(Slot::Copper, 5, EventId::CopFetch);

        // Service in slot-index order: Copper (3) before Blitter (4)
        let mut order = Vec::new();
        for slot in [Slot::CiaA, Slot::CiaB, Slot::Disk, Slot::Copper, Slot::Blitter] {
            if let Some(event) = sched.take_due(slot, 5) {
                order.push(event.id);
            }
        }
        assert_eq!(order, vec![EventId::CopFetch, EventId::BltCopySlow]);
    }
}
