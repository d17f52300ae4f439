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

    agnus::blitter::slowblit.rs

    The micro-programmed Blitter. Each blit shape selects a micro program
    executed one instruction per Blitter bus slot. A micro instruction is
    a bitwise OR of the actions below; REPEAT rewinds the program counter
    while iterations remain, BLTDONE terminates the blit.

    The cycle sequences derive from the hardware manual's table 6.2 with
    the known corrections applied: shape 1 (D only) uses the longer
    sequence D0 -- -- D1 -- -- | -- D2, and the fill variants of shapes
    1, 5, 9 and D insert an extra idle slot per iteration.

*/

use lazy_static::lazy_static;

use crate::{
    agnus::{inc_chip_ptr, BusOwner},
    bus::Bus,
    dma_cycles,
};

use super::{fill_word, minterm, BlitKind, Blitter};

pub const NOTHING: u16 = 0b0000_0000_0000;
pub const BUSIDLE: u16 = 0b0000_0000_0001;
pub const BUS: u16 = 0b0000_0000_0010;
pub const WRITE_D: u16 = 0b0000_0000_0100;
pub const FETCH_A: u16 = 0b0000_0000_1000;
pub const FETCH_B: u16 = 0b0000_0001_0000;
pub const FETCH_C: u16 = 0b0000_0010_0000;
pub const HOLD_A: u16 = 0b0000_0100_0000;
pub const HOLD_B: u16 = 0b0000_1000_0000;
pub const HOLD_D: u16 = 0b0001_0000_0000;
pub const FILL: u16 = 0b0010_0000_0000;
pub const BLTDONE: u16 = 0b0100_0000_0000;
pub const REPEAT: u16 = 0b1000_0000_0000;
pub const FETCH: u16 = FETCH_A | FETCH_B | FETCH_C;

lazy_static! {
    /// Copy-blit micro programs, indexed by [shape][fill]. The iteration
    /// body ends at the REPEAT instruction; the remaining steps are the
    /// tail executed once after the counters run out.
    pub static ref COPY_PROGRAMS: [[Vec<u16>; 2]; 16] = build_copy_programs();
}

/// The line blitter's fixed bus-cycle program (always fake-executed; the
/// drawing itself happens at launch time).
pub const LINE_PROGRAM: [u16; 6] = [
    BUSIDLE,
    FETCH_C,
    BUSIDLE,
    WRITE_D | REPEAT,
    NOTHING,
    WRITE_D | BLTDONE,
];

#[rustfmt::skip]
fn build_copy_programs() -> [[Vec<u16>; 2]; 16] {
    [
        // 0: -- -- | -- --
        [
            vec![BUSIDLE,
                 BUSIDLE | REPEAT,

                 NOTHING,
                 BLTDONE],
            vec![BUSIDLE,
                 BUSIDLE | REPEAT,

                 NOTHING,
                 BLTDONE],
        ],
        // 1: D0 -- -- D1 -- -- | -- D2
        [
            vec![HOLD_D | BUSIDLE,
                 WRITE_D,
                 BUSIDLE | HOLD_A | HOLD_B | REPEAT,

                 HOLD_D,
                 WRITE_D | BLTDONE],
            vec![FILL | HOLD_D | BUSIDLE,
                 WRITE_D,
                 BUSIDLE | HOLD_A | HOLD_B | REPEAT,

                 FILL | HOLD_D,
                 WRITE_D | BLTDONE],
        ],
        // 2: C0 -- C1 -- | -- --
        [
            vec![HOLD_D | BUSIDLE,
                 FETCH_C | HOLD_A | HOLD_B | REPEAT,

                 HOLD_D,
                 BLTDONE],
            vec![FILL | HOLD_D | BUSIDLE,
                 FETCH_C | HOLD_A | HOLD_B | REPEAT,

                 FILL | HOLD_D,
                 BLTDONE],
        ],
        // 3: C0 -- -- C1 D0 -- C2 D1 -- | -- D2
        [
            vec![HOLD_D | BUSIDLE,
                 FETCH_C | HOLD_A | HOLD_B,
                 WRITE_D | REPEAT,

                 HOLD_D,
                 WRITE_D | BLTDONE],
            vec![FILL | HOLD_D | BUSIDLE,
                 FETCH_C | HOLD_A | HOLD_B,
                 WRITE_D | REPEAT,

                 FILL | HOLD_D,
                 WRITE_D | BLTDONE],
        ],
        // 4: B0 -- -- B1 -- -- | -- --
        [
            vec![HOLD_D | BUSIDLE,
                 FETCH_B | HOLD_A,
                 HOLD_B | BUSIDLE | REPEAT,

                 HOLD_D,
                 BLTDONE],
            vec![FILL | HOLD_D | BUSIDLE,
                 FETCH_B | HOLD_A,
                 HOLD_B | BUSIDLE | REPEAT,

                 FILL | HOLD_D,
                 BLTDONE],
        ],
        // 5: B0 -- -- B1 D0 -- B2 D1 -- | -- D2
        [
            vec![BUSIDLE | HOLD_D,
                 FETCH_B | HOLD_A,
                 WRITE_D | HOLD_B | REPEAT,

                 HOLD_D,
                 WRITE_D | BLTDONE],
            vec![BUSIDLE | FILL | HOLD_D,
                 FETCH_B | HOLD_A,
                 WRITE_D | HOLD_B,
                 BUSIDLE | REPEAT,

                 FILL | HOLD_D,
                 WRITE_D | BLTDONE],
        ],
        // 6: B0 C0 -- B1 C1 -- | -- --
        [
            vec![BUSIDLE | HOLD_D,
                 FETCH_B | HOLD_A,
                 FETCH_C | HOLD_B | REPEAT,

                 HOLD_D,
                 BLTDONE],
            vec![BUSIDLE | FILL | HOLD_D,
                 FETCH_B | HOLD_A,
                 FETCH_C | HOLD_B | REPEAT,

                 FILL | HOLD_D,
                 BLTDONE],
        ],
        // 7: B0 C0 -- -- B1 C1 D0 -- B2 C2 D1 -- | -- D2
        [
            vec![BUSIDLE | HOLD_D,
                 FETCH_B | HOLD_A,
                 FETCH_C | HOLD_B,
                 WRITE_D | REPEAT,

                 HOLD_D,
                 WRITE_D | BLTDONE],
            vec![BUSIDLE | FILL | HOLD_D,
                 FETCH_B | HOLD_A,
                 FETCH_C | HOLD_B,
                 WRITE_D | REPEAT,

                 FILL | HOLD_D,
                 WRITE_D | BLTDONE],
        ],
        // 8: A0 -- A1 -- | -- --
        [
            vec![FETCH_A | HOLD_D,
                 HOLD_A | HOLD_B | BUSIDLE | REPEAT,

                 HOLD_D,
                 BLTDONE],
            vec![FETCH_A | FILL | HOLD_D,
                 HOLD_A | HOLD_B | BUSIDLE | REPEAT,

                 FILL | HOLD_D,
                 BLTDONE],
        ],
        // 9: A0 -- -- A1 D0 -- A2 D1 -- | -- D2
        [
            vec![FETCH_A | HOLD_D,
                 WRITE_D | HOLD_A | HOLD_B | REPEAT,

                 HOLD_D,
                 WRITE_D | BLTDONE],
            vec![FETCH_A | FILL | HOLD_D,
                 WRITE_D | HOLD_A | HOLD_B,
                 BUSIDLE | REPEAT,

                 FILL | HOLD_D,
                 WRITE_D | BLTDONE],
        ],
        // A: A0 C0 A1 C1 | -- --
        [
            vec![FETCH_A | HOLD_D,
                 FETCH_C | HOLD_A | HOLD_B | REPEAT,

                 HOLD_D,
                 BLTDONE],
            vec![FETCH_A | FILL | HOLD_D,
                 FETCH_C | HOLD_A | HOLD_B | REPEAT,

                 FILL | HOLD_D,
                 BLTDONE],
        ],
        // B: A0 C0 -- A1 C1 D0 A2 C2 D1 | -- D2
        [
            vec![FETCH_A | HOLD_D,
                 FETCH_C | HOLD_A | HOLD_B,
                 WRITE_D | REPEAT,

                 HOLD_D,
                 WRITE_D | BLTDONE],
            vec![FETCH_A | FILL | HOLD_D,
                 FETCH_C | HOLD_A | HOLD_B,
                 WRITE_D | REPEAT,

                 FILL | HOLD_D,
                 WRITE_D | BLTDONE],
        ],
        // C: A0 B0 -- A1 B1 -- | -- --
        [
            vec![FETCH_A | HOLD_D,
                 FETCH_B | HOLD_A,
                 HOLD_B | BUSIDLE | REPEAT,

                 HOLD_D,
                 BLTDONE],
            vec![FETCH_A | FILL | HOLD_D,
                 FETCH_B | HOLD_A,
                 HOLD_B | BUSIDLE | REPEAT,

                 FILL | HOLD_D,
                 BLTDONE],
        ],
        // D: A0 B0 -- -- A1 B1 D0 -- A2 B2 D1 -- | -- D2
        [
            vec![FETCH_A | HOLD_D,
                 FETCH_B | HOLD_A,
                 WRITE_D | HOLD_B | REPEAT,

                 HOLD_D,
                 WRITE_D | BLTDONE],
            vec![FETCH_A | FILL | HOLD_D,
                 FETCH_B | HOLD_A,
                 WRITE_D | HOLD_B,
                 BUSIDLE | REPEAT,

                 FILL | HOLD_D,
                 WRITE_D | BLTDONE],
        ],
        // E: A0 B0 C0 A1 B1 C1 | -- --
        [
            vec![FETCH_A | HOLD_D,
                 FETCH_B | HOLD_A,
                 FETCH_C | HOLD_B | REPEAT,

                 HOLD_D,
                 BLTDONE],
            vec![FETCH_A | FILL | HOLD_D,
                 FETCH_B | HOLD_A,
                 FETCH_C | HOLD_B | REPEAT,

                 FILL | HOLD_D,
                 BLTDONE],
        ],
        // F: A0 B0 C0 -- A1 B1 C1 D0 A2 B2 C2 D1 | -- D2
        [
            vec![FETCH_A | HOLD_D,
                 FETCH_B | HOLD_A,
                 FETCH_C | HOLD_B,
                 WRITE_D | REPEAT,

                 HOLD_D,
                 WRITE_D | BLTDONE],
            vec![FETCH_A | FILL | HOLD_D,
                 FETCH_B | HOLD_A,
                 FETCH_C | HOLD_B,
                 WRITE_D | REPEAT,

                 HOLD_D,
                 WRITE_D | BLTDONE],
        ],
    ]
}

/// Slot count of one iteration of a program (everything up to REPEAT).
pub fn iteration_len(program: &[u16]) -> usize {
    program.iter().position(|&i| i & REPEAT != 0).unwrap() + 1
}

/// Slot count of the tail after the REPEAT instruction.
pub fn tail_len(program: &[u16]) -> usize {
    program.len() - iteration_len(program)
}

impl Blitter {
    pub(crate) fn program(&self) -> &'static [u16] {
        match self.running {
            BlitKind::Line => &LINE_PROGRAM,
            _ => &COPY_PROGRAMS[self.shape()][self.fill as usize],
        }
    }
}

impl Bus {
    /// Set up the micro-programmed Blitter and schedule its first slot.
    pub(crate) fn begin_slow_copy_blit(&mut self) {
        let blt = &mut self.agnus.blitter;

        blt.load_setup();
        blt.reset_x_counter();
        blt.reset_y_counter();
        blt.cnt_a = blt.bltsize_w;
        blt.cnt_b = blt.bltsize_w;
        blt.cnt_c = blt.bltsize_w;
        blt.cnt_d = blt.bltsize_w;
        blt.aold = 0;
        blt.bold = 0;
        blt.fill_carry = blt.con1().fci();
        blt.lock_d = true;
        blt.bltpc = 0;
        blt.iteration = 0;
        blt.end_signaled = false;
        blt.fill = blt.fill_enabled();
        blt.fake = false;
        blt.running = BlitKind::Copy;

        self.schedule_blitter_slot();
    }

    pub(crate) fn schedule_blitter_slot(&mut self) {
        self.agnus.scheduler.schedule_rel(
            crate::agnus::scheduler::Slot::Blitter,
            self.agnus.clock,
            dma_cycles(1),
            crate::agnus::scheduler::EventId::BltCopySlow,
        );
    }

    /// One Blitter bus slot: execute the micro instruction at bltpc. If
    /// the bus requirement is not met, the instruction retries on the
    /// next slot.
    pub(crate) fn service_blitter_event(&mut self) {
        if self.agnus.blitter.running == BlitKind::None {
            return;
        }

        let program = self.agnus.blitter.program();
        let pc = self.agnus.blitter.bltpc as usize;
        debug_assert!(pc < program.len());
        let instr = program[pc.min(program.len() - 1)];

        if self.agnus.blitter.fake {
            self.blt_fake_exec(instr);
        } else {
            self.blt_exec(instr);
        }

        // BLTDONE cancels the slot; anything else runs again.
        if self.agnus.blitter.running != BlitKind::None {
            self.schedule_blitter_slot();
        }
    }

    fn blt_acquire(&mut self, instr: u16) -> bool {
        let mut bus = instr & (FETCH | BUS) != 0;
        let mut busidle = instr & BUSIDLE != 0;
        // A locked D write degrades to an idle-bus wait.
        if instr & WRITE_D != 0 {
            bus = !self.agnus.blitter.lock_d;
            busidle = self.agnus.blitter.lock_d;
        }

        if bus && !self.agnus.allocate_bus(BusOwner::Blitter) {
            return false;
        }
        if busidle && !self.agnus.bus_is_free() {
            return false;
        }
        true
    }

    /// Level-2 execution: bus and datapath.
    fn blt_exec(&mut self, instr: u16) {
        if !self.blt_acquire(instr) {
            return;
        }

        self.agnus.blitter.bltpc += 1;

        if instr & WRITE_D != 0 && !self.agnus.blitter.lock_d {
            let addr = self.agnus.blitter.bltdpt;
            let data = self.agnus.blitter.dhold;
            self.blitter_write(addr, data);

            let blt = &mut self.agnus.blitter;
            blt.check1 = crate::bus::memory::fnv_1a_it32(blt.check1, data as u32);
            blt.check2 = crate::bus::memory::fnv_1a_it32(blt.check2, addr);
            blt.bltdpt = inc_chip_ptr(blt.bltdpt, blt.incr);
            blt.cnt_d -= 1;
            if blt.cnt_d == 0 {
                blt.bltdpt = inc_chip_ptr(blt.bltdpt, blt.dmod);
                blt.cnt_d = blt.bltsize_w;
                blt.fill_carry = blt.con1().fci();
            }
        }

        if instr & FETCH_A != 0 {
            let addr = self.agnus.blitter.bltapt;
            self.agnus.blitter.anew = self.blitter_read(addr);
            let blt = &mut self.agnus.blitter;
            blt.bltapt = inc_chip_ptr(blt.bltapt, blt.incr);
            blt.cnt_a -= 1;
            if blt.cnt_a == 0 {
                blt.bltapt = inc_chip_ptr(blt.bltapt, blt.amod);
                blt.cnt_a = blt.bltsize_w;
            }
        }

        if instr & FETCH_B != 0 {
            let addr = self.agnus.blitter.bltbpt;
            self.agnus.blitter.bnew = self.blitter_read(addr);
            let blt = &mut self.agnus.blitter;
            blt.bltbpt = inc_chip_ptr(blt.bltbpt, blt.incr);
            blt.cnt_b -= 1;
            if blt.cnt_b == 0 {
                blt.bltbpt = inc_chip_ptr(blt.bltbpt, blt.bmod);
                blt.cnt_b = blt.bltsize_w;
            }
        }

        if instr & FETCH_C != 0 {
            let addr = self.agnus.blitter.bltcpt;
            self.agnus.blitter.chold = self.blitter_read(addr);
            let blt = &mut self.agnus.blitter;
            blt.bltcpt = inc_chip_ptr(blt.bltcpt, blt.incr);
            blt.cnt_c -= 1;
            if blt.cnt_c == 0 {
                blt.bltcpt = inc_chip_ptr(blt.bltcpt, blt.cmod);
                blt.cnt_c = blt.bltsize_w;
            }
        }

        let blt = &mut self.agnus.blitter;

        if instr & HOLD_A != 0 {
            blt.barrel_shift_a();
        }

        if instr & HOLD_B != 0 {
            blt.barrel_shift_b();
        }

        if instr & HOLD_D != 0 {
            blt.dhold = minterm(blt.ahold, blt.bhold, blt.chold, blt.bltcon0 as u8);
            if instr & FILL != 0 && !blt.lock_d {
                let mut carry = blt.fill_carry;
                blt.dhold = fill_word(blt.dhold, &mut carry);
                blt.fill_carry = carry;
            }
            if blt.dhold != 0 {
                blt.bzero = false;
            }
        }

        if instr & REPEAT != 0 {
            blt.iteration += 1;
            blt.lock_d = false;

            if blt.x_counter > 1 {
                blt.bltpc = 0;
                blt.dec_x_counter();
            } else if blt.y_counter > 1 {
                blt.bltpc = 0;
                blt.reset_x_counter();
                blt.dec_y_counter();
            } else {
                // Both counters exhausted: fall through into the tail.
                blt.end_signaled = true;
            }
        }

        if instr & BLTDONE != 0 {
            self.end_blit();
        }
    }

    /// Level-1 execution: the blit already happened; only consume the bus
    /// slots the real sequence would.
    pub(crate) fn blt_fake_exec(&mut self, instr: u16) {
        if !self.blt_acquire(instr) {
            return;
        }

        self.agnus.blitter.bltpc += 1;

        if instr & (FETCH | WRITE_D) != 0 {
            // Record a dummy transfer so the DMA debugger sees traffic.
            self.agnus.record_bus_value(0x8888);
        }

        let blt = &mut self.agnus.blitter;

        if instr & REPEAT != 0 {
            blt.iteration += 1;
            blt.lock_d = false;

            if blt.x_counter > 1 {
                blt.bltpc = 0;
                blt.dec_x_counter();
            } else if blt.y_counter > 1 {
                blt.bltpc = 0;
                blt.reset_x_counter();
                blt.dec_y_counter();
            } else {
                blt.end_signaled = true;
            }
        }

        if instr & BLTDONE != 0 {
            self.end_blit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_shape_has_both_variants() {
        for shape in 0..16 {
            for fill in 0..2 {
                let program = &COPY_PROGRAMS[shape][fill];
                assert!(program.len() >= 4 && program.len() <= 7, "shape {:X}", shape);
                // Exactly one REPEAT, terminated by exactly one BLTDONE
                assert_eq!(program.iter().filter(|&&i| i & REPEAT != 0).count(), 1);
                assert_eq!(program.last().unwrap() & BLTDONE, BLTDONE);
            }
        }
    }

    #[test]
    fn corrected_shape_1_sequence() {
        // D-only uses the longer 3-slot iteration, not the published one
        let program = &COPY_PROGRAMS[1][0];
        assert_eq!(iteration_len(program), 3);
        assert_eq!(tail_len(program), 2);
    }

    #[test]
    fn fill_variants_of_write_shapes_gain_a_slot() {
        for shape in [5usize, 9, 0xD] {
            let plain = iteration_len(&COPY_PROGRAMS[shape][0]);
            let filled = iteration_len(&COPY_PROGRAMS[shape][1]);
            assert_eq!(filled, plain + 1, "shape {:X}", shape);
        }
        // Pure-source shapes keep their timing under fill
        for shape in [2usize, 3, 6, 7, 0xA, 0xB, 0xE, 0xF] {
            assert_eq!(
                iteration_len(&COPY_PROGRAMS[shape][0]),
                iteration_len(&COPY_PROGRAMS[shape][1]),
                "shape {:X}",
                shape
            );
        }
    }

    #[test]
    fn full_shape_runs_four_slots_per_word() {
        let program = &COPY_PROGRAMS[0xF][0];
        assert_eq!(iteration_len(program), 4);
        assert_eq!(tail_len(program), 2);
    }
}
