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

    agnus::blitter::fastblit.rs

    Level-1 Blitter execution. The whole blit is carried out synchronously
    when BLTSIZE is written; afterwards a stripped micro program consumes
    the bus cycles the real sequence would have taken, without touching
    memory. Fill, shift, descending mode and minterm logic are pure
    functions of the source bytes, so fast and accurate execution produce
    identical destinations.

*/

use crate::{
    agnus::inc_chip_ptr,
    bus::{memory::fnv_1a_it32, Bus},
    dma_cycles,
};

use super::{
    fill_word,
    minterm,
    BlitKind,
    BLTCON1_AUL,
    BLTCON1_SIGN,
    BLTCON1_SING,
    BLTCON1_SUD,
    BLTCON1_SUL,
};

impl Bus {
    /// Run the whole copy blit now, then replay a bus-only program.
    pub(crate) fn begin_fake_copy_blit(&mut self) {
        self.do_fast_copy_blit();

        let blt = &mut self.agnus.blitter;
        blt.reset_x_counter();
        blt.reset_y_counter();
        blt.lock_d = true;
        blt.bltpc = 0;
        blt.iteration = 0;
        blt.end_signaled = false;
        blt.fill = blt.fill_enabled();
        blt.fake = true;
        blt.running = BlitKind::Copy;

        self.agnus.scheduler.schedule_rel(
            crate::agnus::scheduler::Slot::Blitter,
            self.agnus.clock,
            dma_cycles(1),
            crate::agnus::scheduler::EventId::BltCopyFake,
        );
    }

    /// Line mode: the drawing always happens at launch, for both accuracy
    /// levels, followed by a four-slot-per-pixel bus program.
    pub(crate) fn begin_fake_line_blit(&mut self) {
        self.do_fast_line_blit();

        let blt = &mut self.agnus.blitter;
        blt.bltsize_w = 1;
        blt.reset_x_counter();
        blt.reset_y_counter();
        blt.lock_d = false;
        blt.bltpc = 0;
        blt.iteration = 0;
        blt.end_signaled = false;
        blt.fill = false;
        blt.fake = true;
        blt.running = BlitKind::Line;

        self.agnus.scheduler.schedule_rel(
            crate::agnus::scheduler::Slot::Blitter,
            self.agnus.clock,
            dma_cycles(1),
            crate::agnus::scheduler::EventId::BltLineFake,
        );
    }

    /// The copy blit, executed in one go. The datapath below mirrors the
    /// micro-programmed version word for word: same masks, same shifter
    /// state, same fill carry, same pointer arithmetic.
    pub(crate) fn do_fast_copy_blit(&mut self) {
        self.agnus.blitter.load_setup();

        let con0 = self.agnus.blitter.con0();
        let use_a = con0.use_a();
        let use_b = con0.use_b();
        let use_c = con0.use_c();
        let use_d = con0.use_d();
        let mt = con0.minterm();
        let fill = self.agnus.blitter.fill_enabled();
        let fci = self.agnus.blitter.con1().fci();
        let width = self.agnus.blitter.bltsize_w;
        let height = self.agnus.blitter.bltsize_h;

        {
            let blt = &mut self.agnus.blitter;
            blt.aold = 0;
            blt.bold = 0;
            blt.fill_carry = fci;
        }

        for _y in 0..height {
            for x in 0..width {
                // First and last word masks by fetch order
                let mut mask = 0xFFFF;
                if x == 0 {
                    mask &= self.agnus.blitter.bltafwm;
                }
                if x == width - 1 {
                    mask &= self.agnus.blitter.bltalwm;
                }
                self.agnus.blitter.mask = mask;

                if use_a {
                    let addr = self.agnus.blitter.bltapt;
                    self.agnus.blitter.anew = self.memory.read_chip16(addr);
                    let blt = &mut self.agnus.blitter;
                    blt.bltapt = inc_chip_ptr(blt.bltapt, blt.incr);
                }
                if use_b {
                    let addr = self.agnus.blitter.bltbpt;
                    self.agnus.blitter.bnew = self.memory.read_chip16(addr);
                    let blt = &mut self.agnus.blitter;
                    blt.bltbpt = inc_chip_ptr(blt.bltbpt, blt.incr);
                }
                if use_c {
                    let addr = self.agnus.blitter.bltcpt;
                    self.agnus.blitter.chold = self.memory.read_chip16(addr);
                    let blt = &mut self.agnus.blitter;
                    blt.bltcpt = inc_chip_ptr(blt.bltcpt, blt.incr);
                }

                let blt = &mut self.agnus.blitter;
                blt.barrel_shift_a();
                blt.barrel_shift_b();

                blt.dhold = minterm(blt.ahold, blt.bhold, blt.chold, mt);
                if fill {
                    let mut carry = blt.fill_carry;
                    blt.dhold = fill_word(blt.dhold, &mut carry);
                    blt.fill_carry = carry;
                }
                if blt.dhold != 0 {
                    blt.bzero = false;
                }

                if use_d {
                    let addr = self.agnus.blitter.bltdpt;
                    let data = self.agnus.blitter.dhold;
                    self.memory.write_chip16(addr, data);
                    let blt = &mut self.agnus.blitter;
                    blt.check1 = fnv_1a_it32(blt.check1, data as u32);
                    blt.check2 = fnv_1a_it32(blt.check2, addr);
                    blt.bltdpt = inc_chip_ptr(blt.bltdpt, blt.incr);
                }
            }

            // Row boundary: modulos and the fill carry reseed
            let blt = &mut self.agnus.blitter;
            if use_a {
                blt.bltapt = inc_chip_ptr(blt.bltapt, blt.amod);
            }
            if use_b {
                blt.bltbpt = inc_chip_ptr(blt.bltbpt, blt.bmod);
            }
            if use_c {
                blt.bltcpt = inc_chip_ptr(blt.bltcpt, blt.cmod);
            }
            if use_d {
                blt.bltdpt = inc_chip_ptr(blt.bltdpt, blt.dmod);
            }
            blt.fill_carry = fci;
        }
    }

    /// Line mode. One pixel per step via Bresenham state held in the A
    /// pointer (error accumulator), the A/B modulos (error increments)
    /// and the CON1 octant bits. C and D share the line pointer.
    pub(crate) fn do_fast_line_blit(&mut self) {
        let con0 = self.agnus.blitter.con0();
        let con1 = self.agnus.blitter.bltcon1;
        let mt = con0.minterm();

        let length = self.agnus.blitter.bltsize_h;
        let single = con1 & BLTCON1_SING != 0;
        let sud = con1 & BLTCON1_SUD != 0;
        let sul = con1 & BLTCON1_SUL != 0;
        let aul = con1 & BLTCON1_AUL != 0;

        let mut sign = con1 & BLTCON1_SIGN != 0;
        let mut err = self.agnus.blitter.bltapt as u16 as i16 as i32;
        let amod = self.agnus.blitter.bltamod as i32;
        let bmod = self.agnus.blitter.bltbmod as i32;
        let cmod = self.agnus.blitter.bltcmod as i32;

        let mut shift = con0.ash() as i32;
        let mut texture = self.agnus.blitter.bltbdat;
        let mut cpt = self.agnus.blitter.bltcpt;
        let mut dot_this_line = false;

        for _ in 0..length {
            // Plot one pixel
            let c = self.memory.read_chip16(cpt);
            let a_dot = (self.agnus.blitter.bltadat & self.agnus.blitter.bltafwm) >> shift;
            let b_tex = if texture & 0x8000 != 0 { 0xFFFF } else { 0x0000 };
            let d = minterm(a_dot, b_tex, c, mt);

            if !single || !dot_this_line {
                self.memory.write_chip16(cpt, d);
                let blt = &mut self.agnus.blitter;
                blt.check1 = fnv_1a_it32(blt.check1, d as u32);
                blt.check2 = fnv_1a_it32(blt.check2, cpt);
                if d != 0 {
                    blt.bzero = false;
                }
                dot_this_line = true;
            }
            texture = texture.rotate_left(1);

            // Octant stepping: the conditional (minor) step runs when the
            // error is non-negative, the major step always.
            if !sign {
                if sud {
                    cpt = step_y(cpt, cmod, sul, &mut dot_this_line);
                } else {
                    step_x(&mut cpt, &mut shift, sul);
                }
            }
            if sud {
                step_x(&mut cpt, &mut shift, aul);
            } else {
                cpt = step_y(cpt, cmod, aul, &mut dot_this_line);
            }

            // Error accumulator update and sign reload
            err += if sign { bmod } else { amod };
            sign = err < 0;
        }

        // Final register state visible to the guest
        let blt = &mut self.agnus.blitter;
        blt.bltcpt = cpt;
        blt.bltdpt = cpt;
        blt.bltapt = (err as u16) as u32;
        if sign {
            blt.bltcon1 |= BLTCON1_SIGN;
        } else {
            blt.bltcon1 &= !BLTCON1_SIGN;
        }
        blt.bltcon0 = (blt.bltcon0 & 0x0FFF) | (((shift as u16) & 0xF) << 12);
    }
}

#[inline]
fn step_x(cpt: &mut u32, shift: &mut i32, backwards: bool) {
    if backwards {
        *shift -= 1;
        if *shift < 0 {
            *shift = 15;
            *cpt = inc_chip_ptr(*cpt, -2);
        }
    } else {
        *shift += 1;
        if *shift > 15 {
            *shift = 0;
            *cpt = inc_chip_ptr(*cpt, 2);
        }
    }
}

#[inline]
fn step_y(cpt: u32, cmod: i32, backwards: bool, dot_this_line: &mut bool) -> u32 {
    *dot_this_line = false;
    inc_chip_ptr(cpt, if backwards { -cmod } else { cmod })
}
