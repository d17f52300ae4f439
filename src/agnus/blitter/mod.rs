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

    agnus::blitter::mod.rs

    Blitter register file and datapath. The Blitter executes one blit at
    a time: a copy blit over up to four channels with barrel shift,
    minterm logic and area fill, or a line blit. A blit is launched by
    writing BLTSIZE; how it executes depends on the accuracy level.

*/

pub mod fastblit;
pub mod slowblit;

use modular_bitfield::prelude::*;

use crate::{
    bus::Bus,
    config::BlitterAccuracy,
    snapshot::{SnapshotReader, SnapshotWriter},
};

/// Packed view of BLTCON0.
#[bitfield(bits = 16)]
#[derive(Copy, Clone, Debug)]
pub struct BltCon0 {
    pub minterm: B8,
    pub use_d: bool,
    pub use_c: bool,
    pub use_b: bool,
    pub use_a: bool,
    pub ash: B4,
}

/// Packed view of BLTCON1 (copy-blit interpretation).
#[bitfield(bits = 16)]
#[derive(Copy, Clone, Debug)]
pub struct BltCon1 {
    pub line: bool,
    pub desc: bool,
    pub fci: bool,
    pub ife: bool,
    pub efe: bool,
    #[skip]
    unused: B7,
    pub bsh: B4,
}

// Line-mode bits of BLTCON1
pub const BLTCON1_LINE: u16 = 0x0001;
pub const BLTCON1_SING: u16 = 0x0002;
pub const BLTCON1_AUL: u16 = 0x0004;
pub const BLTCON1_SUL: u16 = 0x0008;
pub const BLTCON1_SUD: u16 = 0x0010;
pub const BLTCON1_SIGN: u16 = 0x0040;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlitKind {
    #[default]
    None,
    Copy,
    Line,
}

pub struct Blitter {
    pub bltcon0: u16,
    pub bltcon1: u16,
    pub bltafwm: u16,
    pub bltalwm: u16,
    pub bltapt: u32,
    pub bltbpt: u32,
    pub bltcpt: u32,
    pub bltdpt: u32,
    pub bltamod: i16,
    pub bltbmod: i16,
    pub bltcmod: i16,
    pub bltdmod: i16,
    pub bltadat: u16,
    pub bltbdat: u16,
    pub bltcdat: u16,

    pub bltsize_w: u16,
    pub bltsize_h: u16,

    // Pipeline registers
    pub anew: u16,
    pub bnew: u16,
    pub aold: u16,
    pub bold: u16,
    pub ahold: u16,
    pub bhold: u16,
    pub chold: u16,
    pub dhold: u16,

    // Signed per-blit setup (negated in descending mode)
    pub incr: i32,
    pub ash: u32,
    pub bsh: u32,
    pub amod: i32,
    pub bmod: i32,
    pub cmod: i32,
    pub dmod: i32,

    // Counters
    pub x_counter: u16,
    pub y_counter: u16,
    pub cnt_a: u16,
    pub cnt_b: u16,
    pub cnt_c: u16,
    pub cnt_d: u16,
    pub mask: u16,
    pub iteration: u32,

    pub fill_carry: bool,
    pub bzero: bool,
    busy: bool,
    /// Pipeline stage D is locked until the first REPEAT; the first
    /// WRITE_D of a program is suppressed by it.
    pub lock_d: bool,
    /// Micro-program counter and the selected program.
    pub bltpc: u16,
    pub running: BlitKind,
    pub fake: bool,
    pub fill: bool,
    /// End-of-blit has been signaled; REPEAT no longer rewinds.
    pub end_signaled: bool,

    // Running checksums over D writes (value and address), used to compare
    // fast and accurate execution in diagnostics.
    pub check1: u32,
    pub check2: u32,
}

impl Default for Blitter {
    fn default() -> Self {
        Self {
            bltcon0: 0,
            bltcon1: 0,
            bltafwm: 0,
            bltalwm: 0,
            bltapt: 0,
            bltbpt: 0,
            bltcpt: 0,
            bltdpt: 0,
            bltamod: 0,
            bltbmod: 0,
            bltcmod: 0,
            bltdmod: 0,
            bltadat: 0,
            bltbdat: 0,
            bltcdat: 0,
            bltsize_w: 0,
            bltsize_h: 0,
            anew: 0,
            bnew: 0,
            aold: 0,
            bold: 0,
            ahold: 0,
            bhold: 0,
            chold: 0,
            dhold: 0,
            incr: 2,
            ash: 0,
            bsh: 0,
            amod: 0,
            bmod: 0,
            cmod: 0,
            dmod: 0,
            x_counter: 0,
            y_counter: 0,
            cnt_a: 0,
            cnt_b: 0,
            cnt_c: 0,
            cnt_d: 0,
            mask: 0xFFFF,
            iteration: 0,
            fill_carry: false,
            bzero: false,
            busy: false,
            lock_d: true,
            bltpc: 0,
            running: BlitKind::None,
            fake: false,
            fill: false,
            end_signaled: false,
            check1: 0,
            check2: 0,
        }
    }
}

impl Blitter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }

    #[inline]
    pub fn busy(&self) -> bool {
        self.busy
    }

    #[inline]
    pub fn bzero(&self) -> bool {
        self.bzero
    }

    #[inline]
    pub fn con0(&self) -> BltCon0 {
        BltCon0::from_bytes(self.bltcon0.to_le_bytes())
    }

    #[inline]
    pub fn con1(&self) -> BltCon1 {
        BltCon1::from_bytes(self.bltcon1.to_le_bytes())
    }

    /// The 4-bit active-channel shape selecting the micro program.
    #[inline]
    pub fn shape(&self) -> usize {
        ((self.bltcon0 >> 8) & 0xF) as usize
    }

    #[inline]
    pub fn is_line(&self) -> bool {
        self.bltcon1 & BLTCON1_LINE != 0
    }

    #[inline]
    pub fn is_desc(&self) -> bool {
        self.bltcon1 & BLTCON1_DESC_BIT != 0
    }

    #[inline]
    pub fn fill_enabled(&self) -> bool {
        self.bltcon1 & (0x0008 | 0x0010) != 0 && !self.is_line()
    }

    //
    // Register pokes
    //

    pub fn poke_bltcon0(&mut self, value: u16) {
        self.bltcon0 = value;
    }

    pub fn poke_bltcon1(&mut self, value: u16) {
        self.bltcon1 = value;
    }

    /// BLTCON0L (ECS alias): replaces the low byte only.
    pub fn poke_bltcon0l(&mut self, value: u16) {
        self.bltcon0 = (self.bltcon0 & 0xFF00) | (value & 0x00FF);
    }

    pub fn poke_bltafwm(&mut self, value: u16) {
        self.bltafwm = value;
    }

    pub fn poke_bltalwm(&mut self, value: u16) {
        self.bltalwm = value;
    }

    pub fn poke_bltapth(&mut self, value: u16) {
        self.bltapt = (self.bltapt & 0x0000_FFFF) | (((value & 0x07) as u32) << 16);
    }

    pub fn poke_bltaptl(&mut self, value: u16) {
        self.bltapt = (self.bltapt & 0xFFFF_0000) | (value & 0xFFFE) as u32;
    }

    pub fn poke_bltbpth(&mut self, value: u16) {
        self.bltbpt = (self.bltbpt & 0x0000_FFFF) | (((value & 0x07) as u32) << 16);
    }

    pub fn poke_bltbptl(&mut self, value: u16) {
        self.bltbpt = (self.bltbpt & 0xFFFF_0000) | (value & 0xFFFE) as u32;
    }

    pub fn poke_bltcpth(&mut self, value: u16) {
        self.bltcpt = (self.bltcpt & 0x0000_FFFF) | (((value & 0x07) as u32) << 16);
    }

    pub fn poke_bltcptl(&mut self, value: u16) {
        self.bltcpt = (self.bltcpt & 0xFFFF_0000) | (value & 0xFFFE) as u32;
    }

    pub fn poke_bltdpth(&mut self, value: u16) {
        self.bltdpt = (self.bltdpt & 0x0000_FFFF) | (((value & 0x07) as u32) << 16);
    }

    pub fn poke_bltdptl(&mut self, value: u16) {
        self.bltdpt = (self.bltdpt & 0xFFFF_0000) | (value & 0xFFFE) as u32;
    }

    pub fn poke_bltamod(&mut self, value: u16) {
        self.bltamod = (value & 0xFFFE) as i16;
    }

    pub fn poke_bltbmod(&mut self, value: u16) {
        self.bltbmod = (value & 0xFFFE) as i16;
    }

    pub fn poke_bltcmod(&mut self, value: u16) {
        self.bltcmod = (value & 0xFFFE) as i16;
    }

    pub fn poke_bltdmod(&mut self, value: u16) {
        self.bltdmod = (value & 0xFFFE) as i16;
    }

    pub fn poke_bltadat(&mut self, value: u16) {
        self.bltadat = value;
        self.anew = value;
    }

    pub fn poke_bltbdat(&mut self, value: u16) {
        self.bltbdat = value;
        self.bnew = value;
    }

    pub fn poke_bltcdat(&mut self, value: u16) {
        self.bltcdat = value;
        self.chold = value;
    }

    /// Decode BLTSIZE into word width and row count (0 encodes maximum).
    pub fn set_bltsize(&mut self, value: u16) {
        self.bltsize_w = {
            let w = value & 0x3F;
            if w == 0 {
                64
            } else {
                w
            }
        };
        self.bltsize_h = {
            let h = value >> 6;
            if h == 0 {
                1024
            } else {
                h
            }
        };
    }

    //
    // Counter management
    //

    pub fn set_x_counter(&mut self, value: u16) {
        self.x_counter = value;
        self.mask = 0xFFFF;
        // First word mask in the first iteration, last word mask in the
        // last one. A one-word row gets both.
        if self.x_counter == self.bltsize_w {
            self.mask &= self.bltafwm;
        }
        if self.x_counter == 1 {
            self.mask &= self.bltalwm;
        }
    }

    pub fn reset_x_counter(&mut self) {
        self.set_x_counter(self.bltsize_w);
    }

    pub fn dec_x_counter(&mut self) {
        self.set_x_counter(self.x_counter - 1);
    }

    pub fn reset_y_counter(&mut self) {
        self.y_counter = self.bltsize_h;
    }

    pub fn dec_y_counter(&mut self) {
        self.y_counter -= 1;
    }

    //
    // Datapath
    //

    /// Barrel shifter on data path A: concatenate the previous and the
    /// masked current word and shift by ASH. Descending mode reverses the
    /// concatenation order.
    pub fn barrel_shift_a(&mut self) {
        let masked = self.anew & self.mask;
        if self.is_desc() {
            self.ahold = (((masked as u32) << 16 | self.aold as u32) >> self.ash) as u16;
        } else {
            self.ahold = (((self.aold as u32) << 16 | masked as u32) >> self.ash) as u16;
        }
        self.aold = masked;
    }

    pub fn barrel_shift_b(&mut self) {
        if self.is_desc() {
            self.bhold = (((self.bnew as u32) << 16 | self.bold as u32) >> self.bsh) as u16;
        } else {
            self.bhold = (((self.bold as u32) << 16 | self.bnew as u32) >> self.bsh) as u16;
        }
        self.bold = self.bnew;
    }

    /// Load the signed per-blit setup from the current register file.
    pub fn load_setup(&mut self) {
        let con0 = self.con0();
        let con1 = self.con1();
        if con1.desc() {
            // Shift amounts mirror around 16 in descending mode.
            self.incr = -2;
            self.ash = 16 - con0.ash() as u32;
            self.bsh = 16 - con1.bsh() as u32;
            self.amod = -(self.bltamod as i32);
            self.bmod = -(self.bltbmod as i32);
            self.cmod = -(self.bltcmod as i32);
            self.dmod = -(self.bltdmod as i32);
        } else {
            self.incr = 2;
            self.ash = con0.ash() as u32;
            self.bsh = con1.bsh() as u32;
            self.amod = self.bltamod as i32;
            self.bmod = self.bltbmod as i32;
            self.cmod = self.bltcmod as i32;
            self.dmod = self.bltdmod as i32;
        }
    }

    pub fn save_items(&self, w: &mut SnapshotWriter) {
        w.put_u16(self.bltcon0);
        w.put_u16(self.bltcon1);
        w.put_u16(self.bltafwm);
        w.put_u16(self.bltalwm);
        w.put_u32(self.bltapt);
        w.put_u32(self.bltbpt);
        w.put_u32(self.bltcpt);
        w.put_u32(self.bltdpt);
        w.put_u16(self.bltamod as u16);
        w.put_u16(self.bltbmod as u16);
        w.put_u16(self.bltcmod as u16);
        w.put_u16(self.bltdmod as u16);
        w.put_u16(self.bltadat);
        w.put_u16(self.bltbdat);
        w.put_u16(self.bltcdat);
        w.put_u16(self.bltsize_w);
        w.put_u16(self.bltsize_h);
        w.put_u8(self.busy as u8);
        w.put_u8(self.bzero as u8);
    }

    pub fn load_items(&mut self, r: &mut SnapshotReader) -> Result<(), crate::error::SnapshotError> {
        self.bltcon0 = r.take_u16()?;
        self.bltcon1 = r.take_u16()?;
        self.bltafwm = r.take_u16()?;
        self.bltalwm = r.take_u16()?;
        self.bltapt = r.take_u32()?;
        self.bltbpt = r.take_u32()?;
        self.bltcpt = r.take_u32()?;
        self.bltdpt = r.take_u32()?;
        self.bltamod = r.take_u16()? as i16;
        self.bltbmod = r.take_u16()? as i16;
        self.bltcmod = r.take_u16()? as i16;
        self.bltdmod = r.take_u16()? as i16;
        self.bltadat = r.take_u16()?;
        self.bltbdat = r.take_u16()?;
        self.bltcdat = r.take_u16()?;
        self.bltsize_w = r.take_u16()?;
        self.bltsize_h = r.take_u16()?;
        self.busy = r.take_u8()? != 0;
        self.bzero = r.take_u8()? != 0;
        // An in-flight blit does not survive a snapshot boundary; it has
        // either completed (fast path) or is restarted by the guest.
        self.running = BlitKind::None;
        Ok(())
    }

    pub(crate) fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }
}

const BLTCON1_DESC_BIT: u16 = 0x0002;

/// One of the 256 boolean functions of three inputs, selected by the low
/// byte of BLTCON0.
pub fn minterm(a: u16, b: u16, c: u16, minterm: u8) -> u16 {
    let mut result = 0;
    if minterm & 0x01 != 0 {
        result |= !a & !b & !c;
    }
    if minterm & 0x02 != 0 {
        result |= !a & !b & c;
    }
    if minterm & 0x04 != 0 {
        result |= !a & b & !c;
    }
    if minterm & 0x08 != 0 {
        result |= !a & b & c;
    }
    if minterm & 0x10 != 0 {
        result |= a & !b & !c;
    }
    if minterm & 0x20 != 0 {
        result |= a & !b & c;
    }
    if minterm & 0x40 != 0 {
        result |= a & b & !c;
    }
    if minterm & 0x80 != 0 {
        result |= a & b & c;
    }
    result
}

/// The area-fill circuit. The carry propagates from bit 0 upward and
/// toggles at every set data bit; filled spans keep their boundary bits.
/// Inclusive and exclusive fill share this truth table and differ through
/// the carry seed (FCI).
pub fn fill_word(data: u16, carry: &mut bool) -> u16 {
    let mut result = 0u16;
    for i in 0..16 {
        let bit = (data >> i) & 1;
        result |= (bit | *carry as u16) << i;
        if bit != 0 {
            *carry = !*carry;
        }
    }
    result
}

impl Bus {
    /// Writing BLTSIZE launches the blit.
    pub fn poke_bltsize(&mut self, value: u16) {
        self.agnus.blitter.set_bltsize(value);
        self.agnus.blitter.set_busy(true);
        self.agnus.blitter.bzero = true;
        self.agnus.blitter.check1 = 0;
        self.agnus.blitter.check2 = 0;

        log::debug!(
            "Blit launched: shape {:X} {}x{} {}",
            self.agnus.blitter.shape(),
            self.agnus.blitter.bltsize_w,
            self.agnus.blitter.bltsize_h,
            if self.agnus.blitter.is_line() { "line" } else { "copy" }
        );

        if self.agnus.blitter.is_line() {
            // There is no slow line Blitter; the line always completes at
            // launch and a bus-only program burns the cycles afterwards.
            self.begin_fake_line_blit();
        } else {
            match self.blitter_accuracy {
                BlitterAccuracy::Accurate => self.begin_slow_copy_blit(),
                BlitterAccuracy::Fast => self.begin_fake_copy_blit(),
            }
        }
    }

    /// Blit completion: raise the interrupt, drop busy, release the bus.
    pub(crate) fn end_blit(&mut self) {
        self.agnus.blitter.set_busy(false);
        self.agnus.blitter.running = BlitKind::None;
        self.agnus
            .scheduler
            .cancel(crate::agnus::scheduler::Slot::Blitter);
        self.paula.raise_irq(crate::paula::IrqSource::Blit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minterm_truth_tables() {
        // 0xF0: D = A
        assert_eq!(minterm(0x1234, 0xFFFF, 0x0000, 0xF0), 0x1234);
        // 0xCC: D = B
        assert_eq!(minterm(0x0000, 0xBEEF, 0x5555, 0xCC), 0xBEEF);
        // 0xAA: D = C
        assert_eq!(minterm(0xFFFF, 0x0000, 0xC0DE, 0xAA), 0xC0DE);
        // 0xFA: D = A | C
        assert_eq!(minterm(0xF000, 0x1111, 0x000F, 0xFA), 0xF00F);
        // 0x3C: D = A ^ B
        assert_eq!(minterm(0xFF00, 0x0F0F, 0x1234, 0x3C), 0xF00F);
        // 0x00: D = 0
        assert_eq!(minterm(0xFFFF, 0xFFFF, 0xFFFF, 0x00), 0x0000);
    }

    #[test]
    fn fill_between_set_bits() {
        let mut carry = false;
        assert_eq!(fill_word(0b1000_0000_0000_0001, &mut carry), 0xFFFF);
        assert!(!carry);

        let mut carry = false;
        assert_eq!(fill_word(0b0000_0110_0000_0000, &mut carry), 0b0000_0110_0000_0000);

        let mut carry = false;
        assert_eq!(fill_word(0b0001_0000_0001_0000, &mut carry), 0b0001_1111_1111_0000);
    }

    #[test]
    fn fill_carry_seeds_and_propagates() {
        // FCI set: the span is filled from bit 0 until the first set bit
        let mut carry = true;
        assert_eq!(fill_word(0b0000_0000_0001_0000, &mut carry), 0b0000_0000_0001_1111);
        assert!(!carry);

        // Carry leaves the word open for the next one
        let mut carry = false;
        assert_eq!(fill_word(0b0000_0001_0000_0000, &mut carry), 0b1111_1111_0000_0000);
        assert!(carry);
    }

    #[test]
    fn barrel_shifter_ascending_and_descending() {
        let mut blt = Blitter::new();
        blt.bltcon0 = 0x4000; // ASH = 4
        blt.bltcon1 = 0x0000;
        blt.load_setup();
        blt.mask = 0xFFFF;

        blt.aold = 0x000F;
        blt.anew = 0xABCD;
        blt.barrel_shift_a();
        assert_eq!(blt.ahold, 0xFABC);

        // Descending: reversed concatenation, mirrored shift
        let mut blt = Blitter::new();
        blt.bltcon0 = 0x4000;
        blt.bltcon1 = 0x0002;
        blt.load_setup();
        blt.mask = 0xFFFF;
        blt.aold = 0xF000;
        blt.anew = 0xABCD;
        blt.barrel_shift_a();
        assert_eq!(blt.ahold, 0xBCDF);
    }

    #[test]
    fn bltsize_zero_encodes_maximum() {
        let mut blt = Blitter::new();
        blt.set_bltsize(0x0000);
        assert_eq!(blt.bltsize_w, 64);
        assert_eq!(blt.bltsize_h, 1024);

        blt.set_bltsize((2 << 6) | 4);
        assert_eq!(blt.bltsize_w, 4);
        assert_eq!(blt.bltsize_h, 2);
    }

    #[test]
    fn word_masks_apply_first_and_last() {
        let mut blt = Blitter::new();
        blt.bltafwm = 0x3FFF;
        blt.bltalwm = 0xFFF0;
        blt.set_bltsize(3); // 3 words, 1 row... height bits zero -> 1024

        blt.reset_x_counter();
        assert_eq!(blt.mask, 0x3FFF);
        blt.dec_x_counter();
        assert_eq!(blt.mask, 0xFFFF);
        blt.dec_x_counter();
        assert_eq!(blt.mask, 0xFFF0);
    }

    #[test]
    fn one_word_row_gets_both_masks() {
        let mut blt = Blitter::new();
        blt.bltafwm = 0x0FF0;
        blt.bltalwm = 0x00FF;
        blt.set_bltsize((1 << 6) | 1);
        blt.reset_x_counter();
        assert_eq!(blt.mask, 0x00F0);
    }
}
