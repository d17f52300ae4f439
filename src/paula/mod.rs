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

    paula::mod.rs

    The interrupt aggregator. Fifteen interrupt sources are collected in
    INTREQ, gated by INTENA, and reported to the CPU as a priority level.
    Both registers use the set/clear write convention: bit 15 high ORs the
    incoming bits into the register, bit 15 low clears them.

*/

pub mod audio;
pub mod disk;

use crate::snapshot::{SnapshotReader, SnapshotWriter};

pub const SET_CLR: u16 = 0x8000;

/// INTENA bit 14: the master interrupt enable.
pub const INTEN: u16 = 0x4000;

/// Interrupt sources by INTREQ bit number.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum IrqSource {
    Tbe = 0,
    DskBlk = 1,
    Soft = 2,
    Ports = 3,
    Coper = 4,
    VertB = 5,
    Blit = 6,
    Aud0 = 7,
    Aud1 = 8,
    Aud2 = 9,
    Aud3 = 10,
    Rbf = 11,
    DskSyn = 12,
    Exter = 13,
}

/// Level masks, highest group first. The reported level is the index of
/// the first group with an enabled, pending bit.
const LEVEL_MASKS: [(u8, u16); 6] = [
    (6, 0b0010_0000_0000_0000), // EXTER
    (5, 0b0001_1000_0000_0000), // RBF, DSKSYN
    (4, 0b0000_0111_1000_0000), // AUD0..AUD3
    (3, 0b0000_0000_0111_0000), // COPER, VERTB, BLIT
    (2, 0b0000_0000_0000_1000), // PORTS
    (1, 0b0000_0000_0000_0111), // TBE, DSKBLK, SOFT
];

#[derive(Default)]
pub struct Paula {
    intreq: u16,
    intena: u16,
    ipl: u8,

    adkcon: u16,
    potgo: u16,

    pub disk: disk::DiskController,
    pub audio: audio::AudioUnit,
}

impl Paula {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        self.intreq = 0;
        self.intena = 0;
        self.ipl = 0;
        self.adkcon = 0;
        self.potgo = 0;
        self.disk.reset();
        self.audio.reset();
    }

    //
    // Register file
    //

    pub fn peek_intreqr(&self) -> u16 {
        self.intreq
    }

    pub fn peek_intenar(&self) -> u16 {
        self.intena
    }

    pub fn poke_intreq(&mut self, value: u16) {
        log::trace!("pokeINTREQ({:04X})", value);
        self.intreq = apply_set_clr(self.intreq, value) & 0x7FFF;
        self.check_interrupt();
    }

    pub fn poke_intena(&mut self, value: u16) {
        log::trace!("pokeINTENA({:04X})", value);
        self.intena = apply_set_clr(self.intena, value) & 0x7FFF;
        self.check_interrupt();
    }

    pub fn peek_adkconr(&self) -> u16 {
        self.adkcon
    }

    pub fn poke_adkcon(&mut self, value: u16) {
        self.adkcon = apply_set_clr(self.adkcon, value) & 0x7FFF;
    }

    pub fn peek_potgor(&self) -> u16 {
        // All pot lines read high when not driven.
        self.potgo | 0x5500
    }

    pub fn poke_potgo(&mut self, value: u16) {
        self.potgo = value;
    }

    //
    // Interrupt logic
    //

    /// Request service for a source. Used by every chipset client.
    pub fn raise_irq(&mut self, source: IrqSource) {
        self.intreq |= 1 << source as u16;
        self.check_interrupt();
    }

    /// Interrupt level currently presented to the CPU (0 = none).
    #[inline]
    pub fn ipl(&self) -> u8 {
        self.ipl
    }

    /// Recompute the interrupt level. Called on every INTREQ/INTENA write.
    fn check_interrupt(&mut self) {
        self.ipl = if self.intena & INTEN != 0 {
            interrupt_level(self.intreq, self.intena)
        } else {
            0
        };
    }

    pub fn save_items(&self, w: &mut SnapshotWriter) {
        w.put_u16(self.intreq);
        w.put_u16(self.intena);
        w.put_u16(self.adkcon);
        w.put_u16(self.potgo);
        self.disk.save_items(w);
        self.audio.save_items(w);
    }

    pub fn load_items(&mut self, r: &mut SnapshotReader) -> Result<(), crate::error::SnapshotError> {
        self.intreq = r.take_u16()?;
        self.intena = r.take_u16()?;
        self.adkcon = r.take_u16()?;
        self.potgo = r.take_u16()?;
        self.disk.load_items(r)?;
        self.audio.load_items(r)?;
        self.check_interrupt();
        Ok(())
    }
}

#[inline]
pub fn apply_set_clr(current: u16, value: u16) -> u16 {
    if value & SET_CLR != 0 {
        current | (value & 0x7FFF)
    } else {
        current & !(value & 0x7FFF)
    }
}

/// The pure level function: the highest group with an enabled pending bit.
/// The INTEN master bit is handled by the caller.
pub fn interrupt_level(intreq: u16, intena: u16) -> u8 {
    let masked = intreq & intena & 0x3FFF;
    for (level, mask) in LEVEL_MASKS {
        if masked & mask != 0 {
            return level;
        }
    }
    0
}
