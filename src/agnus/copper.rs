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

    agnus::copper.rs

    The Copper: a three-instruction coprocessor that writes custom
    registers in sync with the beam. MOVE and SKIP occupy two fetch
    slots; WAIT parks the state machine until the masked beam comparator
    is satisfied. Instruction fetches happen on odd bus slots only.

*/

use crate::{
    agnus::{BusOwner, DMACON_COPEN},
    bus::Bus,
    dma_cycles,
    snapshot::{SnapshotReader, SnapshotWriter},
};

use super::scheduler::{EventId, Slot};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CopState {
    #[default]
    Off,
    Fetch1,
    Fetch2,
    Waiting,
}

#[derive(Default)]
pub struct Copper {
    pub state: CopState,
    pub coppc: u32,
    pub cop1lc: u32,
    pub cop2lc: u32,
    pub cdang: bool,
    /// First and second instruction words of the current instruction.
    pub ins1: u16,
    pub ins2: u16,
    /// Set by a satisfied SKIP: the next MOVE is suppressed.
    skip_next: bool,
}

impl Copper {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }

    pub fn poke_copcon(&mut self, value: u16) {
        self.cdang = value & 0x02 != 0;
    }

    pub fn poke_cop1lch(&mut self, value: u16) {
        self.cop1lc = (self.cop1lc & 0x0000_FFFF) | (((value & 0x07) as u32) << 16);
    }

    pub fn poke_cop1lcl(&mut self, value: u16) {
        self.cop1lc = (self.cop1lc & 0xFFFF_0000) | (value & 0xFFFE) as u32;
    }

    pub fn poke_cop2lch(&mut self, value: u16) {
        self.cop2lc = (self.cop2lc & 0x0000_FFFF) | (((value & 0x07) as u32) << 16);
    }

    pub fn poke_cop2lcl(&mut self, value: u16) {
        self.cop2lc = (self.cop2lc & 0xFFFF_0000) | (value & 0xFFFE) as u32;
    }

    /// COPINS is a write target for the Copper itself (a common no-op
    /// destination); storing the value suffices.
    pub fn poke_copins(&mut self, value: u16) {
        self.ins1 = value;
    }

    fn jump(&mut self, location: u32) {
        self.coppc = location;
        self.state = CopState::Fetch1;
        self.skip_next = false;
    }

    //
    // Instruction decoding helpers
    //

    #[inline]
    pub fn is_move(ins1: u16) -> bool {
        ins1 & 0x0001 == 0
    }

    #[inline]
    pub fn is_wait(ins1: u16, ins2: u16) -> bool {
        ins1 & 0x0001 == 1 && ins2 & 0x0001 == 0
    }

    /// The masked beam comparator shared by WAIT and SKIP. Vertical bits
    /// compare first; don't-care bits are masked out. Bit 15 of the mask
    /// word is the blitter-finished-disable bit, handled by the caller.
    pub fn comparison(ins1: u16, ins2: u16, v: u16, h: u16) -> bool {
        let vp = (ins1 >> 8) as u8;
        let hp = (ins1 & 0xFE) as u8;
        let vm = ((ins2 >> 8) | 0x80) as u8;
        let hm = (ins2 & 0xFE) as u8;

        let beam_v = (v & 0xFF) as u8 & vm;
        let beam_h = (h & 0xFE) as u8 & hm;
        let target_v = vp & vm;
        let target_h = hp & hm;

        (beam_v, beam_h) >= (target_v, target_h)
    }

    /// True if a MOVE to this register offset is forbidden. Registers
    /// below $40 are always protected on OCS; $40-$7E require the danger
    /// bit.
    pub fn is_illegal_dest(&self, reg: u16) -> bool {
        if reg < 0x40 {
            return true;
        }
        reg < 0x80 && !self.cdang
    }

    pub fn save_items(&self, w: &mut SnapshotWriter) {
        w.put_u8(self.state as u8);
        w.put_u32(self.coppc);
        w.put_u32(self.cop1lc);
        w.put_u32(self.cop2lc);
        w.put_u8(self.cdang as u8);
        w.put_u16(self.ins1);
        w.put_u16(self.ins2);
        w.put_u8(self.skip_next as u8);
    }

    pub fn load_items(&mut self, r: &mut SnapshotReader) -> Result<(), crate::error::SnapshotError> {
        self.state = match r.take_u8()? {
            1 => CopState::Fetch1,
            2 => CopState::Fetch2,
            3 => CopState::Waiting,
            _ => CopState::Off,
        };
        self.coppc = r.take_u32()?;
        self.cop1lc = r.take_u32()?;
        self.cop2lc = r.take_u32()?;
        self.cdang = r.take_u8()? != 0;
        self.ins1 = r.take_u16()?;
        self.ins2 = r.take_u16()?;
        self.skip_next = r.take_u8()? != 0;
        Ok(())
    }
}

impl Bus {
    /// COPJMP strobes restart the Copper at one of the two location
    /// registers.
    pub fn copper_jump(&mut self, second: bool) {
        let location = if second {
            self.agnus.copper.cop2lc
        } else {
            self.agnus.copper.cop1lc
        };
        self.agnus.copper.jump(location);
        self.schedule_copper_fetch(dma_cycles(1));
    }

    /// Vertical sync restarts the Copper from COP1LC.
    pub fn copper_vsync(&mut self) {
        self.agnus.copper.jump(self.agnus.copper.cop1lc);
        self.schedule_copper_fetch(dma_cycles(1));
    }

    pub(crate) fn schedule_copper_fetch(&mut self, delta: crate::Cycle) {
        self.agnus
            .scheduler
            .schedule_rel(Slot::Copper, self.agnus.clock, delta, EventId::CopFetch);
    }

    /// Service a due Copper event. One call per scheduled slot; if the
    /// bus cannot be had, the event retries on the next slot.
    pub(crate) fn service_copper_event(&mut self) {
        if self.agnus.copper.state == CopState::Off {
            return;
        }

        // Copper DMA must be enabled to do anything at all.
        if !self.agnus.dma_enabled(DMACON_COPEN) {
            self.schedule_copper_fetch(dma_cycles(1));
            return;
        }

        match self.agnus.copper.state {
            CopState::Fetch1 => {
                if !self.copper_can_fetch() {
                    self.schedule_copper_fetch(dma_cycles(1));
                    return;
                }
                let pc = self.agnus.copper.coppc;
                self.agnus.copper.ins1 = self.copper_read(pc);
                self.agnus.copper.coppc = super::inc_chip_ptr(pc, 2);
                self.agnus.copper.state = CopState::Fetch2;
                self.schedule_copper_fetch(dma_cycles(1));
            }

            CopState::Fetch2 => {
                if !self.copper_can_fetch() {
                    self.schedule_copper_fetch(dma_cycles(1));
                    return;
                }
                let pc = self.agnus.copper.coppc;
                self.agnus.copper.ins2 = self.copper_read(pc);
                self.agnus.copper.coppc = super::inc_chip_ptr(pc, 2);
                self.copper_execute();
            }

            CopState::Waiting => {
                if self.copper_wait_satisfied() {
                    self.agnus.copper.state = CopState::Fetch1;
                }
                self.schedule_copper_fetch(dma_cycles(1));
            }

            CopState::Off => {}
        }
    }

    /// Fetches occupy odd bus slots only, and need a grant.
    fn copper_can_fetch(&mut self) -> bool {
        if self.agnus.pos.h % 2 == 0 {
            return false;
        }
        self.agnus.allocate_bus(BusOwner::Copper)
    }

    fn copper_wait_satisfied(&self) -> bool {
        let cop = &self.agnus.copper;
        if !Copper::comparison(cop.ins1, cop.ins2, self.agnus.pos.v, self.agnus.pos.h) {
            return false;
        }
        // With BFD clear, the Blitter must have finished as well.
        if cop.ins2 & 0x8000 == 0 && self.agnus.blitter.busy() {
            return false;
        }
        true
    }

    /// Both instruction words are in; commit the instruction.
    fn copper_execute(&mut self) {
        let ins1 = self.agnus.copper.ins1;
        let ins2 = self.agnus.copper.ins2;

        if Copper::is_move(ins1) {
            let reg = ins1 & 0x01FE;
            let skip = std::mem::take(&mut self.agnus.copper.skip_next);

            if self.agnus.copper.is_illegal_dest(reg) {
                // An illegal MOVE halts the Copper until the next strobe
                // or vertical sync.
                log::debug!("Copper halted by MOVE to ${:03X}", reg);
                self.agnus.copper.state = CopState::Off;
                return;
            }

            if !skip {
                self.poke_custom16_copper(0xDF_F000 | reg as u32, ins2);
            }
            self.agnus.copper.state = CopState::Fetch1;
            self.schedule_copper_fetch(dma_cycles(1));
        } else if Copper::is_wait(ins1, ins2) {
            self.agnus.copper.state = CopState::Waiting;
            self.schedule_copper_fetch(dma_cycles(1));
        } else {
            // SKIP
            if Copper::comparison(ins1, ins2, self.agnus.pos.v, self.agnus.pos.h)
                && (ins2 & 0x8000 != 0 || !self.agnus.blitter.busy())
            {
                self.agnus.copper.skip_next = true;
            }
            self.agnus.copper.state = CopState::Fetch1;
            self.schedule_copper_fetch(dma_cycles(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparator_masks_dont_care_bits() {
        // WAIT (v=100, h=0) with mask 0xFFFE: any h on line >= 100
        let ins1 = (100 << 8) | 0x01;
        let ins2 = 0xFFFE;

        assert!(!Copper::comparison(ins1, ins2, 99, 226));
        assert!(Copper::comparison(ins1, ins2, 100, 0));
        assert!(Copper::comparison(ins1, ins2, 101, 3));

        // Vertical-only mask: horizontal position is ignored
        let ins2_vonly = 0x7F00;
        assert!(Copper::comparison(ins1, ins2_vonly, 100, 0));
        assert!(!Copper::comparison(ins1, ins2_vonly, 99, 200));
    }

    #[test]
    fn comparator_orders_v_before_h() {
        // WAIT (v=50, h=0x80), full mask
        let ins1 = (50 << 8) | 0x80 | 0x01;
        let ins2 = 0xFFFE;

        assert!(!Copper::comparison(ins1, ins2, 50, 0x7E));
        assert!(Copper::comparison(ins1, ins2, 50, 0x80));
        // A later line matches at any h
        assert!(Copper::comparison(ins1, ins2, 51, 0x00));
    }

    #[test]
    fn danger_bit_gates_low_registers() {
        let mut cop = Copper::new();

        assert!(cop.is_illegal_dest(0x02E)); // COPCON region
        assert!(cop.is_illegal_dest(0x058)); // BLTSIZE without CDANG
        assert!(!cop.is_illegal_dest(0x08E)); // DIWSTRT is always fine

        cop.poke_copcon(0x0002);
        assert!(!cop.is_illegal_dest(0x058));
        assert!(cop.is_illegal_dest(0x02E)); // below $40 stays protected
    }

    #[test]
    fn location_registers_mask_to_chip_space() {
        let mut cop = Copper::new();
        cop.poke_cop1lch(0xFFFF);
        cop.poke_cop1lcl(0xFFFF);
        assert_eq!(cop.cop1lc, 0x07_FFFE);
    }
}
