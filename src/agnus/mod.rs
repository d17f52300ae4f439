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

    agnus::mod.rs

    The DMA controller. Agnus owns the master clock, the beam position,
    the per-line bus-owner bookkeeping and all chip Ram pointer registers.
    The beam advances one horizontal position every two color clocks; each
    horizontal position is one potential bus slot, granted to exactly one
    owner in the fixed priority order refresh > disk > audio > sprite >
    bitplane > Copper > Blitter > CPU.

*/

pub mod blitter;
pub mod copper;
pub mod scheduler;

use std::collections::VecDeque;

use crate::{
    snapshot::{SnapshotReader, SnapshotWriter},
    Cycle,
    CCKS_PER_HPOS,
    HPOS_CNT,
    VPOS_CNT,
};

use blitter::Blitter;
use copper::Copper;
use scheduler::Scheduler;

// DMACON bits
pub const DMACON_SET_CLR: u16 = 0x8000;
pub const DMACON_BBUSY: u16 = 0x4000; // read-only
pub const DMACON_BZERO: u16 = 0x2000; // read-only
pub const DMACON_BLTPRI: u16 = 0x0400;
pub const DMACON_DMAEN: u16 = 0x0200;
pub const DMACON_BPLEN: u16 = 0x0100;
pub const DMACON_COPEN: u16 = 0x0080;
pub const DMACON_BLTEN: u16 = 0x0040;
pub const DMACON_SPREN: u16 = 0x0020;
pub const DMACON_DSKEN: u16 = 0x0010;
pub const DMACON_AUDEN: u16 = 0x000F;

/// Chip Ram pointers wrap on the 512 KB OCS address range, word aligned.
pub const CHIP_PTR_MASK: u32 = 0x07_FFFE;

/// Memory refresh slots (4 per line).
pub const REFRESH_H: [u16; 4] = [0x01, 0x03, 0x05, 0x07];
/// Disk DMA slots (up to 3 per line).
pub const DISK_H: [u16; 3] = [0x09, 0x0B, 0x0D];
/// Audio DMA slots, one per channel.
pub const AUDIO_H: [u16; 4] = [0x0F, 0x11, 0x13, 0x15];
/// First sprite slot; sprite x uses 0x17 + 4x and 0x19 + 4x.
pub const SPRITE_H0: u16 = 0x17;

/// Hardware limits of the bitplane fetch window.
pub const DDF_MIN: u16 = 0x18;
pub const DDF_MAX: u16 = 0xD8;

/// First scanline on which sprite DMA may run.
pub const SPR_DMA_FIRST_LINE: u16 = 25;

/// Lines above this are the vertical blanking area; Denise skips them.
pub const VBLANK_LINES: u16 = 26;

/// Bitplane fetch order inside a lores fetch unit (0 = idle).
const LORES_FETCH: [u8; 8] = [0, 4, 6, 2, 0, 3, 5, 1];
/// Bitplane fetch order inside a hires fetch unit.
const HIRES_FETCH: [u8; 4] = [4, 2, 3, 1];

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BusOwner {
    #[default]
    None,
    Cpu,
    Copper,
    Blitter,
    Bitplane,
    Sprite,
    Disk,
    Audio,
    Refresh,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Beam {
    pub v: u16,
    pub h: u16,
}

/// Sprite DMA sequencer state.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
enum SprDma {
    /// Fetch POS/CTL in the next slot pair.
    #[default]
    FetchPosCtl,
    /// Between VSTART and VSTOP: fetch DATA/DATB every line.
    Active,
    /// VSTOP has passed; wait for the next frame.
    Idle,
}

/// A register write with a pipeline delay, applied by the bus when due.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegChange {
    Bplcon0(u16),
    Bplcon1(u16),
    Bplcon2(u16),
    Diwstrt(u16),
    Diwstop(u16),
}

#[derive(Copy, Clone, Debug)]
pub struct PendingChange {
    pub trigger: Cycle,
    pub change: RegChange,
}

pub struct Agnus {
    /// Master clock in color clocks. Advances by two per horizontal
    /// position; never runs backwards.
    pub clock: Cycle,
    pub frame: i64,
    pub pos: Beam,
    /// Long-frame flag. Toggles every frame in interlace mode.
    pub lof: bool,
    /// LACE bit from the last BPLCON0 write.
    pub lace: bool,

    pub scheduler: Scheduler,
    pub copper: Copper,
    pub blitter: Blitter,

    pub dmacon: u16,
    /// Bitplane count Agnus uses for DMA scheduling (Denise keeps its own).
    pub bpu: u8,
    pub hires: bool,

    pub dskpt: u32,
    pub bplpt: [u32; 6],
    pub sprpt: [u32; 8],
    pub bpl1mod: i16,
    pub bpl2mod: i16,

    pub diwstrt: u16,
    pub diwstop: u16,
    pub diw_hstrt: i16,
    pub diw_hstop: i16,
    pub diw_vstrt: i16,
    pub diw_vstop: i16,
    /// Vertical display-window flip-flop, evaluated per line.
    pub diw_vflop: bool,
    /// Horizontal flip-flop plus the positions it changed at this line
    /// (-1 = no transition). Consumed by Denise's border pass.
    pub diw_hflop: bool,
    pub diw_hflop_on: i16,
    pub diw_hflop_off: i16,

    pub ddfstrt: u16,
    pub ddfstop: u16,

    /// Bus bookkeeping for the current line, indexed by h.
    pub bus_owner: [BusOwner; HPOS_CNT as usize],
    pub bus_value: [u16; HPOS_CNT as usize],

    spr_dma: [SprDma; 8],
    pub spr_vstrt: [u16; 8],
    pub spr_vstop: [u16; 8],

    /// True while bitplane DMA is fetching on the current line.
    pub bpl_dma_line: bool,
    bpl_fetch_start: u16,
    bpl_fetch_stop: u16,

    /// Delayed register writes, ordered by trigger cycle.
    reg_changes: VecDeque<PendingChange>,

    /// CPU is parked waiting for a bus grant. Used by the Blitter's
    /// starvation rule when BLTPRI is clear.
    pub cpu_waiting: bool,
    blit_grants_in_a_row: u8,
}

impl Default for Agnus {
    fn default() -> Self {
        Self {
            clock: 0,
            frame: 0,
            pos: Beam::default(),
            lof: true,
            lace: false,
            scheduler: Scheduler::new(),
            copper: Copper::new(),
            blitter: Blitter::new(),
            dmacon: 0,
            bpu: 0,
            hires: false,
            dskpt: 0,
            bplpt: [0; 6],
            sprpt: [0; 8],
            bpl1mod: 0,
            bpl2mod: 0,
            diwstrt: 0,
            diwstop: 0,
            diw_hstrt: 0,
            diw_hstop: 0,
            diw_vstrt: 0,
            diw_vstop: 0,
            diw_vflop: false,
            diw_hflop: false,
            diw_hflop_on: -1,
            diw_hflop_off: -1,
            ddfstrt: 0,
            ddfstop: 0,
            bus_owner: [BusOwner::None; HPOS_CNT as usize],
            bus_value: [0; HPOS_CNT as usize],
            spr_dma: [SprDma::FetchPosCtl; 8],
            spr_vstrt: [0; 8],
            spr_vstop: [0; 8],
            bpl_dma_line: false,
            bpl_fetch_start: 0,
            bpl_fetch_stop: 0,
            reg_changes: VecDeque::new(),
            cpu_waiting: false,
            blit_grants_in_a_row: 0,
        }
    }
}

impl Agnus {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }

    //
    // Clock and beam
    //

    /// Lines in the current frame.
    #[inline]
    pub fn lines_in_frame(&self) -> u16 {
        if self.lof {
            VPOS_CNT
        } else {
            VPOS_CNT - 1
        }
    }

    /// Advance the beam by one horizontal position. Returns true at the
    /// end of a line; the caller runs the hsync handler then.
    #[inline]
    pub fn advance_beam(&mut self) -> bool {
        self.clock += CCKS_PER_HPOS;
        self.pos.h += 1;
        self.pos.h == HPOS_CNT
    }

    /// Line bookkeeping at horizontal sync. Returns true when the frame
    /// wrapped as well.
    pub fn hsync(&mut self) -> bool {
        self.pos.h = 0;
        self.bus_owner = [BusOwner::None; HPOS_CNT as usize];
        self.bus_value = [0; HPOS_CNT as usize];
        self.blit_grants_in_a_row = 0;

        self.pos.v += 1;
        let wrapped = self.pos.v == self.lines_in_frame();
        if wrapped {
            self.vsync();
        }

        self.update_line_state();
        wrapped
    }

    fn vsync(&mut self) {
        self.pos.v = 0;
        self.frame += 1;
        if self.lace {
            self.lof = !self.lof;
        } else {
            self.lof = true;
        }
        self.diw_vflop = false;
        self.spr_dma = [SprDma::FetchPosCtl; 8];
    }

    /// Recompute the per-line DIW/DDF state. Called after every hsync and
    /// whenever the window registers change mid-line.
    pub fn update_line_state(&mut self) {
        let v = self.pos.v as i16;

        // Vertical flip-flop: on at VSTART, off at VSTOP.
        if v == self.diw_vstrt {
            self.diw_vflop = true;
        }
        if v == self.diw_vstop {
            self.diw_vflop = false;
        }

        // The horizontal flip-flop re-arms every line.
        self.diw_hflop = false;
        self.diw_hflop_on = if self.diw_vflop { self.diw_hstrt } else { -1 };
        self.diw_hflop_off = if self.diw_vflop { self.diw_hstop } else { -1 };

        // Bitplane fetch window with the hardware alignment rounding.
        let align = if self.hires { 3 } else { 7 };
        self.bpl_fetch_start = (self.ddfstrt.max(DDF_MIN)) & !align;
        self.bpl_fetch_stop = (self.ddfstop.min(DDF_MAX)) & !align;

        self.bpl_dma_line = self.bpl_dma_enabled() && self.diw_vflop && self.bpu > 0;
    }

    #[inline]
    pub fn dma_enabled(&self, bit: u16) -> bool {
        let need = DMACON_DMAEN | bit;
        self.dmacon & need == need
    }

    #[inline]
    pub fn bpl_dma_enabled(&self) -> bool {
        self.dma_enabled(DMACON_BPLEN)
    }

    //
    // Bus arbitration primitives
    //

    /// Try to claim the current slot for a DMA owner. At most one owner
    /// per horizontal position.
    pub fn allocate_bus(&mut self, owner: BusOwner) -> bool {
        let h = self.pos.h as usize;
        if self.bus_owner[h] != BusOwner::None {
            return false;
        }

        if owner == BusOwner::Blitter {
            if !self.dma_enabled(DMACON_BLTEN) {
                return false;
            }
            // Without BLTPRI ("blitter nasty"), a starved CPU gets every
            // fourth slot.
            if self.dmacon & DMACON_BLTPRI == 0
                && self.cpu_waiting
                && self.blit_grants_in_a_row >= 3
            {
                self.blit_grants_in_a_row = 0;
                return false;
            }
            self.blit_grants_in_a_row += 1;
        }

        self.bus_owner[h] = owner;
        true
    }

    /// A client that needs an idle bus (micro-instruction BUSIDLE) checks
    /// without claiming.
    #[inline]
    pub fn bus_is_free(&self) -> bool {
        self.bus_owner[self.pos.h as usize] == BusOwner::None
    }

    /// CPU claim, attempted after all DMA clients had their chance.
    pub fn try_allocate_cpu(&mut self) -> bool {
        let h = self.pos.h as usize;
        if self.bus_owner[h] == BusOwner::None {
            self.bus_owner[h] = BusOwner::Cpu;
            self.blit_grants_in_a_row = 0;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn record_bus_value(&mut self, value: u16) {
        self.bus_value[self.pos.h as usize] = value;
    }

    /// The "last value on the bus" quirk source: the value transferred in
    /// the current slot if a DMA owner held it.
    pub fn last_dma_value(&self) -> Option<u16> {
        let h = self.pos.h as usize;
        match self.bus_owner[h] {
            BusOwner::None | BusOwner::Cpu => None,
            _ => Some(self.bus_value[h]),
        }
    }

    //
    // Fixed-slot DMA schedule
    //

    /// Is `h` one of the four refresh slots?
    #[inline]
    pub fn is_refresh_slot(h: u16) -> bool {
        REFRESH_H.contains(&h)
    }

    #[inline]
    pub fn disk_slot_index(h: u16) -> Option<usize> {
        DISK_H.iter().position(|&slot| slot == h)
    }

    #[inline]
    pub fn audio_slot_index(h: u16) -> Option<usize> {
        AUDIO_H.iter().position(|&slot| slot == h)
    }

    /// Sprite slot at `h`: (sprite number, second slot of the pair).
    #[inline]
    pub fn sprite_slot_index(h: u16) -> Option<(usize, bool)> {
        if !(SPRITE_H0..SPRITE_H0 + 32).contains(&h) {
            return None;
        }
        let rel = h - SPRITE_H0;
        if rel % 2 != 0 {
            return None;
        }
        Some(((rel / 4) as usize, rel % 4 == 2))
    }

    /// Bitplane to fetch at `h`, 1-based (0 = no fetch at this slot).
    pub fn bitplane_at(&self, h: u16) -> u8 {
        if !self.bpl_dma_line {
            return 0;
        }
        let unit = if self.hires { 4 } else { 8 };
        // The last unit starting at or before ddfstop still completes.
        if h < self.bpl_fetch_start || h >= self.bpl_fetch_stop + unit {
            return 0;
        }
        let slot = ((h - self.bpl_fetch_start) % unit) as usize;
        let plane = if self.hires {
            HIRES_FETCH[slot]
        } else {
            LORES_FETCH[slot]
        };
        if plane <= self.bpu {
            plane
        } else {
            0
        }
    }

    //
    // Sprite DMA sequencing
    //

    /// Does sprite `x` want its two slots on the current line, and which
    /// words do they carry?
    pub fn sprite_dma_wanted(&self, x: usize) -> Option<SprFetch> {
        if !self.dma_enabled(DMACON_SPREN) || self.pos.v < SPR_DMA_FIRST_LINE {
            return None;
        }
        match self.spr_dma[x] {
            SprDma::FetchPosCtl => Some(SprFetch::PosCtl),
            SprDma::Active => Some(SprFetch::Data),
            SprDma::Idle => None,
        }
    }

    /// Feed back a fetched CTL word: latch the vertical window and go
    /// active or idle.
    pub fn sprite_ctl_fetched(&mut self, x: usize, pos: u16, ctl: u16) {
        self.spr_vstrt[x] = ((pos & 0xFF00) >> 8) | ((ctl & 0b100) << 6);
        self.spr_vstop[x] = ((ctl & 0xFF00) >> 8) | ((ctl & 0b010) << 7);
        self.spr_dma[x] = if self.spr_vstop[x] > self.pos.v {
            SprDma::Idle
        } else {
            // A VSTOP in the past keeps the sequencer re-fetching, which
            // is how sprite control lists terminate.
            SprDma::FetchPosCtl
        };
    }

    /// Per-line sprite sequencing, run at hsync.
    pub fn update_sprite_dma(&mut self) {
        let v = self.pos.v;
        for x in 0..8 {
            if self.spr_dma[x] == SprDma::Idle && v == self.spr_vstrt[x] {
                self.spr_dma[x] = SprDma::Active;
            }
            if self.spr_dma[x] == SprDma::Active && v == self.spr_vstop[x] {
                self.spr_dma[x] = SprDma::FetchPosCtl;
            }
        }
    }

    //
    // Register file
    //

    pub fn peek_dmaconr(&self) -> u16 {
        let mut result = self.dmacon & 0x07FF;
        if self.blitter.busy() {
            result |= DMACON_BBUSY;
        }
        if self.blitter.bzero() {
            result |= DMACON_BZERO;
        }
        result
    }

    pub fn poke_dmacon(&mut self, value: u16) -> DmaconDelta {
        let old = self.dmacon;
        self.dmacon = crate::paula::apply_set_clr(self.dmacon, value) & 0x07FF;
        log::trace!("pokeDMACON({:04X}) -> {:04X}", value, self.dmacon);

        self.bpl_dma_line = self.bpl_dma_enabled() && self.diw_vflop && self.bpu > 0;

        DmaconDelta {
            old,
            new: self.dmacon,
        }
    }

    /// VPOSR: LOF in bit 15, V8 in bit 0 (OCS chip id bits read zero).
    pub fn peek_vposr(&self) -> u16 {
        let mut result = (self.pos.v >> 8) & 1;
        if self.lof {
            result |= 0x8000;
        }
        result
    }

    pub fn peek_vhposr(&self) -> u16 {
        ((self.pos.v & 0xFF) << 8) | (self.pos.h & 0xFF)
    }

    pub fn poke_vpos(&mut self, value: u16) {
        // Only the LOF bit is writable on OCS.
        self.lof = value & 0x8000 != 0;
    }

    pub fn poke_diwstrt(&mut self, value: u16) {
        self.diwstrt = value;
        self.diw_vstrt = (value >> 8) as i16;
        self.diw_hstrt = (value & 0xFF) as i16;
        self.update_line_state();
    }

    pub fn poke_diwstop(&mut self, value: u16) {
        self.diwstop = value;
        // VSTOP bit 8 is the complement of bit 7; HSTOP lives in the
        // right display half.
        let vstop = (value >> 8) | (if value & 0x8000 != 0 { 0 } else { 0x100 });
        self.diw_vstop = vstop as i16;
        self.diw_hstop = ((value & 0xFF) | 0x100) as i16;
        self.update_line_state();
    }

    pub fn poke_ddfstrt(&mut self, value: u16) {
        self.ddfstrt = value & 0xFC;
        self.update_line_state();
    }

    pub fn poke_ddfstop(&mut self, value: u16) {
        self.ddfstop = value & 0xFC;
        self.update_line_state();
    }

    /// Agnus' share of a BPLCON0 write: bitplane count, hires, lace.
    pub fn set_bplcon0(&mut self, value: u16) {
        self.hires = value & 0x8000 != 0;
        self.lace = value & 0x0004 != 0;

        let bpu = ((value >> 12) & 0b111) as u8;
        self.bpu = if self.hires {
            // More than four bitplanes is illegal in hires.
            if bpu < 5 {
                bpu
            } else {
                0
            }
        } else if bpu < 7 {
            bpu
        } else {
            6
        };
        self.update_line_state();
    }

    pub fn poke_bplxpth(&mut self, x: usize, value: u16) {
        self.bplpt[x] = (self.bplpt[x] & 0x0000_FFFF) | (((value & 0x07) as u32) << 16);
    }

    pub fn poke_bplxptl(&mut self, x: usize, value: u16) {
        self.bplpt[x] = (self.bplpt[x] & 0xFFFF_0000) | (value & 0xFFFE) as u32;
    }

    pub fn poke_sprxpth(&mut self, x: usize, value: u16) {
        self.sprpt[x] = (self.sprpt[x] & 0x0000_FFFF) | (((value & 0x07) as u32) << 16);
    }

    pub fn poke_sprxptl(&mut self, x: usize, value: u16) {
        self.sprpt[x] = (self.sprpt[x] & 0xFFFF_0000) | (value & 0xFFFE) as u32;
    }

    pub fn poke_dskpth(&mut self, value: u16) {
        self.dskpt = (self.dskpt & 0x0000_FFFF) | (((value & 0x07) as u32) << 16);
    }

    pub fn poke_dskptl(&mut self, value: u16) {
        self.dskpt = (self.dskpt & 0xFFFF_0000) | (value & 0xFFFE) as u32;
    }

    pub fn poke_bpl1mod(&mut self, value: u16) {
        self.bpl1mod = (value & 0xFFFE) as i16;
    }

    pub fn poke_bpl2mod(&mut self, value: u16) {
        self.bpl2mod = (value & 0xFFFE) as i16;
    }

    /// Add the line modulos after the last bitplane fetch of a line.
    pub fn add_bpl_modulos(&mut self) {
        for i in (0..6).step_by(2) {
            self.bplpt[i] = inc_chip_ptr(self.bplpt[i], self.bpl1mod as i32);
        }
        for i in (1..6).step_by(2) {
            self.bplpt[i] = inc_chip_ptr(self.bplpt[i], self.bpl2mod as i32);
        }
    }

    //
    // Delayed register changes
    //

    /// Record a write that takes effect `delta` color clocks from now.
    pub fn record_reg_change(&mut self, delta: Cycle, change: RegChange) {
        self.reg_changes.push_back(PendingChange {
            trigger: self.clock + delta,
            change,
        });
    }

    pub fn due_reg_change(&mut self) -> Option<RegChange> {
        match self.reg_changes.front() {
            Some(pending) if pending.trigger <= self.clock => {
                Some(self.reg_changes.pop_front().unwrap().change)
            }
            _ => None,
        }
    }

    pub fn save_items(&self, w: &mut SnapshotWriter) {
        w.put_i64(self.clock);
        w.put_i64(self.frame);
        w.put_u16(self.pos.v);
        w.put_u16(self.pos.h);
        w.put_u8(self.lof as u8);
        w.put_u8(self.lace as u8);
        w.put_u16(self.dmacon);
        w.put_u8(self.bpu);
        w.put_u8(self.hires as u8);
        w.put_u32(self.dskpt);
        for pt in self.bplpt {
            w.put_u32(pt);
        }
        for pt in self.sprpt {
            w.put_u32(pt);
        }
        w.put_u16(self.bpl1mod as u16);
        w.put_u16(self.bpl2mod as u16);
        w.put_u16(self.diwstrt);
        w.put_u16(self.diwstop);
        w.put_u16(self.ddfstrt);
        w.put_u16(self.ddfstop);
        for x in 0..8 {
            w.put_u16(self.spr_vstrt[x]);
            w.put_u16(self.spr_vstop[x]);
        }
        self.scheduler.save_items(w);
    }

    pub fn load_items(&mut self, r: &mut SnapshotReader) -> Result<(), crate::error::SnapshotError> {
        self.clock = r.take_i64()?;
        self.frame = r.take_i64()?;
        self.pos.v = r.take_u16()?;
        self.pos.h = r.take_u16()?;
        self.lof = r.take_u8()? != 0;
        self.lace = r.take_u8()? != 0;
        self.dmacon = r.take_u16()?;
        self.bpu = r.take_u8()?;
        self.hires = r.take_u8()? != 0;
        self.dskpt = r.take_u32()?;
        for pt in self.bplpt.iter_mut() {
            *pt = r.take_u32()?;
        }
        for pt in self.sprpt.iter_mut() {
            *pt = r.take_u32()?;
        }
        self.bpl1mod = r.take_u16()? as i16;
        self.bpl2mod = r.take_u16()? as i16;
        let diwstrt = r.take_u16()?;
        let diwstop = r.take_u16()?;
        self.poke_diwstrt(diwstrt);
        self.poke_diwstop(diwstop);
        self.ddfstrt = r.take_u16()?;
        self.ddfstop = r.take_u16()?;
        for x in 0..8 {
            self.spr_vstrt[x] = r.take_u16()?;
            self.spr_vstop[x] = r.take_u16()?;
        }
        self.scheduler.load_items(r)?;
        self.reg_changes.clear();
        self.update_line_state();
        Ok(())
    }
}

#[derive(Copy, Clone, Debug)]
pub enum SprFetch {
    PosCtl,
    Data,
}

#[derive(Copy, Clone, Debug)]
pub struct DmaconDelta {
    pub old: u16,
    pub new: u16,
}

impl DmaconDelta {
    pub fn rose(&self, bits: u16) -> bool {
        (self.new & !self.old) & bits != 0
    }

    pub fn fell(&self, bits: u16) -> bool {
        (self.old & !self.new) & bits != 0
    }
}

#[inline]
pub fn inc_chip_ptr(ptr: u32, delta: i32) -> u32 {
    (ptr as i32 + delta) as u32 & CHIP_PTR_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beam_advances_one_hpos_per_two_ccks() {
        let mut agnus = Agnus::new();
        assert!(!agnus.advance_beam());
        assert_eq!(agnus.clock, 2);
        assert_eq!(agnus.pos.h, 1);

        for _ in 1..HPOS_CNT - 1 {
            assert!(!agnus.advance_beam());
        }
        assert!(agnus.advance_beam());
        agnus.hsync();
        assert_eq!(agnus.pos.h, 0);
        assert_eq!(agnus.pos.v, 1);
    }

    #[test]
    fn frame_wraps_after_all_lines() {
        let mut agnus = Agnus::new();
        let mut wraps = 0;
        for _ in 0..VPOS_CNT {
            while !agnus.advance_beam() {}
            if agnus.hsync() {
                wraps += 1;
            }
        }
        assert_eq!(wraps, 1);
        assert_eq!(agnus.frame, 1);
        assert_eq!(agnus.pos.v, 0);
    }

    #[test]
    fn bus_exclusivity() {
        let mut agnus = Agnus::new();
        agnus.dmacon = DMACON_DMAEN | DMACON_BLTEN | DMACON_BLTPRI;

        assert!(agnus.allocate_bus(BusOwner::Disk));
        assert!(!agnus.allocate_bus(BusOwner::Blitter));
        assert!(!agnus.try_allocate_cpu());
        assert_eq!(agnus.bus_owner[0], BusOwner::Disk);

        agnus.advance_beam();
        assert!(agnus.allocate_bus(BusOwner::Blitter));
        assert!(!agnus.try_allocate_cpu());
    }

    #[test]
    fn blitter_yields_to_starved_cpu_without_bltpri() {
        let mut agnus = Agnus::new();
        agnus.dmacon = DMACON_DMAEN | DMACON_BLTEN;
        agnus.cpu_waiting = true;

        let mut granted = 0;
        let mut denied = 0;
        for _ in 0..8 {
            if agnus.allocate_bus(BusOwner::Blitter) {
                granted += 1;
            } else {
                denied += 1;
                assert!(agnus.try_allocate_cpu());
            }
            agnus.advance_beam();
        }
        assert_eq!(denied, 2);
        assert_eq!(granted, 6);
    }

    #[test]
    fn diw_flipflop_for_standard_window() {
        let mut agnus = Agnus::new();
        agnus.poke_diwstrt(0x2C81);
        agnus.poke_diwstop(0x2CC1);

        assert_eq!(agnus.diw_vstrt, 0x2C);
        assert_eq!(agnus.diw_vstop, 0x12C);
        assert_eq!(agnus.diw_hstrt, 0x81);
        assert_eq!(agnus.diw_hstop, 0x1C1);

        // Below the window: no horizontal transitions
        agnus.pos.v = 20;
        agnus.update_line_state();
        assert!(!agnus.diw_vflop);
        assert_eq!(agnus.diw_hflop_on, -1);

        // At v = 0x2C (44) the vertical flip-flop switches on
        agnus.pos.v = 0x2C;
        agnus.update_line_state();
        assert!(agnus.diw_vflop);
        assert_eq!(agnus.diw_hflop_on, 0x81);
        assert_eq!(agnus.diw_hflop_off, 0x1C1);
    }

    #[test]
    fn ddf_alignment_rounding() {
        let mut agnus = Agnus::new();
        agnus.bpu = 4;
        agnus.dmacon = DMACON_DMAEN | DMACON_BPLEN;
        agnus.diw_vflop = true;

        agnus.poke_ddfstrt(0x3A);
        agnus.poke_ddfstop(0xD2);
        agnus.bpl_dma_line = true;

        // Lores: multiples of 8
        agnus.hires = false;
        agnus.update_line_state();
        assert_eq!(agnus.bpl_fetch_start, 0x38);
        assert_eq!(agnus.bpl_fetch_stop, 0xD0);

        // Hires: multiples of 4
        agnus.hires = true;
        agnus.update_line_state();
        assert_eq!(agnus.bpl_fetch_start, 0x38);
        assert_eq!(agnus.bpl_fetch_stop, 0xD0);
    }

    #[test]
    fn lores_fetch_order_within_unit() {
        let mut agnus = Agnus::new();
        agnus.dmacon = DMACON_DMAEN | DMACON_BPLEN;
        // Open the vertical window across the whole frame
        agnus.poke_diwstrt(0x0081);
        agnus.poke_diwstop(0xF0C1);
        agnus.set_bplcon0(0x4200); // 4 bitplanes, lores
        agnus.poke_ddfstrt(0x38);
        agnus.poke_ddfstop(0x38); // single fetch unit
        assert!(agnus.bpl_dma_line);

        let fetched: Vec<u8> = (0x38..0x40).map(|h| agnus.bitplane_at(h)).collect();
        assert_eq!(fetched, vec![0, 4, 0, 2, 0, 3, 0, 1]);
        assert_eq!(agnus.bitplane_at(0x40), 0);
    }

    #[test]
    fn bpu_coercion_for_illegal_values() {
        let mut agnus = Agnus::new();

        agnus.set_bplcon0(0x7000); // 7 planes, lores -> 6
        assert_eq!(agnus.bpu, 6);

        agnus.set_bplcon0(0xD000); // 5 planes, hires -> 0
        assert_eq!(agnus.bpu, 0);

        agnus.set_bplcon0(0xC000); // 4 planes, hires -> 4
        assert_eq!(agnus.bpu, 4);
    }

    #[test]
    fn sprite_slots() {
        assert_eq!(Agnus::sprite_slot_index(0x17), Some((0, false)));
        assert_eq!(Agnus::sprite_slot_index(0x19), Some((0, true)));
        assert_eq!(Agnus::sprite_slot_index(0x1B), Some((1, false)));
        assert_eq!(Agnus::sprite_slot_index(0x35), Some((7, true)));
        assert_eq!(Agnus::sprite_slot_index(0x18), None);
        assert_eq!(Agnus::sprite_slot_index(0x37), None);
    }

    #[test]
    fn chip_ptr_wraps_word_aligned() {
        assert_eq!(inc_chip_ptr(0x7_FFFE, 2), 0);
        assert_eq!(inc_chip_ptr(0, -2), 0x7_FFFE);
        assert_eq!(inc_chip_ptr(0x1000, 4), 0x1004);
    }

    #[test]
    fn dmacon_set_clr_and_readback() {
        let mut agnus = Agnus::new();
        agnus.poke_dmacon(0x8000 | DMACON_DMAEN | DMACON_COPEN);
        assert_eq!(agnus.dmacon, DMACON_DMAEN | DMACON_COPEN);

        let delta = agnus.poke_dmacon(DMACON_COPEN);
        assert!(delta.fell(DMACON_COPEN));
        assert_eq!(agnus.dmacon, DMACON_DMAEN);

        // BBUSY/BZERO are not writable
        agnus.poke_dmacon(0x8000 | DMACON_BBUSY | DMACON_BZERO);
        assert_eq!(agnus.peek_dmaconr() & (DMACON_BBUSY | DMACON_BZERO), 0);
    }
}
