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

    denise::mod.rs

    The display chip. During a line, the bitplane shifter serializes
    fetched words into the raw index buffer; register writes that land
    mid-line are recorded with their pixel coordinate instead of being
    applied. At the end of the line the records are replayed in order:
    bitplane data is translated to color indices and priorities, sprites
    are composed on top, collisions are detected, the border is drawn and
    the line is colorized into the working frame buffer.

*/

pub mod pixel_engine;

use modular_bitfield::prelude::*;

use crate::{
    config::DeniseRevision,
    snapshot::{SnapshotReader, SnapshotWriter},
    HPIXELS,
    LAST_PIXEL,
};

use pixel_engine::PixelEngine;

// Depth values. Higher wins; each sprite pair sits between two playfield
// priority levels.
pub const Z_0: u16 = 0x8000;
pub const Z_SP0: u16 = 0x4000;
pub const Z_SP1: u16 = 0x2000;
pub const Z_1: u16 = 0x1000;
pub const Z_SP2: u16 = 0x0800;
pub const Z_SP3: u16 = 0x0400;
pub const Z_2: u16 = 0x0200;
pub const Z_SP4: u16 = 0x0100;
pub const Z_SP5: u16 = 0x0080;
pub const Z_3: u16 = 0x0040;
pub const Z_SP6: u16 = 0x0020;
pub const Z_SP7: u16 = 0x0010;
pub const Z_4: u16 = 0x0008;
pub const Z_DPF: u16 = 0x0004;
pub const Z_PF1: u16 = 0x0002;
pub const Z_PF2: u16 = 0x0001;

pub const Z_SP: [u16; 8] = [Z_SP0, Z_SP1, Z_SP2, Z_SP3, Z_SP4, Z_SP5, Z_SP6, Z_SP7];
pub const Z_SP_ALL: u16 = Z_SP0 | Z_SP1 | Z_SP2 | Z_SP3 | Z_SP4 | Z_SP5 | Z_SP6 | Z_SP7;

// BPLCON0 bits
pub const BPLCON0_HIRES: u16 = 0x8000;
pub const BPLCON0_HOMOD: u16 = 0x0800;
pub const BPLCON0_DBPLF: u16 = 0x0400;
pub const BPLCON0_LACE: u16 = 0x0004;

/// Packed view of a sprite POS/CTL register pair.
#[bitfield(bits = 32)]
#[derive(Copy, Clone, Debug)]
pub struct SprPosCtl {
    // CTL word
    pub h0: bool,
    pub l8: bool,
    pub e8: bool,
    #[skip]
    unused: B4,
    pub att: bool,
    pub l_low: B8,
    // POS word
    pub h_high: B8,
    pub e_low: B8,
}

/// Register identities used by the per-line change recorders.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChangeId {
    None,
    Bplcon0,
    Bplcon2,
    SprPos(u8),
    SprCtl(u8),
    SprData(u8),
    SprDatb(u8),
    Color(u8),
}

#[derive(Copy, Clone, Debug)]
pub struct RegChange {
    pub trigger: i32,
    pub addr: ChangeId,
    pub value: u16,
}

/// An ordered per-line log of register writes, keyed by pixel coordinate.
#[derive(Default)]
pub struct ChangeRecorder {
    changes: Vec<RegChange>,
}

impl ChangeRecorder {
    pub fn new() -> Self {
        Self {
            changes: Vec::with_capacity(16),
        }
    }

    pub fn add(&mut self, trigger: i32, addr: ChangeId, value: u16) {
        let change = RegChange { trigger, addr, value };
        // Triggers are monotonic in practice; keep order if they are not.
        let at = self
            .changes
            .iter()
            .rposition(|existing| existing.trigger <= trigger)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.changes.insert(at, change);
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegChange> {
        self.changes.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn clear(&mut self) {
        self.changes.clear();
    }
}

/// Per-line display-window state handed over by Agnus.
#[derive(Copy, Clone, Debug, Default)]
pub struct DiwLine {
    pub vflop: bool,
    pub hflop: bool,
    pub hflop_on: i16,
    pub hflop_off: i16,
}

pub struct Denise {
    pub revision: DeniseRevision,
    pub emulate_sprites: bool,
    pub clx_spr_spr: bool,
    pub clx_spr_plf: bool,
    pub clx_plf_plf: bool,

    pub bplcon0: u16,
    pub bplcon1: u16,
    pub bplcon2: u16,
    pub bpldat: [u16; 6],
    shift_reg: [u32; 6],

    scroll_lores_odd: u16,
    scroll_lores_even: u16,
    scroll_hires_odd: u16,
    scroll_hires_even: u16,

    // Playfield depth codes derived from BPLCON2
    prio1: u16,
    prio2: u16,

    pub sprpos: [u16; 8],
    pub sprctl: [u16; 8],
    pub sprdata: [u16; 8],
    pub sprdatb: [u16; 8],
    /// Sprite shift registers (the patterns currently shifting out).
    ssra: [u16; 8],
    ssrb: [u16; 8],
    armed: u8,
    was_armed: u8,
    attach: u8,

    pub clxdat: u16,
    pub clxcon: u16,

    // Values latched at the start of the line for the replay passes
    initial_bplcon0: u16,
    initial_bplcon2: u16,
    initial_sprpos: [u16; 8],
    initial_sprctl: [u16; 8],
    initial_sprdata: [u16; 8],
    initial_sprdatb: [u16; 8],
    initial_armed: u8,

    /// Raw bitplane indices for the current line.
    b_buffer: Box<[u8; HPIXELS + 16]>,
    /// Color indices after translation (playfields only).
    i_buffer: Box<[u8; HPIXELS + 16]>,
    /// Color indices with sprites merged in.
    m_buffer: Box<[u8; HPIXELS + 16]>,
    /// Depth codes.
    z_buffer: Box<[u16; HPIXELS + 16]>,

    con_changes: ChangeRecorder,
    spr_changes: ChangeRecorder,

    first_drawn_pixel: i32,
    last_drawn_pixel: i32,
    sprite_clip_begin: i32,
    sprite_clip_end: i32,

    pub pixel_engine: PixelEngine,
}

impl Default for Denise {
    fn default() -> Self {
        Self {
            revision: DeniseRevision::Ocs,
            emulate_sprites: true,
            clx_spr_spr: true,
            clx_spr_plf: true,
            clx_plf_plf: true,
            bplcon0: 0,
            bplcon1: 0,
            bplcon2: 0,
            bpldat: [0; 6],
            shift_reg: [0; 6],
            scroll_lores_odd: 0,
            scroll_lores_even: 0,
            scroll_hires_odd: 0,
            scroll_hires_even: 0,
            prio1: 0,
            prio2: 0,
            sprpos: [0; 8],
            sprctl: [0; 8],
            sprdata: [0; 8],
            sprdatb: [0; 8],
            ssra: [0; 8],
            ssrb: [0; 8],
            armed: 0,
            was_armed: 0,
            attach: 0,
            clxdat: 0,
            clxcon: 0,
            initial_bplcon0: 0,
            initial_bplcon2: 0,
            initial_sprpos: [0; 8],
            initial_sprctl: [0; 8],
            initial_sprdata: [0; 8],
            initial_sprdatb: [0; 8],
            initial_armed: 0,
            b_buffer: Box::new([0; HPIXELS + 16]),
            i_buffer: Box::new([0; HPIXELS + 16]),
            m_buffer: Box::new([0; HPIXELS + 16]),
            z_buffer: Box::new([0; HPIXELS + 16]),
            con_changes: ChangeRecorder::new(),
            spr_changes: ChangeRecorder::new(),
            first_drawn_pixel: 0,
            last_drawn_pixel: 0,
            sprite_clip_begin: HPIXELS as i32,
            sprite_clip_end: HPIXELS as i32,
            pixel_engine: PixelEngine::new(),
        }
    }
}

impl Denise {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        let pe = std::mem::take(&mut self.pixel_engine);
        *self = Self {
            pixel_engine: pe,
            revision: self.revision,
            emulate_sprites: self.emulate_sprites,
            clx_spr_spr: self.clx_spr_spr,
            clx_spr_plf: self.clx_spr_plf,
            clx_plf_plf: self.clx_plf_plf,
            ..Default::default()
        };
        self.pixel_engine.reset();
    }

    //
    // Mode helpers
    //

    #[inline]
    pub fn hires(&self) -> bool {
        self.bplcon0 & BPLCON0_HIRES != 0
    }

    #[inline]
    fn dual_playfield(bplcon0: u16) -> bool {
        bplcon0 & BPLCON0_DBPLF != 0
    }

    /// Bitplane count with the hardware's coercion of illegal values.
    pub fn bpu(value: u16) -> u8 {
        let bpu = ((value >> 12) & 0b111) as u8;
        if value & BPLCON0_HIRES != 0 {
            if bpu < 5 {
                bpu
            } else {
                0
            }
        } else if bpu < 7 {
            bpu
        } else {
            6
        }
    }

    fn z_pf(priority_bits: u16) -> u16 {
        match priority_bits {
            0 => Z_0,
            1 => Z_1,
            2 => Z_2,
            3 => Z_3,
            4 => Z_4,
            // Illegal priority draws transparent
            _ => 0,
        }
    }

    //
    // Register writes (already delayed by the caller where the pipeline
    // requires it; `pixel` is the buffer coordinate of the change)
    //

    pub fn set_bplcon0(&mut self, value: u16, pixel: i32) {
        self.con_changes.add(pixel, ChangeId::Bplcon0, value);
        self.bplcon0 = value;
    }

    pub fn set_bplcon1(&mut self, value: u16) {
        self.bplcon1 = value & 0xFF;
        self.scroll_lores_odd = self.bplcon1 & 0x0F;
        self.scroll_lores_even = (self.bplcon1 >> 4) & 0x0F;
        self.scroll_hires_odd = (self.scroll_lores_odd << 1) & 0x0F;
        self.scroll_hires_even = (self.scroll_lores_even << 1) & 0x0F;
    }

    pub fn set_bplcon2(&mut self, value: u16, pixel: i32) {
        self.con_changes.add(pixel, ChangeId::Bplcon2, value);
        self.bplcon2 = value;
    }

    pub fn poke_bplxdat(&mut self, x: usize, value: u16) {
        self.bpldat[x] = value;
    }

    pub fn poke_sprxpos(&mut self, x: usize, value: u16, pixel: i32) {
        self.sprpos[x] = value;
        self.spr_changes.add(pixel, ChangeId::SprPos(x as u8), value);
    }

    pub fn poke_sprxctl(&mut self, x: usize, value: u16, pixel: i32) {
        self.sprctl[x] = value;
        if value & 0x0080 != 0 {
            self.attach |= 1 << x;
        } else {
            self.attach &= !(1 << x);
        }
        // A CTL write disarms the sprite
        self.armed &= !(1 << x);
        self.spr_changes.add(pixel, ChangeId::SprCtl(x as u8), value);
    }

    pub fn poke_sprxdata(&mut self, x: usize, value: u16, pixel: i32) {
        self.sprdata[x] = value;
        // A DATA write arms the sprite
        self.armed |= 1 << x;
        self.was_armed |= 1 << x;
        self.spr_changes.add(pixel, ChangeId::SprData(x as u8), value);
    }

    pub fn poke_sprxdatb(&mut self, x: usize, value: u16, pixel: i32) {
        self.sprdatb[x] = value;
        self.spr_changes.add(pixel, ChangeId::SprDatb(x as u8), value);
    }

    pub fn poke_clxcon(&mut self, value: u16) {
        self.clxcon = value;
    }

    /// CLXDAT reads clear the register.
    pub fn peek_clxdat(&mut self) -> u16 {
        let result = self.clxdat | 0x8000;
        self.clxdat = 0;
        result
    }

    pub fn peek_deniseid(&self) -> Option<u16> {
        match self.revision {
            DeniseRevision::Ecs => Some(0xFFFC),
            // OCS Denise does not answer; the read takes the faulty path.
            DeniseRevision::Ocs => None,
        }
    }

    //
    // Bitplane serialisation
    //

    /// Copy the data registers into the shift registers. Happens when
    /// BPL1DAT is written, by DMA or by the CPU.
    pub fn fill_shift_registers(&mut self) {
        let bpu = Self::bpu(self.bplcon0) as usize;
        for i in 0..bpu {
            self.shift_reg[i] = (self.shift_reg[i] & 0xFFFF_0000) | self.bpldat[i] as u32;
        }
    }

    /// Serialize 16 bits out of the shift registers at buffer position
    /// `4 * h`. Hires produces one buffer pixel per bit, lores two.
    pub fn draw_unit(&mut self, h: u16) {
        if self.hires() {
            self.draw::<true>(16, h);
        } else {
            self.draw::<false>(16, h);
        }
    }

    fn draw<const HIRES: bool>(&mut self, pixels: usize, h: u16) {
        let mut current = 4 * h as i32;

        if self.first_drawn_pixel == 0 {
            self.first_drawn_pixel = current;
            self.sprite_clip_begin = current - 2;
        }

        let (mut mask_odd, mut mask_even) = if HIRES {
            (
                0x8000u32 << self.scroll_hires_odd,
                0x8000u32 << self.scroll_hires_even,
            )
        } else {
            (
                0x8000u32 << self.scroll_lores_odd,
                0x8000u32 << self.scroll_lores_even,
            )
        };

        for _ in 0..pixels {
            let index = ((self.shift_reg[0] & mask_odd != 0) as u8)
                | (((self.shift_reg[1] & mask_even != 0) as u8) << 1)
                | (((self.shift_reg[2] & mask_odd != 0) as u8) << 2)
                | (((self.shift_reg[3] & mask_even != 0) as u8) << 3)
                | (((self.shift_reg[4] & mask_odd != 0) as u8) << 4)
                | (((self.shift_reg[5] & mask_even != 0) as u8) << 5);

            mask_odd >>= 1;
            mask_even >>= 1;

            if (current as usize) < self.b_buffer.len() - 1 {
                if HIRES {
                    self.b_buffer[current as usize] = index;
                    current += 1;
                } else {
                    self.b_buffer[current as usize] = index;
                    self.b_buffer[current as usize + 1] = index;
                    current += 2;
                }
            }
        }

        for reg in self.shift_reg.iter_mut() {
            *reg <<= pixels;
        }

        self.last_drawn_pixel = current;
    }

    //
    // End-of-line passes
    //

    pub fn begin_of_line(&mut self) {
        self.con_changes.clear();
        self.pixel_engine.col_changes.clear();

        self.initial_bplcon0 = self.bplcon0;
        self.initial_bplcon2 = self.bplcon2;
        self.initial_sprpos = self.sprpos;
        self.initial_sprctl = self.sprctl;
        self.initial_sprdata = self.sprdata;
        self.initial_sprdatb = self.sprdatb;
        self.initial_armed = self.armed;
        self.was_armed = self.armed;

        for reg in self.shift_reg.iter_mut() {
            *reg &= 0xFFFF;
        }

        self.b_buffer.fill(0);
        self.first_drawn_pixel = 0;
        self.last_drawn_pixel = 0;
        self.sprite_clip_begin = HPIXELS as i32;
        self.sprite_clip_end = HPIXELS as i32;
    }

    /// Replay the line's records and emit it into the frame buffer.
    pub fn end_of_line(&mut self, vpos: u16, diw: DiwLine) {
        self.translate();

        if self.emulate_sprites {
            self.draw_sprites();
        } else {
            self.spr_changes.clear();
        }

        self.draw_border(diw);

        if self.clx_plf_plf {
            self.check_p2p_collisions();
        }

        let homod = self.initial_bplcon0 & BPLCON0_HOMOD != 0
            && Self::bpu(self.initial_bplcon0) == 6
            && !Self::dual_playfield(self.initial_bplcon0);
        let ehb = self.initial_bplcon0 & BPLCON0_HOMOD == 0
            && Self::bpu(self.initial_bplcon0) == 6
            && !Self::dual_playfield(self.initial_bplcon0);

        self.pixel_engine
            .colorize(vpos, &self.i_buffer[..], &self.m_buffer[..], homod, ehb);
    }

    /// A line inside the vertical blanking area: nothing is displayed,
    /// but the change logs still have to drain.
    pub fn end_of_vblank_line(&mut self) {
        self.con_changes.clear();
        self.spr_changes.clear();
        self.pixel_engine.apply_remaining_col_changes();
    }

    /// Translate the raw bitplane indices into color indices and depth
    /// codes, replaying BPLCON0/BPLCON2 changes in pixel order.
    fn translate(&mut self) {
        let mut pixel: i32 = 0;

        let mut bplcon0 = self.initial_bplcon0;
        let mut bplcon2 = self.initial_bplcon2;
        let mut dual = Self::dual_playfield(bplcon0);
        let mut pri = bplcon2 & 0x0040 != 0; // PF2PRI
        self.prio1 = Self::z_pf(bplcon2 & 0b111);
        self.prio2 = Self::z_pf((bplcon2 >> 3) & 0b111);

        // A terminating pseudo-change makes the loop draw to line end.
        let changes: Vec<RegChange> = self
            .con_changes
            .iter()
            .copied()
            .chain(std::iter::once(RegChange {
                trigger: HPIXELS as i32,
                addr: ChangeId::None,
                value: 0,
            }))
            .collect();

        for change in changes {
            let to = change.trigger.clamp(0, HPIXELS as i32);
            if dual {
                self.translate_dpf(pri, pixel, to);
            } else {
                self.translate_spf(pixel, to);
            }
            pixel = to;

            match change.addr {
                ChangeId::Bplcon0 => {
                    bplcon0 = change.value;
                    dual = Self::dual_playfield(bplcon0);
                }
                ChangeId::Bplcon2 => {
                    bplcon2 = change.value;
                    pri = bplcon2 & 0x0040 != 0;
                    self.prio1 = Self::z_pf(bplcon2 & 0b111);
                    self.prio2 = Self::z_pf((bplcon2 >> 3) & 0b111);
                }
                _ => {}
            }
        }

        self.con_changes.clear();
    }

    fn translate_spf(&mut self, from: i32, to: i32) {
        let prio2 = self.prio2;
        for i in from as usize..to as usize {
            let s = self.b_buffer[i];

            if prio2 != 0 {
                self.i_buffer[i] = s;
                self.m_buffer[i] = s;
                self.z_buffer[i] = if s != 0 { prio2 } else { 0 };
            } else {
                // Illegal priority: pixels keep color but no depth
                let coerced = if s & 16 != 0 { 16 } else { s };
                self.i_buffer[i] = coerced;
                self.m_buffer[i] = coerced;
                self.z_buffer[i] = 0;
            }
        }
    }

    fn translate_dpf(&mut self, pf2pri: bool, from: i32, to: i32) {
        // Illegal priority values draw that playfield transparent.
        let mask1 = if self.prio1 != 0 { 0b1111 } else { 0b0000 };
        let mask2 = if self.prio2 != 0 { 0b1111 } else { 0b0000 };

        for i in from as usize..to as usize {
            let s = self.b_buffer[i];

            // Odd bitplanes form playfield 1, even form playfield 2
            let index1 = ((s & 1) >> 0) | ((s & 4) >> 1) | ((s & 16) >> 2);
            let index2 = ((s & 2) >> 1) | ((s & 8) >> 2) | ((s & 32) >> 3);

            let (index, z) = match (index1 != 0, index2 != 0) {
                (true, true) => {
                    if pf2pri {
                        ((index2 | 0b1000) & mask2, self.prio2 | Z_DPF | Z_PF1 | Z_PF2)
                    } else {
                        (index1 & mask1, self.prio1 | Z_DPF | Z_PF1 | Z_PF2)
                    }
                }
                (true, false) => (index1 & mask1, self.prio1 | Z_DPF | Z_PF1),
                (false, true) => ((index2 | 0b1000) & mask2, self.prio2 | Z_DPF | Z_PF2),
                (false, false) => (0, Z_DPF),
            };

            self.i_buffer[i] = index;
            self.m_buffer[i] = index;
            self.z_buffer[i] = z;
        }
    }

    //
    // Sprites
    //

    /// Horizontal start position of a sprite in buffer pixels.
    fn spr_start(pos: u16, ctl: u16) -> i32 {
        let view = SprPosCtl::from_bytes([
            ctl as u8,
            (ctl >> 8) as u8,
            pos as u8,
            (pos >> 8) as u8,
        ]);
        let hpos = ((view.h_high() as i32) << 1) | view.h0() as i32;
        2 + 2 * hpos
    }

    fn attached(&self, x: usize) -> bool {
        debug_assert!(x % 2 == 1);
        self.attach & (1 << x) != 0
    }

    fn draw_sprites(&mut self) {
        if self.was_armed != 0 {
            if self.was_armed & 0b1100_0000 != 0 {
                self.draw_sprite_pair(7);
            }
            if self.was_armed & 0b0011_0000 != 0 {
                self.draw_sprite_pair(5);
            }
            if self.was_armed & 0b0000_1100 != 0 {
                self.draw_sprite_pair(3);
            }
            if self.was_armed & 0b0000_0011 != 0 {
                self.draw_sprite_pair(1);
            }
        }
        self.spr_changes.clear();
    }

    /// Draw sprites x-1 and x, replaying their register changes in pixel
    /// order.
    fn draw_sprite_pair(&mut self, x: usize) {
        debug_assert!(x % 2 == 1);

        if self.sprite_clip_begin == HPIXELS as i32 {
            return;
        }

        let mut data1 = self.initial_sprdata[x - 1];
        let mut data2 = self.initial_sprdata[x];
        let mut datb1 = self.initial_sprdatb[x - 1];
        let mut datb2 = self.initial_sprdatb[x];
        let mut pos1 = self.initial_sprpos[x - 1];
        let mut pos2 = self.initial_sprpos[x];
        let mut ctl1 = self.initial_sprctl[x - 1];
        let mut ctl2 = self.initial_sprctl[x];
        let mut strt1 = Self::spr_start(pos1, ctl1);
        let mut strt2 = Self::spr_start(pos2, ctl2);
        let mut armed1 = self.initial_armed & (1 << (x - 1)) != 0;
        let mut armed2 = self.initial_armed & (1 << x) != 0;
        let at = self.attached(x);
        let mut strt: i32 = 0;

        let changes: Vec<RegChange> = self.spr_changes.iter().copied().collect();
        for change in changes {
            self.draw_sprite_pair_chunk(
                x,
                strt,
                change.trigger,
                strt1,
                strt2,
                data1,
                data2,
                datb1,
                datb2,
                armed1,
                armed2,
                at,
            );
            strt = change.trigger;

            match change.addr {
                ChangeId::SprData(n) if n as usize == x - 1 => {
                    data1 = change.value;
                    armed1 = true;
                }
                ChangeId::SprData(n) if n as usize == x => {
                    data2 = change.value;
                    armed2 = true;
                }
                ChangeId::SprDatb(n) if n as usize == x - 1 => datb1 = change.value,
                ChangeId::SprDatb(n) if n as usize == x => datb2 = change.value,
                ChangeId::SprPos(n) if n as usize == x - 1 => {
                    pos1 = change.value;
                    strt1 = Self::spr_start(pos1, ctl1);
                }
                ChangeId::SprPos(n) if n as usize == x => {
                    pos2 = change.value;
                    strt2 = Self::spr_start(pos2, ctl2);
                }
                ChangeId::SprCtl(n) if n as usize == x - 1 => {
                    ctl1 = change.value;
                    strt1 = Self::spr_start(pos1, ctl1);
                    armed1 = false;
                }
                ChangeId::SprCtl(n) if n as usize == x => {
                    ctl2 = change.value;
                    strt2 = Self::spr_start(pos2, ctl2);
                    armed2 = false;
                }
                _ => {}
            }
        }

        self.draw_sprite_pair_chunk(
            x,
            strt,
            HPIXELS as i32 - 1,
            strt1,
            strt2,
            data1,
            data2,
            datb1,
            datb2,
            armed1,
            armed2,
            at,
        );

        // Collision checks run over the sprite's horizontal extent
        let clx_from = strt1;
        let clx_to = strt1 + 31;
        if self.clx_spr_spr {
            self.check_s2s_collisions(x, clx_from, clx_to);
        }
        if self.clx_spr_plf {
            self.check_s2p_collisions(x, clx_from, clx_to);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn draw_sprite_pair_chunk(
        &mut self,
        x: usize,
        hstrt: i32,
        hstop: i32,
        strt1: i32,
        strt2: i32,
        data1: u16,
        data2: u16,
        datb1: u16,
        datb2: u16,
        armed1: bool,
        armed2: bool,
        at: bool,
    ) {
        let mut hpos = if hstrt % 2 == 0 { hstrt } else { hstrt + 1 };

        while hpos < hstop {
            if hpos == strt1 && armed1 {
                self.ssra[x - 1] = data1;
                self.ssrb[x - 1] = datb1;
            }
            if hpos == strt2 && armed2 {
                self.ssra[x] = data2;
                self.ssrb[x] = datb2;
            }

            if self.ssra[x - 1] | self.ssrb[x - 1] | self.ssra[x] | self.ssrb[x] != 0 {
                if hpos >= self.sprite_clip_begin && hpos < self.sprite_clip_end {
                    if at {
                        self.draw_attached_sprite_pixel(x, hpos);
                    } else {
                        self.draw_sprite_pixel(x - 1, hpos);
                        self.draw_sprite_pixel(x, hpos);
                    }
                }
                self.ssra[x - 1] <<= 1;
                self.ssrb[x - 1] <<= 1;
                self.ssra[x] <<= 1;
                self.ssrb[x] <<= 1;
            }

            hpos += 2;
        }
    }

    fn draw_sprite_pixel(&mut self, x: usize, hpos: i32) {
        let a = (self.ssra[x] >> 15) as u8;
        let b = ((self.ssrb[x] >> 14) & 2) as u8;
        let col = a | b;

        if col != 0 {
            let z = Z_SP[x];
            let base = 16 + 2 * (x as u8 & 6);
            let hpos = hpos as usize;

            if z > self.z_buffer[hpos] {
                self.m_buffer[hpos] = base | col;
            }
            if z > self.z_buffer[hpos + 1] {
                self.m_buffer[hpos + 1] = base | col;
            }
            self.z_buffer[hpos] |= z;
            self.z_buffer[hpos + 1] |= z;
        }
    }

    /// An attached pair forms one 4-bit pixel addressing colors 16-31.
    fn draw_attached_sprite_pixel(&mut self, x: usize, hpos: i32) {
        let a1 = (self.ssra[x - 1] >> 15) as u8;
        let b1 = ((self.ssrb[x - 1] >> 14) & 0b0010) as u8;
        let a2 = ((self.ssra[x] >> 13) & 0b0100) as u8;
        let b2 = ((self.ssrb[x] >> 12) & 0b1000) as u8;
        let col = a1 | b1 | a2 | b2;

        if col != 0 {
            let z = Z_SP[x];
            let hpos = hpos as usize;

            if z > self.z_buffer[hpos] {
                self.m_buffer[hpos] = 0b1_0000 | col;
            }
            if z > self.z_buffer[hpos + 1] {
                self.m_buffer[hpos + 1] = 0b1_0000 | col;
            }
            self.z_buffer[hpos] |= z;
            self.z_buffer[hpos + 1] |= z;
        }
    }

    //
    // Border
    //

    fn draw_border(&mut self, diw: DiwLine) {
        let border: u8 = 0;

        // Was the horizontal flip-flop set anywhere in this line?
        let hflop_was_set = diw.hflop || diw.hflop_on != -1;
        let line_is_blank = !diw.vflop || !hflop_was_set;

        if line_is_blank {
            for i in 0..=LAST_PIXEL {
                self.i_buffer[i] = border;
                self.m_buffer[i] = border;
            }
            return;
        }

        if !diw.hflop && diw.hflop_on != -1 {
            let end = (2 * diw.hflop_on as usize).min(LAST_PIXEL + 1);
            for i in 0..end {
                self.i_buffer[i] = border;
                self.m_buffer[i] = border;
            }
        }

        if diw.hflop_off != -1 {
            let start = (2 * diw.hflop_off as usize).min(LAST_PIXEL + 1);
            for i in start..=LAST_PIXEL {
                self.i_buffer[i] = border;
                self.m_buffer[i] = border;
            }
        }
    }

    //
    // Collision detection
    //

    // CLXCON field accessors. Bit layout: ENSP pairs in 15-12, ENBP6-1 in
    // 11-6, MVBP6-1 in 5-0.
    fn ensp(&self, x: usize) -> bool {
        self.clxcon & (1 << (12 + x / 2)) != 0
    }

    fn enbp1(&self) -> u8 {
        let c = self.clxcon;
        (((c >> 6) & 1) | ((c >> 8) & 1) << 2 | ((c >> 10) & 1) << 4) as u8
    }

    fn enbp2(&self) -> u8 {
        let c = self.clxcon;
        (((c >> 7) & 1) << 1 | ((c >> 9) & 1) << 3 | ((c >> 11) & 1) << 5) as u8
    }

    fn mvbp1(&self) -> u8 {
        let c = self.clxcon;
        ((c & 1) | ((c >> 2) & 1) << 2 | ((c >> 4) & 1) << 4) as u8
    }

    fn mvbp2(&self) -> u8 {
        let c = self.clxcon;
        (((c >> 1) & 1) << 1 | ((c >> 3) & 1) << 3 | ((c >> 5) & 1) << 5) as u8
    }

    fn check_s2s_collisions(&mut self, x: usize, start: i32, end: i32) {
        // For the odd sprite of a pair, only proceed if enabled
        if x % 2 == 1 && !self.ensp(x) {
            return;
        }

        let comp01 = Z_SP0 | if self.ensp(1) { Z_SP1 } else { 0 };
        let comp23 = Z_SP2 | if self.ensp(3) { Z_SP3 } else { 0 };
        let comp45 = Z_SP4 | if self.ensp(5) { Z_SP5 } else { 0 };
        let comp67 = Z_SP6 | if self.ensp(7) { Z_SP7 } else { 0 };

        let start = start.max(0) as usize;
        let end = (end as usize).min(HPIXELS - 1);

        for pos in (start..=end).rev().step_by(2) {
            let z = self.z_buffer[pos];

            if z & (Z_SP_ALL ^ Z_SP[x]) == 0 {
                continue;
            }
            if z & Z_SP[x] == 0 {
                continue;
            }

            if z & comp45 != 0 && z & comp67 != 0 {
                self.clxdat |= 1 << 14;
            }
            if z & comp23 != 0 && z & comp67 != 0 {
                self.clxdat |= 1 << 13;
            }
            if z & comp23 != 0 && z & comp45 != 0 {
                self.clxdat |= 1 << 12;
            }
            if z & comp01 != 0 && z & comp67 != 0 {
                self.clxdat |= 1 << 11;
            }
            if z & comp01 != 0 && z & comp45 != 0 {
                self.clxdat |= 1 << 10;
            }
            if z & comp01 != 0 && z & comp23 != 0 {
                self.clxdat |= 1 << 9;
            }
        }
    }

    fn check_s2p_collisions(&mut self, x: usize, start: i32, end: i32) {
        if x % 2 == 1 && !self.ensp(x) {
            return;
        }

        let enabled1 = self.enbp1();
        let enabled2 = self.enbp2();
        let compare1 = self.mvbp1() & enabled1;
        let compare2 = self.mvbp2() & enabled2;

        let start = start.max(0) as usize;
        let end = (end as usize).min(HPIXELS - 1);

        for pos in (start..=end).rev().step_by(2) {
            let z = self.z_buffer[pos];

            if z & Z_SP[x] == 0 {
                continue;
            }

            // Playfield 2 check
            if self.b_buffer[pos] & enabled2 == compare2 {
                self.clxdat |= 1 << (5 + x / 2);
            } else if self.z_buffer[pos] & Z_DPF == 0 {
                // Single-playfield oddity: if PF2 doesn't match, PF1
                // doesn't match either.
                continue;
            }

            // Playfield 1 check
            if self.b_buffer[pos] & enabled1 == compare1 {
                self.clxdat |= 1 << (1 + x / 2);
            }
        }
    }

    fn check_p2p_collisions(&mut self) {
        if self.clxdat & 1 != 0 {
            return;
        }

        let enabled1 = self.enbp1();
        let enabled2 = self.enbp2();
        let compare1 = self.mvbp1() & enabled1;
        let compare2 = self.mvbp2() & enabled2;

        for pos in 0..HPIXELS {
            let b = self.b_buffer[pos];
            if b & enabled1 != compare1 {
                continue;
            }
            if b & enabled2 != compare2 {
                continue;
            }
            self.clxdat |= 1;
            return;
        }
    }

    pub fn save_items(&self, w: &mut SnapshotWriter) {
        w.put_u16(self.bplcon0);
        w.put_u16(self.bplcon1);
        w.put_u16(self.bplcon2);
        for d in self.bpldat {
            w.put_u16(d);
        }
        for x in 0..8 {
            w.put_u16(self.sprpos[x]);
            w.put_u16(self.sprctl[x]);
            w.put_u16(self.sprdata[x]);
            w.put_u16(self.sprdatb[x]);
        }
        w.put_u8(self.armed);
        w.put_u8(self.attach);
        w.put_u16(self.clxdat);
        w.put_u16(self.clxcon);
        self.pixel_engine.save_items(w);
    }

    pub fn load_items(&mut self, r: &mut SnapshotReader) -> Result<(), crate::error::SnapshotError> {
        let bplcon0 = r.take_u16()?;
        self.bplcon0 = bplcon0;
        let bplcon1 = r.take_u16()?;
        self.set_bplcon1(bplcon1);
        self.bplcon2 = r.take_u16()?;
        for d in self.bpldat.iter_mut() {
            *d = r.take_u16()?;
        }
        for x in 0..8 {
            self.sprpos[x] = r.take_u16()?;
            self.sprctl[x] = r.take_u16()?;
            self.sprdata[x] = r.take_u16()?;
            self.sprdatb[x] = r.take_u16()?;
        }
        self.armed = r.take_u8()?;
        self.attach = r.take_u8()?;
        self.clxdat = r.take_u16()?;
        self.clxcon = r.take_u16()?;
        self.pixel_engine.load_items(r)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn denise_with_planes(bplcon0: u16, data: &[u16]) -> Denise {
        let mut denise = Denise::new();
        denise.bplcon0 = bplcon0;
        denise.initial_bplcon0 = bplcon0;
        for (i, &d) in data.iter().enumerate() {
            denise.bpldat[i] = d;
        }
        denise.fill_shift_registers();
        denise
    }

    #[test]
    fn lores_draw_doubles_pixels() {
        let mut denise = denise_with_planes(0x1200, &[0x8000]);
        denise.begin_of_line();
        denise.fill_shift_registers();
        denise.draw_unit(0x30);

        let base = 4 * 0x30;
        assert_eq!(denise.b_buffer[base], 1);
        assert_eq!(denise.b_buffer[base + 1], 1);
        assert_eq!(denise.b_buffer[base + 2], 0);
    }

    #[test]
    fn hires_draw_single_pixels() {
        let mut denise = denise_with_planes(0x9200, &[0xC000]);
        denise.begin_of_line();
        denise.fill_shift_registers();
        denise.draw_unit(0x30);

        let base = 4 * 0x30;
        assert_eq!(denise.b_buffer[base], 1);
        assert_eq!(denise.b_buffer[base + 1], 1);
        assert_eq!(denise.b_buffer[base + 2], 0);
    }

    #[test]
    fn translate_spf_uses_prio2() {
        let mut denise = denise_with_planes(0x2200, &[0xFFFF, 0xFFFF]);
        denise.begin_of_line();
        denise.initial_bplcon2 = 0x0008; // PF2 priority 1
        denise.bplcon2 = 0x0008;
        denise.fill_shift_registers();
        denise.draw_unit(0x30);
        denise.translate();

        let base = 4 * 0x30;
        assert_eq!(denise.i_buffer[base], 3);
        assert_eq!(denise.z_buffer[base], Z_1);
        // Transparent pixels get no depth
        assert_eq!(denise.z_buffer[base + 64], 0);
    }

    #[test]
    fn translate_dpf_splits_playfields() {
        // 4 planes dual playfield; plane 1 (odd/PF1) and plane 2 (even/PF2)
        let bplcon0 = 0x4000 | BPLCON0_DBPLF | 0x0200;
        let mut denise = denise_with_planes(bplcon0, &[0xFFFF, 0xFFFF, 0, 0]);
        denise.begin_of_line();
        denise.initial_bplcon2 = 0b001_001; // both playfields priority 1
        denise.bplcon2 = denise.initial_bplcon2;
        denise.fill_shift_registers();
        denise.draw_unit(0x30);
        denise.translate();

        let base = 4 * 0x30;
        // PF2PRI clear: PF1 wins, index from odd planes
        assert_eq!(denise.i_buffer[base], 1);
        assert!(denise.z_buffer[base] & Z_DPF != 0);
        assert!(denise.z_buffer[base] & Z_PF1 != 0);
        assert!(denise.z_buffer[base] & Z_PF2 != 0);
    }

    #[test]
    fn translate_dpf_pf2pri_selects_playfield_2() {
        let bplcon0 = 0x4000 | BPLCON0_DBPLF;
        let mut denise = denise_with_planes(bplcon0, &[0xFFFF, 0xFFFF, 0, 0]);
        denise.begin_of_line();
        denise.initial_bplcon2 = 0x0040 | 0b001_001;
        denise.bplcon2 = denise.initial_bplcon2;
        denise.fill_shift_registers();
        denise.draw_unit(0x30);
        denise.translate();

        let base = 4 * 0x30;
        // PF2 color indices are offset by 8
        assert_eq!(denise.i_buffer[base], 0b1001);
    }

    #[test]
    fn midline_bplcon2_change_is_replayed_in_order() {
        let mut denise = denise_with_planes(0x1200, &[0xFFFF]);
        denise.begin_of_line();
        denise.initial_bplcon2 = 0x0008;
        denise.bplcon2 = 0x0008;
        denise.fill_shift_registers();
        denise.draw_unit(0x30);

        // Change PF2 priority to 2 at pixel 4*0x30+8
        let base = 4 * 0x30;
        denise.set_bplcon2(0x0010, base + 8);
        denise.translate();

        assert_eq!(denise.z_buffer[base as usize], Z_1);
        assert_eq!(denise.z_buffer[base as usize + 8], Z_2);
    }

    #[test]
    fn sprite_pixel_respects_depth() {
        let mut denise = Denise::new();
        denise.begin_of_line();
        denise.sprite_clip_begin = 0;
        denise.sprite_clip_end = HPIXELS as i32;

        // Playfield with priority 0 in front of everything
        denise.z_buffer[100] = Z_0;
        denise.i_buffer[100] = 5;
        denise.m_buffer[100] = 5;

        denise.ssra[0] = 0x8000;
        denise.draw_sprite_pixel(0, 100);

        // Sprite loses against Z_0 but its depth bit is recorded
        assert_eq!(denise.m_buffer[100], 5);
        assert!(denise.z_buffer[100] & Z_SP0 != 0);

        denise.ssra[0] = 0x8000;
        denise.draw_sprite_pixel(0, 200);
        assert_eq!(denise.m_buffer[200], 17); // color base 16 + pattern 1
    }

    #[test]
    fn attached_sprites_form_4bit_color() {
        let mut denise = Denise::new();
        denise.begin_of_line();
        denise.sprite_clip_begin = 0;
        denise.sprite_clip_end = HPIXELS as i32;

        denise.ssra[0] = 0x8000; // bit 0
        denise.ssrb[0] = 0x8000; // bit 1
        denise.ssra[1] = 0x8000; // bit 2
        denise.ssrb[1] = 0x8000; // bit 3
        denise.draw_attached_sprite_pixel(1, 50);

        assert_eq!(denise.m_buffer[50], 0b1_1111);
    }

    #[test]
    fn border_outside_diw() {
        let mut denise = denise_with_planes(0x1200, &[0xFFFF]);
        denise.begin_of_line();
        denise.initial_bplcon2 = 0x0008;
        denise.bplcon2 = 0x0008;
        denise.fill_shift_registers();
        denise.draw_unit(0x60);
        denise.translate();

        // DIW from 0x81 to 0xC1 (S5 window)
        denise.draw_border(DiwLine {
            vflop: true,
            hflop: false,
            hflop_on: 0x81,
            hflop_off: 0xC1,
        });

        assert_eq!(denise.m_buffer[2 * 0x81 - 1], 0);
        assert_eq!(denise.m_buffer[2 * 0xC1], 0);
        // Inside the window the playfield survives
        assert_eq!(denise.m_buffer[4 * 0x60], 1);
    }

    #[test]
    fn whole_line_blank_when_vflop_clear() {
        let mut denise = denise_with_planes(0x1200, &[0xFFFF]);
        denise.begin_of_line();
        denise.initial_bplcon2 = 0x0008;
        denise.bplcon2 = 0x0008;
        denise.fill_shift_registers();
        denise.draw_unit(0x60);
        denise.translate();

        denise.draw_border(DiwLine {
            vflop: false,
            hflop: false,
            hflop_on: 0x81,
            hflop_off: 0xC1,
        });
        assert!(denise.m_buffer[..=LAST_PIXEL].iter().all(|&p| p == 0));
    }

    #[test]
    fn p2p_collision_uses_clxcon_masks() {
        let mut denise = Denise::new();
        denise.begin_of_line();

        // Enable plane 1 (PF1) and plane 2 (PF2), match value 1 for both
        denise.poke_clxcon(0x00C3);

        denise.b_buffer[10] = 0b0001; // only plane 1 set: no collision
        denise.check_p2p_collisions();
        assert_eq!(denise.clxdat & 1, 0);

        denise.b_buffer[10] = 0b0011; // both planes set
        denise.check_p2p_collisions();
        assert_eq!(denise.clxdat & 1, 1);

        // Reading clears
        assert_eq!(denise.peek_clxdat() & 1, 1);
        assert_eq!(denise.clxdat, 0);
    }

    #[test]
    fn sprite_arming_follows_data_and_ctl() {
        let mut denise = Denise::new();
        denise.poke_sprxdata(3, 0x1234, 0);
        assert!(denise.armed & (1 << 3) != 0);

        denise.poke_sprxctl(3, 0x0000, 0);
        assert!(denise.armed & (1 << 3) == 0);
    }

    #[test]
    fn change_recorder_keeps_pixel_order() {
        let mut rec = ChangeRecorder::new();
        rec.add(10, ChangeId::Bplcon0, 1);
        rec.add(5, ChangeId::Bplcon2, 2);
        rec.add(10, ChangeId::Color(0), 3);

        let triggers: Vec<i32> = rec.iter().map(|c| c.trigger).collect();
        assert_eq!(triggers, vec![5, 10, 10]);
        // Same trigger: insertion order preserved
        assert_eq!(rec.iter().nth(1).unwrap().value, 1);
    }
}
