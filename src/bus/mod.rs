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
*/
#![allow(dead_code)]
//! The shared 16-bit bus. The Bus owns every chip, decodes 24-bit
//! addresses through the region table, and advances Agnus one horizontal
//! position at a time. This ownership hierarchy avoids interior
//! mutability between components: all cross-chip traffic flows through
//! methods on this struct.
//!
//! CPU accesses to anything on the chip bus (Chip Ram, Slow Ram, the
//! CIAs, the RTC, custom registers, Autoconfig space) first ask the DMA
//! arbiter for a free slot and cooperatively block until one is granted.
//! Fast Ram and Rom accesses bypass the arbiter entirely.

pub mod custom;
pub mod memory;

use crate::{
    agnus::{
        scheduler::{EventId, Slot},
        Agnus,
        BusOwner,
        RegChange,
        DMACON_AUDEN,
        DMACON_DSKEN,
        VBLANK_LINES,
    },
    cia::{Cia, CiaId, Keyboard},
    config::{AmigaConfig, BlitterAccuracy},
    controlport::{ControlPort, PortDevice},
    cpu::CpuBus,
    denise::{Denise, DiwLine},
    error::MemError,
    messages::{Msg, MsgSender},
    paula::{IrqSource, Paula},
    Cycle,
};

use memory::{MemSrc, Memory};

/// Value seen on an unmapped data bus.
pub const OPEN_BUS_WORD: u16 = 0xFFFF;

/// Keyboard serial cadence: one byte every eight scanlines.
const KB_DELIVERY_CYCLES: Cycle = 8 * crate::HPOS_CNT as Cycle * crate::CCKS_PER_HPOS;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PokeSource {
    Cpu,
    Copper,
}

pub struct Bus {
    pub memory: Memory,
    pub agnus: Agnus,
    pub denise: Denise,
    pub paula: Paula,
    pub ciaa: Cia,
    pub ciab: Cia,
    pub keyboard: Keyboard,
    pub port1: ControlPort,
    pub port2: ControlPort,

    /// The last value that passed on the data bus. Feeds the faulty
    /// register read quirk.
    pub data_bus: u16,
    pub blitter_accuracy: BlitterAccuracy,

    /// Minimal RTC register bank (present only when configured).
    rtc_regs: [u8; 16],
    /// Autoconfig protocol state for the Fast Ram board.
    autoconf_configured: bool,
    fast_ram_size: usize,

    msg: MsgSender,
    /// Extra color clocks the CPU spent waiting on the bus, drained by
    /// the orchestrator after each instruction.
    stall: Cycle,
    /// Set when the frame wrapped during the last advance.
    pub eof: bool,
    /// Inspection request latched by the INS event slot.
    pub inspect_pending: bool,

    kb_next_delivery: Cycle,
}

impl Bus {
    pub fn new(config: &AmigaConfig, msg: MsgSender) -> Self {
        let mut memory = Memory::new();
        memory.alloc_ram(config.chip_ram, config.slow_ram, config.fast_ram);
        memory.ext_start = config.ext_start;
        memory.rtc_present = config.real_time_clock;

        let mut denise = Denise::new();
        denise.revision = config.denise_revision;
        denise.emulate_sprites = config.emulate_sprites;
        denise.clx_spr_spr = config.clx_spr_spr;
        denise.clx_spr_plf = config.clx_spr_plf;
        denise.clx_plf_plf = config.clx_plf_plf;

        let mut paula = Paula::new();
        paula.disk.fifo_buffering = config.disk_fifo_buffering;
        for (i, drive) in config.drives.iter().enumerate() {
            paula.disk.drives[i].connected = drive.connected;
            paula.disk.drives[i].drive_type = drive.drive_type;
        }

        let mut port1 = ControlPort::new(1);
        port1.connect_device(PortDevice::Mouse);
        let mut port2 = ControlPort::new(2);
        port2.connect_device(PortDevice::Joystick);

        let mut bus = Self {
            memory,
            agnus: Agnus::new(),
            denise,
            paula,
            ciaa: Cia::new(CiaId::A),
            ciab: Cia::new(CiaId::B),
            keyboard: Keyboard::new(),
            port1,
            port2,
            data_bus: 0,
            blitter_accuracy: config.blitter_accuracy,
            rtc_regs: [0; 16],
            autoconf_configured: false,
            fast_ram_size: config.fast_ram,
            msg,
            stall: 0,
            eof: false,
            inspect_pending: false,
            kb_next_delivery: 0,
        };
        bus.update_mem_layout();
        bus
    }

    pub fn reset(&mut self) {
        self.agnus.reset();
        self.denise.reset();
        self.paula.reset();
        self.ciaa.reset();
        self.ciab.reset();
        self.data_bus = 0;
        self.stall = 0;
        self.eof = false;
        self.memory.fill_ram_with_startup_pattern();
        if self.memory.has_wom() {
            self.memory.erase_wom();
        }
        self.update_mem_layout();
        self.denise.begin_of_line();
        self.agnus.update_line_state();
    }

    /// Rebuild the region table from the current OVL line and inform the
    /// host.
    pub fn update_mem_layout(&mut self) {
        let ovl = self.ciaa.ovl();
        self.memory.update_mem_src_table(ovl);
        self.msg.send(Msg::MemLayout);
    }

    #[inline]
    pub fn take_stall(&mut self) -> Cycle {
        std::mem::take(&mut self.stall)
    }

    #[inline]
    pub fn take_eof(&mut self) -> bool {
        std::mem::take(&mut self.eof)
    }

    //
    // Clock advancement
    //

    /// Advance Agnus until its clock reaches `target`.
    pub fn execute_until(&mut self, target: Cycle) {
        while self.agnus.clock < target {
            self.execute_hpos();
        }
    }

    /// One horizontal position: DMA, events, beam advance.
    pub fn execute_hpos(&mut self) {
        self.execute_hpos_inner();
        self.finish_hpos();
    }

    fn execute_hpos_inner(&mut self) {
        // Delayed register writes land first
        while let Some(change) = self.agnus.due_reg_change() {
            self.apply_reg_change(change);
        }

        self.run_fixed_dma();
        self.service_events();
        self.paula.audio.tick();
    }

    fn finish_hpos(&mut self) {
        if self.agnus.advance_beam() {
            self.end_of_line();
            let wrapped = self.agnus.hsync();
            if wrapped {
                self.end_of_frame();
            }
            self.begin_of_line();
        }
    }

    /// The cooperative bus wait for a CPU chip access. Advances Agnus
    /// until the arbiter grants a slot; the access occupies two
    /// horizontal positions (address phase plus data phase). Any time
    /// beyond the nominal four color clocks is booked as a stall.
    fn cpu_chip_access(&mut self) {
        let start = self.agnus.clock;
        self.agnus.cpu_waiting = true;

        // Address phase
        self.execute_hpos();

        // Data phase: wait for a grant
        loop {
            self.execute_hpos_inner();
            let granted = self.agnus.try_allocate_cpu();
            self.finish_hpos();
            if granted {
                break;
            }
        }

        self.agnus.cpu_waiting = false;
        let elapsed = self.agnus.clock - start;
        if elapsed > 4 {
            self.stall += elapsed - 4;
        }
    }

    //
    // Fixed-slot DMA engine
    //

    fn run_fixed_dma(&mut self) {
        let h = self.agnus.pos.h;

        // 1. Memory refresh
        if Agnus::is_refresh_slot(h) {
            self.agnus.allocate_bus(BusOwner::Refresh);
            return;
        }

        // 2. Disk DMA
        if Agnus::disk_slot_index(h).is_some()
            && self.agnus.dma_enabled(DMACON_DSKEN)
            && self.paula.disk.try_take_slot()
            && self.agnus.allocate_bus(BusOwner::Disk)
        {
            self.do_disk_dma();
            return;
        }

        // 3. Audio DMA
        if let Some(ch) = Agnus::audio_slot_index(h) {
            let enabled = self.agnus.dma_enabled(1 << ch) && self.agnus.dmacon & DMACON_AUDEN != 0;
            if enabled
                && self.paula.audio.channels[ch].wants_slot()
                && self.agnus.allocate_bus(BusOwner::Audio)
            {
                self.do_audio_dma(ch);
                return;
            }
        }

        // 4. Sprite DMA
        if let Some((x, second)) = Agnus::sprite_slot_index(h) {
            if let Some(fetch) = self.agnus.sprite_dma_wanted(x) {
                if self.agnus.allocate_bus(BusOwner::Sprite) {
                    self.do_sprite_dma(x, second, fetch);
                    return;
                }
            }
        }

        // 5. Bitplane DMA
        let plane = self.agnus.bitplane_at(h);
        if plane > 0 && self.agnus.allocate_bus(BusOwner::Bitplane) {
            self.do_bitplane_dma(plane as usize - 1, h);
        }
    }

    fn do_disk_dma(&mut self) {
        if self.paula.disk.is_writing() {
            let word = self.memory.read_chip16(self.agnus.dskpt);
            let (_, done) = self.paula.disk.transfer_word(word);
            self.agnus.record_bus_value(word);
            self.data_bus = word;
            self.agnus.dskpt = crate::agnus::inc_chip_ptr(self.agnus.dskpt, 2);
            if done {
                self.paula.raise_irq(IrqSource::DskBlk);
            }
        } else {
            let (word, done) = self.paula.disk.transfer_word(0);
            self.memory.write_chip16(self.agnus.dskpt, word);
            self.agnus.record_bus_value(word);
            self.data_bus = word;
            self.agnus.dskpt = crate::agnus::inc_chip_ptr(self.agnus.dskpt, 2);
            if done {
                self.paula.raise_irq(IrqSource::DskBlk);
            }
        }
    }

    fn do_audio_dma(&mut self, ch: usize) {
        let addr = self.paula.audio.channels[ch].audpt;
        let word = self.memory.read_chip16(addr);
        self.agnus.record_bus_value(word);
        self.data_bus = word;
        if self.paula.audio.channels[ch].did_fetch(word) {
            let source = match ch {
                0 => IrqSource::Aud0,
                1 => IrqSource::Aud1,
                2 => IrqSource::Aud2,
                _ => IrqSource::Aud3,
            };
            self.paula.raise_irq(source);
        }
    }

    fn do_sprite_dma(&mut self, x: usize, second: bool, fetch: crate::agnus::SprFetch) {
        let addr = self.agnus.sprpt[x];
        let word = self.memory.read_chip16(addr);
        self.agnus.sprpt[x] = crate::agnus::inc_chip_ptr(addr, 2);
        self.agnus.record_bus_value(word);
        self.data_bus = word;

        let pixel = 4 * self.agnus.pos.h as i32;
        match fetch {
            crate::agnus::SprFetch::PosCtl => {
                if !second {
                    self.denise.poke_sprxpos(x, word, pixel);
                } else {
                    let pos = self.denise.sprpos[x];
                    self.agnus.sprite_ctl_fetched(x, pos, word);
                    self.denise.poke_sprxctl(x, word, pixel);
                }
            }
            crate::agnus::SprFetch::Data => {
                if !second {
                    self.denise.poke_sprxdata(x, word, pixel);
                } else {
                    self.denise.poke_sprxdatb(x, word, pixel);
                }
            }
        }
    }

    fn do_bitplane_dma(&mut self, plane: usize, h: u16) {
        let addr = self.agnus.bplpt[plane];
        let word = self.memory.read_chip16(addr);
        self.agnus.bplpt[plane] = crate::agnus::inc_chip_ptr(addr, 2);
        self.agnus.record_bus_value(word);
        self.data_bus = word;

        self.denise.poke_bplxdat(plane, word);
        if plane == 0 {
            // BPL1 closes the fetch unit: load the shifters and draw
            self.denise.fill_shift_registers();
            self.denise.draw_unit(h);
        }
    }

    //
    // Scheduler service
    //

    fn service_events(&mut self) {
        if !self.agnus.scheduler.is_due(self.agnus.clock) {
            return;
        }

        let clock = self.agnus.clock;

        if let Some(_event) = self.agnus.scheduler.take_due(Slot::CiaA, clock) {
            // CIA timers are an external collaborator; the slot stays idle.
        }
        if let Some(_event) = self.agnus.scheduler.take_due(Slot::CiaB, clock) {}
        if let Some(_event) = self.agnus.scheduler.take_due(Slot::Disk, clock) {}

        if self.agnus.scheduler.take_due(Slot::Copper, clock).is_some() {
            self.service_copper_event();
        }
        if self.agnus.scheduler.take_due(Slot::Blitter, clock).is_some() {
            self.service_blitter_event();
        }

        for slot in [Slot::Audio0, Slot::Audio1, Slot::Audio2, Slot::Audio3] {
            let _ = self.agnus.scheduler.take_due(slot, clock);
        }

        if let Some(event) = self.agnus.scheduler.take_due(Slot::Inspect, clock) {
            if event.id == EventId::InsStatus {
                self.inspect_pending = true;
            }
        }
        let _ = self.agnus.scheduler.take_due(Slot::Secondary, clock);

        self.agnus.scheduler.recompute_next_trigger();
    }

    //
    // Line and frame boundaries
    //

    fn end_of_line(&mut self) {
        let v = self.agnus.pos.v;

        if v >= VBLANK_LINES {
            let diw = DiwLine {
                vflop: self.agnus.diw_vflop,
                hflop: self.agnus.diw_hflop,
                hflop_on: self.agnus.diw_hflop_on,
                hflop_off: self.agnus.diw_hflop_off,
            };
            self.denise.end_of_line(v, diw);
        } else {
            self.denise.end_of_vblank_line();
        }

        if self.agnus.bpl_dma_line {
            self.agnus.add_bpl_modulos();
        }
    }

    fn begin_of_line(&mut self) {
        self.agnus.update_sprite_dma();
        self.paula.disk.begin_of_line();
        self.denise.begin_of_line();

        // Keyboard bytes trickle in over the CIA-A serial line
        if self.agnus.clock >= self.kb_next_delivery && !self.keyboard.is_empty() {
            if let Some(byte) = self.keyboard.pop_wire_byte() {
                if self.ciaa.serial_in(byte) {
                    self.paula.raise_irq(IrqSource::Ports);
                }
            }
            self.kb_next_delivery = self.agnus.clock + KB_DELIVERY_CYCLES;
        }
    }

    fn end_of_frame(&mut self) {
        self.paula.raise_irq(IrqSource::VertB);
        self.copper_vsync();
        self.denise
            .pixel_engine
            .prepare_for_next_frame(self.agnus.lof, self.agnus.lace);
        self.eof = true;
    }

    //
    // DMA client memory ports
    //

    pub(crate) fn copper_read(&mut self, addr: u32) -> u16 {
        let value = if self.memory.src(addr) == MemSrc::Unmapped {
            0
        } else {
            self.memory.read_chip16(addr)
        };
        self.agnus.record_bus_value(value);
        self.data_bus = value;
        value
    }

    pub(crate) fn blitter_read(&mut self, addr: u32) -> u16 {
        let value = if self.memory.src(addr) == MemSrc::Unmapped {
            0
        } else {
            self.memory.read_chip16(addr)
        };
        self.agnus.record_bus_value(value);
        self.data_bus = value;
        value
    }

    pub(crate) fn blitter_write(&mut self, addr: u32, value: u16) {
        if self.memory.src(addr) != MemSrc::Unmapped {
            self.memory.write_chip16(addr, value);
        }
        self.agnus.record_bus_value(value);
        self.data_bus = value;
    }

    //
    // Delayed register changes
    //

    fn apply_reg_change(&mut self, change: RegChange) {
        let pixel = (4 * self.agnus.pos.h as i32 - 4).max(0);
        match change {
            RegChange::Bplcon0(value) => {
                self.agnus.set_bplcon0(value);
                self.denise.set_bplcon0(value, pixel);
            }
            RegChange::Bplcon1(value) => self.denise.set_bplcon1(value),
            RegChange::Bplcon2(value) => self.denise.set_bplcon2(value, pixel + 8),
            RegChange::Diwstrt(value) => self.agnus.poke_diwstrt(value),
            RegChange::Diwstop(value) => self.agnus.poke_diwstop(value),
        }
    }

    //
    // CIA address decoding. Incomplete decoding selects the chips with
    // address bits 12 and 13; unselected byte lanes float to the last
    // bus value.
    //

    fn update_cia_inputs(&mut self) {
        self.ciaa.pa_in = 0x3F | (self.port1.ciapa() & self.port2.ciapa());
    }

    fn peek_cia8(&mut self, addr: u32) -> u8 {
        self.update_cia_inputs();
        let reg = (addr >> 8) & 0xF;
        let sel = (addr >> 12) & 0b11;
        let a0 = addr & 1 != 0;

        match sel {
            0b00 => {
                if a0 {
                    self.ciaa.peek(reg)
                } else {
                    self.ciab.peek(reg)
                }
            }
            0b01 => {
                if a0 {
                    self.data_bus as u8
                } else {
                    self.ciab.peek(reg)
                }
            }
            0b10 => {
                if a0 {
                    self.ciaa.peek(reg)
                } else {
                    (self.data_bus >> 8) as u8
                }
            }
            _ => {
                if a0 {
                    self.data_bus as u8
                } else {
                    (self.data_bus >> 8) as u8
                }
            }
        }
    }

    fn peek_cia16(&mut self, addr: u32) -> u16 {
        self.update_cia_inputs();
        let reg = (addr >> 8) & 0xF;
        let sel = (addr >> 12) & 0b11;

        match sel {
            0b00 => (self.ciab.peek(reg) as u16) << 8 | self.ciaa.peek(reg) as u16,
            0b01 => (self.ciab.peek(reg) as u16) << 8 | 0xFF,
            0b10 => 0xFF00 | self.ciaa.peek(reg) as u16,
            _ => self.data_bus,
        }
    }

    fn spy_cia8(&self, addr: u32) -> u8 {
        let reg = (addr >> 8) & 0xF;
        let sel = (addr >> 12) & 0b11;
        let a0 = addr & 1 != 0;
        match sel {
            0b00 if a0 => self.ciaa.spypeek(reg),
            0b00 => self.ciab.spypeek(reg),
            0b01 if !a0 => self.ciab.spypeek(reg),
            0b10 if a0 => self.ciaa.spypeek(reg),
            _ => 0xFF,
        }
    }

    fn poke_cia8(&mut self, addr: u32, value: u8) {
        let reg = (addr >> 8) & 0xF;
        let sel_a = addr & 0x1000 == 0;
        let sel_b = addr & 0x2000 == 0;

        let mut relayout = false;
        if sel_a {
            relayout |= self.ciaa.poke(reg, value);
        }
        if sel_b {
            relayout |= self.ciab.poke(reg, value);
            if reg == crate::cia::REG_PRB {
                self.update_drive_control(value);
            }
        }
        if relayout {
            self.update_mem_layout();
        }
    }

    fn poke_cia16(&mut self, addr: u32, value: u16) {
        let reg = (addr >> 8) & 0xF;
        let sel_a = addr & 0x1000 == 0;
        let sel_b = addr & 0x2000 == 0;

        let mut relayout = false;
        if sel_a {
            relayout |= self.ciaa.poke(reg, value as u8);
        }
        if sel_b {
            relayout |= self.ciab.poke(reg, (value >> 8) as u8);
            if reg == crate::cia::REG_PRB {
                self.update_drive_control((value >> 8) as u8);
            }
        }
        if relayout {
            self.update_mem_layout();
        }
    }

    /// CIA-B PRB drives the floppies: /MTR in bit 7, /SEL3-0 in bits 6-3,
    /// SIDE in bit 2, DIR in bit 1, /STEP in bit 0.
    fn update_drive_control(&mut self, prb: u8) {
        let motor_on = prb & 0x80 == 0;
        let side = if prb & 0x04 == 0 { 1 } else { 0 };
        let outwards = prb & 0x02 != 0;
        let step = prb & 0x01 == 0;

        for x in 0..4 {
            if prb & (0x08 << x) != 0 {
                continue; // not selected
            }
            self.paula.disk.select(x);
            let drive = &mut self.paula.disk.drives[x];
            if !drive.connected {
                continue;
            }
            drive.motor = motor_on;
            drive.side = side;
            if step {
                if outwards {
                    drive.cylinder = drive.cylinder.saturating_sub(1);
                } else if drive.cylinder < 79 {
                    drive.cylinder += 1;
                }
            }
        }
    }

    //
    // RTC window: registers appear on odd byte addresses.
    //

    fn peek_rtc8(&self, addr: u32) -> u8 {
        if addr & 1 == 0 {
            return 0;
        }
        self.rtc_regs[((addr >> 2) & 0xF) as usize]
    }

    fn poke_rtc8(&mut self, addr: u32, value: u8) {
        if addr & 1 == 0 {
            return;
        }
        self.rtc_regs[((addr >> 2) & 0xF) as usize] = value & 0x0F;
    }

    //
    // Autoconfig (Zorro II): just enough protocol to advertise the Fast
    // Ram board once and then get out of the way.
    //

    fn autoconf_nibble(&self, addr: u32) -> u8 {
        if self.fast_ram_size == 0 || self.autoconf_configured {
            return 0xF;
        }

        let size_code: u8 = match self.fast_ram_size {
            0x1_0000 => 0b001,  // 64 KB
            0x2_0000 => 0b010,  // 128 KB
            0x4_0000 => 0b011,  // 256 KB
            0x8_0000 => 0b100,  // 512 KB
            0x10_0000 => 0b101, // 1 MB
            0x20_0000 => 0b110, // 2 MB
            0x40_0000 => 0b111, // 4 MB
            _ => 0b000,         // 8 MB
        };

        let reg = (addr >> 1) & 0x7F;
        let nibble = match reg {
            0x00 => 0b1110,            // Zorro II memory board, link into pool
            0x01 => size_code,
            // All further registers are inverted on the wire
            0x08 => !0x07 & 0xF,       // manufacturer high nibble
            0x09 => !0xDB & 0xF,
            _ => 0xF,
        };
        nibble
    }

    fn peek_autoconf8(&self, addr: u32) -> u8 {
        self.autoconf_nibble(addr) << 4
    }

    fn poke_autoconf8(&mut self, addr: u32, value: u8) {
        // A write to register 0x48 assigns the base address and completes
        // configuration; 0x4C is the shut-up register.
        let reg = addr & 0xFF;
        if reg == 0x48 || reg == 0x4C {
            log::debug!("Autoconfig complete (write {:02X} to {:02X})", value, reg);
            self.autoconf_configured = true;
        }
    }

    //
    // CPU-visible memory interface
    //

    pub fn cpu_read8(&mut self, addr: u32) -> u8 {
        let addr = addr & 0xFF_FFFF;
        match self.memory.src(addr) {
            MemSrc::Unmapped => {
                self.cpu_chip_access();
                self.data_bus = 0;
                0
            }
            MemSrc::Chip => {
                self.cpu_chip_access();
                let value = self.memory.read_chip8(addr);
                self.data_bus = value as u16;
                value
            }
            MemSrc::Slow => {
                self.cpu_chip_access();
                let value = self.memory.read_slow8(addr);
                self.data_bus = value as u16;
                value
            }
            MemSrc::Fast => self.memory.read_fast8(addr),
            MemSrc::Cia => {
                self.cpu_chip_access();
                self.peek_cia8(addr)
            }
            MemSrc::Rtc => {
                self.cpu_chip_access();
                self.peek_rtc8(addr)
            }
            MemSrc::Ocs => {
                self.cpu_chip_access();
                let word = self.peek_custom16_at_byte(addr);
                if addr & 1 == 0 {
                    (word >> 8) as u8
                } else {
                    word as u8
                }
            }
            MemSrc::Autoconf => {
                self.cpu_chip_access();
                self.peek_autoconf8(addr)
            }
            MemSrc::Rom => self.memory.read_rom8(addr),
            MemSrc::Wom => self.memory.read_wom8(addr),
            MemSrc::Ext => self.memory.read_ext8(addr),
        }
    }

    pub fn cpu_read16(&mut self, addr: u32) -> u16 {
        if addr & 1 != 0 {
            log::warn!("{}", MemError::AddressViolation(addr));
        }
        let addr = addr & 0xFF_FFFE;

        match self.memory.src(addr) {
            MemSrc::Unmapped => {
                self.cpu_chip_access();
                self.data_bus = 0;
                0
            }
            MemSrc::Chip => {
                self.cpu_chip_access();
                let value = self.memory.read_chip16(addr);
                self.data_bus = value;
                value
            }
            MemSrc::Slow => {
                self.cpu_chip_access();
                let value = self.memory.read_slow16(addr);
                self.data_bus = value;
                value
            }
            MemSrc::Fast => self.memory.read_fast16(addr),
            MemSrc::Cia => {
                self.cpu_chip_access();
                let value = self.peek_cia16(addr);
                self.data_bus = value;
                value
            }
            MemSrc::Rtc => {
                self.cpu_chip_access();
                let value =
                    (self.peek_rtc8(addr) as u16) << 8 | self.peek_rtc8(addr + 1) as u16;
                self.data_bus = value;
                value
            }
            MemSrc::Ocs => {
                self.cpu_chip_access();
                self.peek_custom16(addr)
            }
            MemSrc::Autoconf => {
                self.cpu_chip_access();
                let value = (self.peek_autoconf8(addr) as u16) << 8
                    | self.peek_autoconf8(addr + 1) as u16;
                self.data_bus = value;
                value
            }
            MemSrc::Rom => self.memory.read_rom16(addr),
            MemSrc::Wom => self.memory.read_wom16(addr),
            MemSrc::Ext => self.memory.read_ext16(addr),
        }
    }

    pub fn cpu_read32(&mut self, addr: u32) -> u32 {
        // High word first
        (self.cpu_read16(addr) as u32) << 16 | self.cpu_read16(addr.wrapping_add(2)) as u32
    }

    pub fn cpu_write8(&mut self, addr: u32, value: u8) {
        let addr = addr & 0xFF_FFFF;
        match self.memory.src(addr) {
            MemSrc::Unmapped => {
                self.cpu_chip_access();
                self.data_bus = value as u16;
            }
            MemSrc::Chip => {
                self.cpu_chip_access();
                self.data_bus = value as u16;
                self.memory.write_chip8(addr, value);
            }
            MemSrc::Slow => {
                self.cpu_chip_access();
                self.data_bus = value as u16;
                self.memory.write_slow8(addr, value);
            }
            MemSrc::Fast => self.memory.write_fast8(addr, value),
            MemSrc::Cia => {
                self.cpu_chip_access();
                self.data_bus = value as u16;
                self.poke_cia8(addr, value);
            }
            MemSrc::Rtc => {
                self.cpu_chip_access();
                self.poke_rtc8(addr, value);
            }
            MemSrc::Ocs => {
                self.cpu_chip_access();
                // Byte writes replicate into both halves of the word
                let word = (value as u16) << 8 | value as u16;
                self.poke_custom16(PokeSource::Cpu, addr & 0xFF_FFFE, word);
            }
            MemSrc::Autoconf => {
                self.cpu_chip_access();
                self.poke_autoconf8(addr, value);
            }
            MemSrc::Rom => {
                if self.memory.poke_rom() {
                    self.update_mem_layout();
                }
            }
            MemSrc::Wom => self.memory.poke_wom8(addr, value),
            MemSrc::Ext => {}
        }
    }

    pub fn cpu_write16(&mut self, addr: u32, value: u16) {
        if addr & 1 != 0 {
            log::warn!("{}", MemError::AddressViolation(addr));
        }
        let addr = addr & 0xFF_FFFE;

        match self.memory.src(addr) {
            MemSrc::Unmapped => {
                self.cpu_chip_access();
                self.data_bus = value;
            }
            MemSrc::Chip => {
                self.cpu_chip_access();
                self.data_bus = value;
                self.memory.write_chip16(addr, value);
            }
            MemSrc::Slow => {
                self.cpu_chip_access();
                self.data_bus = value;
                self.memory.write_slow16(addr, value);
            }
            MemSrc::Fast => self.memory.write_fast16(addr, value),
            MemSrc::Cia => {
                self.cpu_chip_access();
                self.data_bus = value;
                self.poke_cia16(addr, value);
            }
            MemSrc::Rtc => {
                self.cpu_chip_access();
                self.poke_rtc8(addr, (value >> 8) as u8);
                self.poke_rtc8(addr + 1, value as u8);
            }
            MemSrc::Ocs => {
                self.cpu_chip_access();
                self.poke_custom16(PokeSource::Cpu, addr, value);
            }
            MemSrc::Autoconf => {
                self.cpu_chip_access();
                self.poke_autoconf8(addr, (value >> 8) as u8);
                self.poke_autoconf8(addr + 1, value as u8);
            }
            MemSrc::Rom => {
                if self.memory.poke_rom() {
                    self.update_mem_layout();
                }
            }
            MemSrc::Wom => self.memory.poke_wom16(addr, value),
            MemSrc::Ext => {}
        }
    }

    pub fn cpu_write32(&mut self, addr: u32, value: u32) {
        self.cpu_write16(addr, (value >> 16) as u16);
        self.cpu_write16(addr.wrapping_add(2), value as u16);
    }

    //
    // Spy interface: never advances the clock, never causes side effects.
    //

    pub fn spy_read8(&self, addr: u32) -> u8 {
        let addr = addr & 0xFF_FFFF;
        match self.memory.src(addr) {
            MemSrc::Unmapped => 0,
            MemSrc::Chip => self.memory.read_chip8(addr),
            MemSrc::Slow => self.memory.read_slow8(addr),
            MemSrc::Fast => self.memory.read_fast8(addr),
            MemSrc::Cia => self.spy_cia8(addr),
            MemSrc::Rtc => self.peek_rtc8(addr),
            MemSrc::Ocs => {
                let word = self.spy_custom16(addr & 0xFF_FFFE);
                if addr & 1 == 0 {
                    (word >> 8) as u8
                } else {
                    word as u8
                }
            }
            MemSrc::Autoconf => self.peek_autoconf8(addr),
            MemSrc::Rom => self.memory.read_rom8(addr),
            MemSrc::Wom => self.memory.read_wom8(addr),
            MemSrc::Ext => self.memory.read_ext8(addr),
        }
    }

    pub fn spy_read16(&self, addr: u32) -> u16 {
        let addr = addr & 0xFF_FFFE;
        (self.spy_read8(addr) as u16) << 8 | self.spy_read8(addr + 1) as u16
    }

    pub fn spy_read32(&self, addr: u32) -> u32 {
        (self.spy_read16(addr) as u32) << 16 | self.spy_read16(addr + 2) as u32
    }
}

impl CpuBus for Bus {
    fn read8(&mut self, addr: u32) -> u8 {
        self.cpu_read8(addr)
    }
    fn read16(&mut self, addr: u32) -> u16 {
        self.cpu_read16(addr)
    }
    fn read32(&mut self, addr: u32) -> u32 {
        self.cpu_read32(addr)
    }
    fn write8(&mut self, addr: u32, value: u8) {
        self.cpu_write8(addr, value);
    }
    fn write16(&mut self, addr: u32, value: u16) {
        self.cpu_write16(addr, value);
    }
    fn write32(&mut self, addr: u32, value: u32) {
        self.cpu_write32(addr, value);
    }
    fn ipl(&self) -> u8 {
        self.paula.ipl()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MsgQueue;
    use rand::prelude::*;

    pub(crate) fn test_bus() -> Bus {
        let queue = MsgQueue::new();
        let config = AmigaConfig::default();
        let mut bus = Bus::new(&config, queue.sender());
        // Tests drive the chipset directly; drop the reset overlay
        bus.ciaa.poke(crate::cia::REG_DDRA, 0x01);
        bus.ciaa.poke(crate::cia::REG_PRA, 0x00);
        bus.update_mem_layout();
        bus
    }

    #[test]
    fn ram_round_trip_through_decoder() {
        let mut bus = test_bus();

        bus.cpu_write16(0x00_2000, 0x1234);
        assert_eq!(bus.cpu_read16(0x00_2000), 0x1234);
        assert_eq!(bus.spy_read16(0x00_2000), 0x1234);

        // A byte read sees the big-endian halves
        assert_eq!(bus.cpu_read8(0x00_2000), 0x12);
        assert_eq!(bus.cpu_read8(0x00_2001), 0x34);
    }

    #[test]
    fn chip_access_consumes_at_least_four_ccks() {
        let mut bus = test_bus();
        let start = bus.agnus.clock;
        bus.cpu_read16(0x00_1000);
        assert!(bus.agnus.clock - start >= 4);
    }

    #[test]
    fn rom_access_skips_the_arbiter() {
        let mut bus = test_bus();
        let image = vec![0xAB; 512 * 1024];
        bus.memory.load_rom(&image).unwrap();
        bus.update_mem_layout();

        let start = bus.agnus.clock;
        assert_eq!(bus.cpu_read16(0xF8_0000), 0xABAB);
        assert_eq!(bus.agnus.clock, start);
    }

    #[test]
    fn exactly_one_owner_per_slot() {
        let mut bus = test_bus();
        // Enable everything that can ask for the bus
        bus.poke_custom16(PokeSource::Cpu, 0xDF_F096, 0x8000 | 0x03FF);

        for _ in 0..3 * crate::HPOS_CNT as usize {
            let h = bus.agnus.pos.h as usize;
            bus.execute_hpos_inner();
            // At most one owner was recorded for this slot
            let _owner = bus.agnus.bus_owner[h];
            bus.finish_hpos();
        }
    }

    #[test]
    fn dma_priority_order_random_requests() {
        // The fixed-slot engine encodes the priority order; verify that
        // whenever the refresh slot coincides with other requests, the
        // higher priority owner wins.
        let mut rng = StdRng::seed_from_u64(0xA500);

        for _ in 0..50 {
            let mut bus = test_bus();
            bus.poke_custom16(PokeSource::Cpu, 0xDF_F096, 0x8000 | 0x03FF);

            // Random disk/audio activity
            if rng.gen_bool(0.5) {
                bus.paula.disk.drives[0].connected = true;
                bus.paula.disk.poke_dsklen(0x8020);
                bus.paula.disk.poke_dsklen(0x8020);
                bus.paula.disk.begin_of_line();
            }

            for _ in 0..crate::HPOS_CNT {
                let h = bus.agnus.pos.h;
                bus.execute_hpos_inner();
                let owner = bus.agnus.bus_owner[h as usize];

                if Agnus::is_refresh_slot(h) {
                    assert_eq!(owner, BusOwner::Refresh, "refresh slot {}", h);
                }
                if Agnus::disk_slot_index(h).is_some()
                    && bus.paula.disk.dma_active()
                {
                    assert!(
                        owner == BusOwner::Disk || owner == BusOwner::Refresh,
                        "disk never loses its slot to lower priorities"
                    );
                }
                bus.finish_hpos();
            }
        }
    }

    #[test]
    fn faulty_register_read_returns_open_bus_when_idle() {
        let mut bus = test_bus();
        // BLTCON0 is write-only; with no DMA on the bus the read shows
        // 0xFFFF
        let value = bus.cpu_read16(0xDF_F040);
        assert_eq!(value, OPEN_BUS_WORD);
    }

    #[test]
    fn byte_write_to_custom_register_replicates() {
        let mut bus = test_bus();
        bus.cpu_write8(0xDF_F180, 0x0F);

        // Color changes are replayed at the end of the line
        let next_line = bus.agnus.pos.v + 1;
        while bus.agnus.pos.v != next_line {
            bus.execute_hpos();
        }
        // COLOR00 received 0x0F0F (replicated byte, masked to 12 bits)
        assert_eq!(bus.denise.pixel_engine.color(0), 0x0F0F & 0x0FFF);
    }

    #[test]
    fn overlay_toggle_via_cia() {
        let mut bus = test_bus();
        let image = vec![0x42; 512 * 1024];
        bus.memory.load_rom(&image).unwrap();

        // Raise OVL: Rom appears at address 0
        bus.cpu_write8(0xBF_E001, 0x01); // CIA-A PRA (DDRA bit set in test_bus)
        assert_eq!(bus.memory.src(0x00_0000), MemSrc::Rom);

        // Drop it again: Chip Ram returns, contents intact
        bus.cpu_write16(0x00_3000, 0xAA55); // write goes to rom -> ignored
        bus.cpu_write8(0xBF_E001, 0x00);
        assert_eq!(bus.memory.src(0x00_0000), MemSrc::Chip);
        bus.cpu_write16(0x00_3000, 0xAA55);
        assert_eq!(bus.cpu_read16(0x00_3000), 0xAA55);
    }

    #[test]
    fn keyboard_byte_raises_ports_interrupt() {
        let mut bus = test_bus();
        bus.ciaa.poke(crate::cia::REG_ICR, 0x88); // enable SP
        bus.paula.poke_intena(0x8000 | crate::paula::INTEN | 0x0008);

        bus.keyboard.key_down(0x20);
        // Run past one line so the delivery fires
        for _ in 0..crate::HPOS_CNT + 1 {
            bus.execute_hpos();
        }
        assert_eq!(bus.paula.ipl(), 2);
    }
}
