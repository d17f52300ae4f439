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

    amiga.rs

    This module defines all the parts that make up the virtual machine.

    The Amiga owns the Bus (and through it every chip) plus the CPU glue,
    and is responsible for machine state, the run loop, snapshots and the
    host-facing lifecycle API. The run loop executes one guest instruction
    at a time and then advances Agnus up to the new CPU clock.

*/

use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::{
    bus::Bus,
    config::AmigaConfig,
    controlport::JoystickState,
    cpu::{CpuCore, CpuGlue, NopCpu},
    error::SnapshotError,
    messages::{Msg, MsgQueue},
    snapshot::{self, SnapshotHeader, SnapshotWriter, THUMBNAIL_H, THUMBNAIL_W},
    Cycle,
    HPIXELS,
};

/// PAL color clock frequency in Hz.
pub const MASTER_CLOCK_HZ: i64 = 7_093_790;

// Run loop control flags
pub const RL_STOP: u32 = 0b0000_0001;
pub const RL_SNAPSHOT: u32 = 0b0000_0010;
pub const RL_INSPECT: u32 = 0b0000_0100;
pub const RL_ENABLE_BREAKPOINTS: u32 = 0b0000_1000;
pub const RL_ENABLE_TRACING: u32 = 0b0001_0000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MachineState {
    Off,
    Paused,
    Running,
}

/// Inspection snapshot handed to the host UI. Filled under the machine
/// mutex so the UI never observes a half-updated view.
#[derive(Copy, Clone, Debug, Default)]
pub struct MachineInfo {
    pub cpu_clock: Cycle,
    pub dma_clock: Cycle,
    pub frame: i64,
    pub vpos: u16,
    pub hpos: u16,
    pub pc: u32,
    pub dmacon: u16,
    pub intena: u16,
    pub intreq: u16,
    pub coppc: u32,
    pub blitter_busy: bool,
}

pub struct Amiga {
    config: AmigaConfig,
    state: MachineState,

    pub bus: Bus,
    pub cpu: CpuGlue,
    queue: MsgQueue,

    run_loop_ctrl: u32,
    breakpoints: Vec<u32>,
    warp: bool,
    frames_completed: u64,

    /// Guards inspection data and the suspend/load/resume operations.
    info: Mutex<MachineInfo>,
    suspend_counter: u32,

    time_base: Instant,
    clock_base: Cycle,
}

impl Amiga {
    /// Build a machine from a validated configuration with the default
    /// (fetch-only) CPU core. A real 68k core attaches via `with_cpu`.
    pub fn new(config: AmigaConfig) -> Result<Self> {
        Self::with_cpu(config, Box::new(NopCpu::default()))
    }

    pub fn with_cpu(config: AmigaConfig, core: Box<dyn CpuCore>) -> Result<Self> {
        let queue = MsgQueue::new();

        if let Err(e) = config.validate() {
            queue.sender().send(Msg::Config);
            return Err(anyhow!(e));
        }

        let bus = Bus::new(&config, queue.sender());
        let mut cpu = CpuGlue::new(core);
        cpu.set_speed(config.cpu_speed);

        Ok(Self {
            config,
            state: MachineState::Off,
            bus,
            cpu,
            queue,
            run_loop_ctrl: 0,
            breakpoints: Vec::new(),
            warp: false,
            frames_completed: 0,
            info: Mutex::new(MachineInfo::default()),
            suspend_counter: 0,
            time_base: Instant::now(),
            clock_base: 0,
        })
    }

    /// Replace the configuration. Rejected configurations leave the
    /// machine untouched.
    pub fn configure(&mut self, config: AmigaConfig) -> Result<()> {
        if let Err(e) = config.validate() {
            self.queue.sender().send(Msg::Config);
            return Err(anyhow!(e));
        }
        if self.state != MachineState::Off {
            return Err(anyhow!("configuration changes require the machine to be off"));
        }

        self.bus = Bus::new(&config, self.queue.sender());
        self.config = config;
        self.queue.sender().send(Msg::Config);
        Ok(())
    }

    pub fn config(&self) -> &AmigaConfig {
        &self.config
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Poll the next host message.
    pub fn message(&self) -> Option<Msg> {
        self.queue.try_recv()
    }

    //
    // Rom and media handling
    //

    pub fn load_rom(&mut self, image: &[u8]) -> Result<()> {
        let revision = self.bus.memory.load_rom(image)?;
        log::info!("Rom installed: {}", revision.title());
        self.bus.update_mem_layout();
        Ok(())
    }

    pub fn load_ext_rom(&mut self, image: &[u8]) -> Result<()> {
        self.bus.memory.load_ext(image)?;
        self.bus.update_mem_layout();
        Ok(())
    }

    pub fn insert_disk(&mut self, drive: usize, adf: Vec<u8>) -> bool {
        if drive >= 4 || !self.bus.paula.disk.drives[drive].connected {
            return false;
        }
        self.bus.paula.disk.drives[drive].insert_adf(adf)
    }

    pub fn eject_disk(&mut self, drive: usize) {
        if drive < 4 {
            self.bus.paula.disk.drives[drive].eject();
        }
    }

    //
    // Input
    //

    pub fn key_down(&mut self, keycode: u8) {
        self.bus.keyboard.key_down(keycode);
    }

    pub fn key_up(&mut self, keycode: u8) {
        self.bus.keyboard.key_up(keycode);
    }

    pub fn mouse_event(&mut self, port: usize, dx: i8, dy: i8, left: bool, right: bool) {
        let target = if port == 1 { &mut self.bus.port1 } else { &mut self.bus.port2 };
        target.mouse_event(dx, dy, left, right);
    }

    pub fn joystick_event(&mut self, port: usize, state: JoystickState) {
        let target = if port == 1 { &mut self.bus.port1 } else { &mut self.bus.port2 };
        target.joystick_event(state);
    }

    //
    // Lifecycle
    //

    /// True when the installed Roms satisfy the configured model.
    pub fn ready_to_power_on(&self) -> bool {
        if !self.bus.memory.has_chip_ram() {
            return false;
        }
        match self.config.model {
            crate::config::AmigaModel::A1000 => self.bus.memory.has_boot_rom(),
            _ => self.bus.memory.has_kick_rom(),
        }
    }

    pub fn power_on(&mut self) {
        if self.state != MachineState::Off {
            return;
        }
        if !self.ready_to_power_on() {
            log::warn!("Power on refused: no suitable Rom installed");
            self.queue.sender().send(Msg::RomMissing);
            return;
        }

        log::debug!("Power on");
        self.run_loop_ctrl = 0;
        if self.bus.memory.has_wom() {
            self.bus.memory.erase_wom();
        }
        self.bus.memory.fill_ram_with_startup_pattern();
        self.bus.update_mem_layout();
        self.hard_reset();

        self.state = MachineState::Paused;
        self.queue.sender().send(Msg::PowerOn);
    }

    pub fn power_off(&mut self) {
        if self.state == MachineState::Off {
            return;
        }
        log::debug!("Power off");
        self.state = MachineState::Off;
        self.queue.sender().send(Msg::PowerOff);
    }

    pub fn run(&mut self) {
        if self.state != MachineState::Paused {
            return;
        }
        self.state = MachineState::Running;
        self.restart_timer();

        // Refresh the inspection structs shortly after startup
        self.bus.agnus.scheduler.schedule_rel(
            crate::agnus::scheduler::Slot::Inspect,
            self.bus.agnus.clock,
            crate::dma_cycles(1),
            crate::agnus::scheduler::EventId::InsStatus,
        );

        self.queue.sender().send(Msg::Run);
    }

    pub fn pause(&mut self) {
        if self.state != MachineState::Running {
            return;
        }
        self.state = MachineState::Paused;
        self.inspect();
        self.queue.sender().send(Msg::Pause);
    }

    pub fn reset(&mut self) {
        self.suspend();
        self.hard_reset();
        self.queue.sender().send(Msg::Reset);
        self.resume();
    }

    fn hard_reset(&mut self) {
        self.bus.reset();
        self.cpu.clock = 0;
        self.cpu.reset(&mut self.bus);
        self.clock_base = 0;
        self.time_base = Instant::now();
    }

    /// Re-entrant suspension: the first call pauses a running machine,
    /// the matching resume restarts it.
    pub fn suspend(&mut self) {
        log::trace!("Suspending ({})", self.suspend_counter);
        if self.suspend_counter == 0 && self.state != MachineState::Running {
            return;
        }
        self.pause();
        self.suspend_counter += 1;
    }

    pub fn resume(&mut self) {
        log::trace!("Resuming ({})", self.suspend_counter);
        if self.suspend_counter == 0 {
            return;
        }
        self.suspend_counter -= 1;
        if self.suspend_counter == 0 {
            self.run();
        }
    }

    pub fn set_warp(&mut self, warp: bool) {
        if self.warp == warp {
            return;
        }
        self.warp = warp;
        if !warp {
            self.restart_timer();
        }
        self.queue.sender().send(if warp { Msg::WarpOn } else { Msg::WarpOff });
    }

    pub fn warp(&self) -> bool {
        self.warp
    }

    pub fn set_control_flags(&mut self, flags: u32) {
        self.run_loop_ctrl |= flags;
    }

    pub fn clear_control_flags(&mut self, flags: u32) {
        self.run_loop_ctrl &= !flags;
    }

    pub fn set_breakpoints(&mut self, breakpoints: Vec<u32>) {
        self.breakpoints = breakpoints;
        if self.breakpoints.is_empty() {
            self.clear_control_flags(RL_ENABLE_BREAKPOINTS);
        } else {
            self.set_control_flags(RL_ENABLE_BREAKPOINTS);
        }
    }

    //
    // The run loop
    //

    /// Execute guest code until the current frame completes (or a control
    /// flag breaks out earlier). This is the host's per-frame entry point.
    pub fn execute_frame(&mut self) {
        if self.state != MachineState::Running {
            return;
        }

        loop {
            // Emulate the next CPU instruction, then bring Agnus up to
            // the same point in time. Bus waits the instruction incurred
            // are billed to the CPU clock.
            self.cpu.execute_instruction(&mut self.bus);
            self.cpu.clock += self.bus.take_stall();
            self.bus.execute_until(self.cpu.clock);

            // Check if special action needs to be taken
            if self.run_loop_ctrl != 0 {
                if self.run_loop_ctrl & RL_SNAPSHOT != 0 {
                    self.clear_control_flags(RL_SNAPSHOT);
                    self.queue.sender().send(Msg::SnapshotTaken);
                }

                if self.run_loop_ctrl & RL_INSPECT != 0 {
                    self.clear_control_flags(RL_INSPECT);
                    self.inspect();
                }

                if self.run_loop_ctrl & RL_ENABLE_TRACING != 0 {
                    self.cpu.record_instruction();
                }

                if self.run_loop_ctrl & RL_ENABLE_BREAKPOINTS != 0
                    && self.breakpoints.contains(&self.cpu.core.pc())
                {
                    self.inspect();
                    self.queue.sender().send(Msg::BreakpointReached);
                    self.state = MachineState::Paused;
                    return;
                }

                if self.run_loop_ctrl & RL_STOP != 0 {
                    self.clear_control_flags(RL_STOP);
                    self.state = MachineState::Paused;
                    return;
                }
            }

            if self.bus.inspect_pending {
                self.bus.inspect_pending = false;
                self.inspect();
            }

            if self.bus.take_eof() {
                self.frames_completed += 1;
                if !self.warp {
                    self.synchronize_timing();
                }
                return;
            }
        }
    }

    /// Run for a given number of master cycles (used by tests and
    /// headless hosts).
    pub fn run_for(&mut self, cycles: Cycle) {
        if self.state != MachineState::Running {
            return;
        }
        let target = self.bus.agnus.clock + cycles;
        while self.bus.agnus.clock < target {
            self.cpu.execute_instruction(&mut self.bus);
            self.cpu.clock += self.bus.take_stall();
            self.bus.execute_until(self.cpu.clock);
            let _ = self.bus.take_eof();
        }
    }

    pub fn frames_completed(&self) -> u64 {
        self.frames_completed
    }

    fn restart_timer(&mut self) {
        self.time_base = Instant::now();
        self.clock_base = self.bus.agnus.clock;
    }

    /// Throttle emulation to real time. If we drift more than 200 ms in
    /// either direction, the timer resyncs instead of sleeping.
    fn synchronize_timing(&mut self) {
        let clock_delta = self.bus.agnus.clock - self.clock_base;
        let elapsed_guest = Duration::from_nanos((clock_delta as u64 * 1_000_000_000) / MASTER_CLOCK_HZ as u64);
        let elapsed_host = self.time_base.elapsed();

        if elapsed_host > elapsed_guest {
            if elapsed_host - elapsed_guest > Duration::from_millis(200) {
                log::trace!("Emulation too slow, resyncing timer");
                self.restart_timer();
            }
            return;
        }

        let ahead = elapsed_guest - elapsed_host;
        if ahead > Duration::from_millis(200) {
            log::warn!("Emulation too fast, resyncing timer");
            self.restart_timer();
            return;
        }
        std::thread::sleep(ahead);
    }

    //
    // Inspection
    //

    pub fn inspect(&mut self) {
        let mut info = match self.info.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        info.cpu_clock = self.cpu.clock;
        info.dma_clock = self.bus.agnus.clock;
        info.frame = self.bus.agnus.frame;
        info.vpos = self.bus.agnus.pos.v;
        info.hpos = self.bus.agnus.pos.h;
        info.pc = self.cpu.core.pc();
        info.dmacon = self.bus.agnus.peek_dmaconr();
        info.intena = self.bus.paula.peek_intenar();
        info.intreq = self.bus.paula.peek_intreqr();
        info.coppc = self.bus.agnus.copper.coppc;
        info.blitter_busy = self.bus.agnus.blitter.busy();
    }

    pub fn info(&self) -> MachineInfo {
        match self.info.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// The stable frame buffer for the host renderer. Never the buffer
    /// currently being written.
    pub fn stable_frame(&self) -> &crate::denise::pixel_engine::ScreenBuffer {
        self.bus.denise.pixel_engine.stable_long_frame()
    }

    pub fn audio_samples(&mut self, max: usize, out: &mut Vec<f32>) {
        self.bus.paula.audio.drain_samples(max, out);
    }

    //
    // Snapshots
    //

    /// Serialize the machine. Component order is leaf-first and fixed;
    /// the loader walks the identical sequence.
    pub fn save_snapshot(&mut self) -> Vec<u8> {
        self.suspend();

        let mut items = SnapshotWriter::new();
        self.bus.memory.save_items(&mut items);
        self.bus.ciaa.save_items(&mut items);
        self.bus.ciab.save_items(&mut items);
        self.bus.paula.save_items(&mut items);
        self.bus.agnus.copper.save_items(&mut items);
        self.bus.agnus.blitter.save_items(&mut items);
        self.bus.agnus.save_items(&mut items);
        self.bus.denise.save_items(&mut items);
        self.cpu.save_items(&mut items);

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let header = SnapshotHeader::new(timestamp, self.thumbnail());
        let blob = snapshot::assemble(&header, items);

        self.queue.sender().send(Msg::SnapshotTaken);
        self.resume();
        blob
    }

    /// Restore a snapshot. An incompatible or truncated buffer leaves the
    /// current state untouched.
    pub fn load_snapshot(&mut self, blob: &[u8]) -> Result<(), SnapshotError> {
        self.suspend();
        let result = self.load_snapshot_inner(blob);
        self.resume();
        result
    }

    fn load_snapshot_inner(&mut self, blob: &[u8]) -> Result<(), SnapshotError> {
        let (_header, mut reader) = snapshot::disassemble(blob)?;

        // Deserialize into a scratch machine first so that a truncated
        // buffer cannot corrupt the live state.
        let mut scratch = Bus::new(&self.config, self.queue.sender());
        scratch.memory.load_items(&mut reader)?;
        scratch.ciaa.load_items(&mut reader)?;
        scratch.ciab.load_items(&mut reader)?;
        scratch.paula.load_items(&mut reader)?;
        scratch.agnus.copper.load_items(&mut reader)?;
        scratch.agnus.blitter.load_items(&mut reader)?;
        scratch.agnus.load_items(&mut reader)?;
        scratch.denise.load_items(&mut reader)?;

        // CPU context goes last; only applied once everything else parsed
        let mut scratch_cpu = CpuGlue::new(Box::new(NopCpu::default()));
        scratch_cpu.load_items(&mut reader)?;

        self.bus = scratch;
        self.cpu.clock = scratch_cpu.clock;
        let context = scratch_cpu.core.context();
        self.cpu.core.restore_context(&context);

        self.bus.update_mem_layout();
        Ok(())
    }

    /// Downsample the stable frame into the snapshot thumbnail.
    fn thumbnail(&self) -> Vec<u32> {
        let frame = self.stable_frame();
        let mut out = Vec::with_capacity((THUMBNAIL_W * THUMBNAIL_H) as usize);
        let x_step = HPIXELS as u32 / THUMBNAIL_W;
        let y_step = crate::VPOS_CNT as u32 / THUMBNAIL_H;

        for y in 0..THUMBNAIL_H {
            for x in 0..THUMBNAIL_W {
                let src = (y * y_step) as usize * HPIXELS + (x * x_step) as usize;
                out.push(frame.data[src]);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_with_rom() -> Amiga {
        let mut amiga = Amiga::new(AmigaConfig::default()).unwrap();
        // A minimal "Kickstart": reset vectors pointing into Rom space
        let mut rom = vec![0u8; 512 * 1024];
        rom[4..8].copy_from_slice(&0x00F8_0010u32.to_be_bytes());
        amiga.load_rom(&rom).unwrap();
        amiga
    }

    #[test]
    fn power_on_without_rom_reports_rom_missing() {
        let mut amiga = Amiga::new(AmigaConfig::default()).unwrap();
        amiga.power_on();
        assert_eq!(amiga.state(), MachineState::Off);

        let msgs: Vec<Msg> = std::iter::from_fn(|| amiga.message()).collect();
        assert!(msgs.contains(&Msg::RomMissing));
    }

    #[test]
    fn power_on_and_run_one_million_cycles() {
        let mut amiga = machine_with_rom();
        amiga.power_on();
        assert_eq!(amiga.state(), MachineState::Paused);
        amiga.set_warp(true);
        amiga.run();

        amiga.run_for(1_000_000);

        // POWER_ON came through, and the memory layout was announced
        let msgs: Vec<Msg> = std::iter::from_fn(|| amiga.message()).collect();
        assert!(msgs.contains(&Msg::PowerOn));
        assert!(msgs.iter().filter(|&&m| m == Msg::MemLayout).count() >= 1);

        // The PC stayed within the Rom region
        let pc = amiga.cpu.core.pc();
        assert!(pc >= 0xF8_0000, "PC = {:06X}", pc);

        // Several frames completed in a million cycles
        assert!(amiga.bus.agnus.frame >= 2);
    }

    #[test]
    fn invalid_config_is_rejected_without_state_change() {
        let mut config = AmigaConfig::default();
        config.chip_ram = 123 * 1024;
        assert!(Amiga::new(config).is_err());

        let mut amiga = machine_with_rom();
        let mut bad = amiga.config().clone();
        bad.slow_ram = 1;
        assert!(amiga.configure(bad).is_err());
        assert_eq!(amiga.config().slow_ram, 0);
    }

    #[test]
    fn suspend_resume_is_reentrant() {
        let mut amiga = machine_with_rom();
        amiga.power_on();
        amiga.run();
        assert_eq!(amiga.state(), MachineState::Running);

        amiga.suspend();
        amiga.suspend();
        assert_eq!(amiga.state(), MachineState::Paused);

        amiga.resume();
        assert_eq!(amiga.state(), MachineState::Paused);
        amiga.resume();
        assert_eq!(amiga.state(), MachineState::Running);
    }

    #[test]
    fn snapshot_round_trip_restores_machine_state() {
        let mut amiga = machine_with_rom();
        amiga.power_on();
        amiga.set_warp(true);
        amiga.run();
        amiga.run_for(10_000);

        // Scribble something identifiable into chip Ram
        amiga.bus.memory.write_chip16(0x1234, 0xC0DE);
        let clock = amiga.bus.agnus.clock;
        let blob = amiga.save_snapshot();

        // Diverge, then restore
        amiga.run_for(10_000);
        amiga.bus.memory.write_chip16(0x1234, 0x0000);

        amiga.load_snapshot(&blob).unwrap();
        assert_eq!(amiga.bus.memory.read_chip16(0x1234), 0xC0DE);
        assert_eq!(amiga.bus.agnus.clock, clock);
    }

    #[test]
    fn corrupt_snapshot_preserves_state() {
        let mut amiga = machine_with_rom();
        amiga.power_on();
        amiga.bus.memory.write_chip16(0x100, 0xAAAA);

        let blob = amiga.save_snapshot();

        // Truncate the items area
        let truncated = &blob[..blob.len() / 2];
        amiga.bus.memory.write_chip16(0x100, 0xBBBB);
        assert!(amiga.load_snapshot(truncated).is_err());
        assert_eq!(amiga.bus.memory.read_chip16(0x100), 0xBBBB);
    }

    #[test]
    fn stable_frame_is_never_the_working_buffer() {
        let mut amiga = machine_with_rom();
        amiga.power_on();
        amiga.set_warp(true);
        amiga.run();

        let mut stable_ptrs = Vec::new();
        for _ in 0..3 {
            amiga.execute_frame();
            stable_ptrs.push(amiga.stable_frame().data.as_ptr());
        }
        // The stable pointer flips between the two long-frame buffers
        assert_ne!(stable_ptrs[0], stable_ptrs[1]);
        assert_eq!(stable_ptrs[0], stable_ptrs[2]);
    }

    #[test]
    fn breakpoint_pauses_the_machine() {
        let mut amiga = machine_with_rom();
        amiga.power_on();
        amiga.set_warp(true);

        // The NopCpu advances PC linearly from the reset vector
        amiga.set_breakpoints(vec![0xF8_0020]);
        amiga.run();
        amiga.execute_frame();

        assert_eq!(amiga.state(), MachineState::Paused);
        let msgs: Vec<Msg> = std::iter::from_fn(|| amiga.message()).collect();
        assert!(msgs.contains(&Msg::BreakpointReached));
    }
}
