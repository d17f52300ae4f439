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

    cpu.rs

    CPU collaborator glue. The 68k instruction decoder is an external
    library; it receives a callback table (the CpuBus trait) at
    construction and drives all memory traffic through it. The glue keeps
    the CPU-side clock, a ring buffer of recently executed instructions,
    and the opaque context blob used by snapshots.

*/

use std::collections::VecDeque;

use crate::{
    snapshot::{SnapshotReader, SnapshotWriter},
    Cycle,
};

/// Number of instructions kept in the trace ring buffer.
pub const TRACE_DEPTH: usize = 256;

/// The callback table through which a CPU core reaches the machine. All
/// accesses go through the address decoder; chip-bus accesses block until
/// the DMA arbiter grants a slot.
pub trait CpuBus {
    fn read8(&mut self, addr: u32) -> u8;
    fn read16(&mut self, addr: u32) -> u16;
    fn read32(&mut self, addr: u32) -> u32;
    fn write8(&mut self, addr: u32, value: u8);
    fn write16(&mut self, addr: u32, value: u16);
    fn write32(&mut self, addr: u32, value: u32);

    /// Pending interrupt level (0 = none), sampled between instructions.
    fn ipl(&self) -> u8;
}

/// Contract of the external instruction decoder.
pub trait CpuCore {
    /// Load the reset vectors and enter supervisor state.
    fn reset(&mut self, pc: u32, ssp: u32);

    /// Execute one instruction (servicing a pending interrupt first) and
    /// return the number of color clocks consumed.
    fn execute_instruction(&mut self, bus: &mut dyn CpuBus) -> u32;

    fn pc(&self) -> u32;
    fn sp(&self) -> u32;

    /// Opaque register context for snapshots.
    fn context(&self) -> Vec<u8>;
    fn restore_context(&mut self, blob: &[u8]);
}

/// A stand-in core used by tests and headless bring-up: it performs the
/// instruction fetch (exercising the bus path) and executes every opcode
/// as a two-byte no-op.
#[derive(Default)]
pub struct NopCpu {
    pc: u32,
    ssp: u32,
    taken_ipl: u8,
}

impl CpuCore for NopCpu {
    fn reset(&mut self, pc: u32, ssp: u32) {
        self.pc = pc;
        self.ssp = ssp;
    }

    fn execute_instruction(&mut self, bus: &mut dyn CpuBus) -> u32 {
        self.taken_ipl = bus.ipl();
        let _opcode = bus.read16(self.pc);
        self.pc = self.pc.wrapping_add(2) & 0xFF_FFFF;
        4
    }

    fn pc(&self) -> u32 {
        self.pc
    }

    fn sp(&self) -> u32 {
        self.ssp
    }

    fn context(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(9);
        blob.extend_from_slice(&self.pc.to_be_bytes());
        blob.extend_from_slice(&self.ssp.to_be_bytes());
        blob.push(self.taken_ipl);
        blob
    }

    fn restore_context(&mut self, blob: &[u8]) {
        if blob.len() >= 9 {
            self.pc = u32::from_be_bytes(blob[0..4].try_into().unwrap());
            self.ssp = u32::from_be_bytes(blob[4..8].try_into().unwrap());
            self.taken_ipl = blob[8];
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct TraceEntry {
    pub pc: u32,
    pub sp: u32,
}

pub struct CpuGlue {
    pub core: Box<dyn CpuCore>,
    /// CPU-side clock in color clocks. The orchestrator advances Agnus up
    /// to this value after every instruction.
    pub clock: Cycle,
    /// Clock divisor for the accelerated 2x/4x parts.
    speed_divisor: Cycle,
    trace: VecDeque<TraceEntry>,
    tracing: bool,
}

impl CpuGlue {
    pub fn new(core: Box<dyn CpuCore>) -> Self {
        Self {
            core,
            clock: 0,
            speed_divisor: 1,
            trace: VecDeque::with_capacity(TRACE_DEPTH),
            tracing: false,
        }
    }

    /// Scale instruction timing for the 2x/4x CPU speed options. Bus
    /// waits are not affected; only internal execution shrinks.
    pub fn set_speed(&mut self, speed: crate::config::CpuSpeed) {
        self.speed_divisor = match speed {
            crate::config::CpuSpeed::X1 => 1,
            crate::config::CpuSpeed::X2 => 2,
            crate::config::CpuSpeed::X4 => 4,
        };
    }

    pub fn set_tracing(&mut self, on: bool) {
        self.tracing = on;
    }

    /// Reset: fetch SSP and PC from the vector table through the decoder
    /// (the overlay maps Rom at address 0 at this point).
    pub fn reset(&mut self, bus: &mut dyn CpuBus) {
        let ssp = bus.read32(0x00_0000);
        let pc = bus.read32(0x00_0004);
        log::debug!("CPU reset: PC = {:06X} SSP = {:06X}", pc, ssp);
        self.core.reset(pc & 0xFF_FFFF, ssp);
    }

    /// Run one instruction and return the new CPU clock.
    pub fn execute_instruction(&mut self, bus: &mut dyn CpuBus) -> Cycle {
        if self.tracing {
            self.record_instruction();
        }
        let cycles = self.core.execute_instruction(bus);
        self.clock += (cycles as Cycle / self.speed_divisor).max(1);
        self.clock
    }

    pub fn record_instruction(&mut self) {
        if self.trace.len() == TRACE_DEPTH {
            self.trace.pop_front();
        }
        self.trace.push_back(TraceEntry {
            pc: self.core.pc(),
            sp: self.core.sp(),
        });
    }

    pub fn trace_entries(&self) -> impl Iterator<Item = &TraceEntry> {
        self.trace.iter()
    }

    pub fn save_items(&self, w: &mut SnapshotWriter) {
        w.put_i64(self.clock);
        let blob = self.core.context();
        w.put_u32(blob.len() as u32);
        w.put_bytes(&blob);
    }

    pub fn load_items(&mut self, r: &mut SnapshotReader) -> Result<(), crate::error::SnapshotError> {
        self.clock = r.take_i64()?;
        let len = r.take_u32()? as usize;
        let mut blob = vec![0; len];
        r.take_into(&mut blob)?;
        self.core.restore_context(&blob);
        self.trace.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatBus {
        mem: Vec<u8>,
    }

    impl CpuBus for FlatBus {
        fn read8(&mut self, addr: u32) -> u8 {
            self.mem[addr as usize]
        }
        fn read16(&mut self, addr: u32) -> u16 {
            u16::from_be_bytes([self.mem[addr as usize], self.mem[addr as usize + 1]])
        }
        fn read32(&mut self, addr: u32) -> u32 {
            (self.read16(addr) as u32) << 16 | self.read16(addr + 2) as u32
        }
        fn write8(&mut self, addr: u32, value: u8) {
            self.mem[addr as usize] = value;
        }
        fn write16(&mut self, addr: u32, value: u16) {
            self.mem[addr as usize..addr as usize + 2].copy_from_slice(&value.to_be_bytes());
        }
        fn write32(&mut self, addr: u32, value: u32) {
            self.write16(addr, (value >> 16) as u16);
            self.write16(addr + 2, value as u16);
        }
        fn ipl(&self) -> u8 {
            0
        }
    }

    #[test]
    fn reset_fetches_vectors_high_word_first() {
        let mut bus = FlatBus { mem: vec![0; 64] };
        bus.write32(0, 0x0004_0000); // SSP
        bus.write32(4, 0x00FC_00D2); // PC

        let mut glue = CpuGlue::new(Box::new(NopCpu::default()));
        glue.reset(&mut bus);

        assert_eq!(glue.core.pc(), 0xFC00D2);
        assert_eq!(glue.core.sp(), 0x0004_0000);
    }

    #[test]
    fn clock_advances_per_instruction() {
        let mut bus = FlatBus { mem: vec![0; 64] };
        let mut glue = CpuGlue::new(Box::new(NopCpu::default()));
        glue.reset(&mut bus);

        let c1 = glue.execute_instruction(&mut bus);
        let c2 = glue.execute_instruction(&mut bus);
        assert_eq!(c2 - c1, 4);
    }

    #[test]
    fn trace_ring_is_bounded() {
        let mut bus = FlatBus { mem: vec![0; 4096] };
        let mut glue = CpuGlue::new(Box::new(NopCpu::default()));
        glue.set_tracing(true);
        glue.reset(&mut bus);

        for _ in 0..TRACE_DEPTH + 10 {
            glue.execute_instruction(&mut bus);
        }
        assert_eq!(glue.trace_entries().count(), TRACE_DEPTH);
    }

    #[test]
    fn context_blob_round_trips() {
        let mut bus = FlatBus { mem: vec![0; 64] };
        bus.write32(4, 0x0012_3456);

        let mut glue = CpuGlue::new(Box::new(NopCpu::default()));
        glue.reset(&mut bus);

        let mut w = SnapshotWriter::new();
        glue.save_items(&mut w);
        let bytes = w.into_bytes();

        let mut other = CpuGlue::new(Box::new(NopCpu::default()));
        let mut r = SnapshotReader::new(&bytes);
        other.load_items(&mut r).unwrap();
        assert_eq!(other.core.pc(), 0x12_3456);
    }
}
