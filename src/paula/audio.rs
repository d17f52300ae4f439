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

    paula::audio.rs

    Audio DMA clients. Four channels, each fetching one word per scanline
    slot when enabled, shifting out two 8-bit signed samples per word at
    the programmed period. Samples are mixed into a bounded buffer the
    host drains at its own rate; resampling is the host's problem.

*/

use std::collections::VecDeque;

use crate::{
    error::SnapshotError,
    snapshot::{SnapshotReader, SnapshotWriter},
};

/// Bound on buffered samples. Roughly a quarter second at the guest rate;
/// when the host stops draining, old samples are dropped.
const SAMPLE_BUF_LIMIT: usize = 32_768;

#[derive(Default)]
pub struct AudioChannel {
    /// Location latch (AUDxLCH/AUDxLCL) and the working pointer copy.
    pub audlc: u32,
    pub audpt: u32,
    pub audlen: u16,
    pub audper: u16,
    pub audvol: u16,
    pub auddat: u16,

    len_counter: u16,
    per_counter: i32,
    /// Which byte of auddat plays next (false = high byte).
    low_byte: bool,
    /// Set while the channel state machine runs.
    active: bool,
    /// A word fetch is wanted on the next audio slot for this channel.
    pending_fetch: bool,
}

impl AudioChannel {
    pub fn poke_lch(&mut self, value: u16) {
        self.audlc = (self.audlc & 0x0000_FFFF) | ((value as u32 & 0x7) << 16);
    }

    pub fn poke_lcl(&mut self, value: u16) {
        self.audlc = (self.audlc & 0xFFFF_0000) | (value as u32 & 0xFFFE);
    }

    pub fn poke_len(&mut self, value: u16) {
        self.audlen = value;
    }

    pub fn poke_per(&mut self, value: u16) {
        self.audper = value;
    }

    pub fn poke_vol(&mut self, value: u16) {
        // Volume saturates at 64.
        self.audvol = value & 0x7F;
        if self.audvol > 64 {
            self.audvol = 64;
        }
    }

    pub fn poke_dat(&mut self, value: u16) {
        self.auddat = value;
        self.low_byte = false;
    }

    /// Called when the channel's DMA enable bit turns on.
    pub fn dma_on(&mut self) {
        if !self.active {
            self.active = true;
            self.audpt = self.audlc;
            self.len_counter = self.audlen;
            self.per_counter = self.audper as i32;
            self.pending_fetch = true;
        }
    }

    pub fn dma_off(&mut self) {
        self.active = false;
        self.pending_fetch = false;
    }

    #[inline]
    pub fn wants_slot(&self) -> bool {
        self.active && self.pending_fetch
    }

    /// Account one fetched word (fetched by Agnus in the granted slot).
    /// Returns true when the length counter wrapped (AUDx interrupt).
    pub fn did_fetch(&mut self, word: u16) -> bool {
        self.auddat = word;
        self.low_byte = false;
        self.pending_fetch = false;
        self.audpt = self.audpt.wrapping_add(2) & 0x7_FFFE;

        self.len_counter = self.len_counter.wrapping_sub(1);
        if self.len_counter == 0 || self.len_counter == 0xFFFF {
            self.len_counter = self.audlen;
            self.audpt = self.audlc;
            return true;
        }
        false
    }

    /// Advance the period counter by one color clock and emit the current
    /// sample. A period below 2 is treated as 2 (hardware limit is lower,
    /// but the distinction needs sub-CCK timing).
    fn tick(&mut self) -> i16 {
        if !self.active {
            return 0;
        }

        self.per_counter -= 1;
        if self.per_counter <= 0 {
            self.per_counter = (self.audper.max(2)) as i32;
            if self.low_byte {
                self.low_byte = false;
                self.pending_fetch = true;
            } else {
                self.low_byte = true;
            }
        }

        let byte = if self.low_byte {
            (self.auddat & 0xFF) as u8 as i8
        } else {
            (self.auddat >> 8) as u8 as i8
        };
        byte as i16 * self.audvol as i16
    }

    fn save_items(&self, w: &mut SnapshotWriter) {
        w.put_u32(self.audlc);
        w.put_u32(self.audpt);
        w.put_u16(self.audlen);
        w.put_u16(self.audper);
        w.put_u16(self.audvol);
        w.put_u16(self.auddat);
        w.put_u16(self.len_counter);
        w.put_u32(self.per_counter as u32);
        w.put_u8(self.low_byte as u8);
        w.put_u8(self.active as u8);
        w.put_u8(self.pending_fetch as u8);
    }

    fn load_items(&mut self, r: &mut SnapshotReader) -> Result<(), SnapshotError> {
        self.audlc = r.take_u32()?;
        self.audpt = r.take_u32()?;
        self.audlen = r.take_u16()?;
        self.audper = r.take_u16()?;
        self.audvol = r.take_u16()?;
        self.auddat = r.take_u16()?;
        self.len_counter = r.take_u16()?;
        self.per_counter = r.take_u32()? as i32;
        self.low_byte = r.take_u8()? != 0;
        self.active = r.take_u8()? != 0;
        self.pending_fetch = r.take_u8()? != 0;
        Ok(())
    }
}

#[derive(Default)]
pub struct AudioUnit {
    pub channels: [AudioChannel; 4],
    samples: VecDeque<f32>,
}

impl AudioUnit {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        for ch in &mut self.channels {
            *ch = AudioChannel::default();
        }
        self.samples.clear();
    }

    /// Track DMACON enable transitions for all four channels.
    pub fn update_dma(&mut self, audio_enable_bits: u16) {
        for (i, ch) in self.channels.iter_mut().enumerate() {
            if audio_enable_bits & (1 << i) != 0 {
                ch.dma_on();
            } else {
                ch.dma_off();
            }
        }
    }

    /// Advance all channels by one color clock and mix one output sample.
    #[cfg(feature = "audio")]
    pub fn tick(&mut self) {
        let mut mix: i32 = 0;
        for ch in &mut self.channels {
            mix += ch.tick() as i32;
        }
        // 4 channels x (127 * 64) fits comfortably in the f32 mantissa
        let sample = mix as f32 / (4.0 * 127.0 * 64.0);

        if self.samples.len() >= SAMPLE_BUF_LIMIT {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    #[cfg(not(feature = "audio"))]
    pub fn tick(&mut self) {}

    /// Host-facing: drain up to `max` mixed samples.
    pub fn drain_samples(&mut self, max: usize, out: &mut Vec<f32>) {
        for _ in 0..max {
            match self.samples.pop_front() {
                Some(s) => out.push(s),
                None => break,
            }
        }
    }

    pub fn pending_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn save_items(&self, w: &mut SnapshotWriter) {
        for ch in &self.channels {
            ch.save_items(w);
        }
    }

    pub fn load_items(&mut self, r: &mut SnapshotReader) -> Result<(), SnapshotError> {
        for ch in &mut self.channels {
            ch.load_items(r)?;
        }
        self.samples.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dma_on_latches_pointer_and_requests_fetch() {
        let mut ch = AudioChannel::default();
        ch.poke_lch(0x0001);
        ch.poke_lcl(0x2340);
        ch.poke_len(4);
        ch.dma_on();

        assert_eq!(ch.audpt, 0x1_2340);
        assert!(ch.wants_slot());

        assert!(!ch.did_fetch(0x1234));
        assert_eq!(ch.audpt, 0x1_2342);
    }

    #[test]
    fn length_wrap_restarts_and_reports() {
        let mut ch = AudioChannel::default();
        ch.poke_lcl(0x0100);
        ch.poke_len(2);
        ch.dma_on();

        assert!(!ch.did_fetch(0));
        ch.pending_fetch = true;
        assert!(ch.did_fetch(0)); // counter hit zero: restart
        assert_eq!(ch.audpt, 0x0100);
    }

    #[cfg(feature = "audio")]
    #[test]
    fn tick_produces_bounded_samples() {
        let mut unit = AudioUnit::new();
        unit.channels[0].poke_per(4);
        unit.channels[0].poke_vol(64);
        unit.channels[0].poke_dat(0x7F7F);
        unit.channels[0].dma_on();

        for _ in 0..64 {
            unit.tick();
        }
        let mut out = Vec::new();
        unit.drain_samples(1024, &mut out);
        assert_eq!(out.len(), 64);
        assert!(out.iter().all(|s| s.abs() <= 1.0));
    }
}
