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

    denise::pixel_engine.rs

    Colorisation and frame buffers. Four RGBA buffers exist: long and
    short frames, each with a working and a stable copy. Drawing goes to
    the working buffer only; the host reads the stable one. The buffers
    switch roles at the frame boundary, never mid-frame. Color register
    writes recorded during the line are replayed here, in pixel order, by
    the colorize pass.

*/

use crate::{
    error::SnapshotError,
    snapshot::{SnapshotReader, SnapshotWriter},
    HPIXELS,
    VPOS_CNT,
};

use super::{ChangeId, ChangeRecorder, RegChange};

/// Color table size: 32 registers, 32 halfbright shades, 8 debug colors.
pub const RGBA_INDEX_CNT: usize = 32 + 32 + 8;

const DEBUG_COLORS: [u32; 8] = [
    rgba(0xF, 0x0, 0x0),
    rgba(0x0, 0xF, 0x0),
    rgba(0x0, 0x0, 0xF),
    rgba(0xF, 0xF, 0x0),
    rgba(0x0, 0xF, 0xF),
    rgba(0xF, 0x0, 0xF),
    rgba(0x8, 0x8, 0x8),
    rgba(0xF, 0xF, 0xF),
];

/// Expand a 4-bit-per-channel color to RGBA8888.
const fn rgba(r: u32, g: u32, b: u32) -> u32 {
    (r * 17) | (g * 17) << 8 | (b * 17) << 16 | 0xFF << 24
}

pub struct ScreenBuffer {
    pub data: Vec<u32>,
    pub long_frame: bool,
}

impl ScreenBuffer {
    fn new(long_frame: bool) -> Self {
        Self {
            data: vec![0; HPIXELS * VPOS_CNT as usize],
            long_frame,
        }
    }

    /// Raw byte view of the RGBA data for texture uploads.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }
}

pub struct PixelEngine {
    // Buffer pairs: [0] and [1] alternate between working and stable.
    long_frame: [ScreenBuffer; 2],
    short_frame: [ScreenBuffer; 2],
    working_long: usize,
    working_short: usize,
    /// Which frame type Denise is currently drawing.
    drawing_long: bool,

    color_reg: [u16; 32],
    /// RGBA for every possible 12-bit color.
    rgba: Box<[u32; 4096]>,
    /// Color registers (0..31), halfbright (32..63), debug (64..71).
    indexed_rgba: [u32; RGBA_INDEX_CNT],

    pub col_changes: ChangeRecorder,
}

impl Default for PixelEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelEngine {
    pub fn new() -> Self {
        let mut rgba_table = Box::new([0u32; 4096]);
        for value in 0..4096u32 {
            rgba_table[value as usize] =
                rgba((value >> 8) & 0xF, (value >> 4) & 0xF, value & 0xF);
        }

        let mut pe = Self {
            long_frame: [ScreenBuffer::new(true), ScreenBuffer::new(true)],
            short_frame: [ScreenBuffer::new(false), ScreenBuffer::new(false)],
            working_long: 0,
            working_short: 0,
            drawing_long: true,
            color_reg: [0; 32],
            rgba: rgba_table,
            indexed_rgba: [0; RGBA_INDEX_CNT],
            col_changes: ChangeRecorder::new(),
        };
        for reg in 0..32 {
            pe.update_indexed(reg);
        }
        for (i, &color) in DEBUG_COLORS.iter().enumerate() {
            pe.indexed_rgba[64 + i] = color;
        }
        pe
    }

    pub fn reset(&mut self) {
        self.color_reg = [0; 32];
        for reg in 0..32 {
            self.update_indexed(reg);
        }
        self.col_changes.clear();
    }

    //
    // Color registers
    //

    pub fn set_color(&mut self, reg: usize, value: u16) {
        self.color_reg[reg] = value & 0x0FFF;
        self.update_indexed(reg);
    }

    fn update_indexed(&mut self, reg: usize) {
        let color = self.color_reg[reg] as usize;
        self.indexed_rgba[reg] = self.rgba[color];
        // Halfbright: each channel halved
        let half = ((color >> 1) & 0x777) as usize;
        self.indexed_rgba[32 + reg] = self.rgba[half];
    }

    pub fn color(&self, reg: usize) -> u16 {
        self.color_reg[reg]
    }

    pub fn color_rgba(&self, index: usize) -> u32 {
        self.indexed_rgba[index]
    }

    //
    // Frame buffer management
    //

    /// The buffer Denise is drawing into.
    fn working(&mut self) -> &mut ScreenBuffer {
        if self.drawing_long {
            &mut self.long_frame[self.working_long]
        } else {
            &mut self.short_frame[self.working_short]
        }
    }

    pub fn stable_long_frame(&self) -> &ScreenBuffer {
        &self.long_frame[self.working_long ^ 1]
    }

    pub fn stable_short_frame(&self) -> &ScreenBuffer {
        &self.short_frame[self.working_short ^ 1]
    }

    /// Frame boundary: the finished working buffer becomes the stable one
    /// and drawing proceeds into the other. Progressive modes use the
    /// long-frame pair only.
    pub fn prepare_for_next_frame(&mut self, long_frame: bool, interlace: bool) {
        if self.drawing_long {
            self.working_long ^= 1;
        } else {
            self.working_short ^= 1;
        }
        self.drawing_long = if interlace { long_frame } else { true };
    }

    //
    // Colorisation
    //

    /// Apply a recorded color register change.
    fn apply_change(&mut self, change: &RegChange) {
        if let ChangeId::Color(reg) = change.addr {
            self.set_color(reg as usize, change.value);
        }
    }

    /// Drain the change log without drawing (vertical blanking lines).
    pub fn apply_remaining_col_changes(&mut self) {
        let changes: Vec<RegChange> = self.col_changes.iter().copied().collect();
        for change in changes {
            self.apply_change(&change);
        }
        self.col_changes.clear();
    }

    /// Translate one finished line of color indices into RGBA, replaying
    /// color register changes at their pixel positions.
    pub fn colorize(&mut self, vpos: u16, i_buffer: &[u8], m_buffer: &[u8], ham: bool, ehb: bool) {
        let changes: Vec<RegChange> = self
            .col_changes
            .iter()
            .copied()
            .chain(std::iter::once(RegChange {
                trigger: HPIXELS as i32,
                addr: ChangeId::None,
                value: 0,
            }))
            .collect();

        let mut pixel: usize = 0;
        // HAM chains from the background color at the line start.
        let mut ham_color = self.color_reg[0];

        for change in changes {
            let to = (change.trigger.max(0) as usize).min(HPIXELS);
            if ham {
                self.colorize_ham(vpos, pixel, to, i_buffer, m_buffer, &mut ham_color);
            } else {
                self.colorize_spf(vpos, pixel, to, m_buffer, ehb);
            }
            pixel = to;
            self.apply_change(&change);
        }

        self.col_changes.clear();
    }

    fn colorize_spf(&mut self, vpos: u16, from: usize, to: usize, m_buffer: &[u8], ehb: bool) {
        let row = vpos as usize * HPIXELS;
        let indexed = self.indexed_rgba;
        let dest = &mut self.working().data[row..row + HPIXELS];

        for i in from..to {
            let mut index = m_buffer[i] as usize;
            if !ehb && index >= 32 && index < 64 {
                // Without extra-halfbright only five planes exist; the
                // sixth bit comes from sprites (indices 16-31) or noise.
                index &= 0x1F;
            }
            dest[i] = indexed[index & 0x3F];
        }
    }

    /// Hold-and-modify: bits 4-5 select whether to take a palette entry
    /// or replace one channel of the previous pixel's color.
    fn colorize_ham(
        &mut self,
        vpos: u16,
        from: usize,
        to: usize,
        i_buffer: &[u8],
        m_buffer: &[u8],
        ham_color: &mut u16,
    ) {
        let row = vpos as usize * HPIXELS;
        let indexed = self.indexed_rgba;
        let rgba_table = &self.rgba;
        let color_reg = self.color_reg;

        let dest = if self.drawing_long {
            &mut self.long_frame[self.working_long]
        } else {
            &mut self.short_frame[self.working_short]
        };
        let dest = &mut dest.data[row..row + HPIXELS];

        for i in from..to {
            let index = i_buffer[i] as usize;
            let payload = (index & 0x0F) as u16;

            match index >> 4 {
                0b00 => *ham_color = color_reg[index & 0x0F],
                0b01 => *ham_color = (*ham_color & 0xFF0) | payload, // blue
                0b10 => *ham_color = (*ham_color & 0x0FF) | payload << 8, // red
                _ => *ham_color = (*ham_color & 0xF0F) | payload << 4, // green
            }

            // Sprites on top of HAM show their own color but do not
            // disturb the chain.
            if m_buffer[i] != i_buffer[i] {
                dest[i] = indexed[m_buffer[i] as usize & 0x3F];
            } else {
                dest[i] = rgba_table[*ham_color as usize & 0xFFF];
            }
        }
    }

    pub fn save_items(&self, w: &mut SnapshotWriter) {
        for reg in self.color_reg {
            w.put_u16(reg);
        }
    }

    pub fn load_items(&mut self, r: &mut SnapshotReader) -> Result<(), SnapshotError> {
        for reg in 0..32 {
            let value = r.take_u16()?;
            self.set_color(reg, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_expansion_to_rgba() {
        let mut pe = PixelEngine::new();
        pe.set_color(1, 0x0F63);

        // r=F g=6 b=3, each channel expanded by 17
        let expected = (0xF * 17) | (0x6 * 17) << 8 | (0x3 * 17) << 16 | 0xFF << 24;
        assert_eq!(pe.color_rgba(1), expected);
    }

    #[test]
    fn halfbright_halves_channels() {
        let mut pe = PixelEngine::new();
        pe.set_color(0, 0x0ECA);

        let expected = (0x7 * 17) | (0x6 * 17) << 8 | (0x5 * 17) << 16 | 0xFF << 24;
        assert_eq!(pe.color_rgba(32), expected);
    }

    #[test]
    fn colorize_replays_midline_color_change() {
        let mut pe = PixelEngine::new();
        pe.set_color(1, 0x0F00);

        let mut m_buffer = vec![1u8; HPIXELS];
        let i_buffer = m_buffer.clone();
        m_buffer[0] = 1;

        // Change color 1 to blue at pixel 100
        pe.col_changes.add(100, ChangeId::Color(1), 0x000F);
        pe.colorize(40, &i_buffer, &m_buffer, false, false);

        let row = pe.stable_none_swap_row(40);
        assert_eq!(row[99], rgba(0xF, 0, 0));
        assert_eq!(row[100], rgba(0, 0, 0xF));
        // The change is persistent
        assert_eq!(pe.color(1), 0x000F);
    }

    #[test]
    fn ham_modifies_one_channel_at_a_time() {
        let mut pe = PixelEngine::new();
        pe.set_color(0, 0x0123);
        pe.set_color(2, 0x0ABC);

        // Set from register 2, then modify blue, red, green
        let i_buffer = vec![0x02u8, 0x1F, 0x2F, 0x3F];
        let m_buffer = i_buffer.clone();
        let mut padded_i = i_buffer.clone();
        let mut padded_m = m_buffer.clone();
        padded_i.resize(HPIXELS, 0);
        padded_m.resize(HPIXELS, 0);

        pe.colorize(10, &padded_i, &padded_m, true, false);

        let row = pe.stable_none_swap_row(10);
        assert_eq!(row[0], pe.rgba[0x0ABC]);
        assert_eq!(row[1], pe.rgba[0x0ABF]);
        assert_eq!(row[2], pe.rgba[0x0FBF]);
        assert_eq!(row[3], pe.rgba[0x0FFF]);
    }

    #[test]
    fn frame_buffer_swap_is_atomic() {
        let mut pe = PixelEngine::new();
        let stable_before = pe.stable_long_frame().data.as_ptr();

        pe.prepare_for_next_frame(true, false);
        let stable_after = pe.stable_long_frame().data.as_ptr();

        // The previously written buffer is now the stable one
        assert_ne!(stable_before, stable_after);

        pe.prepare_for_next_frame(true, false);
        assert_eq!(pe.stable_long_frame().data.as_ptr(), stable_before);

        // The byte view covers the whole RGBA surface
        let bytes = pe.stable_long_frame().as_bytes();
        assert_eq!(bytes.len(), HPIXELS * crate::VPOS_CNT as usize * 4);
    }

    #[test]
    fn interlace_alternates_buffer_sets() {
        let mut pe = PixelEngine::new();
        assert!(pe.drawing_long);

        pe.prepare_for_next_frame(false, true);
        assert!(!pe.drawing_long);

        pe.prepare_for_next_frame(true, true);
        assert!(pe.drawing_long);

        // Progressive mode snaps back to long frames
        pe.prepare_for_next_frame(false, false);
        assert!(pe.drawing_long);
    }

    impl PixelEngine {
        /// Test helper: the row just written, before any buffer swap.
        fn stable_none_swap_row(&self, vpos: u16) -> &[u32] {
            let row = vpos as usize * HPIXELS;
            let buffer = if self.drawing_long {
                &self.long_frame[self.working_long]
            } else {
                &self.short_frame[self.working_short]
            };
            &buffer.data[row..row + HPIXELS]
        }
    }
}
