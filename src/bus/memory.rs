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

    bus::memory.rs

    Memory banks and the 24-bit address decoder. A 256-entry lookup table
    indexed by the top 8 address bits selects the memory source for every
    64 KB page. The table is rebuilt whenever the layout can change: Rom
    load, Ram reallocation, Wom lock/unlock, or an overlay toggle.

*/

use crate::{config::KB, error::MemError};

/// Memory source of one 64 KB page.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemSrc {
    Unmapped,
    Chip,
    Fast,
    Slow,
    Cia,
    Rtc,
    Ocs,
    Autoconf,
    Rom,
    Wom,
    Ext,
}

/// Rom revisions the core recognizes by checksum. Only the classification
/// matters to the machine (Boot Roms enable the Wom shadow); titles are
/// kept for diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RomRevision {
    Missing,
    BootA1000_8K,
    BootA1000_64K,
    Kick12,
    Kick13,
    Kick204,
    Kick31,
    Aros,
    Diag,
    Unknown,
}

impl RomRevision {
    pub fn of(fingerprint: u32) -> Self {
        match fingerprint {
            0x0000_0000 => RomRevision::Missing,
            0x62F1_1C04 => RomRevision::BootA1000_8K,
            0x0B1A_D2D0 => RomRevision::BootA1000_64K,
            0x9ED7_83D0 | 0xA6CE_1636 => RomRevision::Kick12,
            0xC4F0_F55F => RomRevision::Kick13,
            0xC3BD_B240 => RomRevision::Kick204,
            0xFC24_AE0D => RomRevision::Kick31,
            0x3F4F_CC0A | 0xF2E5_2B07 => RomRevision::Aros,
            0x4C4B_5C05 | 0x771C_D0EA => RomRevision::Diag,
            _ => RomRevision::Unknown,
        }
    }

    pub fn is_boot_rom(self) -> bool {
        matches!(self, RomRevision::BootA1000_8K | RomRevision::BootA1000_64K)
    }

    pub fn title(self) -> &'static str {
        match self {
            RomRevision::Missing => "No Rom",
            RomRevision::BootA1000_8K | RomRevision::BootA1000_64K => "Amiga 1000 Boot Rom",
            RomRevision::Kick12 => "Kickstart 1.2",
            RomRevision::Kick13 => "Kickstart 1.3",
            RomRevision::Kick204 => "Kickstart 2.04",
            RomRevision::Kick31 => "Kickstart 3.1",
            RomRevision::Aros => "AROS Kickstart replacement",
            RomRevision::Diag => "Amiga DiagROM",
            RomRevision::Unknown => "Unknown or patched Rom",
        }
    }
}

/// One allocatable memory bank. The mask implements mirroring: every bank
/// size is a power of two and the full page range assigned to the bank
/// wraps on it.
#[derive(Default)]
struct Bank {
    data: Vec<u8>,
    mask: u32,
}

impl Bank {
    fn alloc(&mut self, bytes: usize) {
        if bytes == self.data.len() {
            return;
        }
        if bytes == 0 {
            self.data = Vec::new();
            self.mask = 0;
            return;
        }
        debug_assert!(bytes.is_power_of_two());
        self.data = vec![0; bytes];
        self.mask = (bytes - 1) as u32;
    }

    #[inline]
    fn present(&self) -> bool {
        !self.data.is_empty()
    }

    fn fill(&mut self, value: u8) {
        self.data.fill(value);
    }
}

pub struct Memory {
    chip: Bank,
    slow: Bank,
    fast: Bank,
    rom: Bank,
    wom: Bank,
    ext: Bank,

    pub mem_src: [MemSrc; 256],
    pub wom_locked: bool,
    pub ext_start: u8,
    pub rtc_present: bool,

    rom_fingerprint: u32,
    ext_fingerprint: u32,
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            chip: Bank::default(),
            slow: Bank::default(),
            fast: Bank::default(),
            rom: Bank::default(),
            wom: Bank::default(),
            ext: Bank::default(),
            mem_src: [MemSrc::Unmapped; 256],
            wom_locked: false,
            ext_start: 0xE0,
            rtc_present: false,
            rom_fingerprint: 0,
            ext_fingerprint: 0,
        }
    }
}

impl Memory {
    pub fn new() -> Self {
        Default::default()
    }

    //
    // Bank management
    //

    pub fn alloc_ram(&mut self, chip: usize, slow: usize, fast: usize) {
        self.chip.alloc(chip);
        self.slow.alloc(slow);
        self.fast.alloc(fast);
    }

    pub fn has_chip_ram(&self) -> bool {
        self.chip.present()
    }

    pub fn has_rom(&self) -> bool {
        self.rom.present()
    }

    pub fn has_wom(&self) -> bool {
        self.wom.present()
    }

    pub fn has_ext(&self) -> bool {
        self.ext.present()
    }

    pub fn has_boot_rom(&self) -> bool {
        RomRevision::of(self.rom_fingerprint).is_boot_rom()
    }

    pub fn has_kick_rom(&self) -> bool {
        self.rom.present() && !self.has_boot_rom()
    }

    pub fn rom_revision(&self) -> RomRevision {
        if !self.rom.present() {
            RomRevision::Missing
        } else {
            RomRevision::of(self.rom_fingerprint)
        }
    }

    /// Erase Ram with the startup pattern. Writing zeroes until more is
    /// known about the real power-up contents.
    pub fn fill_ram_with_startup_pattern(&mut self) {
        self.chip.fill(0);
        self.slow.fill(0);
        self.fast.fill(0);
    }

    pub fn erase_wom(&mut self) {
        self.wom.fill(0);
        self.wom_locked = false;
    }

    /// Install a Kickstart or Boot Rom image. A Boot Rom image additionally
    /// allocates the 256 KB write-once Ram shadow; any extended Rom is
    /// removed. The caller must rebuild the region table afterwards.
    pub fn load_rom(&mut self, image: &[u8]) -> Result<RomRevision, MemError> {
        let size = match image.len() {
            s if s == 8 * KB || s == 64 * KB || s == 256 * KB || s == 512 * KB => s,
            s if s < 8 * KB => return Err(MemError::RomMissing),
            _ => return Err(MemError::RomOversized),
        };

        self.rom.alloc(size.next_power_of_two());
        self.rom.data[..size].copy_from_slice(image);
        self.rom_fingerprint = crc32(image);

        let revision = RomRevision::of(self.rom_fingerprint);
        log::info!(
            "Installed {} KB Rom: {} (crc {:08X})",
            size / KB,
            revision.title(),
            self.rom_fingerprint
        );

        // A Boot Rom machine shadows Kickstart in a 256 KB Wom.
        if revision.is_boot_rom() {
            self.wom.alloc(256 * KB);
            self.wom_locked = false;
        } else {
            self.wom.alloc(0);
        }

        self.ext.alloc(0);
        self.ext_fingerprint = 0;

        Ok(revision)
    }

    /// Install a 256 KB extended Rom at the configured base page.
    pub fn load_ext(&mut self, image: &[u8]) -> Result<(), MemError> {
        if image.len() != 256 * KB {
            return Err(MemError::RomOversized);
        }
        self.ext.alloc(256 * KB);
        self.ext.data.copy_from_slice(image);
        self.ext_fingerprint = crc32(image);
        Ok(())
    }

    //
    // Region table
    //

    /// Rebuild the page table. `ovl` is the overlay line driven by CIA-A
    /// port A bit 0; while high, the Kickstart pages also appear at the
    /// bottom of the address space so that reset vectors fetch from Rom.
    pub fn update_mem_src_table(&mut self, ovl: bool) {
        let mem_rom = if self.rom.present() { MemSrc::Rom } else { MemSrc::Unmapped };
        let mem_wom = if self.wom.present() { MemSrc::Wom } else { mem_rom };

        let chip_pages = if self.chip.present() { 32 } else { 0 };
        let slow_pages = self.slow.data.len() / 0x1_0000;
        let fast_pages = self.fast.data.len() / 0x1_0000;
        let ext_pages = if self.ext.present() { 8 } else { 0 };

        self.mem_src = [MemSrc::Unmapped; 256];

        for i in 0..chip_pages {
            self.mem_src[i] = MemSrc::Chip;
        }
        for i in 0..fast_pages {
            self.mem_src[0x20 + i] = MemSrc::Fast;
        }
        for i in 0xA0..=0xBF {
            self.mem_src[i] = MemSrc::Cia;
        }
        // Slow Ram and the RTC overwrite parts of the OCS mirror range.
        for i in 0xC0..=0xDF {
            self.mem_src[i] = MemSrc::Ocs;
        }
        for i in 0..slow_pages {
            self.mem_src[0xC0 + i] = MemSrc::Slow;
        }
        if self.rtc_present {
            for i in 0xDC..=0xDE {
                self.mem_src[i] = MemSrc::Rtc;
            }
        }
        for i in 0xE8..=0xEF {
            self.mem_src[i] = MemSrc::Autoconf;
        }
        for i in 0..ext_pages {
            self.mem_src[self.ext_start as usize + i] = MemSrc::Ext;
        }
        for i in 0xF8..=0xFF {
            self.mem_src[i] = mem_wom;
        }
        // Blend in the Boot Rom while the Wom is still writable.
        if self.wom.present() && !self.wom_locked {
            for i in 0xF8..=0xFB {
                self.mem_src[i] = mem_rom;
            }
        }
        if ovl {
            for i in 0..8 {
                if self.mem_src[0xF8 + i] == MemSrc::Unmapped {
                    break;
                }
                self.mem_src[i] = self.mem_src[0xF8 + i];
            }
        }
    }

    #[inline]
    pub fn src(&self, addr: u32) -> MemSrc {
        self.mem_src[(addr as usize >> 16) & 0xFF]
    }

    //
    // Bank accessors. All multi-byte accesses are big-endian; the bank
    // masks implement the partial address decoding mirrors.
    //

    #[inline]
    pub fn read_chip8(&self, addr: u32) -> u8 {
        self.chip.data[(addr & self.chip.mask) as usize]
    }

    #[inline]
    pub fn read_chip16(&self, addr: u32) -> u16 {
        let a = (addr & self.chip.mask & !1) as usize;
        u16::from_be_bytes([self.chip.data[a], self.chip.data[a + 1]])
    }

    #[inline]
    pub fn write_chip8(&mut self, addr: u32, value: u8) {
        let a = (addr & self.chip.mask) as usize;
        self.chip.data[a] = value;
    }

    #[inline]
    pub fn write_chip16(&mut self, addr: u32, value: u16) {
        let a = (addr & self.chip.mask & !1) as usize;
        self.chip.data[a..a + 2].copy_from_slice(&value.to_be_bytes());
    }

    #[inline]
    pub fn read_slow8(&self, addr: u32) -> u8 {
        self.slow.data[(addr & self.slow.mask) as usize]
    }

    #[inline]
    pub fn read_slow16(&self, addr: u32) -> u16 {
        let a = (addr & self.slow.mask & !1) as usize;
        u16::from_be_bytes([self.slow.data[a], self.slow.data[a + 1]])
    }

    #[inline]
    pub fn write_slow8(&mut self, addr: u32, value: u8) {
        let a = (addr & self.slow.mask) as usize;
        self.slow.data[a] = value;
    }

    #[inline]
    pub fn write_slow16(&mut self, addr: u32, value: u16) {
        let a = (addr & self.slow.mask & !1) as usize;
        self.slow.data[a..a + 2].copy_from_slice(&value.to_be_bytes());
    }

    #[inline]
    pub fn read_fast8(&self, addr: u32) -> u8 {
        self.fast.data[(addr.wrapping_sub(0x20_0000) & self.fast.mask) as usize]
    }

    #[inline]
    pub fn read_fast16(&self, addr: u32) -> u16 {
        let a = (addr.wrapping_sub(0x20_0000) & self.fast.mask & !1) as usize;
        u16::from_be_bytes([self.fast.data[a], self.fast.data[a + 1]])
    }

    #[inline]
    pub fn write_fast8(&mut self, addr: u32, value: u8) {
        let a = (addr.wrapping_sub(0x20_0000) & self.fast.mask) as usize;
        self.fast.data[a] = value;
    }

    #[inline]
    pub fn write_fast16(&mut self, addr: u32, value: u16) {
        let a = (addr.wrapping_sub(0x20_0000) & self.fast.mask & !1) as usize;
        self.fast.data[a..a + 2].copy_from_slice(&value.to_be_bytes());
    }

    #[inline]
    pub fn read_rom8(&self, addr: u32) -> u8 {
        self.rom.data[(addr & self.rom.mask) as usize]
    }

    #[inline]
    pub fn read_rom16(&self, addr: u32) -> u16 {
        let a = (addr & self.rom.mask & !1) as usize;
        u16::from_be_bytes([self.rom.data[a], self.rom.data[a + 1]])
    }

    #[inline]
    pub fn read_wom8(&self, addr: u32) -> u8 {
        self.wom.data[(addr & self.wom.mask) as usize]
    }

    #[inline]
    pub fn read_wom16(&self, addr: u32) -> u16 {
        let a = (addr & self.wom.mask & !1) as usize;
        u16::from_be_bytes([self.wom.data[a], self.wom.data[a + 1]])
    }

    /// A write into Rom space locks the Wom. The A1000 boot code performs
    /// exactly one such write after copying Kickstart into the shadow.
    pub fn poke_rom(&mut self) -> bool {
        if self.wom.present() && !self.wom_locked {
            log::debug!("Locking Wom");
            self.wom_locked = true;
            return true;
        }
        false
    }

    pub fn poke_wom8(&mut self, addr: u32, value: u8) {
        if !self.wom_locked {
            let a = (addr & self.wom.mask) as usize;
            self.wom.data[a] = value;
        }
    }

    pub fn poke_wom16(&mut self, addr: u32, value: u16) {
        if !self.wom_locked {
            let a = (addr & self.wom.mask & !1) as usize;
            self.wom.data[a..a + 2].copy_from_slice(&value.to_be_bytes());
        }
    }

    #[inline]
    pub fn read_ext8(&self, addr: u32) -> u8 {
        self.ext.data[(addr & self.ext.mask) as usize]
    }

    #[inline]
    pub fn read_ext16(&self, addr: u32) -> u16 {
        let a = (addr & self.ext.mask & !1) as usize;
        u16::from_be_bytes([self.ext.data[a], self.ext.data[a + 1]])
    }

    /// Direct chip Ram slice for bulk operations (snapshots, debugger).
    pub fn chip_slice(&self) -> &[u8] {
        &self.chip.data
    }

    pub fn chip_slice_mut(&mut self) -> &mut [u8] {
        &mut self.chip.data
    }

    pub fn bank_sizes(&self) -> (usize, usize, usize, usize, usize, usize) {
        (
            self.chip.data.len(),
            self.slow.data.len(),
            self.fast.data.len(),
            self.rom.data.len(),
            self.wom.data.len(),
            self.ext.data.len(),
        )
    }

    pub fn save_items(&self, w: &mut crate::snapshot::SnapshotWriter) {
        w.put_u8(self.wom_locked as u8);
        w.put_u8(self.ext_start);
        w.put_u8(self.rtc_present as u8);
        w.put_u32(self.rom_fingerprint);
        for bank in [&self.chip, &self.slow, &self.fast, &self.rom, &self.wom, &self.ext] {
            w.put_u32(bank.data.len() as u32);
            w.put_bytes(&bank.data);
        }
    }

    pub fn load_items(&mut self, r: &mut crate::snapshot::SnapshotReader) -> Result<(), crate::error::SnapshotError> {
        self.wom_locked = r.take_u8()? != 0;
        self.ext_start = r.take_u8()?;
        self.rtc_present = r.take_u8()? != 0;
        self.rom_fingerprint = r.take_u32()?;
        for bank in [
            &mut self.chip,
            &mut self.slow,
            &mut self.fast,
            &mut self.rom,
            &mut self.wom,
            &mut self.ext,
        ] {
            let len = r.take_u32()? as usize;
            bank.alloc(len);
            r.take_into(&mut bank.data)?;
        }
        Ok(())
    }
}

/// Standard CRC-32 (IEEE), used to fingerprint Rom images.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// 32-bit FNV-1a, used for quick state checksums in diagnostics.
pub fn fnv_1a_32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for &byte in data {
        hash = (hash ^ byte as u32).wrapping_mul(0x0100_0193);
    }
    hash
}

#[inline]
pub fn fnv_1a_it32(prev: u32, value: u32) -> u32 {
    (prev ^ value).wrapping_mul(0x0100_0193)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_with_ram() -> Memory {
        let mut mem = Memory::new();
        mem.alloc_ram(512 * KB, 512 * KB, 256 * KB);
        mem.update_mem_src_table(false);
        mem
    }

    #[test]
    fn ram_round_trip() {
        let mut mem = memory_with_ram();

        mem.write_chip16(0x01234, 0xBEEF);
        assert_eq!(mem.read_chip16(0x01234), 0xBEEF);

        mem.write_slow16(0xC1000, 0x1234);
        assert_eq!(mem.read_slow16(0xC1000), 0x1234);

        mem.write_fast16(0x20_0042, 0x55AA);
        assert_eq!(mem.read_fast16(0x20_0042), 0x55AA);
    }

    #[test]
    fn chip_ram_is_big_endian() {
        let mut mem = memory_with_ram();
        mem.write_chip16(0x1000, 0x1234);
        assert_eq!(mem.read_chip8(0x1000), 0x12);
        assert_eq!(mem.read_chip8(0x1001), 0x34);
    }

    #[test]
    fn chip_ram_mirrors_across_range() {
        let mut mem = Memory::new();
        mem.alloc_ram(256 * KB, 0, 0);
        mem.update_mem_src_table(false);

        mem.write_chip16(0x0100, 0xCAFE);
        // 256 KB mask mirrors at every 256 KB boundary
        assert_eq!(mem.read_chip16(0x4_0100), 0xCAFE);
        assert_eq!(mem.read_chip16(0x8_0100), 0xCAFE);
    }

    #[test]
    fn mem_src_layout() {
        let mem = memory_with_ram();
        assert_eq!(mem.src(0x00_0000), MemSrc::Chip);
        assert_eq!(mem.src(0x20_0000), MemSrc::Fast);
        assert_eq!(mem.src(0x24_0000), MemSrc::Unmapped);
        assert_eq!(mem.src(0xA1_0000), MemSrc::Cia);
        assert_eq!(mem.src(0xC0_0000), MemSrc::Slow);
        assert_eq!(mem.src(0xDF_F000), MemSrc::Ocs);
        assert_eq!(mem.src(0xE9_0000), MemSrc::Autoconf);
        assert_eq!(mem.src(0xF8_0000), MemSrc::Unmapped); // no Rom yet
    }

    #[test]
    fn rom_maps_high_and_under_overlay() {
        let mut mem = memory_with_ram();
        let image = vec![0xAA; 512 * KB];
        mem.load_rom(&image).unwrap();

        mem.update_mem_src_table(false);
        assert_eq!(mem.src(0xF8_0000), MemSrc::Rom);
        assert_eq!(mem.src(0x00_0000), MemSrc::Chip);

        mem.update_mem_src_table(true);
        assert_eq!(mem.src(0x00_0000), MemSrc::Rom);
        assert_eq!(mem.src(0x08_0000), MemSrc::Chip);
    }

    #[test]
    fn overlay_toggle_preserves_contents_and_table() {
        let mut mem = memory_with_ram();
        let image: Vec<u8> = (0..512 * KB).map(|i| (i * 7) as u8).collect();
        mem.load_rom(&image).unwrap();
        mem.update_mem_src_table(false);

        mem.write_chip16(0x2000, 0x4242);
        let table_before = mem.mem_src;

        mem.update_mem_src_table(true);
        mem.update_mem_src_table(false);

        assert_eq!(mem.read_chip16(0x2000), 0x4242);
        assert_eq!(mem.mem_src, table_before);
    }

    #[test]
    fn boot_rom_allocates_wom_and_lock_flips_table() {
        let mut mem = memory_with_ram();

        // A 64 KB image classifies as a Boot Rom candidate by size; force
        // the fingerprint path by checking wom allocation only.
        let image = vec![0x11; 64 * KB];
        mem.load_rom(&image).unwrap();
        if !mem.has_wom() {
            // Unknown fingerprint: no Wom. Simulate a Boot Rom by hand.
            mem.wom.alloc(256 * KB);
        }
        mem.update_mem_src_table(false);
        assert_eq!(mem.src(0xF8_0000), MemSrc::Rom); // writable window
        assert_eq!(mem.src(0xFC_0000), MemSrc::Wom);

        mem.poke_wom16(0x0000, 0xD00D);
        assert_eq!(mem.read_wom16(0x0000), 0xD00D);

        assert!(mem.poke_rom());
        mem.update_mem_src_table(false);
        assert_eq!(mem.src(0xF8_0000), MemSrc::Wom);

        // Writes to a locked Wom are ignored
        mem.poke_wom16(0x0000, 0x0BAD);
        assert_eq!(mem.read_wom16(0x0000), 0xD00D);
    }

    #[test]
    fn crc32_reference_value() {
        // CRC-32 of "123456789" is the canonical check value.
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}
