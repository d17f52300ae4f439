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

    chipset.rs

    Cross-chip scenarios: blits driven through the bus arbiter, Copper
    programs synchronized with the beam, and the fast/accurate Blitter
    equivalence.

*/

use lorraine_core::{
    agnus::blitter::slowblit::{iteration_len, tail_len, COPY_PROGRAMS},
    agnus::DMACON_BLTPRI,
    bus::{Bus, PokeSource},
    config::{AmigaConfig, BlitterAccuracy},
    messages::MsgQueue,
};

fn chipset(accuracy: BlitterAccuracy) -> (Bus, MsgQueue) {
    let queue = MsgQueue::new();
    let mut config = AmigaConfig::default();
    config.blitter_accuracy = accuracy;
    let mut bus = Bus::new(&config, queue.sender());

    // Drop the reset overlay so chip Ram decodes at address 0
    bus.ciaa.poke(lorraine_core::cia::REG_DDRA, 0x01);
    bus.ciaa.poke(lorraine_core::cia::REG_PRA, 0x00);
    bus.update_mem_layout();
    (bus, queue)
}

fn poke(bus: &mut Bus, reg: u16, value: u16) {
    bus.poke_custom16(PokeSource::Cpu, 0xDF_F000 | reg as u32, value);
}

/// Advance to a beam position clear of the fixed DMA slots so blit
/// timing measurements see an uncontended bus.
fn park_beam(bus: &mut Bus, h: u16) {
    while bus.agnus.pos.h != h {
        bus.execute_hpos();
    }
}

fn run_blit(bus: &mut Bus) -> usize {
    let mut slots = 0;
    while bus.agnus.blitter.busy() {
        bus.execute_hpos();
        slots += 1;
        assert!(slots < 100_000, "blit never completed");
    }
    slots
}

#[test]
fn copy_blit_a_or_c() {
    let (mut bus, _queue) = chipset(BlitterAccuracy::Accurate);

    // Source A all-ones at $20000, source C zeroed at $30000
    for i in 0..8 {
        bus.memory.write_chip16(0x2_0000 + i * 2, 0xFFFF);
        bus.memory.write_chip16(0x3_0000 + i * 2, 0x0000);
        bus.memory.write_chip16(0x4_0000 + i * 2, 0x1234);
    }

    poke(&mut bus, 0x096, 0x8000 | 0x0200 | 0x0040 | 0x0400); // DMAEN, BLTEN, BLTPRI
    poke(&mut bus, 0x040, 0x0FFA); // all channels, no shift, minterm FA = A | C
    poke(&mut bus, 0x042, 0x0000);
    poke(&mut bus, 0x044, 0xFFFF); // first word mask
    poke(&mut bus, 0x046, 0xFFFF); // last word mask
    poke(&mut bus, 0x050, 0x0002); // BLTAPTH
    poke(&mut bus, 0x052, 0x0000);
    poke(&mut bus, 0x048, 0x0003); // BLTCPTH
    poke(&mut bus, 0x04A, 0x0000);
    poke(&mut bus, 0x054, 0x0004); // BLTDPTH
    poke(&mut bus, 0x056, 0x0000);
    poke(&mut bus, 0x064, 0); // BLTAMOD
    poke(&mut bus, 0x060, 0); // BLTCMOD
    poke(&mut bus, 0x066, 0); // BLTDMOD
    poke(&mut bus, 0x058, (2 << 6) | 4); // 4 words x 2 rows

    run_blit(&mut bus);

    for i in 0..16 {
        assert_eq!(bus.memory.chip_slice()[0x4_0000 + i], 0xFF, "byte {}", i);
    }
    // Non-zero output clears the zero flag
    assert!(!bus.agnus.blitter.bzero());
    // Completion raised the Blitter interrupt
    assert_ne!(bus.paula.peek_intreqr() & 0x0040, 0);
}

#[test]
fn exclusive_fill_between_set_bits() {
    let (mut bus, _queue) = chipset(BlitterAccuracy::Accurate);

    poke(&mut bus, 0x096, 0x8000 | 0x0200 | 0x0040 | 0x0400);
    poke(&mut bus, 0x040, 0x01F0); // D only, minterm F0 (D = A)
    poke(&mut bus, 0x042, 0x0010); // fill exclusive
    poke(&mut bus, 0x044, 0xFFFF);
    poke(&mut bus, 0x046, 0xFFFF);
    poke(&mut bus, 0x074, 0b1000_0000_0000_0001); // BLTADAT
    poke(&mut bus, 0x054, 0x0004);
    poke(&mut bus, 0x056, 0x0000);
    poke(&mut bus, 0x066, 0);
    poke(&mut bus, 0x058, (1 << 6) | 1); // one word

    run_blit(&mut bus);

    assert_eq!(bus.memory.read_chip16(0x4_0000), 0xFFFF);
}

#[test]
fn blit_length_law() {
    // A copy blit takes K(M, fill) * W * H + tail slots, straight from
    // the micro-program table.
    let cases = [
        (0xF, false, 4u16, 2u16),
        (0xF, true, 3, 3),
        (0x9, false, 2, 4),
        (0x5, true, 2, 2),
        (0x1, false, 3, 2),
        (0x0, false, 4, 4),
    ];

    for (shape, fill, w, h) in cases {
        let (mut bus, _queue) = chipset(BlitterAccuracy::Accurate);
        park_beam(&mut bus, 0x40);

        let program = &COPY_PROGRAMS[shape][fill as usize];
        let expected = iteration_len(program) * (w as usize * h as usize) + tail_len(program);

        poke(&mut bus, 0x096, 0x8000 | 0x0200 | 0x0040 | DMACON_BLTPRI);
        let con0 = ((shape as u16) << 8) | 0x00CA;
        poke(&mut bus, 0x040, con0);
        poke(&mut bus, 0x042, if fill { 0x0008 } else { 0x0000 });
        poke(&mut bus, 0x044, 0xFFFF);
        poke(&mut bus, 0x046, 0xFFFF);
        poke(&mut bus, 0x050, 0x0002);
        poke(&mut bus, 0x052, 0x0000);
        poke(&mut bus, 0x04C, 0x0002);
        poke(&mut bus, 0x04E, 0x4000);
        poke(&mut bus, 0x048, 0x0003);
        poke(&mut bus, 0x04A, 0x0000);
        poke(&mut bus, 0x054, 0x0004);
        poke(&mut bus, 0x056, 0x0000);
        poke(&mut bus, 0x058, (h << 6) | w);

        // The first micro slot runs one horizontal position after launch
        let slots = run_blit(&mut bus);
        assert_eq!(
            slots,
            expected + 1,
            "shape {:X} fill {} {}x{}",
            shape,
            fill,
            w,
            h
        );
    }
}

#[test]
fn fast_and_accurate_blits_produce_identical_memory() {
    let blit = |accuracy: BlitterAccuracy| -> (Vec<u8>, u32, u32) {
        let (mut bus, _queue) = chipset(accuracy);

        // Deterministic pseudo-random sources
        let mut seed: u32 = 0x1234_5678;
        for i in 0..64 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            bus.memory.write_chip16(0x2_0000 + i * 2, (seed >> 8) as u16);
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            bus.memory.write_chip16(0x2_4000 + i * 2, (seed >> 8) as u16);
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            bus.memory.write_chip16(0x2_8000 + i * 2, (seed >> 8) as u16);
        }

        poke(&mut bus, 0x096, 0x8000 | 0x0200 | 0x0040 | 0x0400);
        poke(&mut bus, 0x040, 0x2FCA); // shift 2, all channels, cookie-cut
        poke(&mut bus, 0x042, 0x1000); // B shift 1
        poke(&mut bus, 0x044, 0xF0FF);
        poke(&mut bus, 0x046, 0xFF0F);
        poke(&mut bus, 0x050, 0x0002);
        poke(&mut bus, 0x052, 0x0000);
        poke(&mut bus, 0x04C, 0x0002);
        poke(&mut bus, 0x04E, 0x4000);
        poke(&mut bus, 0x048, 0x0002);
        poke(&mut bus, 0x04A, 0x8000);
        poke(&mut bus, 0x054, 0x0004);
        poke(&mut bus, 0x056, 0x0000);
        poke(&mut bus, 0x064, 2); // A modulo
        poke(&mut bus, 0x062, 2);
        poke(&mut bus, 0x060, 2);
        poke(&mut bus, 0x066, 2);
        poke(&mut bus, 0x058, (5 << 6) | 6);

        run_blit(&mut bus);

        let dest = bus.memory.chip_slice()[0x4_0000..0x4_0100].to_vec();
        (dest, bus.agnus.blitter.check1, bus.agnus.blitter.check2)
    };

    let (accurate, acc1, acc2) = blit(BlitterAccuracy::Accurate);
    let (fast, fast1, fast2) = blit(BlitterAccuracy::Fast);

    assert_eq!(accurate, fast);
    assert_eq!(acc1, fast1);
    assert_eq!(acc2, fast2);
}

#[test]
fn descending_copy_blit() {
    let (mut bus, _queue) = chipset(BlitterAccuracy::Accurate);

    for i in 0..4u32 {
        bus.memory.write_chip16(0x2_0000 + i * 2, 0x1111 * (i as u16 + 1));
    }

    poke(&mut bus, 0x096, 0x8000 | 0x0200 | 0x0040 | 0x0400);
    poke(&mut bus, 0x040, 0x09F0); // A and D, minterm F0
    poke(&mut bus, 0x042, 0x0002); // descending
    poke(&mut bus, 0x044, 0xFFFF);
    poke(&mut bus, 0x046, 0xFFFF);
    // Pointers start at the last word in descending mode
    poke(&mut bus, 0x050, 0x0002);
    poke(&mut bus, 0x052, 0x0006);
    poke(&mut bus, 0x054, 0x0004);
    poke(&mut bus, 0x056, 0x0006);
    poke(&mut bus, 0x064, 0);
    poke(&mut bus, 0x066, 0);
    poke(&mut bus, 0x058, (1 << 6) | 4);

    run_blit(&mut bus);

    for i in 0..4u32 {
        assert_eq!(
            bus.memory.read_chip16(0x4_0000 + i * 2),
            0x1111 * (i as u16 + 1),
            "word {}",
            i
        );
    }
}

#[test]
fn line_blit_draws_a_diagonal() {
    let (mut bus, _queue) = chipset(BlitterAccuracy::Accurate);

    // 16 pixels down-right from (0,0) in a 2-bytes-per-row bitmap at
    // $50000. Standard line setup: minterm A|C, BLTADAT = $8000.
    let length: u16 = 8;
    poke(&mut bus, 0x096, 0x8000 | 0x0200 | 0x0040 | 0x0400);
    poke(&mut bus, 0x040, 0x0BFA); // use A, C, D; minterm A | C
    // LINE, octant: down-right major x... AUL clear, SUL clear, SUD clear
    poke(&mut bus, 0x042, 0x0001);
    poke(&mut bus, 0x044, 0x8000); // single dot in BLTADAT
    poke(&mut bus, 0x074, 0x8000);
    poke(&mut bus, 0x072, 0xFFFF); // solid texture
    // Error term: 4*dy - 2*dx with dx = dy = 8 -> 16
    poke(&mut bus, 0x052, 16);
    poke(&mut bus, 0x050, 0);
    poke(&mut bus, 0x064, 0); // AMOD = 4*(dy-dx) = 0
    poke(&mut bus, 0x062, 32); // BMOD = 4*dy
    poke(&mut bus, 0x060, 2); // CMOD: row pitch
    poke(&mut bus, 0x048, 0x0005); // line bitmap at $50000
    poke(&mut bus, 0x04A, 0x0000);
    poke(&mut bus, 0x054, 0x0005);
    poke(&mut bus, 0x056, 0x0000);
    poke(&mut bus, 0x058, (length << 6) | 2);

    run_blit(&mut bus);

    // Every row of the bitmap got exactly one dot, marching rightwards
    let mut dots = 0;
    for row in 0..length as u32 {
        let word = bus.memory.read_chip16(0x5_0000 + row * 2);
        assert_eq!(word.count_ones(), 1, "row {}", row);
        dots += 1;
    }
    assert_eq!(dots, length as u32);
}

#[test]
fn copper_wait_then_move() {
    let (mut bus, _queue) = chipset(BlitterAccuracy::Accurate);

    // Copper list at $10000: WAIT (v=100, h=0, mask 0xFFFE) then
    // MOVE BPLCON0, 0x0200
    bus.memory.write_chip16(0x1_0000, (100 << 8) | 0x01);
    bus.memory.write_chip16(0x1_0002, 0xFFFE);
    bus.memory.write_chip16(0x1_0004, 0x0100);
    bus.memory.write_chip16(0x1_0006, 0x0200);

    poke(&mut bus, 0x080, 0x0001); // COP1LCH
    poke(&mut bus, 0x082, 0x0000);
    poke(&mut bus, 0x096, 0x8000 | 0x0200 | 0x0080); // DMAEN | COPEN
    poke(&mut bus, 0x088, 0); // COPJMP1

    // Run until the register changes, recording where that happened
    let mut set_at = None;
    for _ in 0..400 * 227 {
        bus.execute_hpos();
        if bus.denise.bplcon0 == 0x0200 {
            set_at = Some((bus.agnus.pos.v, bus.agnus.pos.h));
            break;
        }
    }

    let (v, h) = set_at.expect("Copper never performed the MOVE");
    assert_eq!(v, 100, "MOVE landed on the wrong line (h = {})", h);
    // Two fetches on odd free slots plus the pipeline slot
    assert!(h <= 16, "MOVE landed too late in the line: h = {}", h);
}

#[test]
fn copper_skip_suppresses_next_move() {
    let (mut bus, _queue) = chipset(BlitterAccuracy::Accurate);

    // SKIP (v=0, h=0) - always satisfied - then MOVE COLOR00, then a
    // second MOVE that must execute.
    bus.memory.write_chip16(0x1_0000, 0x0001);
    bus.memory.write_chip16(0x1_0002, 0xFFFF); // SKIP
    bus.memory.write_chip16(0x1_0004, 0x0180);
    bus.memory.write_chip16(0x1_0006, 0x0F00); // skipped
    bus.memory.write_chip16(0x1_0008, 0x0182);
    bus.memory.write_chip16(0x1_000A, 0x00F0); // executes

    poke(&mut bus, 0x080, 0x0001);
    poke(&mut bus, 0x082, 0x0000);
    poke(&mut bus, 0x096, 0x8000 | 0x0200 | 0x0080);
    poke(&mut bus, 0x088, 0);

    // Run a couple of lines so the color log replays
    for _ in 0..3 * 227 {
        bus.execute_hpos();
    }

    assert_eq!(bus.denise.pixel_engine.color(0), 0x0000); // skipped MOVE
    assert_eq!(bus.denise.pixel_engine.color(1), 0x00F0);
}

#[test]
fn blitter_denies_cpu_only_with_nasty_bit() {
    // With BLTPRI set the CPU starves while a blit runs; without it the
    // arbiter hands the CPU every fourth slot.
    for (bltpri, expect_stall) in [(true, true), (false, false)] {
        let (mut bus, _queue) = chipset(BlitterAccuracy::Accurate);

        let dmacon = 0x8000 | 0x0200 | 0x0040 | if bltpri { DMACON_BLTPRI } else { 0 };
        poke(&mut bus, 0x096, dmacon);
        poke(&mut bus, 0x040, 0x0BFA);
        poke(&mut bus, 0x042, 0x0000);
        poke(&mut bus, 0x044, 0xFFFF);
        poke(&mut bus, 0x046, 0xFFFF);
        poke(&mut bus, 0x050, 0x0002);
        poke(&mut bus, 0x052, 0x0000);
        poke(&mut bus, 0x048, 0x0003);
        poke(&mut bus, 0x04A, 0x0000);
        poke(&mut bus, 0x054, 0x0004);
        poke(&mut bus, 0x056, 0x0000);
        poke(&mut bus, 0x058, (32 << 6) | 16); // a long blit

        // A burst of chip Ram accesses while the blit is running. The
        // blitter's own idle slots can serve at most one of them.
        let before = bus.agnus.clock;
        for _ in 0..4 {
            let _ = bus.cpu_read16(0x0_1000);
        }
        let elapsed = bus.agnus.clock - before;

        if expect_stall {
            assert!(elapsed > 200, "CPU should starve under BLTPRI, took {}", elapsed);
        } else {
            assert!(elapsed <= 80, "CPU waited too long without BLTPRI: {}", elapsed);
        }
    }
}
