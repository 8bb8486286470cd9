//! A fabricated machine for exercising the engine without real hardware.
//!
//! The video BIOS answers two VBE functions at C000:0100:
//!
//! - 0x4F00 fills the Info Block at ES:DI from a template, puts the mode
//!   list and OEM string inside the block and leaves the vendor name and
//!   product revision pointing into ROM.
//! - 0x4F01 copies a 1024x768x32 Mode Info Block to ES:DI.
//!
//! Anything else returns AX = 0x014F.

use v86_cpu::{CpuState, EmulatorBackend, PortIo};
use v86_mem::{MemoryRegion, RealModeAddress, RegionKind, RegionMap};

use crate::{Engine, Task, TaskFlags};

pub const ROM_BASE: u32 = 0xC0000;
pub const HANDLER_OFFSET: usize = 0x100;

pub const VENDOR_NAME: &str = "Acme Video";
pub const PRODUCT_REV: &str = "Rev 1";
pub const OEM_STRING: &str = "Fabricated OEM";
pub const MODES: [u16; 3] = [0x0101, 0x0112, 0x0118];

/// Interrupt 0x10 handler; see the module docs.
#[rustfmt::skip]
const HANDLER: &[u8] = &[
    0x3D, 0x00, 0x4F,             // cmp ax, 0x4f00
    0x75, 0x44,                   // jne function_01
    0x1E, 0x56, 0x57, 0x51,       // push ds / si / di / cx
    0x0E, 0x1F,                   // push cs ; pop ds
    0xBE, 0x00, 0x02,             // mov si, template
    0xB9, 0x22, 0x00,             // mov cx, 34
    0xFC,                         // cld
    0xF3, 0xA4,                   // rep movsb
    0xBE, 0x30, 0x02,             // mov si, modes
    0xB9, 0x08, 0x00,             // mov cx, 8
    0xF3, 0xA4,                   // rep movsb
    0x59, 0x5F,                   // pop cx ; pop di
    0x8D, 0x45, 0x22,             // lea ax, [di+0x22]
    0x26, 0x89, 0x45, 0x0E,       // mov es:[di+0x0e], ax
    0x26, 0x8C, 0x45, 0x10,       // mov es:[di+0x10], es
    0x57,                         // push di
    0x81, 0xC7, 0x00, 0x01,       // add di, 0x100
    0xBE, 0x40, 0x02,             // mov si, oem
    0xB9, 0x10, 0x00,             // mov cx, 16
    0xF3, 0xA4,                   // rep movsb
    0x5F,                         // pop di
    0x8D, 0x85, 0x00, 0x01,       // lea ax, [di+0x100]
    0x26, 0x89, 0x45, 0x06,       // mov es:[di+6], ax
    0x26, 0x8C, 0x45, 0x08,       // mov es:[di+8], es
    0x5E, 0x1F,                   // pop si ; pop ds
    0xB8, 0x4F, 0x00,             // mov ax, 0x004f
    0xCF,                         // iret
    // function_01:
    0x3D, 0x01, 0x4F,             // cmp ax, 0x4f01
    0x75, 0x17,                   // jne fail
    0x1E, 0x56, 0x51, 0x57,       // push ds / si / cx / di
    0x0E, 0x1F,                   // push cs ; pop ds
    0xBE, 0x80, 0x02,             // mov si, mode_info
    0xB9, 0x00, 0x01,             // mov cx, 256
    0xFC,                         // cld
    0xF3, 0xA4,                   // rep movsb
    0x5F, 0x59, 0x5E, 0x1F,       // pop di / cx / si / ds
    0xB8, 0x4F, 0x00,             // mov ax, 0x004f
    0xCF,                         // iret
    // fail:
    0xB8, 0x4F, 0x01,             // mov ax, 0x014f
    0xCF,                         // iret
];

fn video_rom() -> Vec<u8> {
    let mut rom = vec![0u8; 0x1000];
    rom[0] = 0x55;
    rom[1] = 0xAA;
    rom[2] = 8;
    rom[HANDLER_OFFSET..HANDLER_OFFSET + HANDLER.len()].copy_from_slice(HANDLER);

    let template = &mut rom[0x200..0x222];
    template[0..4].copy_from_slice(b"VESA");
    template[4..6].copy_from_slice(&0x0300u16.to_le_bytes());
    template[18..20].copy_from_slice(&0x0100u16.to_le_bytes());
    template[20..22].copy_from_slice(&0x0001u16.to_le_bytes());
    template[22..26].copy_from_slice(&0xC000_0260u32.to_le_bytes());
    template[30..34].copy_from_slice(&0xC000_0270u32.to_le_bytes());

    for (i, mode) in MODES.iter().chain(&[0xFFFF]).enumerate() {
        rom[0x230 + i * 2..0x232 + i * 2].copy_from_slice(&mode.to_le_bytes());
    }
    rom[0x240..0x240 + OEM_STRING.len()].copy_from_slice(OEM_STRING.as_bytes());
    rom[0x260..0x260 + VENDOR_NAME.len()].copy_from_slice(VENDOR_NAME.as_bytes());
    rom[0x270..0x270 + PRODUCT_REV.len()].copy_from_slice(PRODUCT_REV.as_bytes());

    let mode_info = &mut rom[0x280..0x380];
    mode_info[0..2].copy_from_slice(&0x009Bu16.to_le_bytes());
    mode_info[16..18].copy_from_slice(&4096u16.to_le_bytes());
    mode_info[18..20].copy_from_slice(&1024u16.to_le_bytes());
    mode_info[20..22].copy_from_slice(&768u16.to_le_bytes());
    mode_info[25] = 32;
    mode_info[27] = 6;
    mode_info[40..44].copy_from_slice(&0xE000_0000u32.to_le_bytes());
    rom
}

/// IVT, scratch pool and video ROM; nothing else is mapped.
pub fn fabricated_memory() -> RegionMap {
    let mut ivt = vec![0u8; 0x1000];
    let vector = (ROM_BASE << 12) | HANDLER_OFFSET as u32;
    ivt[0x40..0x44].copy_from_slice(&vector.to_le_bytes());

    RegionMap::default()
        .with(MemoryRegion::with_contents(RegionKind::IvtBda, RealModeAddress::ZERO, ivt))
        .expect("IVT region")
        .with(MemoryRegion::zeroed(
            RegionKind::Scratch,
            RealModeAddress::new(0x10000).expect("scratch base"),
            0x20000,
        ))
        .expect("scratch region")
        .with(MemoryRegion::with_contents(
            RegionKind::VideoBios,
            RealModeAddress::new(ROM_BASE).expect("ROM base"),
            video_rom(),
        ))
        .expect("video BIOS region")
}

/// Port I/O that reads all-ones and discards writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPorts;

impl PortIo for NullPorts {
    fn inb(&mut self, _port: u16) -> u8 {
        0xFF
    }

    fn inw(&mut self, _port: u16) -> u16 {
        0xFFFF
    }

    fn inl(&mut self, _port: u16) -> u32 {
        0xFFFF_FFFF
    }

    fn outb(&mut self, _port: u16, _value: u8) {}

    fn outw(&mut self, _port: u16, _value: u16) {}

    fn outl(&mut self, _port: u16, _value: u32) {}
}

pub fn fabricated_engine() -> Engine<EmulatorBackend<NullPorts>> {
    Engine::new(EmulatorBackend::new(fabricated_memory(), NullPorts).expect("emulator backend"))
}

/// A 0x4F00 task with a "VBE2"-seeded buffer of `len` bytes.
pub fn info_block_task(len: usize) -> Task {
    let mut buf = vec![0u8; len];
    buf[..4].copy_from_slice(b"VBE2");
    Task::new(
        TaskFlags::VBE_INFO_BLOCK,
        CpuState {
            eax: 0x4F00,
            ..Default::default()
        },
        buf,
    )
}
