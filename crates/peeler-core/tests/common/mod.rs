//! Shared fixtures: a minimal PE writer and a scripted protected 32-bit executable.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use iced_x86::code_asm::*;
use peeler_core::controller::{DebugSession, LaunchTarget, ProcessController};
use peeler_core::events::DebugEvent;
use peeler_core::oep::{trace_to_oep, OepDetector, TraceOutcome};
use peeler_core::pe::{
    self, BinaryFormat, TargetKind, IMAGE_FILE_DLL, IMAGE_SCN_CNT_CODE, IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_EXECUTE, IMAGE_SCN_MEM_READ,
    IMAGE_SCN_MEM_WRITE,
};
use peeler_core::profile::{table, ProtectorProfile, ProtectorVersion};
use peeler_core::replay::{ReplayController, ReplayStep, ScriptedEvent};
use peeler_core::types::{Address, Architecture, ModuleInfo, ProcessId, Protection, RegionKind, Registers, ThreadId};

pub const CODE: u32 = IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ;
pub const DATA: u32 = IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE;
pub const RDATA: u32 = IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ;
pub const PACKED: u32 = IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE;

const NT_OFFSET: usize = 0x80;
const HEADERS_SIZE: u32 = 0x1000;

struct Section
{
    name: &'static str,
    rva: u32,
    size: u32,
    characteristics: u32,
    data: Vec<u8>,
}

struct ExportSpec
{
    rva: u32,
    module: String,
    functions: Vec<(String, u32)>,
}

/// Writes PE images whose raw offsets equal their RVAs, so the same bytes
/// serve as the file and as the mapped image.
pub struct PeBuilder
{
    architecture: Architecture,
    image_base: u64,
    dll: bool,
    entry_rva: u32,
    sections: Vec<Section>,
    exports: Option<ExportSpec>,
}

impl PeBuilder
{
    pub fn new(architecture: Architecture, image_base: u64) -> Self
    {
        Self {
            architecture,
            image_base,
            dll: false,
            entry_rva: 0,
            sections: Vec::new(),
            exports: None,
        }
    }

    pub fn dll(mut self) -> Self
    {
        self.dll = true;
        self
    }

    pub fn entry(mut self, rva: u32) -> Self
    {
        self.entry_rva = rva;
        self
    }

    pub fn section(mut self, name: &'static str, rva: u32, size: u32, characteristics: u32, data: &[u8]) -> Self
    {
        self.sections.push(Section {
            name,
            rva,
            size,
            characteristics,
            data: data.to_vec(),
        });
        self
    }

    /// Export directory at `rva` (inside one of the sections) for `functions` as `(name, rva)`.
    pub fn exports(mut self, rva: u32, module: &str, functions: &[(&str, u32)]) -> Self
    {
        self.exports = Some(ExportSpec {
            rva,
            module: module.to_string(),
            functions: functions.iter().map(|(name, rva)| ((*name).to_string(), *rva)).collect(),
        });
        self
    }

    pub fn build(self) -> Vec<u8>
    {
        let pe64 = self.architecture == Architecture::X86_64;
        let end = self
            .sections
            .iter()
            .map(|s| s.rva + s.size)
            .max()
            .unwrap_or(HEADERS_SIZE);
        let size_of_image = pe::align_up(u64::from(end), 0x1000) as usize;
        let mut image = vec![0u8; size_of_image];

        image[0..2].copy_from_slice(b"MZ");
        pe::put_u32(&mut image, 0x3c, NT_OFFSET as u32);
        image[NT_OFFSET..NT_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let file_header = NT_OFFSET + 4;
        let (machine, optional_size, directories) = if pe64 { (0x8664u16, 0xf0u16, 112) } else { (0x14c, 0xe0, 96) };
        let mut characteristics: u16 = if pe64 { 0x0022 } else { 0x0102 };
        if self.dll {
            characteristics |= IMAGE_FILE_DLL;
        }
        pe::put_u16(&mut image, file_header, machine);
        pe::put_u16(&mut image, file_header + 2, self.sections.len() as u16);
        pe::put_u16(&mut image, file_header + 16, optional_size);
        pe::put_u16(&mut image, file_header + 18, characteristics);

        let optional = file_header + 20;
        pe::put_u16(&mut image, optional, if pe64 { 0x20b } else { 0x10b });
        pe::put_u32(&mut image, optional + 16, self.entry_rva);
        if pe64 {
            pe::put_u64(&mut image, optional + 24, self.image_base);
        } else {
            pe::put_u32(&mut image, optional + 28, self.image_base as u32);
        }
        pe::put_u32(&mut image, optional + 32, 0x1000);
        pe::put_u32(&mut image, optional + 36, 0x1000);
        pe::put_u16(&mut image, optional + 40, 6);
        pe::put_u16(&mut image, optional + 48, 6);
        pe::put_u32(&mut image, optional + 56, size_of_image as u32);
        pe::put_u32(&mut image, optional + 60, HEADERS_SIZE);
        pe::put_u16(&mut image, optional + 68, if self.dll { 2 } else { 3 });
        pe::put_u32(&mut image, optional + directories - 4, 16);

        let table = optional + usize::from(optional_size);
        for (index, section) in self.sections.iter().enumerate() {
            let header = table + index * pe::SECTION_HEADER_SIZE;
            let name = section.name.as_bytes();
            image[header..header + name.len().min(8)].copy_from_slice(&name[..name.len().min(8)]);
            pe::put_u32(&mut image, header + 8, section.size);
            pe::put_u32(&mut image, header + 12, section.rva);
            pe::put_u32(&mut image, header + 16, section.size);
            pe::put_u32(&mut image, header + 20, section.rva);
            pe::put_u32(&mut image, header + 36, section.characteristics);

            let start = section.rva as usize;
            let len = section.data.len().min(section.size as usize);
            image[start..start + len].copy_from_slice(&section.data[..len]);
        }

        if let Some(spec) = &self.exports {
            let directory = export_directory(spec);
            let start = spec.rva as usize;
            image[start..start + directory.len()].copy_from_slice(&directory);
            let entry = optional + directories + pe::directory::EXPORT * pe::DATA_DIRECTORY_SIZE;
            pe::put_u32(&mut image, entry, spec.rva);
            pe::put_u32(&mut image, entry + 4, directory.len() as u32);
        }
        image
    }
}

fn export_directory(spec: &ExportSpec) -> Vec<u8>
{
    let count = spec.functions.len();
    let functions = 40;
    let names = functions + 4 * count;
    let ordinals = names + 4 * count;
    let strings = ordinals + 2 * count;

    let mut bytes = vec![0u8; strings];
    let rva = |offset: usize| spec.rva + offset as u32;

    let module_name = bytes.len();
    bytes.extend_from_slice(spec.module.as_bytes());
    bytes.push(0);

    // The name table is sorted; the address table keeps declaration order.
    let mut sorted: Vec<(usize, &str)> = spec
        .functions
        .iter()
        .enumerate()
        .map(|(index, (name, _))| (index, name.as_str()))
        .collect();
    sorted.sort_by(|a, b| a.1.cmp(b.1));
    let mut name_offsets = Vec::with_capacity(count);
    for (_, name) in &sorted {
        name_offsets.push(bytes.len());
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
    }

    pe::put_u32(&mut bytes, 12, rva(module_name));
    pe::put_u32(&mut bytes, 16, 1);
    pe::put_u32(&mut bytes, 20, count as u32);
    pe::put_u32(&mut bytes, 24, count as u32);
    pe::put_u32(&mut bytes, 28, rva(functions));
    pe::put_u32(&mut bytes, 32, rva(names));
    pe::put_u32(&mut bytes, 36, rva(ordinals));
    for (index, (_, function_rva)) in spec.functions.iter().enumerate() {
        pe::put_u32(&mut bytes, functions + 4 * index, *function_rva);
    }
    for (slot, ((index, _), offset)) in sorted.iter().zip(&name_offsets).enumerate() {
        pe::put_u32(&mut bytes, names + 4 * slot, rva(*offset));
        pe::put_u16(&mut bytes, ordinals + 2 * slot, *index as u16);
    }
    bytes
}

pub const BASE: u64 = 0x0040_0000;
pub const IMAGE_SIZE: u64 = 0x5000;
pub const OEP_RVA: u32 = 0x1000;
pub const OEP: u64 = BASE + OEP_RVA as u64;
pub const IAT: u64 = BASE + 0x2000;
pub const ENTRY: u64 = BASE + 0x3000;
pub const THEMIDA_STUB: u64 = BASE + 0x3100;
pub const PRIVATE: u64 = 0x0060_0000;
pub const KERNEL32: u64 = 0x7600_0000;
pub const USER32: u64 = 0x7700_0000;
pub const ENTRY_SP: u64 = 0x0019_ff80;
pub const MAIN_THREAD: ThreadId = ThreadId(0x1a4);

pub const KERNEL32_EXPORTS: &[&str] = &[
    "GetModuleHandleA",
    "GetProcAddress",
    "CreateFileW",
    "ReadFile",
    "CloseHandle",
    "ExitProcess",
    "IsDebuggerPresent",
];
pub const USER32_EXPORTS: &[&str] = &["MessageBoxW", "GetDC", "ReleaseDC", "ShowWindow"];

/// `mov eax, 0; pushad; or eax, eax; je` followed by filler.
const V2_ENTRY: &[u8] = &[0xB8, 0x00, 0x00, 0x00, 0x00, 0x60, 0x0B, 0xC0, 0x74, 0x02, 0x90, 0x90, 0x61, 0xC3];

const KEY: u32 = 0x5a5a_1234;

/// Address of an export of the scripted system DLLs.
pub fn api(module: &str, name: &str) -> u64
{
    let (base, names) = match module {
        "kernel32.dll" => (KERNEL32, KERNEL32_EXPORTS),
        "user32.dll" => (USER32, USER32_EXPORTS),
        _ => panic!("unknown module {module}"),
    };
    let index = names.iter().position(|n| *n == name).unwrap();
    base + 0x1000 + 0x10 * index as u64
}

/// A system DLL with `names` exported from its `.text` section.
pub fn system_dll(name: &str, base: u64, names: &[&str]) -> Vec<u8>
{
    let functions: Vec<(&str, u32)> = names
        .iter()
        .enumerate()
        .map(|(index, name)| (*name, 0x1000 + 0x10 * index as u32))
        .collect();
    // Every function body is `mov edi, edi; ret`.
    let mut text = vec![0xCC; 0x1000];
    for (_, rva) in &functions {
        let at = (*rva - 0x1000) as usize;
        text[at..at + 3].copy_from_slice(&[0x8B, 0xFF, 0xC3]);
    }
    PeBuilder::new(Architecture::X86, base)
        .dll()
        .entry(0x1000)
        .section(".text", 0x1000, 0x1000, CODE, &text)
        .section(".edata", 0x2000, 0x1000, RDATA, &[])
        .exports(0x2000, name, &functions)
        .build()
}

/// The slots of the protected import table and the API each resolves to.
pub fn expected_imports() -> Vec<(u64, &'static str, &'static str)>
{
    let mut slots = Vec::new();
    for (index, name) in KERNEL32_EXPORTS[..6].iter().enumerate() {
        slots.push((IAT + 4 * index as u64, "kernel32.dll", *name));
    }
    // One null slot separates the modules.
    for (index, name) in USER32_EXPORTS.iter().enumerate() {
        slots.push((IAT + 0x1c + 4 * index as u64, "user32.dll", *name));
    }
    slots
}

/// Protector-written slot values: raw exports, a stub in `.themida`, and
/// private stubs that need emulation.
pub fn iat_values() -> Vec<u8>
{
    let values = [
        api("kernel32.dll", "GetModuleHandleA"),
        api("kernel32.dll", "GetProcAddress"),
        THEMIDA_STUB,
        PRIVATE,
        PRIVATE + 0x40,
        api("kernel32.dll", "ExitProcess"),
        0,
        api("user32.dll", "MessageBoxW"),
        PRIVATE + 0x80,
        api("user32.dll", "ReleaseDC"),
        PRIVATE + 0xc0,
        0,
    ];
    values.iter().flat_map(|value| (*value as u32).to_le_bytes()).collect()
}

/// Original code at the OEP: a frame, one `call [slot]` per import, return.
pub fn oep_code() -> Vec<u8>
{
    let mut code = vec![0x55, 0x8B, 0xEC];
    for (slot, _, _) in expected_imports() {
        code.extend_from_slice(&[0xFF, 0x15]);
        code.extend_from_slice(&(slot as u32).to_le_bytes());
    }
    code.extend_from_slice(&[0x33, 0xC0, 0x5D, 0xC3]);
    code
}

/// Import wrappers in the protector's private allocation.
pub fn private_stubs() -> Vec<u8>
{
    let mut page = vec![0xCC; 0x1000];

    let mut a = CodeAssembler::new(32).unwrap();
    a.mov(eax, (api("kernel32.dll", "ReadFile") as u32) ^ KEY).unwrap();
    a.xor(eax, 0x5a5a_1234).unwrap();
    a.jmp(eax).unwrap();
    place(&mut page, 0x00, &a.assemble(PRIVATE).unwrap());

    // push-xor-ret
    let mut wrapper = vec![0x68];
    wrapper.extend_from_slice(&((api("kernel32.dll", "CloseHandle") as u32) ^ KEY).to_le_bytes());
    wrapper.extend_from_slice(&[0x81, 0x34, 0x24]);
    wrapper.extend_from_slice(&KEY.to_le_bytes());
    wrapper.push(0xC3);
    place(&mut page, 0x40, &wrapper);

    let mut a = CodeAssembler::new(32).unwrap();
    a.push(ebx).unwrap();
    a.mov(ebx, (api("user32.dll", "GetDC") as u32) ^ KEY).unwrap();
    a.xor(ebx, 0x5a5a_1234).unwrap();
    a.xchg(dword_ptr(esp), ebx).unwrap();
    a.ret().unwrap();
    place(&mut page, 0x80, &a.assemble(PRIVATE + 0x80).unwrap());

    let mut a = CodeAssembler::new(32).unwrap();
    a.nop().unwrap();
    a.nop().unwrap();
    a.jmp(api("user32.dll", "ShowWindow")).unwrap();
    place(&mut page, 0xc0, &a.assemble(PRIVATE + 0xc0).unwrap());

    page
}

fn place(page: &mut [u8], offset: usize, bytes: &[u8])
{
    page[offset..offset + bytes.len()].copy_from_slice(bytes);
}

/// The protected executable as it is on disk (and as first mapped).
pub fn protected_exe() -> Vec<u8>
{
    let mut themida = V2_ENTRY.to_vec();
    themida.resize(0x100, 0x90);
    // push CreateFileW; ret
    themida.push(0x68);
    themida.extend_from_slice(&(api("kernel32.dll", "CreateFileW") as u32).to_le_bytes());
    themida.push(0xC3);

    PeBuilder::new(Architecture::X86, BASE)
        .entry(0x3000)
        .section(".text", 0x1000, 0x1000, CODE, &[])
        .section(".rdata", 0x2000, 0x1000, DATA, &[])
        .section(".themida", 0x3000, 0x2000, PACKED, &themida)
        .build()
}

/// Parts of a scripted run, so tests can rearrange them.
pub struct Scenario
{
    pub file: Vec<u8>,
    pub session: DebugSession,
}

impl Scenario
{
    pub fn new() -> Self
    {
        Self {
            file: protected_exe(),
            session: DebugSession::new(ProcessId(0x1f40), MAIN_THREAD, Architecture::X86),
        }
    }

    /// Controller with every region mapped and no script.
    pub fn controller(&self) -> ReplayController
    {
        let image = &self.file;
        ReplayController::new(self.session.clone())
            .with_region(Address::new(BASE), &image[..0x1000], Protection::READ, RegionKind::Image)
            .with_region(
                Address::new(BASE + 0x1000),
                &image[0x1000..0x2000],
                Protection::READ_EXECUTE,
                RegionKind::Image,
            )
            .with_region(
                Address::new(BASE + 0x2000),
                &image[0x2000..0x3000],
                Protection::READ_WRITE,
                RegionKind::Image,
            )
            .with_region(Address::new(BASE + 0x3000), &image[0x3000..0x5000], Protection::ALL, RegionKind::Image)
            .with_region(
                Address::new(KERNEL32),
                &system_dll("kernel32.dll", KERNEL32, KERNEL32_EXPORTS),
                Protection::READ_EXECUTE,
                RegionKind::Image,
            )
            .with_region(
                Address::new(USER32),
                &system_dll("user32.dll", USER32, USER32_EXPORTS),
                Protection::READ_EXECUTE,
                RegionKind::Image,
            )
            .with_region(Address::new(PRIVATE), &private_stubs(), Protection::READ_EXECUTE, RegionKind::Private)
    }

    /// Process creation, DLL loads and the protector entry breakpoint.
    pub fn startup(&self) -> Vec<ScriptedEvent>
    {
        vec![
            ScriptedEvent::new(DebugEvent::ProcessCreated {
                main_thread: MAIN_THREAD,
                image_base: Address::new(BASE),
                entry: Address::new(ENTRY),
            }),
            ScriptedEvent::new(DebugEvent::ModuleLoaded {
                module: ModuleInfo::new("kernel32.dll", Address::new(KERNEL32), 0x3000),
            })
            .after(Duration::from_millis(5)),
            ScriptedEvent::new(DebugEvent::ModuleLoaded {
                module: ModuleInfo::new("user32.dll", Address::new(USER32), 0x3000),
            })
            .after(Duration::from_millis(5)),
            ScriptedEvent::new(DebugEvent::Breakpoint {
                thread: MAIN_THREAD,
                address: Address::new(ENTRY),
            })
            .with_registers(Registers::at(Address::new(ENTRY), Address::new(ENTRY_SP)))
            .after(Duration::from_millis(20)),
        ]
    }

    /// The protector finished unpacking and jumps into the guarded `.text`.
    pub fn reach_oep(&self, stack: u64) -> ScriptedEvent
    {
        ScriptedEvent::new(DebugEvent::GuardPage {
            thread: MAIN_THREAD,
            address: Address::new(OEP),
            fault_address: Address::new(OEP),
        })
        .with_registers(Registers::at(Address::new(OEP), Address::new(stack)))
        .with_write(Address::new(OEP), oep_code())
        .with_write(Address::new(IAT), iat_values())
        .after(Duration::from_millis(400))
    }

    /// A confirmation window that stays in original code.
    pub fn confirmation(&self, steps: usize) -> Vec<ReplayStep>
    {
        (0..steps)
            .map(|index| {
                let pc = OEP + 3 + 6 * index as u64;
                ReplayStep::Step(Registers::at(Address::new(pc), Address::new(ENTRY_SP + 4)))
            })
            .collect()
    }

    /// Startup, OEP hit and a clean confirmation window.
    pub fn full_run(&self) -> ReplayController
    {
        let mut replay = self.controller();
        for event in self.startup() {
            replay = replay.with_event(event);
        }
        replay = replay.with_event(self.reach_oep(ENTRY_SP + 4));
        for step in self.confirmation(6) {
            replay = replay.with_step(step);
        }
        replay
    }
}

/// The record the scripted target is traced with.
pub fn v2_profile() -> ProtectorProfile
{
    table::lookup(ProtectorVersion::V2, Architecture::X86, BinaryFormat::Native, TargetKind::Exe)
        .cloned()
        .unwrap()
}

pub fn launch_target() -> LaunchTarget
{
    LaunchTarget {
        path: PathBuf::from("protected.exe"),
        args: Vec::new(),
        kind: TargetKind::Exe,
        architecture: Architecture::X86,
    }
}

/// Launch and trace a script that is expected to reach the OEP.
pub fn run_to_oep(replay: &mut ReplayController) -> TraceOutcome
{
    let target = launch_target();
    let session = replay.launch(&target).unwrap();
    let mut detector = OepDetector::new(v2_profile(), &target.module_name(), session.peb, None);
    let clock = replay.clock();
    trace_to_oep(replay, &mut detector, &clock).unwrap()
}
