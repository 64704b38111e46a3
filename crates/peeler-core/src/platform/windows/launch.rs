//! Process creation under the debugger.
//!
//! EXE targets are started directly. DLL targets cannot run on their own, so
//! they are hosted by the system `rundll32.exe` of the matching bitness; the
//! protected module is then the DLL whose load event matches the target path.

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tracing::debug;
use windows_sys::Win32::System::SystemInformation::{GetSystemDirectoryW, GetSystemWow64DirectoryW};
use windows_sys::Win32::System::Threading::{
    CreateProcessW, CREATE_NEW_CONSOLE, DEBUG_ONLY_THIS_PROCESS, PROCESS_INFORMATION, STARTUPINFOW,
};

use super::guards::OwnedHandle;
use crate::controller::LaunchTarget;
use crate::error::{Result, UnpackError};
use crate::pe::TargetKind;
use crate::types::Architecture;

/// Handles and ids of a freshly created debuggee
#[derive(Debug)]
pub(super) struct Spawned
{
    pub process: OwnedHandle,
    pub pid: u32,
    pub tid: u32,
}

/// Executable and command line that start `target`.
pub(super) fn command_for(target: &LaunchTarget) -> Result<(PathBuf, String)>
{
    match target.kind {
        TargetKind::Exe => {
            let mut line = quote(&target.path.to_string_lossy());
            for arg in &target.args {
                line.push(' ');
                line.push_str(&quote(arg));
            }
            Ok((target.path.clone(), line))
        }
        TargetKind::Dll => {
            let host = system_directory(target.architecture)?.join("rundll32.exe");
            let export = target.args.first().map_or("DllMain", String::as_str);
            let line = format!(
                "{} {},{export}",
                quote(&host.to_string_lossy()),
                quote(&target.path.to_string_lossy())
            );
            Ok((host, line))
        }
    }
}

/// Start `target` with `DEBUG_ONLY_THIS_PROCESS`.
pub(super) fn spawn(target: &LaunchTarget) -> Result<Spawned>
{
    let (program, line) = command_for(target)?;
    debug!("Starting {line}");
    let application = wide(program.as_os_str());
    let mut command_line = wide(OsStr::new(&line));
    let directory = target.path.parent().filter(|dir| !dir.as_os_str().is_empty()).map(|dir| wide(dir.as_os_str()));

    let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
    startup.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
    let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

    let created = unsafe {
        CreateProcessW(
            application.as_ptr(),
            command_line.as_mut_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            0,
            DEBUG_ONLY_THIS_PROCESS | CREATE_NEW_CONSOLE,
            std::ptr::null(),
            directory.as_ref().map_or(std::ptr::null(), |dir| dir.as_ptr()),
            &startup,
            &mut info,
        )
    };
    if created == 0 {
        return Err(UnpackError::Launch(format!(
            "CreateProcessW failed for {}: {}",
            program.display(),
            std::io::Error::last_os_error()
        )));
    }
    // The debug events carry their own thread handles.
    drop(OwnedHandle::new(info.hThread));
    let process = OwnedHandle::new(info.hProcess)
        .ok_or_else(|| UnpackError::Launch("CreateProcessW returned no process handle".to_string()))?;
    Ok(Spawned {
        process,
        pid: info.dwProcessId,
        tid: info.dwThreadId,
    })
}

/// `System32` for native targets, `SysWOW64` for 32-bit ones.
fn system_directory(arch: Architecture) -> Result<PathBuf>
{
    let mut buffer = [0u16; 260];
    let len = unsafe {
        match arch {
            Architecture::X86 => GetSystemWow64DirectoryW(buffer.as_mut_ptr(), buffer.len() as u32),
            Architecture::X86_64 => GetSystemDirectoryW(buffer.as_mut_ptr(), buffer.len() as u32),
        }
    } as usize;
    if len == 0 || len > buffer.len() {
        return Err(UnpackError::last_os_error("GetSystemDirectoryW"));
    }
    Ok(PathBuf::from(String::from_utf16_lossy(&buffer[..len])))
}

/// NUL-terminated UTF-16.
pub(super) fn wide(value: &OsStr) -> Vec<u16>
{
    value.encode_wide().chain(std::iter::once(0)).collect()
}

/// Quote one argument following the `CommandLineToArgvW` rules.
fn quote(arg: &str) -> String
{
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0;
    for ch in arg.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
                continue;
            }
            _ => {}
        }
        if ch != '\\' {
            quoted.extend(std::iter::repeat('\\').take(backslashes));
            backslashes = 0;
            quoted.push(ch);
        }
    }
    quoted.extend(std::iter::repeat('\\').take(backslashes * 2));
    quoted.push('"');
    quoted
}

/// Lower-cased file name of a path, as used for module matching.
pub(super) fn file_name(path: &Path) -> String
{
    path.file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_quote_plain_and_spaced()
    {
        assert_eq!(quote("app.exe"), "app.exe");
        assert_eq!(quote("C:\\Program Files\\app.exe"), "\"C:\\Program Files\\app.exe\"");
        assert_eq!(quote(""), "\"\"");
    }

    #[test]
    fn test_quote_escapes_quotes_and_trailing_backslashes()
    {
        assert_eq!(quote("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote("dir with space\\"), "\"dir with space\\\\\"");
    }

    #[test]
    fn test_exe_command_line()
    {
        let target = LaunchTarget {
            path: PathBuf::from("C:\\work\\app.exe"),
            args: vec!["--mode".to_string(), "two words".to_string()],
            kind: TargetKind::Exe,
            architecture: Architecture::X86,
        };
        let (program, line) = command_for(&target).unwrap();
        assert_eq!(program, PathBuf::from("C:\\work\\app.exe"));
        assert_eq!(line, "C:\\work\\app.exe --mode \"two words\"");
    }
}
