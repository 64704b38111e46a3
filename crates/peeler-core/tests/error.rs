//! Tests for error handling

use std::io;

use peeler_core::error::{Result, UnpackError};

#[test]
fn test_launch_error_display()
{
    let error = UnpackError::Launch("target exited with code 0x1".to_string());
    let message = format!("{}", error);
    assert!(message.contains("Failed to launch"));
    assert!(message.contains("0x1"));
}

#[test]
fn test_oep_not_found_reports_timeout()
{
    let error = UnpackError::OepNotFound { seconds: 15 };
    assert_eq!(error.to_string(), "Original entry point not found within 15s");
}

#[test]
fn test_target_crashed_formats_code_and_address()
{
    let error = UnpackError::TargetCrashed {
        code: 0xC000_0005,
        address: 0x40_1234,
    };
    let message = error.to_string();
    assert!(message.contains("0xc0000005"));
    assert!(message.contains("0x0000000000401234"));
}

#[test]
fn test_memory_helper()
{
    let error = UnpackError::memory(0x7ffe_0000, 16);
    assert!(matches!(
        error,
        UnpackError::MemoryAccess {
            address: 0x7ffe_0000,
            length: 16
        }
    ));
    assert!(error.to_string().contains("16 bytes"));
}

#[test]
fn test_platform_error_keeps_source()
{
    let error = UnpackError::Platform {
        call: "WaitForDebugEvent",
        source: io::Error::new(io::ErrorKind::PermissionDenied, "access denied"),
    };
    assert!(error.to_string().contains("WaitForDebugEvent"));
    let source = std::error::Error::source(&error).unwrap();
    assert!(source.to_string().contains("access denied"));
}

#[test]
fn test_io_error_converts()
{
    fn read_missing() -> Result<Vec<u8>>
    {
        Ok(std::fs::read("/definitely/not/a/protected.exe")?)
    }

    assert!(matches!(read_missing(), Err(UnpackError::Io(_))));
}

#[test]
fn test_result_type()
{
    let _result: Result<()> = Ok(());
    let _error_result: Result<()> = Err(UnpackError::Reconstruction("no PE header".to_string()));
}
