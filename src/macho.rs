//! The slice of the Mach-O layout this tool touches.
//!
//! Everything here is a fixed-size, plain-data record encoded in the byte
//! order of the host, which is also the byte order of a thin arm64 image's
//! header on disk. Records are decoded and encoded explicitly through
//! [`scroll`]; nothing reinterprets raw buffers as structs.

use scroll::{Pread, Pwrite, SizeWith};

/// Magic of a 64-bit Mach-O image in host byte order.
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
/// CPU type of a 64-bit ARM image.
pub const CPU_TYPE_ARM64: i32 = 0x0100000c;

/// Minimum iOS version load command.
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
/// Minimum tvOS version load command.
pub const LC_VERSION_MIN_TVOS: u32 = 0x2f;
/// Unified platform/minos/sdk load command superseding the version-min ones.
pub const LC_BUILD_VERSION: u32 = 0x32;

/// `platform` value of [`BuildVersionCommand`] for the iOS simulator.
pub const PLATFORM_IOSSIMULATOR: u32 = 7;
/// `platform` value of [`BuildVersionCommand`] for the tvOS simulator.
pub const PLATFORM_TVOSSIMULATOR: u32 = 8;

pub const SIZEOF_MACH_HEADER_64: usize = 32;
pub const SIZEOF_LOAD_COMMAND: usize = 8;
pub const SIZEOF_VERSION_MIN_COMMAND: usize = 16;
pub const SIZEOF_BUILD_VERSION_COMMAND: usize = 24;

/// Byte offset of the `sizeofcmds` field inside [`MachHeader64`].
pub const SIZEOFCMDS_OFFSET: usize = 20;

/// Packs an `X.Y.Z` version into the nibble layout xxxx.yy.zz used by every
/// version field below.
pub const fn pack_version(major: u16, minor: u8, patch: u8) -> u32 {
    ((major as u32) << 16) | ((minor as u32) << 8) | patch as u32
}

/// Header of a 64-bit Mach-O image.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct MachHeader64 {
    /// MH_MAGIC_64
    pub magic: u32,
    /// cpu specifier
    pub cputype: i32,
    /// machine specifier
    pub cpusubtype: i32,
    /// type of file
    pub filetype: u32,
    /// number of load commands
    pub ncmds: u32,
    /// size of all load commands in bytes
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

/// Prefix shared by every load command.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct LoadCommandHeader {
    /// type of load command
    pub cmd: u32,
    /// total size of the command in bytes, prefix included
    pub cmdsize: u32,
}

/// The version-min commands name the minimum OS version a device binary was
/// built for, one command type per OS family.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct VersionMinCommand {
    /// LC_VERSION_MIN_IPHONEOS or LC_VERSION_MIN_TVOS
    pub cmd: u32,
    pub cmdsize: u32,
    /// X.Y.Z is encoded in nibbles xxxx.yy.zz
    pub version: u32,
    /// X.Y.Z is encoded in nibbles xxxx.yy.zz
    pub sdk: u32,
}

/// The build-version command carries platform, minimum OS and SDK in one
/// record and may be followed by tool entries.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct BuildVersionCommand {
    /// LC_BUILD_VERSION
    pub cmd: u32,
    pub cmdsize: u32,
    /// platform
    pub platform: u32,
    /// X.Y.Z is encoded in nibbles xxxx.yy.zz
    pub minos: u32,
    /// X.Y.Z is encoded in nibbles xxxx.yy.zz
    pub sdk: u32,
    /// number of tool entries following this
    pub ntools: u32,
}

impl BuildVersionCommand {
    /// Command for `platform` with both `minos` and `sdk` set to `version`
    /// and no trailing tool entries.
    pub fn new(platform: u32, version: u32) -> Self {
        BuildVersionCommand {
            cmd: LC_BUILD_VERSION,
            cmdsize: SIZEOF_BUILD_VERSION_COMMAND as u32,
            platform,
            minos: version,
            sdk: version,
            ntools: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::ctx::SizeWith;

    #[test]
    fn version_packing() {
        assert_eq!(pack_version(13, 0, 0), 0x000d0000);
        assert_eq!(pack_version(16, 4, 1), 0x00100401);
        assert_eq!(pack_version(0, 0, 0), 0);
    }

    #[test]
    fn declared_sizes_match_encoded_sizes() {
        assert_eq!(MachHeader64::size_with(&scroll::NATIVE), SIZEOF_MACH_HEADER_64);
        assert_eq!(LoadCommandHeader::size_with(&scroll::NATIVE), SIZEOF_LOAD_COMMAND);
        assert_eq!(VersionMinCommand::size_with(&scroll::NATIVE), SIZEOF_VERSION_MIN_COMMAND);
        assert_eq!(BuildVersionCommand::size_with(&scroll::NATIVE), SIZEOF_BUILD_VERSION_COMMAND);
    }

    #[test]
    fn build_version_encodes_every_field() {
        let command = BuildVersionCommand::new(PLATFORM_IOSSIMULATOR, pack_version(13, 0, 0));
        let mut bytes = [0u8; SIZEOF_BUILD_VERSION_COMMAND];
        bytes.pwrite_with(command, 0, scroll::NATIVE).unwrap();

        let mut expected = Vec::new();
        for field in [LC_BUILD_VERSION, 24, 7, 0x000d0000, 0x000d0000, 0] {
            expected.extend_from_slice(&field.to_ne_bytes());
        }
        assert_eq!(bytes.as_slice(), expected.as_slice());
    }

    #[test]
    fn header_decodes_from_native_bytes() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MH_MAGIC_64.to_ne_bytes());
        bytes.extend_from_slice(&CPU_TYPE_ARM64.to_ne_bytes());
        for field in [0u32, 2, 5, 104, 0x00200085, 0] {
            bytes.extend_from_slice(&field.to_ne_bytes());
        }

        let header: MachHeader64 = bytes.pread_with(0, scroll::NATIVE).unwrap();
        assert_eq!(header.magic, MH_MAGIC_64);
        assert_eq!(header.cputype, CPU_TYPE_ARM64);
        assert_eq!(header.filetype, 2);
        assert_eq!(header.ncmds, 5);
        assert_eq!(header.sizeofcmds, 104);
        assert_eq!(header.flags, 0x00200085);
    }
}
