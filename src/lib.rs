//! In-place conversion of arm64 device binaries into simulator-loadable ones.
//!
//! A thin arm64 iOS or tvOS executable declares its platform through an
//! `LC_VERSION_MIN_IPHONEOS` or `LC_VERSION_MIN_TVOS` load command; the
//! simulator expects an `LC_BUILD_VERSION` command naming a simulator
//! platform instead. [`convert`] rewrites the former into the latter. The
//! replacement command is 8 bytes larger than the one it replaces, and the
//! difference is taken out of the zeroed padding the linker leaves between
//! the load commands and the first section, so the payload of the binary
//! never moves and every byte outside the command table survives untouched.

pub mod macho;

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use log::{debug, trace};
use scroll::{Pread, Pwrite};
use thiserror::Error;

use crate::macho::*;

/// Everything that can go wrong while converting one binary.
///
/// Every variant is terminal for the invocation. All of them except
/// [`ConversionError::Write`] are raised before the first byte of the target
/// file is touched, so the file on disk is intact whenever one comes back.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The path could not be read.
    #[error("cannot open `{}`", .path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The header magic or CPU type is not the one supported combination.
    #[error("not an arm64 Mach-O binary; try thinning (via lipo) or unarchiving (via ar) first")]
    UnsupportedBinary,
    /// The binary already contains an `LC_BUILD_VERSION` load command.
    #[error("the binary already contains an LC_BUILD_VERSION load command")]
    AlreadyConverted,
    /// A declared count or length does not fit the bytes actually present.
    #[error("malformed Mach-O image: {0}")]
    Malformed(String),
    /// The final overwrite failed; the file may be left truncated.
    #[error("cannot write the patched binary back to `{}`", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<scroll::Error> for ConversionError {
    fn from(err: scroll::Error) -> ConversionError {
        ConversionError::Malformed(err.to_string())
    }
}

/// A load command kept as the raw bytes it occupies on disk.
struct RawCommand {
    cmd: u32,
    bytes: Vec<u8>,
}

/// The load-command table after rewriting.
struct RewrittenTable {
    bytes: Vec<u8>,
    /// How many bytes the table grew by, 8 per substitution.
    growth: usize,
}

/// Converts the binary at `path` in place.
///
/// The whole file is validated and rewritten in memory before the original
/// is overwritten in a single terminal write, so on any error other than
/// [`ConversionError::Write`] the file on disk is untouched. The overwrite
/// is direct rather than write-to-temporary-and-rename, so a fault at that
/// point can leave a truncated file behind. Nothing guards concurrent
/// conversions of the same path; callers needing that must serialize
/// themselves.
pub fn convert<P: AsRef<Path>>(path: P) -> Result<(), ConversionError> {
    let path = path.as_ref();

    let data = fs::read(path).map_err(|source| ConversionError::SourceUnavailable {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("read {} bytes from `{}`", data.len(), path.display());

    let output = patch_image(&data)?;

    fs::write(path, &output).map_err(|source| ConversionError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("wrote {} bytes back to `{}`", output.len(), path.display());
    Ok(())
}

/// Runs the whole rewrite on an in-memory image and returns the new image.
fn patch_image(data: &[u8]) -> Result<Vec<u8>, ConversionError> {
    let header = read_header(data)?;
    let (commands, table_end) = scan_commands(data, header.ncmds)?;
    let table = rewrite_commands(&commands)?;
    let payload = strip_padding(&data[table_end..], table.growth)?;

    let mut header_bytes = data[..SIZEOF_MACH_HEADER_64].to_vec();
    header_bytes.pwrite_with(table.bytes.len() as u32, SIZEOFCMDS_OFFSET, scroll::NATIVE)?;

    let mut output = Vec::with_capacity(SIZEOF_MACH_HEADER_64 + table.bytes.len() + payload.len());
    output.extend_from_slice(&header_bytes);
    output.extend_from_slice(&table.bytes);
    output.extend_from_slice(payload);
    Ok(output)
}

/// Reads and validates the fixed image header.
fn read_header(data: &[u8]) -> Result<MachHeader64, ConversionError> {
    if data.len() < SIZEOF_MACH_HEADER_64 {
        return Err(ConversionError::Malformed(format!(
            "{} bytes is too short for a Mach-O header",
            data.len()
        )));
    }

    let header: MachHeader64 = data.pread_with(0, scroll::NATIVE)?;
    if header.magic != MH_MAGIC_64 || header.cputype != CPU_TYPE_ARM64 {
        trace!("rejecting image: magic {:#x}, cputype {:#x}", header.magic, header.cputype);
        return Err(ConversionError::UnsupportedBinary);
    }

    trace!(
        "image: filetype {}, {} load commands over {} bytes",
        header.filetype, header.ncmds, header.sizeofcmds
    );
    Ok(header)
}

/// Walks the load-command table, keeping every command as raw bytes.
///
/// Commands are self-describing, so each iteration peeks at the fixed
/// prefix for the declared size and only then takes the full command.
/// Returns the commands in table order plus the offset of the first byte
/// after the table.
fn scan_commands(data: &[u8], ncmds: u32) -> Result<(Vec<RawCommand>, usize), ConversionError> {
    let mut commands = Vec::new();
    let mut offset = SIZEOF_MACH_HEADER_64;

    for index in 0..ncmds {
        if offset + SIZEOF_LOAD_COMMAND > data.len() {
            return Err(ConversionError::Malformed(format!(
                "load command {} of {} starts past the end of the file",
                index, ncmds
            )));
        }
        let prefix: LoadCommandHeader = data.pread_with(offset, scroll::NATIVE)?;

        let cmdsize = prefix.cmdsize as usize;
        if cmdsize < SIZEOF_LOAD_COMMAND {
            return Err(ConversionError::Malformed(format!(
                "load command {} declares cmdsize {}, the minimum is {}",
                index, cmdsize, SIZEOF_LOAD_COMMAND
            )));
        }
        let end = match offset.checked_add(cmdsize) {
            Some(end) if end <= data.len() => end,
            _ => {
                return Err(ConversionError::Malformed(format!(
                    "load command {} with cmdsize {} overruns the file",
                    index, cmdsize
                )));
            }
        };

        trace!("load command {}: cmd {:#x}, cmdsize {}", index, prefix.cmd, cmdsize);
        commands.push(RawCommand {
            cmd: prefix.cmd,
            bytes: data[offset..end].to_vec(),
        });
        offset = end;
    }

    Ok((commands, offset))
}

/// Maps the command sequence one to one, substituting every version-min
/// command with a simulator build-version command.
///
/// The command count never changes. Finding an `LC_BUILD_VERSION` command
/// fails the whole conversion before any output exists.
fn rewrite_commands(commands: &[RawCommand]) -> Result<RewrittenTable, ConversionError> {
    let mut bytes = Vec::new();
    let mut growth = 0;

    for command in commands {
        match command.cmd {
            LC_VERSION_MIN_IPHONEOS | LC_VERSION_MIN_TVOS => {
                if command.bytes.len() != SIZEOF_VERSION_MIN_COMMAND {
                    return Err(ConversionError::Malformed(format!(
                        "version-min load command has cmdsize {}, expected {}",
                        command.bytes.len(),
                        SIZEOF_VERSION_MIN_COMMAND
                    )));
                }
                let min: VersionMinCommand = command.bytes.pread_with(0, scroll::NATIVE)?;
                let platform = if command.cmd == LC_VERSION_MIN_IPHONEOS {
                    PLATFORM_IOSSIMULATOR
                } else {
                    PLATFORM_TVOSSIMULATOR
                };
                let build = BuildVersionCommand::new(platform, pack_version(13, 0, 0));
                debug!(
                    "replacing command {:#x} (version {:#x}, sdk {:#x}) with LC_BUILD_VERSION for platform {}",
                    min.cmd, min.version, min.sdk, build.platform
                );

                let mut encoded = [0u8; SIZEOF_BUILD_VERSION_COMMAND];
                encoded.pwrite_with(build, 0, scroll::NATIVE)?;
                bytes.extend_from_slice(&encoded);
                growth += SIZEOF_BUILD_VERSION_COMMAND - SIZEOF_VERSION_MIN_COMMAND;
            }
            LC_BUILD_VERSION => return Err(ConversionError::AlreadyConverted),
            _ => bytes.extend_from_slice(&command.bytes),
        }
    }

    Ok(RewrittenTable { bytes, growth })
}

/// Splits the padding the growing table expands into off the payload.
///
/// The linker zero-pads the space between the command table and the first
/// section, and the rewritten commands grow into exactly that space; if the
/// bytes there are missing or not zero the image cannot be patched without
/// moving its payload.
fn strip_padding(tail: &[u8], growth: usize) -> Result<&[u8], ConversionError> {
    if tail.len() < growth {
        return Err(ConversionError::Malformed(format!(
            "need {} bytes of padding after the load commands, found {}",
            growth,
            tail.len()
        )));
    }

    let (padding, payload) = tail.split_at(growth);
    if padding.iter().any(|&byte| byte != 0) {
        return Err(ConversionError::Malformed(format!(
            "the {} bytes after the load commands are not zero padding",
            growth
        )));
    }
    Ok(payload)
}
