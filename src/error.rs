use std::io;
use thiserror::Error;

/// Host-side failures. None of these ever cross the fabric boundary;
/// guest-visible errors are the numeric TOS codes below or ACSI sense data.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("could not map fabric register window: {0}")]
    FabricMap(io::Error),
    #[error("fabric interrupt file: {0}")]
    Interrupt(io::Error),
    #[error("could not open image file `{path}`: {source}")]
    ImageOpen { path: String, source: io::Error },
    #[error("could not determine the floppy image file format of `{0}`")]
    UnknownImageFormat(String),
    #[error("not a valid compressed image file")]
    BadImageHeader,
    #[error("partial image starting at track {0} is not supported")]
    PartialImage(u16),
    #[error("failed to guess disk geometry")]
    BadGeometry,
    #[error("image i/o: {0}")]
    ImageIo(#[from] io::Error),
    #[error("GEMDOS protocol timed out in {0}")]
    ProtocolTimeout(&'static str),
    #[error("GEMDOS worker is gone")]
    WorkerGone,
}

/* GEMDOS (TOS) error codes, as returned to the guest */
pub const EFILNF: i32 = -33; /* File not found */
pub const EPTHNF: i32 = -34; /* Path not found */
pub const EACCDN: i32 = -36; /* Access denied */
pub const EIHNDL: i32 = -37; /* Invalid handle */
pub const ENSAME: i32 = -48; /* Not the same drive */
pub const ENMFIL: i32 = -49; /* No more files */
pub const EINTRN: i32 = -65; /* Internal error */

/// Map a host errno to the GEMDOS error code reported to the guest.
pub fn tos_error_code(err: &io::Error) -> i32 {
    match err.raw_os_error() {
        Some(libc::ENOENT) => EFILNF,
        Some(libc::ENOTDIR) => EPTHNF,
        Some(libc::EBUSY)
        | Some(libc::EEXIST)
        | Some(libc::EIO)
        | Some(libc::EINVAL)
        | Some(libc::EISDIR)
        | Some(libc::EPERM)
        | Some(libc::EACCES)
        | Some(libc::EROFS) => EACCDN,
        Some(libc::EBADF) => EIHNDL,
        _ => EINTRN,
    }
}
