// The guest-resident driver stub. The first four sectors of the logical
// drive hold a boot image whose loader installs the stub resident and then
// issues the driver-init handshake (tunnel call opcode 0xFFFF), from which
// the host learns the reserved-block address and claims a free drive bit.

/// Boot image served on reads of the logical drive, 4 sectors.
pub static BOOT_IMAGE: &[u8] = include_bytes!("gdboot.img");

/// Sector count of the boot image.
pub const BOOT_SECTORS: u32 = 4;

/// Tunnel call opcode used by the loader for the driver-init handshake.
pub const DRIVER_INIT_OPCODE: u16 = 0xffff;
