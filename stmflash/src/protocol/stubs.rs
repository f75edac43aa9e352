//! Thumb code stubs injected into device RAM.
//!
//! The bootloader's GO command expects a valid vector table at the target
//! address, so each stub is staged behind an 8-byte header: an initial
//! stack pointer and the entry address with bit 0 set for Thumb state
//! (see [`crate::Session::reset_device`]). The stubs themselves are
//! position-independent ARMv6-M code ending in an endless branch; the host
//! never executes them, they are pure data here.

/// Initial stack pointer placed in the staged vector table. Points into
/// SRAM present on every supported part.
pub const STAGING_SP: u32 = 0x2000_2000;

/// System reset via NVIC AIRCR.
///
/// Stores `0x05FA0004` (VECTKEY | SYSRESETREQ) to `0xE000ED0C`. Works on
/// ARMv6-M and ARMv7-M alike; see the AIRCR description in the
/// architecture reference manuals.
pub const RESET: &[u8] = &[
    0x01, 0x49, // ldr   r1, [pc, #4]  ; AIRCR address
    0x02, 0x4A, // ldr   r2, [pc, #8]  ; reset value
    0x0A, 0x60, // str   r2, [r1]
    0xFE, 0xE7, // b     .
    0x0C, 0xED, 0x00, 0xE0, // .word 0xE000ED0C  AIRCR
    0x04, 0x00, 0xFA, 0x05, // .word 0x05FA0004  VECTKEY | SYSRESETREQ
];

/// Option-byte reload via the FLASH_CR OBL_LAUNCH bit.
///
/// Parts whose empty-check flag is cleared only by an option-byte reload
/// (e.g. STM32F09x) need this instead of a plain AIRCR reset, otherwise a
/// freshly programmed virgin device keeps booting the system memory.
pub const OBL_LAUNCH: &[u8] = &[
    0x01, 0x49, // ldr   r1, [pc, #4]  ; FLASH_CR address
    0x02, 0x4A, // ldr   r2, [pc, #8]  ; OBL_LAUNCH bit
    0x0A, 0x60, // str   r2, [r1]
    0xFE, 0xE7, // b     .
    0x10, 0x20, 0x02, 0x40, // .word 0x40022010  FLASH_CR
    0x00, 0x20, 0x00, 0x00, // .word 0x00002000  OBL_LAUNCH
];

/// PEMPTY toggle followed by an AIRCR reset.
///
/// On STM32L45x/L46x the empty-check state lives in the PEMPTY bit of
/// FLASH_SR. Unlocking FLASH_CR for an OBL_LAUNCH there needs a key
/// sequence that can itself lock up after a failed attempt, so this stub
/// instead compares the first flash word against PEMPTY and toggles the
/// bit when they disagree, then requests a system reset.
pub const PEMPTY_LAUNCH: &[u8] = &[
    0x08, 0x48, // ldr   r0, [pc, #32] ; flash base
    0x00, 0x68, // ldr   r0, [r0]
    0x01, 0x30, // adds  r0, #1
    0x41, 0x1E, // subs  r1, r0, #1
    0x88, 0x41, // sbcs  r0, r1        ; r0 = (flash word == 0xFFFFFFFF)
    0x07, 0x49, // ldr   r1, [pc, #28] ; FLASH_SR address
    0x07, 0x4A, // ldr   r2, [pc, #28] ; PEMPTY mask
    0x0B, 0x68, // ldr   r3, [r1]
    0x13, 0x40, // ands  r3, r2
    0x5C, 0x1E, // subs  r4, r3, #1
    0xA3, 0x41, // sbcs  r3, r4        ; r3 = PEMPTY set
    0x98, 0x42, // cmp   r0, r3
    0x00, 0xD1, // bne.n 1f
    0x0A, 0x60, // str   r2, [r1]      ; toggle PEMPTY
    0x04, 0x48, // 1: ldr r0, [pc, #16] ; AIRCR address
    0x05, 0x49, // ldr   r1, [pc, #16] ; reset value
    0x01, 0x60, // str   r1, [r0]
    0xFE, 0xE7, // b     .
    0x00, 0x00, 0x00, 0x08, // .word 0x08000000  flash base
    0x10, 0x20, 0x02, 0x40, // .word 0x40022010  FLASH_SR
    0x00, 0x00, 0x02, 0x00, // .word 0x00020000  PEMPTY
    0x0C, 0xED, 0x00, 0xE0, // .word 0xE000ED0C  AIRCR
    0x04, 0x00, 0xFA, 0x05, // .word 0x05FA0004  VECTKEY | SYSRESETREQ
];
