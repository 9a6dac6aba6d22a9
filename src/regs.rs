//! Device-fixed register and descriptor layout.
//!
//! All registers are 32-bit big-endian. Descriptors and mailboxes are byte
//! buffers addressed as sequences of big-endian 32-bit words; the accessor
//! modules below read and write named bit fields inside them.

// ── Command interface registers (CIR) ───────────────────────────────

pub const CIR_BASE: u32 = 0x71000;
pub const CIR_IN_PARAM_HI: u32 = CIR_BASE;
pub const CIR_IN_PARAM_LO: u32 = CIR_BASE + 0x04;
pub const CIR_IN_MODIFIER: u32 = CIR_BASE + 0x08;
pub const CIR_OUT_PARAM_HI: u32 = CIR_BASE + 0x0C;
pub const CIR_OUT_PARAM_LO: u32 = CIR_BASE + 0x10;
pub const CIR_TOKEN: u32 = CIR_BASE + 0x14;
pub const CIR_CTRL: u32 = CIR_BASE + 0x18;

pub const CIR_CTRL_GO_BIT: u32 = 1 << 23;
pub const CIR_CTRL_EVREQ_BIT: u32 = 1 << 22;
pub const CIR_CTRL_OPCODE_MOD_SHIFT: u32 = 12;
pub const CIR_CTRL_STATUS_SHIFT: u32 = 24;

// ── Reset / firmware-ready registers ────────────────────────────────

pub const SW_RESET: u32 = 0xF0010;
pub const SW_RESET_RST_BIT: u32 = 1;
pub const FW_READY: u32 = 0xA1844;
pub const FW_READY_MASK: u32 = 0xFF;
pub const FW_READY_MAGIC: u32 = 0x5E;

// ── Doorbell page ───────────────────────────────────────────────────
//
// One 32-bit doorbell per (kind, queue number), at
// `page_offset + kind_offset + 4 * num`. The arm range is disjoint and
// exists for completion and event queues only.

/// Doorbells per kind: each kind owns a 0x100-byte range of 32-bit cells.
pub const DOORBELLS_PER_KIND: usize = 64;

pub const DOORBELL_SDQ_OFFSET: u32 = 0x000;
pub const DOORBELL_CQ_OFFSET: u32 = 0x100;
pub const DOORBELL_RDQ_OFFSET: u32 = 0x200;
pub const DOORBELL_EQ_OFFSET: u32 = 0x300;
pub const DOORBELL_ARM_CQ_OFFSET: u32 = 0x400;
pub const DOORBELL_ARM_EQ_OFFSET: u32 = 0x500;

pub fn doorbell_addr(page_offset: u32, kind_offset: u32, num: u8) -> u32 {
    page_offset + kind_offset + 4 * num as u32
}

// ── Sizes and limits ────────────────────────────────────────────────

pub const PAGE_SIZE: usize = 4096;
/// Maximum backing pages announced per queue.
pub const AQ_PAGES: usize = 8;
pub const WQE_SIZE: usize = 32;
pub const CQE_SIZE: usize = 16;
pub const EQE_SIZE: usize = 16;
/// Scatter entries per send/receive descriptor.
pub const WQE_SG_ENTRIES: usize = 3;
pub const WQE_TYPE_ETHERNET: u32 = 0xA;

pub const CQS_MAX: usize = 96;
/// The device exposes exactly two event queues.
pub const EQS_COUNT: usize = 2;
/// Event queue carrying command-completion events.
pub const EQ_ASYNC_NUM: u8 = 0;
/// Event queue carrying completion-activity events.
pub const EQ_COMP_NUM: u8 = 1;

pub const MBOX_SIZE: usize = 4096;
/// Firmware-area map entries per MAP_FA command.
pub const MAP_FA_ENTRIES_MAX: usize = 32;

pub const EQE_EVENT_TYPE_COMP: u32 = 0x00;
pub const EQE_EVENT_TYPE_CMD: u32 = 0x0A;

/// Trailing Ethernet FCS length, stripped when the CRC flag is set.
pub const ETH_FCS_LEN: u16 = 4;

// ── Command opcodes ─────────────────────────────────────────────────

pub mod opcode {
    pub const QUERY_FW: u16 = 0x004;
    pub const QUERY_AQ_CAP: u16 = 0x003;
    pub const QUERY_BOARDINFO: u16 = 0x006;
    pub const QUERY_RESOURCES: u16 = 0x101;
    pub const CONFIG_PROFILE: u16 = 0x100;
    pub const MAP_FA: u16 = 0xFFF;
    pub const UNMAP_FA: u16 = 0xFFE;
    /// Opcode modifier 0 targets send queues, 1 receive queues.
    pub const SW2HW_DQ: u16 = 0x201;
    pub const HW2SW_DQ: u16 = 0x202;
    pub const SW2HW_CQ: u16 = 0x016;
    pub const HW2SW_CQ: u16 = 0x017;
    pub const SW2HW_EQ: u16 = 0x013;
    pub const HW2SW_EQ: u16 = 0x014;
}

// ── Command status codes ────────────────────────────────────────────

pub fn cmd_status_str(status: u8) -> &'static str {
    match status {
        0x00 => "OK",
        0x01 => "internal error",
        0x02 => "bad operation",
        0x03 => "bad parameter",
        0x04 => "bad system state",
        0x05 => "bad resource",
        0x06 => "resource busy",
        0x08 => "exceeds limit",
        0x09 => "bad resource state",
        0x0A => "bad index",
        _ => "unknown",
    }
}

// ── Field access helpers ────────────────────────────────────────────

#[inline]
pub fn get32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
pub fn put32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_be_bytes());
}

#[inline]
pub fn get64(buf: &[u8], off: usize) -> u64 {
    ((get32(buf, off) as u64) << 32) | get32(buf, off + 4) as u64
}

#[inline]
pub fn put64(buf: &mut [u8], off: usize, val: u64) {
    put32(buf, off, (val >> 32) as u32);
    put32(buf, off + 4, val as u32);
}

#[inline]
fn mask(width: u32) -> u32 {
    if width == 32 { u32::MAX } else { (1 << width) - 1 }
}

/// Read `width` bits at `shift` within the big-endian word at `off`.
#[inline]
pub fn get_field(buf: &[u8], off: usize, shift: u32, width: u32) -> u32 {
    (get32(buf, off) >> shift) & mask(width)
}

/// Write `width` bits at `shift` within the big-endian word at `off`.
#[inline]
pub fn put_field(buf: &mut [u8], off: usize, shift: u32, width: u32, val: u32) {
    debug_assert!(val <= mask(width));
    let cur = get32(buf, off);
    let m = mask(width) << shift;
    put32(buf, off, (cur & !m) | ((val << shift) & m));
}

// ── Send/receive descriptor (WQE, 32 bytes) ─────────────────────────
//
// Word 0: completion-report bit 31, LP bit 30, type bits 23..27.
// Byte counts: 14-bit fields at 0x02 + 2*i. Addresses: 64-bit at 0x08 + 8*i.

pub mod wqe {
    use super::*;

    pub fn set_completion_report(e: &mut [u8], on: bool) {
        put_field(e, 0x00, 31, 1, on as u32);
    }

    pub fn set_lp(e: &mut [u8], on: bool) {
        put_field(e, 0x00, 30, 1, on as u32);
    }

    pub fn set_type(e: &mut [u8], ty: u32) {
        put_field(e, 0x00, 23, 4, ty);
    }

    pub fn byte_count(e: &[u8], index: usize) -> u16 {
        debug_assert!(index < WQE_SG_ENTRIES);
        let raw = u16::from_be_bytes([e[0x02 + 2 * index], e[0x03 + 2 * index]]);
        raw & 0x3FFF
    }

    pub fn set_byte_count(e: &mut [u8], index: usize, len: u16) {
        debug_assert!(index < WQE_SG_ENTRIES);
        debug_assert!(len <= 0x3FFF);
        e[0x02 + 2 * index..0x04 + 2 * index].copy_from_slice(&len.to_be_bytes());
    }

    pub fn address(e: &[u8], index: usize) -> u64 {
        debug_assert!(index < WQE_SG_ENTRIES);
        get64(e, 0x08 + 8 * index)
    }

    pub fn set_address(e: &mut [u8], index: usize, addr: u64) {
        debug_assert!(index < WQE_SG_ENTRIES);
        put64(e, 0x08 + 8 * index, addr);
    }
}

// ── Completion entry (CQE, 16 bytes) ────────────────────────────────
//
// Word 0: LAG flag bit 23, port-or-LAG id bits 0..15.
// Word 1: descriptor counter bits 16..31, byte count bits 0..13.
// Word 2: trap id bits 0..8.
// Word 3: CRC flag bit 8, send/receive flag bit 6, queue number bits 1..5,
//         ownership bit 0.

pub mod cqe {
    use super::*;

    pub fn owner(e: &[u8]) -> bool {
        get_field(e, 0x0C, 0, 1) != 0
    }

    pub fn set_owner(e: &mut [u8], owner: bool) {
        put_field(e, 0x0C, 0, 1, owner as u32);
    }

    pub fn is_send(e: &[u8]) -> bool {
        get_field(e, 0x0C, 6, 1) != 0
    }

    pub fn set_send(e: &mut [u8], send: bool) {
        put_field(e, 0x0C, 6, 1, send as u32);
    }

    pub fn dqn(e: &[u8]) -> u8 {
        get_field(e, 0x0C, 1, 5) as u8
    }

    pub fn set_dqn(e: &mut [u8], dqn: u8) {
        put_field(e, 0x0C, 1, 5, dqn as u32);
    }

    pub fn crc(e: &[u8]) -> bool {
        get_field(e, 0x0C, 8, 1) != 0
    }

    pub fn set_crc(e: &mut [u8], crc: bool) {
        put_field(e, 0x0C, 8, 1, crc as u32);
    }

    pub fn wqe_counter(e: &[u8]) -> u16 {
        get_field(e, 0x04, 16, 16) as u16
    }

    pub fn set_wqe_counter(e: &mut [u8], counter: u16) {
        put_field(e, 0x04, 16, 16, counter as u32);
    }

    pub fn byte_count(e: &[u8]) -> u16 {
        get_field(e, 0x04, 0, 14) as u16
    }

    pub fn set_byte_count(e: &mut [u8], len: u16) {
        put_field(e, 0x04, 0, 14, len as u32);
    }

    pub fn is_lag(e: &[u8]) -> bool {
        get_field(e, 0x00, 23, 1) != 0
    }

    pub fn set_lag(e: &mut [u8], lag: bool) {
        put_field(e, 0x00, 23, 1, lag as u32);
    }

    /// System port when the LAG flag is clear, LAG id when set.
    pub fn port(e: &[u8]) -> u16 {
        get_field(e, 0x00, 0, 16) as u16
    }

    pub fn set_port(e: &mut [u8], port: u16) {
        put_field(e, 0x00, 0, 16, port as u32);
    }

    pub fn trap_id(e: &[u8]) -> u16 {
        get_field(e, 0x08, 0, 9) as u16
    }

    pub fn set_trap_id(e: &mut [u8], trap: u16) {
        put_field(e, 0x08, 0, 9, trap as u32);
    }
}

// ── Event entry (EQE, 16 bytes) ─────────────────────────────────────
//
// Word 0: command status bits 24..31, command token bits 0..15.
// Words 1-2: 64-bit command output parameter.
// Word 3: event type bits 24..31, completion-queue number bits 8..14,
//         ownership bit 0.

pub mod eqe {
    use super::*;

    pub fn owner(e: &[u8]) -> bool {
        get_field(e, 0x0C, 0, 1) != 0
    }

    pub fn set_owner(e: &mut [u8], owner: bool) {
        put_field(e, 0x0C, 0, 1, owner as u32);
    }

    pub fn event_type(e: &[u8]) -> u32 {
        get_field(e, 0x0C, 24, 8)
    }

    pub fn set_event_type(e: &mut [u8], ty: u32) {
        put_field(e, 0x0C, 24, 8, ty);
    }

    pub fn cqn(e: &[u8]) -> u8 {
        get_field(e, 0x0C, 8, 7) as u8
    }

    pub fn set_cqn(e: &mut [u8], cqn: u8) {
        put_field(e, 0x0C, 8, 7, cqn as u32);
    }

    pub fn cmd_token(e: &[u8]) -> u8 {
        get_field(e, 0x00, 0, 16) as u8
    }

    pub fn set_cmd_token(e: &mut [u8], token: u8) {
        put_field(e, 0x00, 0, 16, token as u32);
    }

    pub fn cmd_status(e: &[u8]) -> u8 {
        get_field(e, 0x00, 24, 8) as u8
    }

    pub fn set_cmd_status(e: &mut [u8], status: u8) {
        put_field(e, 0x00, 24, 8, status as u32);
    }

    pub fn cmd_out_param(e: &[u8]) -> u64 {
        get64(e, 0x04)
    }

    pub fn set_cmd_out_param(e: &mut [u8], val: u64) {
        put64(e, 0x04, val);
    }
}

// ── Mailbox layouts ─────────────────────────────────────────────────

/// QUERY_FW output mailbox.
pub mod query_fw {
    use super::*;

    pub fn fw_rev_major(m: &[u8]) -> u16 {
        get_field(m, 0x00, 16, 16) as u16
    }
    pub fn fw_rev_minor(m: &[u8]) -> u16 {
        get_field(m, 0x00, 0, 16) as u16
    }
    pub fn fw_rev_subminor(m: &[u8]) -> u16 {
        get_field(m, 0x04, 16, 16) as u16
    }
    pub fn cmd_interface_rev(m: &[u8]) -> u16 {
        get_field(m, 0x04, 0, 16) as u16
    }
    pub fn fw_pages(m: &[u8]) -> u16 {
        get_field(m, 0x08, 0, 16) as u16
    }
    pub fn doorbell_page_bar(m: &[u8]) -> u8 {
        get_field(m, 0x0C, 24, 8) as u8
    }
    pub fn doorbell_page_offset(m: &[u8]) -> u32 {
        get32(m, 0x10)
    }

    pub fn set_fw_rev_major(m: &mut [u8], v: u16) {
        put_field(m, 0x00, 16, 16, v as u32);
    }
    pub fn set_fw_rev_minor(m: &mut [u8], v: u16) {
        put_field(m, 0x00, 0, 16, v as u32);
    }
    pub fn set_fw_rev_subminor(m: &mut [u8], v: u16) {
        put_field(m, 0x04, 16, 16, v as u32);
    }
    pub fn set_cmd_interface_rev(m: &mut [u8], v: u16) {
        put_field(m, 0x04, 0, 16, v as u32);
    }
    pub fn set_fw_pages(m: &mut [u8], v: u16) {
        put_field(m, 0x08, 0, 16, v as u32);
    }
    pub fn set_doorbell_page_bar(m: &mut [u8], v: u8) {
        put_field(m, 0x0C, 24, 8, v as u32);
    }
    pub fn set_doorbell_page_offset(m: &mut [u8], v: u32) {
        put32(m, 0x10, v);
    }
}

/// QUERY_AQ_CAP output mailbox.
pub mod query_aq_cap {
    use super::*;

    pub fn log_max_sdq_sz(m: &[u8]) -> u8 {
        get_field(m, 0x00, 24, 8) as u8
    }
    pub fn max_num_sdqs(m: &[u8]) -> u8 {
        get_field(m, 0x00, 0, 8) as u8
    }
    pub fn log_max_rdq_sz(m: &[u8]) -> u8 {
        get_field(m, 0x04, 24, 8) as u8
    }
    pub fn max_num_rdqs(m: &[u8]) -> u8 {
        get_field(m, 0x04, 0, 8) as u8
    }
    pub fn log_max_cq_sz(m: &[u8]) -> u8 {
        get_field(m, 0x08, 24, 8) as u8
    }
    pub fn max_num_cqs(m: &[u8]) -> u8 {
        get_field(m, 0x08, 0, 8) as u8
    }
    pub fn log_max_eq_sz(m: &[u8]) -> u8 {
        get_field(m, 0x0C, 24, 8) as u8
    }
    pub fn max_num_eqs(m: &[u8]) -> u8 {
        get_field(m, 0x0C, 0, 8) as u8
    }

    pub fn set_log_max_sdq_sz(m: &mut [u8], v: u8) {
        put_field(m, 0x00, 24, 8, v as u32);
    }
    pub fn set_max_num_sdqs(m: &mut [u8], v: u8) {
        put_field(m, 0x00, 0, 8, v as u32);
    }
    pub fn set_log_max_rdq_sz(m: &mut [u8], v: u8) {
        put_field(m, 0x04, 24, 8, v as u32);
    }
    pub fn set_max_num_rdqs(m: &mut [u8], v: u8) {
        put_field(m, 0x04, 0, 8, v as u32);
    }
    pub fn set_log_max_cq_sz(m: &mut [u8], v: u8) {
        put_field(m, 0x08, 24, 8, v as u32);
    }
    pub fn set_max_num_cqs(m: &mut [u8], v: u8) {
        put_field(m, 0x08, 0, 8, v as u32);
    }
    pub fn set_log_max_eq_sz(m: &mut [u8], v: u8) {
        put_field(m, 0x0C, 24, 8, v as u32);
    }
    pub fn set_max_num_eqs(m: &mut [u8], v: u8) {
        put_field(m, 0x0C, 0, 8, v as u32);
    }
}

/// SW2HW_DQ input mailbox (send and receive queues; opcode modifier
/// distinguishes them).
pub mod sw2hw_dq {
    use super::*;

    pub fn cq(m: &[u8]) -> u8 {
        get_field(m, 0x00, 24, 8) as u8
    }
    pub fn sdq_tclass(m: &[u8]) -> u8 {
        get_field(m, 0x00, 16, 8) as u8
    }
    /// Log2 of the element count.
    pub fn log2_dq_sz(m: &[u8]) -> u8 {
        get_field(m, 0x00, 0, 8) as u8
    }
    pub fn pa(m: &[u8], index: usize) -> u64 {
        debug_assert!(index < AQ_PAGES);
        get64(m, 0x10 + 8 * index)
    }

    pub fn set_cq(m: &mut [u8], v: u8) {
        put_field(m, 0x00, 24, 8, v as u32);
    }
    pub fn set_sdq_tclass(m: &mut [u8], v: u8) {
        put_field(m, 0x00, 16, 8, v as u32);
    }
    pub fn set_log2_dq_sz(m: &mut [u8], v: u8) {
        put_field(m, 0x00, 0, 8, v as u32);
    }
    pub fn set_pa(m: &mut [u8], index: usize, addr: u64) {
        debug_assert!(index < AQ_PAGES);
        put64(m, 0x10 + 8 * index, addr);
    }
}

/// SW2HW_CQ input mailbox.
pub mod sw2hw_cq {
    use super::*;

    pub fn c_eqn(m: &[u8]) -> u8 {
        get_field(m, 0x00, 16, 8) as u8
    }
    pub fn log_cq_size(m: &[u8]) -> u8 {
        get_field(m, 0x00, 0, 8) as u8
    }
    pub fn pa(m: &[u8], index: usize) -> u64 {
        get64(m, 0x10 + 8 * index)
    }

    pub fn set_cv(m: &mut [u8], v: u8) {
        put_field(m, 0x00, 28, 4, v as u32);
    }
    pub fn set_c_eqn(m: &mut [u8], v: u8) {
        put_field(m, 0x00, 16, 8, v as u32);
    }
    pub fn set_oi(m: &mut [u8], v: bool) {
        put_field(m, 0x00, 8, 1, v as u32);
    }
    pub fn set_st(m: &mut [u8], v: u8) {
        put_field(m, 0x00, 9, 1, v as u32);
    }
    pub fn set_log_cq_size(m: &mut [u8], v: u8) {
        put_field(m, 0x00, 0, 8, v as u32);
    }
    pub fn set_pa(m: &mut [u8], index: usize, addr: u64) {
        put64(m, 0x10 + 8 * index, addr);
    }
}

/// SW2HW_EQ input mailbox.
pub mod sw2hw_eq {
    use super::*;

    pub fn log_eq_size(m: &[u8]) -> u8 {
        get_field(m, 0x00, 0, 8) as u8
    }
    pub fn pa(m: &[u8], index: usize) -> u64 {
        get64(m, 0x10 + 8 * index)
    }

    pub fn set_int_msix(m: &mut [u8], v: bool) {
        put_field(m, 0x00, 31, 1, v as u32);
    }
    pub fn set_st(m: &mut [u8], v: u8) {
        put_field(m, 0x00, 24, 2, v as u32);
    }
    pub fn set_oi(m: &mut [u8], v: bool) {
        put_field(m, 0x00, 8, 1, v as u32);
    }
    pub fn set_log_eq_size(m: &mut [u8], v: u8) {
        put_field(m, 0x00, 0, 8, v as u32);
    }
    pub fn set_pa(m: &mut [u8], index: usize, addr: u64) {
        put64(m, 0x10 + 8 * index, addr);
    }
}

/// MAP_FA input mailbox: up to [`MAP_FA_ENTRIES_MAX`] entries of
/// (page address, log2 size in pages); the entry count rides in the
/// input modifier.
pub mod map_fa {
    use super::*;

    pub fn pa(m: &[u8], index: usize) -> u64 {
        get64(m, 16 * index)
    }
    pub fn log2size(m: &[u8], index: usize) -> u8 {
        get_field(m, 16 * index + 8, 0, 8) as u8
    }

    pub fn set_pa(m: &mut [u8], index: usize, addr: u64) {
        put64(m, 16 * index, addr);
    }
    pub fn set_log2size(m: &mut [u8], index: usize, v: u8) {
        put_field(m, 16 * index + 8, 0, 8, v as u32);
    }
}

/// QUERY_RESOURCES output mailbox: 32 entries of (id, value) per page;
/// the page index rides in the input modifier.
pub mod query_resources {
    use super::*;

    pub const ENTRIES_PER_PAGE: usize = 32;
    pub const ENTRY_STRIDE: usize = 16;

    pub fn id(m: &[u8], index: usize) -> u16 {
        debug_assert!(index < ENTRIES_PER_PAGE);
        get_field(m, ENTRY_STRIDE * index, 0, 16) as u16
    }
    pub fn data(m: &[u8], index: usize) -> u64 {
        debug_assert!(index < ENTRIES_PER_PAGE);
        get64(m, ENTRY_STRIDE * index + 8)
    }

    pub fn set_id(m: &mut [u8], index: usize, id: u16) {
        put_field(m, ENTRY_STRIDE * index, 0, 16, id as u32);
    }
    pub fn set_data(m: &mut [u8], index: usize, data: u64) {
        put64(m, ENTRY_STRIDE * index + 8, data);
    }
}

/// CONFIG_PROFILE input mailbox (key-value partition subset).
pub mod config_profile {
    use super::*;

    pub fn set_kvd_linear(m: &[u8]) -> bool {
        get_field(m, 0x00, 0, 1) != 0
    }
    pub fn kvd_linear_size(m: &[u8]) -> u32 {
        get32(m, 0x10)
    }
    pub fn kvd_hash_single_size(m: &[u8]) -> u32 {
        get32(m, 0x14)
    }
    pub fn kvd_hash_double_size(m: &[u8]) -> u32 {
        get32(m, 0x18)
    }

    pub fn mark_kvd_linear(m: &mut [u8]) {
        put_field(m, 0x00, 0, 1, 1);
    }
    pub fn mark_kvd_hash_single(m: &mut [u8]) {
        put_field(m, 0x00, 1, 1, 1);
    }
    pub fn mark_kvd_hash_double(m: &mut [u8]) {
        put_field(m, 0x00, 2, 1, 1);
    }
    pub fn set_kvd_linear_size(m: &mut [u8], v: u32) {
        put32(m, 0x10, v);
    }
    pub fn set_kvd_hash_single_size(m: &mut [u8], v: u32) {
        put32(m, 0x14, v);
    }
    pub fn set_kvd_hash_double_size(m: &mut [u8], v: u32) {
        put32(m, 0x18, v);
    }
}

/// QUERY_BOARDINFO output mailbox.
pub mod boardinfo {
    pub const VSD_OFFSET: usize = 0x20;
    pub const VSD_LEN: usize = 64;
    pub const PSID_OFFSET: usize = 0x60;
    pub const PSID_LEN: usize = 16;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_round_trip() {
        let mut buf = [0u8; 16];
        put_field(&mut buf, 0x0C, 1, 5, 0x13);
        put_field(&mut buf, 0x0C, 0, 1, 1);
        assert_eq!(get_field(&buf, 0x0C, 1, 5), 0x13);
        assert_eq!(get_field(&buf, 0x0C, 0, 1), 1);
        // Neighbouring fields must not clobber each other.
        put_field(&mut buf, 0x0C, 6, 1, 1);
        assert_eq!(get_field(&buf, 0x0C, 1, 5), 0x13);
    }

    #[test]
    fn wqe_fields() {
        let mut e = [0u8; WQE_SIZE];
        wqe::set_completion_report(&mut e, true);
        wqe::set_type(&mut e, WQE_TYPE_ETHERNET);
        wqe::set_address(&mut e, 1, 0x1234_5678_9ABC_DEF0);
        wqe::set_byte_count(&mut e, 1, 1514);
        assert_eq!(wqe::address(&e, 1), 0x1234_5678_9ABC_DEF0);
        assert_eq!(wqe::byte_count(&e, 1), 1514);
        assert_eq!(wqe::byte_count(&e, 0), 0);
        assert_eq!(wqe::address(&e, 0), 0);
    }

    #[test]
    fn cqe_fields() {
        let mut e = [0u8; CQE_SIZE];
        cqe::set_owner(&mut e, true);
        cqe::set_send(&mut e, true);
        cqe::set_dqn(&mut e, 7);
        cqe::set_wqe_counter(&mut e, 0xABCD);
        cqe::set_byte_count(&mut e, 1500);
        cqe::set_port(&mut e, 42);
        cqe::set_trap_id(&mut e, 0x1AB);
        assert!(cqe::owner(&e));
        assert!(cqe::is_send(&e));
        assert_eq!(cqe::dqn(&e), 7);
        assert_eq!(cqe::wqe_counter(&e), 0xABCD);
        assert_eq!(cqe::byte_count(&e), 1500);
        assert_eq!(cqe::port(&e), 42);
        assert_eq!(cqe::trap_id(&e), 0x1AB);
        assert!(!cqe::crc(&e));
    }

    #[test]
    fn eqe_fields() {
        let mut e = [0u8; EQE_SIZE];
        eqe::set_event_type(&mut e, EQE_EVENT_TYPE_CMD);
        eqe::set_cmd_status(&mut e, 2);
        eqe::set_cmd_out_param(&mut e, 0xDEAD_BEEF_0000_1234);
        eqe::set_cqn(&mut e, 95);
        assert_eq!(eqe::event_type(&e), EQE_EVENT_TYPE_CMD);
        assert_eq!(eqe::cmd_status(&e), 2);
        assert_eq!(eqe::cmd_out_param(&e), 0xDEAD_BEEF_0000_1234);
        assert_eq!(eqe::cqn(&e), 95);
        assert!(!eqe::owner(&e));
    }

    #[test]
    fn doorbell_layout_is_disjoint() {
        let base = 0x8000;
        let sdq = doorbell_addr(base, DOORBELL_SDQ_OFFSET, 3);
        let cq = doorbell_addr(base, DOORBELL_CQ_OFFSET, 3);
        let arm = doorbell_addr(base, DOORBELL_ARM_CQ_OFFSET, 3);
        assert_eq!(sdq, base + 12);
        assert_eq!(cq, base + 0x100 + 12);
        assert_eq!(arm, base + 0x400 + 12);
    }
}
