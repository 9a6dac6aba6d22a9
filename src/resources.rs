//! Bring-up negotiation: firmware query, capability limits, the resource
//! table, and the key-value storage partition profile.

use std::collections::HashMap;

use log::{info, warn};

use crate::cmd::CmdChannel;
use crate::config::{Config, Profile};
use crate::error::Error;
use crate::regs::{self, opcode};

/// Resource identifiers reported by the device.
pub mod res_id {
    /// End-of-table sentinel.
    pub const TABLE_END: u16 = 0xFFFF;
    pub const KVD_SIZE: u16 = 0x1001;
    pub const KVD_SINGLE_MIN_SIZE: u16 = 0x1002;
    pub const KVD_DOUBLE_MIN_SIZE: u16 = 0x1003;
    pub const MAX_SPAN: u16 = 0x2420;
    pub const MAX_LAG: u16 = 0x2520;
    pub const MAX_PORTS_IN_LAG: u16 = 0x2521;
    pub const MAX_SYSTEM_PORT: u16 = 0x2502;
    pub const MAX_REGIONS: u16 = 0x2901;
    pub const MAX_VLAN_GROUPS: u16 = 0x2906;
    pub const MAX_VIRTUAL_ROUTERS: u16 = 0x2C01;
    pub const MAX_RIF: u16 = 0x2C02;
}

const QUERY_RESOURCES_MAX_PAGES: u32 = 100;

/// Identity and layout facts from the firmware query.
#[derive(Debug, Clone)]
pub struct FwInfo {
    pub rev_major: u16,
    pub rev_minor: u16,
    pub rev_subminor: u16,
    pub cmd_interface_rev: u16,
    /// Pages of host memory the firmware wants mapped for its own use.
    pub fw_pages: u16,
    pub doorbell_page_bar: u8,
    pub doorbell_page_offset: u32,
}

impl FwInfo {
    pub fn parse(m: &[u8]) -> Self {
        FwInfo {
            rev_major: regs::query_fw::fw_rev_major(m),
            rev_minor: regs::query_fw::fw_rev_minor(m),
            rev_subminor: regs::query_fw::fw_rev_subminor(m),
            cmd_interface_rev: regs::query_fw::cmd_interface_rev(m),
            fw_pages: regs::query_fw::fw_pages(m),
            doorbell_page_bar: regs::query_fw::doorbell_page_bar(m),
            doorbell_page_offset: regs::query_fw::doorbell_page_offset(m),
        }
    }
}

pub fn query_fw(cmd: &CmdChannel) -> Result<FwInfo, Error> {
    let out = cmd.execute(opcode::QUERY_FW, 0, 0, None, 0x20, false)?;
    let fw = FwInfo::parse(&out);
    info!(
        "firmware {}.{}.{}, command interface rev {}",
        fw.rev_major, fw.rev_minor, fw.rev_subminor, fw.cmd_interface_rev
    );
    if fw.cmd_interface_rev != 1 {
        return Err(Error::Unsupported(format!(
            "command interface rev {} (need 1)",
            fw.cmd_interface_rev
        )));
    }
    if fw.doorbell_page_bar != 0 {
        return Err(Error::Unsupported(format!(
            "doorbell page in BAR {} (need 0)",
            fw.doorbell_page_bar
        )));
    }
    Ok(fw)
}

/// Per-kind queue limits from the capability query.
#[derive(Debug, Clone)]
pub struct AqCaps {
    pub log_max_sdq_sz: u8,
    pub max_num_sdqs: u8,
    pub log_max_rdq_sz: u8,
    pub max_num_rdqs: u8,
    pub log_max_cq_sz: u8,
    pub max_num_cqs: u8,
    pub log_max_eq_sz: u8,
    pub max_num_eqs: u8,
}

impl AqCaps {
    pub fn parse(m: &[u8]) -> Self {
        AqCaps {
            log_max_sdq_sz: regs::query_aq_cap::log_max_sdq_sz(m),
            max_num_sdqs: regs::query_aq_cap::max_num_sdqs(m),
            log_max_rdq_sz: regs::query_aq_cap::log_max_rdq_sz(m),
            max_num_rdqs: regs::query_aq_cap::max_num_rdqs(m),
            log_max_cq_sz: regs::query_aq_cap::log_max_cq_sz(m),
            max_num_cqs: regs::query_aq_cap::max_num_cqs(m),
            log_max_eq_sz: regs::query_aq_cap::log_max_eq_sz(m),
            max_num_eqs: regs::query_aq_cap::max_num_eqs(m),
        }
    }

    /// Check that the configured queue plan fits the device limits.
    pub fn check(&self, config: &Config) -> Result<(), Error> {
        let checks: [(&str, usize, u8, usize, u8); 4] = [
            (
                "send",
                config.num_sdqs,
                self.max_num_sdqs,
                config.sdq_count,
                self.log_max_sdq_sz,
            ),
            (
                "receive",
                config.num_rdqs,
                self.max_num_rdqs,
                config.rdq_count,
                self.log_max_rdq_sz,
            ),
            (
                "completion",
                config.num_cqs,
                self.max_num_cqs,
                config.cq_count,
                self.log_max_cq_sz,
            ),
            (
                "event",
                regs::EQS_COUNT,
                self.max_num_eqs,
                config.eq_count,
                self.log_max_eq_sz,
            ),
        ];
        for (kind, num, max_num, count, log_max_sz) in checks {
            if num > max_num as usize {
                return Err(Error::Unsupported(format!(
                    "{num} {kind} queues requested, device supports {max_num}"
                )));
            }
            if count.trailing_zeros() as u8 > log_max_sz {
                return Err(Error::Unsupported(format!(
                    "{kind} queue size {count} exceeds device limit 2^{log_max_sz}"
                )));
            }
        }
        Ok(())
    }
}

pub fn query_aq_cap(cmd: &CmdChannel) -> Result<AqCaps, Error> {
    let out = cmd.execute(opcode::QUERY_AQ_CAP, 0, 0, None, 0x10, false)?;
    Ok(AqCaps::parse(&out))
}

/// Board identity strings.
#[derive(Debug, Clone)]
pub struct BoardInfo {
    pub vsd: String,
    pub psid: String,
}

fn trimmed_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

pub fn query_boardinfo(cmd: &CmdChannel) -> Result<BoardInfo, Error> {
    let out = cmd.execute(opcode::QUERY_BOARDINFO, 0, 0, None, 0x70, false)?;
    let vsd_end = regs::boardinfo::VSD_OFFSET + regs::boardinfo::VSD_LEN;
    let psid_end = regs::boardinfo::PSID_OFFSET + regs::boardinfo::PSID_LEN;
    let board = BoardInfo {
        vsd: trimmed_string(&out[regs::boardinfo::VSD_OFFSET..vsd_end]),
        psid: trimmed_string(&out[regs::boardinfo::PSID_OFFSET..psid_end]),
    };
    info!("board psid {:?}", board.psid);
    Ok(board)
}

/// The device resource table: id to value, as reported page by page until
/// the end-of-table sentinel.
#[derive(Debug, Default, Clone)]
pub struct Resources {
    table: HashMap<u16, u64>,
}

impl Resources {
    pub fn get(&self, id: u16) -> Option<u64> {
        self.table.get(&id).copied()
    }

    /// Absorb one output page. Returns true when the sentinel was seen.
    pub fn parse_page(&mut self, page: &[u8]) -> bool {
        for index in 0..regs::query_resources::ENTRIES_PER_PAGE {
            let id = regs::query_resources::id(page, index);
            if id == res_id::TABLE_END {
                return true;
            }
            let data = regs::query_resources::data(page, index);
            if id != 0 {
                self.table.insert(id, data);
            }
        }
        false
    }
}

pub fn query_resources(cmd: &CmdChannel) -> Result<Resources, Error> {
    let out_len =
        regs::query_resources::ENTRIES_PER_PAGE * regs::query_resources::ENTRY_STRIDE;
    let mut resources = Resources::default();
    for page in 0..QUERY_RESOURCES_MAX_PAGES {
        let out = cmd.execute(opcode::QUERY_RESOURCES, 0, page, None, out_len, false)?;
        if resources.parse_page(&out) {
            info!("resource table: {} entries", resources.table.len());
            return Ok(resources);
        }
    }
    Err(Error::ResourceSentinelMissing)
}

/// The computed key-value partition sizes, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvdSplit {
    pub linear: u32,
    pub single: u32,
    pub double: u32,
}

/// Split the device-reported key-value memory between the linear region
/// and the two hash regions, by the profile's part weights.
///
/// The double region is rounded down to the allocation granularity; the
/// single region absorbs the remainder. Violating either device minimum
/// is fatal rather than silently clamped.
pub fn kvd_split(resources: &Resources, profile: &Profile) -> Result<KvdSplit, Error> {
    let kvd_size = resources
        .get(res_id::KVD_SIZE)
        .ok_or_else(|| Error::KvdPartition("device did not report total size".into()))?;
    let single_min = resources.get(res_id::KVD_SINGLE_MIN_SIZE).unwrap_or(0);
    let double_min = resources.get(res_id::KVD_DOUBLE_MIN_SIZE).unwrap_or(0);

    let linear = profile.kvd_linear_size as u64;
    if kvd_size < linear {
        return Err(Error::KvdPartition(format!(
            "total size {kvd_size} smaller than linear region {linear}"
        )));
    }

    let parts = (profile.kvd_hash_single_parts + profile.kvd_hash_double_parts) as u64;
    let mut double = (kvd_size - linear) * profile.kvd_hash_double_parts as u64 / parts;
    double -= double % profile.kvd_granularity as u64;
    let single = kvd_size - linear - double;

    if single < single_min {
        return Err(Error::KvdPartition(format!(
            "single-size region {single} below device minimum {single_min}"
        )));
    }
    if double < double_min {
        return Err(Error::KvdPartition(format!(
            "double-size region {double} below device minimum {double_min}"
        )));
    }
    if kvd_size > u32::MAX as u64 {
        return Err(Error::KvdPartition(format!(
            "total size {kvd_size} out of range"
        )));
    }
    Ok(KvdSplit {
        linear: linear as u32,
        single: single as u32,
        double: double as u32,
    })
}

/// Push the partition profile to the device.
pub fn config_profile(cmd: &CmdChannel, split: &KvdSplit) -> Result<(), Error> {
    let mut mbox = [0u8; 0x20];
    regs::config_profile::mark_kvd_linear(&mut mbox);
    regs::config_profile::mark_kvd_hash_single(&mut mbox);
    regs::config_profile::mark_kvd_hash_double(&mut mbox);
    regs::config_profile::set_kvd_linear_size(&mut mbox, split.linear);
    regs::config_profile::set_kvd_hash_single_size(&mut mbox, split.single);
    regs::config_profile::set_kvd_hash_double_size(&mut mbox, split.double);
    cmd.execute(opcode::CONFIG_PROFILE, 0, 0, Some(&mbox), 0, false)?;
    Ok(())
}

/// Sanity-check resources ports and tables depend on, logging what is
/// missing. Absence is tolerated; consumers fall back to conservative
/// defaults.
pub fn log_limits(resources: &Resources) {
    for (name, id) in [
        ("max system port", res_id::MAX_SYSTEM_PORT),
        ("max lag", res_id::MAX_LAG),
        ("max ports in lag", res_id::MAX_PORTS_IN_LAG),
        ("max mirror sessions", res_id::MAX_SPAN),
        ("max acl regions", res_id::MAX_REGIONS),
        ("max vlan groups", res_id::MAX_VLAN_GROUPS),
        ("max virtual routers", res_id::MAX_VIRTUAL_ROUTERS),
        ("max router interfaces", res_id::MAX_RIF),
    ] {
        match resources.get(id) {
            Some(v) => info!("{name}: {v}"),
            None => warn!("{name}: not reported"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(entries: &[(u16, u64)]) -> Resources {
        let mut r = Resources::default();
        for &(id, data) in entries {
            r.table.insert(id, data);
        }
        r
    }

    fn profile() -> Profile {
        Profile {
            kvd_linear_size: 0x1000,
            kvd_hash_single_parts: 2,
            kvd_hash_double_parts: 1,
            kvd_granularity: 0x80,
        }
    }

    #[test]
    fn parse_page_stops_at_sentinel() {
        let mut page =
            vec![0u8; regs::query_resources::ENTRIES_PER_PAGE * regs::query_resources::ENTRY_STRIDE];
        regs::query_resources::set_id(&mut page, 0, res_id::KVD_SIZE);
        regs::query_resources::set_data(&mut page, 0, 0x40000);
        regs::query_resources::set_id(&mut page, 1, res_id::TABLE_END);
        // An entry after the sentinel must be ignored.
        regs::query_resources::set_id(&mut page, 2, res_id::MAX_LAG);
        regs::query_resources::set_data(&mut page, 2, 64);

        let mut r = Resources::default();
        assert!(r.parse_page(&page));
        assert_eq!(r.get(res_id::KVD_SIZE), Some(0x40000));
        assert_eq!(r.get(res_id::MAX_LAG), None);
    }

    #[test]
    fn split_honours_weights_and_granularity() {
        let r = resources(&[
            (res_id::KVD_SIZE, 0x10000),
            (res_id::KVD_SINGLE_MIN_SIZE, 0x100),
            (res_id::KVD_DOUBLE_MIN_SIZE, 0x100),
        ]);
        let split = kvd_split(&r, &profile()).unwrap();
        assert_eq!(split.linear, 0x1000);
        assert_eq!(split.double % 0x80, 0);
        assert_eq!(
            split.linear as u64 + split.single as u64 + split.double as u64,
            0x10000
        );
        // Double gets roughly a third of what remains after linear.
        let remaining = 0x10000 - 0x1000;
        assert!(split.double as u64 <= remaining / 3);
        assert!(split.double as u64 > remaining / 3 - 0x80);
    }

    #[test]
    fn split_fails_below_single_minimum() {
        let r = resources(&[
            (res_id::KVD_SIZE, 0x10000),
            (res_id::KVD_SINGLE_MIN_SIZE, 0x10000),
            (res_id::KVD_DOUBLE_MIN_SIZE, 0),
        ]);
        assert!(matches!(
            kvd_split(&r, &profile()),
            Err(Error::KvdPartition(_))
        ));
    }

    #[test]
    fn split_fails_when_linear_exceeds_total() {
        let r = resources(&[(res_id::KVD_SIZE, 0x800)]);
        assert!(matches!(
            kvd_split(&r, &profile()),
            Err(Error::KvdPartition(_))
        ));
    }

    #[test]
    fn split_fails_without_total_size() {
        let r = resources(&[]);
        assert!(matches!(
            kvd_split(&r, &profile()),
            Err(Error::KvdPartition(_))
        ));
    }
}
