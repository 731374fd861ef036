//! Storage health from the SMART report the host prints with
//! `storage-info-common.sh`.

use crate::error::{RecoveryError, Result};
use crate::tlw::Runner;
use regex::Regex;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const STORAGE_INFO_COMMAND: &str =
    ". /usr/share/misc/storage-info-common.sh; get_storage_info";
const STORAGE_INFO_TIMEOUT: Duration = Duration::from_secs(120);

// Type markers.
const SSD_TYPE: &str = r"SATA Version is:.*";
const MMC_TYPE: &str = r"\s*Extended CSD rev.*MMC (?P<version>\d+.\d+)";
const NVME_TYPE: &str = r".*NVMe Log .*";

// ID# ATTRIBUTE_NAME     FLAGS    VALUE WORST THRESH FAIL RAW_VALUE
// 184 End-to-End_Error   PO--CK   001   001   097    NOW  135
const SSD_FAILING: &str = r"\s*(?P<param>\S+\s\S+)\s+[P-][O-][S-][R-][C-][K-](\s+\d{3}){3}\s+NOW";
const SSD_REALLOCATED: &str = r"\s*\d\sReallocated_Sector_Ct\s*[P-][O-][S-][R-][C-][K-]\s*(?P<value>\d{3})\s*(?P<worst>\d{3})\s*(?P<thresh>\d{3})";
// 0x00-0x09 are 10% bands, 0x0a is 90-100%, 0x0b is past the rated life.
const MMC_LIFE: &str = r".*(?P<param>DEVICE_LIFE_TIME_EST_TYP_.)\]?: 0x0(?P<val>\S)";
// 0x01 normal, 0x02 80% of reserved blocks used, 0x03 90% used.
const MMC_EOL: &str = r".*(?P<param>PRE_EOL_INFO)\]?: 0x0(?P<val>\d)";
const NVME_USED: &str = r"Percentage Used:\s+(?P<param>\d{1,3})%";

/// Reallocated sector value manufacturers start from.
const SSD_REALLOCATED_BASELINE: u32 = 100;
const NVME_WARN_PERCENT: i64 = 91;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    #[default]
    Unspecified,
    Ssd,
    Mmc,
    Nvme,
}

impl StorageType {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageType::Unspecified => "UNSPECIFIED",
            StorageType::Ssd => "SSD",
            StorageType::Mmc => "MMC",
            StorageType::Nvme => "NVME",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum StorageState {
    #[default]
    Undefined,
    Normal,
    Warning,
    Critical,
}

impl StorageState {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageState::Undefined => "UNDEFINED",
            StorageState::Normal => "NORMAL",
            StorageState::Warning => "WARNING",
            StorageState::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for StorageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageSmart {
    pub storage_type: StorageType,
    pub state: StorageState,
}

fn pattern(re: &str) -> Result<Regex> {
    Regex::new(re).map_err(|e| RecoveryError::failed(format!("storage pattern {re:?}: {e}")))
}

/// Run the host's storage report and classify it.
pub async fn read_storage_smart(
    runner: &dyn Runner,
    cancel: &CancellationToken,
) -> Result<StorageSmart> {
    let out = runner
        .run(cancel, STORAGE_INFO_TIMEOUT, STORAGE_INFO_COMMAND, &[])
        .await
        .map_err(|e| e.context("read storage info"))?;
    parse_smart_info(&out)
}

/// Classify a SMART report. Unknown storage types parse with an undefined
/// state; an empty report is an error.
pub fn parse_smart_info(raw: &str) -> Result<StorageSmart> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(RecoveryError::failed("parse smart info: storage info is empty"));
    }
    let lines: Vec<&str> = raw.lines().collect();
    let storage_type = storage_type(&lines)?;
    let state = match storage_type {
        StorageType::Ssd => ssd_state(&lines)?,
        StorageType::Mmc => mmc_state(&lines)?,
        StorageType::Nvme => nvme_state(&lines)?,
        StorageType::Unspecified => StorageState::Undefined,
    };
    tracing::debug!(%storage_type, %state, "storage smart");
    Ok(StorageSmart {
        storage_type,
        state,
    })
}

fn storage_type(lines: &[&str]) -> Result<StorageType> {
    let (ssd, mmc, nvme) = (pattern(SSD_TYPE)?, pattern(MMC_TYPE)?, pattern(NVME_TYPE)?);
    for line in lines {
        if ssd.is_match(line) {
            return Ok(StorageType::Ssd);
        }
        if let Some(caps) = mmc.captures(line) {
            tracing::debug!(version = ?caps.name("version").map(|m| m.as_str()), "emmc device");
            return Ok(StorageType::Mmc);
        }
        if nvme.is_match(line) {
            return Ok(StorageType::Nvme);
        }
    }
    Ok(StorageType::Unspecified)
}

fn ssd_state(lines: &[&str]) -> Result<StorageState> {
    let (failing, reallocated) = (pattern(SSD_FAILING)?, pattern(SSD_REALLOCATED)?);
    for line in lines {
        if failing.is_match(line) {
            tracing::debug!(line, "failing smart attribute");
            return Ok(StorageState::Critical);
        }
        let value = reallocated
            .captures(line)
            .and_then(|c| c.name("value"))
            .and_then(|m| m.as_str().parse::<u32>().ok());
        if value.is_some_and(|v| v > SSD_REALLOCATED_BASELINE) {
            tracing::debug!(line, "reallocated sectors growing");
            return Ok(StorageState::Warning);
        }
    }
    Ok(StorageState::Normal)
}

fn mmc_state(lines: &[&str]) -> Result<StorageState> {
    let (life, eol) = (pattern(MMC_LIFE)?, pattern(MMC_EOL)?);
    let mut eol_value = 0;
    let mut life_value: i64 = -1;
    for line in lines {
        if let Some(val) = life.captures(line).and_then(|c| c.name("val")) {
            let percent = match val.as_str() {
                "a" => 100,
                "b" => 101,
                digit => digit.parse::<i64>().unwrap_or(0) * 10,
            };
            life_value = life_value.max(percent);
            continue;
        }
        if let Some(val) = eol.captures(line).and_then(|c| c.name("val")) {
            eol_value = val.as_str().parse::<u8>().unwrap_or(0);
            break;
        }
    }
    Ok(match eol_value {
        3 => StorageState::Critical,
        2 => StorageState::Warning,
        1 => StorageState::Normal,
        _ if life_value < 90 => StorageState::Normal,
        _ if life_value < 100 => StorageState::Warning,
        _ => StorageState::Critical,
    })
}

fn nvme_state(lines: &[&str]) -> Result<StorageState> {
    let used = pattern(NVME_USED)?;
    let percent = lines
        .iter()
        .find_map(|line| used.captures(line))
        .and_then(|c| c.name("param").and_then(|m| m.as_str().parse::<i64>().ok()))
        .unwrap_or(-1);
    tracing::debug!(percent, "nvme percentage used");
    Ok(if percent < NVME_WARN_PERCENT {
        StorageState::Normal
    } else {
        StorageState::Warning
    })
}
