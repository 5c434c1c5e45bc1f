//! # Remote Mapping Records
//!
//! Fixed-size records exchanged between a client process and a mapping
//! service that shares one region among several processes. Only the record
//! layouts live here; the socket transport and descriptor passing belong to
//! the service.
//!
//! ## Layouts
//!
//! ```text
//! MapRequest (120 bytes)
//! +--------+-------------------+------+-------+------------+
//! | action | name (NUL-padded) | prot | flags | fixed_base |
//! | u32    | [u8; 100]         | i32  | i32   | u64        |
//! +--------+-------------------+------+-------+------------+
//!
//! ConfigRecord (48 bytes)
//! +-----------+------------------+-------------+--------------+
//! | page_size | max_fault_events | num_fillers | num_evictors |
//! | u64       | u64              | u64         | u64          |
//! +-----------+------------------+-------------+--------------+
//! | buffer_capacity | low_water | high_water |
//! | u64             | i32       | i32        |
//! +-----------------+-----------+------------+
//! ```
//!
//! All integers are little-endian. A `fixed_base` of zero means "no fixed
//! address".

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{I32, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::RegionConfig;
use crate::region::{MapFlags, Protection};

/// Longest file name a map request can carry.
pub const NAME_SIZE: usize = 100;

pub const MAP_REQUEST_SIZE: usize = 120;
pub const CONFIG_RECORD_SIZE: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Action {
    Map = 0,
    Unmap = 1,
}

impl TryFrom<u32> for Action {
    type Error = eyre::Report;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Action::Map),
            1 => Ok(Action::Unmap),
            other => bail!("unknown remote action tag {}", other),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MapRequestWire {
    action: U32,
    name: [u8; NAME_SIZE],
    prot: I32,
    flags: I32,
    fixed_base: U64,
}

const _: () = assert!(std::mem::size_of::<MapRequestWire>() == MAP_REQUEST_SIZE);

/// A client's request to map or unmap a named file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRequest {
    pub action: Action,
    pub name: String,
    pub prot: Protection,
    pub flags: MapFlags,
    pub fixed_base: Option<usize>,
}

impl MapRequest {
    pub fn map(name: &str, prot: Protection, flags: MapFlags) -> Result<Self> {
        check_name(name)?;
        Ok(Self {
            action: Action::Map,
            name: name.to_string(),
            prot,
            flags,
            fixed_base: None,
        })
    }

    pub fn unmap(name: &str) -> Result<Self> {
        check_name(name)?;
        Ok(Self {
            action: Action::Unmap,
            name: name.to_string(),
            prot: Protection::empty(),
            flags: MapFlags::empty(),
            fixed_base: None,
        })
    }

    pub fn with_fixed_base(mut self, base: usize) -> Self {
        self.fixed_base = Some(base);
        self
    }

    pub fn encode(&self) -> Result<[u8; MAP_REQUEST_SIZE]> {
        check_name(&self.name)?;
        let mut name = [0u8; NAME_SIZE];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());

        let wire = MapRequestWire {
            action: U32::new(self.action as u32),
            name,
            prot: I32::new(self.prot.bits()),
            flags: I32::new(self.flags.bits()),
            fixed_base: U64::new(self.fixed_base.unwrap_or(0) as u64),
        };

        let mut out = [0u8; MAP_REQUEST_SIZE];
        out.copy_from_slice(wire.as_bytes());
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= MAP_REQUEST_SIZE,
            "map request too short: {} < {}",
            bytes.len(),
            MAP_REQUEST_SIZE
        );
        let wire = MapRequestWire::ref_from_bytes(&bytes[..MAP_REQUEST_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse map request: {:?}", e))?;

        let name_len = wire
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_SIZE);
        let name = std::str::from_utf8(&wire.name[..name_len])
            .map_err(|e| eyre::eyre!("map request name is not UTF-8: {}", e))?;
        check_name(name)?;

        let prot = Protection::from_bits(wire.prot.get())
            .ok_or_else(|| eyre::eyre!("unknown protection bits {:#x}", wire.prot.get()))?;
        let fixed_base = match wire.fixed_base.get() {
            0 => None,
            base => Some(base as usize),
        };

        Ok(Self {
            action: Action::try_from(wire.action.get())?,
            name: name.to_string(),
            prot,
            flags: MapFlags::from_bits_retain(wire.flags.get()),
            fixed_base,
        })
    }
}

fn check_name(name: &str) -> Result<()> {
    ensure!(!name.is_empty(), "remote file name is empty");
    ensure!(
        name.len() <= NAME_SIZE,
        "remote file name is {} bytes, limit is {}",
        name.len(),
        NAME_SIZE
    );
    ensure!(!name.contains('\0'), "remote file name contains NUL");
    Ok(())
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ConfigRecordWire {
    page_size: U64,
    max_fault_events: U64,
    num_fillers: U64,
    num_evictors: U64,
    buffer_capacity: U64,
    low_water: I32,
    high_water: I32,
}

const _: () = assert!(std::mem::size_of::<ConfigRecordWire>() == CONFIG_RECORD_SIZE);

/// Service-side region options sent back with a mapping, so the client
/// interprets the shared region with the same page size and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigRecord {
    pub page_size: u64,
    pub max_fault_events: u64,
    pub num_fillers: u64,
    pub num_evictors: u64,
    pub buffer_capacity: u64,
    pub low_water: u8,
    pub high_water: u8,
}

impl From<&RegionConfig> for ConfigRecord {
    fn from(config: &RegionConfig) -> Self {
        Self {
            page_size: config.page_size as u64,
            max_fault_events: config.max_fault_events as u64,
            num_fillers: config.num_fillers as u64,
            num_evictors: config.num_evictors as u64,
            buffer_capacity: config.buffer_capacity as u64,
            low_water: config.low_water,
            high_water: config.high_water,
        }
    }
}

impl ConfigRecord {
    pub fn encode(&self) -> [u8; CONFIG_RECORD_SIZE] {
        let wire = ConfigRecordWire {
            page_size: U64::new(self.page_size),
            max_fault_events: U64::new(self.max_fault_events),
            num_fillers: U64::new(self.num_fillers),
            num_evictors: U64::new(self.num_evictors),
            buffer_capacity: U64::new(self.buffer_capacity),
            low_water: I32::new(self.low_water as i32),
            high_water: I32::new(self.high_water as i32),
        };
        let mut out = [0u8; CONFIG_RECORD_SIZE];
        out.copy_from_slice(wire.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= CONFIG_RECORD_SIZE,
            "config record too short: {} < {}",
            bytes.len(),
            CONFIG_RECORD_SIZE
        );
        let wire = ConfigRecordWire::ref_from_bytes(&bytes[..CONFIG_RECORD_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse config record: {:?}", e))?;

        let percent = |raw: i32, name: &str| -> Result<u8> {
            ensure!(
                (0..=100).contains(&raw),
                "{} watermark {} is not a percentage",
                name,
                raw
            );
            Ok(raw as u8)
        };

        Ok(Self {
            page_size: wire.page_size.get(),
            max_fault_events: wire.max_fault_events.get(),
            num_fillers: wire.num_fillers.get(),
            num_evictors: wire.num_evictors.get(),
            buffer_capacity: wire.buffer_capacity.get(),
            low_water: percent(wire.low_water.get(), "low")?,
            high_water: percent(wire.high_water.get(), "high")?,
        })
    }

    /// `base` with this record's options applied, validated.
    pub fn apply(&self, base: &RegionConfig) -> Result<RegionConfig> {
        let mut config = base.clone();
        config.page_size = self.page_size as usize;
        config.max_fault_events = self.max_fault_events as usize;
        config.num_fillers = self.num_fillers as usize;
        config.num_evictors = self.num_evictors as usize;
        config.buffer_capacity = self.buffer_capacity as usize;
        config.low_water = self.low_water;
        config.high_water = self.high_water;
        config.validate()?;
        Ok(config)
    }
}
