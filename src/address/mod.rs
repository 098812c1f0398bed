//! BACnet Address Cache Module
//!
//! Maps device instance numbers to datalink addresses together with the
//! peer's APDU and segmentation capabilities. The cache drives client-side
//! binding: a `bind_request` that misses reserves a slot, and the caller
//! broadcasts a Who-Is; the eventual I-Am lands in `add` and completes the
//! binding.
//!
//! Entry lifecycle:
//! - An entry created from an overheard I-Am is *opportunistic* and lives on
//!   a short TTL; the first explicit `bind_request` hit promotes it to the
//!   long TTL.
//! - Entries created by `bind_request` wait with the bind-request flag set
//!   and are skipped by lookups and the list encoders.
//! - Static entries (from the persisted cache file) never expire.
//! - When the table is full the entry nearest expiry is reclaimed, bound
//!   entries first, then outstanding bind requests.
//!
//! The cache can be persisted as a line-oriented text file,
//! `device-id mac snet sadr max-apdu` per line with `;` comments:
//!
//! ```text
//! ;DeviceID MAC SNET SADR MAX-APDU
//! 4194303 05 0 0 50
//! 55555 C0:A8:00:18:BA:C0 26001 19 480
//! ```

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::{string::String, vec::Vec};

use bitflags::bitflags;

use crate::encoding::{
    encode_application_object_id, encode_application_octet_string, encode_application_unsigned,
    ObjectIdentifier, ObjectType,
};
use crate::network::BacnetAddress;

/// Result type for address-cache operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, AddressError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, AddressError>;

/// Errors that can occur in address-cache operations
#[derive(Debug)]
pub enum AddressError {
    /// Cache file could not be read or written
    #[cfg(feature = "std")]
    Io(std::io::Error),
    /// Cache file line could not be parsed
    Parse(String),
    /// Encoding of a cache entry failed
    Encoding(crate::encoding::EncodingError),
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "std")]
            AddressError::Io(e) => write!(f, "Cache file I/O error: {}", e),
            AddressError::Parse(msg) => write!(f, "Cache file parse error: {}", msg),
            AddressError::Encoding(e) => write!(f, "Entry encoding error: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl Error for AddressError {}

#[cfg(feature = "std")]
impl From<std::io::Error> for AddressError {
    fn from(error: std::io::Error) -> Self {
        AddressError::Io(error)
    }
}

impl From<crate::encoding::EncodingError> for AddressError {
    fn from(error: crate::encoding::EncodingError) -> Self {
        AddressError::Encoding(error)
    }
}

/// Segmentation support advertised by a peer (BACnetSegmentation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Segmentation {
    Both = 0,
    Transmit = 1,
    Receive = 2,
    #[default]
    None = 3,
}

impl Segmentation {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Both),
            1 => Some(Self::Transmit),
            2 => Some(Self::Receive),
            3 => Some(Self::None),
            _ => None,
        }
    }

    /// Can this peer reassemble a segmented message we send?
    pub fn can_receive(&self) -> bool {
        matches!(self, Self::Both | Self::Receive)
    }
}

bitflags! {
    /// State flags for cache entries
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        /// Entry in use
        const IN_USE = 0x01;
        /// Bind request outstanding for entry
        const BIND_REQUEST = 0x02;
        /// Static address mapping, does not expire
        const STATIC = 0x04;
        /// Opportunistically added address with short TTL
        const SHORT_TTL = 0x08;
        /// Freed up but held for the caller to fill
        const RESERVED = 0x80;
    }
}

/// One hour, the short (opportunistic) time to live
pub const TTL_SHORT_SECS: u32 = 3600;

/// One day, the normal bound-entry time to live
pub const TTL_LONG_SECS: u32 = 86400;

/// Permanent entry marker used for static entries
pub const TTL_FOREVER: u32 = u32::MAX;

/// The capability tuple returned by a successful lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub address: BacnetAddress,
    pub max_apdu: usize,
    pub segmentation: Segmentation,
    pub max_segments: u32,
}

#[derive(Debug, Clone, Default)]
struct CacheEntry {
    flags: EntryFlags,
    device_id: u32,
    max_apdu: usize,
    segmentation: Segmentation,
    max_segments: u32,
    address: BacnetAddress,
    ttl_seconds: u32,
}

impl CacheEntry {
    fn is_bound(&self) -> bool {
        self.flags.contains(EntryFlags::IN_USE) && !self.flags.contains(EntryFlags::BIND_REQUEST)
    }
}

/// ReadRange request forms supported for the address list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadRangeSpec {
    /// All items
    ReadAll,
    /// `count` items starting at 1-based position `index`; a negative count
    /// reads backwards from `index`
    ByPosition { index: u32, count: i32 },
}

/// ReadRange reply: result flags plus the encoded item list
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadRangeResult {
    pub first_item: bool,
    pub last_item: bool,
    pub more_items: bool,
    pub item_count: u32,
    pub data: Vec<u8>,
}

/// The device address cache
#[derive(Debug)]
pub struct AddressCache {
    entries: Vec<CacheEntry>,
    /// Entries below this index were loaded from the cache file and are
    /// protected from reclaim
    top_protected: usize,
    own_device_id: Option<u32>,
}

impl AddressCache {
    /// Create an empty cache with a fixed capacity
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, CacheEntry::default);
        Self {
            entries,
            top_protected: 0,
            own_device_id: None,
        }
    }

    /// Set our own device instance so overheard I-Ams from ourselves are
    /// never cached
    pub fn set_own_device_id(&mut self, device_id: u32) {
        self.own_device_id = Some(device_id);
    }

    /// Number of bound entries
    pub fn count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_bound()).count()
    }

    fn find(&self, device_id: u32) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.flags.contains(EntryFlags::IN_USE) && e.device_id == device_id
        })
    }

    /// Reclaim the entry nearest expiry: bound entries first, outstanding
    /// bind requests as a last resort. Static entries are never touched.
    fn remove_oldest(&mut self) -> Option<usize> {
        let mut candidate: Option<usize> = None;
        let mut shortest = TTL_FOREVER - 1;

        for index in self.top_protected..self.entries.len() {
            let e = &self.entries[index];
            if e.flags & (EntryFlags::IN_USE | EntryFlags::BIND_REQUEST | EntryFlags::STATIC)
                == EntryFlags::IN_USE
                && e.ttl_seconds <= shortest
            {
                shortest = e.ttl_seconds;
                candidate = Some(index);
            }
        }

        if candidate.is_none() {
            shortest = TTL_FOREVER - 1;
            for index in self.top_protected..self.entries.len() {
                let e = &self.entries[index];
                if e.flags & (EntryFlags::IN_USE | EntryFlags::BIND_REQUEST | EntryFlags::STATIC)
                    == EntryFlags::IN_USE | EntryFlags::BIND_REQUEST
                    && e.ttl_seconds <= shortest
                {
                    shortest = e.ttl_seconds;
                    candidate = Some(index);
                }
            }
        }

        if let Some(index) = candidate {
            log::debug!(
                "address cache: reclaiming device {} for reuse",
                self.entries[index].device_id
            );
            let e = &mut self.entries[index];
            e.flags = EntryFlags::RESERVED;
            e.ttl_seconds = TTL_SHORT_SECS;
        }
        candidate
    }

    fn free_slot(&mut self) -> Option<usize> {
        let free = self
            .entries
            .iter()
            .position(|e| !e.flags.intersects(EntryFlags::IN_USE | EntryFlags::RESERVED));
        match free {
            Some(index) => Some(index),
            None => self.remove_oldest(),
        }
    }

    /// Add or refresh a device from an overheard I-Am.
    ///
    /// An update to an entry with an outstanding bind request completes the
    /// binding on the long TTL; a brand new entry is opportunistic and gets
    /// the short TTL.
    pub fn add(&mut self, device_id: u32, max_apdu: usize, address: &BacnetAddress) {
        self.add_binding_full(device_id, max_apdu, Segmentation::None, 0, address, true)
    }

    /// Record an I-Am: like [`AddressCache::add`] but carrying the
    /// announced segmentation support.
    pub fn observe_i_am(
        &mut self,
        device_id: u32,
        max_apdu: usize,
        segmentation: Segmentation,
        address: &BacnetAddress,
    ) {
        self.add_binding_full(device_id, max_apdu, segmentation, 0, address, true)
    }

    /// Add or refresh a device with full capability information from a
    /// solicited binding.
    pub fn add_binding(
        &mut self,
        device_id: u32,
        max_apdu: usize,
        segmentation: Segmentation,
        max_segments: u32,
        address: &BacnetAddress,
    ) {
        self.add_binding_full(device_id, max_apdu, segmentation, max_segments, address, false)
    }

    fn add_binding_full(
        &mut self,
        device_id: u32,
        max_apdu: usize,
        segmentation: Segmentation,
        max_segments: u32,
        address: &BacnetAddress,
        opportunistic: bool,
    ) {
        if self.own_device_id == Some(device_id) {
            return;
        }

        if let Some(index) = self.find(device_id) {
            let e = &mut self.entries[index];
            e.address = address.clone();
            e.max_apdu = max_apdu;
            e.segmentation = segmentation;
            e.max_segments = max_segments;
            e.ttl_seconds = if e.flags.contains(EntryFlags::BIND_REQUEST) {
                TTL_LONG_SECS
            } else if e.flags.contains(EntryFlags::STATIC) {
                TTL_FOREVER
            } else if e.flags.contains(EntryFlags::SHORT_TTL) {
                TTL_SHORT_SECS
            } else {
                TTL_LONG_SECS
            };
            e.flags.remove(EntryFlags::BIND_REQUEST);
            return;
        }

        if let Some(index) = self.free_slot() {
            let e = &mut self.entries[index];
            e.flags = if opportunistic {
                EntryFlags::IN_USE | EntryFlags::SHORT_TTL
            } else {
                EntryFlags::IN_USE
            };
            e.device_id = device_id;
            e.max_apdu = max_apdu;
            e.segmentation = segmentation;
            e.max_segments = max_segments;
            e.address = address.clone();
            e.ttl_seconds = if opportunistic {
                TTL_SHORT_SECS
            } else {
                TTL_LONG_SECS
            };
        }
    }

    /// Look up the capability tuple for a bound device
    pub fn get_by_device(&self, device_id: u32) -> Option<Binding> {
        let index = self.find(device_id)?;
        let e = &self.entries[index];
        if !e.is_bound() {
            return None;
        }
        Some(Binding {
            address: e.address.clone(),
            max_apdu: e.max_apdu,
            segmentation: e.segmentation,
            max_segments: e.max_segments,
        })
    }

    /// Reverse lookup: which device id answers at this address?
    pub fn get_device_id(&self, address: &BacnetAddress) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.is_bound() && e.address.matches(address))
            .map(|e| e.device_id)
    }

    /// Remove a device from the cache
    pub fn remove(&mut self, device_id: u32) {
        if let Some(index) = self.find(device_id) {
            self.entries[index].flags = EntryFlags::empty();
            if index < self.top_protected {
                self.top_protected -= 1;
            }
        }
    }

    /// Query-and-reserve: if the device is bound, return its address and
    /// promote an opportunistic entry to the long TTL. Otherwise make sure a
    /// bind-request slot exists and return `None`; the caller should emit a
    /// Who-Is for the device.
    pub fn bind_request(&mut self, device_id: u32) -> Option<(BacnetAddress, usize)> {
        if let Some(index) = self.find(device_id) {
            let e = &mut self.entries[index];
            if e.flags.contains(EntryFlags::BIND_REQUEST) {
                // still waiting for the I-Am
                return None;
            }
            if e.flags.contains(EntryFlags::SHORT_TTL) {
                e.flags.remove(EntryFlags::SHORT_TTL);
                e.ttl_seconds = TTL_LONG_SECS;
            }
            return Some((e.address.clone(), e.max_apdu));
        }

        if let Some(index) = self.free_slot() {
            let e = &mut self.entries[index];
            e.flags = EntryFlags::IN_USE | EntryFlags::BIND_REQUEST;
            e.device_id = device_id;
            // no point leaving bind requests in for the long haul
            e.ttl_seconds = TTL_SHORT_SECS;
        }
        None
    }

    /// Set the TTL for a device; a bound entry can also be flipped to or
    /// from static here.
    pub fn set_device_ttl(&mut self, device_id: u32, ttl_seconds: u32, static_entry: bool) {
        if let Some(index) = self.find(device_id) {
            let e = &mut self.entries[index];
            if !e.flags.contains(EntryFlags::BIND_REQUEST) {
                if static_entry {
                    e.flags.insert(EntryFlags::STATIC);
                    e.ttl_seconds = TTL_FOREVER;
                } else {
                    e.flags.remove(EntryFlags::STATIC);
                    e.ttl_seconds = ttl_seconds;
                }
            } else {
                e.ttl_seconds = ttl_seconds;
            }
        }
    }

    /// Age the cache. Static entries are never decremented; any other entry
    /// whose remaining TTL does not cover the elapsed time is freed.
    pub fn timer_seconds(&mut self, seconds: u32) {
        for e in self.entries.iter_mut() {
            if e.flags.intersects(EntryFlags::IN_USE | EntryFlags::RESERVED)
                && !e.flags.contains(EntryFlags::STATIC)
            {
                if e.ttl_seconds > seconds {
                    e.ttl_seconds -= seconds;
                } else {
                    e.flags = EntryFlags::empty();
                }
            }
        }
    }

    /// Return a bound entry by table index (sparse; unbound slots yield None)
    pub fn get_by_index(&self, index: usize) -> Option<(u32, Binding)> {
        let e = self.entries.get(index)?;
        if !e.is_bound() {
            return None;
        }
        Some((
            e.device_id,
            Binding {
                address: e.address.clone(),
                max_apdu: e.max_apdu,
                segmentation: e.segmentation,
                max_segments: e.max_segments,
            },
        ))
    }

    fn encode_entry(e: &CacheEntry, buffer: &mut Vec<u8>) -> Result<()> {
        encode_application_object_id(
            buffer,
            &ObjectIdentifier::new(ObjectType::Device, e.device_id),
        )?;
        encode_application_unsigned(buffer, e.address.network as u32)?;
        if e.address.network != 0 {
            encode_application_octet_string(buffer, &e.address.remote)?;
        } else {
            encode_application_octet_string(buffer, &e.address.mac)?;
        }
        Ok(())
    }

    /// Encode the whole bound-device list (the device-address-binding
    /// property). The backing store is sparse; the output is contiguous.
    pub fn encode_list(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        for e in self.entries.iter().filter(|e| e.is_bound()) {
            Self::encode_entry(e, &mut buffer)?;
        }
        Ok(buffer)
    }

    /// Encode a ReadRange window over the bound-device list.
    ///
    /// `max_bytes` bounds the encoded item data; when it stops encoding
    /// early the more-items flag is raised.
    pub fn encode_range(&self, spec: ReadRangeSpec, max_bytes: usize) -> Result<ReadRangeResult> {
        let bound: Vec<&CacheEntry> = self.entries.iter().filter(|e| e.is_bound()).collect();
        let total = bound.len() as u32;
        let mut result = ReadRangeResult::default();

        if total == 0 {
            result.last_item = true;
            return Ok(result);
        }

        let (start, requested) = match spec {
            ReadRangeSpec::ReadAll => (1u32, total),
            ReadRangeSpec::ByPosition { index, count } => {
                if count == 0 || index == 0 || index > total {
                    result.last_item = index > total;
                    return Ok(result);
                }
                if count > 0 {
                    (index, (count as u32).min(total - index + 1))
                } else {
                    let back = (-count) as u32;
                    let start = index.saturating_sub(back - 1).max(1);
                    (start, index - start + 1)
                }
            }
        };

        for position in start..start + requested {
            let mut item = Vec::new();
            Self::encode_entry(bound[(position - 1) as usize], &mut item)?;
            if result.data.len() + item.len() > max_bytes {
                result.more_items = true;
                break;
            }
            result.data.extend_from_slice(&item);
            result.item_count += 1;
        }

        result.first_item = result.item_count > 0 && start == 1;
        result.last_item =
            result.item_count > 0 && !result.more_items && start + result.item_count - 1 == total;
        Ok(result)
    }

    /// Load static bindings from the cache file format. Loaded entries are
    /// static and protected from reclaim.
    #[cfg(feature = "std")]
    pub fn load_file(&mut self, path: &std::path::Path) -> Result<usize> {
        let text = std::fs::read_to_string(path)?;
        let mut loaded = 0;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 5 {
                return Err(AddressError::Parse(format!("expected 5 fields: {:?}", line)));
            }
            let device_id: u32 = fields[0]
                .parse()
                .map_err(|_| AddressError::Parse(format!("bad device id: {}", fields[0])))?;
            let mac = crate::util::mac_from_ascii(fields[1])
                .ok_or_else(|| AddressError::Parse(format!("bad MAC: {}", fields[1])))?;
            let snet: u16 = fields[2]
                .parse()
                .map_err(|_| AddressError::Parse(format!("bad SNET: {}", fields[2])))?;
            let remote = if snet != 0 {
                crate::util::mac_from_ascii(fields[3])
                    .ok_or_else(|| AddressError::Parse(format!("bad SADR: {}", fields[3])))?
            } else {
                Vec::new()
            };
            let max_apdu: usize = fields[4]
                .parse()
                .map_err(|_| AddressError::Parse(format!("bad max-APDU: {}", fields[4])))?;

            let address = BacnetAddress {
                network: snet,
                mac,
                remote,
            };
            self.add_binding(device_id, max_apdu, Segmentation::None, 0, &address);
            self.set_device_ttl(device_id, 0, true);
            loaded += 1;
        }
        // everything loaded so far is protected
        self.top_protected = self
            .entries
            .iter()
            .position(|e| !e.flags.contains(EntryFlags::IN_USE))
            .unwrap_or(self.entries.len());
        Ok(loaded)
    }

    /// Save the bound entries in the cache file format
    #[cfg(feature = "std")]
    pub fn save_file(&self, path: &std::path::Path) -> Result<()> {
        use std::fmt::Write as _;

        let mut out = String::from(";DeviceID MAC SNET SADR MAX-APDU\n");
        for e in self.entries.iter().filter(|e| e.is_bound()) {
            let mac = crate::util::mac_to_ascii(&e.address.mac);
            let sadr = if e.address.network != 0 {
                crate::util::mac_to_ascii(&e.address.remote)
            } else {
                String::from("0")
            };
            let _ = writeln!(
                out,
                "{} {} {} {} {}",
                e.device_id, mac, e.address.network, sadr, e.max_apdu
            );
        }
        std::fs::write(path, out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip_address(last_octet: u8) -> BacnetAddress {
        BacnetAddress::local(vec![10, 0, 0, last_octet, 0xBA, 0xC0])
    }

    #[test]
    fn test_bind_request_reserves_then_binds() {
        let mut cache = AddressCache::new(8);

        // miss reserves a bind-request slot and asks for a Who-Is
        assert!(cache.bind_request(123).is_none());
        // still pending, no binding visible
        assert!(cache.get_by_device(123).is_none());

        // I-Am arrives
        cache.add(123, 480, &ip_address(1));
        let (address, max_apdu) = cache.bind_request(123).unwrap();
        assert_eq!(address, ip_address(1));
        assert_eq!(max_apdu, 480);
        let binding = cache.get_by_device(123).unwrap();
        assert_eq!(binding.max_apdu, 480);
    }

    #[test]
    fn test_opportunistic_promotion() {
        let mut cache = AddressCache::new(8);

        // overheard I-Am: short TTL, expires after an hour
        cache.add(55, 1476, &ip_address(2));
        cache.timer_seconds(TTL_SHORT_SECS + 1);
        assert!(cache.get_by_device(55).is_none());

        // overheard again, but promoted by an explicit bind request
        cache.add(55, 1476, &ip_address(2));
        assert!(cache.bind_request(55).is_some());
        cache.timer_seconds(TTL_SHORT_SECS + 1);
        assert!(cache.get_by_device(55).is_some(), "promoted entry outlives short TTL");
    }

    #[test]
    fn test_static_entries_never_expire() {
        let mut cache = AddressCache::new(8);
        cache.add_binding(7, 480, Segmentation::Both, 16, &ip_address(7));
        cache.set_device_ttl(7, 0, true);
        cache.timer_seconds(u32::MAX - 1);
        assert!(cache.get_by_device(7).is_some());
    }

    #[test]
    fn test_own_device_never_cached() {
        let mut cache = AddressCache::new(8);
        cache.set_own_device_id(99);
        cache.add(99, 480, &ip_address(9));
        assert!(cache.get_by_device(99).is_none());
    }

    #[test]
    fn test_reverse_lookup() {
        let mut cache = AddressCache::new(8);
        cache.add_binding(42, 480, Segmentation::None, 0, &ip_address(5));
        assert_eq!(cache.get_device_id(&ip_address(5)), Some(42));
        assert_eq!(cache.get_device_id(&ip_address(6)), None);
    }

    #[test]
    fn test_full_table_reclaims_entry_nearest_expiry() {
        let mut cache = AddressCache::new(2);
        cache.add_binding(1, 480, Segmentation::None, 0, &ip_address(1));
        cache.add_binding(2, 480, Segmentation::None, 0, &ip_address(2));
        cache.set_device_ttl(1, 100, false);
        cache.set_device_ttl(2, 50, false);

        // full table: adding a third device reclaims the entry nearest expiry
        cache.add(3, 480, &ip_address(3));
        assert!(cache.get_by_device(2).is_none());
        assert!(cache.get_by_device(1).is_some());
        assert!(cache.get_by_device(3).is_some());
    }

    #[test]
    fn test_at_most_one_entry_per_device() {
        let mut cache = AddressCache::new(8);
        cache.add(10, 480, &ip_address(1));
        cache.add(10, 1024, &ip_address(2));
        assert_eq!(cache.count(), 1);
        assert_eq!(cache.get_by_device(10).unwrap().max_apdu, 1024);
    }

    #[test]
    fn test_encode_list_skips_pending_binds() {
        let mut cache = AddressCache::new(8);
        cache.add_binding(1, 480, Segmentation::None, 0, &ip_address(1));
        cache.bind_request(2); // pending, must not appear
        let list = cache.encode_list().unwrap();

        // one entry: object id (5) + unsigned net (2) + octet string (2+6)
        assert_eq!(list.len(), 5 + 2 + 8);
        assert_eq!(list[0], 0xC4); // application object-id tag
    }

    #[test]
    fn test_encode_range_by_position() {
        let mut cache = AddressCache::new(8);
        for i in 1..=5 {
            cache.add_binding(i, 480, Segmentation::None, 0, &ip_address(i as u8));
        }

        let all = cache.encode_range(ReadRangeSpec::ReadAll, 4096).unwrap();
        assert!(all.first_item && all.last_item && !all.more_items);
        assert_eq!(all.item_count, 5);

        let window = cache
            .encode_range(ReadRangeSpec::ByPosition { index: 2, count: 2 }, 4096)
            .unwrap();
        assert!(!window.first_item && !window.last_item);
        assert_eq!(window.item_count, 2);

        let tail = cache
            .encode_range(ReadRangeSpec::ByPosition { index: 4, count: 10 }, 4096)
            .unwrap();
        assert!(tail.last_item);
        assert_eq!(tail.item_count, 2);

        let backwards = cache
            .encode_range(ReadRangeSpec::ByPosition { index: 2, count: -2 }, 4096)
            .unwrap();
        assert!(backwards.first_item);
        assert_eq!(backwards.item_count, 2);
    }

    #[test]
    fn test_encode_range_buffer_cap_raises_more_items() {
        let mut cache = AddressCache::new(8);
        for i in 1..=5 {
            cache.add_binding(i, 480, Segmentation::None, 0, &ip_address(i as u8));
        }
        let capped = cache.encode_range(ReadRangeSpec::ReadAll, 20).unwrap();
        assert!(capped.more_items);
        assert!(capped.item_count < 5);
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_file_round_trip() {
        let mut cache = AddressCache::new(8);
        cache.add_binding(55555, 480, Segmentation::None, 0, &BacnetAddress {
            network: 26001,
            mac: vec![0xC0, 0xA8, 0x00, 0x18, 0xBA, 0xC0],
            remote: vec![0x19],
        });
        cache.add_binding(1234, 1476, Segmentation::None, 0, &ip_address(3));

        let path = std::env::temp_dir().join("bacnet_core_address_cache_test");
        cache.save_file(&path).unwrap();

        let mut restored = AddressCache::new(8);
        let loaded = restored.load_file(&path).unwrap();
        assert_eq!(loaded, 2);
        let binding = restored.get_by_device(55555).unwrap();
        assert_eq!(binding.address.network, 26001);
        assert_eq!(binding.address.remote, vec![0x19]);
        // file entries are static
        restored.timer_seconds(u32::MAX - 1);
        assert!(restored.get_by_device(55555).is_some());
        let _ = std::fs::remove_file(&path);
    }
}
