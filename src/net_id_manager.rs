//! Network id bookkeeping
//!
//! Maps an interface name to a locally issued network id. Each consumer type
//! (Wi-Fi, mobile, MMS, ...) holds one bit of the entry's type mask; the id stays
//! live while any bit is set and is recycled only after the owner forgets it.

use crate::error::NetIdError;
use crate::types::NetworkType;
use std::collections::{BTreeSet, HashMap};

/// Snapshot of one leased id. Callers hold copies, never references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetIdInfo {
    pub net_id: i32,
    /// One bit per consumer type currently holding the network
    pub types: u32,
}

/// Interface name -> network id map with per-type reference bits
#[derive(Debug)]
pub struct NetIdManager {
    /// Primary interfaces, one entry per leased id
    interfaces: HashMap<String, NetIdInfo>,

    /// Secondary interfaces attached to an existing id
    secondary: HashMap<String, i32>,

    next_id: i32,
    min_id: i32,
    max_id: i32,

    /// Ids returned by `forget`, handed out again once `next_id` passes `max_id`
    recycled: BTreeSet<i32>,
}

impl Default for NetIdManager {
    fn default() -> Self {
        Self::with_range(100, 65535)
    }
}

impl NetIdManager {
    /// Issue ids from `min_id..=max_id`
    pub fn with_range(min_id: i32, max_id: i32) -> Self {
        Self {
            interfaces: HashMap::new(),
            secondary: HashMap::new(),
            next_id: min_id,
            min_id,
            max_id,
            recycled: BTreeSet::new(),
        }
    }

    /// Entry for `ifname`, primary or secondary
    pub fn lookup(&self, ifname: &str) -> Option<NetIdInfo> {
        if let Some(info) = self.interfaces.get(ifname) {
            return Some(*info);
        }
        self.secondary
            .get(ifname)
            .and_then(|net_id| self.lookup_by_net_id(*net_id))
    }

    /// Reverse lookup over primary interfaces
    pub fn lookup_by_net_id(&self, net_id: i32) -> Option<NetIdInfo> {
        self.interfaces.values().find(|info| info.net_id == net_id).copied()
    }

    /// Take a reference on `ifname` for `network_type`, allocating an id on first use
    pub fn acquire(&mut self, ifname: &str, network_type: NetworkType) -> Result<NetIdInfo, NetIdError> {
        let bit = network_type
            .bit()
            .ok_or(NetIdError::InvalidNetworkType(network_type.0))?;

        if let Some(info) = self.interfaces.get_mut(ifname) {
            info.types |= bit;
            log::debug!("Acquired net id {} for {} (types {:#x})", info.net_id, ifname, info.types);
            return Ok(*info);
        }

        let net_id = self.allocate()?;
        let info = NetIdInfo { net_id, types: bit };
        self.interfaces.insert(ifname.to_string(), info);
        log::debug!("Allocated net id {} for {}", net_id, ifname);

        Ok(info)
    }

    /// Drop the `network_type` reference; the returned mask tells the caller
    /// whether the network is still needed.
    pub fn release(&mut self, ifname: &str, network_type: NetworkType) -> Result<NetIdInfo, NetIdError> {
        let bit = network_type
            .bit()
            .ok_or(NetIdError::InvalidNetworkType(network_type.0))?;
        let info = self
            .interfaces
            .get_mut(ifname)
            .ok_or_else(|| NetIdError::UnknownInterface(ifname.to_string()))?;

        info.types &= !bit;
        log::debug!("Released net id {} for {} (types {:#x})", info.net_id, ifname, info.types);

        Ok(*info)
    }

    /// Erase a fully released entry and make its id reusable
    pub fn forget(&mut self, ifname: &str) -> Option<NetIdInfo> {
        let info = self.interfaces.remove(ifname)?;
        self.secondary.retain(|_, net_id| *net_id != info.net_id);
        self.recycled.insert(info.net_id);
        Some(info)
    }

    /// Attach a secondary interface to the network behind `info`
    pub fn add_interface_to_network(&mut self, ifname: &str, info: &NetIdInfo) -> Result<(), NetIdError> {
        if self.lookup_by_net_id(info.net_id).is_none() {
            return Err(NetIdError::UnknownNetId(info.net_id));
        }
        if !self.interfaces.contains_key(ifname) {
            self.secondary.insert(ifname.to_string(), info.net_id);
        }
        Ok(())
    }

    /// Detach a secondary interface
    pub fn remove_interface_to_network(&mut self, ifname: &str, info: &NetIdInfo) -> Result<(), NetIdError> {
        match self.secondary.get(ifname) {
            Some(net_id) if *net_id == info.net_id => {
                self.secondary.remove(ifname);
                Ok(())
            }
            Some(_) => Err(NetIdError::UnknownInterface(ifname.to_string())),
            // Primary interfaces stay mapped until their last consumer releases them
            None if self.interfaces.contains_key(ifname) => Ok(()),
            None => Err(NetIdError::UnknownInterface(ifname.to_string())),
        }
    }

    /// Number of live primary entries
    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    fn allocate(&mut self) -> Result<i32, NetIdError> {
        if self.next_id <= self.max_id {
            let id = self.next_id;
            self.next_id += 1;
            return Ok(id);
        }
        self.recycled.pop_first().ok_or(NetIdError::Exhausted {
            min: self.min_id,
            max: self.max_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_before_acquire() {
        let mut manager = NetIdManager::default();
        assert!(manager.lookup("wlan0").is_none());

        let info = manager.acquire("wlan0", NetworkType::WIFI).unwrap();
        assert_eq!(manager.lookup("wlan0"), Some(info));
        assert_eq!(manager.lookup_by_net_id(info.net_id), Some(info));
    }

    #[test]
    fn test_shared_interface_reference_bits() {
        let mut manager = NetIdManager::default();

        let wifi = manager.acquire("wlan0", NetworkType::WIFI).unwrap();
        let mobile = manager.acquire("wlan0", NetworkType::MOBILE).unwrap();
        assert_eq!(wifi.net_id, mobile.net_id);
        assert_eq!(mobile.types, NetworkType::WIFI.bit().unwrap() | NetworkType::MOBILE.bit().unwrap());

        let after_wifi = manager.release("wlan0", NetworkType::WIFI).unwrap();
        assert_eq!(after_wifi.types, NetworkType::MOBILE.bit().unwrap());
        assert_eq!(after_wifi.net_id, wifi.net_id);
        assert!(manager.lookup("wlan0").is_some());

        let after_mobile = manager.release("wlan0", NetworkType::MOBILE).unwrap();
        assert_eq!(after_mobile.types, 0);
    }

    #[test]
    fn test_mask_follows_sequence() {
        let mut manager = NetIdManager::default();
        let ops = [
            (true, NetworkType::MOBILE),
            (true, NetworkType::MOBILE_MMS),
            (false, NetworkType::MOBILE),
            (true, NetworkType::MOBILE_SUPL),
            (false, NetworkType::MOBILE_SUPL),
            (true, NetworkType::MOBILE),
        ];

        let mut expected = 0u32;
        for (acquire, ty) in ops {
            let info = if acquire {
                expected |= ty.bit().unwrap();
                manager.acquire("rmnet0", ty).unwrap()
            } else {
                expected &= !ty.bit().unwrap();
                manager.release("rmnet0", ty).unwrap()
            };
            assert_eq!(info.types, expected);
        }
    }

    #[test]
    fn test_distinct_interfaces_distinct_ids() {
        let mut manager = NetIdManager::default();
        let a = manager.acquire("wlan0", NetworkType::WIFI).unwrap();
        let b = manager.acquire("rmnet0", NetworkType::MOBILE).unwrap();
        assert_ne!(a.net_id, b.net_id);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_release_unknown_interface() {
        let mut manager = NetIdManager::default();
        assert_eq!(
            manager.release("eth0", NetworkType::ETHERNET),
            Err(NetIdError::UnknownInterface("eth0".to_string()))
        );
    }

    #[test]
    fn test_invalid_network_type() {
        let mut manager = NetIdManager::default();
        assert_eq!(
            manager.acquire("wlan0", NetworkType::UNKNOWN),
            Err(NetIdError::InvalidNetworkType(-1))
        );
        assert!(manager.is_empty());
    }

    #[test]
    fn test_ids_recycled_only_after_forget() {
        let mut manager = NetIdManager::with_range(100, 101);

        let a = manager.acquire("a", NetworkType::WIFI).unwrap();
        let b = manager.acquire("b", NetworkType::WIFI).unwrap();
        assert_eq!((a.net_id, b.net_id), (100, 101));

        assert!(matches!(
            manager.acquire("c", NetworkType::WIFI),
            Err(NetIdError::Exhausted { min: 100, max: 101 })
        ));

        manager.release("a", NetworkType::WIFI).unwrap();
        assert!(manager.acquire("c", NetworkType::WIFI).is_err());

        manager.forget("a");
        assert!(manager.lookup("a").is_none());
        let c = manager.acquire("c", NetworkType::WIFI).unwrap();
        assert_eq!(c.net_id, 100);
    }

    #[test]
    fn test_monotonic_before_wrap() {
        let mut manager = NetIdManager::default();
        let a = manager.acquire("a", NetworkType::WIFI).unwrap();
        manager.release("a", NetworkType::WIFI).unwrap();
        manager.forget("a");

        let b = manager.acquire("b", NetworkType::WIFI).unwrap();
        assert_eq!(b.net_id, a.net_id + 1);
    }

    #[test]
    fn test_secondary_interface() {
        let mut manager = NetIdManager::default();
        let info = manager.acquire("rmnet0", NetworkType::MOBILE).unwrap();

        manager.add_interface_to_network("v4-rmnet0", &info).unwrap();
        assert_eq!(manager.lookup("v4-rmnet0").map(|i| i.net_id), Some(info.net_id));
        assert_eq!(manager.len(), 1);

        manager.remove_interface_to_network("v4-rmnet0", &info).unwrap();
        assert!(manager.lookup("v4-rmnet0").is_none());
        assert!(manager.lookup("rmnet0").is_some());
    }

    #[test]
    fn test_secondary_requires_live_network() {
        let mut manager = NetIdManager::default();
        let ghost = NetIdInfo { net_id: 4242, types: 0 };
        assert_eq!(
            manager.add_interface_to_network("v4-rmnet0", &ghost),
            Err(NetIdError::UnknownNetId(4242))
        );
    }

    #[test]
    fn test_forget_drops_secondaries() {
        let mut manager = NetIdManager::default();
        let info = manager.acquire("rmnet0", NetworkType::MOBILE).unwrap();
        manager.add_interface_to_network("v4-rmnet0", &info).unwrap();

        manager.release("rmnet0", NetworkType::MOBILE).unwrap();
        manager.forget("rmnet0");
        assert!(manager.lookup("v4-rmnet0").is_none());
    }
}
