//! Shared ACL range objects, deduplicated by (kind, low, high).

use log::{info, warn};
use std::collections::HashMap;
use switchyd_orch_common::{OrchError, OrchResult};
use switchyd_sad::{AclRangeKind, AclRangeOid, SwitchDriver};

struct RangeEntry {
    oid: AclRangeOid,
    ref_count: u32,
}

/// Cache of live range objects. Rules share a range by key; the
/// driver object is created on first use and removed with the last
/// reference.
#[derive(Default)]
pub struct AclRangeCache {
    ranges: HashMap<(AclRangeKind, u16, u16), RangeEntry>,
}

impl AclRangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ref_count(&self, kind: AclRangeKind, low: u16, high: u16) -> Option<u32> {
        self.ranges.get(&(kind, low, high)).map(|e| e.ref_count)
    }

    /// Returns the range handle, creating the object on first use,
    /// and takes one reference.
    pub fn get_or_create(
        &mut self,
        sad: &dyn SwitchDriver,
        kind: AclRangeKind,
        low: u16,
        high: u16,
    ) -> OrchResult<AclRangeOid> {
        if let Some(entry) = self.ranges.get_mut(&(kind, low, high)) {
            entry.ref_count += 1;
            return Ok(entry.oid);
        }

        let oid = sad.create_acl_range(kind, low, high).map_err(OrchError::from)?;
        info!("created ACL range {:?} {}-{}", kind, low, high);
        self.ranges
            .insert((kind, low, high), RangeEntry { oid, ref_count: 1 });
        Ok(oid)
    }

    /// Drops one reference; the last one removes the driver object.
    pub fn release(
        &mut self,
        sad: &dyn SwitchDriver,
        kind: AclRangeKind,
        low: u16,
        high: u16,
    ) {
        let Some(entry) = self.ranges.get_mut(&(kind, low, high)) else {
            warn!("release of unknown ACL range {:?} {}-{}", kind, low, high);
            return;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return;
        }
        let oid = entry.oid;
        self.ranges.remove(&(kind, low, high));
        if let Err(e) = sad.remove_acl_range(oid) {
            warn!("failed to remove ACL range {:?} {}-{}: {}", kind, low, high, e);
        } else {
            info!("removed ACL range {:?} {}-{}", kind, low, high);
        }
    }

    /// Releases the range matching each handle in the list, once per
    /// handle.
    pub fn release_by_oids(&mut self, sad: &dyn SwitchDriver, oids: &[AclRangeOid]) {
        for oid in oids {
            let found = self
                .ranges
                .iter()
                .find(|(_, entry)| entry.oid == *oid)
                .map(|(key, _)| *key);
            if let Some((kind, low, high)) = found {
                self.release(sad, kind, low, high);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyd_sad::{SimConfig, SimDriver};

    #[test]
    fn test_sharing_by_key() {
        let sad = SimDriver::new(SimConfig::default());
        let mut cache = AclRangeCache::new();

        let a = cache
            .get_or_create(&sad, AclRangeKind::L4SrcPort, 1000, 2000)
            .unwrap();
        let b = cache
            .get_or_create(&sad, AclRangeKind::L4SrcPort, 1000, 2000)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.ref_count(AclRangeKind::L4SrcPort, 1000, 2000),
            Some(2)
        );
        assert_eq!(sad.acl_range_count(), 1);

        // A different kind with the same bounds is its own object.
        cache
            .get_or_create(&sad, AclRangeKind::L4DstPort, 1000, 2000)
            .unwrap();
        assert_eq!(cache.len(), 2);

        cache.release(&sad, AclRangeKind::L4SrcPort, 1000, 2000);
        assert_eq!(cache.len(), 2);
        cache.release(&sad, AclRangeKind::L4SrcPort, 1000, 2000);
        assert_eq!(cache.len(), 1);
        assert_eq!(sad.acl_range_count(), 1);
    }

    #[test]
    fn test_release_by_oids_releases_each_once() {
        let sad = SimDriver::new(SimConfig::default());
        let mut cache = AclRangeCache::new();

        let a = cache
            .get_or_create(&sad, AclRangeKind::L4SrcPort, 1, 10)
            .unwrap();
        let b = cache
            .get_or_create(&sad, AclRangeKind::L4DstPort, 1, 10)
            .unwrap();
        // A second reference on the first range.
        cache
            .get_or_create(&sad, AclRangeKind::L4SrcPort, 1, 10)
            .unwrap();

        cache.release_by_oids(&sad, &[a, b]);
        assert_eq!(cache.ref_count(AclRangeKind::L4SrcPort, 1, 10), Some(1));
        assert!(cache.ref_count(AclRangeKind::L4DstPort, 1, 10).is_none());

        cache.release_by_oids(&sad, &[a]);
        assert!(cache.is_empty());
        assert_eq!(sad.acl_range_count(), 0);
    }
}
