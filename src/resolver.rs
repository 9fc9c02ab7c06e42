use crate::cache::SectorCache;
use crate::config::{CHAIN_CAPACITY, SECTORS_PER_TRACK};
use crate::fat::{is_chain_link, DirEntry, FatVolume};
use crate::nic::SectorImage;
use crate::storage::*;
use log::{debug, error, info, warn};
use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no disk image selected")]
    NotSelected,
    #[error("track {track} sector {sector} is past the end of the image")]
    Unmapped { track: u8, sector: u8 },
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

/// Clusters of the selected image, in file order.
#[derive(Clone, Debug)]
pub struct ClusterChain {
    units: [u16; CHAIN_CAPACITY],
    len: usize,
}

impl ClusterChain {
    pub const fn new() -> Self {
        return ClusterChain {
            units: [0; CHAIN_CAPACITY],
            len: 0,
        };
    }

    pub fn clear(&mut self) {
        self.units = [0; CHAIN_CAPACITY];
        self.len = 0;
    }

    /// Returns false once the table is full.
    pub fn push(&mut self, cluster: u16) -> bool {
        if self.len == CHAIN_CAPACITY {
            return false;
        }
        self.units[self.len] = cluster;
        self.len += 1;
        return true;
    }

    pub fn get(&self, slot: usize) -> Option<u16> {
        return self.units[..self.len].get(slot).copied();
    }

    pub fn len(&self) -> usize {
        return self.len;
    }

    pub fn is_empty(&self) -> bool {
        return self.len == 0;
    }

    pub fn is_full(&self) -> bool {
        return self.len == CHAIN_CAPACITY;
    }
}

impl Default for ClusterChain {
    fn default() -> Self {
        return Self::new();
    }
}

/// Where one disk sector lives on the card.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SectorLocation {
    /// Sectors from the start of the image
    pub index: u16,
    /// Position in the cluster chain
    pub slot: usize,
    /// Sector within that cluster
    pub offset: u32,
    /// Absolute card block
    pub block: u32,
}

/// Something that can store a finished NIC sector.
pub trait Persist {
    fn persist(&mut self, image: &SectorImage, track: u8, sector: u8) -> Result<(), ResolveError>;
}

/**
Maps (disk track, sector) onto the selected image's blocks and moves
 them between the card and the sector cache.
*/
pub struct Resolver<'a, S: BlockStorage> {
    storage: S,
    cache: &'a SectorCache,
    chain: ClusterChain,
    volume: Option<FatVolume>,
}

impl<'a, S: BlockStorage> Resolver<'a, S> {
    pub fn new(storage: S, cache: &'a SectorCache) -> Self {
        return Resolver {
            storage,
            cache,
            chain: ClusterChain::new(),
            volume: None,
        };
    }

    pub fn storage(&mut self) -> &mut S {
        return &mut self.storage;
    }

    pub fn cache(&self) -> &'a SectorCache {
        return self.cache;
    }

    pub fn chain(&self) -> &ClusterChain {
        return &self.chain;
    }

    pub fn is_selected(&self) -> bool {
        return self.volume.is_some();
    }

    pub fn unselect(&mut self) {
        self.volume = None;
        self.cache.clear();
    }

    /**
    Select root directory entry `entry` as the disk image and record
     its cluster chain. Chains longer than the table are cut short.
    */
    pub fn select(&mut self, volume: &FatVolume, entry: u16) -> Result<DirEntry, ResolveError> {
        self.unselect();
        self.chain.clear();

        let dir = volume.root_entry(&mut self.storage, entry)?;
        let mut cluster = dir.first_cluster;

        while is_chain_link(cluster) {
            if !self.chain.push(cluster) {
                debug!("chain truncated at {} clusters", self.chain.len());
                break;
            }
            cluster = volume.next_cluster(&mut self.storage, cluster)?;
        }

        info!("image selected, {} clusters", self.chain.len());
        self.volume = Some(*volume);
        return Ok(dir);
    }

    /// Pure address computation for a disk sector.
    pub fn locate(&self, track: u8, sector: u8) -> Result<SectorLocation, ResolveError> {
        let Some(volume) = self.volume.as_ref() else {
            return Err(ResolveError::NotSelected);
        };

        let index = track as u16 * SECTORS_PER_TRACK as u16 + sector as u16;
        let slot = (index >> volume.sectors_per_cluster_log2) as usize;
        let offset = index as u32 & (volume.sectors_per_cluster() - 1);

        let cluster = match self.chain.get(slot) {
            Some(cluster) if is_chain_link(cluster) => cluster,
            _ => {
                return Err(ResolveError::Unmapped { track, sector });
            }
        };

        return Ok(SectorLocation {
            index,
            slot,
            offset,
            block: volume.cluster_block(cluster) + offset,
        });
    }

    /**
    Start loading (track, sector) into the cache. Returns once the read
     is under way; the cache stays invalid until the caller has seen
     `transfer_complete` and marked it ready.
    */
    pub fn refresh(&mut self, track: u8, sector: u8) -> Result<(), ResolveError> {
        if self.storage.transfer_busy() {
            warn!("transfer engine busy, resetting");
            self.storage.reset_transfer();
        }

        let location = match self.locate(track, sector) {
            Ok(location) => location,
            Err(e) => {
                self.cache.invalidate();
                return Err(e);
            }
        };

        self.storage.set_mode(LinkMode::BlockTransfer);

        let storage = &mut self.storage;
        let result = self
            .cache
            .fill(track, sector, |block| storage.read_block(location.block, block));

        if let Err(e) = result {
            warn!("refresh failed t:{} s:{}: {}", track, sector, e);
            return Err(e.into());
        }

        return Ok(());
    }

    pub fn transfer_complete(&self) -> bool {
        return !self.storage.transfer_busy();
    }

    /// Drop any in-flight transfer and give the link back its default mode.
    pub fn release(&mut self) {
        if self.storage.transfer_busy() {
            self.storage.reset_transfer();
        }
        self.storage.set_mode(LinkMode::default());
        self.cache.invalidate();
    }
}

impl<'a, S: BlockStorage> Persist for Resolver<'a, S> {
    fn persist(&mut self, image: &SectorImage, track: u8, sector: u8) -> Result<(), ResolveError> {
        let location = self.locate(track, sector)?;

        if self.storage.transfer_busy() {
            warn!("transfer engine busy, resetting");
            self.storage.reset_transfer();
        }

        self.storage.set_mode(LinkMode::BlockTransfer);

        if let Err(e) = self.storage.write_block(location.block, image) {
            error!("write failed t:{} s:{}: {}", track, sector, e);
            return Err(e.into());
        }

        // The cached copy of this sector, if any, is stale now
        if self.cache.tag() == Some((track, sector)) {
            self.cache.clear();
        }

        return Ok(());
    }
}

#[cfg(test)]
mod test_resolver {
    use super::*;
    use crate::fat::FatVolume;
    use crate::mock::*;

    const NAME: &[u8; 11] = b"DOS33   NIC";

    fn card_with_file(chain: &[u16], blocks: usize) -> (MemCard, FatVolume) {
        let mut card = MemCard::new(blocks);
        let volume = format_fat16(&mut card, 0, 4);
        add_file(&mut card, &volume, 0, NAME, chain);
        stamp_file(&mut card, &volume, chain);
        return (card, volume);
    }

    #[test]
    fn three_clusters_serve_twelve_sectors() {
        let (card, volume) = card_with_file(&[2, 5, 3], 64);
        let cache = SectorCache::new();
        let mut resolver = Resolver::new(card, &cache);
        resolver.select(&volume, 0).unwrap();
        assert_eq!(resolver.chain().len(), 3);

        for sector in 0..12u8 {
            resolver.refresh(0, sector).unwrap();
            assert!(resolver.transfer_complete());
            cache.mark_ready();
            let index = cache.byte(0).unwrap() as u16 | (cache.byte(1).unwrap() as u16) << 8;
            assert_eq!(index, sector as u16);
        }

        assert_eq!(
            resolver.refresh(0, 12),
            Err(ResolveError::Unmapped { track: 0, sector: 12 })
        );
        assert!(!cache.is_ready());
    }

    #[test]
    fn blocks_follow_the_chain_order() {
        let (card, volume) = card_with_file(&[2, 5, 3], 64);
        let cache = SectorCache::new();
        let mut resolver = Resolver::new(card, &cache);
        resolver.select(&volume, 0).unwrap();

        let at = |r: &Resolver<MemCard>, s| r.locate(0, s).unwrap();
        assert_eq!(at(&resolver, 0).block, volume.cluster_block(2));
        assert_eq!(at(&resolver, 4).block, volume.cluster_block(5));
        assert_eq!(at(&resolver, 11).block, volume.cluster_block(3) + 3);
    }

    #[test]
    fn addressing_is_deterministic() {
        // 35 tracks * 16 sectors / 4 per cluster
        let chain: [u16; 140] = core::array::from_fn(|i| i as u16 + 2);
        let mut card = MemCard::new(16);
        let volume = format_fat16(&mut card, 0, 4);
        add_file(&mut card, &volume, 0, NAME, &chain);
        let cache = SectorCache::new();
        let mut resolver = Resolver::new(card, &cache);
        resolver.select(&volume, 0).unwrap();

        for track in 0..35u8 {
            for sector in 0..16u8 {
                let a = resolver.locate(track, sector).unwrap();
                let b = resolver.locate(track, sector).unwrap();
                assert_eq!(a, b);
                assert_eq!(a.index, track as u16 * 16 + sector as u16);
                assert_eq!(a.slot, a.index as usize / 4);
                assert_eq!(a.offset, a.index as u32 % 4);
            }
        }
    }

    #[test]
    fn long_chain_is_truncated() {
        let chain: [u16; 160] = core::array::from_fn(|i| i as u16 + 2);
        let mut card = MemCard::new(16);
        let volume = format_fat16(&mut card, 0, 1);
        add_file(&mut card, &volume, 0, NAME, &chain);
        let cache = SectorCache::new();
        let mut resolver = Resolver::new(card, &cache);

        resolver.select(&volume, 0).unwrap();
        assert!(resolver.chain().is_full());
        assert_eq!(resolver.chain().get(149), Some(151));
        // Slot 150 would be track 9 sector 6
        assert!(resolver.locate(9, 5).is_ok());
        assert_eq!(
            resolver.locate(9, 6),
            Err(ResolveError::Unmapped { track: 9, sector: 6 })
        );
    }

    #[test]
    fn select_fails_on_read_error() {
        let (mut card, volume) = card_with_file(&[2, 3], 64);
        card.fail_reads = true;
        let cache = SectorCache::new();
        let mut resolver = Resolver::new(card, &cache);
        assert!(matches!(
            resolver.select(&volume, 0),
            Err(ResolveError::Storage(_))
        ));
        assert!(!resolver.is_selected());
        assert_eq!(resolver.refresh(0, 0), Err(ResolveError::NotSelected));
    }

    #[test]
    fn empty_file_maps_nothing() {
        let (card, volume) = card_with_file(&[], 64);
        let cache = SectorCache::new();
        let mut resolver = Resolver::new(card, &cache);
        resolver.select(&volume, 0).unwrap();
        assert!(resolver.chain().is_empty());
        assert!(resolver.locate(0, 0).is_err());
    }

    #[test]
    fn stuck_engine_is_reset_before_refresh() {
        let (card, volume) = card_with_file(&[2, 3], 64);
        let cache = SectorCache::new();
        let mut resolver = Resolver::new(card, &cache);
        resolver.select(&volume, 0).unwrap();

        resolver.storage().stuck = true;
        resolver.refresh(0, 1).unwrap();
        assert_eq!(resolver.storage().resets, 1);
        assert!(resolver.transfer_complete());
    }

    #[test]
    fn completion_is_reported_late() {
        let (card, volume) = card_with_file(&[2, 3], 64);
        let cache = SectorCache::new();
        let mut resolver = Resolver::new(card, &cache);
        resolver.select(&volume, 0).unwrap();

        resolver.storage().read_latency = 2;
        resolver.refresh(0, 0).unwrap();
        assert!(!resolver.transfer_complete());
        assert!(!resolver.transfer_complete());
        assert!(resolver.transfer_complete());
        assert_eq!(resolver.storage().modes.last(), Some(&LinkMode::BlockTransfer));
    }

    #[test]
    fn failed_read_leaves_cache_invalid() {
        let (card, volume) = card_with_file(&[2, 3], 64);
        let cache = SectorCache::new();
        let mut resolver = Resolver::new(card, &cache);
        resolver.select(&volume, 0).unwrap();
        resolver.refresh(0, 0).unwrap();
        cache.mark_ready();

        resolver.storage().fail_reads = true;
        assert!(matches!(resolver.refresh(0, 1), Err(ResolveError::Storage(_))));
        assert!(!cache.is_ready());
    }

    #[test]
    fn persist_writes_mapped_block() {
        let (card, volume) = card_with_file(&[2, 5], 64);
        let cache = SectorCache::new();
        let mut resolver = Resolver::new(card, &cache);
        resolver.select(&volume, 0).unwrap();

        resolver.refresh(0, 6).unwrap();
        cache.mark_ready();

        let image = [0x77u8; BLOCK_SIZE];
        resolver.persist(&image, 0, 6).unwrap();

        let block = volume.cluster_block(5) + 2;
        assert_eq!(resolver.storage().writes, [block]);
        assert_eq!(resolver.storage().blocks[block as usize], image);
        // The stale cached copy is dropped
        assert!(!cache.is_ready());

        assert_eq!(
            resolver.persist(&image, 1, 0),
            Err(ResolveError::Unmapped { track: 1, sector: 0 })
        );
    }
}
