use anyhow::Result;
use byteorder::{BigEndian, WriteBytesExt};
use sha2::Sha256;
use std::sync::{Arc, PoisonError, RwLock};

use crate::peer::FabricIndex;

const ROOT_PUBLIC_KEY_LEN: usize = 65;

#[derive(Debug, Clone)]
pub struct Fabric {
    pub index: FabricIndex,
    pub fabric_id: u64,
    root_public_key: Vec<u8>,
    compressed_id: u64,
}

impl Fabric {
    /// `root_public_key` is the uncompressed SEC1 point (0x04 || X || Y) of the fabric root CA.
    pub fn new(index: FabricIndex, fabric_id: u64, root_public_key: &[u8]) -> Result<Self> {
        if !index.is_valid() {
            anyhow::bail!("fabric index {} is not usable", index);
        }
        let compressed_id = compress_fabric_id(fabric_id, root_public_key)?;
        Ok(Self {
            index,
            fabric_id,
            root_public_key: root_public_key.to_owned(),
            compressed_id,
        })
    }

    /// Compressed fabric identifier, the fabric part of operational instance names.
    pub fn compressed_fabric_id(&self) -> u64 {
        self.compressed_id
    }

    pub fn root_public_key(&self) -> &[u8] {
        &self.root_public_key
    }
}

fn compress_fabric_id(fabric_id: u64, root_public_key: &[u8]) -> Result<u64> {
    if root_public_key.len() != ROOT_PUBLIC_KEY_LEN || root_public_key[0] != 0x04 {
        anyhow::bail!(
            "root public key must be {} byte uncompressed point, got {} bytes",
            ROOT_PUBLIC_KEY_LEN,
            root_public_key.len()
        );
    }
    let mut salt = Vec::with_capacity(8);
    salt.write_u64::<BigEndian>(fabric_id)?;
    let hk = hkdf::Hkdf::<Sha256>::new(Some(&salt), &root_public_key[1..]);
    let mut okm = [0u8; 8];
    hk.expand(b"CompressedFabric", &mut okm)
        .map_err(|e| anyhow::anyhow!("hkdf error {:?}", e))?;
    Ok(u64::from_be_bytes(okm))
}

/// Read access to the local fabrics.
pub trait FabricTable: Send {
    /// None when the fabric was never added or has been removed since.
    fn compressed_fabric_id(&self, index: FabricIndex) -> Option<u64>;
}

/// Shared fabric list. Clones see the same fabrics, so fabrics can be added or
/// removed while a setup manager holds another clone.
#[derive(Debug, Clone, Default)]
pub struct FabricList {
    fabrics: Arc<RwLock<Vec<Fabric>>>,
}

impl FabricList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the fabric stored under the same index.
    pub fn add(&self, fabric: Fabric) {
        let mut fabrics = self.fabrics.write().unwrap_or_else(PoisonError::into_inner);
        fabrics.retain(|f| f.index != fabric.index);
        log::debug!(
            "fabric {} added, compressed id {:016X}",
            fabric.index,
            fabric.compressed_fabric_id()
        );
        fabrics.push(fabric);
    }

    pub fn remove(&self, index: FabricIndex) -> Option<Fabric> {
        let mut fabrics = self.fabrics.write().unwrap_or_else(PoisonError::into_inner);
        let pos = fabrics.iter().position(|f| f.index == index)?;
        Some(fabrics.remove(pos))
    }

    pub fn get(&self, index: FabricIndex) -> Option<Fabric> {
        let fabrics = self.fabrics.read().unwrap_or_else(PoisonError::into_inner);
        fabrics.iter().find(|f| f.index == index).cloned()
    }

    pub fn len(&self) -> usize {
        self.fabrics.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FabricTable for FabricList {
    fn compressed_fabric_id(&self, index: FabricIndex) -> Option<u64> {
        self.get(index).map(|f| f.compressed_fabric_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_key(seed: u8) -> Vec<u8> {
        let mut key = vec![0x04];
        key.extend((0..64).map(|i| seed.wrapping_add(i)));
        key
    }

    #[test]
    fn compressed_id_is_deterministic_per_fabric() -> Result<()> {
        let a = Fabric::new(FabricIndex(1), 1000, &root_key(7))?;
        let b = Fabric::new(FabricIndex(2), 1000, &root_key(7))?;
        let c = Fabric::new(FabricIndex(3), 1001, &root_key(7))?;
        let d = Fabric::new(FabricIndex(4), 1000, &root_key(8))?;
        assert_eq!(a.compressed_fabric_id(), b.compressed_fabric_id());
        assert_ne!(a.compressed_fabric_id(), c.compressed_fabric_id());
        assert_ne!(a.compressed_fabric_id(), d.compressed_fabric_id());
        Ok(())
    }

    #[test]
    fn rejects_malformed_root_key() {
        assert!(Fabric::new(FabricIndex(1), 1, &root_key(1)[..33]).is_err());
        let mut key = root_key(1);
        key[0] = 0x02;
        assert!(Fabric::new(FabricIndex(1), 1, &key).is_err());
        assert!(Fabric::new(FabricIndex::UNDEFINED, 1, &root_key(1)).is_err());
    }

    #[test]
    fn list_clones_share_fabrics() -> Result<()> {
        let list = FabricList::new();
        let view = list.clone();
        let fabric = Fabric::new(FabricIndex(1), 1000, &root_key(3))?;
        let cfid = fabric.compressed_fabric_id();
        list.add(fabric);
        assert_eq!(view.compressed_fabric_id(FabricIndex(1)), Some(cfid));

        assert!(list.remove(FabricIndex(1)).is_some());
        assert_eq!(view.compressed_fabric_id(FabricIndex(1)), None);
        assert!(view.is_empty());
        Ok(())
    }
}
