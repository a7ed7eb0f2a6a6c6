use std::fmt;

/// A block pool id.
pub type PoolId = String;
/// A block id, unique within its pool.
pub type BlockId = u64;

/// Block replica identity.
///
/// It is the grouping key of movement attempts, hence it must remain stable while the attempts are in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtendedBlock {
    /// Block pool id.
    pub pool_id: PoolId,
    /// Block id.
    pub block_id: BlockId,
    /// Generation stamp, bumped on every replica update.
    pub generation_stamp: u64,
}

impl ExtendedBlock {
    pub fn new(pool_id: impl Into<PoolId>, block_id: BlockId, generation_stamp: u64) -> Self {
        Self {
            pool_id: pool_id.into(),
            block_id,
            generation_stamp,
        }
    }
}

impl fmt::Display for ExtendedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:blk_{}_{}", self.pool_id, self.block_id, self.generation_stamp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageType {
    RamDisk,
    Ssd,
    Disk,
    Archive,
    Provided,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StorageType::RamDisk => "RAM_DISK",
            StorageType::Ssd => "SSD",
            StorageType::Disk => "DISK",
            StorageType::Archive => "ARCHIVE",
            StorageType::Provided => "PROVIDED",
        })
    }
}

/// A storage location a block replica lives on or is moved to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageLocation {
    /// Storage node address.
    pub node: String,
    pub storage_type: StorageType,
}

impl StorageLocation {
    pub fn new(node: impl Into<String>, storage_type: StorageType) -> Self {
        Self {
            node: node.into(),
            storage_type,
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.node, self.storage_type)
    }
}

/// A request to move one block replica onto one target storage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMovingInfo {
    pub block: ExtendedBlock,
    pub source: StorageLocation,
    pub target: StorageLocation,
}

impl BlockMovingInfo {
    pub fn new(block: ExtendedBlock, source: StorageLocation, target: StorageLocation) -> Self {
        Self { block, source, target }
    }
}

/// Outcome of a movement attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MovementStatus {
    Success,
    /// The attempt failed with the given cause. Failed attempts are never retried here.
    Failure(String),
}

impl MovementStatus {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, MovementStatus::Success)
    }
}

/// Outcome of one relocation attempt for one block replica onto one target storage location.
///
/// It is produced by a movement task on completion and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementAttemptFinished {
    block: ExtendedBlock,
    source: StorageLocation,
    target: StorageLocation,
    status: MovementStatus,
}

impl MovementAttemptFinished {
    pub fn new(info: BlockMovingInfo, status: MovementStatus) -> Self {
        let BlockMovingInfo { block, source, target } = info;

        Self {
            block,
            source,
            target,
            status,
        }
    }

    #[inline]
    pub fn block(&self) -> &ExtendedBlock {
        &self.block
    }

    #[inline]
    pub fn source(&self) -> &StorageLocation {
        &self.source
    }

    #[inline]
    pub fn target(&self) -> &StorageLocation {
        &self.target
    }

    #[inline]
    pub fn status(&self) -> &MovementStatus {
        &self.status
    }
}

impl fmt::Display for MovementAttemptFinished {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} move from {} to {}: ", self.block, self.source, self.target)?;

        match &self.status {
            MovementStatus::Success => f.write_str("success"),
            MovementStatus::Failure(cause) => write!(f, "failure ({cause})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let info = BlockMovingInfo::new(
            ExtendedBlock::new("BP-1", 1073741825, 1001),
            StorageLocation::new("dn1:9866", StorageType::Disk),
            StorageLocation::new("dn2:9866", StorageType::Archive),
        );

        let finished = MovementAttemptFinished::new(info.clone(), MovementStatus::Success);
        assert_eq!(finished.to_string(), "BP-1:blk_1073741825_1001 move from dn1:9866[DISK] to dn2:9866[ARCHIVE]: success");

        let finished = MovementAttemptFinished::new(info, MovementStatus::Failure("connection reset".to_owned()));
        assert!(!finished.status().is_success());
        assert!(finished.to_string().ends_with("failure (connection reset)"));
    }
}
