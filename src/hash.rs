//! Process-wide object index.
//!
//! Every live on-flash object (inode or data block) is represented in RAM by
//! a compact entry keyed by its 32-bit object id. Inter-object references
//! (parent directories, block predecessors) are stored as ids and resolved
//! through this index, never as owning pointers.

use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::errors::{FsError, FsResult};

/// Cached leading filename bytes kept in RAM so that comparisons against
/// short names avoid flash reads entirely.
pub(crate) const NAME_PREFIX_LEN: usize = 8;

/// A 32-bit object id.
///
/// The id space is partitioned by object kind, each kind with its own
/// monotonic allocator: directories, files, then data blocks. The all-ones
/// value is reserved as the "none" sentinel, which doubles as the erased
/// flash pattern.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub(crate) struct ObjectId(u32);

impl ObjectId {
    pub(crate) const DIR_MIN: u32 = 0x0000_0000;
    pub(crate) const FILE_MIN: u32 = 0x1000_0000;
    pub(crate) const BLOCK_MIN: u32 = 0x8000_0000;
    pub(crate) const BLOCK_MAX: u32 = 0xFFFF_FFFF;

    /// Raw encoding of "no object".
    pub(crate) const NONE_RAW: u32 = 0xFFFF_FFFF;

    /// The root directory always receives the first directory id.
    pub(crate) const ROOT: Self = Self(0);

    pub(crate) fn new(raw: u32) -> Self {
        debug_assert!(raw != Self::NONE_RAW);
        Self(raw)
    }

    /// Decodes an on-disk reference field, mapping the sentinel to `None`.
    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        if raw == Self::NONE_RAW {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Encodes an optional reference for an on-disk field.
    pub(crate) fn to_raw(id: Option<Self>) -> u32 {
        match id {
            Some(id) => id.0,
            None => Self::NONE_RAW,
        }
    }

    pub(crate) fn raw(self) -> u32 {
        self.0
    }

    pub(crate) fn is_dir(self) -> bool {
        self.0 < Self::FILE_MIN
    }

    pub(crate) fn is_file(self) -> bool {
        (Self::FILE_MIN..Self::BLOCK_MIN).contains(&self.0)
    }

    pub(crate) fn is_inode(self) -> bool {
        self.0 < Self::BLOCK_MIN
    }

    pub(crate) fn is_block(self) -> bool {
        (Self::BLOCK_MIN..Self::BLOCK_MAX).contains(&self.0)
    }
}

impl core::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Packed flash location: area index in the top byte, byte offset within the
/// area in the low 24 bits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub(crate) struct FlashLoc(u32);

impl FlashLoc {
    /// Largest area-relative offset representable in a location.
    pub(crate) const MAX_OFFSET: u32 = 0x00FF_FFFF;

    pub(crate) fn new(area_idx: u8, offset: u32) -> Self {
        debug_assert!(offset <= Self::MAX_OFFSET);
        Self((u32::from(area_idx) << 24) | offset)
    }

    pub(crate) fn area_idx(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub(crate) fn offset(self) -> u32 {
        self.0 & Self::MAX_OFFSET
    }
}

/// Kind-specific portion of an inode entry.
#[derive(Clone, Debug)]
pub(crate) enum InodeState {
    /// Directories own an ordered list of child inode ids, sorted ascending
    /// by (filename bytes, filename length).
    Dir { children: Vec<ObjectId> },

    /// Files reference only their newest data block; older blocks are
    /// reached by following each block's `prev` id.
    File { last_block: Option<ObjectId> },
}

/// In-memory record of a live inode.
#[derive(Clone, Debug)]
pub(crate) struct InodeEntry {
    pub(crate) id: ObjectId,

    /// Location of the authoritative record on flash. `None` marks a dummy
    /// inode: a placeholder synthesized during restore for an object whose
    /// record has not been seen (yet).
    pub(crate) loc: Option<FlashLoc>,

    pub(crate) parent: Option<ObjectId>,

    /// Live holders: parent linkage plus open file handles. A count of zero
    /// identifies a dummy.
    pub(crate) refcnt: u8,

    pub(crate) name_len: u8,
    pub(crate) name_prefix: [u8; NAME_PREFIX_LEN],

    pub(crate) state: InodeState,
}

impl InodeEntry {
    pub(crate) fn new_dummy(id: ObjectId) -> Self {
        let state = if id.is_dir() {
            InodeState::Dir {
                children: Vec::new(),
            }
        } else {
            InodeState::File { last_block: None }
        };

        Self {
            id,
            loc: None,
            parent: None,
            refcnt: 0,
            name_len: 0,
            name_prefix: [0; NAME_PREFIX_LEN],
            state,
        }
    }

    pub(crate) fn is_dummy(&self) -> bool {
        self.refcnt == 0
    }

    pub(crate) fn children(&self) -> &[ObjectId] {
        match &self.state {
            InodeState::Dir { children } => children,
            InodeState::File { .. } => &[],
        }
    }

    pub(crate) fn children_mut(&mut self) -> FsResult<&mut Vec<ObjectId>> {
        match &mut self.state {
            InodeState::Dir { children } => Ok(children),
            InodeState::File { .. } => Err(FsError::Invalid),
        }
    }

    pub(crate) fn last_block(&self) -> Option<ObjectId> {
        match &self.state {
            InodeState::File { last_block } => *last_block,
            InodeState::Dir { .. } => None,
        }
    }

    pub(crate) fn set_last_block(&mut self, block: Option<ObjectId>) {
        if let InodeState::File { last_block } = &mut self.state {
            *last_block = block;
        }
    }
}

/// In-memory record of a live data block.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockEntry {
    pub(crate) id: ObjectId,
    pub(crate) loc: FlashLoc,

    /// Predecessor block in the owning file, or `None` for the first block.
    pub(crate) prev: Option<ObjectId>,
}

/// An indexed object: inode or data block.
#[derive(Clone, Debug)]
pub(crate) enum HashEntry {
    Inode(InodeEntry),
    Block(BlockEntry),
}

/// Id-keyed index over every object in the RAM representation, plus the
/// three per-kind id allocators.
pub(crate) struct HashIndex {
    map: HashMap<ObjectId, HashEntry>,
    next_dir_id: u32,
    next_file_id: u32,
    next_block_id: u32,
}

impl HashIndex {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            next_dir_id: ObjectId::DIR_MIN,
            next_file_id: ObjectId::FILE_MIN,
            next_block_id: ObjectId::BLOCK_MIN,
        }
    }

    /// Drops every entry and rewinds the id allocators, as done on format.
    pub(crate) fn reset(&mut self) {
        self.map.clear();
        self.next_dir_id = ObjectId::DIR_MIN;
        self.next_file_id = ObjectId::FILE_MIN;
        self.next_block_id = ObjectId::BLOCK_MIN;
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.map.keys().copied()
    }

    pub(crate) fn insert(&mut self, entry: HashEntry) {
        let id = match &entry {
            HashEntry::Inode(inode) => inode.id,
            HashEntry::Block(block) => block.id,
        };
        self.map.insert(id, entry);
    }

    pub(crate) fn remove(&mut self, id: ObjectId) -> Option<HashEntry> {
        self.map.remove(&id)
    }

    pub(crate) fn contains(&self, id: ObjectId) -> bool {
        self.map.contains_key(&id)
    }

    pub(crate) fn find(&self, id: ObjectId) -> Option<&HashEntry> {
        self.map.get(&id)
    }

    pub(crate) fn find_mut(&mut self, id: ObjectId) -> Option<&mut HashEntry> {
        self.map.get_mut(&id)
    }

    /// Looks up an inode entry; an id present in the index with the wrong
    /// kind indicates an inconsistent image.
    pub(crate) fn inode(&self, id: ObjectId) -> FsResult<&InodeEntry> {
        match self.map.get(&id) {
            Some(HashEntry::Inode(inode)) => Ok(inode),
            Some(HashEntry::Block(_)) => Err(FsError::Corrupt),
            None => Err(FsError::NotFound),
        }
    }

    pub(crate) fn inode_mut(&mut self, id: ObjectId) -> FsResult<&mut InodeEntry> {
        match self.map.get_mut(&id) {
            Some(HashEntry::Inode(inode)) => Ok(inode),
            Some(HashEntry::Block(_)) => Err(FsError::Corrupt),
            None => Err(FsError::NotFound),
        }
    }

    pub(crate) fn block(&self, id: ObjectId) -> FsResult<&BlockEntry> {
        match self.map.get(&id) {
            Some(HashEntry::Block(block)) => Ok(block),
            Some(HashEntry::Inode(_)) => Err(FsError::Corrupt),
            None => Err(FsError::NotFound),
        }
    }

    pub(crate) fn block_mut(&mut self, id: ObjectId) -> FsResult<&mut BlockEntry> {
        match self.map.get_mut(&id) {
            Some(HashEntry::Block(block)) => Ok(block),
            Some(HashEntry::Inode(_)) => Err(FsError::Corrupt),
            None => Err(FsError::NotFound),
        }
    }

    pub(crate) fn alloc_dir_id(&mut self) -> FsResult<ObjectId> {
        if self.next_dir_id >= ObjectId::FILE_MIN {
            return Err(FsError::Full);
        }

        let id = ObjectId::new(self.next_dir_id);
        self.next_dir_id += 1;
        Ok(id)
    }

    pub(crate) fn alloc_file_id(&mut self) -> FsResult<ObjectId> {
        if self.next_file_id >= ObjectId::BLOCK_MIN {
            return Err(FsError::Full);
        }

        let id = ObjectId::new(self.next_file_id);
        self.next_file_id += 1;
        Ok(id)
    }

    pub(crate) fn alloc_block_id(&mut self) -> FsResult<ObjectId> {
        if self.next_block_id >= ObjectId::BLOCK_MAX {
            return Err(FsError::Full);
        }

        let id = ObjectId::new(self.next_block_id);
        self.next_block_id += 1;
        Ok(id)
    }

    /// Advances the relevant allocator past a restored object's id.
    pub(crate) fn note_restored_id(&mut self, id: ObjectId) {
        let raw = id.raw();

        if id.is_dir() {
            if raw >= self.next_dir_id {
                self.next_dir_id = raw + 1;
            }
        } else if id.is_file() {
            if raw >= self.next_file_id {
                self.next_file_id = raw + 1;
            }
        } else if raw >= self.next_block_id {
            self.next_block_id = raw + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FlashLoc, HashEntry, HashIndex, InodeEntry, ObjectId};

    #[test]
    fn id_ranges_are_disjoint() {
        assert!(ObjectId::new(0).is_dir());
        assert!(ObjectId::new(0x0FFF_FFFF).is_dir());
        assert!(ObjectId::new(0x1000_0000).is_file());
        assert!(ObjectId::new(0x7FFF_FFFF).is_file());
        assert!(ObjectId::new(0x8000_0000).is_block());
        assert!(ObjectId::new(0xFFFF_FFFE).is_block());

        assert!(ObjectId::from_raw(0xFFFF_FFFF).is_none());
    }

    #[test]
    fn flash_loc_packs_and_unpacks() {
        let loc = FlashLoc::new(3, 0x00AB_CDEF);

        assert_eq!(loc.area_idx(), 3);
        assert_eq!(loc.offset(), 0x00AB_CDEF);
    }

    #[test]
    fn allocators_start_fresh_and_advance_past_restored_ids() {
        let mut index = HashIndex::new(16);

        assert_eq!(index.alloc_dir_id().unwrap(), ObjectId::ROOT);
        assert_eq!(index.alloc_file_id().unwrap().raw(), ObjectId::FILE_MIN);

        index.note_restored_id(ObjectId::new(0x1000_0007));
        assert_eq!(index.alloc_file_id().unwrap().raw(), 0x1000_0008);

        index.note_restored_id(ObjectId::new(0x8000_0002));
        assert_eq!(index.alloc_block_id().unwrap().raw(), 0x8000_0003);
    }

    #[test]
    fn kind_mismatch_is_reported_as_corruption() {
        let mut index = HashIndex::new(16);
        let id = ObjectId::new(0x1000_0000);
        index.insert(HashEntry::Inode(InodeEntry::new_dummy(id)));

        assert!(index.inode(id).is_ok());
        assert_eq!(index.block(id).unwrap_err(), crate::errors::FsError::Corrupt);
    }
}
