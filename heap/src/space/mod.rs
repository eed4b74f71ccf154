//! Spaces: ranges of the heap with their own allocation and reclamation
//! strategy.
//!
//! Spaces never trigger a GC. A failed allocation returns `None` and the
//! heap decides what to do next.

pub mod bump_pointer;
pub mod dlmalloc;
pub mod image;
pub mod large_object;
pub mod malloc_space;
pub mod region;
pub mod rosalloc;
pub mod zygote;

use std::{collections::BTreeMap, fmt, sync::Arc};

pub use bump_pointer::BumpPointerSpace;
pub use image::{ImageBuilder, ImageSpace};
pub use large_object::LargeObjectSpace;
pub use malloc_space::{MallocKind, MallocSpace};
pub use region::RegionSpace;
pub use zygote::ZygoteSpace;

use crate::{
    accounting::{HeapBitmap, ModUnionTable, RememberedSet, SpaceBitmap},
    object::{ObjectModel, ObjectRef},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpaceId(pub usize);

/// When the objects of a space are candidates for reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcRetentionPolicy {
    /// Image space.
    NeverCollect,
    /// Every collection, sticky ones included.
    AlwaysCollect,
    /// Only full collections (zygote space).
    FullCollect,
}

/// Result of a successful space allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub object: ObjectRef,
    /// Bytes this object occupies in the space.
    pub bytes_allocated: usize,
    /// Bytes the caller may use, at least the requested size.
    pub usable_size: usize,
    /// Bytes charged to the heap right now. Larger than `bytes_allocated`
    /// when a thread-local buffer was handed out along with the object,
    /// zero when the object came out of an existing buffer.
    pub bulk_bytes_allocated: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    BumpPointer,
    Malloc,
    LargeObject,
    Image,
    Zygote,
    Region,
}

pub enum Space {
    BumpPointer(BumpPointerSpace),
    Malloc(MallocSpace),
    LargeObject(LargeObjectSpace),
    Image(ImageSpace),
    Zygote(ZygoteSpace),
    Region(RegionSpace),
}

impl Space {
    pub fn name(&self) -> &str {
        match self {
            Space::BumpPointer(s) => s.name(),
            Space::Malloc(s) => s.name(),
            Space::LargeObject(s) => s.name(),
            Space::Image(s) => s.name(),
            Space::Zygote(s) => s.name(),
            Space::Region(s) => s.name(),
        }
    }

    pub fn kind(&self) -> SpaceKind {
        match self {
            Space::BumpPointer(_) => SpaceKind::BumpPointer,
            Space::Malloc(_) => SpaceKind::Malloc,
            Space::LargeObject(_) => SpaceKind::LargeObject,
            Space::Image(_) => SpaceKind::Image,
            Space::Zygote(_) => SpaceKind::Zygote,
            Space::Region(_) => SpaceKind::Region,
        }
    }

    pub fn is_continuous(&self) -> bool {
        !matches!(self, Space::LargeObject(_))
    }

    /// Whether objects of this space may be moved by a copying collector.
    pub fn can_move_objects(&self) -> bool {
        match self {
            Space::BumpPointer(_) | Space::Region(_) => true,
            Space::Malloc(s) => s.can_move_objects(),
            _ => false,
        }
    }

    /// Start of the reserved range. Zero for discontinuous spaces.
    pub fn begin(&self) -> usize {
        match self {
            Space::BumpPointer(s) => s.begin(),
            Space::Malloc(s) => s.begin(),
            Space::LargeObject(_) => 0,
            Space::Image(s) => s.begin(),
            Space::Zygote(s) => s.begin(),
            Space::Region(s) => s.begin(),
        }
    }

    /// End of the allocated part of the range.
    pub fn end(&self) -> usize {
        match self {
            Space::BumpPointer(s) => s.end(),
            Space::Malloc(s) => s.end(),
            Space::LargeObject(_) => 0,
            Space::Image(s) => s.end(),
            Space::Zygote(s) => s.end(),
            Space::Region(s) => s.end(),
        }
    }

    /// End of the reserved range.
    pub fn limit(&self) -> usize {
        match self {
            Space::BumpPointer(s) => s.limit(),
            Space::Malloc(s) => s.limit(),
            Space::LargeObject(_) => 0,
            Space::Image(s) => s.limit(),
            Space::Zygote(s) => s.limit(),
            Space::Region(s) => s.limit(),
        }
    }

    /// O(1) range test for continuous spaces, a hash lookup for the large
    /// object space.
    #[inline]
    pub fn has_address(&self, addr: usize) -> bool {
        match self {
            Space::LargeObject(s) => {
                ObjectRef::from_addr(addr).is_some_and(|obj| s.contains(obj))
            }
            _ => addr >= self.begin() && addr < self.limit(),
        }
    }

    #[inline]
    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.has_address(obj.addr())
    }

    pub fn retention_policy(&self) -> GcRetentionPolicy {
        match self {
            Space::Image(_) => GcRetentionPolicy::NeverCollect,
            Space::Zygote(_) => GcRetentionPolicy::FullCollect,
            _ => GcRetentionPolicy::AlwaysCollect,
        }
    }

    pub fn live_bitmap(&self) -> Option<Arc<SpaceBitmap>> {
        match self {
            Space::Malloc(s) => Some(s.live_bitmap()),
            Space::Image(s) => Some(s.live_bitmap()),
            Space::Zygote(s) => Some(s.live_bitmap()),
            _ => None,
        }
    }

    pub fn mark_bitmap(&self) -> Option<Arc<SpaceBitmap>> {
        match self {
            Space::Malloc(s) => Some(s.mark_bitmap()),
            Space::Image(s) => Some(s.live_bitmap()),
            Space::Zygote(s) => Some(s.mark_bitmap()),
            _ => None,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        match self {
            Space::BumpPointer(s) => s.bytes_allocated(),
            Space::Malloc(s) => s.bytes_allocated(),
            Space::LargeObject(s) => s.bytes_allocated(),
            Space::Image(s) => s.bytes_allocated(),
            Space::Zygote(s) => s.bytes_allocated(),
            Space::Region(s) => s.bytes_allocated(),
        }
    }

    pub fn objects_allocated(&self) -> usize {
        match self {
            Space::BumpPointer(s) => s.objects_allocated(),
            Space::Malloc(s) => s.objects_allocated(),
            Space::LargeObject(s) => s.objects_allocated(),
            Space::Image(s) => s.objects_allocated(),
            Space::Zygote(s) => s.objects_allocated(),
            Space::Region(s) => s.objects_allocated(),
        }
    }

    /// Visits every object of a space without bitmaps, by walking it.
    ///
    /// # Safety
    ///
    /// No mutator may be allocating into the space.
    pub unsafe fn walk(&self, model: &dyn ObjectModel, visitor: &mut dyn FnMut(ObjectRef)) {
        // SAFETY: guaranteed by the caller
        unsafe {
            match self {
                Space::BumpPointer(s) => s.walk(model, visitor),
                Space::Region(s) => s.walk(model, visitor),
                Space::Malloc(s) => s.live_bitmap().walk(visitor),
                Space::Image(s) => s.live_bitmap().walk(visitor),
                Space::Zygote(s) => s.live_bitmap().walk(visitor),
                Space::LargeObject(s) => s.live_objects().snapshot().into_iter().for_each(visitor),
            }
        }
    }

    pub fn as_bump_pointer(&self) -> Option<&BumpPointerSpace> {
        match self {
            Space::BumpPointer(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_malloc(&self) -> Option<&MallocSpace> {
        match self {
            Space::Malloc(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_large_object(&self) -> Option<&LargeObjectSpace> {
        match self {
            Space::LargeObject(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_zygote(&self) -> Option<&ZygoteSpace> {
        match self {
            Space::Zygote(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_region(&self) -> Option<&RegionSpace> {
        match self {
            Space::Region(s) => Some(s),
            _ => None,
        }
    }

    pub fn dump(&self) -> String {
        match self {
            Space::LargeObject(s) => format!(
                "{} large objects {} objects {} bytes",
                s.name(),
                s.objects_allocated(),
                s.bytes_allocated()
            ),
            _ => format!(
                "{:?} {} {:#x}-{:#x} (limit {:#x}) {} objects {} bytes",
                self.kind(),
                self.name(),
                self.begin(),
                self.end(),
                self.limit(),
                self.objects_allocated(),
                self.bytes_allocated()
            ),
        }
    }
}

impl fmt::Debug for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump())
    }
}

// ── Space table ───────────────────────────────────────────────────────

/// Owner of all spaces and of the cross-space summaries attached to them.
///
/// Ids stay valid until their space is removed, removed slots are never
/// reused.
#[derive(Debug, Default)]
pub struct SpaceTable {
    spaces: Vec<Option<Space>>,
    /// Continuous spaces sorted by begin address.
    continuous: Vec<SpaceId>,
    pub mod_union_tables: BTreeMap<SpaceId, ModUnionTable>,
    pub remembered_sets: BTreeMap<SpaceId, RememberedSet>,
}

impl SpaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, space: Space) -> SpaceId {
        let id = SpaceId(self.spaces.len());
        if space.is_continuous() {
            debug_assert!(
                self.continuous_spaces().all(|(_, other)| other.limit() <= space.begin()
                    || space.limit() <= other.begin()),
                "space {} overlaps",
                space.name()
            );
            let begin = space.begin();
            let at = self.continuous.partition_point(|other| {
                self.spaces[other.0].as_ref().is_some_and(|s| s.begin() < begin)
            });
            self.continuous.insert(at, id);
        }
        log::debug!(target: "heap", "adding space {}", space.dump());
        self.spaces.push(Some(space));
        id
    }

    pub fn remove(&mut self, id: SpaceId) -> Option<Space> {
        let space = self.spaces.get_mut(id.0)?.take()?;
        self.continuous.retain(|other| *other != id);
        self.mod_union_tables.remove(&id);
        self.remembered_sets.remove(&id);
        log::debug!(target: "heap", "removed space {}", space.name());
        Some(space)
    }

    #[inline]
    pub fn get(&self, id: SpaceId) -> Option<&Space> {
        self.spaces.get(id.0)?.as_ref()
    }

    pub fn get_mut(&mut self, id: SpaceId) -> Option<&mut Space> {
        self.spaces.get_mut(id.0)?.as_mut()
    }

    /// Continuous spaces in address order, then the discontinuous ones.
    pub fn iter(&self) -> impl Iterator<Item = (SpaceId, &Space)> {
        self.continuous_spaces().chain(
            self.spaces
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.as_ref().map(|s| (SpaceId(i), s)))
                .filter(|(_, s)| !s.is_continuous()),
        )
    }

    pub fn continuous_spaces(&self) -> impl Iterator<Item = (SpaceId, &Space)> {
        self.continuous
            .iter()
            .filter_map(|id| self.get(*id).map(|space| (*id, space)))
    }

    /// Space holding `addr`, if any.
    pub fn find_space_from_address(&self, addr: usize) -> Option<SpaceId> {
        let at = self.continuous.partition_point(|id| {
            self.get(*id).is_some_and(|space| space.begin() <= addr)
        });
        if let Some(id) = at.checked_sub(1).map(|i| self.continuous[i])
            && self.get(id).is_some_and(|space| space.has_address(addr))
        {
            return Some(id);
        }
        self.iter()
            .find(|(_, space)| !space.is_continuous() && space.has_address(addr))
            .map(|(id, _)| id)
    }

    pub fn find_space(&self, obj: ObjectRef) -> Option<(SpaceId, &Space)> {
        let id = self.find_space_from_address(obj.addr())?;
        self.get(id).map(|space| (id, space))
    }

    pub fn live_bitmap(&self) -> HeapBitmap {
        let mut bitmap = HeapBitmap::new();
        for (_, space) in self.iter() {
            match space {
                Space::LargeObject(los) => bitmap.add_large(los.live_objects()),
                _ => {
                    if let Some(live) = space.live_bitmap() {
                        bitmap.add_continuous(live);
                    }
                }
            }
        }
        bitmap
    }

    pub fn mark_bitmap(&self) -> HeapBitmap {
        let mut bitmap = HeapBitmap::new();
        for (_, space) in self.iter() {
            match space {
                Space::LargeObject(los) => bitmap.add_large(los.mark_objects()),
                _ => {
                    if let Some(mark) = space.mark_bitmap() {
                        bitmap.add_continuous(mark);
                    }
                }
            }
        }
        bitmap
    }

    pub fn malloc_spaces(&self) -> impl Iterator<Item = (SpaceId, &MallocSpace)> {
        self.continuous_spaces()
            .filter_map(|(id, space)| space.as_malloc().map(|m| (id, m)))
    }

    pub fn large_object_space(&self) -> Option<(SpaceId, &LargeObjectSpace)> {
        self.iter()
            .find_map(|(id, space)| space.as_large_object().map(|los| (id, los)))
    }

    pub fn zygote_space(&self) -> Option<(SpaceId, &ZygoteSpace)> {
        self.continuous_spaces()
            .find_map(|(id, space)| space.as_zygote().map(|z| (id, z)))
    }

    pub fn image_space(&self) -> Option<(SpaceId, &ImageSpace)> {
        self.continuous_spaces().find_map(|(id, space)| match space {
            Space::Image(image) => Some((id, image)),
            _ => None,
        })
    }
}
