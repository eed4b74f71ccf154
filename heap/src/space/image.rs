use std::sync::Arc;

use crate::{
    accounting::SpaceBitmap,
    error::HeapError,
    memory_region::MemoryRegion,
    object::{OBJECT_ALIGNMENT, ObjectRef},
    system::align_up,
};

/// Boot image objects, laid out once at startup and never collected.
///
/// Its live bitmap doubles as its mark bitmap: everything in the image is
/// always marked.
pub struct ImageSpace {
    region: MemoryRegion,
    end: usize,
    live: Arc<SpaceBitmap>,
    objects: usize,
}

impl ImageSpace {
    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn begin(&self) -> usize {
        self.region.begin()
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn limit(&self) -> usize {
        self.region.end()
    }

    pub fn live_bitmap(&self) -> Arc<SpaceBitmap> {
        self.live.clone()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.end - self.begin()
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects
    }
}

impl std::fmt::Debug for ImageSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ImageSpace[{} {:#x}-{:#x}]", self.name(), self.begin(), self.end)
    }
}

/// Lays out image objects back to back.
///
/// Objects come back zeroed, the caller writes their class word and fields
/// before calling [`finish`](Self::finish).
pub struct ImageBuilder {
    region: MemoryRegion,
    cursor: usize,
    live: SpaceBitmap,
    objects: usize,
}

impl ImageBuilder {
    pub fn new(region: MemoryRegion) -> Self {
        let live = SpaceBitmap::new(
            &format!("{} live-bitmap", region.name()),
            region.begin(),
            region.size(),
        );
        Self {
            cursor: region.begin(),
            region,
            live,
            objects: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.region.size()
    }

    pub fn used(&self) -> usize {
        self.cursor - self.region.begin()
    }

    pub fn alloc(&mut self, byte_count: usize) -> Result<ObjectRef, HeapError> {
        let bytes = align_up(byte_count.max(OBJECT_ALIGNMENT), OBJECT_ALIGNMENT);
        if self.cursor + bytes > self.region.end() {
            return Err(HeapError::ImageTooLarge {
                requested: self.used() + bytes,
                capacity: self.capacity(),
            });
        }
        // SAFETY: the cursor stays aligned and inside the region
        let obj = unsafe { ObjectRef::from_addr_unchecked(self.cursor) };
        self.cursor += bytes;
        self.live.set(obj);
        self.objects += 1;
        Ok(obj)
    }

    /// Abandons the image and zeroes what was written to it.
    pub fn into_region(self) -> MemoryRegion {
        self.region.release(self.region.begin(), self.cursor);
        self.region
    }

    pub fn finish(self) -> ImageSpace {
        log::debug!(
            target: "heap",
            "image space {} holds {} objects in {} bytes",
            self.region.name(),
            self.objects,
            self.used()
        );
        ImageSpace {
            end: self.cursor,
            live: Arc::new(self.live),
            objects: self.objects,
            region: self.region,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_fills_live_bitmap() {
        let reservation = MemoryRegion::map("image test", 4096).expect("map");
        let view = reservation.sub_region("image space", 0, 4096).expect("view");
        let mut builder = ImageBuilder::new(view);
        let a = builder.alloc(20).expect("fits");
        let b = builder.alloc(64).expect("fits");
        assert_eq!(b.addr(), a.addr() + 24);
        assert!(matches!(
            builder.alloc(8192),
            Err(HeapError::ImageTooLarge { capacity: 4096, .. })
        ));
        let image = builder.finish();
        assert_eq!(image.objects_allocated(), 2);
        assert_eq!(image.bytes_allocated(), 88);
        assert!(image.live_bitmap().test(a));
        assert!(image.live_bitmap().test(b));
        assert_eq!(image.limit(), image.begin() + 4096);
    }
}
