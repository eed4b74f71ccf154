//! Installing the boot image into the reserved image range.

use crate::{
    accounting::ModUnionTable,
    collector::{CollectorType, GcCause, GcType},
    error::HeapError,
    space::{ImageBuilder, Space, SpaceId},
};

use super::HeapInner;

impl HeapInner {
    /// Lets `build` fill the image range and installs the result as the
    /// image space. Image objects are never collected, the references they
    /// hold into the rest of the heap are found through a mod-union table.
    ///
    /// A failed build leaves the range reserved for another attempt.
    pub fn install_image(
        &self,
        build: impl FnOnce(&mut ImageBuilder) -> Result<(), HeapError>,
    ) -> Result<SpaceId, HeapError> {
        {
            let mut state = self.gc.lock();
            self.wait_for_gc_to_complete_locked(&mut state, GcCause::Explicit);
            state.collector_type_running = CollectorType::CriticalSection;
        }
        let result = self.install_image_locked(build);
        self.finish_gc(GcType::None);
        result
    }

    fn install_image_locked(
        &self,
        build: impl FnOnce(&mut ImageBuilder) -> Result<(), HeapError>,
    ) -> Result<SpaceId, HeapError> {
        let mut spaces = self.spaces.write();
        let region = spaces
            .image_reserve
            .take()
            .ok_or(HeapError::ImageAlreadyInstalled)?;
        let mut builder = ImageBuilder::new(region);
        if let Err(err) = build(&mut builder) {
            spaces.image_reserve = Some(builder.into_region());
            return Err(err);
        }
        let image = builder.finish();
        let (begin, limit) = (image.begin(), image.limit());
        let id = spaces.table.add(Space::Image(image));
        let table = ModUnionTable::reference_cache("image space mod-union table", id, begin, limit);
        // the image was written without a barrier
        table.set_cards();
        spaces.table.mod_union_tables.insert(id, table);
        spaces.image = Some(id);
        log::debug!(target: "heap", "installed image space {begin:#x}-{limit:#x}");
        Ok(id)
    }
}
