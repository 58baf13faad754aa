//! Bindless descriptor heaps.
//!
//! A heap is one descriptor set holding a single large array binding, plus a
//! bitmap of which array slots are taken. Shaders index the array with the
//! slot number handed out by [`DescriptorHeap::push_image`] or
//! [`DescriptorHeap::push_sampler`].

use crate::backend::{
    BackendError, BackendResult, DescriptorSetHandle, DescriptorSetLayoutHandle, DescriptorWrite,
    HeapKind, ImageHandle, RenderBackend, SamplerHandle,
};

/// Default number of slots of the image and sampler heaps.
pub const DEFAULT_HEAP_CAPACITY: u32 = 512;

/// A slot in a heap. The generation distinguishes reuses of the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapSlot {
    pub index: u32,
    pub generation: u32,
}

#[derive(Debug)]
pub struct DescriptorHeap {
    kind: HeapKind,
    capacity: u32,
    bitmap: Vec<u64>,
    generations: Vec<u32>,
    layout: DescriptorSetLayoutHandle,
    set: DescriptorSetHandle,
}

impl DescriptorHeap {
    /// Create a heap with `capacity` slots, all free.
    pub fn new<B: RenderBackend>(
        backend: &mut B,
        kind: HeapKind,
        capacity: u32,
    ) -> BackendResult<Self> {
        let (layout, set) = backend.create_heap_set(kind, capacity)?;
        let words = (capacity as usize).div_ceil(64);
        log::debug!("Created {} heap with {} slots", kind, capacity);
        Ok(Self {
            kind,
            capacity,
            bitmap: vec![0; words],
            generations: vec![0; capacity as usize],
            layout,
            set,
        })
    }

    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn layout(&self) -> DescriptorSetLayoutHandle {
        self.layout
    }

    pub fn set(&self) -> DescriptorSetHandle {
        self.set
    }

    fn is_set(&self, index: u32) -> bool {
        self.bitmap[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    /// Claim the lowest free slot, or `None` when the heap is full.
    pub fn find_available(&mut self) -> Option<HeapSlot> {
        for (word_index, word) in self.bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros();
            let index = word_index as u32 * 64 + bit;
            if index >= self.capacity {
                break;
            }
            *word |= 1 << bit;
            return Some(HeapSlot {
                index,
                generation: self.generations[index as usize],
            });
        }
        log::warn!("{} heap exhausted ({} slots)", self.kind, self.capacity);
        None
    }

    /// Whether `slot` is taken and has not been freed since it was handed out.
    pub fn is_live(&self, slot: HeapSlot) -> bool {
        slot.index < self.capacity
            && self.is_set(slot.index)
            && self.generations[slot.index as usize] == slot.generation
    }

    /// Release a slot. Its index may be handed out again with a newer generation.
    pub fn free(&mut self, slot: HeapSlot) -> BackendResult<()> {
        if !self.is_live(slot) {
            return Err(BackendError::UnknownHandle {
                kind: "heap slot",
                id: slot.index as u64,
            });
        }
        self.bitmap[(slot.index / 64) as usize] &= !(1 << (slot.index % 64));
        let generation = &mut self.generations[slot.index as usize];
        *generation = generation.wrapping_add(1);
        Ok(())
    }

    pub fn used_count(&self) -> u32 {
        self.bitmap.iter().map(|word| word.count_ones()).sum()
    }

    fn claim<B: RenderBackend>(
        &mut self,
        backend: &mut B,
        write: DescriptorWrite,
    ) -> BackendResult<HeapSlot> {
        let slot = self
            .find_available()
            .ok_or_else(|| BackendError::DescriptorCreationFailed(format!(
                "{} heap is full ({} slots)",
                self.kind, self.capacity
            )))?;
        if let Err(err) = backend.write_descriptor(self.set, 0, slot.index, &write) {
            self.free(slot)?;
            return Err(err);
        }
        Ok(slot)
    }

    /// Claim a slot and write a sampled image into it.
    pub fn push_image<B: RenderBackend>(
        &mut self,
        backend: &mut B,
        image: ImageHandle,
    ) -> BackendResult<HeapSlot> {
        if self.kind != HeapKind::Image {
            return Err(BackendError::DescriptorCreationFailed(
                "image pushed into a sampler heap".to_string(),
            ));
        }
        self.claim(backend, DescriptorWrite::SampledImage(image))
    }

    /// Claim a slot and write a sampler into it.
    pub fn push_sampler<B: RenderBackend>(
        &mut self,
        backend: &mut B,
        sampler: SamplerHandle,
    ) -> BackendResult<HeapSlot> {
        if self.kind != HeapKind::Sampler {
            return Err(BackendError::DescriptorCreationFailed(
                "sampler pushed into an image heap".to_string(),
            ));
        }
        self.claim(backend, DescriptorWrite::Sampler(sampler))
    }

    /// Release the heap's descriptor set and layout.
    pub fn destroy<B: RenderBackend>(self, backend: &mut B) -> BackendResult<()> {
        backend.free_descriptor_set(self.set)?;
        backend.free_descriptor_set_layout(self.layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::SamplerDesc;

    #[test]
    fn test_slots_are_lowest_first() {
        let mut backend = DummyBackend::default();
        let mut heap = DescriptorHeap::new(&mut backend, HeapKind::Sampler, 8).unwrap();
        let a = heap.find_available().unwrap();
        let b = heap.find_available().unwrap();
        assert_eq!((a.index, b.index), (0, 1));
        assert_eq!(heap.used_count(), 2);

        heap.free(a).unwrap();
        let c = heap.find_available().unwrap();
        assert_eq!(c.index, 0);
        assert_ne!(c.generation, a.generation);
        assert!(!heap.is_live(a));
        assert!(heap.is_live(c));
    }

    #[test]
    fn test_exhaustion() {
        let mut backend = DummyBackend::default();
        let mut heap = DescriptorHeap::new(&mut backend, HeapKind::Image, 70).unwrap();
        for expected in 0..70 {
            assert_eq!(heap.find_available().unwrap().index, expected);
        }
        assert_eq!(heap.find_available(), None);
        assert_eq!(heap.used_count(), 70);
    }

    #[test]
    fn test_stale_free_rejected() {
        let mut backend = DummyBackend::default();
        let mut heap = DescriptorHeap::new(&mut backend, HeapKind::Image, 4).unwrap();
        let slot = heap.find_available().unwrap();
        heap.free(slot).unwrap();
        assert!(heap.free(slot).is_err());
        assert!(heap
            .free(HeapSlot {
                index: 9,
                generation: 0
            })
            .is_err());
    }

    #[test]
    fn test_push_sampler_writes_descriptor() {
        let mut backend = DummyBackend::default();
        let mut heap =
            DescriptorHeap::new(&mut backend, HeapKind::Sampler, DEFAULT_HEAP_CAPACITY).unwrap();
        let nearest = backend.create_sampler(&SamplerDesc::nearest()).unwrap();
        let linear = backend.create_sampler(&SamplerDesc::linear()).unwrap();

        let first = heap.push_sampler(&mut backend, nearest).unwrap();
        let second = heap.push_sampler(&mut backend, linear).unwrap();
        assert_eq!((first.index, second.index), (0, 1));
        assert_eq!(
            backend.descriptor(heap.set(), 0, 1),
            Some(DescriptorWrite::Sampler(linear))
        );
        assert!(heap.push_image(&mut backend, ImageHandle(1)).is_err());

        heap.destroy(&mut backend).unwrap();
        assert_eq!(backend.live_descriptor_sets(), 0);
    }

    #[test]
    fn test_failed_write_releases_slot() {
        let mut backend = DummyBackend::default();
        let mut heap = DescriptorHeap::new(&mut backend, HeapKind::Image, 4).unwrap();
        // handle never allocated
        assert!(heap.push_image(&mut backend, ImageHandle(9999)).is_err());
        assert_eq!(heap.used_count(), 0);
    }
}
