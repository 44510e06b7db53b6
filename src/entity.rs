use crate::id::{Entity, Id, HI_COMPONENT_ID};
use crate::index::TableId;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Where an entity's row lives.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EntityLocation {
    table: TableId,
    row: usize,
}

impl EntityLocation {
    pub(crate) fn new(table: TableId, row: usize) -> Self { EntityLocation { table, row } }

    pub(crate) fn table(&self) -> TableId { self.table }

    pub(crate) fn row(&self) -> usize { self.row }
}

/// Hands out fixed-size ranges of entity numbers. Shared between all worlds
/// of a universe so entity ids stay unique across them.
#[derive(Debug)]
pub(crate) struct BlockAllocator {
    allocated: u64,
    free: Vec<EntityBlock>,
}

impl BlockAllocator {
    const BLOCK_SIZE: usize = 1024;

    pub(crate) fn new() -> Self {
        BlockAllocator {
            // Numbers below HI_COMPONENT_ID are reserved for builtins and
            // user component ids.
            allocated: HI_COMPONENT_ID,
            free: Vec::new(),
        }
    }

    pub fn allocate(&mut self) -> EntityBlock {
        if let Some(block) = self.free.pop() {
            block
        } else {
            let block = EntityBlock::new(self.allocated as u32, BlockAllocator::BLOCK_SIZE);
            self.allocated += BlockAllocator::BLOCK_SIZE as u64;
            block
        }
    }

    pub fn free(&mut self, block: EntityBlock) { self.free.push(block); }
}

#[derive(Debug)]
pub(crate) struct EntityBlock {
    start: u32,
    len: usize,
    generations: Vec<u16>,
    free: Vec<u32>,
    locations: Vec<Option<EntityLocation>>,
}

impl EntityBlock {
    pub fn new(start: u32, len: usize) -> EntityBlock {
        EntityBlock {
            start,
            len,
            generations: Vec::with_capacity(len),
            free: Vec::new(),
            locations: vec![None; len],
        }
    }

    fn index(&self, number: u32) -> usize { (number - self.start) as usize }

    pub fn in_range(&self, number: u32) -> bool {
        number >= self.start && number < (self.start + self.len as u32)
    }

    pub fn is_alive(&self, entity: Entity) -> Option<bool> {
        if entity.number() >= self.start {
            let i = self.index(entity.number());
            self.generations.get(i).map(|g| *g == entity.generation())
        } else {
            None
        }
    }

    /// The currently live handle for a bare entity number.
    pub fn resolve(&self, number: u32) -> Option<Entity> {
        if number < self.start {
            return None;
        }
        let i = self.index(number);
        self.generations
            .get(i)
            .map(|g| Id::new(number as u64).with_generation(*g))
    }

    pub fn allocate(&mut self) -> Option<Entity> {
        if let Some(number) = self.free.pop() {
            let i = self.index(number);
            Some(Id::new(number as u64).with_generation(self.generations[i]))
        } else if self.generations.len() < self.len {
            let number = self.start + self.generations.len() as u32;
            self.generations.push(1);
            Some(Id::new(number as u64).with_generation(1))
        } else {
            None
        }
    }

    pub fn free(&mut self, entity: Entity) -> Option<Option<EntityLocation>> {
        if let Some(true) = self.is_alive(entity) {
            let i = self.index(entity.number());
            self.generations[i] = self.generations[i].wrapping_add(1);
            self.free.push(entity.number());
            Some(self.locations[i].take())
        } else {
            None
        }
    }

    pub fn set_location(&mut self, number: u32, location: Option<EntityLocation>) {
        assert!(number >= self.start);
        let index = (number - self.start) as usize;
        self.locations[index] = location;
    }

    pub fn get_location(&self, number: u32) -> Option<EntityLocation> {
        if number < self.start {
            return None;
        }
        self.locations.get((number - self.start) as usize).copied().flatten()
    }
}

/// Manages allocation and recycling of entity ids within a world.
///
/// Ids are handed out in blocks from a shared [`BlockAllocator`]; a
/// generation counter embedded in the id invalidates stale handles when an
/// entity number is recycled.
#[derive(Debug, Clone)]
pub struct EntityAllocator {
    allocator: Arc<Mutex<BlockAllocator>>,
    blocks: Arc<RwLock<Vec<EntityBlock>>>,
}

impl EntityAllocator {
    pub(crate) fn new(allocator: Arc<Mutex<BlockAllocator>>) -> Self {
        EntityAllocator {
            allocator,
            blocks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Determines if the given entity handle is live.
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.blocks
            .read()
            .iter()
            .filter_map(|b| b.is_alive(entity))
            .next()
            .unwrap_or(false)
    }

    /// Resolves a bare entity number to its live handle, as stored in pair
    /// ids which drop generations.
    pub fn resolve(&self, number: u32) -> Option<Entity> {
        self.blocks.read().iter().filter_map(|b| b.resolve(number)).next()
    }

    /// Allocates a new unused entity id.
    pub fn allocate(&self) -> Entity {
        let mut blocks = self.blocks.write();

        if let Some(entity) = blocks.iter_mut().rev().filter_map(|b| b.allocate()).next() {
            entity
        } else {
            let mut block = self.allocator.lock().allocate();
            let entity = block.allocate().unwrap();
            blocks.push(block);
            entity
        }
    }

    /// Frees the entity, bumping its generation. Returns the location it
    /// occupied, if it was alive.
    pub(crate) fn free(&self, entity: Entity) -> Option<Option<EntityLocation>> {
        self.blocks.write().iter_mut().find_map(|b| b.free(entity))
    }

    pub(crate) fn set_location(&self, number: u32, location: Option<EntityLocation>) {
        self.blocks
            .write()
            .iter_mut()
            .rev()
            .find(|b| b.in_range(number))
            .expect("entity number not allocated")
            .set_location(number, location);
    }

    pub(crate) fn get_location(&self, number: u32) -> Option<EntityLocation> {
        self.blocks
            .read()
            .iter()
            .find(|b| b.in_range(number))
            .and_then(|b| b.get_location(number))
    }
}

impl Drop for EntityAllocator {
    fn drop(&mut self) {
        for block in self.blocks.write().drain(..) {
            self.allocator.lock().free(block);
        }
    }
}
