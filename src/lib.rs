//! Archetype-based entity component system storage and query engine.
//!
//! Entities are grouped by their exact set of attached ids into *tables*
//! (archetypes), deduplicated by sorted id list and connected by add/remove
//! edges so component mutations are amortised O(1) graph hops. *Queries*
//! keep persistent match-caches over the table graph, with active/empty
//! partitions, grouping, ordering and paged iteration. *Triggers* fan
//! structural events out per event and per id, including wildcard pair
//! matching.
//!
//! # Example
//!
//! ```
//! use std::convert::TryInto;
//! use trellis_ecs::prelude::*;
//!
//! let mut world = World::new();
//! let position = Id::new(40);
//! world.register_component(position, 8);
//!
//! let e = world.entity_new();
//! world.set(e, position, &1.5f64.to_le_bytes()).unwrap();
//!
//! let query = world
//!     .query_init(QueryDesc {
//!         terms: vec![Term::new(position)],
//!         ..QueryDesc::default()
//!     })
//!     .unwrap();
//!
//! let mut it = world.query_iter(query);
//! while it.next() {
//!     for (i, entity) in it.entities().iter().enumerate() {
//!         let bytes = &it.column(0).unwrap()[i * 8..(i + 1) * 8];
//!         println!("{}: {}", entity, f64::from_le_bytes(bytes.try_into().unwrap()));
//!     }
//! }
//! ```

pub mod bitset;
pub mod entity;
pub mod event;
pub mod filter;
pub mod graph;
pub mod id;
pub mod index;
pub mod iter;
pub mod query;
pub mod switch;
pub mod table;
pub mod trigger;
pub mod world;

pub use crate::entity::EntityAllocator;
pub use crate::event::WorldEvent;
pub use crate::filter::{CachedType, Filter, FilterError, InOut, Oper, SetMask, Term};
pub use crate::id::{Entity, Id, Role};
pub use crate::index::{QueryId, TableId, TriggerId};
pub use crate::iter::QueryIter;
pub use crate::query::{
    rank_by_depth, GroupRankAction, OrderByAction, Query, QueryDesc, QueryEvent, QueryFlags,
    QueryInitError, TableSlot,
};
pub use crate::table::{ComponentRegistry, Table, TableFlags};
pub use crate::trigger::{
    Observable, Trigger, TriggerAction, TriggerContext, TriggerDesc, TriggerFrame,
    TriggerInitError,
};
pub use crate::world::{
    EntityMutationError, SystemActivateAction, Universe, World, WorldView,
};

pub mod prelude {
    pub use crate::filter::{InOut, Oper, SetMask, Term};
    pub use crate::id::{Entity, Id, Role, CHILD_OF, DISABLED, IS_A, ON_ADD, ON_REMOVE, PREFAB, WILDCARD};
    pub use crate::query::{QueryDesc, QueryEvent};
    pub use crate::trigger::TriggerDesc;
    pub use crate::world::{Universe, World};
}
