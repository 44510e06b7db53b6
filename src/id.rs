use std::cmp::Ordering;
use std::fmt;

/// Number of bits reserved for the entity number.
const ENTITY_BITS: u32 = 32;
/// Role flags occupy the top byte of an id.
const ROLE_MASK: u64 = 0xFF << 56;
/// Strips role flags, leaving the component part of an id.
const COMPONENT_MASK: u64 = !ROLE_MASK;
/// Generation lives in the 16 bits above the entity number. Pairs do not
/// store generations; the relation occupies those bits instead.
const GENERATION_MASK: u64 = 0xFFFF << 32;

const LO_MASK: u64 = (1 << ENTITY_BITS) - 1;

/// Ids below this value get dense edge storage in the table graph.
pub const HI_COMPONENT_ID: u64 = 256;

/// A role flag qualifying how an id participates in a table's id list.
///
/// The numeric discriminants define the canonical sort priority: role-flagged
/// ids order after role-less ids, and the constraint markers (`Not`, `Or`,
/// `Xor`) order after everything else so they land in the tail region of a
/// sorted id list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Role {
    /// Per-row presence tracked in a bitset column.
    Disabled = 0xF1,
    /// Component is copied to instances rather than shared from a base.
    Owned = 0xF2,
    /// Per-row exclusive-enum column.
    Switch = 0xF3,
    /// A case value of a switch column.
    Case = 0xF4,
    /// A relation/object pair packed into one id.
    Pair = 0xFA,
    /// Type constraint: members must be absent.
    Not = 0xFB,
    /// Type constraint: at least one member must be present.
    Or = 0xFC,
    /// Type constraint: exactly one member must be present.
    Xor = 0xFD,
}

impl Role {
    #[inline]
    pub(crate) fn bits(self) -> u64 { (self as u64) << 56 }
}

/// A 64-bit identifier: an entity handle, a component id, or a role-flagged
/// combination of either.
///
/// The low 32 bits hold the entity number, the next 16 the generation, and
/// the top byte the role flags. A [`Role::Pair`] id packs a relation into the
/// high half and an object into the low half; generations are not stored in
/// pairs.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Id(u64);

/// Entities are ids; the alias marks places where an id is used as a live
/// handle rather than a type element.
pub type Entity = Id;

impl Id {
    pub const NULL: Id = Id(0);

    #[inline]
    pub const fn new(raw: u64) -> Self { Id(raw) }

    #[inline]
    pub const fn raw(self) -> u64 { self.0 }

    #[inline]
    pub fn is_null(self) -> bool { self.0 == 0 }

    /// Packs a relation and an object into a single pair id.
    #[inline]
    pub fn pair(relation: Id, object: Id) -> Id {
        Id(Role::Pair.bits() | ((relation.number() as u64) << ENTITY_BITS) | object.number() as u64)
    }

    /// The relation half of a pair, without generation.
    #[inline]
    pub fn relation(self) -> Id { Id((self.0 & COMPONENT_MASK) >> ENTITY_BITS) }

    /// The object half of a pair, without generation.
    #[inline]
    pub fn object(self) -> Id { Id(self.0 & LO_MASK) }

    #[inline]
    pub fn is_pair(self) -> bool { self.has_role(Role::Pair) }

    /// The role flag carried by this id, if any.
    #[inline]
    pub fn role(self) -> Option<Role> {
        match (self.0 >> 56) as u8 {
            0 => None,
            0xF1 => Some(Role::Disabled),
            0xF2 => Some(Role::Owned),
            0xF3 => Some(Role::Switch),
            0xF4 => Some(Role::Case),
            0xFA => Some(Role::Pair),
            0xFB => Some(Role::Not),
            0xFC => Some(Role::Or),
            0xFD => Some(Role::Xor),
            _ => None,
        }
    }

    #[inline]
    pub fn has_role(self, role: Role) -> bool { self.0 & ROLE_MASK == role.bits() }

    #[inline]
    pub fn has_any_role(self) -> bool { self.0 & ROLE_MASK != 0 }

    /// Attaches a role flag to this id.
    #[inline]
    pub fn with_role(self, role: Role) -> Id { Id(role.bits() | (self.0 & COMPONENT_MASK)) }

    /// This id with role flags stripped.
    #[inline]
    pub fn component(self) -> Id { Id(self.0 & COMPONENT_MASK) }

    /// True when this id is a pair whose relation half equals `relation`.
    #[inline]
    pub fn has_relation(self, relation: Id) -> bool {
        self.is_pair() && self.relation().number() == relation.number()
    }

    /// The entity number without generation or role flags.
    #[inline]
    pub fn number(self) -> u32 { (self.0 & LO_MASK) as u32 }

    #[inline]
    pub fn generation(self) -> u16 { ((self.0 & GENERATION_MASK) >> ENTITY_BITS) as u16 }

    #[inline]
    pub(crate) fn with_generation(self, generation: u16) -> Id {
        Id((self.0 & !GENERATION_MASK) | ((generation as u64) << ENTITY_BITS))
    }

    /// True when this id contains a wildcard, either plain or in one half of
    /// a pair.
    pub fn is_wildcard(self) -> bool {
        if self.is_pair() {
            let w = WILDCARD.number();
            self.relation().number() == w || self.object().number() == w
        } else {
            self == WILDCARD
        }
    }

    /// Whether this (possibly wildcard) id pattern matches a concrete id.
    ///
    /// A wildcard in either half of a pair matches any value in that half;
    /// a plain `WILDCARD` matches any non-pair id.
    pub fn matches(self, other: Id) -> bool {
        if self == other {
            return true;
        }
        if self.is_pair() != other.is_pair() {
            return false;
        }
        if self.is_pair() {
            let w = WILDCARD.number();
            let rel_ok =
                self.relation().number() == w || self.relation().number() == other.relation().number();
            let obj_ok =
                self.object().number() == w || self.object().number() == other.object().number();
            rel_ok && obj_ok
        } else {
            self == WILDCARD
        }
    }

    /// Canonical id order used by tables: ascending by raw value, with
    /// role-flagged ids after role-less ids in role-priority order.
    #[inline]
    pub fn compare(self, other: Id) -> Ordering { self.0.cmp(&other.0) }
}

impl PartialOrd for Id {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.compare(*other)) }
}

impl Ord for Id {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering { self.compare(*other) }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_pair() {
            write!(f, "({},{})", self.relation().number(), self.object().number())
        } else if let Some(role) = self.role() {
            write!(f, "{:?}|{}", role, self.number())
        } else if self.generation() != 0 {
            write!(f, "{}#{}", self.number(), self.generation())
        } else {
            write!(f, "{}", self.number())
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

/// Placeholder subject meaning "the entity being matched".
pub const THIS: Id = Id::new(1);
/// Matches any id in the position it appears.
pub const WILDCARD: Id = Id::new(2);
/// Relation marking an entity as an instance of a base entity.
pub const IS_A: Id = Id::new(3);
/// Relation marking an entity as a child of a parent entity.
pub const CHILD_OF: Id = Id::new(4);
/// Tag excluding an entity from queries unless explicitly matched.
pub const PREFAB: Id = Id::new(5);
/// Tag disabling an entity.
pub const DISABLED: Id = Id::new(6);
/// Tag marking module scopes.
pub const MODULE: Id = Id::new(7);
/// Event: an id was added to an entity.
pub const ON_ADD: Id = Id::new(8);
/// Event: an id was removed from an entity.
pub const ON_REMOVE: Id = Id::new(9);
/// Meta event: the first trigger for an id was registered.
pub const ON_CREATE_TRIGGER: Id = Id::new(10);

/// Highest id reserved for builtins.
pub(crate) const LAST_BUILTIN: Id = Id::new(31);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_roundtrip() {
        let rel = Id::new(40);
        let obj = Id::new(900);
        let pair = Id::pair(rel, obj);

        assert!(pair.is_pair());
        assert_eq!(pair.relation().number(), 40);
        assert_eq!(pair.object().number(), 900);
    }

    #[test]
    fn pair_strips_generation() {
        let rel = Id::new(40).with_generation(3);
        let obj = Id::new(900).with_generation(7);
        let pair = Id::pair(rel, obj);

        assert_eq!(pair.relation().generation(), 0);
        assert_eq!(pair.object().generation(), 0);
    }

    #[test]
    fn role_attach_strip() {
        let id = Id::new(12).with_role(Role::Switch);
        assert!(id.has_role(Role::Switch));
        assert_eq!(id.component(), Id::new(12));
        assert_eq!(id.role(), Some(Role::Switch));
    }

    #[test]
    fn ordering_puts_markers_last() {
        let mut ids = vec![
            Id::new(50).with_role(Role::Xor),
            Id::pair(CHILD_OF, Id::new(9)),
            Id::new(700),
            Id::new(3),
            Id::new(20).with_role(Role::Switch),
        ];
        ids.sort();

        assert_eq!(ids[0], Id::new(3));
        assert_eq!(ids[1], Id::new(700));
        assert!(ids[2].has_role(Role::Switch));
        assert!(ids[3].is_pair());
        assert!(ids[4].has_role(Role::Xor));
    }

    #[test]
    fn compare_is_antisymmetric() {
        let a = Id::new(5);
        let b = Id::pair(IS_A, Id::new(5));
        assert_eq!(a.compare(b), b.compare(a).reverse());
    }

    #[test]
    fn wildcard_matches_pairs() {
        let eats = Id::new(100);
        let apples = Id::new(101);
        let likes = Id::new(102);

        let pattern = Id::pair(eats, WILDCARD);
        assert!(pattern.matches(Id::pair(eats, apples)));
        assert!(!pattern.matches(Id::pair(likes, apples)));
        assert!(Id::pair(WILDCARD, apples).matches(Id::pair(likes, apples)));
        assert!(Id::pair(WILDCARD, WILDCARD).matches(Id::pair(likes, apples)));
        assert!(!WILDCARD.matches(Id::pair(likes, apples)));
        assert!(WILDCARD.matches(eats));
    }
}
