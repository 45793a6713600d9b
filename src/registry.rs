//! The component cache: maps component ids to their type descriptors.
//!
//! Component identity is runtime data. Registering a Rust type allocates an
//! entity id for it and records a [ComponentDesc] holding the type's size,
//! alignment and lifecycle function pointers. All value moves inside chunks
//! are raw byte copies; construction, cloning, dropping and comparison
//! dispatch through the descriptor.

use std::any::TypeId;

use fnv::FnvHashMap;

use crate::entity::{Entity, EntityKind};

/// Marker trait for types usable as component values.
pub trait Component: Clone + Default + Send + Sync + 'static {}
impl<T: Clone + Default + Send + Sync + 'static> Component for T {}

/// Type metadata for one registered component. Immutable after
/// registration.
#[derive(Clone)]
pub struct ComponentDesc {
    entity: Entity,
    name: &'static str,
    size: u32,
    align: u32,
    kind: EntityKind,
    default_fn: Option<unsafe fn(*mut u8)>,
    drop_fn: Option<unsafe fn(*mut u8)>,
    copy_fn: Option<unsafe fn(*mut u8, *const u8)>,
    cmp_fn: Option<unsafe fn(*const u8, *const u8) -> bool>,
}

unsafe fn default_impl<T: Default>(dst: *mut u8) {
    std::ptr::write(dst.cast::<T>(), T::default());
}

unsafe fn drop_impl<T>(value: *mut u8) {
    std::ptr::drop_in_place(value.cast::<T>());
}

unsafe fn copy_impl<T: Clone>(dst: *mut u8, src: *const u8) {
    std::ptr::write(dst.cast::<T>(), (*src.cast::<T>()).clone());
}

unsafe fn cmp_impl<T: PartialEq>(a: *const u8, b: *const u8) -> bool {
    *a.cast::<T>() == *b.cast::<T>()
}

impl ComponentDesc {
    /// Builds the descriptor of component type `T`.
    pub fn of<T: Component>(entity: Entity, kind: EntityKind) -> Self {
        let size = std::mem::size_of::<T>();
        assert!(std::mem::align_of::<T>().is_power_of_two());
        ComponentDesc {
            entity,
            name: std::any::type_name::<T>(),
            size: size as u32,
            align: std::mem::align_of::<T>() as u32,
            kind,
            default_fn: (size > 0).then(|| default_impl::<T> as unsafe fn(*mut u8)),
            drop_fn: if std::mem::needs_drop::<T>() {
                Some(drop_impl::<T>)
            } else {
                None
            },
            copy_fn: (size > 0).then(|| copy_impl::<T> as unsafe fn(*mut u8, *const u8)),
            cmp_fn: None,
        }
    }

    fn with_cmp<T: Component + PartialEq>(mut self) -> Self {
        self.cmp_fn = Some(cmp_impl::<T>);
        self
    }

    /// The component's own entity id.
    pub fn entity(&self) -> Entity { self.entity }

    /// The component's symbolic name.
    pub fn name(&self) -> &'static str { self.name }

    pub fn size(&self) -> u32 { self.size }

    pub fn align(&self) -> u32 { self.align }

    pub fn kind(&self) -> EntityKind { self.kind }

    /// Zero-sized components carry no column storage.
    pub fn is_tag(&self) -> bool { self.size == 0 }

    /// Default-constructs a value in place.
    ///
    /// # Safety
    /// `dst` must be valid, aligned and uninitialized.
    pub(crate) unsafe fn construct(&self, dst: *mut u8) {
        if let Some(f) = self.default_fn {
            f(dst);
        }
    }

    /// Drops the value in place.
    ///
    /// # Safety
    /// `value` must point at an initialized value of this type that is not
    /// accessed again before re-initialization.
    pub(crate) unsafe fn drop_in_place(&self, value: *mut u8) {
        if let Some(f) = self.drop_fn {
            f(value);
        }
    }

    /// Clone-constructs `src` into uninitialized `dst`.
    ///
    /// # Safety
    /// Both pointers must be valid and aligned; `dst` uninitialized.
    pub(crate) unsafe fn copy(&self, dst: *mut u8, src: *const u8) {
        if let Some(f) = self.copy_fn {
            f(dst, src);
        }
    }

    /// Compares two values. Only available on unique components.
    ///
    /// # Safety
    /// Both pointers must refer to initialized values of this type.
    pub(crate) unsafe fn compare(&self, a: *const u8, b: *const u8) -> bool {
        match self.cmp_fn {
            Some(f) => f(a, b),
            None => true,
        }
    }
}

impl std::fmt::Debug for ComponentDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentDesc")
            .field("entity", &self.entity)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("align", &self.align)
            .field("kind", &self.kind)
            .finish()
    }
}

/// World-owned registry of component descriptors.
#[derive(Default)]
pub struct ComponentRegistry {
    by_type: FnvHashMap<TypeId, Entity>,
    by_id: FnvHashMap<u32, ComponentDesc>,
    by_name: FnvHashMap<&'static str, Entity>,
}

impl ComponentRegistry {
    pub fn new() -> Self { Self::default() }

    /// Returns the id previously assigned to `T`, if any.
    pub fn lookup<T: Component>(&self) -> Option<Entity> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Records the descriptor of `T` under a freshly allocated id. The
    /// caller (the world) owns id allocation.
    pub(crate) fn insert<T: Component>(&mut self, entity: Entity, kind: EntityKind) -> Entity {
        let previous = self.by_type.insert(TypeId::of::<T>(), entity);
        assert!(previous.is_none(), "component type registered twice");
        let desc = ComponentDesc::of::<T>(entity, kind);
        self.by_name.insert(desc.name, entity);
        self.by_id.insert(entity.id(), desc);
        entity
    }

    pub(crate) fn insert_unique<T: Component + PartialEq>(&mut self, entity: Entity) -> Entity {
        let previous = self.by_type.insert(TypeId::of::<T>(), entity);
        assert!(previous.is_none(), "component type registered twice");
        let desc = ComponentDesc::of::<T>(entity, EntityKind::Unique).with_cmp::<T>();
        self.by_name.insert(desc.name, entity);
        self.by_id.insert(entity.id(), desc);
        entity
    }

    /// Registers a descriptor built by the caller around its own stable
    /// token, for embeddings whose type identity is not a Rust type.
    pub fn insert_raw(&mut self, desc: ComponentDesc) -> Entity {
        let entity = desc.entity;
        self.by_name.insert(desc.name, entity);
        self.by_id.insert(entity.id(), desc);
        entity
    }

    /// Descriptor lookup by component id. Panics on an unknown id.
    pub fn get(&self, key: Entity) -> &ComponentDesc {
        self.find(key)
            .unwrap_or_else(|| panic!("unknown component id {key}"))
    }

    pub fn find(&self, key: Entity) -> Option<&ComponentDesc> {
        debug_assert!(!key.is_pair(), "pairs resolve through storage_desc");
        self.by_id.get(&key.id())
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ComponentDesc> {
        self.by_name.get(name).and_then(|e| self.by_id.get(&e.id()))
    }

    /// Resolves the descriptor that provides *storage* for a key. For a
    /// pair the relation's descriptor wins if it has a size, then the
    /// target's; a pair of plain entities stores nothing (tag).
    pub(crate) fn storage_desc(&self, key: Entity) -> Option<&ComponentDesc> {
        if !key.is_pair() {
            return self.by_id.get(&key.id());
        }
        let relation = self.by_id.get(&key.id());
        let target = self.by_id.get(&key.gen());
        match (relation, target) {
            (Some(rel), _) if rel.size > 0 => Some(rel),
            (_, Some(tgt)) if tgt.size > 0 => Some(tgt),
            _ => None,
        }
    }

    pub fn len(&self) -> usize { self.by_id.len() }

    pub fn is_empty(&self) -> bool { self.by_id.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default, Debug, PartialEq)]
    struct Pos(f32, f32, f32);
    #[derive(Clone, Default, Debug, PartialEq)]
    struct Tagged;

    #[test]
    fn descriptor_reflects_type() {
        let desc = ComponentDesc::of::<Pos>(Entity::new(1, 0), EntityKind::Generic);
        assert_eq!(desc.size(), 12);
        assert_eq!(desc.align(), 4);
        assert!(!desc.is_tag());

        let tag = ComponentDesc::of::<Tagged>(Entity::new(2, 0), EntityKind::Generic);
        assert!(tag.is_tag());
    }

    #[test]
    fn construct_and_drop_round_trip() {
        let desc = ComponentDesc::of::<String>(Entity::new(1, 0), EntityKind::Generic);
        let mut slot = std::mem::MaybeUninit::<String>::uninit();
        unsafe {
            desc.construct(slot.as_mut_ptr().cast());
            assert_eq!(&*slot.as_ptr(), "");
            desc.drop_in_place(slot.as_mut_ptr().cast());
        }
    }

    #[test]
    fn pair_storage_prefers_sized_relation() {
        let mut registry = ComponentRegistry::new();
        registry.insert::<Pos>(Entity::new(1, 0), EntityKind::Generic);
        registry.insert::<Tagged>(Entity::new(2, 0), EntityKind::Generic);

        let pos = Entity::new(1, 0);
        let tag = Entity::new(2, 0);
        let stored = registry.storage_desc(Entity::pair(pos, tag)).unwrap();
        assert_eq!(stored.name(), std::any::type_name::<Pos>());

        let stored = registry.storage_desc(Entity::pair(tag, pos)).unwrap();
        assert_eq!(stored.name(), std::any::type_name::<Pos>());

        assert!(registry
            .storage_desc(Entity::pair(tag, tag))
            .is_none());
    }
}
