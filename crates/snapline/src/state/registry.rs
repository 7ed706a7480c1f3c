use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::TypeConfig;
use crate::error::ConfigError;
use crate::net::MAX_BLOCK_SIZE;

use super::layout::{FieldDecl, OffsetTable};

/// Dense identifier of a registered networked type; doubles as its pool id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u16);

impl TypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Implemented by the handle structs the [`networked!`](crate::networked)
/// macro generates: a list of declared fields plus a way to bind typed
/// offsets out of the built table.
pub trait Networked: Sized {
    const TYPE_NAME: &'static str;

    fn declare() -> Vec<FieldDecl>;

    fn bind(table: &OffsetTable) -> Result<Self, ConfigError>;
}

#[derive(Debug, Clone)]
pub struct RegisteredType {
    pub id: TypeId,
    pub table: OffsetTable,
    pub config: TypeConfig,
}

/// All networked types known to one engine. Built once at startup and then
/// shared read-only between worlds.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: Vec<RegisteredType>,
    by_name: HashMap<String, TypeId>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredType> {
        self.types.iter()
    }

    pub fn get(&self, id: TypeId) -> Option<&RegisteredType> {
        self.types.get(id.index())
    }

    pub fn id_of(&self, type_name: &str) -> Option<TypeId> {
        self.by_name.get(type_name).copied()
    }

    pub fn table(&self, id: TypeId) -> Option<&OffsetTable> {
        self.get(id).map(|t| &t.table)
    }

    pub fn get_offset(&self, type_name: &str, field: &str) -> Option<(usize, usize)> {
        let id = self.id_of(type_name)?;
        self.table(id)?.offset(field)
    }

    pub fn block_size(&self, type_name: &str) -> Option<usize> {
        let id = self.id_of(type_name)?;
        self.table(id).map(OffsetTable::block_size)
    }

    pub fn bind<T: Networked>(&self) -> Result<T, ConfigError> {
        let id = self
            .id_of(T::TYPE_NAME)
            .ok_or_else(|| ConfigError::UnknownType(T::TYPE_NAME.to_string()))?;
        let table = self
            .table(id)
            .ok_or_else(|| ConfigError::UnknownType(T::TYPE_NAME.to_string()))?;
        T::bind(table)
    }

    /// Sum of all pool capacities, which sizes the entity meta table.
    pub fn total_capacity(&self) -> usize {
        self.types.iter().map(|t| t.config.max_objects as usize).sum()
    }
}

#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    registry: TypeRegistry,
}

impl TypeRegistryBuilder {
    pub fn register<T: Networked>(self, config: TypeConfig) -> Result<Self, ConfigError> {
        let decls = T::declare();
        let builder = self.register_decls(T::TYPE_NAME, &decls, config)?;
        // Catch handle/declaration drift at startup, not on first access.
        builder.registry.bind::<T>()?;
        Ok(builder)
    }

    pub fn register_decls(
        mut self,
        type_name: &str,
        decls: &[FieldDecl],
        config: TypeConfig,
    ) -> Result<Self, ConfigError> {
        if self.registry.by_name.contains_key(type_name) {
            return Err(ConfigError::DuplicateType(type_name.to_string()));
        }
        if config.max_objects == 0 {
            return Err(ConfigError::ZeroPoolCapacity {
                type_name: type_name.to_string(),
            });
        }
        if self.registry.types.len() >= u16::MAX as usize {
            return Err(ConfigError::TooManyTypes {
                max: u16::MAX as usize,
            });
        }

        let table = OffsetTable::from_decls(type_name, decls)?;
        if table.block_size() > MAX_BLOCK_SIZE {
            return Err(ConfigError::BlockTooLarge {
                type_name: type_name.to_string(),
                size: table.block_size(),
                max: MAX_BLOCK_SIZE,
            });
        }
        let id = TypeId(self.registry.types.len() as u16);
        log::debug!(
            "registered networked type {} as {:?} ({} bytes, {} slots)",
            type_name,
            id,
            table.block_size(),
            config.max_objects
        );
        self.registry.types.push(RegisteredType { id, table, config });
        self.registry.by_name.insert(type_name.to_string(), id);
        Ok(self)
    }

    pub fn build(self) -> Arc<TypeRegistry> {
        Arc::new(self.registry)
    }
}

/// Declares a networked type as a handle struct of typed field offsets.
///
/// ```
/// use glam::Vec3;
/// use snapline::networked;
///
/// networked! {
///     pub struct Crate {
///         position: Vec3,
///         durability: i32,
///     }
/// }
/// ```
///
/// Every member type must be a [`FieldValue`](crate::state::FieldValue);
/// anything else fails to compile.
#[macro_export]
macro_rules! networked {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($field:ident : $ty:ty),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis struct $name {
            $(pub $field: $crate::state::Field<$ty>,)*
        }

        impl $crate::state::Networked for $name {
            const TYPE_NAME: &'static str = stringify!($name);

            fn declare() -> Vec<$crate::state::FieldDecl> {
                vec![$($crate::state::FieldDecl::property(stringify!($field), stringify!($ty)),)*]
            }

            fn bind(
                table: &$crate::state::OffsetTable,
            ) -> Result<Self, $crate::ConfigError> {
                Ok(Self {
                    $($field: table.field::<$ty>(stringify!($field))?,)*
                })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use glam::{Quat, Vec3};

    use super::*;

    crate::networked! {
        struct Lander {
            position: Vec3,
            rotation: Quat,
            fuel: f32,
        }
    }

    #[test]
    fn macro_binds_offsets() {
        let registry = TypeRegistry::builder()
            .register::<Lander>(TypeConfig::with_capacity(4))
            .unwrap()
            .build();
        let lander = registry.bind::<Lander>().unwrap();

        assert_eq!(lander.position.offset(), 0);
        assert_eq!(lander.rotation.offset(), 12);
        assert_eq!(lander.fuel.offset(), 28);
        assert_eq!(registry.block_size("Lander"), Some(32));
        assert_eq!(registry.get_offset("Lander", "fuel"), Some((28, 4)));
        assert_eq!(registry.total_capacity(), 4);
    }

    #[test]
    fn rejects_duplicate_and_empty_pools() {
        let err = TypeRegistry::builder()
            .register::<Lander>(TypeConfig::with_capacity(1))
            .unwrap()
            .register::<Lander>(TypeConfig::with_capacity(1))
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateType("Lander".into()));

        let err = TypeRegistry::builder()
            .register::<Lander>(TypeConfig::with_capacity(0))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroPoolCapacity { .. }));
    }

    #[test]
    fn declared_contract_with_bad_type_fails_registration() {
        let decls = vec![
            FieldDecl::property("position", "Vec3"),
            FieldDecl::property("name", "String"),
        ];
        let err = TypeRegistry::builder()
            .register_decls("Sign", &decls, TypeConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFieldType { .. }));
    }

    #[test]
    fn block_too_large_for_the_wire_fails_registration() {
        let decls = |count: usize| -> Vec<FieldDecl> {
            (0..count)
                .map(|i| FieldDecl::property(format!("v{i}"), "Vec4"))
                .collect()
        };

        let err = TypeRegistry::builder()
            .register_decls("Slab", &decls(4100), TypeConfig::default())
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::BlockTooLarge {
                type_name: "Slab".into(),
                size: 4100 * 16,
                max: MAX_BLOCK_SIZE
            }
        );

        let registry = TypeRegistry::builder()
            .register_decls("Slab", &decls(4095), TypeConfig::default())
            .unwrap()
            .build();
        assert_eq!(registry.block_size("Slab"), Some(4095 * 16));
    }
}
