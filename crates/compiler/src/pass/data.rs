//! Pass data is data that results from the operation of some pass that _cannot_
//! be represented in the module that the pass hands on, such as statistics
//! about the rewrites it performed or the diagnostics it raised.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt::Debug,
};

use derivative::Derivative;
use downcast_rs::Downcast;

use crate::pass::{ConcretePass, PassKey};

/// Pass data is output by any given pass.
pub type PassData = Box<dyn PassDataOps>;

/// The operations that we expect one of our pass data objects to have.
///
/// The implementation is designed to be used via dynamic dispatch, and hence
/// can provide the requisite operations however it is able.
///
/// # Recommended Functions
///
/// On the concrete type that implements this trait, it is recommended to
/// implement:
///
/// - A `new(...) -> Self` associated function.
/// - A `new_dyn(...) -> PassData` associated function. This one can usually
///   simply call `Box::new(Self::new(...))`.
///
/// # Self Bounds
///
/// - [`Any`] allows downcasting to the concrete data type.
/// - [`Debug`] to provide representations to aid in debugging.
/// - [`Downcast`] for easy conversions _to_ [`Any`] for downcasting.
///
/// In addition, it is required but not enforced that implementors of this
/// trait also implement [`ConcretePassData`].
pub trait PassDataOps
where
    Self: Any + Debug + Downcast + Send + Sync,
{
}

/// Operations implemented on `dyn PassDataOps` are **only** available on the
/// concrete trait object and hence not equivalent to a blanket implementation
/// of a method for `trait PassDataOps`.
impl dyn PassDataOps {
    /// Checks if the data is an instance of the concrete data `T`.
    pub fn is<T: ConcretePassData>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Views the dynamic data `self` as the concrete data type `T`, returning
    /// `None` if it is not one.
    pub fn view_as<T: ConcretePassData>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Views the dynamic data `self` mutably as the concrete data type `T`,
    /// returning `None` if it is not one.
    pub fn view_as_mut<T: ConcretePassData>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }

    /// Views the dynamic data `self` as the concrete data type `T`.
    ///
    /// # Panics
    ///
    /// If `self` is not `T`.
    pub fn unwrap_as<T: ConcretePassData>(&self) -> &T {
        self.view_as()
            .unwrap_or_else(|| panic!("self was not a {:?}", TypeId::of::<T>()))
    }

    /// Views the dynamic data `self` mutably as the concrete data type `T`.
    ///
    /// # Panics
    ///
    /// If `self` is not `T`.
    pub fn unwrap_as_mut<T: ConcretePassData>(&mut self) -> &mut T {
        self.view_as_mut()
            .unwrap_or_else(|| panic!("self was not a {:?}", TypeId::of::<T>()))
    }
}

/// Provides additional operations that can be called when operating on a
/// concrete instance of the data for a specific pass.
pub trait ConcretePassData
where
    Self: Clone + Debug + PassDataOps,
{
    /// The pass with which the data is associated.
    type Pass: ConcretePass;
}

/// A mapping from pass keys to the associated pass data.
///
/// It will always contain the latest pass data, as there is no need to re-run a
/// pass unless it was invalidated by a subsequent pass.
pub type DynPassDataMap = PassDataMap<PassData>;

/// A mapping from pass keys to the associated pass data.
#[derive(Derivative)]
#[derivative(
    Clone(bound = "T: Clone"),
    Debug(bound = "T: Debug"),
    PartialEq(bound = "T: PartialEq")
)]
pub struct PassDataMap<T> {
    /// The mapping from pass keys to pass data.
    mapping: HashMap<PassKey, T>,
}

impl<T> PassDataMap<T> {
    /// Constructs a new, empty, mapping from pass keys to pass data.
    #[must_use]
    pub fn new() -> Self {
        let mapping = HashMap::new();
        Self { mapping }
    }

    /// Clears all pass data.
    pub fn clear_all(&mut self) {
        self.mapping.clear();
    }

    /// Gets a reference to the last-written data for the pass given by the
    /// provided `key` if it exists, and returns `None` otherwise.
    #[must_use]
    pub fn get_key(&self, key: PassKey) -> Option<&T> {
        self.mapping.get(&key)
    }

    /// Returns `true` if there is data for the pass given by `key`.
    #[must_use]
    pub fn contains_key(&self, key: PassKey) -> bool {
        self.mapping.contains_key(&key)
    }

    /// Writes the provided `data` into the container associating it with the
    /// pass described by `key`, overwriting any existing data for that pass.
    pub fn put_key(&mut self, key: PassKey, data: T) {
        self.mapping.insert(key, data);
    }

    /// Clears the data for the pass given by the provided `key`, if it exists.
    pub fn clear_key(&mut self, key: PassKey) {
        self.mapping.remove(&key);
    }

    /// Gets the number of passes that there is data for.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    /// Returns `true` if there is no pass data.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}

impl PassDataMap<PassData> {
    /// Gets a reference to the last-written data for the pass `P` if it exists,
    /// and returns `None` otherwise.
    ///
    /// The data returned is returned as the concrete type.
    #[must_use]
    pub fn get<P: ConcretePass>(&self) -> Option<&P::Data> {
        self.mapping.get(&P::key())?.view_as::<P::Data>()
    }

    /// Writes the provided `data` into the container associating it with the
    /// pass `P`, overwriting any existing data for that pass.
    pub fn put<P: ConcretePass>(&mut self, data: P::Data) {
        let data = Box::new(data);
        self.mapping.insert(P::key(), data);
    }

    /// Clears the data for the pass `P` if it exists.
    pub fn clear<P: ConcretePass>(&mut self) {
        self.mapping.remove(&P::key());
    }
}

impl<T> Default for PassDataMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use crate::pass::{
        data::DynPassDataMap,
        simplify_affine::{SimplifyAffine, SimplifyAffineData},
        ConcretePass,
    };

    #[test]
    fn data_is_stored_by_pass() {
        let mut map = DynPassDataMap::new();
        assert!(map.get::<SimplifyAffine>().is_none());

        map.put::<SimplifyAffine>(SimplifyAffineData::new(3));
        assert_eq!(map.get::<SimplifyAffine>().map(|d| d.simplified), Some(3));
        assert!(map.contains_key(SimplifyAffine::key()));

        map.clear::<SimplifyAffine>();
        assert!(map.is_empty());
    }
}
